//! Pipeline supervisor tying together capture, inference and dispatch.
//!
//! The supervisor wires the leaky queues between stages, starts one thread
//! per stage plus the watchdog, and turns the stage reports into a single
//! outcome. Shutdown travels through the queues: capture stops reading and
//! closes its queue, inference drains what is left and closes its own, and
//! dispatch drains into the sinks before shutting each one down.
//!
//! - `capture`: source reading and telemetry pairing.
//! - `inference`: detector calls and geolocation.
//! - `dispatch`: per-sink fan-out and failure isolation.
//! - `queue`: the drop-oldest hand-off between stages.
//! - `shutdown`: idempotent cancellation signal.
//! - `watchdog`: stall reporting.
//! - `instrumentation`: tracing, metrics and thread spawning.
//! - `config`: CLI configuration parsing.

use std::{sync::Arc, thread::JoinHandle, time::Duration};

use crossbeam_channel::Sender;
use ml_core::DetectionError;
use thiserror::Error;
use tracing::{error, info, warn};
use video_ingest::SourceError;

use crate::sinks::Sink;

pub mod capture;
pub mod config;
pub mod dispatch;
pub mod inference;
pub mod instrumentation;
pub mod queue;
pub mod shutdown;
mod watchdog;

pub use capture::{CaptureExit, CaptureReport, CaptureState, SourceOpener};
pub use config::{
    ArchiveSettings, CotSettings, DetectorKind, DetectorSettings, DeviceSelection, SinkSettings,
    SourceSettings, VisionCliArgs, VisionConfig,
};
pub use dispatch::{DispatchReport, Dispatcher, SinkStats};
pub use inference::{DetectionPolicy, DetectorFactory, InferenceReport};
pub use shutdown::{ShutdownCause, ShutdownSignal};

use capture::{CaptureStage, TelemetrySlot};
use inference::InferenceStage;
use queue::leaky_queue;
use watchdog::{PipelineHealth, spawn_watchdog};

/// Tuning shared by the three stages.
#[derive(Clone, Debug)]
pub struct PipelineSettings {
    /// Slots in each inter-stage queue.
    pub queue_capacity: usize,
    /// How long a push into a full capture queue waits before evicting.
    pub inference_grace: Duration,
    /// Slots in each sink's mailbox.
    pub sink_mailbox_capacity: usize,
    /// Telemetry age, on the source clock, after which frames carry none.
    pub telemetry_max_age: Option<Duration>,
    /// Frames capture leaves out after each one it forwards.
    pub skip_frames: u32,
    pub detection: DetectionPolicy,
    /// Upper bound on how long a stage blocks before re-checking for work.
    pub poll_interval: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 2,
            inference_grace: Duration::ZERO,
            sink_mailbox_capacity: 2,
            telemetry_max_age: Some(Duration::from_secs(2)),
            skip_frames: 0,
            detection: DetectionPolicy::default(),
            poll_interval: Duration::from_millis(20),
        }
    }
}

/// Pipeline-terminating failures.
#[derive(Debug, Error)]
pub enum PipelineFault {
    #[error("video source failed: {0}")]
    Source(#[source] SourceError),
    #[error("detector failed: {0}")]
    Detection(#[source] DetectionError),
    #[error("{stage} stage failed: {reason}")]
    Stage { stage: &'static str, reason: String },
}

impl PipelineFault {
    fn stage(stage: &'static str, reason: impl ToString) -> Self {
        PipelineFault::Stage {
            stage,
            reason: reason.to_string(),
        }
    }
}

/// Outcome of a run that ended without a fault.
#[derive(Debug)]
pub struct PipelineReport {
    pub cause: Option<ShutdownCause>,
    pub capture: CaptureReport,
    pub inference: InferenceReport,
    pub dispatch: DispatchReport,
}

/// Running pipeline.
pub struct PipelineHandle {
    shutdown: ShutdownSignal,
    capture: JoinHandle<CaptureReport>,
    inference: JoinHandle<InferenceReport>,
    dispatch: JoinHandle<DispatchReport>,
    watchdog: Option<(Sender<()>, JoinHandle<()>)>,
}

/// Starts the three stages and the watchdog.
///
/// `opener` and `factory` run on the capture and inference threads so the
/// source and detector live on the thread that uses them.
pub fn spawn(
    opener: SourceOpener,
    factory: DetectorFactory,
    sinks: Vec<Box<dyn Sink>>,
    settings: PipelineSettings,
    shutdown: ShutdownSignal,
) -> Result<PipelineHandle, PipelineFault> {
    let health = Arc::new(PipelineHealth::new());
    let capacity = settings.queue_capacity.max(1);
    let (capture_tx, capture_rx) = leaky_queue(capacity, settings.inference_grace);
    let (dispatch_tx, dispatch_rx) = leaky_queue(capacity, Duration::ZERO);

    let mut dispatcher = Dispatcher::new(settings.sink_mailbox_capacity);
    for sink in sinks {
        let name = sink.name().to_string();
        dispatcher.register(sink).map_err(|err| {
            shutdown.trigger(ShutdownCause::Requested);
            PipelineFault::stage("dispatch", format!("failed to start sink {name}: {err}"))
        })?;
    }
    let abort = |stage: &'static str, err: std::io::Error| {
        shutdown.trigger(ShutdownCause::Requested);
        PipelineFault::stage(stage, format!("failed to spawn thread: {err}"))
    };

    let dispatch_health = Arc::clone(&health);
    let poll_interval = settings.poll_interval;
    let dispatch = instrumentation::spawn_thread("vision-dispatch", move || {
        dispatch::run_dispatch(dispatcher, dispatch_rx, dispatch_health, poll_interval)
    })
    .map_err(|err| abort("dispatch", err))?;

    let inference_stage = InferenceStage {
        factory,
        input: capture_rx,
        output: dispatch_tx,
        shutdown: shutdown.clone(),
        health: Arc::clone(&health),
        policy: settings.detection,
        poll_interval,
    };
    let inference = instrumentation::spawn_thread("vision-inference", move || inference_stage.run())
        .map_err(|err| abort("inference", err))?;

    let capture_stage = CaptureStage {
        opener,
        output: capture_tx,
        shutdown: shutdown.clone(),
        health: Arc::clone(&health),
        telemetry: TelemetrySlot::new(settings.telemetry_max_age),
        skip_frames: settings.skip_frames,
        poll_interval,
    };
    let capture = instrumentation::spawn_thread("vision-capture", move || capture_stage.run())
        .map_err(|err| abort("capture", err))?;

    let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
    let watchdog = match spawn_watchdog(health, stop_rx) {
        Ok(handle) => Some((stop_tx, handle)),
        Err(err) => {
            warn!("watchdog unavailable: {err}");
            None
        }
    };

    info!(
        queue_capacity = capacity,
        mailbox = settings.sink_mailbox_capacity,
        "pipeline started"
    );
    Ok(PipelineHandle {
        shutdown,
        capture,
        inference,
        dispatch,
        watchdog,
    })
}

/// Runs the pipeline to completion on the calling thread.
pub fn run(
    opener: SourceOpener,
    factory: DetectorFactory,
    sinks: Vec<Box<dyn Sink>>,
    settings: PipelineSettings,
    shutdown: ShutdownSignal,
) -> Result<PipelineReport, PipelineFault> {
    spawn(opener, factory, sinks, settings, shutdown)?.join()
}

impl PipelineHandle {
    pub fn shutdown_signal(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    /// Asks the pipeline to stop. Returns `false` if it was already stopping.
    pub fn request_shutdown(&self) -> bool {
        self.shutdown.trigger(ShutdownCause::Requested)
    }

    /// Waits for every stage to drain and reports the first terminating fault.
    pub fn join(self) -> Result<PipelineReport, PipelineFault> {
        let capture = self.capture.join();
        let inference = self.inference.join();
        let dispatch = self.dispatch.join();
        if let Some((stop, handle)) = self.watchdog {
            let _ = stop.send(());
            if handle.join().is_err() {
                warn!("watchdog thread panicked");
            }
        }

        let capture = capture.map_err(|_| PipelineFault::stage("capture", "thread panicked"))?;
        let inference =
            inference.map_err(|_| PipelineFault::stage("inference", "thread panicked"))?;
        let dispatch = dispatch.map_err(|_| PipelineFault::stage("dispatch", "thread panicked"))?;

        let cause = self.shutdown.cause();
        info!(
            cause = ?cause,
            captured = capture.frames_captured,
            processed = inference.frames_processed,
            dispatched = dispatch.frames_dispatched,
            "pipeline stopped"
        );
        for sink in dispatch.sinks.iter().filter(|s| s.failure.is_some()) {
            warn!(sink = %sink.name, "sink was removed during the run");
        }

        match cause {
            Some(ShutdownCause::SourceFault) => {
                if let CaptureExit::Fault(err) = capture.exit {
                    error!("pipeline terminated: source failed: {err}");
                    return Err(PipelineFault::Source(err));
                }
                Err(PipelineFault::stage("capture", "source fault without a cause"))
            }
            Some(ShutdownCause::DetectionFault) => {
                let err = inference
                    .fault
                    .unwrap_or_else(|| DetectionError::Fatal("detector stopped".into()));
                error!("pipeline terminated: detector failed: {err}");
                Err(PipelineFault::Detection(err))
            }
            _ => Ok(PipelineReport {
                cause,
                capture,
                inference,
                dispatch,
            }),
        }
    }
}
