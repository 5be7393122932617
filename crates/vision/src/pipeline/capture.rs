use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::Utc;
use klv::TelemetryRecord;
use tracing::{debug, error, info, info_span, warn};
use video_ingest::{Frame, MediaSource, MetadataPacket, SourceError, SourceEvent};

use crate::{
    frame::FrameRecord,
    pipeline::{
        queue::{LeakySender, QueueClosed},
        shutdown::{ShutdownCause, ShutdownSignal},
        watchdog::{HealthComponent, PipelineHealth},
    },
};

/// Opens the source on the capture thread.
pub type SourceOpener =
    Box<dyn FnOnce() -> Result<Box<dyn MediaSource>, SourceError> + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Connected,
    Streaming,
    Draining,
    Failed,
}

impl CaptureState {
    pub fn can_advance_to(self, next: CaptureState) -> bool {
        use CaptureState::*;
        matches!(
            (self, next),
            (Idle, Connected | Failed)
                | (Connected, Streaming | Draining | Failed)
                | (Streaming, Draining | Failed)
        )
    }
}

#[derive(Debug)]
pub enum CaptureExit {
    /// Stopped by the shutdown signal or because inference went away.
    Shutdown,
    EndOfStream,
    Fault(SourceError),
}

#[derive(Debug)]
pub struct CaptureReport {
    pub final_state: CaptureState,
    pub exit: CaptureExit,
    pub frames_captured: u64,
    pub frames_corrupt: u64,
    pub frames_dropped: u64,
    /// Frames decoded but not forwarded because of frame decimation.
    pub frames_skipped: u64,
    pub telemetry_decoded: u64,
    pub telemetry_rejected: u64,
}

/// The capture thread's private "last seen telemetry" slot.
///
/// A record older than `max_age` on the source clock reads as absent.
#[derive(Debug)]
pub(crate) struct TelemetrySlot {
    latest: Option<(Arc<TelemetryRecord>, i64)>,
    max_age_ms: Option<i64>,
}

impl TelemetrySlot {
    pub(crate) fn new(max_age: Option<Duration>) -> Self {
        Self {
            latest: None,
            max_age_ms: max_age.map(|age| age.as_millis() as i64),
        }
    }

    pub(crate) fn update(&mut self, record: TelemetryRecord, at_ms: i64) {
        self.latest = Some((Arc::new(record), at_ms));
    }

    pub(crate) fn current(&self, frame_ms: i64) -> Option<Arc<TelemetryRecord>> {
        let (record, at_ms) = self.latest.as_ref()?;
        match self.max_age_ms {
            Some(max_age) if frame_ms - at_ms > max_age => None,
            _ => Some(Arc::clone(record)),
        }
    }
}

pub(crate) struct CaptureStage {
    pub(crate) opener: SourceOpener,
    pub(crate) output: LeakySender<FrameRecord>,
    pub(crate) shutdown: ShutdownSignal,
    pub(crate) health: Arc<PipelineHealth>,
    pub(crate) telemetry: TelemetrySlot,
    /// Frames left out after each forwarded one.
    pub(crate) skip_frames: u32,
    pub(crate) poll_interval: Duration,
}

struct CaptureRun {
    state: CaptureState,
    next_index: u64,
    skip_frames: u32,
    frames_captured: u64,
    frames_corrupt: u64,
    frames_dropped: u64,
    frames_skipped: u64,
    telemetry_decoded: u64,
    telemetry_rejected: u64,
}

impl CaptureRun {
    fn advance(&mut self, next: CaptureState) {
        if self.state == next {
            return;
        }
        if !self.state.can_advance_to(next) {
            warn!(from = ?self.state, to = ?next, "ignoring invalid capture transition");
            return;
        }
        debug!(from = ?self.state, to = ?next, "capture state change");
        self.state = next;
    }

    fn finish(self, exit: CaptureExit) -> CaptureReport {
        CaptureReport {
            final_state: self.state,
            exit,
            frames_captured: self.frames_captured,
            frames_corrupt: self.frames_corrupt,
            frames_dropped: self.frames_dropped,
            frames_skipped: self.frames_skipped,
            telemetry_decoded: self.telemetry_decoded,
            telemetry_rejected: self.telemetry_rejected,
        }
    }
}

impl CaptureStage {
    pub(crate) fn run(self) -> CaptureReport {
        let span = info_span!("vision.capture");
        let _enter = span.enter();
        let CaptureStage {
            opener,
            output,
            shutdown,
            health,
            mut telemetry,
            skip_frames,
            poll_interval,
        } = self;

        let mut run = CaptureRun {
            state: CaptureState::Idle,
            next_index: 0,
            skip_frames,
            frames_captured: 0,
            frames_corrupt: 0,
            frames_dropped: 0,
            frames_skipped: 0,
            telemetry_decoded: 0,
            telemetry_rejected: 0,
        };

        let mut source = match opener() {
            Ok(source) => source,
            Err(err) => {
                error!("failed to open source: {err}");
                run.advance(CaptureState::Failed);
                shutdown.trigger(ShutdownCause::SourceFault);
                return run.finish(CaptureExit::Fault(err));
            }
        };
        run.advance(CaptureState::Connected);
        let info = source.info();
        info!(
            uri = %info.uri,
            kind = info.kind.label(),
            width = info.width,
            height = info.height,
            klv = info.has_metadata,
            "source connected"
        );

        let exit = loop {
            if shutdown.is_triggered() {
                break CaptureExit::Shutdown;
            }
            match source.next_event(poll_interval) {
                Ok(None) => {}
                Ok(Some(SourceEvent::Metadata(packet))) => {
                    ingest_metadata(&mut run, &mut telemetry, packet);
                }
                Ok(Some(SourceEvent::Frame(frame))) => {
                    run.advance(CaptureState::Streaming);
                    if forward(&mut run, &telemetry, &output, frame).is_err() {
                        debug!("inference queue closed; stopping capture");
                        break CaptureExit::Shutdown;
                    }
                    health.beat(HealthComponent::Capture);
                }
                Err(err) if err.is_recoverable() => {
                    // the lost frame still consumes an index
                    warn!(frame = run.next_index, "skipping unreadable frame: {err}");
                    run.next_index += 1;
                    run.frames_corrupt += 1;
                }
                Err(SourceError::EndOfStream) => break CaptureExit::EndOfStream,
                Err(err) => break CaptureExit::Fault(err),
            }
        };
        source.close();

        match &exit {
            CaptureExit::Shutdown => run.advance(CaptureState::Draining),
            CaptureExit::EndOfStream => {
                info!(frames = run.frames_captured, "source reached end of stream");
                run.advance(CaptureState::Failed);
                shutdown.trigger(ShutdownCause::EndOfStream);
            }
            CaptureExit::Fault(err) => {
                error!("source failed: {err}");
                run.advance(CaptureState::Failed);
                shutdown.trigger(ShutdownCause::SourceFault);
            }
        }
        info!(
            captured = run.frames_captured,
            dropped = run.frames_dropped,
            skipped = run.frames_skipped,
            corrupt = run.frames_corrupt,
            "capture stopped"
        );
        run.finish(exit)
    }
}

fn ingest_metadata(run: &mut CaptureRun, slot: &mut TelemetrySlot, packet: MetadataPacket) {
    match klv::decode(&packet.data) {
        Ok(record) => {
            run.telemetry_decoded += 1;
            metrics::counter!("vision_telemetry_packets_total", "result" => "ok").increment(1);
            slot.update(record, packet.timestamp_ms);
        }
        Err(err) => {
            // prior telemetry stays in effect
            run.telemetry_rejected += 1;
            metrics::counter!("vision_telemetry_packets_total", "result" => err.kind())
                .increment(1);
            debug!(at_ms = packet.timestamp_ms, "dropping telemetry packet: {err}");
        }
    }
}

fn forward(
    run: &mut CaptureRun,
    slot: &TelemetrySlot,
    output: &LeakySender<FrameRecord>,
    frame: Frame,
) -> Result<(), QueueClosed<FrameRecord>> {
    let started = Instant::now();
    let index = run.next_index;
    run.next_index += 1;
    if index % (u64::from(run.skip_frames) + 1) != 0 {
        run.frames_skipped += 1;
        return Ok(());
    }

    let record = FrameRecord {
        index,
        telemetry: slot.current(frame.timestamp_ms),
        captured_at: Utc::now(),
        image: frame,
    };
    let _span = tracing::debug_span!("capture.frame", frame = index).entered();

    if let Some(evicted) = output.push(record)? {
        run.frames_dropped += 1;
        metrics::counter!("vision_frames_dropped_total", "queue" => "inference").increment(1);
        debug!(frame = evicted.index, "inference queue full; dropped oldest frame");
    }
    run.frames_captured += 1;
    metrics::counter!("vision_frames_captured_total").increment(1);
    metrics::gauge!("vision_queue_depth", "queue" => "inference").set(output.len() as f64);
    metrics::histogram!("vision_stage_latency_seconds", "stage" => "capture")
        .record(started.elapsed().as_secs_f64());
    Ok(())
}
