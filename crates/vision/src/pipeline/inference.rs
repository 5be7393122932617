use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use geolocate::SensorOptics;
use ml_core::{DetectionError, ObjectDetector, RawDetection};
use tracing::{debug, error, info, info_span, warn};

use crate::{
    frame::{Detection, EnrichedFrame, FrameRecord},
    pipeline::{
        queue::{LeakyReceiver, LeakySender, PopTimeoutError},
        shutdown::{ShutdownCause, ShutdownSignal},
        watchdog::{HealthComponent, PipelineHealth},
    },
};

/// Builds the detector on the inference thread.
pub type DetectorFactory =
    Box<dyn FnOnce() -> Result<Box<dyn ObjectDetector>, DetectionError> + Send + 'static>;

#[derive(Debug, Default)]
pub struct InferenceReport {
    pub frames_processed: u64,
    pub frames_dropped: u64,
    pub transient_errors: u64,
    pub fault: Option<DetectionError>,
}

/// What the inference stage keeps from raw detector output.
#[derive(Clone, Debug)]
pub struct DetectionPolicy {
    pub confidence_threshold: f32,
    /// Class names to keep; empty keeps every class.
    pub classes: Vec<String>,
    /// Camera geometry used for geolocation instead of telemetry fields of view.
    pub optics: Option<SensorOptics>,
}

impl Default for DetectionPolicy {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.25,
            classes: Vec::new(),
            optics: None,
        }
    }
}

impl DetectionPolicy {
    fn keeps(&self, det: &RawDetection) -> bool {
        det.confidence >= self.confidence_threshold
            && (self.classes.is_empty() || self.classes.iter().any(|c| *c == det.class_name))
    }
}

pub(crate) struct InferenceStage {
    pub(crate) factory: DetectorFactory,
    pub(crate) input: LeakyReceiver<FrameRecord>,
    pub(crate) output: LeakySender<EnrichedFrame>,
    pub(crate) shutdown: ShutdownSignal,
    pub(crate) health: Arc<PipelineHealth>,
    pub(crate) policy: DetectionPolicy,
    pub(crate) poll_interval: Duration,
}

impl InferenceStage {
    pub(crate) fn run(self) -> InferenceReport {
        let span = info_span!("vision.inference");
        let _enter = span.enter();
        let mut report = InferenceReport::default();

        let mut detector = match (self.factory)() {
            Ok(detector) => detector,
            Err(err) => {
                error!("failed to initialise detector: {err}");
                metrics::counter!("vision_detection_errors_total", "kind" => "init").increment(1);
                self.shutdown.trigger(ShutdownCause::DetectionFault);
                report.fault = Some(DetectionError::Fatal(err.to_string()));
                return report;
            }
        };
        info!(detector = %detector.describe(), "detector ready");

        loop {
            let record = match self.input.pop_timeout(self.poll_interval) {
                Ok(record) => record,
                Err(PopTimeoutError::Timeout) => {
                    // idle is not a stall
                    self.health.beat(HealthComponent::Inference);
                    continue;
                }
                Err(PopTimeoutError::Closed) => break,
            };

            let started = Instant::now();
            let _frame_span =
                tracing::debug_span!("inference.frame", frame = record.index).entered();
            let detections = match detector.infer(record.image_view()) {
                Ok(raw) => enrich(&record, raw, &self.policy),
                Err(DetectionError::Transient(reason)) => {
                    report.transient_errors += 1;
                    metrics::counter!("vision_detection_errors_total", "kind" => "transient")
                        .increment(1);
                    warn!(
                        frame = record.index,
                        "detection failed, forwarding bare frame: {reason}"
                    );
                    Vec::new()
                }
                Err(err) => {
                    metrics::counter!("vision_detection_errors_total", "kind" => "fatal")
                        .increment(1);
                    error!(frame = record.index, "detector failed: {err}");
                    self.shutdown.trigger(ShutdownCause::DetectionFault);
                    report.fault = Some(err);
                    break;
                }
            };

            let enriched = EnrichedFrame {
                record,
                detections,
                inference_latency: started.elapsed(),
            };
            match self.output.push(enriched) {
                Ok(Some(evicted)) => {
                    report.frames_dropped += 1;
                    metrics::counter!("vision_frames_dropped_total", "queue" => "dispatch")
                        .increment(1);
                    debug!(frame = evicted.index(), "dispatch queue full; dropped oldest frame");
                }
                Ok(None) => {}
                Err(_) => {
                    debug!("dispatch queue closed; stopping inference");
                    break;
                }
            }
            report.frames_processed += 1;
            metrics::gauge!("vision_queue_depth", "queue" => "dispatch")
                .set(self.output.len() as f64);
            metrics::histogram!("vision_stage_latency_seconds", "stage" => "inference")
                .record(started.elapsed().as_secs_f64());
            self.health.beat(HealthComponent::Inference);
        }

        info!(
            processed = report.frames_processed,
            dropped = report.frames_dropped,
            transient_errors = report.transient_errors,
            "inference stopped"
        );
        report
    }
}

/// Filters, clips and geolocates raw detector output for `record`.
pub(crate) fn enrich(
    record: &FrameRecord,
    raw: Vec<RawDetection>,
    policy: &DetectionPolicy,
) -> Vec<Detection> {
    let (width, height) = (record.width(), record.height());
    let telemetry = record.telemetry.as_deref();
    raw.into_iter()
        .filter(|det| policy.keeps(det))
        .filter_map(|det| {
            let bbox = det.bbox.clip(width, height)?;
            let (cx, cy) = bbox.center();
            let geo = geolocate::project_with(
                f64::from(cx),
                f64::from(cy),
                width,
                height,
                telemetry,
                policy.optics.as_ref(),
            );
            Some(Detection {
                bbox,
                class_name: det.class_name,
                confidence: det.confidence.clamp(0.0, 1.0),
                track_id: det.track_id,
                geo,
            })
        })
        .collect()
}
