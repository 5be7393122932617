use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use geolocate::GeoCoordinate;
use klv::TelemetryRecord;
use ml_core::{BoundingBox, ImageView};
use video_ingest::Frame;

/// One captured frame and the telemetry in effect when it was read.
///
/// The record is moved from stage to stage; nothing else holds its image.
#[derive(Debug)]
pub struct FrameRecord {
    /// Monotonic per-run index, advanced for every frame read including corrupt ones.
    pub index: u64,
    pub image: Frame,
    pub captured_at: DateTime<Utc>,
    /// `None` when no telemetry has been seen yet or the last packet expired.
    pub telemetry: Option<Arc<TelemetryRecord>>,
}

impl FrameRecord {
    pub fn width(&self) -> u32 {
        self.image.width
    }

    pub fn height(&self) -> u32 {
        self.image.height
    }

    pub fn image_view(&self) -> ImageView<'_> {
        ImageView {
            data: &self.image.data,
            width: self.image.width,
            height: self.image.height,
        }
    }
}

/// Detector output after clipping, thresholding and ground projection.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub class_name: String,
    pub confidence: f32,
    pub track_id: Option<u64>,
    /// Computed once by the inference stage from the frame's own telemetry.
    pub geo: Option<GeoCoordinate>,
}

/// Frame plus its detections, shared read-only between sinks.
#[derive(Debug)]
pub struct EnrichedFrame {
    pub record: FrameRecord,
    pub detections: Vec<Detection>,
    pub inference_latency: Duration,
}

impl EnrichedFrame {
    pub fn index(&self) -> u64 {
        self.record.index
    }

    pub fn telemetry(&self) -> Option<&TelemetryRecord> {
        self.record.telemetry.as_deref()
    }
}
