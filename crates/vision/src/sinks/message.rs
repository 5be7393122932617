//! JSON shapes shared by the metadata-carrying sinks.

use geolocate::GeoCoordinate;
use klv::TelemetryRecord;
use serde::{Deserialize, Serialize};

use crate::frame::{Detection, EnrichedFrame};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionMessage {
    pub class_name: String,
    pub confidence: f32,
    /// `[x, y, width, height]` in pixels.
    pub bbox: [f32; 4],
    pub track_id: Option<u64>,
    pub geo_coordinates: Option<GeoCoordinate>,
}

impl From<&Detection> for DetectionMessage {
    fn from(det: &Detection) -> Self {
        Self {
            class_name: det.class_name.clone(),
            confidence: det.confidence,
            bbox: det.bbox.to_xywh(),
            track_id: det.track_id,
            geo_coordinates: det.geo,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySummary {
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub alt: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pitch: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roll: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hfov: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vfov: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mission_id: Option<String>,
}

impl TelemetrySummary {
    /// Position-only view used by the archive document.
    pub fn position(record: &TelemetryRecord) -> Self {
        Self {
            lat: record.latitude,
            lon: record.longitude,
            alt: record.altitude.reported(),
            ..Self::default()
        }
    }

    pub fn full(record: &TelemetryRecord) -> Self {
        Self {
            heading: record.platform_heading,
            pitch: record.platform_pitch,
            roll: record.platform_roll,
            hfov: record.horizontal_fov,
            vfov: record.vertical_fov,
            mission_id: record.mission_id.clone(),
            ..Self::position(record)
        }
    }
}

/// Per-frame message emitted by the broadcaster, the metadata log and the
/// browser's SSE channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameMessage {
    pub frame: u64,
    /// Capture wall-clock time, RFC 3339.
    pub timestamp: String,
    pub source_time_ms: i64,
    pub width: u32,
    pub height: u32,
    pub inference_ms: f64,
    pub detection_count: usize,
    pub detections: Vec<DetectionMessage>,
    pub telemetry: Option<TelemetrySummary>,
}

impl FrameMessage {
    pub fn from_frame(frame: &EnrichedFrame) -> Self {
        Self {
            frame: frame.index(),
            timestamp: frame.record.captured_at.to_rfc3339(),
            source_time_ms: frame.record.image.timestamp_ms,
            width: frame.record.width(),
            height: frame.record.height(),
            inference_ms: frame.inference_latency.as_secs_f64() * 1_000.0,
            detection_count: frame.detections.len(),
            detections: frame.detections.iter().map(DetectionMessage::from).collect(),
            telemetry: frame.telemetry().map(TelemetrySummary::full),
        }
    }
}
