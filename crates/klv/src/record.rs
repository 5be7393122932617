use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Platform altitude as reported by the three ST 0601 altitude items.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Altitude {
    /// Sensor true altitude above mean sea level (tag 15).
    pub msl: Option<f64>,
    /// Altitude above ground level (tag 113).
    pub agl: Option<f64>,
    /// Height above the WGS-84 ellipsoid (tag 75).
    pub ellipsoid: Option<f64>,
}

impl Altitude {
    /// Height used for ground projection: AGL, then MSL, then ellipsoid.
    pub fn for_projection(&self) -> Option<f64> {
        self.agl.or(self.msl).or(self.ellipsoid)
    }

    /// Height reported to downstream consumers: MSL, then ellipsoid, then AGL.
    pub fn reported(&self) -> Option<f64> {
        self.msl.or(self.ellipsoid).or(self.agl)
    }

    pub fn is_empty(&self) -> bool {
        self.msl.is_none() && self.agl.is_none() && self.ellipsoid.is_none()
    }
}

/// Decoded platform and sensor state carried by one local set.
///
/// Every field is optional; an item the packet did not carry stays `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    /// Precision time stamp, microseconds since the UNIX epoch.
    pub precision_timestamp_us: Option<u64>,
    pub mission_id: Option<String>,
    pub platform_designation: Option<String>,
    pub platform_heading: Option<f64>,
    pub platform_pitch: Option<f64>,
    pub platform_roll: Option<f64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude: Altitude,
    pub horizontal_fov: Option<f64>,
    pub vertical_fov: Option<f64>,
    pub sensor_relative_azimuth: Option<f64>,
    pub sensor_relative_elevation: Option<f64>,
    pub sensor_relative_roll: Option<f64>,
    /// World-frame gimbal azimuth from sources that report a stabilised
    /// gimbal directly. No ST 0601 item carries it.
    pub sensor_absolute_azimuth: Option<f64>,
    /// World-frame gimbal elevation, negative below the horizon.
    pub sensor_absolute_elevation: Option<f64>,
    pub ls_version: Option<u8>,
}

impl TelemetryRecord {
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        let micros = i64::try_from(self.precision_timestamp_us?).ok()?;
        DateTime::from_timestamp_micros(micros)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn projection_prefers_height_above_ground() {
        let altitude = Altitude {
            msl: Some(500.0),
            agl: Some(120.0),
            ellipsoid: Some(540.0),
        };
        assert_eq!(altitude.for_projection(), Some(120.0));
        assert_eq!(altitude.reported(), Some(500.0));

        let ellipsoid_only = Altitude {
            ellipsoid: Some(80.0),
            ..Altitude::default()
        };
        assert_eq!(ellipsoid_only.for_projection(), Some(80.0));
        assert_eq!(ellipsoid_only.reported(), Some(80.0));
    }

    #[test]
    fn timestamp_converts_microseconds() {
        let record = TelemetryRecord {
            precision_timestamp_us: Some(1_700_000_000_123_456),
            ..TelemetryRecord::default()
        };
        let ts = record.timestamp().unwrap();
        assert_eq!(ts.timestamp(), 1_700_000_000);
        assert_eq!(ts.timestamp_subsec_micros(), 123_456);
    }
}
