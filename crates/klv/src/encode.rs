use crate::{
    TelemetryRecord, UAS_LOCAL_SET_KEY, ber, checksum16, imapb,
    st0601::{self, Mapping, tags},
};

const AGL_OCTETS: usize = 3;

/// Builds well-formed local set packets, checksum included.
///
/// Used by simulators and tests that need realistic KLV input.
#[derive(Debug, Clone, Default)]
pub struct LocalSetBuilder {
    items: Vec<u8>,
}

impl LocalSetBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder pre-populated with every field present on `record`.
    pub fn from_record(record: &TelemetryRecord) -> Self {
        let mut builder = Self::new();
        if let Some(ts) = record.precision_timestamp_us {
            builder = builder.precision_timestamp(ts);
        }
        if let Some(id) = &record.mission_id {
            builder = builder.mission_id(id);
        }
        if let Some(name) = &record.platform_designation {
            builder = builder.platform_designation(name);
        }
        let mapped = [
            (tags::PLATFORM_HEADING, st0601::HEADING, record.platform_heading),
            (tags::PLATFORM_PITCH, st0601::PITCH, record.platform_pitch),
            (tags::PLATFORM_ROLL, st0601::ROLL, record.platform_roll),
            (tags::SENSOR_LATITUDE, st0601::LATITUDE, record.latitude),
            (tags::SENSOR_LONGITUDE, st0601::LONGITUDE, record.longitude),
            (tags::SENSOR_TRUE_ALTITUDE, st0601::ALTITUDE, record.altitude.msl),
            (tags::HORIZONTAL_FOV, st0601::FOV, record.horizontal_fov),
            (tags::VERTICAL_FOV, st0601::FOV, record.vertical_fov),
            (tags::SENSOR_RELATIVE_AZIMUTH, st0601::RELATIVE_ANGLE, record.sensor_relative_azimuth),
            (
                tags::SENSOR_RELATIVE_ELEVATION,
                st0601::RELATIVE_ELEVATION,
                record.sensor_relative_elevation,
            ),
            (tags::SENSOR_RELATIVE_ROLL, st0601::RELATIVE_ANGLE, record.sensor_relative_roll),
            (tags::SENSOR_ELLIPSOID_HEIGHT, st0601::ALTITUDE, record.altitude.ellipsoid),
        ];
        for (tag, mapping, value) in mapped {
            if let Some(value) = value {
                builder = builder.mapped(tag, mapping, value);
            }
        }
        if let Some(agl) = record.altitude.agl {
            builder = builder.altitude_agl(agl);
        }
        if let Some(version) = record.ls_version {
            builder = builder.raw(tags::LS_VERSION, &[version]);
        }
        builder
    }

    /// Appends an arbitrary item; no validation is applied to `value`.
    pub fn raw(mut self, tag: u32, value: &[u8]) -> Self {
        ber::write_oid(tag, &mut self.items);
        ber::write_length(value.len(), &mut self.items);
        self.items.extend_from_slice(value);
        self
    }

    fn mapped(self, tag: u32, mapping: Mapping, value: f64) -> Self {
        let bytes = mapping.encode(value);
        self.raw(tag, &bytes)
    }

    pub fn precision_timestamp(self, micros: u64) -> Self {
        self.raw(tags::PRECISION_TIMESTAMP, &micros.to_be_bytes())
    }

    pub fn mission_id(self, id: &str) -> Self {
        self.raw(tags::MISSION_ID, id.as_bytes())
    }

    pub fn platform_designation(self, name: &str) -> Self {
        self.raw(tags::PLATFORM_DESIGNATION, name.as_bytes())
    }

    pub fn platform_heading(self, degrees: f64) -> Self {
        self.mapped(tags::PLATFORM_HEADING, st0601::HEADING, degrees)
    }

    pub fn platform_pitch(self, degrees: f64) -> Self {
        self.mapped(tags::PLATFORM_PITCH, st0601::PITCH, degrees)
    }

    pub fn platform_roll(self, degrees: f64) -> Self {
        self.mapped(tags::PLATFORM_ROLL, st0601::ROLL, degrees)
    }

    pub fn sensor_latitude(self, degrees: f64) -> Self {
        self.mapped(tags::SENSOR_LATITUDE, st0601::LATITUDE, degrees)
    }

    pub fn sensor_longitude(self, degrees: f64) -> Self {
        self.mapped(tags::SENSOR_LONGITUDE, st0601::LONGITUDE, degrees)
    }

    pub fn sensor_true_altitude(self, metres: f64) -> Self {
        self.mapped(tags::SENSOR_TRUE_ALTITUDE, st0601::ALTITUDE, metres)
    }

    pub fn sensor_ellipsoid_height(self, metres: f64) -> Self {
        self.mapped(tags::SENSOR_ELLIPSOID_HEIGHT, st0601::ALTITUDE, metres)
    }

    pub fn horizontal_fov(self, degrees: f64) -> Self {
        self.mapped(tags::HORIZONTAL_FOV, st0601::FOV, degrees)
    }

    pub fn vertical_fov(self, degrees: f64) -> Self {
        self.mapped(tags::VERTICAL_FOV, st0601::FOV, degrees)
    }

    pub fn sensor_relative_azimuth(self, degrees: f64) -> Self {
        let wrapped = degrees.rem_euclid(360.0);
        self.mapped(tags::SENSOR_RELATIVE_AZIMUTH, st0601::RELATIVE_ANGLE, wrapped)
    }

    pub fn sensor_relative_elevation(self, degrees: f64) -> Self {
        self.mapped(tags::SENSOR_RELATIVE_ELEVATION, st0601::RELATIVE_ELEVATION, degrees)
    }

    pub fn sensor_relative_roll(self, degrees: f64) -> Self {
        let wrapped = degrees.rem_euclid(360.0);
        self.mapped(tags::SENSOR_RELATIVE_ROLL, st0601::RELATIVE_ANGLE, wrapped)
    }

    pub fn altitude_agl(self, metres: f64) -> Self {
        let bytes = imapb::encode(st0601::AGL_MIN, st0601::AGL_MAX, AGL_OCTETS, metres);
        self.raw(tags::ALTITUDE_AGL, &bytes)
    }

    /// Wraps the items in key, length and checksum.
    pub fn build(&self) -> Vec<u8> {
        let value_len = self.items.len() + 4;
        let mut packet = Vec::with_capacity(UAS_LOCAL_SET_KEY.len() + 5 + value_len);
        packet.extend_from_slice(&UAS_LOCAL_SET_KEY);
        ber::write_length(value_len, &mut packet);
        packet.extend_from_slice(&self.items);
        packet.extend_from_slice(&[tags::CHECKSUM as u8, 2]);
        let checksum = checksum16(&packet);
        packet.extend_from_slice(&checksum.to_be_bytes());
        packet
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Altitude, decode};

    #[test]
    fn record_survives_a_trip_through_the_wire_format() {
        let record = TelemetryRecord {
            precision_timestamp_us: Some(42),
            platform_designation: Some("MQ-1C".into()),
            latitude: Some(-33.5),
            longitude: Some(151.25),
            altitude: Altitude {
                msl: None,
                agl: Some(250.0),
                ellipsoid: Some(300.0),
            },
            ls_version: Some(17),
            ..TelemetryRecord::default()
        };
        let decoded = decode(&LocalSetBuilder::from_record(&record).build()).unwrap();
        assert_eq!(decoded.platform_designation.as_deref(), Some("MQ-1C"));
        assert_eq!(decoded.ls_version, Some(17));
        assert_eq!(decoded.altitude.msl, None);
        assert!((decoded.altitude.agl.unwrap() - 250.0).abs() < 0.01);
        assert!((decoded.latitude.unwrap() + 33.5).abs() < 1e-6);
    }

    #[test]
    fn large_sets_use_long_form_length() {
        let packet = LocalSetBuilder::new()
            .mission_id(&"X".repeat(200))
            .build();
        assert_eq!(packet[UAS_LOCAL_SET_KEY.len()], 0x81);
        assert!(decode(&packet).is_ok());
    }
}
