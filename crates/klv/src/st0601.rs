use crate::{TelemetryRecord, UAS_LOCAL_SET_KEY, ber, checksum16, imapb, DecodeError};

/// Local set tag numbers understood by the decoder.
pub mod tags {
    pub const CHECKSUM: u32 = 1;
    pub const PRECISION_TIMESTAMP: u32 = 2;
    pub const MISSION_ID: u32 = 3;
    pub const PLATFORM_HEADING: u32 = 5;
    pub const PLATFORM_PITCH: u32 = 6;
    pub const PLATFORM_ROLL: u32 = 7;
    pub const PLATFORM_DESIGNATION: u32 = 10;
    pub const SENSOR_LATITUDE: u32 = 13;
    pub const SENSOR_LONGITUDE: u32 = 14;
    pub const SENSOR_TRUE_ALTITUDE: u32 = 15;
    pub const HORIZONTAL_FOV: u32 = 16;
    pub const VERTICAL_FOV: u32 = 17;
    pub const SENSOR_RELATIVE_AZIMUTH: u32 = 18;
    pub const SENSOR_RELATIVE_ELEVATION: u32 = 19;
    pub const SENSOR_RELATIVE_ROLL: u32 = 20;
    pub const LS_VERSION: u32 = 65;
    pub const SENSOR_ELLIPSOID_HEIGHT: u32 = 75;
    pub const ALTITUDE_AGL: u32 = 113;
}

/// Linear mapping between a fixed-width integer and engineering units.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Mapping {
    /// `value = raw * span / max_raw + min`
    Unsigned { octets: usize, min: f64, span: f64 },
    /// `value = raw * half_span / max_positive_raw`; the most negative raw value marks an error.
    Signed { octets: usize, half_span: f64 },
}

pub(crate) const HEADING: Mapping = Mapping::Unsigned { octets: 2, min: 0.0, span: 360.0 };
pub(crate) const PITCH: Mapping = Mapping::Signed { octets: 2, half_span: 20.0 };
pub(crate) const ROLL: Mapping = Mapping::Signed { octets: 2, half_span: 50.0 };
pub(crate) const LATITUDE: Mapping = Mapping::Signed { octets: 4, half_span: 90.0 };
pub(crate) const LONGITUDE: Mapping = Mapping::Signed { octets: 4, half_span: 180.0 };
pub(crate) const ALTITUDE: Mapping = Mapping::Unsigned { octets: 2, min: -900.0, span: 19_900.0 };
pub(crate) const FOV: Mapping = Mapping::Unsigned { octets: 2, min: 0.0, span: 180.0 };
pub(crate) const RELATIVE_ANGLE: Mapping = Mapping::Unsigned { octets: 4, min: 0.0, span: 360.0 };
pub(crate) const RELATIVE_ELEVATION: Mapping = Mapping::Signed { octets: 4, half_span: 180.0 };

pub(crate) const AGL_MIN: f64 = -900.0;
pub(crate) const AGL_MAX: f64 = 40_000.0;
const AGL_MAX_OCTETS: usize = 8;

/// Size of the trailing checksum item: tag, length and two value bytes.
const CHECKSUM_ITEM_LEN: usize = 4;

impl Mapping {
    pub(crate) fn octets(self) -> usize {
        match self {
            Mapping::Unsigned { octets, .. } | Mapping::Signed { octets, .. } => octets,
        }
    }

    fn decode(self, tag: u32, value: &[u8]) -> Result<Option<f64>, DecodeError> {
        let octets = self.octets();
        if value.len() != octets {
            return Err(DecodeError::FieldLength {
                tag,
                expected: octets,
                actual: value.len(),
            });
        }
        let raw = value
            .iter()
            .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte));
        let bits = 8 * octets as u32;
        Ok(match self {
            Mapping::Unsigned { min, span, .. } => {
                let max_raw = (1u64 << bits) - 1;
                Some(raw as f64 * span / max_raw as f64 + min)
            }
            Mapping::Signed { half_span, .. } => {
                let sign_bit = 1u64 << (bits - 1);
                if raw == sign_bit {
                    return Ok(None);
                }
                let signed = if raw & sign_bit != 0 {
                    raw as i64 - (1i64 << bits)
                } else {
                    raw as i64
                };
                let max_positive = (sign_bit - 1) as f64;
                Some(signed as f64 * half_span / max_positive)
            }
        })
    }

    pub(crate) fn encode(self, value: f64) -> Vec<u8> {
        let octets = self.octets();
        let bits = 8 * octets as u32;
        let raw: u64 = match self {
            Mapping::Unsigned { min, span, .. } => {
                let max_raw = (1u64 << bits) - 1;
                let clamped = value.clamp(min, min + span);
                ((clamped - min) * max_raw as f64 / span).round() as u64
            }
            Mapping::Signed { half_span, .. } => {
                let max_positive = ((1u64 << (bits - 1)) - 1) as f64;
                let clamped = value.clamp(-half_span, half_span);
                let signed = (clamped * max_positive / half_span).round() as i64;
                (signed as u64) & ((1u64 << bits) - 1)
            }
        };
        raw.to_be_bytes()[8 - octets..].to_vec()
    }
}

/// Decodes one complete UAS Datalink Local Set packet.
///
/// The checksum is verified before any item is interpreted. Unknown tags are
/// skipped; a known tag repeated within the packet takes its last value.
pub fn decode(packet: &[u8]) -> Result<TelemetryRecord, DecodeError> {
    let body = packet
        .strip_prefix(&UAS_LOCAL_SET_KEY[..])
        .ok_or(DecodeError::NotLocalSet)?;
    let (length, length_octets) = ber::read_length(body)?;
    let value_start = UAS_LOCAL_SET_KEY.len() + length_octets;
    let value_end = value_start + length;
    if packet.len() < value_end {
        return Err(DecodeError::Truncated {
            needed: value_end,
            available: packet.len(),
        });
    }
    let packet = &packet[..value_end];
    verify_checksum(packet, value_start)?;

    let mut record = TelemetryRecord::default();
    let mut items = &packet[value_start..value_end - CHECKSUM_ITEM_LEN];
    while !items.is_empty() {
        let (tag, tag_octets) = ber::read_oid(items)?;
        let (item_len, len_octets) = ber::read_length(&items[tag_octets..])?;
        let start = tag_octets + len_octets;
        let value = items
            .get(start..start + item_len)
            .ok_or(DecodeError::Truncated {
                needed: start + item_len,
                available: items.len(),
            })?;
        apply(&mut record, tag, value)?;
        items = &items[start + item_len..];
    }
    Ok(record)
}

fn verify_checksum(packet: &[u8], value_start: usize) -> Result<(), DecodeError> {
    let len = packet.len();
    if len < value_start + CHECKSUM_ITEM_LEN
        || packet[len - 4] != tags::CHECKSUM as u8
        || packet[len - 3] != 2
    {
        return Err(DecodeError::MissingChecksum);
    }
    let expected = u16::from_be_bytes([packet[len - 2], packet[len - 1]]);
    let computed = checksum16(&packet[..len - 2]);
    if expected != computed {
        return Err(DecodeError::Checksum { expected, computed });
    }
    Ok(())
}

fn apply(record: &mut TelemetryRecord, tag: u32, value: &[u8]) -> Result<(), DecodeError> {
    match tag {
        tags::PRECISION_TIMESTAMP => {
            let bytes: [u8; 8] = fixed(tag, value)?;
            record.precision_timestamp_us = Some(u64::from_be_bytes(bytes));
        }
        tags::MISSION_ID => record.mission_id = Some(text(tag, value)?),
        tags::PLATFORM_DESIGNATION => record.platform_designation = Some(text(tag, value)?),
        tags::PLATFORM_HEADING => record.platform_heading = HEADING.decode(tag, value)?,
        tags::PLATFORM_PITCH => record.platform_pitch = PITCH.decode(tag, value)?,
        tags::PLATFORM_ROLL => record.platform_roll = ROLL.decode(tag, value)?,
        tags::SENSOR_LATITUDE => record.latitude = LATITUDE.decode(tag, value)?,
        tags::SENSOR_LONGITUDE => record.longitude = LONGITUDE.decode(tag, value)?,
        tags::SENSOR_TRUE_ALTITUDE => record.altitude.msl = ALTITUDE.decode(tag, value)?,
        tags::SENSOR_ELLIPSOID_HEIGHT => record.altitude.ellipsoid = ALTITUDE.decode(tag, value)?,
        tags::HORIZONTAL_FOV => record.horizontal_fov = FOV.decode(tag, value)?,
        tags::VERTICAL_FOV => record.vertical_fov = FOV.decode(tag, value)?,
        tags::SENSOR_RELATIVE_AZIMUTH => {
            record.sensor_relative_azimuth = RELATIVE_ANGLE.decode(tag, value)?
        }
        tags::SENSOR_RELATIVE_ELEVATION => {
            record.sensor_relative_elevation = RELATIVE_ELEVATION.decode(tag, value)?
        }
        tags::SENSOR_RELATIVE_ROLL => {
            record.sensor_relative_roll = RELATIVE_ANGLE.decode(tag, value)?
        }
        tags::LS_VERSION => {
            let [version] = fixed(tag, value)?;
            record.ls_version = Some(version);
        }
        tags::ALTITUDE_AGL => {
            if value.is_empty() || value.len() > AGL_MAX_OCTETS {
                return Err(DecodeError::FieldLength {
                    tag,
                    expected: 2,
                    actual: value.len(),
                });
            }
            record.altitude.agl = Some(imapb::decode(AGL_MIN, AGL_MAX, value));
        }
        // unknown tags are skipped
        _ => {}
    }
    Ok(())
}

fn fixed<const N: usize>(tag: u32, value: &[u8]) -> Result<[u8; N], DecodeError> {
    value.try_into().map_err(|_| DecodeError::FieldLength {
        tag,
        expected: N,
        actual: value.len(),
    })
}

fn text(tag: u32, value: &[u8]) -> Result<String, DecodeError> {
    std::str::from_utf8(value)
        .map(|s| s.trim_end_matches('\0').to_string())
        .map_err(|_| DecodeError::InvalidText { tag })
}
