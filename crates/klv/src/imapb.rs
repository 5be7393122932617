//! ST 1201 floating-point to integer mapping (IMAPB).

struct Mapping {
    forward: f64,
    reverse: f64,
    zero_offset: f64,
}

fn mapping(min: f64, max: f64, octets: usize) -> Mapping {
    let b_pow = (max - min).log2().ceil() as i32;
    let d_pow = 8 * octets as i32 - 1;
    let forward = 2f64.powi(d_pow - b_pow);
    let reverse = 2f64.powi(b_pow - d_pow);
    let scaled_min = forward * min;
    Mapping {
        forward,
        reverse,
        zero_offset: scaled_min - scaled_min.floor(),
    }
}

pub(crate) fn decode(min: f64, max: f64, bytes: &[u8]) -> f64 {
    let map = mapping(min, max, bytes.len());
    let raw = bytes
        .iter()
        .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte));
    map.reverse * (raw as f64 - map.zero_offset) + min
}

pub(crate) fn encode(min: f64, max: f64, octets: usize, value: f64) -> Vec<u8> {
    let map = mapping(min, max, octets);
    let clamped = value.clamp(min, max);
    let raw = (map.forward * (clamped - min) + map.zero_offset).trunc() as u64;
    let bytes = raw.to_be_bytes();
    bytes[bytes.len() - octets..].to_vec()
}
