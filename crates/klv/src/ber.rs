use crate::DecodeError;

const MAX_LENGTH_OCTETS: usize = 4;
const MAX_OID_OCTETS: usize = 4;

/// Reads a BER length, returning the decoded length and the number of bytes it occupied.
pub(crate) fn read_length(bytes: &[u8]) -> Result<(usize, usize), DecodeError> {
    let first = *bytes.first().ok_or(DecodeError::Truncated {
        needed: 1,
        available: 0,
    })?;
    if first & 0x80 == 0 {
        return Ok((first as usize, 1));
    }

    let octets = (first & 0x7F) as usize;
    if octets == 0 || octets > MAX_LENGTH_OCTETS {
        return Err(DecodeError::UnsupportedLength(first));
    }
    let digits = bytes.get(1..=octets).ok_or(DecodeError::Truncated {
        needed: octets + 1,
        available: bytes.len(),
    })?;
    let length = digits
        .iter()
        .fold(0usize, |acc, byte| (acc << 8) | *byte as usize);
    Ok((length, octets + 1))
}

/// Reads a BER-OID encoded tag.
pub(crate) fn read_oid(bytes: &[u8]) -> Result<(u32, usize), DecodeError> {
    let mut value = 0u32;
    for (idx, byte) in bytes.iter().enumerate() {
        if idx == MAX_OID_OCTETS {
            return Err(DecodeError::TagOverflow);
        }
        value = (value << 7) | u32::from(byte & 0x7F);
        if byte & 0x80 == 0 {
            return Ok((value, idx + 1));
        }
    }
    Err(DecodeError::Truncated {
        needed: bytes.len() + 1,
        available: bytes.len(),
    })
}

pub(crate) fn write_length(length: usize, out: &mut Vec<u8>) {
    if length < 0x80 {
        out.push(length as u8);
        return;
    }
    let digits = length.to_be_bytes();
    let skip = digits.iter().take_while(|byte| **byte == 0).count();
    let significant = &digits[skip..];
    out.push(0x80 | significant.len() as u8);
    out.extend_from_slice(significant);
}

pub(crate) fn write_oid(tag: u32, out: &mut Vec<u8>) {
    let mut groups = vec![(tag & 0x7F) as u8];
    let mut rest = tag >> 7;
    while rest > 0 {
        groups.push(0x80 | (rest & 0x7F) as u8);
        rest >>= 7;
    }
    out.extend(groups.iter().rev());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_and_long_form_lengths() {
        assert_eq!(read_length(&[0x2A]).unwrap(), (42, 1));
        assert_eq!(read_length(&[0x81, 0xC8]).unwrap(), (200, 2));
        assert_eq!(read_length(&[0x82, 0x01, 0x00]).unwrap(), (256, 3));
    }

    #[test]
    fn long_form_without_digits_is_truncated() {
        assert!(matches!(
            read_length(&[0x82, 0x01]),
            Err(DecodeError::Truncated { .. })
        ));
        assert_eq!(
            read_length(&[0x80]),
            Err(DecodeError::UnsupportedLength(0x80))
        );
    }

    #[test]
    fn multi_byte_tags() {
        assert_eq!(read_oid(&[0x41]).unwrap(), (65, 1));
        assert_eq!(read_oid(&[0x81, 0x01]).unwrap(), (129, 2));

        let mut out = Vec::new();
        write_oid(129, &mut out);
        assert_eq!(out, vec![0x81, 0x01]);
    }

    #[test]
    fn writes_minimal_long_form() {
        let mut out = Vec::new();
        write_length(300, &mut out);
        assert_eq!(out, vec![0x82, 0x01, 0x2C]);
    }
}
