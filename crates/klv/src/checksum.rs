/// ST 0601 running-sum checksum.
///
/// Even-offset bytes are added into the high byte and odd-offset bytes into the
/// low byte. The sum covers the packet from the first key byte through the
/// checksum item's tag and length bytes.
pub fn checksum16(bytes: &[u8]) -> u16 {
    bytes.iter().enumerate().fold(0u16, |acc, (idx, byte)| {
        acc.wrapping_add(u16::from(*byte) << (8 * ((idx + 1) % 2)))
    })
}

#[cfg(test)]
mod tests {
    use super::checksum16;

    #[test]
    fn alternates_high_and_low_bytes() {
        assert_eq!(checksum16(&[0x01]), 0x0100);
        assert_eq!(checksum16(&[0x01, 0x02]), 0x0102);
        assert_eq!(checksum16(&[0x01, 0x02, 0x03]), 0x0402);
    }

    #[test]
    fn wraps_on_overflow() {
        assert_eq!(checksum16(&[0xFF, 0xFF, 0x01, 0x01]), 0x0100);
    }
}
