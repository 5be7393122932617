use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("packet does not start with the UAS Datalink local set key")]
    NotLocalSet,
    #[error("packet truncated: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },
    #[error("unsupported BER length form 0x{0:02x}")]
    UnsupportedLength(u8),
    #[error("tag identifier exceeds four BER-OID bytes")]
    TagOverflow,
    #[error("local set does not end with a checksum item")]
    MissingChecksum,
    #[error("checksum mismatch: packet carries 0x{expected:04x}, computed 0x{computed:04x}")]
    Checksum { expected: u16, computed: u16 },
    #[error("tag {tag} carries {actual} bytes, expected {expected}")]
    FieldLength {
        tag: u32,
        expected: usize,
        actual: usize,
    },
    #[error("tag {tag} is not valid UTF-8")]
    InvalidText { tag: u32 },
}

impl DecodeError {
    /// Short label used when counting rejected packets.
    pub fn kind(&self) -> &'static str {
        match self {
            DecodeError::NotLocalSet => "key",
            DecodeError::Truncated { .. } => "truncated",
            DecodeError::UnsupportedLength(_) | DecodeError::TagOverflow => "framing",
            DecodeError::MissingChecksum | DecodeError::Checksum { .. } => "checksum",
            DecodeError::FieldLength { .. } | DecodeError::InvalidText { .. } => "field",
        }
    }
}
