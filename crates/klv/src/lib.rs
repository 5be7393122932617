//! MISB ST 0601 (UAS Datalink Local Set) support.
//!
//! Packets are validated as a whole before any field is interpreted: the
//! 16-byte universal key, the BER length and the trailing 16-bit checksum item
//! must all agree, otherwise the packet is rejected with a [`DecodeError`].

mod ber;
mod checksum;
mod encode;
mod error;
mod imapb;
mod packetizer;
mod record;
mod st0601;

pub use checksum::checksum16;
pub use encode::LocalSetBuilder;
pub use error::DecodeError;
pub use packetizer::KlvPacketizer;
pub use record::{Altitude, TelemetryRecord};
pub use st0601::{decode, tags};

/// Universal key identifying a UAS Datalink Local Set.
pub const UAS_LOCAL_SET_KEY: [u8; 16] = [
    0x06, 0x0E, 0x2B, 0x34, 0x02, 0x0B, 0x01, 0x01, 0x0E, 0x01, 0x03, 0x01, 0x01, 0x00, 0x00,
    0x00,
];
