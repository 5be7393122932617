use crate::{DecodeError, UAS_LOCAL_SET_KEY, ber};

/// Bytes kept while hunting for a key in a stream with no valid packet.
const MAX_BUFFERED: usize = 1 << 20;

/// Splits a raw KLV byte stream (as demuxed from a data PID) into whole local set packets.
///
/// Bytes preceding a universal key are discarded, so the packetizer
/// resynchronises after garbage or a torn packet.
#[derive(Debug, Default)]
pub struct KlvPacketizer {
    buffer: Vec<u8>,
    discarded: u64,
}

impl KlvPacketizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
        if self.buffer.len() > MAX_BUFFERED {
            let excess = self.buffer.len() - MAX_BUFFERED;
            self.discard(excess);
        }
    }

    /// Total bytes dropped while resynchronising.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Returns the next complete packet, key included, if one is buffered.
    pub fn next_packet(&mut self) -> Option<Vec<u8>> {
        loop {
            let start = self
                .buffer
                .windows(UAS_LOCAL_SET_KEY.len())
                .position(|window| window == UAS_LOCAL_SET_KEY);
            let Some(start) = start else {
                // keep a possible partial key at the tail
                let keep = UAS_LOCAL_SET_KEY.len() - 1;
                if self.buffer.len() > keep {
                    self.discard(self.buffer.len() - keep);
                }
                return None;
            };
            self.discard(start);

            let after_key = &self.buffer[UAS_LOCAL_SET_KEY.len()..];
            match ber::read_length(after_key) {
                Ok((length, octets)) => {
                    let total = UAS_LOCAL_SET_KEY.len() + octets + length;
                    if self.buffer.len() < total {
                        return None;
                    }
                    return Some(self.buffer.drain(..total).collect());
                }
                Err(DecodeError::Truncated { .. }) => return None,
                Err(_) => {
                    // not a usable key; skip its first byte and rescan
                    self.discard(1);
                }
            }
        }
    }

    fn discard(&mut self, count: usize) {
        if count == 0 {
            return;
        }
        self.buffer.drain(..count);
        self.discarded += count as u64;
    }
}
