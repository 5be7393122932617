//! Media sources for the vision pipeline.
//!
//! A [`MediaSource`] interleaves decoded video frames with raw KLV packets from
//! the stream's data track. Both carry timestamps on the same source clock so
//! the consumer can tell how old the latest telemetry is relative to a frame.

use std::time::Duration;

mod ffmpeg;
mod synthetic;
mod types;

pub use ffmpeg::{FfmpegSource, FfmpegSourceOptions};
pub use synthetic::{EndBehavior, SyntheticSource};
pub use types::{
    Frame, FrameFormat, MetadataPacket, SourceError, SourceEvent, SourceInfo, SourceKind,
    parse_device_index,
};

/// Pull-based source of frames and metadata.
pub trait MediaSource: Send {
    fn info(&self) -> &SourceInfo;

    /// Waits up to `timeout` for the next event.
    ///
    /// `Ok(None)` means nothing arrived in time. [`SourceError::Corrupt`] is
    /// recoverable; every other error ends the source.
    fn next_event(&mut self, timeout: Duration) -> Result<Option<SourceEvent>, SourceError>;

    /// Releases the underlying transport. Safe to call more than once.
    fn close(&mut self) {}
}

impl<S: MediaSource + ?Sized> MediaSource for Box<S> {
    fn info(&self) -> &SourceInfo {
        (**self).info()
    }

    fn next_event(&mut self, timeout: Duration) -> Result<Option<SourceEvent>, SourceError> {
        (**self).next_event(timeout)
    }

    fn close(&mut self) {
        (**self).close()
    }
}
