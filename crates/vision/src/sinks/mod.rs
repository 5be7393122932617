//! Output adapters fed by the dispatcher.
//!
//! Every sink runs on its own worker thread behind a small leaky mailbox, so a
//! slow or failing sink never holds up the others. A sink reports a broken
//! downstream by returning an error from [`Sink::accepts`]; the dispatcher then
//! retires it.

use std::io;

use thiserror::Error;

use crate::frame::EnrichedFrame;

pub mod annotation;
pub mod archive;
pub mod broadcast;
pub mod browser;
pub mod cot;
pub mod encoder;
pub mod message;
pub mod metadata_log;
pub mod stream;

pub use archive::{ArchiveDocument, ArchiveOptions, ArchiveSink};
pub use broadcast::{BroadcastOptions, MetadataBroadcaster};
pub use browser::{BrowserOptions, BrowserSink};
pub use cot::{CotForwarder, CotOptions, CotProtocol, CotTransport};
pub use metadata_log::{MetadataLog, MetadataLogOptions};
pub use stream::{StreamOptions, StreamSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    /// Consumes rendered video.
    Video,
    /// Consumes detections and telemetry only.
    Metadata,
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("encoding failed: {0}")]
    Encode(String),
    #[error("downstream closed: {0}")]
    Closed(String),
    #[error("{0}")]
    Unrecoverable(String),
}

impl From<serde_json::Error> for SinkError {
    fn from(err: serde_json::Error) -> Self {
        SinkError::Encode(err.to_string())
    }
}

impl From<image::ImageError> for SinkError {
    fn from(err: image::ImageError) -> Self {
        SinkError::Encode(err.to_string())
    }
}

/// One output adapter.
pub trait Sink: Send {
    fn name(&self) -> &str;

    fn kind(&self) -> SinkKind;

    /// Delivers one frame. An error retires the sink.
    fn accepts(&mut self, frame: &EnrichedFrame) -> Result<(), SinkError>;

    /// Flushes and releases resources. Called exactly once.
    fn shutdown(&mut self) -> Result<(), SinkError>;
}

impl<S: Sink + ?Sized> Sink for Box<S> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn kind(&self) -> SinkKind {
        (**self).kind()
    }

    fn accepts(&mut self, frame: &EnrichedFrame) -> Result<(), SinkError> {
        (**self).accepts(frame)
    }

    fn shutdown(&mut self) -> Result<(), SinkError> {
        (**self).shutdown()
    }
}
