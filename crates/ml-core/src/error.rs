use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DetectionError {
    /// The current frame could not be processed; later frames may succeed.
    #[error("transient detection failure: {0}")]
    Transient(String),
    /// The detector is unusable.
    #[error("fatal detection failure: {0}")]
    Fatal(String),
}

impl DetectionError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, DetectionError::Fatal(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DetectionError::Transient(_) => "transient",
            DetectionError::Fatal(_) => "fatal",
        }
    }
}
