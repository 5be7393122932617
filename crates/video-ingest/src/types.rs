use thiserror::Error;

/// Decoded video frame, packed BGR8 rows.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Presentation time on the source clock, milliseconds since the source opened.
    pub timestamp_ms: i64,
    pub format: FrameFormat,
}

impl Frame {
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * self.format.bytes_per_pixel()
    }

    pub fn is_complete(&self) -> bool {
        self.data.len() == self.expected_len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFormat {
    Bgr8,
}

impl FrameFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            FrameFormat::Bgr8 => 3,
        }
    }
}

/// Raw KLV bytes demuxed from the stream's data track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataPacket {
    pub data: Vec<u8>,
    /// Arrival time on the source clock, milliseconds since the source opened.
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone)]
pub enum SourceEvent {
    Frame(Frame),
    Metadata(MetadataPacket),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Transport used to reach a source.
pub enum SourceKind {
    /// Pre-recorded file on disk.
    File,
    /// Local V4L device.
    Device,
    Rtsp,
    Srt,
    /// MPEG-TS over UDP.
    Udp,
    Http,
}

impl SourceKind {
    /// Infers the transport kind from a URI.
    pub fn from_uri(uri: &str) -> Self {
        let lower = uri.to_ascii_lowercase();
        if lower.starts_with("rtsp://") || lower.starts_with("rtsps://") {
            SourceKind::Rtsp
        } else if lower.starts_with("srt://") {
            SourceKind::Srt
        } else if lower.starts_with("udp://") || lower.starts_with("rtp://") {
            SourceKind::Udp
        } else if lower.starts_with("http://") || lower.starts_with("https://") {
            SourceKind::Http
        } else if parse_device_index(uri).is_some() {
            SourceKind::Device
        } else {
            SourceKind::File
        }
    }

    /// Live sources never reach a natural end of stream.
    pub fn is_live(self) -> bool {
        !matches!(self, SourceKind::File)
    }

    pub fn label(self) -> &'static str {
        match self {
            SourceKind::File => "file",
            SourceKind::Device => "device",
            SourceKind::Rtsp => "rtsp",
            SourceKind::Srt => "srt",
            SourceKind::Udp => "udp",
            SourceKind::Http => "http",
        }
    }
}

/// Accepts `0`, `3` or `/dev/video3`.
pub fn parse_device_index(uri: &str) -> Option<u32> {
    let digits = uri.strip_prefix("/dev/video").unwrap_or(uri);
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Static description of an opened source.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceInfo {
    pub uri: String,
    pub kind: SourceKind,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub has_metadata: bool,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to open video source {uri:?}: {reason}")]
    Open { uri: String, reason: String },
    /// One unit of input was unusable; the source can continue.
    #[error("corrupt input: {0}")]
    Corrupt(String),
    #[error("end of stream")]
    EndOfStream,
    #[error("source failed: {0}")]
    Unrecoverable(String),
}

impl SourceError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, SourceError::Corrupt(_))
    }
}
