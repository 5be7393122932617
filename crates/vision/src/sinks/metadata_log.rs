use std::{
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    path::PathBuf,
};

use tracing::info;

use crate::{
    frame::EnrichedFrame,
    sinks::{Sink, SinkError, SinkKind, message::FrameMessage},
};

#[derive(Debug, Clone)]
pub struct MetadataLogOptions {
    pub path: PathBuf,
    /// Write one line every `interval` delivered frames.
    pub interval: u64,
}

/// JSON-lines log of frame messages.
pub struct MetadataLog {
    path: PathBuf,
    writer: BufWriter<File>,
    interval: u64,
    seen: u64,
    written: u64,
}

impl MetadataLog {
    pub fn new(options: MetadataLogOptions) -> Result<Self, SinkError> {
        if let Some(parent) = options.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&options.path)?;
        Ok(Self {
            path: options.path,
            writer: BufWriter::new(file),
            interval: options.interval.max(1),
            seen: 0,
            written: 0,
        })
    }
}

impl Sink for MetadataLog {
    fn name(&self) -> &str {
        "metadata-log"
    }

    fn kind(&self) -> SinkKind {
        SinkKind::Metadata
    }

    fn accepts(&mut self, frame: &EnrichedFrame) -> Result<(), SinkError> {
        let due = self.seen % self.interval == 0;
        self.seen += 1;
        if !due {
            return Ok(());
        }
        serde_json::to_writer(&mut self.writer, &FrameMessage::from_frame(frame))?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        self.written += 1;
        Ok(())
    }

    fn shutdown(&mut self) -> Result<(), SinkError> {
        self.writer.flush()?;
        info!(path = %self.path.display(), lines = self.written, "metadata log closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use video_ingest::{Frame, FrameFormat};

    use super::*;
    use crate::frame::FrameRecord;

    fn frame(index: u64) -> EnrichedFrame {
        EnrichedFrame {
            record: FrameRecord {
                index,
                image: Frame {
                    data: vec![0; 3],
                    width: 1,
                    height: 1,
                    timestamp_ms: 0,
                    format: FrameFormat::Bgr8,
                },
                captured_at: Utc::now(),
                telemetry: None,
            },
            detections: Vec::new(),
            inference_latency: Duration::ZERO,
        }
    }

    #[test]
    fn writes_every_nth_delivered_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("meta.jsonl");
        let mut log = MetadataLog::new(MetadataLogOptions {
            path: path.clone(),
            interval: 3,
        })
        .unwrap();
        // indices have gaps; the interval counts deliveries
        for index in [0, 1, 4, 5, 6, 9, 12] {
            log.accepts(&frame(index)).unwrap();
        }
        log.shutdown().unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let frames: Vec<u64> = text
            .lines()
            .map(|line| serde_json::from_str::<FrameMessage>(line).unwrap().frame)
            .collect();
        assert_eq!(frames, vec![0, 5, 12]);
    }
}
