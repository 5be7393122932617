use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use chrono::Utc;
use image::imageops;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    frame::EnrichedFrame,
    sinks::{
        Sink, SinkError, SinkKind,
        annotation::{encode_jpeg, render_frame},
        encoder::{EncoderSettings, FfmpegEncoder},
        message::{DetectionMessage, TelemetrySummary},
    },
};

#[derive(Debug, Clone)]
pub struct ArchiveOptions {
    pub directory: PathBuf,
    /// File stem shared by the video and the JSON document. Defaults to a
    /// timestamped name.
    pub stem: Option<String>,
    pub fps: f64,
    /// Also encode an annotated MP4 next to the JSON document.
    pub record_video: bool,
    /// Draw detections and the HUD onto the recorded video.
    pub overlay: bool,
    /// Save a JPEG crop of every detection under `<stem>_crops/`.
    pub save_crops: bool,
}

const CROP_JPEG_QUALITY: u8 = 90;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub output_file: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveFrame {
    pub frame: u64,
    pub timestamp: String,
    pub detection_count: usize,
    pub detections: Vec<DetectionMessage>,
    pub telemetry: Option<TelemetrySummary>,
}

/// JSON summary of a whole run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveDocument {
    pub video_info: VideoInfo,
    pub frames: Vec<ArchiveFrame>,
}

/// Writes an annotated recording and its detection document.
pub struct ArchiveSink {
    json_path: PathBuf,
    video_path: Option<PathBuf>,
    crops_dir: Option<PathBuf>,
    overlay: bool,
    encoder: Option<FfmpegEncoder>,
    document: ArchiveDocument,
}

impl ArchiveSink {
    pub fn new(options: ArchiveOptions) -> Result<Self, SinkError> {
        fs::create_dir_all(&options.directory)?;
        let stem = options
            .stem
            .unwrap_or_else(|| format!("overwatch_{}", Utc::now().format("%Y%m%d_%H%M%S")));
        let json_path = options.directory.join(format!("{stem}.json"));
        let video_path = options
            .record_video
            .then(|| options.directory.join(format!("{stem}.mp4")));
        let crops_dir = options
            .save_crops
            .then(|| options.directory.join(format!("{stem}_crops")));
        if let Some(dir) = &crops_dir {
            fs::create_dir_all(dir)?;
        }
        Ok(Self {
            json_path,
            document: ArchiveDocument {
                video_info: VideoInfo {
                    width: 0,
                    height: 0,
                    fps: options.fps,
                    output_file: video_path.as_ref().map(|p| p.display().to_string()),
                },
                frames: Vec::new(),
            },
            video_path,
            crops_dir,
            overlay: options.overlay,
            encoder: None,
        })
    }

    pub fn json_path(&self) -> &Path {
        &self.json_path
    }

    fn record_video(&mut self, frame: &EnrichedFrame) -> Result<(), SinkError> {
        let Some(path) = self.video_path.as_ref() else {
            return Ok(());
        };
        let image = render_frame(frame, self.overlay)?;
        if self.encoder.is_none() {
            let settings = EncoderSettings {
                width: image.width(),
                height: image.height(),
                fps: self.document.video_info.fps,
                output: path.display().to_string(),
            };
            self.encoder = Some(FfmpegEncoder::spawn(&settings)?);
        }
        match self.encoder.as_mut() {
            Some(encoder) => encoder.write_frame(image.as_raw()),
            None => Ok(()),
        }
    }

    fn save_crops(&self, frame: &EnrichedFrame) -> Result<(), SinkError> {
        let Some(dir) = self.crops_dir.as_ref() else {
            return Ok(());
        };
        if frame.detections.is_empty() {
            return Ok(());
        }
        let image = render_frame(frame, false)?;
        for (n, det) in frame.detections.iter().enumerate() {
            let (x, y) = (det.bbox.x.max(0.0) as u32, det.bbox.y.max(0.0) as u32);
            let (w, h) = (det.bbox.width.round() as u32, det.bbox.height.round() as u32);
            if w == 0 || h == 0 {
                continue;
            }
            let crop = imageops::crop_imm(&image, x, y, w, h).to_image();
            let class: String = det
                .class_name
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
                .collect();
            let path = dir.join(format!("frame{:06}_{n:02}_{class}.jpg", frame.index()));
            fs::write(path, encode_jpeg(&crop, CROP_JPEG_QUALITY)?)?;
        }
        Ok(())
    }

    fn write_document(&self) -> Result<(), SinkError> {
        let mut writer = BufWriter::new(File::create(&self.json_path)?);
        serde_json::to_writer_pretty(&mut writer, &self.document)?;
        writer.flush()?;
        Ok(())
    }
}

impl Sink for ArchiveSink {
    fn name(&self) -> &str {
        "archive"
    }

    fn kind(&self) -> SinkKind {
        if self.video_path.is_some() {
            SinkKind::Video
        } else {
            SinkKind::Metadata
        }
    }

    fn accepts(&mut self, frame: &EnrichedFrame) -> Result<(), SinkError> {
        let info = &mut self.document.video_info;
        if info.width == 0 {
            info.width = frame.record.width();
            info.height = frame.record.height();
        }
        self.record_video(frame)?;
        if let Err(err) = self.save_crops(frame) {
            warn!(frame = frame.index(), "failed to save detection crops: {err}");
        }
        self.document.frames.push(ArchiveFrame {
            frame: frame.index(),
            timestamp: frame.record.captured_at.to_rfc3339(),
            detection_count: frame.detections.len(),
            detections: frame.detections.iter().map(DetectionMessage::from).collect(),
            telemetry: frame.telemetry().map(TelemetrySummary::position),
        });
        Ok(())
    }

    fn shutdown(&mut self) -> Result<(), SinkError> {
        let encoded = match self.encoder.take() {
            Some(mut encoder) => encoder.finish(),
            None => Ok(()),
        };
        if let Err(err) = &encoded {
            warn!("archive video incomplete: {err}");
        }
        self.write_document()?;
        info!(
            path = %self.json_path.display(),
            frames = self.document.frames.len(),
            "archive written"
        );
        encoded
    }
}
