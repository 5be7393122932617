use std::{
    io::Read,
    process::{Child, ChildStderr, ChildStdout, Command, Stdio},
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender, bounded, never, select};
use klv::KlvPacketizer;
use tracing::{debug, info, warn};

use crate::{
    MediaSource,
    types::{
        Frame, FrameFormat, MetadataPacket, SourceError, SourceEvent, SourceInfo, SourceKind,
        parse_device_index,
    },
};

const FRAME_QUEUE: usize = 4;
const METADATA_QUEUE: usize = 64;
const METADATA_CHUNK: usize = 4096;

#[derive(Debug, Clone)]
pub struct FfmpegSourceOptions {
    pub uri: String,
    pub width: u32,
    pub height: u32,
    /// Nominal frame rate, reported to sinks that re-encode.
    pub fps: f64,
    /// Read files at their native rate (`-re`) so they behave like a live feed.
    pub realtime: bool,
    /// Demux the first data track as KLV when the input has one.
    pub read_metadata: bool,
    /// Decode H.264 through NVDEC.
    pub use_nvdec: bool,
}

/// Source decoding through an `ffmpeg` subprocess.
///
/// Video is scaled to the requested size and read as raw BGR24 from stdout.
/// When the input carries a data track, the same process copies it to stderr
/// where it is split into local set packets.
pub struct FfmpegSource {
    info: SourceInfo,
    child: Option<Child>,
    frames: Receiver<Result<Frame, SourceError>>,
    metadata: Receiver<MetadataPacket>,
}

impl FfmpegSource {
    pub fn open(options: FfmpegSourceOptions) -> Result<Self, SourceError> {
        if options.width == 0 || options.height == 0 {
            return Err(SourceError::Open {
                uri: options.uri.clone(),
                reason: "capture size must be positive".into(),
            });
        }
        let kind = SourceKind::from_uri(&options.uri);
        let has_metadata = options.read_metadata && probe_data_track(&options.uri);
        info!(
            uri = %options.uri,
            kind = kind.label(),
            klv = has_metadata,
            "opening ffmpeg source"
        );

        let mut cmd = build_command(&options, kind, has_metadata);
        let mut child = cmd.spawn().map_err(|err| SourceError::Open {
            uri: options.uri.clone(),
            reason: format!("failed to spawn ffmpeg: {err}"),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| SourceError::Open {
            uri: options.uri.clone(),
            reason: "failed to capture ffmpeg stdout".into(),
        })?;

        let started = Instant::now();
        let (frame_tx, frame_rx) = bounded(FRAME_QUEUE);
        let frame_bytes = options.width as usize * options.height as usize * 3;
        let (width, height) = (options.width, options.height);
        let live = kind.is_live();
        thread::Builder::new()
            .name("ffmpeg-video".into())
            .spawn(move || {
                video_loop(stdout, frame_bytes, (width, height), live, started, frame_tx)
            })
            .map_err(|err| SourceError::Open {
                uri: options.uri.clone(),
                reason: format!("failed to spawn reader thread: {err}"),
            })?;

        let metadata = match child.stderr.take().filter(|_| has_metadata) {
            Some(stderr) => {
                let (meta_tx, meta_rx) = bounded(METADATA_QUEUE);
                thread::Builder::new()
                    .name("ffmpeg-klv".into())
                    .spawn(move || metadata_loop(stderr, started, meta_tx))
                    .map_err(|err| SourceError::Open {
                        uri: options.uri.clone(),
                        reason: format!("failed to spawn metadata thread: {err}"),
                    })?;
                meta_rx
            }
            None => never(),
        };

        Ok(Self {
            info: SourceInfo {
                uri: options.uri,
                kind,
                width,
                height,
                fps: options.fps,
                has_metadata,
            },
            child: Some(child),
            frames: frame_rx,
            metadata,
        })
    }
}

impl MediaSource for FfmpegSource {
    fn info(&self) -> &SourceInfo {
        &self.info
    }

    fn next_event(&mut self, timeout: Duration) -> Result<Option<SourceEvent>, SourceError> {
        let mut metadata_closed = false;
        let event = select! {
            recv(self.frames) -> msg => match msg {
                Ok(Ok(frame)) => Ok(Some(SourceEvent::Frame(frame))),
                Ok(Err(err)) => Err(err),
                Err(_) => Err(SourceError::Unrecoverable("video reader stopped".into())),
            },
            recv(self.metadata) -> msg => match msg {
                Ok(packet) => Ok(Some(SourceEvent::Metadata(packet))),
                Err(_) => {
                    metadata_closed = true;
                    Ok(None)
                }
            },
            default(timeout) => Ok(None),
        };
        if metadata_closed {
            debug!("klv track closed");
            self.metadata = never();
        }
        event
    }

    fn close(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        self.close();
    }
}

fn build_command(options: &FfmpegSourceOptions, kind: SourceKind, has_metadata: bool) -> Command {
    let mut cmd = Command::new("ffmpeg");
    cmd.arg("-hide_banner")
        .arg("-nostdin")
        .arg("-loglevel")
        // stderr carries KLV when a data track is copied
        .arg(if has_metadata { "quiet" } else { "error" });

    match kind {
        SourceKind::Rtsp => {
            cmd.args(["-rtsp_transport", "tcp", "-fflags", "nobuffer", "-flags", "low_delay"]);
            cmd.args(["-max_delay", "0"]);
        }
        SourceKind::Udp | SourceKind::Srt => {
            cmd.args(["-fflags", "+genpts+discardcorrupt", "-flags", "low_delay"]);
        }
        SourceKind::Device => {
            cmd.args(["-f", "video4linux2"]);
        }
        SourceKind::File if options.realtime => {
            cmd.arg("-re");
        }
        SourceKind::File | SourceKind::Http => {}
    }

    if options.use_nvdec {
        cmd.args(["-hwaccel", "cuda", "-c:v", "h264_cuvid"]);
    }

    let input = match parse_device_index(&options.uri) {
        Some(index) if kind == SourceKind::Device => format!("/dev/video{index}"),
        _ => options.uri.clone(),
    };
    cmd.arg("-i").arg(input);

    cmd.args(["-map", "0:v:0", "-an"])
        .arg("-vf")
        .arg(format!("scale={}:{}", options.width, options.height))
        .args(["-pix_fmt", "bgr24", "-f", "rawvideo", "pipe:1"]);

    if has_metadata {
        cmd.args(["-map", "0:d:0", "-c", "copy", "-f", "data", "pipe:2"]);
        cmd.stderr(Stdio::piped());
    } else {
        cmd.stderr(Stdio::inherit());
    }
    cmd.stdin(Stdio::null()).stdout(Stdio::piped());
    cmd
}

/// Returns true when `ffprobe` reports at least one data stream.
fn probe_data_track(uri: &str) -> bool {
    let output = Command::new("ffprobe")
        .args(["-v", "error", "-select_streams", "d", "-show_entries", "stream=index"])
        .args(["-of", "csv=p=0"])
        .arg(uri)
        .stdin(Stdio::null())
        .output();
    match output {
        Ok(output) if output.status.success() => {
            !String::from_utf8_lossy(&output.stdout).trim().is_empty()
        }
        Ok(output) => {
            debug!(status = %output.status, "ffprobe failed; reading video only");
            false
        }
        Err(err) => {
            warn!("ffprobe unavailable ({err}); reading video only");
            false
        }
    }
}

fn video_loop(
    mut stdout: ChildStdout,
    frame_bytes: usize,
    (width, height): (u32, u32),
    live: bool,
    started: Instant,
    tx: Sender<Result<Frame, SourceError>>,
) {
    let mut buffer = vec![0u8; frame_bytes];
    loop {
        match stdout.read_exact(&mut buffer) {
            Ok(()) => {
                let frame = Frame {
                    data: buffer.clone(),
                    width,
                    height,
                    timestamp_ms: started.elapsed().as_millis() as i64,
                    format: FrameFormat::Bgr8,
                };
                if tx.send(Ok(frame)).is_err() {
                    return;
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                let end = if live {
                    SourceError::Unrecoverable("live stream closed".into())
                } else {
                    SourceError::EndOfStream
                };
                let _ = tx.send(Err(end));
                return;
            }
            Err(err) => {
                let _ = tx.send(Err(SourceError::Unrecoverable(err.to_string())));
                return;
            }
        }
    }
}

fn metadata_loop(mut stderr: ChildStderr, started: Instant, tx: Sender<MetadataPacket>) {
    let mut packetizer = KlvPacketizer::new();
    let mut chunk = vec![0u8; METADATA_CHUNK];
    loop {
        let read = match stderr.read(&mut chunk) {
            Ok(0) => return,
            Ok(read) => read,
            Err(err) => {
                debug!("klv reader stopped: {err}");
                return;
            }
        };
        packetizer.push(&chunk[..read]);
        while let Some(data) = packetizer.next_packet() {
            let packet = MetadataPacket {
                data,
                timestamp_ms: started.elapsed().as_millis() as i64,
            };
            if tx.send(packet).is_err() {
                return;
            }
        }
    }
}
