use std::{
    io::{self, ErrorKind, Write},
    process::{Child, ChildStdin, Command, ExitStatus, Stdio},
    thread,
    time::{Duration, Instant},
};

use tracing::{debug, info, warn};

use crate::sinks::SinkError;

/// Parameters for an `ffmpeg` process fed raw RGB24 frames on stdin.
#[derive(Debug, Clone)]
pub struct EncoderSettings {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    /// File path or push URL.
    pub output: String,
}

impl EncoderSettings {
    /// Muxer forced for network outputs; files use the extension.
    pub fn container(&self) -> Option<&'static str> {
        let lower = self.output.to_ascii_lowercase();
        if lower.starts_with("rtsp://") {
            Some("rtsp")
        } else if lower.starts_with("rtmp://") {
            Some("flv")
        } else if lower.starts_with("srt://") || lower.starts_with("udp://") {
            Some("mpegts")
        } else {
            None
        }
    }

    pub fn is_live(&self) -> bool {
        self.container().is_some()
    }

    pub(crate) fn args(&self) -> Vec<String> {
        let mut args: Vec<String> = [
            "-hide_banner",
            "-loglevel",
            "error",
            "-f",
            "rawvideo",
            "-pix_fmt",
            "rgb24",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        args.extend([
            "-s".into(),
            format!("{}x{}", self.width, self.height),
            "-r".into(),
            format!("{:.3}", self.fps),
            "-i".into(),
            "pipe:0".into(),
            "-c:v".into(),
            "libx264".into(),
            "-pix_fmt".into(),
            "yuv420p".into(),
        ]);
        match self.container() {
            Some(container) => {
                args.extend(["-preset", "ultrafast", "-tune", "zerolatency"].map(String::from));
                if container == "rtsp" {
                    args.extend(["-rtsp_transport", "tcp"].map(String::from));
                }
                args.extend(["-f".to_string(), container.to_string()]);
            }
            None => args.extend(["-preset", "veryfast", "-y"].map(String::from)),
        }
        args.push(self.output.clone());
        args
    }
}

/// How long `finish` lets ffmpeg flush before killing it.
pub const FINISH_TIMEOUT: Duration = Duration::from_secs(5);
const EXIT_POLL: Duration = Duration::from_millis(20);

/// Running encoder subprocess.
pub struct FfmpegEncoder {
    child: Child,
    stdin: Option<ChildStdin>,
    output: String,
    frame_bytes: usize,
    frames_written: u64,
}

impl FfmpegEncoder {
    pub fn spawn(settings: &EncoderSettings) -> Result<Self, SinkError> {
        let mut child = Command::new("ffmpeg")
            .args(settings.args())
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| SinkError::Unrecoverable(format!("failed to spawn ffmpeg: {err}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SinkError::Unrecoverable("failed to capture ffmpeg stdin".into()))?;
        info!(output = %settings.output, "encoder started");
        Ok(Self {
            child,
            stdin: Some(stdin),
            output: settings.output.clone(),
            frame_bytes: settings.width as usize * settings.height as usize * 3,
            frames_written: 0,
        })
    }

    pub fn write_frame(&mut self, rgb: &[u8]) -> Result<(), SinkError> {
        if rgb.len() != self.frame_bytes {
            return Err(SinkError::Encode(format!(
                "frame has {} bytes, encoder expects {}",
                rgb.len(),
                self.frame_bytes
            )));
        }
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| SinkError::Closed(format!("encoder for {} finished", self.output)))?;
        stdin.write_all(rgb).map_err(|err| match err.kind() {
            ErrorKind::BrokenPipe => SinkError::Closed(format!("{} closed the pipe", self.output)),
            _ => SinkError::Io(err),
        })?;
        self.frames_written += 1;
        Ok(())
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    /// Closes stdin and waits up to [`FINISH_TIMEOUT`] for ffmpeg to flush
    /// the output, killing it after that.
    pub fn finish(&mut self) -> Result<(), SinkError> {
        let Some(stdin) = self.stdin.take() else {
            return Ok(());
        };
        drop(stdin);
        let Some(status) = wait_or_kill(&mut self.child, FINISH_TIMEOUT)? else {
            warn!(output = %self.output, "encoder did not exit in time; killed it");
            return Err(SinkError::Unrecoverable(format!(
                "ffmpeg did not finish {} within {FINISH_TIMEOUT:?}",
                self.output
            )));
        };
        debug!(output = %self.output, frames = self.frames_written, %status, "encoder exited");
        if status.success() {
            Ok(())
        } else {
            Err(SinkError::Unrecoverable(format!(
                "ffmpeg exited with {status} for {}",
                self.output
            )))
        }
    }
}

/// Waits for `child` to exit for at most `limit`. Returns `None` when it had
/// to be killed.
pub(crate) fn wait_or_kill(child: &mut Child, limit: Duration) -> io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + limit;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            break;
        }
        thread::sleep(EXIT_POLL);
    }
    child.kill()?;
    child.wait()?;
    Ok(None)
}

impl Drop for FfmpegEncoder {
    fn drop(&mut self) {
        if self.stdin.take().is_some() {
            if let Err(err) = self.child.kill() {
                warn!(output = %self.output, "failed to stop encoder: {err}");
            }
            let _ = self.child.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(output: &str) -> EncoderSettings {
        EncoderSettings {
            width: 640,
            height: 360,
            fps: 25.0,
            output: output.into(),
        }
    }

    #[test]
    fn network_outputs_force_a_container() {
        assert_eq!(settings("rtsp://host/live").container(), Some("rtsp"));
        assert_eq!(settings("rtmp://host/app").container(), Some("flv"));
        assert_eq!(settings("udp://239.0.0.1:5000").container(), Some("mpegts"));
        assert_eq!(settings("srt://host:9000").container(), Some("mpegts"));
        assert_eq!(settings("/tmp/out.mp4").container(), None);
    }

    #[test]
    fn rtsp_args_use_tcp_and_low_latency() {
        let args = settings("rtsp://host/live").args();
        let joined = args.join(" ");
        assert!(joined.contains("-s 640x360"));
        assert!(joined.contains("-r 25.000"));
        assert!(joined.contains("-tune zerolatency"));
        assert!(joined.contains("-rtsp_transport tcp -f rtsp"));
        assert_eq!(args.last().map(String::as_str), Some("rtsp://host/live"));
    }

    #[cfg(unix)]
    #[test]
    fn stuck_child_is_killed_after_the_limit() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let started = Instant::now();
        let status = wait_or_kill(&mut child, Duration::from_millis(100)).unwrap();
        assert!(status.is_none());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(child.try_wait().unwrap().is_some());
    }

    #[cfg(unix)]
    #[test]
    fn prompt_exit_reports_its_status() {
        let mut child = Command::new("true").spawn().unwrap();
        let status = wait_or_kill(&mut child, Duration::from_secs(5)).unwrap();
        assert!(status.is_some_and(|s| s.success()));
    }

    #[test]
    fn file_args_overwrite_without_forcing_format() {
        let args = settings("/tmp/out.mp4").args();
        assert!(args.contains(&"-y".to_string()));
        assert!(!args.contains(&"zerolatency".to_string()));
    }
}
