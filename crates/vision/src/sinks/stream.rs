use std::{
    thread,
    time::{Duration, Instant},
};

use tracing::info;

use crate::{
    frame::EnrichedFrame,
    sinks::{
        Sink, SinkError, SinkKind,
        annotation::render_frame,
        encoder::{EncoderSettings, FfmpegEncoder},
    },
};

#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// Push destination, e.g. `rtsp://mediamtx:8554/overwatch`.
    pub url: String,
    /// Source frame rate the output is paced to.
    pub fps: f64,
    /// Draw detections and the HUD onto the video.
    pub overlay: bool,
}

/// Holds frame writes to the source frame rate without bursting after a stall.
#[derive(Debug)]
pub(crate) struct Pacer {
    interval: Duration,
    next: Option<Instant>,
}

impl Pacer {
    pub(crate) fn new(fps: f64) -> Self {
        let interval = if fps.is_finite() && fps > 0.0 {
            Duration::from_secs_f64(1.0 / fps)
        } else {
            Duration::ZERO
        };
        Self {
            interval,
            next: None,
        }
    }

    /// Time to wait before emitting a frame at `now`.
    pub(crate) fn delay(&mut self, now: Instant) -> Duration {
        let due = match self.next {
            Some(next) if next > now => next,
            _ => now,
        };
        self.next = Some(due + self.interval);
        due - now
    }
}

/// Continuous annotated video pushed through an ffmpeg encoder.
pub struct StreamSink {
    options: StreamOptions,
    encoder: Option<FfmpegEncoder>,
    pacer: Pacer,
}

impl StreamSink {
    pub fn new(options: StreamOptions) -> Self {
        let pacer = Pacer::new(options.fps);
        Self {
            options,
            encoder: None,
            pacer,
        }
    }
}

impl Sink for StreamSink {
    fn name(&self) -> &str {
        "stream"
    }

    fn kind(&self) -> SinkKind {
        SinkKind::Video
    }

    fn accepts(&mut self, frame: &EnrichedFrame) -> Result<(), SinkError> {
        let image = render_frame(frame, self.options.overlay)?;
        if self.encoder.is_none() {
            let settings = EncoderSettings {
                width: image.width(),
                height: image.height(),
                fps: self.options.fps,
                output: self.options.url.clone(),
            };
            self.encoder = Some(FfmpegEncoder::spawn(&settings)?);
        }
        let wait = self.pacer.delay(Instant::now());
        if !wait.is_zero() {
            thread::sleep(wait);
        }
        match self.encoder.as_mut() {
            Some(encoder) => encoder.write_frame(image.as_raw()),
            None => Err(SinkError::Closed("encoder not running".into())),
        }
    }

    fn shutdown(&mut self) -> Result<(), SinkError> {
        match self.encoder.take() {
            Some(mut encoder) => {
                info!(url = %self.options.url, frames = encoder.frames_written(), "stream closed");
                encoder.finish()
            }
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pacer_spaces_frames_by_the_frame_interval() {
        let mut pacer = Pacer::new(10.0);
        let start = Instant::now();
        assert_eq!(pacer.delay(start), Duration::ZERO);
        assert_eq!(pacer.delay(start), Duration::from_millis(100));
        assert_eq!(
            pacer.delay(start + Duration::from_millis(150)),
            Duration::from_millis(50)
        );
    }

    #[test]
    fn pacer_does_not_burst_after_a_stall() {
        let mut pacer = Pacer::new(10.0);
        let start = Instant::now();
        pacer.delay(start);
        let late = start + Duration::from_secs(2);
        assert_eq!(pacer.delay(late), Duration::ZERO);
        assert_eq!(pacer.delay(late), Duration::from_millis(100));
    }

    #[test]
    fn zero_fps_disables_pacing() {
        let mut pacer = Pacer::new(0.0);
        let now = Instant::now();
        assert_eq!(pacer.delay(now), Duration::ZERO);
        assert_eq!(pacer.delay(now), Duration::ZERO);
    }
}
