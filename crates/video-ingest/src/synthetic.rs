use std::{
    collections::VecDeque,
    thread,
    time::{Duration, Instant},
};

use crate::{
    MediaSource,
    types::{Frame, FrameFormat, MetadataPacket, SourceError, SourceEvent, SourceInfo, SourceKind},
};

/// What a [`SyntheticSource`] does once its script is exhausted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndBehavior {
    EndOfStream,
    Fail(String),
    /// Keep producing plain frames until closed.
    Repeat,
}

#[derive(Debug, Clone)]
enum Step {
    Frame,
    Metadata(Vec<u8>),
    Corrupt,
    Fail(String),
}

/// Scripted source producing gradient frames and caller-supplied KLV packets.
///
/// The source clock advances by one frame interval per frame, so timestamps
/// are deterministic whether or not the source is paced in wall time.
#[derive(Debug)]
pub struct SyntheticSource {
    info: SourceInfo,
    steps: VecDeque<Step>,
    end: EndBehavior,
    paced: bool,
    frames_emitted: u64,
    last_frame_at: Option<Instant>,
    closed: bool,
}

impl SyntheticSource {
    pub fn new(width: u32, height: u32, fps: f64) -> Self {
        Self {
            info: SourceInfo {
                uri: "synthetic://".into(),
                kind: SourceKind::File,
                width,
                height,
                fps: if fps > 0.0 { fps } else { 30.0 },
                has_metadata: false,
            },
            steps: VecDeque::new(),
            end: EndBehavior::EndOfStream,
            paced: false,
            frames_emitted: 0,
            last_frame_at: None,
            closed: false,
        }
    }

    pub fn frame(mut self) -> Self {
        self.steps.push_back(Step::Frame);
        self
    }

    pub fn frames(mut self, count: usize) -> Self {
        self.steps.extend(std::iter::repeat_n(Step::Frame, count));
        self
    }

    /// Queues a raw KLV packet, stamped with the time of the next frame.
    pub fn metadata(mut self, packet: Vec<u8>) -> Self {
        self.info.has_metadata = true;
        self.steps.push_back(Step::Metadata(packet));
        self
    }

    pub fn corrupt_frame(mut self) -> Self {
        self.steps.push_back(Step::Corrupt);
        self
    }

    pub fn fail(mut self, reason: impl Into<String>) -> Self {
        self.steps.push_back(Step::Fail(reason.into()));
        self
    }

    pub fn end_with(mut self, end: EndBehavior) -> Self {
        self.end = end;
        self
    }

    /// Emit frames no faster than the nominal frame rate.
    pub fn paced(mut self, paced: bool) -> Self {
        self.paced = paced;
        self
    }

    fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.info.fps)
    }

    fn clock_ms(&self) -> i64 {
        (self.frames_emitted as f64 * 1000.0 / self.info.fps).round() as i64
    }

    fn render_frame(&mut self) -> Frame {
        let (width, height) = (self.info.width as usize, self.info.height as usize);
        let tint = (self.frames_emitted * 8 % 256) as u8;
        let mut data = Vec::with_capacity(width * height * 3);
        for y in 0..height {
            for x in 0..width {
                data.push((x * 255 / width.max(1)) as u8);
                data.push((y * 255 / height.max(1)) as u8);
                data.push(tint);
            }
        }
        let frame = Frame {
            data,
            width: self.info.width,
            height: self.info.height,
            timestamp_ms: self.clock_ms(),
            format: FrameFormat::Bgr8,
        };
        self.frames_emitted += 1;
        self.last_frame_at = Some(Instant::now());
        frame
    }

    /// Sleeps until the next frame is due; returns false if that is beyond `timeout`.
    fn wait_for_slot(&self, timeout: Duration) -> bool {
        let Some(last) = self.last_frame_at.filter(|_| self.paced) else {
            return true;
        };
        let due = last + self.frame_interval();
        let wait = due.saturating_duration_since(Instant::now());
        if wait > timeout {
            thread::sleep(timeout);
            return false;
        }
        thread::sleep(wait);
        true
    }
}

impl MediaSource for SyntheticSource {
    fn info(&self) -> &SourceInfo {
        &self.info
    }

    fn next_event(&mut self, timeout: Duration) -> Result<Option<SourceEvent>, SourceError> {
        if self.closed {
            return Err(SourceError::Unrecoverable("source closed".into()));
        }
        let step = match self.steps.pop_front() {
            Some(step) => step,
            None => match &self.end {
                EndBehavior::EndOfStream => return Err(SourceError::EndOfStream),
                EndBehavior::Fail(reason) => {
                    return Err(SourceError::Unrecoverable(reason.clone()));
                }
                EndBehavior::Repeat => Step::Frame,
            },
        };

        match step {
            Step::Frame => {
                if !self.wait_for_slot(timeout) {
                    self.steps.push_front(Step::Frame);
                    return Ok(None);
                }
                Ok(Some(SourceEvent::Frame(self.render_frame())))
            }
            Step::Metadata(data) => Ok(Some(SourceEvent::Metadata(MetadataPacket {
                data,
                timestamp_ms: self.clock_ms(),
            }))),
            Step::Corrupt => {
                self.frames_emitted += 1;
                Err(SourceError::Corrupt(format!(
                    "undecodable frame at {} ms",
                    self.clock_ms()
                )))
            }
            Step::Fail(reason) => Err(SourceError::Unrecoverable(reason)),
        }
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POLL: Duration = Duration::from_millis(10);

    #[test]
    fn script_plays_in_order_then_ends() {
        let mut source = SyntheticSource::new(4, 2, 25.0)
            .metadata(vec![1, 2, 3])
            .frames(2)
            .corrupt_frame();

        match source.next_event(POLL).unwrap() {
            Some(SourceEvent::Metadata(packet)) => {
                assert_eq!(packet.data, vec![1, 2, 3]);
                assert_eq!(packet.timestamp_ms, 0);
            }
            other => panic!("expected metadata, got {other:?}"),
        }
        for expected_ts in [0, 40] {
            match source.next_event(POLL).unwrap() {
                Some(SourceEvent::Frame(frame)) => {
                    assert_eq!(frame.timestamp_ms, expected_ts);
                    assert!(frame.is_complete());
                }
                other => panic!("expected frame, got {other:?}"),
            }
        }
        assert!(matches!(source.next_event(POLL), Err(SourceError::Corrupt(_))));
        assert!(matches!(source.next_event(POLL), Err(SourceError::EndOfStream)));
    }

    #[test]
    fn repeat_keeps_producing_until_closed() {
        let mut source = SyntheticSource::new(2, 2, 30.0).end_with(EndBehavior::Repeat);
        for _ in 0..5 {
            assert!(matches!(
                source.next_event(POLL).unwrap(),
                Some(SourceEvent::Frame(_))
            ));
        }
        source.close();
        assert!(source.next_event(POLL).is_err());
    }

    #[test]
    fn paced_source_reports_idle_when_frame_not_due() {
        let mut source = SyntheticSource::new(2, 2, 1.0).frames(2).paced(true);
        assert!(source.next_event(POLL).unwrap().is_some());
        assert!(source.next_event(POLL).unwrap().is_none());
    }
}
