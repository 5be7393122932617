use std::{
    fs,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use klv::LocalSetBuilder;
use ml_core::{BoundingBox, ObjectDetector, RawDetection, StubDetector};
use video_ingest::{EndBehavior, MediaSource, SyntheticSource};
use vision::{
    EnrichedFrame, PipelineSettings, ShutdownCause, ShutdownSignal, Sink, SinkError, SinkKind,
    pipeline::{self, DetectorFactory, SourceOpener},
    sinks::{ArchiveDocument, ArchiveOptions, ArchiveSink},
};

fn opener(source: SyntheticSource) -> SourceOpener {
    Box::new(move || Ok(Box::new(source) as Box<dyn MediaSource>))
}

fn person_detector() -> DetectorFactory {
    let person = RawDetection {
        bbox: BoundingBox::new(20.0, 14.0, 24.0, 20.0),
        class_name: "person".into(),
        confidence: 0.9,
        track_id: Some(7),
    };
    Box::new(move || Ok(Box::new(StubDetector::new(vec![person])) as Box<dyn ObjectDetector>))
}

fn mixed_detector() -> DetectorFactory {
    let detection = |class: &str, x: f32| RawDetection {
        bbox: BoundingBox::new(x, 2.0, 4.0, 4.0),
        class_name: class.into(),
        confidence: 0.9,
        track_id: None,
    };
    let detections = vec![detection("person", 0.0), detection("car", 8.0)];
    Box::new(move || Ok(Box::new(StubDetector::new(detections)) as Box<dyn ObjectDetector>))
}

fn roomy_settings() -> PipelineSettings {
    PipelineSettings {
        queue_capacity: 64,
        sink_mailbox_capacity: 64,
        poll_interval: Duration::from_millis(5),
        ..PipelineSettings::default()
    }
}

#[derive(Clone, Default)]
struct Recorder {
    delivered: Arc<Mutex<Vec<u64>>>,
    classes: Arc<Mutex<Vec<String>>>,
    shutdowns: Arc<AtomicUsize>,
}

/// Records every delivery; optionally fails on the n-th one and lingers in
/// shutdown.
struct RecordingSink {
    name: &'static str,
    recorder: Recorder,
    fail_at: Option<usize>,
    linger: Duration,
}

impl Sink for RecordingSink {
    fn name(&self) -> &str {
        self.name
    }

    fn kind(&self) -> SinkKind {
        SinkKind::Metadata
    }

    fn accepts(&mut self, frame: &EnrichedFrame) -> Result<(), SinkError> {
        let mut delivered = self.recorder.delivered.lock().unwrap();
        if self.fail_at == Some(delivered.len()) {
            return Err(SinkError::Unrecoverable("sink gave up".into()));
        }
        delivered.push(frame.index());
        self.recorder
            .classes
            .lock()
            .unwrap()
            .extend(frame.detections.iter().map(|d| d.class_name.clone()));
        Ok(())
    }

    fn shutdown(&mut self) -> Result<(), SinkError> {
        std::thread::sleep(self.linger);
        self.recorder.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn recording_sink(name: &'static str, fail_at: Option<usize>) -> (Box<dyn Sink>, Recorder) {
    lingering_sink(name, fail_at, Duration::ZERO)
}

fn lingering_sink(
    name: &'static str,
    fail_at: Option<usize>,
    linger: Duration,
) -> (Box<dyn Sink>, Recorder) {
    let recorder = Recorder::default();
    let sink = RecordingSink {
        name,
        recorder: recorder.clone(),
        fail_at,
        linger,
    };
    (Box::new(sink), recorder)
}

#[test]
fn archive_records_telemetry_only_while_it_is_fresh() {
    let telemetry = LocalSetBuilder::new()
        .sensor_latitude(45.0)
        .sensor_longitude(16.0)
        .altitude_agl(120.0)
        .build();
    // 30 fps: frame 4 is 133 ms after the packet, frame 5 is 167 ms
    let source = SyntheticSource::new(48, 32, 30.0).metadata(telemetry).frames(10);
    let settings = PipelineSettings {
        telemetry_max_age: Some(Duration::from_millis(150)),
        ..roomy_settings()
    };

    let dir = tempfile::tempdir().unwrap();
    let archive = ArchiveSink::new(ArchiveOptions {
        directory: dir.path().to_path_buf(),
        stem: Some("mission".into()),
        fps: 30.0,
        record_video: false,
        overlay: true,
        save_crops: false,
    })
    .unwrap();
    let json_path = archive.json_path().to_path_buf();

    let report = pipeline::run(
        opener(source),
        person_detector(),
        vec![Box::new(archive)],
        settings,
        ShutdownSignal::new(),
    )
    .unwrap();
    assert_eq!(report.cause, Some(ShutdownCause::EndOfStream));
    assert_eq!(report.capture.frames_captured, 10);
    assert_eq!(report.dispatch.frames_dispatched, 10);

    let text = fs::read_to_string(json_path).unwrap();
    let doc: ArchiveDocument = serde_json::from_str(&text).unwrap();
    let indices: Vec<u64> = doc.frames.iter().map(|f| f.frame).collect();
    assert_eq!(indices, (0..10).collect::<Vec<_>>());
    for entry in &doc.frames {
        assert_eq!(entry.detection_count, 1);
        let fresh = entry.frame < 5;
        assert_eq!(entry.telemetry.is_some(), fresh, "frame {}", entry.frame);
        assert_eq!(
            entry.detections[0].geo_coordinates.is_some(),
            fresh,
            "frame {}",
            entry.frame
        );
    }
}

#[test]
fn failing_sink_is_retired_while_others_keep_receiving() {
    let (broken, broken_rec) = recording_sink("broken", Some(2));
    let (healthy, healthy_rec) = recording_sink("healthy", None);
    let source = SyntheticSource::new(8, 8, 30.0).frames(12);

    let report = pipeline::run(
        opener(source),
        person_detector(),
        vec![broken, healthy],
        roomy_settings(),
        ShutdownSignal::new(),
    )
    .unwrap();

    assert_eq!(broken_rec.delivered.lock().unwrap().len(), 2);
    assert_eq!(healthy_rec.delivered.lock().unwrap().len(), 12);
    assert_eq!(broken_rec.shutdowns.load(Ordering::SeqCst), 1);
    let broken_stats = report.dispatch.sinks.iter().find(|s| s.name == "broken").unwrap();
    assert!(broken_stats.failure.is_some());
}

#[test]
fn repeated_shutdown_requests_shut_each_sink_down_once() {
    let (first, first_rec) = recording_sink("first", None);
    let (second, second_rec) = recording_sink("second", None);
    let source = SyntheticSource::new(8, 8, 30.0)
        .paced(true)
        .end_with(EndBehavior::Repeat);

    let handle = pipeline::spawn(
        opener(source),
        person_detector(),
        vec![first, second],
        PipelineSettings::default(),
        ShutdownSignal::new(),
    )
    .unwrap();
    std::thread::sleep(Duration::from_millis(100));
    assert!(handle.request_shutdown());
    assert!(!handle.request_shutdown());
    assert!(!handle.shutdown_signal().trigger(ShutdownCause::EndOfStream));

    let report = handle.join().unwrap();
    assert_eq!(report.cause, Some(ShutdownCause::Requested));
    assert_eq!(first_rec.shutdowns.load(Ordering::SeqCst), 1);
    assert_eq!(second_rec.shutdowns.load(Ordering::SeqCst), 1);
}

#[test]
fn every_sink_sees_strictly_increasing_frames_under_pressure() {
    let (fast, fast_rec) = recording_sink("fast", None);
    let (other, other_rec) = recording_sink("other", None);
    let source = SyntheticSource::new(16, 16, 30.0).frames(200);

    pipeline::run(
        opener(source),
        person_detector(),
        vec![fast, other],
        PipelineSettings {
            poll_interval: Duration::from_millis(5),
            ..PipelineSettings::default()
        },
        ShutdownSignal::new(),
    )
    .unwrap();

    for recorder in [fast_rec, other_rec] {
        let delivered = recorder.delivered.lock().unwrap();
        assert!(!delivered.is_empty());
        assert!(delivered.windows(2).all(|pair| pair[0] < pair[1]), "{delivered:?}");
    }
}

#[test]
fn source_fault_surfaces_as_pipeline_fault() {
    let (sink, recorder) = recording_sink("only", None);
    let source = SyntheticSource::new(8, 8, 30.0).frames(3).fail("link lost");

    let err = pipeline::run(
        opener(source),
        person_detector(),
        vec![sink],
        roomy_settings(),
        ShutdownSignal::new(),
    )
    .unwrap_err();

    assert!(matches!(err, vision::PipelineFault::Source(_)), "{err}");
    assert_eq!(recorder.shutdowns.load(Ordering::SeqCst), 1);
}

#[test]
fn slow_retirement_does_not_hold_up_healthy_sinks() {
    let (broken, broken_rec) = lingering_sink("broken", Some(0), Duration::from_millis(1_500));
    let (healthy, healthy_rec) = recording_sink("healthy", None);
    let source = SyntheticSource::new(8, 8, 30.0).paced(true).frames(15);

    let started = Instant::now();
    let handle = pipeline::spawn(
        opener(source),
        person_detector(),
        vec![broken, healthy],
        roomy_settings(),
        ShutdownSignal::new(),
    )
    .unwrap();
    // 15 paced frames take 500 ms; a blocking retirement would stall them
    while healthy_rec.delivered.lock().unwrap().len() < 15 {
        assert!(
            started.elapsed() < Duration::from_millis(1_200),
            "healthy sink stalled at {:?}",
            healthy_rec.delivered.lock().unwrap()
        );
        std::thread::sleep(Duration::from_millis(5));
    }
    let report = handle.join().unwrap();

    assert!(broken_rec.delivered.lock().unwrap().is_empty());
    assert_eq!(broken_rec.shutdowns.load(Ordering::SeqCst), 1);
    assert_eq!(healthy_rec.shutdowns.load(Ordering::SeqCst), 1);
    let broken_stats = report.dispatch.sinks.iter().find(|s| s.name == "broken").unwrap();
    assert!(broken_stats.failure.is_some());
}

#[test]
fn class_filter_and_skip_frames_shape_what_sinks_see() {
    let (sink, recorder) = recording_sink("filtered", None);
    let source = SyntheticSource::new(16, 8, 30.0).frames(9);
    let mut settings = roomy_settings();
    settings.skip_frames = 2;
    settings.detection.classes = vec!["car".into()];

    let report = pipeline::run(
        opener(source),
        mixed_detector(),
        vec![sink],
        settings,
        ShutdownSignal::new(),
    )
    .unwrap();

    assert_eq!(report.capture.frames_skipped, 6);
    assert_eq!(*recorder.delivered.lock().unwrap(), vec![0, 3, 6]);
    assert_eq!(*recorder.classes.lock().unwrap(), vec!["car", "car", "car"]);
}
