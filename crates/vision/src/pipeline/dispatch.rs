use std::{
    io,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender, unbounded};
use tracing::{debug, error, info, info_span, warn};

use crate::{
    frame::EnrichedFrame,
    pipeline::{
        instrumentation,
        queue::{LeakyReceiver, LeakySender, PopTimeoutError, leaky_queue},
        watchdog::{HealthComponent, PipelineHealth},
    },
    sinks::{Sink, SinkError, SinkKind},
};

/// Failure reported by a sink worker over the dispatcher's error channel.
#[derive(Debug, Clone)]
pub struct SinkFailure {
    pub sink: String,
    pub error: String,
}

/// Per-sink outcome collected when the sink is retired.
#[derive(Debug, Clone, Default)]
pub struct SinkStats {
    pub name: String,
    pub frames_accepted: u64,
    pub frames_dropped: u64,
    /// Set when the sink was retired because `accepts` failed.
    pub failure: Option<String>,
    pub shutdown_error: Option<String>,
}

#[derive(Debug, Default)]
pub struct DispatchReport {
    pub frames_dispatched: u64,
    pub sinks: Vec<SinkStats>,
}

struct SinkWorker {
    name: String,
    kind: SinkKind,
    mailbox: Option<LeakySender<Arc<EnrichedFrame>>>,
    failed: Arc<AtomicBool>,
    dropped: u64,
    handle: Option<JoinHandle<SinkStats>>,
}

impl SinkWorker {
    fn spawn(
        sink: Box<dyn Sink>,
        capacity: usize,
        failures: Sender<SinkFailure>,
    ) -> io::Result<Self> {
        let name = sink.name().to_string();
        let kind = sink.kind();
        let (tx, rx) = leaky_queue(capacity, Duration::ZERO);
        let failed = Arc::new(AtomicBool::new(false));
        let worker_failed = Arc::clone(&failed);
        let handle = instrumentation::spawn_thread(format!("sink-{name}"), move || {
            run_sink(sink, rx, failures, worker_failed)
        })?;
        Ok(Self {
            name,
            kind,
            mailbox: Some(tx),
            failed,
            dropped: 0,
            handle: Some(handle),
        })
    }

    /// Closes the mailbox so the worker drains and shuts its sink down.
    fn close(&mut self) {
        if let Some(mailbox) = self.mailbox.take() {
            self.dropped = mailbox.evicted();
        }
    }

    fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Closes the mailbox and waits for the worker to drain and shut its sink down.
    fn retire(mut self) -> SinkStats {
        self.close();
        let mut stats = match self.handle.take().map(JoinHandle::join) {
            Some(Ok(stats)) => stats,
            Some(Err(_)) => {
                error!(sink = %self.name, "sink worker panicked");
                SinkStats {
                    name: self.name.clone(),
                    failure: Some("worker panicked".into()),
                    ..SinkStats::default()
                }
            }
            None => SinkStats {
                name: self.name.clone(),
                ..SinkStats::default()
            },
        };
        stats.frames_dropped = self.dropped;
        stats
    }
}

fn run_sink(
    mut sink: Box<dyn Sink>,
    mailbox: LeakyReceiver<Arc<EnrichedFrame>>,
    failures: Sender<SinkFailure>,
    failed: Arc<AtomicBool>,
) -> SinkStats {
    let name = sink.name().to_string();
    let span = info_span!("vision.sink", sink = %name);
    let _enter = span.enter();
    let mut stats = SinkStats {
        name: name.clone(),
        ..SinkStats::default()
    };

    while let Some(frame) = mailbox.pop() {
        let started = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| sink.accepts(&frame)))
            .unwrap_or_else(|_| Err(SinkError::Unrecoverable("sink panicked".into())));
        match outcome {
            Ok(()) => {
                stats.frames_accepted += 1;
                metrics::counter!("vision_sink_frames_total", "sink" => name.clone()).increment(1);
                metrics::histogram!("vision_stage_latency_seconds", "stage" => name.clone())
                    .record(started.elapsed().as_secs_f64());
            }
            Err(err) => {
                warn!(frame = frame.index(), "sink failed, removing it: {err}");
                metrics::counter!("vision_sink_errors_total", "sink" => name.clone()).increment(1);
                stats.failure = Some(err.to_string());
                failed.store(true, Ordering::SeqCst);
                let _ = failures.send(SinkFailure {
                    sink: name.clone(),
                    error: err.to_string(),
                });
                break;
            }
        }
    }
    drop(mailbox);

    let shutdown = panic::catch_unwind(AssertUnwindSafe(|| sink.shutdown()))
        .unwrap_or_else(|_| Err(SinkError::Unrecoverable("sink panicked on shutdown".into())));
    if let Err(err) = shutdown {
        warn!("sink shutdown failed: {err}");
        stats.shutdown_error = Some(err.to_string());
    }
    debug!(accepted = stats.frames_accepted, "sink stopped");
    stats
}

/// Fans enriched frames out to every active sink.
///
/// The registry is owned by the dispatch thread; failed sinks are removed at
/// the start of the next dispatch cycle. A removed sink shuts down on its own
/// worker thread and is only joined once that thread has finished, or when the
/// dispatcher itself shuts down.
pub struct Dispatcher {
    workers: Vec<SinkWorker>,
    retiring: Vec<SinkWorker>,
    failures_tx: Sender<SinkFailure>,
    failures_rx: Receiver<SinkFailure>,
    mailbox_capacity: usize,
    last_index: Option<u64>,
    frames_dispatched: u64,
    retired: Vec<SinkStats>,
}

impl Dispatcher {
    pub fn new(mailbox_capacity: usize) -> Self {
        let (failures_tx, failures_rx) = unbounded();
        Self {
            workers: Vec::new(),
            retiring: Vec::new(),
            failures_tx,
            failures_rx,
            mailbox_capacity: mailbox_capacity.max(1),
            last_index: None,
            frames_dispatched: 0,
            retired: Vec::new(),
        }
    }

    /// Starts a worker for `sink` and adds it to the active registry.
    pub fn register(&mut self, sink: Box<dyn Sink>) -> io::Result<()> {
        let worker = SinkWorker::spawn(sink, self.mailbox_capacity, self.failures_tx.clone())?;
        info!(sink = %worker.name, kind = ?worker.kind, "sink registered");
        self.workers.push(worker);
        Ok(())
    }

    pub fn active_sinks(&self) -> Vec<&str> {
        self.workers.iter().map(|w| w.name.as_str()).collect()
    }

    pub fn has_metadata_sink(&self) -> bool {
        self.workers.iter().any(|w| w.kind == SinkKind::Metadata)
    }

    /// Removes every sink that reported a failure; returns how many were removed.
    pub fn reap_failed(&mut self) -> usize {
        for failure in self.failures_rx.try_iter() {
            debug!(sink = %failure.sink, error = %failure.error, "sink failure reported");
        }
        let (failed, active): (Vec<_>, Vec<_>) = std::mem::take(&mut self.workers)
            .into_iter()
            .partition(|w| w.failed.load(Ordering::SeqCst));
        self.workers = active;
        let removed = failed.len();
        for mut worker in failed {
            warn!(sink = %worker.name, "sink removed from active registry");
            worker.close();
            self.retiring.push(worker);
        }

        let (finished, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.retiring)
            .into_iter()
            .partition(SinkWorker::is_finished);
        self.retiring = pending;
        self.retired.extend(finished.into_iter().map(SinkWorker::retire));
        removed
    }

    /// Delivers one frame to every active sink.
    pub fn dispatch(&mut self, frame: EnrichedFrame) {
        self.reap_failed();
        let index = frame.index();
        if self.last_index.is_some_and(|last| index <= last) {
            warn!(frame = index, "out-of-order frame reached dispatch; dropping it");
            return;
        }
        self.last_index = Some(index);
        self.frames_dispatched += 1;

        let frame = Arc::new(frame);
        for worker in &mut self.workers {
            let Some(mailbox) = worker.mailbox.as_ref() else {
                continue;
            };
            match mailbox.push(Arc::clone(&frame)) {
                Ok(Some(evicted)) => {
                    metrics::counter!("vision_frames_dropped_total", "queue" => worker.name.clone())
                        .increment(1);
                    debug!(
                        sink = %worker.name,
                        frame = evicted.index(),
                        "sink behind; dropped oldest frame"
                    );
                }
                Ok(None) => {}
                // worker exited; it is reaped next cycle
                Err(_) => {}
            }
        }
    }

    /// Drains and shuts down every sink, each exactly once.
    pub fn shutdown(mut self) -> DispatchReport {
        self.reap_failed();
        let mut sinks = std::mem::take(&mut self.retired);
        let remaining = std::mem::take(&mut self.retiring)
            .into_iter()
            .chain(std::mem::take(&mut self.workers));
        for worker in remaining {
            sinks.push(worker.retire());
        }
        info!(
            frames = self.frames_dispatched,
            sinks = sinks.len(),
            "dispatcher stopped"
        );
        DispatchReport {
            frames_dispatched: self.frames_dispatched,
            sinks,
        }
    }
}

pub(crate) fn run_dispatch(
    mut dispatcher: Dispatcher,
    input: LeakyReceiver<EnrichedFrame>,
    health: Arc<PipelineHealth>,
    poll_interval: Duration,
) -> DispatchReport {
    let span = info_span!("vision.dispatch");
    let _enter = span.enter();
    if !dispatcher.has_metadata_sink() {
        debug!("no metadata sink configured");
    }
    loop {
        match input.pop_timeout(poll_interval) {
            Ok(frame) => {
                let started = Instant::now();
                dispatcher.dispatch(frame);
                metrics::histogram!("vision_stage_latency_seconds", "stage" => "dispatch")
                    .record(started.elapsed().as_secs_f64());
            }
            Err(PopTimeoutError::Timeout) => {
                dispatcher.reap_failed();
            }
            Err(PopTimeoutError::Closed) => break,
        }
        health.beat(HealthComponent::Dispatch);
    }
    dispatcher.shutdown()
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::AtomicUsize,
    };

    use chrono::Utc;
    use video_ingest::{Frame, FrameFormat};

    use super::*;
    use crate::frame::FrameRecord;

    #[derive(Default)]
    struct Log {
        seen: Mutex<Vec<u64>>,
        accepts: AtomicUsize,
        shutdowns: AtomicUsize,
    }

    struct TestSink {
        name: &'static str,
        fail: bool,
        delay: Duration,
        linger: Duration,
        log: Arc<Log>,
    }

    impl TestSink {
        fn new(name: &'static str, log: &Arc<Log>) -> Box<Self> {
            Box::new(Self {
                name,
                fail: false,
                delay: Duration::ZERO,
                linger: Duration::ZERO,
                log: Arc::clone(log),
            })
        }
    }

    impl Sink for TestSink {
        fn name(&self) -> &str {
            self.name
        }

        fn kind(&self) -> SinkKind {
            SinkKind::Metadata
        }

        fn accepts(&mut self, frame: &EnrichedFrame) -> Result<(), SinkError> {
            self.log.accepts.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            if self.fail {
                return Err(SinkError::Closed("peer went away".into()));
            }
            self.log.seen.lock().unwrap().push(frame.index());
            Ok(())
        }

        fn shutdown(&mut self) -> Result<(), SinkError> {
            std::thread::sleep(self.linger);
            self.log.shutdowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn frame(index: u64) -> EnrichedFrame {
        EnrichedFrame {
            record: FrameRecord {
                index,
                image: Frame {
                    data: vec![0; 12],
                    width: 2,
                    height: 2,
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

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not met in time");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn failing_sink_is_removed_within_one_cycle() {
        let bad_log = Arc::new(Log::default());
        let good_log = Arc::new(Log::default());
        let mut bad = TestSink::new("bad", &bad_log);
        bad.fail = true;

        let mut dispatcher = Dispatcher::new(4);
        dispatcher.register(bad).unwrap();
        dispatcher.register(TestSink::new("good", &good_log)).unwrap();

        dispatcher.dispatch(frame(0));
        wait_until(|| bad_log.accepts.load(Ordering::SeqCst) == 1);
        wait_until(|| bad_log.shutdowns.load(Ordering::SeqCst) == 1);

        dispatcher.dispatch(frame(1));
        assert_eq!(dispatcher.active_sinks(), vec!["good"]);
        dispatcher.dispatch(frame(2));

        let report = dispatcher.shutdown();
        assert_eq!(*good_log.seen.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(bad_log.accepts.load(Ordering::SeqCst), 1);
        assert_eq!(bad_log.shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(good_log.shutdowns.load(Ordering::SeqCst), 1);
        let bad_stats = report.sinks.iter().find(|s| s.name == "bad").unwrap();
        assert!(bad_stats.failure.is_some());
    }

    #[test]
    fn lingering_shutdown_of_a_failed_sink_does_not_block_dispatch() {
        let bad_log = Arc::new(Log::default());
        let good_log = Arc::new(Log::default());
        let mut bad = TestSink::new("bad", &bad_log);
        bad.fail = true;
        bad.linger = Duration::from_millis(500);

        let mut dispatcher = Dispatcher::new(8);
        dispatcher.register(bad).unwrap();
        dispatcher.register(TestSink::new("good", &good_log)).unwrap();

        dispatcher.dispatch(frame(0));
        wait_until(|| bad_log.accepts.load(Ordering::SeqCst) == 1);

        let started = Instant::now();
        for idx in 1..5 {
            dispatcher.dispatch(frame(idx));
        }
        assert!(
            started.elapsed() < Duration::from_millis(200),
            "dispatch blocked for {:?}",
            started.elapsed()
        );
        assert_eq!(dispatcher.active_sinks(), vec!["good"]);
        wait_until(|| good_log.seen.lock().unwrap().len() == 5);
        assert_eq!(bad_log.shutdowns.load(Ordering::SeqCst), 0);

        let report = dispatcher.shutdown();
        assert_eq!(bad_log.shutdowns.load(Ordering::SeqCst), 1);
        let bad_stats = report.sinks.iter().find(|s| s.name == "bad").unwrap();
        assert!(bad_stats.failure.is_some());
    }

    #[test]
    fn slow_sink_drops_frames_without_blocking_others() {
        let slow_log = Arc::new(Log::default());
        let fast_log = Arc::new(Log::default());
        let mut slow = TestSink::new("slow", &slow_log);
        slow.delay = Duration::from_millis(30);

        let mut dispatcher = Dispatcher::new(1);
        dispatcher.register(slow).unwrap();
        dispatcher.register(TestSink::new("fast", &fast_log)).unwrap();

        let started = Instant::now();
        for idx in 0..20 {
            dispatcher.dispatch(frame(idx));
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(started.elapsed() < Duration::from_millis(300));
        wait_until(|| fast_log.seen.lock().unwrap().last() == Some(&19));

        let report = dispatcher.shutdown();
        let slow_seen = slow_log.seen.lock().unwrap().clone();
        assert!(slow_seen.len() < 20);
        assert!(slow_seen.windows(2).all(|w| w[0] < w[1]));
        let slow_stats = report.sinks.iter().find(|s| s.name == "slow").unwrap();
        assert!(slow_stats.frames_dropped > 0);
    }

    #[test]
    fn out_of_order_frames_are_not_delivered() {
        let log = Arc::new(Log::default());
        let mut dispatcher = Dispatcher::new(8);
        dispatcher.register(TestSink::new("only", &log)).unwrap();
        dispatcher.dispatch(frame(5));
        dispatcher.dispatch(frame(3));
        dispatcher.dispatch(frame(5));
        dispatcher.dispatch(frame(9));
        dispatcher.shutdown();
        assert_eq!(*log.seen.lock().unwrap(), vec![5, 9]);
    }

    #[test]
    fn shutdown_drains_pending_frames_first() {
        let log = Arc::new(Log::default());
        let mut sink = TestSink::new("only", &log);
        sink.delay = Duration::from_millis(5);
        let mut dispatcher = Dispatcher::new(8);
        dispatcher.register(sink).unwrap();
        for idx in 0..5 {
            dispatcher.dispatch(frame(idx));
        }
        dispatcher.shutdown();
        assert_eq!(*log.seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(log.shutdowns.load(Ordering::SeqCst), 1);
    }
}
