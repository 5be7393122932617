//! Tracing subscribers, Prometheus metrics and dispatcher-aware thread spawning.

use std::{
    io,
    path::{Path, PathBuf},
    sync::OnceLock,
    thread,
    time::Duration,
};

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::warn;
use tracing_subscriber::{
    filter::{EnvFilter, filter_fn},
    fmt,
    prelude::*,
};

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

const UPKEEP_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, Default)]
/// Logging and tracing knobs.
pub struct InstrumentationOptions {
    /// Write a Chrome trace JSON file capturing pipeline spans.
    pub chrome_trace_path: Option<PathBuf>,
    /// Default to `debug` output when `RUST_LOG` is unset.
    pub verbose: bool,
}

/// Keeps the Chrome trace writer alive; flushes on drop.
pub struct InstrumentationGuard {
    _chrome_guard: Option<tracing_chrome::FlushGuard>,
}

/// Installs the global Prometheus recorder once and returns its handle.
pub fn init_metrics_recorder() -> &'static PrometheusHandle {
    PROM_HANDLE.get_or_init(|| {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        if let Err(err) = metrics::set_global_recorder(recorder) {
            warn!("metrics recorder already installed: {err}");
        }
        describe_metrics();

        let upkeep_handle = handle.clone();
        let upkeep = spawn_thread("prometheus-upkeep", move || {
            loop {
                thread::sleep(UPKEEP_INTERVAL);
                upkeep_handle.run_upkeep();
            }
        });
        if let Err(err) = upkeep {
            warn!("failed to spawn prometheus upkeep thread: {err}");
        }

        handle
    })
}

/// The Prometheus handle, if [`init_metrics_recorder`] ran.
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROM_HANDLE.get()
}

fn describe_metrics() {
    metrics::describe_counter!("vision_frames_captured_total", "Frames read from the source");
    metrics::describe_counter!(
        "vision_frames_dropped_total",
        "Frames evicted from a full queue or mailbox"
    );
    metrics::describe_gauge!("vision_queue_depth", "Items waiting in a stage queue");
    metrics::describe_histogram!(
        "vision_stage_latency_seconds",
        metrics::Unit::Seconds,
        "Time spent per frame in a stage"
    );
    metrics::describe_counter!(
        "vision_telemetry_packets_total",
        "KLV packets seen, by decode result"
    );
    metrics::describe_counter!("vision_detection_errors_total", "Detector failures by kind");
    metrics::describe_counter!("vision_sink_errors_total", "Sink failures by sink");
    metrics::describe_counter!("vision_sink_frames_total", "Frames accepted by each sink");
    metrics::describe_counter!("vision_cot_events_total", "CoT events by send result");
    metrics::describe_counter!("vision_stage_stalls_total", "Watchdog stall reports");
}

/// Installs the process-wide tracing subscriber.
///
/// `RUST_LOG` overrides the default `info` (or `debug` when verbose) filter.
pub fn init_tracing(opts: &InstrumentationOptions) -> InstrumentationGuard {
    let default_level = if opts.verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let (chrome_layer, chrome_guard) = match opts.chrome_trace_path.as_deref() {
        Some(path) => match build_chrome_layer(path) {
            Ok((layer, guard)) => (Some(layer), Some(guard)),
            Err(err) => {
                eprintln!(
                    "failed to initialise chrome trace writer at {}: {err}",
                    path.display()
                );
                (None, None)
            }
        },
        None => (None, None),
    };

    let subscriber = tracing_subscriber::registry()
        .with(chrome_layer.map(|layer| layer.with_filter(filter_fn(|meta| meta.is_span()))))
        .with(
            fmt::layer()
                .with_writer(io::stderr)
                .with_target(false)
                .with_timer(fmt::time::uptime())
                .with_filter(env_filter),
        )
        .with(tracing_error::ErrorLayer::default());

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        warn!("global tracing subscriber already installed; keeping it");
    }

    InstrumentationGuard {
        _chrome_guard: chrome_guard,
    }
}

/// Spawns a named thread that inherits the current tracing dispatcher.
pub fn spawn_thread<F, T>(name: impl Into<String>, f: F) -> io::Result<thread::JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let dispatch = tracing::dispatcher::get_default(|current| current.clone());
    thread::Builder::new()
        .name(name.into())
        .spawn(move || tracing::dispatcher::with_default(&dispatch, f))
}

fn build_chrome_layer(
    path: &Path,
) -> io::Result<(
    tracing_chrome::ChromeLayer<tracing_subscriber::Registry>,
    tracing_chrome::FlushGuard,
)> {
    let file = std::fs::File::create(path)?;
    let (layer, guard) = tracing_chrome::ChromeLayerBuilder::new()
        .writer(file)
        .include_args(true)
        .trace_style(tracing_chrome::TraceStyle::Threaded)
        .build();
    Ok((layer, guard))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawned_threads_inherit_the_scoped_subscriber() {
        let subscriber = tracing_subscriber::registry();
        let _guard = tracing::subscriber::set_default(subscriber);
        let inherited = spawn_thread("inherit-check", || {
            tracing::dispatcher::get_default(|current| {
                current.is::<tracing_subscriber::Registry>()
            })
        })
        .unwrap()
        .join()
        .unwrap();
        assert!(inherited);
    }
}
