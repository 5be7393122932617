//! Builds the source, detector and sinks from a validated [`VisionConfig`] and
//! drives the pipeline until the stream ends, a fault occurs, or Ctrl+C.

use std::{fs, path::Path, sync::Once};

use anyhow::{Context, Result, bail};
use ml_core::{ObjectDetector, StubDetector};
use tracing::{error, info, warn};
use video_ingest::{FfmpegSource, FfmpegSourceOptions, MediaSource};
use vision::{
    PipelineFault, ShutdownCause, ShutdownSignal, Sink,
    pipeline::{
        self, DetectorFactory, DetectorKind, DetectorSettings, SinkSettings, SourceOpener,
        SourceSettings, VisionConfig, instrumentation,
    },
    sinks::{
        ArchiveOptions, ArchiveSink, BroadcastOptions, BrowserOptions, BrowserSink, CotForwarder,
        CotOptions, MetadataBroadcaster, MetadataLog, MetadataLogOptions, StreamOptions,
        StreamSink, browser::DEFAULT_HISTORY, cot::connect_transport,
    },
};

pub fn run(config: VisionConfig) -> Result<()> {
    let _guard = instrumentation::init_tracing(&config.instrumentation);
    instrumentation::init_metrics_recorder();
    info!(
        source = %config.source.uri,
        kind = config.source.kind.label(),
        detector = ?config.detector.kind,
        "starting overwatch"
    );

    let shutdown = ShutdownSignal::new();
    install_ctrlc_handler(shutdown.clone());

    let sinks = build_sinks(&config.sinks, config.source.fps)?;
    let factory = detector_factory(
        &config.detector,
        config.pipeline.detection.confidence_threshold,
    )?;
    let opener = source_opener(&config.source);

    match pipeline::run(opener, factory, sinks, config.pipeline, shutdown) {
        Ok(report) => {
            let cause = report
                .cause
                .map_or_else(|| "unknown".to_string(), |cause| cause.to_string());
            info!(
                cause = %cause,
                frames = report.capture.frames_captured,
                dropped = report.capture.frames_dropped + report.inference.frames_dropped,
                "overwatch stopped"
            );
            Ok(())
        }
        Err(fault) => {
            error!("overwatch stopped on a fault: {fault}");
            Err(fault.into())
        }
    }
}

fn install_ctrlc_handler(shutdown: ShutdownSignal) {
    static CTRL_HANDLER: Once = Once::new();
    CTRL_HANDLER.call_once(move || {
        if let Err(err) = ctrlc::set_handler(move || {
            if shutdown.trigger(ShutdownCause::Requested) {
                info!("shutdown requested; draining pipeline");
            }
        }) {
            warn!("failed to install Ctrl+C handler: {err}");
        }
    });
}

fn source_opener(settings: &SourceSettings) -> SourceOpener {
    let options = FfmpegSourceOptions {
        uri: settings.uri.clone(),
        width: settings.width,
        height: settings.height,
        fps: settings.fps,
        realtime: settings.realtime && !settings.kind.is_live(),
        read_metadata: settings.read_metadata,
        use_nvdec: settings.use_nvdec,
    };
    Box::new(move || {
        FfmpegSource::open(options).map(|source| Box::new(source) as Box<dyn MediaSource>)
    })
}

fn read_labels(path: &Path) -> Result<Vec<String>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read labels from {}", path.display()))?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

fn detector_factory(settings: &DetectorSettings, threshold: f32) -> Result<DetectorFactory> {
    let labels = match &settings.labels_path {
        Some(path) => read_labels(path)?,
        None => Vec::new(),
    };
    match settings.kind {
        DetectorKind::Stub => {
            info!("no model configured; running with the stub detector");
            Ok(Box::new(|| Ok(Box::new(StubDetector::default()) as Box<dyn ObjectDetector>)))
        }
        DetectorKind::Torchscript => torch_factory(settings, labels, threshold),
    }
}

#[cfg(feature = "with-tch")]
fn torch_factory(
    settings: &DetectorSettings,
    labels: Vec<String>,
    threshold: f32,
) -> Result<DetectorFactory> {
    use ml_core::{detector::TorchDetector, tch::Device};
    use vision::pipeline::DeviceSelection;

    let Some(model_path) = settings.model_path.clone() else {
        bail!("--detector torchscript requires --model <path>");
    };
    let device = match settings.device {
        DeviceSelection::Auto => Device::cuda_if_available(),
        DeviceSelection::Cpu => Device::Cpu,
        DeviceSelection::Cuda(index) => Device::Cuda(index),
    };
    let size = i64::from(settings.input_size);
    Ok(Box::new(move || {
        let detector = TorchDetector::load(&model_path, device, (size, size), labels)?
            .with_confidence_threshold(threshold);
        Ok(Box::new(detector) as Box<dyn ObjectDetector>)
    }))
}

#[cfg(not(feature = "with-tch"))]
fn torch_factory(
    _settings: &DetectorSettings,
    _labels: Vec<String>,
    _threshold: f32,
) -> Result<DetectorFactory> {
    bail!("TorchScript detection needs a build with the `with-tch` feature")
}

/// Starts every configured sink. A sink that cannot start aborts the run
/// before any stage thread exists.
pub(crate) fn build_sinks(settings: &SinkSettings, fps: f64) -> Result<Vec<Box<dyn Sink>>> {
    let mut sinks: Vec<Box<dyn Sink>> = Vec::new();

    if let Some(url) = &settings.stream_url {
        sinks.push(Box::new(StreamSink::new(StreamOptions {
            url: url.clone(),
            fps,
            overlay: settings.overlay,
        })));
    }
    if let Some(archive) = &settings.archive {
        let sink = ArchiveSink::new(ArchiveOptions {
            directory: archive.directory.clone(),
            stem: None,
            fps,
            record_video: archive.record_video,
            overlay: settings.overlay,
            save_crops: archive.save_crops,
        })
        .context("failed to prepare archive directory")?;
        info!(path = %sink.json_path().display(), "archiving detections");
        sinks.push(Box::new(sink));
    }
    if let Some(bind) = settings.browser {
        let sink = BrowserSink::start(BrowserOptions {
            bind,
            jpeg_quality: settings.jpeg_quality,
            history: DEFAULT_HISTORY,
            overlay: settings.overlay,
        })
        .with_context(|| format!("failed to start browser preview on {bind}"))?;
        sinks.push(Box::new(sink));
    }
    if !settings.metadata_targets.is_empty() {
        let sink = MetadataBroadcaster::new(BroadcastOptions {
            targets: settings.metadata_targets.clone(),
        })
        .context("failed to open metadata socket")?;
        sinks.push(Box::new(sink));
    }
    if let Some(path) = &settings.metadata_log {
        let sink = MetadataLog::new(MetadataLogOptions {
            path: path.clone(),
            interval: settings.metadata_interval,
        })
        .with_context(|| format!("failed to open metadata log {}", path.display()))?;
        sinks.push(Box::new(sink));
    }
    if let Some(cot) = &settings.cot {
        let transport = connect_transport(cot.protocol, &cot.host, cot.port)
            .with_context(|| format!("failed to set up CoT transport to {}", cot.host))?;
        let options = CotOptions {
            min_confidence: cot.min_confidence,
            stale_after: cot.stale_after,
            ..CotOptions::default()
        };
        sinks.push(Box::new(CotForwarder::new(transport, options)));
    }

    if sinks.is_empty() {
        warn!("no sinks configured; detections will be discarded");
    }
    Ok(sinks)
}

/// Maps a pipeline outcome to a process exit code.
pub fn exit_code(result: &Result<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(err) => match err.downcast_ref::<PipelineFault>() {
            Some(PipelineFault::Source(_)) => 2,
            Some(PipelineFault::Detection(_)) => 3,
            _ => 1,
        },
    }
}
