//! Configuration parsing for the vision pipeline.
//!
//! This module owns translation of CLI arguments into a `VisionConfig` struct
//! which the binary uses to build the source, the detector and the sinks
//! without re-parsing flags. Everything is validated before a thread starts.

use std::{
    net::{IpAddr, SocketAddr, ToSocketAddrs},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, ValueEnum};
use geolocate::SensorOptics;
use video_ingest::SourceKind;

use crate::{
    pipeline::{DetectionPolicy, PipelineSettings, instrumentation::InstrumentationOptions},
    sinks::CotProtocol,
};

/// UDP listener that receives frame metadata when no `--metadata-udp` is given.
pub const DEFAULT_METADATA_TARGET: &str = "127.0.0.1:5005";

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum DetectorKind {
    /// Never detects anything; exercises transports and telemetry.
    Stub,
    /// TorchScript YOLO-style export, needs the `with-tch` build.
    Torchscript,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceSelection {
    Auto,
    Cpu,
    Cuda(usize),
}

impl FromStr for DeviceSelection {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "auto" => Ok(DeviceSelection::Auto),
            "cpu" => Ok(DeviceSelection::Cpu),
            "cuda" | "gpu" => Ok(DeviceSelection::Cuda(0)),
            other => match other.strip_prefix("cuda:") {
                Some(index) => index
                    .parse()
                    .map(DeviceSelection::Cuda)
                    .map_err(|_| anyhow!("invalid CUDA ordinal in --device {value}")),
                None => bail!("--device must be auto, cpu, cuda or cuda:N (got {value})"),
            },
        }
    }
}

#[derive(Clone, Debug)]
pub struct SourceSettings {
    pub uri: String,
    pub kind: SourceKind,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub realtime: bool,
    pub read_metadata: bool,
    pub use_nvdec: bool,
}

#[derive(Clone, Debug)]
pub struct DetectorSettings {
    pub kind: DetectorKind,
    pub model_path: Option<PathBuf>,
    pub labels_path: Option<PathBuf>,
    /// Square network input size in pixels.
    pub input_size: u32,
    pub device: DeviceSelection,
}

#[derive(Clone, Debug)]
pub struct ArchiveSettings {
    pub directory: PathBuf,
    pub record_video: bool,
    pub save_crops: bool,
}

#[derive(Clone, Debug)]
pub struct CotSettings {
    pub host: String,
    pub port: u16,
    pub protocol: CotProtocol,
    pub min_confidence: f32,
    pub stale_after: Duration,
}

/// Which sinks to start and where they deliver.
///
/// The metadata broadcaster always runs: `metadata_targets` is never empty
/// after validation.
#[derive(Clone, Debug, Default)]
pub struct SinkSettings {
    pub stream_url: Option<String>,
    pub archive: Option<ArchiveSettings>,
    pub browser: Option<SocketAddr>,
    pub metadata_targets: Vec<SocketAddr>,
    pub metadata_log: Option<PathBuf>,
    /// Frames between metadata log lines.
    pub metadata_interval: u64,
    pub cot: Option<CotSettings>,
    pub jpeg_quality: u8,
    /// Draw detections and the HUD onto rendered video.
    pub overlay: bool,
}

#[derive(Clone, Debug)]
/// Canonical configuration shared by every stage in the pipeline.
pub struct VisionConfig {
    pub source: SourceSettings,
    pub detector: DetectorSettings,
    pub pipeline: PipelineSettings,
    pub sinks: SinkSettings,
    pub instrumentation: InstrumentationOptions,
}

/// CLI arguments accepted by the `run` subcommand.
#[derive(Debug, Args)]
pub struct VisionCliArgs {
    /// Video file path or stream URL (rtsp://, srt://, udp://, http://).
    #[arg(value_name = "SOURCE")]
    pub source: Option<String>,
    /// Source flag (overrides positional).
    #[arg(long = "source", value_name = "URI")]
    pub source_flag: Option<String>,
    /// Capture width in pixels.
    #[arg(long, value_name = "PX", default_value_t = 1280)]
    pub width: u32,
    /// Capture height in pixels.
    #[arg(long, value_name = "PX", default_value_t = 720)]
    pub height: u32,
    /// Nominal source frame rate; also paces the stream sink.
    #[arg(long, value_name = "FPS", default_value_t = 30.0)]
    pub fps: f64,
    /// Read files as fast as they decode instead of at their native rate.
    #[arg(long = "no-realtime", action = clap::ArgAction::SetTrue)]
    pub no_realtime: bool,
    /// Ignore any KLV data track in the source.
    #[arg(long = "no-klv", action = clap::ArgAction::SetTrue)]
    pub no_klv: bool,
    /// Attempt NVDEC decoding when supported.
    #[arg(long = "nvdec", action = clap::ArgAction::SetTrue)]
    pub use_nvdec: bool,

    /// Detector implementation; defaults to torchscript when --model is given.
    #[arg(long, value_enum)]
    pub detector: Option<DetectorKind>,
    /// TorchScript model path.
    #[arg(long = "model", value_name = "PATH")]
    pub model_path: Option<PathBuf>,
    /// Class label file, one name per line.
    #[arg(long = "labels", value_name = "PATH")]
    pub labels_path: Option<PathBuf>,
    /// Detector input size in pixels (square).
    #[arg(long = "detector-size", value_name = "PX", default_value_t = 640)]
    pub detector_size: u32,
    /// Minimum detection confidence (0-1).
    #[arg(long, value_name = "SCORE", default_value_t = 0.25)]
    pub confidence: f32,
    /// Inference device: auto, cpu, cuda or cuda:N.
    #[arg(long, value_name = "DEVICE", default_value = "auto")]
    pub device: String,
    /// Keep only these classes, by detector label (e.g. person car).
    #[arg(long, value_name = "CLASS", num_args = 1.., value_delimiter = ',')]
    pub classes: Vec<String>,
    /// Frames to leave out after each processed one (0 processes all).
    #[arg(long = "skip-frames", value_name = "N", default_value_t = 0)]
    pub skip_frames: u32,
    /// Camera sensor width for geolocation; needs the height and focal length too.
    #[arg(long = "sensor-width-mm", value_name = "MM", requires = "sensor_height_mm")]
    pub sensor_width_mm: Option<f64>,
    #[arg(long = "sensor-height-mm", value_name = "MM", requires = "focal_length_mm")]
    pub sensor_height_mm: Option<f64>,
    #[arg(long = "focal-length-mm", value_name = "MM", requires = "sensor_width_mm")]
    pub focal_length_mm: Option<f64>,

    /// Slots in each inter-stage queue.
    #[arg(long = "queue-capacity", value_name = "N", default_value_t = 2)]
    pub queue_capacity: usize,
    /// How long capture waits for inference before dropping the oldest frame.
    #[arg(long = "inference-grace-ms", value_name = "MS", default_value_t = 0)]
    pub inference_grace_ms: u64,
    /// Slots in each sink's mailbox.
    #[arg(long = "sink-mailbox", value_name = "N", default_value_t = 2)]
    pub sink_mailbox: usize,
    /// Telemetry older than this (source clock) is treated as absent; 0 keeps it forever.
    #[arg(long = "telemetry-max-age-ms", value_name = "MS", default_value_t = 2_000)]
    pub telemetry_max_age_ms: u64,

    /// Push annotated video to this URL (rtsp://, rtmp://, srt://, udp://).
    #[arg(long = "stream-url", value_name = "URL")]
    pub stream_url: Option<String>,
    /// Write the detection archive (and optionally video) into this directory.
    #[arg(long = "archive-dir", value_name = "DIR")]
    pub archive_dir: Option<PathBuf>,
    /// Also record an annotated MP4 into the archive directory.
    #[arg(long = "archive-video", action = clap::ArgAction::SetTrue, requires = "archive_dir")]
    pub archive_video: bool,
    /// Save a JPEG crop of every detection into the archive directory.
    #[arg(
        long = "save-detection-images",
        action = clap::ArgAction::SetTrue,
        requires = "archive_dir"
    )]
    pub save_detection_images: bool,
    /// Leave boxes and the HUD off rendered video.
    #[arg(long = "no-overlay", action = clap::ArgAction::SetTrue)]
    pub no_overlay: bool,
    /// Serve the browser preview on this port.
    #[arg(long = "browser-port", value_name = "PORT")]
    pub browser_port: Option<u16>,
    /// Address the browser preview binds to.
    #[arg(long = "browser-bind", value_name = "IP", default_value = "0.0.0.0")]
    pub browser_bind: IpAddr,
    /// UDP listener for per-frame metadata (repeatable, host:port); defaults to 127.0.0.1:5005.
    #[arg(long = "metadata-udp", value_name = "HOST:PORT")]
    pub metadata_udp: Vec<String>,
    /// Append per-frame metadata as JSON lines to this file.
    #[arg(long = "metadata-log", value_name = "PATH")]
    pub metadata_log: Option<PathBuf>,
    /// Write a metadata log line every N frames.
    #[arg(long = "metadata-interval", value_name = "N", default_value_t = 1)]
    pub metadata_interval: u64,
    /// Forward geolocated detections as CoT events to this host.
    #[arg(long = "cot-host", value_name = "HOST")]
    pub cot_host: Option<String>,
    #[arg(long = "cot-port", value_name = "PORT", default_value_t = 8087)]
    pub cot_port: u16,
    #[arg(long = "cot-protocol", value_enum, default_value_t = CotProtocol::Tcp)]
    pub cot_protocol: CotProtocol,
    /// Minimum confidence for a detection to be forwarded as CoT.
    #[arg(long = "cot-min-confidence", value_name = "SCORE", default_value_t = 0.5)]
    pub cot_min_confidence: f32,
    /// Seconds until a CoT event goes stale.
    #[arg(long = "cot-stale-secs", value_name = "SECS", default_value_t = 600)]
    pub cot_stale_secs: u64,
    /// JPEG quality for the browser preview (1-100).
    #[arg(long = "jpeg-quality", value_name = "QUALITY", default_value_t = 85)]
    pub jpeg_quality: u8,

    /// Enable verbose logging (frame drops, detections).
    #[arg(long = "verbose", action = clap::ArgAction::SetTrue)]
    pub verbose: bool,
    /// Emit Chrome trace JSON for post-mortem analysis.
    #[arg(long = "chrome-trace", value_name = "PATH")]
    pub chrome_trace: Option<PathBuf>,
}

fn resolve_target(target: &str) -> Result<SocketAddr> {
    target
        .to_socket_addrs()
        .with_context(|| format!("invalid metadata target {target}"))?
        .next()
        .ok_or_else(|| anyhow!("metadata target {target} did not resolve"))
}

fn unit_interval(value: f32, flag: &str) -> Result<f32> {
    if !(0.0..=1.0).contains(&value) {
        bail!("{flag} must be between 0 and 1 (got {value})");
    }
    Ok(value)
}

impl TryFrom<VisionCliArgs> for VisionConfig {
    type Error = anyhow::Error;

    fn try_from(args: VisionCliArgs) -> Result<Self> {
        let uri = args.source_flag.or(args.source).ok_or_else(|| {
            anyhow!("Missing source. Provide --source <uri> or positional <source>.")
        })?;
        if args.width == 0 || args.height == 0 {
            bail!("Capture width and height must be positive integers");
        }
        if !args.fps.is_finite() || args.fps <= 0.0 {
            bail!("--fps must be a positive number");
        }

        let kind = match args.detector {
            Some(kind) => kind,
            None if args.model_path.is_some() => DetectorKind::Torchscript,
            None => DetectorKind::Stub,
        };
        if kind == DetectorKind::Torchscript && args.model_path.is_none() {
            bail!("--detector torchscript requires --model <path>");
        }
        if args.detector_size == 0 || args.detector_size % 32 != 0 {
            bail!("--detector-size must be a positive multiple of 32");
        }
        let confidence_threshold = unit_interval(args.confidence, "--confidence")?;
        let device = args.device.parse()?;

        if args.queue_capacity == 0 {
            bail!("--queue-capacity must be at least 1");
        }
        if args.sink_mailbox == 0 {
            bail!("--sink-mailbox must be at least 1");
        }
        if args.metadata_interval == 0 {
            bail!("--metadata-interval must be at least 1");
        }
        if !(1..=100).contains(&args.jpeg_quality) {
            bail!("--jpeg-quality must be an integer between 1 and 100");
        }

        let mut metadata_targets = args
            .metadata_udp
            .iter()
            .map(|target| resolve_target(target))
            .collect::<Result<Vec<_>>>()?;

        let cot = match args.cot_host {
            Some(host) => {
                if args.cot_port == 0 {
                    bail!("--cot-port must be non-zero");
                }
                Some(CotSettings {
                    host,
                    port: args.cot_port,
                    protocol: args.cot_protocol,
                    min_confidence: unit_interval(args.cot_min_confidence, "--cot-min-confidence")?,
                    stale_after: Duration::from_secs(args.cot_stale_secs.max(1)),
                })
            }
            None => None,
        };

        if metadata_targets.is_empty() {
            metadata_targets.push(resolve_target(DEFAULT_METADATA_TARGET)?);
        }

        let optics = match (args.sensor_width_mm, args.sensor_height_mm, args.focal_length_mm) {
            (Some(sensor_width_mm), Some(sensor_height_mm), Some(focal_length_mm)) => {
                let optics = SensorOptics {
                    sensor_width_mm,
                    sensor_height_mm,
                    focal_length_mm,
                };
                if optics.fields_of_view().is_none() {
                    bail!("sensor size and focal length must be positive");
                }
                Some(optics)
            }
            _ => None,
        };
        let classes = args
            .classes
            .into_iter()
            .map(|class| class.trim().to_string())
            .filter(|class| !class.is_empty())
            .collect();

        let pipeline = PipelineSettings {
            queue_capacity: args.queue_capacity,
            inference_grace: Duration::from_millis(args.inference_grace_ms),
            sink_mailbox_capacity: args.sink_mailbox,
            telemetry_max_age: (args.telemetry_max_age_ms > 0)
                .then(|| Duration::from_millis(args.telemetry_max_age_ms)),
            skip_frames: args.skip_frames,
            detection: DetectionPolicy {
                confidence_threshold,
                classes,
                optics,
            },
            ..PipelineSettings::default()
        };

        Ok(Self {
            source: SourceSettings {
                kind: SourceKind::from_uri(&uri),
                uri,
                width: args.width,
                height: args.height,
                fps: args.fps,
                realtime: !args.no_realtime,
                read_metadata: !args.no_klv,
                use_nvdec: args.use_nvdec,
            },
            detector: DetectorSettings {
                kind,
                model_path: args.model_path,
                labels_path: args.labels_path,
                input_size: args.detector_size,
                device,
            },
            pipeline,
            sinks: SinkSettings {
                stream_url: args.stream_url,
                archive: args.archive_dir.map(|directory| ArchiveSettings {
                    directory,
                    record_video: args.archive_video,
                    save_crops: args.save_detection_images,
                }),
                browser: args
                    .browser_port
                    .map(|port| SocketAddr::new(args.browser_bind, port)),
                metadata_targets,
                metadata_log: args.metadata_log,
                metadata_interval: args.metadata_interval,
                cot,
                jpeg_quality: args.jpeg_quality,
                overlay: !args.no_overlay,
            },
            instrumentation: InstrumentationOptions {
                chrome_trace_path: args.chrome_trace,
                verbose: args.verbose,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        args: VisionCliArgs,
    }

    fn parse(argv: &[&str]) -> Result<VisionConfig> {
        let cli = Cli::try_parse_from(std::iter::once("overwatch").chain(argv.iter().copied()))?;
        VisionConfig::try_from(cli.args)
    }

    #[test]
    fn defaults_add_a_metadata_listener() {
        let config = parse(&["clip.ts"]).unwrap();
        assert_eq!(config.source.uri, "clip.ts");
        assert_eq!(config.source.kind, SourceKind::File);
        assert_eq!(config.detector.kind, DetectorKind::Stub);
        assert_eq!(config.pipeline.queue_capacity, 2);
        assert_eq!(
            config.pipeline.telemetry_max_age,
            Some(Duration::from_secs(2))
        );
        assert_eq!(
            config.sinks.metadata_targets,
            vec![DEFAULT_METADATA_TARGET.parse::<SocketAddr>().unwrap()]
        );
    }

    #[test]
    fn source_flag_overrides_positional() {
        let config = parse(&["a.ts", "--source", "srt://host:9000"]).unwrap();
        assert_eq!(config.source.uri, "srt://host:9000");
        assert_eq!(config.source.kind, SourceKind::Srt);
    }

    #[test]
    fn metadata_listener_stays_alongside_other_sinks() {
        let default = vec![DEFAULT_METADATA_TARGET.parse::<SocketAddr>().unwrap()];
        let config = parse(&["a.ts", "--metadata-log", "/tmp/m.jsonl"]).unwrap();
        assert_eq!(config.sinks.metadata_targets, default);
        let config = parse(&["a.ts", "--archive-dir", "out", "--cot-host", "tak"]).unwrap();
        assert_eq!(config.sinks.metadata_targets, default);
        let config = parse(&["a.ts", "--metadata-udp", "127.0.0.1:7000"]).unwrap();
        assert_eq!(
            config.sinks.metadata_targets,
            vec!["127.0.0.1:7000".parse::<SocketAddr>().unwrap()]
        );
        assert!(parse(&["a.ts", "--no-metadata-broadcast"]).is_err());
    }

    #[test]
    fn detection_flags_shape_the_policy() {
        let config = parse(&[
            "a.ts",
            "--classes",
            "person,car",
            "truck",
            "--skip-frames",
            "2",
            "--no-overlay",
            "--sensor-width-mm",
            "6.4",
            "--sensor-height-mm",
            "4.8",
            "--focal-length-mm",
            "4.5",
        ])
        .unwrap();
        assert_eq!(config.pipeline.detection.classes, vec!["person", "car", "truck"]);
        assert_eq!(config.pipeline.skip_frames, 2);
        assert!(!config.sinks.overlay);
        assert!(config.pipeline.detection.optics.is_some());

        let config = parse(&["a.ts"]).unwrap();
        assert!(config.pipeline.detection.classes.is_empty());
        assert_eq!(config.pipeline.skip_frames, 0);
        assert!(config.sinks.overlay);
        assert!(config.pipeline.detection.optics.is_none());
    }

    #[test]
    fn crops_and_optics_need_their_companions() {
        assert!(parse(&["a.ts", "--save-detection-images"]).is_err());
        let config = parse(&["a.ts", "--archive-dir", "out", "--save-detection-images"]).unwrap();
        assert!(config.sinks.archive.unwrap().save_crops);
        assert!(parse(&["a.ts", "--sensor-width-mm", "6.4"]).is_err());
        assert!(
            parse(&[
                "a.ts",
                "--sensor-width-mm",
                "6.4",
                "--sensor-height-mm",
                "4.8",
                "--focal-length-mm",
                "0"
            ])
            .is_err()
        );
    }

    #[test]
    fn model_selects_torchscript() {
        let config = parse(&["a.ts", "--model", "yolo.pt", "--device", "cuda:1"]).unwrap();
        assert_eq!(config.detector.kind, DetectorKind::Torchscript);
        assert_eq!(config.detector.device, DeviceSelection::Cuda(1));
        assert!(parse(&["a.ts", "--detector", "torchscript"]).is_err());
    }

    #[test]
    fn zero_max_age_disables_expiry() {
        let config = parse(&["a.ts", "--telemetry-max-age-ms", "0"]).unwrap();
        assert_eq!(config.pipeline.telemetry_max_age, None);
    }

    #[test]
    fn sink_destinations_are_collected() {
        let config = parse(&[
            "rtsp://cam/live",
            "--browser-port",
            "8080",
            "--archive-dir",
            "out",
            "--archive-video",
            "--cot-host",
            "tak.local",
            "--cot-protocol",
            "udp",
            "--metadata-udp",
            "127.0.0.1:6000",
        ])
        .unwrap();
        assert_eq!(config.sinks.browser, Some("0.0.0.0:8080".parse().unwrap()));
        assert!(config.sinks.archive.as_ref().is_some_and(|a| a.record_video));
        let cot = config.sinks.cot.unwrap();
        assert_eq!(cot.protocol, CotProtocol::Udp);
        assert_eq!(cot.port, 8087);
        assert_eq!(cot.stale_after, Duration::from_secs(600));
        assert_eq!(config.sinks.metadata_targets.len(), 1);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(parse(&[]).is_err());
        assert!(parse(&["a.ts", "--confidence", "1.5"]).is_err());
        assert!(parse(&["a.ts", "--queue-capacity", "0"]).is_err());
        assert!(parse(&["a.ts", "--jpeg-quality", "0"]).is_err());
        assert!(parse(&["a.ts", "--detector-size", "100"]).is_err());
        assert!(parse(&["a.ts", "--device", "tpu"]).is_err());
        assert!(parse(&["a.ts", "--metadata-udp", "not an address"]).is_err());
        assert!(parse(&["a.ts", "--archive-video"]).is_err());
    }
}
