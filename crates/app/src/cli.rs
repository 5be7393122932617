use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use vision::pipeline::VisionCliArgs;

#[derive(Parser, Debug)]
#[command(
    name = "overwatch",
    version,
    about = "Detect objects in airborne video and geolocate them from KLV telemetry"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Capture, detect and fan results out to the configured sinks.
    Run(VisionCliArgs),
    /// Decode a raw KLV byte stream and print one JSON record per packet.
    KlvDump(KlvDumpArgs),
}

#[derive(Args, Debug)]
pub struct KlvDumpArgs {
    /// File holding concatenated ST 0601 local sets, e.g. an extracted data track.
    pub path: PathBuf,

    /// Pretty-print each record.
    #[arg(long)]
    pub pretty: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_accepts_pipeline_flags() {
        let cli = Cli::try_parse_from([
            "overwatch",
            "run",
            "rtsp://camera/stream",
            "--browser-port",
            "8080",
        ])
        .unwrap();
        match cli.command {
            Command::Run(args) => {
                assert_eq!(args.source.as_deref(), Some("rtsp://camera/stream"));
                assert_eq!(args.browser_port, Some(8080));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn klv_dump_takes_a_path() {
        let cli = Cli::try_parse_from(["overwatch", "klv-dump", "flight.klv", "--pretty"]).unwrap();
        match cli.command {
            Command::KlvDump(args) => {
                assert_eq!(args.path, PathBuf::from("flight.klv"));
                assert!(args.pretty);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
