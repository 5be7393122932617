use std::{
    fs::File,
    io::{self, BufReader, Read, Write},
};

use anyhow::{Context, Result};
use klv::KlvPacketizer;
use tracing::{info, warn};

use crate::cli::KlvDumpArgs;

/// Counts from one dump run.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DumpSummary {
    pub decoded: u64,
    pub rejected: u64,
    pub skipped_bytes: u64,
}

pub fn run(args: &KlvDumpArgs) -> Result<()> {
    let file =
        File::open(&args.path).with_context(|| format!("failed to open {}", args.path.display()))?;
    let stdout = io::stdout();
    let summary = dump(BufReader::new(file), &mut stdout.lock(), args.pretty)?;
    info!(
        decoded = summary.decoded,
        rejected = summary.rejected,
        skipped_bytes = summary.skipped_bytes,
        "KLV dump finished"
    );
    Ok(())
}

/// Splits `input` into local sets and writes each decoded record as JSON.
pub fn dump<R: Read, W: Write>(mut input: R, out: &mut W, pretty: bool) -> Result<DumpSummary> {
    let mut packetizer = KlvPacketizer::new();
    let mut summary = DumpSummary::default();
    let mut chunk = [0u8; 4096];
    loop {
        let read = input.read(&mut chunk).context("failed to read KLV input")?;
        if read == 0 {
            break;
        }
        packetizer.push(&chunk[..read]);
        while let Some(packet) = packetizer.next_packet() {
            match klv::decode(&packet) {
                Ok(record) => {
                    if pretty {
                        serde_json::to_writer_pretty(&mut *out, &record)?;
                    } else {
                        serde_json::to_writer(&mut *out, &record)?;
                    }
                    writeln!(out)?;
                    summary.decoded += 1;
                }
                Err(err) => {
                    warn!(packet = summary.decoded + summary.rejected, "rejected packet: {err}");
                    summary.rejected += 1;
                }
            }
        }
    }
    summary.skipped_bytes = packetizer.discarded();
    out.flush()?;
    Ok(summary)
}
