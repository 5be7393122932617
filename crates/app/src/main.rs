mod cli;
mod klv_dump;
mod run;

use anyhow::Result;
use clap::Parser;
use vision::pipeline::{VisionConfig, instrumentation};

use crate::cli::{Cli, Command};

fn main() {
    let result = dispatch(Cli::parse());
    if let Err(err) = &result {
        eprintln!("{err:?}");
    }
    std::process::exit(run::exit_code(&result));
}

fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run(args) => run::run(VisionConfig::try_from(args)?),
        Command::KlvDump(args) => {
            let _guard = instrumentation::init_tracing(&Default::default());
            klv_dump::run(&args)
        }
    }
}
