//! Sends files to a receiver over a vchan and reports its verdict.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use filecopy::PackError;
use filecopy_tools::{init_tracing, send_files, ChannelArgs};
use tracing::{error, info};
use vchan::Vchan;

#[derive(Parser, Debug)]
#[command(author, version, about = "Copy files to another domain")]
struct Args {
    #[command(flatten)]
    channel: ChannelArgs,

    /// Files and directories to send
    #[arg(required = true)]
    paths: Vec<PathBuf>,
}

fn main() -> ExitCode {
    init_tracing();
    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<()> {
    let ctx = args.channel.context()?;
    let mut chan = Vchan::client(&ctx, args.channel.peer(), args.channel.port)
        .with_context(|| format!("failed to connect to domain {}", args.channel.peer))?;

    let outcome = send_files(&mut chan, &args.paths);
    if let Err(err) = chan.close() {
        error!("failed to close channel: {err}");
    }

    match outcome {
        Ok(()) => {
            info!(count = args.paths.len(), "files copied");
            Ok(())
        }
        Err(err @ PackError::Remote { .. }) => Err(err).context("receiver rejected the transfer"),
        Err(err) => Err(err).context("transfer failed"),
    }
}
