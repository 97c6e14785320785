//! Offers a vchan, then pipes it through a sandboxed unpacker.

use std::path::PathBuf;
use std::process::{Command, ExitCode, Stdio};

use anyhow::{Context, Result};
use clap::Parser;
use filecopy_tools::{init_tracing, relay, ChannelArgs};
use tracing::{error, info};
use vchan::Vchan;

#[derive(Parser, Debug)]
#[command(author, version, about = "Receive files from another domain")]
struct Args {
    #[command(flatten)]
    channel: ChannelArgs,

    /// Unpacker binary to run for the session
    #[arg(long, default_value = "filecopy-unpack")]
    unpacker: PathBuf,

    /// User the unpacker runs as
    user: String,

    /// Destination directory
    dest: PathBuf,
}

fn main() -> ExitCode {
    init_tracing();
    match run(Args::parse()) {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<u8> {
    let ctx = args.channel.context()?;
    let mut chan = Vchan::server(&ctx, args.channel.peer(), args.channel.port)
        .context("failed to offer channel")?;
    chan.wait_connected().context("failed waiting for sender")?;
    info!(peer = args.channel.peer, "sender attached");

    let mut child = Command::new(&args.unpacker)
        .arg(&args.user)
        .arg(&args.dest)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to start {}", args.unpacker.display()))?;

    let status = relay(&mut chan, &mut child)?;
    chan.close().context("failed to close channel")?;

    info!(%status, "unpacker finished");
    Ok(status
        .code()
        .and_then(|code| u8::try_from(code).ok())
        .unwrap_or(u8::MAX))
}
