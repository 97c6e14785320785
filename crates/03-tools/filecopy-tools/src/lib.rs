//! Shared plumbing for the filecopy binaries.

use std::io::{self, ErrorKind, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::process::{Child, ExitStatus};

use anyhow::{Context, Result};
use clap::Args;
use filecopy::{await_result, PackError, Packer};
use tracing::{debug, warn};
use tracing_subscriber::{fmt, EnvFilter};
use vchan::{DomainId, Vchan, VchanContext};

/// Where the channel lives and who is on the other end.
#[derive(Args, Debug, Clone)]
pub struct ChannelArgs {
    /// Platform directory holding the discovery store, pages and event channels
    #[arg(long, env = "VCHAN_ROOT", default_value = "/run/vchan")]
    pub root: PathBuf,

    /// Id of the local domain
    #[arg(long)]
    pub domain: u32,

    /// Id of the peer domain
    #[arg(long)]
    pub peer: u32,

    /// Channel number shared with the peer
    #[arg(long, default_value_t = 111)]
    pub port: u32,
}

impl ChannelArgs {
    pub fn context(&self) -> Result<VchanContext> {
        VchanContext::with_dir_store(DomainId(self.domain), &self.root)
            .with_context(|| format!("failed to open vchan platform at {}", self.root.display()))
    }

    pub fn peer(&self) -> DomainId {
        DomainId(self.peer)
    }
}

/// Logs go to stderr; stdout may carry protocol bytes.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

/// Sends `paths` and waits for the receiver's verdict.
pub fn send_files<S: Read + Write>(stream: S, paths: &[PathBuf]) -> Result<(), PackError> {
    let mut packer = Packer::new(stream);
    let sent = paths
        .iter()
        .try_for_each(|path| packer.send_path(path))
        .and_then(|()| packer.finish());
    let crc = packer.crc();
    let mut stream = packer.into_inner();

    match sent {
        Ok(crc) => await_result(&mut stream, crc),
        // The receiver stopped reading; its answer says why.
        Err(PackError::Send(err)) if err.kind() == ErrorKind::BrokenPipe => {
            debug!("receiver closed early, reading its response");
            await_result(&mut stream, crc)?;
            Err(PackError::Send(err))
        }
        Err(err) => Err(err),
    }
}

/// Consumes and drops incoming data until the peer has read everything
/// written to it, so a peer still sending can reach its response.
pub fn discard_until_answered(chan: &mut Vchan) -> io::Result<()> {
    let mut scratch = [0u8; 4096];
    let mut discarded = 0usize;
    while chan.write_pending() && !chan.is_eof() {
        while chan.data_ready() > 0 {
            discarded += chan.read(&mut scratch)?;
        }
        if chan.write_pending() && !chan.is_eof() {
            chan.wait()?;
        }
    }
    if discarded > 0 {
        debug!(discarded, "dropped data sent after the unpacker finished");
    }
    Ok(())
}

/// Shuttles bytes between the channel and an unpacker child until the
/// child has answered and exited.
pub fn relay(chan: &mut Vchan, child: &mut Child) -> Result<ExitStatus> {
    let mut to_child = child.stdin.take();
    let mut from_child = child.stdout.take().context("unpacker stdout is not piped")?;
    let mut buf = [0u8; 4096];

    loop {
        // Sampled first: data published before the close flag is then
        // guaranteed to be drained below.
        let eof = chan.is_eof();
        while chan.data_ready() > 0 {
            let n = chan.read(&mut buf).context("failed to read from channel")?;
            if let Some(pipe) = to_child.as_mut() {
                if let Err(err) = pipe.write_all(&buf[..n]) {
                    if err.kind() != ErrorKind::BrokenPipe {
                        return Err(err).context("failed to feed unpacker");
                    }
                    debug!("unpacker stopped reading");
                    to_child = None;
                }
            }
        }
        if eof && to_child.take().is_some() {
            debug!("sender finished, closing unpacker input");
        }

        let chan_fd = if eof { -1 } else { chan.as_raw_fd() };
        let ready = poll_two(chan_fd, from_child.as_raw_fd()).context("poll failed")?;
        if ready.1 {
            let n = from_child.read(&mut buf).context("failed to read unpacker output")?;
            if n == 0 {
                break;
            }
            if let Err(err) = chan.write_all(&buf[..n]) {
                if err.kind() != ErrorKind::BrokenPipe {
                    return Err(err).context("failed to forward response");
                }
                warn!("sender vanished before the response was delivered");
            }
        }
        if ready.0 {
            chan.handle_events().context("failed to process channel events")?;
        }
    }

    drop(to_child);
    let status = child.wait().context("failed to reap unpacker")?;
    discard_until_answered(chan).context("failed to deliver response")?;
    Ok(status)
}

/// Blocks until one of the descriptors is readable. Negative descriptors
/// are ignored.
fn poll_two(first: RawFd, second: RawFd) -> io::Result<(bool, bool)> {
    let mut fds = [first, second].map(|fd| libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    });
    loop {
        // SAFETY: `fds` is a valid array of two pollfd entries.
        let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
        if ret >= 0 {
            return Ok((fds[0].revents != 0, fds[1].revents != 0));
        }
        let err = io::Error::last_os_error();
        if err.kind() != ErrorKind::Interrupted {
            return Err(err);
        }
    }
}
