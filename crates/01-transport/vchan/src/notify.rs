//! Cross-domain notification endpoints.
//!
//! A notification carries no data: it only tells the other side to re-check
//! the shared ring. Each endpoint is a Unix stream socket under
//! `<events>/<domain>/<port>`; one byte on the socket is one ping. Pings stay
//! queued until drained, so a ping delivered between a readiness check and
//! the following [`EventChannel::wait`] is never lost. The descriptor is
//! `poll(2)` compatible and can be multiplexed with other descriptors.

use std::fs;
use std::io::{self, ErrorKind};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::discovery::DomainId;

/// Address of a notification endpoint within its domain.
pub type EventPort = u32;

const MAX_PORTS: EventPort = 4096;

/// What one round of event processing observed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Events {
    /// At least one ping was drained.
    pub pinged: bool,
    /// The peer bound to this (previously unbound) endpoint.
    pub attached: bool,
    /// The peer's endpoint went away.
    pub hangup: bool,
}

impl Events {
    fn any(&self) -> bool {
        self.pinged || self.attached || self.hangup
    }
}

enum Endpoint {
    Listening(UnixListener),
    Connected(UnixStream),
}

/// One side of a point-to-point notification channel.
pub struct EventChannel {
    endpoint: Endpoint,
    port: EventPort,
    bound_path: Option<PathBuf>,
    peer_gone: bool,
}

impl EventChannel {
    /// Allocates a fresh port in `domain` that a remote domain can bind to.
    pub fn alloc_unbound(events_dir: &Path, domain: DomainId) -> io::Result<Self> {
        let domain_dir = events_dir.join(domain.to_string());
        fs::create_dir_all(&domain_dir)?;

        for port in 1..=MAX_PORTS {
            let path = domain_dir.join(port.to_string());
            match UnixListener::bind(&path) {
                Ok(listener) => {
                    listener.set_nonblocking(true)?;
                    debug!(%domain, port, "allocated unbound event channel");
                    return Ok(Self {
                        endpoint: Endpoint::Listening(listener),
                        port,
                        bound_path: Some(path),
                        peer_gone: false,
                    });
                }
                Err(err) if err.kind() == ErrorKind::AddrInUse => continue,
                Err(err) => return Err(err),
            }
        }

        Err(io::Error::new(
            ErrorKind::AddrNotAvailable,
            format!("no free event channel port in domain {domain}"),
        ))
    }

    /// Binds to the unbound port `remote_port` of `remote_domain`.
    pub fn bind_interdomain(
        events_dir: &Path,
        remote_domain: DomainId,
        remote_port: EventPort,
    ) -> io::Result<Self> {
        let path = events_dir
            .join(remote_domain.to_string())
            .join(remote_port.to_string());
        let stream = UnixStream::connect(&path)?;
        stream.set_nonblocking(true)?;
        debug!(%remote_domain, remote_port, "bound interdomain event channel");
        Ok(Self {
            endpoint: Endpoint::Connected(stream),
            port: remote_port,
            bound_path: None,
            peer_gone: false,
        })
    }

    /// Port number this channel was allocated or bound at.
    pub fn port(&self) -> EventPort {
        self.port
    }

    /// True once a peer is bound to this channel.
    pub fn is_connected(&self) -> bool {
        matches!(self.endpoint, Endpoint::Connected(_))
    }

    /// True once the peer's endpoint disappeared.
    pub fn peer_gone(&self) -> bool {
        self.peer_gone
    }

    /// Pings the peer. A ping before any peer is bound is dropped; so is a
    /// ping that finds the socket buffer full, since one is already pending.
    pub fn notify(&mut self) -> io::Result<()> {
        let Endpoint::Connected(stream) = &self.endpoint else {
            return Ok(());
        };
        if self.peer_gone {
            return Ok(());
        }

        let fd = stream.as_raw_fd();
        let buf = [1u8];
        loop {
            // SAFETY: fd is owned by `stream`, buf is valid for one byte.
            let ret = unsafe {
                libc::send(
                    fd,
                    buf.as_ptr() as *const libc::c_void,
                    buf.len(),
                    libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL,
                )
            };
            if ret >= 0 {
                return Ok(());
            }

            let err = io::Error::last_os_error();
            match err.kind() {
                ErrorKind::Interrupted => continue,
                ErrorKind::WouldBlock => return Ok(()),
                ErrorKind::BrokenPipe
                | ErrorKind::ConnectionReset
                | ErrorKind::ConnectionRefused
                | ErrorKind::NotConnected => {
                    warn!(port = self.port, "peer vanished while notifying: {err}");
                    self.peer_gone = true;
                    return Ok(());
                }
                _ => return Err(err),
            }
        }
    }

    /// Processes whatever is pending without blocking.
    pub fn poll_events(&mut self) -> io::Result<Events> {
        let mut events = Events::default();

        if let Endpoint::Listening(listener) = &self.endpoint {
            match listener.accept() {
                Ok((stream, _)) => {
                    stream.set_nonblocking(true)?;
                    self.endpoint = Endpoint::Connected(stream);
                    events.attached = true;
                    self.unlink_bound_path();
                    debug!(port = self.port, "peer attached to event channel");
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(events),
                Err(err) => return Err(err),
            }
        }

        let Endpoint::Connected(stream) = &self.endpoint else {
            return Ok(events);
        };
        let fd = stream.as_raw_fd();
        let mut buf = [0u8; 64];
        loop {
            // SAFETY: fd is owned by `stream`, buf is valid for its length.
            let ret = unsafe {
                libc::recv(
                    fd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    libc::MSG_DONTWAIT,
                )
            };
            if ret > 0 {
                events.pinged = true;
                continue;
            }
            if ret == 0 {
                events.hangup = true;
                break;
            }

            let err = io::Error::last_os_error();
            match err.kind() {
                ErrorKind::Interrupted => continue,
                ErrorKind::WouldBlock => break,
                ErrorKind::ConnectionReset => {
                    events.hangup = true;
                    break;
                }
                _ => return Err(err),
            }
        }

        if events.hangup && !self.peer_gone {
            debug!(port = self.port, "peer hung up event channel");
            self.peer_gone = true;
        }
        Ok(events)
    }

    /// Blocks until a ping, an attach or a hang-up is observed.
    pub fn wait(&mut self) -> io::Result<Events> {
        loop {
            let events = self.poll_events()?;
            if events.any() {
                return Ok(events);
            }
            if self.peer_gone {
                return Ok(Events {
                    hangup: true,
                    ..Events::default()
                });
            }
            poll_readable(self.as_raw_fd())?;
        }
    }

    fn unlink_bound_path(&mut self) {
        if let Some(path) = self.bound_path.take() {
            if let Err(err) = fs::remove_file(&path) {
                if err.kind() != ErrorKind::NotFound {
                    warn!(path = %path.display(), "failed to unlink event channel: {err}");
                }
            }
        }
    }
}

impl AsRawFd for EventChannel {
    fn as_raw_fd(&self) -> RawFd {
        match &self.endpoint {
            Endpoint::Listening(listener) => listener.as_raw_fd(),
            Endpoint::Connected(stream) => stream.as_raw_fd(),
        }
    }
}

impl AsFd for EventChannel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match &self.endpoint {
            Endpoint::Listening(listener) => listener.as_fd(),
            Endpoint::Connected(stream) => stream.as_fd(),
        }
    }
}

impl Drop for EventChannel {
    fn drop(&mut self) {
        self.unlink_bound_path();
    }
}

/// Blocks until `fd` is readable (or hung up).
pub(crate) fn poll_readable(fd: RawFd) -> io::Result<()> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    loop {
        // SAFETY: pfd is a valid pollfd for the duration of the call.
        let ret = unsafe { libc::poll(&mut pfd, 1, -1) };
        if ret >= 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(dir: &Path) -> (EventChannel, EventChannel) {
        let server = EventChannel::alloc_unbound(dir, DomainId(0)).unwrap();
        let client = EventChannel::bind_interdomain(dir, DomainId(0), server.port()).unwrap();
        (server, client)
    }

    #[test]
    fn ports_are_distinct() {
        let dir = tempfile::tempdir().unwrap();
        let a = EventChannel::alloc_unbound(dir.path(), DomainId(3)).unwrap();
        let b = EventChannel::alloc_unbound(dir.path(), DomainId(3)).unwrap();
        assert_ne!(a.port(), b.port());
    }

    #[test]
    fn attach_and_ping_both_ways() {
        let dir = tempfile::tempdir().unwrap();
        let (mut server, mut client) = pair(dir.path());
        assert!(!server.is_connected());

        client.notify().unwrap();
        let events = server.wait().unwrap();
        assert!(events.attached);
        assert!(events.pinged);
        assert!(server.is_connected());

        server.notify().unwrap();
        let events = client.wait().unwrap();
        assert!(events.pinged);
        assert!(!events.hangup);
    }

    #[test]
    fn pings_coalesce_into_one_wakeup() {
        let dir = tempfile::tempdir().unwrap();
        let (mut server, mut client) = pair(dir.path());
        for _ in 0..5 {
            client.notify().unwrap();
        }
        assert!(server.wait().unwrap().pinged);
        assert_eq!(server.poll_events().unwrap(), Events::default());
    }

    #[test]
    fn ping_before_attach_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let (mut server, _client) = pair(dir.path());
        server.notify().unwrap();
        assert!(!server.peer_gone());
    }

    #[test]
    fn attach_unlinks_the_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let (mut server, mut client) = pair(dir.path());
        client.notify().unwrap();
        server.wait().unwrap();
        assert!(EventChannel::bind_interdomain(dir.path(), DomainId(0), server.port()).is_err());
    }

    #[test]
    fn dropped_peer_reads_as_hangup() {
        let dir = tempfile::tempdir().unwrap();
        let (mut server, mut client) = pair(dir.path());
        client.notify().unwrap();
        server.wait().unwrap();
        drop(client);

        let events = server.wait().unwrap();
        assert!(events.hangup);
        assert!(server.peer_gone());
        server.notify().unwrap();
    }

    #[test]
    fn wait_wakes_on_ping_from_other_thread() {
        let dir = tempfile::tempdir().unwrap();
        let (mut server, mut client) = pair(dir.path());
        client.notify().unwrap();
        server.wait().unwrap();

        let pinger = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            client.notify().unwrap();
            client
        });
        assert!(server.wait().unwrap().pinged);
        drop(pinger.join().unwrap());
    }
}
