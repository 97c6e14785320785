//! The public channel: shared ring, notifications and handshake composed.
//!
//! ```text
//!  server                                  client
//!  ──────                                  ──────
//!  allocate page, initialise ring
//!  allocate unbound event port
//!  publish ring-ref + event-channel  ──▶   read ring-ref + event-channel
//!                                          map page, validate ring
//!                                          bind event port, ping
//!  accept bind + ping (Connected)    ◀──
//!  clear keys, withdraw page
//! ```

use std::io::{self, ErrorKind, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::discovery::{ChannelKeys, DirStore, DiscoveryStore, DomainId};
use crate::error::{VchanError, VchanResult};
use crate::notify::{EventChannel, Events};
use crate::page::PageArena;
use crate::ring::{RingBuffer, Role};

/// Platform services visible to one domain.
#[derive(Clone)]
pub struct VchanContext {
    domain: DomainId,
    pages: PageArena,
    events_dir: PathBuf,
    store: Arc<dyn DiscoveryStore>,
}

impl VchanContext {
    /// Builds a context whose page arena and event endpoints live under `root`.
    pub fn new(domain: DomainId, root: &Path, store: Arc<dyn DiscoveryStore>) -> io::Result<Self> {
        let pages = PageArena::open(root.join("pages"))?;
        let events_dir = root.join("evtchn");
        std::fs::create_dir_all(&events_dir)?;
        Ok(Self {
            domain,
            pages,
            events_dir,
            store,
        })
    }

    /// Like [`VchanContext::new`], with a [`DirStore`] at `<root>/store`, so
    /// separate processes sharing `root` can find each other.
    pub fn with_dir_store(domain: DomainId, root: &Path) -> io::Result<Self> {
        let store = DirStore::open(root.join("store"))?;
        Self::new(domain, root, Arc::new(store))
    }

    pub fn domain(&self) -> DomainId {
        self.domain
    }

    pub fn store(&self) -> &Arc<dyn DiscoveryStore> {
        &self.store
    }
}

/// Lifecycle of one channel end.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Init,
    Connecting,
    Connected,
    LocalClosing,
    Closed,
}

struct Registration {
    store: Arc<dyn DiscoveryStore>,
    keys: ChannelKeys,
}

impl Registration {
    fn clear(self) {
        if let Err(err) = self.keys.clear(self.store.as_ref()) {
            warn!(key = self.keys.base(), "failed to clear discovery keys: {err}");
        }
    }
}

/// A byte-stream channel to one peer domain.
///
/// Reads and writes may transfer fewer bytes than requested; the
/// [`Read`]/[`Write`] implementations make the usual `*_all` helpers work.
/// Each end is meant to be driven by a single thread.
pub struct Vchan {
    ring: RingBuffer,
    events: EventChannel,
    state: ConnectionState,
    registration: Option<Registration>,
    eof: bool,
}

impl Vchan {
    /// Offers channel `port` to domain `peer` and returns without waiting for
    /// it to attach.
    pub fn server(ctx: &VchanContext, peer: DomainId, port: u32) -> VchanResult<Self> {
        let mut state = ConnectionState::Init;
        debug!(?state, %peer, port, "starting vchan server");

        let page = ctx.pages.allocate().map_err(VchanError::PageAlloc)?;
        let frame = page
            .frame()
            .ok_or(VchanError::InvalidLayout("arena page has no frame number"))?;
        let ring = RingBuffer::initialize(Arc::new(page))?;
        let events = EventChannel::alloc_unbound(&ctx.events_dir, ctx.domain)
            .map_err(VchanError::EventChannel)?;

        let keys = ChannelKeys::new(ctx.domain, peer, port);
        if let Err(err) = keys.publish(ctx.store.as_ref(), frame, events.port()) {
            let _ = keys.clear(ctx.store.as_ref());
            return Err(err);
        }
        state = ConnectionState::Connecting;
        info!(%peer, port, frame, event_port = events.port(), "vchan offered");

        Ok(Self {
            ring,
            events,
            state,
            registration: Some(Registration {
                store: Arc::clone(&ctx.store),
                keys,
            }),
            eof: false,
        })
    }

    /// Attaches to channel `port` offered by domain `server`.
    pub fn client(ctx: &VchanContext, server: DomainId, port: u32) -> VchanResult<Self> {
        let keys = ChannelKeys::new(server, ctx.domain, port);
        let (frame, event_port) = keys.lookup(ctx.store.as_ref())?;

        let page = ctx
            .pages
            .map(frame)
            .map_err(|source| VchanError::PageMap { frame, source })?;
        let ring = RingBuffer::attach(Arc::new(page))?;
        let mut events = EventChannel::bind_interdomain(&ctx.events_dir, server, event_port)
            .map_err(VchanError::EventChannel)?;
        events.notify().map_err(VchanError::EventChannel)?;
        info!(%server, port, frame, "vchan attached");

        Ok(Self {
            ring,
            events,
            state: ConnectionState::Connected,
            registration: None,
            eof: false,
        })
    }

    pub fn role(&self) -> Role {
        self.ring.role()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Bytes that can be written right now without blocking.
    pub fn space_available(&self) -> usize {
        self.ring.space_available()
    }

    /// Bytes that can be read right now without blocking.
    pub fn data_ready(&self) -> usize {
        self.ring.data_ready()
    }

    /// True while the peer has not consumed everything written so far.
    pub fn write_pending(&self) -> bool {
        self.ring.write_pending()
    }

    /// Blocks until the client attaches. Returns immediately on a client.
    pub fn wait_connected(&mut self) -> io::Result<()> {
        while self.state == ConnectionState::Connecting {
            self.wait()?;
        }
        Ok(())
    }

    /// Blocks until the peer pings, attaches or disappears.
    pub fn wait(&mut self) -> io::Result<()> {
        let events = self.events.wait()?;
        self.process(events);
        Ok(())
    }

    /// Processes pending notifications without blocking. Call this when an
    /// external poll loop reports [`Vchan::as_raw_fd`] readable; the
    /// descriptor changes once, when a server's client attaches.
    pub fn handle_events(&mut self) -> io::Result<()> {
        let events = self.events.poll_events()?;
        self.process(events);
        Ok(())
    }

    /// True once the peer has closed or vanished.
    ///
    /// A client observing this closes its own end, so a server-initiated
    /// close completes without the client calling [`Vchan::close`].
    pub fn is_eof(&mut self) -> bool {
        self.refresh_eof()
    }

    /// Writes one contiguous run, blocking while the ring is full.
    pub fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        if self.ring.local_closed() {
            return Err(io::Error::new(ErrorKind::BrokenPipe, "channel closed locally"));
        }

        loop {
            if self.refresh_eof() {
                return Err(io::Error::new(ErrorKind::BrokenPipe, "peer closed the channel"));
            }
            let written = self.ring.write_some(data);
            if written > 0 {
                self.events.notify()?;
                return Ok(written);
            }
            self.wait()?;
        }
    }

    /// Reads one contiguous run, blocking while the ring is empty. Returns
    /// `Ok(0)` only once the peer has closed and everything was read.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            let read = self.ring.read_some(buf);
            if read > 0 {
                self.events.notify()?;
                return Ok(read);
            }
            if self.refresh_eof() {
                // Bytes published just before the close flag.
                let read = self.ring.read_some(buf);
                if read > 0 {
                    self.events.notify()?;
                }
                return Ok(read);
            }
            self.wait()?;
        }
    }

    /// Drains outgoing data, marks this end closed and pings the peer.
    ///
    /// A server additionally waits for the client to acknowledge by closing
    /// its own end, unless no client ever attached.
    pub fn close(&mut self) -> io::Result<()> {
        if self.state == ConnectionState::Closed && self.ring.local_closed() {
            return Ok(());
        }
        if self.state == ConnectionState::Connecting {
            self.handle_events()?;
        }
        let attached = self.events.is_connected();
        self.state = ConnectionState::LocalClosing;

        while attached && self.ring.write_pending() && !self.refresh_eof() {
            self.wait()?;
        }

        if !self.ring.local_closed() {
            self.ring.close_local();
            self.events.notify()?;
        }

        if self.role() == Role::Server && attached {
            while !self.ring.peer_closed() && !self.events.peer_gone() {
                self.wait()?;
            }
        }

        if let Some(registration) = self.registration.take() {
            registration.clear();
        }
        self.state = ConnectionState::Closed;
        debug!(role = ?self.role(), "vchan closed");
        Ok(())
    }

    fn process(&mut self, events: Events) {
        if events.attached && self.state == ConnectionState::Connecting {
            self.on_attached();
        }
        self.refresh_eof();
    }

    fn on_attached(&mut self) {
        self.state = ConnectionState::Connected;
        if let Some(registration) = self.registration.take() {
            registration.clear();
        }
        if let Err(err) = self.ring.page().withdraw() {
            warn!("failed to withdraw shared page: {err}");
        }
        info!(event_port = self.events.port(), "vchan client attached");
    }

    fn refresh_eof(&mut self) -> bool {
        if self.eof {
            return true;
        }
        if !self.ring.peer_closed() && !self.events.peer_gone() {
            return false;
        }

        self.eof = true;
        debug!(role = ?self.role(), "vchan peer closed");
        if self.role() == Role::Client && !self.ring.local_closed() {
            self.ring.close_local();
            if let Err(err) = self.events.notify() {
                warn!("failed to acknowledge server close: {err}");
            }
            self.state = ConnectionState::Closed;
        }
        true
    }
}

impl Read for Vchan {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Vchan::read(self, buf)
    }
}

impl Write for Vchan {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Vchan::write(self, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        // Written bytes are already visible to the peer.
        Ok(())
    }
}

impl AsRawFd for Vchan {
    fn as_raw_fd(&self) -> RawFd {
        self.events.as_raw_fd()
    }
}

impl AsFd for Vchan {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.events.as_fd()
    }
}

impl Drop for Vchan {
    fn drop(&mut self) {
        if !self.ring.local_closed() {
            self.ring.close_local();
            let _ = self.events.notify();
        }
        if let Some(registration) = self.registration.take() {
            registration.clear();
        }
    }
}
