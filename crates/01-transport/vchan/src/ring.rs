//! Byte rings living in the shared page.
//!
//! Layout (one page, both directions):
//!
//! ```text
//! +---------------------------+  0
//! | RingHeader                |    magic, cons_in, prod_in, cons_out, prod_out,
//! |                           |    server_closed, client_closed, order_in, order_out
//! +---------------------------+  1024
//! | buf_in  (client → server) |    1 << 10 bytes
//! +---------------------------+  2048
//! | buf_out (server → client) |    1 << 11 bytes
//! +---------------------------+  4096
//! ```
//!
//! Each direction is strictly single-producer/single-consumer: only the
//! writing side ever stores its `prod` cursor and only the reading side ever
//! stores the matching `cons` cursor. Cursors are 64-bit and grow without
//! bound; indexing masks them into the buffer. Values written by the peer are
//! untrusted, so pending counts are clamped to the capacity before use.

use crate::error::{VchanError, VchanResult};
use crate::page::{SharedPage, PAGE_SIZE};
#[cfg(feature = "loom")]
use loom::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::mem::size_of;
use std::ptr;
#[cfg(not(feature = "loom"))]
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Written by the server so the client can recognise an initialised ring.
pub const RING_MAGIC: u64 = 0x5643_4841_4E52_4E47; // "VCHANRNG"

const BUF_IN_OFFSET: usize = 1024;
const BUF_IN_ORDER: u32 = 10;
const BUF_OUT_OFFSET: usize = 2048;
const BUF_OUT_ORDER: u32 = 11;

#[cfg(not(feature = "loom"))]
const _: () = assert!(size_of::<RingHeader>() <= BUF_IN_OFFSET);
const _: () = assert!(BUF_IN_OFFSET + (1 << BUF_IN_ORDER) <= BUF_OUT_OFFSET);
const _: () = assert!(BUF_OUT_OFFSET + (1 << BUF_OUT_ORDER) <= PAGE_SIZE);

/// Every field is atomic: the peer may store into any of them at any time,
/// so the header is only ever accessed through shared references.
#[repr(C, align(8))]
struct RingHeader {
    magic: AtomicU64,
    cons_in: AtomicU64,
    prod_in: AtomicU64,
    cons_out: AtomicU64,
    prod_out: AtomicU64,
    server_closed: AtomicU32,
    client_closed: AtomicU32,
    order_in: AtomicU32,
    order_out: AtomicU32,
}

impl RingHeader {
    fn new() -> Self {
        Self {
            magic: AtomicU64::new(RING_MAGIC),
            cons_in: AtomicU64::new(0),
            prod_in: AtomicU64::new(0),
            cons_out: AtomicU64::new(0),
            prod_out: AtomicU64::new(0),
            server_closed: AtomicU32::new(0),
            client_closed: AtomicU32::new(0),
            order_in: AtomicU32::new(BUF_IN_ORDER),
            order_out: AtomicU32::new(BUF_OUT_ORDER),
        }
    }
}

/// Which end of the channel this side plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Allocated the page; writes `buf_out`, reads `buf_in`.
    Server,
    /// Mapped the peer's page; writes `buf_in`, reads `buf_out`.
    Client,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Buf {
    In,
    Out,
}

#[derive(Clone, Copy, Debug)]
struct Lane {
    buf: Buf,
    offset: usize,
    capacity: usize,
}

impl Lane {
    const IN: Lane = Lane {
        buf: Buf::In,
        offset: BUF_IN_OFFSET,
        capacity: 1 << BUF_IN_ORDER,
    };
    const OUT: Lane = Lane {
        buf: Buf::Out,
        offset: BUF_OUT_OFFSET,
        capacity: 1 << BUF_OUT_ORDER,
    };

    fn mask(&self, cursor: u64) -> usize {
        (cursor as usize) & (self.capacity - 1)
    }

    fn pending(&self, prod: u64, cons: u64) -> usize {
        prod.wrapping_sub(cons).min(self.capacity as u64) as usize
    }
}

/// Both directional rings of one channel, seen from one side.
///
/// The transmit lane and receive lane are fixed at construction from the
/// role, so the same page layout serves server and client.
pub struct RingBuffer {
    page: Arc<SharedPage>,
    role: Role,
    tx: Lane,
    rx: Lane,
}

impl RingBuffer {
    /// Writes a fresh header into `page` and takes the server role.
    pub fn initialize(page: Arc<SharedPage>) -> VchanResult<Self> {
        if page.len() < PAGE_SIZE {
            return Err(VchanError::InvalidLayout("page smaller than ring layout"));
        }
        let header = page.as_ptr() as *mut RingHeader;
        unsafe {
            // SAFETY: the page is at least PAGE_SIZE bytes and page aligned; the
            // client has not been told about it yet, so nothing else touches it.
            header.write(RingHeader::new());
        }
        Ok(Self::with_role(page, Role::Server))
    }

    /// Validates the header the server wrote and takes the client role.
    pub fn attach(page: Arc<SharedPage>) -> VchanResult<Self> {
        if page.len() < PAGE_SIZE {
            return Err(VchanError::InvalidLayout("page smaller than ring layout"));
        }
        let ring = Self::with_role(page, Role::Client);
        let header = ring.header();
        let magic = header.magic.load(Ordering::Acquire);
        let order_in = header.order_in.load(Ordering::Relaxed);
        let order_out = header.order_out.load(Ordering::Relaxed);
        if magic != RING_MAGIC {
            return Err(VchanError::InvalidLayout("bad ring magic"));
        }
        if order_in != BUF_IN_ORDER || order_out != BUF_OUT_ORDER {
            return Err(VchanError::InvalidLayout("unsupported ring orders"));
        }
        Ok(ring)
    }

    fn with_role(page: Arc<SharedPage>, role: Role) -> Self {
        let (tx, rx) = match role {
            Role::Server => (Lane::OUT, Lane::IN),
            Role::Client => (Lane::IN, Lane::OUT),
        };
        Self { page, role, tx, rx }
    }

    /// Page the rings live in.
    pub(crate) fn page(&self) -> &SharedPage {
        &self.page
    }

    /// Role this view was built for.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Capacity of the direction this side writes.
    pub fn write_capacity(&self) -> usize {
        self.tx.capacity
    }

    /// Capacity of the direction this side reads.
    pub fn read_capacity(&self) -> usize {
        self.rx.capacity
    }

    /// Bytes that can be written without overwriting unread data.
    pub fn space_available(&self) -> usize {
        let (prod, cons) = self.cursors(self.tx.buf);
        let used = self
            .tx
            .pending(prod.load(Ordering::Relaxed), cons.load(Ordering::Acquire));
        self.tx.capacity - used
    }

    /// Bytes written by the peer that have not been read yet.
    pub fn data_ready(&self) -> usize {
        let (prod, cons) = self.cursors(self.rx.buf);
        self.rx
            .pending(prod.load(Ordering::Acquire), cons.load(Ordering::Relaxed))
    }

    /// True while the peer has not consumed everything this side wrote.
    pub fn write_pending(&self) -> bool {
        self.space_available() < self.tx.capacity
    }

    /// Copies as much of `data` as fits in one contiguous run and publishes it.
    ///
    /// Returns the number of bytes written, which may be zero.
    pub fn write_some(&mut self, data: &[u8]) -> usize {
        let lane = self.tx;
        let (prod_cursor, cons_cursor) = self.cursors(lane.buf);
        let prod = prod_cursor.load(Ordering::Relaxed);
        let cons = cons_cursor.load(Ordering::Acquire);

        let space = lane.capacity - lane.pending(prod, cons);
        let start = lane.mask(prod);
        let len = data.len().min(space).min(lane.capacity - start);
        if len == 0 {
            return 0;
        }

        unsafe {
            // SAFETY: `start + len <= capacity`, so the destination stays inside
            // this lane; the peer never reads past the published `prod`.
            ptr::copy_nonoverlapping(data.as_ptr(), self.lane_ptr(lane).add(start), len);
        }
        prod_cursor.store(prod.wrapping_add(len as u64), Ordering::Release);
        len
    }

    /// Copies as much published data as fits into `buf` from one contiguous
    /// run and releases the space back to the peer.
    pub fn read_some(&mut self, buf: &mut [u8]) -> usize {
        let lane = self.rx;
        let (prod_cursor, cons_cursor) = self.cursors(lane.buf);
        let prod = prod_cursor.load(Ordering::Acquire);
        let cons = cons_cursor.load(Ordering::Relaxed);

        let ready = lane.pending(prod, cons);
        let start = lane.mask(cons);
        let len = buf.len().min(ready).min(lane.capacity - start);
        if len == 0 {
            return 0;
        }

        unsafe {
            // SAFETY: `start + len <= capacity`; the bytes were published by the
            // peer's release store of `prod`, observed by the acquire above.
            ptr::copy_nonoverlapping(self.lane_ptr(lane).add(start), buf.as_mut_ptr(), len);
        }
        cons_cursor.store(cons.wrapping_add(len as u64), Ordering::Release);
        len
    }

    /// Sets this side's closed flag.
    pub fn close_local(&self) {
        self.local_flag().store(1, Ordering::Release);
    }

    /// True once this side has set its closed flag.
    pub fn local_closed(&self) -> bool {
        self.local_flag().load(Ordering::Acquire) != 0
    }

    /// True once the peer has set its closed flag.
    pub fn peer_closed(&self) -> bool {
        self.peer_flag().load(Ordering::Acquire) != 0
    }

    fn header(&self) -> &RingHeader {
        unsafe {
            // SAFETY: the header sits at the start of a live, page-aligned
            // mapping of at least PAGE_SIZE bytes. Every field is an atomic
            // integer, so any bit pattern the peer leaves there is valid.
            &*(self.page.as_ptr() as *const RingHeader)
        }
    }

    fn cursors(&self, buf: Buf) -> (&AtomicU64, &AtomicU64) {
        let header = self.header();
        match buf {
            Buf::In => (&header.prod_in, &header.cons_in),
            Buf::Out => (&header.prod_out, &header.cons_out),
        }
    }

    fn local_flag(&self) -> &AtomicU32 {
        let header = self.header();
        match self.role {
            Role::Server => &header.server_closed,
            Role::Client => &header.client_closed,
        }
    }

    fn peer_flag(&self) -> &AtomicU32 {
        let header = self.header();
        match self.role {
            Role::Server => &header.client_closed,
            Role::Client => &header.server_closed,
        }
    }

    fn lane_ptr(&self, lane: Lane) -> *mut u8 {
        unsafe {
            // SAFETY: lane offsets are const-checked to lie inside the page.
            self.page.as_ptr().add(lane.offset)
        }
    }
}
