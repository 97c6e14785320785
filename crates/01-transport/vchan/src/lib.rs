//! Shared-memory byte channels between two domains.
//!
//! A channel is one page holding two single-producer/single-consumer byte
//! rings plus a notification channel for wakeups:
//! * [`PageArena`] / [`SharedPage`] – grantable pages both peers map.
//! * [`RingBuffer`] – the ring pair with role-relative directions.
//! * [`EventChannel`] – coalescing pings and attach/hang-up detection.
//! * [`DiscoveryStore`] – hierarchical key/value store used for rendezvous.
//! * [`Vchan`] – the public stream composing all of the above.

mod channel;
pub mod discovery;
mod error;
pub mod notify;
mod page;
mod ring;

pub use channel::{ConnectionState, Vchan, VchanContext};
pub use discovery::{ChannelKeys, DirStore, DiscoveryError, DiscoveryStore, DomainId, MemoryStore};
pub use error::{VchanError, VchanResult};
pub use notify::{EventChannel, EventPort, Events};
pub use page::{FrameNumber, PageArena, SharedPage, PAGE_SIZE};
pub use ring::{RingBuffer, Role, RING_MAGIC};
