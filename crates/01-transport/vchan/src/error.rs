//! Error surface for channel establishment.
//!
//! Establishment failures (discovery, page mapping, notification binding) are
//! fatal: constructors return one of these and never a half-built channel.
//! Byte I/O on an established channel reports `std::io::Error` instead so the
//! channel can sit behind `Read`/`Write`.

use std::io;

use thiserror::Error;

use crate::discovery::DiscoveryError;
use crate::page::FrameNumber;

/// Convenience result alias for channel establishment.
pub type VchanResult<T, E = VchanError> = Result<T, E>;

/// Errors surfaced while building a [`crate::Vchan`].
#[derive(Debug, Error)]
pub enum VchanError {
    /// The discovery store could not be read or written.
    #[error("discovery store failure: {0}")]
    Discovery(#[from] DiscoveryError),

    /// A discovery record the client needs is absent.
    #[error("discovery key {key} not published")]
    NotPublished { key: String },

    /// A discovery record exists but does not parse as an integer.
    #[error("discovery key {key} holds malformed value {value:?}")]
    MalformedRecord { key: String, value: String },

    /// Allocating a fresh shared page failed.
    #[error("failed to allocate shared page: {0}")]
    PageAlloc(#[source] io::Error),

    /// Mapping the peer's shared page failed.
    #[error("failed to map shared page {frame}: {source}")]
    PageMap {
        frame: FrameNumber,
        #[source]
        source: io::Error,
    },

    /// The mapped page does not carry a ring this side understands.
    #[error("shared page rejected: {0}")]
    InvalidLayout(&'static str),

    /// Allocating or binding the notification endpoint failed.
    #[error("notification channel setup failed: {0}")]
    EventChannel(#[source] io::Error),
}
