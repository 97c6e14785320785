//! File-stream protocol for copying files out of an untrusted sender.
//!
//! * [`Packer`] frames local files into a byte stream and [`await_result`]
//!   checks the receiver's answer.
//! * [`Unpacker`] decodes the stream with quotas and path containment.
//! * [`StatusReporter`] guarantees the final [`ResultHeader`] is written.
//! * [`Sandbox`] confines the receiving process before any input is read.

mod code;
pub mod crc;
mod pack;
mod sandbox;
mod status;
mod unpack;
pub mod wire;

pub use code::{describe_code, ErrorCode};
pub use pack::{await_result, PackError, Packer};
pub use sandbox::{resolve_identity, Confined, Identity, Sandbox, SandboxError, Step};
pub use status::StatusReporter;
pub use unpack::{unpack_session, Limits, UnpackError, Unpacker};
pub use wire::{FileHeader, FileKind, ResultHeader, MAX_PATH_LENGTH};
