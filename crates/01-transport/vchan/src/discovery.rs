//! Handshake discovery store.
//!
//! The server publishes two string-encoded integers (shared page frame and
//! notification port) under a key namespaced by both domain ids and the
//! channel number; the client reads them once to attach, and the server
//! removes them as soon as the client has attached.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use thiserror::Error;

use crate::error::{VchanError, VchanResult};
use crate::notify::EventPort;
use crate::page::FrameNumber;

/// Identity of a domain (virtual machine) on the platform.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DomainId(pub u32);

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("invalid discovery key {0:?}")]
    InvalidKey(String),

    #[error("discovery store I/O on {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: io::Error,
    },
}

/// Hierarchical key/value store shared by the two domains.
///
/// Keys are absolute, `/`-separated paths. Removing a key removes every key
/// below it.
pub trait DiscoveryStore: Send + Sync {
    fn write(&self, key: &str, value: &str) -> Result<(), DiscoveryError>;
    fn read(&self, key: &str) -> Result<Option<String>, DiscoveryError>;
    fn remove(&self, key: &str) -> Result<(), DiscoveryError>;
}

/// In-process store, for channels whose two ends live in one process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl DiscoveryStore for MemoryStore {
    fn write(&self, key: &str, value: &str) -> Result<(), DiscoveryError> {
        validate_key(key)?;
        self.entries.lock().insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn read(&self, key: &str) -> Result<Option<String>, DiscoveryError> {
        validate_key(key)?;
        Ok(self.entries.lock().get(key).cloned())
    }

    fn remove(&self, key: &str) -> Result<(), DiscoveryError> {
        validate_key(key)?;
        let prefix = format!("{key}/");
        self.entries
            .lock()
            .retain(|k, _| k != key && !k.starts_with(&prefix));
        Ok(())
    }
}

/// Store backed by a directory tree, one file per key, shareable between
/// processes. A key cannot hold a value and children at the same time.
#[derive(Clone, Debug)]
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, DiscoveryError> {
        validate_key(key)?;
        Ok(self.root.join(key.trim_start_matches('/')))
    }
}

impl DiscoveryStore for DirStore {
    fn write(&self, key: &str, value: &str) -> Result<(), DiscoveryError> {
        let path = self.path_for(key)?;
        let io_err = |source| DiscoveryError::Io {
            key: key.to_owned(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        // Readers must never observe a half-written value.
        let tmp = temp_sibling(&path);
        fs::write(&tmp, value).map_err(io_err)?;
        fs::rename(&tmp, &path).map_err(io_err)
    }

    fn read(&self, key: &str) -> Result<Option<String>, DiscoveryError> {
        let path = self.path_for(key)?;
        match fs::read_to_string(&path) {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(DiscoveryError::Io {
                key: key.to_owned(),
                source,
            }),
        }
    }

    fn remove(&self, key: &str) -> Result<(), DiscoveryError> {
        let path = self.path_for(key)?;
        let result = match fs::symlink_metadata(&path) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&path),
            Ok(_) => fs::remove_file(&path),
            Err(err) => Err(err),
        };
        match result {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(DiscoveryError::Io {
                key: key.to_owned(),
                source,
            }),
        }
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.tmp"))
}

fn validate_key(key: &str) -> Result<(), DiscoveryError> {
    let valid = key.strip_prefix('/').is_some_and(|rest| {
        rest.split('/')
            .all(|part| !part.is_empty() && !part.starts_with('.') && !part.contains('\0'))
    });
    if valid {
        Ok(())
    } else {
        Err(DiscoveryError::InvalidKey(key.to_owned()))
    }
}

/// Keys used by one channel between `server` and `client` on `port`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelKeys {
    base: String,
}

impl ChannelKeys {
    pub fn new(server: DomainId, client: DomainId, port: u32) -> Self {
        Self {
            base: format!("/local/domain/{server}/device/vchan/{client}/{port}"),
        }
    }

    /// Directory key holding both records.
    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn ring_ref(&self) -> String {
        format!("{}/ring-ref", self.base)
    }

    pub fn event_channel(&self) -> String {
        format!("{}/event-channel", self.base)
    }

    pub(crate) fn publish(
        &self,
        store: &dyn DiscoveryStore,
        frame: FrameNumber,
        port: EventPort,
    ) -> VchanResult<()> {
        store.write(&self.ring_ref(), &frame.to_string())?;
        store.write(&self.event_channel(), &port.to_string())?;
        Ok(())
    }

    pub(crate) fn lookup(
        &self,
        store: &dyn DiscoveryStore,
    ) -> VchanResult<(FrameNumber, EventPort)> {
        let frame = read_record(store, &self.ring_ref())?;
        let port = read_record(store, &self.event_channel())?;
        Ok((frame, port))
    }

    pub(crate) fn clear(&self, store: &dyn DiscoveryStore) -> VchanResult<()> {
        store.remove(&self.base)?;
        Ok(())
    }
}

fn read_record<T: std::str::FromStr>(store: &dyn DiscoveryStore, key: &str) -> VchanResult<T> {
    let value = store
        .read(key)?
        .ok_or_else(|| VchanError::NotPublished {
            key: key.to_owned(),
        })?;
    value
        .trim()
        .parse()
        .map_err(|_| VchanError::MalformedRecord {
            key: key.to_owned(),
            value,
        })
}
