//! Confinement of the receiving process.
//!
//! The steps run strictly in order, and the decoder only ever sees a
//! [`Confined`] token, so it cannot run before every step succeeded:
//!
//! ```text
//! ResolveIdentity → CreateDestination → EnterDestination → ChangeRoot
//!                 → DropGroups → DropUser
//! ```
//!
//! The directory change happens before the root change, so no path computed
//! outside the new root survives into it.

use std::ffi::{CStr, CString};
use std::fmt;
use std::fs::DirBuilder;
use std::io::{self, ErrorKind};
use std::os::unix::fs::{chown, DirBuilderExt};
use std::path::{Path, PathBuf};
use std::ptr;

use thiserror::Error;
use tracing::{debug, info};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    ResolveIdentity,
    CreateDestination,
    EnterDestination,
    ChangeRoot,
    DropGroups,
    DropUser,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ResolveIdentity => "resolve identity",
            Self::CreateDestination => "create destination",
            Self::EnterDestination => "enter destination",
            Self::ChangeRoot => "change root",
            Self::DropGroups => "drop groups",
            Self::DropUser => "drop user",
        })
    }
}

#[derive(Debug, Error)]
#[error("sandbox step `{step}` failed")]
pub struct SandboxError {
    pub step: Step,
    #[source]
    pub source: io::Error,
}

/// Numeric identity the receiver runs as.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    /// Account name, when the uid has a passwd entry; used for
    /// supplementary groups.
    pub name: Option<CString>,
    pub uid: libc::uid_t,
    pub gid: libc::gid_t,
}

/// Resolves a user name, or a numeric uid, through the passwd database.
pub fn resolve_identity(user: &str) -> io::Result<Identity> {
    if let Ok(uid) = user.parse::<libc::uid_t>() {
        return Ok(lookup(Key::Uid(uid))?.unwrap_or(Identity {
            name: None,
            uid,
            gid: uid,
        }));
    }

    let name = CString::new(user)
        .map_err(|_| io::Error::new(ErrorKind::InvalidInput, "user name contains NUL"))?;
    lookup(Key::Name(&name))?.ok_or_else(|| {
        io::Error::new(ErrorKind::NotFound, format!("no such user {user:?}"))
    })
}

#[derive(Clone, Copy)]
enum Key<'a> {
    Name(&'a CStr),
    Uid(libc::uid_t),
}

fn lookup(key: Key<'_>) -> io::Result<Option<Identity>> {
    // SAFETY: sysconf has no preconditions.
    let hint = unsafe { libc::sysconf(libc::_SC_GETPW_R_SIZE_MAX) };
    let mut buf: Vec<libc::c_char> = vec![0; usize::try_from(hint).unwrap_or(16384).max(1024)];

    loop {
        // SAFETY: passwd is plain data, fully written on success.
        let mut entry: libc::passwd = unsafe { std::mem::zeroed() };
        let mut found: *mut libc::passwd = ptr::null_mut();
        // SAFETY: every pointer is valid for the duration of the call and
        // `buf.len()` is the true buffer size.
        let ret = unsafe {
            match key {
                Key::Name(name) => libc::getpwnam_r(
                    name.as_ptr(),
                    &mut entry,
                    buf.as_mut_ptr(),
                    buf.len(),
                    &mut found,
                ),
                Key::Uid(uid) => {
                    libc::getpwuid_r(uid, &mut entry, buf.as_mut_ptr(), buf.len(), &mut found)
                }
            }
        };

        if ret == libc::ERANGE && buf.len() < (1 << 20) {
            let grown = buf.len() * 2;
            buf.resize(grown, 0);
            continue;
        }
        if ret != 0 {
            return Err(io::Error::from_raw_os_error(ret));
        }
        if found.is_null() {
            return Ok(None);
        }

        // SAFETY: on success pw_name points at a NUL-terminated string in `buf`.
        let name = unsafe { CStr::from_ptr(entry.pw_name) }.to_owned();
        return Ok(Some(Identity {
            name: Some(name),
            uid: entry.pw_uid,
            gid: entry.pw_gid,
        }));
    }
}

/// Proof that the process is confined; the filesystem root is the
/// destination directory.
#[derive(Debug)]
pub struct Confined {
    identity: Identity,
}

impl Confined {
    /// Root to unpack under, as seen from inside the confinement.
    pub fn root(&self) -> &Path {
        Path::new("/")
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }
}

/// Ordered setup of the receiving process.
#[derive(Clone, Debug)]
pub struct Sandbox {
    user: String,
    destination: PathBuf,
}

impl Sandbox {
    pub fn new(user: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            user: user.into(),
            destination: destination.into(),
        }
    }

    /// Runs every step; the process is irrevocably changed once
    /// [`Step::ChangeRoot`] has run, even if a later step fails.
    pub fn enter(self) -> Result<Confined, SandboxError> {
        let identity = step(Step::ResolveIdentity, || resolve_identity(&self.user))?;
        step(Step::CreateDestination, || {
            create_destination(&self.destination, &identity)
        })?;
        step(Step::EnterDestination, || {
            std::env::set_current_dir(&self.destination)
        })?;
        step(Step::ChangeRoot, change_root)?;
        step(Step::DropGroups, || drop_groups(&identity))?;
        step(Step::DropUser, || drop_user(&identity))?;

        info!(
            uid = identity.uid,
            gid = identity.gid,
            destination = %self.destination.display(),
            "receiver confined"
        );
        Ok(Confined { identity })
    }
}

fn step<T>(step: Step, run: impl FnOnce() -> io::Result<T>) -> Result<T, SandboxError> {
    debug!(%step, "sandbox step");
    run().map_err(|source| SandboxError { step, source })
}

fn create_destination(destination: &Path, identity: &Identity) -> io::Result<()> {
    DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(destination)?;
    chown(destination, Some(identity.uid), Some(identity.gid))
}

fn change_root() -> io::Result<()> {
    // SAFETY: the argument is a valid NUL-terminated string.
    if unsafe { libc::chroot(c".".as_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    std::env::set_current_dir("/")
}

fn drop_groups(identity: &Identity) -> io::Result<()> {
    // SAFETY: pointers are valid for the duration of each call.
    let ret = unsafe {
        match &identity.name {
            Some(name) => libc::initgroups(name.as_ptr(), identity.gid),
            None => libc::setgroups(1, &identity.gid),
        }
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: setgid has no memory preconditions.
    if unsafe { libc::setgid(identity.gid) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn drop_user(identity: &Identity) -> io::Result<()> {
    // SAFETY: setuid has no memory preconditions.
    if unsafe { libc::setuid(identity.uid) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
