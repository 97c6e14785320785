//! Receiving side of the file-stream protocol.
//!
//! The decoder trusts nothing it reads. Every name is validated before it
//! reaches the filesystem, parents are walked without following symlinks,
//! files are created exclusively, and quotas are enforced on declared sizes
//! before any body byte is stored. A fault ends the session immediately.

use std::ffi::OsStr;
use std::fs::{self, DirBuilder, OpenOptions, Permissions};
use std::io::{self, ErrorKind, Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{symlink, DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use filetime::FileTime;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::code::ErrorCode;
use crate::crc::{read_full, CrcReader};
use crate::status::StatusReporter;
use crate::wire::{FileHeader, FileKind, MAX_PATH_LENGTH, MODE_MASK};

/// Per-session quotas; zero means unlimited.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Limits {
    pub max_bytes: u64,
    pub max_files: u64,
}

impl Limits {
    pub fn unlimited() -> Self {
        Self::default()
    }
}

#[derive(Debug, Error)]
pub enum UnpackError {
    #[error("sender closed the stream without a terminator")]
    LegalEof,
    #[error("stream ended in the middle of an entry")]
    UnexpectedEof,
    #[error("failed to read the stream")]
    Stream(#[source] io::Error),
    #[error("name length {0} exceeds {MAX_PATH_LENGTH}")]
    NameTooLong(u32),
    #[error("symlink target length {0} exceeds {MAX_PATH_LENGTH}")]
    LinkTargetTooLong(u64),
    #[error("{name:?} has unsupported mode {mode:o}")]
    UnsupportedFileType { name: String, mode: u32 },
    #[error("refusing unsafe name {0:?}")]
    InvalidPath(String),
    #[error("{op} {path:?} failed")]
    Filesystem {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("byte quota of {limit} exceeded ({total} bytes declared)")]
    ByteQuotaExceeded { total: u64, limit: u64 },
    #[error("file quota of {limit} exceeded")]
    FileQuotaExceeded { limit: u64 },
}

impl UnpackError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::LegalEof => ErrorCode::LegalEof,
            Self::UnexpectedEof | Self::Stream(_) => ErrorCode::UnexpectedEof,
            Self::NameTooLong(_) => ErrorCode::NameTooLong,
            Self::LinkTargetTooLong(_) => ErrorCode::LinkTargetTooLong,
            Self::UnsupportedFileType { .. } => ErrorCode::UnsupportedFileType,
            Self::InvalidPath(_) => ErrorCode::InvalidPath,
            Self::Filesystem { .. } => ErrorCode::Filesystem,
            Self::ByteQuotaExceeded { .. } => ErrorCode::ByteQuotaExceeded,
            Self::FileQuotaExceeded { .. } => ErrorCode::FileQuotaExceeded,
        }
    }
}

/// Decodes one session into the directory tree under `root`.
pub struct Unpacker<R> {
    input: CrcReader<R>,
    root: PathBuf,
    limits: Limits,
    bytes: u64,
    files: u64,
}

impl<R: Read> Unpacker<R> {
    pub fn new(input: R, root: impl Into<PathBuf>, limits: Limits) -> Self {
        Self {
            input: CrcReader::new(input),
            root: root.into(),
            limits,
            bytes: 0,
            files: 0,
        }
    }

    /// CRC-32 over every byte consumed so far.
    pub fn crc(&self) -> u32 {
        self.input.crc()
    }

    /// Entries processed so far, including the one that faulted.
    pub fn files(&self) -> u64 {
        self.files
    }

    /// Sum of declared regular-file lengths so far.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn into_inner(self) -> R {
        self.input.into_inner()
    }

    /// Decodes entries until the terminator header or the first fault.
    pub fn run(&mut self) -> Result<(), UnpackError> {
        let result = self.run_entries();
        match &result {
            Ok(()) => info!(files = self.files, bytes = self.bytes, "session complete"),
            Err(UnpackError::LegalEof) => {
                info!(files = self.files, "sender stopped between entries")
            }
            Err(err) => error!(
                code = err.code().as_u32(),
                "unpack failed: {}",
                error_chain(err)
            ),
        }
        result
    }

    fn run_entries(&mut self) -> Result<(), UnpackError> {
        while let Some(header) = self.read_header()? {
            self.process(header)?;
        }
        Ok(())
    }

    fn read_header(&mut self) -> Result<Option<FileHeader>, UnpackError> {
        let mut raw = [0u8; FileHeader::SIZE];
        match read_full(&mut self.input, &mut raw).map_err(UnpackError::Stream)? {
            0 => Err(UnpackError::LegalEof),
            FileHeader::SIZE => {
                let header = FileHeader::from_bytes(&raw);
                Ok((!header.is_terminator()).then_some(header))
            }
            _ => Err(UnpackError::UnexpectedEof),
        }
    }

    fn read_exact(&mut self, len: usize) -> Result<Vec<u8>, UnpackError> {
        let mut buf = vec![0u8; len];
        if read_full(&mut self.input, &mut buf).map_err(UnpackError::Stream)? != len {
            return Err(UnpackError::UnexpectedEof);
        }
        Ok(buf)
    }

    fn process(&mut self, header: FileHeader) -> Result<(), UnpackError> {
        if header.namelen as usize > MAX_PATH_LENGTH {
            return Err(UnpackError::NameTooLong(header.namelen));
        }
        let raw_name = self.read_exact(header.namelen as usize)?;
        let name = validate_name(&raw_name)?;
        let kind = header.kind().ok_or_else(|| UnpackError::UnsupportedFileType {
            name: name.display().to_string(),
            mode: header.mode,
        })?;

        self.files += 1;
        if self.limits.max_files != 0 && self.files > self.limits.max_files {
            return Err(UnpackError::FileQuotaExceeded {
                limit: self.limits.max_files,
            });
        }

        self.check_parents(&name)?;
        let path = self.root.join(&name);
        debug!(name = %name.display(), ?kind, len = header.filelen, "unpacking entry");
        match kind {
            FileKind::Regular => self.extract_file(&path, &header),
            FileKind::Directory => extract_directory(&path, &header),
            FileKind::Symlink => self.extract_symlink(&path, &header),
        }
    }

    /// Every parent must already be a real directory under the root.
    fn check_parents(&self, name: &Path) -> Result<(), UnpackError> {
        let mut parents: Vec<&Path> = name
            .ancestors()
            .skip(1)
            .filter(|parent| !parent.as_os_str().is_empty())
            .collect();
        parents.reverse();

        for parent in parents {
            let path = self.root.join(parent);
            match fs::symlink_metadata(&path) {
                Ok(meta) if meta.is_dir() => {}
                Ok(_) => return Err(UnpackError::InvalidPath(name.display().to_string())),
                Err(source) => {
                    return Err(UnpackError::Filesystem {
                        op: "stat",
                        path,
                        source,
                    })
                }
            }
        }
        Ok(())
    }

    fn extract_file(&mut self, path: &Path, header: &FileHeader) -> Result<(), UnpackError> {
        self.bytes = self.bytes.saturating_add(header.filelen);
        if self.limits.max_bytes != 0 && self.bytes > self.limits.max_bytes {
            return Err(UnpackError::ByteQuotaExceeded {
                total: self.bytes,
                limit: self.limits.max_bytes,
            });
        }

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .custom_flags(libc::O_NOFOLLOW | libc::O_CLOEXEC)
            .open(path)
            .map_err(fs_error("create", path))?;

        let mut buf = [0u8; 8192];
        let mut left = header.filelen;
        while left > 0 {
            let want = usize::try_from(left).map_or(buf.len(), |left| left.min(buf.len()));
            let n = read_full(&mut self.input, &mut buf[..want]).map_err(UnpackError::Stream)?;
            if n == 0 {
                return Err(UnpackError::UnexpectedEof);
            }
            file.write_all(&buf[..n]).map_err(fs_error("write", path))?;
            left -= n as u64;
        }

        file.set_permissions(Permissions::from_mode(header.mode & MODE_MASK))
            .map_err(fs_error("chmod", path))?;
        filetime::set_file_handle_times(&file, Some(atime(header)), Some(mtime(header)))
            .map_err(fs_error("utime", path))
    }

    fn extract_symlink(&mut self, path: &Path, header: &FileHeader) -> Result<(), UnpackError> {
        let len = usize::try_from(header.filelen)
            .ok()
            .filter(|len| *len <= MAX_PATH_LENGTH)
            .ok_or(UnpackError::LinkTargetTooLong(header.filelen))?;
        let raw = self.read_exact(len)?;
        let target = raw.strip_suffix(&[0]).unwrap_or(&raw);
        if target.contains(&0) {
            return Err(UnpackError::InvalidPath(
                String::from_utf8_lossy(target).into_owned(),
            ));
        }
        symlink(OsStr::from_bytes(target), path).map_err(fs_error("symlink", path))
    }
}

/// Directories may arrive again after their contents; then only metadata
/// is updated.
fn extract_directory(path: &Path, header: &FileHeader) -> Result<(), UnpackError> {
    if let Err(err) = DirBuilder::new().mode(0o700).create(path) {
        let exists_as_dir = err.kind() == ErrorKind::AlreadyExists
            && fs::symlink_metadata(path).is_ok_and(|meta| meta.is_dir());
        if !exists_as_dir {
            return Err(fs_error("mkdir", path)(err));
        }
    }

    fs::set_permissions(path, Permissions::from_mode(header.mode & MODE_MASK))
        .map_err(fs_error("chmod", path))?;
    filetime::set_file_times(path, atime(header), mtime(header)).map_err(fs_error("utime", path))
}

/// Accepts a relative name of plain components, with one optional
/// trailing NUL.
fn validate_name(raw: &[u8]) -> Result<PathBuf, UnpackError> {
    let name = raw.strip_suffix(&[0]).unwrap_or(raw);
    let safe = !name.is_empty()
        && !name.contains(&0)
        && name
            .split(|byte| *byte == b'/')
            .all(|part| !part.is_empty() && part != b"." && part != b"..");
    if !safe {
        return Err(UnpackError::InvalidPath(
            String::from_utf8_lossy(name).into_owned(),
        ));
    }
    Ok(PathBuf::from(OsStr::from_bytes(name)))
}

fn fs_error<'a>(op: &'static str, path: &'a Path) -> impl FnOnce(io::Error) -> UnpackError + 'a {
    move |source| UnpackError::Filesystem {
        op,
        path: path.to_path_buf(),
        source,
    }
}

fn atime(header: &FileHeader) -> FileTime {
    FileTime::from_unix_time(i64::from(header.atime), header.atime_nsec.min(999_999_999))
}

fn mtime(header: &FileHeader) -> FileTime {
    FileTime::from_unix_time(i64::from(header.mtime), header.mtime_nsec.min(999_999_999))
}

fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// Runs one receiver session: decodes `input` under `root`, records the
/// outcome on `status` and writes the response.
///
/// A reporter dropped before recording still answers, with
/// [`ErrorCode::Internal`].
pub fn unpack_session<R: Read, W: Write>(
    input: R,
    mut status: StatusReporter<W>,
    root: &Path,
    limits: Limits,
) -> io::Result<ErrorCode> {
    let mut unpacker = Unpacker::new(input, root, limits);
    let code = match unpacker.run() {
        Ok(()) => ErrorCode::Ok,
        Err(err) => err.code(),
    };
    status.record(code, unpacker.crc());
    status.finish()?;
    Ok(code)
}
