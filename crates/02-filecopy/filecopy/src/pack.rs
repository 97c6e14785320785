//! Sending side of the file-stream protocol.

use std::fs::{self, File, Metadata};
use std::io::{self, Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::code::describe_code;
use crate::crc::{copy_exact, read_full, CrcWriter};
use crate::wire::{FileHeader, FileKind, ResultHeader, MAX_PATH_LENGTH};

#[derive(Debug, Error)]
pub enum PackError {
    #[error("failed to read {path:?}")]
    Local {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to send to the receiver")]
    Send(#[source] io::Error),
    #[error("{0:?} has no file name to send it under")]
    NoFileName(PathBuf),
    #[error("{0:?} is not a regular file, directory or symlink")]
    UnsupportedFileType(PathBuf),
    #[error("name of {0:?} is too long")]
    NameTooLong(PathBuf),
    #[error("{0:?} changed size while being sent")]
    FileChanged(PathBuf),
    #[error("receiver response was cut short")]
    ShortResponse(#[source] io::Error),
    #[error("receiver reported: {}", describe_remote(.code))]
    Remote { code: u32 },
    #[error("checksum mismatch: sent {sent:#010x}, receiver saw {received:#010x}")]
    ChecksumMismatch { sent: u32, received: u32 },
}

/// Frames local files into a byte stream.
pub struct Packer<W: Write> {
    out: CrcWriter<W>,
    files: u64,
}

impl<W: Write> Packer<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: CrcWriter::new(out),
            files: 0,
        }
    }

    /// Sends `path` (recursively for directories) under its last component.
    pub fn send_path(&mut self, path: &Path) -> Result<(), PackError> {
        let name = path
            .file_name()
            .ok_or_else(|| PackError::NoFileName(path.to_path_buf()))?;
        self.send_entry(path, Path::new(name))
    }

    /// CRC-32 of every byte sent so far.
    pub fn crc(&self) -> u32 {
        self.out.crc()
    }

    /// Headers sent so far, counting each directory twice.
    pub fn headers_sent(&self) -> u64 {
        self.files
    }

    /// Sends the terminator and returns the CRC of the whole session.
    pub fn finish(&mut self) -> Result<u32, PackError> {
        self.out
            .write_all(&FileHeader::terminator().to_bytes())
            .map_err(PackError::Send)?;
        self.out.flush().map_err(PackError::Send)?;
        Ok(self.out.crc())
    }

    pub fn get_mut(&mut self) -> &mut W {
        self.out.get_mut()
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }

    fn send_entry(&mut self, src: &Path, name: &Path) -> Result<(), PackError> {
        let meta = fs::symlink_metadata(src).map_err(|source| PackError::Local {
            path: src.to_path_buf(),
            source,
        })?;
        let file_type = meta.file_type();

        if file_type.is_dir() {
            self.send_directory(src, name, &meta)
        } else if file_type.is_file() {
            self.send_regular(src, name, &meta)
        } else if file_type.is_symlink() {
            self.send_symlink(src, name, &meta)
        } else {
            Err(PackError::UnsupportedFileType(src.to_path_buf()))
        }
    }

    fn send_directory(
        &mut self,
        src: &Path,
        name: &Path,
        meta: &Metadata,
    ) -> Result<(), PackError> {
        let local = |source| PackError::Local {
            path: src.to_path_buf(),
            source,
        };

        // Owner rwx first so the receiver can populate it whatever the mode.
        let mut header = header_for(FileKind::Directory, meta, 0);
        header.mode |= 0o700;
        self.send_header(header, name)?;

        let mut children = fs::read_dir(src)
            .map_err(local)?
            .map(|entry| entry.map(|entry| entry.file_name()))
            .collect::<io::Result<Vec<_>>>()
            .map_err(local)?;
        children.sort();
        for child in children {
            self.send_entry(&src.join(&child), &name.join(&child))?;
        }

        self.send_header(header_for(FileKind::Directory, meta, 0), name)
    }

    fn send_regular(&mut self, src: &Path, name: &Path, meta: &Metadata) -> Result<(), PackError> {
        let mut file = File::open(src).map_err(|source| PackError::Local {
            path: src.to_path_buf(),
            source,
        })?;
        let len = meta.len();
        self.send_header(header_for(FileKind::Regular, meta, len), name)?;

        // Write failures surface as Send; read failures as Local.
        let mut body = ReadSide {
            inner: &mut file,
            error: None,
        };
        let copied = copy_exact(&mut body, &mut self.out, len);
        if let Some(source) = body.error {
            return Err(PackError::Local {
                path: src.to_path_buf(),
                source,
            });
        }
        if copied.map_err(PackError::Send)? != len {
            return Err(PackError::FileChanged(src.to_path_buf()));
        }
        Ok(())
    }

    fn send_symlink(&mut self, src: &Path, name: &Path, meta: &Metadata) -> Result<(), PackError> {
        let target = fs::read_link(src).map_err(|source| PackError::Local {
            path: src.to_path_buf(),
            source,
        })?;
        let target = target.as_os_str().as_bytes();
        if target.len() > MAX_PATH_LENGTH {
            return Err(PackError::NameTooLong(src.to_path_buf()));
        }
        self.send_header(header_for(FileKind::Symlink, meta, target.len() as u64), name)?;
        self.out.write_all(target).map_err(PackError::Send)
    }

    fn send_header(&mut self, mut header: FileHeader, name: &Path) -> Result<(), PackError> {
        let mut wire_name = name.as_os_str().as_bytes().to_vec();
        wire_name.push(0);
        if wire_name.len() > MAX_PATH_LENGTH {
            return Err(PackError::NameTooLong(name.to_path_buf()));
        }
        header.namelen = wire_name.len() as u32;

        debug!(
            name = %name.display(),
            mode = format_args!("{:o}", header.mode),
            len = header.filelen,
            "sending entry"
        );
        self.out
            .write_all(&header.to_bytes())
            .and_then(|()| self.out.write_all(&wire_name))
            .map_err(PackError::Send)?;
        self.files += 1;
        Ok(())
    }
}

/// Remembers a read error so it is not mistaken for a send error.
struct ReadSide<'a, R> {
    inner: &'a mut R,
    error: Option<io::Error>,
}

impl<R: Read> Read for ReadSide<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf).map_err(|err| {
            let kind = err.kind();
            if kind != io::ErrorKind::Interrupted {
                self.error = Some(err);
            }
            io::Error::from(kind)
        })
    }
}

fn describe_remote(code: &u32) -> String {
    describe_code(*code)
}

fn header_for(kind: FileKind, meta: &Metadata, filelen: u64) -> FileHeader {
    FileHeader {
        namelen: 0,
        mode: kind.type_bits() | (meta.mode() & 0o7777),
        filelen,
        atime: wire_seconds(meta.atime()),
        atime_nsec: wire_nanos(meta.atime_nsec()),
        mtime: wire_seconds(meta.mtime()),
        mtime_nsec: wire_nanos(meta.mtime_nsec()),
    }
}

fn wire_seconds(secs: i64) -> u32 {
    secs.clamp(0, i64::from(u32::MAX)) as u32
}

fn wire_nanos(nanos: i64) -> u32 {
    nanos.clamp(0, 999_999_999) as u32
}

/// Reads the receiver's [`ResultHeader`] and checks it against the CRC of
/// everything sent.
pub fn await_result<R: Read + ?Sized>(reader: &mut R, sent_crc: u32) -> Result<(), PackError> {
    let mut bytes = [0u8; ResultHeader::SIZE];
    let n = read_full(reader, &mut bytes).map_err(PackError::ShortResponse)?;
    if n != bytes.len() {
        return Err(PackError::ShortResponse(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("got {n} of {} response bytes", ResultHeader::SIZE),
        )));
    }

    let result = ResultHeader::from_bytes(&bytes);
    if result.error_code != 0 {
        return Err(PackError::Remote {
            code: result.error_code,
        });
    }
    if result.crc32 != sent_crc {
        return Err(PackError::ChecksumMismatch {
            sent: sent_crc,
            received: result.crc32,
        });
    }
    Ok(())
}
