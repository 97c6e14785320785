//! Fixed little-endian wire structs of the file-stream protocol.
//!
//! ```text
//! session := (FileHeader name[namelen] body[filelen]?)* FileHeader{namelen=0}
//! response := ResultHeader
//! ```

/// Upper bound for names and symlink targets, in bytes.
pub const MAX_PATH_LENGTH: usize = 16384;

pub const S_IFMT: u32 = 0o170_000;
pub const S_IFREG: u32 = 0o100_000;
pub const S_IFDIR: u32 = 0o040_000;
pub const S_IFLNK: u32 = 0o120_000;

/// Permission bits the receiver applies; setuid and setgid never survive.
pub const MODE_MASK: u32 = 0o1777;

/// Entry type recovered from the mode bits of a header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
}

impl FileKind {
    pub fn from_mode(mode: u32) -> Option<Self> {
        match mode & S_IFMT {
            S_IFREG => Some(Self::Regular),
            S_IFDIR => Some(Self::Directory),
            S_IFLNK => Some(Self::Symlink),
            _ => None,
        }
    }

    pub fn type_bits(self) -> u32 {
        match self {
            Self::Regular => S_IFREG,
            Self::Directory => S_IFDIR,
            Self::Symlink => S_IFLNK,
        }
    }
}

/// Per-entry header, authored by the sender and untrusted by the receiver.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FileHeader {
    pub namelen: u32,
    pub mode: u32,
    pub filelen: u64,
    pub atime: u32,
    pub atime_nsec: u32,
    pub mtime: u32,
    pub mtime_nsec: u32,
}

impl FileHeader {
    pub const SIZE: usize = 32;

    /// The end-of-stream marker.
    pub fn terminator() -> Self {
        Self::default()
    }

    pub fn is_terminator(&self) -> bool {
        self.namelen == 0
    }

    pub fn kind(&self) -> Option<FileKind> {
        FileKind::from_mode(self.mode)
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&self.namelen.to_le_bytes());
        out[4..8].copy_from_slice(&self.mode.to_le_bytes());
        out[8..16].copy_from_slice(&self.filelen.to_le_bytes());
        out[16..20].copy_from_slice(&self.atime.to_le_bytes());
        out[20..24].copy_from_slice(&self.atime_nsec.to_le_bytes());
        out[24..28].copy_from_slice(&self.mtime.to_le_bytes());
        out[28..32].copy_from_slice(&self.mtime_nsec.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        Self {
            namelen: le_u32(bytes, 0),
            mode: le_u32(bytes, 4),
            filelen: le_u64(bytes, 8),
            atime: le_u32(bytes, 16),
            atime_nsec: le_u32(bytes, 20),
            mtime: le_u32(bytes, 24),
            mtime_nsec: le_u32(bytes, 28),
        }
    }
}

/// Final status written back by the receiver.
///
/// The checksum field is `unsigned long` wide on the wire, so 8 bytes
/// follow the code; the upper half of the checksum is always zero.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResultHeader {
    pub error_code: u32,
    pub crc32: u32,
}

impl ResultHeader {
    pub const SIZE: usize = 16;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&self.error_code.to_le_bytes());
        out[8..16].copy_from_slice(&u64::from(self.crc32).to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        Self {
            error_code: le_u32(bytes, 0),
            // A checksum with upper bits set never matches.
            crc32: u32::try_from(le_u64(bytes, 8)).unwrap_or(u32::MAX),
        }
    }
}

fn le_u32(bytes: &[u8], at: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(word)
}

fn le_u64(bytes: &[u8], at: usize) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(word)
}
