//! Shared page allocation.
//!
//! A channel occupies exactly one page that both domains map. The allocating
//! side creates the page inside a [`PageArena`] and publishes its
//! [`FrameNumber`]; the peer maps the same frame read/write. Only raw pointers
//! leave this module, and only [`crate::ring`] dereferences them.

use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use memmap2::{MmapOptions, MmapRaw};
use parking_lot::Mutex;
use tracing::{debug, warn};

/// Size of the page shared between the two domains.
pub const PAGE_SIZE: usize = 4096;

/// Opaque handle naming a page inside an arena; published to the peer.
pub type FrameNumber = u64;

/// Upper bound on frame numbers probed while looking for a free page.
const MAX_FRAMES: FrameNumber = 1 << 16;

/// Directory-backed pool of pages shareable between processes.
#[derive(Clone, Debug)]
pub struct PageArena {
    dir: PathBuf,
}

impl PageArena {
    /// Opens (creating if needed) the arena rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Directory holding the page files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Allocates a fresh zeroed page owned by the caller.
    ///
    /// Frame numbers are handed out first-free starting at 1, so a stale page
    /// left behind by a crashed process only costs one slot.
    pub fn allocate(&self) -> io::Result<SharedPage> {
        for frame in 1..=MAX_FRAMES {
            let path = self.page_path(frame);
            let file = match OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .mode(0o600)
                .open(&path)
            {
                Ok(file) => file,
                Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
                Err(err) => return Err(err),
            };

            let map = match map_page(&file) {
                Ok(map) => map,
                Err(err) => {
                    let _ = fs::remove_file(&path);
                    return Err(err);
                }
            };
            debug!(frame, path = %path.display(), "allocated shared page");
            return Ok(SharedPage {
                map,
                frame: Some(frame),
                published: Mutex::new(Some(path)),
            });
        }

        Err(io::Error::new(
            ErrorKind::OutOfMemory,
            "page arena has no free frame",
        ))
    }

    /// Maps a page allocated by the peer.
    pub fn map(&self, frame: FrameNumber) -> io::Result<SharedPage> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.page_path(frame))?;
        let len = file.metadata()?.len();
        if len != PAGE_SIZE as u64 {
            return Err(io::Error::new(
                ErrorKind::InvalidData,
                format!("page {frame} is {len} bytes, expected {PAGE_SIZE}"),
            ));
        }
        let map = MmapOptions::new().len(PAGE_SIZE).map_raw(&file)?;
        Ok(SharedPage {
            map,
            frame: Some(frame),
            published: Mutex::new(None),
        })
    }

    fn page_path(&self, frame: FrameNumber) -> PathBuf {
        self.dir.join(format!("page-{frame}"))
    }
}

fn map_page(file: &File) -> io::Result<MmapRaw> {
    file.set_len(PAGE_SIZE as u64)?;
    MmapOptions::new().len(PAGE_SIZE).map_raw(file)
}

/// One page of memory mapped into this process and possibly the peer's.
///
/// The contents are mutated concurrently by the other domain, so the page is
/// only ever accessed through raw pointers.
#[derive(Debug)]
pub struct SharedPage {
    map: MmapRaw,
    frame: Option<FrameNumber>,
    published: Mutex<Option<PathBuf>>,
}

impl SharedPage {
    /// Maps a private zeroed page. Both ring roles can be layered over one
    /// anonymous page to exercise the ring inside a single process.
    pub fn anonymous() -> io::Result<Self> {
        let map = MmapOptions::new().len(PAGE_SIZE).map_anon()?;
        Ok(Self {
            map: MmapRaw::from(map),
            frame: None,
            published: Mutex::new(None),
        })
    }

    /// Frame number the peer uses to map this page, if it is shareable.
    pub fn frame(&self) -> Option<FrameNumber> {
        self.frame
    }

    /// Page length in bytes.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Always false; pages have a fixed non-zero size.
    pub fn is_empty(&self) -> bool {
        self.map.len() == 0
    }

    /// Base pointer of the mapping.
    pub fn as_ptr(&self) -> *mut u8 {
        self.map.as_mut_ptr()
    }

    /// Removes the page from the arena so no further process can map it.
    ///
    /// Existing mappings, including the peer's, stay valid.
    pub fn withdraw(&self) -> io::Result<()> {
        if let Some(path) = self.published.lock().take() {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

impl Drop for SharedPage {
    fn drop(&mut self) {
        if let Err(err) = self.withdraw() {
            warn!("failed to withdraw shared page: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_then_map_shares_memory() {
        let dir = tempfile::tempdir().unwrap();
        let arena = PageArena::open(dir.path()).unwrap();
        let owner = arena.allocate().unwrap();
        let frame = owner.frame().expect("file-backed page has a frame");
        let peer = arena.map(frame).unwrap();

        unsafe {
            owner.as_ptr().add(100).write_volatile(0x5A);
            assert_eq!(peer.as_ptr().add(100).read_volatile(), 0x5A);
        }
    }

    #[test]
    fn frames_are_first_free() {
        let dir = tempfile::tempdir().unwrap();
        let arena = PageArena::open(dir.path()).unwrap();
        let a = arena.allocate().unwrap();
        let b = arena.allocate().unwrap();
        assert_eq!(a.frame(), Some(1));
        assert_eq!(b.frame(), Some(2));
        drop(a);
        let c = arena.allocate().unwrap();
        assert_eq!(c.frame(), Some(1));
    }

    #[test]
    fn withdrawn_page_cannot_be_mapped_but_stays_alive() {
        let dir = tempfile::tempdir().unwrap();
        let arena = PageArena::open(dir.path()).unwrap();
        let owner = arena.allocate().unwrap();
        let frame = owner.frame().unwrap();
        let peer = arena.map(frame).unwrap();
        owner.withdraw().unwrap();

        assert!(arena.map(frame).is_err());
        unsafe {
            peer.as_ptr().write_volatile(7);
            assert_eq!(owner.as_ptr().read_volatile(), 7);
        }
    }

    #[test]
    fn mapping_unknown_frame_fails() {
        let dir = tempfile::tempdir().unwrap();
        let arena = PageArena::open(dir.path()).unwrap();
        let err = arena.map(42).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn anonymous_page_is_zeroed() {
        let page = SharedPage::anonymous().unwrap();
        assert_eq!(page.len(), PAGE_SIZE);
        assert!(page.frame().is_none());
        let first = unsafe { page.as_ptr().read_volatile() };
        assert_eq!(first, 0);
    }
}
