//! Backing storage for the page cache

use crate::error::{Error, PageId, Result};
use memmap2::{MmapMut, MmapOptions};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Number of pages every store file holds at minimum (meta, two state pages, root)
const MIN_PAGES: u64 = 4;

/// I/O backend trait
///
/// Pages are addressed by id; reads past the end of the store yield zeroes
/// and writes past the end grow it.
pub trait IoBackend: Send + Sync {
    /// Page size this backend was opened with
    fn page_size(&self) -> usize;

    /// Read a page into `buf`, which must be exactly one page long
    fn read_page(&self, page_id: PageId, buf: &mut [u8]) -> Result<()>;

    /// Write one page of data
    fn write_page(&self, page_id: PageId, data: &[u8]) -> Result<()>;

    /// Sync data to durable storage
    fn sync(&self) -> Result<()>;

    /// Get the current size in pages
    fn size_in_pages(&self) -> u64;

    /// Grow the store to accommodate at least `new_size` pages
    fn grow(&self, new_size: u64) -> Result<()>;

    /// Whether the store was empty when this backend was opened
    fn was_created(&self) -> bool;
}

/// Standard I/O backend using memory mapping
pub struct MmapBackend {
    /// The underlying file
    file: File,
    /// Memory map, replaced on growth
    mmap: Mutex<MmapMut>,
    /// Current file size in bytes
    file_size: AtomicU64,
    /// Page size of the store
    page_size: usize,
    /// Whether the file was created or empty on open
    created: bool,
    /// File path, kept for diagnostics
    path: PathBuf,
}

impl MmapBackend {
    /// Open or create a file-backed store with a default initial size
    pub fn new(path: impl AsRef<Path>, page_size: usize) -> Result<Self> {
        Self::with_options(path, page_size, 1024 * 1024)
    }

    /// Open or create with an initial size in bytes
    pub fn with_options(path: impl AsRef<Path>, page_size: usize, initial_size: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        // Open or create the file
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| Error::Io(e.to_string()))?;

        let metadata = file.metadata().map_err(|e| Error::Io(e.to_string()))?;
        let mut file_size = metadata.len();
        let created = file_size == 0;

        // Ensure minimum size
        let min_size = page_size as u64 * MIN_PAGES;
        if file_size < min_size {
            file_size = initial_size.max(min_size);
            file_size = file_size.div_ceil(page_size as u64) * page_size as u64;
            file.set_len(file_size).map_err(|e| Error::Io(e.to_string()))?;
        }

        // SAFETY: the file is owned by this backend and only accessed through the map.
        let mmap = unsafe {
            MmapOptions::new()
                .len(file_size as usize)
                .map_mut(&file)
                .map_err(|e| Error::Io(e.to_string()))?
        };

        debug!(path = %path.display(), file_size, created, "opened store file");

        Ok(Self {
            file,
            mmap: Mutex::new(mmap),
            file_size: AtomicU64::new(file_size),
            page_size,
            created,
            path,
        })
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check_len(&self, buf_len: usize) -> Result<()> {
        if buf_len != self.page_size {
            return Err(Error::InvalidParameter("buffer length must equal the page size"));
        }
        Ok(())
    }
}

impl IoBackend for MmapBackend {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn read_page(&self, page_id: PageId, buf: &mut [u8]) -> Result<()> {
        self.check_len(buf.len())?;
        let offset = page_id.to_offset(self.page_size) as usize;
        let mmap = self.mmap.lock();
        if offset >= mmap.len() {
            buf.fill(0);
            return Ok(());
        }
        let end = (offset + self.page_size).min(mmap.len());
        let available = end - offset;
        buf[..available].copy_from_slice(&mmap[offset..end]);
        buf[available..].fill(0);
        Ok(())
    }

    fn write_page(&self, page_id: PageId, data: &[u8]) -> Result<()> {
        self.check_len(data.len())?;
        if page_id.0 >= self.size_in_pages() {
            // Double the file, or more if the write lands further out
            let wanted = (page_id.0 + 1).max(self.size_in_pages() * 2);
            self.grow(wanted)?;
        }
        let offset = page_id.to_offset(self.page_size) as usize;
        let mut mmap = self.mmap.lock();
        mmap[offset..offset + self.page_size].copy_from_slice(data);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        let mmap = self.mmap.lock();
        mmap.flush().map_err(|e| Error::Io(e.to_string()))
    }

    fn size_in_pages(&self) -> u64 {
        self.file_size.load(Ordering::Acquire) / self.page_size as u64
    }

    fn grow(&self, new_size: u64) -> Result<()> {
        let mut mmap = self.mmap.lock();
        let new_file_size = new_size * self.page_size as u64;
        let current = self.file_size.load(Ordering::Acquire);
        if new_file_size <= current {
            return Ok(());
        }

        // Flush before resizing so nothing written through the old map is lost
        mmap.flush().map_err(|e| Error::Io(e.to_string()))?;
        self.file.set_len(new_file_size).map_err(|e| Error::Io(e.to_string()))?;

        // SAFETY: the old map is replaced while holding the lock, no references escape it.
        let new_mmap = unsafe {
            MmapOptions::new()
                .len(new_file_size as usize)
                .map_mut(&self.file)
                .map_err(|e| Error::Io(e.to_string()))?
        };
        *mmap = new_mmap;
        self.file_size.store(new_file_size, Ordering::Release);

        debug!(path = %self.path.display(), pages = new_size, "grew store file");
        Ok(())
    }

    fn was_created(&self) -> bool {
        self.created
    }
}

/// Heap-backed store, lost when dropped
pub struct MemoryBackend {
    data: Mutex<Vec<u8>>,
    page_size: usize,
}

impl MemoryBackend {
    /// Create an empty in-memory store
    pub fn new(page_size: usize) -> Self {
        Self { data: Mutex::new(vec![0; page_size * MIN_PAGES as usize]), page_size }
    }
}

impl IoBackend for MemoryBackend {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn read_page(&self, page_id: PageId, buf: &mut [u8]) -> Result<()> {
        if buf.len() != self.page_size {
            return Err(Error::InvalidParameter("buffer length must equal the page size"));
        }
        let offset = page_id.to_offset(self.page_size) as usize;
        let data = self.data.lock();
        if offset >= data.len() {
            buf.fill(0);
        } else {
            buf.copy_from_slice(&data[offset..offset + self.page_size]);
        }
        Ok(())
    }

    fn write_page(&self, page_id: PageId, data: &[u8]) -> Result<()> {
        if data.len() != self.page_size {
            return Err(Error::InvalidParameter("buffer length must equal the page size"));
        }
        let offset = page_id.to_offset(self.page_size) as usize;
        let mut store = self.data.lock();
        if offset + self.page_size > store.len() {
            store.resize(offset + self.page_size, 0);
        }
        store[offset..offset + self.page_size].copy_from_slice(data);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn size_in_pages(&self) -> u64 {
        (self.data.lock().len() / self.page_size) as u64
    }

    fn grow(&self, new_size: u64) -> Result<()> {
        let mut data = self.data.lock();
        let new_len = new_size as usize * self.page_size;
        if new_len > data.len() {
            data.resize(new_len, 0);
        }
        Ok(())
    }

    fn was_created(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_mmap_backend_basic() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.db");

        let backend = MmapBackend::with_options(&path, 512, 512 * 8)?;
        assert!(backend.was_created());
        assert_eq!(backend.size_in_pages(), 8);

        let data = vec![0xAB; 512];
        backend.write_page(PageId(3), &data)?;
        backend.sync()?;

        let mut buf = vec![0; 512];
        backend.read_page(PageId(3), &mut buf)?;
        assert_eq!(buf, data);
        Ok(())
    }

    #[test]
    fn test_mmap_backend_reopen() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.db");

        {
            let backend = MmapBackend::with_options(&path, 256, 0)?;
            backend.write_page(PageId(1), &[7u8; 256])?;
            backend.sync()?;
        }

        let backend = MmapBackend::with_options(&path, 256, 0)?;
        assert!(!backend.was_created());
        let mut buf = vec![0; 256];
        backend.read_page(PageId(1), &mut buf)?;
        assert_eq!(buf, vec![7u8; 256]);
        Ok(())
    }

    #[test]
    fn test_write_past_end_grows() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let backend = MmapBackend::with_options(dir.path().join("grow.db"), 256, 0)?;
        let before = backend.size_in_pages();

        backend.write_page(PageId(before + 10), &[1u8; 256])?;
        assert!(backend.size_in_pages() > before + 10);

        let mut buf = vec![0; 256];
        backend.read_page(PageId(before + 10), &mut buf)?;
        assert_eq!(buf[0], 1);
        Ok(())
    }

    #[test]
    fn test_read_past_end_is_zero() -> Result<()> {
        let backend = MemoryBackend::new(128);
        let mut buf = vec![9u8; 128];
        backend.read_page(PageId(1000), &mut buf)?;
        assert!(buf.iter().all(|&b| b == 0));
        Ok(())
    }

    #[test]
    fn test_buffer_length_checked() {
        let backend = MemoryBackend::new(128);
        let mut buf = vec![0u8; 64];
        assert!(backend.read_page(PageId(0), &mut buf).is_err());
        assert!(backend.write_page(PageId(0), &buf).is_err());
    }
}
