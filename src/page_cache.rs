//! Page cache with optimistic, retry-based concurrent reads
//!
//! Pages are kept in memory as arrays of relaxed atomics so a writer and any
//! number of readers can touch the same page without locks. Every page carries
//! a version counter: a write pin makes it odd, the matching unpin makes it even
//! again. A read cursor remembers the version it started from and
//! [`PageCursor::should_retry`] tells it whether a write overlapped the reads
//! it did since, in which case the reads must be redone.

use crate::error::{Error, PageId, Result};
use crate::io::IoBackend;
use byteorder::{BigEndian, ByteOrder};
use crossbeam_utils::Backoff;
use parking_lot::RwLock;
use std::sync::atomic::{fence, AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Smallest page size the tree can lay out its state and nodes in
pub const MIN_PAGE_SIZE: usize = 128;

/// Largest supported page size
pub const MAX_PAGE_SIZE: usize = 1 << 20;

/// What a cursor intends to do with the pages it pins
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinIntent {
    /// Shared read, must be validated with `should_retry`
    Read,
    /// Write by the single writer, makes concurrent readers retry
    Write,
}

/// A cached page
struct Page {
    /// Even when stable, odd while write-pinned
    version: AtomicU64,
    /// Set when the page was written since the last flush
    dirty: AtomicBool,
    data: Box<[AtomicU8]>,
}

impl Page {
    fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            version: AtomicU64::new(0),
            dirty: AtomicBool::new(false),
            data: bytes.iter().map(|&b| AtomicU8::new(b)).collect(),
        }
    }

    #[inline]
    fn load(&self, index: usize) -> u8 {
        self.data[index].load(Ordering::Relaxed)
    }

    #[inline]
    fn store(&self, index: usize, value: u8) {
        self.data[index].store(value, Ordering::Relaxed);
    }

    fn begin_write(&self) {
        self.version.fetch_add(1, Ordering::Acquire);
        fence(Ordering::Release);
    }

    fn end_write(&self) {
        self.version.fetch_add(1, Ordering::Release);
        self.dirty.store(true, Ordering::Release);
    }

    /// Spin until no write pin is held and return the version
    fn stable_version(&self) -> u64 {
        let backoff = Backoff::new();
        loop {
            let version = self.version.load(Ordering::Acquire);
            if version & 1 == 0 {
                return version;
            }
            backoff.snooze();
        }
    }

    fn snapshot(&self, buf: &mut [u8]) {
        for (dst, src) in buf.iter_mut().zip(self.data.iter()) {
            *dst = src.load(Ordering::Relaxed);
        }
    }
}

/// In-memory cache of fixed-size pages in front of an [`IoBackend`]
pub struct PageCache {
    backend: Box<dyn IoBackend>,
    page_size: usize,
    pages: RwLock<Vec<Option<Arc<Page>>>>,
}

impl PageCache {
    /// Create a cache over a backend
    pub fn new(backend: Box<dyn IoBackend>) -> Result<Self> {
        let page_size = backend.page_size();
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) {
            return Err(Error::InvalidParameter("page size out of supported range"));
        }
        Ok(Self { backend, page_size, pages: RwLock::new(Vec::new()) })
    }

    /// Page size in bytes
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Whether the underlying store was created by this open
    pub fn was_created(&self) -> bool {
        self.backend.was_created()
    }

    /// Number of pages either cached or present in the store
    pub fn size_in_pages(&self) -> u64 {
        (self.pages.read().len() as u64).max(self.backend.size_in_pages())
    }

    /// Open an unpinned cursor
    pub fn cursor(&self, intent: PinIntent) -> PageCursor<'_> {
        PageCursor {
            cache: self,
            intent,
            page: None,
            page_id: PageId(0),
            offset: 0,
            out_of_bounds: false,
            read_version: 0,
        }
    }

    /// Open a cursor pinned to `page_id`
    pub fn io(&self, page_id: PageId, intent: PinIntent) -> Result<PageCursor<'_>> {
        let mut cursor = self.cursor(intent);
        cursor.next_page(page_id)?;
        Ok(cursor)
    }

    fn pin(&self, page_id: PageId, intent: PinIntent) -> Result<Arc<Page>> {
        let index = page_id.0 as usize;
        {
            let pages = self.pages.read();
            if let Some(Some(page)) = pages.get(index) {
                return Ok(page.clone());
            }
        }

        let mut pages = self.pages.write();
        if index >= pages.len() {
            if intent == PinIntent::Read && page_id.0 >= self.backend.size_in_pages() {
                return Err(Error::InvalidPageId(page_id));
            }
            pages.resize(index + 1, None);
        }
        if let Some(page) = &pages[index] {
            return Ok(page.clone());
        }

        // Fault the page in from the store
        let mut buf = vec![0u8; self.page_size];
        self.backend.read_page(page_id, &mut buf)?;
        let page = Arc::new(Page::from_bytes(&buf));
        pages[index] = Some(page.clone());
        trace!(page_id = page_id.0, "faulted in page");
        Ok(page)
    }

    /// Write every dirty page to the store and make it durable
    pub fn flush_and_force(&self) -> Result<()> {
        let snapshot: Vec<(usize, Arc<Page>)> = {
            let pages = self.pages.read();
            pages
                .iter()
                .enumerate()
                .filter_map(|(id, page)| page.as_ref().map(|p| (id, p.clone())))
                .collect()
        };

        let mut buf = vec![0u8; self.page_size];
        let mut flushed = 0usize;
        for (id, page) in snapshot {
            if page.dirty.swap(false, Ordering::AcqRel) {
                page.snapshot(&mut buf);
                self.backend.write_page(PageId(id as u64), &buf)?;
                flushed += 1;
            }
        }
        self.backend.sync()?;
        trace!(flushed, "flushed page cache");
        Ok(())
    }
}

/// A cursor over one pinned page at a time
///
/// Out of bounds accesses never panic: reads return zero, writes are dropped
/// and a flag is raised which [`check_and_clear_bounds_flag`](Self::check_and_clear_bounds_flag)
/// reports.
pub struct PageCursor<'a> {
    cache: &'a PageCache,
    intent: PinIntent,
    page: Option<Arc<Page>>,
    page_id: PageId,
    offset: usize,
    out_of_bounds: bool,
    read_version: u64,
}

impl<'a> PageCursor<'a> {
    /// The cache this cursor reads from
    pub fn cache(&self) -> &'a PageCache {
        self.cache
    }

    /// Pin intent of this cursor
    pub fn intent(&self) -> PinIntent {
        self.intent
    }

    /// Move to another page, releasing the current one
    pub fn next_page(&mut self, page_id: PageId) -> Result<()> {
        self.unpin();
        let page = self.cache.pin(page_id, self.intent)?;
        match self.intent {
            PinIntent::Write => page.begin_write(),
            PinIntent::Read => self.read_version = page.version.load(Ordering::Acquire),
        }
        self.page = Some(page);
        self.page_id = page_id;
        self.offset = 0;
        Ok(())
    }

    /// Release the current page, if any
    pub fn unpin(&mut self) {
        if let Some(page) = self.page.take() {
            if self.intent == PinIntent::Write {
                page.end_write();
            }
        }
    }

    /// Open another cursor with the same intent, pinned to `page_id`
    pub fn open_linked_cursor(&self, page_id: PageId) -> Result<PageCursor<'a>> {
        self.cache.io(page_id, self.intent)
    }

    /// Id of the pinned page
    pub fn current_page_id(&self) -> PageId {
        self.page_id
    }

    /// Page size in bytes
    pub fn page_size(&self) -> usize {
        self.cache.page_size
    }

    /// Current offset within the page
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Set the offset for relative accesses
    pub fn set_offset(&mut self, offset: usize) {
        self.offset = offset;
    }

    /// Whether reads since the pin (or the last retry) overlapped a write
    ///
    /// When this returns true the cursor has already waited for the writer to
    /// finish, so the reads can be redone right away. Write cursors never retry.
    pub fn should_retry(&mut self) -> bool {
        if self.intent == PinIntent::Write {
            return false;
        }
        let Some(page) = &self.page else {
            return false;
        };
        fence(Ordering::Acquire);
        let version = page.version.load(Ordering::Relaxed);
        if version == self.read_version && version & 1 == 0 {
            return false;
        }
        self.read_version = page.stable_version();
        self.offset = 0;
        self.out_of_bounds = false;
        true
    }

    /// Report and clear whether an access went out of bounds
    pub fn check_and_clear_bounds_flag(&mut self) -> bool {
        std::mem::take(&mut self.out_of_bounds)
    }

    /// Fail with [`Error::OutOfBounds`] if an access went out of bounds
    pub fn check_out_of_bounds(&mut self) -> Result<()> {
        if self.check_and_clear_bounds_flag() {
            return Err(Error::OutOfBounds { page_id: self.page_id });
        }
        Ok(())
    }

    /// Resolve an access of `len` bytes at `offset`, raising the bounds flag if it does not fit
    #[inline]
    fn range(&mut self, offset: usize, len: usize) -> Option<&Arc<Page>> {
        match &self.page {
            Some(page) if offset.checked_add(len).is_some_and(|end| end <= self.cache.page_size) => {
                Some(page)
            }
            _ => {
                self.out_of_bounds = true;
                None
            }
        }
    }

    fn read_into(&mut self, offset: usize, buf: &mut [u8]) {
        match self.range(offset, buf.len()) {
            Some(page) => {
                for (i, b) in buf.iter_mut().enumerate() {
                    *b = page.load(offset + i);
                }
            }
            None => buf.fill(0),
        }
    }

    fn write_from(&mut self, offset: usize, data: &[u8]) {
        debug_assert_eq!(self.intent, PinIntent::Write, "write through a read cursor");
        if let Some(page) = self.range(offset, data.len()) {
            for (i, &b) in data.iter().enumerate() {
                page.store(offset + i, b);
            }
        }
    }

    /// Read a byte at `offset`
    pub fn get_u8_at(&mut self, offset: usize) -> u8 {
        let mut buf = [0u8; 1];
        self.read_into(offset, &mut buf);
        buf[0]
    }

    /// Read a big-endian u16 at `offset`
    pub fn get_u16_at(&mut self, offset: usize) -> u16 {
        let mut buf = [0u8; 2];
        self.read_into(offset, &mut buf);
        BigEndian::read_u16(&buf)
    }

    /// Read a big-endian u32 at `offset`
    pub fn get_u32_at(&mut self, offset: usize) -> u32 {
        let mut buf = [0u8; 4];
        self.read_into(offset, &mut buf);
        BigEndian::read_u32(&buf)
    }

    /// Read a big-endian 48-bit value at `offset`
    pub fn get_u48_at(&mut self, offset: usize) -> u64 {
        let mut buf = [0u8; 6];
        self.read_into(offset, &mut buf);
        BigEndian::read_u48(&buf)
    }

    /// Read a big-endian u64 at `offset`
    pub fn get_u64_at(&mut self, offset: usize) -> u64 {
        let mut buf = [0u8; 8];
        self.read_into(offset, &mut buf);
        BigEndian::read_u64(&buf)
    }

    /// Write a byte at `offset`
    pub fn put_u8_at(&mut self, offset: usize, value: u8) {
        self.write_from(offset, &[value]);
    }

    /// Write a big-endian u16 at `offset`
    pub fn put_u16_at(&mut self, offset: usize, value: u16) {
        let mut buf = [0u8; 2];
        BigEndian::write_u16(&mut buf, value);
        self.write_from(offset, &buf);
    }

    /// Write a big-endian u32 at `offset`
    pub fn put_u32_at(&mut self, offset: usize, value: u32) {
        let mut buf = [0u8; 4];
        BigEndian::write_u32(&mut buf, value);
        self.write_from(offset, &buf);
    }

    /// Write the low 48 bits of `value` big-endian at `offset`
    pub fn put_u48_at(&mut self, offset: usize, value: u64) {
        let mut buf = [0u8; 6];
        BigEndian::write_u48(&mut buf, value & 0xFFFF_FFFF_FFFF);
        self.write_from(offset, &buf);
    }

    /// Write a big-endian u64 at `offset`
    pub fn put_u64_at(&mut self, offset: usize, value: u64) {
        let mut buf = [0u8; 8];
        BigEndian::write_u64(&mut buf, value);
        self.write_from(offset, &buf);
    }

    /// Read a byte at the cursor offset and advance
    pub fn get_u8(&mut self) -> u8 {
        let value = self.get_u8_at(self.offset);
        self.offset += 1;
        value
    }

    /// Read a u16 at the cursor offset and advance
    pub fn get_u16(&mut self) -> u16 {
        let value = self.get_u16_at(self.offset);
        self.offset += 2;
        value
    }

    /// Read a u32 at the cursor offset and advance
    pub fn get_u32(&mut self) -> u32 {
        let value = self.get_u32_at(self.offset);
        self.offset += 4;
        value
    }

    /// Read a 48-bit value at the cursor offset and advance
    pub fn get_u48(&mut self) -> u64 {
        let value = self.get_u48_at(self.offset);
        self.offset += 6;
        value
    }

    /// Read a u64 at the cursor offset and advance
    pub fn get_u64(&mut self) -> u64 {
        let value = self.get_u64_at(self.offset);
        self.offset += 8;
        value
    }

    /// Write a byte at the cursor offset and advance
    pub fn put_u8(&mut self, value: u8) {
        self.put_u8_at(self.offset, value);
        self.offset += 1;
    }

    /// Write a u16 at the cursor offset and advance
    pub fn put_u16(&mut self, value: u16) {
        self.put_u16_at(self.offset, value);
        self.offset += 2;
    }

    /// Write a u32 at the cursor offset and advance
    pub fn put_u32(&mut self, value: u32) {
        self.put_u32_at(self.offset, value);
        self.offset += 4;
    }

    /// Write a 48-bit value at the cursor offset and advance
    pub fn put_u48(&mut self, value: u64) {
        self.put_u48_at(self.offset, value);
        self.offset += 6;
    }

    /// Write a u64 at the cursor offset and advance
    pub fn put_u64(&mut self, value: u64) {
        self.put_u64_at(self.offset, value);
        self.offset += 8;
    }

    /// Fill `buf` from the cursor offset and advance
    pub fn get_bytes(&mut self, buf: &mut [u8]) {
        self.read_into(self.offset, buf);
        self.offset += buf.len();
    }

    /// Write `data` at the cursor offset and advance
    pub fn put_bytes(&mut self, data: &[u8]) {
        self.write_from(self.offset, data);
        self.offset += data.len();
    }

    /// Copy `len` bytes from this page into the page of `target`
    pub fn copy_to(
        &mut self,
        source_offset: usize,
        target: &mut PageCursor<'_>,
        target_offset: usize,
        len: usize,
    ) {
        let mut buf = vec![0u8; len];
        self.read_into(source_offset, &mut buf);
        target.write_from(target_offset, &buf);
    }

    /// Move `len` bytes starting at `from` by `shift` bytes within the page
    pub fn shift_bytes(&mut self, from: usize, len: usize, shift: isize) {
        if len == 0 || shift == 0 {
            return;
        }
        let Some(to) = from.checked_add_signed(shift) else {
            self.out_of_bounds = true;
            return;
        };
        let mut buf = vec![0u8; len];
        self.read_into(from, &mut buf);
        self.write_from(to, &buf);
    }

    /// Zero the whole page
    pub fn zap_page(&mut self) {
        let zeroes = vec![0u8; self.cache.page_size];
        self.write_from(0, &zeroes);
    }
}

impl Drop for PageCursor<'_> {
    fn drop(&mut self) {
        self.unpin();
    }
}
