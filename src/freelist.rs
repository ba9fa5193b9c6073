//! Free-list management
//!
//! Released page ids are queued in a chain of free-list pages. Ids are
//! appended at the write position and consumed from the read position, and
//! an id is only handed out again once the generation it was released in has
//! become stable. Until then a reader of the last checkpoint may still see the
//! page.
//!
//! ```text
//! free-list page: [ type (1) | next page (6) | entry* ]
//! entry:          [ generation released in (4) | page id (6) ]
//! ```

use crate::error::{PageId, Result};
use crate::generation::GenerationPair;
use crate::node::NODE_TYPE_FREE_LIST_NODE;
use crate::page_cache::{PageCache, PageCursor, PinIntent};
use tracing::{debug, trace};

/// Page id meaning "none"
pub const NO_PAGE_ID: u64 = 0;

const BYTE_POS_NEXT: usize = 1;
const HEADER_LENGTH: usize = 1 + 6;
const ENTRY_SIZE: usize = 4 + 6;

/// Receives the contents of the free-list in queue order
pub trait FreeListVisitor {
    /// A free-list page is entered
    fn begin_free_list_page(&mut self, _page_id: u64) {}
    /// A free-list page is left
    fn end_free_list_page(&mut self, _page_id: u64) {}
    /// An id waiting in the queue
    fn free_list_entry(&mut self, _page_id: u64, _generation: u64, _pos: usize) {}
}

fn entry_offset(pos: usize) -> usize {
    HEADER_LENGTH + pos * ENTRY_SIZE
}

fn initialize_page(cursor: &mut PageCursor<'_>) {
    cursor.put_u8_at(0, NODE_TYPE_FREE_LIST_NODE);
    cursor.put_u48_at(BYTE_POS_NEXT, NO_PAGE_ID);
}

fn read_entry(cursor: &mut PageCursor<'_>, pos: usize, stable_generation: u64) -> u64 {
    let offset = entry_offset(pos);
    let generation = cursor.get_u32_at(offset) as u64;
    if generation > stable_generation {
        return NO_PAGE_ID;
    }
    cursor.get_u48_at(offset + 4)
}

/// Hands out page ids, reusing released ones when safe
#[derive(Debug, Clone)]
pub struct FreeList {
    max_entries: usize,
    write_page_id: u64,
    read_page_id: u64,
    write_pos: usize,
    read_pos: usize,
    last_id: u64,
}

impl FreeList {
    /// A free-list over pages of `page_size`, with ids up to `last_id` in use
    pub fn new(page_size: usize, last_id: u64) -> Self {
        Self {
            max_entries: Self::max_entries(page_size),
            write_page_id: NO_PAGE_ID,
            read_page_id: NO_PAGE_ID,
            write_pos: 0,
            read_pos: 0,
            last_id,
        }
    }

    /// Entries that fit in one free-list page
    pub fn max_entries(page_size: usize) -> usize {
        (page_size - HEADER_LENGTH) / ENTRY_SIZE
    }

    /// Restore state recorded at a checkpoint
    pub fn initialize(&mut self, last_id: u64, write_page_id: u64, read_page_id: u64, write_pos: usize, read_pos: usize) {
        self.last_id = last_id;
        self.write_page_id = write_page_id;
        self.read_page_id = read_page_id;
        self.write_pos = write_pos;
        self.read_pos = read_pos;
    }

    /// Allocate the first free-list page of a new store
    pub fn initialize_after_creation(&mut self, cache: &PageCache) -> Result<()> {
        let page = self.next_last_id();
        let mut cursor = cache.io(PageId(page), PinIntent::Write)?;
        cursor.zap_page();
        initialize_page(&mut cursor);
        cursor.check_out_of_bounds()?;
        self.write_page_id = page;
        self.read_page_id = page;
        debug!(page, "created free-list");
        Ok(())
    }

    /// Highest id ever handed out
    pub fn last_id(&self) -> u64 {
        self.last_id
    }

    /// Page new entries are appended to
    pub fn write_page_id(&self) -> u64 {
        self.write_page_id
    }

    /// Page entries are consumed from
    pub fn read_page_id(&self) -> u64 {
        self.read_page_id
    }

    /// Next entry slot in the write page
    pub fn write_pos(&self) -> usize {
        self.write_pos
    }

    /// Next entry slot in the read page
    pub fn read_pos(&self) -> usize {
        self.read_pos
    }

    fn next_last_id(&mut self) -> u64 {
        self.last_id += 1;
        self.last_id
    }

    /// Hand out a zeroed page, reused if possible
    pub fn acquire_new_id(&mut self, cache: &PageCache, generation: GenerationPair) -> Result<PageId> {
        self.acquire(cache, generation, true)
    }

    fn acquire(&mut self, cache: &PageCache, generation: GenerationPair, allow_take_last: bool) -> Result<PageId> {
        let id = match self.acquire_from_free_list(cache, generation, allow_take_last)? {
            Some(id) => id,
            None => self.next_last_id(),
        };
        let mut cursor = cache.io(PageId(id), PinIntent::Write)?;
        cursor.zap_page();
        trace!(id, "acquired page id");
        Ok(PageId(id))
    }

    fn acquire_from_free_list(
        &mut self,
        cache: &PageCache,
        generation: GenerationPair,
        allow_take_last: bool,
    ) -> Result<Option<u64>> {
        let has_entries = self.read_page_id != self.write_page_id || self.read_pos < self.write_pos;
        if !has_entries || !(allow_take_last || self.read_pos < self.max_entries - 1) {
            return Ok(None);
        }

        let mut cursor = cache.io(PageId(self.read_page_id), PinIntent::Read)?;
        let id = loop {
            let id = read_entry(&mut cursor, self.read_pos, generation.stable);
            if !cursor.should_retry() {
                break id;
            }
        };
        cursor.check_out_of_bounds()?;
        if id == NO_PAGE_ID {
            return Ok(None);
        }

        self.read_pos += 1;
        if self.read_pos >= self.max_entries {
            // Read page exhausted, move on and recycle it
            let next = loop {
                let next = cursor.get_u48_at(BYTE_POS_NEXT);
                if !cursor.should_retry() {
                    break next;
                }
            };
            let exhausted = self.read_page_id;
            drop(cursor);
            self.read_pos = 0;
            self.read_page_id = next;
            self.release_id(cache, generation, exhausted)?;
            debug!(page = exhausted, next, "released exhausted free-list page");
        }
        Ok(Some(id))
    }

    /// Queue `id` for reuse once the current unstable generation is stable
    pub fn release_id(&mut self, cache: &PageCache, generation: GenerationPair, id: u64) -> Result<()> {
        {
            let mut cursor = cache.io(PageId(self.write_page_id), PinIntent::Write)?;
            let offset = entry_offset(self.write_pos);
            cursor.put_u32_at(offset, generation.unstable as u32);
            cursor.put_u48_at(offset + 4, id);
            cursor.check_out_of_bounds()?;
        }
        self.write_pos += 1;
        trace!(id, "released page id");

        if self.write_pos >= self.max_entries {
            // Write page full, chain a new one
            let next = self.acquire(cache, generation, false)?;
            {
                let mut cursor = cache.io(next, PinIntent::Write)?;
                initialize_page(&mut cursor);
            }
            {
                let mut cursor = cache.io(PageId(self.write_page_id), PinIntent::Write)?;
                cursor.put_u48_at(BYTE_POS_NEXT, next.0);
            }
            debug!(full = self.write_page_id, next = next.0, "chained free-list page");
            self.write_page_id = next.0;
            self.write_pos = 0;
        }
        Ok(())
    }

    /// Walk the queued ids from the read position to the write position
    pub fn visit(&self, cache: &PageCache, visitor: &mut dyn FreeListVisitor) -> Result<()> {
        if self.read_page_id == NO_PAGE_ID {
            return Ok(());
        }
        let mut cursor = cache.io(PageId(self.read_page_id), PinIntent::Read)?;
        let mut pos = self.read_pos;
        visitor.begin_free_list_page(self.read_page_id);
        while cursor.current_page_id().0 != self.write_page_id || pos < self.write_pos {
            if pos == self.max_entries {
                pos = 0;
                let next = cursor.get_u48_at(BYTE_POS_NEXT);
                visitor.end_free_list_page(cursor.current_page_id().0);
                cursor.next_page(PageId(next))?;
                visitor.begin_free_list_page(next);
                continue;
            }
            let offset = entry_offset(pos);
            let generation = cursor.get_u32_at(offset) as u64;
            let page_id = cursor.get_u48_at(offset + 4);
            visitor.free_list_entry(page_id, generation, pos);
            pos += 1;
        }
        visitor.end_free_list_page(cursor.current_page_id().0);
        cursor.check_out_of_bounds()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemoryBackend;
    use std::collections::HashSet;

    const PAGE_SIZE: usize = 128;

    fn setup() -> (PageCache, FreeList) {
        let cache = PageCache::new(Box::new(MemoryBackend::new(PAGE_SIZE))).unwrap();
        let mut free_list = FreeList::new(PAGE_SIZE, 3);
        free_list.initialize_after_creation(&cache).unwrap();
        (cache, free_list)
    }

    #[derive(Default)]
    struct Collect {
        pages: Vec<u64>,
        entries: Vec<(u64, u64)>,
    }

    impl FreeListVisitor for Collect {
        fn begin_free_list_page(&mut self, page_id: u64) {
            self.pages.push(page_id);
        }
        fn free_list_entry(&mut self, page_id: u64, generation: u64, _pos: usize) {
            self.entries.push((page_id, generation));
        }
    }

    #[test]
    fn test_fresh_ids_grow_last_id() -> Result<()> {
        let (cache, mut free_list) = setup();
        assert_eq!(free_list.last_id(), 4);
        let generation = GenerationPair::new(1, 2);
        assert_eq!(free_list.acquire_new_id(&cache, generation)?, PageId(5));
        assert_eq!(free_list.acquire_new_id(&cache, generation)?, PageId(6));
        Ok(())
    }

    #[test]
    fn test_released_id_waits_for_stable_generation() -> Result<()> {
        let (cache, mut free_list) = setup();
        let generation = GenerationPair::new(1, 2);
        let id = free_list.acquire_new_id(&cache, generation)?;
        free_list.release_id(&cache, generation, id.0)?;

        // Same generation, not reusable yet
        let other = free_list.acquire_new_id(&cache, generation)?;
        assert_ne!(other, id);

        // After a checkpoint it comes back
        let generation = generation.checkpointed();
        assert_eq!(free_list.acquire_new_id(&cache, generation)?, id);
        Ok(())
    }

    #[test]
    fn test_acquired_page_is_zeroed() -> Result<()> {
        let (cache, mut free_list) = setup();
        let generation = GenerationPair::new(1, 2);
        let id = free_list.acquire_new_id(&cache, generation)?;
        {
            let mut cursor = cache.io(id, PinIntent::Write)?;
            cursor.put_u64_at(20, 0xFFFF);
        }
        free_list.release_id(&cache, generation, id.0)?;
        let again = free_list.acquire_new_id(&cache, generation.checkpointed())?;
        assert_eq!(again, id);
        let mut cursor = cache.io(id, PinIntent::Read)?;
        assert_eq!(cursor.get_u64_at(20), 0);
        Ok(())
    }

    #[test]
    fn test_chained_pages_never_hand_out_duplicates() -> Result<()> {
        let (cache, mut free_list) = setup();
        let max = FreeList::max_entries(PAGE_SIZE);
        let mut generation = GenerationPair::new(1, 2);

        let mut live: HashSet<u64> = HashSet::new();
        for _ in 0..max * 3 {
            live.insert(free_list.acquire_new_id(&cache, generation)?.0);
        }
        for &id in &live {
            free_list.release_id(&cache, generation, id)?;
        }
        let mut visitor = Collect::default();
        free_list.visit(&cache, &mut visitor)?;
        assert_eq!(visitor.entries.len(), live.len());
        assert!(visitor.pages.len() >= 3);

        generation = generation.checkpointed();
        let mut handed_out = HashSet::new();
        for _ in 0..max * 4 {
            let id = free_list.acquire_new_id(&cache, generation)?.0;
            assert!(handed_out.insert(id), "id {} handed out twice", id);
            assert!(id > 3);
        }
        Ok(())
    }

    #[test]
    fn test_visit_reports_generations() -> Result<()> {
        let (cache, mut free_list) = setup();
        let generation = GenerationPair::new(4, 5);
        free_list.release_id(&cache, generation, 42)?;
        free_list.release_id(&cache, generation, 43)?;

        let mut visitor = Collect::default();
        free_list.visit(&cache, &mut visitor)?;
        assert_eq!(visitor.pages, vec![4]);
        assert_eq!(visitor.entries, vec![(42, 5), (43, 5)]);
        Ok(())
    }
}
