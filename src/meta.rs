//! Meta page and tree state pages
//!
//! Page 0 holds the meta data written once at creation: format version, page
//! size and the identity of the layout. Pages 1 and 2 hold the tree state,
//! alternately overwritten by checkpoints so the previous state survives a
//! crash in the middle of writing the next one. Each state is written twice
//! within its page and only trusted if both copies agree. The rest of a state
//! page carries the user header stored with that checkpoint: its length as a
//! `u32`, then its bytes.

use crate::error::{Error, PageId, Result};
use crate::generation::GenerationPair;
use crate::layout::Layout;
use crate::page_cache::{PageCache, PageCursor, PinIntent};
use static_assertions::const_assert;

/// Page holding the meta data
pub const META_PAGE_ID: PageId = PageId(0);

/// First state page
pub const STATE_PAGE_A: PageId = PageId(1);

/// Second state page
pub const STATE_PAGE_B: PageId = PageId(2);

/// Lowest page id a tree node can have
pub const MIN_TREE_NODE_ID: u64 = 3;

/// Version of the on-disk format
pub const FORMAT_VERSION: u32 = 1;

const META_HEADER_LENGTH: usize = 4 + 4 + 8 + 4 + 4;

const STATE_SIZE: usize = 4 + 4 + 8 + 8 + 8 + 8 + 8 + 4 + 4 + 1;

const HEADER_OFFSET: usize = STATE_SIZE * 2;

const_assert!(HEADER_OFFSET + 4 <= crate::page_cache::MIN_PAGE_SIZE);

/// Largest header a state page of `page_size` can carry
pub fn max_header_size(page_size: usize) -> usize {
    page_size - HEADER_OFFSET - 4
}

/// Contents of the meta page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Meta {
    /// On-disk format version
    pub format_version: u32,
    /// Page size the store was created with
    pub page_size: u32,
    /// Layout identifier
    pub layout_identifier: u64,
    /// Layout major version
    pub layout_major_version: u32,
    /// Layout minor version
    pub layout_minor_version: u32,
}

impl Meta {
    /// Meta data describing `layout` at `page_size`
    pub fn from_layout<L: Layout>(layout: &L, page_size: usize) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            page_size: page_size as u32,
            layout_identifier: layout.identifier(),
            layout_major_version: layout.major_version(),
            layout_minor_version: layout.minor_version(),
        }
    }

    /// Write the meta page, followed by the layout's own meta data
    pub fn write<L: Layout>(&self, cursor: &mut PageCursor<'_>, layout: &L) -> Result<()> {
        cursor.set_offset(0);
        cursor.put_u32(self.format_version);
        cursor.put_u32(self.page_size);
        cursor.put_u64(self.layout_identifier);
        cursor.put_u32(self.layout_major_version);
        cursor.put_u32(self.layout_minor_version);
        layout.write_meta_data(cursor);
        cursor.check_out_of_bounds()
    }

    /// Read the meta page header, leaving the cursor at the layout meta data
    pub fn read(cursor: &mut PageCursor<'_>) -> Result<Self> {
        cursor.set_offset(0);
        let meta = Self {
            format_version: cursor.get_u32(),
            page_size: cursor.get_u32(),
            layout_identifier: cursor.get_u64(),
            layout_major_version: cursor.get_u32(),
            layout_minor_version: cursor.get_u32(),
        };
        debug_assert_eq!(cursor.offset(), META_HEADER_LENGTH);
        cursor.check_out_of_bounds()?;
        Ok(meta)
    }

    /// Check the stored meta data against what the tree is opened with
    pub fn verify<L: Layout>(&self, layout: &L, page_size: usize) -> Result<()> {
        if self.format_version != FORMAT_VERSION {
            return Err(Error::VersionMismatch { expected: FORMAT_VERSION, found: self.format_version });
        }
        if self.page_size as usize != page_size {
            return Err(Error::MetadataMismatch(
                format!("store has page size {}, opened with {}", self.page_size, page_size).into(),
            ));
        }
        if !layout.compatible_with(self.layout_identifier, self.layout_major_version, self.layout_minor_version) {
            return Err(Error::MetadataMismatch(
                format!(
                    "store was written with layout {:#x} v{}.{}, opened with {:#x} v{}.{}",
                    self.layout_identifier,
                    self.layout_major_version,
                    self.layout_minor_version,
                    layout.identifier(),
                    layout.major_version(),
                    layout.minor_version()
                )
                .into(),
            ));
        }
        Ok(())
    }
}

/// Snapshot of the tree written by a checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeState {
    /// State page this was read from or is written to
    pub page_id: PageId,
    /// Stable generation
    pub stable_generation: u64,
    /// Unstable generation
    pub unstable_generation: u64,
    /// Root node id
    pub root_id: u64,
    /// Generation of the root pointer
    pub root_generation: u64,
    /// Highest page id handed out
    pub last_id: u64,
    /// Free-list write page
    pub free_list_write_page_id: u64,
    /// Free-list read page
    pub free_list_read_page_id: u64,
    /// Free-list write position
    pub free_list_write_pos: usize,
    /// Free-list read position
    pub free_list_read_pos: usize,
    /// Whether the tree was closed with nothing changed after its last checkpoint
    pub clean: bool,
    /// Whether both copies agree and are not empty
    pub valid: bool,
}

impl TreeState {
    /// Generations recorded in the state
    pub fn generation(&self) -> GenerationPair {
        GenerationPair::new(self.stable_generation, self.unstable_generation)
    }

    fn is_empty(&self) -> bool {
        self.stable_generation == 0
            && self.unstable_generation == 0
            && self.root_id == 0
            && self.root_generation == 0
            && self.last_id == 0
            && self.free_list_write_page_id == 0
            && self.free_list_read_page_id == 0
            && self.free_list_write_pos == 0
            && self.free_list_read_pos == 0
            && !self.clean
    }

    fn write_copy(&self, cursor: &mut PageCursor<'_>) {
        cursor.put_u32(self.stable_generation as u32);
        cursor.put_u32(self.unstable_generation as u32);
        cursor.put_u64(self.root_id);
        cursor.put_u64(self.root_generation);
        cursor.put_u64(self.last_id);
        cursor.put_u64(self.free_list_write_page_id);
        cursor.put_u64(self.free_list_read_page_id);
        cursor.put_u32(self.free_list_write_pos as u32);
        cursor.put_u32(self.free_list_read_pos as u32);
        cursor.put_u8(self.clean as u8);
    }

    fn read_copy(cursor: &mut PageCursor<'_>) -> Self {
        Self {
            page_id: cursor.current_page_id(),
            stable_generation: cursor.get_u32() as u64,
            unstable_generation: cursor.get_u32() as u64,
            root_id: cursor.get_u64(),
            root_generation: cursor.get_u64(),
            last_id: cursor.get_u64(),
            free_list_write_page_id: cursor.get_u64(),
            free_list_read_page_id: cursor.get_u64(),
            free_list_write_pos: cursor.get_u32() as usize,
            free_list_read_pos: cursor.get_u32() as usize,
            clean: cursor.get_u8() == 1,
            valid: false,
        }
    }

    /// Write the state twice at the start of the cursor's page
    pub fn write(&self, cursor: &mut PageCursor<'_>) -> Result<()> {
        cursor.set_offset(0);
        self.write_copy(cursor);
        self.write_copy(cursor);
        debug_assert_eq!(cursor.offset(), STATE_SIZE * 2);
        cursor.check_out_of_bounds()
    }

    /// Read the state of the cursor's page
    pub fn read(cursor: &mut PageCursor<'_>) -> Result<Self> {
        let (first, second) = loop {
            cursor.set_offset(0);
            let first = Self::read_copy(cursor);
            let second = Self::read_copy(cursor);
            if !cursor.should_retry() {
                break (first, second);
            }
        };
        cursor.check_out_of_bounds()?;
        let valid = first == second && !first.is_empty();
        Ok(Self { valid, ..first })
    }
}

/// Write `header` after the state copies of the cursor's page
pub fn write_header(cursor: &mut PageCursor<'_>, header: &[u8]) -> Result<()> {
    if header.len() > max_header_size(cursor.page_size()) {
        return Err(Error::InvalidParameter("header does not fit in a state page"));
    }
    cursor.set_offset(HEADER_OFFSET);
    cursor.put_u32(header.len() as u32);
    cursor.put_bytes(header);
    cursor.check_out_of_bounds()
}

/// Read the header stored after the state copies of the cursor's page
pub fn read_header(cursor: &mut PageCursor<'_>) -> Result<Vec<u8>> {
    let max = max_header_size(cursor.page_size());
    loop {
        cursor.set_offset(HEADER_OFFSET);
        let length = cursor.get_u32() as usize;
        // A torn length is caught by the retry below
        let mut header = vec![0u8; length.min(max)];
        cursor.get_bytes(&mut header);
        if cursor.should_retry() {
            continue;
        }
        cursor.check_out_of_bounds()?;
        if length > max {
            return Err(Error::corruption(format!("header of {} bytes in state page", length), cursor.current_page_id()));
        }
        return Ok(header);
    }
}

/// Read both state pages
pub fn read_state_pages(cache: &PageCache) -> Result<(TreeState, TreeState)> {
    let mut cursor = cache.io(STATE_PAGE_A, PinIntent::Read)?;
    let a = TreeState::read(&mut cursor)?;
    cursor.next_page(STATE_PAGE_B)?;
    let b = TreeState::read(&mut cursor)?;
    Ok((a, b))
}

fn newest_valid(a: &TreeState, b: &TreeState) -> Option<TreeState> {
    if a.valid != b.valid {
        return Some(if a.valid { *a } else { *b });
    }
    if !a.valid {
        return None;
    }
    if a.stable_generation == b.stable_generation
        && a.unstable_generation == b.unstable_generation
        && a.clean != b.clean
    {
        // Closing clean writes the same generations again
        return Some(if a.clean { *a } else { *b });
    }
    if a.stable_generation >= b.stable_generation && a.unstable_generation > b.unstable_generation {
        return Some(*a);
    }
    if a.stable_generation <= b.stable_generation && a.unstable_generation < b.unstable_generation {
        return Some(*b);
    }
    None
}

/// The state a tree should be opened from
pub fn select_newest_valid_state(states: &(TreeState, TreeState)) -> Result<TreeState> {
    newest_valid(&states.0, &states.1).ok_or_else(|| Error::Corruption {
        details: format!("unexpected combination of tree states: A={:?} B={:?}", states.0, states.1),
        page_id: None,
    })
}

/// The state page the next state should overwrite
pub fn select_oldest_or_invalid(states: &(TreeState, TreeState)) -> TreeState {
    match newest_valid(&states.0, &states.1) {
        Some(newest) if newest.page_id == states.0.page_id => states.1,
        _ => states.0,
    }
}
