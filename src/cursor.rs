//! Range scans that run concurrently with the writer and checkpoints
//!
//! A [`SeekCursor`] never takes a lock. Every node read happens inside a
//! retry loop validated by [`PageCursor::should_retry`], and what was read is
//! only acted on afterwards. Nodes that changed identity under the reader,
//! which shows as a node generation newer than the pointer that led to it, make
//! the seek restart from the current root, continuing after the last key it
//! returned.

use crate::error::{Error, PageId, Result};
use crate::generation::GenerationPair;
use crate::gspp::{check_pointer, GsppResult, PointerField};
use crate::key_search::{search, SearchResult};
use crate::layout::Layout;
use crate::node::{NodeKind, TreeNode, BYTE_POS_LEFT_SIBLING, BYTE_POS_NEW_GEN, BYTE_POS_RIGHT_SIBLING, NODE_TYPE_TREE_NODE};
use crate::page_cache::{PageCache, PageCursor, PinIntent};
use crate::tree::Root;
use crossbeam_utils::atomic::AtomicCell;
use std::cmp::Ordering;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use tracing::trace;

/// Iterates the entries of a key range, in either direction
///
/// The range is `[from, to)` when `from <= to` and `(to, from]` otherwise, in
/// which case keys come out in descending order. Each key is returned at most
/// once and always after the previous one, even while the writer splits or
/// copies the nodes being scanned.
pub struct SeekCursor<'a, L: Layout> {
    cursor: PageCursor<'a>,
    node: &'a TreeNode<L>,
    generation_source: &'a AtomicU64,
    root_source: &'a AtomicCell<Root>,

    from: L::Key,
    to: L::Key,
    /// Include `to` in the range
    exact_match: bool,
    seek_forward: bool,
    stride: isize,

    mutable_key: L::Key,
    mutable_value: L::Value,
    prev_key: L::Key,
    /// No key returned yet
    first: bool,
    generation: GenerationPair,

    // Header of the last read node
    node_type: u8,
    current_node_generation: u64,
    successor: GsppResult,
    successor_generation: u64,
    is_internal: bool,
    key_count: isize,

    pos: isize,
    search_result: SearchResult,
    /// Child or next sibling to follow
    pointer_id: GsppResult,
    pointer_generation: u64,
    prev_sibling_id: GsppResult,
    prev_sibling_generation: u64,

    /// Generation of the pointer just followed, 0 once the node it led to was verified
    last_followed_pointer_generation: u64,
    expected_current_node_generation: u64,
    concurrent_write_happened: bool,

    // Last key of the left sibling, read before moving there in a backward scan
    expected_first_after_go_to_next: L::Key,
    expected_first_present: bool,
    first_key_in_node: L::Key,
    first_key_present: bool,
    verify_expected_first_after_go_to_next: bool,

    finished: bool,
}

impl<'a, L: Layout> SeekCursor<'a, L> {
    /// Position a new seek on the first leaf of the range
    pub(crate) fn new(
        cache: &'a PageCache,
        node: &'a TreeNode<L>,
        generation_source: &'a AtomicU64,
        root_source: &'a AtomicCell<Root>,
        from: L::Key,
        to: L::Key,
        exact_match: bool,
    ) -> Result<Self> {
        let layout = node.layout();
        let seek_forward = layout.compare(&from, &to) != Ordering::Greater;
        let generation = GenerationPair::unpack(generation_source.load(AtomicOrdering::Acquire));
        let root = root_source.load();
        let cursor = cache.io(root.id, PinIntent::Read)?;

        let mut seek = Self {
            cursor,
            node,
            generation_source,
            root_source,
            from,
            to,
            exact_match,
            seek_forward,
            stride: if seek_forward { 1 } else { -1 },
            mutable_key: layout.new_key(),
            mutable_value: layout.new_value(),
            prev_key: layout.new_key(),
            first: true,
            generation,
            node_type: 0,
            current_node_generation: 0,
            successor: GsppResult::default(),
            successor_generation: 0,
            is_internal: false,
            key_count: 0,
            pos: 0,
            search_result: SearchResult::initial(),
            pointer_id: GsppResult::default(),
            pointer_generation: 0,
            prev_sibling_id: GsppResult::default(),
            prev_sibling_generation: 0,
            last_followed_pointer_generation: root.generation,
            expected_current_node_generation: 0,
            concurrent_write_happened: false,
            expected_first_after_go_to_next: layout.new_key(),
            expected_first_present: false,
            first_key_in_node: layout.new_key(),
            first_key_present: false,
            verify_expected_first_after_go_to_next: false,
            finished: false,
        };
        seek.traverse_down_to_first_leaf()?;
        Ok(seek)
    }

    /// Key of the last hit
    pub fn key(&self) -> &L::Key {
        &self.mutable_key
    }

    /// Value of the last hit
    pub fn value(&self) -> &L::Value {
        &self.mutable_value
    }

    /// Move to the next entry of the range
    ///
    /// Returns `false` once the range is exhausted; [`key`](Self::key) and
    /// [`value`](Self::value) are only meaningful after `true`.
    pub fn next_hit(&mut self) -> Result<bool> {
        if self.finished {
            return Ok(false);
        }
        let hit = self.internal_next();
        if !matches!(hit, Ok(true)) {
            self.finished = true;
            self.cursor.unpin();
        }
        hit
    }

    fn traverse_down_to_first_leaf(&mut self) -> Result<()> {
        loop {
            loop {
                'read: {
                    if !self.read_header() {
                        break 'read;
                    }
                    self.search_result =
                        search(&mut self.cursor, self.node, &self.from, &mut self.mutable_key, self.key_count as usize);
                    if !self.search_result.is_success() {
                        break 'read;
                    }
                    self.pos = self.position_of(self.search_result);
                    if self.is_internal {
                        let pos = self.pos as usize;
                        self.pointer_id = self.node.child_at(&mut self.cursor, pos, self.generation);
                        self.pointer_generation =
                            self.read_pointer_generation_on_success(self.node.child_offset(pos), self.pointer_id);
                    }
                }
                if !self.cursor.should_retry() {
                    break;
                }
            }
            self.cursor.check_out_of_bounds()?;

            if !self.ended_up_on_expected_node() {
                self.prepare_to_start_from_root()?;
                continue;
            } else if !self.sane_read() {
                return Err(self.inconsistent_read());
            }

            if self.go_to_successor()? {
                continue;
            }
            if !self.is_internal {
                break;
            }
            let pos = self.pos as usize;
            self.go_to(self.pointer_id, self.pointer_generation, PointerField::Child(pos), false)?;
        }

        if !self.seek_forward {
            // Descending is best effort backwards, search again on the first read
            self.concurrent_write_happened = true;
        }
        Ok(())
    }

    fn internal_next(&mut self) -> Result<bool> {
        loop {
            let mut go_to_prev = false;
            loop {
                'read: {
                    if !self.read_header() {
                        break 'read;
                    }

                    if self.verify_expected_first_after_go_to_next {
                        self.pos = if self.seek_forward { 0 } else { self.key_count - 1 };
                        self.first_key_present = self.key_count > 0;
                        if self.first_key_present {
                            self.node.key_at(&mut self.cursor, &mut self.first_key_in_node, self.pos as usize);
                        }
                    }

                    if self.concurrent_write_happened {
                        // Keys may have moved, find the place to continue from again
                        let search_from = if self.first { &self.from } else { &self.prev_key };
                        self.search_result =
                            search(&mut self.cursor, self.node, search_from, &mut self.mutable_key, self.key_count as usize);
                        if !self.search_result.is_success() {
                            break 'read;
                        }
                        self.pos = self.position_of(self.search_result);

                        if !self.seek_forward && self.pos >= self.key_count {
                            // Keys before the position may have moved to the right sibling
                            self.prev_sibling_id = self.read_prev_sibling();
                            self.prev_sibling_generation =
                                self.read_pointer_generation_on_success(self.prev_sibling_offset(), self.prev_sibling_id);
                            go_to_prev = true;
                        } else {
                            go_to_prev = false;
                        }

                        if !self.seek_forward && !self.search_result.is_hit() {
                            // Start from the greatest key below the searched one
                            self.pos -= 1;
                        }
                    }

                    if self.ran_off_node() {
                        self.pointer_id = self.read_next_sibling();
                        self.pointer_generation =
                            self.read_pointer_generation_on_success(self.next_sibling_offset(), self.pointer_id);
                    }

                    if 0 <= self.pos && self.pos < self.key_count {
                        let pos = self.pos as usize;
                        self.node.key_at(&mut self.cursor, &mut self.mutable_key, pos);
                        self.node.value_at(&mut self.cursor, &mut self.mutable_value, pos);
                    }
                }
                self.concurrent_write_happened = self.cursor.should_retry();
                if !self.concurrent_write_happened {
                    break;
                }
            }
            self.cursor.check_out_of_bounds()?;

            if !self.ended_up_on_expected_node() {
                // The node was reused for something else, start over from the root
                self.prepare_to_start_from_root()?;
                self.traverse_down_to_first_leaf()?;
                continue;
            } else if !self.sane_read() {
                return Err(self.inconsistent_read());
            }

            if !self.verify_first_key_in_node_is_expected_after_go_to() {
                continue;
            }

            if self.go_to_successor()? {
                continue;
            }

            if go_to_prev {
                self.go_to(self.prev_sibling_id, self.prev_sibling_generation, self.prev_sibling_field(), true)?;
                continue;
            }

            if self.ran_off_node() {
                if self.go_to_next_sibling()? {
                    continue;
                }
            } else if 0 <= self.pos && self.pos < self.key_count && self.inside_end_range(&self.mutable_key) {
                self.pos += self.stride;
                if self.is_result_key() {
                    self.node.layout().copy_key(&self.mutable_key, &mut self.prev_key);
                    return Ok(true);
                }
                continue;
            }

            // Past the end of the range
            return Ok(false);
        }
    }

    fn ran_off_node(&self) -> bool {
        if self.seek_forward {
            self.pos >= self.key_count
        } else {
            self.pos < 0
        }
    }

    /// Read the node header, returning false if the page does not look like a sane tree node
    fn read_header(&mut self) -> bool {
        self.node_type = TreeNode::<L>::node_type(&mut self.cursor);
        if self.node_type != NODE_TYPE_TREE_NODE {
            return false;
        }

        self.current_node_generation = TreeNode::<L>::generation(&mut self.cursor);
        self.successor = TreeNode::<L>::new_gen(&mut self.cursor, self.generation);
        if self.successor.is_success() {
            self.successor_generation = TreeNode::<L>::pointer_generation(&mut self.cursor, BYTE_POS_NEW_GEN, self.successor);
        }
        self.is_internal = TreeNode::<L>::is_internal(&mut self.cursor);
        self.key_count = TreeNode::<L>::key_count(&mut self.cursor) as isize;
        self.key_count_is_sane(self.key_count)
    }

    fn key_count_is_sane(&self, key_count: isize) -> bool {
        let kind = if self.is_internal { NodeKind::Internal } else { NodeKind::Leaf };
        key_count >= 0 && key_count as usize <= self.node.max_key_count(kind)
    }

    fn sane_read(&self) -> bool {
        self.key_count_is_sane(self.key_count) && self.search_result.is_success()
    }

    fn inconsistent_read(&self) -> Error {
        Error::corruption(
            format!(
                "read inconsistent tree node: node type {}, generation {}, successor {}, internal {}, key count {}, pos {}, pointer {}",
                self.node_type,
                self.current_node_generation,
                self.successor,
                self.is_internal,
                self.key_count,
                self.pos,
                self.pointer_id,
            ),
            self.cursor.current_page_id(),
        )
    }

    fn position_of(&self, result: SearchResult) -> isize {
        // Keys equal to a separator live in the right subtree
        if self.is_internal {
            result.child_position() as isize
        } else {
            result.position() as isize
        }
    }

    fn ended_up_on_expected_node(&mut self) -> bool {
        self.node_type == NODE_TYPE_TREE_NODE && self.verify_node_generation_invariants()
    }

    /// Whether the node is still the one the followed pointer meant
    ///
    /// A node newer than the pointer to it, or one whose generation changed
    /// between two reads, was freed and reused meanwhile.
    fn verify_node_generation_invariants(&mut self) -> bool {
        if self.last_followed_pointer_generation != 0 {
            if self.current_node_generation > self.last_followed_pointer_generation {
                return false;
            }
            self.last_followed_pointer_generation = 0;
            self.expected_current_node_generation = self.current_node_generation;
        } else if self.current_node_generation != self.expected_current_node_generation {
            return false;
        }
        true
    }

    fn verify_first_key_in_node_is_expected_after_go_to(&mut self) -> bool {
        let mut result = true;
        if self.verify_expected_first_after_go_to_next {
            let matches = match (self.first_key_present, self.expected_first_present) {
                (true, true) => {
                    self.node.layout().compare(&self.first_key_in_node, &self.expected_first_after_go_to_next)
                        == Ordering::Equal
                }
                (false, false) => true,
                _ => false,
            };
            if !matches {
                self.concurrent_write_happened = true;
                result = false;
            }
        }
        self.verify_expected_first_after_go_to_next = false;
        result
    }

    fn read_pointer_generation_on_success(&mut self, offset: usize, pointer: GsppResult) -> u64 {
        if pointer.is_success() {
            TreeNode::<L>::pointer_generation(&mut self.cursor, offset, pointer)
        } else {
            0
        }
    }

    fn next_sibling_offset(&self) -> usize {
        if self.seek_forward {
            BYTE_POS_RIGHT_SIBLING
        } else {
            BYTE_POS_LEFT_SIBLING
        }
    }

    fn prev_sibling_offset(&self) -> usize {
        if self.seek_forward {
            BYTE_POS_LEFT_SIBLING
        } else {
            BYTE_POS_RIGHT_SIBLING
        }
    }

    fn next_sibling_field(&self) -> PointerField {
        if self.seek_forward {
            PointerField::RightSibling
        } else {
            PointerField::LeftSibling
        }
    }

    fn prev_sibling_field(&self) -> PointerField {
        if self.seek_forward {
            PointerField::LeftSibling
        } else {
            PointerField::RightSibling
        }
    }

    fn read_next_sibling(&mut self) -> GsppResult {
        if self.seek_forward {
            TreeNode::<L>::right_sibling(&mut self.cursor, self.generation)
        } else {
            TreeNode::<L>::left_sibling(&mut self.cursor, self.generation)
        }
    }

    fn read_prev_sibling(&mut self) -> GsppResult {
        if self.seek_forward {
            TreeNode::<L>::left_sibling(&mut self.cursor, self.generation)
        } else {
            TreeNode::<L>::right_sibling(&mut self.cursor, self.generation)
        }
    }

    /// Follow `pointer`, returning whether the last read must be redone
    ///
    /// With `allow_no_node` a pointer to no node is not followed and not an error.
    fn go_to(&mut self, pointer: GsppResult, pointer_generation: u64, field: PointerField, allow_no_node: bool) -> Result<bool> {
        if self.pointer_checking_with_generation_catchup(pointer, allow_no_node, field)? {
            self.concurrent_write_happened = true;
            return Ok(true);
        }
        if !allow_no_node || pointer.is_node() {
            let id = check_pointer(pointer, false, self.cursor.current_page_id(), field)?;
            self.cursor.next_page(PageId(id))?;
            self.last_followed_pointer_generation = pointer_generation;
            self.concurrent_write_happened = true;
            return Ok(true);
        }
        Ok(false)
    }

    fn go_to_successor(&mut self) -> Result<bool> {
        self.go_to(self.successor, self.successor_generation, PointerField::NewGen, true)
    }

    /// Move on to the next sibling, returning false when there is none
    fn go_to_next_sibling(&mut self) -> Result<bool> {
        let field = self.next_sibling_field();
        if self.pointer_checking_with_generation_catchup(self.pointer_id, true, field)? {
            self.concurrent_write_happened = true;
            return Ok(true);
        }
        if !self.pointer_id.is_node() {
            return Ok(false);
        }

        let id = PageId(self.pointer_id.pointer());
        if self.seek_forward {
            self.cursor.next_page(id)?;
            self.last_followed_pointer_generation = self.pointer_generation;
            if self.first {
                // The first hit may be several leaves further right, keep searching
                self.concurrent_write_happened = true;
            } else {
                self.pos = 0;
            }
        } else if self.scout_left_sibling()? {
            self.cursor.next_page(id)?;
            self.verify_expected_first_after_go_to_next = true;
            self.last_followed_pointer_generation = self.pointer_generation;
        } else {
            self.concurrent_write_happened = true;
        }
        Ok(true)
    }

    /// Read the last key of the left sibling without moving there
    ///
    /// Keys moving right under a backward scan are detected by checking the
    /// sibling still ends with this key once the scan arrives.
    fn scout_left_sibling(&mut self) -> Result<bool> {
        let page_id = PageId(self.pointer_id.pointer());
        let mut scout = self.cursor.open_linked_cursor(page_id)?;
        let sane = loop {
            let node_type = TreeNode::<L>::node_type(&mut scout);
            let mut sane = false;
            self.expected_first_present = false;
            if node_type == NODE_TYPE_TREE_NODE {
                let kind = TreeNode::<L>::kind(&mut scout);
                let key_count = TreeNode::<L>::key_count(&mut scout);
                if key_count <= self.node.max_key_count(kind) {
                    sane = true;
                    if key_count > 0 {
                        self.node.key_at(&mut scout, &mut self.expected_first_after_go_to_next, key_count - 1);
                        self.expected_first_present = true;
                    }
                }
            }
            if !scout.should_retry() {
                break sane;
            }
        };
        scout.check_out_of_bounds()?;
        drop(scout);

        if self.cursor.should_retry() {
            // The current node changed after it was read, redo it
            return Ok(false);
        }
        self.cursor.check_out_of_bounds()?;
        Ok(sane)
    }

    fn inside_end_range(&self, key: &L::Key) -> bool {
        let order = self.node.layout().compare(key, &self.to);
        match (self.exact_match, self.seek_forward) {
            (true, true) => order != Ordering::Greater,
            (true, false) => order != Ordering::Less,
            (false, true) => order == Ordering::Less,
            (false, false) => order == Ordering::Greater,
        }
    }

    fn inside_start_range(&self, key: &L::Key) -> bool {
        let order = self.node.layout().compare(key, &self.from);
        if self.seek_forward {
            order != Ordering::Less
        } else {
            order != Ordering::Greater
        }
    }

    fn inside_prev_key(&self, key: &L::Key) -> bool {
        if self.first {
            return self.inside_start_range(key);
        }
        let order = self.node.layout().compare(key, &self.prev_key);
        if self.seek_forward {
            order == Ordering::Greater
        } else {
            order == Ordering::Less
        }
    }

    /// Whether the key just read is the next one to return
    fn is_result_key(&mut self) -> bool {
        if !self.inside_start_range(&self.mutable_key) {
            // Stale position, possibly a reused page
            self.concurrent_write_happened = true;
            return false;
        }
        if !self.first && !self.inside_prev_key(&self.mutable_key) {
            // Already returned, seen again through a concurrent split
            return false;
        }
        self.first = false;
        true
    }

    /// Catch up with the generation and reposition on the root
    ///
    /// The range restarts right after the last returned key.
    fn prepare_to_start_from_root(&mut self) -> Result<()> {
        self.generation_catchup();
        let root = self.root_source.load();
        trace!(root = root.id.0, "restarting seek from root");
        self.cursor.next_page(root.id)?;
        self.last_followed_pointer_generation = root.generation;
        if !self.first {
            self.node.layout().copy_key(&self.prev_key, &mut self.from);
        }
        Ok(())
    }

    /// Whether a failed pointer read can be retried after a checkpoint moved the generation
    fn pointer_checking_with_generation_catchup(
        &mut self,
        pointer: GsppResult,
        allow_no_node: bool,
        field: PointerField,
    ) -> Result<bool> {
        if !pointer.is_success() {
            if self.generation_catchup() {
                return Ok(true);
            }
            check_pointer(pointer, allow_no_node, self.cursor.current_page_id(), field)?;
        }
        Ok(false)
    }

    fn generation_catchup(&mut self) -> bool {
        let generation = GenerationPair::unpack(self.generation_source.load(AtomicOrdering::Acquire));
        if generation != self.generation {
            self.generation = generation;
            return true;
        }
        false
    }
}

impl<L: Layout> Iterator for SeekCursor<'_, L> {
    type Item = Result<(L::Key, L::Value)>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_hit() {
            Ok(true) => Some(Ok((self.mutable_key.clone(), self.mutable_value.clone()))),
            Ok(false) => None,
            Err(e) => Some(Err(e)),
        }
    }
}
