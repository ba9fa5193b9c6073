//! Tree node layout and accessors
//!
//! Every tree node starts with a fixed header followed by its keys, then
//! either the values (leaf) or the child pointers (internal).
//!
//! ```text
//! offset  size  field
//!      0     1  node type (tree node or free-list node)
//!      1     1  leaf / internal
//!      2     4  generation the node was written in
//!      6     4  key count
//!     10    24  right sibling (pointer pair)
//!     34    24  left sibling (pointer pair)
//!     58    24  successor, set when the node was copied to a newer generation
//!     82        keys, then values or children
//! ```
//!
//! Node content is only ever changed in a node of the unstable generation.
//! Older nodes are first copied, see the tree logic, so readers of the last
//! checkpoint never see a half-written node.

use crate::error::{Error, Result};
use crate::generation::GenerationPair;
use crate::gspp::{self, GsppResult, PointerField, NO_NODE};
use crate::layout::Layout;
use crate::page_cache::PageCursor;
use static_assertions::const_assert_eq;

/// Marks a page as tree node
pub const NODE_TYPE_TREE_NODE: u8 = 1;

/// Marks a page as free-list node
pub const NODE_TYPE_FREE_LIST_NODE: u8 = 2;

const LEAF_FLAG: u8 = 1;
const INTERNAL_FLAG: u8 = 0;

pub(crate) const BYTE_POS_NODE_TYPE: usize = 0;
pub(crate) const BYTE_POS_TYPE: usize = 1;
pub(crate) const BYTE_POS_GENERATION: usize = 2;
pub(crate) const BYTE_POS_KEY_COUNT: usize = 6;
pub(crate) const BYTE_POS_RIGHT_SIBLING: usize = 10;
pub(crate) const BYTE_POS_LEFT_SIBLING: usize = BYTE_POS_RIGHT_SIBLING + gspp::SIZE;
pub(crate) const BYTE_POS_NEW_GEN: usize = BYTE_POS_LEFT_SIBLING + gspp::SIZE;

/// Bytes taken by the header
pub const HEADER_LENGTH: usize = BYTE_POS_NEW_GEN + gspp::SIZE;

/// Bytes taken by one child pointer
pub const CHILD_SIZE: usize = gspp::SIZE;

const_assert_eq!(BYTE_POS_LEFT_SIBLING, 34);
const_assert_eq!(BYTE_POS_NEW_GEN, 58);
const_assert_eq!(HEADER_LENGTH, 82);

/// Leaf or internal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Holds keys and values
    Leaf,
    /// Holds keys and child pointers
    Internal,
}

/// Node accessors bound to a layout and page size
pub struct TreeNode<L> {
    layout: L,
    key_size: usize,
    value_size: usize,
    internal_max_key_count: usize,
    leaf_max_key_count: usize,
}

impl<L: Layout> TreeNode<L> {
    /// Compute capacities for `page_size`, failing if a node cannot hold at least two keys
    pub fn new(page_size: usize, layout: L) -> Result<Self> {
        let key_size = layout.key_size();
        let value_size = layout.value_size();
        let internal_max_key_count = page_size.saturating_sub(HEADER_LENGTH + CHILD_SIZE) / (key_size + CHILD_SIZE);
        let leaf_max_key_count = page_size.saturating_sub(HEADER_LENGTH) / (key_size + value_size).max(1);

        if internal_max_key_count < 2 || leaf_max_key_count < 2 {
            return Err(Error::MetadataMismatch(
                format!(
                    "page size {} fits {} internal and {} leaf keys of {} + {} bytes, at least 2 needed",
                    page_size, internal_max_key_count, leaf_max_key_count, key_size, value_size
                )
                .into(),
            ));
        }

        Ok(Self { layout, key_size, value_size, internal_max_key_count, leaf_max_key_count })
    }

    /// Layout keys and values are encoded with
    pub fn layout(&self) -> &L {
        &self.layout
    }

    /// Maximum keys in an internal node
    pub fn internal_max_key_count(&self) -> usize {
        self.internal_max_key_count
    }

    /// Maximum keys in a leaf
    pub fn leaf_max_key_count(&self) -> usize {
        self.leaf_max_key_count
    }

    /// Maximum keys for a node kind
    pub fn max_key_count(&self, kind: NodeKind) -> usize {
        match kind {
            NodeKind::Leaf => self.leaf_max_key_count,
            NodeKind::Internal => self.internal_max_key_count,
        }
    }

    /// Whether a key count read from a page can be trusted
    pub fn reasonable_key_count(&self, key_count: usize) -> bool {
        key_count <= self.internal_max_key_count.max(self.leaf_max_key_count)
    }

    // Header

    /// Format `cursor`'s page as an empty leaf
    pub fn initialize_leaf(&self, cursor: &mut PageCursor<'_>, generation: GenerationPair) -> Result<()> {
        Self::initialize(cursor, LEAF_FLAG, generation)
    }

    /// Format `cursor`'s page as an empty internal node
    pub fn initialize_internal(&self, cursor: &mut PageCursor<'_>, generation: GenerationPair) -> Result<()> {
        Self::initialize(cursor, INTERNAL_FLAG, generation)
    }

    fn initialize(cursor: &mut PageCursor<'_>, kind_flag: u8, generation: GenerationPair) -> Result<()> {
        cursor.put_u8_at(BYTE_POS_NODE_TYPE, NODE_TYPE_TREE_NODE);
        cursor.put_u8_at(BYTE_POS_TYPE, kind_flag);
        Self::set_generation(cursor, generation.unstable);
        Self::set_key_count(cursor, 0);
        Self::set_right_sibling(cursor, NO_NODE, generation)?;
        Self::set_left_sibling(cursor, NO_NODE, generation)?;
        Self::set_new_gen(cursor, NO_NODE, generation)
    }

    /// Page type byte
    pub fn node_type(cursor: &mut PageCursor<'_>) -> u8 {
        cursor.get_u8_at(BYTE_POS_NODE_TYPE)
    }

    /// Whether the page is a leaf
    pub fn is_leaf(cursor: &mut PageCursor<'_>) -> bool {
        cursor.get_u8_at(BYTE_POS_TYPE) == LEAF_FLAG
    }

    /// Whether the page is an internal node
    pub fn is_internal(cursor: &mut PageCursor<'_>) -> bool {
        cursor.get_u8_at(BYTE_POS_TYPE) == INTERNAL_FLAG
    }

    /// Kind byte as read, without validation
    pub fn kind_byte(cursor: &mut PageCursor<'_>) -> u8 {
        cursor.get_u8_at(BYTE_POS_TYPE)
    }

    /// Node kind from the header
    pub fn kind(cursor: &mut PageCursor<'_>) -> NodeKind {
        if Self::is_leaf(cursor) {
            NodeKind::Leaf
        } else {
            NodeKind::Internal
        }
    }

    /// Generation the node was written in
    pub fn generation(cursor: &mut PageCursor<'_>) -> u64 {
        cursor.get_u32_at(BYTE_POS_GENERATION) as u64
    }

    /// Set the node generation
    pub fn set_generation(cursor: &mut PageCursor<'_>, generation: u64) {
        cursor.put_u32_at(BYTE_POS_GENERATION, generation as u32);
    }

    /// Number of keys
    pub fn key_count(cursor: &mut PageCursor<'_>) -> usize {
        cursor.get_u32_at(BYTE_POS_KEY_COUNT) as usize
    }

    /// Set the number of keys
    pub fn set_key_count(cursor: &mut PageCursor<'_>, count: usize) {
        cursor.put_u32_at(BYTE_POS_KEY_COUNT, count as u32);
    }

    /// Read the right sibling pointer
    pub fn right_sibling(cursor: &mut PageCursor<'_>, generation: GenerationPair) -> GsppResult {
        gspp::read(cursor, BYTE_POS_RIGHT_SIBLING, generation)
    }

    /// Read the left sibling pointer
    pub fn left_sibling(cursor: &mut PageCursor<'_>, generation: GenerationPair) -> GsppResult {
        gspp::read(cursor, BYTE_POS_LEFT_SIBLING, generation)
    }

    /// Read the successor pointer
    pub fn new_gen(cursor: &mut PageCursor<'_>, generation: GenerationPair) -> GsppResult {
        gspp::read(cursor, BYTE_POS_NEW_GEN, generation)
    }

    /// Set the right sibling pointer
    pub fn set_right_sibling(cursor: &mut PageCursor<'_>, sibling: u64, generation: GenerationPair) -> Result<()> {
        Self::write_pointer(cursor, BYTE_POS_RIGHT_SIBLING, sibling, generation, PointerField::RightSibling)
    }

    /// Set the left sibling pointer
    pub fn set_left_sibling(cursor: &mut PageCursor<'_>, sibling: u64, generation: GenerationPair) -> Result<()> {
        Self::write_pointer(cursor, BYTE_POS_LEFT_SIBLING, sibling, generation, PointerField::LeftSibling)
    }

    /// Set the successor pointer
    pub fn set_new_gen(cursor: &mut PageCursor<'_>, new_gen: u64, generation: GenerationPair) -> Result<()> {
        Self::write_pointer(cursor, BYTE_POS_NEW_GEN, new_gen, generation, PointerField::NewGen)
    }

    fn write_pointer(
        cursor: &mut PageCursor<'_>,
        offset: usize,
        pointer: u64,
        generation: GenerationPair,
        field: PointerField,
    ) -> Result<()> {
        let result = gspp::write(cursor, offset, pointer, generation)?;
        gspp::check_write(result, cursor.current_page_id(), field)
    }

    /// Generation stored in the slot a successful read of the pair at `offset` used
    pub fn pointer_generation(cursor: &mut PageCursor<'_>, offset: usize, result: GsppResult) -> u64 {
        gspp::pointer_generation(cursor, offset, result)
    }

    // Body

    /// Offset of the key at `pos`
    pub fn key_offset(&self, pos: usize) -> usize {
        HEADER_LENGTH + pos * self.key_size
    }

    /// Offset of the leaf value at `pos`
    pub fn value_offset(&self, pos: usize) -> usize {
        HEADER_LENGTH + self.leaf_max_key_count * self.key_size + pos * self.value_size
    }

    /// Offset of the child pointer at `pos`
    pub fn child_offset(&self, pos: usize) -> usize {
        HEADER_LENGTH + self.internal_max_key_count * self.key_size + pos * CHILD_SIZE
    }

    /// Read the key at `pos` into `into`
    pub fn key_at(&self, cursor: &mut PageCursor<'_>, into: &mut L::Key, pos: usize) {
        cursor.set_offset(self.key_offset(pos));
        self.layout.read_key(cursor, into);
    }

    /// Write `key` at `pos`
    pub fn set_key_at(&self, cursor: &mut PageCursor<'_>, key: &L::Key, pos: usize) {
        cursor.set_offset(self.key_offset(pos));
        self.layout.write_key(cursor, key);
    }

    /// Read the value at `pos` into `into`
    pub fn value_at(&self, cursor: &mut PageCursor<'_>, into: &mut L::Value, pos: usize) {
        cursor.set_offset(self.value_offset(pos));
        self.layout.read_value(cursor, into);
    }

    /// Write `value` at `pos`
    pub fn set_value_at(&self, cursor: &mut PageCursor<'_>, value: &L::Value, pos: usize) {
        cursor.set_offset(self.value_offset(pos));
        self.layout.write_value(cursor, value);
    }

    /// Read the child pointer at `pos`
    pub fn child_at(&self, cursor: &mut PageCursor<'_>, pos: usize, generation: GenerationPair) -> GsppResult {
        gspp::read(cursor, self.child_offset(pos), generation)
    }

    /// Set the child pointer at `pos`
    pub fn set_child_at(
        &self,
        cursor: &mut PageCursor<'_>,
        child: u64,
        pos: usize,
        generation: GenerationPair,
    ) -> Result<()> {
        Self::write_pointer(cursor, self.child_offset(pos), child, generation, PointerField::Child(pos))
    }

    /// Insert a key and value at `pos`, shifting the ones after it
    pub fn insert_key_value_at(
        &self,
        cursor: &mut PageCursor<'_>,
        key: &L::Key,
        value: &L::Value,
        pos: usize,
        key_count: usize,
    ) {
        let tail = key_count - pos;
        cursor.shift_bytes(self.key_offset(pos), tail * self.key_size, self.key_size as isize);
        cursor.shift_bytes(self.value_offset(pos), tail * self.value_size, self.value_size as isize);
        self.set_key_at(cursor, key, pos);
        self.set_value_at(cursor, value, pos);
    }

    /// Remove the key and value at `pos`, shifting the ones after it
    pub fn remove_key_value_at(&self, cursor: &mut PageCursor<'_>, pos: usize, key_count: usize) {
        let tail = key_count - pos - 1;
        cursor.shift_bytes(self.key_offset(pos + 1), tail * self.key_size, -(self.key_size as isize));
        cursor.shift_bytes(self.value_offset(pos + 1), tail * self.value_size, -(self.value_size as isize));
    }

    /// Insert a key at `pos` with `child` to its right, shifting what follows
    pub fn insert_key_and_right_child_at(
        &self,
        cursor: &mut PageCursor<'_>,
        key: &L::Key,
        child: u64,
        pos: usize,
        key_count: usize,
        generation: GenerationPair,
    ) -> Result<()> {
        let tail = key_count - pos;
        cursor.shift_bytes(self.key_offset(pos), tail * self.key_size, self.key_size as isize);
        cursor.shift_bytes(self.child_offset(pos + 1), tail * CHILD_SIZE, CHILD_SIZE as isize);
        self.set_key_at(cursor, key, pos);
        self.set_child_at(cursor, child, pos + 1, generation)
    }

    fn copy_keys(&self, from: &mut PageCursor<'_>, from_pos: usize, to: &mut PageCursor<'_>, to_pos: usize, count: usize) {
        from.copy_to(self.key_offset(from_pos), to, self.key_offset(to_pos), count * self.key_size);
    }

    fn copy_values(&self, from: &mut PageCursor<'_>, from_pos: usize, to: &mut PageCursor<'_>, to_pos: usize, count: usize) {
        from.copy_to(self.value_offset(from_pos), to, self.value_offset(to_pos), count * self.value_size);
    }

    fn copy_children(&self, from: &mut PageCursor<'_>, from_pos: usize, to: &mut PageCursor<'_>, to_pos: usize, count: usize) {
        from.copy_to(self.child_offset(from_pos), to, self.child_offset(to_pos), count * CHILD_SIZE);
    }

    /// Split a full leaf while inserting `new_key`
    ///
    /// The entries plus the new one are divided at `middle = (key_count + 1) / 2`:
    /// the left keeps `middle` of them, the right gets the rest. `new_splitter`
    /// receives the first key of the right node.
    #[allow(clippy::too_many_arguments)]
    pub fn do_split_leaf(
        &self,
        left: &mut PageCursor<'_>,
        left_key_count: usize,
        right: &mut PageCursor<'_>,
        insert_pos: usize,
        new_key: &L::Key,
        new_value: &L::Value,
        new_splitter: &mut L::Key,
    ) {
        let key_count_after_insert = left_key_count + 1;
        let middle = key_count_after_insert / 2;
        let right_key_count = key_count_after_insert - middle;

        if insert_pos < middle {
            // The entry at middle - 1 is pushed to the right by the insert
            self.key_at(left, new_splitter, middle - 1);
            self.copy_keys(left, middle - 1, right, 0, right_key_count);
            self.copy_values(left, middle - 1, right, 0, right_key_count);
            self.insert_key_value_at(left, new_key, new_value, insert_pos, middle - 1);
        } else {
            if insert_pos == middle {
                self.layout.copy_key(new_key, new_splitter);
            } else {
                self.key_at(left, new_splitter, middle);
            }
            let count_before = insert_pos - middle;
            if count_before > 0 {
                self.copy_keys(left, middle, right, 0, count_before);
                self.copy_values(left, middle, right, 0, count_before);
            }
            self.set_key_at(right, new_key, count_before);
            self.set_value_at(right, new_value, count_before);
            let count_after = left_key_count - insert_pos;
            if count_after > 0 {
                self.copy_keys(left, insert_pos, right, count_before + 1, count_after);
                self.copy_values(left, insert_pos, right, count_before + 1, count_after);
            }
        }

        Self::set_key_count(left, middle);
        Self::set_key_count(right, right_key_count);
    }

    /// Split a full internal node while inserting `new_key` with `new_right_child`
    ///
    /// Of the keys plus the new one, the one at `middle = (key_count + 1) / 2`
    /// moves up as `new_splitter` and is kept in neither node.
    #[allow(clippy::too_many_arguments)]
    pub fn do_split_internal(
        &self,
        left: &mut PageCursor<'_>,
        left_key_count: usize,
        right: &mut PageCursor<'_>,
        insert_pos: usize,
        new_key: &L::Key,
        new_right_child: u64,
        generation: GenerationPair,
        new_splitter: &mut L::Key,
    ) -> Result<()> {
        let key_count_after_insert = left_key_count + 1;
        let middle = key_count_after_insert / 2;
        let right_key_count = key_count_after_insert - middle - 1;

        if insert_pos < middle {
            // Key at middle - 1 moves up, everything from middle goes right
            self.key_at(left, new_splitter, middle - 1);
            self.copy_keys(left, middle, right, 0, right_key_count);
            self.copy_children(left, middle, right, 0, right_key_count + 1);
            self.insert_key_and_right_child_at(left, new_key, new_right_child, insert_pos, middle - 1, generation)?;
        } else if insert_pos == middle {
            // The new key moves up, its child becomes the first child on the right
            self.layout.copy_key(new_key, new_splitter);
            self.copy_keys(left, middle, right, 0, right_key_count);
            self.copy_children(left, middle + 1, right, 1, right_key_count);
            self.set_child_at(right, new_right_child, 0, generation)?;
        } else {
            // Key at middle moves up, the new key lands among the rest on the right
            self.key_at(left, new_splitter, middle);
            let count_before = insert_pos - middle - 1;
            if count_before > 0 {
                self.copy_keys(left, middle + 1, right, 0, count_before);
            }
            self.set_key_at(right, new_key, count_before);
            let count_after = left_key_count - insert_pos;
            if count_after > 0 {
                self.copy_keys(left, insert_pos, right, count_before + 1, count_after);
            }

            self.copy_children(left, middle + 1, right, 0, count_before + 1);
            self.set_child_at(right, new_right_child, count_before + 1, generation)?;
            if count_after > 0 {
                self.copy_children(left, insert_pos + 1, right, count_before + 2, count_after);
            }
        }

        Self::set_key_count(left, middle);
        Self::set_key_count(right, right_key_count);
        Ok(())
    }
}
