//! Insert and remove on the tree, with copy-on-write into new generations
//!
//! The writer keeps the path from the root to the last leaf it touched as a
//! stack of levels, each knowing the key range its node covers. The next
//! operation climbs only as far as needed before descending again, so runs of
//! nearby keys mostly stay in one leaf.
//!
//! A node that was written in a generation older than the unstable one is
//! never modified in place. It is first copied into a freshly acquired page,
//! its successor, and the change is applied there. Replacing a node, like
//! splitting one, is reported upwards as a [`StructurePropagation`] for the
//! parent to apply.

use crate::error::{Error, PageId, Result};
use crate::freelist::FreeList;
use crate::generation::GenerationPair;
use crate::gspp::{check_pointer, PointerField, NO_NODE};
use crate::key_search::search;
use crate::layout::{Layout, ValueMerger};
use crate::node::{TreeNode, NODE_TYPE_TREE_NODE};
use crate::page_cache::PageCursor;
use std::cmp::Ordering;
use tracing::trace;

/// A node on the current path and the key range it covers
struct Level<K> {
    tree_node_id: PageId,
    /// Position of this node among its parent's children
    child_pos: usize,
    lower: K,
    lower_open: bool,
    upper: K,
    upper_open: bool,
}

impl<K> Level<K> {
    fn covers<L: Layout<Key = K>>(&self, layout: &L, key: &K) -> bool {
        (self.lower_open || layout.compare(key, &self.lower) != Ordering::Less)
            && (self.upper_open || layout.compare(key, &self.upper) == Ordering::Less)
    }
}

/// A split to insert into the parent
pub(crate) struct Split<K> {
    /// Node that was split, keeps the lower half
    pub left: PageId,
    /// First key of the right node
    pub key: K,
    /// New node holding the upper half
    pub right: PageId,
}

/// Changes a child made that its parent must apply
pub(crate) struct StructurePropagation<K> {
    /// The child was replaced by this successor
    pub new_gen: Option<PageId>,
    /// The child was split
    pub split: Option<Split<K>>,
}

impl<K> StructurePropagation<K> {
    pub fn new() -> Self {
        Self { new_gen: None, split: None }
    }

    pub fn has_changes(&self) -> bool {
        self.new_gen.is_some() || self.split.is_some()
    }
}

/// Page allocation and generations for one modification
pub(crate) struct Context<'f> {
    pub free_list: &'f mut FreeList,
    pub generation: GenerationPair,
}

/// Modification logic of the single writer
pub(crate) struct TreeLogic<'n, L: Layout> {
    node: &'n TreeNode<L>,
    levels: Vec<Level<L::Key>>,
    /// Index into `levels` of the node the cursor is on, `None` above the root
    current_level: Option<usize>,
    read_key: L::Key,
}

impl<'n, L: Layout> TreeLogic<'n, L> {
    pub fn new(node: &'n TreeNode<L>) -> Self {
        let read_key = node.layout().new_key();
        Self { node, levels: Vec::new(), current_level: None, read_key }
    }

    /// Start from `root`, forgetting the cached path
    pub fn initialize(&mut self, root: PageId) {
        self.ensure_level(0);
        let level = &mut self.levels[0];
        level.tree_node_id = root;
        level.child_pos = 0;
        level.lower_open = true;
        level.upper_open = true;
        self.current_level = Some(0);
    }

    /// Whether the path has been consumed past the root
    pub fn above_root(&self) -> bool {
        self.current_level.is_none()
    }

    fn ensure_level(&mut self, depth: usize) {
        while self.levels.len() <= depth {
            let layout = self.node.layout();
            self.levels.push(Level {
                tree_node_id: PageId(NO_NODE),
                child_pos: 0,
                lower: layout.new_key(),
                lower_open: true,
                upper: layout.new_key(),
                upper_open: true,
            });
        }
    }

    fn current(&self) -> Result<usize> {
        self.current_level.ok_or(Error::InvalidOperation("tree logic not initialized"))
    }

    fn pop_level(&mut self, cursor: &mut PageCursor<'_>) -> Result<bool> {
        match self.current_level {
            Some(0) | None => {
                self.current_level = None;
                Ok(false)
            }
            Some(level) => {
                self.current_level = Some(level - 1);
                cursor.next_page(self.levels[level - 1].tree_node_id)?;
                Ok(true)
            }
        }
    }

    fn ensure_tree_node(cursor: &mut PageCursor<'_>) -> Result<()> {
        let node_type = TreeNode::<L>::node_type(cursor);
        if node_type != NODE_TYPE_TREE_NODE {
            return Err(Error::corruption(
                format!("expected a tree node, found node type {}", node_type),
                cursor.current_page_id(),
            ));
        }
        Ok(())
    }

    /// Climb until a level covers `key`, then descend to the leaf that should hold it
    fn move_to_correct_leaf(&mut self, cursor: &mut PageCursor<'_>, key: &L::Key, generation: GenerationPair) -> Result<()> {
        let node = self.node;
        let layout = node.layout();
        let mut level = self.current()?;
        while level > 0 && !self.levels[level].covers(layout, key) {
            level -= 1;
        }
        self.current_level = Some(level);
        cursor.next_page(self.levels[level].tree_node_id)?;

        loop {
            Self::ensure_tree_node(cursor)?;
            if !TreeNode::<L>::is_internal(cursor) {
                break;
            }
            let page_id = cursor.current_page_id();
            let key_count = TreeNode::<L>::key_count(cursor);
            if key_count > self.node.internal_max_key_count() {
                return Err(Error::corruption(format!("internal node with {} keys", key_count), page_id));
            }
            let child_pos = search(cursor, self.node, key, &mut self.read_key, key_count).child_position();
            let child = check_pointer(self.node.child_at(cursor, child_pos, generation), false, page_id, PointerField::Child(child_pos))?;
            let has_left_sibling = check_pointer(TreeNode::<L>::left_sibling(cursor, generation), true, page_id, PointerField::LeftSibling)? != NO_NODE;
            let has_right_sibling = check_pointer(TreeNode::<L>::right_sibling(cursor, generation), true, page_id, PointerField::RightSibling)? != NO_NODE;

            let parent_index = level;
            level += 1;
            self.ensure_level(level);
            let (parents, children) = self.levels.split_at_mut(level);
            let parent = &parents[parent_index];
            let next = &mut children[0];
            next.tree_node_id = PageId(child);
            next.child_pos = child_pos;

            // Lower bound from the separator left of the child, or inherited from the parent
            if child_pos == 0 {
                next.lower_open = parent.lower_open || !has_left_sibling;
                layout.copy_key(&parent.lower, &mut next.lower);
            } else {
                next.lower_open = false;
                self.node.key_at(cursor, &mut next.lower, child_pos - 1);
            }
            if child_pos == key_count {
                next.upper_open = parent.upper_open || !has_right_sibling;
                layout.copy_key(&parent.upper, &mut next.upper);
            } else {
                next.upper_open = false;
                self.node.key_at(cursor, &mut next.upper, child_pos);
            }

            cursor.check_out_of_bounds()?;
            cursor.next_page(PageId(child))?;
        }

        self.current_level = Some(level);
        Ok(())
    }

    /// Insert `key` and `value`, letting `merger` decide when the key exists
    ///
    /// Leaves the cursor and the path on the last modified node, with any
    /// change the root itself must reflect left in `propagation`.
    pub fn insert<M>(
        &mut self,
        cursor: &mut PageCursor<'_>,
        propagation: &mut StructurePropagation<L::Key>,
        key: &L::Key,
        value: &L::Value,
        merger: &M,
        ctx: &mut Context<'_>,
    ) -> Result<()>
    where
        M: ValueMerger<L::Key, L::Value> + ?Sized,
    {
        self.move_to_correct_leaf(cursor, key, ctx.generation)?;
        self.insert_in_leaf(cursor, propagation, key, value, merger, ctx)?;
        self.handle_structure_changes(cursor, propagation, ctx)
    }

    /// Remove `key`, returning the value it had
    pub fn remove(
        &mut self,
        cursor: &mut PageCursor<'_>,
        propagation: &mut StructurePropagation<L::Key>,
        key: &L::Key,
        ctx: &mut Context<'_>,
    ) -> Result<Option<L::Value>> {
        self.move_to_correct_leaf(cursor, key, ctx.generation)?;

        let key_count = TreeNode::<L>::key_count(cursor);
        if key_count > self.node.leaf_max_key_count() {
            return Err(Error::corruption(format!("leaf with {} keys", key_count), cursor.current_page_id()));
        }
        let result = search(cursor, self.node, key, &mut self.read_key, key_count);
        if !result.is_hit() {
            return Ok(None);
        }
        let pos = result.position();

        self.create_new_gen_if_needed(cursor, propagation, ctx)?;
        let mut value = self.node.layout().new_value();
        self.node.value_at(cursor, &mut value, pos);
        self.node.remove_key_value_at(cursor, pos, key_count);
        TreeNode::<L>::set_key_count(cursor, key_count - 1);
        cursor.check_out_of_bounds()?;

        self.handle_structure_changes(cursor, propagation, ctx)?;
        Ok(Some(value))
    }

    fn insert_in_leaf<M>(
        &mut self,
        cursor: &mut PageCursor<'_>,
        propagation: &mut StructurePropagation<L::Key>,
        key: &L::Key,
        value: &L::Value,
        merger: &M,
        ctx: &mut Context<'_>,
    ) -> Result<()>
    where
        M: ValueMerger<L::Key, L::Value> + ?Sized,
    {
        let key_count = TreeNode::<L>::key_count(cursor);
        if key_count > self.node.leaf_max_key_count() {
            return Err(Error::corruption(format!("leaf with {} keys", key_count), cursor.current_page_id()));
        }
        let result = search(cursor, self.node, key, &mut self.read_key, key_count);
        let pos = result.position();

        if result.is_hit() {
            let mut existing = self.node.layout().new_value();
            self.node.value_at(cursor, &mut existing, pos);
            if let Some(merged) = merger.merge(&self.read_key, key, &existing, value) {
                self.create_new_gen_if_needed(cursor, propagation, ctx)?;
                self.node.set_value_at(cursor, &merged, pos);
            }
            return cursor.check_out_of_bounds();
        }

        self.create_new_gen_if_needed(cursor, propagation, ctx)?;
        if key_count < self.node.leaf_max_key_count() {
            self.node.insert_key_value_at(cursor, key, value, pos, key_count);
            TreeNode::<L>::set_key_count(cursor, key_count + 1);
            return cursor.check_out_of_bounds();
        }

        self.split_leaf(cursor, propagation, key, value, key_count, pos, ctx)
    }

    #[allow(clippy::too_many_arguments)]
    fn split_leaf(
        &mut self,
        cursor: &mut PageCursor<'_>,
        propagation: &mut StructurePropagation<L::Key>,
        key: &L::Key,
        value: &L::Value,
        key_count: usize,
        pos: usize,
        ctx: &mut Context<'_>,
    ) -> Result<()> {
        let current = cursor.current_page_id();
        let old_right = check_pointer(
            TreeNode::<L>::right_sibling(cursor, ctx.generation),
            true,
            current,
            PointerField::RightSibling,
        )?;
        let new_right = ctx.free_list.acquire_new_id(cursor.cache(), ctx.generation)?;

        let mut splitter = self.node.layout().new_key();
        {
            let mut right = cursor.open_linked_cursor(new_right)?;
            self.node.initialize_leaf(&mut right, ctx.generation)?;
            TreeNode::<L>::set_right_sibling(&mut right, old_right, ctx.generation)?;
            TreeNode::<L>::set_left_sibling(&mut right, current.0, ctx.generation)?;
            self.node.do_split_leaf(cursor, key_count, &mut right, pos, key, value, &mut splitter);
            right.check_out_of_bounds()?;
        }
        self.link_split(cursor, current, old_right, new_right, ctx)?;

        trace!(left = current.0, right = new_right.0, "split leaf");
        propagation.split = Some(Split { left: current, key: splitter, right: new_right });
        Ok(())
    }

    fn link_split(
        &self,
        cursor: &mut PageCursor<'_>,
        current: PageId,
        old_right: u64,
        new_right: PageId,
        ctx: &mut Context<'_>,
    ) -> Result<()> {
        TreeNode::<L>::set_right_sibling(cursor, new_right.0, ctx.generation)?;
        cursor.check_out_of_bounds()?;
        if old_right != NO_NODE {
            let mut old_right_cursor = cursor.open_linked_cursor(PageId(old_right))?;
            TreeNode::<L>::set_left_sibling(&mut old_right_cursor, new_right.0, ctx.generation)?;
            old_right_cursor.check_out_of_bounds()?;
        }
        debug_assert_eq!(cursor.current_page_id(), current);
        Ok(())
    }

    fn insert_in_internal(
        &mut self,
        cursor: &mut PageCursor<'_>,
        propagation: &mut StructurePropagation<L::Key>,
        key: &L::Key,
        right_child: PageId,
        ctx: &mut Context<'_>,
    ) -> Result<()> {
        self.create_new_gen_if_needed(cursor, propagation, ctx)?;
        let key_count = TreeNode::<L>::key_count(cursor);
        if key_count > self.node.internal_max_key_count() {
            return Err(Error::corruption(format!("internal node with {} keys", key_count), cursor.current_page_id()));
        }
        let pos = search(cursor, self.node, key, &mut self.read_key, key_count).position();

        if key_count < self.node.internal_max_key_count() {
            self.node.insert_key_and_right_child_at(cursor, key, right_child.0, pos, key_count, ctx.generation)?;
            TreeNode::<L>::set_key_count(cursor, key_count + 1);
            return cursor.check_out_of_bounds();
        }

        let current = cursor.current_page_id();
        let old_right = check_pointer(
            TreeNode::<L>::right_sibling(cursor, ctx.generation),
            true,
            current,
            PointerField::RightSibling,
        )?;
        let new_right = ctx.free_list.acquire_new_id(cursor.cache(), ctx.generation)?;

        let mut splitter = self.node.layout().new_key();
        {
            let mut right = cursor.open_linked_cursor(new_right)?;
            self.node.initialize_internal(&mut right, ctx.generation)?;
            TreeNode::<L>::set_right_sibling(&mut right, old_right, ctx.generation)?;
            TreeNode::<L>::set_left_sibling(&mut right, current.0, ctx.generation)?;
            self.node.do_split_internal(cursor, key_count, &mut right, pos, key, right_child.0, ctx.generation, &mut splitter)?;
            right.check_out_of_bounds()?;
        }
        self.link_split(cursor, current, old_right, new_right, ctx)?;

        trace!(left = current.0, right = new_right.0, "split internal node");
        propagation.split = Some(Split { left: current, key: splitter, right: new_right });
        Ok(())
    }

    /// Apply what the child reported to each parent up the path
    ///
    /// Stops at the first parent that absorbs the change. Whatever reaches
    /// past the root stays in `propagation` for the caller.
    fn handle_structure_changes(
        &mut self,
        cursor: &mut PageCursor<'_>,
        propagation: &mut StructurePropagation<L::Key>,
        ctx: &mut Context<'_>,
    ) -> Result<()> {
        while propagation.has_changes() {
            let pos = self.levels[self.current()?].child_pos;
            if !self.pop_level(cursor)? {
                return Ok(());
            }

            if let Some(new_gen) = propagation.new_gen.take() {
                self.node.set_child_at(cursor, new_gen.0, pos, ctx.generation)?;
                cursor.check_out_of_bounds()?;
            }
            if let Some(split) = propagation.split.take() {
                self.insert_in_internal(cursor, propagation, &split.key, split.right, ctx)?;
            }
        }
        Ok(())
    }

    /// Copy the node under the cursor into a successor unless it is already of the unstable generation
    ///
    /// The old node gets a pointer to its successor and is released, the
    /// siblings are redirected, and the cursor ends up on the successor.
    fn create_new_gen_if_needed(
        &mut self,
        cursor: &mut PageCursor<'_>,
        propagation: &mut StructurePropagation<L::Key>,
        ctx: &mut Context<'_>,
    ) -> Result<()> {
        let old_id = cursor.current_page_id();
        let node_generation = TreeNode::<L>::generation(cursor);
        if node_generation == ctx.generation.unstable {
            return Ok(());
        }
        if node_generation > ctx.generation.unstable {
            return Err(Error::corruption(
                format!("node generation {} is ahead of unstable generation {}", node_generation, ctx.generation.unstable),
                old_id,
            ));
        }

        let new_gen_id = ctx.free_list.acquire_new_id(cursor.cache(), ctx.generation)?;
        {
            let page_size = cursor.page_size();
            let mut new_cursor = cursor.open_linked_cursor(new_gen_id)?;
            cursor.copy_to(0, &mut new_cursor, 0, page_size);
            TreeNode::<L>::set_generation(&mut new_cursor, ctx.generation.unstable);
            TreeNode::<L>::set_new_gen(&mut new_cursor, NO_NODE, ctx.generation)?;
            new_cursor.check_out_of_bounds()?;
        }

        TreeNode::<L>::set_new_gen(cursor, new_gen_id.0, ctx.generation)?;
        let left = check_pointer(TreeNode::<L>::left_sibling(cursor, ctx.generation), true, old_id, PointerField::LeftSibling)?;
        let right = check_pointer(TreeNode::<L>::right_sibling(cursor, ctx.generation), true, old_id, PointerField::RightSibling)?;
        cursor.check_out_of_bounds()?;

        // Redirect siblings to the successor
        if left != NO_NODE {
            cursor.next_page(PageId(left))?;
            TreeNode::<L>::set_right_sibling(cursor, new_gen_id.0, ctx.generation)?;
            cursor.check_out_of_bounds()?;
        }
        if right != NO_NODE {
            cursor.next_page(PageId(right))?;
            TreeNode::<L>::set_left_sibling(cursor, new_gen_id.0, ctx.generation)?;
            cursor.check_out_of_bounds()?;
        }

        cursor.next_page(new_gen_id)?;
        let level = self.current()?;
        self.levels[level].tree_node_id = new_gen_id;
        propagation.new_gen = Some(new_gen_id);
        ctx.free_list.release_id(cursor.cache(), ctx.generation, old_id.0)?;
        trace!(old = old_id.0, new = new_gen_id.0, "copied node into new generation");
        Ok(())
    }
}
