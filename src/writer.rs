//! The single writer of a tree

use crate::error::Result;
use crate::generation::GenerationPair;
use crate::layout::{Layout, Overwrite, ValueMerger};
use crate::node::TreeNode;
use crate::page_cache::{PageCursor, PinIntent};
use crate::tree::{GbpTree, Root, WriterState};
use crate::tree_logic::{Context, StructurePropagation, TreeLogic};
use parking_lot::MutexGuard;
use tracing::{debug, warn};

/// Exclusive access for modifying a tree
///
/// Obtained from [`GbpTree::writer`]. Holds the writer lock, so checkpoints
/// wait until it is closed or dropped. Changes are visible to seekers right
/// away and become durable at the next checkpoint.
pub struct Writer<'a, L: Layout> {
    tree: &'a GbpTree<L>,
    state: MutexGuard<'a, WriterState>,
    cursor: PageCursor<'a>,
    logic: TreeLogic<'a, L>,
    propagation: StructurePropagation<L::Key>,
    generation: GenerationPair,
    closed: bool,
}

impl<'a, L: Layout> Writer<'a, L> {
    pub(crate) fn new(tree: &'a GbpTree<L>, state: MutexGuard<'a, WriterState>) -> Self {
        let mut logic = TreeLogic::new(tree.node());
        logic.initialize(tree.root().id);
        Self {
            tree,
            state,
            cursor: tree.cache().cursor(PinIntent::Write),
            logic,
            propagation: StructurePropagation::new(),
            // Checkpoints need the lock held here, so the generation is fixed
            generation: tree.generation_pair(),
            closed: false,
        }
    }

    /// Insert `key` with `value`, replacing any existing value
    pub fn put(&mut self, key: &L::Key, value: &L::Value) -> Result<()> {
        self.merge(key, value, &Overwrite)
    }

    /// Insert `key` with `value`, letting `merger` decide if `key` exists
    pub fn merge<M>(&mut self, key: &L::Key, value: &L::Value, merger: &M) -> Result<()>
    where
        M: ValueMerger<L::Key, L::Value> + ?Sized,
    {
        let mut ctx = Context { free_list: &mut self.state.free_list, generation: self.generation };
        let result = self.logic.insert(&mut self.cursor, &mut self.propagation, key, value, merger, &mut ctx);
        self.finish(result)
    }

    /// Remove `key`, returning the value it had
    pub fn remove(&mut self, key: &L::Key) -> Result<Option<L::Value>> {
        let mut ctx = Context { free_list: &mut self.state.free_list, generation: self.generation };
        let result = self.logic.remove(&mut self.cursor, &mut self.propagation, key, &mut ctx);
        let removed = match result {
            Ok(removed) => removed,
            Err(err) => return self.finish(Err(err)).map(|_| None),
        };
        self.finish(Ok(()))?;
        Ok(removed)
    }

    /// Apply root changes left by an operation and release the page
    ///
    /// The path down to the last leaf stays cached so the next operation only
    /// climbs as far as it must. It is dropped when the root changed or the
    /// operation failed halfway.
    fn finish(&mut self, result: Result<()>) -> Result<()> {
        self.state.changes_since_last_checkpoint = true;
        let applied = result.and_then(|_| self.handle_root_changes());
        self.propagation.new_gen = None;
        self.propagation.split = None;
        if applied.is_err() || self.logic.above_root() {
            self.logic.initialize(self.tree.root().id);
        }
        self.cursor.unpin();
        applied
    }

    fn handle_root_changes(&mut self) -> Result<()> {
        let tree = self.tree;
        let generation = self.generation;
        if let Some(split) = self.propagation.split.take() {
            let node = tree.node();
            let new_root = self.state.free_list.acquire_new_id(tree.cache(), generation)?;
            self.cursor.next_page(new_root)?;
            node.initialize_internal(&mut self.cursor, generation)?;
            node.set_child_at(&mut self.cursor, split.left.0, 0, generation)?;
            node.insert_key_and_right_child_at(&mut self.cursor, &split.key, split.right.0, 0, 0, generation)?;
            TreeNode::<L>::set_key_count(&mut self.cursor, 1);
            self.cursor.check_out_of_bounds()?;

            tree.set_root(Root { id: new_root, generation: generation.unstable });
            tree.monitor().tree_growth();
            debug!(root = new_root.0, left = split.left.0, right = split.right.0, "tree grew");
        } else if let Some(new_gen) = self.propagation.new_gen.take() {
            tree.set_root(Root { id: new_gen, generation: generation.unstable });
            debug!(root = new_gen.0, "root replaced by successor");
        }
        Ok(())
    }

    /// Close the writer, releasing it for others and for checkpoints
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        self.cursor.unpin();
        self.tree.release_writer()
    }
}

impl<L: Layout> Drop for Writer<'_, L> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.cursor.unpin();
        if let Err(err) = self.tree.release_writer() {
            warn!(%err, "failed to release writer");
        }
    }
}
