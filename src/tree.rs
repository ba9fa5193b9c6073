//! The tree: opening, seeking, writing and checkpointing
//!
//! # Example
//!
//! ```no_run
//! use gbptree::{GbpTree, LongLayout};
//!
//! # fn main() -> gbptree::Result<()> {
//! let tree = GbpTree::open_or_create("index.db", LongLayout::new(), 8192)?;
//!
//! let mut writer = tree.writer()?;
//! writer.put(&1, &100)?;
//! writer.put(&2, &200)?;
//! writer.close()?;
//! tree.checkpoint()?;
//!
//! for hit in tree.seek(0, 10)? {
//!     let (key, value) = hit?;
//!     println!("{} => {}", key, value);
//! }
//! tree.close()?;
//! # Ok(())
//! # }
//! ```

use crate::consistency::{check_consistency, ConsistencyReport};
use crate::crash_cleanup::clean_crash_pointers;
use crate::cursor::SeekCursor;
use crate::error::{Error, PageId, Result};
use crate::freelist::FreeList;
use crate::generation::GenerationPair;
use crate::io::{IoBackend, MemoryBackend, MmapBackend};
use crate::layout::Layout;
use crate::meta::{
    self, max_header_size, read_state_pages, select_newest_valid_state, select_oldest_or_invalid, Meta, TreeState,
    FORMAT_VERSION, META_PAGE_ID, MIN_TREE_NODE_ID,
};
use crate::monitor::{Monitor, NoMonitor};
use crate::node::{TreeNode, NODE_TYPE_TREE_NODE};
use crate::page_cache::{PageCache, PageCursor, PinIntent, MAX_PAGE_SIZE, MIN_PAGE_SIZE};
use crate::writer::Writer;
use byteorder::{BigEndian, ByteOrder};
use crossbeam_utils::atomic::AtomicCell;
use parking_lot::Mutex;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default initial size of a store file
pub const DEFAULT_INITIAL_FILE_SIZE: u64 = 1024 * 1024;

/// Paths sampled by [`GbpTree::estimate_number_of_entries`]
const ESTIMATE_SAMPLES: usize = 100;

/// Sampling rounds before giving up on a tree whose depth keeps changing
const ESTIMATE_ATTEMPTS: usize = 64;

/// Root node and the generation of the pointer to it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Root {
    /// Root node id
    pub id: PageId,
    /// Generation the root was set in
    pub generation: u64,
}

/// State guarded by the writer lock
pub(crate) struct WriterState {
    pub free_list: FreeList,
    pub changes_since_last_checkpoint: bool,
    /// Header carried by every state written until replaced
    pub header: Vec<u8>,
}

/// Builder for opening trees
pub struct TreeBuilder<L> {
    layout: L,
    page_size: usize,
    initial_file_size: u64,
    monitor: Arc<dyn Monitor>,
}

impl<L: Layout> TreeBuilder<L> {
    /// Create a builder for trees of `layout`
    pub fn new(layout: L) -> Self {
        Self {
            layout,
            page_size: page_size::get(),
            initial_file_size: DEFAULT_INITIAL_FILE_SIZE,
            monitor: Arc::new(NoMonitor),
        }
    }

    /// Set the page size, defaults to the OS page size
    ///
    /// An existing store must be opened with the page size it was created with.
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Set the size in bytes a new store file starts at
    pub fn initial_file_size(mut self, size: u64) -> Self {
        self.initial_file_size = size;
        self
    }

    /// Set the monitor receiving lifecycle events
    pub fn monitor(mut self, monitor: Arc<dyn Monitor>) -> Self {
        self.monitor = monitor;
        self
    }

    /// Open the store at `path`, creating it if it does not exist
    pub fn open(self, path: impl AsRef<Path>) -> Result<GbpTree<L>> {
        let backend = MmapBackend::with_options(path, self.page_size, self.initial_file_size)?;
        GbpTree::open_with(Box::new(backend), self.layout, self.monitor)
    }

    /// Create a tree living only in memory
    pub fn open_in_memory(self) -> Result<GbpTree<L>> {
        let backend = MemoryBackend::new(self.page_size);
        GbpTree::open_with(Box::new(backend), self.layout, self.monitor)
    }
}

/// A generation-aware B+tree in a page file
///
/// Any number of [`seek`](Self::seek)s run concurrently with each other, with
/// the single [`Writer`] and with [`checkpoint`](Self::checkpoint)s.
/// Changes become durable at the next checkpoint; after a crash the tree
/// opens as of the last completed one.
pub struct GbpTree<L: Layout> {
    cache: PageCache,
    node: TreeNode<L>,
    /// Packed [`GenerationPair`]
    generation: AtomicU64,
    root: AtomicCell<Root>,
    writer_taken: AtomicBool,
    /// Held by the writer and by checkpoints
    writer_lock: Mutex<WriterState>,
    monitor: Arc<dyn Monitor>,
    clean_on_open: bool,
}

impl<L: Layout> GbpTree<L> {
    /// Open the store at `path` with `layout`, creating it if needed
    pub fn open_or_create(path: impl AsRef<Path>, layout: L, page_size: usize) -> Result<Self> {
        TreeBuilder::new(layout).page_size(page_size).open(path)
    }

    fn open_with(backend: Box<dyn IoBackend>, layout: L, monitor: Arc<dyn Monitor>) -> Result<Self> {
        let cache = PageCache::new(backend)?;
        let page_size = cache.page_size();
        let node = TreeNode::new(page_size, layout)?;

        if cache.was_created() {
            Self::create(cache, node, monitor)
        } else {
            Self::load(cache, node, monitor)
        }
    }

    fn create(cache: PageCache, node: TreeNode<L>, monitor: Arc<dyn Monitor>) -> Result<Self> {
        monitor.no_store_file();
        let page_size = cache.page_size();
        {
            let mut cursor = cache.io(META_PAGE_ID, PinIntent::Write)?;
            Meta::from_layout(node.layout(), page_size).write(&mut cursor, node.layout())?;
        }

        let generation = GenerationPair::initial();
        let root = Root { id: PageId(MIN_TREE_NODE_ID), generation: generation.unstable };
        {
            let mut cursor = cache.io(root.id, PinIntent::Write)?;
            node.initialize_leaf(&mut cursor, generation)?;
        }
        let mut free_list = FreeList::new(page_size, MIN_TREE_NODE_ID);
        free_list.initialize_after_creation(&cache)?;

        let tree = Self::assemble(cache, node, generation, root, free_list, Vec::new(), monitor, true);
        tree.checkpoint()?;
        info!(page_size, "created tree");
        Ok(tree)
    }

    fn load(cache: PageCache, node: TreeNode<L>, monitor: Arc<dyn Monitor>) -> Result<Self> {
        let page_size = cache.page_size();
        {
            let mut cursor = cache.io(META_PAGE_ID, PinIntent::Read)?;
            let meta = Meta::read(&mut cursor)?;
            meta.verify(node.layout(), page_size)?;
            node.layout().read_meta_data(&mut cursor)?;
            cursor.check_out_of_bounds()?;
        }

        let states = read_state_pages(&cache)?;
        let state = select_newest_valid_state(&states)?;
        let header = {
            let mut cursor = cache.io(state.page_id, PinIntent::Read)?;
            meta::read_header(&mut cursor)?
        };
        // Anything written after the loaded state belongs to a lost generation
        let generation = state.generation().bumped();
        let root = Root { id: PageId(state.root_id), generation: state.root_generation };
        let mut free_list = FreeList::new(page_size, state.last_id);
        free_list.initialize(
            state.last_id,
            state.free_list_write_page_id,
            state.free_list_read_page_id,
            state.free_list_write_pos,
            state.free_list_read_pos,
        );

        let tree = Self::assemble(cache, node, generation, root, free_list, header, monitor, state.clean);
        tree.monitor.startup_state(state.clean);
        {
            let writer = tree.writer_lock.lock();
            if !state.clean {
                warn!(generation = %generation, "tree was not shut down cleanly");
                let cleaned = clean_crash_pointers(&tree.cache, &tree.node, generation, writer.free_list.last_id())?;
                tree.monitor.cleanup_finished(cleaned);
            }
            // Record the bumped generation so a crash from here on is detected
            tree.write_state(generation, &writer, false)?;
            tree.cache.flush_and_force()?;
        }
        info!(generation = %generation, root = root.id.0, clean = state.clean, "opened tree");
        Ok(tree)
    }

    fn assemble(
        cache: PageCache,
        node: TreeNode<L>,
        generation: GenerationPair,
        root: Root,
        free_list: FreeList,
        header: Vec<u8>,
        monitor: Arc<dyn Monitor>,
        clean_on_open: bool,
    ) -> Self {
        Self {
            cache,
            node,
            generation: AtomicU64::new(generation.pack()),
            root: AtomicCell::new(root),
            writer_taken: AtomicBool::new(false),
            writer_lock: Mutex::new(WriterState { free_list, changes_since_last_checkpoint: false, header }),
            monitor,
            clean_on_open,
        }
    }

    /// Seek the entries of a key range
    ///
    /// Returns keys in `[from, to)` in ascending order when `from <= to`,
    /// otherwise keys in `(to, from]` in descending order.
    pub fn seek(&self, from: L::Key, to: L::Key) -> Result<SeekCursor<'_, L>> {
        SeekCursor::new(&self.cache, &self.node, &self.generation, &self.root, from, to, false)
    }

    /// Look up the value of `key`
    pub fn get(&self, key: &L::Key) -> Result<Option<L::Value>> {
        let mut seek = SeekCursor::new(&self.cache, &self.node, &self.generation, &self.root, key.clone(), key.clone(), true)?;
        if seek.next_hit()? {
            return Ok(Some(seek.value().clone()));
        }
        Ok(None)
    }

    /// Take the single writer
    ///
    /// Fails right away if another writer is active; waits if a checkpoint is
    /// running.
    pub fn writer(&self) -> Result<Writer<'_, L>> {
        if self.writer_taken.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return Err(Error::InvalidOperation("a writer is already active"));
        }
        let state = self.writer_lock.lock();
        Ok(Writer::new(self, state))
    }

    /// Make every change so far durable and start a new generation
    ///
    /// Waits for an active writer to close. The header stored by the previous
    /// checkpoint is kept.
    pub fn checkpoint(&self) -> Result<()> {
        self.do_checkpoint(None)
    }

    /// Checkpoint, storing `header` with the new state
    ///
    /// The header is opaque to the tree and can be read back with
    /// [`read_header`] without opening the tree. It must fit in a state page
    /// next to the state itself.
    pub fn checkpoint_with_header(&self, header: &[u8]) -> Result<()> {
        if header.len() > max_header_size(self.cache.page_size()) {
            return Err(Error::InvalidParameter("header does not fit in a state page"));
        }
        self.do_checkpoint(Some(header))
    }

    fn do_checkpoint(&self, header: Option<&[u8]>) -> Result<()> {
        // Most dirty pages are written before blocking the writer
        self.cache.flush_and_force()?;

        let mut writer = self.writer_lock.lock();
        self.cache.flush_and_force()?;
        if let Some(header) = header {
            writer.header = header.to_vec();
        }
        let generation = self.generation_pair().checkpointed();
        self.write_state(generation, &writer, false)?;
        self.cache.flush_and_force()?;

        self.generation.store(generation.pack(), Ordering::Release);
        writer.changes_since_last_checkpoint = false;
        drop(writer);

        self.monitor.checkpoint_completed();
        info!(generation = %generation, "checkpoint completed");
        Ok(())
    }

    /// Get ready to replay changes lost since the last checkpoint
    ///
    /// Moves to a new unstable generation so everything written in the lost
    /// one reads as crashed, removes those crashed pointers and persists the
    /// new state. Must be called before any change is made.
    pub fn prepare_for_recovery(&self) -> Result<()> {
        if self.writer_taken.load(Ordering::Acquire) {
            return Err(Error::InvalidOperation("cannot prepare for recovery while a writer is active"));
        }
        let writer = self.writer_lock.lock();
        if writer.changes_since_last_checkpoint {
            return Err(Error::InvalidOperation("cannot prepare for recovery after changes were made"));
        }

        let generation = self.generation_pair().bumped();
        self.generation.store(generation.pack(), Ordering::Release);
        let cleaned = clean_crash_pointers(&self.cache, &self.node, generation, writer.free_list.last_id())?;
        self.monitor.cleanup_finished(cleaned);
        self.write_state(generation, &writer, false)?;
        self.cache.flush_and_force()?;
        info!(generation = %generation, cleaned, "prepared for recovery");
        Ok(())
    }

    /// Verify the structure of the tree and the accounting of its pages
    pub fn consistency_check(&self) -> Result<ConsistencyReport> {
        if self.writer_taken.load(Ordering::Acquire) {
            return Err(Error::InvalidOperation("cannot check consistency while a writer is active"));
        }
        let writer = self.writer_lock.lock();
        check_consistency(&self.cache, &self.node, self.generation_pair(), self.root(), &writer.free_list)
    }

    /// Estimate the number of entries in the tree
    ///
    /// Samples paths from the root spread evenly over the key order and
    /// multiplies the average fan-out seen at each level with the average
    /// leaf fill. Runs alongside the writer, in which case the result is as
    /// rough as the tree is busy.
    pub fn estimate_number_of_entries(&self) -> Result<u64> {
        let mut cursor = self.cache.cursor(PinIntent::Read);
        for _ in 0..ESTIMATE_ATTEMPTS {
            let generation = self.generation_pair();
            let root = self.root();
            // Entries summed per level over all samples
            let mut levels: Vec<u64> = Vec::new();
            let mut consistent = true;
            for sample in 0..ESTIMATE_SAMPLES {
                let position = (sample as f64 + 0.5) / ESTIMATE_SAMPLES as f64;
                match self.sample_path(&mut cursor, root.id, generation, position)? {
                    Some(path) if levels.is_empty() => levels = path,
                    Some(path) if path.len() == levels.len() => {
                        levels.iter_mut().zip(path).for_each(|(sum, entries)| *sum += entries);
                    }
                    _ => {
                        consistent = false;
                        break;
                    }
                }
            }
            if consistent {
                let estimate = levels
                    .iter()
                    .map(|&sum| sum as f64 / ESTIMATE_SAMPLES as f64)
                    .product::<f64>();
                return Ok(estimate.round() as u64);
            }
            debug!("tree changed shape while sampling, sampling again");
        }
        Err(Error::Corruption { details: "sampled paths keep ending at different depths".to_string(), page_id: None })
    }

    /// Entries seen at each level on the way to the leaf at `position`
    ///
    /// `position` in `[0, 1)` picks the child at that fraction of each node,
    /// carrying the remainder down. Returns `None` if the path ran into a
    /// page that is no longer part of the tree.
    fn sample_path(
        &self,
        cursor: &mut PageCursor<'_>,
        root: PageId,
        generation: GenerationPair,
        mut position: f64,
    ) -> Result<Option<Vec<u64>>> {
        let mut path = Vec::new();
        cursor.next_page(root)?;
        loop {
            let (node_type, leaf, key_count, child) = loop {
                let node_type = TreeNode::<L>::node_type(cursor);
                let leaf = TreeNode::<L>::is_leaf(cursor);
                let key_count = TreeNode::<L>::key_count(cursor);
                let mut child = None;
                if !leaf && self.node.reasonable_key_count(key_count) {
                    let pos = ((position * (key_count + 1) as f64) as usize).min(key_count);
                    child = Some((pos, self.node.child_at(cursor, pos, generation)));
                }
                if !cursor.should_retry() {
                    break (node_type, leaf, key_count, child);
                }
            };
            cursor.check_out_of_bounds()?;
            if node_type != NODE_TYPE_TREE_NODE || !self.node.reasonable_key_count(key_count) {
                return Ok(None);
            }
            if leaf {
                path.push(key_count as u64);
                return Ok(Some(path));
            }
            path.push(key_count as u64 + 1);
            let Some((pos, child)) = child else {
                return Ok(None);
            };
            if !child.is_node() {
                return Ok(None);
            }
            position = position * (key_count + 1) as f64 - pos as f64;
            cursor.next_page(PageId(child.pointer()))?;
        }
    }

    /// Whether the store was shut down cleanly before this open
    pub fn was_clean_on_open(&self) -> bool {
        self.clean_on_open
    }

    /// Flush and close the tree
    ///
    /// No checkpoint is made. When nothing changed since the last one the
    /// store is marked clean. Dropping a tree without closing it leaves the
    /// store as after a crash.
    pub fn close(self) -> Result<()> {
        let writer = self.writer_lock.lock();
        let clean = !writer.changes_since_last_checkpoint;
        if clean {
            self.write_state(self.generation_pair(), &writer, true)?;
        }
        self.cache.flush_and_force()?;
        drop(writer);
        info!(clean, "closed tree");
        Ok(())
    }

    /// Write a state and the current header into the older state page
    fn write_state(&self, generation: GenerationPair, writer: &WriterState, clean: bool) -> Result<()> {
        let free_list = &writer.free_list;
        let states = read_state_pages(&self.cache)?;
        let oldest = select_oldest_or_invalid(&states);
        let root = self.root();
        let state = TreeState {
            page_id: oldest.page_id,
            stable_generation: generation.stable,
            unstable_generation: generation.unstable,
            root_id: root.id.0,
            root_generation: root.generation,
            last_id: free_list.last_id(),
            free_list_write_page_id: free_list.write_page_id(),
            free_list_read_page_id: free_list.read_page_id(),
            free_list_write_pos: free_list.write_pos(),
            free_list_read_pos: free_list.read_pos(),
            clean,
            valid: true,
        };
        let mut cursor = self.cache.io(oldest.page_id, PinIntent::Write)?;
        state.write(&mut cursor)?;
        meta::write_header(&mut cursor, &writer.header)?;
        debug!(page = oldest.page_id.0, generation = %generation, clean, "wrote tree state");
        Ok(())
    }

    pub(crate) fn generation_pair(&self) -> GenerationPair {
        GenerationPair::unpack(self.generation.load(Ordering::Acquire))
    }

    pub(crate) fn root(&self) -> Root {
        self.root.load()
    }

    pub(crate) fn set_root(&self, root: Root) {
        self.root.store(root);
    }

    pub(crate) fn cache(&self) -> &PageCache {
        &self.cache
    }

    pub(crate) fn node(&self) -> &TreeNode<L> {
        &self.node
    }

    pub(crate) fn monitor(&self) -> &dyn Monitor {
        self.monitor.as_ref()
    }

    /// Give the writer slot back, failing if it was not taken
    pub(crate) fn release_writer(&self) -> Result<()> {
        self.writer_taken
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| Error::InvalidOperation("writer was not taken"))
    }
}

/// Read the header stored by the newest checkpoint of the store at `path`
///
/// The tree is not opened, so neither its layout nor its page size need to
/// be known. The store must not be open for writing elsewhere, or the header
/// read may be one checkpoint old.
pub fn read_header(path: impl AsRef<Path>) -> Result<Vec<u8>> {
    let path = path.as_ref();
    let mut prefix = [0u8; 8];
    File::open(path)?.read_exact(&mut prefix)?;
    let format_version = BigEndian::read_u32(&prefix[..4]);
    if format_version != FORMAT_VERSION {
        return Err(Error::VersionMismatch { expected: FORMAT_VERSION, found: format_version });
    }
    let page_size = BigEndian::read_u32(&prefix[4..]) as usize;
    if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) {
        return Err(Error::MetadataMismatch(format!("store claims page size {}", page_size).into()));
    }

    let cache = PageCache::new(Box::new(MmapBackend::with_options(path, page_size, 0)?))?;
    let states = read_state_pages(&cache)?;
    let state = select_newest_valid_state(&states)?;
    let mut cursor = cache.io(state.page_id, PinIntent::Read)?;
    meta::read_header(&mut cursor)
}
