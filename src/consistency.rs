//! Structural verification of a tree
//!
//! The checker walks the tree depth first from the root, left to right, and
//! collects every [`Inconsistency`] it finds instead of stopping at the first.
//! It also accounts for page ids: each id from the first tree node page up
//! to the last handed out id must be used exactly once, by a tree node, a
//! free-list page or a free-list entry.

use crate::error::{Error, PageId, Result};
use crate::freelist::{FreeList, FreeListVisitor};
use crate::generation::GenerationPair;
use crate::gspp::{self, read_slots, GsppResult, PointerField, SlotState, NO_NODE};
use crate::layout::Layout;
use crate::meta::MIN_TREE_NODE_ID;
use crate::node::{NodeKind, TreeNode, BYTE_POS_LEFT_SIBLING, BYTE_POS_NEW_GEN, BYTE_POS_RIGHT_SIBLING, NODE_TYPE_TREE_NODE};
use crate::page_cache::{PageCache, PageCursor, PinIntent};
use crate::tree::Root;
use std::cmp::Ordering;
use std::fmt;
use tracing::debug;

/// One problem found by a consistency check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inconsistency {
    /// A page reachable as a tree node is something else
    NotATreeNode {
        /// Offending page
        page_id: PageId,
        /// Node type byte found
        node_type: u8,
    },
    /// Neither a leaf nor an internal node
    UnknownTreeNodeType {
        /// Offending page
        page_id: PageId,
        /// Kind byte found
        kind: u8,
    },
    /// More keys than the node can hold
    UnreasonableKeyCount {
        /// Offending page
        page_id: PageId,
        /// Key count found
        key_count: usize,
    },
    /// Keys not strictly increasing
    KeysOutOfOrder {
        /// Offending page
        page_id: PageId,
    },
    /// A key outside the range its ancestors allow
    KeyOutsideRange {
        /// Offending page
        page_id: PageId,
        /// Position of the key
        pos: usize,
    },
    /// A pointer pair with a slot written in a lost generation or not checksumming
    CrashOrBrokenPointer {
        /// Node holding the pointer
        page_id: PageId,
        /// Which pointer
        field: PointerField,
        /// State of slot A
        state_a: SlotState,
        /// State of slot B
        state_b: SlotState,
    },
    /// A pointer pair no slot can be read from
    UnreadablePointer {
        /// Node holding the pointer
        page_id: PageId,
        /// Which pointer
        field: PointerField,
        /// Outcome of the read
        result: GsppResult,
    },
    /// A live node points to a successor
    PointerToOldVersionOfTreeNode {
        /// Node that has been replaced
        page_id: PageId,
        /// Its successor
        successor: u64,
    },
    /// A pointer older than the node it points to
    PointerGenerationLowerThanNode {
        /// Node holding the pointer
        page_id: PageId,
        /// Which pointer
        field: PointerField,
        /// Generation of the pointer
        pointer_generation: u64,
        /// Node pointed to
        target: u64,
        /// Generation of that node
        target_generation: u64,
    },
    /// Neighbours on a level disagree about being siblings
    SiblingsDontPointToEachOther {
        /// Left node, as visited
        left: u64,
        /// Right sibling of the left node
        left_right_sibling: u64,
        /// Right node, as visited
        right: u64,
        /// Left sibling of the right node
        right_left_sibling: u64,
        /// Depth of the level, 0 at the root
        level: usize,
    },
    /// The last node of a level has a right sibling
    RightmostNodeHasRightSibling {
        /// Rightmost node visited on the level
        page_id: PageId,
        /// Its right sibling
        right_sibling: u64,
        /// Depth of the level
        level: usize,
    },
    /// A child is also one of its ancestors
    ChildFoundAmongParentNodes {
        /// Offending page
        page_id: PageId,
        /// Depth it was found at
        level: usize,
    },
    /// A page id referenced more than once
    PageIdSeenMultipleTimes {
        /// Offending id
        page_id: PageId,
    },
    /// A page id beyond the last one handed out
    PageIdExceedLastId {
        /// Offending id
        page_id: PageId,
        /// Last handed out id
        last_id: u64,
    },
    /// A page id that is neither in the tree nor in the free-list
    UnusedPage {
        /// Lost id
        page_id: PageId,
    },
}

impl Inconsistency {
    /// Page the problem was found on
    pub fn page_id(&self) -> PageId {
        match *self {
            Inconsistency::NotATreeNode { page_id, .. }
            | Inconsistency::UnknownTreeNodeType { page_id, .. }
            | Inconsistency::UnreasonableKeyCount { page_id, .. }
            | Inconsistency::KeysOutOfOrder { page_id }
            | Inconsistency::KeyOutsideRange { page_id, .. }
            | Inconsistency::CrashOrBrokenPointer { page_id, .. }
            | Inconsistency::UnreadablePointer { page_id, .. }
            | Inconsistency::PointerToOldVersionOfTreeNode { page_id, .. }
            | Inconsistency::PointerGenerationLowerThanNode { page_id, .. }
            | Inconsistency::RightmostNodeHasRightSibling { page_id, .. }
            | Inconsistency::ChildFoundAmongParentNodes { page_id, .. }
            | Inconsistency::PageIdSeenMultipleTimes { page_id }
            | Inconsistency::PageIdExceedLastId { page_id, .. }
            | Inconsistency::UnusedPage { page_id } => page_id,
            Inconsistency::SiblingsDontPointToEachOther { right, .. } => PageId(right),
        }
    }
}

impl fmt::Display for Inconsistency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Inconsistency::NotATreeNode { page_id, node_type } => {
                write!(f, "page {} is not a tree node, node type {}", page_id, node_type)
            }
            Inconsistency::UnknownTreeNodeType { page_id, kind } => {
                write!(f, "page {} has unknown tree node type {}", page_id, kind)
            }
            Inconsistency::UnreasonableKeyCount { page_id, key_count } => {
                write!(f, "page {} has unreasonable key count {}", page_id, key_count)
            }
            Inconsistency::KeysOutOfOrder { page_id } => write!(f, "keys out of order in page {}", page_id),
            Inconsistency::KeyOutsideRange { page_id, pos } => {
                write!(f, "key at position {} of page {} is outside the range of the node", pos, page_id)
            }
            Inconsistency::CrashOrBrokenPointer { page_id, field, state_a, state_b } => write!(
                f,
                "{} of page {} has a crashed or broken slot, A={:?} B={:?}",
                field, page_id, state_a, state_b
            ),
            Inconsistency::UnreadablePointer { page_id, field, result } => {
                write!(f, "{} of page {} cannot be read ({})", field, page_id, result)
            }
            Inconsistency::PointerToOldVersionOfTreeNode { page_id, successor } => {
                write!(f, "page {} in the tree has successor {}", page_id, successor)
            }
            Inconsistency::PointerGenerationLowerThanNode {
                page_id,
                field,
                pointer_generation,
                target,
                target_generation,
            } => write!(
                f,
                "{} of page {} has generation {} but points to page {} of generation {}",
                field, page_id, pointer_generation, target, target_generation
            ),
            Inconsistency::SiblingsDontPointToEachOther { left, left_right_sibling, right, right_left_sibling, level } => {
                write!(
                    f,
                    "siblings on level {} disagree: {} has right sibling {}, {} has left sibling {}",
                    level, left, left_right_sibling, right, right_left_sibling
                )
            }
            Inconsistency::RightmostNodeHasRightSibling { page_id, right_sibling, level } => write!(
                f,
                "rightmost page {} on level {} has right sibling {}",
                page_id, level, right_sibling
            ),
            Inconsistency::ChildFoundAmongParentNodes { page_id, level } => {
                write!(f, "page {} at level {} is also one of its ancestors", page_id, level)
            }
            Inconsistency::PageIdSeenMultipleTimes { page_id } => write!(f, "page id {} seen multiple times", page_id),
            Inconsistency::PageIdExceedLastId { page_id, last_id } => {
                write!(f, "page id {} exceeds last id {}", page_id, last_id)
            }
            Inconsistency::UnusedPage { page_id } => {
                write!(f, "page {} is neither in the tree nor in the free-list", page_id)
            }
        }
    }
}

/// Outcome of a consistency check
#[derive(Debug, Clone, Default)]
pub struct ConsistencyReport {
    inconsistencies: Vec<Inconsistency>,
}

impl ConsistencyReport {
    /// Whether nothing was found
    pub fn is_consistent(&self) -> bool {
        self.inconsistencies.is_empty()
    }

    /// Everything found, in discovery order
    pub fn inconsistencies(&self) -> &[Inconsistency] {
        &self.inconsistencies
    }

    /// Fail with the first inconsistency, if any
    pub fn into_result(self) -> Result<()> {
        match self.inconsistencies.into_iter().next() {
            None => Ok(()),
            Some(first) => Err(Error::corruption(first.to_string(), first.page_id())),
        }
    }
}

/// Which ids have been referenced so far
struct SeenIds {
    seen: Vec<bool>,
    last_id: u64,
    found: Vec<Inconsistency>,
}

impl SeenIds {
    fn new(last_id: u64) -> Self {
        Self { seen: vec![false; last_id as usize + 1], last_id, found: Vec::new() }
    }

    fn add(&mut self, id: u64) {
        if id > self.last_id {
            self.found.push(Inconsistency::PageIdExceedLastId { page_id: PageId(id), last_id: self.last_id });
            return;
        }
        let seen = &mut self.seen[id as usize];
        if *seen {
            self.found.push(Inconsistency::PageIdSeenMultipleTimes { page_id: PageId(id) });
        }
        *seen = true;
    }

    fn report_unused(&mut self) {
        for id in MIN_TREE_NODE_ID..=self.last_id {
            if !self.seen[id as usize] {
                self.found.push(Inconsistency::UnusedPage { page_id: PageId(id) });
            }
        }
    }
}

impl FreeListVisitor for SeenIds {
    fn begin_free_list_page(&mut self, page_id: u64) {
        self.add(page_id);
    }

    fn free_list_entry(&mut self, page_id: u64, _generation: u64, _pos: usize) {
        self.add(page_id);
    }
}

/// The last node visited on one level
#[derive(Default)]
struct RightmostInChain {
    node: u64,
    generation: u64,
    right_sibling: u64,
    right_sibling_generation: u64,
}

/// Sibling pointers of a node, `None` where the read failed
struct Siblings {
    left: Option<(u64, u64)>,
    right: Option<(u64, u64)>,
}

/// Key range a node must keep its keys in, lower inclusive and upper exclusive
struct KeyRange<K> {
    lower: Option<K>,
    upper: Option<K>,
}

struct Checker<'a, L: Layout> {
    node: &'a TreeNode<L>,
    generation: GenerationPair,
    seen: SeenIds,
    rightmost: Vec<RightmostInChain>,
    path: Vec<u64>,
    found: Vec<Inconsistency>,
}

/// Verify the tree under `root` and the page ids accounted for by `free_list`
pub(crate) fn check_consistency<L: Layout>(
    cache: &PageCache,
    node: &TreeNode<L>,
    generation: GenerationPair,
    root: Root,
    free_list: &FreeList,
) -> Result<ConsistencyReport> {
    let mut checker = Checker {
        node,
        generation,
        seen: SeenIds::new(free_list.last_id()),
        rightmost: Vec::new(),
        path: Vec::new(),
        found: Vec::new(),
    };

    let mut cursor = cache.io(root.id, PinIntent::Read)?;
    let range = KeyRange { lower: None, upper: None };
    checker.check_subtree(&mut cursor, &range, None, root.generation, 0)?;
    drop(cursor);
    checker.assert_last_in_chains();

    free_list.visit(cache, &mut checker.seen)?;
    checker.seen.report_unused();

    let mut inconsistencies = checker.found;
    inconsistencies.append(&mut checker.seen.found);
    debug!(found = inconsistencies.len(), "consistency check finished");
    Ok(ConsistencyReport { inconsistencies })
}

impl<L: Layout> Checker<'_, L> {
    fn check_subtree(
        &mut self,
        cursor: &mut PageCursor<'_>,
        range: &KeyRange<L::Key>,
        parent: Option<(u64, PointerField)>,
        pointer_generation: u64,
        level: usize,
    ) -> Result<()> {
        let page_id = cursor.current_page_id();
        self.seen.add(page_id.0);
        if self.path.contains(&page_id.0) {
            self.found.push(Inconsistency::ChildFoundAmongParentNodes { page_id, level });
            return Ok(());
        }

        let generation = self.generation;
        let (node_type, kind, key_count, node_generation, successor, siblings) = loop {
            let node_type = TreeNode::<L>::node_type(cursor);
            let kind = TreeNode::<L>::kind_byte(cursor);
            let key_count = TreeNode::<L>::key_count(cursor);
            let node_generation = TreeNode::<L>::generation(cursor);
            let successor = TreeNode::<L>::new_gen(cursor, generation);
            let left = TreeNode::<L>::left_sibling(cursor, generation);
            let right = TreeNode::<L>::right_sibling(cursor, generation);
            let siblings = Siblings {
                left: read_with_generation(cursor, BYTE_POS_LEFT_SIBLING, left),
                right: read_with_generation(cursor, BYTE_POS_RIGHT_SIBLING, right),
            };
            if !cursor.should_retry() {
                break (node_type, kind, key_count, node_generation, successor, siblings);
            }
        };
        cursor.check_out_of_bounds()?;

        if node_type != NODE_TYPE_TREE_NODE {
            self.found.push(Inconsistency::NotATreeNode { page_id, node_type });
            return Ok(());
        }
        let is_leaf = TreeNode::<L>::is_leaf(cursor);
        let is_internal = TreeNode::<L>::is_internal(cursor);
        if !is_leaf && !is_internal {
            self.found.push(Inconsistency::UnknownTreeNodeType { page_id, kind });
            return Ok(());
        }

        self.check_pair(cursor, BYTE_POS_LEFT_SIBLING, PointerField::LeftSibling)?;
        self.check_pair(cursor, BYTE_POS_RIGHT_SIBLING, PointerField::RightSibling)?;
        self.check_pair(cursor, BYTE_POS_NEW_GEN, PointerField::NewGen)?;

        let kind = if is_leaf { NodeKind::Leaf } else { NodeKind::Internal };
        let reasonable_key_count = key_count <= self.node.max_key_count(kind);
        if reasonable_key_count {
            self.check_key_order(cursor, range, key_count)?;
        } else {
            self.found.push(Inconsistency::UnreasonableKeyCount { page_id, key_count });
        }

        if let Some((parent, field)) = parent {
            if node_generation > pointer_generation {
                self.found.push(Inconsistency::PointerGenerationLowerThanNode {
                    page_id: PageId(parent),
                    field,
                    pointer_generation,
                    target: page_id.0,
                    target_generation: node_generation,
                });
            }
        }
        self.assert_next_in_chain(page_id, node_generation, &siblings, level);
        if successor.is_node() {
            self.found.push(Inconsistency::PointerToOldVersionOfTreeNode { page_id, successor: successor.pointer() });
        }

        if is_internal && reasonable_key_count {
            self.path.push(page_id.0);
            let visited = self.visit_children(cursor, range, key_count, level);
            self.path.pop();
            visited?;
        }
        Ok(())
    }

    fn visit_children(
        &mut self,
        cursor: &mut PageCursor<'_>,
        range: &KeyRange<L::Key>,
        key_count: usize,
        level: usize,
    ) -> Result<()> {
        let page_id = cursor.current_page_id();
        let node = self.node;
        let layout = node.layout();
        for pos in 0..=key_count {
            let field = PointerField::Child(pos);
            let offset = self.node.child_offset(pos);
            let mut lower = range.lower.clone();
            let mut upper = range.upper.clone();
            let (child, child_generation) = loop {
                let child = self.node.child_at(cursor, pos, self.generation);
                let child_generation = if child.is_success() {
                    gspp::pointer_generation(cursor, offset, child)
                } else {
                    0
                };
                if pos > 0 {
                    let mut key = layout.new_key();
                    self.node.key_at(cursor, &mut key, pos - 1);
                    lower = Some(key);
                }
                if pos < key_count {
                    let mut key = layout.new_key();
                    self.node.key_at(cursor, &mut key, pos);
                    upper = Some(key);
                }
                if !cursor.should_retry() {
                    break (child, child_generation);
                }
            };
            cursor.check_out_of_bounds()?;

            self.check_pair(cursor, offset, field)?;
            if !child.is_success() {
                self.found.push(Inconsistency::UnreadablePointer { page_id, field, result: child });
                continue;
            }
            if child.pointer() == NO_NODE {
                self.found.push(Inconsistency::NotATreeNode { page_id: PageId(NO_NODE), node_type: 0 });
                continue;
            }

            let child_range = KeyRange { lower, upper };
            cursor.next_page(PageId(child.pointer()))?;
            let checked = self.check_subtree(cursor, &child_range, Some((page_id.0, field)), child_generation, level + 1);
            cursor.next_page(page_id)?;
            checked?;
        }
        Ok(())
    }

    /// Report slots of the pair at `offset` written in a lost generation or not checksumming
    fn check_pair(&mut self, cursor: &mut PageCursor<'_>, offset: usize, field: PointerField) -> Result<()> {
        let (a, b) = loop {
            let slots = read_slots(cursor, offset);
            if !cursor.should_retry() {
                break slots;
            }
        };
        cursor.check_out_of_bounds()?;
        let state_a = SlotState::of(&a, self.generation);
        let state_b = SlotState::of(&b, self.generation);
        let bad = |state: SlotState| matches!(state, SlotState::Crash | SlotState::Broken);
        if bad(state_a) || bad(state_b) {
            self.found.push(Inconsistency::CrashOrBrokenPointer {
                page_id: cursor.current_page_id(),
                field,
                state_a,
                state_b,
            });
        }
        Ok(())
    }

    fn check_key_order(&mut self, cursor: &mut PageCursor<'_>, range: &KeyRange<L::Key>, key_count: usize) -> Result<()> {
        let node = self.node;
        let layout = node.layout();
        let mut keys = vec![layout.new_key(); key_count];
        loop {
            for (pos, key) in keys.iter_mut().enumerate() {
                self.node.key_at(cursor, key, pos);
            }
            if !cursor.should_retry() {
                break;
            }
        }
        cursor.check_out_of_bounds()?;

        let page_id = cursor.current_page_id();
        if keys.windows(2).any(|pair| layout.compare(&pair[0], &pair[1]) != Ordering::Less) {
            self.found.push(Inconsistency::KeysOutOfOrder { page_id });
        }
        for (pos, key) in keys.iter().enumerate() {
            let above_lower = range.lower.as_ref().map_or(true, |lower| layout.compare(key, lower) != Ordering::Less);
            let below_upper = range.upper.as_ref().map_or(true, |upper| layout.compare(key, upper) == Ordering::Less);
            if !above_lower || !below_upper {
                self.found.push(Inconsistency::KeyOutsideRange { page_id, pos });
            }
        }
        Ok(())
    }

    /// Check `page_id` against the node visited before it on the same level
    fn assert_next_in_chain(&mut self, page_id: PageId, node_generation: u64, siblings: &Siblings, level: usize) {
        while self.rightmost.len() <= level {
            self.rightmost.push(RightmostInChain::default());
        }
        let previous = &self.rightmost[level];
        let left = siblings.left.map_or(NO_NODE, |(id, _)| id);

        if siblings.left.is_some() && (previous.node != left || (previous.node != NO_NODE && previous.right_sibling != page_id.0)) {
            self.found.push(Inconsistency::SiblingsDontPointToEachOther {
                left: previous.node,
                left_right_sibling: previous.right_sibling,
                right: page_id.0,
                right_left_sibling: left,
                level,
            });
        }

        // Sibling pointers must not be older than the nodes they point to
        if let Some((_, left_generation)) = siblings.left {
            if previous.node != NO_NODE && previous.generation > left_generation {
                self.found.push(Inconsistency::PointerGenerationLowerThanNode {
                    page_id,
                    field: PointerField::LeftSibling,
                    pointer_generation: left_generation,
                    target: previous.node,
                    target_generation: previous.generation,
                });
            }
        }
        if previous.node != NO_NODE && previous.right_sibling == page_id.0 && node_generation > previous.right_sibling_generation {
            self.found.push(Inconsistency::PointerGenerationLowerThanNode {
                page_id: PageId(previous.node),
                field: PointerField::RightSibling,
                pointer_generation: previous.right_sibling_generation,
                target: page_id.0,
                target_generation: node_generation,
            });
        }

        let (right_sibling, right_sibling_generation) = siblings.right.unwrap_or((NO_NODE, 0));
        self.rightmost[level] = RightmostInChain {
            node: page_id.0,
            generation: node_generation,
            right_sibling,
            right_sibling_generation,
        };
    }

    fn assert_last_in_chains(&mut self) {
        for (level, last) in self.rightmost.iter().enumerate() {
            if last.node != NO_NODE && last.right_sibling != NO_NODE {
                self.found.push(Inconsistency::RightmostNodeHasRightSibling {
                    page_id: PageId(last.node),
                    right_sibling: last.right_sibling,
                    level,
                });
            }
        }
    }
}

fn read_with_generation(cursor: &mut PageCursor<'_>, offset: usize, result: GsppResult) -> Option<(u64, u64)> {
    if result.is_success() {
        Some((result.pointer(), gspp::pointer_generation(cursor, offset, result)))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemoryBackend;
    use crate::layout::LongLayout;

    const PAGE_SIZE: usize = 256;

    struct Fixture {
        cache: PageCache,
        node: TreeNode<LongLayout>,
        free_list: FreeList,
        generation: GenerationPair,
    }

    impl Fixture {
        /// Root leaf at 3 holding `keys`, free-list page at 4
        fn new(keys: &[u64]) -> Result<Self> {
            let cache = PageCache::new(Box::new(MemoryBackend::new(PAGE_SIZE)))?;
            let node = TreeNode::new(PAGE_SIZE, LongLayout::new())?;
            let generation = GenerationPair::new(1, 2);
            {
                let mut cursor = cache.io(PageId(3), PinIntent::Write)?;
                node.initialize_leaf(&mut cursor, generation)?;
                for (pos, key) in keys.iter().enumerate() {
                    node.insert_key_value_at(&mut cursor, key, key, pos, pos);
                }
                TreeNode::<LongLayout>::set_key_count(&mut cursor, keys.len());
            }
            let mut free_list = FreeList::new(PAGE_SIZE, 3);
            free_list.initialize_after_creation(&cache)?;
            Ok(Self { cache, node, free_list, generation })
        }

        fn check(&self) -> Result<ConsistencyReport> {
            let root = Root { id: PageId(3), generation: self.generation.unstable };
            check_consistency(&self.cache, &self.node, self.generation, root, &self.free_list)
        }
    }

    #[test]
    fn test_fresh_tree_is_consistent() -> Result<()> {
        let fixture = Fixture::new(&[1, 2, 3])?;
        let report = fixture.check()?;
        assert!(report.is_consistent(), "{:?}", report);
        report.into_result()
    }

    #[test]
    fn test_keys_out_of_order() -> Result<()> {
        let fixture = Fixture::new(&[1, 5, 3])?;
        let report = fixture.check()?;
        assert_eq!(report.inconsistencies(), &[Inconsistency::KeysOutOfOrder { page_id: PageId(3) }]);
        assert!(report.into_result().is_err_and(|e| e.is_corruption()));
        Ok(())
    }

    #[test]
    fn test_unused_page_is_reported() -> Result<()> {
        let mut fixture = Fixture::new(&[])?;
        fixture.free_list.acquire_new_id(&fixture.cache, fixture.generation)?;
        let report = fixture.check()?;
        assert_eq!(report.inconsistencies(), &[Inconsistency::UnusedPage { page_id: PageId(5) }]);
        Ok(())
    }

    #[test]
    fn test_released_page_is_accounted_for() -> Result<()> {
        let mut fixture = Fixture::new(&[])?;
        let id = fixture.free_list.acquire_new_id(&fixture.cache, fixture.generation)?;
        fixture.free_list.release_id(&fixture.cache, fixture.generation, id.0)?;
        assert!(fixture.check()?.is_consistent());
        Ok(())
    }

    #[test]
    fn test_crash_pointer_is_reported() -> Result<()> {
        let mut fixture = Fixture::new(&[7])?;
        {
            let mut cursor = fixture.cache.io(PageId(3), PinIntent::Write)?;
            TreeNode::<LongLayout>::set_right_sibling(&mut cursor, NO_NODE, GenerationPair::new(2, 3))?;
        }
        fixture.generation = GenerationPair::new(2, 4);
        let report = fixture.check()?;
        assert!(report.inconsistencies().contains(&Inconsistency::CrashOrBrokenPointer {
            page_id: PageId(3),
            field: PointerField::RightSibling,
            state_a: SlotState::Stable,
            state_b: SlotState::Crash,
        }));
        Ok(())
    }

    #[test]
    fn test_live_successor_is_reported() -> Result<()> {
        let fixture = Fixture::new(&[])?;
        {
            let mut cursor = fixture.cache.io(PageId(3), PinIntent::Write)?;
            TreeNode::<LongLayout>::set_new_gen(&mut cursor, 4, fixture.generation)?;
        }
        let report = fixture.check()?;
        assert_eq!(
            report.inconsistencies(),
            &[Inconsistency::PointerToOldVersionOfTreeNode { page_id: PageId(3), successor: 4 }]
        );
        Ok(())
    }
}
