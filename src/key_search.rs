//! Key search within a node

use crate::layout::Layout;
use crate::node::TreeNode;
use crate::page_cache::PageCursor;
use std::cmp::Ordering;

const HIT_FLAG: u32 = 0x8000_0000;
const NO_SUCCESS_FLAG: u32 = 0x4000_0000;
const POSITION_MASK: u32 = 0x3FFF_FFFF;

/// Packed outcome of a search: position, hit flag and success flag
///
/// The position is where the key is, or where it would be inserted. A search
/// reading a node that is being written concurrently may fail; it is retried
/// like any other read of that page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchResult(u32);

impl SearchResult {
    fn new(position: usize, hit: bool) -> Self {
        let mut bits = position as u32 & POSITION_MASK;
        if hit {
            bits |= HIT_FLAG;
        }
        SearchResult(bits)
    }

    fn no_success() -> Self {
        SearchResult(NO_SUCCESS_FLAG)
    }

    /// A successful result at position 0, used before any search ran
    pub fn initial() -> Self {
        Self::new(0, false)
    }

    /// Position of the key or of its insertion point
    pub fn position(self) -> usize {
        (self.0 & POSITION_MASK) as usize
    }

    /// Whether the key was found
    pub fn is_hit(self) -> bool {
        self.0 & HIT_FLAG != 0
    }

    /// Whether the search produced a usable position
    pub fn is_success(self) -> bool {
        self.0 & NO_SUCCESS_FLAG == 0
    }

    /// Child to descend into for the searched key
    ///
    /// Keys equal to a separator belong to the subtree right of it.
    pub fn child_position(self) -> usize {
        self.position() + self.is_hit() as usize
    }
}

/// Search the `key_count` keys of the node under `cursor` for `key`
///
/// `read_key` is scratch space; after a hit it holds the found key.
pub fn search<L: Layout>(
    cursor: &mut PageCursor<'_>,
    node: &TreeNode<L>,
    key: &L::Key,
    read_key: &mut L::Key,
    key_count: usize,
) -> SearchResult {
    if key_count == 0 {
        return SearchResult::new(0, false);
    }

    let layout = node.layout();
    let mut lower = 0;
    let mut higher = key_count - 1;

    // Greater than the greatest key
    node.key_at(cursor, read_key, higher);
    if layout.compare(key, read_key) == Ordering::Greater {
        return SearchResult::new(key_count, false);
    }

    // Smaller than or equal to the smallest key
    node.key_at(cursor, read_key, lower);
    match layout.compare(key, read_key) {
        Ordering::Less => return SearchResult::new(0, false),
        Ordering::Equal => return SearchResult::new(0, true),
        Ordering::Greater => {}
    }

    // Narrow down to the first key >= the searched one
    while lower < higher {
        let pos = (lower + higher) / 2;
        node.key_at(cursor, read_key, pos);
        if layout.compare(key, read_key) != Ordering::Greater {
            higher = pos;
        } else {
            lower = pos + 1;
        }
    }
    if lower != higher {
        return SearchResult::no_success();
    }

    node.key_at(cursor, read_key, lower);
    let hit = layout.compare(key, read_key) == Ordering::Equal;
    SearchResult::new(lower, hit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{PageId, Result};
    use crate::generation::GenerationPair;
    use crate::io::MemoryBackend;
    use crate::layout::LongLayout;
    use crate::page_cache::{PageCache, PinIntent};

    fn leaf_with(keys: &[u64]) -> Result<(PageCache, TreeNode<LongLayout>)> {
        let cache = PageCache::new(Box::new(MemoryBackend::new(1024)))?;
        let node = TreeNode::new(1024, LongLayout::new())?;
        {
            let mut cursor = cache.io(PageId(3), PinIntent::Write)?;
            node.initialize_leaf(&mut cursor, GenerationPair::new(1, 2))?;
            for (pos, key) in keys.iter().enumerate() {
                node.insert_key_value_at(&mut cursor, key, key, pos, pos);
            }
            TreeNode::<LongLayout>::set_key_count(&mut cursor, keys.len());
        }
        Ok((cache, node))
    }

    fn find(keys: &[u64], key: u64) -> Result<SearchResult> {
        let (cache, node) = leaf_with(keys)?;
        let mut cursor = cache.io(PageId(3), PinIntent::Read)?;
        let mut read_key = 0;
        Ok(search(&mut cursor, &node, &key, &mut read_key, keys.len()))
    }

    #[test]
    fn test_search_empty() -> Result<()> {
        let result = find(&[], 5)?;
        assert!(result.is_success());
        assert_eq!((result.position(), result.is_hit()), (0, false));
        Ok(())
    }

    #[test]
    fn test_search_hits_and_misses() -> Result<()> {
        let keys = [10, 20, 30, 40, 50, 60, 70];
        for (pos, &key) in keys.iter().enumerate() {
            let hit = find(&keys, key)?;
            assert!(hit.is_hit(), "key {}", key);
            assert_eq!(hit.position(), pos);
            assert_eq!(hit.child_position(), pos + 1);

            let miss = find(&keys, key - 5)?;
            assert!(!miss.is_hit());
            assert_eq!(miss.position(), pos);
            assert_eq!(miss.child_position(), pos);
        }
        let past = find(&keys, 100)?;
        assert_eq!((past.position(), past.is_hit()), (keys.len(), false));
        Ok(())
    }

    #[test]
    fn test_search_leaves_found_key() -> Result<()> {
        let (cache, node) = leaf_with(&[3, 6, 9])?;
        let mut cursor = cache.io(PageId(3), PinIntent::Read)?;
        let mut read_key = 0;
        let result = search(&mut cursor, &node, &6, &mut read_key, 3);
        assert!(result.is_hit());
        assert_eq!(read_key, 6);
        Ok(())
    }

    #[test]
    fn test_result_packing() {
        let result = SearchResult::new(12345, true);
        assert!(result.is_success());
        assert_eq!(result.position(), 12345);
        assert!(!SearchResult::no_success().is_success());
        assert!(SearchResult::initial().is_success());
    }
}
