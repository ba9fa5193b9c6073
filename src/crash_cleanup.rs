//! Removal of pointers written in generations lost to a crash
//!
//! After an unclean shutdown the generation moves past the one that was in
//! progress, so every pointer slot written in it classifies as CRASH. Readers
//! already skip such slots. Zeroing them restores pairs the writer can write
//! again and that the consistency checker accepts.

use crate::error::{PageId, Result};
use crate::generation::GenerationPair;
use crate::gsp;
use crate::gspp::{read_slots, SlotState};
use crate::layout::Layout;
use crate::meta::MIN_TREE_NODE_ID;
use crate::node::{TreeNode, BYTE_POS_LEFT_SIBLING, BYTE_POS_NEW_GEN, BYTE_POS_RIGHT_SIBLING, NODE_TYPE_TREE_NODE};
use crate::page_cache::{PageCache, PageCursor, PinIntent};
use tracing::debug;

/// Zero every CRASH slot in the tree nodes among pages `[3, last_id]`
///
/// Returns the number of slots cleaned.
pub(crate) fn clean_crash_pointers<L: Layout>(
    cache: &PageCache,
    node: &TreeNode<L>,
    generation: GenerationPair,
    last_id: u64,
) -> Result<u64> {
    let mut cleaned = 0u64;
    let mut reader = cache.cursor(PinIntent::Read);
    let mut crashed = Vec::new();

    for id in MIN_TREE_NODE_ID..=last_id {
        let page_id = PageId(id);
        reader.next_page(page_id)?;
        loop {
            crashed.clear();
            find_crashed_slots(&mut reader, node, generation, &mut crashed);
            if !reader.should_retry() {
                break;
            }
        }
        reader.check_out_of_bounds()?;
        reader.unpin();
        if crashed.is_empty() {
            continue;
        }

        let mut writer = cache.io(page_id, PinIntent::Write)?;
        for &offset in &crashed {
            writer.set_offset(offset);
            gsp::clear(&mut writer);
        }
        writer.check_out_of_bounds()?;
        cleaned += crashed.len() as u64;
    }

    debug!(cleaned, last_id, "cleaned crash pointers");
    Ok(cleaned)
}

fn find_crashed_slots<L: Layout>(
    cursor: &mut PageCursor<'_>,
    node: &TreeNode<L>,
    generation: GenerationPair,
    crashed: &mut Vec<usize>,
) {
    if TreeNode::<L>::node_type(cursor) != NODE_TYPE_TREE_NODE {
        return;
    }
    for offset in [BYTE_POS_RIGHT_SIBLING, BYTE_POS_LEFT_SIBLING, BYTE_POS_NEW_GEN] {
        collect_pair(cursor, offset, generation, crashed);
    }
    if TreeNode::<L>::is_internal(cursor) {
        let key_count = TreeNode::<L>::key_count(cursor);
        if key_count <= node.internal_max_key_count() {
            for pos in 0..=key_count {
                collect_pair(cursor, node.child_offset(pos), generation, crashed);
            }
        }
    }
}

fn collect_pair(cursor: &mut PageCursor<'_>, offset: usize, generation: GenerationPair, crashed: &mut Vec<usize>) {
    let (a, b) = read_slots(cursor, offset);
    if SlotState::of(&a, generation) == SlotState::Crash {
        crashed.push(offset);
    }
    if SlotState::of(&b, generation) == SlotState::Crash {
        crashed.push(offset + gsp::SIZE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gspp::NO_NODE;
    use crate::io::MemoryBackend;
    use crate::layout::LongLayout;

    #[test]
    fn test_crashed_sibling_slot_is_zeroed() -> Result<()> {
        let cache = PageCache::new(Box::new(MemoryBackend::new(256)))?;
        let node = TreeNode::new(256, LongLayout::new())?;
        {
            let mut cursor = cache.io(PageId(3), PinIntent::Write)?;
            node.initialize_leaf(&mut cursor, GenerationPair::new(1, 2))?;
            // Written after a checkpoint, then lost
            TreeNode::<LongLayout>::set_right_sibling(&mut cursor, 7, GenerationPair::new(2, 3))?;
        }

        let recovered = GenerationPair::new(2, 4);
        assert_eq!(clean_crash_pointers(&cache, &node, recovered, 3)?, 1);
        assert_eq!(clean_crash_pointers(&cache, &node, recovered, 3)?, 0);

        let mut cursor = cache.io(PageId(3), PinIntent::Read)?;
        let sibling = TreeNode::<LongLayout>::right_sibling(&mut cursor, recovered);
        assert!(sibling.is_success());
        assert_eq!(sibling.pointer(), NO_NODE);
        Ok(())
    }

    #[test]
    fn test_child_pointers_are_cleaned() -> Result<()> {
        let cache = PageCache::new(Box::new(MemoryBackend::new(256)))?;
        let node = TreeNode::new(256, LongLayout::new())?;
        let stable = GenerationPair::new(1, 2);
        let lost = GenerationPair::new(2, 3);
        {
            let mut cursor = cache.io(PageId(3), PinIntent::Write)?;
            node.initialize_internal(&mut cursor, stable)?;
            node.set_child_at(&mut cursor, 4, 0, stable)?;
            node.insert_key_and_right_child_at(&mut cursor, &10, 5, 0, 0, stable)?;
            TreeNode::<LongLayout>::set_key_count(&mut cursor, 1);
            node.set_child_at(&mut cursor, 6, 1, lost)?;
        }
        // Pages 4 and 5 are not tree nodes and are skipped
        for id in 4..=5 {
            cache.io(PageId(id), PinIntent::Write)?.zap_page();
        }

        assert_eq!(clean_crash_pointers(&cache, &node, GenerationPair::new(2, 4), 5)?, 1);
        let mut cursor = cache.io(PageId(3), PinIntent::Read)?;
        assert_eq!(node.child_at(&mut cursor, 1, GenerationPair::new(2, 4)).pointer(), 5);
        Ok(())
    }
}
