//! Basic operations on a file-backed tree

use gbptree::{Error, GbpTree, KeepExisting, LongLayout, Result, TreeBuilder};
use tempfile::TempDir;

const PAGE_SIZE: usize = 512;

#[test]
fn test_create_put_get() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let tree = GbpTree::open_or_create(dir.path().join("basic.db"), LongLayout::new(), PAGE_SIZE)?;
    assert!(tree.was_clean_on_open());
    assert_eq!(tree.get(&0)?, None);

    let mut writer = tree.writer()?;
    for key in 0..100u64 {
        writer.put(&key, &(key * 2))?;
    }
    writer.close()?;

    for key in 0..100u64 {
        assert_eq!(tree.get(&key)?, Some(key * 2));
    }
    assert_eq!(tree.get(&100)?, None);
    tree.close()
}

#[test]
fn test_seek_ranges() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let tree = GbpTree::open_or_create(dir.path().join("seek.db"), LongLayout::new(), PAGE_SIZE)?;
    let mut writer = tree.writer()?;
    for key in (0..200u64).step_by(2) {
        writer.put(&key, &key)?;
    }
    writer.close()?;

    let forward: Vec<u64> = tree.seek(10, 20)?.map(|hit| hit.map(|(k, _)| k)).collect::<Result<_>>()?;
    assert_eq!(forward, vec![10, 12, 14, 16, 18]);

    // From is inclusive, to exclusive, in both directions
    let backward: Vec<u64> = tree.seek(20, 10)?.map(|hit| hit.map(|(k, _)| k)).collect::<Result<_>>()?;
    assert_eq!(backward, vec![20, 18, 16, 14, 12]);

    let odd_bounds: Vec<u64> = tree.seek(11, 17)?.map(|hit| hit.map(|(k, _)| k)).collect::<Result<_>>()?;
    assert_eq!(odd_bounds, vec![12, 14, 16]);

    assert_eq!(tree.seek(10, 10)?.count(), 0);
    assert_eq!(tree.seek(1000, 2000)?.count(), 0);
    tree.close()
}

#[test]
fn test_next_hit_api() -> Result<()> {
    let tree = TreeBuilder::new(LongLayout::new()).page_size(PAGE_SIZE).open_in_memory()?;
    let mut writer = tree.writer()?;
    writer.put(&7, &70)?;
    writer.put(&8, &80)?;
    writer.close()?;

    let mut seek = tree.seek(0, 100)?;
    assert!(seek.next_hit()?);
    assert_eq!((*seek.key(), *seek.value()), (7, 70));
    assert!(seek.next_hit()?);
    assert_eq!((*seek.key(), *seek.value()), (8, 80));
    assert!(!seek.next_hit()?);
    // Stays exhausted
    assert!(!seek.next_hit()?);
    Ok(())
}

#[test]
fn test_remove_and_merge() -> Result<()> {
    let tree = TreeBuilder::new(LongLayout::new()).page_size(PAGE_SIZE).open_in_memory()?;
    let mut writer = tree.writer()?;
    for key in 0..50u64 {
        writer.put(&key, &key)?;
    }
    for key in (0..50u64).filter(|k| k % 3 == 0) {
        assert_eq!(writer.remove(&key)?, Some(key));
    }
    writer.merge(&1, &999, &KeepExisting)?;
    writer.merge(&3, &999, &KeepExisting)?;
    writer.close()?;

    assert_eq!(tree.get(&1)?, Some(1));
    assert_eq!(tree.get(&3)?, Some(999));
    assert_eq!(tree.get(&6)?, None);
    assert_eq!(tree.seek(0, 50)?.count(), 50 - 17 + 1);
    Ok(())
}

#[test]
fn test_reopen_after_close() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("reopen.db");
    {
        let tree = GbpTree::open_or_create(&path, LongLayout::new(), PAGE_SIZE)?;
        let mut writer = tree.writer()?;
        for key in 0..500u64 {
            writer.put(&key, &(key + 1))?;
        }
        writer.close()?;
        tree.checkpoint()?;
        tree.close()?;
    }

    let tree = GbpTree::open_or_create(&path, LongLayout::new(), PAGE_SIZE)?;
    assert!(tree.was_clean_on_open());
    let entries = tree.seek(0, u64::MAX)?.collect::<Result<Vec<_>>>()?;
    assert_eq!(entries.len(), 500);
    assert!(entries.iter().all(|&(k, v)| v == k + 1));
    tree.close()
}

#[test]
fn test_single_writer() -> Result<()> {
    let tree = TreeBuilder::new(LongLayout::new()).page_size(PAGE_SIZE).open_in_memory()?;
    let writer = tree.writer()?;
    assert!(matches!(tree.writer(), Err(Error::InvalidOperation(_))));
    writer.close()?;
    let writer = tree.writer()?;
    writer.close()
}

#[test]
fn test_invalid_page_size() {
    let result = TreeBuilder::new(LongLayout::new()).page_size(64).open_in_memory();
    assert!(matches!(result, Err(Error::InvalidParameter(_))));
}
