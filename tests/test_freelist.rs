//! Reuse of released pages across checkpoints

use gbptree::{GbpTree, LongLayout, Result, TreeBuilder};
use tempfile::TempDir;

const PAGE_SIZE: usize = 256;

fn file_pages(path: &std::path::Path) -> u64 {
    std::fs::metadata(path).unwrap().len() / PAGE_SIZE as u64
}

#[test]
fn test_churn_does_not_grow_store() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("churn.db");
    let tree = TreeBuilder::new(LongLayout::new())
        .page_size(PAGE_SIZE)
        .initial_file_size(0)
        .open(&path)?;

    let mut writer = tree.writer()?;
    for key in 0..50u64 {
        writer.put(&key, &0)?;
    }
    writer.close()?;
    tree.checkpoint()?;
    let after_fill = file_pages(&path);

    // Every round copies the touched leaves and the root to new pages
    for round in 1..=200u64 {
        let mut writer = tree.writer()?;
        for key in (round % 5..50).step_by(5) {
            writer.put(&key, &round)?;
        }
        writer.close()?;
        tree.checkpoint()?;
    }

    assert!(file_pages(&path) <= after_fill.max(16) * 8, "store grew to {} pages", file_pages(&path));
    assert!(tree.consistency_check()?.is_consistent());
    tree.close()
}

#[test]
fn test_released_pages_survive_reopen() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("reopen.db");
    {
        let tree = GbpTree::open_or_create(&path, LongLayout::new(), PAGE_SIZE)?;
        for round in 0..20u64 {
            let mut writer = tree.writer()?;
            for key in 0..100u64 {
                writer.put(&key, &round)?;
            }
            for key in (0..100u64).step_by(7) {
                writer.remove(&key)?;
            }
            writer.close()?;
            tree.checkpoint()?;
        }
        tree.close()?;
    }

    // Free list positions come back from the state page
    let tree = GbpTree::open_or_create(&path, LongLayout::new(), PAGE_SIZE)?;
    assert!(tree.consistency_check()?.is_consistent());
    let mut writer = tree.writer()?;
    for key in 100..400u64 {
        writer.put(&key, &key)?;
    }
    writer.close()?;
    tree.checkpoint()?;
    assert!(tree.consistency_check()?.is_consistent());
    assert_eq!(tree.seek(0, u64::MAX)?.count(), 100 - 15 + 300);
    tree.close()
}
