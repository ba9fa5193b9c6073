//! Reopening after crashes and replaying lost changes

use gbptree::{Error, GbpTree, LongLayout, Monitor, Result, TreeBuilder};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

const PAGE_SIZE: usize = 256;

#[derive(Default)]
struct RecoveryMonitor {
    clean: AtomicBool,
    cleaned: AtomicU64,
    cleanups: AtomicU64,
}

impl Monitor for RecoveryMonitor {
    fn startup_state(&self, clean: bool) {
        self.clean.store(clean, Ordering::SeqCst);
    }

    fn cleanup_finished(&self, cleaned_pointers: u64) {
        self.cleaned.fetch_add(cleaned_pointers, Ordering::SeqCst);
        self.cleanups.fetch_add(1, Ordering::SeqCst);
    }
}

fn open_monitored(path: &Path, monitor: Arc<RecoveryMonitor>) -> Result<GbpTree<LongLayout>> {
    TreeBuilder::new(LongLayout::new()).page_size(PAGE_SIZE).monitor(monitor).open(path)
}

/// Copy the store while a checkpoint is blocked behind a writer
///
/// The copy holds pages written after the last completed checkpoint but not
/// the state of the blocked one, like a store after a crash mid-checkpoint.
fn crash_image(dir: &TempDir) -> Result<PathBuf> {
    let path = dir.path().join("live.db");
    let image = dir.path().join("image.db");
    let tree = Arc::new(GbpTree::open_or_create(&path, LongLayout::new(), PAGE_SIZE)?);

    let mut writer = tree.writer()?;
    for key in 0..200u64 {
        writer.put(&key, &key)?;
    }
    writer.close()?;
    tree.checkpoint()?;

    let mut writer = tree.writer()?;
    for key in 200..400u64 {
        writer.put(&key, &key)?;
    }
    for key in (0..200u64).step_by(2) {
        writer.put(&key, &(key + 1_000))?;
    }
    let checkpoint = {
        let tree = tree.clone();
        thread::spawn(move || tree.checkpoint())
    };
    thread::sleep(Duration::from_millis(200));
    std::fs::copy(&path, &image).map_err(Error::from)?;
    writer.close()?;
    checkpoint.join().unwrap()?;
    Ok(image)
}

#[test]
fn test_crash_image_opens_at_last_checkpoint() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let image = crash_image(&dir)?;

    let monitor = Arc::new(RecoveryMonitor::default());
    let tree = open_monitored(&image, monitor.clone())?;
    assert!(!tree.was_clean_on_open());
    assert!(!monitor.clean.load(Ordering::SeqCst));
    assert_eq!(monitor.cleanups.load(Ordering::SeqCst), 1);

    let entries = tree.seek(0, u64::MAX)?.collect::<Result<Vec<_>>>()?;
    assert_eq!(entries, (0..200u64).map(|k| (k, k)).collect::<Vec<_>>());
    assert!(tree.consistency_check()?.is_consistent());

    // Writable again after cleanup
    let mut writer = tree.writer()?;
    for key in 200..300u64 {
        writer.put(&key, &key)?;
    }
    writer.close()?;
    tree.checkpoint()?;
    assert_eq!(tree.seek(0, u64::MAX)?.count(), 300);
    assert!(tree.consistency_check()?.is_consistent());
    tree.close()
}

#[test]
fn test_prepare_for_recovery_then_replay() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let image = crash_image(&dir)?;

    let monitor = Arc::new(RecoveryMonitor::default());
    let tree = open_monitored(&image, monitor.clone())?;
    tree.prepare_for_recovery()?;
    // Nothing from the lost generation is left once the tree is opened
    assert_eq!(monitor.cleanups.load(Ordering::SeqCst), 2);

    // Replay the lost changes twice, overwriting is idempotent
    for _ in 0..2 {
        let mut writer = tree.writer()?;
        for key in 200..400u64 {
            writer.put(&key, &key)?;
        }
        for key in (0..200u64).step_by(2) {
            writer.put(&key, &(key + 1_000))?;
        }
        writer.close()?;
    }
    tree.checkpoint()?;

    let entries = tree.seek(0, u64::MAX)?.collect::<Result<Vec<_>>>()?;
    assert_eq!(entries.len(), 400);
    assert!(entries.iter().all(|&(k, v)| if k < 200 && k % 2 == 0 { v == k + 1_000 } else { v == k }));
    assert!(tree.consistency_check()?.is_consistent());
    tree.close()?;

    let tree = GbpTree::open_or_create(&image, LongLayout::new(), PAGE_SIZE)?;
    assert!(tree.was_clean_on_open());
    assert_eq!(tree.seek(0, u64::MAX)?.count(), 400);
    tree.close()
}

#[test]
fn test_prepare_for_recovery_after_changes_fails() -> Result<()> {
    let tree = TreeBuilder::new(LongLayout::new()).page_size(PAGE_SIZE).open_in_memory()?;
    let mut writer = tree.writer()?;
    writer.put(&1, &1)?;
    writer.close()?;
    assert!(matches!(tree.prepare_for_recovery(), Err(Error::InvalidOperation(_))));

    // A checkpoint makes it legal again
    tree.checkpoint()?;
    tree.prepare_for_recovery()?;
    assert_eq!(tree.get(&1)?, Some(1));
    Ok(())
}

#[test]
fn test_repeated_crashes() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("repeated.db");
    for round in 0..5u64 {
        let tree = GbpTree::open_or_create(&path, LongLayout::new(), PAGE_SIZE)?;
        assert_eq!(tree.seek(0, u64::MAX)?.count() as u64, round * 50);
        assert!(tree.consistency_check()?.is_consistent());

        let mut writer = tree.writer()?;
        for key in round * 50..(round + 1) * 50 {
            writer.put(&key, &key)?;
        }
        writer.close()?;
        tree.checkpoint()?;
        drop(tree);
    }
    Ok(())
}
