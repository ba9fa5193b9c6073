//! Hooks for observing tree lifecycle events

/// Receives notifications about events in a tree
///
/// All methods default to doing nothing, implement the ones of interest.
pub trait Monitor: Send + Sync {
    /// A checkpoint finished and the new state is durable
    fn checkpoint_completed(&self) {}

    /// The store did not exist and was created
    fn no_store_file(&self) {}

    /// An existing store was opened; `clean` tells whether it was closed cleanly
    fn startup_state(&self, _clean: bool) {}

    /// The root was split and the tree grew one level
    fn tree_growth(&self) {}

    /// Crash pointers were removed, `cleaned_pointers` of them
    fn cleanup_finished(&self, _cleaned_pointers: u64) {}
}

/// A monitor ignoring everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMonitor;

impl Monitor for NoMonitor {}
