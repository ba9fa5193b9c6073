//! Generation-aware B+tree index stored in a page file
//!
//! A [`GbpTree`] maps fixed-size keys to fixed-size values, with the
//! encoding and ordering supplied by a [`Layout`]. One [`Writer`] at a time
//! modifies the tree while any number of [`SeekCursor`]s read it without
//! taking locks. Pages touched after a checkpoint are copied before being
//! modified, and every pointer between pages is kept twice together with the
//! generation it was written in. After a crash the tree therefore opens as of
//! the last completed [`checkpoint`](GbpTree::checkpoint).

#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod error;
pub mod io;
pub mod page_cache;
pub mod generation;
pub mod gsp;
pub mod gspp;
pub mod layout;
pub mod node;
pub mod key_search;
pub mod freelist;
pub mod meta;
pub mod cursor;
pub mod consistency;
pub mod monitor;
pub mod writer;
pub mod tree;

mod crash_cleanup;
mod tree_logic;

// Re-exports
pub use consistency::{ConsistencyReport, Inconsistency};
pub use cursor::SeekCursor;
pub use error::{Error, PageId, Result};
pub use generation::GenerationPair;
pub use layout::{KeepExisting, Layout, LongLayout, Overwrite, ValueMerger};
pub use monitor::{Monitor, NoMonitor};
pub use tree::{read_header, GbpTree, Root, TreeBuilder};
pub use writer::Writer;

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
