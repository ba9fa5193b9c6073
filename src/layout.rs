//! Key and value layouts
//!
//! A [`Layout`] decides how fixed-size keys and values are encoded in a page
//! and how keys are ordered. Its identifier and version are written to the
//! meta page when a tree is created and checked every time it is opened.

use crate::error::{Error, Result};
use crate::page_cache::PageCursor;
use std::cmp::Ordering;
use std::fmt::Debug;

/// Encoding and ordering of keys and values
pub trait Layout: Send + Sync {
    /// Key type
    type Key: Clone + Default + Debug + Send + Sync;
    /// Value type
    type Value: Clone + Default + Debug + Send + Sync;

    /// Encoded key size in bytes
    fn key_size(&self) -> usize;

    /// Encoded value size in bytes
    fn value_size(&self) -> usize;

    /// A key instance to read into
    fn new_key(&self) -> Self::Key {
        Self::Key::default()
    }

    /// A value instance to read into
    fn new_value(&self) -> Self::Value {
        Self::Value::default()
    }

    /// Copy `from` into `into`
    fn copy_key(&self, from: &Self::Key, into: &mut Self::Key) {
        into.clone_from(from);
    }

    /// Encode `key` at the cursor offset
    fn write_key(&self, cursor: &mut PageCursor<'_>, key: &Self::Key);

    /// Decode a key at the cursor offset into `into`
    fn read_key(&self, cursor: &mut PageCursor<'_>, into: &mut Self::Key);

    /// Encode `value` at the cursor offset
    fn write_value(&self, cursor: &mut PageCursor<'_>, value: &Self::Value);

    /// Decode a value at the cursor offset into `into`
    fn read_value(&self, cursor: &mut PageCursor<'_>, into: &mut Self::Value);

    /// Total order of keys
    fn compare(&self, a: &Self::Key, b: &Self::Key) -> Ordering;

    /// Identifies the layout in the meta page
    fn identifier(&self) -> u64;

    /// Major version, must match exactly on open
    fn major_version(&self) -> u32;

    /// Minor version
    fn minor_version(&self) -> u32;

    /// Write extra metadata after the meta page header
    fn write_meta_data(&self, _cursor: &mut PageCursor<'_>) {}

    /// Read and verify metadata written by [`write_meta_data`](Self::write_meta_data)
    fn read_meta_data(&self, _cursor: &mut PageCursor<'_>) -> Result<()> {
        Ok(())
    }

    /// Whether a store written by the given layout can be read with this one
    fn compatible_with(&self, identifier: u64, major_version: u32, minor_version: u32) -> bool {
        identifier == self.identifier()
            && major_version == self.major_version()
            && minor_version == self.minor_version()
    }
}

/// Build a layout identifier from a short ASCII name and a checksum
///
/// Up to four name bytes go in the high half, the checksum in the low half.
pub fn named_identifier(name: &str, checksum: u32) -> u64 {
    let mut upper = 0u64;
    for &b in name.as_bytes().iter().take(4) {
        upper = (upper << 8) | b as u64;
    }
    (upper << 32) | checksum as u64
}

/// Decides what happens when a key being inserted already exists
pub trait ValueMerger<K, V> {
    /// Return the value to store, or `None` to leave the existing value untouched
    fn merge(&self, existing_key: &K, new_key: &K, existing_value: &V, new_value: &V) -> Option<V>;
}

impl<K, V, F> ValueMerger<K, V> for F
where
    F: Fn(&K, &K, &V, &V) -> Option<V>,
{
    fn merge(&self, existing_key: &K, new_key: &K, existing_value: &V, new_value: &V) -> Option<V> {
        self(existing_key, new_key, existing_value, new_value)
    }
}

/// Replace existing values
#[derive(Debug, Clone, Copy, Default)]
pub struct Overwrite;

impl<K, V: Clone> ValueMerger<K, V> for Overwrite {
    fn merge(&self, _: &K, _: &K, _: &V, new_value: &V) -> Option<V> {
        Some(new_value.clone())
    }
}

/// Keep existing values
#[derive(Debug, Clone, Copy, Default)]
pub struct KeepExisting;

impl<K, V> ValueMerger<K, V> for KeepExisting {
    fn merge(&self, _: &K, _: &K, _: &V, _: &V) -> Option<V> {
        None
    }
}

/// `u64` keys and values, keys optionally padded to widen the slot
///
/// Padding makes keys take more room per node, handy to get deep trees
/// from few entries.
#[derive(Debug, Clone, Copy, Default)]
pub struct LongLayout {
    key_padding: usize,
}

impl LongLayout {
    /// Layout without padding
    pub fn new() -> Self {
        Self { key_padding: 0 }
    }

    /// Layout with `key_padding` zero bytes after every key
    pub fn with_key_padding(key_padding: usize) -> Self {
        Self { key_padding }
    }
}

impl Layout for LongLayout {
    type Key = u64;
    type Value = u64;

    fn key_size(&self) -> usize {
        8 + self.key_padding
    }

    fn value_size(&self) -> usize {
        8
    }

    fn write_key(&self, cursor: &mut PageCursor<'_>, key: &u64) {
        cursor.put_u64(*key);
        let offset = cursor.offset() + self.key_padding;
        cursor.set_offset(offset);
    }

    fn read_key(&self, cursor: &mut PageCursor<'_>, into: &mut u64) {
        *into = cursor.get_u64();
        let offset = cursor.offset() + self.key_padding;
        cursor.set_offset(offset);
    }

    fn write_value(&self, cursor: &mut PageCursor<'_>, value: &u64) {
        cursor.put_u64(*value);
    }

    fn read_value(&self, cursor: &mut PageCursor<'_>, into: &mut u64) {
        *into = cursor.get_u64();
    }

    fn compare(&self, a: &u64, b: &u64) -> Ordering {
        a.cmp(b)
    }

    fn identifier(&self) -> u64 {
        named_identifier("LONG", 999)
    }

    fn major_version(&self) -> u32 {
        0
    }

    fn minor_version(&self) -> u32 {
        1
    }

    fn write_meta_data(&self, cursor: &mut PageCursor<'_>) {
        cursor.put_u32(self.key_padding as u32);
    }

    fn read_meta_data(&self, cursor: &mut PageCursor<'_>) -> Result<()> {
        let stored = cursor.get_u32() as usize;
        if stored != self.key_padding {
            return Err(Error::MetadataMismatch(
                format!("key padding {} stored, {} requested", stored, self.key_padding).into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PageId;
    use crate::io::MemoryBackend;
    use crate::page_cache::{PageCache, PinIntent};

    #[test]
    fn test_named_identifier() {
        assert_eq!(named_identifier("AB", 7), (0x4142u64 << 32) | 7);
        assert_eq!(named_identifier("ABCDEF", 0), named_identifier("ABCD", 0));
    }

    #[test]
    fn test_long_layout_padding() -> Result<()> {
        let cache = PageCache::new(Box::new(MemoryBackend::new(128)))?;
        let mut cursor = cache.io(PageId(1), PinIntent::Write)?;
        let layout = LongLayout::with_key_padding(4);
        assert_eq!(layout.key_size(), 12);

        layout.write_key(&mut cursor, &42);
        assert_eq!(cursor.offset(), 12);
        layout.write_value(&mut cursor, &7);

        cursor.set_offset(0);
        let mut key = layout.new_key();
        let mut value = layout.new_value();
        layout.read_key(&mut cursor, &mut key);
        layout.read_value(&mut cursor, &mut value);
        assert_eq!((key, value), (42, 7));
        Ok(())
    }

    #[test]
    fn test_meta_data_mismatch() -> Result<()> {
        let cache = PageCache::new(Box::new(MemoryBackend::new(128)))?;
        let mut cursor = cache.io(PageId(1), PinIntent::Write)?;
        LongLayout::with_key_padding(16).write_meta_data(&mut cursor);

        cursor.set_offset(0);
        assert!(LongLayout::with_key_padding(16).read_meta_data(&mut cursor).is_ok());
        cursor.set_offset(0);
        assert!(matches!(
            LongLayout::new().read_meta_data(&mut cursor),
            Err(Error::MetadataMismatch(_))
        ));
        Ok(())
    }

    #[test]
    fn test_mergers() {
        let add = |_: &u64, _: &u64, a: &u64, b: &u64| Some(a + b);
        assert_eq!(add.merge(&1, &1, &2, &3), Some(5));
        assert_eq!(ValueMerger::<u64, u64>::merge(&Overwrite, &1, &1, &2, &3), Some(3));
        assert_eq!(ValueMerger::<u64, u64>::merge(&KeepExisting, &1, &1, &2, &3), None);
    }
}
