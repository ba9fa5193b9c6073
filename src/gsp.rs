//! Generation safe pointer
//!
//! One slot of a pointer pair: a generation, a 48-bit page id and a checksum
//! over both, 12 bytes in total.
//!
//! ```text
//! [ generation (4) | pointer (6) | checksum (2) ]
//! ```

use crate::error::{Error, Result};
use crate::generation::{MAX_GENERATION, MIN_GENERATION};
use crate::page_cache::PageCursor;

/// Bytes used by the generation
pub const GENERATION_SIZE: usize = 4;

/// Bytes used by the pointer
pub const POINTER_SIZE: usize = 6;

/// Bytes used by the checksum
pub const CHECKSUM_SIZE: usize = 2;

/// Total size of one slot
pub const SIZE: usize = GENERATION_SIZE + POINTER_SIZE + CHECKSUM_SIZE;

/// Generation of a slot that was never written
pub const EMPTY_GENERATION: u64 = 0;

/// Pointer of a slot that was never written
pub const EMPTY_POINTER: u64 = 0;

/// Largest page id a slot can hold
pub const MAX_POINTER: u64 = (1 << 48) - 1;

/// A decoded slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gsp {
    /// Generation the pointer was written in
    pub generation: u64,
    /// Page id
    pub pointer: u64,
    /// Stored checksum
    pub checksum: u16,
}

impl Gsp {
    /// Read a slot at the cursor offset, advancing past it
    pub fn read(cursor: &mut PageCursor<'_>) -> Self {
        let generation = cursor.get_u32() as u64;
        let pointer = read_pointer(cursor);
        let checksum = cursor.get_u16();
        Self { generation, pointer, checksum }
    }

    /// Whether the slot was never written
    pub fn is_empty(&self) -> bool {
        self.generation == EMPTY_GENERATION && self.pointer == EMPTY_POINTER
    }

    /// Whether the stored checksum matches generation and pointer
    pub fn checksum_matches(&self) -> bool {
        checksum_of(self.generation, self.pointer) == self.checksum
    }
}

/// Write a slot at the cursor offset, advancing past it
pub fn write(cursor: &mut PageCursor<'_>, generation: u64, pointer: u64) -> Result<()> {
    if !(MIN_GENERATION..=MAX_GENERATION).contains(&generation) {
        return Err(Error::InvalidParameter("generation out of range"));
    }
    if pointer > MAX_POINTER {
        return Err(Error::InvalidParameter("pointer does not fit in 48 bits"));
    }
    cursor.put_u32(generation as u32);
    write_pointer(cursor, pointer);
    cursor.put_u16(checksum_of(generation, pointer));
    Ok(())
}

/// Zero a slot at the cursor offset, advancing past it
pub fn clear(cursor: &mut PageCursor<'_>) {
    cursor.put_bytes(&[0u8; SIZE]);
}

/// Checksum over the 16-bit halves of generation and pointer
pub fn checksum_of(generation: u64, pointer: u64) -> u16 {
    let mut checksum = (generation & 0xFFFF) as u16;
    checksum ^= ((generation >> 16) & 0xFFFF) as u16;
    checksum ^= (pointer & 0xFFFF) as u16;
    checksum ^= ((pointer >> 16) & 0xFFFF) as u16;
    checksum ^= ((pointer >> 32) & 0xFFFF) as u16;
    checksum
}

// Pointer as low 32 bits followed by high 16 bits
fn write_pointer(cursor: &mut PageCursor<'_>, pointer: u64) {
    cursor.put_u32(pointer as u32);
    cursor.put_u16((pointer >> 32) as u16);
}

fn read_pointer(cursor: &mut PageCursor<'_>) -> u64 {
    let low = cursor.get_u32() as u64;
    let high = cursor.get_u16() as u64;
    low | (high << 32)
}
