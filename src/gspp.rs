//! Generation safe pointer pair
//!
//! Every pointer stored in a node is a pair of [`gsp`](crate::gsp) slots, A
//! then B. Reads pick the slot that is valid for the current generations and
//! writes go to the slot that can be overwritten without losing the last
//! checkpointed value. The outcome of both is a [`GsppResult`], a packed word
//! which on failure carries enough detail to explain what was found.

use crate::error::{Error, PageId, Result};
use crate::generation::GenerationPair;
use crate::gsp::{self, Gsp};
use crate::page_cache::PageCursor;
use bitflags::bitflags;
use std::fmt;

/// Size of a pointer pair
pub const SIZE: usize = gsp::SIZE * 2;

/// Pointer value meaning "no node"
pub const NO_NODE: u64 = 0;

const SHIFT_STATE_A: u32 = 56;
const SHIFT_STATE_B: u32 = 53;
const STATE_MASK: u64 = 0b111;
const POINTER_MASK: u64 = gsp::MAX_POINTER;

bitflags! {
    /// Flag bits of a [`GsppResult`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ResultFlags: u64 {
        /// Neither slot could be used
        const FAIL = 1 << 63;
        /// Result of a write, as opposed to a read
        const WRITE = 1 << 62;
        /// Slot B was used
        const SLOT_B = 1 << 61;
        /// Slot B had the higher generation
        const GENERATION_B_BIG = 1 << 60;
        /// Slot A had the higher generation
        const GENERATION_A_BIG = 1 << 59;
    }
}

/// Classification of one slot against the current generations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SlotState {
    /// Written in a checkpointed generation
    Stable = 0,
    /// Written in the generation in progress
    Unstable = 1,
    /// Written in a generation lost to a crash
    Crash = 2,
    /// Checksum mismatch or impossible generation
    Broken = 3,
    /// Never written
    Empty = 4,
}

impl SlotState {
    /// Classify a slot
    pub fn of(slot: &Gsp, generation: GenerationPair) -> Self {
        if slot.is_empty() {
            SlotState::Empty
        } else if !slot.checksum_matches() || slot.generation < crate::generation::MIN_GENERATION {
            SlotState::Broken
        } else if slot.generation <= generation.stable {
            SlotState::Stable
        } else if slot.generation == generation.unstable {
            SlotState::Unstable
        } else {
            SlotState::Crash
        }
    }

    fn from_bits(bits: u64) -> Self {
        match bits {
            0 => SlotState::Stable,
            1 => SlotState::Unstable,
            2 => SlotState::Crash,
            4 => SlotState::Empty,
            _ => SlotState::Broken,
        }
    }

    fn name(self) -> &'static str {
        match self {
            SlotState::Stable => "STABLE",
            SlotState::Unstable => "UNSTABLE",
            SlotState::Crash => "CRASH",
            SlotState::Broken => "BROKEN",
            SlotState::Empty => "EMPTY",
        }
    }
}

/// One of the two slots of a pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// First slot
    A,
    /// Second slot
    B,
}

impl Slot {
    /// Byte offset of the slot within the pair
    pub fn offset(self) -> usize {
        match self {
            Slot::A => 0,
            Slot::B => gsp::SIZE,
        }
    }
}

/// Which pointer of a node a result is about, for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerField {
    /// Right sibling pointer
    RightSibling,
    /// Left sibling pointer
    LeftSibling,
    /// Pointer to the node's successor
    NewGen,
    /// Child pointer at a position
    Child(usize),
}

impl fmt::Display for PointerField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PointerField::RightSibling => write!(f, "right sibling"),
            PointerField::LeftSibling => write!(f, "left sibling"),
            PointerField::NewGen => write!(f, "successor pointer"),
            PointerField::Child(pos) => write!(f, "child {}", pos),
        }
    }
}

/// Packed outcome of reading or writing a pointer pair
///
/// The default is a successful read of slot A holding [`NO_NODE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GsppResult(u64);

impl GsppResult {
    fn read_success(slot: Slot, pointer: u64) -> Self {
        let mut bits = pointer & POINTER_MASK;
        if slot == Slot::B {
            bits |= ResultFlags::SLOT_B.bits();
        }
        GsppResult(bits)
    }

    fn write_success(slot: Slot) -> Self {
        let mut flags = ResultFlags::WRITE;
        if slot == Slot::B {
            flags |= ResultFlags::SLOT_B;
        }
        GsppResult(flags.bits())
    }

    fn failure(write: bool, state_a: SlotState, state_b: SlotState, generation_a: u64, generation_b: u64) -> Self {
        let mut flags = ResultFlags::FAIL;
        if write {
            flags |= ResultFlags::WRITE;
        }
        if generation_a > generation_b {
            flags |= ResultFlags::GENERATION_A_BIG;
        } else if generation_b > generation_a {
            flags |= ResultFlags::GENERATION_B_BIG;
        }
        GsppResult(
            flags.bits()
                | ((state_a as u64) << SHIFT_STATE_A)
                | ((state_b as u64) << SHIFT_STATE_B),
        )
    }

    /// Raw packed value
    pub fn bits(self) -> u64 {
        self.0
    }

    /// Flag bits
    pub fn flags(self) -> ResultFlags {
        ResultFlags::from_bits_truncate(self.0)
    }

    /// Whether a slot could be used
    pub fn is_success(self) -> bool {
        !self.flags().contains(ResultFlags::FAIL)
    }

    /// Whether this is the result of a read
    pub fn is_read(self) -> bool {
        !self.flags().contains(ResultFlags::WRITE)
    }

    /// Slot that was read or written
    pub fn slot(self) -> Slot {
        if self.flags().contains(ResultFlags::SLOT_B) {
            Slot::B
        } else {
            Slot::A
        }
    }

    /// Pointer of a successful read
    pub fn pointer(self) -> u64 {
        self.0 & POINTER_MASK
    }

    /// Whether a successful read points at a node
    pub fn is_node(self) -> bool {
        self.is_success() && self.pointer() != NO_NODE
    }

    /// State of slot A on failure
    pub fn state_a(self) -> SlotState {
        SlotState::from_bits((self.0 >> SHIFT_STATE_A) & STATE_MASK)
    }

    /// State of slot B on failure
    pub fn state_b(self) -> SlotState {
        SlotState::from_bits((self.0 >> SHIFT_STATE_B) & STATE_MASK)
    }
}

impl fmt::Display for GsppResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = if self.is_read() { "READ" } else { "WRITE" };
        let slot = match self.slot() {
            Slot::A => "A",
            Slot::B => "B",
        };
        if self.is_success() {
            if self.is_read() {
                return write!(f, "{} slot {} pointer {}", op, slot, self.pointer());
            }
            return write!(f, "{} slot {}", op, slot);
        }
        let flags = self.flags();
        let comparison = if flags.contains(ResultFlags::GENERATION_A_BIG) {
            "A > B"
        } else if flags.contains(ResultFlags::GENERATION_B_BIG) {
            "A < B"
        } else {
            "A == B"
        };
        write!(
            f,
            "{} failure: A={} B={} generation {}",
            op,
            self.state_a().name(),
            self.state_b().name(),
            comparison
        )
    }
}

/// Slot a read should use, or `None` when no slot is trustworthy
pub fn select_read(state_a: SlotState, state_b: SlotState, generation_a: u64, generation_b: u64) -> Option<Slot> {
    use SlotState::*;
    match (state_a, state_b) {
        (Unstable, Stable | Empty) => Some(Slot::A),
        (Stable | Empty, Unstable) => Some(Slot::B),
        (Stable, Stable) => match generation_a.cmp(&generation_b) {
            std::cmp::Ordering::Greater => Some(Slot::A),
            std::cmp::Ordering::Less => Some(Slot::B),
            std::cmp::Ordering::Equal => None,
        },
        (Stable, _) => Some(Slot::A),
        (_, Stable) => Some(Slot::B),
        _ => None,
    }
}

/// Slot a write should overwrite, or `None` when that would lose data
///
/// A stable slot is never overwritten unless both are stable, in which case
/// the older one goes. An unstable slot next to an empty one is overwritten
/// in place so the pair keeps a single unstable value.
pub fn select_write(state_a: SlotState, state_b: SlotState, generation_a: u64, generation_b: u64) -> Option<Slot> {
    use SlotState::*;
    match (state_a, state_b) {
        (Stable, Stable) => match generation_a.cmp(&generation_b) {
            std::cmp::Ordering::Greater => Some(Slot::B),
            std::cmp::Ordering::Less => Some(Slot::A),
            std::cmp::Ordering::Equal => None,
        },
        (Stable, _) => Some(Slot::B),
        (_, Stable) => Some(Slot::A),
        (Unstable, Empty) => Some(Slot::A),
        (Empty, Unstable) => Some(Slot::B),
        (Empty, Empty) => Some(Slot::A),
        _ => None,
    }
}

pub(crate) fn read_slots(cursor: &mut PageCursor<'_>, offset: usize) -> (Gsp, Gsp) {
    cursor.set_offset(offset);
    let a = Gsp::read(cursor);
    let b = Gsp::read(cursor);
    (a, b)
}

/// Read the pair at `offset`
pub fn read(cursor: &mut PageCursor<'_>, offset: usize, generation: GenerationPair) -> GsppResult {
    let (a, b) = read_slots(cursor, offset);
    let state_a = SlotState::of(&a, generation);
    let state_b = SlotState::of(&b, generation);
    match select_read(state_a, state_b, a.generation, b.generation) {
        Some(Slot::A) => GsppResult::read_success(Slot::A, a.pointer),
        Some(Slot::B) => GsppResult::read_success(Slot::B, b.pointer),
        None => GsppResult::failure(false, state_a, state_b, a.generation, b.generation),
    }
}

/// Write `pointer` into the pair at `offset` with the unstable generation
///
/// Nothing is written when the returned result is a failure.
pub fn write(cursor: &mut PageCursor<'_>, offset: usize, pointer: u64, generation: GenerationPair) -> Result<GsppResult> {
    let (a, b) = read_slots(cursor, offset);
    let state_a = SlotState::of(&a, generation);
    let state_b = SlotState::of(&b, generation);
    match select_write(state_a, state_b, a.generation, b.generation) {
        Some(slot) => {
            cursor.set_offset(offset + slot.offset());
            gsp::write(cursor, generation.unstable, pointer)?;
            Ok(GsppResult::write_success(slot))
        }
        None => Ok(GsppResult::failure(true, state_a, state_b, a.generation, b.generation)),
    }
}

/// Generation stored in the slot a successful read used
pub fn pointer_generation(cursor: &mut PageCursor<'_>, offset: usize, result: GsppResult) -> u64 {
    cursor.get_u32_at(offset + result.slot().offset()) as u64
}

/// Turn a read result into a page id, failing on unusable pointers
///
/// `allow_no_node` accepts [`NO_NODE`], which sibling and successor pointers
/// legitimately hold.
pub fn check_pointer(result: GsppResult, allow_no_node: bool, page_id: PageId, field: PointerField) -> Result<u64> {
    if !result.is_success() {
        return Err(Error::PointerCorruption { page_id, field, result });
    }
    let pointer = result.pointer();
    if !allow_no_node && pointer == NO_NODE {
        return Err(Error::corruption(format!("{} of page {} points to no node", field, page_id), page_id));
    }
    Ok(pointer)
}

/// Fail with [`Error::PointerCorruption`] unless a write succeeded
pub fn check_write(result: GsppResult, page_id: PageId, field: PointerField) -> Result<()> {
    if result.is_success() {
        Ok(())
    } else {
        Err(Error::PointerCorruption { page_id, field, result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemoryBackend;
    use crate::page_cache::{PageCache, PinIntent};
    use SlotState::*;

    const ALL: [SlotState; 5] = [Stable, Unstable, Crash, Broken, Empty];

    #[test]
    fn test_read_selection_table() {
        for a in ALL {
            for b in ALL {
                let expected = match (a, b) {
                    (Unstable, Stable) | (Unstable, Empty) | (Stable, Crash) | (Stable, Broken) => Some(Slot::A),
                    (Stable, Unstable) | (Empty, Unstable) | (Crash, Stable) | (Broken, Stable) => Some(Slot::B),
                    (Stable, Empty) => Some(Slot::A),
                    (Empty, Stable) => Some(Slot::B),
                    (Stable, Stable) => Some(Slot::B),
                    _ => None,
                };
                assert_eq!(select_read(a, b, 3, 4), expected, "read A={:?} B={:?}", a, b);
            }
        }
        assert_eq!(select_read(Stable, Stable, 5, 4), Some(Slot::A));
        assert_eq!(select_read(Stable, Stable, 4, 4), None);
    }

    #[test]
    fn test_write_selection_table() {
        for a in ALL {
            for b in ALL {
                let expected = match (a, b) {
                    (Stable, Stable) => Some(Slot::A),
                    (Stable, _) => Some(Slot::B),
                    (_, Stable) => Some(Slot::A),
                    (Unstable, Empty) | (Empty, Empty) => Some(Slot::A),
                    (Empty, Unstable) => Some(Slot::B),
                    _ => None,
                };
                assert_eq!(select_write(a, b, 3, 4), expected, "write A={:?} B={:?}", a, b);
            }
        }
        assert_eq!(select_write(Stable, Stable, 5, 4), Some(Slot::B));
        assert_eq!(select_write(Stable, Stable, 4, 4), None);
    }

    #[test]
    fn test_slot_state_classification() {
        let generation = GenerationPair::new(5, 7);
        let slot = |g: u64, p: u64| Gsp { generation: g, pointer: p, checksum: gsp::checksum_of(g, p) };
        assert_eq!(SlotState::of(&slot(0, 0), generation), Empty);
        assert_eq!(SlotState::of(&slot(3, 9), generation), Stable);
        assert_eq!(SlotState::of(&slot(5, 9), generation), Stable);
        assert_eq!(SlotState::of(&slot(6, 9), generation), Crash);
        assert_eq!(SlotState::of(&slot(7, 9), generation), Unstable);
        assert_eq!(SlotState::of(&slot(8, 9), generation), Crash);
        assert_eq!(SlotState::of(&slot(0, 9), generation), Broken);
        let mut bad = slot(3, 9);
        bad.checksum ^= 1;
        assert_eq!(SlotState::of(&bad, generation), Broken);
    }

    #[test]
    fn test_write_read_across_generations() -> Result<()> {
        let cache = PageCache::new(Box::new(MemoryBackend::new(128)))?;
        let mut cursor = cache.io(PageId(1), PinIntent::Write)?;
        let offset = 10;

        // Written in generation 2, visible as unstable
        let g1 = GenerationPair::new(1, 2);
        let result = write(&mut cursor, offset, 100, g1)?;
        assert!(result.is_success());
        assert_eq!(result.slot(), Slot::A);
        assert_eq!(read(&mut cursor, offset, g1).pointer(), 100);

        // Rewrite within the same generation overwrites the unstable slot
        write(&mut cursor, offset, 101, g1)?;
        let result = read(&mut cursor, offset, g1);
        assert_eq!((result.slot(), result.pointer()), (Slot::A, 101));

        // After a checkpoint the next write goes to B and both remain readable
        let g2 = g1.checkpointed();
        let result = write(&mut cursor, offset, 200, g2)?;
        assert_eq!(result.slot(), Slot::B);
        assert_eq!(read(&mut cursor, offset, g2).pointer(), 200);
        let read_result = read(&mut cursor, offset, g2);
        assert_eq!(pointer_generation(&mut cursor, offset, read_result), 3);

        // A crash before the next checkpoint leaves B crashed, A wins again
        let crashed = g2.bumped();
        let result = read(&mut cursor, offset, crashed);
        assert_eq!((result.slot(), result.pointer()), (Slot::A, 101));

        // Writing after the crash overwrites the crashed slot
        let result = write(&mut cursor, offset, 300, crashed)?;
        assert_eq!(result.slot(), Slot::B);
        assert_eq!(read(&mut cursor, offset, crashed).pointer(), 300);
        Ok(())
    }

    #[test]
    fn test_rewrite_next_to_empty_slot_keeps_pair_readable() -> Result<()> {
        let cache = PageCache::new(Box::new(MemoryBackend::new(128)))?;
        let mut cursor = cache.io(PageId(1), PinIntent::Write)?;
        let generation = GenerationPair::new(1, 2);

        write(&mut cursor, 0, 100, generation)?;
        write(&mut cursor, 0, 101, generation)?;
        let (_, b) = read_slots(&mut cursor, 0);
        assert_eq!(SlotState::of(&b, generation), Empty);
        assert_eq!(read(&mut cursor, 0, generation).pointer(), 101);

        // Filling the empty partner instead gives two unstable slots, which no read accepts
        cursor.set_offset(Slot::B.offset());
        gsp::write(&mut cursor, generation.unstable, 102)?;
        let result = read(&mut cursor, 0, generation);
        assert!(!result.is_success());
        assert_eq!((result.state_a(), result.state_b()), (Unstable, Unstable));
        Ok(())
    }

    #[test]
    fn test_failure_is_described() -> Result<()> {
        let cache = PageCache::new(Box::new(MemoryBackend::new(128)))?;
        let mut cursor = cache.io(PageId(1), PinIntent::Write)?;
        let result = read(&mut cursor, 0, GenerationPair::new(1, 2));
        assert!(!result.is_success());
        assert_eq!((result.state_a(), result.state_b()), (Empty, Empty));
        assert_eq!(result.to_string(), "READ failure: A=EMPTY B=EMPTY generation A == B");

        let err = check_pointer(result, true, PageId(1), PointerField::Child(2)).unwrap_err();
        assert!(matches!(err, Error::PointerCorruption { field: PointerField::Child(2), .. }));
        Ok(())
    }

    #[test]
    fn test_no_node_checking() -> Result<()> {
        let cache = PageCache::new(Box::new(MemoryBackend::new(128)))?;
        let mut cursor = cache.io(PageId(1), PinIntent::Write)?;
        let generation = GenerationPair::new(1, 2);
        write(&mut cursor, 0, NO_NODE, generation)?;
        let result = read(&mut cursor, 0, generation);
        assert!(result.is_success());
        assert!(!result.is_node());
        assert_eq!(check_pointer(result, true, PageId(1), PointerField::RightSibling)?, NO_NODE);
        assert!(check_pointer(result, false, PageId(1), PointerField::Child(0)).is_err());
        Ok(())
    }
}
