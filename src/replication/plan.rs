//! Part boundaries for a chunked copy

use crate::storage::ByteRange;

const MIB: u64 = 1024 * 1024;

/// Smallest part a store accepts for any part but the last (5 MiB)
pub const MIN_PART_SIZE: u64 = 5 * MIB;

/// Largest single part a store accepts (5 GiB)
pub const MAX_PART_SIZE: u64 = 5 * 1024 * MIB;

/// Most parts a single multipart session may hold
pub const MAX_PARTS: u64 = 10_000;

/// Part size to use for an object of `object_size` bytes
///
/// Returns `part_size` unless the object would need more than
/// `MAX_PARTS` parts, in which case the smallest size that fits is used.
pub fn effective_part_size(object_size: u64, part_size: u64) -> u64 {
    part_size.max(object_size.div_ceil(MAX_PARTS))
}

/// One part of a copy: its number and the source bytes it covers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedPart {
    pub part_number: u32,
    pub range: ByteRange,
}

/// Contiguous, non-overlapping split of `[0, object_size)` into parts
/// numbered from 1
#[derive(Debug, Clone, Copy)]
pub struct PartPlan {
    object_size: u64,
    part_size: u64,
}

impl PartPlan {
    pub fn new(object_size: u64, part_size: u64) -> Self {
        assert!(part_size > 0, "part size must be positive");
        Self {
            object_size,
            part_size,
        }
    }

    pub fn object_size(&self) -> u64 {
        self.object_size
    }

    pub fn part_size(&self) -> u64 {
        self.part_size
    }

    /// `ceil(object_size / part_size)`; zero for an empty object
    pub fn part_count(&self) -> u32 {
        u32::try_from(self.object_size.div_ceil(self.part_size)).unwrap_or(u32::MAX)
    }

    pub fn parts(&self) -> PartIter {
        PartIter {
            offset: 0,
            next_part_number: 1,
            object_size: self.object_size,
            part_size: self.part_size,
        }
    }
}

/// Iterator over the parts of a `PartPlan`, ascending
#[derive(Debug, Clone)]
pub struct PartIter {
    offset: u64,
    next_part_number: u32,
    object_size: u64,
    part_size: u64,
}

impl Iterator for PartIter {
    type Item = PlannedPart;

    fn next(&mut self) -> Option<PlannedPart> {
        if self.offset >= self.object_size {
            return None;
        }

        // The last part is clamped to the final byte of the object
        let end = self
            .offset
            .saturating_add(self.part_size)
            .min(self.object_size);
        let part = PlannedPart {
            part_number: self.next_part_number,
            range: ByteRange::new(self.offset, end - 1),
        };

        self.offset = end;
        self.next_part_number += 1;
        Some(part)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.object_size.saturating_sub(self.offset);
        let count = remaining.div_ceil(self.part_size) as usize;
        (count, Some(count))
    }
}

impl ExactSizeIterator for PartIter {}
