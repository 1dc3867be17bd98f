//! Static work partitioning for fork-join kernels
//!
//! Every unit of a fork gets one contiguous block of `ceil(size / unit_count)`
//! elements. The last non-empty block may be shorter, and when there are more
//! units than elements the trailing units get empty ranges.
//!
//! ```text
//! size = 10, unit_count = 4, block = 3
//!
//! unit 0: [0, 3)   unit 1: [3, 6)   unit 2: [6, 9)   unit 3: [9, 10)
//! ```

use std::ops::Range;

/// Half-open index range `[start, stop)` owned by one compute unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UnitRange {
    pub start: usize,
    pub stop: usize,
}

impl UnitRange {
    pub fn len(&self) -> usize {
        self.stop - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.stop
    }

    pub fn as_range(&self) -> Range<usize> {
        self.start..self.stop
    }
}

/// Elements assigned to each unit: `ceil(size / unit_count)`.
#[inline]
pub fn block_size(unit_count: usize, size: usize) -> usize {
    size.div_ceil(unit_count)
}

/// Range of `[0, size)` owned by `unit_index` out of `unit_count` units.
///
/// Callers guarantee `unit_count > 0` and `unit_index < unit_count`.
/// Empty ranges are clamped to `size` so `start <= stop` always holds.
#[inline]
pub fn partition(unit_count: usize, unit_index: usize, size: usize) -> UnitRange {
    debug_assert!(unit_count > 0, "unit_count must be positive");
    debug_assert!(unit_index < unit_count, "unit_index out of range");

    let block = block_size(unit_count, size);
    let start = unit_index.saturating_mul(block).min(size);
    let stop = start.saturating_add(block).min(size);
    UnitRange { start, stop }
}

/// Split `buf[..size]` into one mutable window per unit.
///
/// Window `u` covers exactly `partition(unit_count, u, size)`, so a unit
/// handed its window can only write the indices it owns.
pub fn split_mut(buf: &mut [f32], unit_count: usize, size: usize) -> Vec<&mut [f32]> {
    debug_assert!(buf.len() >= size);

    let mut windows = Vec::with_capacity(unit_count);
    let mut rest = &mut buf[..size];
    for unit_index in 0..unit_count {
        let len = partition(unit_count, unit_index, size).len();
        let (head, tail) = std::mem::take(&mut rest).split_at_mut(len);
        windows.push(head);
        rest = tail;
    }
    windows
}
