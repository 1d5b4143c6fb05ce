//! Helpers for relaying GC callbacks: payload chunking and generation scans.
//!
//! The heap-walk callbacks hand over arrays with no upper bound (a busy gen2
//! collection can move hundreds of thousands of ranges), while one channel
//! event holds at most [`MAX_EVENT_PAYLOAD`] bytes of array payload. The relay
//! slices each batch into consecutive runs that fit, preserving order.

use std::ops::Range;

/// Array payload budget per channel event, leaving headroom under the 64 KiB
/// transport ceiling for header fields.
pub const MAX_EVENT_PAYLOAD: usize = 0xFD00;

const POINTER_BYTES: usize = 8;
const LENGTH_BYTES: usize = 4;

/// Moved-range record: old start, new start, length.
pub const MOVED_RECORD_BYTES: usize = 2 * POINTER_BYTES + LENGTH_BYTES;
/// Surviving-range record: start, length.
pub const SURVIVED_RECORD_BYTES: usize = POINTER_BYTES + LENGTH_BYTES;
/// Root record: referenced id, kind, flags, root id.
pub const ROOT_RECORD_BYTES: usize = 2 * POINTER_BYTES + 2 * LENGTH_BYTES;
/// Object-reference record: one referenced id.
pub const OBJECT_REF_RECORD_BYTES: usize = POINTER_BYTES;

/// Records of `record_bytes` each that fit in one event.
pub const fn max_records_per_event(record_bytes: usize) -> usize {
    MAX_EVENT_PAYLOAD / record_bytes
}

/// Split `0..total` into consecutive ranges of at most `max_len`, in order.
pub fn chunk_ranges(total: usize, max_len: usize) -> impl Iterator<Item = Range<usize>> {
    let max_len = max_len.max(1);
    (0..total)
        .step_by(max_len)
        .map(move |start| start..usize::min(start + max_len, total))
}

/// Highest generation index flagged as collected, clamped to 2 for the wire
/// format (everything above gen2 is reported as gen2).
pub fn max_collected_generation(generation_collected: &[bool]) -> u32 {
    let mut max_generation = 0;
    for (index, collected) in generation_collected.iter().enumerate() {
        if *collected {
            max_generation = index as u32;
        }
    }
    max_generation.min(2)
}
