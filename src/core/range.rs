//! Chunk range algebra.
//!
//! Pure functions over sets of chunk indices. A merged range list is sorted
//! ascending and no two ranges overlap or touch; every function returning
//! `Vec<ChunkRange>` upholds that.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A single chunk index or an inclusive `[start, end]` span.
///
/// Serialized untagged: `7` or `[3, 9]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChunkRange {
    Single(u32),
    Span(u32, u32),
}

impl ChunkRange {
    fn new(start: u32, end: u32) -> Self {
        if start == end {
            ChunkRange::Single(start)
        } else {
            ChunkRange::Span(start, end)
        }
    }

    pub fn start(&self) -> u32 {
        match *self {
            ChunkRange::Single(i) => i,
            ChunkRange::Span(s, e) => s.min(e),
        }
    }

    /// Inclusive end.
    pub fn end(&self) -> u32 {
        match *self {
            ChunkRange::Single(i) => i,
            ChunkRange::Span(s, e) => s.max(e),
        }
    }

    pub fn len(&self) -> u64 {
        (self.end() - self.start()) as u64 + 1
    }

    pub fn contains(&self, index: u32) -> bool {
        (self.start()..=self.end()).contains(&index)
    }

    pub fn indices(&self) -> impl Iterator<Item = u32> {
        self.start()..=self.end()
    }
}

/// Merge arbitrary indices (any order, duplicates allowed) into compact runs.
pub fn merge_ranges<I>(indices: I) -> Vec<ChunkRange>
where
    I: IntoIterator<Item = u32>,
{
    let sorted: BTreeSet<u32> = indices.into_iter().collect();
    let mut out = Vec::new();
    let mut iter = sorted.into_iter();

    let Some(first) = iter.next() else {
        return out;
    };
    let (mut start, mut end) = (first, first);
    for i in iter {
        if i == end + 1 {
            end = i;
        } else {
            out.push(ChunkRange::new(start, end));
            start = i;
            end = i;
        }
    }
    out.push(ChunkRange::new(start, end));
    out
}

/// Expand ranges back into their indices, sorted and deduplicated.
pub fn parse_ranges(ranges: &[ChunkRange]) -> Vec<u32> {
    let set: BTreeSet<u32> = ranges.iter().flat_map(|r| r.indices()).collect();
    set.into_iter().collect()
}

/// Complement of `excluded` against `[0, total)`, as merged ranges.
///
/// Indices at or beyond `total` are ignored.
pub fn get_sub_ranges<I>(total: u32, excluded: I) -> Vec<ChunkRange>
where
    I: IntoIterator<Item = u32>,
{
    let excluded: BTreeSet<u32> = excluded.into_iter().filter(|&i| i < total).collect();
    let mut out = Vec::new();
    let mut cursor = 0u32;
    for i in excluded {
        if i > cursor {
            out.push(ChunkRange::new(cursor, i - 1));
        }
        cursor = i + 1;
    }
    if cursor < total {
        out.push(ChunkRange::new(cursor, total - 1));
    }
    out
}

/// Number of indices covered by merged `ranges`.
pub fn count_indices(ranges: &[ChunkRange]) -> u64 {
    ranges.iter().map(ChunkRange::len).sum()
}

/// Total byte length covered by merged `ranges` of a file.
///
/// Every chunk counts `chunk_size` bytes except the file's final chunk,
/// which only counts the remainder.
pub fn ranges_byte_len(ranges: &[ChunkRange], file_size: u64, chunk_size: u32) -> u64 {
    if chunk_size == 0 || file_size == 0 {
        return 0;
    }
    let chunk_size = chunk_size as u64;
    let total_chunks = file_size.div_ceil(chunk_size);
    let last = total_chunks - 1;
    let tail = file_size - last * chunk_size;

    ranges
        .iter()
        .map(|r| {
            let start = r.start() as u64;
            let end = (r.end() as u64).min(last);
            if start > end {
                return 0;
            }
            let full = (end - start + 1) * chunk_size;
            if end == last { full - chunk_size + tail } else { full }
        })
        .sum()
}
