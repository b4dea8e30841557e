//! Need-list generation.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::signature::ChunkSignature;

/// One instruction for rebuilding the source content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NeedListItem {
    /// Bytes already present in the seed at `offset`
    Seed { offset: u64, length: u64 },
    /// Bytes that must come from the source at `offset`
    Source { offset: u64, length: u64 },
}

impl NeedListItem {
    pub fn offset(&self) -> u64 {
        match *self {
            NeedListItem::Seed { offset, .. } | NeedListItem::Source { offset, .. } => offset,
        }
    }

    pub fn length(&self) -> u64 {
        match *self {
            NeedListItem::Seed { length, .. } | NeedListItem::Source { length, .. } => length,
        }
    }

    pub fn is_seed(&self) -> bool {
        matches!(self, NeedListItem::Seed { .. })
    }

    /// Extend `self` by `next` if both are the same kind and contiguous.
    fn try_merge(&mut self, next: &NeedListItem) -> bool {
        if self.is_seed() != next.is_seed() || self.offset() + self.length() != next.offset() {
            return false;
        }
        match self {
            NeedListItem::Seed { length, .. } | NeedListItem::Source { length, .. } => {
                *length += next.length()
            }
        }
        true
    }
}

/// Bytes each origin contributes to a need list.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NeedListSummary {
    pub seed_bytes: u64,
    pub source_bytes: u64,
}

pub fn summarize(need_list: &[NeedListItem]) -> NeedListSummary {
    need_list
        .iter()
        .fold(NeedListSummary::default(), |mut acc, item| {
            match item {
                NeedListItem::Seed { length, .. } => acc.seed_bytes += length,
                NeedListItem::Source { length, .. } => acc.source_bytes += length,
            }
            acc
        })
}

/// Instructions that rebuild the content described by `source` from the
/// content described by `seed` plus source ranges.
///
/// Every source chunk whose (length, digest) also occurs in the seed becomes
/// a `Seed` item, continuing the previous seed match where possible and
/// otherwise pointing at the first such seed chunk; everything else is a
/// `Source` item at the chunk's own offset. Contiguous items of one kind are
/// coalesced, so identical inputs give a single `Seed` item and an empty seed
/// gives a single `Source` item. `Source` offsets are strictly increasing.
pub fn create_need_list(seed: &[ChunkSignature], source: &[ChunkSignature]) -> Vec<NeedListItem> {
    let mut seed_offsets: HashMap<ChunkSignature, u64> = HashMap::with_capacity(seed.len());
    let mut seed_at: HashMap<u64, ChunkSignature> = HashMap::with_capacity(seed.len());
    let mut offset = 0u64;
    for chunk in seed {
        seed_offsets.entry(*chunk).or_insert(offset);
        seed_at.insert(offset, *chunk);
        offset += chunk.length as u64;
    }

    let mut need_list: Vec<NeedListItem> = Vec::new();
    let mut source_offset = 0u64;
    for chunk in source {
        let length = chunk.length as u64;
        // Prefer the seed chunk right after the previous seed match
        let continued = match need_list.last() {
            Some(NeedListItem::Seed { offset, length }) => {
                let next = offset + length;
                (seed_at.get(&next) == Some(chunk)).then_some(next)
            }
            _ => None,
        };
        let item = match continued.or_else(|| seed_offsets.get(chunk).copied()) {
            Some(offset) => NeedListItem::Seed { offset, length },
            None => NeedListItem::Source {
                offset: source_offset,
                length,
            },
        };
        source_offset += length;

        let merged = match need_list.last_mut() {
            Some(last) => last.try_merge(&item),
            None => false,
        };
        if !merged {
            need_list.push(item);
        }
    }
    need_list
}
