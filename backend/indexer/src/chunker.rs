//! Block range partitioning for bounded `eth_getLogs` queries.
//!
//! Providers reject log queries spanning too many blocks, so a historical
//! range is walked as a sequence of closed sub-ranges no wider than the
//! configured chunk width.

use std::fmt;
use std::iter::FusedIterator;
use std::num::NonZeroU64;

/// A closed block interval `[from, to]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRange {
    pub from: u64,
    pub to: u64,
}

impl BlockRange {
    /// Number of blocks covered, inclusive of both ends.
    pub fn width(&self) -> u64 {
        self.to - self.from + 1
    }
}

impl fmt::Display for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.from, self.to)
    }
}

/// Partition of `[from, latest]` into chunks of at most `width` blocks.
///
/// The plan is a plain value: every call to [`ChunkPlan::chunks`] starts a
/// fresh walk from the beginning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    from: u64,
    latest: u64,
    width: NonZeroU64,
}

impl ChunkPlan {
    pub fn new(from: u64, latest: u64, width: NonZeroU64) -> Self {
        Self {
            from,
            latest,
            width,
        }
    }

    /// `true` when `from > latest`; such a plan yields nothing.
    pub fn is_empty(&self) -> bool {
        self.from > self.latest
    }

    pub fn chunks(&self) -> Chunks {
        Chunks {
            next: (!self.is_empty()).then_some(self.from),
            latest: self.latest,
            span: self.width.get() - 1,
        }
    }
}

impl IntoIterator for &ChunkPlan {
    type Item = BlockRange;
    type IntoIter = Chunks;

    fn into_iter(self) -> Chunks {
        self.chunks()
    }
}

/// Lazy iterator over the ranges of a [`ChunkPlan`].
#[derive(Debug, Clone)]
pub struct Chunks {
    next: Option<u64>,
    latest: u64,
    // width - 1, so the end never overflows for ranges touching u64::MAX
    span: u64,
}

impl Iterator for Chunks {
    type Item = BlockRange;

    fn next(&mut self) -> Option<BlockRange> {
        let from = self.next?;
        let to = from.saturating_add(self.span).min(self.latest);
        self.next = if to == self.latest { None } else { Some(to + 1) };
        Some(BlockRange { from, to })
    }
}

impl FusedIterator for Chunks {}

#[cfg(test)]
mod tests {
    use super::*;

    fn width(w: u64) -> NonZeroU64 {
        NonZeroU64::new(w).unwrap()
    }

    fn collect(from: u64, latest: u64, w: u64) -> Vec<BlockRange> {
        ChunkPlan::new(from, latest, width(w)).chunks().collect()
    }

    #[test]
    fn single_block_range() {
        assert_eq!(
            collect(42, 42, 500),
            vec![BlockRange { from: 42, to: 42 }]
        );
    }

    #[test]
    fn exact_multiple_of_width() {
        assert_eq!(
            collect(100, 109, 5),
            vec![
                BlockRange { from: 100, to: 104 },
                BlockRange { from: 105, to: 109 },
            ]
        );
    }

    #[test]
    fn trailing_partial_chunk_ends_at_latest() {
        let chunks = collect(0, 10, 4);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2], BlockRange { from: 8, to: 10 });
    }

    #[test]
    fn width_one_yields_every_block() {
        let chunks = collect(7, 11, 1);
        let starts: Vec<u64> = chunks.iter().map(|r| r.from).collect();
        assert_eq!(starts, vec![7, 8, 9, 10, 11]);
        assert!(chunks.iter().all(|r| r.width() == 1));
    }

    #[test]
    fn inverted_plan_is_empty() {
        let plan = ChunkPlan::new(10, 9, width(5));
        assert!(plan.is_empty());
        assert_eq!(plan.chunks().count(), 0);
    }

    #[test]
    fn range_touching_u64_max_does_not_overflow() {
        let chunks = collect(u64::MAX - 5, u64::MAX, 4);
        assert_eq!(
            chunks,
            vec![
                BlockRange { from: u64::MAX - 5, to: u64::MAX - 2 },
                BlockRange { from: u64::MAX - 1, to: u64::MAX },
            ]
        );
    }

    #[test]
    fn plan_can_be_walked_again() {
        let plan = ChunkPlan::new(0, 1_000, width(499));
        let first: Vec<_> = plan.chunks().collect();
        let second: Vec<_> = (&plan).into_iter().collect();
        assert_eq!(first, second);
    }

    #[test]
    fn chunks_are_contiguous_bounded_and_cover_the_range() {
        for from in [0u64, 1, 3, 177_204_599] {
            for len in 0u64..40 {
                for w in 1u64..12 {
                    let latest = from + len;
                    let chunks = collect(from, latest, w);

                    assert_eq!(chunks.first().map(|r| r.from), Some(from));
                    assert_eq!(chunks.last().map(|r| r.to), Some(latest));
                    for r in &chunks {
                        assert!(r.from <= r.to);
                        assert!(r.width() <= w, "{r} wider than {w}");
                    }
                    for pair in chunks.windows(2) {
                        assert_eq!(pair[1].from, pair[0].to + 1);
                    }
                    let covered: u64 = chunks.iter().map(BlockRange::width).sum();
                    assert_eq!(covered, len + 1);
                }
            }
        }
    }
}
