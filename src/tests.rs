//! Shared test scaffolding.
use std::{collections::BTreeMap, ops::Range, prelude::v1::*};

/// Tracks the expected state of every address in a managed range,
/// independently of the allocator under test. Allocations that overlap a
/// live allocation, frees of untracked ranges, and similar mishaps all
/// show up as state-transition mismatches.
pub struct ShadowAllocator {
    /// The state starting at the key address, up to the next key. Adjacent
    /// runs always have distinct states.
    regions: BTreeMap<usize, SaRegion>,
}

#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum SaRegion {
    Free,
    Used,
    Invalid,
}

impl ShadowAllocator {
    pub fn new() -> Self {
        Self {
            regions: Some((0, SaRegion::Invalid)).into_iter().collect(),
        }
    }

    /// Start tracking `range` as free space.
    pub fn manage(&mut self, range: Range<usize>) {
        self.convert(range, SaRegion::Invalid, SaRegion::Free);
    }

    pub fn allocate(&mut self, range: Range<usize>) {
        self.convert(range, SaRegion::Free, SaRegion::Used);
    }

    pub fn deallocate(&mut self, range: Range<usize>) {
        self.convert(range, SaRegion::Used, SaRegion::Free);
    }

    pub fn convert(&mut self, range: Range<usize>, from: SaRegion, to: SaRegion) {
        if range.start == range.end {
            return;
        }
        assert_ne!(from, to);
        log::trace!("sa: converting {:#x?} from {:?} to {:?}", range, from, to);

        // The run covering `range.start` must be in the expected state and
        // must reach at least to `range.end`.
        let (_, &state) = self
            .regions
            .range(..=range.start)
            .next_back()
            .expect("address below tracked space");
        assert_eq!(
            state, from,
            "range {:#x?} is {:?} (expected {:?})",
            range, state, from
        );
        if let Some((&boundary, _)) = self.regions.range(range.start + 1..).next() {
            assert!(
                boundary >= range.end,
                "range {:#x?} crosses a state boundary at {:#x}",
                range,
                boundary
            );
        }

        // Close off the tail of the run, then rewrite its head, merging
        // with equal-state neighbours so that every key stays a genuine
        // state change.
        match self.regions.get(&range.end) {
            None => {
                self.regions.insert(range.end, from);
            }
            Some(&next) if next == to => {
                self.regions.remove(&range.end);
            }
            Some(_) => {}
        }
        self.regions.insert(range.start, to);
        if let Some((_, &left)) = self.regions.range(..range.start).next_back() {
            if left == to {
                self.regions.remove(&range.start);
            }
        }
    }
}
