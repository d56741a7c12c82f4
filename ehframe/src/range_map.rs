// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! A map keyed by half-open address ranges.
//!
//! Unwind rows, function symbols and loaded-module extents all want the same
//! query: "which entry, if any, covers this address?" [`RangeMap`] answers it
//! in O(log n) over a sorted `Vec`, with no knowledge of what the payload is.

use std::cmp::Ordering;

/// A half-open `[start, end)` address range.
pub type Range = (u64, u64);

type Entry<T> = (Range, T);

/// Why an insert was refused.
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RangeError {
    /// `start >= end`; the range covers no addresses.
    #[error("empty address range")]
    Empty,
    /// The range intersects an entry already in the map.
    #[error("address range overlaps an existing entry")]
    Overlap,
}

/// A sorted map from disjoint half-open address ranges to values.
#[derive(Clone, Debug)]
pub struct RangeMap<T> {
    entries: Vec<Entry<T>>,
}

fn compare_address_to_entry<T>(addr: u64, entry: &Entry<T>) -> Ordering {
    let ((start, end), _) = *entry;
    if start <= addr && end > addr {
        Ordering::Equal
    } else if start > addr {
        Ordering::Greater
    } else {
        Ordering::Less
    }
}

impl<T> RangeMap<T> {
    pub fn new() -> RangeMap<T> {
        RangeMap {
            entries: Vec::new(),
        }
    }

    /// Insert `value` covering `[start, end)`.
    ///
    /// Overlap with an existing entry is a caller error, reported rather
    /// than resolved: nothing is merged, truncated or replaced.
    pub fn insert(&mut self, (start, end): Range, value: T) -> Result<(), RangeError> {
        if start >= end {
            return Err(RangeError::Empty);
        }
        match self
            .entries
            .binary_search_by(|entry| compare_address_to_entry(start, entry))
        {
            Ok(_) => Err(RangeError::Overlap),
            Err(index) => {
                // start clears the predecessor; the new range must also end
                // on or before the successor's start.
                if let Some(&((next_start, _), _)) = self.entries.get(index) {
                    if end > next_start {
                        return Err(RangeError::Overlap);
                    }
                }
                self.entries.insert(index, ((start, end), value));
                Ok(())
            }
        }
    }

    /// The value whose range covers `addr`, if any.
    pub fn lookup(&self, addr: u64) -> Option<&T> {
        self.entries
            .binary_search_by(|entry| compare_address_to_entry(addr, entry))
            .ok()
            .map(|index| &self.entries[index].1)
    }

    /// The `(range, value)` pair covering `addr`, if any.
    pub fn lookup_entry(&self, addr: u64) -> Option<(Range, &T)> {
        self.entries
            .binary_search_by(|entry| compare_address_to_entry(addr, entry))
            .ok()
            .map(|index| {
                let (range, ref value) = self.entries[index];
                (range, value)
            })
    }

    /// Entries in ascending address order.
    pub fn iter(&self) -> impl Iterator<Item = (Range, &T)> {
        self.entries.iter().map(|(range, value)| (*range, value))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> Default for RangeMap<T> {
    fn default() -> RangeMap<T> {
        RangeMap::new()
    }
}
