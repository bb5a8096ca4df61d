// Copyright 2022 The Arbor Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! An ordered map keyed by disjoint integer intervals.
//!
//! Used for cross-field move tracking and for allocating contiguous
//! detached-root id ranges without materializing one entry per cell.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid range: length must be positive (got {length})")]
pub struct InvalidRangeError {
    pub length: u64,
}

/// Longest uniform prefix of a queried interval.
#[derive(Debug, PartialEq, Eq)]
pub struct RangeQueryResult<'a, V> {
    pub start: u64,
    pub length: u64,
    /// `None` when the prefix is not covered by any entry.
    pub value: Option<&'a V>,
}

#[derive(PartialEq, Eq, Clone, Debug, Serialize, Deserialize)]
struct RangeEntry<V> {
    length: u64,
    value: V,
}

/// Map from disjoint `[start, start + length)` intervals to values.
///
/// Later writes fully replace earlier values on the overlap; non-overlapping
/// portions of an earlier entry survive, possibly split in two.
#[derive(PartialEq, Eq, Clone, Debug, Serialize, Deserialize)]
pub struct RangeMap<V> {
    entries: BTreeMap<u64, RangeEntry<V>>,
}

impl<V> Default for RangeMap<V> {
    fn default() -> Self {
        RangeMap {
            entries: BTreeMap::new(),
        }
    }
}

impl<V: Clone> RangeMap<V> {
    pub fn new() -> Self {
        RangeMap::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Associates `[start, start + length)` with `value`.
    pub fn set(&mut self, start: u64, length: u64, value: V) -> Result<(), InvalidRangeError> {
        self.clear_range(start, length)?;
        self.entries.insert(start, RangeEntry { length, value });
        Ok(())
    }

    /// Removes any association on `[start, start + length)`, splitting
    /// entries that straddle a boundary.
    pub fn delete(&mut self, start: u64, length: u64) -> Result<(), InvalidRangeError> {
        self.clear_range(start, length)
    }

    /// Returns the longest prefix of `[start, start + length)` over which the
    /// association is uniform. The prefix either lies entirely inside one
    /// entry or entirely in a gap.
    pub fn get_first(&self, start: u64, length: u64) -> Result<RangeQueryResult<V>, InvalidRangeError> {
        if length == 0 {
            return Err(InvalidRangeError { length });
        }
        let end = start + length;
        // The entry at or before `start` may cover it.
        if let Some((&entry_start, entry)) = self.entries.range(..=start).next_back() {
            let entry_end = entry_start + entry.length;
            if entry_end > start {
                return Ok(RangeQueryResult {
                    start,
                    length: entry_end.min(end) - start,
                    value: Some(&entry.value),
                });
            }
        }
        // Otherwise the prefix is a gap reaching to the next entry.
        let gap_end = self
            .entries
            .range(start..end)
            .next()
            .map_or(end, |(&next_start, _)| next_start);
        Ok(RangeQueryResult {
            start,
            length: gap_end - start,
            value: None,
        })
    }

    /// Iterates all `(start, length, value)` entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, u64, &V)> {
        self.entries
            .iter()
            .map(|(&start, entry)| (start, entry.length, &entry.value))
    }

    fn clear_range(&mut self, start: u64, length: u64) -> Result<(), InvalidRangeError> {
        if length == 0 {
            return Err(InvalidRangeError { length });
        }
        let end = start + length;
        // Split an entry that begins before `start` and reaches into the range.
        if let Some((&entry_start, entry)) = self.entries.range_mut(..start).next_back() {
            let entry_end = entry_start + entry.length;
            if entry_end > start {
                entry.length = start - entry_start;
                if entry_end > end {
                    let tail_value = entry.value.clone();
                    self.entries.insert(
                        end,
                        RangeEntry {
                            length: entry_end - end,
                            value: tail_value,
                        },
                    );
                }
            }
        }
        // Remove or truncate entries beginning inside the range.
        let contained: Vec<u64> = self.entries.range(start..end).map(|(&s, _)| s).collect();
        for entry_start in contained {
            let entry = self.entries.remove(&entry_start).unwrap();
            let entry_end = entry_start + entry.length;
            if entry_end > end {
                self.entries.insert(
                    end,
                    RangeEntry {
                        length: entry_end - end,
                        value: entry.value,
                    },
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(map: &RangeMap<char>) -> Vec<(u64, u64, char)> {
        map.iter().map(|(s, l, v)| (s, l, *v)).collect()
    }

    #[test]
    fn test_set_and_get_first() {
        let mut map = RangeMap::new();
        map.set(2, 3, 'a').unwrap();
        let result = map.get_first(2, 3).unwrap();
        assert_eq!(result.length, 3);
        assert_eq!(result.value, Some(&'a'));
    }

    #[test]
    fn test_get_first_gap_before_entry() {
        let mut map = RangeMap::new();
        map.set(5, 2, 'a').unwrap();
        let result = map.get_first(0, 10).unwrap();
        assert_eq!((result.start, result.length, result.value), (0, 5, None));
    }

    #[test]
    fn test_get_first_stops_at_entry_end() {
        let mut map = RangeMap::new();
        map.set(0, 4, 'a').unwrap();
        map.set(4, 4, 'b').unwrap();
        let result = map.get_first(2, 5).unwrap();
        assert_eq!((result.start, result.length, result.value), (2, 2, Some(&'a')));
    }

    #[test]
    fn test_overlapping_set_splits_earlier_entry() {
        let mut map = RangeMap::new();
        map.set(0, 10, 'a').unwrap();
        map.set(3, 4, 'b').unwrap();
        assert_eq!(collect(&map), vec![(0, 3, 'a'), (3, 4, 'b'), (7, 3, 'a')]);
    }

    #[test]
    fn test_set_replaces_fully_covered_entries() {
        let mut map = RangeMap::new();
        map.set(1, 2, 'a').unwrap();
        map.set(4, 2, 'b').unwrap();
        map.set(0, 10, 'c').unwrap();
        assert_eq!(collect(&map), vec![(0, 10, 'c')]);
    }

    #[test]
    fn test_delete_splits_at_boundaries() {
        let mut map = RangeMap::new();
        map.set(0, 10, 'a').unwrap();
        map.delete(4, 2).unwrap();
        assert_eq!(collect(&map), vec![(0, 4, 'a'), (6, 4, 'a')]);
        let result = map.get_first(4, 2).unwrap();
        assert_eq!(result.value, None);
        assert_eq!(result.length, 2);
    }

    #[test]
    fn test_zero_length_is_rejected() {
        let mut map: RangeMap<char> = RangeMap::new();
        assert_eq!(map.set(0, 0, 'a'), Err(InvalidRangeError { length: 0 }));
        assert_eq!(map.delete(0, 0), Err(InvalidRangeError { length: 0 }));
        assert!(map.get_first(0, 0).is_err());
    }
}
