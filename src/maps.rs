//! Maps oracle: given an instruction pointer, find the containing mapping;
//! keep the set sorted and disjoint as `mmap`s arrive.
//!
//! Mappings are stored in a sorted `Vec` inside `Maps` and referenced by
//! index (`MapId`) rather than by pointer, per the "cyclic / back-references"
//! design note: the unwinder's frames carry a `MapId` instead of borrowing a
//! `Mapping` directly, so there is no lifetime tangle between `Maps` and its
//! consumers.

use crate::model::{MapFlags, Mapping, INFINITE_LOAD_BIAS, UPROBES_MAPPING_NAME};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MapId(pub usize);

#[derive(Debug, Default)]
pub struct Maps {
    /// Sorted by `start`, pairwise disjoint after every `add_and_sort` call.
    entries: Vec<Mapping>,
}

impl Maps {
    pub fn new() -> Self {
        Maps::default()
    }

    /// Returns the mapping containing `addr`, if any.
    pub fn find(&self, addr: u64) -> Option<(MapId, &Mapping)> {
        let idx = self
            .entries
            .partition_point(|mapping| mapping.start <= addr);
        if idx == 0 {
            return None;
        }
        let candidate = &self.entries[idx - 1];
        if candidate.contains(addr) {
            Some((MapId(idx - 1), candidate))
        } else {
            None
        }
    }

    pub fn get(&self, id: MapId) -> Option<&Mapping> {
        self.entries.get(id.0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Mapping> {
        self.entries.iter()
    }

    /// Inserts `[start, end)`, splitting or shortening any existing mapping
    /// that overlaps it, mirroring how a later `mmap` replaces part of an
    /// existing `/proc/<pid>/maps` region. `[uprobes]` mappings are always
    /// kept with an infinite load bias and executable flags, regardless of
    /// what the caller passes, so downstream components can recognize probe
    /// trampolines unambiguously.
    #[allow(clippy::too_many_arguments)]
    pub fn add_and_sort(
        &mut self,
        start: u64,
        end: u64,
        page_offset: u64,
        flags: MapFlags,
        name: String,
        load_bias: u64,
    ) -> MapId {
        assert!(start < end, "mapping start must be strictly less than end");

        let (flags, load_bias) = if name == UPROBES_MAPPING_NAME {
            (MapFlags::exec(), INFINITE_LOAD_BIAS)
        } else {
            (flags, load_bias)
        };

        let mut result = Vec::with_capacity(self.entries.len() + 1);
        for existing in self.entries.drain(..) {
            if existing.end <= start || existing.start >= end {
                // No overlap at all; keep as-is.
                result.push(existing);
                continue;
            }
            if existing.start < start {
                // Straddles the new region's start: shorten its end.
                let mut left = existing.clone();
                left.end = start;
                result.push(left);
            }
            if existing.end > end {
                // Straddles the new region's end: advance its start and
                // bump the page offset by the amount trimmed off the front.
                let mut right = existing;
                let trimmed = end - right.start;
                right.start = end;
                right.page_offset += trimmed;
                result.push(right);
            }
            // Otherwise the existing entry is fully covered by the new one
            // and is dropped.
        }

        let new_mapping = Mapping {
            start,
            end,
            page_offset,
            flags,
            name,
            load_bias,
        };
        let insert_at = result.partition_point(|m| m.start < new_mapping.start);
        result.insert(insert_at, new_mapping);
        self.entries = result;

        MapId(insert_at)
    }

    /// Discards every mapping. Used when a process exits or a sample-source
    /// is reset for reuse with a different pid.
    pub fn reset(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags_rw() -> MapFlags {
        MapFlags {
            read: true,
            write: true,
            exec: false,
        }
    }

    fn flags_rx() -> MapFlags {
        MapFlags {
            read: true,
            write: false,
            exec: true,
        }
    }

    fn names(maps: &Maps) -> Vec<&str> {
        maps.iter().map(|m| m.name.as_str()).collect()
    }

    #[test]
    fn add_over_existing_splits_both_ends() {
        // A mapping straddling both ends of an existing one truncates the
        // existing entry from both sides instead of just one.
        let mut maps = Maps::new();
        maps.add_and_sort(0x101000, 0x104000, 0x1000, flags_rx(), "a".into(), 0);
        maps.add_and_sort(0x102000, 0x103000, 0x7000, flags_rw(), "b".into(), 0);

        let entries: Vec<_> = maps.iter().cloned().collect();
        assert_eq!(entries.len(), 3);

        assert_eq!(entries[0].start, 0x101000);
        assert_eq!(entries[0].end, 0x102000);
        assert_eq!(entries[0].page_offset, 0x1000);
        assert_eq!(entries[0].name, "a");

        assert_eq!(entries[1].start, 0x102000);
        assert_eq!(entries[1].end, 0x103000);
        assert_eq!(entries[1].page_offset, 0x7000);
        assert_eq!(entries[1].name, "b");

        assert_eq!(entries[2].start, 0x103000);
        assert_eq!(entries[2].end, 0x104000);
        assert_eq!(entries[2].page_offset, 0x3000);
        assert_eq!(entries[2].name, "a");
    }

    #[test]
    fn fully_covered_entry_is_removed() {
        let mut maps = Maps::new();
        maps.add_and_sort(0x1000, 0x2000, 0, flags_rw(), "old".into(), 0);
        maps.add_and_sort(0x500, 0x3000, 0, flags_rw(), "new".into(), 0);

        assert_eq!(names(&maps), vec!["new"]);
    }

    #[test]
    fn find_returns_none_outside_all_mappings() {
        let mut maps = Maps::new();
        maps.add_and_sort(0x1000, 0x2000, 0, flags_rw(), "a".into(), 0);
        assert!(maps.find(0x500).is_none());
        assert!(maps.find(0x2000).is_none());
        assert!(maps.find(0x1800).is_some());
    }

    #[test]
    fn uprobes_mapping_forced_to_infinite_bias_and_exec() {
        let mut maps = Maps::new();
        maps.add_and_sort(
            0x7fff_ffff_e000,
            0x7fff_ffff_f000,
            0,
            MapFlags::NONE,
            UPROBES_MAPPING_NAME.into(),
            123,
        );
        let (_, mapping) = maps.find(0x7fff_ffff_e500).unwrap();
        assert_eq!(mapping.load_bias, INFINITE_LOAD_BIAS);
        assert!(mapping.flags.exec);
    }

    #[test]
    #[should_panic]
    fn rejects_nonsensical_range() {
        let mut maps = Maps::new();
        maps.add_and_sort(0x2000, 0x1000, 0, flags_rw(), "bad".into(), 0);
    }

    #[test]
    fn disjoint_and_sorted_invariant_holds_after_many_inserts() {
        let mut maps = Maps::new();
        maps.add_and_sort(0, 100, 0, flags_rw(), "a".into(), 0);
        maps.add_and_sort(200, 300, 0, flags_rw(), "b".into(), 0);
        maps.add_and_sort(50, 250, 0, flags_rw(), "c".into(), 0);

        let entries: Vec<_> = maps.iter().cloned().collect();
        for pair in entries.windows(2) {
            assert!(pair[0].end <= pair[1].start);
        }
        assert_eq!(entries.first().unwrap().start, 0);
        assert_eq!(entries.last().unwrap().end, 300);
    }
}
