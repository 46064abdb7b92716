use crate::block::Block;
use crate::id::ID;
use crate::store::StructStore;
use codec::{Read, Result as CodecResult, Write};
use std::collections::HashMap;

/// Map from `client` to a set of `(clock, length)` tombstone ranges. Built
/// transiently during a transaction (spec.md §4.3) - ranges are pushed
/// unsorted as items are deleted, then coalesced once by
/// [`DeleteSet::sort_and_merge`] before the set is inspected or encoded.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeleteSet {
    clients: HashMap<u64, Vec<(u32, u32)>>,
}

impl DeleteSet {
    pub fn new() -> Self {
        DeleteSet {
            clients: HashMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.clients.values().all(|v| v.is_empty())
    }

    pub fn add(&mut self, id: ID, len: u32) {
        if len == 0 {
            return;
        }
        self.clients
            .entry(id.client)
            .or_default()
            .push((id.clock, len));
    }

    /// Sorts each client's ranges by clock and coalesces `[a, b)` followed by
    /// `[b, c)` into `[a, c)`. Afterwards ranges are strictly increasing with
    /// no adjacency (spec.md §8 invariant 7).
    pub fn sort_and_merge(&mut self) {
        for ranges in self.clients.values_mut() {
            ranges.sort_by_key(|(clock, _)| *clock);
            let mut merged: Vec<(u32, u32)> = Vec::with_capacity(ranges.len());
            for &(clock, len) in ranges.iter() {
                if let Some(last) = merged.last_mut() {
                    if last.0 + last.1 >= clock {
                        let new_end = (last.0 + last.1).max(clock + len);
                        last.1 = new_end - last.0;
                        continue;
                    }
                }
                merged.push((clock, len));
            }
            *ranges = merged;
        }
    }

    /// Binary search over a (sorted+merged) client's ranges.
    pub fn is_deleted(&self, id: ID) -> bool {
        let ranges = match self.clients.get(&id.client) {
            Some(r) => r,
            None => return false,
        };
        let mut lo = 0usize;
        let mut hi = ranges.len();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let (clock, len) = ranges[mid];
            if clock <= id.clock && id.clock < clock + len {
                return true;
            } else if clock <= id.clock {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        false
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &[(u32, u32)])> {
        self.clients.iter().map(|(&c, v)| (c, v.as_slice()))
    }

    /// For each range, locate the first struct via the store's binary search
    /// and walk forward while `clock < range end`, invoking `f` on each
    /// struct touched. Precondition: `self` has not been merged with
    /// neighbors that belong to a different logical pass (spec.md §4.3).
    pub fn iterate_deleted_structs<'s>(&self, store: &'s StructStore, mut f: impl FnMut(&'s Block)) {
        for (client, ranges) in self.iter() {
            let blocks = match store.client_blocks(client) {
                Some(b) => b,
                None => continue,
            };
            for &(clock, len) in ranges {
                let end = clock + len;
                if let Some(mut idx) = store.find_pivot(client, clock) {
                    while idx < blocks.len() && blocks[idx].id().clock < end {
                        f(&blocks[idx]);
                        idx += 1;
                    }
                }
            }
        }
    }

    /// Scans each client's array and coalesces runs of deleted structs
    /// (tombstoned Items and GC blocks alike) into ranges.
    pub fn create_from_struct_store(store: &StructStore) -> Self {
        let mut ds = DeleteSet::new();
        for &client in store.clients() {
            let blocks = store.client_blocks(client).unwrap();
            let mut i = 0;
            while i < blocks.len() {
                if blocks[i].is_deleted() {
                    let start = blocks[i].id().clock;
                    let mut end = blocks[i].clock_end();
                    let mut j = i + 1;
                    while j < blocks.len() && blocks[j].is_deleted() {
                        end = blocks[j].clock_end();
                        j += 1;
                    }
                    ds.add(ID::new(client, start), end - start);
                    i = j;
                } else {
                    i += 1;
                }
            }
        }
        ds
    }

    /// Merges `other`'s ranges into `self` (unsorted append - call
    /// `sort_and_merge` again afterwards).
    pub fn merge(&mut self, other: DeleteSet) {
        for (client, ranges) in other.clients {
            self.clients.entry(client).or_default().extend(ranges);
        }
    }

    pub fn encode<W: Write>(&self, w: &mut W) {
        w.write_var_u64(self.clients.len() as u64);
        for (&client, ranges) in &self.clients {
            w.write_var_u64(client);
            w.write_var_u64(ranges.len() as u64);
            for &(clock, len) in ranges {
                w.write_var_u32(clock);
                w.write_var_u32(len);
            }
        }
    }

    pub fn decode<'a, R: Read<'a>>(r: &mut R) -> CodecResult<Self> {
        let num_clients = r.read_var_u64()?;
        let mut clients = HashMap::with_capacity(num_clients as usize);
        for _ in 0..num_clients {
            let client = r.read_var_u64()?;
            let num_ranges = r.read_var_u64()?;
            let mut ranges = Vec::with_capacity(num_ranges as usize);
            for _ in 0..num_ranges {
                let clock = r.read_var_u32()?;
                let len = r.read_var_u32()?;
                ranges.push((clock, len));
            }
            clients.insert(client, ranges);
        }
        Ok(DeleteSet { clients })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codec::{DecoderV1, EncoderV1};

    #[test]
    fn sort_and_merge_coalesces_adjacent_ranges() {
        let mut ds = DeleteSet::new();
        ds.add(ID::new(1, 5), 3); // [5,8)
        ds.add(ID::new(1, 8), 2); // [8,10) adjacent
        ds.add(ID::new(1, 20), 1); // disjoint
        ds.sort_and_merge();
        let ranges: Vec<_> = ds.iter().find(|(c, _)| *c == 1).unwrap().1.to_vec();
        assert_eq!(ranges, vec![(5, 5), (20, 1)]);
    }

    #[test]
    fn sort_and_merge_coalesces_overlapping_ranges() {
        let mut ds = DeleteSet::new();
        ds.add(ID::new(1, 0), 5); // [0,5)
        ds.add(ID::new(1, 3), 5); // [3,8) overlaps
        ds.sort_and_merge();
        let ranges: Vec<_> = ds.iter().find(|(c, _)| *c == 1).unwrap().1.to_vec();
        assert_eq!(ranges, vec![(0, 8)]);
    }

    #[test]
    fn is_deleted_binary_searches_merged_ranges() {
        let mut ds = DeleteSet::new();
        ds.add(ID::new(1, 5), 3);
        ds.add(ID::new(1, 20), 2);
        ds.sort_and_merge();
        assert!(ds.is_deleted(ID::new(1, 5)));
        assert!(ds.is_deleted(ID::new(1, 7)));
        assert!(!ds.is_deleted(ID::new(1, 8)));
        assert!(ds.is_deleted(ID::new(1, 21)));
        assert!(!ds.is_deleted(ID::new(2, 5)));
    }

    #[test]
    fn roundtrip_encoding() {
        let mut ds = DeleteSet::new();
        ds.add(ID::new(1, 0), 3);
        ds.add(ID::new(2, 10), 5);
        ds.sort_and_merge();
        let mut enc = EncoderV1::new();
        ds.encode(&mut enc);
        let bytes = enc.to_vec();
        let mut dec = DecoderV1::new(&bytes);
        let decoded = DeleteSet::decode(&mut dec).unwrap();
        assert_eq!(decoded, ds);
    }
}
