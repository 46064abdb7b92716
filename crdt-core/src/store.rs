use crate::block::{Block, GcBlock};
use crate::error::{Error, Result};
use crate::id::ID;
use crate::state_vector::StateVector;
use std::collections::HashMap;

/// Per-client sorted, contiguous arrays of structs. The sole owner of every
/// [`Block`] in a document: shared types only ever hold IDs back into here.
///
/// Invariant (checked by [`StructStore::integrity_check`]): for every client,
/// `blocks[i].id().clock + blocks[i].len() == blocks[i + 1].id().clock`, and
/// the first block (if any) starts at clock 0.
#[derive(Debug, Default)]
pub struct StructStore {
    clients: HashMap<u64, Vec<Block>>,
}

impl StructStore {
    pub fn new() -> Self {
        StructStore {
            clients: HashMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.clients.values().all(|v| v.is_empty())
    }

    pub fn clients(&self) -> impl Iterator<Item = &u64> {
        self.clients.keys()
    }

    pub fn client_blocks(&self, client: u64) -> Option<&[Block]> {
        self.clients.get(&client).map(|v| v.as_slice())
    }

    pub fn client_blocks_mut(&mut self, client: u64) -> &mut Vec<Block> {
        self.clients.entry(client).or_default()
    }

    /// Appends `block` to its client's array. Fails if it does not start
    /// exactly at `last.clock + last.len` (a gap or an overlap).
    pub fn add_struct(&mut self, block: Block) -> Result<()> {
        let id = block.id();
        let vec = self.clients.entry(id.client).or_default();
        let expected = vec.last().map(|b| b.clock_end()).unwrap_or(0);
        if id.clock != expected {
            return Err(Error::Contiguity {
                client: id.client,
                expected,
                actual: id.clock,
            });
        }
        vec.push(block);
        Ok(())
    }

    /// Binary search within one client's array for the struct whose interval
    /// `[clock, clock+len)` contains `clock`.
    pub fn find_pivot(&self, client: u64, clock: u32) -> Option<usize> {
        let blocks = self.clients.get(&client)?;
        let mut lo = 0usize;
        let mut hi = blocks.len();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let b = &blocks[mid];
            let mid_clock = b.id().clock;
            if mid_clock <= clock && clock < mid_clock + b.len() {
                return Some(mid);
            } else if mid_clock <= clock {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        None
    }

    pub fn find(&self, id: ID) -> Option<&Block> {
        let idx = self.find_pivot(id.client, id.clock)?;
        self.clients.get(&id.client).map(|v| &v[idx])
    }

    pub fn find_mut(&mut self, id: ID) -> Option<&mut Block> {
        let idx = self.find_pivot(id.client, id.clock)?;
        self.clients.get_mut(&id.client).map(|v| &mut v[idx])
    }

    /// Returns the struct beginning exactly at `id.clock`, splitting the
    /// block that currently contains it if necessary. Never splits a GC
    /// block - GC content carries no linked-list position worth preserving
    /// at sub-range granularity, so it is returned as-is.
    pub fn get_item_clean_start(&mut self, id: ID) -> Result<usize> {
        let idx = self
            .find_pivot(id.client, id.clock)
            .ok_or(Error::UnknownId(id))?;
        let blocks = self.clients.get_mut(&id.client).unwrap();
        let diff = id.clock - blocks[idx].id().clock;
        if diff > 0 {
            if let Block::Item(_) = &blocks[idx] {
                let right = blocks[idx].split_at(diff);
                blocks.insert(idx + 1, right);
                return Ok(idx + 1);
            }
        }
        Ok(idx)
    }

    /// Returns the struct ending exactly at `id.clock + 1`, splitting if
    /// necessary. Never splits a GC block (see [`Self::get_item_clean_start`]).
    pub fn get_item_clean_end(&mut self, id: ID) -> Result<usize> {
        let idx = self
            .find_pivot(id.client, id.clock)
            .ok_or(Error::UnknownId(id))?;
        let blocks = self.clients.get_mut(&id.client).unwrap();
        let b = &blocks[idx];
        let diff = id.clock + 1 - b.id().clock;
        if diff < b.len() {
            if let Block::Item(_) = &blocks[idx] {
                let right = blocks[idx].split_at(diff);
                blocks.insert(idx + 1, right);
            }
        }
        Ok(idx)
    }

    /// Positional replacement of the block at `id`'s clock, preserving the
    /// contiguity invariant (the replacement must cover the same interval).
    pub fn replace_struct(&mut self, old_id: ID, new_block: Block) -> Result<()> {
        let idx = self
            .find_pivot(old_id.client, old_id.clock)
            .ok_or(Error::UnknownId(old_id))?;
        let blocks = self.clients.get_mut(&old_id.client).unwrap();
        debug_assert_eq!(blocks[idx].id(), new_block.id());
        debug_assert_eq!(blocks[idx].len(), new_block.len());
        blocks[idx] = new_block;
        Ok(())
    }

    /// Splices out the block at index `idx + 1` after merging it leftward
    /// into `idx`; caller must already have checked `mergeWith` compatibility
    /// and performed the merge via [`Block::merge_with`].
    pub fn remove_at(&mut self, client: u64, idx: usize) -> Block {
        self.clients.get_mut(&client).unwrap().remove(idx)
    }

    pub fn get_state(&self, client: u64) -> u32 {
        self.clients
            .get(&client)
            .and_then(|v| v.last())
            .map(|b| b.clock_end())
            .unwrap_or(0)
    }

    pub fn get_state_vector(&self) -> StateVector {
        self.clients
            .iter()
            .map(|(&client, blocks)| {
                let clock = blocks.last().map(|b| b.clock_end()).unwrap_or(0);
                (client, clock)
            })
            .collect()
    }

    /// Verifies per-client contiguity and monotonicity. Intended for tests
    /// and debug assertions, not the steady-state hot path.
    pub fn integrity_check(&self) -> Result<()> {
        for (&client, blocks) in &self.clients {
            let mut expected = 0u32;
            for b in blocks {
                if b.id().clock != expected {
                    return Err(Error::Contiguity {
                        client,
                        expected,
                        actual: b.id().clock,
                    });
                }
                expected = b.clock_end();
            }
        }
        Ok(())
    }

    /// Replaces the item at `id` with a content-less [`GcBlock`] covering the
    /// same interval, dropping its linked-list cell entirely. Used by the
    /// garbage-collection pass once an item's parent is also gone.
    pub fn gc(&mut self, id: ID) -> Result<()> {
        let idx = self
            .find_pivot(id.client, id.clock)
            .ok_or(Error::UnknownId(id))?;
        let blocks = self.clients.get_mut(&id.client).unwrap();
        let len = blocks[idx].len();
        blocks[idx] = Block::Gc(GcBlock { id, len });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{Item, ItemContent, ParentRef};
    use std::rc::Rc;

    fn item(client: u64, clock: u32, len: u32) -> Block {
        let units: smallvec::SmallVec<[u16; 16]> = "x".repeat(len as usize).encode_utf16().collect();
        Block::Item(Item {
            id: ID::new(client, clock),
            left: None,
            right: None,
            origin: None,
            right_origin: None,
            parent: ParentRef::Root(Rc::from("r")),
            parent_sub: None,
            deleted: false,
            content: ItemContent::String(units),
        })
    }

    #[test]
    fn add_struct_rejects_gaps() {
        let mut store = StructStore::new();
        store.add_struct(item(1, 0, 3)).unwrap();
        let err = store.add_struct(item(1, 5, 2)).unwrap_err();
        assert_eq!(
            err,
            Error::Contiguity {
                client: 1,
                expected: 3,
                actual: 5
            }
        );
    }

    #[test]
    fn binary_search_resolves_half_open_ranges() {
        let mut store = StructStore::new();
        store.add_struct(item(1, 0, 3)).unwrap();
        store.add_struct(item(1, 3, 4)).unwrap();
        store.add_struct(item(1, 7, 1)).unwrap();
        assert_eq!(store.find_pivot(1, 0), Some(0));
        assert_eq!(store.find_pivot(1, 2), Some(0));
        assert_eq!(store.find_pivot(1, 3), Some(1));
        assert_eq!(store.find_pivot(1, 6), Some(1));
        assert_eq!(store.find_pivot(1, 7), Some(2));
        assert_eq!(store.find_pivot(1, 8), None);
    }

    #[test]
    fn clean_start_splits_and_preserves_contiguity() {
        let mut store = StructStore::new();
        store.add_struct(item(1, 0, 6)).unwrap();
        let idx = store.get_item_clean_start(ID::new(1, 3)).unwrap();
        assert_eq!(idx, 1);
        let blocks = store.client_blocks(1).unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].id(), ID::new(1, 0));
        assert_eq!(blocks[0].len(), 3);
        assert_eq!(blocks[1].id(), ID::new(1, 3));
        assert_eq!(blocks[1].len(), 3);
        store.integrity_check().unwrap();
    }

    #[test]
    fn clean_start_is_noop_when_already_aligned() {
        let mut store = StructStore::new();
        store.add_struct(item(1, 0, 6)).unwrap();
        let idx = store.get_item_clean_start(ID::new(1, 0)).unwrap();
        assert_eq!(idx, 0);
        assert_eq!(store.client_blocks(1).unwrap().len(), 1);
    }

    #[test]
    fn unknown_id_is_reported_not_panicked() {
        let store = StructStore::new();
        assert_eq!(store.find(ID::new(1, 0)), None);
    }
}
