use crate::block::{Block, GcBlock, Item, ItemContent, ParentRef, Value};
use crate::doc::Doc;
use crate::error::{Error, Result};
use crate::id::ID;
use crate::id_set::DeleteSet;
use crate::state_vector::StateVector;
use crate::transaction::TransactionState;
use codec::{DecoderV1, EncoderV1, Read, Write};
use std::rc::Rc;

/// A decoded-but-not-yet-integrated update: the struct section and the
/// delete-set section (spec.md §4.6).
pub struct Update {
    pub structs: Vec<Item>,
    pub delete_set: DeleteSet,
}

/// An update some of whose structs could not be integrated because their
/// `origin`/`right_origin`/parent dependencies haven't arrived yet. Parked
/// verbatim rather than rejected (spec.md §7); `missing` records, per
/// client, the clock still being waited on, so a later update can cheaply
/// check whether it has unblocked anything.
#[derive(Debug, Default, Clone)]
pub struct PendingUpdate {
    pub missing: StateVector,
    pub structs: Vec<Item>,
}

const TAG_ITEM: u8 = 0;
const TAG_GC: u8 = 1;

const CONTENT_STRING: u8 = 0;
const CONTENT_ANY: u8 = 1;
const CONTENT_TYPE: u8 = 2;
const CONTENT_DELETED: u8 = 3;

const PARENT_ROOT: u8 = 0;
const PARENT_NESTED: u8 = 1;

impl Update {
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut dec = DecoderV1::new(bytes);
        let num_clients = dec.read_var_u64()?;
        let mut structs = Vec::new();
        for _ in 0..num_clients {
            let client = dec.read_var_u64()?;
            let mut clock = dec.read_var_u32()?;
            let count = dec.read_var_u64()?;
            for _ in 0..count {
                let tag = dec.read_u8()?;
                if tag == TAG_GC {
                    let len = dec.read_var_u32()?;
                    // GC structs carry no content; represent them inline as a
                    // deleted Item so the integration path stays uniform, and
                    // let `integrate` swap it for a real `Block::Gc` once placed.
                    structs.push(Item {
                        id: ID::new(client, clock),
                        left: None,
                        right: None,
                        origin: None,
                        right_origin: None,
                        parent: ParentRef::Root(Rc::from("")),
                        parent_sub: None,
                        deleted: true,
                        content: ItemContent::Deleted(len),
                    });
                    clock += len;
                    continue;
                }
                let flags = dec.read_u8()?;
                let has_origin = flags & 0b0001 != 0;
                let has_right_origin = flags & 0b0010 != 0;
                let has_parent_sub = flags & 0b0100 != 0;
                let deleted = flags & 0b1000 != 0;
                let origin = if has_origin {
                    Some(ID::new(dec.read_var_u64()?, dec.read_var_u32()?))
                } else {
                    None
                };
                let right_origin = if has_right_origin {
                    Some(ID::new(dec.read_var_u64()?, dec.read_var_u32()?))
                } else {
                    None
                };
                let parent_tag = dec.read_u8()?;
                let parent = if parent_tag == PARENT_NESTED {
                    ParentRef::Nested(ID::new(dec.read_var_u64()?, dec.read_var_u32()?))
                } else {
                    ParentRef::Root(Rc::from(dec.read_string()?))
                };
                let parent_sub = if has_parent_sub {
                    Some(Rc::from(dec.read_string()?))
                } else {
                    None
                };
                let content_tag = dec.read_u8()?;
                let content = match content_tag {
                    CONTENT_STRING => {
                        let n = dec.read_var_u64()?;
                        let mut units = smallvec::SmallVec::new();
                        for _ in 0..n {
                            units.push(dec.read_var_u32()? as u16);
                        }
                        ItemContent::String(units)
                    }
                    CONTENT_ANY => {
                        let n = dec.read_var_u64()?;
                        let mut values = smallvec::SmallVec::new();
                        for _ in 0..n {
                            values.push(decode_value(&mut dec)?);
                        }
                        ItemContent::Any(values)
                    }
                    CONTENT_TYPE => ItemContent::Type,
                    CONTENT_DELETED => ItemContent::Deleted(dec.read_var_u32()?),
                    other => return Err(Error::Decode(codec::Error::UnknownStructTag(other))),
                };
                let len = content.len();
                structs.push(Item {
                    id: ID::new(client, clock),
                    left: None,
                    right: None,
                    origin,
                    right_origin,
                    parent,
                    parent_sub,
                    deleted,
                    content,
                });
                clock += len;
            }
        }
        let delete_set = DeleteSet::decode(&mut dec)?;
        Ok(Update { structs, delete_set })
    }
}

fn decode_value<'a>(dec: &mut DecoderV1<'a>) -> Result<Value> {
    let tag = dec.read_u8()?;
    Ok(match tag {
        0 => Value::Null,
        1 => Value::Bool(dec.read_u8()? != 0),
        2 => Value::Number(f64::from_bits(dec.read_var_u64()?)),
        3 => Value::String(dec.read_string()?.to_string()),
        other => return Err(Error::Decode(codec::Error::UnknownStructTag(other))),
    })
}

fn encode_value<W: Write>(w: &mut W, v: &Value) {
    match v {
        Value::Null => w.write_u8(0),
        Value::Bool(b) => {
            w.write_u8(1);
            w.write_u8(*b as u8);
        }
        Value::Number(n) => {
            w.write_u8(2);
            w.write_var_u64(n.to_bits());
        }
        Value::String(s) => {
            w.write_u8(3);
            w.write_string(s);
        }
    }
}

fn encode_item<W: Write>(w: &mut W, item: &Item) {
    match &item.content {
        ItemContent::Deleted(_) if item.deleted && item.origin.is_none() && item.right_origin.is_none() && item.parent_sub.is_none() => {
            // indistinguishable from a genuine GC block on the wire; both decode
            // back to content-less tombstones, so encode as GC for compactness.
            w.write_u8(TAG_GC);
            w.write_var_u32(item.len());
            return;
        }
        _ => {}
    }
    w.write_u8(TAG_ITEM);
    let flags = (item.origin.is_some() as u8)
        | ((item.right_origin.is_some() as u8) << 1)
        | ((item.parent_sub.is_some() as u8) << 2)
        | ((item.deleted as u8) << 3);
    w.write_u8(flags);
    if let Some(o) = item.origin {
        w.write_var_u64(o.client);
        w.write_var_u32(o.clock);
    }
    if let Some(o) = item.right_origin {
        w.write_var_u64(o.client);
        w.write_var_u32(o.clock);
    }
    match &item.parent {
        ParentRef::Root(name) => {
            w.write_u8(PARENT_ROOT);
            w.write_string(name);
        }
        ParentRef::Nested(id) => {
            w.write_u8(PARENT_NESTED);
            w.write_var_u64(id.client);
            w.write_var_u32(id.clock);
        }
    }
    if let Some(key) = &item.parent_sub {
        w.write_string(key);
    }
    match &item.content {
        ItemContent::String(s) => {
            w.write_u8(CONTENT_STRING);
            w.write_var_u64(s.len() as u64);
            for &unit in s.iter() {
                w.write_var_u32(unit as u32);
            }
        }
        ItemContent::Any(values) => {
            w.write_u8(CONTENT_ANY);
            w.write_var_u64(values.len() as u64);
            for v in values.iter() {
                encode_value(w, v);
            }
        }
        ItemContent::Type => w.write_u8(CONTENT_TYPE),
        ItemContent::Deleted(n) => {
            w.write_u8(CONTENT_DELETED);
            w.write_var_u32(*n);
        }
    }
}

/// Builds the update wire message covering exactly the structs created and
/// deletions performed between `tx.before_state` and `after_state`. Client
/// runs are ordered highest-client-id-first (an arbitrary but fixed
/// convention - see SPEC_FULL.md §13 - chosen to keep encode output
/// deterministic for a given transaction).
pub(crate) fn encode_update_from_transaction(doc: &Doc, tx: &TransactionState, after_state: &StateVector) -> Vec<u8> {
    let inner = doc.0.borrow();
    let mut enc = EncoderV1::new();

    let mut clients: Vec<u64> = after_state.iter().map(|(c, _)| *c).collect();
    clients.retain(|c| after_state.get(c) > tx.before_state.get(c));
    clients.sort_unstable_by(|a, b| b.cmp(a));

    enc.write_var_u64(clients.len() as u64);
    for client in clients {
        let before = tx.before_state.get(&client);
        let after = after_state.get(&client);
        let blocks = inner.store.client_blocks(client).unwrap_or(&[]);
        let start_idx = inner.store.find_pivot(client, before).unwrap_or(0);
        let structs: Vec<&Block> = blocks[start_idx..]
            .iter()
            .take_while(|b| b.id().clock < after)
            .collect();
        enc.write_var_u64(client);
        enc.write_var_u32(before);
        enc.write_var_u64(structs.len() as u64);
        for block in structs {
            match block {
                Block::Item(item) => encode_item(&mut enc, item),
                Block::Gc(gc) => {
                    enc.write_u8(TAG_GC);
                    enc.write_var_u32(gc.len);
                }
            }
        }
    }

    tx.delete_set.encode(&mut enc);
    enc.to_vec()
}

/// Encodes the full current state of the document as a single update (the
/// analogue of the teacher's `encodeStateAsUpdate`).
pub fn encode_state_as_update(doc: &Doc) -> Vec<u8> {
    let inner = doc.0.borrow();
    let mut enc = EncoderV1::new();
    let mut clients: Vec<u64> = inner.store.clients().copied().collect();
    clients.sort_unstable_by(|a, b| b.cmp(a));
    enc.write_var_u64(clients.len() as u64);
    for client in clients {
        let blocks = inner.store.client_blocks(client).unwrap();
        enc.write_var_u64(client);
        enc.write_var_u32(0);
        enc.write_var_u64(blocks.len() as u64);
        for block in blocks {
            match block {
                Block::Item(item) => encode_item(&mut enc, item),
                Block::Gc(gc) => {
                    enc.write_u8(TAG_GC);
                    enc.write_var_u32(gc.len);
                }
            }
        }
    }
    DeleteSet::create_from_struct_store(&inner.store).encode(&mut enc);
    enc.to_vec()
}

/// Attempts to integrate every struct in `structs`, in order. Dependencies
/// are checked per struct: its own clock must be contiguous with what's
/// already known for its client, and any `origin`/`right_origin`/nested
/// parent it names must already be present. Structs that can't yet be
/// placed are returned as a [`PendingUpdate`] rather than discarded.
pub(crate) fn integrate(tx: &mut crate::transaction::TransactionMut, structs: Vec<Item>) -> Result<Option<PendingUpdate>> {
    let mut remaining = Vec::new();
    let mut missing = StateVector::new();

    for mut item in structs {
        let expected = {
            let inner = tx.doc.0.borrow();
            inner.store.get_state(item.id.client)
        };

        // Already (at least partially) known - a resend, or an earlier split
        // of a run we've since re-split differently ourselves. Drop the
        // known prefix and keep only the genuinely new suffix, so re-applying
        // an update we've already seen some of is a no-op rather than a park.
        if item.id.clock < expected {
            if item.clock_end() <= expected {
                continue;
            }
            let diff = expected - item.id.clock;
            item.content = item.content.split(diff);
            item.origin = Some(ID::new(item.id.client, item.id.clock + diff - 1));
            item.id = ID::new(item.id.client, item.id.clock + diff);
        }

        let ready = {
            let inner = tx.doc.0.borrow();
            // A same-client origin/rightOrigin/parent is always causally prior
            // to `item` (it shares the append-only log this item's own clock
            // is contiguous with), so only a *different*-client reference is a
            // real cross-replica dependency worth waiting on - matching the
            // teacher's `getMissing`.
            let deps_known = item
                .origin
                .is_none_or(|o| o.client == item.id.client || inner.store.find(o).is_some())
                && item
                    .right_origin
                    .is_none_or(|o| o.client == item.id.client || inner.store.find(o).is_some())
                && match &item.parent {
                    ParentRef::Root(_) => true,
                    ParentRef::Nested(pid) => pid.client == item.id.client || inner.store.find(*pid).is_some(),
                };
            item.id.clock == inner.store.get_state(item.id.client) && deps_known
        };
        if !ready {
            let wait_clock = {
                let inner = tx.doc.0.borrow();
                inner.store.get_state(item.id.client)
            };
            missing.set_min(item.id.client, wait_clock);
            remaining.push(item);
            continue;
        }
        integrate_remote_item(tx, item);
    }

    if remaining.is_empty() {
        Ok(None)
    } else {
        Ok(Some(PendingUpdate {
            missing,
            structs: remaining,
        }))
    }
}

/// Places a single remote struct using the same YATA walk local inserts use
/// (its `origin`/`right_origin` already encode the insertion context the
/// originating replica computed; re-running the scan here is what makes
/// concurrent local and remote inserts converge - spec.md §4.4).
fn integrate_remote_item(tx: &mut crate::transaction::TransactionMut, mut item: Item) {
    if item.deleted && item.origin.is_none() && item.right_origin.is_none() && item.parent_sub.is_none() {
        if let ParentRef::Root(name) = &item.parent {
            if name.is_empty() {
                // a bare GC run - just reserve the clock range, no linked-list cell.
                let mut inner = tx.doc.0.borrow_mut();
                let _ = inner.store.add_struct(Block::Gc(GcBlock {
                    id: item.id,
                    len: item.len(),
                }));
                return;
            }
        }
    }

    let id = item.id;
    let mut inner = tx.doc.0.borrow_mut();
    inner
        .branches
        .entry(item.parent.clone())
        .or_insert_with(|| match &item.parent {
            ParentRef::Root(name) => crate::branch::Branch::root(name.clone()),
            ParentRef::Nested(pid) => crate::branch::Branch::nested(*pid),
        });
    let parent_start = inner.branches.get(&item.parent).and_then(|b| b.start);
    crate::transaction::resolve_position(&inner.store, parent_start, &mut item);

    let left = item.left;
    let right = item.right;
    let parent_sub = item.parent_sub.clone();
    let parent = item.parent.clone();
    let deleted = item.deleted;
    let len = item.len();

    if inner.store.add_struct(Block::Item(item)).is_err() {
        return;
    }

    if let Some(l) = left {
        if let Some(litem) = inner.store.find_mut(l).and_then(|b| b.as_item_mut()) {
            litem.right = Some(id);
        }
    }
    if let Some(r) = right {
        if let Some(ritem) = inner.store.find_mut(r).and_then(|b| b.as_item_mut()) {
            ritem.left = Some(id);
        }
    }

    let branch = inner.branches.get_mut(&parent).unwrap();
    if left.is_none() && parent_sub.is_none() {
        branch.start = Some(id);
    }
    if let Some(key) = &parent_sub {
        crate::transaction::keep_larger_id_as_map_entry(branch, key, id);
    }

    if deleted {
        let tx_state = inner.current.as_mut().unwrap();
        tx_state.delete_set.add(id, len);
    }
    inner.current.as_mut().unwrap().mark_changed(parent.clone(), parent_sub.clone());
    crate::transaction::bubble_changed_parent_types(&mut inner, parent, parent_sub);
}

/// Applies an inbound delete set, marking every referenced struct deleted.
/// Ranges referring to structs that haven't arrived yet are returned for
/// later retry, mirroring how `integrate` parks structs.
pub(crate) fn apply_delete_set(tx: &mut crate::transaction::TransactionMut, ds: &DeleteSet) -> Result<Option<DeleteSet>> {
    let mut leftover = DeleteSet::new();
    for (client, ranges) in ds.iter() {
        for &(clock, len) in ranges {
            let end = clock + len;
            let mut cursor = clock;
            while cursor < end {
                let known_end = tx.doc.0.borrow().store.get_state(client);
                if cursor >= known_end {
                    leftover.add(ID::new(client, cursor), end - cursor);
                    break;
                }
                let id = ID::new(client, cursor);
                // split so the block we're about to mark deleted covers
                // exactly [cursor, cursor + cut) and nothing either side of it.
                tx.make_clean_boundary(id);
                let block_len = {
                    let inner = tx.doc.0.borrow();
                    inner.store.find(id).map(|b| b.len()).unwrap_or(1)
                };
                let cut = block_len.min(end - cursor);
                if cut < block_len {
                    tx.make_clean_boundary(ID::new(client, cursor + cut));
                }
                tx.delete_item(id);
                cursor += cut;
            }
        }
    }
    if leftover.is_empty() {
        Ok(None)
    } else {
        Ok(Some(leftover))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc::Doc;

    #[test]
    fn encode_state_as_update_then_decode_roundtrips_structs() {
        let doc = Doc::new();
        let root = doc.get_or_create_type("text");
        doc.transact_mut(None, |tx| {
            tx.insert_text(&root, 0, "hello");
        });
        let bytes = encode_state_as_update(&doc);
        let update = Update::decode(&bytes).unwrap();
        assert_eq!(update.structs.len(), 1);
        assert_eq!(update.structs[0].len(), 5);
    }

    #[test]
    fn remote_update_integrates_into_fresh_doc() {
        let a = Doc::new();
        let root_a = a.get_or_create_type("text");
        a.transact_mut(None, |tx| {
            tx.insert_text(&root_a, 0, "hi");
        });
        let bytes = encode_state_as_update(&a);

        let b = Doc::new();
        let root_b = b.get_or_create_type("text");
        b.transact_mut(None, |tx| {
            tx.apply_update(&bytes).unwrap();
        });
        let text = b.with_branch(&root_b, |branch, store| branch.to_string(store));
        assert_eq!(text, "hi");
    }
}
