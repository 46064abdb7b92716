use crate::block::{Block, Item, ItemContent, ParentRef, Value};
use crate::branch::ChangeEvent;
use crate::doc::{Doc, Inner, TransactionEvent, UpdateEvent};
use crate::id::ID;
use crate::id_set::DeleteSet;
use crate::state_vector::StateVector;
use crate::update::{self, Update};
use smallvec::SmallVec;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

/// Arbitrary caller-supplied tag forwarded to observers, identifying who
/// made a change. The teacher allows any `Any`-boxed value; this engine
/// narrows it to an interned label, which is all the core itself ever
/// inspects (front-end types needing a richer origin can widen this).
pub type Origin = Option<Rc<str>>;

/// Per-transaction mutation batch: the delete set built so far, which
/// branches/keys changed, and which struct boundaries should be reconsidered
/// for merging once the transaction closes (spec.md §4.5).
pub struct TransactionState {
    pub origin: Origin,
    pub before_state: StateVector,
    pub delete_set: DeleteSet,
    pub changed: HashMap<ParentRef, HashSet<Option<Rc<str>>>>,
    pub changed_parent_types: HashMap<ParentRef, Vec<ChangeEvent>>,
    pub merge_structs: Vec<ID>,
}

impl TransactionState {
    pub fn new(origin: Origin, before_state: StateVector) -> Self {
        TransactionState {
            origin,
            before_state,
            delete_set: DeleteSet::new(),
            changed: HashMap::new(),
            changed_parent_types: HashMap::new(),
            merge_structs: Vec::new(),
        }
    }

    pub(crate) fn mark_changed(&mut self, parent: ParentRef, sub: Option<Rc<str>>) {
        self.changed.entry(parent).or_default().insert(sub);
    }
}

/// The handle a caller's transaction body mutates through. Cheap to clone
/// (it just wraps the document handle); all of its methods re-borrow the
/// document's interior cell per call rather than holding one long borrow, so
/// nothing here can deadlock against the cleanup pass that runs after the
/// body returns.
pub struct TransactionMut {
    pub(crate) doc: Doc,
}

impl TransactionMut {
    pub fn origin(&self) -> Origin {
        self.doc.0.borrow().current.as_ref().unwrap().origin.clone()
    }

    /// The `(clientID, getState(clientID))` pair this transaction's next
    /// locally-created struct will be assigned.
    pub fn next_id(&self) -> ID {
        let inner = self.doc.0.borrow();
        let client = inner.options.client_id;
        ID::new(client, inner.store.get_state(client))
    }

    pub fn get_or_create_type(&mut self, name: &str) -> ParentRef {
        self.doc.get_or_create_type(name)
    }

    /// Inserts `text` as a new run at sequence `index` (counted in non-
    /// deleted content units) within `parent`.
    pub fn insert_text(&mut self, parent: &ParentRef, index: u32, text: &str) -> ID {
        let units: SmallVec<[u16; 16]> = text.encode_utf16().collect();
        self.insert(parent, index, ItemContent::String(units))
    }

    pub fn insert_values(&mut self, parent: &ParentRef, index: u32, values: Vec<Value>) -> ID {
        self.insert(parent, index, ItemContent::Any(values.into()))
    }

    fn insert(&mut self, parent: &ParentRef, index: u32, content: ItemContent) -> ID {
        let id = self.next_id();
        let left = find_left_neighbor(&self.doc, parent, index);
        if let Some(l) = left {
            // `l` may be a mid-block clock; split the block it straddles so
            // `l` becomes a clean block end before it's used to link/resolve
            // against (spec.md §4.2 `getItemCleanStart`).
            self.make_clean_boundary(ID::new(l.client, l.clock + 1));
        }
        let right = left.and_then(|l| right_of(&self.doc, l));
        let item = Item {
            id,
            left,
            right,
            origin: left,
            right_origin: right,
            parent: parent.clone(),
            parent_sub: None,
            deleted: false,
            content,
        };
        self.integrate_item(item)
    }

    /// Map-style write: creates a new Item at `key`, chained onto whatever
    /// Item currently occupies it (if any) so concurrent writers converge
    /// deterministically via YATA (spec.md §4.4).
    pub fn set(&mut self, parent: &ParentRef, key: &str, value: Value) -> ID {
        let id = self.next_id();
        let key: Rc<str> = Rc::from(key);
        let prev = self.doc.with_branch(parent, |b, _| b.map.get(key.as_ref()).copied());
        let item = Item {
            id,
            left: prev,
            right: None,
            origin: prev,
            right_origin: None,
            parent: parent.clone(),
            parent_sub: Some(key),
            deleted: false,
            content: ItemContent::Any(smallvec::smallvec![value]),
        };
        self.integrate_item(item)
    }

    pub fn remove_key(&mut self, parent: &ParentRef, key: &str) {
        let id = self.doc.with_branch(parent, |b, _| b.map.get(key).copied());
        if let Some(id) = id {
            self.delete_item(id);
        }
    }

    /// Deletes `len` content units starting at sequence `index`, splitting
    /// boundary Items as needed so exactly the requested range is affected.
    pub fn remove_range(&mut self, parent: &ParentRef, index: u32, len: u32) {
        if len == 0 {
            return;
        }
        let mut remaining = len;
        let mut pos = index;
        loop {
            if remaining == 0 {
                break;
            }
            let (id, unit_len) = match find_unit_at(&self.doc, parent, pos) {
                Some(v) => v,
                None => break,
            };
            let cut = unit_len.min(remaining);
            self.make_clean_boundary(id);
            if cut < unit_len {
                self.make_clean_boundary(ID::new(id.client, id.clock + cut));
            }
            self.delete_item(id);
            remaining -= cut;
            let _ = &mut pos;
        }
    }

    /// Ensures a struct boundary exists exactly at `id.clock`, splitting
    /// whatever block currently straddles it so later indexing by `id` alone
    /// (e.g. `find_mut`/`delete_item`) only ever touches the intended range.
    pub(crate) fn make_clean_boundary(&mut self, id: ID) {
        let mut inner = self.doc.0.borrow_mut();
        if let Ok(idx) = inner.store.get_item_clean_start(id) {
            let _ = idx;
        }
        inner
            .current
            .as_mut()
            .unwrap()
            .merge_structs
            .push(id);
    }

    pub(crate) fn delete_item(&mut self, id: ID) {
        let mut inner = self.doc.0.borrow_mut();
        let inner: &mut Inner = &mut inner;
        let (len, parent, parent_sub, already_deleted, before_clock) = {
            let block = match inner.store.find_mut(id) {
                Some(b) => b,
                None => return,
            };
            let item = match block.as_item_mut() {
                Some(i) => i,
                None => return,
            };
            if item.deleted {
                (0, item.parent.clone(), item.parent_sub.clone(), true, 0)
            } else {
                item.deleted = true;
                let before_clock = inner
                    .current
                    .as_ref()
                    .unwrap()
                    .before_state
                    .get(&id.client);
                (
                    item.len(),
                    item.parent.clone(),
                    item.parent_sub.clone(),
                    false,
                    before_clock,
                )
            }
        };
        if already_deleted {
            return;
        }
        let tx = inner.current.as_mut().unwrap();
        tx.delete_set.add(id, len);
        if id.clock < before_clock {
            tx.mark_changed(parent.clone(), parent_sub.clone());
        }
        bubble_changed_parent_types(inner, parent, parent_sub);
    }

    /// Runs the YATA conflict-resolution walk from spec.md §4.4, links the
    /// item into the store and its parent's sequence/map, and records the
    /// structural change for observer dispatch.
    fn integrate_item(&mut self, mut item: Item) -> ID {
        let id = item.id;
        let mut inner = self.doc.0.borrow_mut();
        let inner: &mut Inner = &mut inner;

        let parent_start = inner.branches.get(&item.parent).and_then(|b| b.start);
        resolve_position(&inner.store, parent_start, &mut item);

        let left = item.left;
        let right = item.right;
        let parent_sub = item.parent_sub.clone();
        let parent = item.parent.clone();

        inner.store.add_struct(Block::Item(item)).expect("sequential local clock");

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

        let branch = inner.branches.get_mut(&parent).expect("parent branch must exist");
        if left.is_none() && parent_sub.is_none() {
            branch.start = Some(id);
        }
        if let Some(key) = &parent_sub {
            keep_larger_id_as_map_entry(branch, key, id);
        }

        let tx = inner.current.as_mut().unwrap();
        tx.mark_changed(parent.clone(), parent_sub.clone());
        bubble_changed_parent_types(inner, parent, parent_sub);

        id
    }

    /// Integrates a remote update, parking whatever can't yet be applied
    /// because its dependencies haven't arrived (spec.md §4.6).
    pub fn apply_update(&mut self, bytes: &[u8]) -> crate::error::Result<()> {
        let update = Update::decode(bytes)?;
        self.apply_decoded(update)
    }

    pub(crate) fn apply_decoded(&mut self, update: Update) -> crate::error::Result<()> {
        let remaining = update::integrate(self, update.structs)?;

        let mut retry = false;
        {
            let mut inner = self.doc.0.borrow_mut();
            if let Some(pending) = &inner.pending {
                for (&client, &clock) in pending.missing.iter() {
                    if clock < inner.store.get_state(client) {
                        retry = true;
                        break;
                    }
                }
            }
            match (inner.pending.take(), remaining) {
                (Some(mut p), Some(r)) => {
                    for (client, clock) in r.missing.iter() {
                        p.missing.set_min(*client, *clock);
                    }
                    p.structs.extend(r.structs);
                    inner.pending = Some(p);
                }
                (None, Some(r)) => inner.pending = Some(r),
                (Some(p), None) => inner.pending = Some(p),
                (None, None) => {}
            }
        }

        let mut leftover = update::apply_delete_set(self, &update.delete_set)?;
        let parked_ds = self.doc.0.borrow_mut().pending_ds.take();
        if let Some(pending_ds) = parked_ds {
            let more_leftover = update::apply_delete_set(self, &pending_ds)?;
            leftover = match (leftover, more_leftover) {
                (Some(mut a), Some(b)) => {
                    a.merge(b);
                    Some(a)
                }
                (a, b) => a.or(b),
            };
        }
        self.doc.0.borrow_mut().pending_ds = leftover;

        if retry {
            let pending = self.doc.0.borrow_mut().pending.take();
            if let Some(pending) = pending {
                let delete_set = self.doc.0.borrow_mut().pending_ds.take().unwrap_or_default();
                return self.apply_decoded(Update {
                    structs: pending.structs,
                    delete_set,
                });
            }
        }
        Ok(())
    }
}

/// Scans `parent`'s sequence counting non-deleted units, returning the ID
/// of the item whose content is to the immediate left of `index` (or `None`
/// if `index == 0`).
fn find_left_neighbor(doc: &Doc, parent: &ParentRef, index: u32) -> Option<ID> {
    doc.with_branch(parent, |branch, store| {
        if index == 0 {
            return None;
        }
        let mut remaining = index;
        let mut cur = branch.start;
        let mut last_seen = None;
        while let Some(id) = cur {
            let block = store.find(id)?;
            let item = block.as_item()?;
            if !item.deleted {
                let len = item.len();
                if remaining <= len {
                    return Some(ID::new(id.client, id.clock + remaining - 1));
                }
                remaining -= len;
            }
            last_seen = Some(id);
            cur = item.right;
        }
        last_seen
    })
}

fn right_of(doc: &Doc, id: ID) -> Option<ID> {
    doc.0.borrow().store.find(id).and_then(|b| b.as_item()).and_then(|i| i.right)
}

/// Finds the (possibly mid-item) unit at sequence `index`, returning the ID
/// of the item that contains it and that item's remaining content length
/// from that point on (used by `remove_range` to walk forward).
fn find_unit_at(doc: &Doc, parent: &ParentRef, index: u32) -> Option<(ID, u32)> {
    doc.with_branch(parent, |branch, store| {
        let mut remaining = index;
        let mut cur = branch.start;
        while let Some(id) = cur {
            let block = store.find(id)?;
            let item = block.as_item()?;
            if !item.deleted {
                let len = item.len();
                if remaining < len {
                    return Some((ID::new(id.client, id.clock + remaining), len - remaining));
                }
                remaining -= len;
            }
            cur = item.right;
        }
        None
    })
}

/// Map-entry resolution (spec.md §4.4/§8 scenario 4): two items written to
/// the same key concurrently never discover each other through the
/// `origin`/`right_origin` scan (there's nothing to chain a *first* write to
/// a previously-unset key onto). Convergence instead comes from a direct,
/// order-independent comparison: whichever item has the larger `(client,
/// clock)` ID becomes - and stays - the key's current value, no matter which
/// replica integrates the two writes in which order.
pub(crate) fn keep_larger_id_as_map_entry(branch: &mut crate::branch::Branch, key: &Rc<str>, candidate: ID) {
    let replace = !matches!(branch.map.get(key.as_ref()), Some(current) if *current >= candidate);
    if replace {
        branch.map.insert(key.clone(), candidate);
    }
}

/// Walks the ancestor-type chain from `parent` up to a root type, recording a
/// [`ChangeEvent`] for each into `changed_parent_types` - the feed
/// `deliver_observers` reads to fire `observeDeep` handlers (spec.md §4.5
/// step 3). Called for every structural change, insert or delete, since a
/// deep observer on an ancestor must see both.
pub(crate) fn bubble_changed_parent_types(inner: &mut Inner, parent: ParentRef, parent_sub: Option<Rc<str>>) {
    let tx = inner.current.as_mut().unwrap();
    let mut cur_parent = parent;
    loop {
        let event = ChangeEvent {
            target: cur_parent.clone(),
            keys: vec![parent_sub.clone()],
        };
        tx.changed_parent_types.entry(cur_parent.clone()).or_default().push(event);
        match &cur_parent {
            ParentRef::Root(_) => break,
            ParentRef::Nested(pid) => match inner.store.find(*pid).and_then(|b| b.as_item()) {
                Some(parent_item) => cur_parent = parent_item.parent.clone(),
                None => break,
            },
        }
    }
}

/// The YATA conflict-resolution walk (spec.md §4.4). Starting just after the
/// item's `origin`, scans toward `right_origin`, deciding for each candidate
/// `C` whether it causally precedes the new item (skip past it), ties with
/// it (break by client id), or follows it (stop - insert here).
pub(crate) fn resolve_position(store: &crate::store::StructStore, parent_start: Option<ID>, item: &mut Item) {
    let origin = item.origin;
    let right_boundary = item.right_origin;

    let mut left = origin;
    let mut scan = match origin {
        Some(lid) => store.find(lid).and_then(|b| b.as_item()).and_then(|i| i.right),
        None if item.parent_sub.is_some() => None,
        None => parent_start,
    };

    let mut items_before_origin: HashSet<ID> = HashSet::new();
    if let Some(l) = left {
        items_before_origin.insert(l);
    }

    while let Some(cid) = scan {
        if Some(cid) == right_boundary {
            break;
        }
        let candidate = match store.find(cid).and_then(|b| b.as_item()) {
            Some(c) => c,
            None => break,
        };
        items_before_origin.insert(cid);

        if candidate.origin == item.origin {
            if candidate.id.client < item.id.client {
                left = Some(cid);
                scan = candidate.right;
            } else {
                break;
            }
        } else {
            let candidate_precedes = match candidate.origin {
                None => left.is_none(),
                Some(co) => items_before_origin.contains(&co) || Some(co) == left,
            };
            if candidate_precedes {
                left = Some(cid);
                scan = candidate.right;
            } else {
                break;
            }
        }
    }

    item.left = left;
    item.right = scan;
}

/// Runs the close-of-transaction pass (spec.md §4.5 steps 3-6): sort/merge
/// the delete set, dispatch observers, run garbage collection, run the merge
/// pass, then emit `afterTransactionCleanup` and (if anyone is listening) an
/// encoded update.
pub(crate) fn close(doc: &Doc, mut tx: TransactionState) {
    tx.delete_set.sort_and_merge();
    let after_state = doc.0.borrow().store.get_state_vector();

    deliver_observers(doc, &tx);

    let event = TransactionEvent {
        origin: tx.origin.clone(),
        before_state: tx.before_state.clone(),
        after_state: after_state.clone(),
        delete_set: tx.delete_set.clone(),
    };
    let after_transaction = doc.0.borrow().events.after_transaction.clone();
    after_transaction.trigger(&event);

    run_gc_pass(doc, &tx);
    run_merge_pass(doc, &tx, &after_state);

    let after_cleanup = doc.0.borrow().events.after_transaction_cleanup.clone();
    after_cleanup.trigger(&event);

    let update_observer = doc.0.borrow().events.update.clone();
    if !update_observer.is_empty() && (!tx.delete_set.is_empty() || after_state != tx.before_state) {
        let bytes = update::encode_update_from_transaction(doc, &tx, &after_state);
        update_observer.trigger(&UpdateEvent { update: bytes });
    }
}

/// Clones out the (parent, observer, event) triples that need to fire, then
/// drops the document borrow before calling any of them - a shallow/deep
/// observer is free to open a new transaction on this same document.
fn deliver_observers(doc: &Doc, tx: &TransactionState) {
    let shallow: Vec<(crate::observer::Observer<ChangeEvent>, ChangeEvent)> = {
        let inner = doc.0.borrow();
        tx.changed
            .iter()
            .filter_map(|(parent, keys)| {
                let branch = inner.branches.get(parent)?;
                let event = ChangeEvent {
                    target: parent.clone(),
                    keys: keys.iter().cloned().collect(),
                };
                Some((branch.shallow.clone(), event))
            })
            .collect()
    };
    for (observer, event) in shallow {
        observer.trigger(&event);
    }

    let deep: Vec<(crate::observer::Observer<Vec<ChangeEvent>>, Vec<ChangeEvent>)> = {
        let inner = doc.0.borrow();
        tx.changed_parent_types
            .iter()
            .filter_map(|(parent, events)| {
                let branch = inner.branches.get(parent)?;
                if branch.deep.is_empty() {
                    return None;
                }
                let live: Vec<ChangeEvent> = events
                    .iter()
                    .filter(|e| match &e.target {
                        ParentRef::Root(_) => true,
                        ParentRef::Nested(id) => inner
                            .store
                            .find(*id)
                            .map(|b| !b.is_deleted())
                            .unwrap_or(false),
                    })
                    .cloned()
                    .collect();
                if live.is_empty() {
                    None
                } else {
                    Some((branch.deep.clone(), live))
                }
            })
            .collect()
    };
    for (observer, events) in deep {
        observer.trigger(&events);
    }
}

fn run_gc_pass(doc: &Doc, tx: &TransactionState) {
    let mut inner = doc.0.borrow_mut();
    if inner.options.skip_gc {
        return;
    }
    let ranges: Vec<(u64, u32, u32)> = tx
        .delete_set
        .iter()
        .flat_map(|(c, rs)| rs.iter().map(move |&(clock, len)| (c, clock, len)))
        .collect();
    for &(client, clock, len) in ranges.iter().rev() {
        let ids: Vec<ID> = match inner.store.client_blocks(client) {
            Some(blocks) => blocks
                .iter()
                .filter(|b| b.id().clock >= clock && b.id().clock < clock + len)
                .filter_map(|b| b.as_item().map(|i| i.id))
                .collect(),
            None => continue,
        };
        for id in ids {
            gc_item(&mut inner, id);
        }
    }
}

fn gc_item(inner: &mut Inner, id: ID) {
    let (deleted, is_gc_already, len, parent, parent_sub) = {
        let item = match inner.store.find(id).and_then(|b| b.as_item()) {
            Some(i) => i,
            None => return,
        };
        (item.deleted, item.is_gc_content(), item.len(), item.parent.clone(), item.parent_sub.clone())
    };
    if !deleted || is_gc_already {
        return;
    }
    let parent_gone = match &parent {
        ParentRef::Root(_) => false,
        ParentRef::Nested(pid) => inner.store.find(*pid).map(|b| b.is_deleted()).unwrap_or(true),
    };
    let map_unreachable = match &parent_sub {
        Some(key) => inner
            .branches
            .get(&parent)
            .map(|b| b.map.get(key.as_ref()) != Some(&id))
            .unwrap_or(true),
        None => false,
    };
    if parent_gone || map_unreachable {
        let _ = inner.store.gc(id);
    } else if let Some(item) = inner.store.find_mut(id).and_then(|b| b.as_item_mut()) {
        item.content = ItemContent::Deleted(len);
    }
}

fn run_merge_pass(doc: &Doc, tx: &TransactionState, after_state: &StateVector) {
    let mut inner = doc.0.borrow_mut();

    for (client, ranges) in tx.delete_set.iter() {
        for &(clock, len) in ranges {
            let mut idx = inner.store.find_pivot(client, clock + len - 1);
            while let Some(i) = idx {
                if i == 0 {
                    break;
                }
                if try_merge_left(&mut inner, client, i) {
                    idx = Some(i - 1);
                } else {
                    idx = Some(i.saturating_sub(1));
                    if idx == Some(0) {
                        break;
                    }
                }
            }
        }
    }

    for (&client, &before_clock) in tx.before_state.iter() {
        let after_clock = after_state.get(&client);
        if after_clock <= before_clock {
            continue;
        }
        let len = inner.store.client_blocks(client).map(|b| b.len()).unwrap_or(0);
        let start = inner
            .store
            .find_pivot(client, before_clock)
            .unwrap_or(0)
            .max(1);
        let mut i = len;
        while i > start {
            i -= 1;
            try_merge_left(&mut inner, client, i);
        }
    }
    for &client in after_state.iter().map(|(c, _)| c).collect::<Vec<_>>().iter() {
        if inner.store.client_blocks(*client).is_some() && tx.before_state.get(client) == 0 {
            let len = inner.store.client_blocks(*client).map(|b| b.len()).unwrap_or(0);
            let mut i = len;
            while i > 1 {
                i -= 1;
                try_merge_left(&mut inner, *client, i);
            }
        }
    }

    for id in &tx.merge_structs {
        if let Some(i) = inner.store.find_pivot(id.client, id.clock) {
            try_merge_left(&mut inner, id.client, i);
            try_merge_left(&mut inner, id.client, i + 1);
        }
    }
}

/// Attempts to fold `structs[i]` into `structs[i - 1]`. On success, splices
/// `structs[i]` out and, if it was the current map entry for its key, moves
/// that entry onto the surviving left-hand struct.
fn try_merge_left(inner: &mut Inner, client: u64, i: usize) -> bool {
    if i == 0 {
        return false;
    }
    let merged = {
        let vec = inner.store.client_blocks_mut(client);
        if i >= vec.len() {
            return false;
        }
        let (left_part, right_part) = vec.split_at_mut(i);
        let left = left_part.last_mut().unwrap();
        let right = &right_part[0];
        if left.is_deleted() != right.is_deleted() {
            false
        } else {
            left.merge_with(right)
        }
    };
    if !merged {
        return false;
    }
    let removed = inner.store.remove_at(client, i);
    if let Block::Item(removed_item) = removed {
        if let Some(key) = &removed_item.parent_sub {
            if let Some(branch) = inner.branches.get_mut(&removed_item.parent) {
                if branch.map.get(key.as_ref()) == Some(&removed_item.id) {
                    let new_id = inner.store.client_blocks(client).unwrap()[i - 1].id();
                    branch.map.insert(key.clone(), new_id);
                }
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc::{Doc, Options};

    fn doc_with_client(client_id: u64) -> Doc {
        Doc::with_options(Options {
            client_id,
            skip_gc: false,
        })
    }

    #[test]
    fn sequential_local_inserts_merge_into_one_item() {
        let doc = doc_with_client(1);
        let root = doc.get_or_create_type("text");
        doc.transact_mut(None, |tx| {
            tx.insert_text(&root, 0, "a");
            tx.insert_text(&root, 1, "b");
        });
        let inner = doc.0.borrow();
        let blocks = inner.store.client_blocks(1).unwrap();
        assert_eq!(blocks.len(), 1);
        let units: SmallVec<[u16; 16]> = "ab".encode_utf16().collect();
        assert_eq!(blocks[0].as_item().unwrap().content, ItemContent::String(units));
    }

    #[test]
    fn insert_into_merged_block_splits_at_the_boundary() {
        let doc = doc_with_client(1);
        let root = doc.get_or_create_type("text");
        doc.transact_mut(None, |tx| {
            tx.insert_text(&root, 0, "hello");
        });
        {
            let inner = doc.0.borrow();
            assert_eq!(inner.store.client_blocks(1).unwrap().len(), 1);
        }
        doc.transact_mut(None, |tx| {
            tx.insert_text(&root, 2, "X");
        });
        let text = doc.with_branch(&root, |branch, store| branch.to_string(store));
        assert_eq!(text, "heXllo");
    }

    #[test]
    fn deep_observer_fires_on_insert_not_just_delete() {
        use std::cell::Cell;
        use std::rc::Rc as StdRc;

        let doc = doc_with_client(1);
        let root = doc.get_or_create_type("text");
        let seen = StdRc::new(Cell::new(0));
        let seen_clone = seen.clone();
        let _sub = doc.with_branch(&root, |branch, _store| {
            branch.deep.subscribe(move |events| seen_clone.set(seen_clone.get() + events.len()))
        });

        doc.transact_mut(None, |tx| {
            tx.insert_text(&root, 0, "hi");
        });
        assert!(seen.get() > 0, "observeDeep must fire for inserts, not only deletes");
    }

    #[test]
    fn split_inside_a_surrogate_pair_does_not_panic() {
        let doc = doc_with_client(1);
        let root = doc.get_or_create_type("text");
        // U+1F600 GRINNING FACE is two UTF-16 code units; "a" + emoji + "b" is
        // 4 units total, so deleting unit offset 1 lands between the two
        // halves of the surrogate pair.
        doc.transact_mut(None, |tx| {
            tx.insert_text(&root, 0, "a\u{1F600}b");
        });
        doc.transact_mut(None, |tx| {
            tx.remove_range(&root, 1, 1);
        });
        let text = doc.with_branch(&root, |branch, store| branch.to_string(store));
        assert_eq!(text, "a\u{FFFD}b");
    }

    #[test]
    fn concurrent_inserts_at_same_position_order_by_client_id() {
        let a = doc_with_client(1);
        let b = doc_with_client(2);
        let root_a = a.get_or_create_type("text");
        let root_b = b.get_or_create_type("text");
        a.transact_mut(None, |tx| {
            tx.insert_text(&root_a, 0, "a");
        });
        b.transact_mut(None, |tx| {
            tx.insert_text(&root_b, 0, "b");
        });
        let update_a = update::encode_state_as_update(&a);
        let update_b = update::encode_state_as_update(&b);
        a.transact_mut(None, |tx| tx.apply_update(&update_b).unwrap());
        b.transact_mut(None, |tx| tx.apply_update(&update_a).unwrap());

        let text_a = a.with_branch(&root_a, |branch, store| branch.to_string(store));
        let text_b = b.with_branch(&root_b, |branch, store| branch.to_string(store));
        assert_eq!(text_a, text_b);
        assert_eq!(text_a, "ab"); // client 1 < client 2
    }

    #[test]
    fn concurrent_map_write_resolved_by_larger_id_wins() {
        let a = doc_with_client(1);
        let b = doc_with_client(5);
        let root_a = a.get_or_create_type("map");
        let root_b = b.get_or_create_type("map");
        a.transact_mut(None, |tx| {
            tx.set(&root_a, "k", Value::String("x".into()));
        });
        b.transact_mut(None, |tx| {
            tx.set(&root_b, "k", Value::String("y".into()));
        });
        let update_a = update::encode_state_as_update(&a);
        let update_b = update::encode_state_as_update(&b);
        a.transact_mut(None, |tx| tx.apply_update(&update_b).unwrap());
        b.transact_mut(None, |tx| tx.apply_update(&update_a).unwrap());

        let get_k = |doc: &Doc, root: &ParentRef| {
            doc.with_branch(root, |branch, store| branch.get(store, "k").cloned())
        };
        let va = get_k(&a, &root_a);
        let vb = get_k(&b, &root_b);
        assert_eq!(va, vb);
        // client 5's write has the larger (client, clock) id and wins.
        assert_eq!(va, Some(ItemContent::Any(smallvec::smallvec![Value::String("y".into())])));
    }
}
