use crate::block::{ItemContent, ParentRef};
use crate::id::ID;
use crate::observer::Observer;
use crate::store::StructStore;
use std::collections::HashMap;
use std::rc::Rc;

/// The opaque shared-type contract the core presents to front-end types
/// (spec.md §3, §6, and SPEC_FULL.md §12). `crdt-core` ships exactly one
/// concrete implementation of it, deliberately not a rich-text/XML front end:
/// it exists to let the engine be exercised and tested end to end.
pub struct Branch {
    /// `None` for a root-level type; `Some(id)` for a type nested inside
    /// another Item's content.
    pub item: Option<ID>,
    /// First child, for sequence traversal.
    pub start: Option<ID>,
    /// Sub-key -> latest Item at that key, for map-style access.
    pub map: HashMap<Rc<str>, ID>,
    /// Root name, if this is a root-level type.
    pub name: Option<Rc<str>>,
    pub(crate) shallow: Observer<ChangeEvent>,
    pub(crate) deep: Observer<Vec<ChangeEvent>>,
}

impl Branch {
    pub fn root(name: Rc<str>) -> Self {
        Branch {
            item: None,
            start: None,
            map: HashMap::new(),
            name: Some(name),
            shallow: Observer::new(),
            deep: Observer::new(),
        }
    }

    pub fn nested(item: ID) -> Self {
        Branch {
            item: Some(item),
            start: None,
            map: HashMap::new(),
            name: None,
            shallow: Observer::new(),
            deep: Observer::new(),
        }
    }

    /// Concatenates the non-deleted `String` content of this branch's
    /// sequence, in left-to-right order. Exercises the linked-list traversal
    /// contract; a real text/array front end would additionally expose
    /// per-item boundaries, formatting, and embeds.
    pub fn to_string(&self, store: &StructStore) -> String {
        let mut units: Vec<u16> = Vec::new();
        let mut cur = self.start;
        while let Some(id) = cur {
            let block = store.find(id).expect("linked-list pointer must resolve");
            if let Some(item) = block.as_item() {
                if !item.deleted {
                    if let ItemContent::String(s) = &item.content {
                        units.extend_from_slice(s);
                    }
                }
                cur = item.right;
            } else {
                cur = None;
            }
        }
        String::from_utf16_lossy(&units)
    }

    /// Returns the currently-live value at `key`, or `None` if the key was
    /// never set or its current item has since been deleted.
    pub fn get<'s>(&self, store: &'s StructStore, key: &str) -> Option<&'s ItemContent> {
        let id = *self.map.get(key)?;
        let block = store.find(id)?;
        let item = block.as_item()?;
        if item.deleted {
            None
        } else {
            Some(&item.content)
        }
    }
}

/// One shallow change notification: which sub-keys changed on a branch,
/// where `None` in the set means "sequence position changed" (an insert or
/// delete at some index rather than a keyed write).
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub target: ParentRef,
    pub keys: Vec<Option<Rc<str>>>,
}
