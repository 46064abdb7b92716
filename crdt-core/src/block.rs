use crate::id::ID;
use smallvec::SmallVec;
use std::rc::Rc;

/// Either a root-level shared type (named by the caller) or a shared type
/// nested inside another Item's content, named by that Item's ID. Resolved
/// once, at integration time, into a lookup key for `Document.branches`
/// (spec.md §4.6 "dynamic parent references").
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ParentRef {
    Root(Rc<str>),
    Nested(ID),
}

/// A JSON-ish embedded value, one unit of an `ItemContent::Any` run.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
}

/// The content carried by an [`Item`]. Each variant knows its own length (in
/// content units), how to split itself at an offset, and when it may be
/// merged with a following chunk of the same kind - `mergeWith`/`splitAt` on
/// `Item` simply delegate to these.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemContent {
    /// A run of raw UTF-16 code units. Length and split points are counted
    /// in UTF-16 code units, matching the teacher's string content - kept as
    /// code units rather than a UTF-8 `String` so a split that lands between
    /// the two halves of a surrogate pair (legal per spec.md §4.4, since
    /// callers address content by UTF-16 offset) never has to produce an
    /// invalid standalone UTF-8 string on either side.
    String(SmallVec<[u16; 16]>),
    /// A run of embedded values; each value is one content unit.
    Any(SmallVec<[Value; 2]>),
    /// A nested shared type. Always length 1 - it never splits or merges.
    Type,
    /// Tombstoned content: the original payload has been discarded but the
    /// linked-list cell survives so concurrently-arriving operations can
    /// still reference this clock range by ID.
    Deleted(u32),
}

impl ItemContent {
    pub fn len(&self) -> u32 {
        match self {
            ItemContent::String(s) => s.len() as u32,
            ItemContent::Any(v) => v.len() as u32,
            ItemContent::Type => 1,
            ItemContent::Deleted(n) => *n,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Splits at UTF-16 offset `diff`, returning the right half and shrinking
    /// `self` into the left half in place.
    pub fn split(&mut self, diff: u32) -> ItemContent {
        match self {
            ItemContent::String(s) => {
                let right: SmallVec<[u16; 16]> = s.drain(diff as usize..).collect();
                ItemContent::String(right)
            }
            ItemContent::Any(v) => {
                let right: SmallVec<[Value; 2]> = v.drain(diff as usize..).collect();
                ItemContent::Any(right)
            }
            ItemContent::Type => unreachable!("a Type content unit has length 1 and never splits"),
            ItemContent::Deleted(n) => {
                let right = *n - diff;
                *n = diff;
                ItemContent::Deleted(right)
            }
        }
    }

    /// Attempts to append `other` onto `self`. Returns `false` (leaving both
    /// sides untouched) when the variants are incompatible.
    pub fn merge(&mut self, other: ItemContent) -> bool {
        match (self, other) {
            (ItemContent::String(a), ItemContent::String(b)) => {
                a.extend(b);
                true
            }
            (ItemContent::Any(a), ItemContent::Any(b)) => {
                a.extend(b);
                true
            }
            (ItemContent::Deleted(a), ItemContent::Deleted(b)) => {
                *a += b;
                true
            }
            _ => false,
        }
    }
}

/// A logically inserted element. Carries `origin`/`right_origin`, the fixed
/// neighbors used only for YATA conflict resolution, and `left`/`right`, the
/// live linked-list pointers updated whenever a neighbor is inserted, split,
/// or merged away.
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub id: ID,
    pub left: Option<ID>,
    pub right: Option<ID>,
    pub origin: Option<ID>,
    pub right_origin: Option<ID>,
    pub parent: ParentRef,
    pub parent_sub: Option<Rc<str>>,
    pub deleted: bool,
    pub content: ItemContent,
}

impl Item {
    pub fn len(&self) -> u32 {
        self.content.len()
    }

    /// Always `false` - a struct with zero content units is never created.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clock_end(&self) -> u32 {
        self.id.clock + self.len()
    }

    pub fn last_id(&self) -> ID {
        ID::new(self.id.client, self.clock_end() - 1)
    }

    pub fn is_gc_content(&self) -> bool {
        matches!(self.content, ItemContent::Deleted(_))
    }

    /// Splits this item at content offset `diff` (`0 < diff < self.len()`),
    /// shrinking `self` into the left half and returning the right half.
    /// `self.right`/`right.left` are rewired to point at each other; the
    /// caller is responsible for inserting the returned item into the store
    /// immediately after `self` and for rewiring whatever used to be
    /// `self.right`'s `left` pointer.
    pub fn split_at(&mut self, diff: u32) -> Item {
        debug_assert!(diff > 0 && diff < self.len());
        let right_content = self.content.split(diff);
        let right_id = ID::new(self.id.client, self.id.clock + diff);
        let right = Item {
            id: right_id,
            left: Some(self.id),
            right: self.right.take(),
            origin: Some(ID::new(self.id.client, right_id.clock - 1)),
            right_origin: self.right_origin.take(),
            parent: self.parent.clone(),
            parent_sub: self.parent_sub.clone(),
            deleted: self.deleted,
            content: right_content,
        };
        self.right = Some(right.id);
        self.right_origin = Some(right.id);
        right
    }

    /// Attempts to fold `right` onto the end of `self`. Succeeds only when
    /// every structural precondition from spec.md §4.4 holds; on success
    /// `self` absorbs `right`'s content and adopts its `right`/`right_origin`.
    /// The caller still owns removing `right` from the store.
    pub fn merge_with(&mut self, right: &Item) -> bool {
        // map entries are discrete assignments, never a content run - folding
        // two together would blur which one is "the" current value.
        if self.parent_sub.is_some() || right.parent_sub.is_some() {
            return false;
        }
        if self.id.client != right.id.client
            || self.clock_end() != right.id.clock
            || self.deleted != right.deleted
            || self.parent != right.parent
            || self.parent_sub != right.parent_sub
            || right.origin != Some(self.last_id())
            || right.left != Some(self.id)
        {
            return false;
        }
        if !self.content.merge(right.content.clone()) {
            return false;
        }
        self.right = right.right;
        self.right_origin = right.right_origin;
        true
    }
}

/// A single struct in a client's append-only log: either a content-carrying
/// [`Item`] or a collapsed [`GcBlock`] placeholder.
#[derive(Debug, Clone, PartialEq)]
pub enum Block {
    Item(Item),
    Gc(GcBlock),
}

/// "A run of `length` units once existed here, content discarded." Retains
/// only the clock interval so binary search over a client's struct array
/// keeps working; no linked-list cell, no content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcBlock {
    pub id: ID,
    pub len: u32,
}

impl Block {
    pub fn id(&self) -> ID {
        match self {
            Block::Item(i) => i.id,
            Block::Gc(g) => g.id,
        }
    }

    pub fn len(&self) -> u32 {
        match self {
            Block::Item(i) => i.len(),
            Block::Gc(g) => g.len,
        }
    }

    pub fn clock_end(&self) -> u32 {
        self.id().clock + self.len()
    }

    /// Always `false` - a struct with zero content units is never created.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether this struct's clock range is currently deleted/discarded. A
    /// GC block is deleted by definition; an Item depends on its flag.
    pub fn is_deleted(&self) -> bool {
        match self {
            Block::Item(i) => i.deleted,
            Block::Gc(_) => true,
        }
    }

    pub fn as_item(&self) -> Option<&Item> {
        match self {
            Block::Item(i) => Some(i),
            Block::Gc(_) => None,
        }
    }

    pub fn as_item_mut(&mut self) -> Option<&mut Item> {
        match self {
            Block::Item(i) => Some(i),
            Block::Gc(_) => None,
        }
    }

    /// Splits this block at clock offset `diff` from its start, in place,
    /// returning the right-hand half. A GC block splits arithmetically; an
    /// Item delegates to [`Item::split_at`].
    pub fn split_at(&mut self, diff: u32) -> Block {
        match self {
            Block::Item(item) => Block::Item(item.split_at(diff)),
            Block::Gc(gc) => {
                let right = GcBlock {
                    id: ID::new(gc.id.client, gc.id.clock + diff),
                    len: gc.len - diff,
                };
                gc.len = diff;
                Block::Gc(right)
            }
        }
    }

    /// Attempts to merge `right` onto the end of `self`.
    pub fn merge_with(&mut self, right: &Block) -> bool {
        match (self, right) {
            (Block::Item(a), Block::Item(b)) => a.merge_with(b),
            (Block::Gc(a), Block::Gc(b))
                if a.id.client == b.id.client && a.id.clock + a.len == b.id.clock => {
                    a.len += b.len;
                    true
                }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utf16(s: &str) -> SmallVec<[u16; 16]> {
        s.encode_utf16().collect()
    }

    fn sample_item(client: u64, clock: u32, text: &str) -> Item {
        Item {
            id: ID::new(client, clock),
            left: None,
            right: None,
            origin: None,
            right_origin: None,
            parent: ParentRef::Root(Rc::from("root")),
            parent_sub: None,
            deleted: false,
            content: ItemContent::String(utf16(text)),
        }
    }

    #[test]
    fn split_then_merge_round_trips() {
        let mut left = sample_item(1, 0, "abcdef");
        let mut right = left.split_at(3);
        assert_eq!(left.content, ItemContent::String(utf16("abc")));
        assert_eq!(right.content, ItemContent::String(utf16("def")));
        assert_eq!(right.id, ID::new(1, 3));
        assert_eq!(right.origin, Some(ID::new(1, 2)));
        assert_eq!(left.right, Some(right.id));

        assert!(left.merge_with(&right));
        assert_eq!(left.content, ItemContent::String(utf16("abcdef")));
        assert_eq!(left.len(), 6);
        right.deleted = true; // right is now logically gone; silence unused-mut warnings in some configs
        let _ = right;
    }

    #[test]
    fn merge_rejects_mismatched_client() {
        let mut a = sample_item(1, 0, "ab");
        let mut b = sample_item(2, 2, "cd");
        b.origin = Some(a.last_id());
        b.left = Some(a.id);
        assert!(!a.merge_with(&b));
        let _ = &mut a;
    }

    #[test]
    fn gc_block_split_and_merge() {
        let mut gc = GcBlock {
            id: ID::new(5, 0),
            len: 10,
        };
        let mut block = Block::Gc(gc);
        let right = block.split_at(4);
        if let Block::Gc(g) = &block {
            gc = *g;
        }
        assert_eq!(gc.len, 4);
        assert!(block.merge_with(&right));
        if let Block::Gc(g) = &block {
            assert_eq!(g.len, 10);
        } else {
            panic!("expected gc");
        }
    }
}
