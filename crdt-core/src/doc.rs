use crate::block::ParentRef;
use crate::branch::Branch;
use crate::id_set::DeleteSet;
use crate::observer::{Observer, Subscription};
use crate::state_vector::StateVector;
use crate::store::StructStore;
use crate::transaction::{Origin, TransactionMut, TransactionState};
use crate::update::PendingUpdate;
use atomic_refcell::AtomicRefCell;
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

/// Construction-time configuration for a [`Doc`], the analogue of the
/// teacher's `yrs::doc::Options` - there is no file- or env-based config
/// layer here, only this struct, because the engine is an embedded library
/// rather than a standalone service.
#[derive(Debug, Clone)]
pub struct Options {
    /// This process's random client id.
    pub client_id: u64,
    /// When true, deleted items are never collapsed into GC placeholders -
    /// useful for snapshot/time-travel use cases that need tombstone content.
    pub skip_gc: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            client_id: rand::thread_rng().gen(),
            skip_gc: false,
        }
    }
}

/// An outbound update, ready to be sent to other replicas.
#[derive(Debug, Clone)]
pub struct UpdateEvent {
    pub update: Vec<u8>,
}

/// Snapshot of a transaction at one of its three dispatch points
/// (`beforeTransaction`, `afterTransaction`, `afterTransactionCleanup`).
#[derive(Debug, Clone)]
pub struct TransactionEvent {
    pub origin: Origin,
    pub before_state: StateVector,
    pub after_state: StateVector,
    pub delete_set: DeleteSet,
}

#[derive(Default)]
pub(crate) struct DocEvents {
    pub before_transaction: Observer<TransactionEvent>,
    pub after_transaction: Observer<TransactionEvent>,
    pub after_transaction_cleanup: Observer<TransactionEvent>,
    pub update: Observer<UpdateEvent>,
}

pub(crate) struct Inner {
    pub options: Options,
    pub store: StructStore,
    pub branches: HashMap<ParentRef, Branch>,
    pub pending: Option<PendingUpdate>,
    pub pending_ds: Option<DeleteSet>,
    pub events: DocEvents,
    pub current: Option<TransactionState>,
    pub queue: VecDeque<TransactionState>,
    pub draining: bool,
}

/// A document: the struct store, the root-type registry, pending-update
/// parking lots, and the document-level observer lists (spec.md §6). Cheap
/// to clone - it is a reference-counted handle, matching the teacher's
/// `StoreRef`/`Doc` split (we do not need `Arc`+`Send` since the engine is
/// single-threaded cooperative, spec.md §5).
#[derive(Clone)]
pub struct Doc(pub(crate) Rc<AtomicRefCell<Inner>>);

impl Doc {
    pub fn new() -> Self {
        Self::with_options(Options::default())
    }

    pub fn with_options(options: Options) -> Self {
        Doc(Rc::new(AtomicRefCell::new(Inner {
            options,
            store: StructStore::new(),
            branches: HashMap::new(),
            pending: None,
            pending_ds: None,
            events: DocEvents::default(),
            current: None,
            queue: VecDeque::new(),
            draining: false,
        })))
    }

    pub fn client_id(&self) -> u64 {
        self.0.borrow().options.client_id
    }

    pub fn get_state_vector(&self) -> StateVector {
        self.0.borrow().store.get_state_vector()
    }

    /// Ensures a root type named `name` exists, creating it if this is the
    /// first reference to it, and returns a key usable with transaction
    /// mutation methods.
    pub fn get_or_create_type(&self, name: &str) -> ParentRef {
        let key: Rc<str> = Rc::from(name);
        let parent = ParentRef::Root(key.clone());
        let mut inner = self.0.borrow_mut();
        inner
            .branches
            .entry(parent.clone())
            .or_insert_with(|| Branch::root(key));
        parent
    }

    /// Opens (or reuses, if nested) a transaction, runs `f`, and - if this
    /// call is the one that created the transaction - drains the cleanup
    /// queue in FIFO order once `f` returns (spec.md §4.5).
    pub fn transact_mut<F, R>(&self, origin: Origin, f: F) -> R
    where
        F: FnOnce(&mut TransactionMut) -> R,
    {
        let created = {
            let mut inner = self.0.borrow_mut();
            if inner.current.is_some() {
                false
            } else {
                let before_state = inner.store.get_state_vector();
                inner.current = Some(TransactionState::new(origin.clone(), before_state.clone()));
                inner.queue.push_back(TransactionState::new(origin.clone(), before_state.clone()));
                // the queue entry above is a placeholder reserving FIFO order;
                // it is replaced with the real (mutated) state once `f` returns.
                true
            }
        };

        if created {
            let event = TransactionEvent {
                origin: origin.clone(),
                before_state: self.0.borrow().current.as_ref().unwrap().before_state.clone(),
                after_state: StateVector::new(),
                delete_set: DeleteSet::new(),
            };
            let before_transaction = self.0.borrow().events.before_transaction.clone();
            before_transaction.trigger(&event);
        }

        let mut handle = TransactionMut { doc: self.clone() };
        let result = f(&mut handle);

        if created {
            let finished = self.0.borrow_mut().current.take().unwrap();
            {
                let mut inner = self.0.borrow_mut();
                // replace the FIFO placeholder pushed above with the real state
                if let Some(slot) = inner.queue.back_mut() {
                    *slot = finished;
                }
            }

            let already_draining = {
                let inner = self.0.borrow();
                inner.draining
            };
            if !already_draining {
                self.0.borrow_mut().draining = true;
                loop {
                    let next = self.0.borrow_mut().queue.pop_front();
                    match next {
                        Some(tx_state) => crate::transaction::close(self, tx_state),
                        None => break,
                    }
                }
                self.0.borrow_mut().draining = false;
            }
        }

        result
    }

    pub fn observe_before_transaction<F>(&self, f: F) -> Subscription<TransactionEvent>
    where
        F: Fn(&TransactionEvent) + 'static,
    {
        self.0.borrow().events.before_transaction.subscribe(f)
    }

    pub fn observe_after_transaction<F>(&self, f: F) -> Subscription<TransactionEvent>
    where
        F: Fn(&TransactionEvent) + 'static,
    {
        self.0.borrow().events.after_transaction.subscribe(f)
    }

    pub fn observe_after_transaction_cleanup<F>(&self, f: F) -> Subscription<TransactionEvent>
    where
        F: Fn(&TransactionEvent) + 'static,
    {
        self.0
            .borrow()
            .events
            .after_transaction_cleanup
            .subscribe(f)
    }

    pub fn observe_update<F>(&self, f: F) -> Subscription<UpdateEvent>
    where
        F: Fn(&UpdateEvent) + 'static,
    {
        self.0.borrow().events.update.subscribe(f)
    }

    pub fn with_branch<R>(&self, parent: &ParentRef, f: impl FnOnce(&Branch, &StructStore) -> R) -> R {
        let inner = self.0.borrow();
        let branch = inner.branches.get(parent).expect("branch must be registered");
        f(branch, &inner.store)
    }
}

impl Default for Doc {
    fn default() -> Self {
        Self::new()
    }
}
