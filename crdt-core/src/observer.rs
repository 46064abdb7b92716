use std::cell::RefCell;
use std::rc::Rc;

type Callback<T> = Rc<dyn Fn(&T)>;
type CallbackVec<T> = RefCell<Vec<(u32, Callback<T>)>>;

/// A small pub/sub list, grounded on the teacher's `Observer<T>` /
/// `Subscription` pattern: subscribing returns a guard that removes the
/// callback from the list when dropped, so a caller never has to remember to
/// unregister by hand.
pub struct Observer<T> {
    next_id: Rc<RefCell<u32>>,
    callbacks: Rc<CallbackVec<T>>,
}

impl<T> Default for Observer<T> {
    fn default() -> Self {
        Observer {
            next_id: Rc::new(RefCell::new(0)),
            callbacks: Rc::new(RefCell::new(Vec::new())),
        }
    }
}

/// Cheap - both fields are reference-counted, so a clone shares the same
/// subscriber list. Used to `trigger` an event without holding whatever
/// outer borrow (e.g. of the document) the [`Observer`] itself lives behind,
/// so a callback is free to start a new mutation of that same state.
impl<T> Clone for Observer<T> {
    fn clone(&self) -> Self {
        Observer {
            next_id: self.next_id.clone(),
            callbacks: self.callbacks.clone(),
        }
    }
}

impl<T> Observer<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.borrow().is_empty()
    }

    pub fn subscribe<F>(&self, f: F) -> Subscription<T>
    where
        F: Fn(&T) + 'static,
    {
        let id = {
            let mut next = self.next_id.borrow_mut();
            let id = *next;
            *next += 1;
            id
        };
        self.callbacks.borrow_mut().push((id, Rc::new(f)));
        Subscription {
            id,
            registry: Rc::downgrade(&self.callbacks),
        }
    }

    /// Invokes every currently-registered callback with `event`. Callbacks
    /// are cloned out (cheap - `Rc` bump) before iterating, so a callback
    /// that subscribes or unsubscribes another observer mid-call cannot
    /// deadlock or invalidate the list being iterated.
    pub fn trigger(&self, event: &T) {
        let snapshot: Vec<_> = self.callbacks.borrow().iter().map(|(_, cb)| cb.clone()).collect();
        for cb in snapshot {
            cb(event);
        }
    }
}

/// Unsubscribes its callback from the owning [`Observer`] when dropped.
pub struct Subscription<T> {
    id: u32,
    registry: std::rc::Weak<CallbackVec<T>>,
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.borrow_mut().retain(|(id, _)| *id != self.id);
        }
    }
}
