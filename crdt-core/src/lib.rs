//! An operation-based CRDT replication engine: a per-client append-only
//! struct store, a YATA-resolved linked-list/map shared-type contract,
//! transactions with deferred observer dispatch, and a binary update codec
//! for exchanging changes between replicas (see `SPEC_FULL.md`).

pub mod block;
pub mod branch;
pub mod doc;
pub mod error;
pub mod id;
pub mod id_set;
pub mod observer;
pub mod state_vector;
pub mod store;
pub mod transaction;
pub mod update;

pub use block::{ItemContent, ParentRef, Value};
pub use branch::{Branch, ChangeEvent};
pub use doc::{Doc, Options, TransactionEvent, UpdateEvent};
pub use error::{Error, Result};
pub use id::ID;
pub use id_set::DeleteSet;
pub use observer::Subscription;
pub use state_vector::StateVector;
pub use transaction::{Origin, TransactionMut};
pub use update::{encode_state_as_update, PendingUpdate, Update};
