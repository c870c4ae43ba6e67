//! Dispatcher Store
//!
//! The [`Store`] trait is the dispatcher's only window onto the external
//! world: the goal directive stream, the node status bulletin, the
//! pending/outgoing command areas, and the run-record collection. Two
//! implementations ship here:
//!
//! - [`SledStore`] — a real, persistent implementation backed by an
//!   embedded `sled` database, one tree per logical collection.
//! - [`MemoryStore`] — an in-process double used by `dispatcher-core`'s
//!   tests, so the reconciliation logic is exercised without a database.
//!
//! Any durable FIFO that supports per-message acknowledgement stamping
//! can stand in here, provided it preserves the trait's semantics — the
//! trait is the substitutable seam.

pub mod error;
pub mod memory;
pub mod sled_store;
pub mod store;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use sled_store::SledStore;
pub use store::{CommandId, PendingCommand, Store};
