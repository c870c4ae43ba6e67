//! Dispatcher Core
//!
//! Status aggregation, goal resolution, topology planning, command gating,
//! the reconciliation solver, the timeout/retry supervisor and the
//! delayed command scheduler — everything one reconciliation tick is
//! built from.
//!
//! [`reconciler::Reconciler`] is the entry point a binary or a test drives
//! directly; every other module is an implementation detail one tick is
//! built from.

pub mod aggregate;
pub mod gate;
pub mod goal;
pub mod hypervisor;
pub mod reconciler;
pub mod scheduler;
pub mod solver;
pub mod state;
pub mod supervisor;
pub mod topology;

pub use hypervisor::{Hypervisor, NoopHypervisor};
pub use reconciler::Reconciler;
