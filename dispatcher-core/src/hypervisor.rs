//! The hypervisor collaborator: an opaque escape hatch the reconciler
//! calls into but never implements itself.
//!
//! Deliberately thin, in the same spirit as a watchdog trait: it captures
//! the operations the core needs without mandating how a restart or a
//! full reset is actually carried out.

use async_trait::async_trait;
use dispatcher_common::types::NodeId;
use tracing::warn;

/// Outbound collaborator for the two escape-hatch operations: a targeted
/// restart hint and a full reset.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Restart hint for one reader process that has been timing out.
    async fn handle_timeout(&self, host: &NodeId);

    /// Full-system reset, invoked after bounded retries are exhausted.
    async fn tactical_nuclear_option(&self);
}

/// Log-only [`Hypervisor`] for tests and for operators who have not wired
/// a real restart mechanism yet.
#[derive(Debug, Default)]
pub struct NoopHypervisor;

#[async_trait]
impl Hypervisor for NoopHypervisor {
    async fn handle_timeout(&self, host: &NodeId) {
        warn!(%host, "hypervisor.handle_timeout called against a no-op implementation");
    }

    async fn tactical_nuclear_option(&self) {
        warn!("hypervisor.tactical_nuclear_option called against a no-op implementation");
    }
}
