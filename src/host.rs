//! The host framework's side of the driver contract.
//!
//! The host supplies work and consumes results; the driver calls these
//! methods from inside its scan loop. Every work item handed over via
//! [`Host::get_queued`] comes back exactly once, either through
//! [`Host::submit_nonce`] followed by retirement or directly through
//! [`Host::work_completed`].

use async_trait::async_trait;

use crate::job::WorkItem;

#[async_trait]
pub trait Host: Send + Sync {
    /// Pull the next work item queued for `chain_id`, if any.
    async fn get_queued(&self, chain_id: usize) -> Option<WorkItem>;

    /// Offer a found nonce. Returns `false` if the nonce does not meet
    /// the work's target (a hardware error on the chip that found it).
    async fn submit_nonce(&self, work: &WorkItem, nonce: u32) -> bool;

    /// Return a retired work item to the host. Called when a queue slot
    /// is overwritten, on flush/abort, and when dispatch fails.
    async fn work_completed(&self, work: WorkItem);
}
