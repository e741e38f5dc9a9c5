// Error taxonomy shared by every queue operation.

use thiserror::Error;

use super::store::StoreError;

/// Errors returned synchronously to callers of the queue.
///
/// Capacity and policy errors are recoverable from the caller's point of view.
/// Protocol breaches never appear here: they halt the process through
/// [`crate::Core::fatal::halt`] after logging diagnostics.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// The buffered message limit was reached and the policy rejects new messages.
    #[error("destination full")]
    DestinationFull,

    /// The durable store could not reserve resources for the message.
    #[error("server capacity constrained")]
    ServerCapacity,

    /// Puts to this queue are disabled by policy (or the queue is deleted).
    #[error("send not allowed")]
    SendNotAllowed,

    /// A page could not be allocated.
    #[error("allocation failure: {0}")]
    AllocationFailure(&'static str),

    /// A consumer is already attached to the queue.
    #[error("waiter in use")]
    WaiterInUse,

    /// The consumer is disconnected or being disconnected.
    #[error("waiter invalid")]
    WaiterInvalid,

    /// The consumer is already enabled.
    #[error("waiter already enabled")]
    WaiterEnabled,

    /// The consumer is already disabled.
    #[error("waiter already disabled")]
    WaiterDisabled,

    /// The queue has been marked deleted.
    #[error("queue deleted")]
    QueueDeleted,

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Control-flow signal for operations that may suspend at the durable store
/// commit boundary.
///
/// `Pending` is not an error: the remainder of the operation runs in a
/// continuation registered with the store, and callers must propagate the
/// signal rather than wait for it.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Done,
    Pending,
}

impl Completion {
    pub fn is_pending(self) -> bool {
        matches!(self, Completion::Pending)
    }

    /// Combine two completions: pending wins.
    pub fn and(self, other: Completion) -> Completion {
        if self.is_pending() || other.is_pending() {
            Completion::Pending
        } else {
            Completion::Done
        }
    }
}
