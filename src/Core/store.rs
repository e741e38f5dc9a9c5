// Durable store seam. The queue never talks to disk itself; it records
// references through this trait and commits them with a continuation.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, trace};

use crate::Queue::Structs::Message;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store resources exhausted")]
    ResourcesExhausted,
    #[error("unknown store reference {0:?}")]
    UnknownReference(StoreRef),
    #[error("store unavailable")]
    Unavailable,
}

/// Handle to the store-side record linking a message to its queue position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StoreRef(pub u64);

/// Delivery state recorded on a durable reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceState {
    Available,
    Delivered,
    Received,
}

/// Work that must run once the store has made staged changes durable.
pub type Continuation = Box<dyn FnOnce() + Send + 'static>;

/// Result of a store commit.
pub enum Commit {
    /// Committed synchronously. The continuation is handed back for the caller
    /// to run inline, keeping the call stack flat.
    Done(Continuation),
    /// The store kept the continuation and will run it on one of its own
    /// threads once the commit completes.
    Pending,
}

impl std::fmt::Debug for Commit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Commit::Done(_) => f.write_str("Commit::Done(..)"),
            Commit::Pending => f.write_str("Commit::Pending"),
        }
    }
}

pub trait DurableStore: Send + Sync {
    /// Whether persistent messages put to queues on this store are recorded.
    fn is_durable(&self) -> bool;

    /// Reserve room for `count` references before the put claims a slot.
    fn reserve(&self, count: usize) -> Result<(), StoreError>;

    fn cancel_reservation(&self, count: usize);

    /// Create a reference, consuming one reservation.
    fn create_reference(&self, order_id: u64, message: &Message) -> Result<StoreRef, StoreError>;

    fn update_reference(&self, store_ref: StoreRef, state: ReferenceState) -> Result<(), StoreError>;

    fn delete_reference(&self, store_ref: StoreRef) -> Result<(), StoreError>;

    fn commit(&self, continuation: Continuation) -> Commit;

    fn rollback(&self);
}

/// Store for non-persistent queues: nothing is recorded, every commit is synchronous.
#[derive(Debug, Default)]
pub struct NoStore;

impl DurableStore for NoStore {
    fn is_durable(&self) -> bool {
        false
    }

    fn reserve(&self, _count: usize) -> Result<(), StoreError> {
        Ok(())
    }

    fn cancel_reservation(&self, _count: usize) {}

    fn create_reference(&self, _order_id: u64, _message: &Message) -> Result<StoreRef, StoreError> {
        Err(StoreError::Unavailable)
    }

    fn update_reference(&self, store_ref: StoreRef, _state: ReferenceState) -> Result<(), StoreError> {
        Err(StoreError::UnknownReference(store_ref))
    }

    fn delete_reference(&self, store_ref: StoreRef) -> Result<(), StoreError> {
        Err(StoreError::UnknownReference(store_ref))
    }

    fn commit(&self, continuation: Continuation) -> Commit {
        Commit::Done(continuation)
    }

    fn rollback(&self) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredReference {
    pub order_id: u64,
    pub state: ReferenceState,
    pub payload_len: usize,
}

/// An in-memory durable store.
///
/// References live in a map. In asynchronous mode commits park their
/// continuations until [`MemoryStore::complete_pending`] runs them, which is
/// how tests drive the pending paths of the queue.
#[derive(Default)]
pub struct MemoryStore {
    references: Mutex<HashMap<u64, StoredReference>>,
    next_ref: AtomicU64,
    reserved: AtomicUsize,
    asynchronous: AtomicBool,
    fail_reservations: AtomicBool,
    pending: Mutex<VecDeque<Continuation>>,
    commits: AtomicU64,
    rollbacks: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start in asynchronous commit mode.
    pub fn asynchronous() -> Self {
        let store = Self::new();
        store.set_asynchronous(true);
        store
    }

    pub fn set_asynchronous(&self, on: bool) {
        self.asynchronous.store(on, Ordering::Release);
    }

    /// Make subsequent reservations fail with `ResourcesExhausted`.
    pub fn fail_reservations(&self, fail: bool) {
        self.fail_reservations.store(fail, Ordering::Release);
    }

    pub fn reference_count(&self) -> usize {
        self.references.lock().len()
    }

    pub fn reference(&self, store_ref: StoreRef) -> Option<StoredReference> {
        self.references.lock().get(&store_ref.0).cloned()
    }

    pub fn reserved(&self) -> usize {
        self.reserved.load(Ordering::Acquire)
    }

    pub fn pending_commits(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    pub fn rollbacks(&self) -> u64 {
        self.rollbacks.load(Ordering::Relaxed)
    }

    /// Run every parked continuation, including any parked while running.
    /// Returns how many ran.
    pub fn complete_pending(&self) -> usize {
        let mut ran = 0;
        loop {
            // never hold the lock while a continuation runs: it may commit again
            let next = self.pending.lock().pop_front();
            let Some(continuation) = next else {
                return ran;
            };
            continuation();
            ran += 1;
        }
    }
}

impl DurableStore for MemoryStore {
    fn is_durable(&self) -> bool {
        true
    }

    fn reserve(&self, count: usize) -> Result<(), StoreError> {
        if self.fail_reservations.load(Ordering::Acquire) {
            return Err(StoreError::ResourcesExhausted);
        }
        self.reserved.fetch_add(count, Ordering::AcqRel);
        Ok(())
    }

    fn cancel_reservation(&self, count: usize) {
        let _ = self
            .reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| Some(r.saturating_sub(count)));
    }

    fn create_reference(&self, order_id: u64, message: &Message) -> Result<StoreRef, StoreError> {
        self.cancel_reservation(1);
        let id = self.next_ref.fetch_add(1, Ordering::Relaxed) + 1;
        self.references.lock().insert(
            id,
            StoredReference {
                order_id,
                state: ReferenceState::Available,
                payload_len: message.len(),
            },
        );
        trace!(store_ref = id, order_id, "reference created");
        Ok(StoreRef(id))
    }

    fn update_reference(&self, store_ref: StoreRef, state: ReferenceState) -> Result<(), StoreError> {
        match self.references.lock().get_mut(&store_ref.0) {
            Some(reference) => {
                reference.state = state;
                Ok(())
            }
            None => Err(StoreError::UnknownReference(store_ref)),
        }
    }

    fn delete_reference(&self, store_ref: StoreRef) -> Result<(), StoreError> {
        self.references
            .lock()
            .remove(&store_ref.0)
            .map(|_| ())
            .ok_or(StoreError::UnknownReference(store_ref))
    }

    fn commit(&self, continuation: Continuation) -> Commit {
        self.commits.fetch_add(1, Ordering::Relaxed);
        if self.asynchronous.load(Ordering::Acquire) {
            self.pending.lock().push_back(continuation);
            debug!("store commit parked");
            Commit::Pending
        } else {
            Commit::Done(continuation)
        }
    }

    fn rollback(&self) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("references", &self.reference_count())
            .field("reserved", &self.reserved())
            .field("pending_commits", &self.pending_commits())
            .field("asynchronous", &self.asynchronous.load(Ordering::Relaxed))
            .finish()
    }
}
