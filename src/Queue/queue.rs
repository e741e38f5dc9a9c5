// The paged queue: one chain of pages, three independently guarded cursors
// and the waiter status of its single consumer.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crossbeam_utils::CachePadded;
use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::{debug, warn};

use super::consumer::Consumer;
use super::expiry::ExpiryTracker;
use super::get::{Pass, StagedBatch};
use super::stats::{ConsumerStats, QueueCounters, QueueStatistics};
use super::Page::arena::PageArena;
use super::Page::{Page, SlotState};
use crate::Core::config::{EngineContext, QueuePolicy};
use crate::Core::error::{Completion, QueueError};
use crate::Core::store::{DurableStore, StoreRef};
use crate::Core::waiter::{QueueLock, WaiterState, WaiterStatus};

/// A slot address: page plus index within it. Index `capacity` is the
/// end-of-page entry.
#[derive(Clone)]
pub(crate) struct Position {
    pub(crate) page: Arc<Page>,
    pub(crate) slot: usize,
}

pub(crate) struct TailState {
    pub(crate) pos: Position,
    pub(crate) next_order_id: u64,
}

pub(crate) struct CursorState {
    pub(crate) pos: Position,
    /// Delivered-but-unacknowledged slots at or below this order id are
    /// offered again. Zero when no redelivery is in progress.
    pub(crate) redeliver_order_id: u64,
}

/// Why a message left the queue, for accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Removal {
    Consumed,
    Discarded,
    Expired,
}

/// A message queue with a single consumer.
///
/// Producers append under the tail lock. Delivery is driven by whichever
/// thread wins the waiter status, which also owns the delivery cursor.
/// Reclamation of consumed pages runs under the head lock. The three never
/// nest except in [`PagedQueue::drain`].
pub struct PagedQueue {
    pub(crate) me: Weak<PagedQueue>,
    pub(crate) name: Arc<str>,
    pub(crate) ctx: Arc<EngineContext>,
    pub(crate) policy: RwLock<QueuePolicy>,
    pub(crate) store: Arc<dyn DurableStore>,
    pub(crate) arena: PageArena,

    pub(crate) head: CachePadded<Mutex<Position>>,
    pub(crate) tail: CachePadded<Mutex<TailState>>,
    /// Owned by the waiter lock holder; the mutex only catches misuse.
    pub(crate) cursor: Mutex<CursorState>,
    /// Sequence number of the page the cursor is on. Pages below it may be freed.
    pub(crate) cursor_page_seq: AtomicU64,
    pub(crate) reset_cursor: AtomicBool,
    pub(crate) redeliver_request: AtomicU64,

    pub(crate) waiter: WaiterStatus,
    pub(crate) consumer: RwLock<Option<Arc<dyn Consumer>>>,
    pub(crate) counters: QueueCounters,
    pub(crate) expiry: Mutex<ExpiryTracker>,
    pub(crate) reported_full: AtomicBool,
    pub(crate) inform_on_empty: AtomicBool,
    pub(crate) deleted: AtomicBool,
    pub(crate) next_delivery_id: AtomicU32,
    /// A staged batch waiting on an asynchronous store commit.
    pub(crate) parked: Mutex<Option<StagedBatch>>,
}

impl PagedQueue {
    pub(crate) fn create(
        name: Arc<str>,
        ctx: Arc<EngineContext>,
        policy: QueuePolicy,
        store: Arc<dyn DurableStore>,
        page_size: Option<usize>,
    ) -> Result<Arc<Self>, QueueError> {
        let arena = PageArena::new(name.clone(), ctx.clone(), page_size);
        // the page after the one being filled always exists before the tail reaches it
        let first = arena.create_page()?;
        let second = arena.create_page()?;
        first.link_next(&second);

        let start = Position {
            page: first.clone(),
            slot: 0,
        };
        debug!(queue = %name, page_seq = first.seq(), "queue created");
        Ok(Arc::new_cyclic(|me| Self {
            me: me.clone(),
            name,
            ctx,
            policy: RwLock::new(policy),
            store,
            arena,
            head: CachePadded::new(Mutex::new(start.clone())),
            tail: CachePadded::new(Mutex::new(TailState {
                pos: start.clone(),
                next_order_id: 1,
            })),
            cursor: Mutex::new(CursorState {
                pos: start,
                redeliver_order_id: 0,
            }),
            cursor_page_seq: AtomicU64::new(first.seq()),
            reset_cursor: AtomicBool::new(false),
            redeliver_request: AtomicU64::new(0),
            waiter: WaiterStatus::new(),
            consumer: RwLock::new(None),
            counters: QueueCounters::default(),
            expiry: Mutex::new(ExpiryTracker::default()),
            reported_full: AtomicBool::new(false),
            inform_on_empty: AtomicBool::new(false),
            deleted: AtomicBool::new(false),
            next_delivery_id: AtomicU32::new(0),
            parked: Mutex::new(None),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> QueuePolicy {
        self.policy.read().clone()
    }

    /// Swap in a new policy. A raised inflight limit resumes delivery; a
    /// lowered message limit evicts immediately under discard-oldest.
    pub fn update_policy(&self, policy: QueuePolicy) {
        *self.policy.write() = policy;
        debug!(queue = %self.name, "policy updated");
        // a pending delivery is finished by its store continuation
        let _ = self.check_waiters();
        self.enforce_message_limit();
    }

    pub fn store(&self) -> &Arc<dyn DurableStore> {
        &self.store
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    pub fn buffered(&self) -> u64 {
        self.counters.buffered()
    }

    pub fn inflight(&self) -> u64 {
        self.counters.inflight()
    }

    pub fn live_pages(&self) -> usize {
        self.arena.live_pages()
    }

    pub fn statistics(&self) -> QueueStatistics {
        let max = self.policy.read().max_message_count;
        self.counters.snapshot(max)
    }

    pub fn reset_statistics(&self) {
        self.counters.reset();
    }

    pub fn consumer_stats(&self) -> ConsumerStats {
        ConsumerStats {
            inflight: self.counters.inflight(),
            max_inflight: self.policy.read().max_inflight,
            waiter: self.waiter.load(),
            delivery_status: self.waiter.delivery_status(),
            connected: self.consumer.read().is_some(),
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    /// Refuse further puts and enables.
    pub fn mark_deleted(&self) {
        if !self.deleted.swap(true, Ordering::AcqRel) {
            debug!(queue = %self.name, buffered = self.buffered(), "queue marked deleted");
        }
    }

    pub(crate) fn strong(&self) -> Arc<Self> {
        match self.me.upgrade() {
            Some(queue) => queue,
            None => crate::breach!("queue used while being released", queue = self.name),
        }
    }

    pub(crate) fn cursor_guard(&self) -> MutexGuard<'_, CursorState> {
        match self.cursor.try_lock() {
            Some(cursor) => cursor,
            None => crate::breach!(
                "delivery cursor contended",
                queue = self.name,
                waiter = self.waiter.load()
            ),
        }
    }

    pub(crate) fn allocate_delivery_id(&self) -> u32 {
        loop {
            let id = self.next_delivery_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if id != 0 {
                return id;
            }
        }
    }

    /// Account for a message that has left its slot.
    pub(crate) fn account_removal(&self, removal: Removal, was_inflight: bool, order_id: u64, had_expiry: bool) {
        let remaining = self.counters.record_removal();
        self.ctx.sub_buffered(1);
        let counter = match removal {
            Removal::Consumed => &self.counters.dequeued,
            Removal::Discarded => &self.counters.discarded,
            Removal::Expired => &self.counters.expired,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if was_inflight {
            self.counters.sub_inflight();
        }
        if had_expiry {
            self.expiry.lock().remove(order_id);
        }
        if remaining == 0 {
            self.reported_full.store(false, Ordering::Release);
        }
    }

    /// Delete a durable reference without waiting for the outcome.
    pub(crate) fn forget_reference(&self, store_ref: Option<StoreRef>) {
        if let Some(store_ref) = store_ref {
            if let Err(err) = self.store.delete_reference(store_ref) {
                warn!(queue = %self.name, ?store_ref, %err, "failed to delete store reference");
            }
        }
    }

    /// Remove every slot in `victims`, each already marked `Discarding`.
    pub(crate) fn discard_slots(&self, victims: Vec<Position>, removal: Removal) -> u64 {
        let mut removed = 0;
        for victim in victims {
            let Some(slot) = victim.page.slot(victim.slot) else {
                crate::breach!("discard of end-of-page entry", queue = self.name);
            };
            let (order_id, had_expiry, store_ref) = {
                let mut node = slot.lock();
                if node.state != SlotState::Discarding {
                    crate::breach!("discard of slot in wrong state", queue = self.name, state = node.state);
                }
                let facts = (node.order_id, node.expiry().is_some(), node.store_ref);
                node.consume();
                facts
            };
            self.forget_reference(store_ref);
            self.account_removal(removal, false, order_id, had_expiry);
            removed += 1;
        }
        removed
    }

    /// Release a lock taken for a queue operation. A delivering lock promised
    /// to re-check for messages, so that happens here.
    pub(crate) fn unlock_after_operation(&self, lock: QueueLock) -> Completion {
        if lock.held == WaiterState::DisabledLockedWait {
            self.waiter.unlock_locked_wait(lock);
            return Completion::Done;
        }
        match self.release_after_delivery() {
            Pass::Recheck => self.check_waiters(),
            Pass::Finished => Completion::Done,
            Pass::Pending => Completion::Pending,
        }
    }

    /// At or above the message limit: expire what we can, then evict if the
    /// policy discards old messages.
    pub(crate) fn enforce_message_limit(&self) {
        let policy = self.policy.read().clone();
        if policy.max_message_count == 0 || self.counters.buffered() < policy.max_message_count {
            return;
        }
        if self.expiry.lock().with_expiry() > 0 {
            let _ = self.reap_expired(self.ctx.now_secs(), false);
        }
        if policy.max_msg_behavior == crate::Core::config::MaxMessageBehavior::DiscardOldMessages {
            let _ = self.reclaim_space();
        }
    }
}

impl Drop for PagedQueue {
    fn drop(&mut self) {
        let buffered = self.counters.buffered();
        if buffered > 0 {
            self.ctx.sub_buffered(buffered);
        }
        debug!(queue = %self.name, buffered, "queue released");
    }
}
