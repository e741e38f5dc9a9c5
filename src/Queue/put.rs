// Put path: policy check, optional hand-off to an idle consumer, then
// claim-and-publish at the tail.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use super::consumer::Delivery;
use super::expiry::ExpiryEntry;
use super::get::Pass;
use super::queue::{PagedQueue, Position};
use super::Page::{NextStatus, Page, SlotState};
use super::Structs::{Message, MessageFlags, MessageState, PutOptions, Reliability};
use crate::Core::config::{MaxMessageBehavior, QueuePolicy};
use crate::Core::error::{Completion, QueueError};
use crate::Core::store::{Commit, StoreError, StoreRef};
use crate::Core::transaction::{Transaction, TransactionRecord};
use crate::Core::waiter::{PendingFlags, WaiterState};

/// A tail slot claimed by one put, not yet published.
#[derive(Clone)]
pub(crate) struct Claim {
    pub(crate) page: Arc<Page>,
    pub(crate) slot: usize,
    pub(crate) order_id: u64,
}

impl PagedQueue {
    /// Put a message on the queue.
    ///
    /// Under a transaction the slot and sequence number are claimed now but
    /// the message only becomes visible when the transaction commits.
    /// `Ok(Completion::Pending)` means a durable put is waiting on the store
    /// and will publish from the store's continuation.
    pub fn put(
        &self,
        message: Message,
        options: PutOptions,
        tran: Option<&mut Transaction>,
    ) -> Result<Completion, QueueError> {
        let policy = self.policy.read().clone();
        self.check_put_policy(&policy, &options)?;

        let message = Arc::new(message);
        if tran.is_none()
            && message.reliability() == Reliability::AtMostOnce
            && self.counters.buffered() == 0
            && self.try_bypass(&message, &options)
        {
            return Ok(Completion::Done);
        }

        let durable = message.is_persistent() && self.store.is_durable();
        if durable {
            self.store.reserve(1).map_err(|err| match err {
                StoreError::ResourcesExhausted => QueueError::ServerCapacity,
                other => QueueError::Store(other),
            })?;
        }

        let claim = match self.claim_slot(options.set_order_id) {
            Ok(claim) => claim,
            Err(err) => {
                if durable {
                    self.store.cancel_reservation(1);
                }
                return Err(err);
            }
        };

        let store_ref = if durable {
            match self.store.create_reference(claim.order_id, &message) {
                Ok(store_ref) => Some(store_ref),
                Err(err) => {
                    self.store.cancel_reservation(1);
                    self.abandon_slot(&claim);
                    return Err(err.into());
                }
            }
        } else {
            None
        };

        let flags = if options.retained {
            MessageFlags::RETAINED
        } else {
            MessageFlags::empty()
        };

        if let Some(tran) = tran {
            tran.add(Box::new(PutRecord {
                queue: self.strong(),
                claim,
                message: Some(message),
                store_ref,
                flags,
                rolled_back: false,
            }));
            return Ok(Completion::Done);
        }

        if store_ref.is_none() {
            self.publish(&claim, message, None, flags);
            self.after_put();
            return Ok(Completion::Done);
        }

        let queue = self.strong();
        let publish = move || {
            queue.publish(&claim, message, store_ref, flags);
            queue.after_put();
        };
        match self.store.commit(Box::new(publish)) {
            Commit::Done(continuation) => {
                continuation();
                Ok(Completion::Done)
            }
            Commit::Pending => Ok(Completion::Pending),
        }
    }

    fn check_put_policy(&self, policy: &QueuePolicy, options: &PutOptions) -> Result<(), QueueError> {
        if self.deleted.load(Ordering::Acquire) || !policy.allow_send {
            return Err(QueueError::SendNotAllowed);
        }
        let max = policy.max_message_count;
        let buffered = self.counters.buffered();
        if max == 0 || buffered < max {
            return Ok(());
        }
        if !self.reported_full.swap(true, Ordering::AcqRel) {
            warn!(queue = %self.name, buffered, max, "queue full");
        }
        if policy.max_msg_behavior == MaxMessageBehavior::RejectNewMessages && !options.ignore_reject_new {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(QueueError::DestinationFull);
        }
        if buffered >= policy.overfull_threshold() {
            warn!(queue = %self.name, buffered, max, "queue significantly overfull");
        }
        Ok(())
    }

    /// Hand an at-most-once message straight to an idle consumer. Returns
    /// false, having changed nothing, if the consumer is not idle.
    ///
    /// No sequence number is assigned, so a bypassed message is not ordered
    /// against messages that are buffered by a concurrent put.
    fn try_bypass(&self, message: &Arc<Message>, options: &PutOptions) -> bool {
        if self.waiter.try_lock(WaiterState::Delivering).is_err() {
            return false;
        }
        let consumer = self.consumer.read().clone();
        let consumer = match consumer {
            Some(consumer) if self.counters.buffered() == 0 => consumer,
            _ => {
                // something got buffered meanwhile; deliver that instead
                if let Pass::Recheck = self.release_after_delivery() {
                    let _ = self.check_waiters();
                }
                return false;
            }
        };

        let flags = if options.retained {
            MessageFlags::RETAINED
        } else {
            MessageFlags::empty()
        };
        self.counters.avoided.fetch_add(1, Ordering::Relaxed);
        let wants_more = consumer.deliver(Delivery {
            message: message.clone(),
            state: MessageState::Consumed,
            delivery_id: 0,
            delivery_count: 1,
            order_id: 0,
            flags,
            handle: None,
        });
        if !wants_more && !consumer.explicit_suspends() {
            self.waiter.add_pending_while_locked(PendingFlags::DISABLE);
        }
        trace!(queue = %self.name, "put handed directly to consumer");
        if let Pass::Recheck = self.release_after_delivery() {
            let _ = self.check_waiters();
        }
        true
    }

    /// Claim the tail slot and its sequence number. When the claimed slot is
    /// the last on its page the tail moves to the next page, and a page is
    /// appended after that one once the lock is released.
    pub(crate) fn claim_slot(&self, explicit_order_id: Option<u64>) -> Result<Claim, QueueError> {
        let mut append_after = None;
        let claim = {
            let mut tail = self.tail.lock();
            let page = tail.pos.page.clone();
            let at = tail.pos.slot;
            let next = if at + 1 == page.capacity() {
                Some(self.arena.ensure_next(&page)?)
            } else {
                None
            };

            let order_id = match explicit_order_id {
                Some(order_id) => {
                    if order_id >= tail.next_order_id {
                        tail.next_order_id = order_id + 1;
                    }
                    order_id
                }
                None => {
                    let order_id = tail.next_order_id;
                    tail.next_order_id += 1;
                    order_id
                }
            };
            match page.slot(at) {
                Some(slot) => slot.lock().order_id = order_id,
                None => crate::breach!("tail on end-of-page entry", queue = self.name, page_seq = page.seq()),
            }

            match next {
                Some(next) => {
                    page.set_next_status(NextStatus::Completed);
                    tail.pos = Position {
                        page: next.clone(),
                        slot: 0,
                    };
                    append_after = Some(next);
                }
                None => tail.pos.slot += 1,
            }
            Claim { page, slot: at, order_id }
        };
        if let Some(page) = append_after {
            self.arena.append_after(&page);
        }
        Ok(claim)
    }

    /// Make a claimed slot visible. Counters move first so a racing consumer
    /// never sees a message the counts do not include.
    pub(crate) fn publish(&self, claim: &Claim, message: Arc<Message>, store_ref: Option<StoreRef>, flags: MessageFlags) {
        self.counters.record_enqueue();
        self.ctx.add_buffered(1);
        if let Some(expiry) = message.expiry() {
            self.expiry.lock().add(ExpiryEntry {
                order_id: claim.order_id,
                expiry,
                page: claim.page.index(),
                page_seq: claim.page.seq(),
                slot: claim.slot,
            });
        }
        let Some(slot) = claim.page.slot(claim.slot) else {
            crate::breach!("publish to end-of-page entry", queue = self.name);
        };
        let mut node = slot.lock();
        if node.state != SlotState::Empty || node.order_id != claim.order_id {
            crate::breach!(
                "publish to slot not claimed by this put",
                queue = self.name,
                state = node.state,
                order_id = claim.order_id
            );
        }
        node.msg = Some(message);
        node.store_ref = store_ref;
        node.flags = flags;
        node.delivery_count = 0;
        node.state = SlotState::Available;
        trace!(queue = %self.name, order_id = claim.order_id, "message published");
    }

    /// Let the head and cursor pass a claimed slot that will never be published.
    pub(crate) fn abandon_slot(&self, claim: &Claim) {
        if let Some(slot) = claim.page.slot(claim.slot) {
            let mut node = slot.lock();
            if node.state == SlotState::Empty {
                node.consume();
            }
        }
        debug!(queue = %self.name, order_id = claim.order_id, "claimed slot abandoned");
        self.reclaim_head();
        let _ = self.check_waiters();
    }

    pub(crate) fn after_put(&self) {
        // the put itself is complete; a pending delivery resumes from the store
        let _ = self.check_waiters();
        self.enforce_message_limit();
    }
}

/// Transaction record for a put. Phases, in order of use:
/// memory commit publishes, post commit delivers; rollback drops the durable
/// reference and post rollback frees the claimed slot.
struct PutRecord {
    queue: Arc<PagedQueue>,
    claim: Claim,
    message: Option<Arc<Message>>,
    store_ref: Option<StoreRef>,
    flags: MessageFlags,
    rolled_back: bool,
}

impl TransactionRecord for PutRecord {
    fn memory_commit(&mut self) {
        if self.rolled_back {
            self.rollback();
            return;
        }
        if let Some(message) = self.message.take() {
            self.queue.publish(&self.claim, message, self.store_ref, self.flags);
        }
    }

    fn post_commit(&mut self) {
        if self.rolled_back {
            self.post_rollback();
            return;
        }
        self.queue.after_put();
    }

    fn rollback(&mut self) {
        self.message = None;
        self.queue.forget_reference(self.store_ref.take());
    }

    fn post_rollback(&mut self) {
        self.queue.abandon_slot(&self.claim);
    }

    fn savepoint_rollback(&mut self) {
        self.rolled_back = true;
    }
}
