// Get path: the delivery cursor walks forward, stages a batch, and the
// waiter lock holder hands it to the consumer.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use super::consumer::{ConsumerEvent, Delivery, DeliveryHandle};
use super::queue::{CursorState, PagedQueue, Position, Removal};
use super::Page::{Entry, NextStatus, NodeData, Page, SlotState};
use super::Structs::{MessageFlags, MessageState, Reliability};
use crate::Core::error::Completion;
use crate::Core::store::{Commit, ReferenceState, StoreRef};
use crate::Core::waiter::{PendingFlags, WaiterSnapshot, WaiterState};

/// Most messages staged per pass before the consumer is called.
pub(crate) const DELIVERY_BATCH: usize = 16;

const ENABLED: WaiterSnapshot = WaiterSnapshot::new(WaiterState::Enabled);

/// What the delivery loop should do after releasing (or failing to release)
/// the waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Pass {
    /// We delivered and released; look again for more.
    Recheck,
    /// Released, nothing more to do.
    Finished,
    /// The waiter stays locked until the store completes a commit.
    Pending,
}

pub(crate) struct StagedItem {
    pub(crate) page: Arc<Page>,
    pub(crate) slot: usize,
    /// False when this is a redelivery of an already delivered slot.
    pub(crate) first_offer: bool,
    /// At-most-once: consumed once handed over, never acknowledged.
    pub(crate) consume_on_delivery: bool,
    pub(crate) delivery: Delivery,
}

#[derive(Default)]
pub(crate) struct StagedBatch {
    pub(crate) items: Vec<StagedItem>,
    pub(crate) needs_commit: bool,
}

impl PagedQueue {
    /// Deliver whatever is deliverable to the consumer, if it is idle.
    ///
    /// Called after any change that could make a message deliverable. When
    /// another thread is mid-delivery this returns at once: that thread will
    /// look again before it unlocks.
    pub fn check_waiters(&self) -> Completion {
        loop {
            match self.waiter.try_lock(WaiterState::Getting) {
                Ok(()) => {}
                // a getter never re-checks, so wait it out
                Err(seen) if seen.state == WaiterState::Getting => {
                    std::hint::spin_loop();
                    continue;
                }
                Err(_) => return Completion::Done,
            }
            match self.delivery_pass() {
                Pass::Recheck => continue,
                Pass::Finished => return Completion::Done,
                Pass::Pending => return Completion::Pending,
            }
        }
    }

    /// One pass with the waiter held in `Getting`.
    fn delivery_pass(&self) -> Pass {
        let batch = self.stage_batch();
        if batch.items.is_empty() {
            return self.release_idle();
        }
        self.waiter.promote_to_delivering();

        let batch = if batch.needs_commit {
            *self.parked.lock() = Some(batch);
            let queue = self.strong();
            match self.store.commit(Box::new(move || queue.resume_parked())) {
                Commit::Done(_) => self.parked.lock().take().unwrap_or_default(),
                Commit::Pending => {
                    debug!(queue = %self.name, "delivery waiting on store commit");
                    return Pass::Pending;
                }
            }
        } else {
            batch
        };

        self.deliver_batch(batch);
        self.release_after_delivery()
    }

    /// Store continuation for a batch parked on an asynchronous commit.
    fn resume_parked(&self) {
        let Some(batch) = self.parked.lock().take() else {
            return;
        };
        self.deliver_batch(batch);
        if self.release_after_delivery() == Pass::Recheck {
            let _ = self.check_waiters();
        }
    }

    /// Nothing to deliver: release `Getting`.
    fn release_idle(&self) -> Pass {
        if self.counters.buffered() == 0 {
            self.reported_full.store(false, Ordering::Release);
        }
        let inform = self.inform_on_empty.swap(false, Ordering::AcqRel);
        if self.waiter.try_unlock_no_pending(WaiterState::Getting, ENABLED) {
            if inform {
                self.notify(ConsumerEvent::QueueEmpty);
            }
            return Pass::Finished;
        }
        if inform {
            self.inform_on_empty.store(true, Ordering::Release);
        }
        self.complete_waiter_actions(WaiterState::Getting)
    }

    /// Release `Delivering` after a batch. We promised to look again, so a
    /// clean release asks the caller to recheck.
    pub(crate) fn release_after_delivery(&self) -> Pass {
        if self.waiter.try_unlock_no_pending(WaiterState::Delivering, ENABLED) {
            return Pass::Recheck;
        }
        self.complete_waiter_actions(WaiterState::Delivering)
    }

    fn stage_batch(&self) -> StagedBatch {
        let mut cursor = self.cursor_guard();
        self.apply_cursor_reset(&mut cursor);

        let now = self.ctx.now_secs();
        let max_inflight = self.policy.read().max_inflight;
        let mut batch = StagedBatch::default();
        let mut delivery_records = Vec::new();
        let mut expired = Vec::new();

        while batch.items.len() < DELIVERY_BATCH {
            let page = cursor.pos.page.clone();
            let at = cursor.pos.slot;
            let slot = match page.entry(at) {
                Entry::EndOfPage(_) => {
                    if self.cross_page(&mut cursor) {
                        continue;
                    }
                    break;
                }
                Entry::Slot(slot) => slot,
            };

            let mut node = slot.lock();
            let state = node.state;
            match state {
                SlotState::Empty => break,
                SlotState::Consumed | SlotState::Discarding => {}
                SlotState::Delivered | SlotState::Received => {
                    if node.order_id <= cursor.redeliver_order_id {
                        node.delivery_count += 1;
                        node.flags |= MessageFlags::REDELIVERED;
                        let shown = if state == SlotState::Received {
                            MessageState::Received
                        } else {
                            MessageState::Delivered
                        };
                        batch.items.push(self.stage(&page, at, &node, shown, false, false));
                    }
                }
                SlotState::Available => {
                    let Some(message) = node.msg.clone() else {
                        crate::breach!("available slot without message", queue = self.name, order_id = node.order_id);
                    };
                    if message.is_expired(now) {
                        node.state = SlotState::Discarding;
                        expired.push(Position { page: page.clone(), slot: at });
                    } else {
                        let consume = message.reliability() == Reliability::AtMostOnce;
                        if !consume && max_inflight != 0 && self.counters.inflight() >= max_inflight {
                            trace!(queue = %self.name, max_inflight, "inflight limit reached");
                            break;
                        }
                        node.state = SlotState::Delivered;
                        node.delivery_count += 1;
                        if node.delivery_id == 0 {
                            node.delivery_id = self.allocate_delivery_id();
                        }
                        if !consume {
                            self.counters.add_inflight();
                            if let Some(store_ref) = node.store_ref {
                                node.has_delivery_record = true;
                                delivery_records.push(store_ref);
                            }
                        }
                        let shown = if consume {
                            MessageState::Consumed
                        } else {
                            MessageState::Delivered
                        };
                        batch.items.push(self.stage(&page, at, &node, shown, true, consume));
                    }
                }
            }
            let order_id = node.order_id;
            drop(node);
            if cursor.redeliver_order_id != 0 && order_id >= cursor.redeliver_order_id {
                cursor.redeliver_order_id = 0;
            }
            cursor.pos.slot += 1;
        }
        drop(cursor);

        if !expired.is_empty() {
            let count = self.discard_slots(expired, Removal::Expired);
            debug!(queue = %self.name, count, "expired messages dropped during get");
        }
        for store_ref in delivery_records {
            self.update_reference(store_ref, ReferenceState::Delivered);
            batch.needs_commit = true;
        }
        batch
    }

    fn stage(
        &self,
        page: &Arc<Page>,
        at: usize,
        node: &NodeData,
        state: MessageState,
        first_offer: bool,
        consume_on_delivery: bool,
    ) -> StagedItem {
        let Some(message) = node.msg.clone() else {
            crate::breach!("staged slot without message", queue = self.name, order_id = node.order_id);
        };
        let handle = (!consume_on_delivery).then(|| DeliveryHandle {
            page: page.index(),
            page_seq: page.seq(),
            slot: at,
            order_id: node.order_id,
        });
        StagedItem {
            page: page.clone(),
            slot: at,
            first_offer,
            consume_on_delivery,
            delivery: Delivery {
                message,
                state,
                delivery_id: node.delivery_id,
                delivery_count: node.delivery_count,
                order_id: node.order_id,
                flags: node.flags,
                handle,
            },
        }
    }

    /// Move the cursor back to the head if a negative acknowledgement or a
    /// reconnect asked for it.
    fn apply_cursor_reset(&self, cursor: &mut CursorState) {
        let bound = self.redeliver_request.swap(0, Ordering::AcqRel);
        let reset = self.reset_cursor.swap(false, Ordering::AcqRel);
        if !reset && bound == 0 {
            return;
        }
        {
            let head = self.head.lock();
            cursor.pos = head.clone();
            // published under the head lock so the reclaimer cannot free the page
            self.cursor_page_seq.store(head.page.seq(), Ordering::Release);
        }
        if bound > cursor.redeliver_order_id {
            cursor.redeliver_order_id = bound;
        }
        debug!(
            queue = %self.name,
            redeliver_up_to = cursor.redeliver_order_id,
            "delivery cursor reset to head"
        );
    }

    /// Step the cursor off an end-of-page entry. Only possible once the tail
    /// has marked the successor linked.
    pub(crate) fn cross_page(&self, cursor: &mut CursorState) -> bool {
        let page = cursor.pos.page.clone();
        loop {
            match page.next_status() {
                NextStatus::CursorClear => break,
                NextStatus::Completed => {
                    if page.cas_next_status(NextStatus::Completed, NextStatus::CursorClear) {
                        break;
                    }
                }
                _ => return false,
            }
        }
        let Some(next) = self.arena.follow(&page) else {
            crate::breach!("page marked linked without successor", queue = self.name, page_seq = page.seq());
        };
        self.cursor_page_seq.store(next.seq(), Ordering::Release);
        trace!(queue = %self.name, from = page.seq(), to = next.seq(), "cursor crossed page");
        cursor.pos = Position { page: next, slot: 0 };
        true
    }

    fn deliver_batch(&self, batch: StagedBatch) {
        let consumer = self.consumer.read().clone();
        let Some(consumer) = consumer else {
            self.roll_back_undelivered(batch.items);
            return;
        };

        let mut consumed_any = false;
        let mut items = batch.items.into_iter();
        while let Some(item) = items.next() {
            let wants_more = consumer.deliver(item.delivery.clone());
            if item.consume_on_delivery {
                self.finish_auto_consume(&item);
                consumed_any = true;
            }
            if !wants_more {
                self.roll_back_undelivered(items.collect());
                if !consumer.explicit_suspends() {
                    self.waiter.add_pending_while_locked(PendingFlags::DISABLE);
                }
                break;
            }
        }
        if consumed_any {
            self.reclaim_head();
        }
    }

    fn finish_auto_consume(&self, item: &StagedItem) {
        let Some(slot) = item.page.slot(item.slot) else {
            return;
        };
        let (order_id, had_expiry) = {
            let mut node = slot.lock();
            if node.state != SlotState::Delivered {
                crate::breach!("consume-on-delivery slot changed state", queue = self.name, state = node.state);
            }
            let facts = (node.order_id, node.expiry().is_some());
            node.consume();
            facts
        };
        self.account_removal(Removal::Consumed, false, order_id, had_expiry);
    }

    /// Undo staging for messages the consumer never saw and rewind the cursor
    /// to the first of them.
    fn roll_back_undelivered(&self, items: Vec<StagedItem>) {
        let Some(first) = items.first() else {
            return;
        };
        let rewind = Position {
            page: first.page.clone(),
            slot: first.slot,
        };
        let mut redeliver_bound = 0;
        let mut undo_records: Vec<StoreRef> = Vec::new();
        for item in &items {
            let Some(slot) = item.page.slot(item.slot) else {
                continue;
            };
            let mut node = slot.lock();
            if !node.state.is_inflight() {
                continue;
            }
            node.delivery_count = node.delivery_count.saturating_sub(1);
            if item.first_offer {
                node.state = SlotState::Available;
                if !item.consume_on_delivery {
                    self.counters.sub_inflight();
                }
                if node.has_delivery_record {
                    node.has_delivery_record = false;
                    undo_records.extend(node.store_ref);
                }
            } else {
                redeliver_bound = redeliver_bound.max(node.order_id);
            }
        }
        {
            let mut cursor = self.cursor_guard();
            self.cursor_page_seq.store(rewind.page.seq(), Ordering::Release);
            cursor.pos = rewind;
            cursor.redeliver_order_id = cursor.redeliver_order_id.max(redeliver_bound);
        }
        for store_ref in undo_records {
            self.update_reference(store_ref, ReferenceState::Available);
        }
        debug!(queue = %self.name, undelivered = items.len(), "undelivered batch rolled back");
    }

    pub(crate) fn update_reference(&self, store_ref: StoreRef, state: ReferenceState) {
        if let Err(err) = self.store.update_reference(store_ref, state) {
            warn!(queue = %self.name, ?store_ref, ?state, %err, "failed to update store reference");
        }
    }

    pub(crate) fn notify(&self, event: ConsumerEvent) {
        let consumer = self.consumer.read().clone();
        if let Some(consumer) = consumer {
            consumer.on_status(event);
        }
    }
}
