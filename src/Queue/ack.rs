// Acknowledgement: the consumer settles a delivered slot.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::debug;

use super::consumer::{AckOutcome, DeliveryHandle};
use super::queue::{PagedQueue, Removal};
use super::Page::{NodeData, Slot, SlotState};
use crate::Core::error::Completion;
use crate::Core::store::{Commit, ReferenceState};
use crate::Core::transaction::{Transaction, TransactionRecord};

impl PagedQueue {
    /// Settle a delivered message.
    ///
    /// Acknowledging a slot that is not delivered, or with a handle that does
    /// not match it, is a protocol breach and halts the process.
    pub fn acknowledge(
        &self,
        handle: &DeliveryHandle,
        outcome: AckOutcome,
        tran: Option<&mut Transaction>,
    ) -> Completion {
        let page = self.arena.resolve(handle.page, handle.page_seq);
        let Some(slot) = page.slot(handle.slot) else {
            crate::breach!("acknowledge of end-of-page entry", queue = self.name, handle = handle);
        };

        match outcome {
            AckOutcome::Consumed | AckOutcome::Expired => {
                let removal = if outcome == AckOutcome::Consumed {
                    Removal::Consumed
                } else {
                    Removal::Expired
                };
                let store_ref = {
                    let node = slot.lock();
                    self.check_ack_target(&node, handle, outcome);
                    node.store_ref
                };
                if let Some(tran) = tran {
                    tran.add(Box::new(AckRecord {
                        queue: self.strong(),
                        handle: *handle,
                        removal,
                        rolled_back: false,
                    }));
                    return Completion::Done;
                }
                let Some(store_ref) = store_ref else {
                    self.finish_ack(handle, removal);
                    return Completion::Done;
                };
                self.forget_reference(Some(store_ref));
                let queue = self.strong();
                let handle = *handle;
                match self.store.commit(Box::new(move || queue.finish_ack(&handle, removal))) {
                    Commit::Done(continuation) => {
                        continuation();
                        Completion::Done
                    }
                    Commit::Pending => Completion::Pending,
                }
            }
            AckOutcome::Received => {
                let store_ref = {
                    let mut node = slot.lock();
                    self.check_ack_target(&node, handle, outcome);
                    if node.state != SlotState::Delivered {
                        crate::breach!("received acknowledgement of slot not delivered", queue = self.name, state = node.state);
                    }
                    node.state = SlotState::Received;
                    node.store_ref
                };
                match store_ref {
                    Some(store_ref) => {
                        self.update_reference(store_ref, ReferenceState::Received);
                        match self.store.commit(Box::new(|| {})) {
                            Commit::Done(continuation) => {
                                continuation();
                                Completion::Done
                            }
                            Commit::Pending => Completion::Pending,
                        }
                    }
                    None => Completion::Done,
                }
            }
            AckOutcome::NotDelivered | AckOutcome::NotReceived => {
                self.return_to_available(slot, handle, outcome);
                self.check_waiters()
            }
        }
    }

    fn check_ack_target(&self, node: &NodeData, handle: &DeliveryHandle, outcome: AckOutcome) {
        if node.order_id != handle.order_id || !node.state.is_inflight() {
            crate::breach!(
                "acknowledge in wrong state",
                queue = self.name,
                outcome = outcome,
                handle_order_id = handle.order_id,
                slot_order_id = node.order_id,
                state = node.state
            );
        }
    }

    /// Negative acknowledgement: the slot goes back to available as if the
    /// failed offer never happened, and the cursor rewinds to find it.
    fn return_to_available(&self, slot: &Slot, handle: &DeliveryHandle, outcome: AckOutcome) {
        let undo_record = {
            let mut node = slot.lock();
            self.check_ack_target(&node, handle, outcome);
            node.state = SlotState::Available;
            node.delivery_count = node.delivery_count.saturating_sub(1);
            let had_record = std::mem::take(&mut node.has_delivery_record);
            if had_record {
                node.store_ref
            } else {
                None
            }
        };
        self.counters.sub_inflight();
        if let Some(store_ref) = undo_record {
            self.update_reference(store_ref, ReferenceState::Available);
        }
        self.reset_cursor.store(true, Ordering::Release);
        debug!(queue = %self.name, order_id = handle.order_id, ?outcome, "message returned to queue");
    }

    /// Remove an acknowledged message once its durable reference is gone.
    pub(crate) fn finish_ack(&self, handle: &DeliveryHandle, removal: Removal) {
        let page = self.arena.resolve(handle.page, handle.page_seq);
        let Some(slot) = page.slot(handle.slot) else {
            crate::breach!("acknowledge of end-of-page entry", queue = self.name, handle = handle);
        };
        let had_expiry = {
            let mut node = slot.lock();
            if node.order_id != handle.order_id || !node.state.is_inflight() {
                crate::breach!(
                    "slot changed state before acknowledgement completed",
                    queue = self.name,
                    order_id = handle.order_id,
                    state = node.state
                );
            }
            let had_expiry = node.expiry().is_some();
            node.consume();
            had_expiry
        };
        self.account_removal(removal, true, handle.order_id, had_expiry);
        self.reclaim_head();
        // an inflight slot was freed
        let _ = self.check_waiters();
    }
}

/// Transaction record for an acknowledgement: the message is removed only
/// when the transaction commits.
struct AckRecord {
    queue: Arc<PagedQueue>,
    handle: DeliveryHandle,
    removal: Removal,
    rolled_back: bool,
}

impl TransactionRecord for AckRecord {
    fn memory_commit(&mut self) {
        if self.rolled_back {
            return;
        }
        let store_ref = {
            let page = self.queue.arena.resolve(self.handle.page, self.handle.page_seq);
            page.slot(self.handle.slot).and_then(|slot| slot.lock().store_ref)
        };
        self.queue.forget_reference(store_ref);
        self.queue.finish_ack(&self.handle, self.removal);
    }

    fn post_commit(&mut self) {}

    fn rollback(&mut self) {}

    fn post_rollback(&mut self) {}

    fn savepoint_rollback(&mut self) {
        self.rolled_back = true;
    }
}
