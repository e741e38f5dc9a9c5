// Consumer attachment and the pending-action handler run by whichever
// thread holds the waiter when it finds requests left for it.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::debug;

use super::consumer::{Consumer, ConsumerEvent, EnableOptions};
use super::get::Pass;
use super::queue::PagedQueue;
use crate::Core::error::{Completion, QueueError};
use crate::Core::waiter::{
    DeliveryStatus, DisableOutcome, DisconnectOutcome, EnableOutcome, PendingFlags, WaiterSnapshot,
    WaiterState,
};

const ENABLED: WaiterSnapshot = WaiterSnapshot::new(WaiterState::Enabled);

impl PagedQueue {
    /// Attach the queue's consumer, disabled. If messages were left delivered
    /// but unacknowledged by a previous consumer they are offered again,
    /// in order, before anything new.
    pub fn init_consumer(&self, consumer: Arc<dyn Consumer>) -> Result<(), QueueError> {
        if self.is_deleted() {
            return Err(QueueError::QueueDeleted);
        }
        self.waiter.connect()?;
        *self.consumer.write() = Some(consumer);

        if self.counters.inflight() > 0 {
            let bound = self.tail.lock().next_order_id - 1;
            self.redeliver_request.store(bound, Ordering::Release);
            debug!(queue = %self.name, redeliver_up_to = bound, inflight = self.counters.inflight(), "consumer attached with unacknowledged messages");
        } else {
            debug!(queue = %self.name, "consumer attached");
        }
        Ok(())
    }

    pub fn enable(&self, options: EnableOptions) -> Result<EnableOutcome, QueueError> {
        if self.is_deleted() {
            return Err(QueueError::QueueDeleted);
        }
        let outcome = self.waiter.enable()?;
        self.inform_on_empty.store(true, Ordering::Release);
        if !options.deliver_later {
            let _ = self.check_waiters();
        }
        Ok(outcome)
    }

    /// Stop delivery. `Pending` means a delivering thread holds the waiter and
    /// will finish the disable before it lets go.
    pub fn disable(&self) -> Result<Completion, QueueError> {
        match self.waiter.disable() {
            DisableOutcome::Locked { .. } => {
                self.run_locked_actions();
                Ok(Completion::Done)
            }
            DisableOutcome::Pending => Ok(Completion::Pending),
            DisableOutcome::AlreadyDisabled => Err(QueueError::WaiterDisabled),
            DisableOutcome::Invalid => Err(QueueError::WaiterInvalid),
        }
    }

    /// Disable from inside a delivery callback, for consumers with explicit
    /// suspends. Suspending an already disabled consumer is not an error.
    pub fn suspend_delivery(&self) -> Result<Completion, QueueError> {
        match self.disable() {
            Err(QueueError::WaiterDisabled) => Ok(Completion::Done),
            other => other,
        }
    }

    /// Detach the consumer. Delivered but unacknowledged messages stay
    /// inflight for the next consumer.
    pub fn terminate_consumer(&self) -> Result<Completion, QueueError> {
        match self.waiter.request_disconnect() {
            DisconnectOutcome::Locked { .. } => {
                self.run_locked_actions();
                Ok(Completion::Done)
            }
            DisconnectOutcome::Pending => Ok(Completion::Pending),
            DisconnectOutcome::Invalid => Err(QueueError::WaiterInvalid),
        }
    }

    pub fn delivery_status(&self) -> DeliveryStatus {
        self.waiter.delivery_status()
    }

    /// We locked the waiter ourselves (as `Getting`) with a request pending.
    fn run_locked_actions(&self) {
        if self.complete_waiter_actions(WaiterState::Getting) == Pass::Recheck {
            let _ = self.check_waiters();
        }
    }

    /// Act on every pending flag, then release the waiter.
    pub(crate) fn complete_waiter_actions(&self, held: WaiterState) -> Pass {
        let mut removed: Option<Arc<dyn Consumer>> = None;
        loop {
            let current = self.waiter.load();
            if current.state != held {
                crate::breach!("pending actions run without holding the waiter", queue = self.name, held = held, status = current);
            }
            let pending = current.pending;

            if pending.contains(PendingFlags::RECLAIM_SPACE) {
                if self.waiter.take_pending(current, PendingFlags::RECLAIM_SPACE) {
                    self.reclaim_space_locked();
                }
                continue;
            }

            if pending.contains(PendingFlags::DISCONNECT) {
                if removed.is_none() {
                    removed = self.consumer.write().take();
                }
                if self
                    .waiter
                    .transition(current, WaiterSnapshot::new(WaiterState::Disconnected))
                    .is_ok()
                {
                    self.counters.recompute_puts_attempted();
                    self.inform_on_empty.store(false, Ordering::Release);
                    debug!(queue = %self.name, inflight = self.counters.inflight(), "consumer disconnected");
                    if let Some(consumer) = removed {
                        consumer.on_status(ConsumerEvent::Removed);
                    }
                    return Pass::Finished;
                }
                continue;
            }

            if pending.contains(PendingFlags::DISABLE) {
                if pending.contains(PendingFlags::CANCEL_DISABLE) {
                    self.waiter
                        .take_pending(current, PendingFlags::DISABLE | PendingFlags::CANCEL_DISABLE);
                    continue;
                }
                if self
                    .waiter
                    .transition(current, WaiterSnapshot::new(WaiterState::Disabled))
                    .is_ok()
                {
                    debug!(queue = %self.name, "consumer disabled");
                    self.notify(ConsumerEvent::Disabled);
                    return Pass::Finished;
                }
                continue;
            }

            if pending.contains(PendingFlags::CANCEL_DISABLE) {
                self.waiter.take_pending(current, PendingFlags::CANCEL_DISABLE);
                continue;
            }

            if self.waiter.try_unlock_no_pending(held, ENABLED) {
                return if held == WaiterState::Delivering {
                    Pass::Recheck
                } else {
                    Pass::Finished
                };
            }
        }
    }
}
