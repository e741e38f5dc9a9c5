// The consuming side: what a queue hands to its single consumer and what
// the consumer reports back.

use std::sync::Arc;

use crate::Queue::Page::PageIndex;
use crate::Queue::Structs::{Message, MessageFlags, MessageState};

/// Identifies a delivered slot for acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeliveryHandle {
    pub(crate) page: PageIndex,
    pub(crate) page_seq: u64,
    pub(crate) slot: usize,
    pub(crate) order_id: u64,
}

impl DeliveryHandle {
    pub fn order_id(&self) -> u64 {
        self.order_id
    }
}

/// One message offered to the consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: Arc<Message>,
    pub state: MessageState,
    pub delivery_id: u32,
    pub delivery_count: u32,
    pub order_id: u64,
    pub flags: MessageFlags,
    /// `None` when the message is consumed on delivery and takes no acknowledgement.
    pub handle: Option<DeliveryHandle>,
}

/// Status changes reported to the consumer outside of deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerEvent {
    /// Delivery stopped after a disable completed.
    Disabled,
    /// The consumer was detached from the queue.
    Removed,
    /// After enable, the queue was found to have nothing to deliver.
    QueueEmpty,
}

/// Outcome the consumer reports for a delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Consumed,
    /// First phase of a two-phase acknowledgement.
    Received,
    NotDelivered,
    NotReceived,
    Expired,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnableOptions {
    /// Enable without attempting delivery from this call.
    pub deliver_later: bool,
}

/// The single consumer attached to a queue.
///
/// Callbacks run on whichever thread is driving delivery, with the waiter
/// locked. They may put to queues and acknowledge messages; those calls
/// leave work for the driving thread rather than recurse into delivery.
pub trait Consumer: Send + Sync {
    /// Offer one message. Returning `false` stops the current batch and,
    /// unless [`Consumer::explicit_suspends`], disables the consumer.
    fn deliver(&self, delivery: Delivery) -> bool;

    fn on_status(&self, _event: ConsumerEvent) {}

    /// The consumer suspends itself through `suspend_delivery` instead of
    /// relying on a `false` return.
    fn explicit_suspends(&self) -> bool {
        false
    }
}
