// Message as handed to the queue by producers and back out to the consumer.

use bytes::Bytes;

/// Delivery guarantee requested by the producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, PartialOrd, Ord)]
pub enum Reliability {
    /// Fire and forget. Consumed as soon as it is handed to the consumer.
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Persistence {
    #[default]
    NonPersistent,
    Persistent,
}

bitflags::bitflags! {
    /// Flags that travel with a delivery.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MessageFlags: u8 {
        const RETAINED    = 1 << 0;
        /// Offered before: the consumer may already have seen it.
        const REDELIVERED = 1 << 1;
    }
}

/// State the consumer is told a delivered message is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    /// Already consumed; no acknowledgement expected.
    Consumed,
    /// Awaiting acknowledgement.
    Delivered,
    /// Received by the consumer in a two-phase protocol, awaiting completion.
    Received,
}

/// An immutable message. Queues hold it behind an `Arc` so redelivery and
/// the durable store never copy the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    payload: Bytes,
    reliability: Reliability,
    persistence: Persistence,
    /// Absolute expiry time in seconds, as reported by the engine clock.
    expiry: Option<u64>,
}

impl Message {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            reliability: Reliability::default(),
            persistence: Persistence::default(),
            expiry: None,
        }
    }

    pub fn with_reliability(mut self, reliability: Reliability) -> Self {
        self.reliability = reliability;
        self
    }

    pub fn persistent(mut self) -> Self {
        self.persistence = Persistence::Persistent;
        self
    }

    pub fn with_expiry(mut self, expiry_secs: u64) -> Self {
        self.expiry = Some(expiry_secs);
        self
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn reliability(&self) -> Reliability {
        self.reliability
    }

    pub fn persistence(&self) -> Persistence {
        self.persistence
    }

    pub fn is_persistent(&self) -> bool {
        self.persistence == Persistence::Persistent
    }

    pub fn expiry(&self) -> Option<u64> {
        self.expiry
    }

    pub fn is_expired(&self, now_secs: u64) -> bool {
        matches!(self.expiry, Some(at) if at <= now_secs)
    }
}

/// Options for a single put.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PutOptions {
    /// Deliver with [`MessageFlags::RETAINED`] set.
    pub retained: bool,
    /// Use this sequence number instead of generating one. The generator is
    /// moved past it.
    pub set_order_id: Option<u64>,
    /// Accept the message even if the queue is full and rejects new messages.
    pub ignore_reject_new: bool,
}

impl PutOptions {
    pub fn retained() -> Self {
        Self {
            retained: true,
            ..Self::default()
        }
    }

    pub fn with_order_id(mut self, order_id: u64) -> Self {
        self.set_order_id = Some(order_id);
        self
    }

    pub fn ignoring_reject_new(mut self) -> Self {
        self.ignore_reject_new = true;
        self
    }
}
