#![allow(dead_code)]

use std::sync::{Arc, Once};

use dmxp_delivery::Queue::{ConsumerEvent, Delivery, DeliveryHandle};
use dmxp_delivery::{Completion, Consumer, Message, PagedQueue, PutOptions, Reliability};
use parking_lot::Mutex;

static LOG: Once = Once::new();

/// Route `tracing` output through the test harness. Filter with `RUST_LOG`.
pub fn setup_log() {
    LOG.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn reliable(payload: &'static str) -> Message {
    Message::new(payload).with_reliability(Reliability::AtLeastOnce)
}

/// Put outside any transaction, expecting it to complete synchronously.
pub fn put(queue: &PagedQueue, message: Message) {
    assert_eq!(queue.put(message, PutOptions::default(), None), Ok(Completion::Done));
}

/// Consumer that records every delivery and status event.
#[derive(Default)]
pub struct Recorder {
    pub deliveries: Mutex<Vec<Delivery>>,
    pub events: Mutex<Vec<ConsumerEvent>>,
    /// Return `false` from the delivery with this index (zero based).
    pub refuse_at: Mutex<Option<usize>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn refusing_at(index: usize) -> Arc<Self> {
        let recorder = Self::default();
        *recorder.refuse_at.lock() = Some(index);
        Arc::new(recorder)
    }

    pub fn count(&self) -> usize {
        self.deliveries.lock().len()
    }

    pub fn payloads(&self) -> Vec<String> {
        self.deliveries
            .lock()
            .iter()
            .map(|d| String::from_utf8_lossy(d.message.payload()).into_owned())
            .collect()
    }

    pub fn order_ids(&self) -> Vec<u64> {
        self.deliveries.lock().iter().map(|d| d.order_id).collect()
    }

    pub fn handle(&self, index: usize) -> DeliveryHandle {
        self.deliveries.lock()[index].handle.expect("delivery has a handle")
    }

    pub fn last(&self) -> Delivery {
        self.deliveries.lock().last().cloned().expect("at least one delivery")
    }
}

impl Consumer for Recorder {
    fn deliver(&self, delivery: Delivery) -> bool {
        let mut deliveries = self.deliveries.lock();
        let index = deliveries.len();
        deliveries.push(delivery);
        *self.refuse_at.lock() != Some(index)
    }

    fn on_status(&self, event: ConsumerEvent) {
        self.events.lock().push(event);
    }
}
