mod common;

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};
use std::thread;
use std::time::{Duration, Instant};

use common::{setup_log, Recorder};
use dmxp_delivery::Queue::EnableOptions;
use dmxp_delivery::{
    AckOutcome, Consumer, Delivery, Message, PagedQueue, PutOptions, QueueBuilder, QueueError, QueuePolicy,
    Reliability,
};
use parking_lot::Mutex;

const PRODUCERS: usize = 4;
const PER_PRODUCER: usize = 250;
const TOTAL: usize = PRODUCERS * PER_PRODUCER;

fn spawn_producers(queue: &Arc<PagedQueue>) -> Vec<thread::JoinHandle<()>> {
    (0..PRODUCERS)
        .map(|p| {
            let queue = queue.clone();
            thread::spawn(move || {
                for seq in 0..PER_PRODUCER {
                    let message = Message::new(format!("{p}:{seq}")).with_reliability(Reliability::AtLeastOnce);
                    loop {
                        match queue.put(message.clone(), PutOptions::default(), None) {
                            Ok(_) => break,
                            Err(QueueError::DestinationFull) => thread::yield_now(),
                            Err(err) => panic!("put failed: {err}"),
                        }
                    }
                    if fastrand::u8(..) < 16 {
                        thread::yield_now();
                    }
                }
            })
        })
        .collect()
}

/// Each producer's messages must arrive in the order it put them.
fn assert_per_producer_order(payloads: &[String]) {
    let mut next: HashMap<usize, usize> = HashMap::new();
    for payload in payloads {
        let (p, seq) = payload.split_once(':').expect("producer:seq payload");
        let p: usize = p.parse().unwrap();
        let seq: usize = seq.parse().unwrap();
        let expected = next.entry(p).or_insert(0);
        assert_eq!(seq, *expected, "producer {p} out of order");
        *expected += 1;
    }
}

fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(30);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

/// Acknowledges every message from inside the delivery callback.
#[derive(Default)]
struct SelfAcking {
    queue: OnceLock<Weak<PagedQueue>>,
    seen: Mutex<Vec<(u64, String)>>,
}

impl Consumer for SelfAcking {
    fn deliver(&self, delivery: Delivery) -> bool {
        let payload = String::from_utf8_lossy(delivery.message.payload()).into_owned();
        self.seen.lock().push((delivery.order_id, payload));
        if let (Some(handle), Some(queue)) = (delivery.handle, self.queue.get().and_then(Weak::upgrade)) {
            let _ = queue.acknowledge(&handle, AckOutcome::Consumed, None);
        }
        true
    }
}

#[test]
fn concurrent_producers_single_consumer() {
    setup_log();
    let queue = QueueBuilder::new("mpsc")
        .with_policy(QueuePolicy::unlimited())
        .with_page_size(8)
        .build()
        .unwrap();
    let consumer = Arc::new(SelfAcking::default());
    let _ = consumer.queue.set(Arc::downgrade(&queue));
    queue.init_consumer(consumer.clone()).unwrap();
    queue.enable(EnableOptions::default()).unwrap();

    for handle in spawn_producers(&queue) {
        handle.join().unwrap();
    }
    let _ = queue.check_waiters();

    let seen = consumer.seen.lock().clone();
    assert_eq!(seen.len(), TOTAL);
    assert!(seen.windows(2).all(|w| w[0].0 < w[1].0), "delivered out of order");
    let payloads: Vec<String> = seen.into_iter().map(|(_, p)| p).collect();
    assert_per_producer_order(&payloads);

    assert_eq!(queue.buffered(), 0);
    assert_eq!(queue.inflight(), 0);
    let stats = queue.statistics();
    assert_eq!(stats.enqueued, TOTAL as u64);
    assert_eq!(stats.dequeued, TOTAL as u64);
    assert!(queue.live_pages() <= 3, "consumed pages not reclaimed: {}", queue.live_pages());
}

#[test]
fn acknowledgements_from_another_thread_under_inflight_limit() {
    setup_log();
    let queue = QueueBuilder::new("acker")
        .with_policy(QueuePolicy::unlimited().with_max_inflight(8))
        .with_page_size(16)
        .build()
        .unwrap();
    let consumer = Recorder::new();
    queue.init_consumer(consumer.clone()).unwrap();
    queue.enable(EnableOptions::default()).unwrap();

    let acker = {
        let queue = queue.clone();
        let consumer = consumer.clone();
        thread::spawn(move || {
            let mut acked = 0;
            wait_until("acknowledgements", || {
                let handles: Vec<_> = consumer.deliveries.lock()[acked..]
                    .iter()
                    .filter_map(|d| d.handle)
                    .collect();
                for handle in handles {
                    assert!(queue.inflight() <= 8);
                    let _ = queue.acknowledge(&handle, AckOutcome::Consumed, None);
                    acked += 1;
                }
                acked == TOTAL
            });
        })
    };

    for handle in spawn_producers(&queue) {
        handle.join().unwrap();
    }
    acker.join().unwrap();

    assert_eq!(consumer.count(), TOTAL);
    assert_per_producer_order(&consumer.payloads());
    assert_eq!(queue.buffered(), 0);
    assert_eq!(queue.inflight(), 0);
}

#[test]
fn toggling_delivery_loses_nothing() {
    setup_log();
    let queue = QueueBuilder::new("toggle")
        .with_policy(QueuePolicy::unlimited())
        .with_page_size(8)
        .build()
        .unwrap();
    let consumer = Recorder::new();
    queue.init_consumer(consumer.clone()).unwrap();
    queue.enable(EnableOptions::default()).unwrap();

    let toggler = {
        let queue = queue.clone();
        thread::spawn(move || {
            for _ in 0..200 {
                let _ = queue.disable();
                if fastrand::bool() {
                    thread::yield_now();
                }
                let _ = queue.enable(EnableOptions::default());
            }
        })
    };

    for handle in spawn_producers(&queue) {
        handle.join().unwrap();
    }
    toggler.join().unwrap();
    let _ = queue.check_waiters();

    assert_eq!(consumer.count(), TOTAL);
    let ids = consumer.order_ids();
    assert!(ids.windows(2).all(|w| w[0] < w[1]), "delivered out of order or twice");
    assert_per_producer_order(&consumer.payloads());
    assert_eq!(queue.inflight(), TOTAL as u64);
}

#[test]
fn discard_old_under_concurrent_puts() {
    setup_log();
    let queue = QueueBuilder::new("bounded")
        .with_policy(
            QueuePolicy::unlimited().with_max_messages(100, dmxp_delivery::MaxMessageBehavior::DiscardOldMessages),
        )
        .with_page_size(8)
        .build()
        .unwrap();

    for handle in spawn_producers(&queue) {
        handle.join().unwrap();
    }
    let stats = queue.statistics();
    assert!(queue.buffered() <= 100);
    assert_eq!(stats.enqueued, TOTAL as u64);
    assert_eq!(stats.discarded + queue.buffered(), TOTAL as u64);
}
