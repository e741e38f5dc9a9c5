mod common;

use std::sync::Arc;

use common::{reliable, setup_log, Recorder};
use dmxp_delivery::Core::store::{ReferenceState, StoreRef};
use dmxp_delivery::Queue::Page::SlotState;
use dmxp_delivery::Queue::{EnableOptions, ReapOutcome};
use dmxp_delivery::{
    AckOutcome, Completion, DurableStore, MaxMessageBehavior, MemoryStore, Message, PutOptions, QueueBuilder,
    QueueError, QueuePolicy, Reliability, Transaction,
};

fn durable_queue(name: &str, store: Arc<MemoryStore>) -> Arc<dmxp_delivery::PagedQueue> {
    QueueBuilder::new(name)
        .with_policy(QueuePolicy::unlimited())
        .with_store(store)
        .build()
        .unwrap()
}

#[test]
fn transactional_put_is_invisible_until_commit() {
    setup_log();
    let queue = QueueBuilder::new("tran-put")
        .with_policy(QueuePolicy::unlimited())
        .build()
        .unwrap();
    let consumer = Recorder::new();
    queue.init_consumer(consumer.clone()).unwrap();
    queue.enable(EnableOptions::default()).unwrap();

    let mut tran = Transaction::new();
    // at-most-once under a transaction never bypasses the queue
    let _ = queue
        .put(dmxp_delivery::Message::new("a"), PutOptions::default(), Some(&mut tran))
        .unwrap();
    let _ = queue.put(reliable("b"), PutOptions::default(), Some(&mut tran)).unwrap();
    assert_eq!(tran.len(), 2);
    assert_eq!(consumer.count(), 0);
    assert_eq!(queue.buffered(), 0);

    assert_eq!(tran.commit(queue.store().as_ref()), Completion::Done);
    assert_eq!(consumer.payloads(), vec!["a", "b"]);
    assert_eq!(consumer.order_ids(), vec![1, 2]);
}

#[test]
fn uncommitted_put_blocks_later_messages() {
    setup_log();
    let queue = QueueBuilder::new("tran-order")
        .with_policy(QueuePolicy::unlimited())
        .build()
        .unwrap();
    let consumer = Recorder::new();
    queue.init_consumer(consumer.clone()).unwrap();
    queue.enable(EnableOptions::default()).unwrap();

    let mut tran = Transaction::new();
    let _ = queue.put(reliable("first"), PutOptions::default(), Some(&mut tran)).unwrap();
    let _ = queue.put(reliable("second"), PutOptions::default(), None).unwrap();
    assert_eq!(consumer.count(), 0);

    let _ = tran.commit(queue.store().as_ref());
    assert_eq!(consumer.payloads(), vec!["first", "second"]);
}

#[test]
fn rolled_back_put_leaves_no_trace() {
    setup_log();
    let queue = QueueBuilder::new("tran-rollback")
        .with_policy(QueuePolicy::unlimited())
        .build()
        .unwrap();
    let consumer = Recorder::new();
    queue.init_consumer(consumer.clone()).unwrap();
    queue.enable(EnableOptions::default()).unwrap();

    let mut tran = Transaction::new();
    let _ = queue.put(reliable("gone"), PutOptions::default(), Some(&mut tran)).unwrap();
    let _ = queue.put(reliable("kept"), PutOptions::default(), None).unwrap();
    tran.rollback(queue.store().as_ref());

    assert_eq!(consumer.payloads(), vec!["kept"]);
    assert_eq!(consumer.order_ids(), vec![2]);
    assert_eq!(queue.statistics().enqueued, 1);
}

#[test]
fn savepoint_rollback_undoes_later_puts_only() {
    setup_log();
    let queue = QueueBuilder::new("savepoint")
        .with_policy(QueuePolicy::unlimited())
        .build()
        .unwrap();
    let consumer = Recorder::new();
    queue.init_consumer(consumer.clone()).unwrap();
    queue.enable(EnableOptions::default()).unwrap();

    let mut tran = Transaction::new();
    let _ = queue.put(reliable("a"), PutOptions::default(), Some(&mut tran)).unwrap();
    let savepoint = tran.savepoint();
    let _ = queue.put(reliable("b"), PutOptions::default(), Some(&mut tran)).unwrap();
    tran.rollback_to_savepoint(savepoint);
    let _ = queue.put(reliable("c"), PutOptions::default(), Some(&mut tran)).unwrap();

    let _ = tran.commit(queue.store().as_ref());
    assert_eq!(consumer.payloads(), vec!["a", "c"]);
    assert_eq!(queue.buffered(), 2);
}

#[test]
fn dropped_transaction_rolls_back() {
    setup_log();
    let queue = QueueBuilder::new("dropped")
        .with_policy(QueuePolicy::unlimited())
        .build()
        .unwrap();
    {
        let mut tran = Transaction::new();
        let _ = queue.put(reliable("never"), PutOptions::default(), Some(&mut tran)).unwrap();
    }
    let _ = queue.put(reliable("after"), PutOptions::default(), None).unwrap();
    let consumer = Recorder::new();
    queue.init_consumer(consumer.clone()).unwrap();
    queue.enable(EnableOptions::default()).unwrap();
    assert_eq!(consumer.payloads(), vec!["after"]);
}

#[test]
fn transactional_ack_removes_on_commit() {
    setup_log();
    let queue = QueueBuilder::new("tran-ack")
        .with_policy(QueuePolicy::unlimited())
        .build()
        .unwrap();
    let _ = queue.put(reliable("a"), PutOptions::default(), None).unwrap();
    let consumer = Recorder::new();
    queue.init_consumer(consumer.clone()).unwrap();
    queue.enable(EnableOptions::default()).unwrap();

    let mut tran = Transaction::new();
    let _ = queue.acknowledge(&consumer.handle(0), AckOutcome::Consumed, Some(&mut tran));
    assert_eq!(queue.buffered(), 1);
    assert_eq!(queue.inflight(), 1);

    let _ = tran.commit(queue.store().as_ref());
    assert_eq!(queue.buffered(), 0);
    assert_eq!(queue.inflight(), 0);

    let _ = queue.put(reliable("b"), PutOptions::default(), None).unwrap();
    let mut tran = Transaction::new();
    let _ = queue.acknowledge(&consumer.handle(1), AckOutcome::Consumed, Some(&mut tran));
    tran.rollback(queue.store().as_ref());
    // still delivered, awaiting a real acknowledgement
    assert_eq!(queue.buffered(), 1);
    assert_eq!(queue.inflight(), 1);
}

#[test]
fn persistent_messages_are_recorded_in_the_store() {
    setup_log();
    let store = Arc::new(MemoryStore::new());
    let queue = durable_queue("durable", store.clone());

    let _ = queue
        .put(reliable("keep").persistent(), PutOptions::default(), None)
        .unwrap();
    let _ = queue.put(reliable("volatile"), PutOptions::default(), None).unwrap();
    assert_eq!(store.reference_count(), 1);
    assert_eq!(store.reserved(), 0);

    let consumer = Recorder::new();
    queue.init_consumer(consumer.clone()).unwrap();
    queue.enable(EnableOptions::default()).unwrap();
    assert_eq!(consumer.count(), 2);

    let dump = queue.dump();
    assert!(dump.slots().find(|s| s.order_id == 1).is_some_and(|s| s.in_store));
    let store_ref = StoreRef(1);
    assert_eq!(store.reference(store_ref).map(|r| r.state), Some(ReferenceState::Delivered));

    let _ = queue.acknowledge(&consumer.handle(0), AckOutcome::Consumed, None);
    assert_eq!(store.reference_count(), 0);
    assert_eq!(queue.buffered(), 1);
}

#[test]
fn full_store_refuses_persistent_put() {
    setup_log();
    let store = Arc::new(MemoryStore::new());
    store.fail_reservations(true);
    let queue = durable_queue("no-room", store.clone());

    assert_eq!(
        queue.put(reliable("p").persistent(), PutOptions::default(), None),
        Err(QueueError::ServerCapacity)
    );
    assert_eq!(queue.buffered(), 0);
    assert_eq!(queue.dump().next_order_id, 1);

    // non-persistent messages never touch the store
    let _ = queue.put(reliable("np"), PutOptions::default(), None).unwrap();
    assert_eq!(queue.buffered(), 1);
}

#[test]
fn asynchronous_store_completes_later() {
    setup_log();
    let store = Arc::new(MemoryStore::asynchronous());
    let queue = durable_queue("async", store.clone());

    assert_eq!(
        queue.put(reliable("p").persistent(), PutOptions::default(), None),
        Ok(Completion::Pending)
    );
    assert_eq!(queue.buffered(), 0);
    assert_eq!(store.complete_pending(), 1);
    assert_eq!(queue.buffered(), 1);

    let consumer = Recorder::new();
    queue.init_consumer(consumer.clone()).unwrap();
    queue.enable(EnableOptions::default()).unwrap();
    // the delivery record commit is still outstanding
    assert_eq!(consumer.count(), 0);
    assert_eq!(store.pending_commits(), 1);

    assert_eq!(store.complete_pending(), 1);
    assert_eq!(consumer.payloads(), vec!["p"]);

    assert!(queue
        .acknowledge(&consumer.handle(0), AckOutcome::Consumed, None)
        .is_pending());
    assert_eq!(queue.buffered(), 1);
    assert_eq!(store.complete_pending(), 1);
    assert_eq!(queue.buffered(), 0);
    assert_eq!(store.reference_count(), 0);
}

#[test]
fn undelivered_and_returned_messages_drop_their_delivery_record() {
    setup_log();
    let store = Arc::new(MemoryStore::new());
    let queue = durable_queue("records", store.clone());
    for payload in ["a", "b"] {
        let _ = queue
            .put(reliable(payload).persistent(), PutOptions::default(), None)
            .unwrap();
    }
    let consumer = Recorder::refusing_at(0);
    queue.init_consumer(consumer.clone()).unwrap();
    queue.enable(EnableOptions::default()).unwrap();
    assert_eq!(consumer.payloads(), vec!["a"]);

    let state = |id| store.reference(StoreRef(id)).map(|r| r.state);
    assert_eq!(state(1), Some(ReferenceState::Delivered));
    // b was staged with a and never handed over
    assert_eq!(state(2), Some(ReferenceState::Available));

    let _ = queue.acknowledge(&consumer.handle(0), AckOutcome::NotReceived, None);
    assert_eq!(state(1), Some(ReferenceState::Available));
    assert_eq!(queue.inflight(), 0);
    assert_eq!(queue.buffered(), 2);
    assert!(store.is_durable());
}

fn available_ids(queue: &dmxp_delivery::PagedQueue) -> Vec<u64> {
    queue
        .dump()
        .slots()
        .filter(|s| s.state == SlotState::Available)
        .map(|s| s.order_id)
        .collect()
}

#[test]
fn discard_old_evicts_past_an_uncommitted_put() {
    setup_log();
    let queue = QueueBuilder::new("evict-open-tran")
        .with_policy(QueuePolicy::unlimited().with_max_messages(5, MaxMessageBehavior::DiscardOldMessages))
        .build()
        .unwrap();

    let mut tran = Transaction::new();
    let _ = queue.put(reliable("held"), PutOptions::default(), Some(&mut tran)).unwrap();
    for i in 0..10u64 {
        let message = Message::new(i.to_string()).with_reliability(Reliability::AtLeastOnce);
        let _ = queue.put(message, PutOptions::default(), None).unwrap();
    }
    assert_eq!(queue.buffered(), 5);
    assert_eq!(queue.statistics().discarded, 5);
    assert_eq!(available_ids(&queue), vec![7, 8, 9, 10, 11]);

    let _ = queue.reclaim_space();
    assert_eq!(queue.buffered(), 5);

    // the committed message is now the oldest and goes first
    let _ = tran.commit(queue.store().as_ref());
    assert_eq!(queue.buffered(), 5);
    assert_eq!(queue.statistics().discarded, 6);
    assert_eq!(available_ids(&queue), vec![7, 8, 9, 10, 11]);
}

#[test]
fn forced_expiry_scan_passes_an_uncommitted_put() {
    setup_log();
    let queue = QueueBuilder::new("expire-open-tran")
        .with_policy(QueuePolicy::unlimited())
        .build()
        .unwrap();

    let mut tran = Transaction::new();
    let _ = queue.put(reliable("held"), PutOptions::default(), Some(&mut tran)).unwrap();
    // more than the expiry cache holds
    for _ in 0..12 {
        let _ = queue
            .put(reliable("short").with_expiry(1_001), PutOptions::default(), None)
            .unwrap();
    }
    assert_eq!(queue.buffered(), 12);

    assert_eq!(queue.reap_expired(2_000, true), ReapOutcome::RemoveFromReaperList);
    assert_eq!(queue.buffered(), 0);
    assert_eq!(queue.statistics().expired, 12);

    let _ = tran.commit(queue.store().as_ref());
    assert_eq!(queue.buffered(), 1);
    assert_eq!(available_ids(&queue), vec![1]);
}
