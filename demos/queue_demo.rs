// cargo run --example queue_demo -- <messages_per_producer> [producers]
use std::env;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread;

use dmxp_delivery::Queue::{ConsumerEvent, EnableOptions};
use dmxp_delivery::{
    AckOutcome, Consumer, Delivery, MaxMessageBehavior, Message, PagedQueue, PutOptions, QueueBuilder, QueueError,
    QueuePolicy, Reliability,
};

struct Printer {
    queue: OnceLock<Weak<PagedQueue>>,
    received: AtomicUsize,
}

impl Consumer for Printer {
    fn deliver(&self, delivery: Delivery) -> bool {
        let received = self.received.fetch_add(1, Ordering::Relaxed) + 1;
        if received % 1000 == 0 {
            println!(
                "--- Received {} messages (last order id {}, {} bytes) ---",
                received,
                delivery.order_id,
                delivery.message.len()
            );
        }
        if let (Some(handle), Some(queue)) = (delivery.handle, self.queue.get().and_then(Weak::upgrade)) {
            let _ = queue.acknowledge(&handle, AckOutcome::Consumed, None);
        }
        true
    }

    fn on_status(&self, event: ConsumerEvent) {
        println!("Consumer: {:?}", event);
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <messages_per_producer> [producers]", args[0]);
        std::process::exit(1);
    }
    let per_producer: usize = match args[1].parse() {
        Ok(n) => n,
        Err(e) => {
            eprintln!("Invalid number of messages: {}", e);
            std::process::exit(1);
        }
    };
    let producers: usize = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(4);

    let queue = match QueueBuilder::new("demo")
        .with_policy(QueuePolicy::default().with_max_messages(10_000, MaxMessageBehavior::RejectNewMessages))
        .build()
    {
        Ok(queue) => queue,
        Err(e) => {
            eprintln!("Failed to create queue: {}", e);
            std::process::exit(1);
        }
    };

    let printer = Arc::new(Printer {
        queue: OnceLock::new(),
        received: AtomicUsize::new(0),
    });
    let _ = printer.queue.set(Arc::downgrade(&queue));
    if let Err(e) = queue.init_consumer(printer.clone()) {
        eprintln!("Failed to attach consumer: {}", e);
        std::process::exit(1);
    }
    if let Err(e) = queue.enable(EnableOptions::default()) {
        eprintln!("Failed to enable consumer: {}", e);
        std::process::exit(1);
    }

    let start = std::time::Instant::now();
    let handles: Vec<_> = (0..producers)
        .map(|p| {
            let queue = queue.clone();
            thread::spawn(move || {
                let mut full = 0u64;
                for i in 0..per_producer {
                    let message =
                        Message::new(format!("{}:{}", p, i)).with_reliability(Reliability::AtLeastOnce);
                    loop {
                        match queue.put(message.clone(), PutOptions::default(), None) {
                            Ok(_) => break,
                            Err(QueueError::DestinationFull) => {
                                full += 1;
                                thread::yield_now();
                            }
                            Err(e) => {
                                eprintln!("Producer {}: put failed: {}", p, e);
                                return;
                            }
                        }
                    }
                }
                if full > 0 {
                    println!("Producer {}: retried {} times on a full queue", p, full);
                }
            })
        })
        .collect();
    for handle in handles {
        let _ = handle.join();
    }
    let _ = queue.check_waiters();

    let elapsed = start.elapsed();
    let stats = queue.statistics();
    println!("\n{}", "=".repeat(80));
    println!("Delivered {} messages in {:?}", printer.received.load(Ordering::Relaxed), elapsed);
    println!("{:#?}", stats);
    println!("{:?}", queue);
}
