use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crossbeam_utils::CachePadded;

/// Slots per page under normal load.
pub const PAGE_SIZE_DEFAULT: usize = 64;

/// Slots per page once the engine hosts a very large number of subscriptions.
pub const PAGE_SIZE_HIGH_CAPACITY: usize = 8;

/// Subscription count above which new pages use [`PAGE_SIZE_HIGH_CAPACITY`].
pub const HIGH_CAPACITY_SUBSCRIPTIONS: usize = 100_000;

/// Fraction of `max_message_count` left buffered after discard-oldest eviction.
pub const RECLAIM_SURVIVE_FRACTION: f64 = 0.95;

/// What to do once a queue holds `max_message_count` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MaxMessageBehavior {
    #[default]
    RejectNewMessages,
    DiscardOldMessages,
}

/// Per-queue policy knobs. Cloned into the queue and swappable at runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuePolicy {
    /// Zero means unlimited.
    pub max_message_count: u64,
    pub max_msg_behavior: MaxMessageBehavior,
    pub allow_send: bool,
    /// Maximum delivered-but-unacknowledged messages. Zero means unlimited.
    pub max_inflight: u64,
    pub reclaim_survive_fraction: f64,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            max_message_count: 5000,
            max_msg_behavior: MaxMessageBehavior::RejectNewMessages,
            allow_send: true,
            max_inflight: 128,
            reclaim_survive_fraction: RECLAIM_SURVIVE_FRACTION,
        }
    }
}

impl QueuePolicy {
    pub fn unlimited() -> Self {
        Self {
            max_message_count: 0,
            max_inflight: 0,
            ..Self::default()
        }
    }

    pub fn with_max_messages(mut self, max: u64, behavior: MaxMessageBehavior) -> Self {
        self.max_message_count = max;
        self.max_msg_behavior = behavior;
        self
    }

    pub fn with_max_inflight(mut self, max: u64) -> Self {
        self.max_inflight = max;
        self
    }

    pub fn with_allow_send(mut self, allow: bool) -> Self {
        self.allow_send = allow;
        self
    }

    /// Buffered count that discard-oldest eviction reduces the queue to.
    /// The leading `1 +` makes the target round up rather than down.
    pub fn reclaim_target(&self) -> u64 {
        1 + (self.max_message_count as f64 * self.reclaim_survive_fraction) as u64
    }

    /// Buffered count above which a put logs that the queue is badly overfull.
    pub fn overfull_threshold(&self) -> u64 {
        100 + 3 * self.max_message_count
    }
}

/// Source of the current time, in seconds, used for message expiry.
pub trait Clock: Send + Sync {
    fn now_secs(&self) -> u64;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_secs(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(now: u64) -> Self {
        Self {
            now: AtomicU64::new(now),
        }
    }

    pub fn set(&self, now: u64) {
        self.now.store(now, Ordering::Release);
    }

    pub fn advance(&self, secs: u64) {
        self.now.fetch_add(secs, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now_secs(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }
}

/// Engine-wide state shared by every queue.
///
/// Passed explicitly into queue construction instead of living in globals.
pub struct EngineContext {
    clock: Arc<dyn Clock>,
    total_subscriptions: CachePadded<AtomicUsize>,
    buffered_messages: CachePadded<AtomicU64>,
    live_pages: CachePadded<AtomicUsize>,
    /// Upper bound on pages alive across all queues. `None` means unbounded.
    max_pages: Option<usize>,
}

impl Default for EngineContext {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl EngineContext {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            total_subscriptions: CachePadded::new(AtomicUsize::new(0)),
            buffered_messages: CachePadded::new(AtomicU64::new(0)),
            live_pages: CachePadded::new(AtomicUsize::new(0)),
            max_pages: None,
        }
    }

    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = Some(max_pages);
        self
    }

    pub fn now_secs(&self) -> u64 {
        self.clock.now_secs()
    }

    pub fn set_total_subscriptions(&self, count: usize) {
        self.total_subscriptions.store(count, Ordering::Relaxed);
    }

    pub fn total_subscriptions(&self) -> usize {
        self.total_subscriptions.load(Ordering::Relaxed)
    }

    /// Page size for a newly created page.
    pub fn choose_page_size(&self) -> usize {
        if self.total_subscriptions() > HIGH_CAPACITY_SUBSCRIPTIONS {
            PAGE_SIZE_HIGH_CAPACITY
        } else {
            PAGE_SIZE_DEFAULT
        }
    }

    pub fn buffered_messages(&self) -> u64 {
        self.buffered_messages.load(Ordering::Relaxed)
    }

    pub(crate) fn add_buffered(&self, count: u64) {
        self.buffered_messages.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn sub_buffered(&self, count: u64) {
        self.buffered_messages.fetch_sub(count, Ordering::Relaxed);
    }

    pub fn live_pages(&self) -> usize {
        self.live_pages.load(Ordering::Relaxed)
    }

    /// Account for one more live page, failing if the budget is exhausted.
    pub(crate) fn try_reserve_page(&self) -> bool {
        let Some(max) = self.max_pages else {
            self.live_pages.fetch_add(1, Ordering::Relaxed);
            return true;
        };
        let mut current = self.live_pages.load(Ordering::Relaxed);
        loop {
            if current >= max {
                return false;
            }
            match self.live_pages.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub(crate) fn release_page(&self) {
        self.live_pages.fetch_sub(1, Ordering::Relaxed);
    }
}
