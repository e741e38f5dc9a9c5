use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

use crate::Core::waiter::{DeliveryStatus, WaiterSnapshot};

/// Live counters of one queue. Every update is a single atomic operation.
#[derive(Default)]
pub(crate) struct QueueCounters {
    pub(crate) buffered: CachePadded<AtomicU64>,
    pub(crate) buffered_hwm: AtomicU64,
    pub(crate) enqueued: AtomicU64,
    pub(crate) dequeued: AtomicU64,
    pub(crate) rejected: AtomicU64,
    pub(crate) discarded: AtomicU64,
    pub(crate) expired: AtomicU64,
    /// Puts handed straight to an idle consumer without touching a page.
    pub(crate) avoided: AtomicU64,
    pub(crate) inflight: CachePadded<AtomicU64>,
    pub(crate) puts_attempted: AtomicU64,
}

impl QueueCounters {
    pub(crate) fn buffered(&self) -> u64 {
        self.buffered.load(Ordering::Acquire)
    }

    pub(crate) fn inflight(&self) -> u64 {
        self.inflight.load(Ordering::Acquire)
    }

    /// Counted before the message becomes visible.
    pub(crate) fn record_enqueue(&self) {
        let buffered = self.buffered.fetch_add(1, Ordering::AcqRel) + 1;
        self.buffered_hwm.fetch_max(buffered, Ordering::Relaxed);
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the buffered count left behind.
    pub(crate) fn record_removal(&self) -> u64 {
        match self
            .buffered
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |b| b.checked_sub(1))
        {
            Ok(previous) => previous - 1,
            Err(_) => crate::breach!("buffered count underflow"),
        }
    }

    pub(crate) fn add_inflight(&self) {
        self.inflight.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn sub_inflight(&self) {
        let _ = self
            .inflight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)));
    }

    pub(crate) fn recompute_puts_attempted(&self) {
        let attempted = self.avoided.load(Ordering::Relaxed)
            + self.enqueued.load(Ordering::Relaxed)
            + self.rejected.load(Ordering::Relaxed);
        self.puts_attempted.store(attempted, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, max_messages: u64) -> QueueStatistics {
        QueueStatistics {
            buffered: self.buffered(),
            buffered_hwm: self.buffered_hwm.load(Ordering::Relaxed),
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dequeued: self.dequeued.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            avoided: self.avoided.load(Ordering::Relaxed),
            inflight: self.inflight(),
            puts_attempted: self.puts_attempted.load(Ordering::Relaxed),
            max_messages,
        }
    }

    /// Zero the flow counters. Buffered and inflight describe current
    /// contents and are left alone; the high-water mark restarts from buffered.
    pub(crate) fn reset(&self) {
        self.buffered_hwm.store(self.buffered(), Ordering::Relaxed);
        for counter in [
            &self.enqueued,
            &self.dequeued,
            &self.rejected,
            &self.discarded,
            &self.expired,
            &self.avoided,
            &self.puts_attempted,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Point-in-time statistics of a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStatistics {
    pub buffered: u64,
    pub buffered_hwm: u64,
    pub enqueued: u64,
    pub dequeued: u64,
    pub rejected: u64,
    pub discarded: u64,
    pub expired: u64,
    pub avoided: u64,
    pub inflight: u64,
    pub puts_attempted: u64,
    pub max_messages: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerStats {
    pub inflight: u64,
    pub max_inflight: u64,
    pub waiter: WaiterSnapshot,
    pub delivery_status: DeliveryStatus,
    pub connected: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn high_water_mark_tracks_peak() {
        let counters = QueueCounters::default();
        counters.record_enqueue();
        counters.record_enqueue();
        assert_eq!(counters.record_removal(), 1);
        counters.record_enqueue();
        let stats = counters.snapshot(0);
        assert_eq!(stats.buffered, 2);
        assert_eq!(stats.buffered_hwm, 2);
        assert_eq!(stats.enqueued, 3);
    }

    #[test]
    fn reset_keeps_contents() {
        let counters = QueueCounters::default();
        counters.record_enqueue();
        counters.add_inflight();
        counters.reset();
        let stats = counters.snapshot(0);
        assert_eq!(stats.enqueued, 0);
        assert_eq!(stats.buffered, 1);
        assert_eq!(stats.inflight, 1);
        assert_eq!(stats.buffered_hwm, 1);
    }
}
