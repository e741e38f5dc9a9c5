// Expiry: a small cache of the earliest-expiring messages for the common
// case, and a full scan that rebuilds it.

use std::collections::HashSet;

use tracing::debug;

use super::queue::{PagedQueue, Position, Removal};
use super::Page::{Entry, PageIndex, SlotState};

/// Earliest-expiry entries kept per queue.
pub(crate) const EXPIRY_CACHE_SIZE: usize = 10;

/// Most expired messages marked before they are removed.
pub(crate) const EXPIRY_BATCH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ExpiryEntry {
    pub(crate) order_id: u64,
    pub(crate) expiry: u64,
    pub(crate) page: PageIndex,
    pub(crate) page_seq: u64,
    pub(crate) slot: usize,
}

/// Tracks the buffered messages that carry an expiry.
#[derive(Debug, Default)]
pub(crate) struct ExpiryTracker {
    with_expiry: u64,
    /// Sorted by expiry; at most [`EXPIRY_CACHE_SIZE`] entries.
    earliest: Vec<ExpiryEntry>,
}

impl ExpiryTracker {
    pub(crate) fn with_expiry(&self) -> u64 {
        self.with_expiry
    }

    pub(crate) fn add(&mut self, entry: ExpiryEntry) {
        self.with_expiry += 1;
        let full = self.earliest.len() >= EXPIRY_CACHE_SIZE;
        if full && self.earliest.last().map_or(true, |last| entry.expiry >= last.expiry) {
            return;
        }
        let at = self.earliest.partition_point(|e| e.expiry <= entry.expiry);
        self.earliest.insert(at, entry);
        self.earliest.truncate(EXPIRY_CACHE_SIZE);
    }

    pub(crate) fn remove(&mut self, order_id: u64) {
        self.with_expiry = self.with_expiry.saturating_sub(1);
        self.earliest.retain(|e| e.order_id != order_id);
    }

    /// Cached entries due at `now`.
    pub(crate) fn due(&self, now: u64) -> Vec<ExpiryEntry> {
        self.earliest.iter().take_while(|e| e.expiry <= now).copied().collect()
    }

    /// Every cached entry is due and more messages with expiry exist than
    /// are cached: only a full scan can find the rest.
    pub(crate) fn exhausted(&self, now: u64) -> bool {
        self.with_expiry as usize > self.earliest.len() && self.earliest.iter().all(|e| e.expiry <= now)
    }

    /// Replace the cache with what a full scan found. Cached entries for
    /// messages the scan never saw (published after it passed their slot)
    /// are kept.
    pub(crate) fn rebuild(&mut self, mut scanned: Vec<ExpiryEntry>, seen: &HashSet<u64>) {
        scanned.extend(self.earliest.iter().filter(|e| !seen.contains(&e.order_id)).copied());
        scanned.sort_by_key(|e| (e.expiry, e.order_id));
        scanned.dedup_by_key(|e| e.order_id);
        scanned.truncate(EXPIRY_CACHE_SIZE);
        self.earliest = scanned;
    }
}

/// Result of an expiry pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapOutcome {
    Scanned,
    /// No message on the queue carries an expiry any more.
    RemoveFromReaperList,
    /// The consumer held the waiter; try again later.
    Busy,
}

impl PagedQueue {
    /// Remove available messages whose expiry is at or before `now`.
    pub fn reap_expired(&self, now: u64, force_full_scan: bool) -> ReapOutcome {
        let Some(lock) = self.waiter.try_lock_for_operation(true) else {
            return ReapOutcome::Busy;
        };

        let (due, full_scan) = {
            let tracker = self.expiry.lock();
            (tracker.due(now), force_full_scan || tracker.exhausted(now))
        };

        let mut expired = self.expire_cached(due, now);
        if full_scan {
            expired += self.expire_by_scan(now);
        }
        if expired > 0 {
            debug!(queue = %self.name, expired, full_scan, "expired messages removed");
            self.reclaim_head();
        }

        let _ = self.unlock_after_operation(lock);
        if self.expiry.lock().with_expiry() == 0 {
            ReapOutcome::RemoveFromReaperList
        } else {
            ReapOutcome::Scanned
        }
    }

    fn expire_cached(&self, due: Vec<ExpiryEntry>, now: u64) -> u64 {
        let mut victims = Vec::with_capacity(due.len());
        for entry in due {
            let Some(page) = self.arena.get(entry.page).filter(|p| p.seq() == entry.page_seq) else {
                continue;
            };
            let Some(slot) = page.slot(entry.slot) else {
                continue;
            };
            let mut node = slot.lock();
            let expired = node.msg.as_ref().is_some_and(|m| m.is_expired(now));
            if node.order_id == entry.order_id && node.state == SlotState::Available && expired {
                node.state = SlotState::Discarding;
                drop(node);
                victims.push(Position { page, slot: entry.slot });
            }
        }
        self.discard_slots(victims, Removal::Expired)
    }

    /// Walk head to tail removing expired messages and rebuilding the cache.
    /// Claimed slots still awaiting their commit are stepped over.
    fn expire_by_scan(&self, now: u64) -> u64 {
        let mut removed = 0;
        let mut survivors = Vec::new();
        let mut seen = HashSet::new();
        {
            let head = self.head.lock();
            let mut walker = head.clone();
            let mut victims = Vec::new();
            loop {
                let page = walker.page.clone();
                match page.entry(walker.slot) {
                    Entry::EndOfPage(_) => {
                        if !page.next_status().is_linked() {
                            break;
                        }
                        match self.arena.follow(&page) {
                            Some(next) => walker = Position { page: next, slot: 0 },
                            None => break,
                        }
                        continue;
                    }
                    Entry::Slot(slot) => {
                        let mut node = slot.lock();
                        let state = node.state;
                        if state == SlotState::Empty {
                            drop(node);
                            walker.slot += 1;
                            continue;
                        }
                        if let Some(expiry) = node.expiry() {
                            seen.insert(node.order_id);
                            if state == SlotState::Available && expiry <= now {
                                node.state = SlotState::Discarding;
                                victims.push(walker.clone());
                            } else if state != SlotState::Consumed && state != SlotState::Discarding {
                                survivors.push(ExpiryEntry {
                                    order_id: node.order_id,
                                    expiry,
                                    page: page.index(),
                                    page_seq: page.seq(),
                                    slot: walker.slot,
                                });
                            }
                        }
                    }
                }
                walker.slot += 1;
                if victims.len() >= EXPIRY_BATCH {
                    removed += self.discard_slots(std::mem::take(&mut victims), Removal::Expired);
                }
            }
            removed += self.discard_slots(victims, Removal::Expired);
        }
        self.expiry.lock().rebuild(survivors, &seen);
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(order_id: u64, expiry: u64) -> ExpiryEntry {
        ExpiryEntry {
            order_id,
            expiry,
            page: PageIndex(0),
            page_seq: 1,
            slot: 0,
        }
    }

    #[test]
    fn cache_keeps_earliest_sorted() {
        let mut tracker = ExpiryTracker::default();
        for i in 0..(EXPIRY_CACHE_SIZE as u64 + 5) {
            tracker.add(entry(i, 100 - i));
        }
        assert_eq!(tracker.with_expiry(), EXPIRY_CACHE_SIZE as u64 + 5);
        assert_eq!(tracker.earliest.len(), EXPIRY_CACHE_SIZE);
        assert_eq!(tracker.earliest[0].expiry, 100 - (EXPIRY_CACHE_SIZE as u64 + 4));
        assert!(tracker.earliest.windows(2).all(|w| w[0].expiry <= w[1].expiry));
    }

    #[test]
    fn exhausted_only_when_uncached_remain() {
        let mut tracker = ExpiryTracker::default();
        tracker.add(entry(1, 10));
        assert!(!tracker.exhausted(50));
        for i in 2..=(EXPIRY_CACHE_SIZE as u64 + 1) {
            tracker.add(entry(i, 10 + i));
        }
        assert!(!tracker.exhausted(5));
        assert!(tracker.exhausted(1000));
        assert_eq!(tracker.due(12).len(), 2);
    }

    #[test]
    fn rebuild_keeps_entries_added_during_scan() {
        let mut tracker = ExpiryTracker::default();
        tracker.add(entry(9, 50));
        tracker.rebuild(vec![entry(3, 70)], &HashSet::from([3]));
        let ids: Vec<_> = tracker.earliest.iter().map(|e| e.order_id).collect();
        assert_eq!(ids, vec![9, 3]);
    }

    #[test]
    fn rebuild_keeps_late_publish_with_lower_order_id() {
        let mut tracker = ExpiryTracker::default();
        // 2 committed after the scan had already passed 5
        tracker.add(entry(2, 40));
        tracker.add(entry(5, 30));
        tracker.rebuild(vec![], &HashSet::from([5]));
        let ids: Vec<_> = tracker.earliest.iter().map(|e| e.order_id).collect();
        assert_eq!(ids, vec![2]);
    }
}
