// Reclamation: freeing consumed pages behind the head, evicting the oldest
// messages under discard-oldest, and draining.

use std::sync::atomic::Ordering;

use tracing::debug;

use super::queue::{CursorState, PagedQueue, Position, Removal};
use super::Page::{Entry, NextStatus, SlotState};
use crate::Core::error::Completion;
use crate::Core::waiter::ReclaimLock;

/// Most messages marked for discard before they are removed.
pub(crate) const RECLAIM_BATCH: usize = 64;

impl PagedQueue {
    /// Advance the head past consumed slots, freeing every page it leaves
    /// that the cursor has also left.
    pub(crate) fn reclaim_head(&self) {
        let mut freed = Vec::new();
        {
            let mut head = self.head.lock();
            loop {
                let page = head.page.clone();
                match page.entry(head.slot) {
                    Entry::Slot(slot) => {
                        if slot.state() != SlotState::Consumed {
                            break;
                        }
                        head.slot += 1;
                    }
                    Entry::EndOfPage(_) => {
                        if page.next_status() != NextStatus::CursorClear
                            || page.seq() >= self.cursor_page_seq.load(Ordering::Acquire)
                        {
                            break;
                        }
                        let Some(next) = self.arena.follow(&page) else {
                            break;
                        };
                        *head = Position { page: next, slot: 0 };
                        freed.push(page);
                    }
                }
            }
        }
        for page in freed {
            self.arena.release(&page);
        }
    }

    /// Evict the oldest available messages down to the policy target.
    ///
    /// If a delivering thread holds the waiter a reclaim request is left for
    /// it instead.
    pub fn reclaim_space(&self) -> Completion {
        if self.policy.read().max_message_count == 0 {
            return Completion::Done;
        }
        match self.waiter.lock_for_reclaim() {
            ReclaimLock::FlagLeft => {
                debug!(queue = %self.name, "reclaim left for waiter holder");
                Completion::Done
            }
            ReclaimLock::Locked(lock) => {
                self.reclaim_space_locked();
                self.unlock_after_operation(lock)
            }
        }
    }

    /// Runs with the waiter locked.
    pub(crate) fn reclaim_space_locked(&self) {
        let policy = self.policy.read().clone();
        if policy.max_message_count == 0 {
            return;
        }
        let target = policy.reclaim_target();
        if self.counters.buffered() <= target {
            return;
        }

        let mut discarded = 0;
        {
            let mut cursor = self.cursor_guard();
            let mut walker = cursor.pos.clone();
            loop {
                let excess = self.counters.buffered().saturating_sub(target) as usize;
                if excess == 0 {
                    break;
                }
                let victims = self.mark_available(&mut walker, excess.min(RECLAIM_BATCH));
                if victims.is_empty() {
                    break;
                }
                discarded += self.discard_slots(victims, Removal::Discarded);
            }
            self.advance_cursor_past_consumed(&mut cursor);
        }

        if discarded > 0 {
            debug!(
                queue = %self.name,
                discarded,
                buffered = self.counters.buffered(),
                target,
                "discarded oldest messages"
            );
            self.reclaim_head();
            self.unlink_trapped_pages();
        }
    }

    /// Walk forward from `walker` marking up to `limit` available slots as
    /// discarding. Claimed slots awaiting a commit are stepped over; the walk
    /// ends at the first end-of-page with nothing linked after it.
    fn mark_available(&self, walker: &mut Position, limit: usize) -> Vec<Position> {
        let mut victims = Vec::with_capacity(limit);
        while victims.len() < limit {
            let page = walker.page.clone();
            match page.entry(walker.slot) {
                Entry::EndOfPage(_) => {
                    if !page.next_status().is_linked() {
                        break;
                    }
                    match self.arena.follow(&page) {
                        Some(next) => *walker = Position { page: next, slot: 0 },
                        None => break,
                    }
                }
                Entry::Slot(slot) => {
                    let mut node = slot.lock();
                    if node.state == SlotState::Available {
                        node.state = SlotState::Discarding;
                        victims.push(walker.clone());
                    }
                    drop(node);
                    walker.slot += 1;
                }
            }
        }
        victims
    }

    pub(crate) fn advance_cursor_past_consumed(&self, cursor: &mut CursorState) {
        loop {
            match cursor.pos.page.entry(cursor.pos.slot) {
                Entry::Slot(slot) if slot.state() == SlotState::Consumed => cursor.pos.slot += 1,
                Entry::Slot(_) => return,
                Entry::EndOfPage(_) => {
                    if !self.cross_page(cursor) {
                        return;
                    }
                }
            }
        }
    }

    /// Unlink fully consumed pages stuck between the head and the cursor.
    /// The head page itself is left to the head reclaimer.
    /// Requires the waiter lock: nothing else walks the chain meanwhile.
    fn unlink_trapped_pages(&self) {
        let mut freed = Vec::new();
        {
            let head = self.head.lock();
            let cursor_seq = self.cursor_page_seq.load(Ordering::Acquire);
            let mut prev = head.page.clone();
            while let Some(page) = self.arena.follow(&prev) {
                if page.seq() >= cursor_seq {
                    break;
                }
                if page.next_status() == NextStatus::CursorClear && page.is_fully_consumed() {
                    if let Some(next) = page.next_index() {
                        prev.relink_next(next);
                        freed.push(page);
                        continue;
                    }
                }
                prev = page;
            }
        }
        if !freed.is_empty() {
            debug!(queue = %self.name, pages = freed.len(), "unlinked trapped pages");
        }
        for page in freed {
            self.arena.release(&page);
        }
    }

    /// Discard every available message. Takes the waiter and then the tail
    /// lock, so no put or delivery runs meanwhile. Must not be called from a
    /// delivery callback.
    pub fn drain(&self) -> u64 {
        let lock = loop {
            if let Some(lock) = self.waiter.try_lock_for_operation(true) {
                break lock;
            }
            std::thread::yield_now();
        };

        let mut drained = 0;
        {
            let _tail = self.tail.lock();
            let mut cursor = self.cursor_guard();
            let mut walker = self.head.lock().clone();
            loop {
                let victims = self.mark_available(&mut walker, RECLAIM_BATCH);
                if victims.is_empty() {
                    break;
                }
                drained += self.discard_slots(victims, Removal::Discarded);
            }
            self.advance_cursor_past_consumed(&mut cursor);
        }
        debug!(queue = %self.name, drained, "queue drained");

        self.reclaim_head();
        let _ = self.unlock_after_operation(lock);
        drained
    }
}
