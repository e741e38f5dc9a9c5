use std::sync::atomic::Ordering::{AcqRel, Acquire, Release};
use std::sync::atomic::{AtomicU32, AtomicU8};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use super::Page_Structs::{Entry, NextStatus, NodeData, Page, PageIndex, Slot, SlotState, NO_PAGE};
use crate::Queue::Structs::{Message, MessageFlags};

impl NextStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => NextStatus::Unfinished,
            1 => NextStatus::Failed,
            2 => NextStatus::Repairing,
            3 => NextStatus::Completed,
            4 => NextStatus::CursorClear,
            other => crate::breach!("corrupt page next status", status = other),
        }
    }

    /// The successor is linked and final.
    pub fn is_linked(self) -> bool {
        matches!(self, NextStatus::Completed | NextStatus::CursorClear)
    }
}

impl NodeData {
    fn empty() -> Self {
        Self {
            state: SlotState::Empty,
            msg: None,
            order_id: 0,
            delivery_count: 0,
            delivery_id: 0,
            has_delivery_record: false,
            store_ref: None,
            flags: MessageFlags::empty(),
        }
    }

    /// Drop the message and mark the slot consumed. Returns what was held.
    pub(crate) fn consume(&mut self) -> Option<Arc<Message>> {
        self.state = SlotState::Consumed;
        self.store_ref = None;
        self.has_delivery_record = false;
        self.msg.take()
    }

    pub(crate) fn expiry(&self) -> Option<u64> {
        self.msg.as_ref().and_then(|m| m.expiry())
    }
}

impl Slot {
    fn new() -> Self {
        Self {
            node: Mutex::new(NodeData::empty()),
        }
    }

    #[inline]
    pub(crate) fn lock(&self) -> MutexGuard<'_, NodeData> {
        self.node.lock()
    }

    pub fn state(&self) -> SlotState {
        self.node.lock().state
    }
}

impl Page {
    /// A page of `capacity` empty slots plus the closing end-of-page entry.
    pub(crate) fn new(index: PageIndex, seq: u64, capacity: usize) -> Self {
        let entries = (0..capacity)
            .map(|_| Entry::Slot(Slot::new()))
            .chain(std::iter::once(Entry::EndOfPage(index)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            index,
            seq,
            entries,
            next: AtomicU32::new(NO_PAGE),
            next_status: AtomicU8::new(NextStatus::Unfinished as u8),
        }
    }

    pub fn index(&self) -> PageIndex {
        self.index
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Message slots on the page, excluding the end entry.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.entries.len() - 1
    }

    #[inline]
    pub fn entry(&self, at: usize) -> &Entry {
        &self.entries[at]
    }

    #[inline]
    pub fn slot(&self, at: usize) -> Option<&Slot> {
        match self.entries.get(at) {
            Some(Entry::Slot(slot)) => Some(slot),
            _ => None,
        }
    }

    pub fn slots(&self) -> impl Iterator<Item = &Slot> {
        self.entries.iter().filter_map(|entry| match entry {
            Entry::Slot(slot) => Some(slot),
            Entry::EndOfPage(_) => None,
        })
    }

    pub fn next_index(&self) -> Option<PageIndex> {
        match self.next.load(Acquire) {
            NO_PAGE => None,
            raw => Some(PageIndex(raw)),
        }
    }

    pub fn next_status(&self) -> NextStatus {
        NextStatus::from_u8(self.next_status.load(Acquire))
    }

    pub(crate) fn set_next_status(&self, status: NextStatus) {
        self.next_status.store(status as u8, Release);
    }

    pub(crate) fn cas_next_status(&self, from: NextStatus, to: NextStatus) -> bool {
        self.next_status
            .compare_exchange(from as u8, to as u8, AcqRel, Acquire)
            .is_ok()
    }

    /// Single assignment of the successor.
    pub(crate) fn link_next(&self, next: &Page) {
        if let Err(existing) = self.next.compare_exchange(NO_PAGE, next.index.0, AcqRel, Acquire) {
            crate::breach!(
                "page linked twice",
                page_seq = self.seq,
                existing = existing,
                next_seq = next.seq
            );
        }
    }

    /// Bypass an unlinked successor. Only the reclaimer does this, with the
    /// head lock and waiter lock held.
    pub(crate) fn relink_next(&self, next: PageIndex) {
        self.next.store(next.0, Release);
    }

    pub fn is_fully_consumed(&self) -> bool {
        self.slots().all(|slot| slot.state() == SlotState::Consumed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_layout() {
        let page = Page::new(PageIndex(3), 9, 4);
        assert_eq!(page.capacity(), 4);
        assert!(matches!(page.entry(4), Entry::EndOfPage(PageIndex(3))));
        assert!(page.slot(4).is_none());
        assert_eq!(page.next_index(), None);
        assert_eq!(page.next_status(), NextStatus::Unfinished);
        assert!(!page.is_fully_consumed());
    }

    #[test]
    fn next_status_claim() {
        let page = Page::new(PageIndex(0), 1, 2);
        page.set_next_status(NextStatus::Failed);
        assert!(page.cas_next_status(NextStatus::Failed, NextStatus::Repairing));
        assert!(!page.cas_next_status(NextStatus::Failed, NextStatus::Repairing));
    }
}
