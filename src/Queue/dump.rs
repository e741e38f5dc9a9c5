// Diagnostic dump of a queue's cursors and page chain.

use std::time::Duration;

use super::queue::PagedQueue;
use super::stats::QueueStatistics;
use super::Page::{Entry, NextStatus, PageIndex, SlotState};
use crate::Core::waiter::WaiterSnapshot;

/// How long a dump waits for the consumer to let go of the waiter.
const DUMP_LOCK_WAIT: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotDump {
    pub order_id: u64,
    pub state: SlotState,
    pub delivery_count: u32,
    pub in_store: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageDump {
    pub seq: u64,
    pub index: PageIndex,
    pub capacity: usize,
    pub next_status: NextStatus,
    pub slots: Vec<SlotDump>,
}

/// `(page seq, slot)` of one of the queue's positions.
pub type PositionDump = (u64, usize);

#[derive(Debug, Clone)]
pub struct QueueDump {
    pub name: String,
    /// The dump held the waiter, so the cursor is exact.
    pub consumer_locked: bool,
    pub waiter: WaiterSnapshot,
    pub head: PositionDump,
    /// Only read while holding the waiter.
    pub cursor: Option<PositionDump>,
    pub tail: PositionDump,
    pub next_order_id: u64,
    pub pages: Vec<PageDump>,
    pub stats: QueueStatistics,
}

impl QueueDump {
    /// Slots in chain order, across pages.
    pub fn slots(&self) -> impl Iterator<Item = &SlotDump> {
        self.pages.iter().flat_map(|p| p.slots.iter())
    }
}

impl PagedQueue {
    /// Snapshot the queue for diagnostics. Gives up on the waiter after a
    /// short wait and then leaves the cursor out.
    pub fn dump(&self) -> QueueDump {
        let waiter = self.waiter.load();
        let lock = self.waiter.lock_for_operation_within(true, DUMP_LOCK_WAIT);

        let (tail, next_order_id) = {
            let tail = self.tail.lock();
            ((tail.pos.page.seq(), tail.pos.slot), tail.next_order_id)
        };
        let cursor = lock.as_ref().map(|_| {
            let cursor = self.cursor_guard();
            (cursor.pos.page.seq(), cursor.pos.slot)
        });

        let mut pages = Vec::new();
        let head = {
            let head = self.head.lock();
            let mut page = Some(head.page.clone());
            while let Some(current) = page {
                let slots = current
                    .entries
                    .iter()
                    .filter_map(|entry| match entry {
                        Entry::Slot(slot) => {
                            let node = slot.lock();
                            Some(SlotDump {
                                order_id: node.order_id,
                                state: node.state,
                                delivery_count: node.delivery_count,
                                in_store: node.store_ref.is_some(),
                            })
                        }
                        Entry::EndOfPage(_) => None,
                    })
                    .collect();
                pages.push(PageDump {
                    seq: current.seq(),
                    index: current.index(),
                    capacity: current.capacity(),
                    next_status: current.next_status(),
                    slots,
                });
                page = self.arena.follow(&current);
            }
            (head.page.seq(), head.slot)
        };

        if let Some(lock) = lock {
            let _ = self.unlock_after_operation(lock);
        }

        QueueDump {
            name: self.name.to_string(),
            consumer_locked: cursor.is_some(),
            waiter,
            head,
            cursor,
            tail,
            next_order_id,
            pages,
            stats: self.statistics(),
        }
    }
}
