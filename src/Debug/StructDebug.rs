use std::fmt;

use crate::Queue::Page::arena::PageArena;
use crate::Queue::Page::{Entry, Page, Slot};
use crate::Queue::PagedQueue;

/// Debug function for PagedQueue
///
/// Shows counters and waiter state only. Cursor positions need the waiter
/// lock, so they are left to [`PagedQueue::dump`].
pub fn debug_paged_queue(queue: &PagedQueue, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PagedQueue")
        .field("name", &queue.name())
        .field("waiter", &queue.waiter.load())
        .field("buffered", &queue.buffered())
        .field("inflight", &queue.inflight())
        .field("live_pages", &queue.live_pages())
        .field("deleted", &queue.is_deleted())
        .finish_non_exhaustive()
}

/// Debug function for Page
///
/// Slot contents are not locked; only the link state is shown.
pub fn debug_page(page: &Page, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Page")
        .field("index", &page.index().0)
        .field("seq", &page.seq())
        .field("capacity", &page.capacity())
        .field("next", &page.next_index().map(|i| i.0))
        .field("next_status", &page.next_status())
        .finish()
}

pub fn debug_slot(slot: &Slot, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match slot.node.try_lock() {
        Some(node) => f
            .debug_struct("Slot")
            .field("order_id", &node.order_id)
            .field("state", &node.state)
            .field("delivery_count", &node.delivery_count)
            .finish(),
        None => f.write_str("Slot(<locked>)"),
    }
}

pub fn debug_entry(entry: &Entry, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match entry {
        Entry::Slot(slot) => debug_slot(slot, f),
        Entry::EndOfPage(index) => write!(f, "EndOfPage({})", index.0),
    }
}

pub fn debug_page_arena(arena: &PageArena, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PageArena")
        .field("live_pages", &arena.live_pages())
        .finish_non_exhaustive()
}
