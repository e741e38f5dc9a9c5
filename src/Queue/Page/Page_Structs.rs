// A page is a fixed run of message slots closed by an end-of-page entry.
// Pages form a singly linked chain through stable arena indexes.

use std::sync::atomic::{AtomicU32, AtomicU8};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::Core::store::StoreRef;
use crate::Queue::Structs::{Message, MessageFlags};

/// Stable address of a page inside the [`super::arena::PageArena`].
///
/// Indexes are recycled once a page is freed, so anything holding an index
/// across a lock release also records the page sequence number and checks it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageIndex(pub u32);

/// `next` value of a page with no successor yet.
pub(crate) const NO_PAGE: u32 = u32::MAX;

/// Readiness of the link from a page to its successor.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStatus {
    /// The tail is still filling this page; its successor may not exist yet.
    Unfinished = 0,
    /// Appending the successor failed. Any producer may repair it.
    Failed = 1,
    /// A producer won the repair claim and is creating the successor.
    Repairing = 2,
    /// The tail has moved on; the successor is linked and the cursor may cross.
    Completed = 3,
    /// The delivery cursor has crossed into the successor.
    CursorClear = 4,
}

/// Delivery state of one slot.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Not yet published. Claimed-but-uncommitted slots stay here and block
    /// the cursor.
    Empty = 0,
    Available = 1,
    Delivered = 2,
    Received = 3,
    Consumed = 4,
    /// Being removed by eviction or expiry.
    Discarding = 5,
}

impl SlotState {
    pub fn is_inflight(self) -> bool {
        matches!(self, SlotState::Delivered | SlotState::Received)
    }
}

/// Everything a slot knows about the message it holds.
#[derive(Debug)]
pub struct NodeData {
    pub(crate) state: SlotState,
    pub(crate) msg: Option<Arc<Message>>,
    pub(crate) order_id: u64,
    pub(crate) delivery_count: u32,
    pub(crate) delivery_id: u32,
    /// The durable reference currently records a delivery.
    pub(crate) has_delivery_record: bool,
    pub(crate) store_ref: Option<StoreRef>,
    pub(crate) flags: MessageFlags,
}

pub struct Slot {
    pub(crate) node: Mutex<NodeData>,
}

pub enum Entry {
    Slot(Slot),
    /// Closes the page and names it, so a walker at the end knows where it is.
    EndOfPage(PageIndex),
}

pub struct Page {
    pub(crate) index: PageIndex,
    /// Strictly increasing along the chain.
    pub(crate) seq: u64,
    pub(crate) entries: Box<[Entry]>,
    pub(crate) next: AtomicU32,
    pub(crate) next_status: AtomicU8,
}
