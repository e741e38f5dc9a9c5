mod ack;
mod builder;
mod debug;
mod dump;
mod expiry;
mod get;
mod put;
mod queue;
mod reclaim;
mod waiter_ops;

pub mod consumer;
pub mod stats;

pub use builder::QueueBuilder;
pub use consumer::{AckOutcome, Consumer, ConsumerEvent, Delivery, DeliveryHandle, EnableOptions};
pub use dump::{PageDump, PositionDump, QueueDump, SlotDump};
pub use expiry::ReapOutcome;
pub use queue::PagedQueue;
pub use stats::{ConsumerStats, QueueStatistics};

pub mod Page {
    pub mod Page_Structs;
    pub mod Page_impl;
    pub mod arena;
    pub use Page_Structs::{Entry, NextStatus, NodeData, Page, PageIndex, Slot, SlotState}; // re-export for stable path
}

pub mod Structs {
    pub mod Message_Structs;
    pub use Message_Structs::*; // re-export for stable path
}
