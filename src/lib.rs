// Module naming follows project convention (Core = engine-wide plumbing, Queue = the paged queue)
#[allow(non_snake_case)]
pub mod Core;
#[allow(non_snake_case)]
pub mod Queue;
#[allow(non_snake_case)]
pub mod Debug {
    pub mod StructDebug;
}

pub use Core::{
    Completion, DurableStore, EngineContext, MaxMessageBehavior, MemoryStore, QueueError, QueuePolicy,
    Transaction,
};
pub use Queue::Structs::{Message, PutOptions, Reliability};
pub use Queue::{AckOutcome, Consumer, Delivery, PagedQueue, QueueBuilder};
