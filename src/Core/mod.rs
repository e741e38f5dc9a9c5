pub mod config;
pub mod error;
pub mod fatal;
pub mod store;
pub mod transaction;
pub mod waiter;

pub use config::{Clock, EngineContext, ManualClock, MaxMessageBehavior, QueuePolicy, SystemClock};
pub use error::{Completion, QueueError};
pub use store::{Commit, Continuation, DurableStore, MemoryStore, NoStore, ReferenceState, StoreError, StoreRef};
pub use transaction::{Savepoint, Transaction, TransactionRecord};
pub use waiter::{DeliveryStatus, PendingFlags, WaiterSnapshot, WaiterState, WaiterStatus};
