use std::sync::Arc;

use super::queue::PagedQueue;
use crate::Core::config::{EngineContext, QueuePolicy};
use crate::Core::error::QueueError;
use crate::Core::store::{DurableStore, NoStore};

pub struct QueueBuilder {
    name: String,
    policy: QueuePolicy,
    ctx: Option<Arc<EngineContext>>,
    store: Option<Arc<dyn DurableStore>>,
    page_size: Option<usize>,
}

impl Default for QueueBuilder {
    fn default() -> Self {
        Self {
            name: String::from("queue"),
            policy: QueuePolicy::default(),
            ctx: None,   // private context with the system clock
            store: None, // no durable storage
            page_size: None,
        }
    }
}

impl QueueBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_policy(mut self, policy: QueuePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Share engine-wide counters, clock and page budget with other queues.
    pub fn with_context(mut self, ctx: Arc<EngineContext>) -> Self {
        self.ctx = Some(ctx);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Fix the slots per page instead of letting the engine choose.
    pub fn with_page_size(mut self, slots: usize) -> Self {
        self.page_size = Some(slots);
        self
    }

    pub fn build(self) -> Result<Arc<PagedQueue>, QueueError> {
        let ctx = self.ctx.unwrap_or_default();
        let store = self.store.unwrap_or_else(|| Arc::new(NoStore));
        PagedQueue::create(Arc::from(self.name), ctx, self.policy, store, self.page_size)
    }
}
