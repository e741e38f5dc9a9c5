// Page chain manager: owns every page of one queue, addressed by stable index.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use super::Page_Structs::{NextStatus, Page, PageIndex};
use crate::Core::config::EngineContext;
use crate::Core::error::QueueError;

pub struct PageArena {
    queue: Arc<str>,
    ctx: Arc<EngineContext>,
    /// Fixed page size for this queue; otherwise chosen by the engine per page.
    page_size: Option<usize>,
    pages: RwLock<Vec<Option<Arc<Page>>>>,
    free: Mutex<Vec<u32>>,
    next_seq: AtomicU64,
}

impl PageArena {
    pub(crate) fn new(queue: Arc<str>, ctx: Arc<EngineContext>, page_size: Option<usize>) -> Self {
        Self {
            queue,
            ctx,
            page_size,
            pages: RwLock::new(Vec::new()),
            free: Mutex::new(Vec::new()),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Allocate an empty page with the next sequence number.
    pub(crate) fn create_page(&self) -> Result<Arc<Page>, QueueError> {
        if !self.ctx.try_reserve_page() {
            warn!(queue = %self.queue, live_pages = self.ctx.live_pages(), "page budget exhausted");
            return Err(QueueError::AllocationFailure("page budget exhausted"));
        }
        let capacity = self
            .page_size
            .unwrap_or_else(|| self.ctx.choose_page_size())
            .max(1);

        let mut pages = self.pages.write();
        let index = match self.free.lock().pop() {
            Some(index) => index,
            None => {
                if pages.try_reserve(1).is_err() {
                    self.ctx.release_page();
                    return Err(QueueError::AllocationFailure("page table"));
                }
                pages.push(None);
                (pages.len() - 1) as u32
            }
        };
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let page = Arc::new(Page::new(PageIndex(index), seq, capacity));
        pages[index as usize] = Some(page.clone());
        debug!(queue = %self.queue, page_seq = seq, index, capacity, "page created");
        Ok(page)
    }

    pub fn get(&self, index: PageIndex) -> Option<Arc<Page>> {
        self.pages.read().get(index.0 as usize).and_then(|p| p.clone())
    }

    /// Look up a page a caller recorded earlier. The page must still be live.
    pub(crate) fn resolve(&self, index: PageIndex, seq: u64) -> Arc<Page> {
        match self.get(index) {
            Some(page) if page.seq == seq => page,
            found => crate::breach!(
                "stale page reference",
                queue = self.queue,
                index = index.0,
                expected_seq = seq,
                found_seq = found.map(|p| p.seq)
            ),
        }
    }

    /// The successor of `page`, if linked.
    pub(crate) fn follow(&self, page: &Page) -> Option<Arc<Page>> {
        let index = page.next_index()?;
        let Some(next) = self.get(index) else {
            crate::breach!(
                "linked page missing from arena",
                queue = self.queue,
                page_seq = page.seq,
                index = index.0
            );
        };
        if next.seq <= page.seq {
            crate::breach!(
                "page chain sequence not increasing",
                queue = self.queue,
                page_seq = page.seq,
                next_seq = next.seq
            );
        }
        Some(next)
    }

    /// Successor of the page the tail is about to leave. Repairs a failed
    /// append, or waits for one still in progress.
    pub(crate) fn ensure_next(&self, page: &Page) -> Result<Arc<Page>, QueueError> {
        loop {
            if let Some(next) = self.follow(page) {
                return Ok(next);
            }
            match page.next_status() {
                NextStatus::Failed => {
                    if !page.cas_next_status(NextStatus::Failed, NextStatus::Repairing) {
                        continue;
                    }
                    match self.create_page() {
                        Ok(next) => {
                            page.link_next(&next);
                            page.set_next_status(NextStatus::Unfinished);
                            debug!(queue = %self.queue, page_seq = page.seq, "missing page repaired");
                            return Ok(next);
                        }
                        Err(err) => {
                            page.set_next_status(NextStatus::Failed);
                            return Err(err);
                        }
                    }
                }
                NextStatus::Unfinished | NextStatus::Repairing => std::hint::spin_loop(),
                status @ (NextStatus::Completed | NextStatus::CursorClear) => crate::breach!(
                    "page marked linked without successor",
                    queue = self.queue,
                    page_seq = page.seq,
                    status = status
                ),
            }
        }
    }

    /// Append a successor to the page the tail just moved onto. On failure
    /// the page is marked so the next producer to fill it repairs the chain.
    pub(crate) fn append_after(&self, page: &Page) {
        if page.next_index().is_some() {
            return;
        }
        match self.create_page() {
            Ok(next) => page.link_next(&next),
            Err(err) => {
                page.cas_next_status(NextStatus::Unfinished, NextStatus::Failed);
                warn!(queue = %self.queue, page_seq = page.seq, %err, "failed to append page");
            }
        }
    }

    pub(crate) fn release(&self, page: &Page) {
        {
            let mut pages = self.pages.write();
            match pages.get_mut(page.index.0 as usize) {
                Some(entry) if entry.as_ref().map(|p| p.seq) == Some(page.seq) => {
                    *entry = None;
                }
                _ => crate::breach!("freeing page not in arena", queue = self.queue, page_seq = page.seq),
            }
        }
        self.free.lock().push(page.index.0);
        self.ctx.release_page();
        debug!(queue = %self.queue, page_seq = page.seq, "page freed");
    }

    /// Pages currently held by this queue.
    pub fn live_pages(&self) -> usize {
        self.pages.read().iter().filter(|p| p.is_some()).count()
    }
}

impl Drop for PageArena {
    fn drop(&mut self) {
        let live = self.live_pages();
        for _ in 0..live {
            self.ctx.release_page();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena(budget: Option<usize>) -> PageArena {
        let mut ctx = EngineContext::default();
        if let Some(max) = budget {
            ctx = ctx.with_max_pages(max);
        }
        PageArena::new(Arc::from("t"), Arc::new(ctx), Some(4))
    }

    #[test]
    fn sequence_numbers_increase_and_indexes_recycle() {
        let arena = arena(None);
        let a = arena.create_page().unwrap();
        let b = arena.create_page().unwrap();
        assert!(b.seq > a.seq);
        arena.release(&a);
        let c = arena.create_page().unwrap();
        assert_eq!(c.index, a.index);
        assert!(c.seq > b.seq);
        assert_eq!(arena.live_pages(), 2);
    }

    #[test]
    fn failed_append_is_repaired_by_next_producer() {
        let arena = arena(Some(1));
        let first = arena.create_page().unwrap();
        arena.append_after(&first);
        assert_eq!(first.next_status(), NextStatus::Failed);
        assert!(arena.ensure_next(&first).is_err());
        assert_eq!(first.next_status(), NextStatus::Failed);

        let arena = PageArena::new(Arc::from("t"), Arc::new(EngineContext::default()), Some(4));
        let first = arena.create_page().unwrap();
        first.set_next_status(NextStatus::Failed);
        let next = arena.ensure_next(&first).unwrap();
        assert_eq!(first.next_status(), NextStatus::Unfinished);
        assert_eq!(arena.follow(&first).map(|p| p.seq), Some(next.seq));
    }
}
