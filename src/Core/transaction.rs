// Transaction soft log. Queue operations performed under a transaction
// register a record here; the record's phases run at commit or rollback.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, warn};

use super::error::Completion;
use super::store::{Commit, DurableStore};

static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);

/// One replayable operation in a transaction.
///
/// `memory_commit` runs for every record before any `post_commit`; the same
/// holds for `rollback` and `post_rollback`.
pub trait TransactionRecord: Send {
    fn memory_commit(&mut self);
    fn post_commit(&mut self);
    fn rollback(&mut self);
    fn post_rollback(&mut self);
    /// The record was added after a savepoint that has been rolled back to.
    /// From here on commit must treat it as rolled back.
    fn savepoint_rollback(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Savepoint(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransactionState {
    InFlight,
    Committed,
    RolledBack,
}

struct LoggedRecord {
    savepoint: u32,
    rolled_back: bool,
    record: Box<dyn TransactionRecord>,
}

pub struct Transaction {
    id: u64,
    records: Vec<LoggedRecord>,
    savepoint: u32,
    state: TransactionState,
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

impl Transaction {
    pub fn new() -> Self {
        Self {
            id: NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed),
            records: Vec::new(),
            savepoint: 0,
            state: TransactionState::InFlight,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn add(&mut self, record: Box<dyn TransactionRecord>) {
        self.records.push(LoggedRecord {
            savepoint: self.savepoint,
            rolled_back: false,
            record,
        });
    }

    /// Mark a point that later work can be rolled back to.
    pub fn savepoint(&mut self) -> Savepoint {
        self.savepoint += 1;
        Savepoint(self.savepoint)
    }

    /// Undo every record added since `savepoint` was taken.
    pub fn rollback_to_savepoint(&mut self, savepoint: Savepoint) {
        let mut undone = 0usize;
        for logged in self.records.iter_mut().rev() {
            if logged.savepoint < savepoint.0 || logged.rolled_back {
                continue;
            }
            logged.record.savepoint_rollback();
            logged.rolled_back = true;
            undone += 1;
        }
        debug!(transaction = self.id, savepoint = savepoint.0, undone, "rolled back to savepoint");
    }

    /// Commit through `store`. When the store completes asynchronously the
    /// record phases run in its continuation and `Pending` is returned.
    pub fn commit(mut self, store: &dyn DurableStore) -> Completion {
        self.state = TransactionState::Committed;
        let mut records = std::mem::take(&mut self.records);
        let id = self.id;
        let finish = move || {
            for logged in records.iter_mut() {
                logged.record.memory_commit();
            }
            for logged in records.iter_mut() {
                logged.record.post_commit();
            }
            debug!(transaction = id, records = records.len(), "transaction committed");
        };
        match store.commit(Box::new(finish)) {
            Commit::Done(continuation) => {
                continuation();
                Completion::Done
            }
            Commit::Pending => Completion::Pending,
        }
    }

    pub fn rollback(mut self, store: &dyn DurableStore) {
        store.rollback();
        self.rollback_records();
    }

    fn rollback_records(&mut self) {
        self.state = TransactionState::RolledBack;
        let mut records = std::mem::take(&mut self.records);
        for logged in records.iter_mut().rev() {
            logged.record.rollback();
        }
        for logged in records.iter_mut().rev() {
            logged.record.post_rollback();
        }
        debug!(transaction = self.id, records = records.len(), "transaction rolled back");
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state == TransactionState::InFlight && !self.records.is_empty() {
            warn!(transaction = self.id, records = self.records.len(), "transaction dropped in flight, rolling back");
            self.rollback_records();
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("records", &self.records.len())
            .field("savepoint", &self.savepoint)
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Core::store::NoStore;
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        undone: bool,
    }

    impl Recorder {
        fn boxed(name: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Box<dyn TransactionRecord> {
            Box::new(Self {
                name,
                log: log.clone(),
                undone: false,
            })
        }

        fn push(&self, phase: &str) {
            self.log.lock().push(format!("{}:{}", self.name, phase));
        }
    }

    impl TransactionRecord for Recorder {
        fn memory_commit(&mut self) {
            if self.undone {
                self.push("rollback");
            } else {
                self.push("commit");
            }
        }
        fn post_commit(&mut self) {
            self.push("post_commit");
        }
        fn rollback(&mut self) {
            self.push("rollback");
        }
        fn post_rollback(&mut self) {
            self.push("post_rollback");
        }
        fn savepoint_rollback(&mut self) {
            self.undone = true;
        }
    }

    #[test]
    fn commit_runs_memory_phase_before_post_phase() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut tran = Transaction::new();
        tran.add(Recorder::boxed("a", &log));
        tran.add(Recorder::boxed("b", &log));
        assert_eq!(tran.commit(&NoStore), Completion::Done);
        assert_eq!(
            *log.lock(),
            vec!["a:commit", "b:commit", "a:post_commit", "b:post_commit"]
        );
    }

    #[test]
    fn savepoint_rollback_only_touches_later_records() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut tran = Transaction::new();
        tran.add(Recorder::boxed("a", &log));
        let sp = tran.savepoint();
        tran.add(Recorder::boxed("b", &log));
        tran.rollback_to_savepoint(sp);
        let _ = tran.commit(&NoStore);
        assert_eq!(log.lock()[..2], ["a:commit".to_string(), "b:rollback".to_string()]);
    }

    #[test]
    fn dropped_transaction_rolls_back() {
        let log = Arc::new(Mutex::new(Vec::new()));
        {
            let mut tran = Transaction::new();
            tran.add(Recorder::boxed("a", &log));
        }
        assert_eq!(*log.lock(), vec!["a:rollback", "a:post_rollback"]);
    }
}
