//! Query generation tracking and stale-result suppression
//!
//! Every query cascade runs under a chain id handed out here. There is no
//! preemptive cancellation: stopping queries just bumps the id, and results
//! arriving for an older id are discarded on arrival. Callers that need the
//! outstanding queries to actually drain poll [`QueryManager::has_running`]
//! with short sleeps between polls.

use ahash::AHashSet;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Per-form query generation counter and query-master slot.
pub struct QueryManager {
    qid: AtomicU64,
    master: Mutex<Option<String>>,
    running: Mutex<AHashSet<String>>,
}

impl QueryManager {
    pub fn new() -> Self {
        Self {
            qid: AtomicU64::new(0),
            master: Mutex::new(None),
            running: Mutex::new(AHashSet::new()),
        }
    }

    /// The current chain id. 0 means no query has been executed yet.
    pub fn query_id(&self) -> u64 {
        self.qid.load(Ordering::SeqCst)
    }

    /// Issue a new chain id, invalidating every outstanding query.
    pub fn start_new_chain(&self) -> u64 {
        self.qid.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Invalidate all outstanding queries. Their results will be discarded
    /// on arrival; poll [`has_running`](Self::has_running) to wait for them
    /// to finish draining.
    pub fn stop_all_queries(&self) {
        self.start_new_chain();
    }

    /// The block that last initiated a query cascade.
    pub fn query_master(&self) -> Option<String> {
        self.master.lock().clone()
    }

    pub fn set_query_master(&self, block: &str) {
        *self.master.lock() = Some(block.to_string());
    }

    /// Mark a block as having a query in flight.
    pub fn begin(&self, block: &str) {
        self.running.lock().insert(block.to_string());
    }

    pub fn end(&self, block: &str) {
        self.running.lock().remove(block);
    }

    /// Whether any block still has a query in flight.
    pub fn has_running(&self) -> bool {
        !self.running.lock().is_empty()
    }

    /// Poll interval between drain checks.
    pub async fn sleep() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

impl Default for QueryManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_ids_strictly_increase() {
        let qm = QueryManager::new();

        assert_eq!(qm.query_id(), 0);

        let mut last = 0;
        for _ in 0..5 {
            let id = qm.start_new_chain();
            assert!(id > last);
            last = id;
        }
        assert_eq!(qm.query_id(), last);
    }

    #[test]
    fn stop_all_queries_supersedes_outstanding_ids() {
        let qm = QueryManager::new();

        let issued = qm.start_new_chain();
        qm.stop_all_queries();

        assert!(qm.query_id() > issued);
    }

    #[test]
    fn running_set_tracks_blocks() {
        let qm = QueryManager::new();
        assert!(!qm.has_running());

        qm.begin("emp");
        qm.begin("dept");
        assert!(qm.has_running());

        qm.end("emp");
        assert!(qm.has_running());
        qm.end("dept");
        assert!(!qm.has_running());
    }
}
