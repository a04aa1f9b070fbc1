use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
struct Counters {
    exit_nodes: AtomicUsize,
    active: AtomicUsize,
    launched: AtomicUsize,
    skipped: AtomicUsize,
    requests_ok: AtomicU64,
    requests_failed: AtomicU64,
}

/// Read-mostly view of a pool run shared with workers and reporters
#[derive(Debug, Clone, Default)]
pub struct PoolHandle {
    counters: Arc<Counters>,
}

/// Point-in-time copy of the pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub exit_nodes: usize,
    pub active_workers: usize,
    pub launched_workers: usize,
    pub skipped_nodes: usize,
    pub requests_ok: u64,
    pub requests_failed: u64,
}

impl PoolHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Workers currently running
    pub fn active_workers(&self) -> usize {
        self.counters.active.load(Ordering::SeqCst)
    }

    /// Workers launched during this run, finished or not
    pub fn launched_workers(&self) -> usize {
        self.counters.launched.load(Ordering::SeqCst)
    }

    /// Workers report each request they complete
    pub fn record_request(&self, ok: bool) {
        let counter = if ok {
            &self.counters.requests_ok
        } else {
            &self.counters.requests_failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PoolStats {
        PoolStats {
            exit_nodes: self.counters.exit_nodes.load(Ordering::SeqCst),
            active_workers: self.active_workers(),
            launched_workers: self.launched_workers(),
            skipped_nodes: self.counters.skipped.load(Ordering::SeqCst),
            requests_ok: self.counters.requests_ok.load(Ordering::Relaxed),
            requests_failed: self.counters.requests_failed.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn set_exit_nodes(&self, count: usize) {
        self.counters.exit_nodes.store(count, Ordering::SeqCst);
    }

    pub(crate) fn node_skipped(&self) {
        self.counters.skipped.fetch_add(1, Ordering::SeqCst);
    }

    /// Count a launch; the worker stays active until the guard drops
    pub(crate) fn worker_launched(&self) -> ActiveWorker {
        self.counters.launched.fetch_add(1, Ordering::SeqCst);
        self.counters.active.fetch_add(1, Ordering::SeqCst);
        ActiveWorker {
            handle: self.clone(),
        }
    }
}

/// Decrements the active count when a worker task ends, aborted or not
#[derive(Debug)]
pub(crate) struct ActiveWorker {
    handle: PoolHandle,
}

impl Drop for ActiveWorker {
    fn drop(&mut self) {
        self.handle.counters.active.fetch_sub(1, Ordering::SeqCst);
    }
}
