use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared across the worker pool and the cycle loop.
#[derive(Debug, Default)]
pub struct Stats {
    cycles: AtomicU64,
    executions: AtomicU64,
    clean_runs: AtomicU64,
    crashes: AtomicU64,
    reenqueued: AtomicU64,
    corpus_uploads: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_cycles(&self) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_executions(&self) {
        self.executions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_clean_runs(&self) {
        self.clean_runs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_crashes(&self) {
        self.crashes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_reenqueued(&self) {
        self.reenqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_corpus_uploads(&self) {
        self.corpus_uploads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn crashes(&self) -> u64 {
        self.crashes.load(Ordering::Relaxed)
    }

    pub fn report(&self) {
        log::info!(
            "cycles: {}, exec clean/crash/total {}/{}/{}, re-enqueued: {}, corpus uploads: {}",
            self.cycles.load(Ordering::Relaxed),
            self.clean_runs.load(Ordering::Relaxed),
            self.crashes.load(Ordering::Relaxed),
            self.executions.load(Ordering::Relaxed),
            self.reenqueued.load(Ordering::Relaxed),
            self.corpus_uploads.load(Ordering::Relaxed),
        );
    }
}
