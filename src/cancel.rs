//! Cooperative cancellation tokens.
//!
//! A token tree mirrors the ownership chain of the orchestrator: the root
//! token is canceled by the signal handler, each fuzzing cycle runs under a
//! child of the root, and every sandbox execution gets a deadline-bearing
//! leaf under its cycle. Canceling a token is one-way and observed by the
//! whole subtree; a leaf expiring affects nobody else. Teardown (sandbox
//! release, workspace cleanup) takes no token at all, so a cancel cascade
//! can never skip it.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

#[derive(Clone, Debug)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    canceled: AtomicBool,
    deadline: Option<Instant>,
    parent: Option<CancelToken>,
}

impl CancelToken {
    pub fn root() -> Self {
        Self::new(None, None)
    }

    fn new(parent: Option<CancelToken>, deadline: Option<Instant>) -> Self {
        Self {
            inner: Arc::new(Inner {
                canceled: AtomicBool::new(false),
                deadline,
                parent,
            }),
        }
    }

    pub fn child(&self) -> Self {
        Self::new(Some(self.clone()), None)
    }

    /// Child token that additionally expires `budget` from now.
    pub fn with_timeout(&self, budget: Duration) -> Self {
        Self::new(Some(self.clone()), Some(Instant::now() + budget))
    }

    pub fn cancel(&self) {
        self.inner.canceled.store(true, Ordering::Release);
    }

    pub fn is_canceled(&self) -> bool {
        if self.inner.canceled.load(Ordering::Acquire) {
            return true;
        }
        if let Some(deadline) = self.inner.deadline {
            if Instant::now() >= deadline {
                return true;
            }
        }
        match &self.inner.parent {
            Some(parent) => parent.is_canceled(),
            None => false,
        }
    }
}
