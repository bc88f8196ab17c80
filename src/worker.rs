//! Worker loop: pull tasks, execute them with a per-target deadline, and
//! route the outcome back to the cycle.

use crate::cancel::CancelToken;
use crate::queue::{Task, TaskQueue};
use crate::stats::Stats;
use anyhow::Context;
use std::time::{Duration, Instant};

/// How one target execution ended. Errors (sandbox lifecycle failures)
/// travel separately as `Err` and take the whole cycle down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
    /// Terminal status 0, no crash observed.
    Clean,
    /// The parser observed a failure marker; a crash log was persisted.
    Crashed,
    /// The cycle (or the per-target deadline's parent) was canceled.
    Canceled,
}

/// The seam between the worker pool and the sandbox machinery. The
/// production implementation drives Docker; tests substitute stubs.
///
/// `token` is the cycle's cancellation token. Implementations arm their
/// own per-target deadline from it; only cycle or parent cancellation may
/// surface as `Canceled`.
pub trait TargetExecutor: Send + Sync {
    fn execute(
        &self,
        task: &Task,
        budget: Duration,
        token: &CancelToken,
    ) -> anyhow::Result<ExecOutcome>;
}

/// Runs until the queue drains, the cycle cancels, or a task fails.
///
/// A task that ran its full budget cleanly is re-enqueued so the next free
/// worker continues it; elapsed time is measured around the execution
/// call itself. Canceled tasks are never re-enqueued.
pub fn run_worker(
    id: usize,
    queue: &TaskQueue,
    executor: &dyn TargetExecutor,
    budget: Duration,
    cycle: &CancelToken,
    stats: &Stats,
) -> anyhow::Result<()> {
    loop {
        if cycle.is_canceled() {
            return Ok(());
        }
        let task = match queue.dequeue() {
            Some(task) => task,
            None => {
                log::info!("worker-{}: queue drained, stopping", id);
                return Ok(());
            }
        };

        log::info!("worker-{}: fuzzing {} for {:?}", id, task, budget);
        let started = Instant::now();
        let outcome = executor
            .execute(&task, budget, cycle)
            .with_context(|| format!("worker-{}: target {} failed", id, task))?;
        let elapsed = started.elapsed();
        stats.inc_executions();

        match outcome {
            ExecOutcome::Canceled => return Ok(()),
            ExecOutcome::Crashed => {
                stats.inc_crashes();
                log::warn!("worker-{}: {} crashed after {:?}", id, task, elapsed);
            }
            ExecOutcome::Clean => {
                stats.inc_clean_runs();
                log::info!("worker-{}: {} completed in {:?}", id, task, elapsed);
                if elapsed >= budget {
                    log::info!("worker-{}: re-enqueuing {}", id, task);
                    stats.inc_reenqueued();
                    queue.enqueue(task);
                }
            }
        }
    }
}
