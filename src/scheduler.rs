//! The cycle scheduler: clone, sync the corpus in, discover targets, slice
//! the budget, drive the worker pool, sync the corpus out, clean up.

use crate::cancel::CancelToken;
use crate::config::{ensure_dir, sanitize_url, Config, Paths};
use crate::corpus;
use crate::exec::list_fuzz_targets;
use crate::queue::{Task, TaskQueue};
use crate::stats::Stats;
use crate::storage::ObjectStore;
use crate::worker::{run_worker, TargetExecutor};
use anyhow::Context;
use std::fs;
use std::process::Command;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// How one cycle finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleEnd {
    /// All workers drained the queue before the budget ran out.
    Completed,
    /// The cycle budget elapsed; residual work re-runs next cycle.
    TimedOut,
    /// The parent (signal) token canceled mid-cycle.
    ParentCanceled,
    /// Discovery found nothing to fuzz.
    NoTargets,
}

/// Outcome of the worker pool's main wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolEnd {
    Drained,
    TimedOut,
    ParentCanceled,
}

/// Long-running loop of fuzzing cycles. Returns after a graceful shutdown
/// or when discovery finds no targets; cycle-fatal errors propagate.
pub fn run_cycles(
    cfg: &Config,
    paths: &Paths,
    store: &dyn ObjectStore,
    bucket: &str,
    executor: &Arc<dyn TargetExecutor>,
    root: &CancelToken,
    stats: &Arc<Stats>,
) -> anyhow::Result<()> {
    loop {
        if root.is_canceled() {
            log::info!("shutdown requested, stopping cycle loop");
            return Ok(());
        }
        match run_cycle(cfg, paths, store, bucket, executor, root, stats)? {
            CycleEnd::NoTargets => {
                log::warn!("no fuzz targets found in any configured package, nothing to do");
                return Ok(());
            }
            CycleEnd::ParentCanceled => {
                log::info!("shutdown completed after in-flight cycle teardown");
                return Ok(());
            }
            CycleEnd::Completed | CycleEnd::TimedOut => {}
        }
    }
}

fn run_cycle(
    cfg: &Config,
    paths: &Paths,
    store: &dyn ObjectStore,
    bucket: &str,
    executor: &Arc<dyn TargetExecutor>,
    root: &CancelToken,
    stats: &Arc<Stats>,
) -> anyhow::Result<CycleEnd> {
    stats.inc_cycles();
    let cycle_start = Instant::now();

    if let Err(e) = clone_repo(cfg, paths) {
        cleanup_workspace(paths);
        return Err(e).context("failed to sync project repository");
    }

    let repo = cfg.repo_name()?;
    if let Err(e) = corpus::sync_in(store, bucket, &repo, &paths.corpus_dir) {
        log::warn!(
            "corpus sync in failed, continuing with an empty corpus: {:#}",
            e
        );
    }

    let mut pkg_targets = Vec::new();
    let mut total = 0;
    for pkg in &cfg.pkgs {
        let targets = match list_fuzz_targets(paths, pkg, root) {
            Ok(targets) => targets,
            Err(e) => {
                cleanup_workspace(paths);
                return Err(e).context("failed to list fuzz targets");
            }
        };
        total += targets.len();
        pkg_targets.push((pkg.clone(), targets));
    }

    if root.is_canceled() {
        cleanup_workspace(paths);
        return Ok(CycleEnd::ParentCanceled);
    }
    if total == 0 {
        cleanup_workspace(paths);
        return Ok(CycleEnd::NoTargets);
    }

    let budget = match per_target_budget(cfg.sync_frequency, cfg.num_workers, total) {
        Some(budget) => budget,
        None => {
            cleanup_workspace(paths);
            anyhow::bail!(
                "sync frequency {:?} leaves no per-target budget for {} target(s)",
                cfg.sync_frequency,
                total
            );
        }
    };
    log::info!(
        "cycle started: {} target(s), {} worker(s), {:?} per target",
        total,
        cfg.num_workers,
        budget
    );

    let queue = Arc::new(TaskQueue::new());
    for (pkg, targets) in &pkg_targets {
        if let Err(e) = corpus::ensure_target_dirs(&paths.corpus_dir, pkg, targets) {
            cleanup_workspace(paths);
            return Err(e).context("failed to prepare corpus directories");
        }
        for target in targets {
            queue.enqueue(Task {
                pkg: pkg.clone(),
                target: target.clone(),
            });
        }
    }

    let (end, worker_err) = run_worker_pool(
        executor,
        queue,
        cfg.num_workers,
        budget,
        cfg.sync_frequency,
        cycle_start,
        root,
        stats,
    );

    if let Some(e) = worker_err {
        // a failed worker means the corpus tree may be mid-write; skip the
        // upload and keep the last known-good archive
        cleanup_workspace(paths);
        return Err(e).context("fuzzing cycle failed");
    }

    match corpus::sync_out(store, bucket, &repo, &paths.corpus_dir) {
        Ok(_) => stats.inc_corpus_uploads(),
        Err(e) => log::error!("corpus sync out failed: {:#}", e),
    }
    cleanup_workspace(paths);
    stats.report();

    Ok(match end {
        PoolEnd::Drained => CycleEnd::Completed,
        PoolEnd::TimedOut => CycleEnd::TimedOut,
        PoolEnd::ParentCanceled => CycleEnd::ParentCanceled,
    })
}

/// Spawns the workers and waits for the first of: all workers done, the
/// cycle budget elapsing, or parent cancellation. In the latter two cases
/// the cycle token is canceled and the pool is drained before returning,
/// so no worker holds a sandbox once this function returns.
#[allow(clippy::too_many_arguments)]
fn run_worker_pool(
    executor: &Arc<dyn TargetExecutor>,
    queue: Arc<TaskQueue>,
    num_workers: usize,
    budget: Duration,
    cycle_budget: Duration,
    cycle_start: Instant,
    root: &CancelToken,
    stats: &Arc<Stats>,
) -> (PoolEnd, Option<anyhow::Error>) {
    let cycle = root.child();
    let worker_err: Arc<Mutex<Option<anyhow::Error>>> = Arc::new(Mutex::new(None));

    let mut handles = Vec::with_capacity(num_workers);
    for id in 0..num_workers {
        let executor = Arc::clone(executor);
        let queue = Arc::clone(&queue);
        let cycle = cycle.clone();
        let stats = Arc::clone(stats);
        let worker_err = Arc::clone(&worker_err);
        handles.push(thread::spawn(move || {
            if let Err(e) = run_worker(id, &queue, executor.as_ref(), budget, &cycle, &stats) {
                log::error!("{:#}", e);
                let mut slot = worker_err.lock().unwrap();
                if slot.is_none() {
                    *slot = Some(e);
                }
                // take the siblings down with us
                cycle.cancel();
            }
        }));
    }

    // single-shot "done" notifier, fired once every worker has returned
    let (done_tx, done_rx) = mpsc::sync_channel::<()>(1);
    let monitor = thread::spawn(move || {
        for handle in handles {
            let _ = handle.join();
        }
        let _ = done_tx.send(());
    });

    let end = loop {
        if root.is_canceled() {
            log::info!("shutdown initiated during fuzzing cycle, canceling workers");
            cycle.cancel();
            break PoolEnd::ParentCanceled;
        }
        if cycle_start.elapsed() >= cycle_budget {
            log::info!("cycle budget elapsed, canceling workers");
            cycle.cancel();
            break PoolEnd::TimedOut;
        }
        match done_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(()) => {
                log::info!("all workers completed early");
                break PoolEnd::Drained;
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break PoolEnd::Drained,
        }
    };

    if end != PoolEnd::Drained {
        // wait until every worker observed the cancellation and released
        // its sandbox; teardown must not race live containers
        let _ = done_rx.recv();
    }
    let _ = monitor.join();

    let err = worker_err.lock().unwrap().take();
    (end, err)
}

/// Per-target budget T = D / ceil(total / workers), in whole seconds.
/// Returns `None` when the division leaves nothing.
pub fn per_target_budget(
    sync_frequency: Duration,
    num_workers: usize,
    total_targets: usize,
) -> Option<Duration> {
    let tasks_per_worker = (total_targets + num_workers - 1) / num_workers;
    let secs = sync_frequency.as_secs() / tasks_per_worker as u64;
    if secs == 0 {
        None
    } else {
        Some(Duration::from_secs(secs))
    }
}

fn clone_repo(cfg: &Config, paths: &Paths) -> anyhow::Result<()> {
    log::info!(
        "syncing project repository {} into {}",
        sanitize_url(&cfg.src_repo),
        paths.src_dir.display()
    );
    ensure_dir(&paths.workspace)?;
    // a leftover tree from an interrupted cycle would abort the clone
    let _ = fs::remove_dir_all(&paths.src_dir);

    let output = Command::new("git")
        .args(["clone", "--depth", "1", "--single-branch"])
        .arg(&cfg.src_repo)
        .arg(&paths.src_dir)
        .output()
        .context("failed to run `git clone`")?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr)
            .replace(&cfg.src_repo, &sanitize_url(&cfg.src_repo));
        anyhow::bail!("`git clone` failed: {}", stderr.trim());
    }
    Ok(())
}

/// Deletes everything under the ephemeral workspace except the results
/// directory; crash logs must survive across cycles. Failures are logged
/// and swallowed so the next cycle still starts.
pub fn cleanup_workspace(paths: &Paths) {
    let entries = match fs::read_dir(&paths.workspace) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
        Err(e) => {
            log::error!("workspace cleanup failed (could not list contents): {}", e);
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path == paths.results_dir {
            continue;
        }
        let result = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        if let Err(e) = result {
            log::error!("failed to remove workspace item {}: {}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::ExecOutcome;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn budget_matches_reference_cases() {
        // 5 targets over 3 workers in 3 minutes: two waves of 90s
        assert_eq!(
            per_target_budget(Duration::from_secs(180), 3, 5),
            Some(Duration::from_secs(90))
        );
        // 43 targets over 7 workers in 3h37m53s: 31m7s per target
        assert_eq!(
            per_target_budget(Duration::from_secs(3 * 3600 + 37 * 60 + 53), 7, 43),
            Some(Duration::from_secs(31 * 60 + 7))
        );
        assert_eq!(per_target_budget(Duration::from_secs(2), 1, 3), None);
    }

    #[test]
    fn cleanup_spares_results_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let workspace = tmp.path().join("out");
        let paths = Paths {
            workspace: workspace.clone(),
            src_dir: workspace.join("project"),
            corpus_dir: workspace.join("corpus"),
            results_dir: workspace.join("fuzz_results"),
            report_dir: workspace.join("fuzz_results/reports"),
        };
        fs::create_dir_all(&paths.src_dir).unwrap();
        fs::create_dir_all(&paths.corpus_dir).unwrap();
        fs::create_dir_all(&paths.results_dir).unwrap();
        fs::write(paths.src_dir.join("main.go"), "package main").unwrap();
        fs::write(paths.results_dir.join("FuzzX_failure.log"), "log").unwrap();

        cleanup_workspace(&paths);

        assert!(!paths.src_dir.exists());
        assert!(!paths.corpus_dir.exists());
        assert!(paths.results_dir.join("FuzzX_failure.log").exists());
    }

    /// Executor that tracks how many sandboxes are live and honors
    /// cancellation like the real one.
    struct TrackingExecutor {
        run_for: Duration,
        active: AtomicUsize,
        fail_on_call: Option<usize>,
        calls: AtomicUsize,
    }

    impl TrackingExecutor {
        fn new(run_for: Duration) -> Self {
            Self {
                run_for,
                active: AtomicUsize::new(0),
                fail_on_call: None,
                calls: AtomicUsize::new(0),
            }
        }

        fn failing_on(call: usize, run_for: Duration) -> Self {
            Self {
                fail_on_call: Some(call),
                ..Self::new(run_for)
            }
        }
    }

    impl TargetExecutor for TrackingExecutor {
        fn execute(
            &self,
            _task: &Task,
            _budget: Duration,
            token: &CancelToken,
        ) -> anyhow::Result<ExecOutcome> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_on_call == Some(call) {
                anyhow::bail!("sandbox start failed");
            }
            self.active.fetch_add(1, Ordering::SeqCst);
            let started = Instant::now();
            let outcome = loop {
                if token.is_canceled() {
                    break ExecOutcome::Canceled;
                }
                if started.elapsed() >= self.run_for {
                    break ExecOutcome::Clean;
                }
                thread::sleep(Duration::from_millis(5));
            };
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(outcome)
        }
    }

    fn queue_with(n: usize) -> Arc<TaskQueue> {
        let q = TaskQueue::new();
        for i in 0..n {
            q.enqueue(Task {
                pkg: "parser".to_string(),
                target: format!("Fuzz{}", i),
            });
        }
        Arc::new(q)
    }

    #[test]
    fn pool_drains_fast_queue() {
        let exec = Arc::new(TrackingExecutor::new(Duration::ZERO));
        let executor: Arc<dyn TargetExecutor> = exec.clone();
        let (end, err) = run_worker_pool(
            &executor,
            queue_with(4),
            2,
            Duration::from_secs(60),
            Duration::from_secs(60),
            Instant::now(),
            &CancelToken::root(),
            &Arc::new(Stats::new()),
        );
        assert_eq!(end, PoolEnd::Drained);
        assert!(err.is_none());
        assert_eq!(exec.active.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn pool_cancels_on_cycle_timeout() {
        let exec = Arc::new(TrackingExecutor::new(Duration::from_secs(30)));
        let executor: Arc<dyn TargetExecutor> = exec.clone();
        let started = Instant::now();
        let (end, err) = run_worker_pool(
            &executor,
            queue_with(2),
            2,
            Duration::from_secs(30),
            Duration::from_millis(200),
            started,
            &CancelToken::root(),
            &Arc::new(Stats::new()),
        );
        assert_eq!(end, PoolEnd::TimedOut);
        assert!(err.is_none());
        // teardown slack only: nowhere near the 30s run time
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(exec.active.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn pool_cancels_on_parent_cancel_and_releases_sandboxes() {
        let exec = Arc::new(TrackingExecutor::new(Duration::from_secs(30)));
        let executor: Arc<dyn TargetExecutor> = exec.clone();
        let root = CancelToken::root();
        {
            let root = root.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(100));
                root.cancel();
            });
        }
        let (end, err) = run_worker_pool(
            &executor,
            queue_with(2),
            2,
            Duration::from_secs(30),
            Duration::from_secs(180),
            Instant::now(),
            &root,
            &Arc::new(Stats::new()),
        );
        assert_eq!(end, PoolEnd::ParentCanceled);
        assert!(err.is_none());
        assert_eq!(exec.active.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn worker_error_cancels_siblings() {
        let exec = Arc::new(TrackingExecutor::failing_on(0, Duration::from_secs(30)));
        let executor: Arc<dyn TargetExecutor> = exec.clone();
        let started = Instant::now();
        let (_, err) = run_worker_pool(
            &executor,
            queue_with(4),
            2,
            Duration::from_secs(30),
            Duration::from_secs(180),
            started,
            &CancelToken::root(),
            &Arc::new(Stats::new()),
        );
        let err = err.expect("worker error should surface");
        assert!(format!("{:#}", err).contains("sandbox start failed"));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(exec.active.load(Ordering::SeqCst), 0);
    }
}
