//! Target discovery and Docker-backed target execution.

use crate::cancel::CancelToken;
use crate::config::{Paths, CONTAINER_CORPUS_DIR, CONTAINER_IMAGE, CONTAINER_PROJECT_DIR};
use crate::corpus::pkg_corpus_dir;
use crate::crash::OutputParser;
use crate::queue::Task;
use crate::report::CoverageReporter;
use crate::sandbox::{DockerDriver, SandboxGuard, SandboxSpec};
use crate::worker::{ExecOutcome, TargetExecutor};
use anyhow::Context;
use std::io::BufReader;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Headroom over `-fuzztime` before the watchdog stops a sandbox. The
/// fuzz clock only starts once the driver is compiled inside the
/// container, so the wall clock of a healthy run exceeds the budget.
const FUZZ_BUDGET_GRACE: Duration = Duration::from_secs(120);

/// Lists the fuzz entry points of one package by asking the fuzz driver on
/// the host: `go test -list=^Fuzz .` in the package directory, keeping the
/// `Fuzz`-prefixed lines.
pub fn list_fuzz_targets(
    paths: &Paths,
    pkg: &str,
    token: &CancelToken,
) -> anyhow::Result<Vec<String>> {
    log::info!("discovering fuzz targets in {}", pkg);
    let pkg_dir = paths.src_dir.join(pkg);
    let output = Command::new("go")
        .args(["test", "-list=^Fuzz", "."])
        .current_dir(&pkg_dir)
        .output()
        .with_context(|| format!("failed to run `go test -list` in {}", pkg_dir.display()))?;

    if !output.status.success() {
        if token.is_canceled() {
            return Ok(Vec::new());
        }
        anyhow::bail!(
            "`go test -list` failed for {:?}: {}",
            pkg,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    let targets: Vec<String> = String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with("Fuzz"))
        .map(str::to_string)
        .collect();
    if targets.is_empty() {
        log::warn!("no fuzz targets found in {}", pkg);
    }
    Ok(targets)
}

/// Runs one target in a Docker sandbox: create, start, stream logs through
/// the output parser, wait, classify, release. `-fuzztime` drives normal
/// termination; a watchdog stops the container when the cycle cancels or
/// when the run overshoots its budget plus grace, which ends the log
/// stream. Release itself never runs under a cancelable deadline.
pub struct DockerExecutor {
    paths: Paths,
    driver: DockerDriver,
    reporter: CoverageReporter,
    user: Option<String>,
}

impl DockerExecutor {
    pub fn new(paths: Paths, reporter: CoverageReporter) -> Self {
        Self {
            paths,
            driver: DockerDriver::new(),
            reporter,
            user: current_user(),
        }
    }

    fn sandbox_spec(&self, task: &Task, budget: Duration) -> SandboxSpec {
        let workdir = format!("{}/{}", CONTAINER_PROJECT_DIR, task.pkg);
        SandboxSpec {
            image: CONTAINER_IMAGE.to_string(),
            cmd: vec![
                "go".to_string(),
                "test".to_string(),
                format!("-fuzz=^{}$", task.target),
                format!("-test.fuzzcachedir={}", CONTAINER_CORPUS_DIR),
                format!("-fuzztime={}s", budget.as_secs()),
                "-parallel=1".to_string(),
            ],
            workdir,
            // keep the fuzz driver's build cache inside the sandbox
            env: vec![("GOCACHE".to_string(), "/tmp".to_string())],
            user: self.user.clone(),
            mounts: vec![
                (self.paths.src_dir.clone(), CONTAINER_PROJECT_DIR.to_string()),
                (
                    pkg_corpus_dir(&self.paths.corpus_dir, &task.pkg),
                    CONTAINER_CORPUS_DIR.to_string(),
                ),
            ],
        }
    }

    /// Failing inputs saved by the fuzz driver into the source tree would
    /// make every later run of the same package fail, so they are removed
    /// once the crash log has captured them.
    fn remove_failing_inputs(&self, task: &Task) -> anyhow::Result<()> {
        let dir = self
            .paths
            .src_dir
            .join(&task.pkg)
            .join("testdata")
            .join("fuzz")
            .join(&task.target);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                Err(e).with_context(|| format!("failing input cleanup in {}", dir.display()))
            }
        }
    }
}

impl TargetExecutor for DockerExecutor {
    fn execute(
        &self,
        task: &Task,
        budget: Duration,
        token: &CancelToken,
    ) -> anyhow::Result<ExecOutcome> {
        log::info!("executing {} in a sandbox for {:?}", task, budget);
        let spec = self.sandbox_spec(task, budget);

        let handle = match self.driver.create(&spec) {
            Ok(handle) => handle,
            Err(_) if token.is_canceled() => return Ok(ExecOutcome::Canceled),
            Err(e) => return Err(e).context("failed to create sandbox"),
        };
        let guard = SandboxGuard::new(&self.driver, handle.clone());

        if let Err(e) = self.driver.start(&handle) {
            if token.is_canceled() {
                return Ok(ExecOutcome::Canceled);
            }
            return Err(e).context("failed to start sandbox");
        }

        let stream = match self.driver.log_stream(&handle) {
            Ok(stream) => stream,
            Err(_) if token.is_canceled() => return Ok(ExecOutcome::Canceled),
            Err(e) => return Err(e).context("failed to attach to sandbox logs"),
        };
        let (reader, mut log_child) = stream.into_parts();

        // Leaf deadline for this sandbox only: cycle cancellation plus a
        // stop-gap well past the point where `-fuzztime` should have
        // terminated the run. Stopping the container ends the log stream
        // and unblocks the parser below.
        let stop_deadline = token.with_timeout(budget + FUZZ_BUDGET_GRACE);
        let finished = Arc::new(AtomicBool::new(false));
        let watchdog = {
            let driver = self.driver.clone();
            let handle = handle.clone();
            let stop_deadline = stop_deadline.clone();
            let finished = Arc::clone(&finished);
            thread::spawn(move || {
                while !finished.load(Ordering::Acquire) {
                    if stop_deadline.is_canceled() {
                        driver.stop(&handle);
                        return;
                    }
                    thread::sleep(Duration::from_millis(100));
                }
            })
        };

        let parser = OutputParser::new(
            &self.paths.results_dir,
            &pkg_corpus_dir(&self.paths.corpus_dir, &task.pkg),
            &task.pkg,
            &task.target,
        );
        let crashed = parser.process_stream(BufReader::new(reader));
        let wait_result = self.driver.wait(&handle);

        finished.store(true, Ordering::Release);
        let _ = watchdog.join();
        log_child.shutdown();
        guard.release();

        let status = match wait_result {
            Ok(status) => status,
            Err(_) if token.is_canceled() => return Ok(ExecOutcome::Canceled),
            Err(e) => return Err(e).context("failed to wait for sandbox"),
        };

        if crashed {
            self.remove_failing_inputs(task)?;
            return Ok(ExecOutcome::Crashed);
        }
        if status != 0 {
            if token.is_canceled() {
                return Ok(ExecOutcome::Canceled);
            }
            if stop_deadline.is_canceled() {
                // stopped by the watchdog after overrunning the slice;
                // the worker sees a full-budget run and re-enqueues it
                log::warn!(
                    "sandbox for {} overran its {:?} slice and was stopped",
                    task,
                    budget
                );
                return Ok(ExecOutcome::Clean);
            }
            anyhow::bail!("sandbox for {} exited with status {}", task, status);
        }

        if let Err(e) = self.reporter.update(&task.pkg, &task.target, token) {
            log::warn!("coverage report update for {} failed: {:#}", task, e);
        }
        Ok(ExecOutcome::Clean)
    }
}

// run the sandbox as the invoking user so mounted corpus files stay
// writable on the host
fn current_user() -> Option<String> {
    #[cfg(unix)]
    {
        Some(format!("{}:{}", nix::unistd::getuid(), nix::unistd::getgid()))
    }
    #[cfg(not(unix))]
    {
        None
    }
}
