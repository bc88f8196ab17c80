//! fuzzmill: continuous fuzzing of a Go repository.
//!
//! The lifecycle driver lives here: load the configuration, wire up the
//! object store and the Docker executor, install the signal handler, and
//! hand control to the cycle scheduler until shutdown or exhaustion.

pub mod cancel;
pub mod config;
pub mod corpus;
pub mod crash;
pub mod exec;
pub mod queue;
pub mod report;
pub mod sandbox;
pub mod scheduler;
pub mod stats;
pub mod storage;
pub mod worker;

use crate::cancel::CancelToken;
use crate::config::{ensure_dir, Config};
use crate::exec::DockerExecutor;
use crate::report::CoverageReporter;
use crate::stats::Stats;
use crate::worker::TargetExecutor;
use anyhow::Context;
use std::sync::Arc;

pub fn boot(cfg: Config) -> anyhow::Result<()> {
    cfg.check().context("config error")?;
    let paths = cfg.paths()?;
    ensure_dir(&paths.results_dir)?;
    ensure_dir(&paths.report_dir)?;

    let root = CancelToken::root();
    setup_signal_handler(root.clone());

    let (store, bucket) = storage::open_bucket(&cfg.bucket);
    let reporter = CoverageReporter::new(&cfg, &paths)?;
    let executor: Arc<dyn TargetExecutor> =
        Arc::new(DockerExecutor::new(paths.clone(), reporter));
    let stats = Arc::new(Stats::new());

    scheduler::run_cycles(
        &cfg,
        &paths,
        store.as_ref(),
        &bucket,
        &executor,
        &root,
        &stats,
    )?;

    stats.report();
    log::info!("all done");
    Ok(())
}

fn setup_signal_handler(root: CancelToken) {
    use signal_hook::consts::TERM_SIGNALS;
    use signal_hook::iterator::exfiltrator::WithOrigin;
    use signal_hook::iterator::SignalsInfo;

    std::thread::spawn(move || {
        let mut signals = SignalsInfo::<WithOrigin>::new(TERM_SIGNALS).unwrap();

        if let Some(info) = signals.into_iter().next() {
            let name = signal_hook::low_level::signal_name(info.signal)
                .map(|n| format!("{}({})", n, info.signal))
                .unwrap_or_else(|| info.signal.to_string());
            log::info!("{} received, finishing the in-flight cycle teardown", name);
            root.cancel();
        }
    });
}
