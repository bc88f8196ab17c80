use clap::Parser;
use env_logger::{Env, TimestampPrecision};
use fuzzmill::{boot, config::Config};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(version, about = "continuous fuzzing orchestrator for Go repositories")]
struct Settings {
    /// Git URL of the project to fuzz, may embed credentials.
    #[arg(long = "project.src-repo", env = "PROJECT_SRC_PATH")]
    src_repo: String,
    /// Object-store bucket holding the shared fuzz corpus.
    #[arg(long = "project.s3-bucket-name", env = "S3_BUCKET_NAME")]
    s3_bucket_name: String,
    /// Host directory for crash logs and coverage reports.
    #[arg(long = "fuzz.results-path", env = "FUZZ_RESULTS_PATH")]
    results_path: PathBuf,
    /// Package paths to fuzz, repeatable or comma-separated.
    #[arg(
        long = "fuzz.pkgs-path",
        env = "FUZZ_PKGS_PATH",
        value_delimiter = ',',
        required = true
    )]
    pkgs_path: Vec<String>,
    /// Duration of one fuzzing cycle.
    #[arg(
        long = "fuzz.sync-frequency",
        env = "SYNC_FREQUENCY",
        default_value = "120s",
        value_parser = humantime::parse_duration
    )]
    sync_frequency: Duration,
    /// Number of parallel fuzzing workers.
    #[arg(long = "fuzz.num-workers", env = "NUM_WORKERS", default_value_t = 1)]
    num_workers: usize,
}

fn main() -> anyhow::Result<()> {
    let settings = Settings::parse();

    let log_env = Env::new()
        .filter_or("FUZZMILL_LOG", "info")
        .default_write_style_or("auto");
    env_logger::Builder::from_env(log_env)
        .format_timestamp(Some(TimestampPrecision::Seconds))
        .init();

    let config = Config {
        src_repo: settings.src_repo,
        bucket: settings.s3_bucket_name,
        pkgs: settings.pkgs_path,
        results_path: settings.results_path,
        sync_frequency: settings.sync_frequency,
        num_workers: settings.num_workers,
    };

    boot(config)
}
