//! Coverage report hook, invoked after clean runs.
//!
//! Runs the target's tests with coverage on the host, renders the HTML
//! report with the fuzz engine's own tooling, and maintains a master index
//! plus a per-target history so coverage can be tracked across cycles.

use crate::cancel::CancelToken;
use crate::config::{ensure_dir, Config, Paths};
use anyhow::Context;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

lazy_static! {
    static ref COVERAGE_RE: Regex = Regex::new(r"coverage:\s+([\d.]+)%").unwrap();
}

/// One (package, target) pair known to the master index.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
struct TargetState {
    pkg: String,
    target: String,
}

/// One coverage run of a target; newest entry first.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TargetHistory {
    date: String,
    coverage: String,
    report_path: String,
}

pub struct CoverageReporter {
    project: String,
    src_dir: PathBuf,
    corpus_dir: PathBuf,
    report_dir: PathBuf,
}

impl CoverageReporter {
    pub fn new(cfg: &Config, paths: &Paths) -> anyhow::Result<Self> {
        Ok(Self {
            project: cfg.repo_name()?,
            src_dir: paths.src_dir.clone(),
            corpus_dir: paths.corpus_dir.clone(),
            report_dir: paths.report_dir.clone(),
        })
    }

    /// Regenerates the coverage report for one target and records it in
    /// the master index and the target's history.
    pub fn update(&self, pkg: &str, target: &str, token: &CancelToken) -> anyhow::Result<()> {
        let pkg_dir = self.src_dir.join(pkg);

        // the corpus found so far drives the coverage run
        let corpus_src = self
            .corpus_dir
            .join(pkg)
            .join("testdata")
            .join("fuzz")
            .join(target);
        let corpus_dst = pkg_dir.join("testdata").join("fuzz").join(target);
        copy_dir_files(&corpus_src, &corpus_dst).context("corpus copy failed")?;

        let run_filter = format!("-run=^{}$", target);
        let output = Command::new("go")
            .args([
                "test",
                run_filter.as_str(),
                "-coverprofile=coverage.out",
                "-covermode=count",
            ])
            .current_dir(&pkg_dir)
            .output()
            .context("failed to run `go test` with coverage")?;
        if !output.status.success() {
            if token.is_canceled() {
                return Ok(());
            }
            anyhow::bail!(
                "coverage test run failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let coverage = COVERAGE_RE
            .captures(&stdout)
            .map(|caps| caps[1].to_string())
            .with_context(|| format!("coverage not found in output:\n{}", stdout))?;

        let target_report_dir = self.report_dir.join("targets").join(pkg).join(target);
        ensure_dir(&target_report_dir)?;
        let html_name = format!("{}.html", chrono::Local::now().format("%Y-%m-%d"));
        let report_path = target_report_dir.join(&html_name);

        let output = Command::new("go")
            .args(["tool", "cover", "-html=coverage.out", "-o"])
            .arg(&report_path)
            .current_dir(&pkg_dir)
            .output()
            .context("failed to run `go tool cover`")?;
        if !output.status.success() {
            if token.is_canceled() {
                return Ok(());
            }
            anyhow::bail!(
                "coverage rendering failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        self.add_to_master(pkg, target)
            .context("master index update failed")?;
        let rel_report = format!("{}/{}/{}", pkg, target, html_name);
        self.update_target_history(pkg, target, &coverage, &rel_report)
            .context("target history update failed")?;
        log::info!("coverage report for {}/{}: {}%", pkg, target, coverage);
        Ok(())
    }

    fn state_path(&self) -> PathBuf {
        self.report_dir.join("state.json")
    }

    fn load_master_state(&self) -> anyhow::Result<Vec<TargetState>> {
        let path = self.state_path();
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("cannot read {}", path.display()))
            }
        };
        serde_json::from_slice(&data)
            .with_context(|| format!("invalid JSON in state file {}", path.display()))
    }

    /// Registers the target in `state.json` and regenerates `index.html`.
    /// Already-known targets are a no-op.
    fn add_to_master(&self, pkg: &str, target: &str) -> anyhow::Result<()> {
        let mut states = self.load_master_state()?;
        let state = TargetState {
            pkg: pkg.to_string(),
            target: target.to_string(),
        };
        if states.contains(&state) {
            return Ok(());
        }
        states.push(state);
        states.sort();

        ensure_dir(&self.report_dir)?;
        let data = serde_json::to_vec_pretty(&states).context("failed to serialize state")?;
        fs::write(self.state_path(), data)
            .with_context(|| format!("failed to write {}", self.state_path().display()))?;

        let index = render_master_index(&self.project, &states);
        let index_path = self.report_dir.join("index.html");
        fs::write(&index_path, index)
            .with_context(|| format!("failed to write {}", index_path.display()))
    }

    fn update_target_history(
        &self,
        pkg: &str,
        target: &str,
        coverage: &str,
        rel_report: &str,
    ) -> anyhow::Result<()> {
        let base = format!("{}_{}", pkg.replace('/', "_"), target);
        let targets_dir = self.report_dir.join("targets");
        ensure_dir(&targets_dir)?;
        let json_path = targets_dir.join(format!("{}.json", base));
        let html_path = targets_dir.join(format!("{}.html", base));

        let mut history: Vec<TargetHistory> = match fs::read(&json_path) {
            Ok(data) => serde_json::from_slice(&data)
                .with_context(|| format!("invalid history JSON {}", json_path.display()))?,
            Err(_) => Vec::new(),
        };

        let date = rel_report
            .rsplit('/')
            .next()
            .unwrap_or(rel_report)
            .trim_end_matches(".html")
            .to_string();
        // one entry per calendar day
        if history.first().map(|h| h.date.as_str()) == Some(date.as_str()) {
            return Ok(());
        }
        history.insert(
            0,
            TargetHistory {
                date,
                coverage: coverage.to_string(),
                report_path: rel_report.to_string(),
            },
        );

        let data = serde_json::to_vec_pretty(&history)
            .with_context(|| format!("failed to serialize history for {}", base))?;
        fs::write(&json_path, data)
            .with_context(|| format!("failed to write {}", json_path.display()))?;
        fs::write(&html_path, render_target_page(target, &history))
            .with_context(|| format!("failed to write {}", html_path.display()))
    }
}

fn render_master_index(project: &str, states: &[TargetState]) -> String {
    let mut rows = String::new();
    for s in states {
        let link = format!("targets/{}_{}.html", s.pkg.replace('/', "_"), s.target);
        rows.push_str(&format!(
            "      <tr><td>{}</td><td><a href=\"{}\">{}</a></td></tr>\n",
            s.pkg, link, s.target
        ));
    }
    format!(
        "<!DOCTYPE html>\n<html>\n<head><title>{project} fuzz coverage</title></head>\n<body>\n  \
         <h1>{project} fuzz coverage</h1>\n  <table>\n    <tr><th>Package</th><th>Target</th></tr>\n\
         {rows}  </table>\n</body>\n</html>\n",
        project = project,
        rows = rows
    )
}

fn render_target_page(target: &str, history: &[TargetHistory]) -> String {
    let mut rows = String::new();
    for h in history {
        rows.push_str(&format!(
            "      <tr><td>{}</td><td>{}%</td><td><a href=\"{}\">report</a></td></tr>\n",
            h.date, h.coverage, h.report_path
        ));
    }
    format!(
        "<!DOCTYPE html>\n<html>\n<head><title>{target} coverage history</title></head>\n<body>\n  \
         <h1>{target}</h1>\n  <table>\n    <tr><th>Date</th><th>Coverage</th><th>Report</th></tr>\n\
         {rows}  </table>\n</body>\n</html>\n",
        target = target,
        rows = rows
    )
}

fn copy_dir_files(src: &Path, dst: &Path) -> anyhow::Result<()> {
    let entries =
        fs::read_dir(src).with_context(|| format!("read corpus directory {}", src.display()))?;
    ensure_dir(dst)?;
    for entry in entries {
        let entry = entry?;
        if entry.path().is_dir() {
            continue;
        }
        let to = dst.join(entry.file_name());
        fs::copy(entry.path(), &to)
            .with_context(|| format!("copy {} to {}", entry.path().display(), to.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coverage_percentage_is_extracted() {
        let out = "ok  \texample.com/parser\t0.41s\tcoverage: 87.5% of statements\n";
        let caps = COVERAGE_RE.captures(out).unwrap();
        assert_eq!(&caps[1], "87.5");
        assert!(COVERAGE_RE.captures("FAIL\texample.com/parser").is_none());
    }

    fn reporter(tmp: &tempfile::TempDir) -> CoverageReporter {
        CoverageReporter {
            project: "repo".to_string(),
            src_dir: tmp.path().join("project"),
            corpus_dir: tmp.path().join("corpus"),
            report_dir: tmp.path().join("reports"),
        }
    }

    #[test]
    fn master_index_is_sorted_and_deduplicated() {
        let tmp = tempfile::tempdir().unwrap();
        let r = reporter(&tmp);

        r.add_to_master("tree", "FuzzInsert").unwrap();
        r.add_to_master("parser", "FuzzParse").unwrap();
        r.add_to_master("parser", "FuzzParse").unwrap();

        let states: Vec<TargetState> =
            serde_json::from_slice(&fs::read(r.state_path()).unwrap()).unwrap();
        assert_eq!(states.len(), 2);
        assert_eq!(states[0].pkg, "parser");

        let index = fs::read_to_string(r.report_dir.join("index.html")).unwrap();
        assert!(index.contains("targets/parser_FuzzParse.html"));
        assert!(index.contains("targets/tree_FuzzInsert.html"));
    }

    #[test]
    fn history_prepends_one_entry_per_day() {
        let tmp = tempfile::tempdir().unwrap();
        let r = reporter(&tmp);

        r.update_target_history("parser", "FuzzParse", "80.0", "parser/FuzzParse/2026-08-01.html")
            .unwrap();
        r.update_target_history("parser", "FuzzParse", "81.2", "parser/FuzzParse/2026-08-02.html")
            .unwrap();
        // same day again: no new entry
        r.update_target_history("parser", "FuzzParse", "85.0", "parser/FuzzParse/2026-08-02.html")
            .unwrap();

        let history: Vec<TargetHistory> = serde_json::from_slice(
            &fs::read(r.report_dir.join("targets/parser_FuzzParse.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].date, "2026-08-02");
        assert_eq!(history[0].coverage, "81.2");
        assert_eq!(history[1].date, "2026-08-01");

        let page =
            fs::read_to_string(r.report_dir.join("targets/parser_FuzzParse.html")).unwrap();
        assert!(page.contains("2026-08-01"));
        assert!(page.contains("81.2%"));
    }
}
