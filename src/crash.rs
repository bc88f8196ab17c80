//! Streaming parser for sandbox output: detects the fuzz driver's failure
//! marker, persists the crash log, and captures the failing input.
//!
//! The parser is a two-state machine. It scans lines until `--- FAIL:`
//! appears, then switches to capturing: the log file is created lazily on
//! the transition and every line from the marker onward is appended. While
//! capturing it tries once to extract the `<target>/<id>` of the failing
//! input; the input's contents (or a placeholder) are buffered and
//! appended after the stream ends, so re-parsing the same stream always
//! yields a byte-identical file.

use crate::config::ensure_dir;
use lazy_static::lazy_static;
use regex::Regex;
use std::fs::{self, File};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

/// Substring the fuzz driver prints on the first line of a failure.
pub const FAIL_MARKER: &str = "--- FAIL:";

lazy_static! {
    /// Matches both failure shapes the fuzz driver emits:
    ///   failure while testing seed corpus entry: FuzzFoo/771e938e4458e983
    ///   Failing input written to testdata/fuzz/FuzzFoo/771e938e4458e983
    static ref FAILURE_RE: Regex = Regex::new(
        r"(?:failure while testing seed corpus entry:\s*|Failing input written to\s*testdata/fuzz/)(?P<target>[^/]+)/(?P<id>[0-9a-f]+)"
    )
    .unwrap();
}

/// Parses one sandbox's log stream and writes
/// `<results_dir>/<Target>_failure.log` when a crash is observed.
pub struct OutputParser {
    results_dir: PathBuf,
    /// Directory holding per-target input dirs (`<target>/<id>`) for the
    /// package under test.
    corpus_dir: PathBuf,
    pkg: String,
    target: String,
}

impl OutputParser {
    pub fn new(results_dir: &Path, corpus_dir: &Path, pkg: &str, target: &str) -> Self {
        Self {
            results_dir: results_dir.to_path_buf(),
            corpus_dir: corpus_dir.to_path_buf(),
            pkg: pkg.to_string(),
            target: target.to_string(),
        }
    }

    /// Consumes the stream to its end. Returns true iff a failure marker
    /// was seen. File errors are logged, never propagated: a broken crash
    /// log must not take the worker down.
    pub fn process_stream<R: BufRead>(&self, stream: R) -> bool {
        let mut capturing = false;
        let mut log_file: Option<File> = None;
        let mut failing_input: Option<Vec<u8>> = None;

        for line in stream.lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    log::warn!("{}/{}: log stream error: {}", self.pkg, self.target, e);
                    break;
                }
            };
            log::debug!("{}/{}: {}", self.pkg, self.target, line);

            if !capturing {
                if line.contains(FAIL_MARKER) {
                    capturing = true;
                    log_file = self.create_log_file();
                    append_line(&mut log_file, &line);
                }
                continue;
            }

            append_line(&mut log_file, &line);
            if failing_input.is_none() {
                if let Some((target, id)) = parse_failure_line(&line) {
                    failing_input = Some(self.read_failing_input(&target, &id));
                }
            }
        }

        if let (Some(file), Some(data)) = (log_file.as_mut(), failing_input.as_ref()) {
            if let Err(e) = file.write_all(data).and_then(|_| file.write_all(b"\n")) {
                log::error!("failed to write failing input section: {}", e);
            }
        }
        capturing
    }

    fn log_path(&self) -> PathBuf {
        self.results_dir.join(format!("{}_failure.log", self.target))
    }

    fn create_log_file(&self) -> Option<File> {
        if let Err(e) = ensure_dir(&self.results_dir) {
            log::error!("failed to create results directory: {:#}", e);
            return None;
        }
        let path = self.log_path();
        match File::create(&path) {
            Ok(file) => {
                log::warn!(
                    "{}/{}: crash detected, writing {}",
                    self.pkg,
                    self.target,
                    path.display()
                );
                Some(file)
            }
            Err(e) => {
                log::error!("failed to create crash log {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Reads the saved failing input; on any error the returned section
    /// carries a placeholder instead. Seed-corpus entries frequently have
    /// no saved file, so unreadable inputs are expected.
    fn read_failing_input(&self, target: &str, id: &str) -> Vec<u8> {
        let rel = format!("{}/{}", target, id);
        let path = self.corpus_dir.join(target).join(id);
        match fs::read(&path) {
            Ok(data) => {
                let mut section =
                    format!("\n\n=== Failing testcase ({}) ===\n", rel).into_bytes();
                section.extend_from_slice(&data);
                section
            }
            Err(e) => format!("\n<< failed to read {}: {} >>\n", rel, e).into_bytes(),
        }
    }
}

fn append_line(file: &mut Option<File>, line: &str) {
    if let Some(f) = file {
        if let Err(e) = f.write_all(line.as_bytes()).and_then(|_| f.write_all(b"\n")) {
            log::error!("failed to write crash log line: {}", e);
        }
    }
}

/// Extracts `(target, id)` from a failure line, if it matches.
pub fn parse_failure_line(line: &str) -> Option<(String, String)> {
    let caps = FAILURE_RE.captures(line)?;
    Some((caps["target"].to_string(), caps["id"].to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const CRASH_STREAM: &str = "\
fuzz: elapsed: 0s, gathering baseline coverage: 0/12 completed
fuzz: elapsed: 3s, execs: 41289 (13763/sec), new interesting: 2 (total: 14)
--- FAIL: FuzzParseComplex (3.41s)
    --- FAIL: FuzzParseComplex (0.00s)
        parser_test.go:33: unbalanced bracket accepted
    Failing input written to testdata/fuzz/FuzzParseComplex/771e938e4458e983
    To re-run:
    go test -run=FuzzParseComplex/771e938e4458e983
FAIL
exit status 1
";

    fn parser(tmp: &tempfile::TempDir, target: &str) -> OutputParser {
        let results = tmp.path().join("results");
        let corpus = tmp.path().join("corpus/parser/testdata/fuzz");
        OutputParser::new(&results, &corpus, "parser", target)
    }

    #[test]
    fn clean_stream_produces_no_log() {
        let tmp = tempfile::tempdir().unwrap();
        let p = parser(&tmp, "FuzzParseComplex");
        let stream = "fuzz: elapsed: 3s, execs: 1000\nok  \texample.com/parser\t90.01s\n";

        assert!(!p.process_stream(Cursor::new(stream)));
        assert!(!tmp
            .path()
            .join("results/FuzzParseComplex_failure.log")
            .exists());
    }

    #[test]
    fn crash_log_captures_marker_and_failing_input() {
        let tmp = tempfile::tempdir().unwrap();
        let input_dir = tmp.path().join("corpus/parser/testdata/fuzz/FuzzParseComplex");
        fs::create_dir_all(&input_dir).unwrap();
        fs::write(
            input_dir.join("771e938e4458e983"),
            "go test fuzz v1\nstring(\"[[\")\n",
        )
        .unwrap();

        let p = parser(&tmp, "FuzzParseComplex");
        assert!(p.process_stream(Cursor::new(CRASH_STREAM)));

        let log = fs::read_to_string(tmp.path().join("results/FuzzParseComplex_failure.log"))
            .unwrap();
        assert!(log.starts_with("--- FAIL: FuzzParseComplex"));
        assert!(log.contains("unbalanced bracket accepted"));
        assert!(log
            .contains("=== Failing testcase (FuzzParseComplex/771e938e4458e983) ==="));
        assert!(log.contains("go test fuzz v1"));
        // pre-marker noise stays out of the file
        assert!(!log.contains("gathering baseline coverage"));
    }

    #[test]
    fn unreadable_input_yields_placeholder() {
        let tmp = tempfile::tempdir().unwrap();
        let stream = "\
--- FAIL: FuzzX (0.02s)
    failure while testing seed corpus entry: FuzzX/771e938e4458e983
FAIL
";
        let p = parser(&tmp, "FuzzX");
        assert!(p.process_stream(Cursor::new(stream)));

        let log = fs::read_to_string(tmp.path().join("results/FuzzX_failure.log")).unwrap();
        assert!(log.contains("<< failed to read FuzzX/771e938e4458e983:"));
    }

    #[test]
    fn reparsing_is_byte_identical() {
        let tmp = tempfile::tempdir().unwrap();
        let p = parser(&tmp, "FuzzParseComplex");
        let log_path = tmp.path().join("results/FuzzParseComplex_failure.log");

        assert!(p.process_stream(Cursor::new(CRASH_STREAM)));
        let first = fs::read(&log_path).unwrap();
        assert!(p.process_stream(Cursor::new(CRASH_STREAM)));
        let second = fs::read(&log_path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn extraction_matches_both_failure_shapes() {
        let (t, id) = parse_failure_line(
            "    Failing input written to testdata/fuzz/FuzzParseComplex/771e938e4458e983",
        )
        .unwrap();
        assert_eq!(t, "FuzzParseComplex");
        assert_eq!(id, "771e938e4458e983");

        let (t, id) =
            parse_failure_line("failure while testing seed corpus entry: FuzzX/0123abcd")
                .unwrap();
        assert_eq!(t, "FuzzX");
        assert_eq!(id, "0123abcd");

        // f.Add seed entries carry no hex id and are not extractable
        assert!(
            parse_failure_line("failure while testing seed corpus entry: FuzzX/seed#0")
                .is_none()
        );
        assert!(parse_failure_line("fuzz: elapsed: 3s").is_none());
    }
}
