//! Object-store access for the shared corpus archive.
//!
//! The orchestrator only ever needs two operations, so the store is a
//! narrow trait with two backends: the S3 CLI for production buckets and a
//! plain directory tree for `file://` buckets and tests.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object store i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("`{cmd}` failed: {msg}")]
    Tool { cmd: String, msg: String },
}

pub trait ObjectStore: Send + Sync {
    /// Returns `Ok(None)` when the object does not exist.
    fn fetch(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    fn put(&self, bucket: &str, key: &str, data: &[u8]) -> Result<(), StoreError>;
}

/// Resolves a bucket spec to a store backend. `file:///path/to/bucket`
/// selects the directory backend; anything else is treated as an S3 bucket
/// name.
pub fn open_bucket(bucket: &str) -> (Box<dyn ObjectStore>, String) {
    if let Some(path) = bucket.strip_prefix("file://") {
        let path = PathBuf::from(path);
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "corpus".to_string());
        let root = path.parent().map(Path::to_path_buf).unwrap_or_default();
        (Box::new(DirStore::new(root)), name)
    } else {
        (Box::new(S3CliStore::new()), bucket.to_string())
    }
}

/// Directory-backed store: `<root>/<bucket>/<key>`.
#[derive(Debug, Clone)]
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

impl ObjectStore for DirStore {
    fn fetch(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match fs::read(self.root.join(bucket).join(key)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, bucket: &str, key: &str, data: &[u8]) -> Result<(), StoreError> {
        let path = self.root.join(bucket).join(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, data)?;
        Ok(())
    }
}

/// S3 access through the `aws` CLI, the same way the rest of the system
/// drives external tooling.
#[derive(Debug, Clone)]
pub struct S3CliStore {
    bin: String,
}

impl S3CliStore {
    pub fn new() -> Self {
        Self {
            bin: "aws".to_string(),
        }
    }
}

impl Default for S3CliStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectStore for S3CliStore {
    fn fetch(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let url = format!("s3://{}/{}", bucket, key);
        let output = Command::new(&self.bin)
            .args(["s3", "cp", url.as_str(), "-"])
            .stdin(Stdio::null())
            .output()?;
        if output.status.success() {
            return Ok(Some(output.stdout));
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("404") || stderr.contains("NoSuchKey") || stderr.contains("does not exist")
        {
            return Ok(None);
        }
        Err(StoreError::Tool {
            cmd: format!("aws s3 cp {} -", url),
            msg: stderr.trim().to_string(),
        })
    }

    fn put(&self, bucket: &str, key: &str, data: &[u8]) -> Result<(), StoreError> {
        let url = format!("s3://{}/{}", bucket, key);
        let mut child = Command::new(&self.bin)
            .args(["s3", "cp", "-", url.as_str()])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;
        child
            .stdin
            .take()
            .expect("stdin was piped")
            .write_all(data)?;
        let output = child.wait_with_output()?;
        if !output.status.success() {
            return Err(StoreError::Tool {
                cmd: format!("aws s3 cp - {}", url),
                msg: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dir_store_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = DirStore::new(tmp.path().to_path_buf());

        assert!(store.fetch("bkt", "corpus.zip").unwrap().is_none());
        store.put("bkt", "corpus.zip", b"payload").unwrap();
        assert_eq!(
            store.fetch("bkt", "corpus.zip").unwrap().as_deref(),
            Some(&b"payload"[..])
        );
    }

    #[test]
    fn open_bucket_selects_backend() {
        let (_, name) = open_bucket("file:///tmp/buckets/corpus-a");
        assert_eq!(name, "corpus-a");

        let (_, name) = open_bucket("team-fuzz-corpus");
        assert_eq!(name, "team-fuzz-corpus");
    }
}
