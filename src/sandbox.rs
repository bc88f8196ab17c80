//! Docker-backed sandbox driver.
//!
//! Each fuzz target runs in its own container with a fixed resource cap
//! and two bind mounts: the cloned source tree and the per-package corpus.
//! The driver shells out to the `docker` CLI; the log stream merges the
//! container's stdout and stderr into one pipe so the output parser sees a
//! single ordered stream.

use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use thiserror::Error;

/// Fixed memory cap per sandbox.
pub const SANDBOX_MEM_LIMIT: &str = "2g";
/// Fixed CPU cap per sandbox.
pub const SANDBOX_CPUS: &str = "1";

/// Everything needed to create one sandbox.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    pub image: String,
    pub cmd: Vec<String>,
    /// Working directory inside the container.
    pub workdir: String,
    pub env: Vec<(String, String)>,
    /// `uid:gid` the container runs as.
    pub user: Option<String>,
    /// Host-path to container-path bind mounts.
    pub mounts: Vec<(PathBuf, String)>,
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to spawn `{cmd}`: {source}")]
    Spawn {
        cmd: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{cmd}` exited with {status}: {stderr}")]
    Runtime {
        cmd: String,
        status: ExitStatus,
        stderr: String,
    },
    #[error("unexpected output from `{cmd}`: {output:?}")]
    Parse { cmd: String, output: String },
    #[error("sandbox i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// Identifier of a created container.
#[derive(Debug, Clone)]
pub struct SandboxHandle {
    id: String,
}

impl SandboxHandle {
    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Follow-mode log child plus the read side of the merged pipe.
pub struct LogStream {
    child: Child,
    reader: os_pipe::PipeReader,
}

impl LogStream {
    pub fn into_parts(self) -> (os_pipe::PipeReader, LogChild) {
        (self.reader, LogChild { child: self.child })
    }
}

/// The `docker logs --follow` child; reaped once the stream is consumed.
pub struct LogChild {
    child: Child,
}

impl LogChild {
    pub fn shutdown(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

#[derive(Debug, Clone)]
pub struct DockerDriver {
    bin: String,
}

impl Default for DockerDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl DockerDriver {
    pub fn new() -> Self {
        Self {
            bin: "docker".to_string(),
        }
    }

    pub fn create(&self, spec: &SandboxSpec) -> Result<SandboxHandle, SandboxError> {
        let mut cmd = Command::new(&self.bin);
        cmd.args(["create", "--memory", SANDBOX_MEM_LIMIT, "--cpus", SANDBOX_CPUS]);
        if let Some(user) = &spec.user {
            cmd.args(["--user", user.as_str()]);
        }
        cmd.args(["--workdir", &spec.workdir]);
        for (key, value) in &spec.env {
            cmd.arg("--env").arg(format!("{}={}", key, value));
        }
        for (host, container) in &spec.mounts {
            cmd.arg("--volume")
                .arg(format!("{}:{}", host.display(), container));
        }
        cmd.arg(&spec.image);
        cmd.args(&spec.cmd);

        let output = run_checked(cmd)?;
        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if id.is_empty() {
            return Err(SandboxError::Parse {
                cmd: "docker create".to_string(),
                output: String::from_utf8_lossy(&output.stdout).into_owned(),
            });
        }
        log::debug!("created sandbox {}", short_id(&id));
        Ok(SandboxHandle { id })
    }

    pub fn start(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        let mut cmd = Command::new(&self.bin);
        cmd.args(["start", handle.id.as_str()]);
        run_checked(cmd)?;
        Ok(())
    }

    /// Attaches to the container's output. stdout and stderr of
    /// `docker logs --follow` are joined into a single pipe; the stream
    /// ends when the container stops.
    pub fn log_stream(&self, handle: &SandboxHandle) -> Result<LogStream, SandboxError> {
        let (reader, writer) = os_pipe::pipe()?;
        let writer_err = writer.try_clone()?;
        let child = Command::new(&self.bin)
            .args(["logs", "--follow", handle.id.as_str()])
            .stdin(Stdio::null())
            .stdout(writer)
            .stderr(writer_err)
            .spawn()
            .map_err(|e| SandboxError::Spawn {
                cmd: "docker logs".to_string(),
                source: e,
            })?;
        Ok(LogStream { child, reader })
    }

    /// Blocks until the container reaches a terminal state and returns its
    /// exit code.
    pub fn wait(&self, handle: &SandboxHandle) -> Result<i64, SandboxError> {
        let mut cmd = Command::new(&self.bin);
        cmd.args(["wait", handle.id.as_str()]);
        let output = run_checked(cmd)?;
        let raw = String::from_utf8_lossy(&output.stdout);
        raw.trim().parse::<i64>().map_err(|_| SandboxError::Parse {
            cmd: "docker wait".to_string(),
            output: raw.into_owned(),
        })
    }

    /// Stops the container. Idempotent, failures are logged only; the
    /// container keeps existing so `wait` can still read its exit status.
    pub fn stop(&self, handle: &SandboxHandle) {
        let mut cmd = Command::new(&self.bin);
        cmd.args(["stop", handle.id.as_str()]);
        if let Err(e) = run_checked(cmd) {
            log::warn!("failed to stop sandbox {}: {}", short_id(&handle.id), e);
        }
    }

    /// Stops and removes the container. Called on every exit path and
    /// never under a cancelable deadline, so teardown cannot be skipped.
    pub fn release(&self, handle: &SandboxHandle) {
        self.stop(handle);
        let mut cmd = Command::new(&self.bin);
        cmd.args(["rm", "--force", handle.id.as_str()]);
        if let Err(e) = run_checked(cmd) {
            log::warn!("failed to remove sandbox {}: {}", short_id(&handle.id), e);
        }
    }
}

/// Releases the sandbox when dropped, covering early-error paths in the
/// executor.
pub struct SandboxGuard<'a> {
    driver: &'a DockerDriver,
    handle: SandboxHandle,
    released: bool,
}

impl<'a> SandboxGuard<'a> {
    pub fn new(driver: &'a DockerDriver, handle: SandboxHandle) -> Self {
        Self {
            driver,
            handle,
            released: false,
        }
    }

    pub fn handle(&self) -> &SandboxHandle {
        &self.handle
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            self.driver.release(&self.handle);
        }
    }
}

impl Drop for SandboxGuard<'_> {
    fn drop(&mut self) {
        self.release_inner();
    }
}

fn run_checked(mut cmd: Command) -> Result<std::process::Output, SandboxError> {
    let desc = format!("{:?}", cmd);
    let output = cmd
        .stdin(Stdio::null())
        .output()
        .map_err(|e| SandboxError::Spawn {
            cmd: desc.clone(),
            source: e,
        })?;
    if !output.status.success() {
        return Err(SandboxError::Runtime {
            cmd: desc,
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(output)
}

fn short_id(id: &str) -> &str {
    &id[..id.len().min(12)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_id_truncates() {
        assert_eq!(short_id("abcdef0123456789deadbeef"), "abcdef012345");
        assert_eq!(short_id("abc"), "abc");
    }
}
