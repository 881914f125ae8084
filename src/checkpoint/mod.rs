//! Adapters for the cuda-checkpoint and criu command-line tools.
//!
//! Each primitive is a one-shot subprocess with combined-output capture
//! and elapsed-time measurement. This module is the only place that
//! knows either tool's argv shape. Availability is probed once at
//! startup; calling a primitive while its tool is missing fails with
//! [`Error::CapabilityMissing`] and never blocks or falls back.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{Duration, Instant};

use crate::{Error, Result};

pub const CUDA_TOOL: &str = "cuda-checkpoint";
pub const CRIU_TOOL: &str = "criu";

/// Fallbacks when cuda-checkpoint is not on PATH. The driver installer
/// drops it in different places depending on the distro.
const CUDA_KNOWN_PATHS: &[&str] = &[
    "/usr/bin/cuda-checkpoint",
    "/usr/local/bin/cuda-checkpoint",
    "/usr/lib/nvidia/bin/cuda-checkpoint",
];

/// Run an external tool to completion, returning elapsed time. A
/// non-zero exit maps to [`Error::Tool`] carrying the last line of
/// combined output.
fn run_tool(tool: &'static str, binary: &Path, args: &[String], action: String) -> Result<Duration> {
    let start = Instant::now();
    let output = Command::new(binary).args(args).output()?;
    let elapsed = start.elapsed();
    if !output.status.success() {
        return Err(Error::Tool {
            tool,
            action,
            detail: last_output_line(&output),
        });
    }
    Ok(elapsed)
}

fn last_output_line(output: &Output) -> String {
    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push('\n');
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    combined
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| output.status.to_string())
}

/// Driver-level GPU state capture via the cuda-checkpoint utility.
#[derive(Debug)]
pub struct CudaCheckpoint {
    binary: Option<PathBuf>,
}

impl CudaCheckpoint {
    /// Locate cuda-checkpoint on PATH or at the known install locations.
    pub fn probe() -> Self {
        if let Ok(path) = which::which(CUDA_TOOL) {
            return Self { binary: Some(path) };
        }
        for candidate in CUDA_KNOWN_PATHS {
            if Path::new(candidate).is_file() {
                return Self {
                    binary: Some(PathBuf::from(candidate)),
                };
            }
        }
        Self { binary: None }
    }

    /// An adapter whose primitives all fail with CapabilityMissing.
    pub fn unavailable() -> Self {
        Self { binary: None }
    }

    pub fn available(&self) -> bool {
        self.binary.is_some()
    }

    fn action(&self, action: &str, pid: i32, device: Option<u32>) -> Result<Duration> {
        let binary = self
            .binary
            .as_deref()
            .ok_or(Error::CapabilityMissing(CUDA_TOOL))?;
        let mut args = vec![
            "--action".to_string(),
            action.to_string(),
            "--pid".to_string(),
            pid.to_string(),
        ];
        if let Some(device) = device {
            args.push("--device".to_string());
            args.push(device.to_string());
        }
        run_tool(CUDA_TOOL, binary, &args, format!("{action} (pid {pid})"))
    }

    pub fn lock(&self, pid: i32) -> Result<Duration> {
        self.action("lock", pid, None)
    }

    pub fn checkpoint(&self, pid: i32) -> Result<Duration> {
        self.action("checkpoint", pid, None)
    }

    pub fn restore(&self, pid: i32) -> Result<Duration> {
        self.action("restore", pid, None)
    }

    pub fn unlock(&self, pid: i32) -> Result<Duration> {
        self.action("unlock", pid, None)
    }

    pub fn restore_on_device(&self, pid: i32, device: u32) -> Result<Duration> {
        self.action("restore", pid, Some(device))
    }

    /// Full lock → checkpoint sequence. A failed checkpoint attempts a
    /// best-effort unlock; the tool's contract is that lock alone is
    /// reversible.
    pub fn freeze(&self, pid: i32) -> Result<Duration> {
        let lock = self.lock(pid)?;
        match self.checkpoint(pid) {
            Ok(checkpoint) => Ok(lock + checkpoint),
            Err(e) => {
                let _ = self.unlock(pid);
                Err(e)
            }
        }
    }

    /// Full restore → unlock sequence. No compensation beyond what the
    /// tool itself does.
    pub fn thaw(&self, pid: i32) -> Result<Duration> {
        let restore = self.restore(pid)?;
        let unlock = self.unlock(pid)?;
        Ok(restore + unlock)
    }
}

/// Process-tree checkpoint/restore via CRIU. Used for the disk tier.
#[derive(Debug)]
pub struct Criu {
    binary: Option<PathBuf>,
}

impl Criu {
    /// Locate criu on PATH and run its self-check; an installed but
    /// non-functional criu counts as unavailable.
    pub fn probe() -> Self {
        let Ok(path) = which::which(CRIU_TOOL) else {
            return Self { binary: None };
        };
        let healthy = Command::new(&path)
            .arg("check")
            .output()
            .map(|out| out.status.success())
            .unwrap_or(false);
        Self {
            binary: healthy.then_some(path),
        }
    }

    pub fn unavailable() -> Self {
        Self { binary: None }
    }

    pub fn available(&self) -> bool {
        self.binary.is_some()
    }

    fn binary(&self) -> Result<&Path> {
        self.binary
            .as_deref()
            .ok_or(Error::CapabilityMissing(CRIU_TOOL))
    }

    /// Dump the process tree rooted at `pid` into `dir`. The dumped tree
    /// is terminated by criu; the snapshot directory is self-contained.
    pub fn dump(&self, pid: i32, dir: &Path) -> Result<Duration> {
        let binary = self.binary()?;
        fs::create_dir_all(dir)?;
        let args = vec![
            "dump".to_string(),
            "-t".to_string(),
            pid.to_string(),
            "-D".to_string(),
            dir.to_string_lossy().into_owned(),
            "--shell-job".to_string(),
            "--tcp-established".to_string(),
            "-v0".to_string(),
        ];
        run_tool(CRIU_TOOL, binary, &args, format!("dump (pid {pid})"))
    }

    /// Restore a dumped tree detached, returning the new root pid read
    /// from the pidfile criu writes into the snapshot directory.
    pub fn restore(&self, dir: &Path) -> Result<(i32, Duration)> {
        let binary = self.binary()?;
        let pidfile = dir.join("restored.pid");
        let args = vec![
            "restore".to_string(),
            "-D".to_string(),
            dir.to_string_lossy().into_owned(),
            "--shell-job".to_string(),
            "--tcp-established".to_string(),
            "-d".to_string(),
            "--pidfile".to_string(),
            pidfile.to_string_lossy().into_owned(),
            "-v0".to_string(),
        ];
        let elapsed = run_tool(CRIU_TOOL, binary, &args, "restore".to_string())?;
        let raw = fs::read_to_string(&pidfile)?;
        let pid = raw.trim().parse().map_err(|_| {
            Error::Internal(format!(
                "unparseable pid {:?} in {}",
                raw.trim(),
                pidfile.display()
            ))
        })?;
        Ok((pid, elapsed))
    }
}

/// Snapshot directory for a named process under the disk root.
pub fn snapshot_dir(base: &Path, name: &str) -> PathBuf {
    base.join(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;
    use std::process::ExitStatus;

    #[test]
    fn probe_does_not_panic() {
        let cuda = CudaCheckpoint::probe();
        let criu = Criu::probe();
        let _ = (cuda.available(), criu.available());
    }

    #[test]
    fn unavailable_cuda_fails_every_primitive() {
        let cuda = CudaCheckpoint::unavailable();
        assert!(!cuda.available());
        for result in [
            cuda.lock(1),
            cuda.checkpoint(1),
            cuda.restore(1),
            cuda.unlock(1),
            cuda.restore_on_device(1, 0),
            cuda.freeze(1),
            cuda.thaw(1),
        ] {
            match result {
                Err(Error::CapabilityMissing(tool)) => assert_eq!(tool, CUDA_TOOL),
                other => panic!("expected CapabilityMissing, got {:?}", other.map(|_| ())),
            }
        }
    }

    #[test]
    fn unavailable_criu_fails_dump_and_restore() {
        let criu = Criu::unavailable();
        assert!(matches!(
            criu.dump(1, Path::new("/tmp/nowhere")),
            Err(Error::CapabilityMissing(CRIU_TOOL))
        ));
        assert!(matches!(
            criu.restore(Path::new("/tmp/nowhere")),
            Err(Error::CapabilityMissing(CRIU_TOOL))
        ));
    }

    #[test]
    fn tool_failure_carries_last_output_line() {
        let output = Output {
            status: ExitStatus::from_raw(256),
            stdout: b"phase one\nphase two\n".to_vec(),
            stderr: b"Error: device busy\n\n".to_vec(),
        };
        assert_eq!(last_output_line(&output), "Error: device busy");

        let silent = Output {
            status: ExitStatus::from_raw(256),
            stdout: Vec::new(),
            stderr: Vec::new(),
        };
        assert!(!last_output_line(&silent).is_empty());
    }

    #[test]
    fn snapshot_dir_is_name_under_base() {
        assert_eq!(
            snapshot_dir(Path::new("/tmp/snaps"), "train"),
            PathBuf::from("/tmp/snaps/train")
        );
    }
}
