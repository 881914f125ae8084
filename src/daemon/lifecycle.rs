//! Lifecycle operations: run, freeze, thaw, kill, fork, migrate,
//! hibernate, plus the per-process background watchers.
//!
//! Every operation takes the registry write lock for its entire
//! duration and aborts on the first failed step. Compensation is only
//! performed where the state machine requires it: freeze rolls back the
//! driver lock, a failed RAM thaw re-delivers STOP, a failed disk
//! restore kills the partially-restored pid, and a failed hibernate
//! dump re-applies STOP so the entry stays frozen.

use std::fs::{self, File};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::Utc;
use nix::unistd::Uid;
use tracing::{info, warn};

use crate::checkpoint::{self, CRIU_TOOL, CUDA_TOOL};
use crate::gpu;
use crate::protocol::{
    Event, EventKind, ForkParams, ForkResult, FreezeResult, MigrateParams, MigrateResult,
    RunParams, RunResult, ThawResult, Tier,
};
use crate::util;
use crate::{Error, Result};

use super::{Daemon, Proc, ProcState, Registry};

/// TERM → KILL escalation window.
const KILL_GRACE: Duration = Duration::from_secs(3);
/// VRAM sampler cadence and attempt cap (~one minute of polling).
const VRAM_SAMPLE_INTERVAL: Duration = Duration::from_secs(5);
const VRAM_SAMPLE_ATTEMPTS: u32 = 12;
/// Poll cadence for pids the daemon did not fork (criu restores).
const PID_POLL_INTERVAL: Duration = Duration::from_millis(500);

impl Daemon {
    /// Spawn a managed process. Returns once the OS reports a pid.
    pub fn run(self: &Arc<Self>, params: RunParams) -> Result<RunResult> {
        let mut registry = self.write();
        if registry.procs.contains_key(&params.name) {
            return Err(Error::AlreadyExists(params.name));
        }
        if params.cmd.is_empty() {
            return Err(Error::BadParams("empty command".into()));
        }

        let log_path = self.cfg.log_dir.join(format!("{}.log", params.name));
        let log_file = File::create(&log_path)?;

        let mut cmd = Command::new(&params.cmd[0]);
        cmd.args(&params.cmd[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_file.try_clone()?))
            .stderr(Stdio::from(log_file))
            .env("GPUSCHED_MANAGED", "1")
            .env("CUDA_VISIBLE_DEVICES", params.gpu.to_string());
        if let Some(dir) = &params.dir {
            cmd.current_dir(dir);
        }
        if Uid::effective().is_root() {
            // Root loses the user's pip-installed modules; splice their
            // site-packages back into the child's PYTHONPATH.
            if let Some(pythonpath) = user_site_packages_path() {
                cmd.env("PYTHONPATH", pythonpath);
            }
        }

        let child = cmd
            .spawn()
            .map_err(|e| Error::Internal(format!("starting {:?}: {e}", params.cmd[0])))?;
        let pid = child.id() as i32;

        registry.procs.insert(
            params.name.clone(),
            Proc {
                name: params.name.clone(),
                pid,
                state: ProcState::Active,
                gpu: params.gpu,
                mem_mb: 0,
                started: Utc::now(),
                log_path,
            },
        );
        self.metrics.cold_starts.fetch_add(1, Ordering::Relaxed);

        self.spawn_exit_watcher(params.name.clone(), pid, child);
        self.spawn_vram_sampler(params.name.clone(), pid);

        self.emit(
            &mut registry,
            Event::new(EventKind::Run, &params.name).with_detail(format!(
                "pid={pid} gpu={} cmd={:?}",
                params.gpu, params.cmd
            )),
        );
        info!(name = %params.name, pid, gpu = params.gpu, "spawned managed process");

        Ok(RunResult {
            name: params.name,
            pid,
        })
    }

    /// Checkpoint GPU state to host RAM and stop the process.
    pub fn freeze(&self, name: &str) -> Result<FreezeResult> {
        let mut registry = self.write();
        self.freeze_locked(&mut registry, name)
    }

    /// Freeze steps with the registry lock already held. `fork` runs
    /// these for an active source before dumping it.
    fn freeze_locked(&self, registry: &mut Registry, name: &str) -> Result<FreezeResult> {
        let proc = registry
            .procs
            .get(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        if !proc.state.is_active() {
            return Err(Error::WrongState {
                name: name.to_string(),
                actual: proc.state.kind(),
                expected: "active",
            });
        }
        if !self.cuda.available() {
            return Err(Error::CapabilityMissing(CUDA_TOOL));
        }

        let pid = proc.pid;
        let mut mem_mb = proc.mem_mb;
        let fresh = gpu::process_gpu_mem(pid);
        if fresh > 0 {
            mem_mb = fresh;
        }

        self.ensure_ram_budget(registry, mem_mb);

        let elapsed = self.cuda.freeze(pid)?;
        util::stop(pid);

        let duration_ms = elapsed.as_millis() as i64;
        if let Some(proc) = registry.procs.get_mut(name) {
            proc.mem_mb = mem_mb;
            proc.state = ProcState::Frozen {
                frozen_at: Utc::now(),
            };
        }
        self.metrics.record_freeze(duration_ms);

        self.emit(
            registry,
            Event::new(EventKind::Freeze, name)
                .with_duration(duration_ms)
                .with_detail(format!("-> RAM ({mem_mb} MB)")),
        );
        info!(name = %name, pid, duration_ms, mem_mb, "froze process to RAM");

        Ok(FreezeResult {
            name: name.to_string(),
            duration_ms,
            tier: Tier::Ram,
            mem_mb,
        })
    }

    /// Resume a frozen (RAM) or hibernated (disk) process.
    pub fn thaw(self: &Arc<Self>, name: &str) -> Result<ThawResult> {
        let mut registry = self.write();
        let proc = registry
            .procs
            .get(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        match proc.state.clone() {
            ProcState::Frozen { .. } => self.thaw_from_ram(&mut registry, name),
            ProcState::Hibernated { snapshot_dir } => {
                self.thaw_from_disk(&mut registry, name, snapshot_dir)
            }
            other => Err(Error::WrongState {
                name: name.to_string(),
                actual: other.kind(),
                expected: "frozen/hibernated",
            }),
        }
    }

    fn thaw_from_ram(&self, registry: &mut Registry, name: &str) -> Result<ThawResult> {
        if !self.cuda.available() {
            return Err(Error::CapabilityMissing(CUDA_TOOL));
        }
        let (pid, mem_mb) = {
            let proc = registry
                .procs
                .get(name)
                .ok_or_else(|| Error::NotFound(name.to_string()))?;
            (proc.pid, proc.mem_mb)
        };

        util::cont(pid);
        let elapsed = match self.cuda.thaw(pid) {
            Ok(elapsed) => elapsed,
            Err(e) => {
                // Restore the frozen invariant: the process stays stopped.
                util::stop(pid);
                return Err(e);
            }
        };

        let duration_ms = elapsed.as_millis() as i64;
        if let Some(proc) = registry.procs.get_mut(name) {
            proc.state = ProcState::Active;
        }
        self.metrics.record_thaw(duration_ms);

        self.emit(
            registry,
            Event::new(EventKind::Thaw, name)
                .with_duration(duration_ms)
                .with_detail(format!("<- RAM ({mem_mb} MB)")),
        );
        info!(name = %name, pid, duration_ms, "thawed process from RAM");

        Ok(ThawResult {
            name: name.to_string(),
            duration_ms,
            from_tier: Tier::Ram,
            mem_mb,
        })
    }

    fn thaw_from_disk(
        self: &Arc<Self>,
        registry: &mut Registry,
        name: &str,
        snapshot_dir: PathBuf,
    ) -> Result<ThawResult> {
        if !self.criu.available() {
            return Err(Error::CapabilityMissing(CRIU_TOOL));
        }
        if !self.cuda.available() {
            return Err(Error::CapabilityMissing(CUDA_TOOL));
        }

        let (new_pid, criu_elapsed) = self.criu.restore(&snapshot_dir)?;
        let cuda_elapsed = match self.cuda.thaw(new_pid) {
            Ok(elapsed) => elapsed,
            Err(e) => {
                // The half-restored tree has no GPU state; reap it.
                util::kill_now(new_pid);
                return Err(e);
            }
        };

        let duration_ms = (criu_elapsed + cuda_elapsed).as_millis() as i64;
        let mem_mb = match registry.procs.get_mut(name) {
            Some(proc) => {
                proc.pid = new_pid;
                proc.state = ProcState::Active;
                proc.mem_mb
            }
            None => 0,
        };
        self.metrics.record_thaw(duration_ms);
        self.spawn_pid_watcher(name.to_string(), new_pid);

        self.emit(
            registry,
            Event::new(EventKind::Thaw, name)
                .with_duration(duration_ms)
                .with_detail(format!(
                    "<- disk (criu={}ms cuda={}ms)",
                    criu_elapsed.as_millis(),
                    cuda_elapsed.as_millis()
                )),
        );
        info!(name = %name, pid = new_pid, duration_ms, "thawed process from disk");

        Ok(ThawResult {
            name: name.to_string(),
            duration_ms,
            from_tier: Tier::Disk,
            mem_mb,
        })
    }

    /// Terminate a process and remove its registry entry. Frozen entries
    /// are continued first so TERM can be delivered; hibernated entries
    /// have their snapshot directory removed instead.
    pub fn kill(&self, name: &str) -> Result<()> {
        let mut registry = self.write();
        let proc = registry
            .procs
            .get(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        let pid = proc.pid;

        match &proc.state {
            ProcState::Active | ProcState::Frozen { .. } => {
                if matches!(proc.state, ProcState::Frozen { .. }) {
                    util::cont(pid);
                }
                util::terminate(pid);
                thread::spawn(move || {
                    thread::sleep(KILL_GRACE);
                    util::kill_now(pid);
                });
            }
            ProcState::Hibernated { snapshot_dir } => {
                let _ = fs::remove_dir_all(snapshot_dir);
            }
            ProcState::Dead => {}
        }

        registry.procs.remove(name);
        self.emit(&mut registry, Event::new(EventKind::Kill, name));
        info!(name = %name, pid, "killed process");
        Ok(())
    }

    /// Clone a checkpointed process N times, optionally onto other GPUs.
    /// An active source is frozen first and stays frozen; copies that
    /// fail GPU restore are killed and skipped.
    pub fn fork(self: &Arc<Self>, params: ForkParams) -> Result<ForkResult> {
        let mut registry = self.write();
        if !self.criu.available() {
            return Err(Error::CapabilityMissing(CRIU_TOOL));
        }
        if params.copies == 0 {
            return Err(Error::BadParams("fork requires at least one copy".into()));
        }

        let proc = registry
            .procs
            .get(&params.name)
            .ok_or_else(|| Error::NotFound(params.name.clone()))?;
        let (pid, source_gpu, mut mem_mb) = (proc.pid, proc.gpu, proc.mem_mb);

        match proc.state {
            ProcState::Active => {
                mem_mb = self.freeze_locked(&mut registry, &params.name)?.mem_mb;
            }
            ProcState::Frozen { .. } => {}
            ref other => {
                return Err(Error::WrongState {
                    name: params.name.clone(),
                    actual: other.kind(),
                    expected: "active/frozen",
                })
            }
        }

        let dump_dir =
            checkpoint::snapshot_dir(&self.cfg.disk_dir, &format!("{}-fork-source", params.name));
        self.criu.dump(pid, &dump_dir)?;

        let mut copies = Vec::new();
        for i in 1..=params.copies {
            let copy_name = format!("{}-{}", params.name, i);
            let target_gpu = params
                .gpus
                .get(i as usize - 1)
                .copied()
                .unwrap_or(source_gpu);

            let (new_pid, _) = match self.criu.restore(&dump_dir) {
                Ok(restored) => restored,
                Err(e) => {
                    warn!(copy = %copy_name, error = %e, "fork copy failed criu restore");
                    continue;
                }
            };

            let gpu_restore = if target_gpu != source_gpu {
                self.cuda.restore_on_device(new_pid, target_gpu)
            } else {
                self.cuda.thaw(new_pid)
            };
            if let Err(e) = gpu_restore {
                util::kill_now(new_pid);
                warn!(copy = %copy_name, error = %e, "fork copy failed GPU restore");
                continue;
            }

            let log_path = self.cfg.log_dir.join(format!("{copy_name}.log"));
            let _ = File::create(&log_path);
            registry.procs.insert(
                copy_name.clone(),
                Proc {
                    name: copy_name.clone(),
                    pid: new_pid,
                    state: ProcState::Active,
                    gpu: target_gpu,
                    mem_mb,
                    started: Utc::now(),
                    log_path,
                },
            );
            self.spawn_pid_watcher(copy_name.clone(), new_pid);
            copies.push(copy_name);
        }

        self.metrics.forks.fetch_add(1, Ordering::Relaxed);
        self.emit(
            &mut registry,
            Event::new(EventKind::Fork, &params.name)
                .with_detail(format!("{} copies: {:?}", copies.len(), copies)),
        );
        info!(name = %params.name, copies = copies.len(), "forked process");

        Ok(ForkResult {
            source: params.name,
            copies,
        })
    }

    /// Re-bind a process to a different GPU. An active source is
    /// transiently checkpointed and stopped first.
    pub fn migrate(&self, params: MigrateParams) -> Result<MigrateResult> {
        let mut registry = self.write();
        let proc = registry
            .procs
            .get(&params.name)
            .ok_or_else(|| Error::NotFound(params.name.clone()))?;
        if !self.cuda.available() {
            return Err(Error::CapabilityMissing(CUDA_TOOL));
        }

        let (pid, from_gpu) = (proc.pid, proc.gpu);
        let mut mem_mb = proc.mem_mb;

        match proc.state {
            ProcState::Active => {
                let fresh = gpu::process_gpu_mem(pid);
                if fresh > 0 {
                    mem_mb = fresh;
                }
                self.cuda.freeze(pid)?;
                util::stop(pid);
            }
            ProcState::Frozen { .. } => {}
            ref other => {
                return Err(Error::WrongState {
                    name: params.name.clone(),
                    actual: other.kind(),
                    expected: "active/frozen",
                })
            }
        }

        util::cont(pid);
        let elapsed = self.cuda.restore_on_device(pid, params.gpu)?;
        self.cuda.unlock(pid)?;

        let duration_ms = elapsed.as_millis() as i64;
        if let Some(proc) = registry.procs.get_mut(&params.name) {
            proc.state = ProcState::Active;
            proc.gpu = params.gpu;
            proc.mem_mb = mem_mb;
        }
        self.metrics.migrations.fetch_add(1, Ordering::Relaxed);

        self.emit(
            &mut registry,
            Event::new(EventKind::Migrate, &params.name)
                .with_duration(duration_ms)
                .with_detail(format!("GPU {from_gpu} -> GPU {}", params.gpu)),
        );
        info!(name = %params.name, from_gpu, to_gpu = params.gpu, duration_ms, "migrated process");

        Ok(MigrateResult {
            name: params.name,
            from_gpu,
            to_gpu: params.gpu,
        })
    }

    /// Dump the whole process tree to disk. An active process is frozen
    /// first; the OS stop is lifted just before the dump because the
    /// process-tree tool refuses stopped targets.
    pub fn hibernate(&self, name: &str) -> Result<()> {
        let mut registry = self.write();
        if !self.criu.available() {
            return Err(Error::CapabilityMissing(CRIU_TOOL));
        }
        let proc = registry
            .procs
            .get(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        let pid = proc.pid;
        let mut mem_mb = proc.mem_mb;

        match proc.state {
            ProcState::Active => {
                if !self.cuda.available() {
                    return Err(Error::CapabilityMissing(CUDA_TOOL));
                }
                let fresh = gpu::process_gpu_mem(pid);
                if fresh > 0 {
                    mem_mb = fresh;
                }
                self.cuda.freeze(pid)?;
                util::stop(pid);
                if let Some(proc) = registry.procs.get_mut(name) {
                    proc.mem_mb = mem_mb;
                    proc.state = ProcState::Frozen {
                        frozen_at: Utc::now(),
                    };
                }
            }
            ProcState::Frozen { .. } => {}
            ref other => {
                return Err(Error::WrongState {
                    name: name.to_string(),
                    actual: other.kind(),
                    expected: "active/frozen",
                })
            }
        }

        util::cont(pid);
        let snapshot_dir = checkpoint::snapshot_dir(&self.cfg.disk_dir, name);
        let elapsed = match self.criu.dump(pid, &snapshot_dir) {
            Ok(elapsed) => elapsed,
            Err(e) => {
                // Dump failed with the process running; re-stop it so the
                // entry stays a valid frozen snapshot.
                util::stop(pid);
                return Err(e);
            }
        };

        let duration_ms = elapsed.as_millis() as i64;
        if let Some(proc) = registry.procs.get_mut(name) {
            proc.state = ProcState::Hibernated {
                snapshot_dir: snapshot_dir.clone(),
            };
        }
        self.metrics.hibernations.fetch_add(1, Ordering::Relaxed);

        self.emit(
            &mut registry,
            Event::new(EventKind::Hibernate, name)
                .with_duration(duration_ms)
                .with_detail(format!("-> disk {} ({mem_mb} MB)", snapshot_dir.display())),
        );
        info!(name = %name, pid, snapshot = %snapshot_dir.display(), duration_ms, "hibernated process");
        Ok(())
    }

    /// Reap the spawned child and mark the entry dead, unless it was
    /// hibernated (pid intentionally gone) or already dead.
    fn spawn_exit_watcher(self: &Arc<Self>, name: String, pid: i32, mut child: Child) {
        let daemon = Arc::clone(self);
        thread::spawn(move || {
            let detail = match child.wait() {
                Ok(status) if status.success() => "exited".to_string(),
                Ok(status) => status.to_string(),
                Err(e) => e.to_string(),
            };
            let mut registry = daemon.write();
            let Some(proc) = registry.procs.get_mut(&name) else {
                return;
            };
            if proc.pid != pid
                || matches!(proc.state, ProcState::Dead | ProcState::Hibernated { .. })
            {
                return;
            }
            proc.state = ProcState::Dead;
            daemon.emit(
                &mut registry,
                Event::new(EventKind::Exit, &name).with_detail(detail.clone()),
            );
            info!(name = %name, pid, detail = %detail, "managed process exited");
        });
    }

    /// The first VRAM reading usually lags process start by seconds
    /// while the CUDA context comes up; poll until one appears. Samples
    /// are taken outside the lock and discarded if the entry moved on.
    fn spawn_vram_sampler(self: &Arc<Self>, name: String, pid: i32) {
        let daemon = Arc::clone(self);
        thread::spawn(move || {
            for _ in 0..VRAM_SAMPLE_ATTEMPTS {
                thread::sleep(VRAM_SAMPLE_INTERVAL);
                {
                    let registry = daemon.read();
                    match registry.procs.get(&name) {
                        Some(proc) if proc.pid == pid && proc.state.is_active() => {}
                        _ => return,
                    }
                }
                let mem_mb = gpu::process_gpu_mem(pid);
                if mem_mb > 0 {
                    let mut registry = daemon.write();
                    if let Some(proc) = registry.procs.get_mut(&name) {
                        if proc.pid == pid && proc.state.is_active() {
                            proc.mem_mb = mem_mb;
                        }
                    }
                    return;
                }
            }
        });
    }

    /// Liveness poll for pids the daemon did not fork and so cannot
    /// wait() on (criu restores, fork copies).
    fn spawn_pid_watcher(self: &Arc<Self>, name: String, pid: i32) {
        let daemon = Arc::clone(self);
        thread::spawn(move || loop {
            if !util::is_process_alive(pid) {
                let mut registry = daemon.write();
                if let Some(proc) = registry.procs.get_mut(&name) {
                    if proc.pid == pid
                        && !matches!(
                            proc.state,
                            ProcState::Dead | ProcState::Hibernated { .. }
                        )
                    {
                        proc.state = ProcState::Dead;
                        daemon.emit(
                            &mut registry,
                            Event::new(EventKind::Exit, &name).with_detail("process gone"),
                        );
                        info!(name = %name, pid, "restored process gone");
                    }
                }
                return;
            }
            thread::sleep(PID_POLL_INTERVAL);
        });
    }
}

/// Collect `/home/*/.local/lib/python*/site-packages` and splice the
/// result onto any PYTHONPATH the daemon itself inherited.
fn user_site_packages_path() -> Option<String> {
    let mut extra = Vec::new();
    let homes = fs::read_dir("/home").ok()?;
    for home in homes.flatten() {
        let lib_dir = home.path().join(".local/lib");
        let Ok(libs) = fs::read_dir(&lib_dir) else {
            continue;
        };
        for lib in libs.flatten() {
            if lib.file_name().to_string_lossy().starts_with("python") {
                let site_packages = lib.path().join("site-packages");
                if site_packages.is_dir() {
                    extra.push(site_packages.to_string_lossy().into_owned());
                }
            }
        }
    }
    if extra.is_empty() {
        return None;
    }
    let joined = extra.join(":");
    match std::env::var("PYTHONPATH") {
        Ok(existing) if !existing.is_empty() => Some(format!("{existing}:{joined}")),
        _ => Some(joined),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{Criu, CudaCheckpoint};
    use crate::daemon::Config;
    use crate::protocol::ProcessState;
    use std::time::Instant;

    fn temp_daemon() -> (Arc<Daemon>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config {
            ram_budget_mb: 8192,
            disk_budget_mb: 8192,
            disk_dir: dir.path().join("snapshots"),
            log_dir: dir.path().join("logs"),
        };
        let daemon =
            Daemon::with_tools(cfg, CudaCheckpoint::unavailable(), Criu::unavailable()).unwrap();
        (Arc::new(daemon), dir)
    }

    fn run_sleeper(daemon: &Arc<Daemon>, name: &str) -> RunResult {
        daemon
            .run(RunParams {
                name: name.into(),
                cmd: vec!["sleep".into(), "3600".into()],
                dir: None,
                gpu: 0,
            })
            .unwrap()
    }

    fn wait_until(what: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if what() {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn run_rejects_empty_command() {
        let (daemon, _dir) = temp_daemon();
        let err = daemon
            .run(RunParams {
                name: "test".into(),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, Error::BadParams(_)));
        assert_eq!(err.to_string(), "bad params: empty command");
    }

    #[test]
    fn run_rejects_duplicate_name() {
        let (daemon, _dir) = temp_daemon();
        run_sleeper(&daemon, "test");
        let err = daemon
            .run(RunParams {
                name: "test".into(),
                cmd: vec!["sleep".into(), "3600".into()],
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(err.to_string(), "process \"test\" already exists");
        daemon.kill("test").unwrap();
    }

    #[test]
    fn run_and_kill_round_trip() {
        let (daemon, _dir) = temp_daemon();
        let result = run_sleeper(&daemon, "sleeper");
        assert_eq!(result.name, "sleeper");
        assert!(result.pid > 0);

        let status = daemon.status();
        let entry = status
            .processes
            .iter()
            .find(|p| p.name == "sleeper")
            .expect("process missing from status");
        assert_eq!(entry.state, ProcessState::Active);
        assert_eq!(entry.tier, Tier::Gpu);

        daemon.kill("sleeper").unwrap();
        assert!(daemon.status().processes.is_empty());
    }

    #[test]
    fn kill_twice_reports_not_found() {
        let (daemon, _dir) = temp_daemon();
        run_sleeper(&daemon, "once");
        daemon.kill("once").unwrap();
        let err = daemon.kill("once").unwrap_err();
        assert_eq!(err.to_string(), "process \"once\" not found");
    }

    #[test]
    fn operations_on_missing_names_fail() {
        let (daemon, _dir) = temp_daemon();
        assert!(matches!(daemon.kill("ghost"), Err(Error::NotFound(_))));
        assert!(matches!(daemon.freeze("ghost"), Err(Error::NotFound(_))));
        assert!(matches!(daemon.thaw("ghost"), Err(Error::NotFound(_))));
        assert!(matches!(daemon.hibernate("ghost"), Err(Error::NotFound(_))));
        assert!(matches!(
            daemon.migrate(MigrateParams {
                name: "ghost".into(),
                gpu: 1,
            }),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn freeze_without_tool_leaves_process_active() {
        let (daemon, _dir) = temp_daemon();
        run_sleeper(&daemon, "train");
        let err = daemon.freeze("train").unwrap_err();
        assert_eq!(err.to_string(), "cuda-checkpoint not available");

        let status = daemon.status();
        assert_eq!(status.processes[0].state, ProcessState::Active);
        daemon.kill("train").unwrap();
    }

    #[test]
    fn thaw_of_active_process_is_wrong_state() {
        let (daemon, _dir) = temp_daemon();
        run_sleeper(&daemon, "train");
        let err = daemon.thaw("train").unwrap_err();
        assert_eq!(
            err.to_string(),
            "process \"train\" is active, not frozen/hibernated"
        );
        daemon.kill("train").unwrap();
    }

    #[test]
    fn hibernate_without_criu_is_capability_missing() {
        let (daemon, _dir) = temp_daemon();
        run_sleeper(&daemon, "train");
        let err = daemon.hibernate("train").unwrap_err();
        assert_eq!(err.to_string(), "criu not available");
        daemon.kill("train").unwrap();
    }

    #[test]
    fn fork_without_criu_is_capability_missing() {
        let (daemon, _dir) = temp_daemon();
        let err = daemon
            .fork(ForkParams {
                name: "anything".into(),
                copies: 2,
                gpus: Vec::new(),
            })
            .unwrap_err();
        assert_eq!(err.to_string(), "criu not available");
    }

    #[test]
    fn exit_watcher_marks_entry_dead() {
        let (daemon, _dir) = temp_daemon();
        daemon
            .run(RunParams {
                name: "short".into(),
                cmd: vec!["true".into()],
                ..Default::default()
            })
            .unwrap();

        assert!(wait_until(|| {
            daemon
                .status()
                .processes
                .iter()
                .any(|p| p.name == "short" && p.state == ProcessState::Dead)
        }));

        let status = daemon.status();
        assert!(status
            .events
            .iter()
            .any(|e| e.kind == EventKind::Exit && e.process == "short"));
    }

    #[test]
    fn logs_capture_child_output() {
        let (daemon, dir) = temp_daemon();
        daemon
            .run(RunParams {
                name: "echo".into(),
                cmd: vec!["sh".into(), "-c".into(), "echo hello && sleep 3600".into()],
                ..Default::default()
            })
            .unwrap();

        assert!(dir.path().join("logs/echo.log").is_file());
        assert!(wait_until(|| {
            daemon
                .logs("echo", 10)
                .map(|r| r.lines.iter().any(|l| l == "hello"))
                .unwrap_or(false)
        }));
        daemon.kill("echo").unwrap();
    }

    #[test]
    fn run_emits_subscribable_event() {
        let (daemon, _dir) = temp_daemon();
        let (id, rx, _status) = daemon.subscribe_with_status();

        run_sleeper(&daemon, "evtest");
        let event = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(event.kind, EventKind::Run);
        assert_eq!(event.process, "evtest");

        daemon.kill("evtest").unwrap();
        let event = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(event.kind, EventKind::Kill);
        daemon.unsubscribe(id);
    }

    #[test]
    fn shutdown_terminates_children() {
        let (daemon, _dir) = temp_daemon();
        let result = run_sleeper(&daemon, "victim");

        daemon.shutdown();
        assert!(wait_until(|| !util::is_process_alive(result.pid)));
    }

    #[test]
    fn working_directory_is_honored() {
        let (daemon, dir) = temp_daemon();
        daemon
            .run(RunParams {
                name: "pwd".into(),
                cmd: vec!["sh".into(), "-c".into(), "pwd && sleep 3600".into()],
                dir: Some(dir.path().to_string_lossy().into_owned()),
                gpu: 0,
            })
            .unwrap();

        let want = dir.path().canonicalize().unwrap();
        assert!(wait_until(|| {
            daemon
                .logs("pwd", 10)
                .map(|r| {
                    r.lines
                        .iter()
                        .any(|l| PathBuf::from(l).canonicalize().ok() == Some(want.clone()))
                })
                .unwrap_or(false)
        }));
        daemon.kill("pwd").unwrap();
    }
}
