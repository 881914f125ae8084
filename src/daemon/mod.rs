//! The gpusched daemon core: process registry, request router, shutdown.
//!
//! One coarse reader/writer lock serializes every lifecycle mutation;
//! lifecycle operations hold it for their entire duration, external-tool
//! invocations included. Concurrent freezes of two processes would race
//! for the same GPU driver lock anyway, so nothing finer is warranted.
//! `status` and `logs` take only the read lock and never touch the
//! checkpoint tools.

mod budget;
mod events;
mod lifecycle;
mod metrics;
pub mod server;

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::mpsc::Receiver;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::info;

use crate::checkpoint::{Criu, CudaCheckpoint};
use crate::gpu;
use crate::protocol::{
    Capabilities, Event, ForkParams, LogsParams, LogsResult, MemoryInfo, MigrateParams, NameParams,
    ProcessInfo, ProcessState, Request, Response, RunParams, StatusResult, Tier,
};
use crate::util;
use crate::{Error, Result};

pub const DEFAULT_SOCKET: &str = "/tmp/gpusched.sock";

const EVENT_RING_CAP: usize = 1000;
const EVENT_RING_TRIM: usize = 500;
const STATUS_EVENT_LIMIT: usize = 20;

/// Daemon configuration, immutable after start.
#[derive(Debug, Clone)]
pub struct Config {
    pub ram_budget_mb: i64,
    pub disk_budget_mb: i64,
    pub disk_dir: PathBuf,
    pub log_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let (total_mb, _) = gpu::host_mem_info();
        let ram_budget_mb = if total_mb > 0 {
            total_mb * 80 / 100
        } else {
            64 * 1024
        };
        Self {
            ram_budget_mb,
            disk_budget_mb: 500 * 1024,
            disk_dir: PathBuf::from("/tmp/gpusched/snapshots"),
            log_dir: PathBuf::from("/tmp/gpusched/logs"),
        }
    }
}

/// Lifecycle state with its state-scoped data. Frozen entries always
/// carry the eviction timestamp; hibernated entries always carry their
/// snapshot directory.
#[derive(Debug, Clone)]
pub enum ProcState {
    Active,
    Frozen { frozen_at: DateTime<Utc> },
    Hibernated { snapshot_dir: PathBuf },
    Dead,
}

impl ProcState {
    pub fn kind(&self) -> ProcessState {
        match self {
            ProcState::Active => ProcessState::Active,
            ProcState::Frozen { .. } => ProcessState::Frozen,
            ProcState::Hibernated { .. } => ProcessState::Hibernated,
            ProcState::Dead => ProcessState::Dead,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, ProcState::Active)
    }
}

/// A managed process. The OS child handle lives with the exit watcher
/// thread; the registry signals the recorded pid directly.
#[derive(Debug)]
pub struct Proc {
    pub name: String,
    pub pid: i32,
    pub state: ProcState,
    pub gpu: u32,
    pub mem_mb: i64,
    pub started: DateTime<Utc>,
    pub log_path: PathBuf,
}

#[derive(Debug, Default)]
pub(crate) struct Registry {
    pub(crate) procs: HashMap<String, Proc>,
    pub(crate) events: Vec<Event>,
}

pub struct Daemon {
    registry: RwLock<Registry>,
    bus: events::EventBus,
    metrics: metrics::MetricsStorage,
    cuda: CudaCheckpoint,
    criu: Criu,
    cfg: Config,
}

impl Daemon {
    /// Build a daemon: create the log and snapshot directories and probe
    /// the external tools once.
    pub fn new(cfg: Config) -> Result<Self> {
        Self::with_tools(cfg, CudaCheckpoint::probe(), Criu::probe())
    }

    /// Build a daemon with explicit tool adapters (tests pin these to
    /// `unavailable()` for deterministic capability failures).
    pub fn with_tools(cfg: Config, cuda: CudaCheckpoint, criu: Criu) -> Result<Self> {
        fs::create_dir_all(&cfg.log_dir)?;
        fs::create_dir_all(&cfg.disk_dir)?;

        info!(
            cuda_checkpoint = cuda.available(),
            criu = criu.available(),
            "probed checkpoint capabilities"
        );
        info!(
            ram_budget_mb = cfg.ram_budget_mb,
            disk_budget_mb = cfg.disk_budget_mb,
            disk_dir = %cfg.disk_dir.display(),
            log_dir = %cfg.log_dir.display(),
            "daemon configured"
        );

        Ok(Self {
            registry: RwLock::new(Registry::default()),
            bus: events::EventBus::new(),
            metrics: metrics::MetricsStorage::new(),
            cuda,
            criu,
            cfg,
        })
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    // A poisoned guard is recovered: operations abort before mutating,
    // so the registry behind a poisoned lock is still consistent.
    pub(crate) fn read(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, Registry> {
        self.registry
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append to the bounded event ring and fan out to subscribers.
    /// Called with the write lock held so events are ordered exactly as
    /// operations complete.
    pub(crate) fn emit(&self, registry: &mut Registry, mut event: Event) {
        event.time = Utc::now();
        registry.events.push(event.clone());
        if registry.events.len() > EVENT_RING_CAP {
            let excess = registry.events.len() - EVENT_RING_TRIM;
            registry.events.drain(..excess);
        }
        self.bus.broadcast(&event);
    }

    /// Route one decoded request. Counts every call, valid or not.
    pub fn handle(self: &std::sync::Arc<Self>, req: &Request) -> Response {
        self.metrics.requests.fetch_add(1, Ordering::Relaxed);
        match self.dispatch(req) {
            Ok(value) => Response {
                ok: true,
                result: Some(value),
                error: String::new(),
            },
            Err(e) => Response::err(e.to_string()),
        }
    }

    fn dispatch(self: &std::sync::Arc<Self>, req: &Request) -> Result<Value> {
        let params = req.params.clone().unwrap_or(Value::Null);
        match req.method.as_str() {
            "run" => {
                let p: RunParams = decode(params)?;
                encode(self.run(p)?)
            }
            "freeze" => {
                let p: NameParams = decode(params)?;
                encode(self.freeze(&p.name)?)
            }
            "thaw" => {
                let p: NameParams = decode(params)?;
                encode(self.thaw(&p.name)?)
            }
            "kill" => {
                let p: NameParams = decode(params)?;
                self.kill(&p.name)?;
                encode("ok")
            }
            "fork" => {
                let p: ForkParams = decode(params)?;
                encode(self.fork(p)?)
            }
            "migrate" => {
                let p: MigrateParams = decode(params)?;
                encode(self.migrate(p)?)
            }
            "hibernate" => {
                let p: NameParams = decode(params)?;
                self.hibernate(&p.name)?;
                encode("ok")
            }
            "status" => encode(self.status()),
            "logs" => {
                let p: LogsParams = decode(params)?;
                let lines = if p.lines == 0 { 50 } else { p.lines };
                encode(self.logs(&p.name, lines)?)
            }
            other => Err(Error::UnknownMethod(other.to_string())),
        }
    }

    /// Full status snapshot under the read lock. Active entries get a
    /// fresh VRAM reading for the response, but the stored footprint is
    /// only updated under the write lock.
    pub fn status(&self) -> StatusResult {
        let registry = self.read();
        let gpus = gpu::query_gpus();
        let (host_total_mb, host_free_mb) = gpu::host_mem_info();
        let now = Utc::now();

        let mut processes = Vec::with_capacity(registry.procs.len());
        let mut snapshots_mb = 0;
        let mut disk_used_mb = 0;
        for proc in registry.procs.values() {
            let mut mem_mb = proc.mem_mb;
            let tier = match &proc.state {
                ProcState::Active => {
                    let fresh = gpu::process_gpu_mem(proc.pid);
                    if fresh > 0 {
                        mem_mb = fresh;
                    }
                    Tier::Gpu
                }
                ProcState::Frozen { .. } => {
                    snapshots_mb += mem_mb;
                    Tier::Ram
                }
                ProcState::Hibernated { .. } => {
                    disk_used_mb += mem_mb;
                    Tier::Disk
                }
                ProcState::Dead => Tier::Gpu,
            };
            processes.push(ProcessInfo {
                name: proc.name.clone(),
                pid: proc.pid,
                state: proc.state.kind(),
                gpu: proc.gpu,
                mem_mb,
                age: util::format_age((now - proc.started).num_seconds()),
                started: proc.started,
                tier,
            });
        }
        processes.sort_by(|a, b| {
            (a.state.sort_rank(), &a.name).cmp(&(b.state.sort_rank(), &b.name))
        });

        let events = registry
            .events
            .iter()
            .rev()
            .take(STATUS_EVENT_LIMIT)
            .rev()
            .cloned()
            .collect();

        StatusResult {
            gpus,
            processes,
            memory: MemoryInfo {
                host_ram_total_mb: host_total_mb,
                host_ram_free_mb: host_free_mb,
                host_ram_budget_mb: self.cfg.ram_budget_mb,
                snapshots_mb,
                disk_used_mb,
                disk_budget_mb: self.cfg.disk_budget_mb,
            },
            metrics: self.metrics.snapshot(),
            events,
            caps: Capabilities {
                cuda_checkpoint: self.cuda.available(),
                criu: self.criu.available(),
                driver_version: gpu::driver_version(),
            },
        }
    }

    /// Last `lines` lines of the process's log file.
    pub fn logs(&self, name: &str, lines: usize) -> Result<LogsResult> {
        let log_path = {
            let registry = self.read();
            registry
                .procs
                .get(name)
                .ok_or_else(|| Error::NotFound(name.to_string()))?
                .log_path
                .clone()
        };
        let data = fs::read_to_string(&log_path)?;
        let all: Vec<String> = data.lines().map(str::to_string).collect();
        let start = if lines > 0 && lines < all.len() {
            all.len() - lines
        } else {
            0
        };
        Ok(LogsResult {
            lines: all[start..].to_vec(),
        })
    }

    /// Register an event subscriber and capture the initial status in
    /// one step, counting the request. Events emitted after the
    /// subscription are delivered on the returned channel.
    pub fn subscribe_with_status(&self) -> (u64, Receiver<Event>, StatusResult) {
        self.metrics.requests.fetch_add(1, Ordering::Relaxed);
        let (id, rx) = self.bus.subscribe();
        (id, rx, self.status())
    }

    pub fn unsubscribe(&self, id: u64) {
        self.bus.unsubscribe(id);
    }

    /// Best-effort cleanup on daemon exit: terminate live children,
    /// leave hibernated snapshots on disk, close all subscribers.
    pub fn shutdown(&self) {
        let registry = self.write();
        info!("shutting down, cleaning up managed processes");
        for (name, proc) in registry.procs.iter() {
            match &proc.state {
                ProcState::Active => {
                    info!(name = %name, pid = proc.pid, "terminating active process");
                    util::terminate(proc.pid);
                }
                ProcState::Frozen { .. } => {
                    info!(name = %name, pid = proc.pid, "terminating frozen process");
                    util::cont(proc.pid);
                    util::terminate(proc.pid);
                }
                ProcState::Hibernated { snapshot_dir } => {
                    info!(
                        name = %name,
                        snapshot = %snapshot_dir.display(),
                        "hibernated process left on disk"
                    );
                }
                ProcState::Dead => {}
            }
        }
        drop(registry);
        self.bus.close_all();
    }
}

fn decode<T: DeserializeOwned>(params: Value) -> Result<T> {
    serde_json::from_value(params).map_err(|e| Error::BadParams(e.to_string()))
}

fn encode(value: impl serde::Serialize) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| Error::Internal(e.to_string()))
}
