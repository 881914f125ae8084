//! Wire types shared between the daemon, its clients, and the event stream.
//!
//! One JSON object per line in each direction. Requests are
//! `{"method": ..., "params": ...}`, responses `{"ok": ..., "result": ...,
//! "error": ...}`; a `subscribe` request switches the connection to a
//! stream of [`Event`] objects after an initial status response.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a managed process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Active,
    Frozen,
    Hibernated,
    Dead,
}

impl ProcessState {
    /// Display order in the status snapshot: active first, dead last.
    pub fn sort_rank(self) -> u8 {
        match self {
            ProcessState::Active => 0,
            ProcessState::Frozen => 1,
            ProcessState::Hibernated => 2,
            ProcessState::Dead => 3,
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcessState::Active => "active",
            ProcessState::Frozen => "frozen",
            ProcessState::Hibernated => "hibernated",
            ProcessState::Dead => "dead",
        };
        f.write_str(s)
    }
}

/// Where a process's memory currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Gpu,
    Ram,
    Disk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    Run,
    Freeze,
    Thaw,
    Kill,
    Exit,
    Fork,
    Migrate,
    Hibernate,
    Evict,
    EvictKill,
}

/// An append-only lifecycle event. Optional fields are omitted on the
/// wire when empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub time: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub process: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detail: String,
    #[serde(rename = "duration_ms", default, skip_serializing_if = "is_zero")]
    pub duration_ms: i64,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

impl Event {
    pub fn new(kind: EventKind, process: impl Into<String>) -> Self {
        Self {
            time: Utc::now(),
            kind,
            process: process.into(),
            detail: String::new(),
            duration_ms: 0,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }

    pub fn with_duration(mut self, ms: i64) -> Self {
        self.duration_ms = ms;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl Response {
    pub fn ok(result: impl Serialize) -> Self {
        match serde_json::to_value(result) {
            Ok(value) => Self {
                ok: true,
                result: Some(value),
                error: String::new(),
            },
            Err(e) => Self::err(e.to_string()),
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            result: None,
            error: message.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunParams {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub cmd: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
    #[serde(default)]
    pub gpu: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NameParams {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForkParams {
    pub name: String,
    #[serde(default)]
    pub copies: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gpus: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrateParams {
    pub name: String,
    pub gpu: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogsParams {
    pub name: String,
    #[serde(default)]
    pub lines: usize,
    #[serde(default)]
    pub follow: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub name: String,
    pub pid: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreezeResult {
    pub name: String,
    pub duration_ms: i64,
    pub tier: Tier,
    pub mem_mb: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThawResult {
    pub name: String,
    pub duration_ms: i64,
    pub from_tier: Tier,
    pub mem_mb: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForkResult {
    pub source: String,
    pub copies: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrateResult {
    pub name: String,
    pub from_gpu: u32,
    pub to_gpu: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogsResult {
    pub lines: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuInfo {
    pub index: u32,
    pub name: String,
    #[serde(rename = "mem_total_mb")]
    pub mem_total: i64,
    #[serde(rename = "mem_used_mb")]
    pub mem_used: i64,
    #[serde(rename = "mem_free_mb")]
    pub mem_free: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub name: String,
    pub pid: i32,
    pub state: ProcessState,
    pub gpu: u32,
    pub mem_mb: i64,
    pub age: String,
    pub started: DateTime<Utc>,
    pub tier: Tier,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryInfo {
    pub host_ram_total_mb: i64,
    pub host_ram_free_mb: i64,
    pub host_ram_budget_mb: i64,
    pub snapshots_mb: i64,
    pub disk_used_mb: i64,
    pub disk_budget_mb: i64,
}

/// Process-wide monotonic counters and running-average durations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metrics {
    pub requests: u64,
    pub freezes: u64,
    pub thaws: u64,
    pub forks: u64,
    pub migrations: u64,
    pub hibernations: u64,
    pub cold_starts: u64,
    pub avg_freeze_ms: i64,
    pub avg_thaw_ms: i64,
}

/// External tools detected at daemon startup. Immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capabilities {
    pub cuda_checkpoint: bool,
    pub criu: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub driver_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResult {
    pub gpus: Vec<GpuInfo>,
    pub processes: Vec<ProcessInfo>,
    pub memory: MemoryInfo,
    pub metrics: Metrics,
    #[serde(rename = "recent_events")]
    pub events: Vec<Event>,
    #[serde(rename = "capabilities")]
    pub caps: Capabilities,
}
