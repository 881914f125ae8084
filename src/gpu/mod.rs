//! GPU inventory and per-process VRAM via nvidia-smi, host RAM via /proc.
//!
//! Every query degrades to zero/empty values when the monitoring tool is
//! absent; the daemon keeps running on hosts without an NVIDIA stack.

use std::fs;
use std::process::Command;

use crate::protocol::GpuInfo;

/// Ordered list of GPUs with memory totals in MB. Empty when nvidia-smi
/// is missing or fails.
pub fn query_gpus() -> Vec<GpuInfo> {
    let output = Command::new("nvidia-smi")
        .args([
            "--query-gpu=index,name,memory.total,memory.used,memory.free",
            "--format=csv,noheader,nounits",
        ])
        .output();
    match output {
        Ok(out) if out.status.success() => parse_gpu_table(&String::from_utf8_lossy(&out.stdout)),
        _ => Vec::new(),
    }
}

fn parse_gpu_table(raw: &str) -> Vec<GpuInfo> {
    let mut gpus = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let parts: Vec<&str> = line.split(", ").collect();
        if parts.len() < 5 {
            continue;
        }
        gpus.push(GpuInfo {
            index: parts[0].trim().parse().unwrap_or(0),
            name: parts[1].trim().to_string(),
            mem_total: parts[2].trim().parse().unwrap_or(0),
            mem_used: parts[3].trim().parse().unwrap_or(0),
            mem_free: parts[4].trim().parse().unwrap_or(0),
        });
    }
    gpus
}

/// VRAM in MB that nvidia-smi attributes to `pid`. Zero when the process
/// has no compute context, which is also the reading for a frozen or
/// hibernated process.
pub fn process_gpu_mem(pid: i32) -> i64 {
    let output = Command::new("nvidia-smi")
        .args([
            "--query-compute-apps=pid,used_memory",
            "--format=csv,noheader,nounits",
        ])
        .output();
    match output {
        Ok(out) if out.status.success() => {
            parse_compute_apps(&String::from_utf8_lossy(&out.stdout), pid)
        }
        _ => 0,
    }
}

fn parse_compute_apps(raw: &str, pid: i32) -> i64 {
    let pid_str = pid.to_string();
    for line in raw.lines() {
        let parts: Vec<&str> = line.split(", ").collect();
        if parts.len() >= 2 && parts[0].trim() == pid_str {
            return parts[1].trim().parse().unwrap_or(0);
        }
    }
    0
}

/// NVIDIA driver version string, empty when undetectable.
pub fn driver_version() -> String {
    let output = Command::new("nvidia-smi")
        .args(["--query-gpu=driver_version", "--format=csv,noheader"])
        .output();
    match output {
        Ok(out) if out.status.success() => String::from_utf8_lossy(&out.stdout).trim().to_string(),
        _ => String::new(),
    }
}

/// Host RAM (total, available) in MB from /proc/meminfo.
pub fn host_mem_info() -> (i64, i64) {
    match fs::read_to_string("/proc/meminfo") {
        Ok(raw) => parse_meminfo(&raw),
        Err(_) => (0, 0),
    }
}

fn parse_meminfo(raw: &str) -> (i64, i64) {
    let mut total_kb = 0;
    let mut available_kb = 0;
    for line in raw.lines() {
        let mut fields = line.split_whitespace();
        match fields.next() {
            Some("MemTotal:") => total_kb = fields.next().and_then(|v| v.parse().ok()).unwrap_or(0),
            Some("MemAvailable:") => {
                available_kb = fields.next().and_then(|v| v.parse().ok()).unwrap_or(0)
            }
            _ => {}
        }
    }
    (total_kb / 1024, available_kb / 1024)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_gpu_table() {
        let raw = "0, NVIDIA A100-SXM4-80GB, 81920, 1024, 80896\n\
                   1, NVIDIA A100-SXM4-80GB, 81920, 0, 81920\n";
        let gpus = parse_gpu_table(raw);
        assert_eq!(gpus.len(), 2);
        assert_eq!(gpus[0].index, 0);
        assert_eq!(gpus[0].name, "NVIDIA A100-SXM4-80GB");
        assert_eq!(gpus[0].mem_total, 81920);
        assert_eq!(gpus[0].mem_used, 1024);
        assert_eq!(gpus[1].mem_free, 81920);
    }

    #[test]
    fn gpu_table_skips_malformed_lines() {
        let raw = "garbage\n\n0, RTX 4090, 24564, 100, 24464\n";
        let gpus = parse_gpu_table(raw);
        assert_eq!(gpus.len(), 1);
        assert_eq!(gpus[0].name, "RTX 4090");
    }

    #[test]
    fn parses_compute_apps_for_matching_pid() {
        let raw = "1234, 4096\n5678, 512\n";
        assert_eq!(parse_compute_apps(raw, 5678), 512);
        assert_eq!(parse_compute_apps(raw, 1234), 4096);
        assert_eq!(parse_compute_apps(raw, 999), 0);
    }

    #[test]
    fn parses_meminfo() {
        let raw = "MemTotal:       131072000 kB\n\
                   MemFree:         4096000 kB\n\
                   MemAvailable:   65536000 kB\n";
        let (total, available) = parse_meminfo(raw);
        assert_eq!(total, 128000);
        assert_eq!(available, 64000);
    }

    #[test]
    fn host_mem_info_is_nonnegative() {
        let (total, available) = host_mem_info();
        assert!(total >= 0);
        assert!(available >= 0);
    }

    #[test]
    fn nonexistent_pid_reports_zero() {
        assert_eq!(process_gpu_mem(999_999_999), 0);
    }
}
