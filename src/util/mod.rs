//! Process signal helpers and small formatting utilities.

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

/// Check if a process with the given PID exists.
///
/// Sends the null signal, so this also returns true for zombies that
/// have not been reaped yet.
pub fn is_process_alive(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

/// Suspend a process at the OS level (SIGSTOP).
pub fn stop(pid: i32) {
    let _ = kill(Pid::from_raw(pid), Signal::SIGSTOP);
}

/// Lift an OS-level stop (SIGCONT).
pub fn cont(pid: i32) {
    let _ = kill(Pid::from_raw(pid), Signal::SIGCONT);
}

/// Request graceful termination (SIGTERM).
pub fn terminate(pid: i32) {
    let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
}

/// Kill immediately (SIGKILL).
pub fn kill_now(pid: i32) {
    let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
}

/// Format an age in seconds as a compact duration string: `42s`, `5m42s`,
/// `3h25m`, `2d3h`.
pub fn format_age(secs: i64) -> String {
    let secs = secs.max(0);
    if secs < 60 {
        return format!("{}s", secs);
    }
    if secs < 3600 {
        return format!("{}m{}s", secs / 60, secs % 60);
    }
    if secs < 86400 {
        return format!("{}h{}m", secs / 3600, (secs % 3600) / 60);
    }
    format!("{}d{}h", secs / 86400, (secs % 86400) / 3600)
}

/// Parse a size string into megabytes. Accepts K/M/G/T suffixes
/// (case-insensitive) on a megabyte base; a bare number is MB.
pub fn parse_size_mb(s: &str) -> Result<i64, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty size".into());
    }
    let (digits, multiplier_num, divisor) = match s.as_bytes()[s.len() - 1].to_ascii_uppercase() {
        b'K' => (&s[..s.len() - 1], 1, 1024),
        b'M' => (&s[..s.len() - 1], 1, 1),
        b'G' => (&s[..s.len() - 1], 1024, 1),
        b'T' => (&s[..s.len() - 1], 1024 * 1024, 1),
        _ => (s, 1, 1),
    };
    let value: i64 = digits
        .trim()
        .parse()
        .map_err(|_| format!("invalid size {:?}", s))?;
    Ok(value * multiplier_num / divisor)
}
