//! Host-RAM budget enforcement: LRU eviction of frozen snapshots.
//!
//! Runs inside the write lock already held by the requesting freeze, so
//! victims cannot be thawed concurrently. Budget shortage never fails
//! the freeze; the worst case is a warning and degraded headroom.

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::checkpoint;
use crate::gpu;
use crate::protocol::{Event, EventKind};
use crate::util;

use super::{Daemon, ProcState, Registry};

/// Free host RAM to preserve below the requested snapshot, in MB.
const SAFETY_MB: i64 = 4096;

impl Daemon {
    /// Make room for a snapshot of `request_mb`. Evicts frozen entries
    /// oldest-first: to disk when the process-tree tool is present,
    /// otherwise by killing them.
    pub(crate) fn ensure_ram_budget(&self, registry: &mut Registry, request_mb: i64) {
        let (_, mut free_mb) = gpu::host_mem_info();
        if free_mb - request_mb > SAFETY_MB {
            return;
        }

        for name in frozen_victims(registry) {
            if free_mb - request_mb > SAFETY_MB {
                break;
            }
            let Some(victim) = registry.procs.get(&name) else {
                continue;
            };
            let (pid, mem_mb) = (victim.pid, victim.mem_mb);

            if self.criu.available() {
                warn!(victim = %name, mem_mb, "RAM pressure: hibernating frozen snapshot to disk");
                util::cont(pid);
                let snapshot_dir = checkpoint::snapshot_dir(&self.cfg.disk_dir, &name);
                if let Err(e) = self.criu.dump(pid, &snapshot_dir) {
                    warn!(victim = %name, error = %e, "eviction dump failed");
                    util::stop(pid);
                    continue;
                }
                if let Some(victim) = registry.procs.get_mut(&name) {
                    victim.state = ProcState::Hibernated { snapshot_dir };
                }
                free_mb += mem_mb;
                self.metrics
                    .hibernations
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                self.emit(
                    registry,
                    Event::new(EventKind::Evict, name.as_str())
                        .with_detail(format!("RAM -> disk ({mem_mb} MB)")),
                );
            } else {
                warn!(victim = %name, mem_mb, "RAM pressure: killing frozen snapshot, no disk tier");
                util::cont(pid);
                util::kill_now(pid);
                if let Some(victim) = registry.procs.get_mut(&name) {
                    victim.state = ProcState::Dead;
                }
                free_mb += mem_mb;
                self.emit(
                    registry,
                    Event::new(EventKind::EvictKill, name.as_str())
                        .with_detail(format!("killed, no disk tier ({mem_mb} MB freed)")),
                );
            }
        }

        if free_mb - request_mb <= SAFETY_MB {
            warn!(
                request_mb,
                free_mb, "RAM budget shortage after eviction, proceeding anyway"
            );
        }
    }
}

/// Frozen entries ordered oldest-frozen-first: the LRU victim list.
fn frozen_victims(registry: &Registry) -> Vec<String> {
    let mut victims: Vec<(String, DateTime<Utc>)> = registry
        .procs
        .values()
        .filter_map(|proc| match &proc.state {
            ProcState::Frozen { frozen_at } => Some((proc.name.clone(), *frozen_at)),
            _ => None,
        })
        .collect();
    victims.sort_by_key(|(_, frozen_at)| *frozen_at);
    victims.into_iter().map(|(name, _)| name).collect()
}
