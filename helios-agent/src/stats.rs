//! Convergence counters, shared by the loop and its helpers

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Snapshot of the counters, logged after every cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub uptime_seconds: u64,
    pub cycles: u64,
    pub failed_cycles: u64,
    pub upgrades: u32,
    pub reconfigurations: u32,
    pub skipped_checks: u32,
    pub failed_commands: u32,
}

/// Counters for things the loop tolerates instead of failing on
/// (skipped check manifests, failed hooks and unit commands).
#[derive(Clone)]
pub struct ConvergenceStats {
    start_time: Instant,
    cycles: Arc<AtomicU64>,
    failed_cycles: Arc<AtomicU64>,
    upgrades: Arc<AtomicU32>,
    reconfigurations: Arc<AtomicU32>,
    skipped_checks: Arc<AtomicU32>,
    failed_commands: Arc<AtomicU32>,
}

impl Default for ConvergenceStats {
    fn default() -> Self {
        Self::new()
    }
}

impl ConvergenceStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            cycles: Arc::new(AtomicU64::new(0)),
            failed_cycles: Arc::new(AtomicU64::new(0)),
            upgrades: Arc::new(AtomicU32::new(0)),
            reconfigurations: Arc::new(AtomicU32::new(0)),
            skipped_checks: Arc::new(AtomicU32::new(0)),
            failed_commands: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn record_cycle(&self, ok: bool) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.failed_cycles.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_upgrade(&self) {
        self.upgrades.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconfiguration(&self) {
        self.reconfigurations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped_check(&self) {
        self.skipped_checks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed_command(&self) {
        self.failed_commands.fetch_add(1, Ordering::Relaxed);
    }

    pub fn skipped_checks(&self) -> u32 {
        self.skipped_checks.load(Ordering::Relaxed)
    }

    pub fn failed_commands(&self) -> u32 {
        self.failed_commands.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            cycles: self.cycles.load(Ordering::Relaxed),
            failed_cycles: self.failed_cycles.load(Ordering::Relaxed),
            upgrades: self.upgrades.load(Ordering::Relaxed),
            reconfigurations: self.reconfigurations.load(Ordering::Relaxed),
            skipped_checks: self.skipped_checks.load(Ordering::Relaxed),
            failed_commands: self.failed_commands.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_counters() {
        let stats = ConvergenceStats::new();
        let handle = stats.clone();
        handle.record_skipped_check();
        handle.record_failed_command();
        stats.record_cycle(false);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.skipped_checks, 1);
        assert_eq!(snapshot.failed_commands, 1);
        assert_eq!(snapshot.cycles, 1);
        assert_eq!(snapshot.failed_cycles, 1);
    }
}
