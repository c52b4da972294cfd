use crate::Pid;
use spin::Mutex;
use std::collections::HashMap;

/// Per-process memory counters, reported once when the process is
/// destroyed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProcessMetrics {
    pub table_accesses: u64,
    pub instructions: u64,
    pub swap_outs: u64,
    pub swap_ins: u64,
    pub reads: u64,
    pub writes: u64,
}

/// Counter board for every live pid. Bumps are single map updates, so a
/// spin lock is enough.
#[derive(Default)]
pub struct MetricsBoard {
    counters: Mutex<HashMap<Pid, ProcessMetrics>>,
}

impl MetricsBoard {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(&self, pid: Pid, apply: impl FnOnce(&mut ProcessMetrics)) {
        let mut counters = self.counters.lock();
        apply(counters.entry(pid).or_default());
    }

    pub fn table_accesses(&self, pid: Pid, visits: u64) {
        self.bump(pid, |m| m.table_accesses += visits);
    }

    pub fn instruction(&self, pid: Pid) {
        self.bump(pid, |m| m.instructions += 1);
    }

    pub fn swap_out(&self, pid: Pid) {
        self.bump(pid, |m| m.swap_outs += 1);
    }

    pub fn swap_in(&self, pid: Pid) {
        self.bump(pid, |m| m.swap_ins += 1);
    }

    pub fn read(&self, pid: Pid) {
        self.bump(pid, |m| m.reads += 1);
    }

    pub fn write(&self, pid: Pid) {
        self.bump(pid, |m| m.writes += 1);
    }

    /// Remove and return the pid's counters, for the destroy-time summary.
    pub fn take(&self, pid: Pid) -> ProcessMetrics {
        self.counters.lock().remove(&pid).unwrap_or_default()
    }

    pub fn snapshot(&self, pid: Pid) -> ProcessMetrics {
        self.counters.lock().get(&pid).copied().unwrap_or_default()
    }
}
