use crate::Pid;

/// TLB replacement policy, chosen once from config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlbPolicy {
    Fifo,
    Lru,
}

impl TlbPolicy {
    /// Unrecognized names fall back to FIFO with a warning.
    pub fn parse(name: &str) -> Self {
        match name {
            "FIFO" => TlbPolicy::Fifo,
            "LRU" => TlbPolicy::Lru,
            other => {
                log::warn!("unknown TLB replacement '{}', using FIFO", other);
                TlbPolicy::Fifo
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct TlbEntry {
    pid: Pid,
    page: u64,
    frame: usize,
    load_time: u64,
    last_used: u64,
}

/// Per-CPU translation cache from `(pid, page)` to frame. Capacity 0
/// disables it entirely: every probe misses and nothing is kept.
pub struct Tlb {
    entries: Vec<Option<TlbEntry>>,
    policy: TlbPolicy,
    /// Monotonic tick stamping loads and uses.
    tick: u64,
}

impl Tlb {
    pub fn new(capacity: usize, policy: TlbPolicy) -> Self {
        Tlb {
            entries: vec![None; capacity],
            policy,
            tick: 0,
        }
    }

    pub fn enabled(&self) -> bool {
        !self.entries.is_empty()
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Linear probe. A hit refreshes `last_used` under LRU only.
    pub fn lookup(&mut self, pid: Pid, page: u64) -> Option<usize> {
        let tick = self.next_tick();
        let policy = self.policy;
        for slot in self.entries.iter_mut().flatten() {
            if slot.pid == pid && slot.page == page {
                if policy == TlbPolicy::Lru {
                    slot.last_used = tick;
                }
                return Some(slot.frame);
            }
        }
        None
    }

    /// Install a translation, evicting per policy when full.
    pub fn insert(&mut self, pid: Pid, page: u64, frame: usize) {
        if !self.enabled() {
            return;
        }
        let tick = self.next_tick();
        let entry = TlbEntry {
            pid,
            page,
            frame,
            load_time: tick,
            last_used: tick,
        };

        if let Some(free) = self.entries.iter().position(Option::is_none) {
            self.entries[free] = Some(entry);
            return;
        }

        let victim = match self.policy {
            TlbPolicy::Fifo => self.min_by(|e| e.load_time),
            TlbPolicy::Lru => self.min_by(|e| e.last_used),
        };
        log::debug!(
            "tlb replace slot {} with pid {} page {}",
            victim,
            pid,
            page
        );
        self.entries[victim] = Some(entry);
    }

    fn min_by(&self, key: impl Fn(&TlbEntry) -> u64) -> usize {
        let mut best = 0;
        let mut best_key = u64::MAX;
        for (i, slot) in self.entries.iter().enumerate() {
            if let Some(e) = slot {
                let k = key(e);
                if k < best_key {
                    best_key = k;
                    best = i;
                }
            }
        }
        best
    }

    /// Drop every entry belonging to a pid.
    pub fn purge(&mut self, pid: Pid) {
        for slot in self.entries.iter_mut() {
            if slot.map(|e| e.pid == pid).unwrap_or(false) {
                *slot = None;
            }
        }
    }
}
