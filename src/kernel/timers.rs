use crate::Pid;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Handles for the per-PCB suspension countdowns. Cancellation is
/// best-effort: a fire that no longer matches its generation (cancelled or
/// re-armed in between) is dropped by the caller.
pub struct SuspensionTimers {
    armed: Mutex<HashMap<Pid, u64>>,
    next_gen: AtomicU64,
}

impl SuspensionTimers {
    pub fn new() -> Self {
        SuspensionTimers {
            armed: Mutex::new(HashMap::new()),
            next_gen: AtomicU64::new(1),
        }
    }

    /// Arm (or re-arm) the timer for a pid; the returned generation must be
    /// presented back when it fires.
    pub fn arm(&self, pid: Pid) -> u64 {
        let generation = self.next_gen.fetch_add(1, Ordering::Relaxed);
        self.armed.lock().unwrap().insert(pid, generation);
        generation
    }

    pub fn cancel(&self, pid: Pid) -> bool {
        self.armed.lock().unwrap().remove(&pid).is_some()
    }

    /// Consume the timer if it is still the armed generation for the pid.
    pub fn disarm_if_current(&self, pid: Pid, generation: u64) -> bool {
        let mut armed = self.armed.lock().unwrap();
        if armed.get(&pid) == Some(&generation) {
            armed.remove(&pid);
            return true;
        }
        false
    }
}

impl Default for SuspensionTimers {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fire_consumes_only_the_current_generation() {
        let timers = SuspensionTimers::new();
        let g1 = timers.arm(1);
        assert!(timers.disarm_if_current(1, g1));
        // A second fire of the same generation is a no-op.
        assert!(!timers.disarm_if_current(1, g1));
    }

    #[test]
    fn cancel_blocks_the_pending_fire() {
        let timers = SuspensionTimers::new();
        let g = timers.arm(2);
        assert!(timers.cancel(2));
        assert!(!timers.disarm_if_current(2, g));
        assert!(!timers.cancel(2));
    }

    #[test]
    fn rearming_invalidates_the_old_generation() {
        let timers = SuspensionTimers::new();
        let old = timers.arm(3);
        let new = timers.arm(3);
        assert!(!timers.disarm_if_current(3, old));
        assert!(timers.disarm_if_current(3, new));
    }
}
