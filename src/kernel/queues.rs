use super::pcb::{Pcb, ProcState};
use crate::Pid;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, RwLock};

/// Counting semaphore bounding the multiprogramming degree. `release` is
/// idempotent at the cap.
pub struct Semaphore {
    permits: Mutex<usize>,
    cap: usize,
    available: Condvar,
}

impl Semaphore {
    pub fn new(cap: usize) -> Self {
        let cap = cap.max(1);
        Semaphore {
            permits: Mutex::new(cap),
            cap,
            available: Condvar::new(),
        }
    }

    pub fn acquire(&self) {
        let mut permits = self.permits.lock().unwrap();
        while *permits == 0 {
            permits = self.available.wait(permits).unwrap();
        }
        *permits -= 1;
    }

    pub fn try_acquire(&self) -> bool {
        let mut permits = self.permits.lock().unwrap();
        if *permits == 0 {
            return false;
        }
        *permits -= 1;
        true
    }

    pub fn release(&self) {
        let mut permits = self.permits.lock().unwrap();
        if *permits < self.cap {
            *permits += 1;
            self.available.notify_one();
        }
    }

    pub fn available(&self) -> usize {
        *self.permits.lock().unwrap()
    }
}

/// The seven queues, the per-CPU EXEC map and the global PCB index. One
/// mutex per queue; condition variables wake the two schedulers (`new_cv`
/// also covers SUSP_READY arrivals).
pub struct KernelQueues {
    pub new_q: Mutex<Vec<Arc<Pcb>>>,
    pub new_cv: Condvar,
    pub ready_q: Mutex<Vec<Arc<Pcb>>>,
    pub ready_cv: Condvar,
    pub blocked_q: Mutex<Vec<Arc<Pcb>>>,
    pub susp_ready_q: Mutex<Vec<Arc<Pcb>>>,
    pub susp_blocked_q: Mutex<Vec<Arc<Pcb>>>,
    pub exit_q: Mutex<Vec<Arc<Pcb>>>,
    pub exec: Mutex<HashMap<String, Arc<Pcb>>>,
    index: RwLock<HashMap<Pid, Arc<Pcb>>>,
    next_pid: Mutex<Pid>,
}

impl KernelQueues {
    pub fn new() -> Self {
        KernelQueues {
            new_q: Mutex::new(Vec::new()),
            new_cv: Condvar::new(),
            ready_q: Mutex::new(Vec::new()),
            ready_cv: Condvar::new(),
            blocked_q: Mutex::new(Vec::new()),
            susp_ready_q: Mutex::new(Vec::new()),
            susp_blocked_q: Mutex::new(Vec::new()),
            exit_q: Mutex::new(Vec::new()),
            exec: Mutex::new(HashMap::new()),
            index: RwLock::new(HashMap::new()),
            next_pid: Mutex::new(0),
        }
    }

    pub fn alloc_pid(&self) -> Pid {
        let mut next = self.next_pid.lock().unwrap();
        let pid = *next;
        *next += 1;
        pid
    }

    pub fn register(&self, pcb: Arc<Pcb>) {
        self.index.write().unwrap().insert(pcb.pid, pcb);
    }

    pub fn find(&self, pid: Pid) -> Option<Arc<Pcb>> {
        self.index.read().unwrap().get(&pid).cloned()
    }

    pub fn unregister(&self, pid: Pid) {
        self.index.write().unwrap().remove(&pid);
    }

    pub fn live_pids(&self) -> Vec<Pid> {
        self.index.read().unwrap().keys().copied().collect()
    }

    /// How many indexed PCBs currently hold a multiprogramming slot.
    pub fn resident_count(&self) -> usize {
        self.index
            .read()
            .unwrap()
            .values()
            .filter(|p| p.state().counts_for_multiprogramming())
            .count()
    }

    /// Wake the long-term scheduler. The lock round avoids a lost wakeup
    /// against a waiter that is about to sleep.
    pub fn signal_lts(&self) {
        let _guard = self.new_q.lock().unwrap();
        self.new_cv.notify_all();
    }

    /// Wake the short-term scheduler.
    pub fn signal_sts(&self) {
        let _guard = self.ready_q.lock().unwrap();
        self.ready_cv.notify_all();
    }

    pub fn push_new(&self, pcb: Arc<Pcb>) {
        self.new_q.lock().unwrap().push(pcb);
        self.signal_lts();
    }

    pub fn push_ready(&self, pcb: Arc<Pcb>) {
        self.ready_q.lock().unwrap().push(pcb);
        self.signal_sts();
    }

    pub fn push_susp_ready(&self, pcb: Arc<Pcb>) {
        self.susp_ready_q.lock().unwrap().push(pcb);
        self.signal_lts();
    }

    /// Remove a pid from one queue. Returns whether it was there.
    pub fn remove_from(queue: &Mutex<Vec<Arc<Pcb>>>, pid: Pid) -> bool {
        let mut q = queue.lock().unwrap();
        let before = q.len();
        q.retain(|p| p.pid != pid);
        q.len() != before
    }

    /// Remove a pid from the EXEC map, returning the CPU that ran it.
    pub fn remove_from_exec(&self, pid: Pid) -> Option<String> {
        let mut exec = self.exec.lock().unwrap();
        let cpu = exec
            .iter()
            .find(|(_, p)| p.pid == pid)
            .map(|(name, _)| name.clone())?;
        exec.remove(&cpu);
        Some(cpu)
    }

    /// Remove a PCB from whatever queue matches `state`.
    pub fn remove_from_state(&self, pid: Pid, state: ProcState) -> bool {
        match state {
            ProcState::New => Self::remove_from(&self.new_q, pid),
            ProcState::Ready => Self::remove_from(&self.ready_q, pid),
            ProcState::Blocked => Self::remove_from(&self.blocked_q, pid),
            ProcState::SuspReady => Self::remove_from(&self.susp_ready_q, pid),
            ProcState::SuspBlocked => Self::remove_from(&self.susp_blocked_q, pid),
            ProcState::Exec => self.remove_from_exec(pid).is_some(),
            ProcState::Exit => false,
        }
    }
}

impl Default for KernelQueues {
    fn default() -> Self {
        Self::new()
    }
}
