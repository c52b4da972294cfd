pub mod handlers;
pub mod io_router;
pub mod lts;
pub mod pcb;
pub mod queues;
pub mod sts;
pub mod timers;

use crate::config::KernelConfig;
use crate::proto::{MessageKind, ProtoResult, RpcClient};
use crate::Pid;
use io_router::IoRouter;
use pcb::{sanitize_alpha, Pcb, ProcState};
use queues::{KernelQueues, Semaphore};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};
use std::thread;
use std::time::Duration;
use timers::SuspensionTimers;

/// Short-term scheduling algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StsPolicy {
    Fifo,
    Sjf,
    Srt,
}

impl StsPolicy {
    pub fn parse(name: &str) -> Self {
        match name {
            "FIFO" => StsPolicy::Fifo,
            "SJF" => StsPolicy::Sjf,
            "SRT" => StsPolicy::Srt,
            other => {
                log::warn!("unknown short-term algorithm '{}', using FIFO", other);
                StsPolicy::Fifo
            }
        }
    }
}

/// Long-term admission algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LtsPolicy {
    Fifo,
    Pmcp,
}

impl LtsPolicy {
    pub fn parse(name: &str) -> Self {
        match name {
            "FIFO" => LtsPolicy::Fifo,
            "PMCP" => LtsPolicy::Pmcp,
            other => {
                log::warn!("unknown admission algorithm '{}', using FIFO", other);
                LtsPolicy::Fifo
            }
        }
    }
}

/// The Kernel world: every queue, the multiprogramming semaphore, the
/// suspension timers, peer registries and the Memory client. Handlers and
/// scheduler threads share it by `Arc`.
pub struct KernelState {
    pub cfg: KernelConfig,
    pub sts_policy: StsPolicy,
    pub lts_policy: LtsPolicy,
    pub alpha: f64,
    pub queues: KernelQueues,
    pub sem: Semaphore,
    pub timers: SuspensionTimers,
    pub io: IoRouter,
    pub cpus: RwLock<HashMap<String, Arc<RpcClient>>>,
    pub memory: RpcClient,
    /// Back-reference to the owning `Arc`, for the threads this state
    /// spawns (timers, memory notifications).
    me: Weak<KernelState>,
}

impl KernelState {
    pub fn new(cfg: KernelConfig) -> ProtoResult<Arc<Self>> {
        let memory = RpcClient::new(&cfg.memory_ip, cfg.memory_port, "Kernel->Memory")?;
        let sts_policy = StsPolicy::parse(&cfg.sts_algorithm);
        let lts_policy = LtsPolicy::parse(&cfg.lts_algorithm);
        log::info!(
            "scheduler initialized: sts {:?}, lts {:?}, multiprogramming {}",
            sts_policy,
            lts_policy,
            cfg.multiprogramming
        );
        Ok(Arc::new_cyclic(|me| KernelState {
            sts_policy,
            lts_policy,
            alpha: sanitize_alpha(cfg.alpha),
            queues: KernelQueues::new(),
            sem: Semaphore::new(cfg.multiprogramming),
            timers: SuspensionTimers::new(),
            io: IoRouter::new(),
            cpus: RwLock::new(HashMap::new()),
            memory,
            me: me.clone(),
            cfg,
        }))
    }

    fn arc(&self) -> Option<Arc<KernelState>> {
        self.me.upgrade()
    }

    /// Verify Memory is reachable, retrying with a fixed backoff.
    pub fn connect_to_memory(&self, attempts: u32) -> bool {
        for attempt in 1..=attempts {
            match self.memory.handshake(json!({"name": "Kernel", "type": "Kernel"})) {
                Ok(_) => {
                    log::info!("connection to memory established");
                    return true;
                }
                Err(e) => {
                    log::warn!("memory handshake attempt {} failed: {}", attempt, e);
                    thread::sleep(Duration::from_secs(3));
                }
            }
        }
        false
    }

    /// Create and index a PCB in NEW.
    pub fn create_pcb(&self, size: u64, script: &str) -> Arc<Pcb> {
        let pid = self.queues.alloc_pid();
        let pcb = Arc::new(Pcb::new(
            pid,
            size,
            script,
            self.cfg.initial_estimate as f64,
            self.alpha,
        ));
        self.queues.register(Arc::clone(&pcb));
        pcb
    }

    pub fn submit_new(&self, pcb: Arc<Pcb>) {
        self.queues.push_new(pcb);
    }

    /// Move a PCB to READY. Covers the BLOCKED (I/O done in time) path,
    /// and reroutes SUSP_BLOCKED PCBs to SUSP_READY instead.
    pub fn move_to_ready(&self, pcb: &Arc<Pcb>) {
        let state = pcb.state();
        if state == ProcState::SuspBlocked {
            self.move_to_susp_ready(pcb);
            return;
        }
        if state == ProcState::Blocked {
            KernelQueues::remove_from(&self.queues.blocked_q, pcb.pid);
        }
        if self.timers.cancel(pcb.pid) {
            log::info!("({}) - suspension timer cancelled", pcb.pid);
        }
        if pcb.change_state(ProcState::Ready).is_ok() {
            self.queues.push_ready(Arc::clone(pcb));
        }
    }

    /// SUSP_BLOCKED -> SUSP_READY on I/O completion; the LTS takes it from
    /// there (the pages stay in swap until admission).
    pub fn move_to_susp_ready(&self, pcb: &Arc<Pcb>) {
        if !KernelQueues::remove_from(&self.queues.susp_blocked_q, pcb.pid) {
            log::warn!("({}) - not found in SUSP_BLOCKED", pcb.pid);
            return;
        }
        self.timers.cancel(pcb.pid);
        if pcb.change_state(ProcState::SuspReady).is_ok() {
            self.queues.push_susp_ready(Arc::clone(pcb));
        }
    }

    /// EXEC -> BLOCKED with a motive, arming the suspension timer.
    pub fn move_to_blocked(&self, pcb: &Arc<Pcb>, motive: &str) {
        self.queues.remove_from_exec(pcb.pid);
        pcb.set_block_motive(motive);
        if pcb.change_state(ProcState::Blocked).is_err() {
            return;
        }
        if let Some(device) = motive.strip_prefix("IO_") {
            log::info!("({}) - blocked by io: {}", pcb.pid, device);
        } else {
            log::info!("({}) - blocked: {}", pcb.pid, motive);
        }
        self.queues.blocked_q.lock().unwrap().push(Arc::clone(pcb));
        self.arm_suspension_timer(pcb.pid);
    }

    /// One-shot countdown from BLOCKED to SUSP_BLOCKED.
    fn arm_suspension_timer(&self, pid: Pid) {
        let wait = if self.cfg.suspension_time == 0 {
            4500
        } else {
            self.cfg.suspension_time
        };
        let generation = self.timers.arm(pid);
        log::info!("({}) - suspension timer armed: {} ms", pid, wait);

        let Some(state) = self.arc() else {
            return;
        };
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(wait));
            state.fire_suspension(pid, generation);
        });
    }

    /// Timer expiry: only acts when this generation is still armed and the
    /// PCB is still BLOCKED.
    fn fire_suspension(&self, pid: Pid, generation: u64) {
        if !self.timers.disarm_if_current(pid, generation) {
            return;
        }
        let Some(pcb) = self.queues.find(pid) else {
            return;
        };
        if pcb.state() != ProcState::Blocked {
            log::debug!("({}) - suspension fire ignored, state {}", pid, pcb.state().as_str());
            return;
        }
        if !KernelQueues::remove_from(&self.queues.blocked_q, pid) {
            return;
        }
        log::info!("({}) - suspension timer expired, suspending", pid);
        if pcb.change_state(ProcState::SuspBlocked).is_err() {
            // Lost the race against an I/O completion; the winner already
            // queued the PCB elsewhere.
            return;
        }
        pcb.set_in_swap(true);
        self.queues.susp_blocked_q.lock().unwrap().push(Arc::clone(&pcb));

        if let Some(state) = self.arc() {
            thread::spawn(move || {
                state.notify_memory_suspend(pid);
            });
        }
        // The suspended process no longer holds a slot.
        self.sem.release();
    }

    /// Atomic finalization: exactly one caller wins the EXIT transition;
    /// everything it owned is unwound from there.
    pub fn finalize(&self, pcb: &Arc<Pcb>, motive: &str) {
        self.timers.cancel(pcb.pid);

        let Ok(prev) = pcb.change_state(ProcState::Exit) else {
            return;
        };
        self.queues.remove_from_state(pcb.pid, prev);
        self.queues.exit_q.lock().unwrap().push(Arc::clone(pcb));

        if prev.counts_for_multiprogramming() {
            self.sem.release();
        }

        if let Some(state) = self.arc() {
            let pid = pcb.pid;
            thread::spawn(move || {
                state.notify_memory_destroy(pid);
            });
        }

        log::info!("({}) - process finalized - motive: {}", pcb.pid, motive);
        pcb.log_state_metrics();
        self.queues.unregister(pcb.pid);

        // Freed slot or CPU: both schedulers may have work now.
        self.queues.signal_lts();
        self.queues.signal_sts();
    }

    /// An I/O device reports completion for a pid.
    pub fn io_complete(&self, pid: Pid) {
        let Some(pcb) = self.queues.find(pid) else {
            log::warn!("io completion for unknown pid {}", pid);
            return;
        };
        log::info!("({}) - io finished", pid);
        pcb.advance_pc();
        match pcb.state() {
            ProcState::Blocked => self.move_to_ready(&pcb),
            ProcState::SuspBlocked => self.move_to_susp_ready(&pcb),
            other => {
                log::warn!(
                    "({}) - io completion in unexpected state {}",
                    pid,
                    other.as_str()
                );
                self.move_to_ready(&pcb);
            }
        }
    }

    /// Send an IO_REQUEST to the already-selected device. Runs on its own
    /// thread; an unreachable device finalizes the caller.
    pub fn send_io_request(&self, pcb: &Arc<Pcb>, device: &str, time: u64) {
        let Some(client) = self.io.client_of(device) else {
            log::error!("({}) - io device '{}' not registered", pcb.pid, device);
            self.finalize(pcb, "ERROR_IO_DEVICE_NOT_FOUND");
            return;
        };
        log::info!("({}) - io request sent to '{}' for {} ms", pcb.pid, device, time);
        let result = client.operation("IO_REQUEST", json!({"pid": pcb.pid, "time": time}));
        if let Err(e) = result {
            log::error!("({}) - io device '{}' unreachable: {}", pcb.pid, device, e);
            self.finalize(pcb, "ERROR_IO_CONNECTION");
        }
    }

    /// Ask Memory to initialize a process, retrying on failure.
    pub fn init_in_memory_with_retry(&self, pcb: &Arc<Pcb>) -> bool {
        const ATTEMPTS: u32 = 5;
        const RETRY_WAIT: Duration = Duration::from_secs(2);

        for attempt in 1..=ATTEMPTS {
            match self.memory.call(
                MessageKind::InitProcess,
                "INIT_PROCESS",
                json!({"pid": pcb.pid, "size": pcb.size, "script": pcb.script}),
            ) {
                Ok(_) => {
                    log::info!("({}) - initialized in memory (attempt {})", pcb.pid, attempt);
                    return true;
                }
                Err(e) => {
                    log::warn!(
                        "({}) - memory init attempt {}/{} failed: {}",
                        pcb.pid,
                        attempt,
                        ATTEMPTS,
                        e
                    );
                    if attempt < ATTEMPTS {
                        thread::sleep(RETRY_WAIT);
                    }
                }
            }
        }
        log::error!("({}) - every memory init attempt failed", pcb.pid);
        false
    }

    pub fn notify_memory_resume(&self, pid: Pid) -> bool {
        match self
            .memory
            .call(MessageKind::ResumeProcess, "RESUME", json!({"pid": pid}))
        {
            Ok(_) => true,
            Err(e) => {
                log::error!("({}) - memory resume failed: {}", pid, e);
                false
            }
        }
    }

    fn notify_memory_suspend(&self, pid: Pid) {
        if let Err(e) = self
            .memory
            .call(MessageKind::SuspendProcess, "SUSPEND", json!({"pid": pid}))
        {
            log::error!("({}) - memory suspend failed: {}", pid, e);
        }
    }

    fn notify_memory_destroy(&self, pid: Pid) {
        if let Err(e) = self
            .memory
            .call(MessageKind::DestroyProcess, "DESTROY", json!({"pid": pid}))
        {
            log::error!("({}) - memory destroy failed: {}", pid, e);
        }
    }

    /// DUMP_MEMORY syscall follow-up, run on its own thread while the
    /// caller sits in BLOCKED.
    pub fn request_dump(&self, pcb: &Arc<Pcb>) {
        match self
            .memory
            .call(MessageKind::DumpMemory, "DUMP", json!({"pid": pcb.pid}))
        {
            Ok(_) => {
                log::info!("({}) - memory dump confirmed", pcb.pid);
                pcb.advance_pc();
                self.move_to_ready(pcb);
            }
            Err(e) => {
                log::error!("({}) - memory dump failed: {}", pcb.pid, e);
                self.finalize(pcb, "ERROR_DUMP");
            }
        }
    }

    /// Register a CPU worker found through the handshake.
    pub fn register_cpu(&self, identifier: &str, ip: &str, port: u16) -> ProtoResult<()> {
        let client = RpcClient::new(ip, port, &format!("Kernel->{}", identifier))?;
        self.cpus
            .write()
            .unwrap()
            .insert(identifier.to_string(), Arc::new(client));
        log::info!("cpu '{}' registered at {}:{}", identifier, ip, port);
        Ok(())
    }

    /// A CPU with no PCB in the EXEC map.
    pub fn free_cpu(&self) -> Option<(String, Arc<RpcClient>)> {
        let cpus = self.cpus.read().unwrap();
        if cpus.is_empty() {
            return None;
        }
        let exec = self.queues.exec.lock().unwrap();
        let mut names: Vec<&String> = cpus.keys().collect();
        names.sort_unstable();
        for name in names {
            if !exec.contains_key(name) {
                return Some((name.clone(), Arc::clone(&cpus[name])));
            }
        }
        None
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn test_config() -> KernelConfig {
        KernelConfig {
            ip: "127.0.0.1".to_string(),
            port: 0,
            // Port 9 (discard) is unassigned on test machines; calls fail fast.
            memory_ip: "127.0.0.1".to_string(),
            memory_port: 9,
            sts_algorithm: "FIFO".to_string(),
            lts_algorithm: "FIFO".to_string(),
            alpha: 0.5,
            initial_estimate: 1000,
            suspension_time: 60,
            multiprogramming: 2,
            log_level: "error".to_string(),
        }
    }

    pub(crate) fn test_state() -> Arc<KernelState> {
        KernelState::new(test_config()).unwrap()
    }

    fn ready_pcb(state: &Arc<KernelState>) -> Arc<Pcb> {
        let pcb = state.create_pcb(64, "demo");
        state.sem.acquire();
        pcb.change_state(ProcState::Ready).unwrap();
        state.queues.ready_q.lock().unwrap().push(Arc::clone(&pcb));
        pcb
    }

    #[test]
    fn policies_parse_with_fifo_fallback() {
        assert_eq!(StsPolicy::parse("SRT"), StsPolicy::Srt);
        assert_eq!(StsPolicy::parse("SJF"), StsPolicy::Sjf);
        assert_eq!(StsPolicy::parse("???"), StsPolicy::Fifo);
        assert_eq!(LtsPolicy::parse("PMCP"), LtsPolicy::Pmcp);
        assert_eq!(LtsPolicy::parse("???"), LtsPolicy::Fifo);
    }

    #[test]
    fn finalize_runs_exactly_once_and_releases_the_slot() {
        let state = test_state();
        let pcb = ready_pcb(&state);
        assert_eq!(state.sem.available(), 1);

        state.finalize(&pcb, "EXIT");
        assert_eq!(state.sem.available(), 2);
        assert!(state.queues.find(pcb.pid).is_none());
        assert!(state.queues.ready_q.lock().unwrap().is_empty());
        assert_eq!(state.queues.exit_q.lock().unwrap().len(), 1);

        // A second finalization must not release another permit.
        state.finalize(&pcb, "EXIT");
        assert_eq!(state.sem.available(), 2);
        assert_eq!(state.queues.exit_q.lock().unwrap().len(), 1);
    }

    #[test]
    fn finalize_from_new_does_not_release() {
        let state = test_state();
        let pcb = state.create_pcb(64, "demo");
        state.submit_new(Arc::clone(&pcb));
        state.finalize(&pcb, "MEMORY_INIT_FAILED");
        assert_eq!(state.sem.available(), 2);
        assert!(state.queues.new_q.lock().unwrap().is_empty());
    }

    #[test]
    fn suspension_timer_moves_a_blocked_pcb_to_susp_blocked() {
        let state = test_state();
        let pcb = ready_pcb(&state);
        state.queues.ready_q.lock().unwrap().clear();
        pcb.change_state(ProcState::Exec).unwrap();
        state
            .queues
            .exec
            .lock()
            .unwrap()
            .insert("CPU-1".to_string(), Arc::clone(&pcb));

        state.move_to_blocked(&pcb, "IO_DISCO");
        assert_eq!(pcb.state(), ProcState::Blocked);
        assert_eq!(state.sem.available(), 1);

        // suspension_time is 60 ms in the test config.
        thread::sleep(Duration::from_millis(200));
        assert_eq!(pcb.state(), ProcState::SuspBlocked);
        assert!(pcb.in_swap());
        // The suspended process released its slot.
        assert_eq!(state.sem.available(), 2);
        assert_eq!(state.queues.susp_blocked_q.lock().unwrap().len(), 1);
    }

    #[test]
    fn io_completion_in_time_cancels_the_timer() {
        let state = test_state();
        let pcb = ready_pcb(&state);
        state.queues.ready_q.lock().unwrap().clear();
        pcb.change_state(ProcState::Exec).unwrap();
        state
            .queues
            .exec
            .lock()
            .unwrap()
            .insert("CPU-1".to_string(), Arc::clone(&pcb));
        state.move_to_blocked(&pcb, "IO_DISCO");

        state.io_complete(pcb.pid);
        assert_eq!(pcb.state(), ProcState::Ready);
        assert_eq!(pcb.pc(), 1, "the pc moved past the IO instruction");

        // The timer must not fire afterwards.
        thread::sleep(Duration::from_millis(200));
        assert_eq!(pcb.state(), ProcState::Ready);
        assert_eq!(state.sem.available(), 1, "slot still held by the ready pcb");
    }

    #[test]
    fn io_completion_after_suspension_goes_to_susp_ready() {
        let state = test_state();
        let pcb = ready_pcb(&state);
        state.queues.ready_q.lock().unwrap().clear();
        pcb.change_state(ProcState::Exec).unwrap();
        state
            .queues
            .exec
            .lock()
            .unwrap()
            .insert("CPU-1".to_string(), Arc::clone(&pcb));
        state.move_to_blocked(&pcb, "IO_DISCO");

        thread::sleep(Duration::from_millis(200));
        assert_eq!(pcb.state(), ProcState::SuspBlocked);

        state.io_complete(pcb.pid);
        assert_eq!(pcb.state(), ProcState::SuspReady);
        assert!(pcb.in_swap(), "pages stay in swap until the LTS resumes them");
        assert_eq!(state.queues.susp_ready_q.lock().unwrap().len(), 1);
    }

    #[test]
    fn multiprogramming_degree_is_never_exceeded() {
        let state = test_state();
        let mut pcbs = Vec::new();
        for _ in 0..5 {
            let pcb = state.create_pcb(64, "demo");
            if state.sem.try_acquire() {
                pcb.change_state(ProcState::Ready).unwrap();
                state.queues.ready_q.lock().unwrap().push(Arc::clone(&pcb));
            }
            pcbs.push(pcb);
        }
        assert!(state.queues.resident_count() <= state.cfg.multiprogramming);
        assert_eq!(state.queues.resident_count(), 2);
    }
}
