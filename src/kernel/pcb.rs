use crate::Pid;
use std::sync::Mutex;
use std::time::Instant;

/// The seven states of a simulated process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    New,
    Ready,
    Exec,
    Blocked,
    SuspReady,
    SuspBlocked,
    Exit,
}

impl ProcState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcState::New => "NEW",
            ProcState::Ready => "READY",
            ProcState::Exec => "EXEC",
            ProcState::Blocked => "BLOCKED",
            ProcState::SuspReady => "SUSP_READY",
            ProcState::SuspBlocked => "SUSP_BLOCKED",
            ProcState::Exit => "EXIT",
        }
    }

    /// States that hold a multiprogramming slot.
    pub fn counts_for_multiprogramming(&self) -> bool {
        matches!(self, ProcState::Ready | ProcState::Exec | ProcState::Blocked)
    }
}

/// The transition set of the automaton. Finalization may leave from any
/// non-EXIT state; everything else follows the scheduling edges.
pub fn transition_allowed(from: ProcState, to: ProcState) -> bool {
    use ProcState::*;
    if to == Exit {
        return from != Exit;
    }
    matches!(
        (from, to),
        (New, Ready)
            | (Ready, Exec)
            | (Exec, Blocked)
            | (Exec, Ready)
            | (Blocked, SuspBlocked)
            | (Blocked, Ready)
            | (SuspBlocked, SuspReady)
            | (SuspReady, Ready)
    )
}

/// Clamp the burst-estimation weight into [0,1]; out-of-range configs get
/// the 0.5 default.
pub fn sanitize_alpha(alpha: f64) -> f64 {
    if !(0.0..=1.0).contains(&alpha) {
        log::warn!("alpha {} out of [0,1], using 0.5", alpha);
        return 0.5;
    }
    alpha
}

#[derive(Debug)]
struct PcbInner {
    state: ProcState,
    pc: u64,
    estimate_ms: f64,
    last_burst_ms: f64,
    executions: u64,
    total_exec_ms: f64,
    block_motive: Option<String>,
    in_swap: bool,
    created_at: Instant,
    ready_at: Option<Instant>,
    exec_at: Option<Instant>,
    blocked_at: Option<Instant>,
    finished_at: Option<Instant>,
    burst_start: Option<Instant>,
}

/// Process Control Block. Shared across queues by `Arc`; every mutable
/// field sits behind the inner mutex, and the state field only changes
/// through `change_state`, which enforces the transition set.
pub struct Pcb {
    pub pid: Pid,
    pub size: u64,
    pub script: String,
    alpha: f64,
    inner: Mutex<PcbInner>,
}

impl Pcb {
    pub fn new(pid: Pid, size: u64, script: &str, initial_estimate_ms: f64, alpha: f64) -> Self {
        let estimate = if initial_estimate_ms <= 0.0 {
            5000.0
        } else {
            initial_estimate_ms
        };
        log::info!("({}) - process created - state: NEW", pid);
        Pcb {
            pid,
            size,
            script: script.to_string(),
            alpha: sanitize_alpha(alpha),
            inner: Mutex::new(PcbInner {
                state: ProcState::New,
                pc: 0,
                estimate_ms: estimate,
                last_burst_ms: 0.0,
                executions: 0,
                total_exec_ms: 0.0,
                block_motive: None,
                in_swap: false,
                created_at: Instant::now(),
                ready_at: None,
                exec_at: None,
                blocked_at: None,
                finished_at: None,
                burst_start: None,
            }),
        }
    }

    pub fn state(&self) -> ProcState {
        self.inner.lock().unwrap().state
    }

    /// Perform one validated transition, maintaining the timestamps and the
    /// burst accounting. Returns the previous state.
    pub fn change_state(&self, to: ProcState) -> Result<ProcState, ProcState> {
        let mut inner = self.inner.lock().unwrap();
        let from = inner.state;
        if from == to {
            return Err(from);
        }
        if !transition_allowed(from, to) {
            log::warn!(
                "({}) - rejected transition {} -> {}",
                self.pid,
                from.as_str(),
                to.as_str()
            );
            return Err(from);
        }

        let now = Instant::now();
        if from == ProcState::Ready && to == ProcState::Exec {
            inner.burst_start = Some(now);
            inner.exec_at = Some(now);
        } else if from == ProcState::Exec {
            if let Some(start) = inner.burst_start.take() {
                let real = now.duration_since(start).as_secs_f64() * 1000.0;
                inner.last_burst_ms = real;
                inner.executions += 1;
                inner.total_exec_ms += real;
                inner.estimate_ms = self.alpha * real + (1.0 - self.alpha) * inner.estimate_ms;
            }
        }

        match to {
            ProcState::Ready => inner.ready_at = Some(now),
            ProcState::Blocked => inner.blocked_at = Some(now),
            ProcState::Exit => inner.finished_at = Some(now),
            _ => {}
        }

        inner.state = to;
        log::info!("({}) - moves from {} to {}", self.pid, from.as_str(), to.as_str());
        Ok(from)
    }

    pub fn pc(&self) -> u64 {
        self.inner.lock().unwrap().pc
    }

    pub fn set_pc(&self, pc: u64) {
        self.inner.lock().unwrap().pc = pc;
    }

    pub fn advance_pc(&self) {
        self.inner.lock().unwrap().pc += 1;
    }

    pub fn estimate_ms(&self) -> f64 {
        self.inner.lock().unwrap().estimate_ms
    }

    pub fn last_burst_ms(&self) -> f64 {
        self.inner.lock().unwrap().last_burst_ms
    }

    pub fn created_at(&self) -> Instant {
        self.inner.lock().unwrap().created_at
    }

    pub fn ready_at(&self) -> Option<Instant> {
        self.inner.lock().unwrap().ready_at
    }

    pub fn in_swap(&self) -> bool {
        self.inner.lock().unwrap().in_swap
    }

    pub fn set_in_swap(&self, value: bool) {
        self.inner.lock().unwrap().in_swap = value;
    }

    pub fn set_block_motive(&self, motive: &str) {
        self.inner.lock().unwrap().block_motive = Some(motive.to_string());
    }

    pub fn block_motive(&self) -> Option<String> {
        self.inner.lock().unwrap().block_motive.clone()
    }

    /// The state-metrics line printed when the process finalizes:
    /// `NEW (1)(t), READY (1)(t), EXEC (n)(t), BLOCKED (1)(t)` in seconds.
    pub fn log_state_metrics(&self) {
        let inner = self.inner.lock().unwrap();
        let span = |a: Option<Instant>, b: Option<Instant>| -> f64 {
            match (a, b) {
                (Some(a), Some(b)) if b > a => b.duration_since(a).as_secs_f64(),
                _ => 0.0,
            }
        };
        let t_new = span(Some(inner.created_at), inner.ready_at);
        let t_ready = span(inner.ready_at, inner.exec_at);
        let t_exec = inner.total_exec_ms / 1000.0;
        let t_blocked = span(inner.blocked_at, inner.finished_at);
        log::info!(
            "({}) - state metrics: NEW (1)({:.2}), READY (1)({:.2}), EXEC ({})({:.2}), BLOCKED (1)({:.2})",
            self.pid,
            t_new,
            t_ready,
            inner.executions,
            t_exec,
            t_blocked
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn pcb() -> Pcb {
        Pcb::new(1, 64, "demo", 5000.0, 0.5)
    }

    #[test]
    fn the_happy_path_is_allowed() {
        let p = pcb();
        assert!(p.change_state(ProcState::Ready).is_ok());
        assert!(p.change_state(ProcState::Exec).is_ok());
        assert!(p.change_state(ProcState::Blocked).is_ok());
        assert!(p.change_state(ProcState::SuspBlocked).is_ok());
        assert!(p.change_state(ProcState::SuspReady).is_ok());
        assert!(p.change_state(ProcState::Ready).is_ok());
        assert!(p.change_state(ProcState::Exec).is_ok());
        assert!(p.change_state(ProcState::Exit).is_ok());
    }

    #[test]
    fn invalid_transitions_are_rejected() {
        let p = pcb();
        assert!(p.change_state(ProcState::Exec).is_err());
        p.change_state(ProcState::Ready).unwrap();
        assert!(p.change_state(ProcState::Blocked).is_err());
        assert!(p.change_state(ProcState::SuspReady).is_err());
        // Same-state moves are rejected too.
        assert!(p.change_state(ProcState::Ready).is_err());
    }

    #[test]
    fn exit_is_terminal() {
        let p = pcb();
        p.change_state(ProcState::Exit).unwrap();
        assert!(p.change_state(ProcState::Ready).is_err());
        assert!(p.change_state(ProcState::Exit).is_err());
    }

    #[test]
    fn burst_estimate_folds_with_alpha() {
        let p = Pcb::new(2, 0, "demo", 1000.0, 0.5);
        p.change_state(ProcState::Ready).unwrap();
        p.change_state(ProcState::Exec).unwrap();
        thread::sleep(Duration::from_millis(40));
        p.change_state(ProcState::Ready).unwrap();

        let real = p.last_burst_ms();
        assert!(real >= 40.0, "burst was {} ms", real);
        let expected = 0.5 * real + 0.5 * 1000.0;
        assert!((p.estimate_ms() - expected).abs() < 1.0);
    }

    #[test]
    fn alpha_out_of_range_defaults_to_half() {
        assert_eq!(sanitize_alpha(-0.1), 0.5);
        assert_eq!(sanitize_alpha(1.5), 0.5);
        assert_eq!(sanitize_alpha(0.8), 0.8);
        assert_eq!(sanitize_alpha(0.0), 0.0);
        assert_eq!(sanitize_alpha(1.0), 1.0);
    }

    #[test]
    fn non_positive_initial_estimate_defaults() {
        let p = Pcb::new(3, 0, "demo", 0.0, 0.5);
        assert_eq!(p.estimate_ms(), 5000.0);
    }

    #[test]
    fn multiprogramming_states() {
        assert!(ProcState::Ready.counts_for_multiprogramming());
        assert!(ProcState::Exec.counts_for_multiprogramming());
        assert!(ProcState::Blocked.counts_for_multiprogramming());
        assert!(!ProcState::New.counts_for_multiprogramming());
        assert!(!ProcState::SuspReady.counts_for_multiprogramming());
        assert!(!ProcState::SuspBlocked.counts_for_multiprogramming());
        assert!(!ProcState::Exit.counts_for_multiprogramming());
    }
}
