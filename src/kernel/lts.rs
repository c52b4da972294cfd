use super::pcb::{Pcb, ProcState};
use super::queues::KernelQueues;
use super::{KernelState, LtsPolicy};
use std::sync::Arc;

/// Work the admission loop found: a SUSP_READY PCB to bring back, or a NEW
/// one to admit.
enum Admission {
    Resume(Arc<Pcb>),
    Admit(Arc<Pcb>),
}

/// Long-term scheduler loop. SUSP_READY has strict priority over NEW; the
/// condition variable on NEW also covers SUSP_READY arrivals.
pub fn run(state: Arc<KernelState>) {
    log::info!("long-term scheduler started");
    loop {
        let job = wait_for_work(&state);
        match job {
            Admission::Resume(pcb) => resume_from_swap(&state, pcb),
            Admission::Admit(pcb) => admit(&state, pcb),
        }
    }
}

fn wait_for_work(state: &Arc<KernelState>) -> Admission {
    let mut new_q = state.queues.new_q.lock().unwrap();
    loop {
        {
            let mut susp = state.queues.susp_ready_q.lock().unwrap();
            if !susp.is_empty() {
                let pcb = susp.remove(0);
                return Admission::Resume(pcb);
            }
        }
        if let Some(pcb) = select_candidate(state.lts_policy, &new_q) {
            return Admission::Admit(pcb);
        }
        log::debug!("lts waiting for work");
        new_q = state.queues.new_cv.wait(new_q).unwrap();
    }
}

/// Pick the next NEW candidate without removing it; removal happens after
/// the memory init settles.
pub fn select_candidate(policy: LtsPolicy, new_q: &[Arc<Pcb>]) -> Option<Arc<Pcb>> {
    match policy {
        LtsPolicy::Fifo => new_q.first().cloned(),
        LtsPolicy::Pmcp => new_q
            .iter()
            .min_by(|a, b| {
                a.size
                    .cmp(&b.size)
                    .then_with(|| a.created_at().cmp(&b.created_at()))
            })
            .cloned(),
    }
}

/// SUSP_READY admission: take a slot, de-swap when needed, hand to READY.
fn resume_from_swap(state: &Arc<KernelState>, pcb: Arc<Pcb>) {
    state.sem.acquire();

    if pcb.in_swap() {
        log::info!("({}) - admission requires de-swap", pcb.pid);
        if !state.notify_memory_resume(pcb.pid) {
            state.sem.release();
            state.finalize(&pcb, "ERROR_MEMORY_RESUME");
            return;
        }
        pcb.set_in_swap(false);
    } else {
        log::info!("({}) - pages already resident, no de-swap", pcb.pid);
    }

    if pcb.change_state(ProcState::Ready).is_ok() {
        state.queues.push_ready(pcb);
    }
}

/// NEW admission. The very first process enters unconditionally; everyone
/// else waits for a multiprogramming slot first.
fn admit(state: &Arc<KernelState>, pcb: Arc<Pcb>) {
    if pcb.pid == 0 {
        log::info!("admitting initial process");
        // Unconditional: consume a slot when one is free, never wait.
        state.sem.try_acquire();
        KernelQueues::remove_from(&state.queues.new_q, pcb.pid);
        if state.init_in_memory_with_retry(&pcb) {
            if pcb.change_state(ProcState::Ready).is_ok() {
                state.queues.push_ready(pcb);
            }
        } else {
            state.finalize(&pcb, "ERROR_MEMORY_INIT_INITIAL");
        }
        return;
    }

    state.sem.acquire();
    if state.init_in_memory_with_retry(&pcb) {
        KernelQueues::remove_from(&state.queues.new_q, pcb.pid);
        if pcb.change_state(ProcState::Ready).is_ok() {
            state.queues.push_ready(pcb);
        }
    } else {
        KernelQueues::remove_from(&state.queues.new_q, pcb.pid);
        state.finalize(&pcb, "MEMORY_INIT_FAILED");
        state.sem.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::LtsPolicy;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn pcb_sized(pid: crate::Pid, size: u64) -> Arc<Pcb> {
        // Creation times are strictly ordered by construction order.
        let pcb = Arc::new(Pcb::new(pid, size, "demo", 1000.0, 0.5));
        thread::sleep(Duration::from_millis(2));
        pcb
    }

    #[test]
    fn fifo_takes_the_head() {
        let q = vec![pcb_sized(1, 1024), pcb_sized(2, 64)];
        let pick = select_candidate(LtsPolicy::Fifo, &q).unwrap();
        assert_eq!(pick.pid, 1);
    }

    #[test]
    fn pmcp_admits_smallest_first() {
        let mut q = vec![pcb_sized(1, 1024), pcb_sized(2, 64), pcb_sized(3, 512)];

        // Admission order must be 64, 512, 1024.
        let mut order = Vec::new();
        while !q.is_empty() {
            let pick = select_candidate(LtsPolicy::Pmcp, &q).unwrap();
            order.push(pick.size);
            q.retain(|p| p.pid != pick.pid);
        }
        assert_eq!(order, vec![64, 512, 1024]);
    }

    #[test]
    fn pmcp_ties_break_by_creation_time() {
        let q = vec![pcb_sized(1, 128), pcb_sized(2, 128)];
        let pick = select_candidate(LtsPolicy::Pmcp, &q).unwrap();
        assert_eq!(pick.pid, 1);
    }

    #[test]
    fn empty_queue_selects_nothing() {
        assert!(select_candidate(LtsPolicy::Pmcp, &[]).is_none());
        assert!(select_candidate(LtsPolicy::Fifo, &[]).is_none());
    }
}
