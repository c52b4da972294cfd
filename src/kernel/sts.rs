use super::pcb::{Pcb, ProcState};
use super::{KernelState, StsPolicy};
use crate::proto::{response_error, MessageKind, RpcClient};
use serde_json::{json, Value};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Free-CPU poll period while every worker is busy.
const CPU_POLL: Duration = Duration::from_millis(200);
/// Back-off after an SRT preemption round before reselecting.
const PREEMPT_WAIT: Duration = Duration::from_millis(100);

/// What one selection round decided.
pub enum Selection {
    /// Dispatch the PCB at this READY index.
    Pick(usize),
    /// A runner must be interrupted first; no dispatch this round.
    Preempt { victim: crate::Pid },
}

/// Short-term scheduler loop: select from READY, reserve a CPU, dispatch.
pub fn run(state: Arc<KernelState>) {
    log::info!("short-term scheduler started");
    loop {
        let pcb = next_to_dispatch(&state);

        // Wait for a free CPU slot, polling while all are busy.
        let (cpu_name, client) = loop {
            if let Some(found) = state.free_cpu() {
                break found;
            }
            thread::sleep(CPU_POLL);
        };
        state
            .queues
            .exec
            .lock()
            .unwrap()
            .insert(cpu_name.clone(), Arc::clone(&pcb));

        if pcb.change_state(ProcState::Exec).is_err() {
            // Finalized while waiting for a CPU; free the reservation.
            state.queues.exec.lock().unwrap().remove(&cpu_name);
            continue;
        }
        log::info!("({}) - dispatched to {}", pcb.pid, cpu_name);

        let state_clone = Arc::clone(&state);
        thread::spawn(move || dispatch_loop(state_clone, cpu_name, client, pcb));
    }
}

fn next_to_dispatch(state: &Arc<KernelState>) -> Arc<Pcb> {
    loop {
        let mut ready = state.queues.ready_q.lock().unwrap();
        loop {
            if ready.is_empty() {
                ready = state.queues.ready_cv.wait(ready).unwrap();
                continue;
            }
            match select(state, &ready) {
                Selection::Pick(index) => {
                    let pcb = ready.remove(index);
                    log::info!("({}) - selected for dispatch", pcb.pid);
                    return pcb;
                }
                Selection::Preempt { victim } => {
                    drop(ready);
                    send_interrupt(state, victim);
                    thread::sleep(PREEMPT_WAIT);
                    break;
                }
            }
        }
    }
}

/// Apply the configured algorithm to the READY queue. SRT additionally
/// compares the best candidate with every runner.
pub fn select(state: &Arc<KernelState>, ready: &[Arc<Pcb>]) -> Selection {
    match state.sts_policy {
        StsPolicy::Fifo => Selection::Pick(0),
        StsPolicy::Sjf => Selection::Pick(shortest_index(ready)),
        StsPolicy::Srt => {
            let candidate = shortest_index(ready);
            match preemption_victim(&ready[candidate], &state.queues.exec.lock().unwrap()) {
                Some(victim) => Selection::Preempt { victim },
                None => Selection::Pick(candidate),
            }
        }
    }
}

/// Minimum estimate; ties broken by the earlier READY arrival.
fn shortest_index(ready: &[Arc<Pcb>]) -> usize {
    let mut best = 0;
    for (i, pcb) in ready.iter().enumerate().skip(1) {
        let (be, bi) = (ready[best].estimate_ms(), ready[best].ready_at());
        let (ce, ci) = (pcb.estimate_ms(), pcb.ready_at());
        if ce < be || (ce == be && ci < bi) {
            best = i;
        }
    }
    best
}

/// The preemption victim is the longest-remaining runner whose estimate is
/// strictly above the candidate's; none means the candidate waits its turn.
pub fn preemption_victim(
    candidate: &Arc<Pcb>,
    exec: &std::collections::HashMap<String, Arc<Pcb>>,
) -> Option<crate::Pid> {
    let mut victim: Option<&Arc<Pcb>> = None;
    for runner in exec.values() {
        if candidate.estimate_ms() < runner.estimate_ms() {
            let longer = victim
                .map(|v| runner.estimate_ms() > v.estimate_ms())
                .unwrap_or(true);
            if longer {
                victim = Some(runner);
            }
        }
    }
    victim.map(|v| v.pid)
}

fn send_interrupt(state: &Arc<KernelState>, victim: crate::Pid) {
    let cpu_name = {
        let exec = state.queues.exec.lock().unwrap();
        exec.iter()
            .find(|(_, p)| p.pid == victim)
            .map(|(name, _)| name.clone())
    };
    let Some(cpu_name) = cpu_name else {
        log::warn!("({}) - preemption victim no longer running", victim);
        return;
    };
    let client = state.cpus.read().unwrap().get(&cpu_name).cloned();
    let Some(client) = client else {
        log::error!("no client for cpu '{}'", cpu_name);
        return;
    };
    log::info!("({}) - preempted by SRT, interrupting {}", victim, cpu_name);
    let state = Arc::clone(state);
    thread::spawn(move || {
        if let Err(e) = client.call(MessageKind::Interrupt, "INTERRUPT", json!({"pid": victim})) {
            log::error!("interrupt to {} failed: {}", cpu_name, e);
        }
        drop(state);
    });
}

/// Drive one dispatched PCB through per-instruction Execute round-trips
/// until it leaves the CPU.
fn dispatch_loop(
    state: Arc<KernelState>,
    cpu_name: String,
    client: Arc<RpcClient>,
    pcb: Arc<Pcb>,
) {
    log::info!("({}) - execution started on {}", pcb.pid, cpu_name);
    loop {
        // The process may have been finalized or moved behind our back;
        // whoever moved it also freed the EXEC slot.
        if state.queues.find(pcb.pid).is_none() || pcb.state() != ProcState::Exec {
            break;
        }

        let reply = client.call_raw(
            MessageKind::Execute,
            "EXECUTE",
            json!({"pid": pcb.pid, "pc": pcb.pc()}),
        );
        let reply = match reply {
            Ok(reply) => reply,
            Err(e) => {
                log::error!("({}) - dispatch to {} failed: {}", pcb.pid, cpu_name, e);
                release_cpu(&state, &cpu_name, &pcb);
                state.move_to_ready(&pcb);
                return;
            }
        };
        if let Some(msg) = response_error(&reply) {
            log::error!("({}) - cpu reported: {}", pcb.pid, msg);
            release_cpu(&state, &cpu_name, &pcb);
            state.move_to_ready(&pcb);
            return;
        }

        if !handle_reply(&state, &cpu_name, &pcb, &reply) {
            break;
        }
    }
    log::info!("({}) - left {}", pcb.pid, cpu_name);
}

/// Free the CPU slot if this PCB still owns it.
fn release_cpu(state: &Arc<KernelState>, cpu_name: &str, pcb: &Arc<Pcb>) {
    let mut exec = state.queues.exec.lock().unwrap();
    if exec.get(cpu_name).map(|p| p.pid) == Some(pcb.pid) {
        exec.remove(cpu_name);
    }
}

/// Process one Execute reply. Returns whether the dispatch loop continues
/// with the same PCB on the same CPU.
fn handle_reply(
    state: &Arc<KernelState>,
    cpu_name: &str,
    pcb: &Arc<Pcb>,
    reply: &Value,
) -> bool {
    let pc_updated = reply.get("pc").and_then(Value::as_u64);
    if let Some(pc) = pc_updated {
        pcb.set_pc(pc);
    }

    let Some(reason) = reply.get("return_reason").and_then(Value::as_str) else {
        // Keep executing on the same CPU.
        if pc_updated.is_none() {
            pcb.advance_pc();
        }
        return true;
    };
    let params = reply.get("params").cloned().unwrap_or(Value::Null);
    log::info!("({}) - return reason: {}", pcb.pid, reason);

    match reason {
        "INTERRUPTED" => {
            release_cpu(state, cpu_name, pcb);
            state.move_to_ready(pcb);
            false
        }
        "SYSCALL_INIT_PROC" => {
            log::info!("({}) - syscall: INIT_PROC", pcb.pid);
            let script = params["script"].as_str().unwrap_or_default().to_string();
            let size = params["size"].as_u64().unwrap_or(0);
            let child = state.create_pcb(size, &script);
            state.submit_new(child);
            pcb.advance_pc();
            true
        }
        "SYSCALL_IO" => {
            log::info!("({}) - syscall: IO", pcb.pid);
            let device = params["device"].as_str().unwrap_or_default().to_string();
            let time = params["time"].as_u64().unwrap_or(0);
            release_cpu(state, cpu_name, pcb);
            let Some(chosen) = state.io.select(&device) else {
                log::error!("({}) - io device '{}' not registered", pcb.pid, device);
                state.finalize(pcb, "ERROR_IO_DEVICE_NOT_FOUND");
                return false;
            };
            state.move_to_blocked(pcb, &format!("IO_{}", chosen));
            let (state, pcb) = (Arc::clone(state), Arc::clone(pcb));
            thread::spawn(move || state.send_io_request(&pcb, &chosen, time));
            false
        }
        "SYSCALL_DUMP_MEMORY" => {
            log::info!("({}) - syscall: DUMP_MEMORY", pcb.pid);
            release_cpu(state, cpu_name, pcb);
            state.move_to_blocked(pcb, "DUMP_MEMORY");
            let (state, pcb) = (Arc::clone(state), Arc::clone(pcb));
            thread::spawn(move || state.request_dump(&pcb));
            false
        }
        "EXIT" => {
            log::info!("({}) - syscall: EXIT", pcb.pid);
            state.finalize(pcb, "EXIT");
            false
        }
        "ERROR" => {
            log::error!("({}) - execution error reported by cpu", pcb.pid);
            state.finalize(pcb, "ERROR");
            false
        }
        other => {
            log::warn!("({}) - unknown return reason '{}'", pcb.pid, other);
            release_cpu(state, cpu_name, pcb);
            state.move_to_ready(pcb);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::tests::test_state;
    use std::collections::HashMap;
    use std::thread;
    use std::time::Duration;

    fn pcb_estimating(pid: crate::Pid, estimate: f64) -> Arc<Pcb> {
        let pcb = Arc::new(Pcb::new(pid, 64, "demo", estimate, 0.5));
        pcb.change_state(ProcState::Ready).unwrap();
        thread::sleep(Duration::from_millis(2));
        pcb
    }

    #[test]
    fn sjf_picks_the_shortest_estimate() {
        let ready = vec![
            pcb_estimating(1, 5000.0),
            pcb_estimating(2, 100.0),
            pcb_estimating(3, 900.0),
        ];
        assert_eq!(shortest_index(&ready), 1);
    }

    #[test]
    fn sjf_ties_break_by_ready_time() {
        let ready = vec![pcb_estimating(1, 500.0), pcb_estimating(2, 500.0)];
        assert_eq!(shortest_index(&ready), 0);
    }

    #[test]
    fn srt_picks_the_longest_remaining_victim() {
        let candidate = pcb_estimating(10, 100.0);
        let mut exec: HashMap<String, Arc<Pcb>> = HashMap::new();
        exec.insert("CPU-A".to_string(), pcb_estimating(1, 5000.0));
        exec.insert("CPU-B".to_string(), pcb_estimating(2, 800.0));
        // Both exceed the candidate; the longest-remaining one is chosen.
        assert_eq!(preemption_victim(&candidate, &exec), Some(1));
    }

    #[test]
    fn srt_does_not_preempt_shorter_runners() {
        let candidate = pcb_estimating(10, 1000.0);
        let mut exec: HashMap<String, Arc<Pcb>> = HashMap::new();
        exec.insert("CPU-A".to_string(), pcb_estimating(1, 900.0));
        exec.insert("CPU-B".to_string(), pcb_estimating(2, 1000.0));
        // Equal is not strictly larger.
        assert_eq!(preemption_victim(&candidate, &exec), None);
    }

    #[test]
    fn srt_selection_returns_preempt_when_a_runner_is_longer() {
        let state = test_state();
        let mut cfg = crate::kernel::tests::test_config();
        cfg.sts_algorithm = "SRT".to_string();
        let state_srt = crate::kernel::KernelState::new(cfg).unwrap();

        let runner = pcb_estimating(1, 5000.0);
        runner.change_state(ProcState::Exec).unwrap();
        state_srt
            .queues
            .exec
            .lock()
            .unwrap()
            .insert("CPU-A".to_string(), runner);

        let ready = vec![pcb_estimating(2, 100.0)];
        match select(&state_srt, &ready) {
            Selection::Preempt { victim } => assert_eq!(victim, 1),
            Selection::Pick(_) => panic!("expected a preemption"),
        }

        // Under FIFO the same situation just dispatches the head.
        let ready = vec![pcb_estimating(3, 100.0)];
        match select(&state, &ready) {
            Selection::Pick(0) => {}
            _ => panic!("fifo picks the head"),
        }
    }

    #[test]
    fn reply_without_reason_advances_and_continues() {
        let state = test_state();
        let pcb = Arc::new(Pcb::new(9, 64, "demo", 1000.0, 0.5));
        state.queues.register(Arc::clone(&pcb));

        let reply = serde_json::json!({"pid": 9, "pc": 7});
        assert!(handle_reply(&state, "CPU-A", &pcb, &reply));
        assert_eq!(pcb.pc(), 7);

        let reply = serde_json::json!({"pid": 9});
        assert!(handle_reply(&state, "CPU-A", &pcb, &reply));
        assert_eq!(pcb.pc(), 8);
    }

    #[test]
    fn init_proc_reply_spawns_a_new_pcb() {
        let state = test_state();
        let pcb = Arc::new(Pcb::new(0, 64, "demo", 1000.0, 0.5));
        state.queues.register(Arc::clone(&pcb));
        pcb.set_pc(3);

        let reply = serde_json::json!({
            "pid": 0,
            "pc": 3,
            "return_reason": "SYSCALL_INIT_PROC",
            "params": {"script": "child", "size": 128},
        });
        assert!(handle_reply(&state, "CPU-A", &pcb, &reply));
        assert_eq!(pcb.pc(), 4, "caller pc advances past INIT_PROC");
        let new_q = state.queues.new_q.lock().unwrap();
        assert_eq!(new_q.len(), 1);
        assert_eq!(new_q[0].script, "child");
        assert_eq!(new_q[0].size, 128);
    }

    #[test]
    fn interrupted_reply_returns_the_pcb_to_ready() {
        let state = test_state();
        let pcb = pcb_estimating(4, 1000.0);
        state.queues.register(Arc::clone(&pcb));
        pcb.change_state(ProcState::Exec).unwrap();
        state
            .queues
            .exec
            .lock()
            .unwrap()
            .insert("CPU-A".to_string(), Arc::clone(&pcb));

        let reply = serde_json::json!({"pid": 4, "pc": 2, "return_reason": "INTERRUPTED"});
        assert!(!handle_reply(&state, "CPU-A", &pcb, &reply));
        assert_eq!(pcb.state(), ProcState::Ready);
        assert_eq!(pcb.pc(), 2);
        assert!(state.queues.exec.lock().unwrap().is_empty());
        assert_eq!(state.queues.ready_q.lock().unwrap().len(), 1);
    }
}
