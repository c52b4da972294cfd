use super::CpuState;
use crate::proto::{ok, reject, Envelope, MessageKind};
use serde_json::{json, Value};
use std::sync::Arc;

/// CPU worker dispatch: Execute runs one instruction cycle, Interrupt
/// posts the preemption flag.
pub fn dispatch(state: &Arc<CpuState>, envelope: Envelope) -> Value {
    match envelope.kind {
        MessageKind::Handshake => {
            log::info!("handshake from {}", envelope.origin);
            ok()
        }
        MessageKind::Execute => execute(state, &envelope),
        MessageKind::Interrupt => interrupt(state, &envelope),
        other => reject(format!("operation {:?} not served by cpu", other)),
    }
}

fn execute(state: &Arc<CpuState>, envelope: &Envelope) -> Value {
    let (Some(pid), Some(pc)) = (envelope.field_u64("pid"), envelope.field_u64("pc")) else {
        return reject("execute requires pid and pc");
    };
    let pid = pid as crate::Pid;

    let outcome = state.run_cycle(pid, pc);
    let mut response = json!({"pid": pid, "pc": outcome.next_pc});
    if let Some(reason) = outcome.reason {
        response["return_reason"] = json!(reason.as_str());
        response["params"] = outcome.params;
    }
    log::info!(
        "pid {} returned to kernel: pc {}, reason {:?}",
        pid,
        outcome.next_pc,
        outcome.reason
    );
    response
}

fn interrupt(state: &Arc<CpuState>, envelope: &Envelope) -> Value {
    let Some(pid) = envelope.field_u64("pid") else {
        return reject("interrupt requires pid");
    };
    state.post_interrupt(pid as crate::Pid);
    ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::mmu::testing::FakeMemory;
    use crate::cpu::mmu::{CpuResult, MemoryPort};
    use crate::cpu::{cache::CachePolicy, tlb::TlbPolicy};
    use crate::memory::tables::Geometry;
    use crate::Pid;

    struct OneExit(FakeMemory);

    impl MemoryPort for OneExit {
        fn fetch(&self, _pid: Pid, pc: u64) -> CpuResult<String> {
            match pc {
                0 => Ok("EXIT".to_string()),
                _ => Err(crate::cpu::mmu::CpuError::Memory("pc out of range".to_string())),
            }
        }
        fn obtain_frame(&self, pid: Pid, page: u64) -> CpuResult<usize> {
            self.0.obtain_frame(pid, page)
        }
        fn read(&self, pid: Pid, physical: usize, size: usize) -> CpuResult<Vec<u8>> {
            self.0.read(pid, physical, size)
        }
        fn write(&self, pid: Pid, physical: usize, bytes: &[u8]) -> CpuResult<()> {
            self.0.write(pid, physical, bytes)
        }
    }

    fn state() -> Arc<CpuState> {
        Arc::new(CpuState::new(
            "CPU-1",
            Geometry {
                page_size: 16,
                entries_per_table: 4,
                levels: 2,
            },
            2,
            TlbPolicy::Fifo,
            2,
            CachePolicy::Clock,
            0,
            std::sync::Arc::new(OneExit(FakeMemory::new(16, 4))),
        ))
    }

    #[test]
    fn execute_reports_the_return_reason() {
        let cpu = state();
        let envelope = Envelope::new(
            MessageKind::Execute,
            "EXECUTE",
            "Kernel",
            json!({"pid": 1, "pc": 0}),
        );
        let reply = dispatch(&cpu, envelope);
        assert_eq!(reply["return_reason"], "EXIT");
        assert_eq!(reply["pid"], 1);
    }

    #[test]
    fn interrupt_requires_a_pid() {
        let cpu = state();
        let reply = dispatch(
            &cpu,
            Envelope::new(MessageKind::Interrupt, "INTERRUPT", "Kernel", json!({})),
        );
        assert_eq!(reply["status"], "ERROR");
        let reply = dispatch(
            &cpu,
            Envelope::new(MessageKind::Interrupt, "INTERRUPT", "Kernel", json!({"pid": 4})),
        );
        assert_eq!(reply["status"], "OK");
    }
}
