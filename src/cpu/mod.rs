pub mod cache;
pub mod handlers;
pub mod isa;
pub mod mmu;
pub mod tlb;

use crate::Pid;
use cache::{CachePolicy, PageCache};
use isa::{Instruction, Reason};
use mmu::{MemoryPort, Mmu};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tlb::{Tlb, TlbPolicy};

/// Result of one fetch-decode-execute round, sent back to the Kernel.
#[derive(Debug)]
pub struct CycleOutcome {
    pub next_pc: u64,
    pub reason: Option<Reason>,
    pub params: Value,
}

/// One CPU worker: the MMU structures behind the single core lock, the
/// pending-interrupt slot, and the port to Memory.
pub struct CpuState {
    identifier: String,
    core: Mutex<Mmu>,
    pending_interrupt: Mutex<Option<Pid>>,
    memory: Arc<dyn MemoryPort>,
}

impl CpuState {
    pub fn new(
        identifier: &str,
        geometry: crate::memory::tables::Geometry,
        tlb_entries: usize,
        tlb_policy: TlbPolicy,
        cache_entries: usize,
        cache_policy: CachePolicy,
        cache_delay: u64,
        memory: Arc<dyn MemoryPort>,
    ) -> Self {
        log::info!(
            "cpu {} ready: tlb {} entries ({:?}), cache {} entries ({:?})",
            identifier,
            tlb_entries,
            tlb_policy,
            cache_entries,
            cache_policy
        );
        CpuState {
            identifier: identifier.to_string(),
            core: Mutex::new(Mmu::new(
                geometry,
                Tlb::new(tlb_entries, tlb_policy),
                PageCache::new(cache_entries, cache_policy),
                cache_delay,
            )),
            pending_interrupt: Mutex::new(None),
            memory,
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Post an interrupt targeting `pid`; picked up after the instruction
    /// currently executing.
    pub fn post_interrupt(&self, pid: Pid) {
        *self.pending_interrupt.lock().unwrap() = Some(pid);
        log::info!("interrupt posted for pid {}", pid);
    }

    fn take_interrupt(&self, pid: Pid) -> bool {
        let mut pending = self.pending_interrupt.lock().unwrap();
        if *pending == Some(pid) {
            *pending = None;
            return true;
        }
        false
    }

    /// One full cycle for `(pid, pc)`: fetch, decode, execute, interrupt
    /// check. Any return reason releases the pid from the TLB and cache.
    pub fn run_cycle(&self, pid: Pid, pc: u64) -> CycleOutcome {
        let line = match self.memory.fetch(pid, pc) {
            Ok(line) => line,
            Err(e) => {
                log::error!("pid {} fetch at pc {} failed: {}", pid, pc, e);
                return self.depart(pid, pc, Reason::Error);
            }
        };
        log::info!("pid {} - executing: {}", pid, line.trim());

        let instruction = match isa::decode(&line) {
            Ok(i) => i,
            Err(e) => {
                log::error!("pid {} decode failed: {}", pid, e);
                return self.depart(pid, pc, Reason::Error);
            }
        };

        let mut next_pc = pc;
        let mut jumped = false;
        let mut reason = None;
        let mut params = json!({});

        match instruction {
            Instruction::Noop => {}
            Instruction::Write { address, value } => {
                let mut core = self.core.lock().unwrap();
                if let Err(e) = core.write(self.memory.as_ref(), pid, address, value.as_bytes()) {
                    log::error!("pid {} WRITE failed: {}", pid, e);
                    reason = Some(Reason::Error);
                }
            }
            Instruction::Read { address, size } => {
                let mut core = self.core.lock().unwrap();
                match core.read(self.memory.as_ref(), pid, address, size) {
                    Ok(bytes) => {
                        log::info!(
                            "pid {} - READ {} bytes: '{}'",
                            pid,
                            size,
                            String::from_utf8_lossy(&bytes)
                        );
                    }
                    Err(e) => {
                        log::error!("pid {} READ failed: {}", pid, e);
                        reason = Some(Reason::Error);
                    }
                }
            }
            Instruction::Goto { target } => {
                next_pc = target;
                jumped = true;
            }
            Instruction::Io { device, time } => {
                reason = Some(Reason::SyscallIo);
                params = json!({"device": device, "time": time});
            }
            Instruction::InitProc { script, size } => {
                reason = Some(Reason::SyscallInitProc);
                params = json!({"script": script, "size": size});
            }
            Instruction::DumpMemory => reason = Some(Reason::SyscallDumpMemory),
            Instruction::Exit => reason = Some(Reason::Exit),
        }

        if self.take_interrupt(pid) {
            log::info!("pid {} interrupted after pc {}", pid, pc);
            return self.depart(pid, next_pc, Reason::Interrupted);
        }

        if reason.is_none() && !jumped {
            next_pc = pc + 1;
        }

        match reason {
            Some(r) => {
                let outcome = self.depart(pid, next_pc, r);
                CycleOutcome {
                    params,
                    ..outcome
                }
            }
            None => CycleOutcome {
                next_pc,
                reason: None,
                params,
            },
        }
    }

    /// The pid leaves this CPU: flush and clear its TLB/cache entries.
    fn depart(&self, pid: Pid, next_pc: u64, reason: Reason) -> CycleOutcome {
        let mut core = self.core.lock().unwrap();
        if let Err(e) = core.release(self.memory.as_ref(), pid) {
            log::error!("pid {} release flush failed: {}", pid, e);
        }
        CycleOutcome {
            next_pc,
            reason: Some(reason),
            params: json!({}),
        }
    }
}
