//! Whole-system scenarios: real Memory, CPU and I/O services on loopback
//! sockets, driven by a real Kernel with its scheduler threads running.

use exos::config::{KernelConfig, MemoryConfig};
use exos::cpu::{cache::CachePolicy, mmu::RpcMemoryPort, tlb::TlbPolicy, CpuState};
use exos::iodev::IoDevice;
use exos::kernel::pcb::ProcState;
use exos::kernel::{handlers as kernel_handlers, lts, sts, KernelState};
use exos::memory::tables::Geometry;
use exos::memory::{handlers as memory_handlers, MemoryState};
use exos::proto::{serve_listener, Envelope, MessageKind, RpcClient};
use serde_json::json;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn temp_base(name: &str) -> PathBuf {
    let base = std::env::temp_dir().join(format!("exos-e2e-{}-{}", std::process::id(), name));
    std::fs::create_dir_all(base.join("scripts")).unwrap();
    base
}

fn memory_config(base: &Path) -> MemoryConfig {
    MemoryConfig {
        ip: "127.0.0.1".to_string(),
        port: 0,
        memory_size: 1024,
        page_size: 64,
        entries_per_table: 4,
        levels: 2,
        memory_delay: 0,
        swap_delay: 0,
        swapfile_path: base.join("swapfile.bin").to_string_lossy().into_owned(),
        dump_path: base.join("dumps").to_string_lossy().into_owned(),
        scripts_path: base.join("scripts").to_string_lossy().into_owned(),
        log_level: "error".to_string(),
    }
}

fn start_memory(base: &Path) -> (Arc<MemoryState>, u16) {
    let state = Arc::new(MemoryState::new(memory_config(base)).unwrap());
    let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
    let port = listener.local_addr().unwrap().port();
    serve_listener(listener, Arc::clone(&state), memory_handlers::dispatch);
    (state, port)
}

fn start_cpu(identifier: &str, memory_port: u16) -> u16 {
    let client = RpcClient::new("127.0.0.1", memory_port, "CPU->Memory").unwrap();
    let state = Arc::new(CpuState::new(
        identifier,
        Geometry {
            page_size: 64,
            entries_per_table: 4,
            levels: 2,
        },
        4,
        TlbPolicy::Fifo,
        4,
        CachePolicy::Clock,
        0,
        Arc::new(RpcMemoryPort::new(client)),
    ));
    let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
    let port = listener.local_addr().unwrap().port();
    serve_listener(listener, state, exos::cpu::handlers::dispatch);
    port
}

fn start_io(name: &str, kernel_port: u16) -> u16 {
    let kernel = RpcClient::new("127.0.0.1", kernel_port, "IO->Kernel").unwrap();
    let device = Arc::new(IoDevice::new(name, 0, kernel));
    let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
    let port = listener.local_addr().unwrap().port();
    serve_listener(listener, device, exos::iodev::dispatch);
    port
}

fn start_kernel(memory_port: u16, suspension_ms: u64, degree: usize) -> (Arc<KernelState>, u16) {
    let cfg = KernelConfig {
        ip: "127.0.0.1".to_string(),
        port: 0,
        memory_ip: "127.0.0.1".to_string(),
        memory_port,
        sts_algorithm: "FIFO".to_string(),
        lts_algorithm: "FIFO".to_string(),
        alpha: 0.5,
        initial_estimate: 5000,
        suspension_time: suspension_ms,
        multiprogramming: degree,
        log_level: "error".to_string(),
    };
    let state = KernelState::new(cfg).unwrap();
    let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
    let port = listener.local_addr().unwrap().port();
    serve_listener(listener, Arc::clone(&state), kernel_handlers::dispatch);
    (state, port)
}

fn register_cpu_with_kernel(kernel: &Arc<KernelState>, identifier: &str, cpu_port: u16) {
    let envelope = Envelope::new(
        MessageKind::Handshake,
        "handshake",
        identifier,
        json!({
            "name": "CPU",
            "type": "CPU",
            "ip": "127.0.0.1",
            "port": cpu_port,
            "identifier": identifier,
        }),
    );
    let reply = kernel_handlers::dispatch(kernel, envelope);
    assert_eq!(reply["status"], "OK");
}

fn register_io_with_kernel(kernel: &Arc<KernelState>, name: &str, io_port: u16) {
    let envelope = Envelope::new(
        MessageKind::Handshake,
        "handshake",
        name,
        json!({
            "name": name,
            "type": format!("IO{}", name),
            "ip": "127.0.0.1",
            "port": io_port,
        }),
    );
    let reply = kernel_handlers::dispatch(kernel, envelope);
    assert_eq!(reply["status"], "OK");
}

fn start_schedulers(kernel: &Arc<KernelState>) {
    {
        let state = Arc::clone(kernel);
        thread::spawn(move || lts::run(state));
    }
    {
        let state = Arc::clone(kernel);
        thread::spawn(move || sts::run(state));
    }
}

/// Poll until the pid disappears from the kernel index, collecting every
/// state observed on the way.
fn wait_for_completion(kernel: &Arc<KernelState>, pid: exos::Pid, timeout: Duration) -> Vec<ProcState> {
    let deadline = Instant::now() + timeout;
    let mut seen = Vec::new();
    while Instant::now() < deadline {
        match kernel.queues.find(pid) {
            Some(pcb) => {
                let state = pcb.state();
                if seen.last() != Some(&state) {
                    seen.push(state);
                }
            }
            None => return seen,
        }
        thread::sleep(Duration::from_millis(5));
    }
    panic!("pid {} did not finish in {:?}; states seen: {:?}", pid, timeout, seen);
}

fn wait_until(what: &str, timeout: Duration, check: impl Fn() -> bool) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out waiting for {}", what);
}

#[test]
fn fifo_single_process_runs_to_exit() {
    let base = temp_base("fifo-exit");
    std::fs::write(base.join("scripts/solo.txt"), "NOOP\nWRITE 0 hola\nREAD 0 4\nEXIT\n").unwrap();

    let (memory, memory_port) = start_memory(&base);
    let (kernel, _kernel_port) = start_kernel(memory_port, 4500, 1);
    let cpu_port = start_cpu("CPU-1", memory_port);
    register_cpu_with_kernel(&kernel, "CPU-1", cpu_port);

    let pcb = kernel.create_pcb(64, "solo.txt");
    assert_eq!(pcb.pid, 0);
    kernel.submit_new(pcb);
    start_schedulers(&kernel);

    wait_for_completion(&kernel, 0, Duration::from_secs(10));

    // Destroy reached Memory: every frame is free again and the exit queue
    // holds the finished process.
    wait_until("memory teardown", Duration::from_secs(5), || {
        memory.free_bytes() == 1024
    });
    assert_eq!(kernel.queues.exit_q.lock().unwrap().len(), 1);
    assert_eq!(kernel.sem.available(), 1);
}

#[test]
fn init_proc_spawns_a_child_that_also_finishes() {
    let base = temp_base("init-proc");
    std::fs::write(base.join("scripts/parent.txt"), "INIT_PROC child.txt 64\nEXIT\n").unwrap();
    std::fs::write(base.join("scripts/child.txt"), "NOOP\nEXIT\n").unwrap();

    let (memory, memory_port) = start_memory(&base);
    let (kernel, _) = start_kernel(memory_port, 4500, 2);
    let cpu_port = start_cpu("CPU-1", memory_port);
    register_cpu_with_kernel(&kernel, "CPU-1", cpu_port);

    let pcb = kernel.create_pcb(64, "parent.txt");
    kernel.submit_new(pcb);
    start_schedulers(&kernel);

    wait_for_completion(&kernel, 0, Duration::from_secs(10));
    // The child got pid 1 and must terminate on its own.
    wait_until("child completion", Duration::from_secs(10), || {
        kernel.queues.find(1).is_none() && kernel.queues.exit_q.lock().unwrap().len() == 2
    });
    wait_until("memory teardown", Duration::from_secs(5), || {
        memory.free_bytes() == 1024
    });
}

#[test]
fn blocked_process_is_suspended_and_resumed_through_swap() {
    let base = temp_base("suspension");
    std::fs::write(
        base.join("scripts/iocycle.txt"),
        "WRITE 0 persist\nIO DISCO 600\nREAD 0 7\nEXIT\n",
    )
    .unwrap();

    let (memory, memory_port) = start_memory(&base);
    // Suspension fires at 150 ms, well before the 600 ms I/O completes.
    let (kernel, kernel_port) = start_kernel(memory_port, 150, 1);
    let cpu_port = start_cpu("CPU-1", memory_port);
    register_cpu_with_kernel(&kernel, "CPU-1", cpu_port);
    let io_port = start_io("DISCO", kernel_port);
    register_io_with_kernel(&kernel, "DISCO", io_port);

    let pcb = kernel.create_pcb(64, "iocycle.txt");
    kernel.submit_new(Arc::clone(&pcb));
    start_schedulers(&kernel);

    // The timer must push it into SUSP_BLOCKED while the io is pending.
    wait_until("suspension", Duration::from_secs(5), || {
        pcb.state() == ProcState::SuspBlocked
    });
    assert!(pcb.in_swap());
    // Its frame went to swap, so memory is fully free meanwhile.
    wait_until("swap-out", Duration::from_secs(5), || {
        memory.free_bytes() == 1024
    });

    let states = wait_for_completion(&kernel, 0, Duration::from_secs(15));
    assert!(
        states.contains(&ProcState::SuspBlocked),
        "observed states: {:?}",
        states
    );

    wait_until("memory teardown", Duration::from_secs(5), || {
        memory.free_bytes() == 1024
    });
    // The READ after the io saw the swapped-back bytes; reaching EXIT
    // (instead of ERROR) plus a clean teardown is the observable proof.
    assert_eq!(kernel.queues.exit_q.lock().unwrap().len(), 1);
    assert_eq!(kernel.sem.available(), 1);
}
