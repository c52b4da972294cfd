use exos::config::{self, KernelConfig};
use exos::kernel::{handlers, lts, sts, KernelState};
use exos::{logging, proto};
use std::io::BufRead;
use std::path::Path;
use std::process::exit;
use std::sync::Arc;
use std::thread;

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 4 {
        eprintln!("usage: {} <config> <initial_script> <size>", args[0]);
        eprintln!("example: {} configs/kernel.json demo.txt 256", args[0]);
        exit(1);
    }
    let config_path = &args[1];
    let initial_script = args[2].clone();
    let initial_size: u64 = match args[3].parse() {
        Ok(size) => size,
        Err(_) => {
            eprintln!("initial process size must be a non-negative integer");
            exit(1);
        }
    };

    let cfg: KernelConfig = match config::load(Path::new(config_path)) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{}", e);
            exit(1);
        }
    };
    logging::init(&cfg.log_level, "kernel");
    log::info!("kernel starting with config {}", config_path);

    let state = match KernelState::new(cfg) {
        Ok(state) => state,
        Err(e) => {
            log::error!("kernel initialization failed: {}", e);
            exit(1);
        }
    };

    if !state.connect_to_memory(10) {
        log::error!("memory is unreachable, giving up");
        exit(1);
    }

    let server = match proto::serve(
        &state.cfg.ip.clone(),
        state.cfg.port,
        Arc::clone(&state),
        handlers::dispatch,
    ) {
        Ok(handle) => handle,
        Err(e) => {
            log::error!("cannot bind kernel server: {}", e);
            exit(1);
        }
    };

    // The initial process sits in NEW until the schedulers start.
    let pcb = state.create_pcb(initial_size, &initial_script);
    state.submit_new(pcb);
    log::info!("kernel ready, waiting for peers");

    println!("Press ENTER to start the schedulers...");
    let stdin = std::io::stdin();
    let _ = stdin.lock().lines().next();
    println!("Schedulers running.");

    {
        let state = Arc::clone(&state);
        thread::spawn(move || lts::run(state));
    }
    {
        let state = Arc::clone(&state);
        thread::spawn(move || sts::run(state));
    }

    let _ = server.join();
}
