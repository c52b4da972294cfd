use exos::config::{self, MemoryConfig};
use exos::memory::{handlers, MemoryState};
use exos::{logging, proto};
use std::path::Path;
use std::process::exit;
use std::sync::Arc;

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        eprintln!("usage: {} <config>", args[0]);
        exit(1);
    }

    let cfg: MemoryConfig = match config::load(Path::new(&args[1])) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{}", e);
            exit(1);
        }
    };
    logging::init(&cfg.log_level, "memory");
    log::info!("memory starting with config {}", args[1]);

    let (ip, port) = (cfg.ip.clone(), cfg.port);
    let state = match MemoryState::new(cfg) {
        Ok(state) => Arc::new(state),
        Err(e) => {
            log::error!("memory initialization failed: {}", e);
            exit(1);
        }
    };

    match proto::serve(&ip, port, state, handlers::dispatch) {
        Ok(handle) => {
            let _ = handle.join();
        }
        Err(e) => {
            log::error!("cannot bind memory server: {}", e);
            exit(1);
        }
    }
}
