use exos::config::{self, CpuConfig};
use exos::cpu::{cache::CachePolicy, handlers, mmu::RpcMemoryPort, tlb::TlbPolicy, CpuState};
use exos::memory::tables::Geometry;
use exos::proto::RpcClient;
use exos::{logging, proto};
use serde_json::json;
use std::path::Path;
use std::process::exit;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const HANDSHAKE_RETRY: Duration = Duration::from_secs(2);

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        eprintln!("usage: {} <identifier> [config]", args[0]);
        exit(1);
    }
    let identifier = args[1].clone();
    let config_path = args
        .get(2)
        .cloned()
        .unwrap_or_else(|| "configs/cpu.json".to_string());

    let cfg: CpuConfig = match config::load(Path::new(&config_path)) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{}", e);
            exit(1);
        }
    };
    let logger_name = if identifier.starts_with("CPU") {
        identifier.clone()
    } else {
        format!("CPU-{}", identifier)
    };
    logging::init(&cfg.log_level, &logger_name);
    log::info!("cpu {} starting with config {}", identifier, config_path);

    let memory_client = match RpcClient::new(&cfg.memory_ip, cfg.memory_port, "CPU->Memory") {
        Ok(c) => c,
        Err(e) => {
            log::error!("bad memory address: {}", e);
            exit(1);
        }
    };

    // The paging geometry travels in Memory's handshake reply.
    let hello = json!({
        "name": "CPU",
        "type": "CPU",
        "ip": cfg.ip,
        "port": cfg.port,
        "identifier": identifier,
    });
    let reply = memory_client.handshake_with_retry(hello.clone(), HANDSHAKE_RETRY);
    let geometry = match (
        reply["page_size"].as_u64(),
        reply["entries_per_table"].as_u64(),
        reply["levels"].as_u64(),
    ) {
        (Some(page_size), Some(entries), Some(levels)) => Geometry {
            page_size: page_size as usize,
            entries_per_table: entries as usize,
            levels: levels as usize,
        },
        _ => {
            log::error!("memory handshake reply carries no paging geometry");
            exit(1);
        }
    };
    log::info!(
        "paging geometry: page {} bytes, {} entries, {} levels",
        geometry.page_size,
        geometry.entries_per_table,
        geometry.levels
    );

    let state = Arc::new(CpuState::new(
        &identifier,
        geometry,
        cfg.tlb_entries,
        TlbPolicy::parse(&cfg.tlb_replacement),
        cfg.cache_entries,
        CachePolicy::parse(&cfg.cache_replacement),
        cfg.cache_delay,
        Arc::new(RpcMemoryPort::new(memory_client)),
    ));

    let server = match proto::serve(&cfg.ip, cfg.port, state, handlers::dispatch) {
        Ok(handle) => handle,
        Err(e) => {
            log::error!("cannot bind cpu server: {}", e);
            exit(1);
        }
    };

    // Register with the Kernel once the Execute endpoint is up.
    let kernel_client = match RpcClient::new(&cfg.kernel_ip, cfg.kernel_port, "CPU->Kernel") {
        Ok(c) => c,
        Err(e) => {
            log::error!("bad kernel address: {}", e);
            exit(1);
        }
    };
    thread::spawn(move || {
        kernel_client.handshake_with_retry(hello, HANDSHAKE_RETRY);
    });

    let _ = server.join();
}
