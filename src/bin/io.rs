use exos::config::{self, IoConfig};
use exos::iodev::{dispatch, IoDevice};
use exos::proto::RpcClient;
use exos::{logging, proto};
use std::path::Path;
use std::process::exit;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const HANDSHAKE_RETRY: Duration = Duration::from_secs(2);

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        eprintln!("usage: {} <device_name> <config>", args[0]);
        eprintln!("example: {} DISCO configs/io.json", args[0]);
        exit(1);
    }
    let device_name = args[1].clone();

    let cfg: IoConfig = match config::load(Path::new(&args[2])) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{}", e);
            exit(1);
        }
    };
    logging::init(&cfg.log_level, &format!("IO-{}", device_name));
    log::info!("io device {} starting", device_name);

    let kernel_client = match RpcClient::new(&cfg.kernel_ip, cfg.kernel_port, "IO->Kernel") {
        Ok(c) => c,
        Err(e) => {
            log::error!("bad kernel address: {}", e);
            exit(1);
        }
    };
    let device = Arc::new(IoDevice::new(&device_name, cfg.base_delay, kernel_client));
    let hello = device.handshake_data(&cfg.ip, cfg.port);

    let server = match proto::serve(&cfg.ip, cfg.port, Arc::clone(&device), dispatch) {
        Ok(handle) => handle,
        Err(e) => {
            log::error!("cannot bind io server: {}", e);
            exit(1);
        }
    };

    let register_client = match RpcClient::new(&cfg.kernel_ip, cfg.kernel_port, "IO->Kernel") {
        Ok(c) => c,
        Err(e) => {
            log::error!("bad kernel address: {}", e);
            exit(1);
        }
    };
    thread::spawn(move || {
        register_client.handshake_with_retry(hello, HANDSHAKE_RETRY);
    });

    let _ = server.join();
}
