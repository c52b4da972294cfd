pub mod config;
pub mod cpu;
pub mod iodev;
pub mod kernel;
pub mod logging;
pub mod memory;
pub mod proto;

use std::thread;
use std::time::Duration;

/// Process identifier, unique across the whole simulation and assigned
/// monotonically by the Kernel.
pub type Pid = u32;

/// Sleep used to simulate device and memory latencies. A zero delay is a
/// no-op so disabled knobs cost nothing.
pub fn simulated_delay(what: &str, ms: u64) {
    if ms == 0 {
        return;
    }
    log::debug!("applying {} delay: {} ms", what, ms);
    thread::sleep(Duration::from_millis(ms));
}
