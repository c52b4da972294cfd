use crate::proto::{ok, reject, Envelope, MessageKind, RpcClient};
use crate::simulated_delay;
use serde_json::{json, Value};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// One timed blocking device. Each IO_REQUEST sleeps for the requested
/// time and then reports completion back to the Kernel from its own
/// thread.
pub struct IoDevice {
    name: String,
    base_delay: u64,
    kernel: RpcClient,
}

impl IoDevice {
    pub fn new(name: &str, base_delay: u64, kernel: RpcClient) -> Self {
        IoDevice {
            name: name.to_string(),
            base_delay,
            kernel,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Handshake payload presented to the Kernel: the device type is the
    /// name with the `IO` prefix.
    pub fn handshake_data(&self, ip: &str, port: u16) -> Value {
        json!({
            "name": self.name,
            "type": format!("IO{}", self.name),
            "ip": ip,
            "port": port,
        })
    }

}

/// Run one timed operation on its own thread and notify the Kernel when it
/// ends.
fn serve_request(device: &Arc<IoDevice>, pid: crate::Pid, time: u64) {
    let device = Arc::clone(device);
    thread::spawn(move || {
        log::info!("pid {} - io started - {} ms", pid, time);
        simulated_delay("io base", device.base_delay);
        thread::sleep(Duration::from_millis(time));
        log::info!("pid {} - io finished", pid);

        if let Err(e) = device.kernel.operation("IO_COMPLETED", json!({"pid": pid})) {
            log::error!("pid {} - completion notification failed: {}", pid, e);
        }
    });
}

/// Device dispatch: handshakes and IO_REQUEST operations.
pub fn dispatch(state: &Arc<IoDevice>, envelope: Envelope) -> Value {
    match envelope.kind {
        MessageKind::Handshake => {
            log::info!("handshake from {}", envelope.origin);
            ok()
        }
        MessageKind::Operation if envelope.operation == "IO_REQUEST" => {
            let (Some(pid), Some(time)) =
                (envelope.field_u64("pid"), envelope.field_u64("time"))
            else {
                return reject("io request needs pid and time");
            };
            serve_request(state, pid as crate::Pid, time);
            ok()
        }
        _ => reject(format!(
            "operation '{}' not served by io device",
            envelope.operation
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> Arc<IoDevice> {
        let kernel = RpcClient::new("127.0.0.1", 9, "IO->Kernel").unwrap();
        Arc::new(IoDevice::new("DISCO", 0, kernel))
    }

    #[test]
    fn handshake_data_carries_the_io_type() {
        let dev = device();
        let data = dev.handshake_data("127.0.0.1", 8030);
        assert_eq!(data["type"], "IODISCO");
        assert_eq!(data["name"], "DISCO");
        assert_eq!(data["port"], 8030);
    }

    #[test]
    fn io_request_needs_both_fields() {
        let dev = device();
        let reply = dispatch(
            &dev,
            Envelope::new(MessageKind::Operation, "IO_REQUEST", "Kernel", json!({"pid": 1})),
        );
        assert_eq!(reply["status"], "ERROR");

        let reply = dispatch(
            &dev,
            Envelope::new(
                MessageKind::Operation,
                "IO_REQUEST",
                "Kernel",
                json!({"pid": 1, "time": 0}),
            ),
        );
        assert_eq!(reply["status"], "OK");
    }

    #[test]
    fn unknown_operations_are_rejected() {
        let dev = device();
        let reply = dispatch(
            &dev,
            Envelope::new(MessageKind::Execute, "EXECUTE", "Kernel", json!({})),
        );
        assert_eq!(reply["status"], "ERROR");
    }
}
