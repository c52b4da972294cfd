use super::KernelState;
use crate::proto::{ok, reject, Envelope, MessageKind};
use serde_json::{json, Value};
use std::sync::Arc;

/// Kernel dispatch: the handshake that registers peers, plus the
/// operation messages I/O devices send back.
pub fn dispatch(state: &Arc<KernelState>, envelope: Envelope) -> Value {
    match envelope.kind {
        MessageKind::Handshake => handshake(state, &envelope),
        MessageKind::Operation => operation(state, &envelope),
        other => reject(format!("operation {:?} not served by kernel", other)),
    }
}

/// Classify the peer by its `type`: `IO...` registers a device, `CPU` a
/// worker. Anything else is a generic hello.
fn handshake(state: &Arc<KernelState>, envelope: &Envelope) -> Value {
    log::info!("handshake from {}", envelope.origin);
    let peer_type = envelope.field_str("type").unwrap_or_default().to_string();

    if peer_type.starts_with("IO") {
        return register_io(state, envelope, &peer_type);
    }
    if peer_type == "CPU" {
        return register_cpu(state, envelope);
    }
    ok()
}

fn register_io(state: &Arc<KernelState>, envelope: &Envelope, peer_type: &str) -> Value {
    let (Some(ip), Some(port)) = (envelope.field_str("ip"), envelope.field_u64("port")) else {
        return reject("incomplete io handshake");
    };
    let name = envelope
        .field_str("name")
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| peer_type.trim_start_matches("IO").to_string());
    if name.is_empty() {
        return reject("io handshake without a device name");
    }

    let client = match crate::proto::RpcClient::new(ip, port as u16, &format!("Kernel->{}", name)) {
        Ok(c) => c,
        Err(e) => return reject(format!("unusable io address: {}", e)),
    };
    state.io.register(&name, peer_type, client);
    json!({"status": "OK", "message": format!("io '{}' registered", name)})
}

fn register_cpu(state: &Arc<KernelState>, envelope: &Envelope) -> Value {
    let (Some(ip), Some(port)) = (envelope.field_str("ip"), envelope.field_u64("port")) else {
        return reject("incomplete cpu handshake");
    };
    let identifier = envelope
        .field_str("identifier")
        .filter(|i| !i.is_empty())
        .unwrap_or(&envelope.origin)
        .to_string();

    match state.register_cpu(&identifier, ip, port as u16) {
        Ok(()) => json!({"status": "OK", "message": format!("cpu '{}' registered", identifier)}),
        Err(e) => reject(format!("unusable cpu address: {}", e)),
    }
}

/// Operation messages: I/O devices report completion here.
fn operation(state: &Arc<KernelState>, envelope: &Envelope) -> Value {
    match envelope.operation.as_str() {
        "IO_COMPLETED" => {
            let Some(pid) = envelope.field_u64("pid") else {
                return reject("io completion without pid");
            };
            state.io_complete(pid as crate::Pid);
            ok()
        }
        other => reject(format!("unknown kernel operation '{}'", other)),
    }
}
