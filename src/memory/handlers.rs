use super::MemoryState;
use crate::proto::{fail, ok, reject, Envelope, MessageKind};
use serde_json::{json, Value};
use std::sync::Arc;

/// Memory service dispatch: one arm per message kind in the 10-29 ranges,
/// plus the handshake that hands out the paging geometry.
pub fn dispatch(state: &Arc<MemoryState>, envelope: Envelope) -> Value {
    match envelope.kind {
        MessageKind::Handshake => handshake(state, &envelope),
        MessageKind::FetchInstruction => fetch(state, &envelope),
        MessageKind::ObtainFrame => obtain_frame(state, &envelope),
        MessageKind::ReadMem => read(state, &envelope),
        MessageKind::WriteMem => write(state, &envelope),
        MessageKind::FreeSpace => json!({"status": "OK", "free_bytes": state.free_bytes()}),
        MessageKind::DumpMemory => with_pid(&envelope, |pid| {
            state.dump(pid).map(|path| {
                json!({"status": "OK", "file": path.to_string_lossy()})
            })
        }),
        MessageKind::InitProcess => init(state, &envelope),
        MessageKind::DestroyProcess => with_pid(&envelope, |pid| {
            state.destroy_process(pid).map(|_| ok())
        }),
        MessageKind::SuspendProcess => with_pid(&envelope, |pid| {
            state.suspend(pid).map(|_| ok())
        }),
        MessageKind::ResumeProcess => with_pid(&envelope, |pid| {
            state.resume(pid).map(|_| ok())
        }),
        other => reject(format!("operation {:?} not served by memory", other)),
    }
}

fn handshake(state: &Arc<MemoryState>, envelope: &Envelope) -> Value {
    log::info!("handshake from {}", envelope.origin);
    let g = state.geometry();
    json!({
        "status": "OK",
        "page_size": g.page_size,
        "entries_per_table": g.entries_per_table,
        "levels": g.levels,
    })
}

/// Run `op` with the mandatory `pid` field, mapping errors to the wire
/// convention.
fn with_pid(
    envelope: &Envelope,
    op: impl FnOnce(crate::Pid) -> Result<Value, super::MemError>,
) -> Value {
    let Some(pid) = envelope.field_u64("pid") else {
        return reject("missing pid");
    };
    match op(pid as crate::Pid) {
        Ok(v) => v,
        Err(e) => fail(e),
    }
}

fn init(state: &Arc<MemoryState>, envelope: &Envelope) -> Value {
    let (Some(pid), Some(size), Some(script)) = (
        envelope.field_u64("pid"),
        envelope.field_u64("size"),
        envelope.field_str("script"),
    ) else {
        return reject("init requires pid, size and script");
    };
    match state.init_process(pid as crate::Pid, size as usize, script) {
        Ok(()) => ok(),
        Err(e) => fail(e),
    }
}

fn fetch(state: &Arc<MemoryState>, envelope: &Envelope) -> Value {
    let (Some(pid), Some(pc)) = (envelope.field_u64("pid"), envelope.field_u64("pc")) else {
        return reject("fetch requires pid and pc");
    };
    match state.fetch_instruction(pid as crate::Pid, pc) {
        Ok(instruction) => json!({"status": "OK", "instruction": instruction}),
        Err(e) => fail(e),
    }
}

fn obtain_frame(state: &Arc<MemoryState>, envelope: &Envelope) -> Value {
    let (Some(pid), Some(page)) = (envelope.field_u64("pid"), envelope.field_u64("page")) else {
        return reject("obtain frame requires pid and page");
    };
    match state.obtain_frame(pid as crate::Pid, page) {
        Ok(frame) => json!({"status": "OK", "frame": frame}),
        Err(e) => fail(e),
    }
}

/// Read accepts either a physical or a logical address; logical addresses
/// go through translation first.
fn read(state: &Arc<MemoryState>, envelope: &Envelope) -> Value {
    let Some(pid) = envelope.field_u64("pid") else {
        return reject("missing pid");
    };
    let pid = pid as crate::Pid;
    let size = envelope.field_u64("size").unwrap_or(1) as usize;
    let physical = match resolve_address(state, pid, envelope) {
        Ok(addr) => addr,
        Err(resp) => return resp,
    };
    match state.read(pid, physical, size) {
        Ok(bytes) => json!({
            "status": "OK",
            "value": String::from_utf8_lossy(&bytes),
        }),
        Err(e) => fail(e),
    }
}

fn write(state: &Arc<MemoryState>, envelope: &Envelope) -> Value {
    let (Some(pid), Some(value)) = (envelope.field_u64("pid"), envelope.field_str("value")) else {
        return reject("write requires pid and value");
    };
    let pid = pid as crate::Pid;
    let value = value.to_string();
    let physical = match resolve_address(state, pid, envelope) {
        Ok(addr) => addr,
        Err(resp) => return resp,
    };
    match state.write(pid, physical, value.as_bytes()) {
        Ok(()) => ok(),
        Err(e) => fail(e),
    }
}

fn resolve_address(
    state: &Arc<MemoryState>,
    pid: crate::Pid,
    envelope: &Envelope,
) -> Result<usize, Value> {
    if let Some(addr) = envelope.field_u64("physical_address") {
        return Ok(addr as usize);
    }
    if let Some(logical) = envelope.field_u64("logical_address") {
        return state.translate(pid, logical as usize).map_err(fail);
    }
    Err(reject("missing physical_address or logical_address"))
}
