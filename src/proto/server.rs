use super::{reject, Envelope};
use serde_json::Value;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Dispatch function type: the whole service state travels by `Arc`, so
/// handlers never reach for process-wide globals.
pub type Dispatch<S> = fn(&Arc<S>, Envelope) -> Value;

/// Bind and spawn the accept loop. Each connection is handled on its own
/// thread: one envelope in, one response out, then the connection closes.
pub fn serve<S: Send + Sync + 'static>(
    ip: &str,
    port: u16,
    state: Arc<S>,
    dispatch: Dispatch<S>,
) -> std::io::Result<JoinHandle<()>> {
    let listener = TcpListener::bind((ip, port))?;
    log::info!("listening on {}:{}", ip, port);
    Ok(serve_listener(listener, state, dispatch))
}

/// Accept loop over an already-bound listener (lets callers bind to an
/// ephemeral port first).
pub fn serve_listener<S: Send + Sync + 'static>(
    listener: TcpListener,
    state: Arc<S>,
    dispatch: Dispatch<S>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        for conn in listener.incoming() {
            match conn {
                Ok(stream) => {
                    let state = Arc::clone(&state);
                    thread::spawn(move || handle_connection(stream, state, dispatch));
                }
                Err(e) => log::warn!("accept failed: {}", e),
            }
        }
    })
}

fn handle_connection<S>(stream: TcpStream, state: Arc<S>, dispatch: Dispatch<S>) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "?".to_string());
    let mut reader = BufReader::new(match stream.try_clone() {
        Ok(s) => s,
        Err(e) => {
            log::warn!("connection from {} unusable: {}", peer, e);
            return;
        }
    });

    let mut line = String::new();
    if let Err(e) = reader.read_line(&mut line) {
        log::warn!("read from {} failed: {}", peer, e);
        return;
    }
    if line.trim().is_empty() {
        return;
    }

    // Malformed envelopes get an error response and mutate nothing.
    let response = match serde_json::from_str::<Envelope>(line.trim()) {
        Ok(envelope) => {
            log::debug!(
                "request from {} ({:?} / {})",
                envelope.origin,
                envelope.kind,
                envelope.operation
            );
            dispatch(&state, envelope)
        }
        Err(e) => reject(format!("invalid envelope: {}", e)),
    };

    write_response(stream, &response, &peer);
}

fn write_response(mut stream: TcpStream, response: &Value, peer: &str) {
    let mut text = response.to_string();
    text.push('\n');
    if let Err(e) = stream.write_all(text.as_bytes()) {
        log::warn!("reply to {} failed: {}", peer, e);
    }
}
