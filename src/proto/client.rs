use super::{response_error, Envelope, MessageKind, ProtoError, ProtoResult};
use serde_json::Value;
use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Default per-call timeout for connect, read and write.
const CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Client half of the inter-service RPC. Each call opens its own
/// connection, sends one envelope and waits for one response line.
pub struct RpcClient {
    addr: SocketAddr,
    name: String,
    timeout: Duration,
}

impl RpcClient {
    /// `name` identifies the sender in the envelope `origin` field,
    /// e.g. `"Kernel->Memory"`.
    pub fn new(ip: &str, port: u16, name: &str) -> ProtoResult<Self> {
        let addr = (ip, port)
            .to_socket_addrs()
            .map_err(ProtoError::Io)?
            .next()
            .ok_or_else(|| ProtoError::Malformed(format!("unresolvable address {}:{}", ip, port)))?;
        Ok(RpcClient {
            addr,
            name: name.to_string(),
            timeout: CALL_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Send one envelope and return the decoded response. A response that
    /// carries an error payload becomes `ProtoError::Remote`.
    pub fn call(&self, kind: MessageKind, operation: &str, data: Value) -> ProtoResult<Value> {
        let response = self.call_raw(kind, operation, data)?;
        if let Some(msg) = response_error(&response) {
            return Err(ProtoError::Remote(msg));
        }
        Ok(response)
    }

    /// Like `call`, but hands back error payloads untouched so the caller
    /// can inspect them.
    pub fn call_raw(&self, kind: MessageKind, operation: &str, data: Value) -> ProtoResult<Value> {
        let envelope = Envelope::new(kind, operation, &self.name, data);
        let mut line = serde_json::to_string(&envelope)
            .map_err(|e| ProtoError::Malformed(e.to_string()))?;
        line.push('\n');

        let stream = TcpStream::connect_timeout(&self.addr, self.timeout).map_err(ProtoError::Io)?;
        stream
            .set_read_timeout(Some(self.timeout))
            .map_err(ProtoError::Io)?;
        stream
            .set_write_timeout(Some(self.timeout))
            .map_err(ProtoError::Io)?;

        let mut writer = stream.try_clone().map_err(ProtoError::Io)?;
        writer.write_all(line.as_bytes()).map_err(ProtoError::Io)?;
        writer.flush().map_err(ProtoError::Io)?;

        let mut reader = BufReader::new(stream);
        let mut reply = String::new();
        reader.read_line(&mut reply).map_err(ProtoError::Io)?;
        if reply.trim().is_empty() {
            return Err(ProtoError::Malformed("empty response".to_string()));
        }
        serde_json::from_str(reply.trim()).map_err(|e| ProtoError::Malformed(e.to_string()))
    }

    /// Operation shorthand: `Operation` kind with a named operation.
    pub fn operation(&self, operation: &str, data: Value) -> ProtoResult<Value> {
        self.call(MessageKind::Operation, operation, data)
    }

    /// Handshake doubles as the liveness probe.
    pub fn handshake(&self, data: Value) -> ProtoResult<Value> {
        self.call(MessageKind::Handshake, "handshake", data)
    }

    /// Keep handshaking until the peer answers; used by workers and
    /// devices registering against services that may start later.
    pub fn handshake_with_retry(&self, data: Value, wait: Duration) -> Value {
        let mut attempt = 1u32;
        loop {
            match self.handshake(data.clone()) {
                Ok(reply) => {
                    log::info!("connection established with {}", self.name);
                    return reply;
                }
                Err(e) => {
                    log::warn!(
                        "handshake with {} failed (attempt {}): {}",
                        self.name,
                        attempt,
                        e
                    );
                    attempt += 1;
                    std::thread::sleep(wait);
                }
            }
        }
    }
}
