use std::io::{self, Write};

use crate::protocol::{JsonRpcError, JsonRpcNotification, JsonRpcResponse};

/// NDJSON writer for the worker side of the JSON-RPC 2.0 protocol.
///
/// One JSON object per line. Writes to stdout in a real worker; tests hand it
/// an in-memory buffer.
pub struct NdjsonTransport<W: Write = io::Stdout> {
    out: W,
}

impl Default for NdjsonTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl NdjsonTransport {
    /// Create a transport over the process's stdout.
    pub fn new() -> Self {
        Self { out: io::stdout() }
    }
}

impl<W: Write> NdjsonTransport<W> {
    pub fn with_writer(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    /// Write a successful JSON-RPC response.
    pub fn write_response(&mut self, id: u64, result: serde_json::Value) {
        let msg = JsonRpcResponse {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        };
        self.write_line(&msg);
    }

    /// Write a JSON-RPC error response.
    pub fn write_error(&mut self, id: u64, code: i32, message: impl Into<String>) {
        let msg = JsonRpcResponse {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        };
        self.write_line(&msg);
    }

    /// Write a JSON-RPC notification (no id).
    pub fn write_notification(&mut self, method: &str, params: serde_json::Value) {
        let msg = JsonRpcNotification {
            jsonrpc: "2.0",
            method: method.to_string(),
            params: Some(params),
        };
        self.write_line(&msg);
    }

    fn write_line(&mut self, value: &impl serde::Serialize) {
        if let Err(e) = serde_json::to_writer(&mut self.out, value) {
            tracing::error!("Failed to serialize message: {}", e);
            return;
        }
        if let Err(e) = writeln!(self.out) {
            tracing::error!("Failed to write newline: {}", e);
        }
        if let Err(e) = self.out.flush() {
            tracing::error!("Failed to flush output: {}", e);
        }
    }
}
