use serde::{Deserialize, Serialize};

// ── JSON-RPC 2.0 error codes ──────────────────────────────────────────────

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_PARAMS: i32 = -32602;
pub const METHOD_NOT_FOUND: i32 = -32601;
/// The model handle raised while generating.
pub const INFERENCE_ERROR: i32 = -32000;

// ── Method names ──────────────────────────────────────────────────────────

pub const METHOD_GENERATE: &str = "generate";
pub const NOTIFY_READY: &str = "worker/ready";

// ── JSON-RPC 2.0 framing ──────────────────────────────────────────────────

/// Incoming JSON-RPC message as seen by a worker.
#[derive(Debug, Deserialize)]
pub struct JsonRpcIncoming {
    #[allow(dead_code)]
    pub jsonrpc: String,
    pub id: Option<u64>,
    pub method: Option<String>,
    pub params: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct JsonRpcRequest<'a, P: Serialize> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    pub params: P,
}

impl<'a, P: Serialize> JsonRpcRequest<'a, P> {
    pub fn new(id: u64, method: &'a str, params: P) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: &'static str,
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: &'static str,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Anything a worker writes to stdout, as read back by the pool.
///
/// Responses carry an `id`; notifications carry a `method` and no `id`.
#[derive(Debug, Deserialize)]
pub struct WorkerMessage {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<serde_json::Value>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

// ── Worker payloads (camelCase on the wire) ───────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateParams {
    pub prompt: String,
}

/// Result of one `generate` call, as executed inside a worker process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GenerateOutput {
    pub text: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub worker_pid: u32,
    /// 1-based count of `generate` invocations on this worker.
    pub call_index: u64,
    pub started_at_ms: u64,
    pub finished_at_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerReady {
    pub pid: u32,
    pub backend: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serializes_with_jsonrpc_envelope() {
        let req = JsonRpcRequest::new(
            7,
            METHOD_GENERATE,
            GenerateParams {
                prompt: "What is 2+2?".into(),
            },
        );
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["id"], 7);
        assert_eq!(value["method"], "generate");
        assert_eq!(value["params"]["prompt"], "What is 2+2?");
    }

    #[test]
    fn worker_message_distinguishes_notifications_from_responses() {
        let ready: WorkerMessage = serde_json::from_str(
            r#"{"jsonrpc":"2.0","method":"worker/ready","params":{"pid":42,"backend":"echo"}}"#,
        )
        .unwrap();
        assert!(ready.id.is_none());
        assert_eq!(ready.method.as_deref(), Some(NOTIFY_READY));

        let failed: WorkerMessage = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":3,"error":{"code":-32000,"message":"boom"}}"#,
        )
        .unwrap();
        assert_eq!(failed.id, Some(3));
        let error = failed.error.unwrap();
        assert_eq!(error.code, INFERENCE_ERROR);
        assert_eq!(error.message, "boom");
    }

    #[test]
    fn generate_output_uses_camel_case() {
        let output = GenerateOutput {
            text: "hi".into(),
            prompt_tokens: 1,
            completion_tokens: 2,
            worker_pid: 10,
            call_index: 1,
            started_at_ms: 100,
            finished_at_ms: 150,
        };
        let value = serde_json::to_value(&output).unwrap();
        assert_eq!(value["workerPid"], 10);
        assert_eq!(value["callIndex"], 1);
        assert_eq!(value["startedAtMs"], 100);
    }
}
