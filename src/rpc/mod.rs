//! Request surface: line-delimited JSON-RPC 2.0 over stdin/stdout.
//!
//! Each incoming line is one request; responses are serialized through a
//! single writer task so concurrent method calls never interleave bytes.
//! Method availability is fixed at construction by the allow/deny lists;
//! unknown methods are rejected, never dynamically loaded.

pub mod methods;

use crate::error::VoiceError;
use methods::RpcHandler;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// JSON-RPC request envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// JSON-RPC error object.
#[derive(Debug, Clone, Serialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl From<&VoiceError> for RpcError {
    fn from(error: &VoiceError) -> Self {
        let kind = error.kind();
        Self {
            code: kind.rpc_code(),
            message: error.to_string(),
            data: Some(serde_json::json!({"kind": kind.as_str()})),
        }
    }
}

/// JSON-RPC response envelope.
#[derive(Debug, Clone, Serialize)]
pub struct RpcResponse {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, error: RpcError) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// Method-not-found per JSON-RPC.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// Parse error per JSON-RPC.
pub const PARSE_ERROR: i64 = -32700;

/// Serve requests from stdin until EOF or cancellation.
///
/// # Errors
///
/// Returns an error only on I/O failure of the stdio pipes themselves;
/// RPC-level failures become error responses.
pub async fn serve_stdio(handler: Arc<RpcHandler>, cancel: CancellationToken) -> std::io::Result<()> {
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    // Single writer: responses funnel through this channel.
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = out_rx.recv().await {
            if stdout.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if stdout.write_all(b"\n").await.is_err() {
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    info!("request surface serving on stdio");
    loop {
        let line = tokio::select! {
            () = cancel.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        let request: RpcRequest = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(e) => {
                debug!("unparseable request: {e}");
                let response = RpcResponse::failure(
                    Value::Null,
                    RpcError {
                        code: PARSE_ERROR,
                        message: format!("parse error: {e}"),
                        data: None,
                    },
                );
                send_response(&out_tx, &response);
                continue;
            }
        };

        let Some(id) = request.id.clone() else {
            // Notifications get no reply; we still execute them.
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                let _ = handler.dispatch(&request.method, request.params).await;
            });
            continue;
        };

        let handler = Arc::clone(&handler);
        let out_tx = out_tx.clone();
        tokio::spawn(async move {
            let response = match handler.dispatch(&request.method, request.params).await {
                Ok(result) => RpcResponse::success(id, result),
                Err(e) => RpcResponse::failure(id, e),
            };
            send_response(&out_tx, &response);
        });
    }

    drop(out_tx);
    let _ = writer.await;
    info!("request surface stopped");
    Ok(())
}

fn send_response(out_tx: &mpsc::UnboundedSender<String>, response: &RpcResponse) {
    match serde_json::to_string(response) {
        Ok(line) => {
            let _ = out_tx.send(line);
        }
        Err(e) => error!("cannot serialize response: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_parses_minimal_shape() {
        let request: RpcRequest =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"method":"status"}"#).unwrap();
        assert_eq!(request.method, "status");
        assert_eq!(request.id, Some(serde_json::json!(1)));
        assert!(request.params.is_null());
    }

    #[test]
    fn error_response_carries_kind() {
        let error = VoiceError::Busy("caller busy".into());
        let rpc: RpcError = (&error).into();
        assert_eq!(rpc.code, -32001);
        assert_eq!(
            rpc.data.unwrap()["kind"],
            serde_json::json!("busy")
        );
    }

    #[test]
    fn response_serializes_result_xor_error() {
        let ok = RpcResponse::success(serde_json::json!(7), serde_json::json!({"x": 1}));
        let text = serde_json::to_string(&ok).unwrap();
        assert!(text.contains("\"result\""));
        assert!(!text.contains("\"error\""));

        let err = RpcResponse::failure(
            serde_json::json!(8),
            RpcError {
                code: METHOD_NOT_FOUND,
                message: "no such method".into(),
                data: None,
            },
        );
        let text = serde_json::to_string(&err).unwrap();
        assert!(text.contains("\"error\""));
        assert!(!text.contains("\"result\""));
    }
}
