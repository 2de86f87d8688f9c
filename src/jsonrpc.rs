use std::sync::Arc;
use std::time::Duration;

use alloy::signers::local::PrivateKeySigner;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::Value;
use url::Url;

use crate::signature::{self, SIGNATURE_HEADER};

pub const JSONRPC_VERSION: &str = "2.0";

pub const CODE_INVALID_REQUEST: i64 = -32602;
pub const CODE_RATE_LIMITED: i64 = -32005;

/// Incoming JSON-RPC envelope. Params are kept raw so accepted requests can
/// be forwarded byte-identical to peers.
#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default)]
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Option<Box<RawValue>>,
}

#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: &'static str,
    pub id: Option<Value>,
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: Some(Value::Null),
            error: None,
        }
    }

    pub fn error(id: Option<Value>, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn body_too_large(max_size: usize) -> Self {
        Self {
            code: CODE_INVALID_REQUEST,
            message: format!("Request body too large, max body size {max_size}"),
            data: None,
        }
    }

    pub fn invalid_json(detail: impl ToString) -> Self {
        Self {
            code: CODE_INVALID_REQUEST,
            message: "Invalid JSON request".to_string(),
            data: Some(Value::String(detail.to_string())),
        }
    }

    pub fn invalid_params(detail: impl ToString) -> Self {
        Self {
            code: CODE_INVALID_REQUEST,
            message: "Invalid request params".to_string(),
            data: Some(Value::String(detail.to_string())),
        }
    }

    pub fn method_not_found() -> Self {
        Self {
            code: CODE_INVALID_REQUEST,
            message: "Method not found".to_string(),
            data: None,
        }
    }

    pub fn signature_not_set() -> Self {
        Self {
            code: CODE_INVALID_REQUEST,
            message: format!("Signature header not set {SIGNATURE_HEADER}"),
            data: None,
        }
    }

    pub fn signature_not_correct(detail: impl ToString) -> Self {
        Self {
            code: CODE_INVALID_REQUEST,
            message: "Request signature is not correct".to_string(),
            data: Some(Value::String(detail.to_string())),
        }
    }

    pub fn unknown_peer() -> Self {
        Self {
            code: CODE_INVALID_REQUEST,
            message: "Unknown peer".to_string(),
            data: None,
        }
    }

    pub fn too_many_requests() -> Self {
        Self {
            code: CODE_RATE_LIMITED,
            message: "Too many requests".to_string(),
            data: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct JsonRpcCall<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: &'a RawValue,
}

#[derive(Debug, thiserror::Error)]
pub enum RpcClientError {
    #[error("failed to serialize call: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to sign call: {0}")]
    Sign(#[from] signature::SignatureError),
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("http status {0}")]
    Status(reqwest::StatusCode),
    #[error("rpc error {}: {}", .0.code, .0.message)]
    Rpc(JsonRpcError),
}

#[derive(Debug, Deserialize)]
struct CallReply {
    #[serde(default)]
    error: Option<JsonRpcError>,
}

/// JSON-RPC client for downstream POSTs (local builder, peers, archive).
/// When a signer is attached every outgoing body carries a signature header.
#[derive(Clone)]
pub struct RpcClient {
    url: Url,
    client: reqwest::Client,
    signer: Option<Arc<PrivateKeySigner>>,
}

impl RpcClient {
    pub fn new(url: Url, client: reqwest::Client) -> Self {
        Self {
            url,
            client,
            signer: None,
        }
    }

    pub fn with_signer(mut self, signer: Arc<PrivateKeySigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Serializes a call with raw params and POSTs it, returning an error on
    /// transport failure, non-2xx status, or a JSON-RPC error reply.
    pub async fn call(
        &self,
        method: &str,
        params: &RawValue,
        timeout: Duration,
    ) -> Result<(), RpcClientError> {
        let body = serde_json::to_vec(&JsonRpcCall {
            jsonrpc: JSONRPC_VERSION,
            id: 1,
            method,
            params,
        })?;

        let mut request = self
            .client
            .post(self.url.clone())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .timeout(timeout);
        if let Some(signer) = &self.signer {
            request = request.header(SIGNATURE_HEADER, signature::sign(signer, &body)?);
        }

        let response = request.body(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(RpcClientError::Status(status));
        }

        // Tolerate bodies that are not valid envelopes; only a well-formed
        // error reply fails the call.
        if let Ok(reply) = response.json::<CallReply>().await {
            if let Some(error) = reply.error {
                return Err(RpcClientError::Rpc(error));
            }
        }
        Ok(())
    }
}
