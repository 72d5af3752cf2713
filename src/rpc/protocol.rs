//! RPC wire bodies.
//!
//! Requests go to `$SRV.<service>.<method>` as JSON `{id, method, args}`;
//! replies come back as `{id, success, result?, error?}`.

use crate::error::{Error, Result};
use crate::subject::validate_token;
use crate::types::Message;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Namespace of RPC request subjects.
pub const SERVICE_PREFIX: &str = "$SRV";

/// An RPC request body.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub args: Value,
}

/// An RPC response body.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RpcResponse {
    pub fn ok(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            success: false,
            result: None,
            error: Some(error.into()),
        }
    }
}

/// Subject a request for `service.method` is published on.
pub fn service_subject(service: &str, method: &str) -> Result<String> {
    validate_token(service)?;
    validate_token(method)?;
    Ok(format!("{SERVICE_PREFIX}.{service}.{method}"))
}

/// Pattern covering every method of a service.
pub fn service_pattern(service: &str) -> Result<String> {
    validate_token(service)?;
    Ok(format!("{SERVICE_PREFIX}.{service}.>"))
}

/// Decode a reply into the call's result.
pub fn decode_reply(request_id: &str, reply: &Message) -> Result<Value> {
    let response: RpcResponse = serde_json::from_slice(&reply.payload)
        .map_err(|e| Error::Malformed(format!("RPC response: {e}")))?;

    if response.id != request_id {
        return Err(Error::Malformed(format!(
            "RPC response id {} does not match request {}",
            response.id, request_id
        )));
    }
    if !response.success {
        return Err(Error::Server(
            response.error.unwrap_or_else(|| "unknown error".to_string()),
        ));
    }
    Ok(response.result.unwrap_or(Value::Null))
}
