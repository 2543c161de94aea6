use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{Result, RpcError};

/// Content type attached to every published message.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Keyword arguments of a remote call.
pub type Kwargs = Map<String, Value>;

/// Request envelope.
///
/// `method` is required on the wire. `args` and `kwargs` may be omitted by a
/// peer and decode as empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub method: String,

    #[serde(default)]
    pub args: Vec<Value>,

    #[serde(default)]
    pub kwargs: Kwargs,
}

/// Response envelope produced by the remote worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub status_code: i64,
    pub status_text: String,

    /// Result payload; `null` when absent.
    #[serde(default)]
    pub data: Value,
}

impl RpcResponse {
    /// `true` for a 2xx status code.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    /// Deserialize `data` into a concrete type.
    ///
    /// Fails with [`RpcError::InvalidResponse`] when the status is not 2xx.
    pub fn into_data<T: DeserializeOwned>(self) -> Result<T> {
        // ---
        if !self.is_success() {
            return Err(RpcError::InvalidResponse(format!(
                "remote returned {} {}",
                self.status_code, self.status_text
            )));
        }
        Ok(serde_json::from_value(self.data)?)
    }
}

/// Build a request envelope.
pub fn build_request(method: impl Into<String>, args: Vec<Value>, kwargs: Kwargs) -> RpcRequest {
    RpcRequest {
        method: method.into(),
        args,
        kwargs,
    }
}

/// Build a response envelope.
pub fn build_response(status_code: i64, status_text: impl Into<String>, data: Value) -> RpcResponse {
    RpcResponse {
        status_code,
        status_text: status_text.into(),
        data,
    }
}

pub fn encode_request(request: &RpcRequest) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(request)?))
}

pub fn decode_request(body: &[u8]) -> Result<RpcRequest> {
    Ok(serde_json::from_slice(body)?)
}

pub fn encode_response(response: &RpcResponse) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(response)?))
}

pub fn decode_response(body: &[u8]) -> Result<RpcResponse> {
    Ok(serde_json::from_slice(body)?)
}
