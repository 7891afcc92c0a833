use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use log::debug;
use rand::Rng;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::constants::JSONRPC_VERSION;
use crate::error::{Error, Result};

/// Chain node client used for balance lookups. One per adapter.
#[derive(Debug)]
pub struct RpcClient {
    http: Client,
    id: AtomicU64,
}

impl Default for RpcClient {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcClient {
    pub fn new() -> Self {
        let initial: u16 = rand::thread_rng().r#gen();
        Self {
            http: Client::new(),
            id: AtomicU64::new(initial as u64),
        }
    }

    fn get_id(&self) -> String {
        let date_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() * 1_000_000)
            .unwrap_or_default();
        let extra = self.id.fetch_add(1, Ordering::Relaxed) as u128;
        (date_ns + extra).to_string()
    }

    pub async fn call(&self, url: &Url, method: &str, params: Value) -> Result<Value> {
        let request = JsonRpcRequest {
            jsonrpc: JSONRPC_VERSION,
            method: method.to_string(),
            params: Some(params),
            id: self.get_id(),
        };
        debug!("{method} -> {url}");
        let response = self
            .http
            .post(url.clone())
            .json(&request)
            .send()
            .await?
            .json::<JsonRpcResponse>()
            .await?;
        response.into_result()
    }

    /// Plain GET for REST style indexers (Esplora).
    pub async fn get_json(&self, url: Url) -> Result<Value> {
        debug!("GET {url}");
        Ok(self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json::<Value>()
            .await?)
    }
}

/// A basic JSON-RPC 2.0 request.
#[derive(Serialize)]
struct JsonRpcRequest {
    jsonrpc: &'static str,
    method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>, // Could be array or object
    id: String,
}

/// A basic JSON-RPC 2.0 response with either a result or an error.
#[derive(Deserialize, Debug)]
struct JsonRpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    fn into_result(self) -> Result<Value> {
        if let Some(error) = self.error {
            Err(error.into())
        } else if let Some(result) = self.result {
            Ok(result)
        } else {
            Err("JSON-RPC response without result or error".into())
        }
    }
}

/// A JSON-RPC error object (code, message, and optional data).
#[derive(Deserialize, Debug)]
pub struct JsonRpcError {
    code: i64,
    message: String,
}

impl From<JsonRpcError> for Error {
    fn from(error: JsonRpcError) -> Self {
        Error::ProviderRpc {
            code: error.code,
            message: error.message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_ids_are_unique() {
        let client = RpcClient::new();
        assert_ne!(client.get_id(), client.get_id());
    }

    #[test]
    fn request_shape() {
        let request = JsonRpcRequest {
            jsonrpc: JSONRPC_VERSION,
            method: "eth_getBalance".to_string(),
            params: Some(json!(["0x0", "latest"])),
            id: "1".to_string(),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["params"][1], "latest");
    }

    #[test]
    fn response_result_or_error() {
        let ok: JsonRpcResponse =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"result":"0x10"}"#).unwrap();
        assert_eq!(ok.into_result().unwrap(), json!("0x10"));

        let err: JsonRpcResponse = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32602,"message":"invalid params"}}"#,
        )
        .unwrap();
        assert!(matches!(
            err.into_result(),
            Err(Error::ProviderRpc { code: -32602, .. })
        ));

        let empty: JsonRpcResponse = serde_json::from_str(r#"{"jsonrpc":"2.0","id":1}"#).unwrap();
        assert!(empty.into_result().is_err());
    }
}
