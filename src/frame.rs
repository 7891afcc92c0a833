/// Embedded auth frame
///
/// Request/response messaging with the secure auth frame. Requests go out as
/// `@w3m-app/<TYPE>` with a fresh id; the frame answers with
/// `@w3m-frame/<TYPE>_SUCCESS` or `@w3m-frame/<TYPE>_ERROR` carrying the same
/// id. Messages without an id are unsolicited frame events.
///
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::constants::{
    FRAME_APP_EVENT_KEY, FRAME_ERROR_SUFFIX, FRAME_EVENT_KEY, FRAME_MAGIC_NUMBER,
    FRAME_SUCCESS_SUFFIX,
};
use crate::error::{Error, Result};
use crate::utils::random_hex_id;

pub mod types {
    pub const CONNECT_EMAIL: &str = "CONNECT_EMAIL";
    pub const CONNECT_OTP: &str = "CONNECT_OTP";
    pub const GET_USER: &str = "GET_USER";
    pub const IS_CONNECTED: &str = "IS_CONNECTED";
    pub const SIGN_OUT: &str = "SIGN_OUT";
    pub const SWITCH_NETWORK: &str = "SWITCH_NETWORK";
    pub const RPC_REQUEST: &str = "RPC_REQUEST";

    // Unsolicited
    pub const ACCOUNTS_CHANGED: &str = "ACCOUNTS_CHANGED";
    pub const CHAIN_CHANGED: &str = "CHAIN_CHANGED";
    pub const SESSION_EXPIRED: &str = "SESSION_EXPIRED";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameMessage {
    #[serde(rename = "MAGIC_NUMBER")]
    pub magic_number: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

impl FrameMessage {
    /// App to frame request with a new correlation id.
    pub fn request(kind: &str, payload: Value) -> Self {
        Self {
            magic_number: FRAME_MAGIC_NUMBER,
            id: Some(random_hex_id()),
            message_type: format!("{FRAME_APP_EVENT_KEY}{kind}"),
            payload,
        }
    }

    pub fn reply(request: &FrameMessage, success: bool, payload: Value) -> Self {
        let kind = request
            .message_type
            .strip_prefix(FRAME_APP_EVENT_KEY)
            .unwrap_or(&request.message_type);
        let suffix = if success {
            FRAME_SUCCESS_SUFFIX
        } else {
            FRAME_ERROR_SUFFIX
        };
        Self {
            magic_number: FRAME_MAGIC_NUMBER,
            id: request.id.clone(),
            message_type: format!("{FRAME_EVENT_KEY}{kind}{suffix}"),
            payload,
        }
    }

    pub fn event(kind: &str, payload: Value) -> Self {
        Self {
            magic_number: FRAME_MAGIC_NUMBER,
            id: None,
            message_type: format!("{FRAME_EVENT_KEY}{kind}"),
            payload,
        }
    }

    /// `<TYPE>` of a frame-originated message, `None` for anything else.
    pub fn frame_kind(&self) -> Option<&str> {
        if self.magic_number != FRAME_MAGIC_NUMBER {
            return None;
        }
        self.message_type.strip_prefix(FRAME_EVENT_KEY)
    }
}

/// Transport to the frame: a `postMessage` in a browser, anything that moves
/// [`FrameMessage`]s both ways elsewhere.
#[async_trait]
pub trait FrameChannel: Send + Sync {
    async fn post(&self, message: FrameMessage) -> Result<()>;

    fn subscribe(&self) -> broadcast::Receiver<FrameMessage>;
}

#[derive(Clone)]
pub struct FrameClient {
    channel: Arc<dyn FrameChannel>,
    timeout: Duration,
}

impl FrameClient {
    pub fn new(channel: Arc<dyn FrameChannel>, timeout: Duration) -> Self {
        Self { channel, timeout }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FrameMessage> {
        self.channel.subscribe()
    }

    pub async fn request(&self, kind: &str, payload: Value) -> Result<Value> {
        let message = FrameMessage::request(kind, payload);
        let id = message.id.clone();
        let success = format!("{kind}{FRAME_SUCCESS_SUFFIX}");
        let failure = format!("{kind}{FRAME_ERROR_SUFFIX}");

        // Subscribe first so a fast reply is not missed.
        let mut replies = self.channel.subscribe();
        debug!("frame <- {} ({:?})", message.message_type, id);
        self.channel.post(message).await?;

        let wait = async {
            loop {
                let reply = match replies.recv().await {
                    Ok(reply) => reply,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Frame reply stream lagged, skipped {skipped} messages");
                        continue;
                    }
                    Err(RecvError::Closed) => {
                        return Err(Error::Transport("frame channel closed".to_string()));
                    }
                };
                if reply.id != id {
                    continue;
                }
                match reply.frame_kind() {
                    Some(k) if k == success => return Ok(reply.payload),
                    Some(k) if k == failure => {
                        return Err(Error::FrameError {
                            request: kind.to_string(),
                            message: error_message(&reply.payload),
                        });
                    }
                    _ => continue,
                }
            }
        };

        tokio::time::timeout(self.timeout, wait)
            .await
            .map_err(|_| Error::FrameTimeout(kind.to_string()))?
    }
}

fn error_message(payload: &Value) -> String {
    payload
        .get("message")
        .and_then(Value::as_str)
        .or_else(|| payload.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| payload.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockFrameChannel;
    use serde_json::json;

    #[test]
    fn envelope_shape() {
        let message = FrameMessage::request(types::GET_USER, json!({ "chainId": "eip155:1" }));
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["MAGIC_NUMBER"], FRAME_MAGIC_NUMBER);
        assert_eq!(value["type"], "@w3m-app/GET_USER");
        assert!(value["id"].is_string());

        let reply = FrameMessage::reply(&message, false, json!({ "message": "nope" }));
        assert_eq!(reply.message_type, "@w3m-frame/GET_USER_ERROR");
        assert_eq!(reply.id, message.id);
        assert_eq!(reply.frame_kind(), Some("GET_USER_ERROR"));
    }

    #[tokio::test]
    async fn matches_replies_by_id() {
        let channel = MockFrameChannel::new();
        channel.respond(types::IS_CONNECTED, Ok(json!({ "isConnected": true })));
        let client = FrameClient::new(channel.clone(), Duration::from_secs(5));
        let payload = client.request(types::IS_CONNECTED, Value::Null).await.unwrap();
        assert_eq!(payload["isConnected"], true);
        assert_eq!(channel.posted(types::IS_CONNECTED), 1);
    }

    #[tokio::test]
    async fn error_reply_is_typed() {
        let channel = MockFrameChannel::new();
        channel.respond(types::CONNECT_OTP, Err("Invalid code".to_string()));
        let client = FrameClient::new(channel, Duration::from_secs(5));
        match client.request(types::CONNECT_OTP, json!({ "otp": "000000" })).await {
            Err(Error::FrameError { request, message }) => {
                assert_eq!(request, types::CONNECT_OTP);
                assert_eq!(message, "Invalid code");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn silent_frame_times_out() {
        let channel = MockFrameChannel::new();
        let client = FrameClient::new(channel, Duration::from_secs(120));
        let err = client.request(types::GET_USER, Value::Null).await.unwrap_err();
        assert!(matches!(err, Error::FrameTimeout(ref kind) if kind == types::GET_USER));
        assert!(err.is_timeout());
    }
}
