//! Embedded auth connector: email/OTP login through the secure frame, with
//! the frame holding the keys and answering RPC requests.

use std::sync::Mutex;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::caip::{CaipNetworkId, ChainNamespace};
use crate::connector::{ConnectParams, ConnectResult, ConnectorEvent};
use crate::constants::EMBEDDED_AUTH_CONNECTOR_ID;
use crate::error::{Error, Result};
use crate::frame::{FrameClient, FrameMessage, types};
use crate::network::CaipNetwork;
use crate::provider::methods;

/// Next step the frame asks for after `CONNECT_EMAIL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EmailAction {
    VerifyDevice,
    VerifyOtp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameUser {
    #[serde(default)]
    pub email: Option<String>,
    pub address: String,
    #[serde(rename = "chainId")]
    pub chain_id: Value,
}

pub struct EmbeddedAuthConnector {
    namespace: ChainNamespace,
    frame: FrameClient,
    session: Mutex<Option<(String, CaipNetworkId)>>,
}

impl EmbeddedAuthConnector {
    pub fn new(namespace: ChainNamespace, frame: FrameClient) -> Self {
        Self {
            namespace,
            frame,
            session: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        EMBEDDED_AUTH_CONNECTOR_ID
    }

    pub fn name(&self) -> &str {
        "Email Wallet"
    }

    pub fn namespace(&self) -> ChainNamespace {
        self.namespace
    }

    pub fn frame(&self) -> &FrameClient {
        &self.frame
    }

    fn lock_session(&self) -> std::sync::MutexGuard<'_, Option<(String, CaipNetworkId)>> {
        match self.session.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub async fn connect_email(&self, email: &str) -> Result<EmailAction> {
        let response = self
            .frame
            .request(types::CONNECT_EMAIL, json!({ "email": email }))
            .await?;
        let action = response
            .get("action")
            .cloned()
            .ok_or("CONNECT_EMAIL reply without an action")?;
        Ok(serde_json::from_value(action)?)
    }

    pub async fn connect_otp(&self, otp: &str) -> Result<()> {
        self.frame
            .request(types::CONNECT_OTP, json!({ "otp": otp }))
            .await?;
        Ok(())
    }

    pub async fn get_user(&self, network: &CaipNetworkId) -> Result<FrameUser> {
        let response = self
            .frame
            .request(types::GET_USER, json!({ "chainId": network.to_string() }))
            .await?;
        Ok(serde_json::from_value(response)?)
    }

    pub async fn is_connected(&self) -> Result<bool> {
        let response = self.frame.request(types::IS_CONNECTED, Value::Null).await?;
        Ok(response
            .get("isConnected")
            .and_then(Value::as_bool)
            .unwrap_or(false))
    }

    pub async fn sign_out(&self) -> Result<()> {
        self.frame.request(types::SIGN_OUT, Value::Null).await?;
        Ok(())
    }

    pub async fn rpc_request(&self, method: &str, params: Value) -> Result<Value> {
        let chain_id = self.lock_session().as_ref().map(|(_, id)| id.to_string());
        self.frame
            .request(
                types::RPC_REQUEST,
                json!({ "method": method, "params": params, "chainId": chain_id }),
            )
            .await
    }

    /// Resolves once the frame reports an authenticated user.
    pub async fn connect(&self, params: &ConnectParams) -> Result<ConnectResult> {
        info!("Fetching embedded wallet user for {}", params.network.id);
        let user = self.get_user(&params.network.id).await?;
        self.adopt(user, &params.network.id)
    }

    pub async fn reconnect(&self, params: &ConnectParams) -> Result<ConnectResult> {
        if !self.is_connected().await? {
            return Err(Error::NotConnected(self.namespace));
        }
        self.connect(params).await
    }

    fn adopt(&self, user: FrameUser, requested: &CaipNetworkId) -> Result<ConnectResult> {
        let chain_id = chain_from_frame(self.namespace, &user.chain_id)
            .unwrap_or_else(|| requested.clone());
        *self.lock_session() = Some((user.address.clone(), chain_id.clone()));
        Ok(ConnectResult {
            address: user.address,
            chain_id,
        })
    }

    pub async fn disconnect(&self) -> Result<()> {
        if self.lock_session().take().is_none() {
            return Ok(());
        }
        self.sign_out().await
    }

    pub async fn sign_message(&self, message: &str, address: &str) -> Result<String> {
        let response = match self.namespace {
            ChainNamespace::Solana => {
                self.rpc_request(
                    "solana_signMessage",
                    json!({ "message": bs58::encode(message).into_string(), "pubkey": address }),
                )
                .await?
            }
            _ => {
                let hex_message = format!("0x{}", alloy::hex::encode(message.as_bytes()));
                self.rpc_request(methods::PERSONAL_SIGN, json!([hex_message, address]))
                    .await?
            }
        };
        string_field(response, "signature")
    }

    pub async fn send_transaction(&self, transaction: Value) -> Result<String> {
        let response = match self.namespace {
            ChainNamespace::Solana => {
                self.rpc_request(
                    "solana_signAndSendTransaction",
                    json!({ "transaction": transaction }),
                )
                .await?
            }
            _ => {
                self.rpc_request(methods::ETH_SEND_TRANSACTION, json!([transaction]))
                    .await?
            }
        };
        string_field(response, "signature")
    }

    pub async fn switch_network(&self, network: &CaipNetwork) -> Result<()> {
        let response = self
            .frame
            .request(types::SWITCH_NETWORK, json!({ "chainId": network.id.to_string() }))
            .await?;
        let chain_id = response
            .get("chainId")
            .and_then(|c| chain_from_frame(self.namespace, c))
            .unwrap_or_else(|| network.id.clone());
        debug!("Embedded wallet switched to {chain_id}");
        if let Some((_, active)) = self.lock_session().as_mut() {
            *active = chain_id;
        }
        Ok(())
    }

    pub fn translate_event(message: FrameMessage) -> Option<ConnectorEvent> {
        if message.id.is_some() {
            return None;
        }
        match message.frame_kind()? {
            types::ACCOUNTS_CHANGED => {
                let accounts = match message.payload.get("accounts").and_then(Value::as_array) {
                    Some(list) => list
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect(),
                    None => message
                        .payload
                        .get("address")
                        .and_then(Value::as_str)
                        .map(|a| vec![a.to_string()])
                        .unwrap_or_default(),
                };
                Some(ConnectorEvent::AccountsChanged(accounts))
            }
            types::CHAIN_CHANGED => {
                let chain = message.payload.get("chainId")?;
                let chain = chain
                    .as_str()
                    .map(str::to_string)
                    .or_else(|| chain.as_u64().map(|id| id.to_string()))?;
                Some(ConnectorEvent::ChainChanged(chain))
            }
            types::SESSION_EXPIRED => Some(ConnectorEvent::Disconnect { transient: false }),
            _ => None,
        }
    }
}

/// The frame reports EVM chains as numbers and everything else as CAIP ids.
fn chain_from_frame(namespace: ChainNamespace, value: &Value) -> Option<CaipNetworkId> {
    if let Some(id) = value.as_u64() {
        return (namespace == ChainNamespace::Eip155).then(|| CaipNetworkId::evm(id));
    }
    let raw = value.as_str()?;
    let id = match namespace {
        ChainNamespace::Eip155 => CaipNetworkId::from_evm_chain_id(raw).ok()?,
        _ => raw.parse().ok()?,
    };
    (id.namespace == namespace).then_some(id)
}

fn string_field(value: Value, field: &str) -> Result<String> {
    let inner = value.get(field).cloned().unwrap_or(value);
    match inner {
        Value::String(s) => Ok(s),
        other => Err(format!("frame returned a non-string {field}: {other}").into()),
    }
}
