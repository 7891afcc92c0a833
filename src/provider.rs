/// Injected providers
///
/// The EIP-1193 style interface wallets inject into the host environment,
/// and the EIP-6963 announcement that lets several of them coexist.
///
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestArguments {
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RequestArguments {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }
}

/// Events a wallet pushes on its own schedule.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    AccountsChanged(Vec<String>),
    ChainChanged(String),
    Connect { chain_id: String },
    Disconnect { code: i64, message: String },
}

/// A wallet object exposed by the host environment.
///
/// Errors coming back from `request` should already be typed: user
/// rejection as [`crate::Error::UserRejected`], an unknown chain as
/// [`crate::Error::UnrecognizedChain`]. [`crate::Error::from_provider_code`]
/// does the mapping from raw EIP-1193 codes.
#[async_trait]
pub trait InjectedProvider: Send + Sync {
    async fn request(&self, args: RequestArguments) -> Result<Value>;

    fn subscribe(&self) -> broadcast::Receiver<ProviderEvent>;
}

/// EIP-6963 provider info.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub uuid: String,
    pub name: String,
    pub icon: String,
    pub rdns: String,
}

/// `eip6963:announceProvider` payload.
#[derive(Clone)]
pub struct ProviderAnnouncement {
    pub info: ProviderInfo,
    pub provider: Arc<dyn InjectedProvider>,
}

impl ProviderAnnouncement {
    /// Connector id for the announced wallet: rdns, or uuid when a wallet
    /// announces without one.
    pub fn connector_id(&self) -> String {
        if self.info.rdns.is_empty() {
            self.info.uuid.clone()
        } else {
            self.info.rdns.clone()
        }
    }
}

impl fmt::Debug for ProviderAnnouncement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderAnnouncement")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

pub mod methods {
    pub const ETH_REQUEST_ACCOUNTS: &str = "eth_requestAccounts";
    pub const ETH_ACCOUNTS: &str = "eth_accounts";
    pub const ETH_CHAIN_ID: &str = "eth_chainId";
    pub const ETH_GET_BALANCE: &str = "eth_getBalance";
    pub const ETH_SEND_TRANSACTION: &str = "eth_sendTransaction";
    pub const PERSONAL_SIGN: &str = "personal_sign";
    pub const WALLET_SWITCH_CHAIN: &str = "wallet_switchEthereumChain";
    pub const WALLET_ADD_CHAIN: &str = "wallet_addEthereumChain";
    pub const WALLET_REVOKE_PERMISSIONS: &str = "wallet_revokePermissions";

    pub const SOLANA_CONNECT: &str = "connect";
    pub const SOLANA_DISCONNECT: &str = "disconnect";
    pub const SOLANA_SIGN_MESSAGE: &str = "signMessage";
    pub const SOLANA_SIGN_AND_SEND: &str = "signAndSendTransaction";
    pub const SOLANA_GET_BALANCE: &str = "getBalance";

    pub const BITCOIN_REQUEST_ACCOUNTS: &str = "requestAccounts";
    pub const BITCOIN_GET_ACCOUNTS: &str = "getAccounts";
    pub const BITCOIN_SIGN_MESSAGE: &str = "signMessage";
    pub const BITCOIN_SEND_TRANSFER: &str = "sendTransfer";
    pub const BITCOIN_SWITCH_NETWORK: &str = "switchNetwork";
}
