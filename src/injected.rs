//! Injected connector: talks to a wallet object exposed by the host
//! (browser extension, Coinbase/Safe/Ledger providers, EIP-6963 announced
//! wallets). Method names depend on the namespace.

use std::fmt;
use std::sync::Arc;

use alloy::hex;
use log::{debug, info};
use serde_json::{Value, json};

use crate::caip::{CaipNetworkId, ChainNamespace};
use crate::constants::EIP1193_UNAUTHORIZED;
use crate::connector::{Capability, ConnectParams, ConnectResult, ConnectorEvent, ConnectorType};
use crate::error::{Error, Result};
use crate::network::CaipNetwork;
use crate::provider::{InjectedProvider, ProviderEvent, RequestArguments, methods};

#[derive(Clone)]
pub struct InjectedConnector {
    id: String,
    name: String,
    namespace: ChainNamespace,
    kind: ConnectorType,
    provider: Arc<dyn InjectedProvider>,
}

impl fmt::Debug for InjectedConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InjectedConnector")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("namespace", &self.namespace)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl InjectedConnector {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        namespace: ChainNamespace,
        provider: Arc<dyn InjectedProvider>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            namespace,
            kind: ConnectorType::Injected,
            provider,
        }
    }

    /// Tags the connector as Coinbase, Safe or Ledger; the mechanics stay
    /// those of an injected provider.
    pub fn with_kind(mut self, kind: ConnectorType) -> Self {
        self.kind = kind;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> ChainNamespace {
        self.namespace
    }

    pub fn kind(&self) -> ConnectorType {
        self.kind
    }

    pub fn provider(&self) -> &Arc<dyn InjectedProvider> {
        &self.provider
    }

    pub fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::SignMessage | Capability::SendTransaction => true,
            Capability::SwitchNetwork => matches!(
                self.namespace,
                ChainNamespace::Eip155 | ChainNamespace::Solana | ChainNamespace::Bip122
            ),
            Capability::AddNetwork => self.namespace == ChainNamespace::Eip155,
            Capability::Cancel => false,
        }
    }

    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        debug!("{} -> {method}", self.id);
        self.provider
            .request(RequestArguments::new(method, params))
            .await
    }

    pub async fn connect(&self, params: &ConnectParams) -> Result<ConnectResult> {
        info!("Requesting {} accounts from {}", self.namespace, self.id);
        match self.namespace {
            ChainNamespace::Eip155 => {
                let accounts = self.request(methods::ETH_REQUEST_ACCOUNTS, None).await?;
                self.evm_result(accounts).await
            }
            ChainNamespace::Solana => {
                let response = self.request(methods::SOLANA_CONNECT, None).await?;
                solana_result(&response, params)
            }
            _ => {
                let accounts = self.request(methods::BITCOIN_REQUEST_ACCOUNTS, None).await?;
                first_account(&accounts).map(|address| ConnectResult {
                    address,
                    chain_id: params.network.id.clone(),
                })
            }
        }
    }

    /// Uses the non-prompting account queries; an empty answer means the
    /// wallet is locked or the dApp lost its permission.
    pub async fn reconnect(&self, params: &ConnectParams) -> Result<ConnectResult> {
        match self.namespace {
            ChainNamespace::Eip155 => {
                let accounts = self.request(methods::ETH_ACCOUNTS, None).await?;
                self.evm_result(accounts).await
            }
            ChainNamespace::Solana => {
                let response = self
                    .request(methods::SOLANA_CONNECT, Some(json!({ "onlyIfTrusted": true })))
                    .await?;
                solana_result(&response, params)
            }
            _ => {
                let accounts = self.request(methods::BITCOIN_GET_ACCOUNTS, None).await?;
                first_account(&accounts).map(|address| ConnectResult {
                    address,
                    chain_id: params.network.id.clone(),
                })
            }
        }
    }

    async fn evm_result(&self, accounts: Value) -> Result<ConnectResult> {
        let address = first_account(&accounts)?;
        let chain = self.request(methods::ETH_CHAIN_ID, None).await?;
        let chain = chain
            .as_str()
            .map(str::to_string)
            .or_else(|| chain.as_u64().map(|id| id.to_string()))
            .ok_or("eth_chainId returned a non-string value")?;
        Ok(ConnectResult {
            address,
            chain_id: CaipNetworkId::from_evm_chain_id(&chain)?,
        })
    }

    pub async fn disconnect(&self) -> Result<()> {
        // Extensions cannot be forced to forget the dApp; revoking is best effort.
        let result = match self.namespace {
            ChainNamespace::Eip155 => {
                self.request(
                    methods::WALLET_REVOKE_PERMISSIONS,
                    Some(json!([{ "eth_accounts": {} }])),
                )
                .await
            }
            ChainNamespace::Solana => self.request(methods::SOLANA_DISCONNECT, None).await,
            _ => Ok(Value::Null),
        };
        if let Err(e) = result {
            debug!("{} ignored disconnect error: {e}", self.id);
        }
        Ok(())
    }

    pub async fn sign_message(&self, message: &str, address: &str) -> Result<String> {
        let signature = match self.namespace {
            ChainNamespace::Eip155 => {
                let hex_message = format!("0x{}", hex::encode(message.as_bytes()));
                self.request(methods::PERSONAL_SIGN, Some(json!([hex_message, address])))
                    .await?
            }
            ChainNamespace::Solana => {
                let response = self
                    .request(
                        methods::SOLANA_SIGN_MESSAGE,
                        Some(json!({ "message": bs58::encode(message).into_string() })),
                    )
                    .await?;
                response.get("signature").cloned().unwrap_or(response)
            }
            _ => {
                self.request(
                    methods::BITCOIN_SIGN_MESSAGE,
                    Some(json!({ "address": address, "message": message })),
                )
                .await?
            }
        };
        string_result(signature, "signature")
    }

    pub async fn send_transaction(&self, transaction: Value) -> Result<String> {
        let response = match self.namespace {
            ChainNamespace::Eip155 => {
                self.request(methods::ETH_SEND_TRANSACTION, Some(json!([transaction])))
                    .await?
            }
            ChainNamespace::Solana => {
                let response = self
                    .request(
                        methods::SOLANA_SIGN_AND_SEND,
                        Some(json!({ "transaction": transaction })),
                    )
                    .await?;
                response.get("signature").cloned().unwrap_or(response)
            }
            _ => {
                let response = self
                    .request(methods::BITCOIN_SEND_TRANSFER, Some(transaction))
                    .await?;
                response.get("txid").cloned().unwrap_or(response)
            }
        };
        string_result(response, "transaction hash")
    }

    pub async fn switch_network(&self, network: &CaipNetwork) -> Result<()> {
        match self.namespace {
            ChainNamespace::Eip155 => {
                let chain_id = network
                    .id
                    .evm_hex_chain_id()
                    .ok_or_else(|| Error::UnknownNetwork(network.id.to_string()))?;
                self.request(
                    methods::WALLET_SWITCH_CHAIN,
                    Some(json!([{ "chainId": chain_id }])),
                )
                .await
                .map_err(|e| match e {
                    // Some wallets report the raw code instead of a typed error
                    Error::ProviderRpc { code, message } => {
                        Error::from_provider_code(code, message, Some(&network.id.to_string()))
                    }
                    other => other,
                })?;
                Ok(())
            }
            // Solana wallets are network agnostic; the app picks the cluster.
            ChainNamespace::Solana => Ok(()),
            ChainNamespace::Bip122 => {
                let network_name = if network.testnet { "testnet" } else { "mainnet" };
                self.request(
                    methods::BITCOIN_SWITCH_NETWORK,
                    Some(json!({ "network": network_name })),
                )
                .await?;
                Ok(())
            }
            _ => Err(Error::Unsupported("network switching")),
        }
    }

    pub async fn add_network(&self, network: &CaipNetwork) -> Result<()> {
        self.request(methods::WALLET_ADD_CHAIN, Some(json!([network.add_chain_params()?])))
            .await?;
        Ok(())
    }

    pub fn translate_event(event: ProviderEvent) -> Option<ConnectorEvent> {
        match event {
            ProviderEvent::AccountsChanged(accounts) => {
                Some(ConnectorEvent::AccountsChanged(accounts))
            }
            ProviderEvent::ChainChanged(chain) => Some(ConnectorEvent::ChainChanged(chain)),
            ProviderEvent::Connect { .. } => None,
            ProviderEvent::Disconnect { .. } => {
                Some(ConnectorEvent::Disconnect { transient: false })
            }
        }
    }
}

/// First address out of an account list. Entries are either plain strings or
/// objects carrying an `address` field.
fn first_account(accounts: &Value) -> Result<String> {
    let first = accounts
        .as_array()
        .and_then(|a| a.first())
        .ok_or_else(|| Error::ProviderRpc {
            code: EIP1193_UNAUTHORIZED,
            message: "the wallet returned no authorized account".to_string(),
        })?;
    first
        .as_str()
        .or_else(|| first.get("address").and_then(Value::as_str))
        .map(str::to_string)
        .ok_or_else(|| format!("unexpected account entry {first}").into())
}

fn solana_result(response: &Value, params: &ConnectParams) -> Result<ConnectResult> {
    let key = response.get("publicKey").unwrap_or(response);
    let address = key
        .as_str()
        .ok_or_else(|| Error::from(format!("unexpected connect response {response}")))?;
    Ok(ConnectResult {
        address: address.to_string(),
        chain_id: params.network.id.clone(),
    })
}

fn string_result(value: Value, what: &str) -> Result<String> {
    match value {
        Value::String(s) => Ok(s),
        other => Err(format!("wallet returned a non-string {what}: {other}").into()),
    }
}
