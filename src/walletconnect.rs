/// WalletConnect
///
/// dApp-side WalletConnect connector. Pairing keys and the `wc:` URI are
/// produced here; encryption and relay transport live behind [`SignClient`].
///
/// Flow:
/// 1. Generate pairing keys and publish the URI for QR / deep-link display
/// 2. Send the session proposal on the pairing topic
/// 3. Wait for the wallet's settlement, bounded by the pairing timeout and
///    abortable through [`WalletConnectConnector::cancel`]
/// 4. Check the settled topic against the one derived from the responder key
///
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::{Notify, broadcast, watch};

use crate::caip::{CaipAddress, CaipNetworkId, ChainNamespace};
use crate::config::Metadata;
use crate::connector::{ConnectParams, ConnectResult, ConnectorEvent};
use crate::constants::WALLET_CONNECT_CONNECTOR_ID;
use crate::error::{Error, Result};
use crate::network::CaipNetwork;
use crate::pairing::PairingKeys;
use crate::provider::{RequestArguments, methods};
use crate::utils::{format_timestamp, unix_timestamp};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProposalNamespace {
    pub chains: Vec<CaipNetworkId>,
    pub methods: Vec<String>,
    pub events: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionProposal {
    #[serde(rename = "pairingTopic")]
    pub pairing_topic: String,
    #[serde(rename = "pairingUri")]
    pub pairing_uri: String,
    #[serde(rename = "symKey")]
    pub sym_key: String,
    #[serde(rename = "proposerPublicKey")]
    pub proposer_public_key: String,
    #[serde(rename = "requiredNamespaces")]
    pub required_namespaces: HashMap<ChainNamespace, ProposalNamespace>,
    pub metadata: Metadata,
    #[serde(rename = "expiryTimestamp")]
    pub expiry_timestamp: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionSettlement {
    pub topic: String,
    #[serde(rename = "responderPublicKey", skip_serializing_if = "Option::is_none")]
    pub responder_public_key: Option<String>,
    pub accounts: Vec<CaipAddress>,
    pub expiry: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SignClientEvent {
    /// `wc_sessionEvent` carrying `chainChanged` / `accountsChanged`.
    SessionEvent {
        topic: String,
        name: String,
        data: Value,
    },
    /// `wc_sessionUpdate` with the new account set.
    SessionUpdate {
        topic: String,
        accounts: Vec<CaipAddress>,
    },
    /// `wc_sessionDelete` from the wallet.
    SessionDelete { topic: String },
    /// Relay socket went away.
    TransportClosed,
    TransportOpen,
}

/// Relay-side half of WalletConnect: encryption, publishing, subscriptions.
#[async_trait]
pub trait SignClient: Send + Sync {
    async fn propose(&self, proposal: &SessionProposal) -> Result<()>;

    /// Resolves once the wallet settles or rejects the proposal.
    /// A rejection must come back as [`Error::UserRejected`].
    async fn await_settlement(&self, pairing_topic: &str) -> Result<SessionSettlement>;

    /// A still-valid session for `namespace` the client kept from earlier.
    async fn restore(&self, namespace: ChainNamespace) -> Result<Option<SessionSettlement>>;

    async fn reconnect_transport(&self) -> Result<()>;

    async fn request(
        &self,
        topic: &str,
        chain_id: &CaipNetworkId,
        args: RequestArguments,
    ) -> Result<Value>;

    async fn delete_session(&self, topic: &str) -> Result<()>;

    /// Drops subscriptions and keys for a pairing that never settled.
    async fn abandon_pairing(&self, pairing_topic: &str) -> Result<()>;

    fn subscribe(&self) -> broadcast::Receiver<SignClientEvent>;
}

#[derive(Debug, Clone)]
struct ActiveSession {
    topic: String,
    accounts: Vec<CaipAddress>,
    chain_id: CaipNetworkId,
}

#[derive(Debug)]
struct PendingPairing {
    topic: String,
    abort: Arc<Notify>,
}

pub struct WalletConnectConnector {
    namespace: ChainNamespace,
    client: Arc<dyn SignClient>,
    metadata: Metadata,
    pairing_timeout: Duration,
    pairing_uri: watch::Sender<Option<String>>,
    pending: Mutex<Option<PendingPairing>>,
    session: Mutex<Option<ActiveSession>>,
}

impl WalletConnectConnector {
    pub fn new(
        namespace: ChainNamespace,
        client: Arc<dyn SignClient>,
        metadata: Metadata,
        pairing_timeout: Duration,
    ) -> Self {
        let (pairing_uri, _) = watch::channel(None);
        Self {
            namespace,
            client,
            metadata,
            pairing_timeout,
            pairing_uri,
            pending: Mutex::new(None),
            session: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        WALLET_CONNECT_CONNECTOR_ID
    }

    pub fn name(&self) -> &str {
        "WalletConnect"
    }

    pub fn namespace(&self) -> ChainNamespace {
        self.namespace
    }

    pub fn client(&self) -> &Arc<dyn SignClient> {
        &self.client
    }

    /// URI of the pairing being proposed, `None` when nothing is pending.
    pub fn pairing_uri(&self) -> watch::Receiver<Option<String>> {
        self.pairing_uri.subscribe()
    }

    pub fn session_topic(&self) -> Option<String> {
        self.lock_session().as_ref().map(|s| s.topic.clone())
    }

    fn lock_session(&self) -> std::sync::MutexGuard<'_, Option<ActiveSession>> {
        match self.session.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Option<PendingPairing>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn proposal(&self, keys: &PairingKeys, params: &ConnectParams, expiry: u64) -> SessionProposal {
        let mut chains: Vec<CaipNetworkId> = vec![params.network.id.clone()];
        for network in &params.networks {
            if !chains.contains(&network.id) {
                chains.push(network.id.clone());
            }
        }
        let (rpc_methods, events) = namespace_methods(self.namespace);
        SessionProposal {
            pairing_topic: keys.topic(),
            pairing_uri: keys.uri(expiry, None).to_string(),
            sym_key: alloy::hex::encode(keys.sym_key()),
            proposer_public_key: keys.proposer_public_key(),
            required_namespaces: HashMap::from([(
                self.namespace,
                ProposalNamespace {
                    chains,
                    methods: rpc_methods,
                    events,
                },
            )]),
            metadata: self.metadata.clone(),
            expiry_timestamp: expiry,
        }
    }

    pub async fn connect(&self, params: &ConnectParams) -> Result<ConnectResult> {
        let keys = PairingKeys::generate();
        let expiry = unix_timestamp()? + self.pairing_timeout.as_secs();
        let proposal = self.proposal(&keys, params, expiry);
        let topic = proposal.pairing_topic.clone();
        let abort = Arc::new(Notify::new());

        {
            let mut pending = self.lock_pending();
            if let Some(previous) = pending.take() {
                debug!("Replacing pending pairing {}", previous.topic);
                previous.abort.notify_one();
            }
            *pending = Some(PendingPairing {
                topic: topic.clone(),
                abort: abort.clone(),
            });
        }

        info!("Proposing WalletConnect session on pairing {topic}");
        self.pairing_uri.send_replace(Some(proposal.pairing_uri.clone()));

        // The timeout and abort cover publishing the proposal too.
        let handshake = async {
            self.client.propose(&proposal).await?;
            self.client.await_settlement(&topic).await
        };
        let outcome = tokio::select! {
            settled = handshake => settled,
            _ = tokio::time::sleep(self.pairing_timeout) => Err(Error::PairingExpired),
            _ = abort.notified() => Err(Error::PairingAborted),
        };

        {
            let mut pending = self.lock_pending();
            if pending.as_ref().is_some_and(|p| p.topic == topic) {
                *pending = None;
                self.pairing_uri.send_replace(None);
            }
        }

        let settlement = match outcome {
            Ok(settlement) => settlement,
            Err(e) => {
                warn!("Pairing {topic} failed: {e}");
                if let Err(cleanup) = self.client.abandon_pairing(&topic).await {
                    debug!("Could not abandon pairing {topic}: {cleanup}");
                }
                return Err(e);
            }
        };

        if let Some(responder) = &settlement.responder_public_key {
            let expected = keys.session_topic(responder)?;
            if expected != settlement.topic {
                return Err(Error::Transport(format!(
                    "settled topic {} does not match derived topic {expected}",
                    settlement.topic
                )));
            }
        }

        self.adopt(settlement, &params.network.id)
    }

    pub async fn reconnect(&self, params: &ConnectParams) -> Result<ConnectResult> {
        self.client.reconnect_transport().await?;
        match self.client.restore(self.namespace).await? {
            Some(settlement) => self.adopt(settlement, &params.network.id),
            None => Err(Error::NotConnected(self.namespace)),
        }
    }

    /// Picks the session account on the preferred chain, or the first one in
    /// this namespace.
    fn adopt(
        &self,
        settlement: SessionSettlement,
        preferred: &CaipNetworkId,
    ) -> Result<ConnectResult> {
        let in_namespace: Vec<&CaipAddress> = settlement
            .accounts
            .iter()
            .filter(|a| a.namespace == self.namespace)
            .collect();
        let account = in_namespace
            .iter()
            .find(|a| &a.network_id() == preferred)
            .or_else(|| in_namespace.first())
            .ok_or_else(|| {
                Error::from(format!(
                    "wallet approved session {} without {} accounts",
                    settlement.topic, self.namespace
                ))
            })?;
        let result = ConnectResult {
            address: account.address.clone(),
            chain_id: account.network_id(),
        };
        *self.lock_session() = Some(ActiveSession {
            topic: settlement.topic.clone(),
            accounts: settlement.accounts.clone(),
            chain_id: result.chain_id.clone(),
        });
        let until = format_timestamp(settlement.expiry)
            .unwrap_or_else(|_| settlement.expiry.to_string());
        info!("WalletConnect session {} active until {until}", settlement.topic);
        Ok(result)
    }

    pub fn cancel(&self) {
        if let Some(pending) = self.lock_pending().as_ref() {
            info!("Aborting pairing {}", pending.topic);
            pending.abort.notify_one();
        }
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.cancel();
        let session = self.lock_session().take();
        match session {
            Some(session) => self.client.delete_session(&session.topic).await,
            None => Ok(()),
        }
    }

    fn active(&self) -> Result<ActiveSession> {
        self.lock_session()
            .clone()
            .ok_or(Error::NotConnected(self.namespace))
    }

    async fn session_request(&self, method: &str, params: Value) -> Result<Value> {
        let session = self.active()?;
        self.client
            .request(
                &session.topic,
                &session.chain_id,
                RequestArguments::new(method, Some(params)),
            )
            .await
    }

    pub async fn sign_message(&self, message: &str, address: &str) -> Result<String> {
        let (method, params) = match self.namespace {
            ChainNamespace::Eip155 => (
                methods::PERSONAL_SIGN,
                json!([format!("0x{}", alloy::hex::encode(message.as_bytes())), address]),
            ),
            ChainNamespace::Solana => (
                "solana_signMessage",
                json!({ "message": bs58::encode(message).into_string(), "pubkey": address }),
            ),
            _ => (
                "signMessage",
                json!({ "message": message, "address": address }),
            ),
        };
        let response = self.session_request(method, params).await?;
        let signature = response.get("signature").cloned().unwrap_or(response);
        signature
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| format!("wallet returned a non-string signature: {signature}").into())
    }

    pub async fn send_transaction(&self, transaction: Value) -> Result<String> {
        let (method, params) = match self.namespace {
            ChainNamespace::Eip155 => (methods::ETH_SEND_TRANSACTION, json!([transaction])),
            ChainNamespace::Solana => (
                "solana_signAndSendTransaction",
                json!({ "transaction": transaction }),
            ),
            _ => ("sendTransfer", transaction),
        };
        let response = self.session_request(method, params).await?;
        let hash = response
            .get("signature")
            .or_else(|| response.get("txid"))
            .cloned()
            .unwrap_or(response);
        hash.as_str()
            .map(str::to_string)
            .ok_or_else(|| format!("wallet returned a non-string transaction id: {hash}").into())
    }

    /// Switching to a chain already in the session is local; EVM wallets are
    /// asked to switch for anything else.
    pub async fn switch_network(&self, network: &CaipNetwork) -> Result<()> {
        let session = self.active()?;
        let approved = session.accounts.iter().any(|a| a.network_id() == network.id);
        if !approved {
            if self.namespace != ChainNamespace::Eip155 {
                return Err(Error::UnrecognizedChain(network.id.to_string()));
            }
            let chain_id = network
                .id
                .evm_hex_chain_id()
                .ok_or_else(|| Error::UnknownNetwork(network.id.to_string()))?;
            self.session_request(methods::WALLET_SWITCH_CHAIN, json!([{ "chainId": chain_id }]))
                .await?;
        }
        if let Some(active) = self.lock_session().as_mut() {
            active.chain_id = network.id.clone();
        }
        Ok(())
    }

    pub fn translate_event(&self, event: SignClientEvent) -> Option<ConnectorEvent> {
        let ours = |topic: &str| self.session_topic().as_deref() == Some(topic);
        match event {
            SignClientEvent::TransportClosed => {
                self.session_topic()?;
                Some(ConnectorEvent::Disconnect { transient: true })
            }
            SignClientEvent::TransportOpen => None,
            SignClientEvent::SessionDelete { topic } if ours(&topic) => {
                *self.lock_session() = None;
                Some(ConnectorEvent::Disconnect { transient: false })
            }
            SignClientEvent::SessionUpdate { topic, accounts } if ours(&topic) => {
                if let Some(active) = self.lock_session().as_mut() {
                    active.accounts = accounts.clone();
                }
                Some(ConnectorEvent::AccountsChanged(
                    accounts
                        .into_iter()
                        .filter(|a| a.namespace == self.namespace)
                        .map(|a| a.address)
                        .collect(),
                ))
            }
            SignClientEvent::SessionEvent { topic, name, data } if ours(&topic) => {
                match name.as_str() {
                    "chainChanged" => {
                        let chain = data
                            .as_str()
                            .map(str::to_string)
                            .or_else(|| data.as_u64().map(|id| id.to_string()))?;
                        Some(ConnectorEvent::ChainChanged(chain))
                    }
                    "accountsChanged" => {
                        let accounts = data
                            .as_array()?
                            .iter()
                            .filter_map(Value::as_str)
                            .map(|a| match a.parse::<CaipAddress>() {
                                Ok(caip) => caip.address,
                                Err(_) => a.to_string(),
                            })
                            .collect();
                        Some(ConnectorEvent::AccountsChanged(accounts))
                    }
                    _ => None,
                }
            }
            _ => None,
        }
    }
}

fn namespace_methods(namespace: ChainNamespace) -> (Vec<String>, Vec<String>) {
    let (rpc_methods, events): (&[&str], &[&str]) = match namespace {
        ChainNamespace::Eip155 => (
            &[
                methods::ETH_SEND_TRANSACTION,
                methods::PERSONAL_SIGN,
                "eth_signTypedData_v4",
                methods::WALLET_SWITCH_CHAIN,
                methods::WALLET_ADD_CHAIN,
            ],
            &["chainChanged", "accountsChanged"],
        ),
        ChainNamespace::Solana => (
            &[
                "solana_signMessage",
                "solana_signTransaction",
                "solana_signAndSendTransaction",
            ],
            &[],
        ),
        ChainNamespace::Bip122 => (
            &["signMessage", "sendTransfer", "signPsbt", "getAccountAddresses"],
            &["bip122_addressesChanged"],
        ),
        _ => (&[], &[]),
    };
    (
        rpc_methods.iter().map(|m| m.to_string()).collect(),
        events.iter().map(|e| e.to_string()).collect(),
    )
}
