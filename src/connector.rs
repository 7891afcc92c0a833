//! Connectors
//!
//! A [`Connector`] is one way of reaching one wallet inside one namespace.
//! The set of kinds is closed; each variant carries only what its protocol
//! needs and calls are dispatched with a `match`.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::caip::{CaipNetworkId, ChainNamespace};
use crate::embedded::EmbeddedAuthConnector;
use crate::error::{Error, Result};
use crate::frame::FrameMessage;
use crate::injected::InjectedConnector;
use crate::network::CaipNetwork;
use crate::provider::{ProviderEvent, ProviderInfo};
use crate::walletconnect::{SignClientEvent, WalletConnectConnector};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectorType {
    Injected,
    Announced,
    WalletConnect,
    EmbeddedAuth,
    Coinbase,
    Safe,
    Ledger,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    SignMessage,
    SendTransaction,
    SwitchNetwork,
    AddNetwork,
    Cancel,
}

/// Input to a handshake: the network the app wants to land on and every
/// network it is willing to use in that namespace.
#[derive(Debug, Clone)]
pub struct ConnectParams {
    pub network: CaipNetwork,
    pub networks: Vec<CaipNetwork>,
}

impl ConnectParams {
    pub fn new(network: CaipNetwork, networks: Vec<CaipNetwork>) -> Self {
        Self { network, networks }
    }

    pub fn namespace(&self) -> ChainNamespace {
        self.network.namespace()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectResult {
    pub address: String,
    pub chain_id: CaipNetworkId,
}

/// Wallet-originated notification, already stripped of protocol details.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectorEvent {
    AccountsChanged(Vec<String>),
    ChainChanged(String),
    /// `transient` drops (a relay socket going away) may be retried;
    /// everything else ends the session.
    Disconnect { transient: bool },
}

#[derive(Debug, Clone)]
pub struct AnnouncedConnector {
    pub info: ProviderInfo,
    pub inner: InjectedConnector,
}

#[derive(Clone)]
pub enum Connector {
    Injected(InjectedConnector),
    Announced(AnnouncedConnector),
    WalletConnect(Arc<WalletConnectConnector>),
    EmbeddedAuth(Arc<EmbeddedAuthConnector>),
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("id", &self.id())
            .field("type", &self.connector_type())
            .field("namespace", &self.namespace())
            .finish()
    }
}

impl Connector {
    pub fn id(&self) -> &str {
        match self {
            Connector::Injected(c) => c.id(),
            Connector::Announced(c) => c.inner.id(),
            Connector::WalletConnect(c) => c.id(),
            Connector::EmbeddedAuth(c) => c.id(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Connector::Injected(c) => c.name(),
            Connector::Announced(c) => &c.info.name,
            Connector::WalletConnect(c) => c.name(),
            Connector::EmbeddedAuth(c) => c.name(),
        }
    }

    pub fn namespace(&self) -> ChainNamespace {
        match self {
            Connector::Injected(c) => c.namespace(),
            Connector::Announced(c) => c.inner.namespace(),
            Connector::WalletConnect(c) => c.namespace(),
            Connector::EmbeddedAuth(c) => c.namespace(),
        }
    }

    pub fn connector_type(&self) -> ConnectorType {
        match self {
            Connector::Injected(c) => c.kind(),
            Connector::Announced(_) => ConnectorType::Announced,
            Connector::WalletConnect(_) => ConnectorType::WalletConnect,
            Connector::EmbeddedAuth(_) => ConnectorType::EmbeddedAuth,
        }
    }

    pub fn supports(&self, capability: Capability) -> bool {
        match self {
            Connector::Injected(c) => c.supports(capability),
            Connector::Announced(c) => c.inner.supports(capability),
            Connector::WalletConnect(_) => !matches!(capability, Capability::AddNetwork),
            Connector::EmbeddedAuth(_) => matches!(
                capability,
                Capability::SignMessage | Capability::SendTransaction | Capability::SwitchNetwork
            ),
        }
    }

    pub async fn connect(&self, params: &ConnectParams) -> Result<ConnectResult> {
        match self {
            Connector::Injected(c) => c.connect(params).await,
            Connector::Announced(c) => c.inner.connect(params).await,
            Connector::WalletConnect(c) => c.connect(params).await,
            Connector::EmbeddedAuth(c) => c.connect(params).await,
        }
    }

    /// Re-establishes a previous session without prompting the user.
    pub async fn reconnect(&self, params: &ConnectParams) -> Result<ConnectResult> {
        match self {
            Connector::Injected(c) => c.reconnect(params).await,
            Connector::Announced(c) => c.inner.reconnect(params).await,
            Connector::WalletConnect(c) => c.reconnect(params).await,
            Connector::EmbeddedAuth(c) => c.reconnect(params).await,
        }
    }

    /// Idempotent.
    pub async fn disconnect(&self) -> Result<()> {
        match self {
            Connector::Injected(c) => c.disconnect().await,
            Connector::Announced(c) => c.inner.disconnect().await,
            Connector::WalletConnect(c) => c.disconnect().await,
            Connector::EmbeddedAuth(c) => c.disconnect().await,
        }
    }

    /// Aborts a pending handshake. Only meaningful when
    /// `supports(Capability::Cancel)`.
    pub fn cancel(&self) -> Result<()> {
        match self {
            Connector::WalletConnect(c) => {
                c.cancel();
                Ok(())
            }
            _ => Err(Error::Unsupported("cancelling a pending connection")),
        }
    }

    pub async fn sign_message(&self, message: &str, address: &str) -> Result<String> {
        if !self.supports(Capability::SignMessage) {
            return Err(Error::Unsupported("message signing"));
        }
        match self {
            Connector::Injected(c) => c.sign_message(message, address).await,
            Connector::Announced(c) => c.inner.sign_message(message, address).await,
            Connector::WalletConnect(c) => c.sign_message(message, address).await,
            Connector::EmbeddedAuth(c) => c.sign_message(message, address).await,
        }
    }

    pub async fn send_transaction(&self, transaction: Value) -> Result<String> {
        if !self.supports(Capability::SendTransaction) {
            return Err(Error::Unsupported("sending transactions"));
        }
        match self {
            Connector::Injected(c) => c.send_transaction(transaction).await,
            Connector::Announced(c) => c.inner.send_transaction(transaction).await,
            Connector::WalletConnect(c) => c.send_transaction(transaction).await,
            Connector::EmbeddedAuth(c) => c.send_transaction(transaction).await,
        }
    }

    pub async fn switch_network(&self, network: &CaipNetwork) -> Result<()> {
        if !self.supports(Capability::SwitchNetwork) {
            return Err(Error::Unsupported("network switching"));
        }
        match self {
            Connector::Injected(c) => c.switch_network(network).await,
            Connector::Announced(c) => c.inner.switch_network(network).await,
            Connector::WalletConnect(c) => c.switch_network(network).await,
            Connector::EmbeddedAuth(c) => c.switch_network(network).await,
        }
    }

    /// `wallet_addEthereumChain` on injected EVM wallets.
    pub async fn add_network(&self, network: &CaipNetwork) -> Result<()> {
        match self {
            Connector::Injected(c) if c.supports(Capability::AddNetwork) => {
                c.add_network(network).await
            }
            Connector::Announced(c) if c.inner.supports(Capability::AddNetwork) => {
                c.inner.add_network(network).await
            }
            _ => Err(Error::Unsupported("adding networks")),
        }
    }

    pub fn events(&self) -> ConnectorEvents {
        match self {
            Connector::Injected(c) => ConnectorEvents::Injected(c.provider().subscribe()),
            Connector::Announced(c) => ConnectorEvents::Injected(c.inner.provider().subscribe()),
            Connector::WalletConnect(c) => ConnectorEvents::WalletConnect {
                events: c.client().subscribe(),
                connector: c.clone(),
            },
            Connector::EmbeddedAuth(c) => ConnectorEvents::Embedded(c.frame().subscribe()),
        }
    }
}

/// Wallet-side event stream for one connector.
pub enum ConnectorEvents {
    Injected(broadcast::Receiver<ProviderEvent>),
    WalletConnect {
        events: broadcast::Receiver<SignClientEvent>,
        connector: Arc<WalletConnectConnector>,
    },
    Embedded(broadcast::Receiver<FrameMessage>),
}

impl ConnectorEvents {
    /// Next event relevant to the session, `None` once the source is gone.
    pub async fn next(&mut self) -> Option<ConnectorEvent> {
        loop {
            let event = match self {
                ConnectorEvents::Injected(rx) => {
                    recv(rx).await?.and_then(InjectedConnector::translate_event)
                }
                ConnectorEvents::WalletConnect { events, connector } => recv(events)
                    .await?
                    .and_then(|e| connector.translate_event(e)),
                ConnectorEvents::Embedded(rx) => {
                    recv(rx).await?.and_then(EmbeddedAuthConnector::translate_event)
                }
            };
            if event.is_some() {
                return event;
            }
        }
    }
}

/// `Some(None)` when messages were skipped because the receiver lagged.
async fn recv<T: Clone>(rx: &mut broadcast::Receiver<T>) -> Option<Option<T>> {
    match rx.recv().await {
        Ok(value) => Some(Some(value)),
        Err(RecvError::Lagged(skipped)) => {
            log::warn!("Connector event stream lagged, skipped {skipped} events");
            Some(None)
        }
        Err(RecvError::Closed) => None,
    }
}
