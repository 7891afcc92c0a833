//! Namespace adapters
//!
//! One adapter per chain family. An adapter owns the connectors viable for
//! its namespace and hides how that family formats addresses, reads balances
//! and switches networks.

mod bitcoin;
mod evm;
mod solana;
mod universal;

pub use bitcoin::BitcoinAdapter;
pub use evm::EvmAdapter;
pub use solana::SolanaAdapter;
pub use universal::UniversalAdapter;

use std::fmt;
use std::sync::{Arc, Mutex};

use alloy::primitives::U256;
use alloy::primitives::utils::format_units;
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::caip::ChainNamespace;
use crate::connector::{AnnouncedConnector, Connector};
use crate::error::{Error, Result};
use crate::injected::InjectedConnector;
use crate::network::CaipNetwork;
use crate::provider::ProviderAnnouncement;

/// A native balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Amount {
    pub value: U256,
    pub decimals: u8,
    pub symbol: String,
    /// `value` scaled by `decimals`, without trailing zeros.
    pub formatted: String,
}

impl Amount {
    pub fn new(value: U256, decimals: u8, symbol: impl Into<String>) -> Result<Self> {
        let formatted = format_units(value, decimals).map_err(|e| Error::from(e.to_string()))?;
        let formatted = if formatted.contains('.') {
            formatted
                .trim_end_matches('0')
                .trim_end_matches('.')
                .to_string()
        } else {
            formatted
        };
        Ok(Self {
            value,
            decimals,
            symbol: symbol.into(),
            formatted,
        })
    }

    pub fn native(value: U256, network: &CaipNetwork) -> Result<Self> {
        Self::new(
            value,
            network.native_currency.decimals,
            network.native_currency.symbol.clone(),
        )
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.formatted, self.symbol)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountProfile {
    pub name: Option<String>,
    pub avatar: Option<String>,
}

/// Naming-service lookup (ENS and the like).
#[async_trait]
pub trait ProfileResolver: Send + Sync {
    async fn resolve(&self, address: &str, network: &CaipNetwork) -> Result<Option<AccountProfile>>;
}

#[async_trait]
pub trait NamespaceAdapter: Send + Sync {
    fn namespace(&self) -> ChainNamespace;

    /// Live connector list, including late announced ones.
    fn connectors(&self) -> Vec<Connector>;

    fn connector(&self, id: &str) -> Option<Connector> {
        self.connectors().into_iter().find(|c| c.id() == id)
    }

    /// Merges an EIP-6963 announcement. Returns whether a connector was added.
    fn announce(&self, announcement: ProviderAnnouncement) -> bool {
        debug!(
            "{} adapter ignores announcement from {}",
            self.namespace(),
            announcement.info.name
        );
        false
    }

    /// Canonical form of an address, or `MalformedIdentifier`.
    fn normalize_address(&self, address: &str) -> Result<String>;

    async fn get_balance(&self, address: &str, network: &CaipNetwork) -> Result<Amount>;

    async fn get_account_profile(
        &self,
        _address: &str,
        _network: &CaipNetwork,
    ) -> Result<Option<AccountProfile>> {
        Ok(None)
    }

    /// Asks the wallet behind `connector` to move to `network`.
    async fn normalize_network_switch(
        &self,
        connector: &Connector,
        network: &CaipNetwork,
    ) -> Result<()> {
        connector.switch_network(network).await
    }
}

/// Connector list shared between an adapter and its announcement listener.
#[derive(Debug, Clone)]
pub struct ConnectorSet {
    namespace: ChainNamespace,
    connectors: Arc<Mutex<Vec<Connector>>>,
}

impl ConnectorSet {
    pub fn new(namespace: ChainNamespace, connectors: Vec<Connector>) -> Self {
        Self {
            namespace,
            connectors: Arc::new(Mutex::new(connectors)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Connector>> {
        match self.connectors.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn all(&self) -> Vec<Connector> {
        self.lock().clone()
    }

    /// Adds `connector` unless one with the same id already exists.
    pub fn insert(&self, connector: Connector) -> bool {
        let mut connectors = self.lock();
        if connectors.iter().any(|c| c.id() == connector.id()) {
            return false;
        }
        connectors.push(connector);
        true
    }

    /// Keyed by rdns; an existing connector (and any session it holds) is
    /// left untouched.
    pub fn announce(&self, announcement: ProviderAnnouncement) -> bool {
        let id = announcement.connector_id();
        let inner = InjectedConnector::new(
            id.clone(),
            announcement.info.name.clone(),
            self.namespace,
            announcement.provider,
        );
        let added = self.insert(Connector::Announced(AnnouncedConnector {
            info: announcement.info,
            inner,
        }));
        if added {
            info!("Discovered {} wallet {id}", self.namespace);
        } else {
            debug!("Wallet {id} already known, announcement ignored");
        }
        added
    }
}

/// Feeds announcements from `receiver` into `adapter` until the sender side
/// goes away.
pub fn watch_announcements(
    adapter: Arc<dyn NamespaceAdapter>,
    mut receiver: broadcast::Receiver<ProviderAnnouncement>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(announcement) => {
                    adapter.announce(announcement);
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Missed {skipped} wallet announcements");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
