//! Connection state aggregate.
//!
//! One [`ConnectionState`] per controller. Only the controller mutates it;
//! everybody else gets cloned snapshots.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::caip::{CaipAddress, ChainNamespace};
use crate::connector::ConnectorType;
use crate::network::CaipNetwork;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Reconnecting,
    Connected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub namespace: ChainNamespace,
    pub address: String,
    #[serde(rename = "caipAddress")]
    pub caip_address: CaipAddress,
    #[serde(rename = "type")]
    pub connector_type: ConnectorType,
    pub status: ConnectionStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NamespaceState {
    #[serde(rename = "activeConnectorId")]
    pub active_connector_id: Option<String>,
    pub account: Option<Account>,
    #[serde(rename = "activeNetwork")]
    pub active_network: Option<CaipNetwork>,
    pub status: ConnectionStatus,
}

impl NamespaceState {
    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }

    /// A connected entry must carry an account and a network of its own
    /// namespace.
    pub fn is_consistent(&self, namespace: ChainNamespace) -> bool {
        if !self.is_connected() {
            return true;
        }
        let account_ok = self
            .account
            .as_ref()
            .is_some_and(|a| a.namespace == namespace);
        let network_ok = self
            .active_network
            .as_ref()
            .is_some_and(|n| n.namespace() == namespace);
        account_ok && network_ok && self.active_connector_id.is_some()
    }

    pub(crate) fn set_status(&mut self, status: ConnectionStatus) {
        self.status = status;
        if let Some(account) = self.account.as_mut() {
            account.status = status;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConnectionState {
    pub namespaces: BTreeMap<ChainNamespace, NamespaceState>,
    #[serde(rename = "activeNamespace")]
    pub active_namespace: Option<ChainNamespace>,
}

impl ConnectionState {
    pub fn new(namespaces: impl IntoIterator<Item = ChainNamespace>) -> Self {
        Self {
            namespaces: namespaces
                .into_iter()
                .map(|ns| (ns, NamespaceState::default()))
                .collect(),
            active_namespace: None,
        }
    }

    pub fn namespace(&self, namespace: ChainNamespace) -> Option<&NamespaceState> {
        self.namespaces.get(&namespace)
    }

    pub fn status(&self, namespace: ChainNamespace) -> ConnectionStatus {
        self.namespace(namespace)
            .map(|s| s.status)
            .unwrap_or_default()
    }

    pub fn account(&self, namespace: ChainNamespace) -> Option<&Account> {
        self.namespace(namespace).and_then(|s| s.account.as_ref())
    }

    pub fn is_consistent(&self) -> bool {
        self.namespaces
            .iter()
            .all(|(ns, state)| state.is_consistent(*ns))
    }

    pub(crate) fn entry(&mut self, namespace: ChainNamespace) -> &mut NamespaceState {
        self.namespaces.entry(namespace).or_default()
    }

    pub(crate) fn reset(&mut self, namespace: ChainNamespace) {
        self.namespaces.insert(namespace, NamespaceState::default());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caip::CaipNetworkId;
    use crate::network::NetworkRegistry;

    fn connected_evm() -> NamespaceState {
        let registry = NetworkRegistry::with_defaults();
        let network = registry.resolve_network(&CaipNetworkId::evm(1)).unwrap().clone();
        let address = "0x0000000000000000000000000000000000000123";
        NamespaceState {
            active_connector_id: Some("injected".to_string()),
            account: Some(Account {
                namespace: ChainNamespace::Eip155,
                address: address.to_string(),
                caip_address: CaipAddress::new(&network.id, address),
                connector_type: ConnectorType::Injected,
                status: ConnectionStatus::Connected,
            }),
            active_network: Some(network),
            status: ConnectionStatus::Connected,
        }
    }

    #[test]
    fn connected_entries_need_matching_account_and_network() {
        let mut state = ConnectionState::new([ChainNamespace::Eip155, ChainNamespace::Solana]);
        assert!(state.is_consistent());
        state.namespaces.insert(ChainNamespace::Eip155, connected_evm());
        assert!(state.is_consistent());

        state.namespaces.insert(ChainNamespace::Solana, connected_evm());
        assert!(!state.is_consistent());

        let mut missing_network = connected_evm();
        missing_network.active_network = None;
        assert!(!missing_network.is_consistent(ChainNamespace::Eip155));
    }

    #[test]
    fn status_is_mirrored_on_account() {
        let mut entry = connected_evm();
        entry.set_status(ConnectionStatus::Reconnecting);
        assert_eq!(entry.account.unwrap().status, ConnectionStatus::Reconnecting);
    }

    #[test]
    fn serializes_status_lowercase() {
        let state = ConnectionState::new([ChainNamespace::Eip155]);
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["namespaces"]["eip155"]["status"], "disconnected");
    }
}
