use std::sync::Arc;

use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use log::info;
use serde_json::{Value, json};

use super::{AccountProfile, Amount, ConnectorSet, NamespaceAdapter, ProfileResolver};
use crate::caip::ChainNamespace;
use crate::connector::{Capability, Connector};
use crate::error::{Error, Result};
use crate::network::CaipNetwork;
use crate::provider::{ProviderAnnouncement, methods};
use crate::rpc::RpcClient;

pub struct EvmAdapter {
    connectors: ConnectorSet,
    rpc: RpcClient,
    profiles: Option<Arc<dyn ProfileResolver>>,
}

impl EvmAdapter {
    pub fn new(connectors: Vec<Connector>) -> Self {
        Self {
            connectors: ConnectorSet::new(ChainNamespace::Eip155, connectors),
            rpc: RpcClient::new(),
            profiles: None,
        }
    }

    pub fn with_profile_resolver(mut self, resolver: Arc<dyn ProfileResolver>) -> Self {
        self.profiles = Some(resolver);
        self
    }

    pub fn connector_set(&self) -> &ConnectorSet {
        &self.connectors
    }
}

/// EIP-55 checksummed form.
pub fn checksum_address(address: &str) -> Result<String> {
    let parsed: Address = address.trim().parse().map_err(|_| Error::MalformedIdentifier {
        kind: "EVM address",
        value: address.to_string(),
    })?;
    Ok(parsed.to_checksum(None))
}

pub(crate) fn parse_quantity(value: &Value) -> Result<U256> {
    let raw = value
        .as_str()
        .ok_or_else(|| Error::from(format!("expected a hex quantity, got {value}")))?;
    raw.parse::<U256>()
        .map_err(|e| Error::from(format!("invalid quantity {raw:?}: {e}")))
}

#[async_trait]
impl NamespaceAdapter for EvmAdapter {
    fn namespace(&self) -> ChainNamespace {
        ChainNamespace::Eip155
    }

    fn connectors(&self) -> Vec<Connector> {
        self.connectors.all()
    }

    fn announce(&self, announcement: ProviderAnnouncement) -> bool {
        self.connectors.announce(announcement)
    }

    fn normalize_address(&self, address: &str) -> Result<String> {
        checksum_address(address)
    }

    async fn get_balance(&self, address: &str, network: &CaipNetwork) -> Result<Amount> {
        let result = self
            .rpc
            .call(
                network.rpc_url()?,
                methods::ETH_GET_BALANCE,
                json!([address, "latest"]),
            )
            .await?;
        Amount::native(parse_quantity(&result)?, network)
    }

    async fn get_account_profile(
        &self,
        address: &str,
        network: &CaipNetwork,
    ) -> Result<Option<AccountProfile>> {
        match &self.profiles {
            Some(resolver) => resolver.resolve(address, network).await,
            None => Ok(None),
        }
    }

    /// Injected wallets that do not know the chain get it added first, then
    /// the switch is retried once.
    async fn normalize_network_switch(
        &self,
        connector: &Connector,
        network: &CaipNetwork,
    ) -> Result<()> {
        match connector.switch_network(network).await {
            Err(Error::UnrecognizedChain(chain)) if connector.supports(Capability::AddNetwork) => {
                info!("{} does not know {chain}, adding it", connector.id());
                connector.add_network(network).await?;
                connector.switch_network(network).await
            }
            other => other,
        }
    }
}
