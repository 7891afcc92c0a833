use alloy::primitives::U256;
use async_trait::async_trait;
use serde::Deserialize;
use url::Url;

use super::{Amount, ConnectorSet, NamespaceAdapter};
use crate::caip::ChainNamespace;
use crate::connector::Connector;
use crate::error::{Error, Result};
use crate::network::CaipNetwork;
use crate::provider::ProviderAnnouncement;
use crate::rpc::RpcClient;

/// Balances come from an Esplora compatible indexer at the network's rpc url.
pub struct BitcoinAdapter {
    connectors: ConnectorSet,
    rpc: RpcClient,
}

impl BitcoinAdapter {
    pub fn new(connectors: Vec<Connector>) -> Self {
        Self {
            connectors: ConnectorSet::new(ChainNamespace::Bip122, connectors),
            rpc: RpcClient::new(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct TxoStats {
    funded_txo_sum: u64,
    spent_txo_sum: u64,
}

#[derive(Debug, Deserialize)]
struct AddressStats {
    chain_stats: TxoStats,
    #[serde(default)]
    mempool_stats: TxoStats,
}

impl AddressStats {
    fn confirmed_and_pending(&self) -> u64 {
        let funded = self.chain_stats.funded_txo_sum + self.mempool_stats.funded_txo_sum;
        let spent = self.chain_stats.spent_txo_sum + self.mempool_stats.spent_txo_sum;
        funded.saturating_sub(spent)
    }
}

fn address_url(base: &Url, address: &str) -> Result<Url> {
    let base = base.as_str().trim_end_matches('/');
    Ok(Url::parse(&format!("{base}/address/{address}"))?)
}

#[async_trait]
impl NamespaceAdapter for BitcoinAdapter {
    fn namespace(&self) -> ChainNamespace {
        ChainNamespace::Bip122
    }

    fn connectors(&self) -> Vec<Connector> {
        self.connectors.all()
    }

    fn announce(&self, announcement: ProviderAnnouncement) -> bool {
        self.connectors.announce(announcement)
    }

    /// Format checks are left to the wallet; only obvious garbage is refused.
    fn normalize_address(&self, address: &str) -> Result<String> {
        let address = address.trim();
        if address.is_empty() || !address.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(Error::MalformedIdentifier {
                kind: "Bitcoin address",
                value: address.to_string(),
            });
        }
        Ok(address.to_string())
    }

    async fn get_balance(&self, address: &str, network: &CaipNetwork) -> Result<Amount> {
        let url = address_url(network.rpc_url()?, address)?;
        let stats: AddressStats = serde_json::from_value(self.rpc.get_json(url).await?)?;
        Amount::native(U256::from(stats.confirmed_and_pending()), network)
    }
}
