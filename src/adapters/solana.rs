use alloy::primitives::U256;
use async_trait::async_trait;
use serde_json::{Value, json};

use super::{Amount, ConnectorSet, NamespaceAdapter};
use crate::caip::ChainNamespace;
use crate::connector::Connector;
use crate::error::{Error, Result};
use crate::network::CaipNetwork;
use crate::provider::{ProviderAnnouncement, methods};
use crate::rpc::RpcClient;

pub struct SolanaAdapter {
    connectors: ConnectorSet,
    rpc: RpcClient,
}

impl SolanaAdapter {
    pub fn new(connectors: Vec<Connector>) -> Self {
        Self {
            connectors: ConnectorSet::new(ChainNamespace::Solana, connectors),
            rpc: RpcClient::new(),
        }
    }
}

/// A Solana address is the base58 form of a 32 byte public key.
pub fn validate_address(address: &str) -> Result<String> {
    let address = address.trim();
    match bs58::decode(address).into_vec() {
        Ok(bytes) if bytes.len() == 32 => Ok(address.to_string()),
        _ => Err(Error::MalformedIdentifier {
            kind: "Solana address",
            value: address.to_string(),
        }),
    }
}

/// `getBalance` answers `{context, value}` with the lamports in `value`.
fn lamports(result: &Value) -> Result<u64> {
    result
        .get("value")
        .unwrap_or(result)
        .as_u64()
        .ok_or_else(|| format!("unexpected getBalance result {result}").into())
}

#[async_trait]
impl NamespaceAdapter for SolanaAdapter {
    fn namespace(&self) -> ChainNamespace {
        ChainNamespace::Solana
    }

    fn connectors(&self) -> Vec<Connector> {
        self.connectors.all()
    }

    fn announce(&self, announcement: ProviderAnnouncement) -> bool {
        self.connectors.announce(announcement)
    }

    fn normalize_address(&self, address: &str) -> Result<String> {
        validate_address(address)
    }

    async fn get_balance(&self, address: &str, network: &CaipNetwork) -> Result<Amount> {
        let result = self
            .rpc
            .call(network.rpc_url()?, methods::SOLANA_GET_BALANCE, json!([address]))
            .await?;
        Amount::native(U256::from(lamports(&result)?), network)
    }
}
