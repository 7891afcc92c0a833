use async_trait::async_trait;

use super::{Amount, ConnectorSet, NamespaceAdapter};
use crate::caip::ChainNamespace;
use crate::connector::Connector;
use crate::error::{Error, Result};
use crate::network::CaipNetwork;

/// Namespaces reached only through WalletConnect (polkadot, sui, ton, tron,
/// cosmos). Addresses are passed through as the wallet reports them.
pub struct UniversalAdapter {
    namespace: ChainNamespace,
    connectors: ConnectorSet,
}

impl UniversalAdapter {
    pub fn new(namespace: ChainNamespace, connectors: Vec<Connector>) -> Self {
        Self {
            namespace,
            connectors: ConnectorSet::new(namespace, connectors),
        }
    }
}

#[async_trait]
impl NamespaceAdapter for UniversalAdapter {
    fn namespace(&self) -> ChainNamespace {
        self.namespace
    }

    fn connectors(&self) -> Vec<Connector> {
        self.connectors.all()
    }

    fn normalize_address(&self, address: &str) -> Result<String> {
        let address = address.trim();
        if address.is_empty() {
            return Err(Error::MalformedIdentifier {
                kind: "address",
                value: address.to_string(),
            });
        }
        Ok(address.to_string())
    }

    async fn get_balance(&self, _address: &str, _network: &CaipNetwork) -> Result<Amount> {
        Err(Error::Unsupported("balance lookups"))
    }
}
