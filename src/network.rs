//! Chain / network registry.
//!
//! Holds the catalog of supported [`CaipNetwork`]s and the active network per
//! namespace. Registry bookkeeping never talks to a wallet; switching the
//! wallet itself is the controller's job.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use url::Url;

use crate::caip::{CaipNetworkId, ChainNamespace};
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeCurrency {
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockExplorer {
    pub name: String,
    pub url: Url,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaipNetwork {
    pub id: CaipNetworkId,
    pub name: String,
    #[serde(rename = "nativeCurrency")]
    pub native_currency: NativeCurrency,
    #[serde(rename = "rpcUrls")]
    pub rpc_urls: Vec<Url>,
    #[serde(rename = "blockExplorer", skip_serializing_if = "Option::is_none")]
    pub block_explorer: Option<BlockExplorer>,
    pub testnet: bool,
    #[serde(rename = "imageId", skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
    /// Older genesis-based id some wallets and persisted sessions still use.
    #[serde(rename = "deprecatedId", skip_serializing_if = "Option::is_none")]
    pub deprecated_id: Option<CaipNetworkId>,
}

impl CaipNetwork {
    pub fn namespace(&self) -> ChainNamespace {
        self.id.namespace
    }

    pub fn matches(&self, id: &CaipNetworkId) -> bool {
        &self.id == id || self.deprecated_id.as_ref() == Some(id)
    }

    pub fn rpc_url(&self) -> Result<&Url> {
        self.rpc_urls
            .first()
            .ok_or_else(|| format!("network {} has no rpc url", self.id).into())
    }

    /// Parameters for `wallet_addEthereumChain` (EIP-3085).
    pub fn add_chain_params(&self) -> Result<Value> {
        let chain_id = self
            .id
            .evm_hex_chain_id()
            .ok_or(Error::Unsupported("adding a non-EVM chain"))?;
        Ok(json!({
            "chainId": chain_id,
            "chainName": self.name,
            "nativeCurrency": self.native_currency,
            "rpcUrls": self.rpc_urls,
            "blockExplorerUrls": self
                .block_explorer
                .as_ref()
                .map(|e| vec![e.url.clone()])
                .unwrap_or_default(),
        }))
    }
}

#[derive(Debug, Clone, Default)]
pub struct NetworkRegistry {
    networks: Vec<CaipNetwork>,
    active: HashMap<ChainNamespace, CaipNetworkId>,
}

impl NetworkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with [`builtin_networks`].
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for network in builtin_networks() {
            // builtin ids are unique
            let _ = registry.register(network);
        }
        registry
    }

    pub fn register(&mut self, network: CaipNetwork) -> Result<()> {
        let clash = self.networks.iter().any(|n| {
            n.matches(&network.id)
                || network
                    .deprecated_id
                    .as_ref()
                    .is_some_and(|alias| n.matches(alias))
        });
        if clash {
            return Err(format!("network {} is already registered", network.id).into());
        }
        self.networks.push(network);
        Ok(())
    }

    pub fn networks(&self) -> &[CaipNetwork] {
        &self.networks
    }

    pub fn get_networks_for_namespace(&self, namespace: ChainNamespace) -> Vec<CaipNetwork> {
        self.networks
            .iter()
            .filter(|n| n.namespace() == namespace)
            .cloned()
            .collect()
    }

    /// Resolves a canonical or deprecated-alias id to the canonical network.
    pub fn resolve_network(&self, id: &CaipNetworkId) -> Result<&CaipNetwork> {
        self.networks
            .iter()
            .find(|n| n.matches(id))
            .ok_or_else(|| Error::UnknownNetwork(id.to_string()))
    }

    pub fn default_network(&self, namespace: ChainNamespace) -> Option<&CaipNetwork> {
        self.networks.iter().find(|n| n.namespace() == namespace)
    }

    pub fn active_network(&self, namespace: ChainNamespace) -> Option<&CaipNetwork> {
        self.active
            .get(&namespace)
            .and_then(|id| self.resolve_network(id).ok())
    }

    /// Active network, falling back to the namespace default.
    pub fn active_or_default(&self, namespace: ChainNamespace) -> Option<&CaipNetwork> {
        self.active_network(namespace)
            .or_else(|| self.default_network(namespace))
    }

    pub fn set_active_network(
        &mut self,
        namespace: ChainNamespace,
        id: &CaipNetworkId,
    ) -> Result<&CaipNetwork> {
        if id.namespace != namespace {
            return Err(Error::UnknownNetwork(format!("{id} in namespace {namespace}")));
        }
        let canonical = self.resolve_network(id)?.id.clone();
        self.active.insert(namespace, canonical.clone());
        self.resolve_network(&canonical)
    }
}

fn url(s: &str) -> Url {
    Url::parse(s).expect("builtin url is valid")
}

fn explorer(name: &str, u: &str) -> Option<BlockExplorer> {
    Some(BlockExplorer {
        name: name.to_string(),
        url: url(u),
    })
}

fn currency(name: &str, symbol: &str, decimals: u8) -> NativeCurrency {
    NativeCurrency {
        name: name.to_string(),
        symbol: symbol.to_string(),
        decimals,
    }
}

pub fn builtin_networks() -> Vec<CaipNetwork> {
    let ether = currency("Ether", "ETH", 18);
    let sol = currency("Solana", "SOL", 9);
    vec![
        CaipNetwork {
            id: CaipNetworkId::evm(1),
            name: "Ethereum".to_string(),
            native_currency: ether.clone(),
            rpc_urls: vec![url("https://eth.merkle.io")],
            block_explorer: explorer("Etherscan", "https://etherscan.io"),
            testnet: false,
            image_id: None,
            deprecated_id: None,
        },
        CaipNetwork {
            id: CaipNetworkId::evm(11155111),
            name: "Sepolia".to_string(),
            native_currency: currency("Sepolia Ether", "ETH", 18),
            rpc_urls: vec![url("https://sepolia.drpc.org")],
            block_explorer: explorer("Etherscan", "https://sepolia.etherscan.io"),
            testnet: true,
            image_id: None,
            deprecated_id: None,
        },
        CaipNetwork {
            id: CaipNetworkId::evm(137),
            name: "Polygon".to_string(),
            native_currency: currency("POL", "POL", 18),
            rpc_urls: vec![url("https://polygon-rpc.com")],
            block_explorer: explorer("PolygonScan", "https://polygonscan.com"),
            testnet: false,
            image_id: None,
            deprecated_id: None,
        },
        CaipNetwork {
            id: CaipNetworkId::evm(8453),
            name: "Base".to_string(),
            native_currency: ether,
            rpc_urls: vec![url("https://mainnet.base.org")],
            block_explorer: explorer("Basescan", "https://basescan.org"),
            testnet: false,
            image_id: None,
            deprecated_id: None,
        },
        CaipNetwork {
            id: CaipNetworkId::new(ChainNamespace::Solana, "5eykt4UsFv8P8NJdTREpY1vzqKqZKvdp"),
            name: "Solana".to_string(),
            native_currency: sol.clone(),
            rpc_urls: vec![url("https://api.mainnet-beta.solana.com")],
            block_explorer: explorer("Solscan", "https://solscan.io"),
            testnet: false,
            image_id: None,
            deprecated_id: Some(CaipNetworkId::new(
                ChainNamespace::Solana,
                "4sGjMW1sUnHzSxGspuhpqLDx6wiyjNtZ",
            )),
        },
        CaipNetwork {
            id: CaipNetworkId::new(ChainNamespace::Solana, "EtWTRABZaYq6iMfeYKouRu166VU2xqa1"),
            name: "Solana Devnet".to_string(),
            native_currency: sol,
            rpc_urls: vec![url("https://api.devnet.solana.com")],
            block_explorer: explorer("Solscan", "https://solscan.io/?cluster=devnet"),
            testnet: true,
            image_id: None,
            deprecated_id: Some(CaipNetworkId::new(
                ChainNamespace::Solana,
                "8E9rvCKLFQia2Y35HXjjpWzj8weVo44K",
            )),
        },
        CaipNetwork {
            id: CaipNetworkId::new(ChainNamespace::Bip122, "000000000019d6689c085ae165831e93"),
            name: "Bitcoin".to_string(),
            native_currency: currency("Bitcoin", "BTC", 8),
            rpc_urls: vec![url("https://mempool.space/api")],
            block_explorer: explorer("Mempool", "https://mempool.space"),
            testnet: false,
            image_id: None,
            deprecated_id: None,
        },
        CaipNetwork {
            id: CaipNetworkId::new(ChainNamespace::Bip122, "000000000933ea01ad0ee984209779ba"),
            name: "Bitcoin Testnet".to_string(),
            native_currency: currency("Bitcoin", "BTC", 8),
            rpc_urls: vec![url("https://mempool.space/testnet/api")],
            block_explorer: explorer("Mempool", "https://mempool.space/testnet"),
            testnet: true,
            image_id: None,
            deprecated_id: None,
        },
    ]
}
