/// CAIP identifiers
///
/// Parsing and formatting of chain ids (`namespace:reference`, CAIP-2) and
/// account ids (`namespace:reference:address`, CAIP-10).
///
use std::fmt::{self, Display};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::constants::CAIP_DELIMITER;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChainNamespace {
    #[serde(rename = "eip155")]
    Eip155,

    #[serde(rename = "solana")]
    Solana,

    #[serde(rename = "bip122")]
    Bip122,

    #[serde(rename = "polkadot")]
    Polkadot,

    #[serde(rename = "sui")]
    Sui,

    #[serde(rename = "ton")]
    Ton,

    #[serde(rename = "tron")]
    Tron,

    #[serde(rename = "cosmos")]
    Cosmos,
}

impl ChainNamespace {
    pub const ALL: [ChainNamespace; 8] = [
        ChainNamespace::Eip155,
        ChainNamespace::Solana,
        ChainNamespace::Bip122,
        ChainNamespace::Polkadot,
        ChainNamespace::Sui,
        ChainNamespace::Ton,
        ChainNamespace::Tron,
        ChainNamespace::Cosmos,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChainNamespace::Eip155 => "eip155",
            ChainNamespace::Solana => "solana",
            ChainNamespace::Bip122 => "bip122",
            ChainNamespace::Polkadot => "polkadot",
            ChainNamespace::Sui => "sui",
            ChainNamespace::Ton => "ton",
            ChainNamespace::Tron => "tron",
            ChainNamespace::Cosmos => "cosmos",
        }
    }
}

impl Display for ChainNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChainNamespace {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        serde_plain::from_str(s).map_err(|_| Error::MalformedIdentifier {
            kind: "chain namespace",
            value: s.to_string(),
        })
    }
}

/// CAIP-2 chain id, e.g. `eip155:1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CaipNetworkId {
    pub namespace: ChainNamespace,
    pub reference: String,
}

impl CaipNetworkId {
    pub fn new(namespace: ChainNamespace, reference: impl Into<String>) -> Self {
        Self {
            namespace,
            reference: reference.into(),
        }
    }

    pub fn evm(chain_id: u64) -> Self {
        Self::new(ChainNamespace::Eip155, chain_id.to_string())
    }

    /// Decimal chain id of an `eip155` network.
    pub fn evm_chain_id(&self) -> Option<u64> {
        if self.namespace != ChainNamespace::Eip155 {
            return None;
        }
        self.reference.parse().ok()
    }

    /// `0x`-prefixed chain id as injected EVM providers expect it.
    pub fn evm_hex_chain_id(&self) -> Option<String> {
        self.evm_chain_id().map(|id| format!("{id:#x}"))
    }

    /// Parses the chain id reported by an injected EVM provider, which may be
    /// hex (`0x89`), decimal (`137`) or already CAIP-2 (`eip155:137`).
    pub fn from_evm_chain_id(value: &str) -> Result<Self> {
        if value.contains(CAIP_DELIMITER) {
            return parse_caip_network_id(value);
        }
        let id = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
            Some(hex) => u64::from_str_radix(hex, 16)?,
            None => value.parse::<u64>()?,
        };
        Ok(Self::evm(id))
    }
}

impl Display for CaipNetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{CAIP_DELIMITER}{}", self.namespace, self.reference)
    }
}

impl FromStr for CaipNetworkId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        parse_caip_network_id(s)
    }
}

impl Serialize for CaipNetworkId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CaipNetworkId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// CAIP-10 account id, e.g. `eip155:1:0xab16...`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CaipAddress {
    pub namespace: ChainNamespace,
    pub reference: String,
    pub address: String,
}

impl CaipAddress {
    pub fn new(network: &CaipNetworkId, address: impl Into<String>) -> Self {
        Self {
            namespace: network.namespace,
            reference: network.reference.clone(),
            address: address.into(),
        }
    }

    pub fn network_id(&self) -> CaipNetworkId {
        CaipNetworkId::new(self.namespace, self.reference.clone())
    }
}

impl Display for CaipAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{CAIP_DELIMITER}{}{CAIP_DELIMITER}{}",
            self.namespace, self.reference, self.address
        )
    }
}

impl FromStr for CaipAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        parse_caip_address(s)
    }
}

impl Serialize for CaipAddress {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CaipAddress {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

fn split_segments<'a>(
    value: &'a str,
    expected: usize,
    kind: &'static str,
) -> Result<Vec<&'a str>> {
    let segments: Vec<&str> = value.split(CAIP_DELIMITER).collect();
    if segments.len() != expected || segments.iter().any(|s| s.is_empty()) {
        return Err(Error::MalformedIdentifier {
            kind,
            value: value.to_string(),
        });
    }
    Ok(segments)
}

fn parse_namespace(segment: &str, value: &str, kind: &'static str) -> Result<ChainNamespace> {
    segment.parse().map_err(|_| Error::MalformedIdentifier {
        kind,
        value: value.to_string(),
    })
}

pub fn parse_caip_network_id(value: &str) -> Result<CaipNetworkId> {
    const KIND: &str = "CAIP-2 network id";
    let segments = split_segments(value, 2, KIND)?;
    Ok(CaipNetworkId {
        namespace: parse_namespace(segments[0], value, KIND)?,
        reference: segments[1].to_string(),
    })
}

pub fn parse_caip_address(value: &str) -> Result<CaipAddress> {
    const KIND: &str = "CAIP-10 address";
    let segments = split_segments(value, 3, KIND)?;
    Ok(CaipAddress {
        namespace: parse_namespace(segments[0], value, KIND)?,
        reference: segments[1].to_string(),
        address: segments[2].to_string(),
    })
}
