/// Pairing
///
/// Keys, topics and the `wc:` URI for a WalletConnect pairing proposed by
/// this dApp. The URI is what the UI renders as a QR code or deep link.
///
use std::collections::HashMap;
use std::fmt::{self, Display};

use alloy::hex;
use base64ct::{Base64, Encoding};
use hkdf::Hkdf;
use sha2::Sha256;
use url::form_urlencoded;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::constants::{WC_RELAY_PROTOCOL, WC_SESSION_KEY_INFO, WC_URI_SCHEME, WC_URI_VERSION};
use crate::error::{Error, Result};
use crate::utils::{random_bytes32, sha256_hex};

#[derive(Debug, Clone, PartialEq)]
pub struct UriParameters {
    pub topic: String,
    pub version: u32,
    pub sym_key: [u8; 32],
    pub relay: RelayProtocolOptions,
    pub methods: Option<Vec<String>>,
    pub expiry_timestamp: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelayProtocolOptions {
    pub protocol: String,
    pub data: Option<String>,
}

impl Display for UriParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut query = form_urlencoded::Serializer::new(String::new());
        query.append_pair("relay-protocol", &self.relay.protocol);
        if let Some(data) = &self.relay.data {
            query.append_pair("relay-data", data);
        }
        query.append_pair("symKey", &hex::encode(self.sym_key));
        if let Some(expiry) = self.expiry_timestamp {
            query.append_pair("expiryTimestamp", &expiry.to_string());
        }
        if let Some(methods) = &self.methods {
            query.append_pair("methods", &methods.join(","));
        }
        write!(
            f,
            "{WC_URI_SCHEME}{}@{}?{}",
            self.topic,
            self.version,
            query.finish()
        )
    }
}

impl TryFrom<&str> for UriParameters {
    type Error = Error;

    fn try_from(uri: &str) -> Result<Self> {
        parse_uri(uri)
    }
}

pub fn parse_uri(input: &str) -> Result<UriParameters> {
    let mut input = input.trim().to_string();
    if !input.contains(WC_URI_SCHEME) {
        // Some wallets hand the URI around base64 encoded
        if let Ok(decoded) = Base64::decode_vec(&input) {
            if let Ok(decoded) = String::from_utf8(decoded) {
                if decoded.contains(WC_URI_SCHEME) {
                    input = decoded;
                }
            }
        }
    }

    let rest = input
        .strip_prefix("wc://")
        .or_else(|| input.strip_prefix(WC_URI_SCHEME))
        .ok_or(Error::InvalidUri)?;

    let (path, query_string) = rest.split_once('?').ok_or(Error::PathEndNotFound)?;
    let (topic, version) = path.split_once('@').ok_or(Error::InvalidUri)?;
    if topic.is_empty() || version.contains('@') {
        return Err(Error::InvalidUri);
    }

    let query_params: HashMap<String, String> = form_urlencoded::parse(query_string.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    let sym_key = query_params
        .get("symKey")
        .ok_or(Error::SymKeyNotMentioned)?;

    Ok(UriParameters {
        topic: topic.trim_start_matches("//").to_string(),
        version: version.parse()?,
        sym_key: hex::decode_to_array::<_, 32>(sym_key)?,
        relay: RelayProtocolOptions {
            protocol: query_params
                .get("relay-protocol")
                .ok_or(Error::RelayProtocolNotMentioned)?
                .clone(),
            data: query_params.get("relay-data").cloned(),
        },
        methods: query_params
            .get("methods")
            .map(|m| m.split(',').map(|s| s.to_string()).collect()),
        expiry_timestamp: query_params
            .get("expiryTimestamp")
            .and_then(|v| v.parse().ok()),
    })
}

/// Key material for one proposal. The proposer secret never leaves this
/// struct; only its public half travels in the proposal.
#[derive(Clone)]
pub struct PairingKeys {
    sym_key: [u8; 32],
    proposer_secret: [u8; 32],
}

impl fmt::Debug for PairingKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PairingKeys")
            .field("topic", &self.topic())
            .finish_non_exhaustive()
    }
}

impl PairingKeys {
    pub fn generate() -> Self {
        Self::from_parts(random_bytes32(), random_bytes32())
    }

    pub fn from_parts(sym_key: [u8; 32], proposer_secret: [u8; 32]) -> Self {
        Self {
            sym_key,
            proposer_secret,
        }
    }

    /// Pairing topic: sha256 of the symmetric key.
    pub fn topic(&self) -> String {
        sha256_hex(self.sym_key)
    }

    pub fn sym_key(&self) -> [u8; 32] {
        self.sym_key
    }

    pub fn proposer_public_key(&self) -> String {
        let secret = StaticSecret::from(self.proposer_secret);
        hex::encode(PublicKey::from(&secret).to_bytes())
    }

    pub fn uri(&self, expiry_timestamp: u64, methods: Option<Vec<String>>) -> UriParameters {
        UriParameters {
            topic: self.topic(),
            version: WC_URI_VERSION,
            sym_key: self.sym_key,
            relay: RelayProtocolOptions {
                protocol: WC_RELAY_PROTOCOL.to_string(),
                data: None,
            },
            methods,
            expiry_timestamp: Some(expiry_timestamp),
        }
    }

    /// Session symmetric key agreed with the responder (x25519 + HKDF-SHA256).
    pub fn session_sym_key(&self, responder_public_key: &str) -> Result<[u8; 32]> {
        let responder = hex::decode_to_array::<_, 32>(responder_public_key)?;
        Ok(derive_sym_key(self.proposer_secret, responder))
    }

    /// Session topic: sha256 of the session symmetric key.
    pub fn session_topic(&self, responder_public_key: &str) -> Result<String> {
        Ok(sha256_hex(self.session_sym_key(responder_public_key)?))
    }
}

pub fn derive_sym_key(self_secret: [u8; 32], other_public: [u8; 32]) -> [u8; 32] {
    let secret = StaticSecret::from(self_secret);
    let shared = secret.diffie_hellman(&PublicKey::from(other_public));
    let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
    let mut okm = [0u8; 32];
    hk.expand(WC_SESSION_KEY_INFO, &mut okm)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    okm
}
