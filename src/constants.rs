use std::time::Duration;

// https://eips.ethereum.org/EIPS/eip-1193#provider-errors
pub const EIP1193_USER_REJECTED: i64 = 4001;
pub const EIP1193_UNAUTHORIZED: i64 = 4100;
pub const EIP1193_CHAIN_NOT_ADDED: i64 = 4902;
// https://eips.ethereum.org/EIPS/eip-1474#error-codes
pub const EIP1474_USER_REJECTED: i64 = 5000;

pub const JSONRPC_VERSION: &str = "2.0";

pub const CAIP_DELIMITER: char = ':';

// WalletConnect pairing URI
pub const WC_URI_SCHEME: &str = "wc:";
pub const WC_URI_VERSION: u32 = 2;
pub const WC_RELAY_PROTOCOL: &str = "irn";
pub const WC_SESSION_KEY_INFO: &[u8] = b"";

pub const DEFAULT_PAIRING_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_FRAME_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_RECONNECT_ATTEMPTS: u32 = 3;
pub const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_secs(1);
pub const DEFAULT_RECONNECT_MAX_BACKOFF: Duration = Duration::from_secs(8);

pub const DEFAULT_STORAGE_PREFIX: &str = "@appkit/";
pub const STORAGE_SESSION_SUFFIX: &str = ":session";
pub const STORAGE_ACTIVE_NETWORK_SUFFIX: &str = ":active_network";
pub const STORAGE_ACTIVE_NAMESPACE: &str = "active_namespace";

// Embedded auth frame
pub const FRAME_APP_EVENT_KEY: &str = "@w3m-app/";
pub const FRAME_EVENT_KEY: &str = "@w3m-frame/";
pub const FRAME_SUCCESS_SUFFIX: &str = "_SUCCESS";
pub const FRAME_ERROR_SUFFIX: &str = "_ERROR";
pub const FRAME_MAGIC_NUMBER: u32 = 0x7733_6d66;

// Well-known connector ids
pub const INJECTED_CONNECTOR_ID: &str = "injected";
pub const WALLET_CONNECT_CONNECTOR_ID: &str = "walletconnect";
pub const EMBEDDED_AUTH_CONNECTOR_ID: &str = "auth";

pub const BROADCAST_CAPACITY: usize = 64;
