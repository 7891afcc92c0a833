use std::fmt::{self, Display};

use crate::caip::ChainNamespace;
use crate::constants::{
    EIP1193_CHAIN_NOT_ADDED, EIP1193_USER_REJECTED, EIP1474_USER_REJECTED,
};

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Debug)]
pub enum Error {
    /// A CAIP-2 / CAIP-10 string with the wrong number of segments or an
    /// empty segment.
    MalformedIdentifier {
        kind: &'static str,
        value: String,
    },
    ProviderNotFound(String),
    UserRejected,
    PairingExpired,
    PairingAborted,
    UnrecognizedChain(String),
    ConnectionInProgress(ChainNamespace),
    SessionRestoreFailed {
        namespace: ChainNamespace,
        reason: Box<Error>,
    },
    UnsupportedNamespace(ChainNamespace),
    UnknownNetwork(String),
    Unsupported(&'static str),
    NotConnected(ChainNamespace),
    ConnectionAborted(ChainNamespace),
    FrameTimeout(String),
    FrameError {
        request: String,
        message: String,
    },
    ProviderRpc {
        code: i64,
        message: String,
    },
    Transport(String),
    InvalidUri,
    SymKeyNotMentioned,
    RelayProtocolNotMentioned,
    PathEndNotFound,
    ParseInt(std::num::ParseIntError),
    Anyhow(anyhow::Error),
    Reqwest(reqwest::Error),
    Url(url::ParseError),
    Io(std::io::Error),
    InternalError(String),
    SerdeJsonError(serde_json::Error),
    FromHexError(alloy::hex::FromHexError),
    TimeError(time::error::Format),
}

impl Error {
    /// Maps an EIP-1193 / EIP-1474 provider error onto the typed taxonomy.
    pub fn from_provider_code(
        code: i64,
        message: impl Into<String>,
        chain: Option<&str>,
    ) -> Self {
        let message = message.into();
        match code {
            EIP1193_USER_REJECTED | EIP1474_USER_REJECTED => Error::UserRejected,
            EIP1193_CHAIN_NOT_ADDED => Error::UnrecognizedChain(
                chain.map(str::to_string).unwrap_or(message),
            ),
            _ => Error::ProviderRpc { code, message },
        }
    }

    pub fn is_user_rejection(&self) -> bool {
        matches!(self, Error::UserRejected)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::PairingExpired | Error::FrameTimeout(_))
    }

    pub fn restore_failed(namespace: ChainNamespace, reason: Error) -> Self {
        Error::SessionRestoreFailed {
            namespace,
            reason: Box::new(reason),
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::MalformedIdentifier { kind, value } => {
                write!(f, "Invalid {kind}: {value:?}")
            }
            Error::ProviderNotFound(id) => write!(
                f,
                "Wallet not found: no provider is available for connector {id:?}"
            ),
            Error::UserRejected => {
                write!(f, "You rejected the request in your wallet")
            }
            Error::PairingExpired => write!(
                f,
                "The connection request timed out before the wallet responded"
            ),
            Error::PairingAborted => write!(f, "The pairing was cancelled"),
            Error::UnrecognizedChain(chain) => write!(
                f,
                "Network {chain} is not added to the wallet yet"
            ),
            Error::ConnectionInProgress(ns) => {
                write!(f, "A connection for {ns} is already in progress")
            }
            Error::SessionRestoreFailed { namespace, reason } => {
                write!(f, "Could not restore {namespace} session: {reason}")
            }
            Error::UnsupportedNamespace(ns) => {
                write!(f, "No adapter is registered for namespace {ns}")
            }
            Error::UnknownNetwork(id) => write!(f, "Unknown network {id}"),
            Error::Unsupported(what) => {
                write!(f, "The connector does not support {what}")
            }
            Error::NotConnected(ns) => write!(f, "No wallet connected for {ns}"),
            Error::ConnectionAborted(ns) => {
                write!(f, "The {ns} connection was disconnected while connecting")
            }
            Error::FrameTimeout(request) => write!(
                f,
                "The request {request} timed out waiting for the auth frame"
            ),
            Error::FrameError { request, message } => {
                write!(f, "Auth frame request {request} failed: {message}")
            }
            Error::ProviderRpc { code, message } => {
                write!(f, "Wallet error {code}: {message}")
            }
            Error::Transport(message) => write!(f, "Transport error: {message}"),
            Error::InvalidUri => write!(f, "Invalid WalletConnect URI"),
            Error::SymKeyNotMentioned => {
                write!(f, "WalletConnect URI has no symKey")
            }
            Error::RelayProtocolNotMentioned => {
                write!(f, "WalletConnect URI has no relay-protocol")
            }
            Error::PathEndNotFound => {
                write!(f, "WalletConnect URI has no query string")
            }
            Error::ParseInt(e) => write!(f, "{e}"),
            Error::Anyhow(e) => write!(f, "{e}"),
            Error::Reqwest(e) => write!(f, "{e}"),
            Error::Url(e) => write!(f, "{e}"),
            Error::Io(e) => write!(f, "{e}"),
            Error::InternalError(e) => write!(f, "{e}"),
            Error::SerdeJsonError(e) => write!(f, "{e}"),
            Error::FromHexError(e) => write!(f, "{e}"),
            Error::TimeError(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<&str> for Error {
    fn from(e: &str) -> Self {
        Error::InternalError(e.to_string())
    }
}

impl From<String> for Error {
    fn from(e: String) -> Self {
        Error::InternalError(e)
    }
}

impl From<std::num::ParseIntError> for Error {
    fn from(e: std::num::ParseIntError) -> Self {
        Error::ParseInt(e)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Anyhow(e)
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Reqwest(e)
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::Url(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::SerdeJsonError(e)
    }
}

impl From<alloy::hex::FromHexError> for Error {
    fn from(e: alloy::hex::FromHexError) -> Self {
        Error::FromHexError(e)
    }
}


impl From<time::error::Format> for Error {
    fn from(e: time::error::Format) -> Self {
        Error::TimeError(e)
    }
}
