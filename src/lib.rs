//! # multichain-session
//!
//! Wallet connection and session orchestration for dApps that talk to several
//! chain namespaces at once (`eip155`, `solana`, `bip122`, ...).
//!
//! ## Features
//! - CAIP-2 / CAIP-10 identifiers
//! - Injected (EIP-1193) and announced (EIP-6963) wallets
//! - WalletConnect pairing with expiry and cancellation
//! - Email wallets behind an embedded auth frame
//! - Per-namespace connection state with persistence and silent restore
//!
//! ## Example
//!
//! ```rust,ignore
//! let adapters: Vec<Arc<dyn NamespaceAdapter>> = vec![
//!     Arc::new(EvmAdapter::new(vec![Connector::Injected(InjectedConnector::new(
//!         "injected",
//!         "Browser Wallet",
//!         ChainNamespace::Eip155,
//!         window_ethereum,
//!     ))])),
//! ];
//!
//! let controller = ConnectionController::new(
//!     adapters,
//!     NetworkRegistry::with_defaults(),
//!     Arc::new(FileStore::new("session.json")),
//!     Config::from_env()?,
//! );
//!
//! // Picks up whatever was connected last time, without prompting.
//! let report = controller.restore_session().await;
//!
//! controller.subscribe(|state| println!("{state:?}"));
//!
//! let account = controller.connect(ChainNamespace::Eip155, "injected").await?;
//! let signature = controller
//!     .sign_message(ChainNamespace::Eip155, "hello")
//!     .await?;
//! ```
//!
//! ## License
//! MIT OR Apache-2.0

pub mod adapters;
pub mod caip;
pub mod config;
pub mod connector;
pub mod constants;
pub mod controller;
pub mod embedded;
pub mod error;
pub mod events;
pub mod frame;
pub mod injected;
pub mod network;
pub mod pairing;
pub mod provider;
pub mod rpc;
pub mod state;
pub mod storage;
pub mod utils;
pub mod walletconnect;

#[cfg(test)]
pub(crate) mod testing;

/// Exposed for easy access
pub use adapters::NamespaceAdapter;
pub use caip::{CaipAddress, CaipNetworkId, ChainNamespace};
pub use config::{Config, Metadata};
pub use connector::Connector;
pub use controller::{ConnectionController, RestoreReport};
pub use error::Error;
pub use network::{CaipNetwork, NetworkRegistry};
pub use state::{Account, ConnectionState, ConnectionStatus};
pub use storage::{FileStore, KeyValueStore, MemoryStore};
