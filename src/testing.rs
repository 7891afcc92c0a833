//! In-memory stand-ins for wallets, the relay client and the auth frame.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::{Notify, broadcast};

use crate::caip::{CaipAddress, CaipNetworkId, ChainNamespace};
use crate::constants::{BROADCAST_CAPACITY, FRAME_APP_EVENT_KEY};
use crate::error::{Error, Result};
use crate::frame::{FrameChannel, FrameMessage};
use crate::provider::{InjectedProvider, ProviderEvent, RequestArguments, methods};
use crate::utils::{random_hex_id, unix_timestamp};
use crate::walletconnect::{SessionProposal, SessionSettlement, SignClient, SignClientEvent};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, Copy)]
enum Failure {
    Reject,
    Code(i64),
}

#[derive(Default)]
struct WalletState {
    accounts: Vec<String>,
    chain_id: String,
    solana_key: Option<String>,
    calls: Vec<RequestArguments>,
    failures: HashMap<String, Failure>,
    holds: HashMap<String, Arc<Notify>>,
}

pub struct MockInjectedProvider {
    state: Mutex<WalletState>,
    events: broadcast::Sender<ProviderEvent>,
}

impl MockInjectedProvider {
    fn with_state(state: WalletState) -> Arc<Self> {
        let (events, _) = broadcast::channel(BROADCAST_CAPACITY);
        Arc::new(Self {
            state: Mutex::new(state),
            events,
        })
    }

    pub fn evm(accounts: &[&str], chain_id: &str) -> Arc<Self> {
        Self::with_state(WalletState {
            accounts: accounts.iter().map(|a| a.to_string()).collect(),
            chain_id: chain_id.to_string(),
            ..Default::default()
        })
    }

    pub fn solana(public_key: &str) -> Arc<Self> {
        Self::with_state(WalletState {
            accounts: vec![public_key.to_string()],
            solana_key: Some(public_key.to_string()),
            ..Default::default()
        })
    }

    pub fn calls_to(&self, method: &str) -> usize {
        lock(&self.state)
            .calls
            .iter()
            .filter(|c| c.method == method)
            .count()
    }

    pub fn last_request(&self) -> Option<RequestArguments> {
        lock(&self.state).calls.last().cloned()
    }

    pub fn set_accounts(&self, accounts: &[&str]) {
        lock(&self.state).accounts = accounts.iter().map(|a| a.to_string()).collect();
    }

    /// The next `method` call is rejected by the user.
    pub fn reject_next(&self, method: &str) {
        lock(&self.state)
            .failures
            .insert(method.to_string(), Failure::Reject);
    }

    /// The next `method` call fails with a raw provider code.
    pub fn fail_with_code(&self, method: &str, code: i64) {
        lock(&self.state)
            .failures
            .insert(method.to_string(), Failure::Code(code));
    }

    /// Calls to `method` wait until the returned gate is notified once.
    pub fn hold(&self, method: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        lock(&self.state)
            .holds
            .insert(method.to_string(), gate.clone());
        gate
    }

    pub fn emit(&self, event: ProviderEvent) {
        let _ = self.events.send(event);
    }

    fn answer(&self, args: &RequestArguments) -> Result<Value> {
        let mut state = lock(&self.state);
        if let Some(failure) = state.failures.remove(&args.method) {
            return Err(match failure {
                Failure::Reject => Error::UserRejected,
                Failure::Code(code) => Error::ProviderRpc {
                    code,
                    message: format!("{} failed", args.method),
                },
            });
        }
        let method = args.method.as_str();
        let value = match method {
            methods::ETH_REQUEST_ACCOUNTS | methods::ETH_ACCOUNTS => json!(state.accounts),
            methods::BITCOIN_REQUEST_ACCOUNTS | methods::BITCOIN_GET_ACCOUNTS => {
                json!(state.accounts)
            }
            methods::ETH_CHAIN_ID => json!(state.chain_id),
            methods::PERSONAL_SIGN => json!(format!("0x{}", "ab".repeat(65))),
            methods::ETH_SEND_TRANSACTION => json!(format!("0x{}", "cd".repeat(32))),
            methods::WALLET_SWITCH_CHAIN => {
                if let Some(chain) = args
                    .params
                    .as_ref()
                    .and_then(|p| p[0]["chainId"].as_str())
                {
                    state.chain_id = chain.to_string();
                }
                Value::Null
            }
            methods::WALLET_ADD_CHAIN | methods::WALLET_REVOKE_PERMISSIONS => Value::Null,
            methods::SOLANA_CONNECT => match &state.solana_key {
                Some(key) => json!({ "publicKey": key }),
                None => return Err(Error::UserRejected),
            },
            methods::SOLANA_DISCONNECT => Value::Null,
            methods::SOLANA_SIGN_MESSAGE => json!({ "signature": "5igna7ure" }),
            _ => {
                return Err(Error::ProviderRpc {
                    code: -32601,
                    message: format!("method {method} not found"),
                });
            }
        };
        Ok(value)
    }
}

#[async_trait]
impl InjectedProvider for MockInjectedProvider {
    async fn request(&self, args: RequestArguments) -> Result<Value> {
        let gate = {
            let mut state = lock(&self.state);
            state.calls.push(args.clone());
            state.holds.get(&args.method).cloned()
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.answer(&args)
    }

    fn subscribe(&self) -> broadcast::Receiver<ProviderEvent> {
        self.events.subscribe()
    }
}

#[derive(Default)]
struct RelayState {
    approve: Option<Vec<CaipAddress>>,
    reject: bool,
    stall_proposals: bool,
    proposals: Vec<SessionProposal>,
    abandoned: usize,
    restorable: Option<SessionSettlement>,
    reconnect_failures: u32,
    reconnect_calls: u32,
    deleted: Vec<String>,
}

pub struct MockSignClient {
    state: Mutex<RelayState>,
    events: broadcast::Sender<SignClientEvent>,
}

impl MockSignClient {
    /// Proposals stay unanswered until `approve_with` or `reject`.
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(BROADCAST_CAPACITY);
        Arc::new(Self {
            state: Mutex::new(RelayState::default()),
            events,
        })
    }

    pub fn approve_with(&self, accounts: &[String]) {
        let accounts = accounts
            .iter()
            .map(|a| a.parse().expect("valid CAIP-10 account"))
            .collect();
        lock(&self.state).approve = Some(accounts);
    }

    pub fn reject(&self) {
        lock(&self.state).reject = true;
    }

    /// Proposals are recorded but never reach the relay.
    pub fn stall_proposals(&self) {
        lock(&self.state).stall_proposals = true;
    }

    pub fn last_proposal(&self) -> Option<SessionProposal> {
        lock(&self.state).proposals.last().cloned()
    }

    pub fn abandoned(&self) -> usize {
        lock(&self.state).abandoned
    }

    pub fn fail_reconnects(&self, count: u32) {
        lock(&self.state).reconnect_failures = count;
    }

    pub fn reconnect_calls(&self) -> u32 {
        lock(&self.state).reconnect_calls
    }

    pub fn deleted(&self) -> Vec<String> {
        lock(&self.state).deleted.clone()
    }

    pub fn emit(&self, event: SignClientEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl SignClient for MockSignClient {
    async fn propose(&self, proposal: &SessionProposal) -> Result<()> {
        let stalled = {
            let mut state = lock(&self.state);
            state.proposals.push(proposal.clone());
            state.stall_proposals
        };
        if stalled {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn await_settlement(&self, _pairing_topic: &str) -> Result<SessionSettlement> {
        let settlement = {
            let mut state = lock(&self.state);
            if state.reject {
                return Err(Error::UserRejected);
            }
            match state.approve.clone() {
                Some(accounts) => {
                    let settlement = SessionSettlement {
                        topic: random_hex_id(),
                        responder_public_key: None,
                        accounts,
                        expiry: unix_timestamp()? + 7 * 24 * 3600,
                    };
                    state.restorable = Some(settlement.clone());
                    Some(settlement)
                }
                None => None,
            }
        };
        match settlement {
            Some(settlement) => Ok(settlement),
            None => std::future::pending().await,
        }
    }

    async fn restore(&self, namespace: ChainNamespace) -> Result<Option<SessionSettlement>> {
        Ok(lock(&self.state)
            .restorable
            .clone()
            .filter(|s| s.accounts.iter().any(|a| a.namespace == namespace)))
    }

    async fn reconnect_transport(&self) -> Result<()> {
        let mut state = lock(&self.state);
        state.reconnect_calls += 1;
        if state.reconnect_failures > 0 {
            state.reconnect_failures -= 1;
            return Err(Error::Transport("relay unreachable".to_string()));
        }
        Ok(())
    }

    async fn request(
        &self,
        topic: &str,
        _chain_id: &CaipNetworkId,
        args: RequestArguments,
    ) -> Result<Value> {
        if lock(&self.state).deleted.iter().any(|t| t == topic) {
            return Err(Error::NotConnected(ChainNamespace::Eip155));
        }
        match args.method.as_str() {
            methods::WALLET_SWITCH_CHAIN => Ok(Value::Null),
            _ => Ok(json!(format!("0x{}", "ef".repeat(32)))),
        }
    }

    async fn delete_session(&self, topic: &str) -> Result<()> {
        let mut state = lock(&self.state);
        state.deleted.push(topic.to_string());
        state.restorable = None;
        Ok(())
    }

    async fn abandon_pairing(&self, _pairing_topic: &str) -> Result<()> {
        lock(&self.state).abandoned += 1;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<SignClientEvent> {
        self.events.subscribe()
    }
}

pub struct MockFrameChannel {
    responses: Mutex<HashMap<String, std::result::Result<Value, String>>>,
    posted: Mutex<Vec<FrameMessage>>,
    frame: broadcast::Sender<FrameMessage>,
}

impl MockFrameChannel {
    /// Requests without a configured response are never answered.
    pub fn new() -> Arc<Self> {
        let (frame, _) = broadcast::channel(BROADCAST_CAPACITY);
        Arc::new(Self {
            responses: Mutex::new(HashMap::new()),
            posted: Mutex::new(Vec::new()),
            frame,
        })
    }

    /// Answers every later `kind` request with `response`.
    pub fn respond(&self, kind: &str, response: std::result::Result<Value, String>) {
        lock(&self.responses).insert(kind.to_string(), response);
    }

    pub fn posted(&self, kind: &str) -> usize {
        let message_type = format!("{FRAME_APP_EVENT_KEY}{kind}");
        lock(&self.posted)
            .iter()
            .filter(|m| m.message_type == message_type)
            .count()
    }

    pub fn last_posted(&self, kind: &str) -> Option<FrameMessage> {
        let message_type = format!("{FRAME_APP_EVENT_KEY}{kind}");
        lock(&self.posted)
            .iter()
            .rev()
            .find(|m| m.message_type == message_type)
            .cloned()
    }

    pub fn emit(&self, message: FrameMessage) {
        let _ = self.frame.send(message);
    }
}

#[async_trait]
impl FrameChannel for MockFrameChannel {
    async fn post(&self, message: FrameMessage) -> Result<()> {
        lock(&self.posted).push(message.clone());
        let kind = message
            .message_type
            .strip_prefix(FRAME_APP_EVENT_KEY)
            .unwrap_or(&message.message_type)
            .to_string();
        let response = lock(&self.responses).get(&kind).cloned();
        let reply = match response {
            Some(Ok(payload)) => FrameMessage::reply(&message, true, payload),
            Some(Err(error)) => FrameMessage::reply(&message, false, json!({ "message": error })),
            None => return Ok(()),
        };
        let _ = self.frame.send(reply);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<FrameMessage> {
        self.frame.subscribe()
    }
}
