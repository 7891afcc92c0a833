//! Connection controller
//!
//! The only writer of [`ConnectionState`] and of the persisted sessions. Each
//! namespace has an independent lifecycle:
//!
//! ```text
//! disconnected -> connecting -> connected
//!       ^             |            |  ^
//!       +-------------+            v  |
//!       +-------------------- reconnecting
//! ```
//!
//! Handshakes run on their own task, so a caller that stops waiting does not
//! cancel them. Every attempt gets a per-namespace epoch; results that arrive
//! after the epoch moved on (an explicit disconnect, a newer attempt) are
//! thrown away.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use log::{debug, error, info, warn};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::adapters::{AccountProfile, Amount, NamespaceAdapter};
use crate::caip::{CaipAddress, CaipNetworkId, ChainNamespace};
use crate::config::Config;
use crate::connector::{ConnectParams, ConnectResult, Connector, ConnectorEvent, ConnectorEvents};
use crate::constants::{CAIP_DELIMITER, WALLET_CONNECT_CONNECTOR_ID};
use crate::error::{Error, Result};
use crate::events::{Subscribers, Subscription};
use crate::network::{CaipNetwork, NetworkRegistry};
use crate::state::{Account, ConnectionState, ConnectionStatus, NamespaceState};
use crate::storage::{KeyValueStore, PersistedSession, SessionStore};

/// Outcome of [`ConnectionController::restore_session`].
#[derive(Debug, Default)]
pub struct RestoreReport {
    pub restored: Vec<ChainNamespace>,
    /// One [`Error::SessionRestoreFailed`] per namespace that could not be
    /// brought back.
    pub failed: Vec<Error>,
}

impl RestoreReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handshake {
    Connect,
    Restore,
}

#[derive(Default)]
struct Slot {
    epoch: u64,
    /// Connector whose handshake is in flight.
    pending: Option<Connector>,
    /// Connector holding the live session.
    connector: Option<Connector>,
    watcher: Option<JoinHandle<()>>,
}

struct Core {
    state: ConnectionState,
    registry: NetworkRegistry,
    slots: HashMap<ChainNamespace, Slot>,
}

struct Inner {
    adapters: BTreeMap<ChainNamespace, Arc<dyn NamespaceAdapter>>,
    core: Mutex<Core>,
    store: SessionStore,
    subscribers: Subscribers,
    config: Config,
}

enum Applied {
    Connected(Account, ConnectionState),
    Failed(Error, ConnectionState),
    Superseded(Result<()>),
    /// Late success on a connector a newer attempt is now using.
    HandedOver,
}

struct Detached {
    live: Option<Connector>,
    pending: Option<Connector>,
}

/// Handle to one application's connection state. Clones share the state.
#[derive(Clone)]
pub struct ConnectionController {
    inner: Arc<Inner>,
}

impl ConnectionController {
    pub fn new(
        adapters: Vec<Arc<dyn NamespaceAdapter>>,
        registry: NetworkRegistry,
        storage: Arc<dyn KeyValueStore>,
        config: Config,
    ) -> Self {
        let adapters: BTreeMap<ChainNamespace, Arc<dyn NamespaceAdapter>> =
            adapters.into_iter().map(|a| (a.namespace(), a)).collect();
        let state = ConnectionState::new(adapters.keys().copied());
        let store = SessionStore::with_prefix(storage, &config.storage_prefix);
        Self {
            inner: Arc::new(Inner {
                adapters,
                core: Mutex::new(Core {
                    state,
                    registry,
                    slots: HashMap::new(),
                }),
                store,
                subscribers: Subscribers::new(),
                config,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Core> {
        match self.inner.core.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn notify(&self, snapshot: &ConnectionState, changed: Option<ChainNamespace>) {
        self.inner.subscribers.notify(snapshot, changed);
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Snapshot of the current state.
    pub fn get_state(&self) -> ConnectionState {
        self.lock().state.clone()
    }

    pub fn status(&self, namespace: ChainNamespace) -> ConnectionStatus {
        self.lock().state.status(namespace)
    }

    pub fn account(&self, namespace: ChainNamespace) -> Option<Account> {
        self.lock().state.account(namespace).cloned()
    }

    pub fn subscribe(
        &self,
        callback: impl Fn(&ConnectionState) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.subscribers.subscribe(None, callback)
    }

    /// Only called for transitions of `namespace` (and global ones).
    pub fn subscribe_namespace(
        &self,
        namespace: ChainNamespace,
        callback: impl Fn(&ConnectionState) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.subscribers.subscribe(Some(namespace), callback)
    }

    pub fn adapter(&self, namespace: ChainNamespace) -> Result<Arc<dyn NamespaceAdapter>> {
        self.inner
            .adapters
            .get(&namespace)
            .cloned()
            .ok_or(Error::UnsupportedNamespace(namespace))
    }

    pub fn connectors(&self, namespace: ChainNamespace) -> Result<Vec<Connector>> {
        Ok(self.adapter(namespace)?.connectors())
    }

    pub fn networks(&self, namespace: ChainNamespace) -> Vec<CaipNetwork> {
        self.lock().registry.get_networks_for_namespace(namespace)
    }

    pub fn active_network(&self, namespace: ChainNamespace) -> Option<CaipNetwork> {
        self.lock().registry.active_or_default(namespace).cloned()
    }

    /// Pairing URI updates of the namespace's WalletConnect connector.
    pub fn pairing_uri(
        &self,
        namespace: ChainNamespace,
    ) -> Result<watch::Receiver<Option<String>>> {
        match self.adapter(namespace)?.connector(WALLET_CONNECT_CONNECTOR_ID) {
            Some(Connector::WalletConnect(c)) => Ok(c.pairing_uri()),
            _ => Err(Error::ProviderNotFound(WALLET_CONNECT_CONNECTOR_ID.to_string())),
        }
    }

    pub async fn connect(&self, namespace: ChainNamespace, connector_id: &str) -> Result<Account> {
        self.connect_to(namespace, connector_id, None).await
    }

    /// Connects and asks to land on `network_id` (the active network when
    /// `None`). A live session in the namespace is closed first.
    pub async fn connect_to(
        &self,
        namespace: ChainNamespace,
        connector_id: &str,
        network_id: Option<&CaipNetworkId>,
    ) -> Result<Account> {
        let adapter = self.adapter(namespace)?;
        let connector = adapter
            .connector(connector_id)
            .ok_or_else(|| Error::ProviderNotFound(connector_id.to_string()))?;
        let network = self.target_network(namespace, network_id)?;
        self.establish(namespace, adapter, connector, network, Handshake::Connect)
            .await
    }

    fn target_network(
        &self,
        namespace: ChainNamespace,
        network_id: Option<&CaipNetworkId>,
    ) -> Result<CaipNetwork> {
        let core = self.lock();
        let network = match network_id {
            Some(id) => core.registry.resolve_network(id)?.clone(),
            None => core
                .registry
                .active_or_default(namespace)
                .cloned()
                .ok_or_else(|| Error::UnknownNetwork(namespace.to_string()))?,
        };
        if network.namespace() != namespace {
            return Err(Error::UnknownNetwork(network.id.to_string()));
        }
        Ok(network)
    }

    async fn establish(
        &self,
        namespace: ChainNamespace,
        adapter: Arc<dyn NamespaceAdapter>,
        connector: Connector,
        network: CaipNetwork,
        mode: Handshake,
    ) -> Result<Account> {
        let (epoch, previous) = self.begin(namespace, &connector, mode)?;
        let this = self.clone();
        let task = tokio::spawn(async move {
            if let Some(previous) = previous {
                info!("{namespace}: closing session with {}", previous.id());
                if let Err(e) = previous.disconnect().await {
                    warn!("{namespace}: {} failed to disconnect: {e}", previous.id());
                }
            }
            let params = ConnectParams::new(network.clone(), this.networks(namespace));
            let outcome = match mode {
                Handshake::Connect => connector.connect(&params).await,
                Handshake::Restore => connector.reconnect(&params).await,
            };
            this.complete(namespace, epoch, adapter, connector, network, outcome)
                .await
        });
        match task.await {
            Ok(result) => result,
            Err(e) => {
                error!("{namespace}: handshake task died: {e}");
                self.detach(namespace, Some(epoch), true);
                Err(Error::InternalError(format!("handshake task failed: {e}")))
            }
        }
    }

    /// Claims the namespace for a handshake.
    fn begin(
        &self,
        namespace: ChainNamespace,
        connector: &Connector,
        mode: Handshake,
    ) -> Result<(u64, Option<Connector>)> {
        let status = match mode {
            Handshake::Connect => ConnectionStatus::Connecting,
            Handshake::Restore => ConnectionStatus::Reconnecting,
        };
        let (epoch, previous, snapshot) = {
            let mut guard = self.lock();
            let core = &mut *guard;
            let slot = core.slots.entry(namespace).or_default();
            if slot.pending.is_some() {
                return Err(Error::ConnectionInProgress(namespace));
            }
            slot.epoch += 1;
            slot.pending = Some(connector.clone());
            if let Some(watcher) = slot.watcher.take() {
                watcher.abort();
            }
            let previous = slot.connector.take();
            let entry = core.state.entry(namespace);
            let active_network = entry.active_network.take();
            *entry = NamespaceState {
                active_connector_id: Some(connector.id().to_string()),
                account: None,
                active_network,
                status,
            };
            (slot.epoch, previous, core.state.clone())
        };
        info!("{namespace}: {status:?} with {}", connector.id());
        self.notify(&snapshot, Some(namespace));
        Ok((epoch, previous))
    }

    async fn complete(
        &self,
        namespace: ChainNamespace,
        epoch: u64,
        adapter: Arc<dyn NamespaceAdapter>,
        connector: Connector,
        requested: CaipNetwork,
        outcome: Result<ConnectResult>,
    ) -> Result<Account> {
        let outcome = match outcome {
            Ok(result) => match adapter.normalize_address(&result.address) {
                Ok(address) => Ok(ConnectResult {
                    address,
                    chain_id: result.chain_id,
                }),
                Err(e) => {
                    if let Err(e) = connector.disconnect().await {
                        debug!("{namespace}: cleanup after bad address failed: {e}");
                    }
                    Err(e)
                }
            },
            Err(e) => Err(e),
        };

        match self.apply(namespace, epoch, &connector, &requested, outcome) {
            Applied::Connected(account, snapshot) => {
                info!("{namespace}: connected {} via {}", account.address, connector.id());
                self.notify(&snapshot, Some(namespace));
                Ok(account)
            }
            Applied::Failed(e, snapshot) => {
                warn!("{namespace}: {} handshake failed: {e}", connector.id());
                self.notify(&snapshot, Some(namespace));
                Err(e)
            }
            Applied::Superseded(Ok(())) => {
                info!("{namespace}: late handshake result from {} dropped", connector.id());
                if let Err(e) = connector.disconnect().await {
                    debug!("{namespace}: cleanup of superseded session failed: {e}");
                }
                Err(Error::ConnectionAborted(namespace))
            }
            Applied::Superseded(Err(e)) => Err(e),
            Applied::HandedOver => {
                info!(
                    "{namespace}: late handshake result from {} left to the newer attempt",
                    connector.id()
                );
                Err(Error::ConnectionAborted(namespace))
            }
        }
    }

    fn apply(
        &self,
        namespace: ChainNamespace,
        epoch: u64,
        connector: &Connector,
        requested: &CaipNetwork,
        outcome: Result<ConnectResult>,
    ) -> Applied {
        let mut guard = self.lock();
        let core = &mut *guard;
        let slot = core.slots.entry(namespace).or_default();
        if slot.epoch != epoch {
            // A connector reused by a newer attempt stays up.
            let in_use = slot
                .connector
                .iter()
                .chain(slot.pending.iter())
                .any(|c| c.id() == connector.id());
            return match outcome {
                Ok(_) if in_use => Applied::HandedOver,
                outcome => Applied::Superseded(outcome.map(|_| ())),
            };
        }
        slot.pending = None;
        match outcome {
            Err(e) => {
                core.state.reset(namespace);
                self.inner.store.clear(namespace);
                Applied::Failed(e, core.state.clone())
            }
            Ok(result) => {
                slot.connector = Some(connector.clone());
                slot.watcher = Some(self.spawn_watcher(namespace, epoch, connector.events()));
                let account = commit_connected(
                    core,
                    &self.inner.store,
                    namespace,
                    connector,
                    requested,
                    result,
                );
                core.state.active_namespace = Some(namespace);
                self.inner.store.save_active_namespace(Some(namespace));
                Applied::Connected(account, core.state.clone())
            }
        }
    }

    fn spawn_watcher(
        &self,
        namespace: ChainNamespace,
        epoch: u64,
        mut events: ConnectorEvents,
    ) -> JoinHandle<()> {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let Some(inner) = weak.upgrade() else { break };
                let controller = ConnectionController { inner };
                if !controller.on_connector_event(namespace, epoch, event).await {
                    break;
                }
            }
            debug!("{namespace}: event watcher stopped");
        })
    }

    fn live_connector(&self, namespace: ChainNamespace, epoch: u64) -> Option<Connector> {
        let core = self.lock();
        core.slots
            .get(&namespace)
            .filter(|slot| slot.epoch == epoch)
            .and_then(|slot| slot.connector.clone())
    }

    /// Returns whether the watcher should keep listening.
    async fn on_connector_event(
        &self,
        namespace: ChainNamespace,
        epoch: u64,
        event: ConnectorEvent,
    ) -> bool {
        let Some(connector) = self.live_connector(namespace, epoch) else {
            return false;
        };
        debug!("{namespace}: {event:?} from {}", connector.id());
        match event {
            ConnectorEvent::AccountsChanged(accounts) => match accounts.first() {
                Some(address) => {
                    self.update_account(namespace, epoch, address);
                    true
                }
                None => {
                    // Locked wallet: the user has to unlock and approve again.
                    info!("{namespace}: {} reports no accounts", connector.id());
                    self.drop_session(namespace, epoch, connector).await;
                    false
                }
            },
            ConnectorEvent::ChainChanged(chain) => {
                self.update_chain(namespace, epoch, &chain);
                true
            }
            ConnectorEvent::Disconnect { transient: false } => {
                info!("{namespace}: {} ended the session", connector.id());
                self.drop_session(namespace, epoch, connector).await;
                false
            }
            ConnectorEvent::Disconnect { transient: true } => {
                self.recover(namespace, epoch, connector).await
            }
        }
    }

    fn update_account(&self, namespace: ChainNamespace, epoch: u64, address: &str) {
        let address = match self
            .adapter(namespace)
            .and_then(|a| a.normalize_address(address))
        {
            Ok(address) => address,
            Err(e) => {
                warn!("{namespace}: ignoring account change: {e}");
                return;
            }
        };
        let snapshot = {
            let mut guard = self.lock();
            let core = &mut *guard;
            if core.slots.get(&namespace).map(|s| s.epoch) != Some(epoch) {
                return;
            }
            let entry = core.state.entry(namespace);
            let Some(account) = entry.account.as_mut() else {
                return;
            };
            if account.address == address {
                return;
            }
            account.caip_address = CaipAddress::new(&account.caip_address.network_id(), &address);
            account.address = address;
            core.state.clone()
        };
        self.notify(&snapshot, Some(namespace));
    }

    fn update_chain(&self, namespace: ChainNamespace, epoch: u64, raw: &str) {
        let network = {
            let core = self.lock();
            parse_chain(namespace, raw).and_then(|id| core.registry.resolve_network(&id).cloned())
        };
        let network = match network {
            Ok(network) if network.namespace() == namespace => network,
            Ok(network) => {
                warn!("{namespace}: ignoring switch to foreign network {}", network.id);
                return;
            }
            Err(e) => {
                warn!("{namespace}: wallet moved to an unregistered chain {raw}: {e}");
                return;
            }
        };
        let snapshot = {
            let mut guard = self.lock();
            let core = &mut *guard;
            if core.slots.get(&namespace).map(|s| s.epoch) != Some(epoch) {
                return;
            }
            if !commit_network(core, &self.inner.store, namespace, network) {
                return;
            }
            core.state.clone()
        };
        self.notify(&snapshot, Some(namespace));
    }

    /// Bounded retry after a transport drop. Returns whether the session
    /// came back.
    async fn recover(&self, namespace: ChainNamespace, epoch: u64, connector: Connector) -> bool {
        if let Some(snapshot) = self.set_status(namespace, epoch, ConnectionStatus::Reconnecting) {
            self.notify(&snapshot, Some(namespace));
        }
        let policy = self.inner.config.reconnect.clone();
        for attempt in 1..=policy.max_attempts {
            let delay = policy.delay(attempt);
            info!(
                "{namespace}: reconnect attempt {attempt}/{} in {delay:?}",
                policy.max_attempts
            );
            tokio::time::sleep(delay).await;

            let Some(params) = self.session_params(namespace, epoch) else {
                return false;
            };
            let result = connector.reconnect(&params).await.and_then(|result| {
                let address = self.adapter(namespace)?.normalize_address(&result.address)?;
                Ok(ConnectResult {
                    address,
                    chain_id: result.chain_id,
                })
            });
            match result {
                Ok(result) => {
                    let snapshot = {
                        let mut guard = self.lock();
                        let core = &mut *guard;
                        if core.slots.get(&namespace).map(|s| s.epoch) != Some(epoch) {
                            return false;
                        }
                        commit_connected(
                            core,
                            &self.inner.store,
                            namespace,
                            &connector,
                            &params.network,
                            result,
                        );
                        core.state.clone()
                    };
                    info!("{namespace}: session recovered on attempt {attempt}");
                    self.notify(&snapshot, Some(namespace));
                    return true;
                }
                Err(e) => warn!("{namespace}: reconnect attempt {attempt} failed: {e}"),
            }
        }
        warn!(
            "{namespace}: giving up after {} reconnect attempts",
            policy.max_attempts
        );
        self.drop_session(namespace, epoch, connector).await;
        false
    }

    fn set_status(
        &self,
        namespace: ChainNamespace,
        epoch: u64,
        status: ConnectionStatus,
    ) -> Option<ConnectionState> {
        let mut guard = self.lock();
        let core = &mut *guard;
        if core.slots.get(&namespace).map(|s| s.epoch) != Some(epoch) {
            return None;
        }
        core.state.entry(namespace).set_status(status);
        Some(core.state.clone())
    }

    fn session_params(&self, namespace: ChainNamespace, epoch: u64) -> Option<ConnectParams> {
        let core = self.lock();
        if core.slots.get(&namespace).map(|s| s.epoch) != Some(epoch) {
            return None;
        }
        let network = core.state.namespace(namespace)?.active_network.clone()?;
        let networks = core.registry.get_networks_for_namespace(namespace);
        Some(ConnectParams::new(network, networks))
    }

    /// Ends a session from the watcher side.
    async fn drop_session(&self, namespace: ChainNamespace, epoch: u64, connector: Connector) {
        if self.detach(namespace, Some(epoch), false).is_none() {
            return;
        }
        if let Err(e) = connector.disconnect().await {
            debug!("{namespace}: {} disconnect failed: {e}", connector.id());
        }
    }

    /// Resets the namespace and forgets its session. `None` when `epoch` is
    /// given and no longer current.
    fn detach(
        &self,
        namespace: ChainNamespace,
        epoch: Option<u64>,
        abort_watcher: bool,
    ) -> Option<Detached> {
        let (detached, snapshot) = {
            let mut guard = self.lock();
            let core = &mut *guard;
            let slot = core.slots.entry(namespace).or_default();
            if epoch.is_some_and(|e| e != slot.epoch) {
                return None;
            }
            slot.epoch += 1;
            let detached = Detached {
                live: slot.connector.take(),
                pending: slot.pending.take(),
            };
            if let Some(watcher) = slot.watcher.take() {
                if abort_watcher {
                    watcher.abort();
                }
            }
            let was_idle = detached.live.is_none()
                && detached.pending.is_none()
                && core.state.status(namespace) == ConnectionStatus::Disconnected;
            core.state.reset(namespace);
            self.inner.store.clear(namespace);
            (detached, (!was_idle).then(|| core.state.clone()))
        };
        if let Some(snapshot) = snapshot {
            info!("{namespace}: disconnected");
            self.notify(&snapshot, Some(namespace));
        }
        Some(detached)
    }

    /// Idempotent; other namespaces are not touched. A pending handshake is
    /// abandoned and, where the connector supports it, cancelled.
    pub async fn disconnect(&self, namespace: ChainNamespace) -> Result<()> {
        self.adapter(namespace)?;
        let Some(detached) = self.detach(namespace, None, true) else {
            return Ok(());
        };
        if let Some(pending) = detached.pending {
            if pending.supports(crate::connector::Capability::Cancel) {
                pending.cancel()?;
            }
        }
        if let Some(connector) = detached.live {
            if let Err(e) = connector.disconnect().await {
                warn!("{namespace}: {} failed to disconnect: {e}", connector.id());
            }
        }
        Ok(())
    }

    pub async fn disconnect_all(&self) -> Result<()> {
        let namespaces: Vec<ChainNamespace> = self.inner.adapters.keys().copied().collect();
        for namespace in namespaces {
            self.disconnect(namespace).await?;
        }
        let snapshot = {
            let mut core = self.lock();
            if core.state.active_namespace.is_none() {
                return Ok(());
            }
            core.state.active_namespace = None;
            self.inner.store.save_active_namespace(None);
            core.state.clone()
        };
        self.notify(&snapshot, None);
        Ok(())
    }

    /// Aborts the pending handshake of `namespace`, if its connector can.
    pub fn cancel(&self, namespace: ChainNamespace) -> Result<()> {
        let pending = {
            let core = self.lock();
            core.slots.get(&namespace).and_then(|s| s.pending.clone())
        };
        match pending {
            Some(connector) => connector.cancel(),
            None => Err(Error::NotConnected(namespace)),
        }
    }

    /// UI focus only; connection statuses stay as they are.
    pub fn switch_active_namespace(&self, namespace: ChainNamespace) -> Result<()> {
        let snapshot = {
            let mut core = self.lock();
            if !core.state.namespaces.contains_key(&namespace) {
                return Err(Error::UnsupportedNamespace(namespace));
            }
            if core.state.active_namespace == Some(namespace) {
                return Ok(());
            }
            core.state.active_namespace = Some(namespace);
            self.inner.store.save_active_namespace(Some(namespace));
            core.state.clone()
        };
        self.notify(&snapshot, None);
        Ok(())
    }

    /// Moves the wallet (when connected) and the registry to `network_id`.
    pub async fn switch_network(
        &self,
        namespace: ChainNamespace,
        network_id: &CaipNetworkId,
    ) -> Result<()> {
        let adapter = self.adapter(namespace)?;
        let network = self.target_network(namespace, Some(network_id))?;
        let live = {
            let core = self.lock();
            let connected = core
                .state
                .namespace(namespace)
                .is_some_and(NamespaceState::is_connected);
            core.slots
                .get(&namespace)
                .filter(|_| connected)
                .and_then(|s| s.connector.clone().map(|c| (c, s.epoch)))
        };

        if let Some((connector, epoch)) = &live {
            adapter.normalize_network_switch(connector, &network).await?;
            info!("{namespace}: {} switched to {}", connector.id(), network.id);
            let snapshot = {
                let mut guard = self.lock();
                let core = &mut *guard;
                if core.slots.get(&namespace).map(|s| s.epoch) != Some(*epoch) {
                    return Ok(());
                }
                if !commit_network(core, &self.inner.store, namespace, network) {
                    return Ok(());
                }
                core.state.clone()
            };
            self.notify(&snapshot, Some(namespace));
            return Ok(());
        }

        let snapshot = {
            let mut guard = self.lock();
            let core = &mut *guard;
            core.registry.set_active_network(namespace, &network.id)?;
            self.inner.store.save_active_network(&network.id);
            core.state.entry(namespace).active_network = Some(network);
            core.state.clone()
        };
        self.notify(&snapshot, Some(namespace));
        Ok(())
    }

    fn active_session(
        &self,
        namespace: ChainNamespace,
    ) -> Result<(Connector, Account, CaipNetwork)> {
        let core = self.lock();
        let entry = core
            .state
            .namespace(namespace)
            .filter(|s| s.is_connected())
            .ok_or(Error::NotConnected(namespace))?;
        let connector = core
            .slots
            .get(&namespace)
            .and_then(|s| s.connector.clone())
            .ok_or(Error::NotConnected(namespace))?;
        match (&entry.account, &entry.active_network) {
            (Some(account), Some(network)) => Ok((connector, account.clone(), network.clone())),
            _ => Err(Error::NotConnected(namespace)),
        }
    }

    pub async fn sign_message(&self, namespace: ChainNamespace, message: &str) -> Result<String> {
        let (connector, account, _) = self.active_session(namespace)?;
        connector.sign_message(message, &account.address).await
    }

    pub async fn send_transaction(
        &self,
        namespace: ChainNamespace,
        transaction: Value,
    ) -> Result<String> {
        let (connector, _, _) = self.active_session(namespace)?;
        connector.send_transaction(transaction).await
    }

    pub async fn get_balance(&self, namespace: ChainNamespace) -> Result<Amount> {
        let (_, account, network) = self.active_session(namespace)?;
        self.adapter(namespace)?
            .get_balance(&account.address, &network)
            .await
    }

    pub async fn get_account_profile(
        &self,
        namespace: ChainNamespace,
    ) -> Result<Option<AccountProfile>> {
        let (_, account, network) = self.active_session(namespace)?;
        self.adapter(namespace)?
            .get_account_profile(&account.address, &network)
            .await
    }

    /// Silent reconnect of every persisted session. Namespaces are restored
    /// concurrently and a failure in one never affects another.
    pub async fn restore_session(&self) -> RestoreReport {
        let mut report = RestoreReport::default();
        let mut tasks = Vec::new();

        for (&namespace, adapter) in &self.inner.adapters {
            if let Some(id) = self.inner.store.load_active_network(namespace) {
                let mut core = self.lock();
                if let Err(e) = core.registry.set_active_network(namespace, &id) {
                    debug!("{namespace}: stored active network {id} ignored: {e}");
                }
            }
            let Some(session) = self.inner.store.load(namespace) else {
                continue;
            };
            let this = self.clone();
            let adapter = adapter.clone();
            let task = tokio::spawn(async move {
                this.restore_namespace(namespace, adapter, session).await
            });
            tasks.push((namespace, task));
        }

        for (namespace, task) in tasks {
            let outcome = match task.await {
                Ok(outcome) => outcome,
                Err(e) => Err(Error::InternalError(format!("restore task failed: {e}"))),
            };
            match outcome {
                Ok(account) => {
                    info!("{namespace}: restored {}", account.address);
                    report.restored.push(namespace);
                }
                Err(e) => {
                    let e = Error::restore_failed(namespace, e);
                    warn!("{e}");
                    report.failed.push(e);
                }
            }
        }

        let saved = self.inner.store.load_active_namespace();
        let snapshot = {
            let mut guard = self.lock();
            let core = &mut *guard;
            let active = saved
                .filter(|ns| core.state.namespaces.contains_key(ns))
                .or(core.state.active_namespace);
            self.inner.store.save_active_namespace(active);
            if core.state.active_namespace == active {
                None
            } else {
                core.state.active_namespace = active;
                Some(core.state.clone())
            }
        };
        if let Some(snapshot) = snapshot {
            self.notify(&snapshot, None);
        }
        report
    }

    async fn restore_namespace(
        &self,
        namespace: ChainNamespace,
        adapter: Arc<dyn NamespaceAdapter>,
        session: PersistedSession,
    ) -> Result<Account> {
        let resolved = {
            let core = self.lock();
            core.registry.resolve_network(&session.network_id).cloned()
        };
        let network = match resolved {
            Ok(network) => network,
            Err(e) => {
                self.inner.store.clear(namespace);
                return Err(e);
            }
        };
        let Some(connector) = adapter.connector(&session.connector_id) else {
            self.inner.store.clear(namespace);
            return Err(Error::ProviderNotFound(session.connector_id));
        };
        self.establish(namespace, adapter, connector, network, Handshake::Restore)
            .await
    }
}

/// Writes a connected entry and its persisted session. Falls back to
/// `requested` when the wallet reports a chain the registry does not know.
fn commit_connected(
    core: &mut Core,
    store: &SessionStore,
    namespace: ChainNamespace,
    connector: &Connector,
    requested: &CaipNetwork,
    result: ConnectResult,
) -> Account {
    let network = match core.registry.resolve_network(&result.chain_id) {
        Ok(network) if network.namespace() == namespace => network.clone(),
        _ => {
            warn!(
                "{namespace}: wallet is on unregistered chain {}, using {}",
                result.chain_id, requested.id
            );
            requested.clone()
        }
    };
    if let Err(e) = core.registry.set_active_network(namespace, &network.id) {
        warn!("{namespace}: could not mark {} active: {e}", network.id);
    }
    let account = Account {
        namespace,
        caip_address: CaipAddress::new(&network.id, &result.address),
        address: result.address,
        connector_type: connector.connector_type(),
        status: ConnectionStatus::Connected,
    };
    let entry = core.state.entry(namespace);
    entry.active_connector_id = Some(connector.id().to_string());
    entry.account = Some(account.clone());
    entry.active_network = Some(network.clone());
    entry.status = ConnectionStatus::Connected;

    store.save(
        namespace,
        &PersistedSession {
            connector_id: connector.id().to_string(),
            network_id: network.id.clone(),
        },
    );
    store.save_active_network(&network.id);
    account
}

/// Returns false when `network` was already active.
fn commit_network(
    core: &mut Core,
    store: &SessionStore,
    namespace: ChainNamespace,
    network: CaipNetwork,
) -> bool {
    let entry = core.state.entry(namespace);
    if entry.active_network.as_ref() == Some(&network) {
        return false;
    }
    if let Some(account) = entry.account.as_mut() {
        account.caip_address = CaipAddress::new(&network.id, &account.address);
    }
    if entry.is_connected() {
        if let Some(connector_id) = &entry.active_connector_id {
            store.save(
                namespace,
                &PersistedSession {
                    connector_id: connector_id.clone(),
                    network_id: network.id.clone(),
                },
            );
        }
    }
    store.save_active_network(&network.id);
    entry.active_network = Some(network.clone());
    if let Err(e) = core.registry.set_active_network(namespace, &network.id) {
        warn!("{namespace}: could not mark {} active: {e}", network.id);
    }
    true
}

/// Chain ids arrive as `0x89`, `137` or full CAIP-2 ids depending on the wallet.
fn parse_chain(namespace: ChainNamespace, raw: &str) -> Result<CaipNetworkId> {
    if namespace == ChainNamespace::Eip155 {
        return CaipNetworkId::from_evm_chain_id(raw);
    }
    if raw.contains(CAIP_DELIMITER) {
        return raw.parse();
    }
    Ok(CaipNetworkId::new(namespace, raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::adapters::{EvmAdapter, SolanaAdapter};
    use crate::config::Metadata;
    use crate::constants::INJECTED_CONNECTOR_ID;
    use crate::injected::InjectedConnector;
    use crate::provider::{ProviderEvent, methods};
    use crate::storage::MemoryStore;
    use crate::testing::{MockInjectedProvider, MockSignClient};
    use crate::walletconnect::{SignClientEvent, WalletConnectConnector};

    const EVM_ADDRESS: &str = "0x5aaeb6053f3e94c9b9a09f33669435e7ef1beaed";
    const EVM_CHECKSUMMED: &str = "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed";
    const SOL_ADDRESS: &str = "7xKXtg2CW87d97TXJSDpbD5jBkheTqA83TZRuJosgAsU";

    struct Harness {
        controller: ConnectionController,
        storage: MemoryStore,
        provider: Arc<MockInjectedProvider>,
        client: Arc<MockSignClient>,
    }

    impl Harness {
        fn sessions(&self) -> SessionStore {
            SessionStore::new(Arc::new(self.storage.clone()))
        }
    }

    fn harness(with_injected: bool) -> Harness {
        let _ = env_logger::builder().is_test(true).try_init();
        let provider = MockInjectedProvider::evm(&[EVM_ADDRESS], "0x1");
        let client = MockSignClient::new();
        let mut evm = vec![Connector::WalletConnect(Arc::new(WalletConnectConnector::new(
            ChainNamespace::Eip155,
            client.clone(),
            Metadata::default(),
            Duration::from_secs(300),
        )))];
        if with_injected {
            evm.push(Connector::Injected(InjectedConnector::new(
                INJECTED_CONNECTOR_ID,
                "Browser Wallet",
                ChainNamespace::Eip155,
                provider.clone(),
            )));
        }
        let phantom = Connector::Injected(InjectedConnector::new(
            "phantom",
            "Phantom",
            ChainNamespace::Solana,
            MockInjectedProvider::solana(SOL_ADDRESS),
        ));
        let adapters: Vec<Arc<dyn NamespaceAdapter>> = vec![
            Arc::new(EvmAdapter::new(evm)),
            Arc::new(SolanaAdapter::new(vec![phantom])),
        ];
        let storage = MemoryStore::new();
        let controller = ConnectionController::new(
            adapters,
            NetworkRegistry::with_defaults(),
            Arc::new(storage.clone()),
            Config::default(),
        );
        Harness {
            controller,
            storage,
            provider,
            client,
        }
    }

    fn solana_mainnet() -> CaipNetworkId {
        "solana:5eykt4UsFv8P8NJdTREpY1vzqKqZKvdp".parse().unwrap()
    }

    async fn wait_until(
        controller: &ConnectionController,
        check: impl Fn(&ConnectionState) -> bool,
    ) {
        for _ in 0..400 {
            if check(&controller.get_state()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("state never reached: {:?}", controller.get_state());
    }

    fn status_is(
        ns: ChainNamespace,
        status: ConnectionStatus,
    ) -> impl Fn(&ConnectionState) -> bool {
        move |state: &ConnectionState| state.status(ns) == status
    }

    #[tokio::test(start_paused = true)]
    async fn connect_persists_before_notifying() {
        let h = harness(true);
        let sessions = h.sessions();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        h.controller.subscribe(move |state| {
            if state.status(ChainNamespace::Eip155) == ConnectionStatus::Connected {
                assert!(sessions.load(ChainNamespace::Eip155).is_some());
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        let account = h
            .controller
            .connect(ChainNamespace::Eip155, INJECTED_CONNECTOR_ID)
            .await
            .unwrap();
        assert_eq!(account.address, EVM_CHECKSUMMED);
        assert_eq!(account.caip_address.to_string(), format!("eip155:1:{EVM_CHECKSUMMED}"));
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        let state = h.controller.get_state();
        assert!(state.is_consistent());
        assert_eq!(state.active_namespace, Some(ChainNamespace::Eip155));
        assert_eq!(
            h.sessions().load(ChainNamespace::Eip155),
            Some(PersistedSession {
                connector_id: INJECTED_CONNECTOR_ID.to_string(),
                network_id: CaipNetworkId::evm(1),
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_connect_fails_fast() {
        let h = harness(true);
        let gate = h.provider.hold(methods::ETH_REQUEST_ACCOUNTS);
        let first = {
            let controller = h.controller.clone();
            tokio::spawn(async move {
                controller
                    .connect(ChainNamespace::Eip155, INJECTED_CONNECTOR_ID)
                    .await
            })
        };
        wait_until(&h.controller, status_is(ChainNamespace::Eip155, ConnectionStatus::Connecting))
            .await;

        let second = h
            .controller
            .connect(ChainNamespace::Eip155, INJECTED_CONNECTOR_ID)
            .await;
        assert!(matches!(
            second,
            Err(Error::ConnectionInProgress(ChainNamespace::Eip155))
        ));

        gate.notify_one();
        first.await.unwrap().unwrap();
        assert_eq!(h.provider.calls_to(methods::ETH_REQUEST_ACCOUNTS), 1);
        assert_eq!(h.controller.status(ChainNamespace::Eip155), ConnectionStatus::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_caller_does_not_cancel_handshake() {
        let h = harness(true);
        let gate = h.provider.hold(methods::ETH_REQUEST_ACCOUNTS);
        let caller = {
            let controller = h.controller.clone();
            tokio::spawn(async move {
                controller
                    .connect(ChainNamespace::Eip155, INJECTED_CONNECTOR_ID)
                    .await
            })
        };
        wait_until(&h.controller, status_is(ChainNamespace::Eip155, ConnectionStatus::Connecting))
            .await;
        caller.abort();
        gate.notify_one();
        wait_until(&h.controller, status_is(ChainNamespace::Eip155, ConnectionStatus::Connected))
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connect_leaves_other_namespaces_alone() {
        let h = harness(true);
        h.controller.connect(ChainNamespace::Solana, "phantom").await.unwrap();
        let solana_before = h.controller.get_state().namespace(ChainNamespace::Solana).cloned();

        h.provider.reject_next(methods::ETH_REQUEST_ACCOUNTS);
        let err = h
            .controller
            .connect(ChainNamespace::Eip155, INJECTED_CONNECTOR_ID)
            .await
            .unwrap_err();
        assert!(err.is_user_rejection());

        let state = h.controller.get_state();
        assert_eq!(state.status(ChainNamespace::Eip155), ConnectionStatus::Disconnected);
        assert_eq!(state.namespace(ChainNamespace::Solana).cloned(), solana_before);
        assert!(state.is_consistent());
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_connector_and_namespace() {
        let h = harness(false);
        assert!(matches!(
            h.controller.connect(ChainNamespace::Eip155, INJECTED_CONNECTOR_ID).await,
            Err(Error::ProviderNotFound(id)) if id == INJECTED_CONNECTOR_ID
        ));
        assert!(matches!(
            h.controller.connect(ChainNamespace::Polkadot, "walletconnect").await,
            Err(Error::UnsupportedNamespace(ChainNamespace::Polkadot))
        ));
        assert_eq!(h.controller.status(ChainNamespace::Eip155), ConnectionStatus::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_is_idempotent_and_scoped() {
        let h = harness(true);
        let notifications = Arc::new(AtomicUsize::new(0));
        let counter = notifications.clone();
        h.controller.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        h.controller.disconnect(ChainNamespace::Eip155).await.unwrap();
        assert_eq!(notifications.load(Ordering::SeqCst), 0);

        h.controller
            .connect(ChainNamespace::Eip155, INJECTED_CONNECTOR_ID)
            .await
            .unwrap();
        h.controller.connect(ChainNamespace::Solana, "phantom").await.unwrap();
        h.controller.disconnect(ChainNamespace::Eip155).await.unwrap();
        h.controller.disconnect(ChainNamespace::Eip155).await.unwrap();

        let state = h.controller.get_state();
        assert_eq!(state.status(ChainNamespace::Eip155), ConnectionStatus::Disconnected);
        assert_eq!(state.status(ChainNamespace::Solana), ConnectionStatus::Connected);
        assert!(h.sessions().load(ChainNamespace::Eip155).is_none());
        assert!(h.sessions().load(ChainNamespace::Solana).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn restores_authorized_injected_session() {
        let h = harness(true);
        h.sessions().save(
            ChainNamespace::Eip155,
            &PersistedSession {
                connector_id: INJECTED_CONNECTOR_ID.to_string(),
                network_id: CaipNetworkId::evm(1),
            },
        );

        let report = h.controller.restore_session().await;
        assert!(report.is_clean());
        assert_eq!(report.restored, vec![ChainNamespace::Eip155]);
        let account = h.controller.account(ChainNamespace::Eip155).unwrap();
        assert_eq!(account.address, EVM_CHECKSUMMED);
        assert_eq!(h.controller.status(ChainNamespace::Eip155), ConnectionStatus::Connected);
        assert_eq!(h.provider.calls_to(methods::ETH_REQUEST_ACCOUNTS), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn restore_without_provider_stays_disconnected() {
        let h = harness(false);
        h.sessions().save(
            ChainNamespace::Eip155,
            &PersistedSession {
                connector_id: INJECTED_CONNECTOR_ID.to_string(),
                network_id: CaipNetworkId::evm(1),
            },
        );

        let report = h.controller.restore_session().await;
        assert!(report.restored.is_empty());
        assert!(matches!(
            report.failed.as_slice(),
            [Error::SessionRestoreFailed { namespace: ChainNamespace::Eip155, reason }]
                if matches!(**reason, Error::ProviderNotFound(_))
        ));
        assert_eq!(h.controller.status(ChainNamespace::Eip155), ConnectionStatus::Disconnected);
        assert!(h.sessions().load(ChainNamespace::Eip155).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn restore_isolates_failures_and_keeps_focus() {
        let h = harness(false);
        let sessions = h.sessions();
        sessions.save(
            ChainNamespace::Eip155,
            &PersistedSession {
                connector_id: INJECTED_CONNECTOR_ID.to_string(),
                network_id: CaipNetworkId::evm(1),
            },
        );
        // Persisted under the deprecated genesis id.
        sessions.save(
            ChainNamespace::Solana,
            &PersistedSession {
                connector_id: "phantom".to_string(),
                network_id: "solana:4sGjMW1sUnHzSxGspuhpqLDx6wiyjNtZ".parse().unwrap(),
            },
        );
        sessions.save_active_namespace(Some(ChainNamespace::Solana));

        let report = h.controller.restore_session().await;
        assert_eq!(report.restored, vec![ChainNamespace::Solana]);
        assert_eq!(report.failed.len(), 1);

        let state = h.controller.get_state();
        assert_eq!(state.active_namespace, Some(ChainNamespace::Solana));
        let solana = state.namespace(ChainNamespace::Solana).unwrap();
        assert_eq!(solana.active_network.as_ref().unwrap().id, solana_mainnet());
        assert!(state.is_consistent());
    }

    #[tokio::test(start_paused = true)]
    async fn corrupted_records_are_ignored() {
        let h = harness(true);
        h.storage
            .set_item("@appkit/eip155:session", "{not json")
            .unwrap();
        let report = h.controller.restore_session().await;
        assert!(report.restored.is_empty());
        assert!(report.is_clean());
        assert_eq!(h.controller.status(ChainNamespace::Eip155), ConnectionStatus::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_wallet_connect_pairing_expires() {
        let h = harness(true);
        let err = h
            .controller
            .connect(ChainNamespace::Eip155, WALLET_CONNECT_CONNECTOR_ID)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PairingExpired));
        assert!(err.is_timeout());
        assert_eq!(h.controller.status(ChainNamespace::Eip155), ConnectionStatus::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_aborts_pending_pairing() {
        let h = harness(true);
        let mut uri = h.controller.pairing_uri(ChainNamespace::Eip155).unwrap();
        let pending = {
            let controller = h.controller.clone();
            tokio::spawn(async move {
                controller
                    .connect(ChainNamespace::Eip155, WALLET_CONNECT_CONNECTOR_ID)
                    .await
            })
        };
        uri.changed().await.unwrap();
        assert!(uri.borrow().is_some());

        h.controller.disconnect(ChainNamespace::Eip155).await.unwrap();
        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::PairingAborted));
        assert_eq!(h.controller.status(ChainNamespace::Eip155), ConnectionStatus::Disconnected);
        assert!(h.sessions().load(ChainNamespace::Eip155).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn late_handshake_keeps_newer_session_authorized() {
        let h = harness(true);
        let gate = h.provider.hold(methods::ETH_REQUEST_ACCOUNTS);
        let connect = || {
            let controller = h.controller.clone();
            tokio::spawn(async move {
                controller
                    .connect(ChainNamespace::Eip155, INJECTED_CONNECTOR_ID)
                    .await
            })
        };

        let first = connect();
        wait_until(&h.controller, status_is(ChainNamespace::Eip155, ConnectionStatus::Connecting))
            .await;
        h.controller.disconnect(ChainNamespace::Eip155).await.unwrap();
        let second = connect();
        while h.provider.calls_to(methods::ETH_REQUEST_ACCOUNTS) < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        gate.notify_waiters();
        assert!(matches!(
            first.await.unwrap(),
            Err(Error::ConnectionAborted(ChainNamespace::Eip155))
        ));
        second.await.unwrap().unwrap();
        assert_eq!(h.controller.status(ChainNamespace::Eip155), ConnectionStatus::Connected);
        assert_eq!(h.provider.calls_to(methods::WALLET_REVOKE_PERMISSIONS), 0);
        assert!(h.sessions().load(ChainNamespace::Eip155).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn late_handshake_without_successor_is_torn_down() {
        let h = harness(true);
        let gate = h.provider.hold(methods::ETH_REQUEST_ACCOUNTS);
        let pending = {
            let controller = h.controller.clone();
            tokio::spawn(async move {
                controller
                    .connect(ChainNamespace::Eip155, INJECTED_CONNECTOR_ID)
                    .await
            })
        };
        wait_until(&h.controller, status_is(ChainNamespace::Eip155, ConnectionStatus::Connecting))
            .await;
        h.controller.disconnect(ChainNamespace::Eip155).await.unwrap();

        gate.notify_one();
        assert!(matches!(
            pending.await.unwrap(),
            Err(Error::ConnectionAborted(ChainNamespace::Eip155))
        ));
        assert_eq!(h.provider.calls_to(methods::WALLET_REVOKE_PERMISSIONS), 1);
        assert_eq!(h.controller.status(ChainNamespace::Eip155), ConnectionStatus::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_relay_does_not_wedge_the_namespace() {
        let h = harness(true);
        h.client.stall_proposals();
        let err = h
            .controller
            .connect(ChainNamespace::Eip155, WALLET_CONNECT_CONNECTOR_ID)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PairingExpired));
        assert_eq!(h.controller.status(ChainNamespace::Eip155), ConnectionStatus::Disconnected);

        h.controller
            .connect(ChainNamespace::Eip155, INJECTED_CONNECTOR_ID)
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn locked_wallet_disconnects_without_retry() {
        let h = harness(true);
        h.controller
            .connect(ChainNamespace::Eip155, INJECTED_CONNECTOR_ID)
            .await
            .unwrap();

        h.provider.emit(ProviderEvent::AccountsChanged(vec![]));
        wait_until(
            &h.controller,
            status_is(ChainNamespace::Eip155, ConnectionStatus::Disconnected),
        )
        .await;
        assert_eq!(h.provider.calls_to(methods::ETH_ACCOUNTS), 0);
        assert_eq!(h.provider.calls_to(methods::ETH_REQUEST_ACCOUNTS), 1);
        assert!(h.sessions().load(ChainNamespace::Eip155).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn wallet_events_update_account_and_network() {
        let h = harness(true);
        h.controller
            .connect(ChainNamespace::Eip155, INJECTED_CONNECTOR_ID)
            .await
            .unwrap();

        h.provider.emit(ProviderEvent::ChainChanged("0x89".to_string()));
        wait_until(&h.controller, |state| {
            state
                .namespace(ChainNamespace::Eip155)
                .and_then(|s| s.active_network.as_ref())
                .is_some_and(|n| n.id == CaipNetworkId::evm(137))
        })
        .await;
        let account = h.controller.account(ChainNamespace::Eip155).unwrap();
        assert_eq!(account.caip_address.network_id(), CaipNetworkId::evm(137));
        assert_eq!(
            h.sessions().load(ChainNamespace::Eip155).unwrap().network_id,
            CaipNetworkId::evm(137)
        );

        let other = "0x0000000000000000000000000000000000000abc";
        h.provider.emit(ProviderEvent::AccountsChanged(vec![other.to_string()]));
        wait_until(&h.controller, |state| {
            state
                .account(ChainNamespace::Eip155)
                .is_some_and(|a| a.address.eq_ignore_ascii_case(other))
        })
        .await;
        assert!(h.controller.get_state().is_consistent());
    }

    #[tokio::test(start_paused = true)]
    async fn transport_drop_is_retried_with_backoff() {
        let h = harness(true);
        h.client.approve_with(&[format!("eip155:1:{EVM_ADDRESS}")]);
        h.controller
            .connect(ChainNamespace::Eip155, WALLET_CONNECT_CONNECTOR_ID)
            .await
            .unwrap();

        let statuses = Arc::new(Mutex::new(Vec::new()));
        let log = statuses.clone();
        h.controller.subscribe_namespace(ChainNamespace::Eip155, move |state| {
            log.lock().unwrap().push(state.status(ChainNamespace::Eip155));
        });

        h.client.fail_reconnects(1);
        h.client.emit(SignClientEvent::TransportClosed);
        wait_until(&h.controller, |_| h.client.reconnect_calls() == 2).await;
        wait_until(
            &h.controller,
            status_is(ChainNamespace::Eip155, ConnectionStatus::Connected),
        )
        .await;
        assert_eq!(
            *statuses.lock().unwrap(),
            vec![ConnectionStatus::Reconnecting, ConnectionStatus::Connected]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn transport_drop_gives_up_after_policy() {
        let h = harness(true);
        h.client.approve_with(&[format!("eip155:1:{EVM_ADDRESS}")]);
        h.controller
            .connect(ChainNamespace::Eip155, WALLET_CONNECT_CONNECTOR_ID)
            .await
            .unwrap();

        h.client.fail_reconnects(u32::MAX);
        h.client.emit(SignClientEvent::TransportClosed);
        wait_until(
            &h.controller,
            status_is(ChainNamespace::Eip155, ConnectionStatus::Disconnected),
        )
        .await;
        assert_eq!(h.client.reconnect_calls(), 3);
        assert_eq!(h.client.deleted().len(), 1);
        assert!(h.sessions().load(ChainNamespace::Eip155).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn switch_network_adds_unknown_chain() {
        let h = harness(true);
        h.controller
            .connect(ChainNamespace::Eip155, INJECTED_CONNECTOR_ID)
            .await
            .unwrap();
        h.provider.fail_with_code(methods::WALLET_SWITCH_CHAIN, 4902);

        h.controller
            .switch_network(ChainNamespace::Eip155, &CaipNetworkId::evm(8453))
            .await
            .unwrap();
        assert_eq!(h.provider.calls_to(methods::WALLET_ADD_CHAIN), 1);
        assert_eq!(
            h.controller.active_network(ChainNamespace::Eip155).unwrap().id,
            CaipNetworkId::evm(8453)
        );
        assert_eq!(
            h.sessions().load(ChainNamespace::Eip155).unwrap().network_id,
            CaipNetworkId::evm(8453)
        );
        assert!(h.controller.get_state().is_consistent());
    }

    #[tokio::test(start_paused = true)]
    async fn switch_network_rejects_foreign_ids() {
        let h = harness(true);
        assert!(matches!(
            h.controller
                .switch_network(ChainNamespace::Eip155, &solana_mainnet())
                .await,
            Err(Error::UnknownNetwork(_))
        ));
        h.controller
            .switch_network(ChainNamespace::Eip155, &CaipNetworkId::evm(137))
            .await
            .unwrap();
        assert_eq!(
            h.controller.active_network(ChainNamespace::Eip155).unwrap().id,
            CaipNetworkId::evm(137)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn switching_focus_keeps_statuses() {
        let h = harness(true);
        h.controller
            .connect(ChainNamespace::Eip155, INJECTED_CONNECTOR_ID)
            .await
            .unwrap();
        let before = h.controller.get_state();
        h.controller
            .switch_active_namespace(ChainNamespace::Solana)
            .unwrap();
        let after = h.controller.get_state();
        assert_eq!(after.active_namespace, Some(ChainNamespace::Solana));
        assert_eq!(after.namespaces, before.namespaces);
        assert!(h.controller.switch_active_namespace(ChainNamespace::Ton).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn signing_needs_a_session() {
        let h = harness(true);
        assert!(matches!(
            h.controller.sign_message(ChainNamespace::Eip155, "hello").await,
            Err(Error::NotConnected(ChainNamespace::Eip155))
        ));
        h.controller
            .connect(ChainNamespace::Eip155, INJECTED_CONNECTOR_ID)
            .await
            .unwrap();
        let signature = h
            .controller
            .sign_message(ChainNamespace::Eip155, "hello")
            .await
            .unwrap();
        assert!(signature.starts_with("0x"));
        let request = h.provider.last_request().unwrap();
        assert_eq!(request.params.unwrap()[1], EVM_CHECKSUMMED);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnecting_replaces_previous_session() {
        let h = harness(true);
        h.controller
            .connect(ChainNamespace::Eip155, INJECTED_CONNECTOR_ID)
            .await
            .unwrap();
        h.controller
            .connect(ChainNamespace::Eip155, INJECTED_CONNECTOR_ID)
            .await
            .unwrap();
        assert_eq!(h.provider.calls_to(methods::WALLET_REVOKE_PERMISSIONS), 1);
        assert_eq!(h.controller.status(ChainNamespace::Eip155), ConnectionStatus::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_all_clears_focus() {
        let h = harness(true);
        h.controller
            .connect(ChainNamespace::Eip155, INJECTED_CONNECTOR_ID)
            .await
            .unwrap();
        h.controller.connect(ChainNamespace::Solana, "phantom").await.unwrap();
        h.controller.disconnect_all().await.unwrap();
        let state = h.controller.get_state();
        assert_eq!(state.active_namespace, None);
        assert!(state.namespaces.values().all(|s| !s.is_connected()));
        assert_eq!(h.sessions().load_active_namespace(), None);
    }

    #[test]
    fn chain_ids_from_wallets() {
        assert_eq!(
            parse_chain(ChainNamespace::Eip155, "0x89").unwrap(),
            CaipNetworkId::evm(137)
        );
        assert_eq!(
            parse_chain(ChainNamespace::Solana, "5eykt4UsFv8P8NJdTREpY1vzqKqZKvdp").unwrap(),
            solana_mainnet()
        );
        assert!(parse_chain(ChainNamespace::Eip155, "mainnet").is_err());
    }
}
