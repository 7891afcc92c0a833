//! Subscriber list for committed state transitions.
//!
//! Delivery is synchronous and in subscription order. The controller calls
//! [`Subscribers::notify`] only after the storage write for the transition is
//! done, so a callback that reads storage sees the new record.

use std::sync::{Arc, Mutex, Weak};

use log::warn;

use crate::caip::ChainNamespace;
use crate::state::ConnectionState;

type Callback = Arc<dyn Fn(&ConnectionState) + Send + Sync>;

struct Entry {
    id: u64,
    filter: Option<ChainNamespace>,
    callback: Callback,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    entries: Vec<Entry>,
}

#[derive(Clone, Default)]
pub struct Subscribers {
    inner: Arc<Mutex<Inner>>,
}

impl Subscribers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a callback for every transition, or only for transitions of
    /// `filter` when one is given.
    pub fn subscribe(
        &self,
        filter: Option<ChainNamespace>,
        callback: impl Fn(&ConnectionState) + Send + Sync + 'static,
    ) -> Subscription {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        let id = inner.next_id;
        inner.next_id += 1;
        inner.entries.push(Entry {
            id,
            filter,
            callback: Arc::new(callback),
        });
        Subscription {
            id,
            subscribers: Arc::downgrade(&self.inner),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|i| i.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Notifies subscribers interested in `changed` (`None` = all namespaces).
    pub fn notify(&self, state: &ConnectionState, changed: Option<ChainNamespace>) {
        // Callbacks run without the lock so they may subscribe or unsubscribe.
        let callbacks: Vec<Callback> = match self.inner.lock() {
            Ok(inner) => inner
                .entries
                .iter()
                .filter(|e| match (e.filter, changed) {
                    (Some(wanted), Some(ns)) => wanted == ns,
                    _ => true,
                })
                .map(|e| e.callback.clone())
                .collect(),
            Err(_) => {
                warn!("Subscriber list poisoned, dropping notification");
                return;
            }
        };
        for callback in callbacks {
            callback(state);
        }
    }
}

/// Handle returned by `subscribe`; call [`Subscription::unsubscribe`] to stop
/// receiving updates. Dropping the handle keeps the subscription alive.
pub struct Subscription {
    id: u64,
    subscribers: Weak<Mutex<Inner>>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        if let Some(inner) = self.subscribers.upgrade() {
            if let Ok(mut inner) = inner.lock() {
                inner.entries.retain(|e| e.id != self.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn delivers_in_subscription_order() {
        let subscribers = Subscribers::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second", "third"] {
            let log = log.clone();
            subscribers.subscribe(None, move |_| log.lock().unwrap().push(tag));
        }
        subscribers.notify(&ConnectionState::default(), Some(ChainNamespace::Eip155));
        assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let subscribers = Subscribers::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let sub = subscribers.subscribe(None, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        subscribers.notify(&ConnectionState::default(), None);
        sub.unsubscribe();
        subscribers.notify(&ConnectionState::default(), None);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(subscribers.is_empty());
    }

    #[test]
    fn namespace_filter() {
        let subscribers = Subscribers::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let _sub = subscribers.subscribe(Some(ChainNamespace::Solana), move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let state = ConnectionState::default();
        subscribers.notify(&state, Some(ChainNamespace::Eip155));
        subscribers.notify(&state, Some(ChainNamespace::Solana));
        subscribers.notify(&state, None);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn callbacks_may_resubscribe() {
        let subscribers = Subscribers::new();
        let inner = subscribers.clone();
        let _sub = subscribers.subscribe(None, move |_| {
            inner.subscribe(None, |_| {});
        });
        subscribers.notify(&ConnectionState::default(), None);
        assert_eq!(subscribers.len(), 2);
    }
}
