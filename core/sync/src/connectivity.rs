//! Connectivity monitoring - wraps the host online/offline signal.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

use crate::observers::{ObserverList, Subscription};

/// Host-reported network state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Connectivity {
    Online,
    Offline,
}

impl From<bool> for Connectivity {
    fn from(online: bool) -> Self {
        if online {
            Self::Online
        } else {
            Self::Offline
        }
    }
}

/// Edge-triggered forwarder of the host connectivity signal.
///
/// The state only changes through [`ConnectivityMonitor::report`]; nothing is
/// polled. Listeners are called synchronously on every transition.
pub struct ConnectivityMonitor {
    online: AtomicBool,
    listeners: ObserverList<bool>,
}

impl ConnectivityMonitor {
    /// Create a monitor starting from the host-reported state.
    pub fn new(initially_online: bool) -> Self {
        Self {
            online: AtomicBool::new(initially_online),
            listeners: ObserverList::new(),
        }
    }

    /// Current state.
    pub fn state(&self) -> Connectivity {
        self.is_online().into()
    }

    /// Whether the host last reported being online.
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Feed a host signal. Returns whether it was a transition.
    ///
    /// Repeated reports of the current state are ignored.
    pub fn report(&self, online: bool) -> bool {
        let previous = self.online.swap(online, Ordering::SeqCst);
        if previous == online {
            return false;
        }

        info!(
            "Connectivity changed: {:?} -> {:?}",
            Connectivity::from(previous),
            Connectivity::from(online)
        );
        self.listeners.notify(&online);
        true
    }

    /// Listen for transitions. The listener receives the new state.
    pub fn subscribe(&self, listener: impl Fn(bool) + Send + Sync + 'static) -> Subscription {
        self.listeners.subscribe(move |online: &bool| listener(*online))
    }

    /// Number of attached listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_initial_state() {
        assert_eq!(ConnectivityMonitor::new(true).state(), Connectivity::Online);
        assert_eq!(ConnectivityMonitor::new(false).state(), Connectivity::Offline);
    }

    #[test]
    fn test_only_edges_notify() {
        let monitor = ConnectivityMonitor::new(false);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = monitor.subscribe(move |online| sink.lock().unwrap().push(online));

        assert!(!monitor.report(false));
        assert!(monitor.report(true));
        assert!(!monitor.report(true));
        assert!(monitor.report(false));

        assert_eq!(*seen.lock().unwrap(), vec![true, false]);
    }

    #[test]
    fn test_listeners_run_in_subscription_order() {
        let monitor = ConnectivityMonitor::new(true);
        let order = Arc::new(Mutex::new(Vec::new()));

        let first_sink = Arc::clone(&order);
        let _first = monitor.subscribe(move |_| first_sink.lock().unwrap().push("first"));
        let second_sink = Arc::clone(&order);
        let _second = monitor.subscribe(move |_| second_sink.lock().unwrap().push("second"));

        monitor.report(false);
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn test_unsubscribed_listener_is_silent() {
        let monitor = ConnectivityMonitor::new(true);
        let calls = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&calls);
        let sub = monitor.subscribe(move |_| *sink.lock().unwrap() += 1);

        monitor.report(false);
        sub.unsubscribe();
        monitor.report(true);

        assert_eq!(*calls.lock().unwrap(), 1);
        assert_eq!(monitor.listener_count(), 0);
    }
}
