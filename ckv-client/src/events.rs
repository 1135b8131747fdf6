//! # Cluster Event Monitor
//!
//! Republishes topology transitions from the tend thread as typed events.
//!
//! Each occurrence is delivered twice: once under its own name
//! (`nodeAdded`, `nodeRemoved`, `disconnected`) and once as a generic
//! `event` carrying the same name and node. Handlers run in the dispatch
//! loop, never on the tend thread.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use ckv_common::ClusterNode;

use crate::native::cluster::NativeEvent;

/// Event channel names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventName {
    NodeAdded,
    NodeRemoved,
    Disconnected,
    /// Receives every occurrence as [`TopologyEvent::Generic`].
    Event,
}

impl EventName {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventName::NodeAdded => "nodeAdded",
            EventName::NodeRemoved => "nodeRemoved",
            EventName::Disconnected => "disconnected",
            EventName::Event => "event",
        }
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Topology notification delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyEvent {
    NodeAdded { node: ClusterNode },
    NodeRemoved { node: ClusterNode },
    Disconnected,
    /// Mirror of a specific event on the `event` channel.
    Generic {
        name: EventName,
        node: Option<ClusterNode>,
    },
}

impl TopologyEvent {
    /// Channel the event is published on.
    pub fn name(&self) -> EventName {
        match self {
            TopologyEvent::NodeAdded { .. } => EventName::NodeAdded,
            TopologyEvent::NodeRemoved { .. } => EventName::NodeRemoved,
            TopologyEvent::Disconnected => EventName::Disconnected,
            TopologyEvent::Generic { .. } => EventName::Event,
        }
    }

    pub fn node(&self) -> Option<&ClusterNode> {
        match self {
            TopologyEvent::NodeAdded { node } | TopologyEvent::NodeRemoved { node } => Some(node),
            TopologyEvent::Disconnected => None,
            TopologyEvent::Generic { node, .. } => node.as_ref(),
        }
    }
}

impl NativeEvent {
    /// The specific event and its generic mirror.
    pub(crate) fn into_pair(self) -> [TopologyEvent; 2] {
        let specific = match self {
            NativeEvent::NodeAdded(node) => TopologyEvent::NodeAdded { node },
            NativeEvent::NodeRemoved(node) => TopologyEvent::NodeRemoved { node },
            NativeEvent::Disconnected => TopologyEvent::Disconnected,
        };
        let generic = TopologyEvent::Generic {
            name: specific.name(),
            node: specific.node().cloned(),
        };
        [specific, generic]
    }
}

/// Subscriber callback.
pub type EventHandler = Arc<dyn Fn(&TopologyEvent) + Send + Sync>;

/// Handle returned by [`crate::Client::on`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// Registry of topology subscribers.
#[derive(Default)]
pub(crate) struct EventMonitor {
    next_id: AtomicU64,
    handlers: Mutex<BTreeMap<SubscriptionId, (EventName, EventHandler)>>,
}

impl EventMonitor {
    pub(crate) fn new() -> Self {
        EventMonitor::default()
    }

    pub(crate) fn subscribe(&self, name: EventName, handler: EventHandler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.lock().insert(id, (name, handler));
        id
    }

    pub(crate) fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.handlers.lock().remove(&id).is_some()
    }

    /// Delivers both notifications of one occurrence.
    pub(crate) fn publish(&self, event: NativeEvent) {
        for event in event.into_pair() {
            self.deliver(&event);
        }
    }

    fn deliver(&self, event: &TopologyEvent) {
        let name = event.name();
        // Handlers may subscribe or unsubscribe; call them without the lock.
        let handlers: Vec<EventHandler> = self
            .handlers
            .lock()
            .values()
            .filter(|(wanted, _)| *wanted == name)
            .map(|(_, handler)| handler.clone())
            .collect();

        tracing::debug!(event = %name, subscribers = handlers.len(), "topology event");
        for handler in handlers {
            if panic::catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                tracing::error!(event = %name, "event handler panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> ClusterNode {
        ClusterNode {
            name: "00000000000000AB".to_string(),
            address: "127.0.0.1:3000".to_string(),
        }
    }

    #[test]
    fn occurrences_produce_specific_and_generic_events() {
        let [specific, generic] = NativeEvent::NodeRemoved(node()).into_pair();
        assert_eq!(specific, TopologyEvent::NodeRemoved { node: node() });
        assert_eq!(
            generic,
            TopologyEvent::Generic {
                name: EventName::NodeRemoved,
                node: Some(node()),
            }
        );

        let [_, generic] = NativeEvent::Disconnected.into_pair();
        assert_eq!(generic.node(), None);
    }

    #[test]
    fn handlers_receive_their_channel_only() {
        let monitor = EventMonitor::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for name in [EventName::NodeAdded, EventName::Event, EventName::Disconnected] {
            let seen = seen.clone();
            monitor.subscribe(
                name,
                Arc::new(move |event: &TopologyEvent| seen.lock().push((name, event.clone()))),
            );
        }
        monitor.publish(NativeEvent::NodeAdded(node()));

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().any(|(name, _)| *name == EventName::NodeAdded));
        assert!(seen.iter().any(|(name, event)| {
            *name == EventName::Event && event.name() == EventName::Event
        }));
    }

    #[test]
    fn unsubscribed_and_panicking_handlers_do_not_break_delivery() {
        let monitor = EventMonitor::new();
        let count = Arc::new(AtomicU64::new(0));

        let gone = monitor.subscribe(EventName::Disconnected, Arc::new(|_: &TopologyEvent| {}));
        assert!(monitor.unsubscribe(gone));
        assert!(!monitor.unsubscribe(gone));

        monitor.subscribe(
            EventName::Disconnected,
            Arc::new(|_: &TopologyEvent| panic!("handler failure")),
        );
        let counter = count.clone();
        monitor.subscribe(
            EventName::Disconnected,
            Arc::new(move |_: &TopologyEvent| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        monitor.publish(NativeEvent::Disconnected);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
