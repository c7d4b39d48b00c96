//! Internal event bus shared by every worker.
//!
//! Events describe things that happened; workers never react to an event
//! directly. Each worker's translator turns the events it cares about into
//! commands on that worker's own queue, so all state changes stay on the
//! worker's single consumer task.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::broadcast;
use tracing::trace;

/// Everything a deployment subsystem needs to launch the workload of a
/// finalized agreement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LaunchContext {
    pub image: String,
    #[serde(default)]
    pub environment: HashMap<String, String>,
}

/// Closed set of events carried on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// The device completed registration with the external registry.
    DeviceRegistered {
        device_id: String,
    },
    /// A new policy file appeared locally.
    PolicyCreated {
        file: PathBuf,
    },
    /// An advertised policy changed in a way existing agreements no longer
    /// satisfy.
    PolicyChanged {
        policy_name: String,
    },
    /// An inbound negotiation message arrived. `protocol` is envelope
    /// metadata from the messaging subsystem; the payload itself does not
    /// name the protocol.
    ProposalReceived {
        protocol: String,
        payload: String,
        reply_to: String,
    },
    /// A proposal was accepted, persisted, and answered.
    AgreementReached {
        agreement_id: String,
        protocol: String,
        launch: LaunchContext,
    },
    /// An agreement ended, with the protocol-level reason code.
    AgreementTerminated {
        agreement_id: String,
        protocol: String,
        reason: u64,
    },
    /// A worker's command loop exited.
    WorkerStopped {
        worker: String,
    },
    /// Node shutdown was requested; workers should wind down.
    ShutdownRequested,
    /// Every worker has stopped.
    ShutdownComplete,
}

impl Event {
    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Event::DeviceRegistered { .. } => "device_registered",
            Event::PolicyCreated { .. } => "policy_created",
            Event::PolicyChanged { .. } => "policy_changed",
            Event::ProposalReceived { .. } => "proposal_received",
            Event::AgreementReached { .. } => "agreement_reached",
            Event::AgreementTerminated { .. } => "agreement_terminated",
            Event::WorkerStopped { .. } => "worker_stopped",
            Event::ShutdownRequested => "shutdown_requested",
            Event::ShutdownComplete => "shutdown_complete",
        }
    }
}

/// Cloneable handle on the broadcast channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all current subscribers. An event with no
    /// subscribers is dropped silently.
    pub fn publish(&self, event: Event) {
        trace!(event = event.name(), "publishing event");
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_all_subscribers() {
        let bus = EventBus::new(8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(Event::ShutdownRequested);

        assert!(matches!(a.recv().await.unwrap(), Event::ShutdownRequested));
        assert!(matches!(b.recv().await.unwrap(), Event::ShutdownRequested));
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_dropped() {
        let bus = EventBus::new(8);
        // Must not panic or block.
        bus.publish(Event::ShutdownComplete);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn event_round_trips_through_json() {
        let event = Event::ProposalReceived {
            protocol: "Basic".to_string(),
            payload: "{}".to_string(),
            reply_to: "peer-1".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name(), "proposal_received");
    }
}
