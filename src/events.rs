//! Typed event bus — broadcast channel for external observers
//!
//! Dashboards and monitoring subscribe here instead of hooking ad-hoc
//! callbacks. Emission is best-effort: events are dropped when nobody
//! listens.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Default buffer for the broadcast channel
const EVENT_BUFFER: usize = 256;

/// Lifecycle and health events emitted by the balancer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BalancerEvent {
    /// A server was registered
    ServerAdded { server_id: String },
    /// A server was removed
    ServerRemoved { server_id: String },
    /// A health probe flipped a server to healthy
    ServerHealthy { server_id: String },
    /// A health probe flipped a server to unhealthy
    ServerUnhealthy { server_id: String },
    /// A circuit breaker tripped open
    CircuitBreakerOpened { server_id: String },
    /// A circuit breaker closed after a successful trial
    CircuitBreakerClosed { server_id: String },
    /// The metrics aggregator completed a recompute tick
    MetricsUpdated,
}

/// Broadcast-backed publish/subscribe handle
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BalancerEvent>,
}

impl EventBus {
    /// Create an event bus with the default buffer
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        Self { tx }
    }

    /// Subscribe to future events
    pub fn subscribe(&self) -> broadcast::Receiver<BalancerEvent> {
        self.tx.subscribe()
    }

    /// Emit an event; silently dropped when there are no subscribers
    pub fn emit(&self, event: BalancerEvent) {
        let _ = self.tx.send(event);
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_and_receive() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(BalancerEvent::ServerAdded {
            server_id: "s1".to_string(),
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            BalancerEvent::ServerAdded {
                server_id: "s1".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_is_noop() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);
        // Must not panic or error
        bus.emit(BalancerEvent::MetricsUpdated);
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        bus.emit(BalancerEvent::CircuitBreakerOpened {
            server_id: "s2".to_string(),
        });
        assert!(rx1.recv().await.is_ok());
        assert!(rx2.recv().await.is_ok());
    }

    #[test]
    fn test_event_serialization() {
        let event = BalancerEvent::ServerUnhealthy {
            server_id: "s3".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"server_unhealthy\""));
        let parsed: BalancerEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }
}
