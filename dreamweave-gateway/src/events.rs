//! One-way gateway event bus.
//!
//! Components emit; observers subscribe. This is what breaks the
//! manager ↔ health-monitor ↔ alerting reference cycle: nobody holds a
//! concrete handle to anybody else, they share a broadcast channel. Emission
//! never blocks and never fails; an event with no subscribers is simply
//! dropped.

use crate::registry::HealthState;
use dreamweave_providers::{CircuitState, ErrorKind};
use tokio::sync::broadcast;

/// Events emitted after each terminal step of request handling and on
/// provider state changes.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    OperationSuccess {
        provider: String,
        request_id: String,
        latency_ms: u64,
        repaired: bool,
    },
    OperationFailure {
        provider: String,
        request_id: String,
        kind: ErrorKind,
        attempt: u32,
    },
    AllProvidersFailed {
        request_id: String,
    },
    HealthChanged {
        provider: String,
        previous: HealthState,
        current: HealthState,
        evidence: String,
    },
    CircuitTransition {
        provider: String,
        state: CircuitState,
    },
}

/// Cheap-to-clone handle to the broadcast channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<GatewayEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    pub fn emit(&self, event: GatewayEvent) {
        // No subscribers is fine; lagging subscribers skip.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.tx.subscribe()
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
    async fn events_reach_subscribers() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(GatewayEvent::AllProvidersFailed {
            request_id: "req-1".to_string(),
        });
        match rx.recv().await.expect("event") {
            GatewayEvent::AllProvidersFailed { request_id } => assert_eq!(request_id, "req-1"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn emitting_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.emit(GatewayEvent::CircuitTransition {
            provider: "openai".to_string(),
            state: CircuitState::Open,
        });
    }
}
