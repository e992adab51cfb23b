//! State-change notification records and the publish seam.
//!
//! Every state transition emits one [`StateChange`] record. How records are
//! physically delivered (a message bus, a log pipeline, a test channel) is
//! the collaborator's concern: the core only calls the narrow
//! [`NotificationPublisher::publish`] capability supplied at construction.
//! No publisher, or a breaker configured with `notification_topic: None`,
//! means notifications are disabled — a no-op, never an error.
//!
//! # Examples
//!
//! ```
//! use fusebox::{CircuitState, StateChange};
//!
//! let record = StateChange {
//!     state: CircuitState::Open,
//!     name: "payments".to_owned(),
//!     failures: 5,
//!     node: "local".to_owned(),
//! };
//!
//! let json = serde_json::to_string(&record).unwrap();
//! assert!(json.contains("\"state\":\"OPEN\""));
//! ```

use serde::{Deserialize, Serialize};

use crate::breaker::CircuitState;

/// Default topic under which state-change records are published.
pub const DEFAULT_NOTIFICATION_TOPIC: &str = "fusebox.state-change";

/// Snapshot emitted once per state transition.
///
/// Immutable and fire-and-forget: the record is built after the transition's
/// bookkeeping is applied and handed to the publisher; nothing the publisher
/// does can affect the breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    /// State the breaker transitioned into.
    pub state: CircuitState,
    /// Name of the breaker that transitioned.
    pub name: String,
    /// Failure count at the moment of the transition.
    pub failures: u32,
    /// Identifier of the emitting process (`"local"` when not clustered).
    pub node: String,
}

/// Narrow capability for publishing state-change records.
///
/// Implementations must not block: `publish` is invoked synchronously right
/// after a transition, so a publisher that talks to the network should
/// enqueue the record and deliver it elsewhere. The built-in
/// [`TracingPublisher`] and channel senders in tests both satisfy this.
pub trait NotificationPublisher: Send + Sync {
    /// Publishes one record under the given topic.
    fn publish(&self, topic: &str, change: &StateChange);
}

/// Publisher that emits records as structured tracing events.
///
/// Events carry the record fields plus its JSON form under the dedicated
/// target `breaker_events`, so subscribers can route breaker notifications
/// separately from ordinary log output.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
///
/// use fusebox::{CircuitBreaker, CircuitBreakerConfig, TracingPublisher};
///
/// let breaker: CircuitBreaker<String> = CircuitBreaker::with_publisher(
///     "payments",
///     CircuitBreakerConfig::default(),
///     Arc::new(TracingPublisher),
/// )
/// .unwrap();
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingPublisher;

impl NotificationPublisher for TracingPublisher {
    fn publish(&self, topic: &str, change: &StateChange) {
        let payload = serde_json::to_string(change).unwrap_or_default();
        tracing::info!(
            target: "breaker_events",
            topic,
            breaker = %change.name,
            state = ?change.state,
            failures = change.failures,
            node = %change.node,
            %payload,
            "state change"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn test_state_serializes_screaming_snake() {
        let json = serde_json::to_string(&CircuitState::HalfOpen).unwrap();
        assert_eq!(json, "\"HALF_OPEN\"");
        assert_eq!(serde_json::to_string(&CircuitState::Open).unwrap(), "\"OPEN\"");
        assert_eq!(serde_json::to_string(&CircuitState::Closed).unwrap(), "\"CLOSED\"");
    }

    #[test]
    fn test_record_roundtrip() {
        let record = StateChange {
            state: CircuitState::HalfOpen,
            name: "inventory".to_owned(),
            failures: 3,
            node: "node-7".to_owned(),
        };

        let json = serde_json::to_string(&record).unwrap();
        let parsed: StateChange = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn test_record_payload_shape() {
        let record = StateChange {
            state: CircuitState::Open,
            name: "payments".to_owned(),
            failures: 5,
            node: "local".to_owned(),
        };

        let value: serde_json::Value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["state"], "OPEN");
        assert_eq!(value["name"], "payments");
        assert_eq!(value["failures"], 5);
        assert_eq!(value["node"], "local");
    }

    #[test]
    fn test_custom_publisher_receives_topic_and_record() {
        struct Capture(Mutex<Vec<(String, StateChange)>>);

        impl NotificationPublisher for Capture {
            fn publish(&self, topic: &str, change: &StateChange) {
                self.0.lock().unwrap().push((topic.to_owned(), change.clone()));
            }
        }

        let capture = Capture(Mutex::new(Vec::new()));
        let record = StateChange {
            state: CircuitState::Closed,
            name: "orders".to_owned(),
            failures: 0,
            node: "local".to_owned(),
        };

        capture.publish(DEFAULT_NOTIFICATION_TOPIC, &record);

        let seen = capture.0.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, DEFAULT_NOTIFICATION_TOPIC);
        assert_eq!(seen[0].1, record);
    }

    #[test]
    fn test_tracing_publisher_does_not_panic() {
        let record = StateChange {
            state: CircuitState::Open,
            name: "payments".to_owned(),
            failures: 5,
            node: "local".to_owned(),
        };
        TracingPublisher.publish(DEFAULT_NOTIFICATION_TOPIC, &record);
    }
}
