//! Event types for the GTP event system
//!
//! Provides shared event definitions and EventBus for GTP modules. Every
//! mutating engine operation emits its event after the database commit;
//! emission is lossy - a missing subscriber is never an error.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// GTP engine event types
///
/// Events are broadcast via EventBus and can be serialized for SSE
/// transmission to the platform UI and collaborating modules.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EngineEvent {
    /// A measure link was created
    LinkCreated {
        link_id: Uuid,
        measure_id: Uuid,
        person_id: Uuid,
        goal_id: Option<Uuid>,
        strategy_id: Option<Uuid>,
        /// Whether the link was auto-promoted to primary for its goal
        is_primary: bool,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A measure link was removed (its data points cascade away with it)
    LinkRemoved {
        link_id: Uuid,
        measure_id: Uuid,
        goal_id: Option<Uuid>,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// The primary link for a goal changed
    PrimaryChanged {
        goal_id: Uuid,
        /// Link demoted, if one was primary before
        old_link_id: Option<Uuid>,
        new_link_id: Uuid,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// An actual reading was recorded
    ///
    /// Carries the variance computed against the Expected series at the
    /// reading's date. Variance is derived, never persisted.
    ActualRecorded {
        link_id: Uuid,
        data_point_id: Uuid,
        value: f64,
        effective_date: NaiveDate,
        variance_pct: Option<f64>,
        breach: bool,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Sustained variance flagged a link for replanning
    ReplanFlagged {
        link_id: Uuid,
        consecutive_breaches: u32,
        threshold_pct: f64,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A replan flag was acknowledged without changing targets
    ReplanDismissed {
        link_id: Uuid,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Future Expected targets were recomputed
    TargetsReplanned {
        link_id: Uuid,
        /// Adjustment strategy that ran (db string form)
        strategy: String,
        /// Actual reading the adjustment was based on
        basis_actual_id: Uuid,
        points_changed: usize,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

impl EngineEvent {
    /// Event type string for SSE event fields
    pub fn type_str(&self) -> &'static str {
        match self {
            EngineEvent::LinkCreated { .. } => "LinkCreated",
            EngineEvent::LinkRemoved { .. } => "LinkRemoved",
            EngineEvent::PrimaryChanged { .. } => "PrimaryChanged",
            EngineEvent::ActualRecorded { .. } => "ActualRecorded",
            EngineEvent::ReplanFlagged { .. } => "ReplanFlagged",
            EngineEvent::ReplanDismissed { .. } => "ReplanDismissed",
            EngineEvent::TargetsReplanned { .. } => "TargetsReplanned",
        }
    }
}

/// Central event distribution bus
///
/// Uses tokio::broadcast internally, providing non-blocking publish,
/// multiple concurrent subscribers, and automatic cleanup when
/// subscribers drop.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    ///
    /// Events emitted before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = EngineEvent::ReplanDismissed {
            link_id: Uuid::new_v4(),
            timestamp: chrono::Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "ReplanDismissed");
        assert_eq!(event.type_str(), "ReplanDismissed");
    }

    #[tokio::test]
    async fn test_bus_delivers_to_subscriber() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.emit_lossy(EngineEvent::ReplanDismissed {
            link_id: Uuid::new_v4(),
            timestamp: chrono::Utc::now(),
        });

        let received = rx.recv().await.unwrap();
        assert_eq!(received.type_str(), "ReplanDismissed");
    }

    #[test]
    fn test_emit_without_subscribers_is_not_an_error() {
        let bus = EventBus::new(16);
        assert_eq!(bus.subscriber_count(), 0);
        bus.emit_lossy(EngineEvent::ReplanDismissed {
            link_id: Uuid::new_v4(),
            timestamp: chrono::Utc::now(),
        });
    }
}
