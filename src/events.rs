//! Moderation events for admin tooling.
//!
//! The engine publishes events on a tokio broadcast channel. Delivering them
//! to admins (dashboard, push, email) is left to subscribers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::models::{CircumventionRiskLevel, Severity, ViolationType};

/// Default channel capacity. Slow subscribers lag rather than block the engine.
pub const DEFAULT_EVENT_CAPACITY: usize = 1000;

/// Event types published by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModerationEvent {
    ViolationRecorded {
        violation_id: String,
        user_id: String,
        chat_id: String,
        violation_type: ViolationType,
        severity: Severity,
        timestamp: DateTime<Utc>,
    },
    /// A user's profile crossed into deactivation.
    ChatDeactivated {
        user_id: String,
        violation_percentage: u8,
        recent_attempts: u32,
        timestamp: DateTime<Utc>,
    },
    CircumventionEscalated {
        user_id: String,
        attempt_count: u32,
        risk_level: CircumventionRiskLevel,
        timestamp: DateTime<Utc>,
    },
}

impl ModerationEvent {
    pub fn user_id(&self) -> &str {
        match self {
            Self::ViolationRecorded { user_id, .. }
            | Self::ChatDeactivated { user_id, .. }
            | Self::CircumventionEscalated { user_id, .. } => user_id,
        }
    }
}

/// Broadcast fan-out of [`ModerationEvent`]s.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Arc<ModerationEvent>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish to all current subscribers and return how many received it.
    ///
    /// Publishing with no subscribers is not an error.
    pub fn publish(&self, event: ModerationEvent) -> usize {
        self.sender.send(Arc::new(event)).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<ModerationEvent>> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
