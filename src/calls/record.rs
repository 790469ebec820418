//! # Call Records
//!
//! The persistent view of a call: identifiers, parties, lifecycle status,
//! and the engine conversation it was bridged to.
//!
//! ## Status machine:
//! ```text
//! INITIALIZED ──> STREAMING ──> COMPLETED
//!      │              │
//!      └──────────────┴───────> CANCELED
//! ```
//! Terminal statuses never change again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallStatus {
    /// Call announced by the provider webhook, no media yet
    Initialized,

    /// Media socket up and bridged to the engine
    Streaming,

    /// Ended after a normal stream lifecycle
    Completed,

    /// Ended before any usable media flowed
    Canceled,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Initialized => "INITIALIZED",
            CallStatus::Streaming => "STREAMING",
            CallStatus::Completed => "COMPLETED",
            CallStatus::Canceled => "CANCELED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CallStatus::Completed | CallStatus::Canceled)
    }

    pub fn can_transition_to(&self, next: CallStatus) -> bool {
        match (self, next) {
            (CallStatus::Initialized, CallStatus::Streaming) => true,
            (CallStatus::Initialized, CallStatus::Completed) => true,
            (CallStatus::Initialized, CallStatus::Canceled) => true,
            (CallStatus::Streaming, CallStatus::Completed) => true,
            (CallStatus::Streaming, CallStatus::Canceled) => true,
            _ => false,
        }
    }
}

/// One tracked call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRecord {
    /// Internal identifier
    pub id: Uuid,

    /// Provider's call SID, unique per call
    pub sid: String,

    pub from_number: String,
    pub to_number: String,

    pub status: CallStatus,

    /// Conversation identifier reported by the engine, once known
    pub engine_conversation_id: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CallRecord {
    pub fn new(sid: &str, from_number: &str, to_number: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            sid: sid.to_string(),
            from_number: from_number.to_string(),
            to_number: to_number.to_string(),
            status: CallStatus::Initialized,
            engine_conversation_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move the call to a new status.
    ///
    /// Rejects anything the status machine does not allow, including every
    /// transition out of a terminal status. The update timestamp is only
    /// refreshed on success.
    pub fn set_status(&mut self, next: CallStatus) -> Result<(), String> {
        if !self.status.can_transition_to(next) {
            return Err(format!(
                "Invalid status transition from {} to {}",
                self.status.as_str(),
                next.as_str()
            ));
        }

        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn record_conversation_id(&mut self, conversation_id: String) {
        self.engine_conversation_id = Some(conversation_id);
        self.updated_at = Utc::now();
    }
}
