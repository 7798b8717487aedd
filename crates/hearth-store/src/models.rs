//! Value records persisted in the local SQLite database.
//!
//! Every struct derives `Serialize` and `Deserialize` so it can be handed
//! directly to the request-handling layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use hearth_shared::types::{
    FilterScope, FilterStatus, FilterType, MessageType, RoomId, ScheduledStatus, UserId,
};

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A delivered message. `content` is Base64 ciphertext when `is_encrypted`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: Uuid,
    pub room: RoomId,
    pub sender: UserId,
    pub message_type: MessageType,
    /// Canonical content. Filtering never rewrites it; destruction empties it.
    pub content: String,
    pub is_encrypted: bool,
    /// Room key version the content was encrypted under.
    pub key_version: Option<u32>,
    /// Outcome of the room-scope filter check at send time.
    pub room_filter_status: FilterStatus,
    pub created_at: DateTime<Utc>,
    pub ephemeral: EphemeralState,
    /// Set once the message reaches `DESTROYED`.
    pub destroyed_at: Option<DateTime<Utc>>,
}

impl Message {
    pub fn is_destroyed(&self) -> bool {
        self.destroyed_at.is_some()
    }
}

/// View-limit and self-destruct state of a delivered message.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EphemeralState {
    pub view_count: u32,
    pub max_views: Option<u32>,
    pub self_destruct_at: Option<DateTime<Utc>>,
    pub screenshot_protection: bool,
}

impl EphemeralState {
    pub fn at_view_limit(&self) -> bool {
        self.max_views.is_some_and(|max| self.view_count >= max)
    }

    pub fn past_self_destruct(&self, now: DateTime<Utc>) -> bool {
        self.self_destruct_at.is_some_and(|at| now >= at)
    }

    /// Whether the message must be treated as destroyed at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.at_view_limit() || self.past_self_destruct(now)
    }

    pub fn is_ephemeral(&self) -> bool {
        self.max_views.is_some() || self.self_destruct_at.is_some()
    }
}

// ---------------------------------------------------------------------------
// Scheduled message
// ---------------------------------------------------------------------------

/// A deferred send owned by the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScheduledMessage {
    pub id: Uuid,
    /// Id of the first instance of a recurring series (equal to `id` otherwise).
    pub series_id: Uuid,
    pub room: RoomId,
    pub sender: UserId,
    pub content: String,
    pub message_type: MessageType,
    pub encrypt: bool,
    pub scheduled_for: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub status: ScheduledStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_attempt: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub recurrence_pattern: Option<String>,
    pub is_recurring: bool,
    pub next_execution: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Filter rule
// ---------------------------------------------------------------------------

/// A block-list entry. Deactivated rather than deleted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FilterRule {
    pub id: Uuid,
    pub scope: FilterScope,
    pub content: String,
    pub filter_type: FilterType,
    pub description: Option<String>,
    pub is_active: bool,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
