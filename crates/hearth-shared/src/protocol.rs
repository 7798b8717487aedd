use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::EncryptedPayload;
use crate::types::{FilterStatus, MessageType, RoomId, UserId};

/// The one inbound send contract. Scheduling fields are optional; when
/// present the message is deferred instead of sent immediately.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendRequest {
    pub room: RoomId,
    pub sender: UserId,
    pub content: String,
    pub message_type: MessageType,
    /// Ask for encryption even if the room has no key yet.
    pub encrypt: bool,
    /// Receivers to resolve personal filters for at send time.
    pub recipients: Vec<UserId>,
    pub ephemeral: EphemeralOptions,
    pub schedule: Option<ScheduleOptions>,
}

impl SendRequest {
    pub fn text(room: RoomId, sender: UserId, content: impl Into<String>) -> Self {
        Self {
            room,
            sender,
            content: content.into(),
            message_type: MessageType::Text,
            encrypt: false,
            recipients: Vec::new(),
            ephemeral: EphemeralOptions::default(),
            schedule: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EphemeralOptions {
    pub max_views: Option<u32>,
    pub self_destruct_at: Option<DateTime<Utc>>,
    pub screenshot_protection: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleOptions {
    pub scheduled_for: DateTime<Utc>,
    pub recurrence_pattern: Option<String>,
    pub end_date: Option<DateTime<Utc>>,
    pub max_retries: Option<u32>,
}

/// Message content as it leaves the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryPayload {
    Plaintext(String),
    Encrypted {
        payload: EncryptedPayload,
        /// Fingerprint of the key, never the key itself.
        key_id: String,
        key_version: u32,
    },
}

impl DeliveryPayload {
    pub fn is_encrypted(&self) -> bool {
        matches!(self, Self::Encrypted { .. })
    }
}

/// What the core hands to the transport collaborator for real-time fan-out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryEnvelope {
    pub message_id: Uuid,
    pub room: RoomId,
    pub sender: UserId,
    pub message_type: MessageType,
    pub payload: DeliveryPayload,
    /// Room-scope filter outcome; personal scopes are resolved per receiver.
    pub filter_status: FilterStatus,
    pub screenshot_protection: bool,
    /// Set when the message came from the scheduler.
    pub scheduled_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
}

impl DeliveryEnvelope {
    /// Serialize to binary (bincode)
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from binary
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

/// Lifecycle events surfaced to senders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Notification {
    MessageExpired {
        message_id: Uuid,
        sender: UserId,
    },
    ViewLimitReached {
        message_id: Uuid,
        sender: UserId,
    },
    ScheduleFailed {
        scheduled_id: Uuid,
        sender: UserId,
        error: String,
    },
}
