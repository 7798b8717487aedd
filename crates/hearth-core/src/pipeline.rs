//! The send and view paths.
//!
//! Send: validate, stamp the room-scope filter status, encrypt under the
//! room's current key (provisioning one when the sender asks for
//! encryption), persist, and hand an envelope to the delivery collaborator.
//! Requests carrying scheduling fields are persisted as scheduled messages
//! instead and executed later through [`MessageService::dispatch_scheduled`].
//!
//! View: ephemeral state is enforced first, then the key the message was
//! stamped with is looked up for the requester, then the per-receiver
//! filter status is resolved.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use hearth_shared::constants::{DEFAULT_MAX_RETRIES, FILTERED_MARKER, MAX_CONTENT_CHARS};
use hearth_shared::crypto::{self, EncryptedPayload};
use hearth_shared::error::KeyError;
use hearth_shared::protocol::{
    DeliveryEnvelope, DeliveryPayload, EphemeralOptions, ScheduleOptions, SendRequest,
};
use hearth_shared::recurrence::RecurrenceRule;
use hearth_shared::types::{FilterStatus, MessageType, RoomId, ScheduledStatus, UserId};
use hearth_store::{EphemeralState, Message, ScheduledMessage, SharedDatabase};

use crate::delivery::Delivery;
use crate::ephemeral::EphemeralLifecycle;
use crate::error::{HearthError, Result};
use crate::filter::FilterEngine;
use crate::keys::{KeyManager, RoomKey, RoomKeyState};

#[derive(Debug, Clone)]
pub struct MessageServiceConfig {
    /// Applied to scheduled requests that do not set their own.
    pub default_max_retries: u32,
    pub max_content_chars: usize,
}

impl Default for MessageServiceConfig {
    fn default() -> Self {
        Self {
            default_max_retries: DEFAULT_MAX_RETRIES,
            max_content_chars: MAX_CONTENT_CHARS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientStatus {
    pub user: UserId,
    pub status: FilterStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentMessage {
    pub message: Message,
    /// Per-receiver outcome for the recipients named in the request.
    pub recipients: Vec<RecipientStatus>,
    /// Whether the transport accepted the envelope.
    pub delivered: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SendOutcome {
    Sent(SentMessage),
    Scheduled(ScheduledMessage),
}

/// A scheduled message that reached the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchedMessage {
    pub message: Message,
    /// False when the message was delivered but could not be stored, so
    /// later views of it will not find it.
    pub stored: bool,
}

/// A message as presented to one requester.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewedMessage {
    pub message_id: Uuid,
    pub room: RoomId,
    pub sender: UserId,
    pub message_type: MessageType,
    /// Canonical plaintext, kept for the sender and moderation.
    pub content: String,
    /// What the requester should be shown.
    pub display_content: String,
    pub filter_status: FilterStatus,
    pub screenshot_protection: bool,
    pub view_count: u32,
    pub max_views: Option<u32>,
    pub created_at: DateTime<Utc>,
}

struct Draft<'a> {
    room: RoomId,
    sender: UserId,
    content: &'a str,
    message_type: MessageType,
    encrypt: bool,
    ephemeral: &'a EphemeralOptions,
}

struct Prepared {
    message: Message,
    key_id: Option<String>,
}

#[derive(Clone)]
pub struct MessageService {
    config: MessageServiceConfig,
    db: SharedDatabase,
    keys: Arc<KeyManager>,
    filters: FilterEngine,
    lifecycle: EphemeralLifecycle,
    delivery: Arc<dyn Delivery>,
}

impl MessageService {
    pub fn new(
        config: MessageServiceConfig,
        db: SharedDatabase,
        keys: Arc<KeyManager>,
        delivery: Arc<dyn Delivery>,
    ) -> Self {
        Self {
            config,
            filters: FilterEngine::new(db.clone()),
            lifecycle: EphemeralLifecycle::new(db.clone(), delivery.clone()),
            db,
            keys,
            delivery,
        }
    }

    pub fn keys(&self) -> &KeyManager {
        &self.keys
    }

    pub fn filters(&self) -> &FilterEngine {
        &self.filters
    }

    pub fn lifecycle(&self) -> &EphemeralLifecycle {
        &self.lifecycle
    }

    // ---- Send ----

    pub async fn send(&self, request: SendRequest, now: DateTime<Utc>) -> Result<SendOutcome> {
        if request.schedule.is_some() {
            return Ok(SendOutcome::Scheduled(self.schedule(request, now)?));
        }

        self.validate_content(&request.content)?;
        validate_ephemeral(&request.ephemeral, now)?;

        let draft = Draft {
            room: request.room,
            sender: request.sender,
            content: &request.content,
            message_type: request.message_type,
            encrypt: request.encrypt,
            ephemeral: &request.ephemeral,
        };
        let prepared = self.prepare(draft, now).await?;

        let mut recipients = Vec::with_capacity(request.recipients.len());
        for user in &request.recipients {
            let decision =
                self.filters
                    .explain(request.sender, *user, Some(request.room), &request.content)?;
            recipients.push(RecipientStatus {
                user: *user,
                status: decision.status,
            });
        }

        self.db.with(|db| db.insert_message(&prepared.message))?;

        let delivered = match self.delivery.deliver(envelope(&prepared, None)) {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    message = %prepared.message.id,
                    room = %request.room,
                    error = %e,
                    "message stored but not delivered"
                );
                false
            }
        };

        info!(
            message = %prepared.message.id,
            room = %request.room,
            sender = %request.sender,
            encrypted = prepared.message.is_encrypted,
            filter_status = %prepared.message.room_filter_status,
            "message sent"
        );

        Ok(SendOutcome::Sent(SentMessage {
            message: prepared.message,
            recipients,
            delivered,
        }))
    }

    /// Persist a deferred send. The request must carry scheduling fields.
    pub fn schedule(&self, request: SendRequest, now: DateTime<Utc>) -> Result<ScheduledMessage> {
        let options = request
            .schedule
            .as_ref()
            .ok_or_else(|| HearthError::InvalidRequest("missing scheduling fields".into()))?;

        self.validate_content(&request.content)?;
        validate_schedule(options, now)?;

        let id = Uuid::new_v4();
        let scheduled = ScheduledMessage {
            id,
            series_id: id,
            room: request.room,
            sender: request.sender,
            content: request.content.clone(),
            message_type: request.message_type,
            encrypt: request.encrypt,
            scheduled_for: options.scheduled_for,
            created_at: now,
            status: ScheduledStatus::Pending,
            retry_count: 0,
            max_retries: options.max_retries.unwrap_or(self.config.default_max_retries),
            last_attempt: None,
            error_message: None,
            recurrence_pattern: options.recurrence_pattern.clone(),
            is_recurring: options.recurrence_pattern.is_some(),
            next_execution: planned_next(options),
            end_date: options.end_date,
        };

        self.db.with(|db| db.insert_scheduled(&scheduled))?;

        info!(
            id = %scheduled.id,
            room = %scheduled.room,
            sender = %scheduled.sender,
            scheduled_for = %scheduled.scheduled_for,
            recurring = scheduled.is_recurring,
            "message scheduled"
        );

        Ok(scheduled)
    }

    /// Run one claimed scheduled message through the send path.
    ///
    /// Delivery happens before the message is stored so that a failed
    /// attempt leaves nothing behind to duplicate on retry. A store failure
    /// after delivery is reported through [`DispatchedMessage::stored`]
    /// rather than as an error, since retrying would deliver it twice.
    pub async fn dispatch_scheduled(
        &self,
        scheduled: &ScheduledMessage,
        now: DateTime<Utc>,
    ) -> Result<DispatchedMessage> {
        let no_limits = EphemeralOptions::default();
        let draft = Draft {
            room: scheduled.room,
            sender: scheduled.sender,
            content: &scheduled.content,
            message_type: scheduled.message_type,
            encrypt: scheduled.encrypt,
            ephemeral: &no_limits,
        };
        let prepared = self.prepare(draft, now).await?;

        self.delivery
            .deliver(envelope(&prepared, Some(scheduled.id)))?;

        let stored = match self.db.with(|db| db.insert_message(&prepared.message)) {
            Ok(()) => true,
            Err(e) => {
                error!(
                    id = %scheduled.id,
                    message = %prepared.message.id,
                    error = %e,
                    "delivered scheduled message could not be stored"
                );
                false
            }
        };

        Ok(DispatchedMessage {
            message: prepared.message,
            stored,
        })
    }

    async fn prepare(&self, draft: Draft<'_>, now: DateTime<Utc>) -> Result<Prepared> {
        let Draft {
            room,
            sender,
            content,
            message_type,
            encrypt,
            ephemeral,
        } = draft;
        let room_filter_status = self.filters.room_filter_status(room, content)?;

        let (stored, key_version, key_id) = match self.room_key(room, sender, encrypt).await? {
            Some(current) => {
                let payload = crypto::encrypt_bound(content.as_bytes(), &current.key, room)?;
                (
                    payload.0,
                    Some(current.version),
                    Some(current.key.fingerprint()),
                )
            }
            None => (content.to_string(), None, None),
        };

        let message = Message {
            id: Uuid::new_v4(),
            room,
            sender,
            message_type,
            content: stored,
            is_encrypted: key_version.is_some(),
            key_version,
            room_filter_status,
            created_at: now,
            ephemeral: EphemeralState {
                view_count: 0,
                max_views: ephemeral.max_views,
                self_destruct_at: ephemeral.self_destruct_at,
                screenshot_protection: ephemeral.screenshot_protection,
            },
            destroyed_at: None,
        };

        Ok(Prepared { message, key_id })
    }

    /// The key to encrypt with, or `None` for a plaintext room.
    async fn room_key(&self, room: RoomId, sender: UserId, wants_encryption: bool) -> Result<Option<RoomKey>> {
        match self.keys.room_state(room).await {
            RoomKeyState::Active { .. } => Ok(Some(self.keys.current_room_key(room, sender).await?)),
            RoomKeyState::Revoked => Err(KeyError::AccessDenied { room, user: sender }.into()),
            RoomKeyState::NoKey if wants_encryption => {
                match self.keys.generate_room_key(room, sender).await {
                    Ok(_) | Err(KeyError::KeyExists(_)) => {}
                    Err(e) => return Err(e.into()),
                }
                Ok(Some(self.keys.current_room_key(room, sender).await?))
            }
            RoomKeyState::NoKey => Ok(None),
        }
    }

    // ---- View ----

    pub async fn view(&self, message_id: Uuid, user: UserId, now: DateTime<Utc>) -> Result<ViewedMessage> {
        let live = self.lifecycle.check_live(message_id, now)?;

        let key = match live.key_version.filter(|_| live.is_encrypted) {
            Some(version) => Some(
                self.keys
                    .get_room_key_version(live.room, user, version)
                    .await?,
            ),
            None => None,
        };

        // Everything that can fail runs before a view is spent.
        let content = match key {
            Some(key) => {
                let payload = EncryptedPayload(live.content.clone());
                let bytes = crypto::decrypt_bound(&payload, &key, live.room)?;
                String::from_utf8(bytes)
                    .map_err(|_| HearthError::InvalidRequest("content is not UTF-8".into()))?
            }
            None => live.content.clone(),
        };

        let decision = self
            .filters
            .explain(live.sender, user, Some(live.room), &content)?;

        // The sender reads their own message without spending a view.
        let message = if user == live.sender {
            live
        } else {
            self.lifecycle.record_view(message_id, now)?
        };
        let display_content = if decision.status == FilterStatus::Filtered {
            FILTERED_MARKER.to_string()
        } else {
            content.clone()
        };

        debug!(
            message = %message.id,
            user = %user,
            filter_status = %decision.status,
            view_count = message.ephemeral.view_count,
            "message viewed"
        );

        Ok(ViewedMessage {
            message_id: message.id,
            room: message.room,
            sender: message.sender,
            message_type: message.message_type,
            content,
            display_content,
            filter_status: decision.status,
            screenshot_protection: message.ephemeral.screenshot_protection,
            view_count: message.ephemeral.view_count,
            max_views: message.ephemeral.max_views,
            created_at: message.created_at,
        })
    }

    pub(crate) fn validate_content(&self, content: &str) -> Result<()> {
        if content.trim().is_empty() {
            return Err(HearthError::InvalidRequest("content must not be empty".into()));
        }
        let chars = content.chars().count();
        if chars > self.config.max_content_chars {
            return Err(HearthError::InvalidRequest(format!(
                "content is {chars} characters, limit is {}",
                self.config.max_content_chars
            )));
        }
        Ok(())
    }
}

fn validate_ephemeral(options: &EphemeralOptions, now: DateTime<Utc>) -> Result<()> {
    if options.max_views == Some(0) {
        return Err(HearthError::InvalidRequest("max_views must be at least 1".into()));
    }
    if options.self_destruct_at.is_some_and(|at| at <= now) {
        return Err(HearthError::InvalidRequest(
            "self_destruct_at must be in the future".into(),
        ));
    }
    Ok(())
}

pub(crate) fn validate_schedule(options: &ScheduleOptions, now: DateTime<Utc>) -> Result<()> {
    if options.scheduled_for <= now {
        return Err(HearthError::InvalidRequest(
            "scheduled_for must be in the future".into(),
        ));
    }
    if let Some(pattern) = &options.recurrence_pattern {
        pattern.parse::<RecurrenceRule>()?;
    }
    if options
        .end_date
        .is_some_and(|end| end < options.scheduled_for)
    {
        return Err(HearthError::InvalidRequest(
            "end_date must not precede scheduled_for".into(),
        ));
    }
    Ok(())
}

/// The slot after `scheduled_for`, for recurring requests.
pub(crate) fn planned_next(options: &ScheduleOptions) -> Option<DateTime<Utc>> {
    let rule: RecurrenceRule = options.recurrence_pattern.as_deref()?.parse().ok()?;
    rule.next_after(options.scheduled_for)
}

fn envelope(prepared: &Prepared, scheduled_id: Option<Uuid>) -> DeliveryEnvelope {
    let message = &prepared.message;
    let payload = match (message.key_version, &prepared.key_id) {
        (Some(key_version), Some(key_id)) => DeliveryPayload::Encrypted {
            payload: EncryptedPayload(message.content.clone()),
            key_id: key_id.clone(),
            key_version,
        },
        _ => DeliveryPayload::Plaintext(message.content.clone()),
    };

    DeliveryEnvelope {
        message_id: message.id,
        room: message.room,
        sender: message.sender,
        message_type: message.message_type,
        payload,
        filter_status: message.room_filter_status,
        screenshot_protection: message.ephemeral.screenshot_protection,
        scheduled_id,
        timestamp: message.created_at,
    }
}
