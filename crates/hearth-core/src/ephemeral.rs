//! View limits and self-destruct for delivered messages.
//!
//! Expiry is enforced on every access: [`EphemeralLifecycle::record_view`]
//! admits a view with a single conditional increment, so two readers racing
//! for the last view cannot both get in. The sweeps only reclaim content of
//! messages nobody touched after they expired.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use hearth_shared::error::LifecycleError;
use hearth_shared::protocol::Notification;
use hearth_store::{Database, EphemeralState, Message, SharedDatabase, StoreError};

use crate::delivery::Delivery;
use crate::error::Result;

#[derive(Clone)]
pub struct EphemeralLifecycle {
    db: SharedDatabase,
    delivery: Arc<dyn Delivery>,
}

impl EphemeralLifecycle {
    pub fn new(db: SharedDatabase, delivery: Arc<dyn Delivery>) -> Self {
        Self { db, delivery }
    }

    /// Consume one view. Fails with `MessageExpired` once the message is
    /// destroyed, at its view limit, or past its self-destruct time.
    pub fn record_view(&self, id: Uuid, now: DateTime<Utc>) -> Result<Message> {
        let admitted = self.db.with(|db| db.record_view(id, now))?;
        if let Some(message) = admitted {
            debug!(
                message = %id,
                view_count = message.ephemeral.view_count,
                max_views = ?message.ephemeral.max_views,
                "view admitted"
            );
            return Ok(message);
        }

        // Refused: either unknown or expired.
        let message = self.load(id)?;
        self.destroy_lazily(&message, now)?;
        Err(LifecycleError::MessageExpired.into())
    }

    /// Check that the message is still live without consuming a view.
    pub fn check_live(&self, id: Uuid, now: DateTime<Utc>) -> Result<Message> {
        let message = self.load(id)?;
        if message.is_destroyed() || message.ephemeral.is_expired(now) {
            self.destroy_lazily(&message, now)?;
            return Err(LifecycleError::MessageExpired.into());
        }
        Ok(message)
    }

    pub fn state(&self, id: Uuid) -> Result<EphemeralState> {
        Ok(self.load(id)?.ephemeral)
    }

    /// Destroy messages whose self-destruct time has passed.
    pub fn cleanup_expired_messages(&self, now: DateTime<Utc>) -> Result<usize> {
        let destroyed = self.db.with(|db| db.destroy_self_destructed(now))?;
        for message in &destroyed {
            self.delivery.notify(Notification::MessageExpired {
                message_id: message.id,
                sender: message.sender,
            });
        }
        if !destroyed.is_empty() {
            info!(count = destroyed.len(), "self-destructed messages destroyed");
        }
        Ok(destroyed.len())
    }

    /// Destroy messages that have used up their views.
    pub fn cleanup_messages_at_view_limit(&self, now: DateTime<Utc>) -> Result<usize> {
        let destroyed = self.db.with(|db| db.destroy_at_view_limit(now))?;
        for message in &destroyed {
            self.delivery.notify(Notification::ViewLimitReached {
                message_id: message.id,
                sender: message.sender,
            });
        }
        if !destroyed.is_empty() {
            info!(count = destroyed.len(), "view-limited messages destroyed");
        }
        Ok(destroyed.len())
    }

    /// Drop destroyed rows older than `before`.
    pub fn purge_destroyed(&self, before: DateTime<Utc>) -> Result<usize> {
        Ok(self.db.with(|db| db.purge_destroyed_messages(before))?)
    }

    fn load(&self, id: Uuid) -> Result<Message> {
        self.db
            .with(|db: &mut Database| db.get_message_by_id(id))
            .map_err(|e| match e {
                StoreError::NotFound => LifecycleError::MessageNotFound.into(),
                other => other.into(),
            })
    }

    // The caller that wins the transition sends the notification, so the
    // sender hears about each message exactly once.
    fn destroy_lazily(&self, message: &Message, now: DateTime<Utc>) -> Result<()> {
        if message.is_destroyed() {
            return Ok(());
        }
        if !self.db.with(|db| db.mark_message_destroyed(message.id, now))? {
            return Ok(());
        }

        let notification = if message.ephemeral.at_view_limit() {
            Notification::ViewLimitReached {
                message_id: message.id,
                sender: message.sender,
            }
        } else {
            Notification::MessageExpired {
                message_id: message.id,
                sender: message.sender,
            }
        };
        info!(message = %message.id, "message destroyed on access");
        self.delivery.notify(notification);
        Ok(())
    }
}
