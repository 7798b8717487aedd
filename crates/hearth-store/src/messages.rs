use chrono::{DateTime, Utc};
use rusqlite::params;
use uuid::Uuid;

use hearth_shared::types::{FilterStatus, MessageType, RoomId, UserId};

use crate::database::{fmt_ts, not_found, parse_enum, parse_opt_ts, parse_ts, parse_uuid, Database};
use crate::error::Result;
use crate::models::{EphemeralState, Message};

const MESSAGE_COLUMNS: &str = "id, room_id, sender_id, message_type, content, is_encrypted,
     key_version, room_filter_status, created_at, view_count, max_views,
     self_destruct_at, screenshot_protection, destroyed_at";

impl Database {
    // ---- Create ----

    pub fn insert_message(&self, message: &Message) -> Result<()> {
        self.conn().execute(
            "INSERT INTO messages (id, room_id, sender_id, message_type, content, is_encrypted,
                 key_version, room_filter_status, created_at, view_count, max_views,
                 self_destruct_at, screenshot_protection, destroyed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                message.id.to_string(),
                message.room.0,
                message.sender.0,
                message.message_type.as_str(),
                message.content,
                message.is_encrypted,
                message.key_version,
                message.room_filter_status.as_str(),
                fmt_ts(&message.created_at),
                message.ephemeral.view_count,
                message.ephemeral.max_views,
                message.ephemeral.self_destruct_at.as_ref().map(fmt_ts),
                message.ephemeral.screenshot_protection,
                message.destroyed_at.as_ref().map(fmt_ts),
            ],
        )?;
        Ok(())
    }

    // ---- Read ----

    pub fn get_message_by_id(&self, id: Uuid) -> Result<Message> {
        self.conn()
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id.to_string()],
                row_to_message,
            )
            .map_err(not_found)
    }

    pub fn get_messages_for_room(&self, room: RoomId, limit: u32) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE room_id = ?1
             ORDER BY created_at DESC
             LIMIT ?2"
        ))?;

        let rows = stmt.query_map(params![room.0, limit], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    // ---- Update ----

    /// Atomically admit one view.
    ///
    /// The increment happens only while the message is neither destroyed,
    /// at its view limit, nor past its self-destruct time, so two concurrent
    /// readers can never both pass a `max_views` boundary. Returns `None`
    /// when the view is refused (or the message does not exist).
    pub fn record_view(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<Message>> {
        let mut stmt = self.conn().prepare(&format!(
            "UPDATE messages SET view_count = view_count + 1
             WHERE id = ?1
               AND destroyed_at IS NULL
               AND (max_views IS NULL OR view_count < max_views)
               AND (self_destruct_at IS NULL OR self_destruct_at > ?2)
             RETURNING {MESSAGE_COLUMNS}"
        ))?;

        let mut rows = stmt.query_map(params![id.to_string(), fmt_ts(&now)], row_to_message)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// Move a message to `DESTROYED`, wiping its content. Returns `false` if
    /// it was already destroyed.
    pub fn mark_message_destroyed(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE messages SET destroyed_at = ?2, content = ''
             WHERE id = ?1 AND destroyed_at IS NULL",
            params![id.to_string(), fmt_ts(&now)],
        )?;
        Ok(affected > 0)
    }

    /// Destroy every live message whose self-destruct time has passed and
    /// return them (content already wiped).
    pub fn destroy_self_destructed(&self, now: DateTime<Utc>) -> Result<Vec<Message>> {
        let now = fmt_ts(&now);
        self.destroy_where(
            "self_destruct_at IS NOT NULL AND self_destruct_at <= ?1",
            &now,
        )
    }

    /// Destroy every live message that has reached its view limit.
    pub fn destroy_at_view_limit(&self, now: DateTime<Utc>) -> Result<Vec<Message>> {
        let now = fmt_ts(&now);
        self.destroy_where("max_views IS NOT NULL AND view_count >= max_views", &now)
    }

    fn destroy_where(&self, predicate: &str, now: &str) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(&format!(
            "UPDATE messages SET destroyed_at = ?1, content = ''
             WHERE destroyed_at IS NULL AND {predicate}
             RETURNING {MESSAGE_COLUMNS}"
        ))?;

        let rows = stmt.query_map(params![now], row_to_message)?;

        let mut destroyed = Vec::new();
        for row in rows {
            destroyed.push(row?);
        }
        Ok(destroyed)
    }

    // ---- Delete ----

    /// Hard-delete destroyed messages whose destruction is older than `before`.
    pub fn purge_destroyed_messages(&self, before: DateTime<Utc>) -> Result<usize> {
        let affected = self.conn().execute(
            "DELETE FROM messages WHERE destroyed_at IS NOT NULL AND destroyed_at < ?1",
            params![fmt_ts(&before)],
        )?;
        Ok(affected)
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let id_str: String = row.get(0)?;
    let type_str: String = row.get(3)?;
    let status_str: String = row.get(7)?;
    let created_str: String = row.get(8)?;

    Ok(Message {
        id: parse_uuid(0, &id_str)?,
        room: RoomId(row.get(1)?),
        sender: UserId(row.get(2)?),
        message_type: parse_enum(3, &type_str, MessageType::parse)?,
        content: row.get(4)?,
        is_encrypted: row.get(5)?,
        key_version: row.get(6)?,
        room_filter_status: parse_enum(7, &status_str, FilterStatus::parse)?,
        created_at: parse_ts(8, &created_str)?,
        ephemeral: EphemeralState {
            view_count: row.get(9)?,
            max_views: row.get(10)?,
            self_destruct_at: parse_opt_ts(11, row.get(11)?)?,
            screenshot_protection: row.get(12)?,
        },
        destroyed_at: parse_opt_ts(13, row.get(13)?)?,
    })
}
