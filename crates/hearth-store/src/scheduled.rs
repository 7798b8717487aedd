use chrono::{DateTime, Utc};
use rusqlite::params;
use uuid::Uuid;

use hearth_shared::types::{MessageType, RoomId, ScheduledStatus, UserId};

use crate::database::{fmt_ts, not_found, parse_enum, parse_opt_ts, parse_ts, parse_uuid, Database};
use crate::error::Result;
use crate::models::ScheduledMessage;

const SCHEDULED_COLUMNS: &str = "id, series_id, room_id, sender_id, content, message_type,
     encrypt, scheduled_for, created_at, status, retry_count, max_retries,
     last_attempt, error_message, recurrence_pattern, is_recurring,
     next_execution, end_date";

impl Database {
    // ---- Create ----

    pub fn insert_scheduled(&self, msg: &ScheduledMessage) -> Result<()> {
        self.conn().execute(
            "INSERT INTO scheduled_messages (id, series_id, room_id, sender_id, content,
                 message_type, encrypt, scheduled_for, created_at, status, retry_count,
                 max_retries, last_attempt, error_message, recurrence_pattern, is_recurring,
                 next_execution, end_date)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            params![
                msg.id.to_string(),
                msg.series_id.to_string(),
                msg.room.0,
                msg.sender.0,
                msg.content,
                msg.message_type.as_str(),
                msg.encrypt,
                fmt_ts(&msg.scheduled_for),
                fmt_ts(&msg.created_at),
                msg.status.as_str(),
                msg.retry_count,
                msg.max_retries,
                msg.last_attempt.as_ref().map(fmt_ts),
                msg.error_message,
                msg.recurrence_pattern,
                msg.is_recurring,
                msg.next_execution.as_ref().map(fmt_ts),
                msg.end_date.as_ref().map(fmt_ts),
            ],
        )?;
        Ok(())
    }

    // ---- Read ----

    pub fn get_scheduled(&self, id: Uuid) -> Result<ScheduledMessage> {
        self.conn()
            .query_row(
                &format!("SELECT {SCHEDULED_COLUMNS} FROM scheduled_messages WHERE id = ?1"),
                params![id.to_string()],
                row_to_scheduled,
            )
            .map_err(not_found)
    }

    pub fn list_scheduled_by_sender(&self, sender: UserId) -> Result<Vec<ScheduledMessage>> {
        self.select_scheduled("sender_id = ?1 ORDER BY scheduled_for DESC", sender.0)
    }

    pub fn list_scheduled_by_room(&self, room: RoomId) -> Result<Vec<ScheduledMessage>> {
        self.select_scheduled("room_id = ?1 ORDER BY scheduled_for DESC", room.0)
    }

    pub fn list_scheduled_by_status(&self, status: ScheduledStatus) -> Result<Vec<ScheduledMessage>> {
        self.select_scheduled("status = ?1 ORDER BY scheduled_for ASC", status.as_str())
    }

    /// Every instance of a recurring series, oldest first.
    pub fn list_scheduled_series(&self, series_id: Uuid) -> Result<Vec<ScheduledMessage>> {
        self.select_scheduled(
            "series_id = ?1 ORDER BY scheduled_for ASC",
            series_id.to_string(),
        )
    }

    pub fn count_scheduled_by_status(&self, status: ScheduledStatus) -> Result<u64> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM scheduled_messages WHERE status = ?1",
            params![status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn select_scheduled<P: rusqlite::ToSql>(
        &self,
        clause: &str,
        param: P,
    ) -> Result<Vec<ScheduledMessage>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {SCHEDULED_COLUMNS} FROM scheduled_messages WHERE {clause}"
        ))?;
        let rows = stmt.query_map(params![param], row_to_scheduled)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // ---- Claim ----

    /// Select due messages and mark them `PROCESSING` in one statement.
    ///
    /// A row can only move out of `PENDING` once, so concurrent pollers
    /// (threads or processes sharing the file) never receive the same id.
    pub fn claim_due_scheduled(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<ScheduledMessage>> {
        let now = fmt_ts(&now);
        let mut stmt = self.conn().prepare(&format!(
            "UPDATE scheduled_messages
             SET status = 'PROCESSING', last_attempt = ?1
             WHERE status = 'PENDING' AND id IN (
                 SELECT id FROM scheduled_messages
                 WHERE status = 'PENDING' AND scheduled_for <= ?1
                 ORDER BY scheduled_for ASC
                 LIMIT ?2
             )
             RETURNING {SCHEDULED_COLUMNS}"
        ))?;
        let rows = stmt.query_map(params![now, limit], row_to_scheduled)?;

        let mut claimed = Vec::new();
        for row in rows {
            claimed.push(row?);
        }
        claimed.sort_by_key(|m| m.scheduled_for);
        Ok(claimed)
    }

    /// Claim one specific `PENDING` message regardless of its due time.
    pub fn claim_scheduled(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<ScheduledMessage>> {
        let mut stmt = self.conn().prepare(&format!(
            "UPDATE scheduled_messages
             SET status = 'PROCESSING', last_attempt = ?2
             WHERE id = ?1 AND status = 'PENDING'
             RETURNING {SCHEDULED_COLUMNS}"
        ))?;
        let mut rows = stmt.query_map(params![id.to_string(), fmt_ts(&now)], row_to_scheduled)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    // ---- Finish a claim ----

    pub fn mark_scheduled_sent(&self, id: Uuid, next_execution: Option<DateTime<Utc>>) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE scheduled_messages
             SET status = 'SENT', error_message = NULL, next_execution = ?2
             WHERE id = ?1 AND status = 'PROCESSING'",
            params![id.to_string(), next_execution.as_ref().map(fmt_ts)],
        )?;
        Ok(affected > 0)
    }

    /// Return a failed attempt to `PENDING`, re-armed at `retry_at`.
    pub fn mark_scheduled_retry(
        &self,
        id: Uuid,
        retry_count: u32,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE scheduled_messages
             SET status = 'PENDING', retry_count = ?2, error_message = ?3, scheduled_for = ?4
             WHERE id = ?1 AND status = 'PROCESSING'",
            params![id.to_string(), retry_count, error, fmt_ts(&retry_at)],
        )?;
        Ok(affected > 0)
    }

    pub fn mark_scheduled_failed(&self, id: Uuid, retry_count: u32, error: &str) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE scheduled_messages
             SET status = 'FAILED', retry_count = ?2, error_message = ?3
             WHERE id = ?1 AND status = 'PROCESSING'",
            params![id.to_string(), retry_count, error],
        )?;
        Ok(affected > 0)
    }

    /// Return claims older than `cutoff` to `PENDING` (the worker holding
    /// them is gone).
    pub fn release_stale_claims(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let affected = self.conn().execute(
            "UPDATE scheduled_messages SET status = 'PENDING'
             WHERE status = 'PROCESSING' AND last_attempt < ?1",
            params![fmt_ts(&cutoff)],
        )?;
        Ok(affected)
    }

    // ---- Owner mutations ----

    /// Overwrite the editable fields of a `PENDING` message. Returns `false`
    /// when the row is missing or no longer pending.
    pub fn update_pending_scheduled(&self, msg: &ScheduledMessage) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE scheduled_messages
             SET content = ?2, message_type = ?3, encrypt = ?4, scheduled_for = ?5,
                 max_retries = ?6, recurrence_pattern = ?7, is_recurring = ?8, end_date = ?9,
                 next_execution = ?10
             WHERE id = ?1 AND status = 'PENDING'",
            params![
                msg.id.to_string(),
                msg.content,
                msg.message_type.as_str(),
                msg.encrypt,
                fmt_ts(&msg.scheduled_for),
                msg.max_retries,
                msg.recurrence_pattern,
                msg.is_recurring,
                msg.end_date.as_ref().map(fmt_ts),
                msg.next_execution.as_ref().map(fmt_ts),
            ],
        )?;
        Ok(affected > 0)
    }

    pub fn cancel_pending_scheduled(&self, id: Uuid) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE scheduled_messages SET status = 'CANCELLED'
             WHERE id = ?1 AND status = 'PENDING'",
            params![id.to_string()],
        )?;
        Ok(affected > 0)
    }

    // ---- Sweeps ----

    /// Reclassify never-attempted `PENDING` messages due before `cutoff` as
    /// `EXPIRED`.
    pub fn expire_overdue_scheduled(&self, cutoff: DateTime<Utc>) -> Result<Vec<ScheduledMessage>> {
        let mut stmt = self.conn().prepare(&format!(
            "UPDATE scheduled_messages
             SET status = 'EXPIRED', error_message = 'Missed delivery window'
             WHERE status = 'PENDING' AND last_attempt IS NULL AND scheduled_for < ?1
             RETURNING {SCHEDULED_COLUMNS}"
        ))?;
        let rows = stmt.query_map(params![fmt_ts(&cutoff)], row_to_scheduled)?;

        let mut expired = Vec::new();
        for row in rows {
            expired.push(row?);
        }
        Ok(expired)
    }

    /// Delete terminal records whose last activity is older than `older_than`.
    pub fn purge_terminal_scheduled(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let affected = self.conn().execute(
            "DELETE FROM scheduled_messages
             WHERE status IN ('SENT', 'FAILED', 'CANCELLED', 'EXPIRED')
               AND COALESCE(last_attempt, scheduled_for) < ?1",
            params![fmt_ts(&older_than)],
        )?;
        Ok(affected)
    }
}

fn row_to_scheduled(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScheduledMessage> {
    let id_str: String = row.get(0)?;
    let series_str: String = row.get(1)?;
    let type_str: String = row.get(5)?;
    let scheduled_str: String = row.get(7)?;
    let created_str: String = row.get(8)?;
    let status_str: String = row.get(9)?;

    Ok(ScheduledMessage {
        id: parse_uuid(0, &id_str)?,
        series_id: parse_uuid(1, &series_str)?,
        room: RoomId(row.get(2)?),
        sender: UserId(row.get(3)?),
        content: row.get(4)?,
        message_type: parse_enum(5, &type_str, MessageType::parse)?,
        encrypt: row.get(6)?,
        scheduled_for: parse_ts(7, &scheduled_str)?,
        created_at: parse_ts(8, &created_str)?,
        status: parse_enum(9, &status_str, ScheduledStatus::parse)?,
        retry_count: row.get(10)?,
        max_retries: row.get(11)?,
        last_attempt: parse_opt_ts(12, row.get(12)?)?,
        error_message: row.get(13)?,
        recurrence_pattern: row.get(14)?,
        is_recurring: row.get(15)?,
        next_execution: parse_opt_ts(16, row.get(16)?)?,
        end_date: parse_opt_ts(17, row.get(17)?)?,
    })
}
