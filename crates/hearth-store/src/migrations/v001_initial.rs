//! v001 -- Initial schema creation.
//!
//! Creates the three core tables: `messages`, `scheduled_messages` and
//! `filter_rules`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Messages (+ ephemeral state)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id                    TEXT PRIMARY KEY NOT NULL,  -- UUID v4
    room_id               INTEGER NOT NULL,
    sender_id             INTEGER NOT NULL,
    message_type          TEXT NOT NULL,
    content               TEXT NOT NULL,              -- Base64 ciphertext or plaintext
    is_encrypted          INTEGER NOT NULL DEFAULT 0,
    key_version           INTEGER,
    room_filter_status    TEXT NOT NULL,
    created_at            TEXT NOT NULL,              -- RFC-3339, UTC, micros
    view_count            INTEGER NOT NULL DEFAULT 0,
    max_views             INTEGER,
    self_destruct_at      TEXT,
    screenshot_protection INTEGER NOT NULL DEFAULT 0,
    destroyed_at          TEXT
);

CREATE INDEX IF NOT EXISTS idx_messages_room_ts
    ON messages(room_id, created_at DESC);

CREATE INDEX IF NOT EXISTS idx_messages_self_destruct
    ON messages(self_destruct_at) WHERE destroyed_at IS NULL;

-- ----------------------------------------------------------------
-- Scheduled messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS scheduled_messages (
    id                 TEXT PRIMARY KEY NOT NULL,     -- UUID v4
    series_id          TEXT NOT NULL,
    room_id            INTEGER NOT NULL,
    sender_id          INTEGER NOT NULL,
    content            TEXT NOT NULL,
    message_type       TEXT NOT NULL,
    encrypt            INTEGER NOT NULL DEFAULT 0,
    scheduled_for      TEXT NOT NULL,
    created_at         TEXT NOT NULL,
    status             TEXT NOT NULL,
    retry_count        INTEGER NOT NULL DEFAULT 0,
    max_retries        INTEGER NOT NULL,
    last_attempt       TEXT,
    error_message      TEXT,
    recurrence_pattern TEXT,
    is_recurring       INTEGER NOT NULL DEFAULT 0,
    next_execution     TEXT,
    end_date           TEXT
);

CREATE INDEX IF NOT EXISTS idx_scheduled_due
    ON scheduled_messages(status, scheduled_for);

CREATE INDEX IF NOT EXISTS idx_scheduled_sender
    ON scheduled_messages(sender_id, scheduled_for DESC);

CREATE INDEX IF NOT EXISTS idx_scheduled_room
    ON scheduled_messages(room_id, scheduled_for DESC);

-- ----------------------------------------------------------------
-- Filter rules
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS filter_rules (
    id          TEXT PRIMARY KEY NOT NULL,        -- UUID v4
    scope       TEXT NOT NULL,                    -- GLOBAL | CONTACT | ROOM
    owner_id    INTEGER NOT NULL,                 -- user id, or room id for ROOM
    contact_id  INTEGER,                          -- CONTACT only
    content     TEXT NOT NULL,
    filter_type TEXT NOT NULL,                    -- WORD | EMOJI | PHRASE
    description TEXT,
    is_active   INTEGER NOT NULL DEFAULT 1,
    created_by  INTEGER NOT NULL,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_filter_rules_scope
    ON filter_rules(scope, owner_id, contact_id, is_active);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
