//! v001 -- Initial schema creation.
//!
//! `messages` is the local-intent log, `relay_results` the confirmation
//! overlay, `outbox` the pending-work queue.

use rusqlite::Connection;

const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Messages (never physically deleted)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    seq             INTEGER PRIMARY KEY AUTOINCREMENT,  -- insertion order, ordering tie-break
    local_id        TEXT NOT NULL UNIQUE,               -- UUID v4
    event_id        TEXT UNIQUE,                        -- hex event id, set once signed
    conversation_id TEXT NOT NULL,
    sender          TEXT NOT NULL,                      -- hex pubkey
    recipient       TEXT,                               -- hex pubkey, direct messages
    group_id        TEXT,                               -- group messages
    content         TEXT NOT NULL,                      -- plaintext, local only
    timestamp_ms    INTEGER NOT NULL,
    direction       TEXT NOT NULL,                      -- 'outgoing' | 'incoming'
    status          TEXT NOT NULL,
    reply_to        TEXT,                               -- hex event id
    attachments     TEXT NOT NULL DEFAULT '[]',         -- JSON array of references
    deleted_at_ms   INTEGER,
    retry_count     INTEGER NOT NULL DEFAULT 0,
    error_kind      TEXT,
    signed_event    TEXT                                -- JSON, republished on retry
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation
    ON messages(conversation_id, timestamp_ms, seq);
CREATE INDEX IF NOT EXISTS idx_messages_status ON messages(status);

-- ----------------------------------------------------------------
-- Relay results (one row per message and relay, latest wins)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS relay_results (
    local_id       TEXT NOT NULL,
    relay_url      TEXT NOT NULL,
    success        INTEGER NOT NULL,                    -- boolean 0/1
    error          TEXT,
    latency_ms     INTEGER,
    recorded_at_ms INTEGER NOT NULL,

    PRIMARY KEY (local_id, relay_url),
    FOREIGN KEY (local_id) REFERENCES messages(local_id) ON DELETE CASCADE
);

-- ----------------------------------------------------------------
-- Outbox (removed once the message is terminal)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS outbox (
    local_id           TEXT PRIMARY KEY NOT NULL,
    attempts           INTEGER NOT NULL DEFAULT 0,
    next_attempt_at_ms INTEGER,
    last_error         TEXT,
    created_at_ms      INTEGER NOT NULL,

    FOREIGN KEY (local_id) REFERENCES messages(local_id) ON DELETE CASCADE
);

-- ----------------------------------------------------------------
-- Reactions
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS reactions (
    local_id       TEXT NOT NULL,
    reactor        TEXT NOT NULL,                       -- hex pubkey
    emoji          TEXT NOT NULL,
    created_at_ms  INTEGER NOT NULL,

    PRIMARY KEY (local_id, reactor, emoji),
    FOREIGN KEY (local_id) REFERENCES messages(local_id) ON DELETE CASCADE
);

-- ----------------------------------------------------------------
-- Group keys
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS group_keys (
    group_id      TEXT PRIMARY KEY NOT NULL,
    key_hex       TEXT NOT NULL,
    created_at_ms INTEGER NOT NULL
);

-- ----------------------------------------------------------------
-- Sync bookkeeping
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS sync_state (
    name  TEXT PRIMARY KEY NOT NULL,
    value INTEGER NOT NULL
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
