//! SQL schema for the Relay SQLite store.
//!
//! Executed once at connection startup via `PRAGMA user_version`. Future
//! migrations will be gated on that version number.

/// Full schema DDL; idempotent thanks to `CREATE TABLE IF NOT EXISTS`.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA busy_timeout = 5000;

-- Rows are never deleted. Only the dispatcher updates them.
CREATE TABLE IF NOT EXISTS outbox_messages (
    seq              INTEGER PRIMARY KEY AUTOINCREMENT,
    message_id       TEXT NOT NULL UNIQUE,
    target           TEXT NOT NULL,   -- 'back_office' | 'role' | 'user'
    target_value     TEXT,
    event_type       TEXT NOT NULL,
    message          TEXT NOT NULL,
    payload          TEXT,            -- opaque JSON
    status           TEXT NOT NULL DEFAULT 'pending',
    attempt_count    INTEGER NOT NULL DEFAULT 0,
    last_error       TEXT,
    next_attempt_at  TEXT NOT NULL,   -- RFC 3339 UTC, fixed width
    last_attempt_at  TEXT,
    processed_at     TEXT,
    created_at       TEXT NOT NULL,
    claim_token      TEXT,
    claimed_by       TEXT,
    claim_expires_at TEXT,
    CHECK (target = 'back_office' OR target_value IS NOT NULL),
    CHECK (attempt_count >= 0)
);

-- One row per (provider, event_key); the UNIQUE constraint is the ledger.
CREATE TABLE IF NOT EXISTS webhook_receipts (
    receipt_id            TEXT PRIMARY KEY,
    provider              TEXT NOT NULL,
    event_key             TEXT NOT NULL,
    event_type            TEXT NOT NULL,
    external_reference    TEXT,
    payload               TEXT,
    status                TEXT NOT NULL,
    attempt_count         INTEGER NOT NULL DEFAULT 1,
    first_received_at     TEXT NOT NULL,
    last_attempt_at       TEXT NOT NULL,
    processing_started_at TEXT,
    processed_at          TEXT,
    notes                 TEXT,
    UNIQUE (provider, event_key)
);

CREATE TABLE IF NOT EXISTS finance_alerts (
    alert_id           TEXT PRIMARY KEY,
    alert_type         TEXT NOT NULL,
    trigger_rule       TEXT NOT NULL,
    severity           INTEGER NOT NULL,  -- 0 low .. 3 critical
    message            TEXT NOT NULL,
    payload            TEXT,
    realtime_published INTEGER NOT NULL DEFAULT 0,
    email_attempted    INTEGER NOT NULL DEFAULT 0,
    email_succeeded    INTEGER NOT NULL DEFAULT 0,
    state              TEXT NOT NULL DEFAULT 'new',
    raised_at          TEXT NOT NULL,
    state_updated_at   TEXT NOT NULL,
    acknowledged_at    TEXT,
    acknowledged_by    TEXT,
    resolved_at        TEXT,
    resolved_by        TEXT,
    resolution_note    TEXT
);

CREATE INDEX IF NOT EXISTS outbox_due_idx       ON outbox_messages(status, next_attempt_at);
CREATE INDEX IF NOT EXISTS receipts_status_idx  ON webhook_receipts(status);
CREATE INDEX IF NOT EXISTS alerts_triage_idx    ON finance_alerts(state, severity);

PRAGMA user_version = 1;
";
