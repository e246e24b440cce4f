//! Broker schema SQL.

pub const QUEUE_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS task_messages (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    available_at INTEGER NOT NULL,
    claimed_at INTEGER,
    last_error TEXT,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_task_messages_ready ON task_messages(available_at);

CREATE TABLE IF NOT EXISTS task_chords (
    id TEXT PRIMARY KEY,
    size INTEGER NOT NULL,
    body_json TEXT NOT NULL,
    link_json TEXT NOT NULL,
    state TEXT NOT NULL DEFAULT 'pending' CHECK (state IN ('pending', 'fired', 'failed')),
    deadline INTEGER NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_task_chords_pending ON task_chords(state, deadline);

CREATE TABLE IF NOT EXISTS task_chord_slots (
    chord_id TEXT NOT NULL REFERENCES task_chords(id) ON DELETE CASCADE,
    slot_index INTEGER NOT NULL,
    result_json TEXT NOT NULL,
    PRIMARY KEY (chord_id, slot_index)
);

CREATE TABLE IF NOT EXISTS task_submissions (
    key TEXT PRIMARY KEY,
    created_at INTEGER NOT NULL
);
"#;
