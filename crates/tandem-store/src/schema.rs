//! Session database DDL, applied as numbered migrations.
//!
//! `PRAGMA user_version` records how many entries of [`MIGRATIONS`] have run.
//! Append new steps; never edit a released one.

pub const MIGRATIONS: &[&str] = &[
    // 1: sessions and their ordered message log
    r#"
    CREATE TABLE sessions (
        id TEXT PRIMARY KEY,
        turn_state TEXT NOT NULL DEFAULT 'idle',
        turn_count INTEGER NOT NULL DEFAULT 0,
        todos TEXT NOT NULL DEFAULT '[]',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE messages (
        id TEXT NOT NULL,
        session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
        position INTEGER NOT NULL,
        role TEXT NOT NULL,
        payload TEXT NOT NULL,
        PRIMARY KEY (session_id, position)
    );
    "#,
    // 2: listing by recency
    r#"
    CREATE INDEX idx_sessions_updated ON sessions(updated_at);
    "#,
];

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;

pub fn latest_version() -> u32 {
    MIGRATIONS.len() as u32
}
