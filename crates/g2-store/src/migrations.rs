//! Additive schema migrations, applied once at `StateStore::open`/`open_in_memory`.
//!
//! Every statement is `CREATE TABLE IF NOT EXISTS`; there are no down-migrations.
//! `schema_version` records the highest applied migration id so a future migration
//! set can skip statements already run against an existing file.

use rusqlite::Connection;

use crate::Result;

pub(crate) fn apply(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA foreign_keys = ON;

        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS chats (
            jid TEXT PRIMARY KEY,
            name TEXT,
            last_message_time TEXT NOT NULL,
            channel TEXT,
            is_group INTEGER
        );

        CREATE TABLE IF NOT EXISTS messages (
            id TEXT NOT NULL,
            chat_jid TEXT NOT NULL,
            sender TEXT NOT NULL,
            sender_name TEXT,
            content TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            is_from_me INTEGER NOT NULL DEFAULT 0,
            is_bot_message INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (id, chat_jid)
        );
        CREATE INDEX IF NOT EXISTS idx_messages_chat_ts ON messages (chat_jid, timestamp);

        CREATE TABLE IF NOT EXISTS registered_groups (
            jid TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            folder TEXT NOT NULL UNIQUE,
            trigger_re TEXT NOT NULL,
            requires_trigger INTEGER NOT NULL DEFAULT 1,
            added_at TEXT NOT NULL,
            channel TEXT NOT NULL,
            container_config TEXT
        );

        CREATE TABLE IF NOT EXISTS sessions (
            group_folder TEXT PRIMARY KEY,
            session_id TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS archived_sessions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            group_folder TEXT NOT NULL,
            session_id TEXT NOT NULL,
            name TEXT,
            content TEXT,
            archived_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_archived_sessions_folder ON archived_sessions (group_folder);

        CREATE TABLE IF NOT EXISTS scheduled_tasks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            group_folder TEXT NOT NULL,
            chat_jid TEXT NOT NULL,
            prompt TEXT NOT NULL,
            schedule_type TEXT NOT NULL,
            schedule_value TEXT NOT NULL,
            context_mode TEXT NOT NULL,
            next_run TEXT,
            last_run TEXT,
            last_result TEXT,
            status TEXT NOT NULL DEFAULT 'active',
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_scheduled_tasks_due ON scheduled_tasks (status, next_run);

        CREATE TABLE IF NOT EXISTS task_run_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id INTEGER NOT NULL,
            started_at TEXT NOT NULL,
            duration_ms INTEGER NOT NULL,
            status TEXT NOT NULL,
            summary TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_task_run_log_task ON task_run_log (task_id);

        CREATE TABLE IF NOT EXISTS router_state (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        ",
    )?;

    let version: i64 = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |r| r.get(0))
        .unwrap_or(0);
    if version < CURRENT_VERSION {
        conn.execute(
            "INSERT INTO schema_version (version) VALUES (?1)",
            [CURRENT_VERSION],
        )?;
    }

    Ok(())
}

const CURRENT_VERSION: i64 = 1;
