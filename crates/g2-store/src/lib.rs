//! Durable persistence for chats, messages, registered groups, sessions, archived
//! sessions, scheduled tasks, task run logs and router cursor state.
//!
//! Backed by a single `rusqlite` connection guarded by a `std::sync::Mutex` and run
//! through `tokio::task::spawn_blocking`, since SQLite's API is synchronous and must
//! never block the async runtime's worker threads.

mod migrations;
mod rows;

use std::{
    path::Path,
    sync::{Arc, Mutex},
};

use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

pub use rows::{
    ArchivedSession, Chat, Message, RegisteredGroup, ScheduledTask, Session, TaskRunLog,
};

use g2_core::domain::{ArchiveId, ContextMode, GroupFolder, Jid, ScheduleType, TaskId, TaskStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("store task panicked: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl From<StoreError> for g2_core::Error {
    fn from(e: StoreError) -> Self {
        g2_core::Error::Store(e.to_string())
    }
}

#[derive(Clone)]
pub struct StateStore {
    conn: Arc<Mutex<Connection>>,
}

impl StateStore {
    /// Open (creating if absent) the store file at `path`, running schema migrations.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Other(e.to_string()))?;
        }
        let conn = Connection::open(path)?;
        migrations::apply(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store, used by tests and by orchestrator integration tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        migrations::apply(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().expect("store mutex poisoned");
            f(&guard)
        })
        .await?
    }

    // ---------------- Chats ----------------

    /// Upsert chat metadata. Never regresses `last_message_time` (MAX) and never
    /// clears previously known optional fields (COALESCE).
    pub async fn store_chat_metadata(
        &self,
        jid: Jid,
        timestamp: String,
        name: Option<String>,
        channel: Option<String>,
        is_group: Option<bool>,
    ) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO chats (jid, name, last_message_time, channel, is_group)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(jid) DO UPDATE SET
                   name = COALESCE(excluded.name, chats.name),
                   last_message_time = MAX(chats.last_message_time, excluded.last_message_time),
                   channel = COALESCE(excluded.channel, chats.channel),
                   is_group = COALESCE(excluded.is_group, chats.is_group)",
                params![
                    jid.0,
                    name,
                    timestamp,
                    channel,
                    is_group.map(|b| b as i64)
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_chat(&self, jid: Jid) -> Result<Option<Chat>> {
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT jid, name, last_message_time, channel, is_group FROM chats WHERE jid = ?1",
                params![jid.0],
                rows::chat_from_row,
            )
            .optional()
            .map_err(Into::into)
        })
        .await
    }

    /// Chats observed via `onChatMetadata` that are not yet registered groups,
    /// excluding the synthetic `sync_sentinel_jid` row — the candidate list the
    /// main group's agent uses to discover and register new groups.
    pub async fn get_unregistered_chats(&self, sync_sentinel_jid: &str) -> Result<Vec<Chat>> {
        let sentinel = sync_sentinel_jid.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT c.jid, c.name, c.last_message_time, c.channel, c.is_group
                 FROM chats c
                 LEFT JOIN registered_groups g ON g.jid = c.jid
                 WHERE g.jid IS NULL AND c.jid != ?1
                 ORDER BY c.last_message_time DESC",
            )?;
            let rows = stmt
                .query_map(params![sentinel], rows::chat_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    // ---------------- Messages ----------------

    /// Idempotent upsert on `(id, chat_jid)`; re-delivery never duplicates.
    pub async fn store_message(&self, msg: Message) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO messages (id, chat_jid, sender, sender_name, content, timestamp, is_from_me, is_bot_message)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(id, chat_jid) DO UPDATE SET
                   sender = excluded.sender,
                   sender_name = excluded.sender_name,
                   content = excluded.content,
                   timestamp = excluded.timestamp,
                   is_from_me = excluded.is_from_me,
                   is_bot_message = excluded.is_bot_message",
                params![
                    msg.id,
                    msg.chat_jid,
                    msg.sender,
                    msg.sender_name,
                    msg.content,
                    msg.timestamp,
                    msg.is_from_me as i64,
                    msg.is_bot_message as i64,
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Messages for one JID strictly after `since_ts`, excluding bot traffic, ordered
    /// ascending by timestamp.
    pub async fn get_messages_since(
        &self,
        jid: Jid,
        since_ts: String,
        bot_prefix: String,
    ) -> Result<Vec<Message>> {
        self.with_conn(move |conn| {
            let like_pattern = format!("{bot_prefix}:%");
            let mut stmt = conn.prepare(
                "SELECT id, chat_jid, sender, sender_name, content, timestamp, is_from_me, is_bot_message
                 FROM messages
                 WHERE chat_jid = ?1 AND timestamp > ?2 AND is_bot_message = 0
                   AND content NOT LIKE ?3
                 ORDER BY timestamp ASC",
            )?;
            let out = stmt
                .query_map(params![jid.0, since_ts, like_pattern], rows::message_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(out)
        })
        .await
    }

    /// Same filter across a JID set; also returns the new max-seen timestamp.
    pub async fn get_new_messages(
        &self,
        jids: Vec<Jid>,
        last_ts: String,
        bot_prefix: String,
    ) -> Result<(Vec<Message>, String)> {
        self.with_conn(move |conn| {
            if jids.is_empty() {
                return Ok((Vec::new(), last_ts));
            }
            let like_pattern = format!("{bot_prefix}:%");
            let placeholders = jids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
            let sql = format!(
                "SELECT id, chat_jid, sender, sender_name, content, timestamp, is_from_me, is_bot_message
                 FROM messages
                 WHERE chat_jid IN ({placeholders}) AND timestamp > ? AND is_bot_message = 0
                   AND content NOT LIKE ?
                 ORDER BY timestamp ASC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut bind_params: Vec<&dyn rusqlite::ToSql> =
                jids.iter().map(|j| &j.0 as &dyn rusqlite::ToSql).collect();
            bind_params.push(&last_ts);
            bind_params.push(&like_pattern);

            let out = stmt
                .query_map(bind_params.as_slice(), rows::message_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let new_ts = out
                .iter()
                .map(|m| m.timestamp.clone())
                .fold(last_ts, |acc, ts| if ts > acc { ts } else { acc });

            Ok((out, new_ts))
        })
        .await
    }

    // ---------------- Registered groups ----------------

    pub async fn register_group(&self, group: RegisteredGroup) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO registered_groups (jid, name, folder, trigger_re, requires_trigger, added_at, channel, container_config)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(jid) DO UPDATE SET
                   name = excluded.name,
                   folder = excluded.folder,
                   trigger_re = excluded.trigger_re,
                   requires_trigger = excluded.requires_trigger,
                   channel = excluded.channel,
                   container_config = excluded.container_config",
                params![
                    group.jid,
                    group.name,
                    group.folder,
                    group.trigger,
                    group.requires_trigger as i64,
                    group.added_at,
                    group.channel,
                    group.container_config,
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_registered_groups(&self) -> Result<Vec<RegisteredGroup>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT jid, name, folder, trigger_re, requires_trigger, added_at, channel, container_config
                 FROM registered_groups",
            )?;
            let out = stmt
                .query_map([], rows::group_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(out)
        })
        .await
    }

    pub async fn get_group_by_folder(&self, folder: GroupFolder) -> Result<Option<RegisteredGroup>> {
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT jid, name, folder, trigger_re, requires_trigger, added_at, channel, container_config
                 FROM registered_groups WHERE folder = ?1",
                params![folder.0],
                rows::group_from_row,
            )
            .optional()
            .map_err(Into::into)
        })
        .await
    }

    // ---------------- Sessions ----------------

    pub async fn get_session(&self, folder: GroupFolder) -> Result<Option<Session>> {
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT group_folder, session_id FROM sessions WHERE group_folder = ?1",
                params![folder.0],
                |r| {
                    Ok(Session {
                        group_folder: r.get(0)?,
                        session_id: r.get(1)?,
                    })
                },
            )
            .optional()
            .map_err(Into::into)
        })
        .await
    }

    pub async fn set_session(&self, folder: GroupFolder, session_id: String) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO sessions (group_folder, session_id) VALUES (?1, ?2)
                 ON CONFLICT(group_folder) DO UPDATE SET session_id = excluded.session_id",
                params![folder.0, session_id],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn clear_session(&self, folder: GroupFolder) -> Result<Option<String>> {
        self.with_conn(move |conn| {
            let previous: Option<String> = conn
                .query_row(
                    "SELECT session_id FROM sessions WHERE group_folder = ?1",
                    params![folder.0],
                    |r| r.get(0),
                )
                .optional()?;
            conn.execute(
                "DELETE FROM sessions WHERE group_folder = ?1",
                params![folder.0],
            )?;
            Ok(previous)
        })
        .await
    }

    // ---------------- Archived sessions ----------------

    pub async fn archive_session(
        &self,
        folder: GroupFolder,
        session_id: String,
        name: Option<String>,
        content: Option<String>,
        archived_at: String,
    ) -> Result<ArchiveId> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO archived_sessions (group_folder, session_id, name, content, archived_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![folder.0, session_id, name, content, archived_at],
            )?;
            Ok(ArchiveId(conn.last_insert_rowid()))
        })
        .await
    }

    pub async fn search_archived_sessions(
        &self,
        folder: GroupFolder,
        query: String,
    ) -> Result<Vec<ArchivedSession>> {
        self.with_conn(move |conn| {
            let like = format!("%{query}%");
            let mut stmt = conn.prepare(
                "SELECT id, group_folder, session_id, name, content, archived_at
                 FROM archived_sessions
                 WHERE group_folder = ?1 AND (name LIKE ?2 OR content LIKE ?2)
                 ORDER BY archived_at DESC",
            )?;
            let out = stmt
                .query_map(params![folder.0, like], rows::archive_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(out)
        })
        .await
    }

    /// Atomically: archive the currently active session (if any), activate `archive_id`'s
    /// session, and delete that archive row.
    pub async fn resume_archived_session(
        &self,
        folder: GroupFolder,
        archive_id: ArchiveId,
        archived_at: String,
    ) -> Result<Option<String>> {
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;

            let target: Option<(String,)> = tx
                .query_row(
                    "SELECT session_id FROM archived_sessions WHERE id = ?1 AND group_folder = ?2",
                    params![archive_id.0, folder.0],
                    |r| Ok((r.get(0)?,)),
                )
                .optional()?;
            let Some((target_session_id,)) = target else {
                return Ok(None);
            };

            let current: Option<String> = tx
                .query_row(
                    "SELECT session_id FROM sessions WHERE group_folder = ?1",
                    params![folder.0],
                    |r| r.get(0),
                )
                .optional()?;
            if let Some(current_session_id) = current {
                tx.execute(
                    "INSERT INTO archived_sessions (group_folder, session_id, name, content, archived_at)
                     VALUES (?1, ?2, NULL, NULL, ?3)",
                    params![folder.0, current_session_id, archived_at],
                )?;
            }

            tx.execute(
                "INSERT INTO sessions (group_folder, session_id) VALUES (?1, ?2)
                 ON CONFLICT(group_folder) DO UPDATE SET session_id = excluded.session_id",
                params![folder.0, target_session_id],
            )?;
            tx.execute(
                "DELETE FROM archived_sessions WHERE id = ?1",
                params![archive_id.0],
            )?;

            tx.commit()?;
            Ok(Some(target_session_id))
        })
        .await
    }

    // ---------------- Scheduled tasks ----------------

    #[allow(clippy::too_many_arguments)]
    pub async fn create_task(
        &self,
        folder: GroupFolder,
        chat_jid: Jid,
        prompt: String,
        schedule_type: ScheduleType,
        schedule_value: String,
        context_mode: ContextMode,
        next_run: Option<String>,
        created_at: String,
    ) -> Result<TaskId> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO scheduled_tasks
                   (group_folder, chat_jid, prompt, schedule_type, schedule_value, context_mode, next_run, last_run, last_result, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, NULL, 'active', ?8)",
                params![
                    folder.0,
                    chat_jid.0,
                    prompt,
                    schedule_type.as_str(),
                    schedule_value,
                    context_mode.as_str(),
                    next_run,
                    created_at,
                ],
            )?;
            Ok(TaskId(conn.last_insert_rowid()))
        })
        .await
    }

    pub async fn get_due_tasks(&self, now: String) -> Result<Vec<ScheduledTask>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, group_folder, chat_jid, prompt, schedule_type, schedule_value, context_mode,
                        next_run, last_run, last_result, status, created_at
                 FROM scheduled_tasks
                 WHERE status = 'active' AND next_run IS NOT NULL AND next_run <= ?1
                 ORDER BY next_run ASC",
            )?;
            let out = stmt
                .query_map(params![now], rows::task_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(out)
        })
        .await
    }

    /// At-most-once claim: sets `next_run = NULL` only if the row is still
    /// `active` with a non-null `next_run`. Returns whether this caller won.
    pub async fn claim_task(&self, id: TaskId) -> Result<bool> {
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE scheduled_tasks SET next_run = NULL
                 WHERE id = ?1 AND status = 'active' AND next_run IS NOT NULL",
                params![id.0],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    /// Restore `next_run` after a claimed task could not actually execute (e.g. its
    /// group folder no longer exists), so the next poll may retry it.
    pub async fn restore_next_run(&self, id: TaskId, next_run: String) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE scheduled_tasks SET next_run = ?2 WHERE id = ?1",
                params![id.0, next_run],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn update_task_after_run(
        &self,
        id: TaskId,
        last_run: String,
        next_run: Option<String>,
        last_result: String,
        status: TaskStatus,
    ) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE scheduled_tasks SET last_run = ?2, next_run = ?3, last_result = ?4, status = ?5
                 WHERE id = ?1",
                params![id.0, last_run, next_run, last_result, status.as_str()],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn set_task_status(&self, id: TaskId, status: TaskStatus) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE scheduled_tasks SET status = ?2 WHERE id = ?1",
                params![id.0, status.as_str()],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn delete_task(&self, id: TaskId) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM scheduled_tasks WHERE id = ?1", params![id.0])?;
            Ok(())
        })
        .await
    }

    pub async fn get_task(&self, id: TaskId) -> Result<Option<ScheduledTask>> {
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT id, group_folder, chat_jid, prompt, schedule_type, schedule_value, context_mode,
                        next_run, last_run, last_result, status, created_at
                 FROM scheduled_tasks WHERE id = ?1",
                params![id.0],
                rows::task_from_row,
            )
            .optional()
            .map_err(Into::into)
        })
        .await
    }

    pub async fn list_tasks_for_folder(&self, folder: GroupFolder) -> Result<Vec<ScheduledTask>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, group_folder, chat_jid, prompt, schedule_type, schedule_value, context_mode,
                        next_run, last_run, last_result, status, created_at
                 FROM scheduled_tasks WHERE group_folder = ?1 ORDER BY id ASC",
            )?;
            let out = stmt
                .query_map(params![folder.0], rows::task_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(out)
        })
        .await
    }

    // ---------------- Task run log ----------------

    pub async fn append_task_run_log(&self, log: TaskRunLog) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO task_run_log (task_id, started_at, duration_ms, status, summary)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    log.task_id.0,
                    log.started_at,
                    log.duration_ms,
                    log.status,
                    log.summary
                ],
            )?;
            Ok(())
        })
        .await
    }

    // ---------------- Router state ----------------

    pub async fn get_router_state(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT value FROM router_state WHERE key = ?1",
                params![key],
                |r| r.get(0),
            )
            .optional()
            .map_err(Into::into)
        })
        .await
    }

    pub async fn set_router_state(&self, key: &str, value: String) -> Result<()> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO router_state (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use g2_core::domain::Jid;

    fn msg(id: &str, jid: &str, ts: &str, content: &str, is_bot: bool) -> Message {
        Message {
            id: id.to_string(),
            chat_jid: jid.to_string(),
            sender: "alice".to_string(),
            sender_name: Some("Alice".to_string()),
            content: content.to_string(),
            timestamp: ts.to_string(),
            is_from_me: false,
            is_bot_message: is_bot,
        }
    }

    #[tokio::test]
    async fn store_message_is_idempotent_on_redelivery() {
        let store = StateStore::open_in_memory().unwrap();
        let jid = Jid("a@x".to_string());
        store
            .store_message(msg("m1", &jid.0, "2024-01-01T00:00:00Z", "hi", false))
            .await
            .unwrap();
        store
            .store_message(msg("m1", &jid.0, "2024-01-01T00:00:00Z", "hi", false))
            .await
            .unwrap();

        let got = store
            .get_messages_since(jid, "2023-01-01T00:00:00Z".to_string(), "G2".to_string())
            .await
            .unwrap();
        assert_eq!(got.len(), 1);
    }

    #[tokio::test]
    async fn get_messages_since_excludes_bot_messages_and_prefix() {
        let store = StateStore::open_in_memory().unwrap();
        let jid = Jid("a@x".to_string());
        store
            .store_message(msg("m1", &jid.0, "2024-01-01T00:00:01Z", "hello", false))
            .await
            .unwrap();
        store
            .store_message(msg("m2", &jid.0, "2024-01-01T00:00:02Z", "reply", true))
            .await
            .unwrap();
        store
            .store_message(msg(
                "m3",
                &jid.0,
                "2024-01-01T00:00:03Z",
                "G2: reply text",
                false,
            ))
            .await
            .unwrap();

        let got = store
            .get_messages_since(jid, "2023-01-01T00:00:00Z".to_string(), "G2".to_string())
            .await
            .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].id, "m1");
    }

    #[tokio::test]
    async fn claim_task_is_won_by_exactly_one_caller() {
        let store = StateStore::open_in_memory().unwrap();
        let folder = GroupFolder("main".to_string());
        let jid = Jid("a@x".to_string());
        let id = store
            .create_task(
                folder,
                jid,
                "do thing".to_string(),
                ScheduleType::Once,
                "".to_string(),
                ContextMode::Isolated,
                Some("2024-01-01T00:00:00Z".to_string()),
                "2024-01-01T00:00:00Z".to_string(),
            )
            .await
            .unwrap();

        let first = store.claim_task(id).await.unwrap();
        let second = store.claim_task(id).await.unwrap();
        assert!(first);
        assert!(!second);
    }

    #[tokio::test]
    async fn chat_metadata_upsert_never_regresses_timestamp() {
        let store = StateStore::open_in_memory().unwrap();
        let jid = Jid("a@x".to_string());
        store
            .store_chat_metadata(
                jid.clone(),
                "2024-01-02T00:00:00Z".to_string(),
                Some("Name".to_string()),
                Some("whatsapp".to_string()),
                Some(true),
            )
            .await
            .unwrap();
        store
            .store_chat_metadata(jid.clone(), "2024-01-01T00:00:00Z".to_string(), None, None, None)
            .await
            .unwrap();

        let chat = store.get_chat(jid).await.unwrap().unwrap();
        assert_eq!(chat.last_message_time, "2024-01-02T00:00:00Z");
        assert_eq!(chat.name.as_deref(), Some("Name"));
    }

    #[tokio::test]
    async fn resume_archived_session_swaps_active_and_deletes_archive_row() {
        let store = StateStore::open_in_memory().unwrap();
        let folder = GroupFolder("main".to_string());
        store
            .set_session(folder.clone(), "current-session".to_string())
            .await
            .unwrap();
        let archive_id = store
            .archive_session(
                folder.clone(),
                "archived-session".to_string(),
                Some("name".to_string()),
                Some("content".to_string()),
                "2024-01-01T00:00:00Z".to_string(),
            )
            .await
            .unwrap();

        let activated = store
            .resume_archived_session(folder.clone(), archive_id, "2024-01-02T00:00:00Z".to_string())
            .await
            .unwrap();
        assert_eq!(activated.as_deref(), Some("archived-session"));

        let session = store.get_session(folder.clone()).await.unwrap().unwrap();
        assert_eq!(session.session_id, "archived-session");

        let remaining = store
            .search_archived_sessions(folder, "current".to_string())
            .await
            .unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].session_id, "current-session");
    }

    #[tokio::test]
    async fn unregistered_chats_excludes_registered_and_sync_sentinel() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .store_chat_metadata(
                Jid("registered@x".to_string()),
                "2024-01-01T00:00:00Z".to_string(),
                Some("Registered".to_string()),
                Some("loopback".to_string()),
                Some(true),
            )
            .await
            .unwrap();
        store
            .store_chat_metadata(
                Jid("discoverable@x".to_string()),
                "2024-01-02T00:00:00Z".to_string(),
                Some("Discoverable".to_string()),
                Some("loopback".to_string()),
                Some(true),
            )
            .await
            .unwrap();
        store
            .store_chat_metadata(
                Jid("__group_sync__".to_string()),
                "2024-01-03T00:00:00Z".to_string(),
                None,
                None,
                None,
            )
            .await
            .unwrap();
        store
            .register_group(RegisteredGroup {
                jid: "registered@x".to_string(),
                name: "Registered".to_string(),
                folder: "registered".to_string(),
                trigger: "".to_string(),
                requires_trigger: false,
                added_at: "2024-01-01T00:00:00Z".to_string(),
                channel: "loopback".to_string(),
                container_config: None,
            })
            .await
            .unwrap();

        let candidates = store.get_unregistered_chats("__group_sync__").await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].jid, "discoverable@x");
    }
}
