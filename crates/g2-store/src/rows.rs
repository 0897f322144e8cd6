//! Row types returned by `StateStore` queries, plus the `rusqlite::Row` mappers.
//!
//! Kept as plain structs (not the `g2-core` newtypes) since callers read these back
//! out of SQL as raw columns; call sites translate into `Jid`/`GroupFolder`/etc. at
//! the boundary where that's useful.

use rusqlite::Row;

use g2_core::domain::TaskId;

#[derive(Clone, Debug, PartialEq)]
pub struct Chat {
    pub jid: String,
    pub name: Option<String>,
    pub last_message_time: String,
    pub channel: Option<String>,
    pub is_group: Option<bool>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub id: String,
    pub chat_jid: String,
    pub sender: String,
    pub sender_name: Option<String>,
    pub content: String,
    pub timestamp: String,
    pub is_from_me: bool,
    pub is_bot_message: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RegisteredGroup {
    pub jid: String,
    pub name: String,
    pub folder: String,
    pub trigger: String,
    pub requires_trigger: bool,
    pub added_at: String,
    pub channel: String,
    /// Raw JSON, shape owned by the caller (`additionalMounts`, container overrides, ...).
    pub container_config: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Session {
    pub group_folder: String,
    pub session_id: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ArchivedSession {
    pub id: i64,
    pub group_folder: String,
    pub session_id: String,
    pub name: Option<String>,
    pub content: Option<String>,
    pub archived_at: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ScheduledTask {
    pub id: TaskId,
    pub group_folder: String,
    pub chat_jid: String,
    pub prompt: String,
    pub schedule_type: String,
    pub schedule_value: String,
    pub context_mode: String,
    pub next_run: Option<String>,
    pub last_run: Option<String>,
    pub last_result: Option<String>,
    pub status: String,
    pub created_at: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TaskRunLog {
    pub task_id: TaskId,
    pub started_at: String,
    pub duration_ms: i64,
    pub status: String,
    pub summary: Option<String>,
}

pub(crate) fn chat_from_row(r: &Row<'_>) -> rusqlite::Result<Chat> {
    Ok(Chat {
        jid: r.get(0)?,
        name: r.get(1)?,
        last_message_time: r.get(2)?,
        channel: r.get(3)?,
        is_group: r.get::<_, Option<i64>>(4)?.map(|v| v != 0),
    })
}

pub(crate) fn message_from_row(r: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: r.get(0)?,
        chat_jid: r.get(1)?,
        sender: r.get(2)?,
        sender_name: r.get(3)?,
        content: r.get(4)?,
        timestamp: r.get(5)?,
        is_from_me: r.get::<_, i64>(6)? != 0,
        is_bot_message: r.get::<_, i64>(7)? != 0,
    })
}

pub(crate) fn group_from_row(r: &Row<'_>) -> rusqlite::Result<RegisteredGroup> {
    Ok(RegisteredGroup {
        jid: r.get(0)?,
        name: r.get(1)?,
        folder: r.get(2)?,
        trigger: r.get(3)?,
        requires_trigger: r.get::<_, i64>(4)? != 0,
        added_at: r.get(5)?,
        channel: r.get(6)?,
        container_config: r.get(7)?,
    })
}

pub(crate) fn archive_from_row(r: &Row<'_>) -> rusqlite::Result<ArchivedSession> {
    Ok(ArchivedSession {
        id: r.get(0)?,
        group_folder: r.get(1)?,
        session_id: r.get(2)?,
        name: r.get(3)?,
        content: r.get(4)?,
        archived_at: r.get(5)?,
    })
}

pub(crate) fn task_from_row(r: &Row<'_>) -> rusqlite::Result<ScheduledTask> {
    Ok(ScheduledTask {
        id: TaskId(r.get(0)?),
        group_folder: r.get(1)?,
        chat_jid: r.get(2)?,
        prompt: r.get(3)?,
        schedule_type: r.get(4)?,
        schedule_value: r.get(5)?,
        context_mode: r.get(6)?,
        next_run: r.get(7)?,
        last_run: r.get(8)?,
        last_result: r.get(9)?,
        status: r.get(10)?,
        created_at: r.get(11)?,
    })
}
