//! Watches `DATA_DIR/ipc/<folder>/{messages,tasks}` for agent-written command
//! files and dispatches them, plus writes `responses/<requestId>.json` for
//! commands that answer back (§4.10).

use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use g2_channels::ChannelRegistry;
use g2_core::{
    authorization::AuthorizationPolicy,
    config::Config,
    domain::{ArchiveId, ContextMode, GroupFolder, Jid, ScheduleType},
    util::iso_timestamp_utc,
    Error, Result,
};
use g2_store::StateStore;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::group_queue::GroupQueue;

pub struct IpcWatcher {
    config: Config,
    store: StateStore,
    channels: Arc<ChannelRegistry>,
    queue: Arc<GroupQueue>,
    processing: Arc<AtomicBool>,
}

impl IpcWatcher {
    pub fn new(config: Config, store: StateStore, channels: Arc<ChannelRegistry>, queue: Arc<GroupQueue>) -> Self {
        Self {
            config,
            store,
            channels,
            queue,
            processing: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn spawn(self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let ipc_dir = self.config.ipc_dir();
            let _ = std::fs::create_dir_all(&ipc_dir);

            let (fs_tx, mut fs_rx) = mpsc::unbounded_channel::<()>();
            let watcher = spawn_fs_watcher(&ipc_dir, fs_tx);

            let mut poll = tokio::time::interval(self.config.ipc_poll_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = poll.tick() => self.process_once().await,
                    Some(()) = fs_rx.recv() => self.process_once().await,
                }
            }
            drop(watcher);
        })
    }

    /// Runs a single processing pass without entering the recurring loop, for
    /// the orchestrator's one-shot debug mode.
    pub async fn run_once(&self) {
        self.process_once().await;
    }

    async fn process_once(&self) {
        if self
            .processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        if let Err(e) = self.process_ipc_files().await {
            log(&format!("ipc processing failed: {e}"));
        }

        self.processing.store(false, Ordering::SeqCst);
    }

    async fn process_ipc_files(&self) -> Result<()> {
        let ipc_dir = self.config.ipc_dir();
        let Ok(entries) = std::fs::read_dir(&ipc_dir) else {
            return Ok(());
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name == "errors" {
                continue;
            }

            let source_group = name.to_string();
            let is_main = source_group == self.config.main_group_folder;

            self.process_messages(&path, &source_group).await;
            self.process_tasks(&path, &source_group, is_main).await;
        }

        Ok(())
    }

    async fn process_messages(&self, group_dir: &Path, source_group: &str) {
        let dir = group_dir.join("messages");
        for file in list_json_files(&dir) {
            let outcome = self.handle_message_file(&file, source_group).await;
            finish_file(&file, &self.config, source_group, outcome);
        }
    }

    async fn handle_message_file(&self, file: &Path, source_group: &str) -> Result<()> {
        let data: Value = parse_json_file(file)?;
        if data.get("type").and_then(|v| v.as_str()) != Some("message") {
            return Ok(());
        }
        let (Some(chat_jid), Some(text)) = (
            data.get("chatJid").and_then(|v| v.as_str()),
            data.get("text").and_then(|v| v.as_str()),
        ) else {
            return Ok(());
        };

        let jid = Jid(chat_jid.to_string());
        let groups = self.store.get_registered_groups().await?;
        let Some(target) = groups.iter().find(|g| g.jid == jid.0) else {
            return Err(Error::IpcHandler(format!("unknown target jid {chat_jid}")));
        };

        let source_folder = GroupFolder(source_group.to_string());
        let target_folder = GroupFolder(target.folder.clone());
        let is_main = source_group == self.config.main_group_folder;
        if !AuthorizationPolicy::can_send_message(is_main, &source_folder, &target_folder) {
            return Err(Error::Unauthorized(format!(
                "{source_group} may not send to {}",
                target_folder.0
            )));
        }

        self.channels.send_message(&jid, text).await;
        Ok(())
    }

    async fn process_tasks(&self, group_dir: &Path, source_group: &str, is_main: bool) {
        let dir = group_dir.join("tasks");
        for file in list_json_files(&dir) {
            let outcome = self.handle_task_file(&file, source_group, is_main).await;
            finish_file(&file, &self.config, source_group, outcome);
        }
    }

    async fn handle_task_file(&self, file: &Path, source_group: &str, is_main: bool) -> Result<()> {
        let data: Value = parse_json_file(file)?;
        let Some(command) = data.get("type").and_then(|v| v.as_str()) else {
            return Ok(());
        };
        let source_folder = GroupFolder(source_group.to_string());

        let response = match command {
            "register_group" => self.cmd_register_group(is_main, &data).await?,
            "refresh_groups" => self.cmd_refresh_groups(is_main).await?,
            "schedule_task" => self.cmd_schedule_task(is_main, &source_folder, &data).await?,
            "pause_task" => self.cmd_set_task_status(is_main, &source_folder, &data, "paused").await?,
            "resume_task" => self.cmd_set_task_status(is_main, &source_folder, &data, "active").await?,
            "cancel_task" => self.cmd_cancel_task(is_main, &source_folder, &data).await?,
            "clear_session" => self.cmd_clear_session(&source_folder, &data).await?,
            "resume_session" => self.cmd_resume_session(&source_folder, &data).await?,
            "search_sessions" => self.cmd_search_sessions(&source_folder, &data).await?,
            "archive_session" => self.cmd_archive_session(&source_folder, &data).await?,
            other => {
                log(&format!("unknown ipc command {other} from {source_group}"));
                None
            }
        };

        if let (Some(request_id), Some(body)) = (data.get("requestId").and_then(|v| v.as_str()), response) {
            self.write_response(source_group, request_id, &body)?;
        }

        Ok(())
    }

    async fn cmd_register_group(&self, is_main: bool, data: &Value) -> Result<Option<Value>> {
        if !AuthorizationPolicy::can_register_group(is_main) {
            return Err(Error::Unauthorized("register_group requires the main group".into()));
        }
        let (Some(jid), Some(name), Some(folder)) = (
            data.get("jid").and_then(|v| v.as_str()),
            data.get("name").and_then(|v| v.as_str()),
            data.get("folder").and_then(|v| v.as_str()),
        ) else {
            return Err(Error::IpcHandler("register_group missing jid/name/folder".into()));
        };
        let channel = data.get("channel").and_then(|v| v.as_str()).unwrap_or("loopback");
        let requires_trigger = data.get("requiresTrigger").and_then(|v| v.as_bool()).unwrap_or(true);
        let trigger = data.get("trigger").and_then(|v| v.as_str()).unwrap_or("").to_string();

        self.store
            .register_group(g2_store::RegisteredGroup {
                jid: jid.to_string(),
                name: name.to_string(),
                folder: folder.to_string(),
                trigger,
                requires_trigger,
                added_at: iso_timestamp_utc(),
                channel: channel.to_string(),
                container_config: data.get("containerConfig").map(|v| v.to_string()),
            })
            .await?;

        std::fs::create_dir_all(self.config.group_ipc_dir(folder))?;
        Ok(None)
    }

    async fn cmd_refresh_groups(&self, is_main: bool) -> Result<Option<Value>> {
        if !AuthorizationPolicy::can_refresh_groups(is_main) {
            return Err(Error::Unauthorized("refresh_groups requires the main group".into()));
        }
        self.channels.sync_all(true).await;
        Ok(None)
    }

    async fn cmd_schedule_task(&self, is_main: bool, source: &GroupFolder, data: &Value) -> Result<Option<Value>> {
        let target_folder = data
            .get("groupFolder")
            .and_then(|v| v.as_str())
            .map(|s| GroupFolder(s.to_string()))
            .unwrap_or_else(|| source.clone());
        if !AuthorizationPolicy::can_schedule_task(is_main, source, &target_folder) {
            return Err(Error::Unauthorized("schedule_task not permitted for this source".into()));
        }

        let (Some(chat_jid), Some(prompt), Some(schedule_type_raw), Some(schedule_value)) = (
            data.get("chatJid").and_then(|v| v.as_str()),
            data.get("prompt").and_then(|v| v.as_str()),
            data.get("scheduleType").and_then(|v| v.as_str()),
            data.get("scheduleValue").and_then(|v| v.as_str()),
        ) else {
            return Err(Error::IpcHandler("schedule_task missing required fields".into()));
        };
        let schedule_type = ScheduleType::parse(schedule_type_raw)
            .ok_or_else(|| Error::IpcHandler(format!("invalid scheduleType {schedule_type_raw}")))?;
        let context_mode = data
            .get("contextMode")
            .and_then(|v| v.as_str())
            .and_then(ContextMode::parse)
            .unwrap_or(ContextMode::Isolated);

        let next_run = match schedule_type {
            ScheduleType::Cron => crate::cron::next_occurrence(schedule_value, &self.config.timezone, chrono::Utc::now())?,
            ScheduleType::Interval => {
                let ms: i64 = schedule_value.parse().unwrap_or(0);
                Some((chrono::Utc::now() + chrono::Duration::milliseconds(ms)).to_rfc3339())
            }
            ScheduleType::Once => Some(schedule_value.to_string()),
        };

        let id = self
            .store
            .create_task(
                target_folder,
                Jid(chat_jid.to_string()),
                prompt.to_string(),
                schedule_type,
                schedule_value.to_string(),
                context_mode,
                next_run,
                iso_timestamp_utc(),
            )
            .await?;

        Ok(Some(json!({ "taskId": id.0 })))
    }

    async fn cmd_set_task_status(
        &self,
        is_main: bool,
        source: &GroupFolder,
        data: &Value,
        status: &str,
    ) -> Result<Option<Value>> {
        let task = self.lookup_authorized_task(is_main, source, data).await?;
        let status = g2_core::domain::TaskStatus::parse(status)
            .ok_or_else(|| Error::IpcHandler(format!("invalid status {status}")))?;
        self.store.set_task_status(task.id, status).await?;
        Ok(None)
    }

    async fn cmd_cancel_task(&self, is_main: bool, source: &GroupFolder, data: &Value) -> Result<Option<Value>> {
        let task = self.lookup_authorized_task(is_main, source, data).await?;
        self.store.delete_task(task.id).await?;
        Ok(None)
    }

    async fn lookup_authorized_task(
        &self,
        is_main: bool,
        source: &GroupFolder,
        data: &Value,
    ) -> Result<g2_store::ScheduledTask> {
        let task_id = data
            .get("taskId")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| Error::IpcHandler("missing taskId".into()))?;
        let task = self
            .store
            .get_task(g2_core::domain::TaskId(task_id))
            .await?
            .ok_or_else(|| Error::IpcHandler(format!("unknown task {task_id}")))?;
        let task_folder = GroupFolder(task.group_folder.clone());
        if !AuthorizationPolicy::can_manage_task(is_main, source, &task_folder) {
            return Err(Error::Unauthorized("not permitted to manage this task".into()));
        }
        Ok(task)
    }

    async fn cmd_clear_session(&self, source: &GroupFolder, data: &Value) -> Result<Option<Value>> {
        let should_archive = data.get("archive").and_then(|v| v.as_bool()).unwrap_or(false);
        if let Some(previous) = self.store.clear_session(source.clone()).await? {
            if should_archive {
                self.store
                    .archive_session(source.clone(), previous, None, None, iso_timestamp_utc())
                    .await?;
            }
        }
        if let Some(group) = self.store.get_group_by_folder(source.clone()).await? {
            self.queue.close_stdin(&Jid(group.jid)).await;
        }
        Ok(None)
    }

    async fn cmd_resume_session(&self, source: &GroupFolder, data: &Value) -> Result<Option<Value>> {
        let archive_id = data
            .get("archiveId")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| Error::IpcHandler("missing archiveId".into()))?;
        let now = iso_timestamp_utc();
        let resumed = self
            .store
            .resume_archived_session(source.clone(), ArchiveId(archive_id), now)
            .await?;
        if resumed.is_none() {
            return Err(Error::IpcHandler(format!("no archived session {archive_id} for {}", source.0)));
        }
        if let Some(group) = self.store.get_group_by_folder(source.clone()).await? {
            self.queue.close_stdin(&Jid(group.jid)).await;
        }
        Ok(None)
    }

    async fn cmd_search_sessions(&self, source: &GroupFolder, data: &Value) -> Result<Option<Value>> {
        let query = data.get("query").and_then(|v| v.as_str()).unwrap_or("").to_string();
        let results = self.store.search_archived_sessions(source.clone(), query).await?;
        let payload: Vec<Value> = results
            .iter()
            .map(|a| json!({"id": a.id, "name": a.name, "archivedAt": a.archived_at}))
            .collect();
        Ok(Some(json!({ "results": payload })))
    }

    async fn cmd_archive_session(&self, source: &GroupFolder, data: &Value) -> Result<Option<Value>> {
        let Some(session) = self.store.get_session(source.clone()).await? else {
            return Err(Error::IpcHandler(format!("no active session for {}", source.0)));
        };
        let name = data.get("name").and_then(|v| v.as_str()).map(str::to_string);
        let content = data.get("content").and_then(|v| v.as_str()).map(str::to_string);
        let id = self
            .store
            .archive_session(source.clone(), session.session_id, name, content, iso_timestamp_utc())
            .await?;
        Ok(Some(json!({ "archiveId": id.0 })))
    }

    fn write_response(&self, source_group: &str, request_id: &str, body: &Value) -> Result<()> {
        let dir = self.config.group_ipc_dir(source_group).join("responses");
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{request_id}.json"));
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(body)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}

fn list_json_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
        .collect();
    files.sort();
    files
}

fn parse_json_file(path: &Path) -> Result<Value> {
    let contents = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}

fn finish_file(file: &Path, config: &Config, source_group: &str, outcome: Result<()>) {
    match outcome {
        Ok(()) => {
            let _ = std::fs::remove_file(file);
        }
        Err(e) => {
            log(&format!("ipc file {} failed: {e}", file.display()));
            let errors_dir = config.ipc_errors_dir();
            let _ = std::fs::create_dir_all(&errors_dir);
            let name = file.file_name().and_then(|n| n.to_str()).unwrap_or("unknown.json");
            let dest = errors_dir.join(format!("{source_group}-{name}"));
            let _ = std::fs::rename(file, &dest);
        }
    }
}

fn spawn_fs_watcher(ipc_dir: &Path, tx: mpsc::UnboundedSender<()>) -> Option<RecommendedWatcher> {
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        if let Ok(event) = res {
            let touches_json = event
                .paths
                .iter()
                .any(|p| p.extension().and_then(|e| e.to_str()) == Some("json"));
            if touches_json {
                let _ = tx.send(());
            }
        }
    })
    .ok()?;
    watcher.watch(ipc_dir, RecursiveMode::Recursive).ok()?;
    Some(watcher)
}

fn log(msg: &str) {
    #[cfg(feature = "tracing")]
    tracing::warn!("{msg}");
    #[cfg(not(feature = "tracing"))]
    let _ = msg;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_json_files_ignores_non_json_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.json"), "{}").unwrap();
        std::fs::write(dir.path().join("a.json"), "{}").unwrap();
        std::fs::write(dir.path().join("ignore.txt"), "x").unwrap();
        let files = list_json_files(dir.path());
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["a.json", "b.json"]);
    }

    #[test]
    fn finish_file_quarantines_failures_with_source_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let ipc_dir = dir.path().join("ipc");
        std::fs::create_dir_all(&ipc_dir).unwrap();
        let file = dir.path().join("bad.json");
        std::fs::write(&file, "not json").unwrap();

        let mut config = test_config(dir.path());
        config.data_dir = dir.path().to_path_buf();

        finish_file(&file, &config, "alpha", Err(Error::IpcHandler("broken".into())));
        assert!(!file.exists());
        assert!(config.ipc_errors_dir().join("alpha-bad.json").exists());
    }

    fn test_config(base: &Path) -> Config {
        Config {
            assistant_name: "G2".to_string(),
            assistant_has_own_number: false,
            data_dir: base.to_path_buf(),
            main_group_folder: "main".to_string(),
            poll_interval: std::time::Duration::from_secs(3),
            ipc_poll_interval: std::time::Duration::from_secs(2),
            scheduler_poll_interval: std::time::Duration::from_secs(15),
            container_binary: "docker".to_string(),
            container_image: "g2-agent".to_string(),
            container_timeout: std::time::Duration::from_secs(600),
            idle_timeout: std::time::Duration::from_secs(120),
            container_max_output_size: 2 * 1024 * 1024,
            max_concurrent_containers: 4,
            container_name_prefix: "g2-".to_string(),
            timezone: "UTC".to_string(),
            mount_allowlist_path: None,
            project_root: base.to_path_buf(),
            agent_runner_src: base.join("agent-runner"),
            credentials_dir: None,
            secrets_file: None,
        }
    }
}
