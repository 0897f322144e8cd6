//! Adapts a registered group + prompt into a `ContainerRunner` invocation (§4.7).
//!
//! Writes the pre-run IPC snapshots a spawning agent expects to find already in
//! place, then spawns the container. Frames carrying a `newSessionId` update the
//! session store as they arrive, not only once the run finishes.

use std::{sync::Arc, time::Duration};

use g2_container::{
    types::{AdditionalMount, ContainerInput, ContainerOutcome, GroupMountSpec, TimeoutConfig},
    ContainerHandle, ContainerRunner, MountBuilder,
};
use g2_core::{
    config::Config,
    domain::{GroupFolder, Jid},
    Result,
};
use g2_store::{RegisteredGroup, StateStore};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;

#[derive(Deserialize, Default)]
struct ContainerConfigOverrides {
    #[serde(rename = "containerTimeoutMs")]
    container_timeout_ms: Option<u64>,
    #[serde(rename = "idleTimeoutMs")]
    idle_timeout_ms: Option<u64>,
    #[serde(rename = "additionalMounts", default)]
    additional_mounts: Vec<AdditionalMount>,
}

pub struct SpawnResult {
    pub handle: Arc<ContainerHandle>,
    pub join: tokio::task::JoinHandle<Result<ContainerOutcome>>,
}

#[derive(Clone)]
pub struct AgentExecutor {
    config: Config,
    store: StateStore,
    mount_builder: Arc<MountBuilder>,
    runner: ContainerRunner,
}

impl AgentExecutor {
    pub fn new(
        config: Config,
        store: StateStore,
        mount_builder: Arc<MountBuilder>,
        runner: ContainerRunner,
    ) -> Self {
        Self {
            config,
            store,
            mount_builder,
            runner,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn spawn(
        &self,
        group: &RegisteredGroup,
        prompt: String,
        chat_jid: &Jid,
        is_scheduled_task: bool,
        session_id: Option<String>,
        on_frame: Option<mpsc::UnboundedSender<Value>>,
    ) -> Result<SpawnResult> {
        let folder = GroupFolder(group.folder.clone());
        let is_main = folder.0 == self.config.main_group_folder;

        let overrides: ContainerConfigOverrides = group
            .container_config
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or_default();

        self.write_snapshots(&folder, is_main).await?;

        let mount_spec = GroupMountSpec {
            folder: folder.clone(),
            is_main,
            additional_mounts: overrides.additional_mounts,
        };
        self.mount_builder.prepare(&mount_spec)?;
        let mounts = self.mount_builder.build_mounts(&mount_spec)?;

        let mut input = ContainerInput::new(prompt, &folder, chat_jid, is_main);
        input.session_id = session_id;
        input.is_scheduled_task = is_scheduled_task;

        let timeouts = TimeoutConfig {
            container_timeout: overrides
                .container_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(self.config.container_timeout),
            idle_timeout: overrides
                .idle_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(self.config.idle_timeout),
        };

        let (inner_tx, mut inner_rx) = mpsc::unbounded_channel::<Value>();
        let running = self.runner.spawn(&mounts, input, timeouts, Some(inner_tx)).await?;

        let store = self.store.clone();
        let relay_folder = folder.clone();
        tokio::spawn(async move {
            while let Some(frame) = inner_rx.recv().await {
                if let Some(sid) = frame.get("newSessionId").and_then(|v| v.as_str()) {
                    let _ = store.set_session(relay_folder.clone(), sid.to_string()).await;
                }
                if let Some(tx) = &on_frame {
                    let _ = tx.send(frame);
                }
            }
        });

        let join = tokio::spawn(async move {
            let outcome = running.join.await.map_err(to_join_error)??;
            Ok(outcome)
        });

        Ok(SpawnResult {
            handle: running.handle,
            join,
        })
    }

    async fn write_snapshots(&self, folder: &GroupFolder, is_main: bool) -> Result<()> {
        let ipc_dir = self.config.group_ipc_dir(&folder.0);
        std::fs::create_dir_all(&ipc_dir)?;

        let tasks = self.store.list_tasks_for_folder(folder.clone()).await?;
        let tasks_json: Vec<Value> = tasks
            .iter()
            .filter(|t| t.status == "active")
            .map(|t| {
                serde_json::json!({
                    "id": t.id.0,
                    "prompt": t.prompt,
                    "scheduleType": t.schedule_type,
                    "scheduleValue": t.schedule_value,
                    "nextRun": t.next_run,
                })
            })
            .collect();
        write_atomic(&ipc_dir.join("current_tasks.json"), &serde_json::to_vec_pretty(&tasks_json)?)?;

        let groups_json: Vec<Value> = if is_main {
            let chats = self
                .store
                .get_unregistered_chats(g2_core::domain::GROUP_SYNC_JID)
                .await?;
            chats
                .iter()
                .map(|c| {
                    serde_json::json!({
                        "jid": c.jid,
                        "name": c.name,
                        "channel": c.channel,
                        "isGroup": c.is_group,
                        "lastMessageTime": c.last_message_time,
                    })
                })
                .collect()
        } else {
            Vec::new()
        };
        write_atomic(
            &ipc_dir.join("available_groups.json"),
            &serde_json::to_vec_pretty(&groups_json)?,
        )?;

        let archives = self
            .store
            .search_archived_sessions(folder.clone(), String::new())
            .await?;
        let archives_json: Vec<Value> = archives
            .iter()
            .map(|a| serde_json::json!({"id": a.id, "name": a.name, "archivedAt": a.archived_at}))
            .collect();
        write_atomic(
            &ipc_dir.join("session_history.json"),
            &serde_json::to_vec_pretty(&archives_json)?,
        )?;

        Ok(())
    }
}

fn to_join_error(e: tokio::task::JoinError) -> g2_core::Error {
    g2_core::Error::External(format!("agent execution task panicked: {e}"))
}

/// Writes `contents` to `path` via a temp file in the same directory followed by
/// a rename, so observers never see a partial file.
fn write_atomic(path: &std::path::Path, contents: &[u8]) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_atomic_leaves_no_tmp_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.json");
        write_atomic(&path, b"{}").unwrap();
        assert!(path.exists());
        assert!(!dir.path().join("out.json.tmp").exists());
    }
}
