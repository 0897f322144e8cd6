//! Polls new inbound messages, applies trigger gating, advances cursors, pipes
//! to an already-running container or enqueues a fresh execution (§4.8).

use std::{collections::HashMap, sync::Arc};

use g2_channels::ChannelRegistry;
use g2_core::{
    config::Config,
    domain::{GroupFolder, Jid},
    formatting::{format_messages, format_outbound, TranscriptMessage},
    Result,
};
use g2_store::{Message, RegisteredGroup, StateStore};
use regex::RegexBuilder;
use tokio_util::sync::CancellationToken;

use crate::agent_executor::AgentExecutor;
use crate::group_queue::GroupQueue;
use crate::idle::IdleTimer;

const LAST_TIMESTAMP_KEY: &str = "last_timestamp";
const LAST_AGENT_TIMESTAMP_KEY: &str = "last_agent_timestamp";
const EPOCH: &str = "1970-01-01T00:00:00Z";

#[derive(Clone)]
pub struct MessagePipeline {
    store: StateStore,
    queue: Arc<GroupQueue>,
    executor: AgentExecutor,
    channels: Arc<ChannelRegistry>,
    config: Config,
}

impl MessagePipeline {
    pub fn new(
        store: StateStore,
        queue: Arc<GroupQueue>,
        executor: AgentExecutor,
        channels: Arc<ChannelRegistry>,
        config: Config,
    ) -> Self {
        Self {
            store,
            queue,
            executor,
            channels,
            config,
        }
    }

    pub fn spawn(self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.recover_on_startup().await {
                log(&format!("pipeline recovery failed: {e}"));
            }

            let mut tick = tokio::time::interval(self.config.poll_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        if let Err(e) = self.poll_once().await {
                            log(&format!("pipeline poll failed: {e}"));
                        }
                    }
                }
            }
        })
    }

    /// Runs a single poll tick without entering the recurring loop, for the
    /// orchestrator's one-shot debug mode.
    pub async fn run_once(&self) -> Result<()> {
        self.recover_on_startup().await?;
        self.poll_once().await
    }

    async fn last_timestamp(&self) -> Result<String> {
        Ok(self
            .store
            .get_router_state(LAST_TIMESTAMP_KEY)
            .await?
            .unwrap_or_else(|| EPOCH.to_string()))
    }

    async fn set_last_timestamp(&self, ts: String) -> Result<()> {
        self.store
            .set_router_state(LAST_TIMESTAMP_KEY, ts)
            .await
    }

    async fn agent_cursors(&self) -> Result<HashMap<String, String>> {
        let raw = self.store.get_router_state(LAST_AGENT_TIMESTAMP_KEY).await?;
        Ok(raw
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default())
    }

    async fn set_agent_cursor(&self, jid: &Jid, ts: &str) -> Result<()> {
        let mut cursors = self.agent_cursors().await?;
        cursors.insert(jid.0.clone(), ts.to_string());
        let serialized = serde_json::to_string(&cursors)?;
        self.store
            .set_router_state(LAST_AGENT_TIMESTAMP_KEY, serialized)
            .await
    }

    async fn agent_cursor_for(&self, jid: &Jid) -> Result<String> {
        Ok(self
            .agent_cursors()
            .await?
            .get(&jid.0)
            .cloned()
            .unwrap_or_else(|| EPOCH.to_string()))
    }

    async fn poll_once(&self) -> Result<()> {
        let groups = self.store.get_registered_groups().await?;
        let jids: Vec<Jid> = groups.iter().map(|g| Jid(g.jid.clone())).collect();

        let last_ts = self.last_timestamp().await?;
        let (messages, new_ts) = self
            .store
            .get_new_messages(jids, last_ts, self.config.assistant_name.clone())
            .await?;
        self.set_last_timestamp(new_ts).await?;

        let mut by_jid: HashMap<String, Vec<Message>> = HashMap::new();
        for m in messages {
            by_jid.entry(m.chat_jid.clone()).or_default().push(m);
        }

        for (jid_str, batch) in by_jid {
            let Some(group) = groups.iter().find(|g| g.jid == jid_str) else {
                continue;
            };
            let jid = Jid(jid_str);
            let is_main = group.folder == self.config.main_group_folder;

            if !is_main && !has_trigger(&batch, group) {
                continue;
            }

            self.dispatch(&jid).await?;
        }

        Ok(())
    }

    async fn dispatch(&self, jid: &Jid) -> Result<()> {
        let cursor = self.agent_cursor_for(jid).await?;
        let pending = self
            .store
            .get_messages_since(jid.clone(), cursor, self.config.assistant_name.clone())
            .await?;
        if pending.is_empty() {
            return Ok(());
        }

        let text = format_messages(&transcript(&pending));
        let last_ts = pending.last().map(|m| m.timestamp.clone()).unwrap();

        if self.queue.send_message(jid, &text).await {
            self.set_agent_cursor(jid, &last_ts).await?;
            return Ok(());
        }

        let executor = self.clone();
        self.queue
            .clone()
            .enqueue(
                jid.clone(),
                Box::new(move |queue, jid| {
                    Box::pin(async move { executor.process_group_messages(queue, jid).await })
                }),
            )
            .await;

        Ok(())
    }

    async fn process_group_messages(&self, queue: Arc<GroupQueue>, jid: Jid) {
        let Ok(previous_cursor) = self.agent_cursor_for(&jid).await else {
            return;
        };
        let Ok(missed) = self
            .store
            .get_messages_since(jid.clone(), previous_cursor.clone(), self.config.assistant_name.clone())
            .await
        else {
            return;
        };
        if missed.is_empty() {
            return;
        }

        let last_ts = missed.last().map(|m| m.timestamp.clone()).unwrap();
        if self.set_agent_cursor(&jid, &last_ts).await.is_err() {
            return;
        }

        let Some(group) = self.lookup_group(&jid).await else {
            return;
        };

        let (frame_tx, mut frame_rx) = tokio::sync::mpsc::unbounded_channel();
        let session_id = self
            .store
            .get_session(GroupFolder(group.folder.clone()))
            .await
            .ok()
            .flatten()
            .map(|s| s.session_id);

        let prompt = format_messages(&transcript(&missed));
        let spawn_result = self
            .executor
            .spawn(&group, prompt, &jid, false, session_id, Some(frame_tx))
            .await;

        let Ok(spawn_result) = spawn_result else {
            self.rollback_or_keep(&jid, &previous_cursor, false).await;
            return;
        };

        queue.register_process(&jid, spawn_result.handle.clone()).await;

        let idle_queue = queue.clone();
        let idle_jid = jid.clone();
        let idle_timer = IdleTimer::spawn(self.config.idle_timeout, move || {
            let queue = idle_queue.clone();
            let jid = idle_jid.clone();
            async move {
                queue.close_stdin(&jid).await;
            }
        });

        let channels = self.channels.clone();
        let relay_jid = jid.clone();
        let had_error = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let output_sent = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let had_error_relay = had_error.clone();
        let output_sent_relay = output_sent.clone();

        let relay = tokio::spawn({
            let idle_reset = idle_timer.reset_handle();
            async move {
                while let Some(frame) = frame_rx.recv().await {
                    let is_error = frame.get("status").and_then(|v| v.as_str()) == Some("error");
                    if is_error {
                        had_error_relay.store(true, std::sync::atomic::Ordering::SeqCst);
                    }
                    if let Some(raw) = frame.get("result").and_then(|v| v.as_str()) {
                        let text = format_outbound(raw);
                        if !text.is_empty() {
                            channels.send_message(&relay_jid, &text).await;
                            output_sent_relay.store(true, std::sync::atomic::Ordering::SeqCst);
                            idle_reset();
                        }
                    }
                }
            }
        });

        let outcome = spawn_result.join.await;
        let _ = relay.await;
        idle_timer.clear();
        queue.unregister_process(&jid).await;

        let failed = !matches!(outcome, Ok(Ok(ref o)) if o.error.is_none())
            || had_error.load(std::sync::atomic::Ordering::SeqCst);

        if failed {
            self.rollback_or_keep(&jid, &previous_cursor, output_sent.load(std::sync::atomic::Ordering::SeqCst))
                .await;
        }
    }

    async fn rollback_or_keep(&self, jid: &Jid, previous_cursor: &str, output_sent: bool) {
        if output_sent {
            return;
        }
        let _ = self.set_agent_cursor(jid, previous_cursor).await;
    }

    async fn lookup_group(&self, jid: &Jid) -> Option<RegisteredGroup> {
        let groups = self.store.get_registered_groups().await.ok()?;
        groups.into_iter().find(|g| g.jid == jid.0)
    }

    async fn recover_on_startup(&self) -> Result<()> {
        let groups = self.store.get_registered_groups().await?;
        for group in &groups {
            let jid = Jid(group.jid.clone());
            let cursor = self.agent_cursor_for(&jid).await?;
            let pending = self
                .store
                .get_messages_since(jid.clone(), cursor, self.config.assistant_name.clone())
                .await?;
            if pending.is_empty() {
                continue;
            }
            let is_main = group.folder == self.config.main_group_folder;
            if !is_main && !has_trigger(&pending, group) {
                continue;
            }
            self.dispatch(&jid).await?;
        }
        Ok(())
    }
}

fn has_trigger(batch: &[Message], group: &RegisteredGroup) -> bool {
    if !group.requires_trigger {
        return true;
    }
    let Ok(re) = RegexBuilder::new(&group.trigger).case_insensitive(true).build() else {
        return false;
    };
    batch.iter().any(|m| re.is_match(m.content.trim()))
}

fn transcript(messages: &[Message]) -> Vec<TranscriptMessage<'_>> {
    messages
        .iter()
        .map(|m| TranscriptMessage {
            sender: m.sender_name.as_deref().unwrap_or(&m.sender),
            timestamp: &m.timestamp,
            content: &m.content,
        })
        .collect()
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
    use g2_store::RegisteredGroup;

    fn group(trigger: &str, requires: bool) -> RegisteredGroup {
        RegisteredGroup {
            jid: "a@g.us".to_string(),
            name: "A".to_string(),
            folder: "a".to_string(),
            trigger: trigger.to_string(),
            requires_trigger: requires,
            added_at: "2026-01-01T00:00:00Z".to_string(),
            channel: "loopback".to_string(),
            container_config: None,
        }
    }

    fn msg(content: &str) -> Message {
        Message {
            id: "1".to_string(),
            chat_jid: "a@g.us".to_string(),
            sender: "x".to_string(),
            sender_name: None,
            content: content.to_string(),
            timestamp: "2026-01-01T00:00:00Z".to_string(),
            is_from_me: false,
            is_bot_message: false,
        }
    }

    #[test]
    fn trigger_match_is_case_insensitive() {
        let g = group("hey bot", true);
        assert!(has_trigger(&[msg("HEY BOT please help")], &g));
        assert!(!has_trigger(&[msg("nothing relevant")], &g));
    }

    #[test]
    fn trigger_not_required_always_matches() {
        let g = group("hey bot", false);
        assert!(has_trigger(&[msg("anything")], &g));
    }
}
