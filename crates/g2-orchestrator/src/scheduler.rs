//! Due-task discovery, at-most-once atomic claim, scheduling arithmetic, run
//! logging (§4.9).

use std::sync::Arc;

use chrono::Utc;
use g2_channels::ChannelRegistry;
use g2_core::{
    config::Config,
    domain::{GroupFolder, Jid, TaskStatus},
    formatting::format_outbound,
    util::iso_timestamp_utc,
    Result,
};
use g2_store::{ScheduledTask, StateStore};
use tokio_util::sync::CancellationToken;

use crate::agent_executor::AgentExecutor;
use crate::cron;
use crate::group_queue::GroupQueue;
use crate::idle::IdleTimer;

#[derive(Clone)]
pub struct TaskScheduler {
    store: StateStore,
    queue: Arc<GroupQueue>,
    executor: AgentExecutor,
    channels: Arc<ChannelRegistry>,
    config: Config,
}

impl TaskScheduler {
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
            let mut tick = tokio::time::interval(self.config.scheduler_poll_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        if let Err(e) = self.poll_once().await {
                            tracing_log(&format!("scheduler poll failed: {e}"));
                        }
                    }
                }
            }
        })
    }

    /// Runs a single poll tick without entering the recurring loop, for the
    /// orchestrator's one-shot debug mode.
    pub async fn run_once(&self) -> Result<()> {
        self.poll_once().await
    }

    async fn poll_once(&self) -> Result<()> {
        let now = iso_timestamp_utc();
        let due = self.store.get_due_tasks(now).await?;

        for task in due {
            let id = task.id;
            if self.store.claim_task(id).await? {
                let scheduler = self.clone();
                let chat_jid = Jid(task.chat_jid.clone());
                self.queue
                    .clone()
                    .enqueue(
                        chat_jid,
                        Box::new(move |queue, jid| {
                            Box::pin(async move { scheduler.run_task(queue, jid, task).await })
                        }),
                    )
                    .await;
            }
        }

        Ok(())
    }

    async fn run_task(&self, queue: Arc<GroupQueue>, chat_jid: Jid, task: ScheduledTask) {
        let folder = GroupFolder(task.group_folder.clone());
        let started_at = iso_timestamp_utc();
        let start_instant = std::time::Instant::now();

        let Ok(Some(group)) = self.store.get_group_by_folder(folder.clone()).await else {
            tracing_log(&format!(
                "scheduled task {} references unknown group {}",
                task.id, folder.0
            ));
            let _ = self
                .store
                .append_task_run_log(g2_store::TaskRunLog {
                    task_id: task.id,
                    started_at: started_at.clone(),
                    duration_ms: 0,
                    status: "error".to_string(),
                    summary: Some(format!("group folder {} not found", folder.0)),
                })
                .await;
            let _ = self.store.restore_next_run(task.id, task.next_run.clone().unwrap_or(started_at)).await;
            return;
        };

        let session_id = if task.context_mode == "group" {
            self.store
                .get_session(folder.clone())
                .await
                .ok()
                .flatten()
                .map(|s| s.session_id)
        } else {
            None
        };

        let (frame_tx, mut frame_rx) = tokio::sync::mpsc::unbounded_channel();
        let had_error = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let last_summary = Arc::new(std::sync::Mutex::new(None::<String>));

        let spawn_result = self
            .executor
            .spawn(&group, task.prompt.clone(), &chat_jid, true, session_id, Some(frame_tx))
            .await;

        let Ok(spawn_result) = spawn_result else {
            tracing_log(&format!("failed to spawn scheduled task {}: {:?}", task.id, spawn_result.err()));
            self.finish_task_run(&task, &started_at, start_instant, "error", Some("failed to spawn container".into())).await;
            return;
        };

        queue.register_process(&chat_jid, spawn_result.handle.clone()).await;

        let idle_queue = queue.clone();
        let idle_jid = chat_jid.clone();
        let idle_timer = IdleTimer::spawn(self.config.idle_timeout, move || {
            let queue = idle_queue.clone();
            let jid = idle_jid.clone();
            async move {
                queue.close_stdin(&jid).await;
            }
        });

        let channels = self.channels.clone();
        let jid_for_relay = chat_jid.clone();
        let had_error_relay = had_error.clone();
        let summary_relay = last_summary.clone();
        let relay = tokio::spawn(async move {
            while let Some(frame) = frame_rx.recv().await {
                let status_is_error = frame.get("status").and_then(|v| v.as_str()) == Some("error");
                let result_text = frame.get("result").and_then(|v| v.as_str()).map(str::to_string);

                if status_is_error {
                    had_error_relay.store(true, std::sync::atomic::Ordering::SeqCst);
                }

                if let Some(raw) = &result_text {
                    let text = format_outbound(raw);
                    if !text.is_empty() {
                        channels.send_message(&jid_for_relay, &text).await;
                        *summary_relay.lock().unwrap() = Some(text);
                    }
                }
            }
        });

        let outcome = spawn_result.join.await;
        let _ = relay.await;
        idle_timer.clear();
        queue.unregister_process(&chat_jid).await;

        let (status, summary) = match outcome {
            Ok(Ok(out)) => {
                if had_error.load(std::sync::atomic::Ordering::SeqCst) || out.error.is_some() {
                    ("error", out.error.clone().or_else(|| last_summary.lock().unwrap().clone()))
                } else {
                    ("success", out.result.clone().or_else(|| last_summary.lock().unwrap().clone()))
                }
            }
            Ok(Err(e)) => ("error", Some(e.to_string())),
            Err(e) => ("error", Some(format!("task panicked: {e}"))),
        };

        self.finish_task_run(&task, &started_at, start_instant, status, summary).await;
    }

    async fn finish_task_run(
        &self,
        task: &ScheduledTask,
        started_at: &str,
        start_instant: std::time::Instant,
        status: &str,
        summary: Option<String>,
    ) {
        let duration_ms = start_instant.elapsed().as_millis() as i64;
        let _ = self
            .store
            .append_task_run_log(g2_store::TaskRunLog {
                task_id: task.id,
                started_at: started_at.to_string(),
                duration_ms,
                status: status.to_string(),
                summary: summary.clone(),
            })
            .await;

        let now = Utc::now();
        let (next_run, final_status) = match task.schedule_type.as_str() {
            "cron" => {
                let next = cron::next_occurrence(&task.schedule_value, &self.config.timezone, now)
                    .ok()
                    .flatten();
                (next, TaskStatus::Active)
            }
            "interval" => {
                let ms: i64 = task.schedule_value.parse().unwrap_or(0);
                let next = (now + chrono::Duration::milliseconds(ms)).to_rfc3339();
                (Some(next), TaskStatus::Active)
            }
            _ => (None, TaskStatus::Completed),
        };

        let _ = self
            .store
            .update_task_after_run(
                task.id,
                now.to_rfc3339(),
                next_run,
                summary.unwrap_or_default(),
                final_status,
            )
            .await;
    }
}

fn tracing_log(msg: &str) {
    #[cfg(feature = "tracing")]
    tracing::warn!("{msg}");
    #[cfg(not(feature = "tracing"))]
    let _ = msg;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_schedule_computes_next_run_in_the_future() {
        let now = Utc::now();
        let next = (now + chrono::Duration::milliseconds(60_000)).to_rfc3339();
        assert!(next > now.to_rfc3339());
    }
}
