//! An in-process fake adapter used by tests and by the orchestrator's own
//! dry-run mode. Owns every JID under its configured host suffix and records
//! every send instead of talking to a real transport.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use g2_core::{
    channel::{ChannelAdapter, ChannelCapabilities, InboundSink, NewMessage},
    domain::Jid,
    Result,
};

pub struct LoopbackChannel {
    name: String,
    connected: std::sync::atomic::AtomicBool,
    sent: Mutex<Vec<(Jid, String)>>,
    sink: Option<Arc<dyn InboundSink>>,
}

impl LoopbackChannel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            connected: std::sync::atomic::AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
            sink: None,
        }
    }

    /// Same as `new`, but wired to a host-supplied `InboundSink` so injected
    /// messages flow into the real store, the way a production transport's
    /// `onMessage`/`onChatMetadata` calls would (§4.2).
    pub fn with_sink(name: impl Into<String>, sink: Arc<dyn InboundSink>) -> Self {
        Self {
            name: name.into(),
            connected: std::sync::atomic::AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
            sink: Some(sink),
        }
    }

    pub fn sent_messages(&self) -> Vec<(Jid, String)> {
        self.sent.lock().unwrap().clone()
    }

    /// Simulates an inbound message from this chat: calls `on_chat_metadata`
    /// first (unconditionally, per §4.2 — this is how group discovery works),
    /// then `on_message`. A no-op if no sink was configured.
    pub async fn receive_message(&self, jid: Jid, message: NewMessage, chat_name: Option<String>, is_group: bool) {
        let Some(sink) = &self.sink else { return };
        sink.on_chat_metadata(
            jid.clone(),
            message.timestamp.clone(),
            chat_name,
            Some(self.name.clone()),
            Some(is_group),
        )
        .await;
        sink.on_message(jid, message).await;
    }
}

fn host_suffix(name: &str) -> String {
    format!("@{name}")
}

#[async_trait]
impl ChannelAdapter for LoopbackChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> ChannelCapabilities {
        ChannelCapabilities {
            supports_typing: false,
            supports_metadata_sync: false,
        }
    }

    async fn connect(&self) -> Result<()> {
        self.connected.store(true, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn owns_jid(&self, jid: &Jid) -> bool {
        jid.0.ends_with(&host_suffix(&self.name))
    }

    async fn send_message(&self, jid: &Jid, text: &str) -> Result<()> {
        self.sent.lock().unwrap().push((jid.clone(), text.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_sent_messages() {
        let chan = LoopbackChannel::new("loop");
        chan.connect().await.unwrap();
        let jid = Jid("1@loop".to_string());
        chan.send_message(&jid, "hello").await.unwrap();
        assert_eq!(chan.sent_messages(), vec![(jid, "hello".to_string())]);
    }

    #[derive(Default)]
    struct RecordingSink {
        metadata_calls: Mutex<Vec<Jid>>,
        message_calls: Mutex<Vec<(Jid, String)>>,
    }

    #[async_trait]
    impl InboundSink for RecordingSink {
        async fn on_message(&self, jid: Jid, message: NewMessage) {
            self.message_calls.lock().unwrap().push((jid, message.content));
        }

        async fn on_chat_metadata(
            &self,
            jid: Jid,
            _timestamp: String,
            _name: Option<String>,
            _channel: Option<String>,
            _is_group: Option<bool>,
        ) {
            self.metadata_calls.lock().unwrap().push(jid);
        }
    }

    #[tokio::test]
    async fn receive_message_calls_chat_metadata_before_message() {
        let sink = Arc::new(RecordingSink::default());
        let chan = LoopbackChannel::with_sink("loop", sink.clone());
        let jid = Jid("1@loop".to_string());

        chan.receive_message(
            jid.clone(),
            NewMessage {
                id: "1".to_string(),
                sender: "x".to_string(),
                sender_name: None,
                content: "hi".to_string(),
                timestamp: "2026-01-01T00:00:00Z".to_string(),
                is_from_me: false,
            },
            Some("Chat".to_string()),
            false,
        )
        .await;

        assert_eq!(*sink.metadata_calls.lock().unwrap(), vec![jid.clone()]);
        assert_eq!(*sink.message_calls.lock().unwrap(), vec![(jid, "hi".to_string())]);
    }

    #[tokio::test]
    async fn receive_message_without_a_sink_is_a_no_op() {
        let chan = LoopbackChannel::new("loop");
        chan.receive_message(
            Jid("1@loop".to_string()),
            NewMessage {
                id: "1".to_string(),
                sender: "x".to_string(),
                sender_name: None,
                content: "hi".to_string(),
                timestamp: "2026-01-01T00:00:00Z".to_string(),
                is_from_me: false,
            },
            None,
            false,
        )
        .await;
    }

    #[tokio::test]
    async fn owns_jid_matches_configured_suffix() {
        let chan = LoopbackChannel::new("loop");
        assert!(chan.owns_jid(&Jid("anything@loop".to_string())));
        assert!(!chan.owns_jid(&Jid("anything@telegram".to_string())));
    }
}
