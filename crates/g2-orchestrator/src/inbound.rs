//! Bridges `ChannelAdapter` inbound callbacks into `StateStore` writes (§4.2).
//!
//! Adapters call `on_chat_metadata` for every observed message, registered or
//! not — that is the group-discovery mechanism — and `on_message` only for
//! messages belonging to an already-registered chat.

use async_trait::async_trait;
use g2_core::{
    channel::{InboundSink, NewMessage},
    domain::Jid,
};
use g2_store::{Message, StateStore};

#[derive(Clone)]
pub struct StoreInboundSink {
    store: StateStore,
}

impl StoreInboundSink {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl InboundSink for StoreInboundSink {
    async fn on_message(&self, jid: Jid, message: NewMessage) {
        let msg = Message {
            id: message.id,
            chat_jid: jid.0,
            sender: message.sender,
            sender_name: message.sender_name,
            content: message.content,
            timestamp: message.timestamp,
            is_from_me: message.is_from_me,
            is_bot_message: message.is_from_me,
        };
        if let Err(e) = self.store.store_message(msg).await {
            log(&format!("failed to store inbound message: {e}"));
        }
    }

    async fn on_chat_metadata(
        &self,
        jid: Jid,
        timestamp: String,
        name: Option<String>,
        channel: Option<String>,
        is_group: Option<bool>,
    ) {
        if let Err(e) = self
            .store
            .store_chat_metadata(jid, timestamp, name, channel, is_group)
            .await
        {
            log(&format!("failed to store chat metadata: {e}"));
        }
    }
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

    #[tokio::test]
    async fn on_message_is_queryable_as_a_new_message() {
        let store = StateStore::open_in_memory().unwrap();
        let sink = StoreInboundSink::new(store.clone());
        let jid = Jid("a@g.us".to_string());

        sink.on_chat_metadata(jid.clone(), "2026-01-01T00:00:00Z".to_string(), Some("A".into()), Some("loopback".into()), Some(true))
            .await;
        sink.on_message(
            jid.clone(),
            NewMessage {
                id: "1".to_string(),
                sender: "x".to_string(),
                sender_name: None,
                content: "hello".to_string(),
                timestamp: "2026-01-01T00:00:01Z".to_string(),
                is_from_me: false,
            },
        )
        .await;

        let (msgs, _) = store
            .get_new_messages(vec![jid], "1970-01-01T00:00:00Z".to_string(), "G2".to_string())
            .await
            .unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].content, "hello");
    }
}
