//! The transport contract every chat adapter (WhatsApp, Telegram-style, Gmail, ...)
//! implements, plus the inbound callback shapes adapters invoke on the host.

use async_trait::async_trait;

use crate::{domain::Jid, Result};

/// Capability flags an adapter advertises, used for routing/formatting decisions.
#[derive(Clone, Copy, Debug, Default)]
pub struct ChannelCapabilities {
    pub supports_typing: bool,
    pub supports_metadata_sync: bool,
}

/// A single inbound chat message, already transport-normalized.
#[derive(Clone, Debug)]
pub struct NewMessage {
    pub id: String,
    pub sender: String,
    pub sender_name: Option<String>,
    pub content: String,
    pub timestamp: String,
    pub is_from_me: bool,
}

/// Hexagonal port for a chat transport.
///
/// Telegram/WhatsApp/Gmail-shaped adapters all implement this; the registry and
/// everything above it only ever sees this trait object.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// A unique, stable name for this adapter (used for registry dedup and logs).
    fn name(&self) -> &str;

    fn capabilities(&self) -> ChannelCapabilities;

    async fn connect(&self) -> Result<()>;
    async fn disconnect(&self) -> Result<()>;
    fn is_connected(&self) -> bool;

    /// Whether this adapter is the one that should handle sends/routing for `jid`.
    fn owns_jid(&self, jid: &Jid) -> bool;

    async fn send_message(&self, jid: &Jid, text: &str) -> Result<()>;

    async fn set_typing(&self, _jid: &Jid, _on: bool) -> Result<()> {
        Ok(())
    }

    /// Force a metadata resync (e.g. re-enumerate groups). No-op unless the adapter
    /// advertises `supports_metadata_sync`.
    async fn sync_metadata(&self, _force: bool) -> Result<()> {
        Ok(())
    }
}

/// Callbacks an adapter invokes for inbound traffic. Adapters must call
/// `on_chat_metadata` for every observed message (including unregistered chats —
/// that is how group discovery works) and `on_message` only for registered chats.
#[async_trait]
pub trait InboundSink: Send + Sync {
    async fn on_message(&self, jid: Jid, message: NewMessage);

    async fn on_chat_metadata(
        &self,
        jid: Jid,
        timestamp: String,
        name: Option<String>,
        channel: Option<String>,
        is_group: Option<bool>,
    );
}
