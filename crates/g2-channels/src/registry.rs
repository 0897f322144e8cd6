//! Set of transport adapters; JID routing; connection lifecycle fan-out (§4.2).

use std::sync::Arc;

use g2_core::{channel::ChannelAdapter, domain::Jid};

use crate::{ChannelError, Result};

#[derive(Default)]
pub struct ChannelRegistry {
    adapters: Vec<Arc<dyn ChannelAdapter>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter. Rejects a duplicate `name()`.
    pub fn register(&mut self, adapter: Arc<dyn ChannelAdapter>) -> Result<()> {
        if self.adapters.iter().any(|a| a.name() == adapter.name()) {
            return Err(ChannelError::DuplicateAdapter(adapter.name().to_string()));
        }
        self.adapters.push(adapter);
        Ok(())
    }

    pub fn adapters(&self) -> &[Arc<dyn ChannelAdapter>] {
        &self.adapters
    }

    /// First adapter claiming ownership of `jid`, connected or not.
    pub fn find_by_jid(&self, jid: &Jid) -> Option<Arc<dyn ChannelAdapter>> {
        self.adapters.iter().find(|a| a.owns_jid(jid)).cloned()
    }

    /// Like `find_by_jid`, but additionally requires `is_connected()`.
    pub fn find_connected_by_jid(&self, jid: &Jid) -> Option<Arc<dyn ChannelAdapter>> {
        self.adapters
            .iter()
            .find(|a| a.owns_jid(jid) && a.is_connected())
            .cloned()
    }

    /// Formatted-send path: logs and drops the message if no connected adapter
    /// owns `jid`, rather than surfacing an error to the caller.
    pub async fn send_message(&self, jid: &Jid, text: &str) {
        match self.find_connected_by_jid(jid) {
            Some(adapter) => {
                if let Err(e) = adapter.send_message(jid, text).await {
                    log_warn(&format!("send to {jid} via {} failed: {e}", adapter.name()));
                }
            }
            None => {
                log_warn(&format!("no connected channel owns {jid}; dropping outbound message"));
            }
        }
    }

    /// Raw-send path: raises `NoChannelError` instead of silently dropping.
    pub async fn send_message_or_fail(&self, jid: &Jid, text: &str) -> Result<()> {
        let adapter = self
            .find_connected_by_jid(jid)
            .ok_or_else(|| ChannelError::NoChannel(jid.clone()))?;
        adapter
            .send_message(jid, text)
            .await
            .map_err(|e| ChannelError::Adapter(e.to_string()))
    }

    pub async fn connect_all(&self) -> Result<()> {
        for adapter in &self.adapters {
            adapter
                .connect()
                .await
                .map_err(|e| ChannelError::Adapter(format!("{}: {e}", adapter.name())))?;
        }
        Ok(())
    }

    pub async fn disconnect_all(&self) {
        for adapter in &self.adapters {
            let _ = adapter.disconnect().await;
        }
    }

    pub async fn sync_all(&self, force: bool) {
        for adapter in &self.adapters {
            if adapter.capabilities().supports_metadata_sync {
                let _ = adapter.sync_metadata(force).await;
            }
        }
    }
}

fn log_warn(msg: &str) {
    #[cfg(feature = "tracing")]
    tracing::warn!("{msg}");
    #[cfg(not(feature = "tracing"))]
    let _ = msg;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackChannel;

    #[tokio::test]
    async fn duplicate_adapter_name_is_rejected() {
        let mut registry = ChannelRegistry::new();
        registry
            .register(Arc::new(LoopbackChannel::new("a")))
            .unwrap();
        let err = registry.register(Arc::new(LoopbackChannel::new("a"))).unwrap_err();
        assert!(matches!(err, ChannelError::DuplicateAdapter(_)));
    }

    #[tokio::test]
    async fn find_connected_by_jid_requires_connection() {
        let mut registry = ChannelRegistry::new();
        let adapter = Arc::new(LoopbackChannel::new("a"));
        registry.register(adapter.clone()).unwrap();

        let jid = Jid("1@loop".to_string());
        assert!(registry.find_by_jid(&jid).is_some());
        assert!(registry.find_connected_by_jid(&jid).is_none());

        adapter.connect().await.unwrap();
        assert!(registry.find_connected_by_jid(&jid).is_some());
    }

    #[tokio::test]
    async fn send_message_or_fail_raises_when_nothing_owns_the_jid() {
        let registry = ChannelRegistry::new();
        let jid = Jid("nobody@loop".to_string());
        let err = registry.send_message_or_fail(&jid, "hi").await.unwrap_err();
        assert!(matches!(err, ChannelError::NoChannel(_)));
    }
}
