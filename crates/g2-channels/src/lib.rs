//! Adapter registry and outbound delivery plumbing (§4.2, §4.11).

pub mod loopback;
pub mod outgoing;
pub mod registry;

use g2_core::domain::Jid;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("no connected channel owns {0}")]
    NoChannel(Jid),

    #[error("adapter name already registered: {0}")]
    DuplicateAdapter(String),

    #[error("adapter error: {0}")]
    Adapter(String),
}

pub type Result<T> = std::result::Result<T, ChannelError>;

impl From<ChannelError> for g2_core::Error {
    fn from(e: ChannelError) -> Self {
        g2_core::Error::External(e.to_string())
    }
}

pub use loopback::LoopbackChannel;
pub use outgoing::{OutgoingMessage, OutgoingMessageQueue};
pub use registry::ChannelRegistry;
