//! Best-effort broadcast of conversation events
//!
//! - `ConversationHub` actor keeps the subscribers of each channel
//! - `BroadcastTransport` is the seam the messaging code publishes through
//! - `Fanout` serializes events and swallows every delivery failure
//!
//! Nothing here is persisted or retried. A subscriber that is not connected
//! when an event is published never sees it.

pub mod message;
pub mod server;

use actix::prelude::{Addr, SendError};
use std::sync::Arc;

pub use message::{ConversationEvent, EventPush, Receipt};
pub use server::ConversationHub;

/// Channel carrying the events of one conversation
pub fn channel_name(conversation_id: i32) -> String {
    format!("conversation-{}", conversation_id)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// Event could not be serialized
    Encode(String),
    /// Transport is saturated
    Full,
    /// Transport is gone
    Closed,
}

impl std::fmt::Display for PublishError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PublishError::Encode(e) => write!(f, "Encode error: {}", e),
            PublishError::Full => write!(f, "Transport mailbox is full"),
            PublishError::Closed => write!(f, "Transport is closed"),
        }
    }
}

impl std::error::Error for PublishError {}

impl<T> From<SendError<T>> for PublishError {
    fn from(e: SendError<T>) -> Self {
        match e {
            SendError::Full(_) => PublishError::Full,
            SendError::Closed(_) => PublishError::Closed,
        }
    }
}

impl From<serde_json::Error> for PublishError {
    fn from(e: serde_json::Error) -> Self {
        PublishError::Encode(e.to_string())
    }
}

/// Pub/sub transport. Must not block the caller.
pub trait BroadcastTransport: Send + Sync {
    fn try_publish(&self, channel: &str, payload: String) -> Result<(), PublishError>;
}

impl BroadcastTransport for Addr<ConversationHub> {
    fn try_publish(&self, channel: &str, payload: String) -> Result<(), PublishError> {
        self.try_send(message::Publish {
            channel: channel.to_string(),
            payload,
        })?;
        Ok(())
    }
}

/// Fire-and-forget publisher
#[derive(Clone)]
pub struct Fanout {
    transport: Arc<dyn BroadcastTransport>,
}

impl Fanout {
    pub fn new(transport: Arc<dyn BroadcastTransport>) -> Self {
        Self { transport }
    }

    /// Publish an event on the conversation's channel.
    ///
    /// Failures are logged and dropped. Callers never learn whether anyone
    /// received the event.
    pub fn publish(&self, conversation_id: i32, event: &ConversationEvent) {
        let channel = channel_name(conversation_id);

        let result = event
            .to_payload(&channel)
            .map_err(PublishError::from)
            .and_then(|payload| self.transport.try_publish(&channel, payload));

        match result {
            Ok(()) => log::debug!("Published {} on {}", event.name(), channel),
            Err(e) => log::warn!("Failed to publish {} on {}: {}", event.name(), channel, e),
        }
    }
}
