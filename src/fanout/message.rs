//! Actor messages and event payloads for conversation channels

use crate::messaging::MessageView;
use crate::presence::PresenceView;
use actix::prelude::*;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Subscribe a connection to a channel
pub struct Subscribe {
    /// Channel name, `conversation-{id}`
    pub channel: String,
    /// Channel to push payloads back to this connection
    pub addr: Recipient<EventPush>,
}

impl Message for Subscribe {
    /// Returns subscription ID
    type Result = usize;
}

/// Drop a subscription
pub struct Unsubscribe {
    pub id: usize,
}

impl Message for Unsubscribe {
    type Result = ();
}

/// Deliver a serialized payload to every subscriber of a channel
pub struct Publish {
    pub channel: String,
    pub payload: String,
}

impl Message for Publish {
    type Result = ();
}

/// Hub -> connection push
pub struct EventPush(pub String);

impl Message for EventPush {
    type Result = ();
}

/// Number of subscribers on a channel
pub struct GetSubscriberCount {
    pub channel: String,
}

impl Message for GetSubscriberCount {
    type Result = usize;
}

/// Delivery receipt data
#[derive(Clone, Debug, Serialize)]
pub struct Receipt {
    pub message_id: i32,
    pub at: Option<NaiveDateTime>,
}

/// Events published on a conversation channel.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ConversationEvent {
    NewMessage(MessageView),
    UserOnline(PresenceView),
    Typing {
        user_id: i32,
        conversation_id: i32,
        is_typing: bool,
    },
    MessageRead(Receipt),
    MessageDelivered(Receipt),
    /// Sent after the user's participant row is closed. Live connections
    /// of that user end their subscription on it.
    ParticipantLeft {
        user_id: i32,
        conversation_id: i32,
    },
}

impl ConversationEvent {
    /// Wire name of the event
    pub fn name(&self) -> &'static str {
        match self {
            ConversationEvent::NewMessage(_) => "new-message",
            ConversationEvent::UserOnline(_) => "user-online",
            ConversationEvent::Typing { .. } => "typing",
            ConversationEvent::MessageRead(_) => "message-read",
            ConversationEvent::MessageDelivered(_) => "message-delivered",
            ConversationEvent::ParticipantLeft { .. } => "participant-left",
        }
    }

    /// Serialize as `{"event": .., "channel": .., "data": {..}}`.
    pub fn to_payload(&self, channel: &str) -> Result<String, serde_json::Error> {
        let mut value = serde_json::to_value(self)?;
        if let Some(object) = value.as_object_mut() {
            object.insert(
                "channel".to_string(),
                serde_json::Value::String(channel.to_string()),
            );
        }
        serde_json::to_string(&value)
    }
}

/// User id carried by a `participant-left` payload, if that is what it is.
pub fn participant_left(payload: &str) -> Option<i32> {
    #[derive(Deserialize)]
    struct Envelope {
        event: String,
        #[serde(default)]
        data: serde_json::Value,
    }

    #[derive(Deserialize)]
    struct Left {
        user_id: i32,
    }

    let envelope: Envelope = serde_json::from_str(payload).ok()?;
    if envelope.event != "participant-left" {
        return None;
    }
    serde_json::from_value::<Left>(envelope.data)
        .ok()
        .map(|left| left.user_id)
}
