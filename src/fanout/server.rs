//! ConversationHub actor for conversation channel subscribers
//!
//! Keeps one subscriber set per channel and pushes published payloads to
//! every live subscriber without waiting on them.

use super::message::{EventPush, GetSubscriberCount, Publish, Subscribe, Unsubscribe};
use actix::prelude::*;
use std::collections::{HashMap, HashSet};

struct Subscriber {
    channel: String,
    recipient: Recipient<EventPush>,
}

/// Pub/sub hub for `conversation-{id}` channels
pub struct ConversationHub {
    next_id: usize,
    /// Subscription ID -> Subscriber
    subscribers: HashMap<usize, Subscriber>,
    /// Channel -> Subscription IDs
    channels: HashMap<String, HashSet<usize>>,
    mailbox_capacity: usize,
}

impl ConversationHub {
    pub fn new(mailbox_capacity: usize) -> Self {
        log::info!("ConversationHub starting up.");
        Self {
            next_id: 1,
            subscribers: HashMap::new(),
            channels: HashMap::new(),
            mailbox_capacity,
        }
    }

    fn remove(&mut self, id: usize) {
        if let Some(sub) = self.subscribers.remove(&id) {
            if let Some(ids) = self.channels.get_mut(&sub.channel) {
                ids.remove(&id);
                if ids.is_empty() {
                    self.channels.remove(&sub.channel);
                }
            }
        }
    }
}

impl Default for ConversationHub {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Actor for ConversationHub {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        ctx.set_mailbox_capacity(self.mailbox_capacity);
        log::info!("ConversationHub started");
    }
}

impl Handler<Subscribe> for ConversationHub {
    type Result = usize;

    fn handle(&mut self, msg: Subscribe, _: &mut Context<Self>) -> Self::Result {
        let id = self.next_id;
        self.next_id += 1;

        self.channels
            .entry(msg.channel.clone())
            .or_default()
            .insert(id);

        log::debug!(
            "Subscription {} joined {} (total subscriptions: {})",
            id,
            msg.channel,
            self.subscribers.len() + 1
        );

        self.subscribers.insert(
            id,
            Subscriber {
                channel: msg.channel,
                recipient: msg.addr,
            },
        );

        id
    }
}

impl Handler<Unsubscribe> for ConversationHub {
    type Result = ();

    fn handle(&mut self, msg: Unsubscribe, _: &mut Context<Self>) {
        self.remove(msg.id);
    }
}

impl Handler<Publish> for ConversationHub {
    type Result = ();

    fn handle(&mut self, msg: Publish, _: &mut Context<Self>) {
        let ids = match self.channels.get(&msg.channel) {
            Some(ids) => ids.clone(),
            None => return,
        };

        let mut dead = Vec::new();
        for id in ids {
            if let Some(sub) = self.subscribers.get(&id) {
                match sub.recipient.try_send(EventPush(msg.payload.clone())) {
                    Ok(()) => {}
                    Err(SendError::Full(_)) => {
                        log::warn!("Subscriber {} on {} is lagging, event dropped", id, msg.channel);
                    }
                    Err(SendError::Closed(_)) => dead.push(id),
                }
            }
        }

        for id in dead {
            self.remove(id);
        }
    }
}

impl Handler<GetSubscriberCount> for ConversationHub {
    type Result = usize;

    fn handle(&mut self, msg: GetSubscriberCount, _: &mut Context<Self>) -> Self::Result {
        self.channels
            .get(&msg.channel)
            .map(|ids| ids.len())
            .unwrap_or(0)
    }
}

impl Supervised for ConversationHub {
    fn restarting(&mut self, _: &mut Context<ConversationHub>) {
        log::warn!("Restarting the ConversationHub.");
    }
}
