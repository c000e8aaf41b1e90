//! Online presence for messaging users.
//!
//! Presence lives in memory only and is rebuilt from heartbeats. A user is
//! online after a heartbeat or an explicit visibility signal and goes offline
//! on an explicit signal, on connection teardown, or after `offline_after`
//! seconds of silence. Silence is checked lazily when presence is read and
//! optionally by [`PresenceTracker::reap_expired`].
//!
//! Only transitions have side effects: the last-seen time is written to the
//! user record and, when the user's privacy setting allows it, a
//! `user-online` event goes out on each of their conversations.

use crate::accounts::AccountDirectory;
use crate::conversations::{now, ConversationStore};
use crate::error::MessagingResult;
use crate::fanout::{ConversationEvent, Fanout};
use chrono::NaiveDateTime;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// Interval clients are expected to heartbeat at
    pub heartbeat_interval_secs: u64,
    /// Silence after which a user counts as offline
    pub offline_after_secs: u64,
    /// Typing flags older than this are ignored
    pub typing_timeout_secs: u64,
    /// Period of the eager expiry sweep. 0 disables it.
    pub reaper_interval_secs: u64,
    /// How long privacy flags are cached
    pub privacy_cache_ttl_secs: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            offline_after_secs: 75,
            typing_timeout_secs: 6,
            reaper_interval_secs: 30,
            privacy_cache_ttl_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PresenceState {
    online: bool,
    last_activity_at: NaiveDateTime,
}

/// Presence as one user sees another
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PresenceView {
    pub user_id: i32,
    pub online: bool,
    pub last_seen_at: Option<NaiveDateTime>,
}

impl PresenceView {
    /// What everyone but the subject sees when online status is private.
    pub fn hidden(user_id: i32) -> Self {
        Self {
            user_id,
            online: false,
            last_seen_at: None,
        }
    }
}

pub struct PresenceTracker {
    states: DashMap<i32, PresenceState>,
    /// Open live connections per user
    connections: DashMap<i32, usize>,
    config: PresenceConfig,
    store: ConversationStore,
    accounts: Arc<dyn AccountDirectory>,
    fanout: Fanout,
}

impl PresenceTracker {
    pub fn new(
        config: PresenceConfig,
        store: ConversationStore,
        accounts: Arc<dyn AccountDirectory>,
        fanout: Fanout,
    ) -> Self {
        Self {
            states: DashMap::new(),
            connections: DashMap::new(),
            config,
            store,
            accounts,
            fanout,
        }
    }

    pub fn config(&self) -> &PresenceConfig {
        &self.config
    }

    fn is_expired(&self, state: &PresenceState, now: NaiveDateTime) -> bool {
        now - state.last_activity_at
            > chrono::Duration::seconds(self.config.offline_after_secs as i64)
    }

    /// Refresh activity, going online if needed.
    pub async fn heartbeat(&self, user_id: i32) {
        let at = now();

        // Entry guard is released at the end of this block
        let went_online = {
            let mut state = self.states.entry(user_id).or_insert(PresenceState {
                online: false,
                last_activity_at: at,
            });
            let was_online = state.online && !self.is_expired(&state, at);
            state.online = true;
            state.last_activity_at = at;
            !was_online
        };

        if went_online {
            self.on_transition(user_id, true, at).await;
        }
    }

    /// Explicit visibility signal from the client.
    pub async fn set_online(&self, user_id: i32, online: bool) {
        if online {
            return self.heartbeat(user_id).await;
        }

        let at = now();
        let went_offline = match self.states.get_mut(&user_id) {
            Some(mut state) if state.online => {
                let expired = self.is_expired(&state, at);
                state.online = false;
                if expired {
                    // Already offline to observers, keep the last activity
                    Some(state.last_activity_at)
                } else {
                    state.last_activity_at = at;
                    Some(at)
                }
            }
            _ => None,
        };

        if let Some(last_seen) = went_offline {
            self.on_transition(user_id, false, last_seen).await;
        }
    }

    /// A live connection for `user_id` was opened.
    pub fn register_connection(&self, user_id: i32) {
        *self.connections.entry(user_id).or_insert(0) += 1;
    }

    /// Connection teardown. The user goes offline once their last
    /// registered connection is gone.
    pub async fn disconnect(&self, user_id: i32) {
        let remaining = match self.connections.get_mut(&user_id) {
            Some(mut open) => {
                *open = open.saturating_sub(1);
                *open
            }
            None => 0,
        };
        self.connections.remove_if(&user_id, |_, open| *open == 0);

        log::debug!(
            "Presence connection closed for user {} ({} still open)",
            user_id,
            remaining
        );

        if remaining == 0 {
            self.set_online(user_id, false).await;
        }
    }

    /// Presence of `subject_id` as seen by `observer_id`.
    pub async fn get_presence(
        &self,
        observer_id: i32,
        subject_id: i32,
    ) -> MessagingResult<PresenceView> {
        if observer_id != subject_id && !self.accounts.shows_online_status(subject_id).await? {
            return Ok(PresenceView::hidden(subject_id));
        }

        self.expire_if_silent(subject_id).await;

        let snapshot = self.states.get(&subject_id).map(|state| *state);
        match snapshot {
            Some(state) => Ok(PresenceView {
                user_id: subject_id,
                online: state.online,
                last_seen_at: Some(state.last_activity_at),
            }),
            None => Ok(PresenceView {
                user_id: subject_id,
                online: false,
                last_seen_at: self.accounts.last_seen(subject_id).await?,
            }),
        }
    }

    /// Raw online check for server-side decisions. Ignores privacy settings.
    pub fn is_online(&self, user_id: i32) -> bool {
        let at = now();
        self.states
            .get(&user_id)
            .map(|state| state.online && !self.is_expired(&state, at))
            .unwrap_or(false)
    }

    /// Take every silent user offline now. Returns how many went offline.
    pub async fn reap_expired(&self) -> usize {
        let at = now();
        let candidates: Vec<i32> = self
            .states
            .iter()
            .filter(|entry| entry.online && self.is_expired(entry.value(), at))
            .map(|entry| *entry.key())
            .collect();

        let mut reaped = 0;
        for user_id in candidates {
            if self.expire_if_silent(user_id).await {
                reaped += 1;
            }
        }

        if reaped > 0 {
            log::debug!("Presence reaper took {} users offline", reaped);
        }

        reaped
    }

    /// Apply the silence timeout to one user. True if it caused a transition.
    async fn expire_if_silent(&self, user_id: i32) -> bool {
        let at = now();
        let expired_at = match self.states.get_mut(&user_id) {
            Some(mut state) if state.online && self.is_expired(&state, at) => {
                state.online = false;
                Some(state.last_activity_at)
            }
            _ => None,
        };

        match expired_at {
            Some(last_seen) => {
                self.on_transition(user_id, false, last_seen).await;
                true
            }
            None => false,
        }
    }

    async fn on_transition(&self, user_id: i32, online: bool, at: NaiveDateTime) {
        log::debug!(
            "User {} is now {}",
            user_id,
            if online { "online" } else { "offline" }
        );

        if let Err(e) = self.accounts.record_last_seen(user_id, at).await {
            log::warn!("Failed to record last seen for user {}: {}", user_id, e);
        }

        match self.accounts.shows_online_status(user_id).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                log::warn!("Failed to read privacy flag for user {}: {}", user_id, e);
                return;
            }
        }

        let conversation_ids = match self.store.active_conversation_ids(user_id).await {
            Ok(ids) => ids,
            Err(e) => {
                log::warn!("Failed to list conversations for user {}: {}", user_id, e);
                return;
            }
        };

        let event = ConversationEvent::UserOnline(PresenceView {
            user_id,
            online,
            last_seen_at: Some(at),
        });
        for conversation_id in conversation_ids {
            self.fanout.publish(conversation_id, &event);
        }
    }
}
