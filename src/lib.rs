//! Peer-to-peer messaging for the bazaar marketplace.
//!
//! Participants exchange ordered messages inside durable conversations, see
//! each other's presence, and may seal individual messages with a secret of
//! their choosing.

pub mod accounts;
pub mod app_config;
pub mod conversations;
pub mod crypto;
pub mod db;
pub mod error;
pub mod fanout;
pub mod messaging;
pub mod middleware;
pub mod notifications;
pub mod orm;
pub mod presence;
pub mod web;

use crate::accounts::DbAccountDirectory;
use crate::app_config::AppConfig;
use crate::conversations::ConversationStore;
use crate::fanout::{BroadcastTransport, Fanout};
use crate::messaging::MessagingService;
use crate::notifications::DbNotificationEmitter;
use crate::presence::PresenceTracker;
use sea_orm::DatabaseConnection;
use std::sync::Arc;
use std::time::Duration;

/// Wire the database-backed collaborators into a messaging service.
pub fn build_service(
    db: DatabaseConnection,
    transport: Arc<dyn BroadcastTransport>,
    config: &AppConfig,
) -> MessagingService {
    let store = ConversationStore::new(db.clone());
    let fanout = Fanout::new(transport);
    let accounts = Arc::new(DbAccountDirectory::new(
        db.clone(),
        Duration::from_secs(config.presence.privacy_cache_ttl_secs),
    ));
    let presence = Arc::new(PresenceTracker::new(
        config.presence.clone(),
        store.clone(),
        accounts.clone(),
        fanout.clone(),
    ));

    MessagingService::new(
        store,
        presence,
        fanout,
        accounts,
        Arc::new(DbNotificationEmitter::new(db)),
        config.crypto,
        config.messaging.clone(),
    )
}

/// Periodically take silent users offline. Runs on the current actix runtime.
pub fn spawn_presence_reaper(presence: Arc<PresenceTracker>, every: Duration) {
    actix_web::rt::spawn(async move {
        let mut interval = actix_web::rt::time::interval(every);
        loop {
            interval.tick().await;
            presence.reap_expired().await;
        }
    });
}
