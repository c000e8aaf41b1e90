//! Test fixtures for creating test data
#![allow(dead_code)]

use bazaar_messaging::app_config::AppConfig;
use bazaar_messaging::crypto::KdfParams;
use bazaar_messaging::fanout::{BroadcastTransport, PublishError};
use bazaar_messaging::messaging::MessagingService;
use bazaar_messaging::orm::users;
use chrono::Utc;
use sea_orm::{entity::*, ActiveValue::Set, DatabaseConnection, DbErr};
use std::sync::{Arc, Mutex};

/// Create a user the way the account system would
pub async fn create_test_user(db: &DatabaseConnection, name: &str) -> Result<users::Model, DbErr> {
    users::ActiveModel {
        name: Set(name.to_string()),
        created_at: Set(Utc::now().naive_utc()),
        show_online: Set(true),
        last_seen_at: Set(None),
        ..Default::default()
    }
    .insert(db)
    .await
}

/// Defaults with cheap key derivation
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.crypto = KdfParams {
        memory_kib: 1024,
        iterations: 1,
        parallelism: 1,
    };
    config.presence.reaper_interval_secs = 0;
    config
}

pub fn build_test_service(
    db: &DatabaseConnection,
    transport: Arc<dyn BroadcastTransport>,
    config: &AppConfig,
) -> MessagingService {
    bazaar_messaging::build_service(db.clone(), transport, config)
}

/// Transport that keeps every published payload
#[derive(Default)]
pub struct RecordingTransport {
    published: Mutex<Vec<(String, String)>>,
}

impl RecordingTransport {
    /// Every payload, parsed
    pub fn events(&self) -> Vec<serde_json::Value> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .map(|(_, payload)| serde_json::from_str(payload).unwrap())
            .collect()
    }

    /// Payloads with the given event name
    pub fn events_named(&self, name: &str) -> Vec<serde_json::Value> {
        self.events()
            .into_iter()
            .filter(|event| event["event"] == name)
            .collect()
    }

    pub fn channels(&self) -> Vec<String> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .map(|(channel, _)| channel.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.published.lock().unwrap().clear();
    }
}

impl BroadcastTransport for RecordingTransport {
    fn try_publish(&self, channel: &str, payload: String) -> Result<(), PublishError> {
        self.published
            .lock()
            .unwrap()
            .push((channel.to_string(), payload));
        Ok(())
    }
}

/// Transport that is always down
pub struct FailingTransport;

impl BroadcastTransport for FailingTransport {
    fn try_publish(&self, _channel: &str, _payload: String) -> Result<(), PublishError> {
        Err(PublishError::Closed)
    }
}
