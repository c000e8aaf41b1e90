//! Account directory boundary.
//!
//! Users are owned by the account system. Messaging only reads the privacy
//! flag and display name, and writes the last-seen timestamp.

use crate::orm::users;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use moka::sync::Cache;
use sea_orm::{entity::*, query::*, sea_query::Expr, DatabaseConnection, DbErr};
use std::time::Duration;

#[async_trait]
pub trait AccountDirectory: Send + Sync {
    /// Whether the user allows others to see their online status.
    /// Unknown users are treated as visible.
    async fn shows_online_status(&self, user_id: i32) -> Result<bool, DbErr>;

    async fn set_show_online(&self, user_id: i32, show: bool) -> Result<(), DbErr>;

    async fn record_last_seen(&self, user_id: i32, at: NaiveDateTime) -> Result<(), DbErr>;

    async fn last_seen(&self, user_id: i32) -> Result<Option<NaiveDateTime>, DbErr>;

    async fn display_name(&self, user_id: i32) -> Result<Option<String>, DbErr>;
}

/// Directory backed by the `users` table, with privacy flags cached.
pub struct DbAccountDirectory {
    db: DatabaseConnection,
    privacy: Cache<i32, bool>,
}

impl DbAccountDirectory {
    pub fn new(db: DatabaseConnection, privacy_ttl: Duration) -> Self {
        Self {
            db,
            privacy: Cache::builder()
                .time_to_live(privacy_ttl)
                .max_capacity(10_000)
                .build(),
        }
    }
}

#[async_trait]
impl AccountDirectory for DbAccountDirectory {
    async fn shows_online_status(&self, user_id: i32) -> Result<bool, DbErr> {
        if let Some(show) = self.privacy.get(&user_id) {
            return Ok(show);
        }

        let show = users::Entity::find_by_id(user_id)
            .one(&self.db)
            .await?
            .map(|u| u.show_online)
            .unwrap_or(true);

        self.privacy.insert(user_id, show);
        Ok(show)
    }

    async fn set_show_online(&self, user_id: i32, show: bool) -> Result<(), DbErr> {
        users::Entity::update_many()
            .col_expr(users::Column::ShowOnline, Expr::value(show))
            .filter(users::Column::Id.eq(user_id))
            .exec(&self.db)
            .await?;

        self.privacy.invalidate(&user_id);
        Ok(())
    }

    async fn record_last_seen(&self, user_id: i32, at: NaiveDateTime) -> Result<(), DbErr> {
        users::Entity::update_many()
            .col_expr(users::Column::LastSeenAt, Expr::value(at))
            .filter(users::Column::Id.eq(user_id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn last_seen(&self, user_id: i32) -> Result<Option<NaiveDateTime>, DbErr> {
        Ok(users::Entity::find_by_id(user_id)
            .one(&self.db)
            .await?
            .and_then(|u| u.last_seen_at))
    }

    async fn display_name(&self, user_id: i32) -> Result<Option<String>, DbErr> {
        Ok(users::Entity::find_by_id(user_id)
            .one(&self.db)
            .await?
            .map(|u| u.name))
    }
}
