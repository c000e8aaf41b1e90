//! New-message notifications for offline recipients

use crate::conversations::now;
use crate::orm::notifications;
use async_trait::async_trait;
use sea_orm::{entity::*, query::*, DatabaseConnection, DbErr, Set};

/// Notification type for private messages
pub const PRIVATE_MESSAGE: &str = "pm";

/// A notification about to be written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewNotification {
    pub user_id: i32,
    pub title: String,
    pub message: String,
    pub url: Option<String>,
    pub source_user_id: Option<i32>,
    pub source_content_id: Option<i32>,
}

#[async_trait]
pub trait NotificationEmitter: Send + Sync {
    async fn emit(&self, notification: NewNotification) -> Result<i32, DbErr>;
}

/// Writes notifications to the `notifications` table
pub struct DbNotificationEmitter {
    db: DatabaseConnection,
}

impl DbNotificationEmitter {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl NotificationEmitter for DbNotificationEmitter {
    async fn emit(&self, notification: NewNotification) -> Result<i32, DbErr> {
        let model = notifications::ActiveModel {
            user_id: Set(notification.user_id),
            type_: Set(PRIVATE_MESSAGE.to_string()),
            title: Set(notification.title),
            message: Set(notification.message),
            url: Set(notification.url),
            source_user_id: Set(notification.source_user_id),
            source_content_id: Set(notification.source_content_id),
            is_read: Set(false),
            created_at: Set(now()),
            ..Default::default()
        }
        .insert(&self.db)
        .await?;

        Ok(model.id)
    }
}

/// Unread notifications for a user
pub async fn count_unread_notifications(
    db: &DatabaseConnection,
    user_id: i32,
) -> Result<usize, DbErr> {
    notifications::Entity::find()
        .filter(notifications::Column::UserId.eq(user_id))
        .filter(notifications::Column::IsRead.eq(false))
        .count(db)
        .await
}
