//! SeaORM Entity for private_messages table

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Kind of message body
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(Some(16))")]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[sea_orm(string_value = "text")]
    Text,
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "private_messages")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub conversation_id: i32,
    pub user_id: i32,
    pub message_type: MessageType,
    /// Plaintext body. NULL once the message is sealed.
    #[sea_orm(column_type = "Text", nullable)]
    pub text: Option<String>,
    pub is_encrypted: bool,
    #[sea_orm(column_type = "Text", nullable)]
    pub encrypted_text: Option<String>,
    pub encryption_key_hash: Option<String>,
    pub encryption_salt: Option<String>,
    pub encryption_iv: Option<String>,
    pub encryption_tag: Option<String>,
    pub created_at: DateTime,
    pub delivered_at: Option<DateTime>,
    pub read_at: Option<DateTime>,
    /// Sender-side soft delete
    pub deleted_at: Option<DateTime>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::conversations::Entity",
        from = "Column::ConversationId",
        to = "super::conversations::Column::Id",
        on_update = "NoAction",
        on_delete = "Cascade"
    )]
    Conversation,
    #[sea_orm(
        belongs_to = "super::users::Entity",
        from = "Column::UserId",
        to = "super::users::Column::Id",
        on_update = "NoAction",
        on_delete = "Cascade"
    )]
    User,
}

impl Related<super::conversations::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Conversation.def()
    }
}

impl Related<super::users::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::User.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
