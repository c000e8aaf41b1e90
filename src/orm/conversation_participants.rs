//! SeaORM Entity for conversation_participants table

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "conversation_participants")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub conversation_id: i32,
    pub user_id: i32,
    pub joined_at: DateTime,
    /// Set when the user leaves. The row is kept.
    pub left_at: Option<DateTime>,
    pub is_hidden: bool,
    pub last_seen_at: Option<DateTime>,
    pub is_typing: bool,
    pub last_typing_at: Option<DateTime>,
}

impl Model {
    /// Active rows are the only ones that grant access to the conversation.
    pub fn is_active(&self) -> bool {
        self.left_at.is_none()
    }

    /// Typing flags go stale if the client never sends the stop signal.
    pub fn is_typing_at(&self, now: DateTime, timeout: chrono::Duration) -> bool {
        self.is_typing
            && self
                .last_typing_at
                .map(|at| now - at <= timeout)
                .unwrap_or(false)
    }
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
