//! Conversation store for private messaging
//!
//! Owns every invariant around participant membership, message ordering and
//! per-user soft deletes. The relational store underneath only persists rows.

use crate::error::{MessagingError, MessagingResult};
use crate::orm::{
    conversation_participants, conversations, encryption_keys, private_messages,
    private_messages::MessageType,
};
use chrono::{NaiveDateTime, Utc};
use sea_orm::{
    entity::*, query::*, sea_query::Expr, ActiveValue::Set, Condition, ConnectionTrait,
    DatabaseConnection, TransactionTrait,
};
use serde::Serialize;

pub type Conversation = conversations::Model;
pub type Participant = conversation_participants::Model;
pub type Message = private_messages::Model;

/// Current time as stored in the database.
pub(crate) fn now() -> NaiveDateTime {
    Utc::now().naive_utc()
}

/// Body of a message being appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageContent {
    Plain(String),
    Sealed(SealedContent),
}

/// Stored form of a sealed body. Every field is text encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedContent {
    pub encrypted_text: String,
    pub key_hash: String,
    pub salt: String,
    pub iv: String,
    pub auth_tag: String,
}

/// Conversation list entry
#[derive(Debug, Clone, Serialize)]
pub struct ConversationSummary {
    pub id: i32,
    pub title: Option<String>,
    pub subject_ref: Option<String>,
    pub last_message_at: Option<NaiveDateTime>,
    pub is_active: bool,
    pub participant_ids: Vec<i32>,
}

/// Durable conversation state backed by the relational store.
#[derive(Clone)]
pub struct ConversationStore {
    db: DatabaseConnection,
}

impl ConversationStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Create a new conversation with participants.
    ///
    /// The creator is always a participant; duplicates are ignored.
    pub async fn create_conversation(
        &self,
        creator_id: i32,
        participant_ids: &[i32],
        title: Option<&str>,
        subject_ref: Option<&str>,
    ) -> MessagingResult<Conversation> {
        let mut others: Vec<i32> = participant_ids
            .iter()
            .copied()
            .filter(|id| *id != creator_id)
            .collect();
        others.sort_unstable();
        others.dedup();

        if others.is_empty() {
            return Err(MessagingError::InvalidState(
                "a conversation needs at least two participants".to_string(),
            ));
        }

        let created_at = now();
        let txn = self.db.begin().await?;

        let conversation = conversations::ActiveModel {
            title: Set(title.map(|s| s.to_string())),
            subject_ref: Set(subject_ref.map(|s| s.to_string())),
            created_at: Set(created_at),
            last_message_at: Set(None),
            is_active: Set(false),
            ..Default::default()
        }
        .insert(&txn)
        .await?;

        for user_id in std::iter::once(creator_id).chain(others) {
            conversation_participants::ActiveModel {
                conversation_id: Set(conversation.id),
                user_id: Set(user_id),
                joined_at: Set(created_at),
                left_at: Set(None),
                is_hidden: Set(false),
                last_seen_at: Set(None),
                is_typing: Set(false),
                last_typing_at: Set(None),
                ..Default::default()
            }
            .insert(&txn)
            .await?;
        }

        txn.commit().await?;

        log::debug!(
            "Conversation {} created by user {}",
            conversation.id,
            creator_id
        );

        Ok(conversation)
    }

    /// Return the two-party conversation between `user_id` and `other_id`
    /// about `subject_ref`, creating it on first contact.
    pub async fn find_or_create_direct(
        &self,
        user_id: i32,
        other_id: i32,
        subject_ref: Option<&str>,
    ) -> MessagingResult<Conversation> {
        if user_id == other_id {
            return Err(MessagingError::InvalidState(
                "cannot open a conversation with yourself".to_string(),
            ));
        }

        let rows = conversation_participants::Entity::find()
            .filter(conversation_participants::Column::UserId.eq(user_id))
            .filter(conversation_participants::Column::LeftAt.is_null())
            .find_also_related(conversations::Entity)
            .all(&self.db)
            .await?;

        for (_, conversation) in rows {
            let conversation = match conversation {
                Some(c) => c,
                None => continue,
            };
            if conversation.subject_ref.as_deref() != subject_ref {
                continue;
            }

            let members = self.participant_ids(conversation.id).await?;
            if members.len() == 2 && members.contains(&other_id) {
                return Ok(conversation);
            }
        }

        self.create_conversation(user_id, &[other_id], None, subject_ref)
            .await
    }

    /// Load a conversation.
    pub async fn get_conversation(&self, conversation_id: i32) -> MessagingResult<Conversation> {
        conversations::Entity::find_by_id(conversation_id)
            .one(&self.db)
            .await?
            .ok_or(MessagingError::NotFound)
    }

    /// Authorization gate for every read or write of a conversation's messages.
    pub async fn ensure_participant(
        &self,
        conversation_id: i32,
        user_id: i32,
    ) -> MessagingResult<Participant> {
        ensure_participant_on(&self.db, conversation_id, user_id).await
    }

    /// Append a message.
    ///
    /// `created_at` never goes backwards within a conversation; equal
    /// timestamps are ordered by id. Every participant's `is_hidden` flag is
    /// cleared, so a hidden thread resurfaces for everyone on a new message.
    pub async fn append_message(
        &self,
        conversation_id: i32,
        sender_id: i32,
        content: MessageContent,
    ) -> MessagingResult<Message> {
        let txn = self.db.begin().await?;

        ensure_participant_on(&txn, conversation_id, sender_id).await?;

        let conversation = conversations::Entity::find_by_id(conversation_id)
            .one(&txn)
            .await?
            .ok_or(MessagingError::NotFound)?;

        let created_at = match conversation.last_message_at {
            Some(last) => now().max(last),
            None => now(),
        };

        let mut message = private_messages::ActiveModel {
            conversation_id: Set(conversation_id),
            user_id: Set(sender_id),
            message_type: Set(MessageType::Text),
            created_at: Set(created_at),
            delivered_at: Set(None),
            read_at: Set(None),
            deleted_at: Set(None),
            ..Default::default()
        };

        match content {
            MessageContent::Plain(text) => {
                message.text = Set(Some(text));
                message.is_encrypted = Set(false);
                message.encrypted_text = Set(None);
                message.encryption_key_hash = Set(None);
                message.encryption_salt = Set(None);
                message.encryption_iv = Set(None);
                message.encryption_tag = Set(None);
            }
            MessageContent::Sealed(sealed) => {
                message.text = Set(None);
                message.is_encrypted = Set(true);
                message.encrypted_text = Set(Some(sealed.encrypted_text));
                message.encryption_key_hash = Set(Some(sealed.key_hash));
                message.encryption_salt = Set(Some(sealed.salt));
                message.encryption_iv = Set(Some(sealed.iv));
                message.encryption_tag = Set(Some(sealed.auth_tag));
            }
        }

        let message = message.insert(&txn).await?;

        conversations::Entity::update_many()
            .col_expr(conversations::Column::IsActive, Expr::value(true))
            .filter(conversations::Column::Id.eq(conversation_id))
            .exec(&txn)
            .await?;

        advance_last_message_at(&txn, conversation_id, created_at).await?;

        conversation_participants::Entity::update_many()
            .col_expr(conversation_participants::Column::IsHidden, Expr::value(false))
            .filter(conversation_participants::Column::ConversationId.eq(conversation_id))
            .filter(conversation_participants::Column::IsHidden.eq(true))
            .exec(&txn)
            .await?;

        // Sending ends the sender's typing state
        conversation_participants::Entity::update_many()
            .col_expr(conversation_participants::Column::IsTyping, Expr::value(false))
            .filter(conversation_participants::Column::ConversationId.eq(conversation_id))
            .filter(conversation_participants::Column::UserId.eq(sender_id))
            .exec(&txn)
            .await?;

        txn.commit().await?;

        Ok(message)
    }

    /// Load a message.
    pub async fn get_message(&self, message_id: i32) -> MessagingResult<Message> {
        private_messages::Entity::find_by_id(message_id)
            .one(&self.db)
            .await?
            .ok_or(MessagingError::NotFound)
    }

    /// Replace a plaintext body by its sealed form. The plaintext is cleared.
    pub async fn seal_message(
        &self,
        message_id: i32,
        sealed: SealedContent,
    ) -> MessagingResult<Message> {
        let result = private_messages::Entity::update_many()
            .col_expr(private_messages::Column::Text, Expr::cust("NULL"))
            .col_expr(private_messages::Column::IsEncrypted, Expr::value(true))
            .col_expr(
                private_messages::Column::EncryptedText,
                Expr::value(sealed.encrypted_text),
            )
            .col_expr(
                private_messages::Column::EncryptionKeyHash,
                Expr::value(sealed.key_hash),
            )
            .col_expr(private_messages::Column::EncryptionSalt, Expr::value(sealed.salt))
            .col_expr(private_messages::Column::EncryptionIv, Expr::value(sealed.iv))
            .col_expr(
                private_messages::Column::EncryptionTag,
                Expr::value(sealed.auth_tag),
            )
            .filter(private_messages::Column::Id.eq(message_id))
            .filter(private_messages::Column::IsEncrypted.eq(false))
            .exec(&self.db)
            .await?;

        if result.rows_affected == 0 {
            // Either missing or sealed by someone else first
            self.get_message(message_id).await?;
            return Err(MessagingError::InvalidState(
                "message is already encrypted".to_string(),
            ));
        }

        self.get_message(message_id).await
    }

    /// Stamp `delivered_at`. A second call leaves the first timestamp in place.
    pub async fn mark_delivered(&self, message_id: i32) -> MessagingResult<Message> {
        let message = self.get_message(message_id).await?;
        if message.delivered_at.is_some() {
            return Ok(message);
        }

        let delivered_at = now().max(message.created_at);

        private_messages::Entity::update_many()
            .col_expr(
                private_messages::Column::DeliveredAt,
                Expr::value(delivered_at),
            )
            .filter(private_messages::Column::Id.eq(message_id))
            .filter(private_messages::Column::DeliveredAt.is_null())
            .exec(&self.db)
            .await?;

        self.get_message(message_id).await
    }

    /// Stamp `read_at`. A second call leaves the first timestamp in place.
    ///
    /// Reading an undelivered message stamps `delivered_at` with the same
    /// instant, keeping `created_at <= delivered_at <= read_at`.
    pub async fn mark_read(&self, message_id: i32) -> MessagingResult<Message> {
        let message = self.get_message(message_id).await?;
        if message.read_at.is_some() {
            return Ok(message);
        }

        let txn = self.db.begin().await?;
        let at = now().max(message.created_at);

        private_messages::Entity::update_many()
            .col_expr(private_messages::Column::DeliveredAt, Expr::value(at))
            .filter(private_messages::Column::Id.eq(message_id))
            .filter(private_messages::Column::DeliveredAt.is_null())
            .exec(&txn)
            .await?;

        // Reload: a concurrent mark_delivered may have stamped a later time
        let current = private_messages::Entity::find_by_id(message_id)
            .one(&txn)
            .await?
            .ok_or(MessagingError::NotFound)?;
        let read_at = match current.delivered_at {
            Some(delivered_at) => at.max(delivered_at),
            None => at,
        };

        private_messages::Entity::update_many()
            .col_expr(private_messages::Column::ReadAt, Expr::value(read_at))
            .filter(private_messages::Column::Id.eq(message_id))
            .filter(private_messages::Column::ReadAt.is_null())
            .exec(&txn)
            .await?;

        txn.commit().await?;

        self.get_message(message_id).await
    }

    /// Leave a conversation.
    ///
    /// Only the leaving user's row and the messages that user sent are
    /// touched. Everyone else keeps their view of the thread.
    pub async fn leave_conversation(
        &self,
        conversation_id: i32,
        user_id: i32,
    ) -> MessagingResult<()> {
        let txn = self.db.begin().await?;

        let participant = ensure_participant_on(&txn, conversation_id, user_id).await?;
        let left_at = now();

        let mut participant: conversation_participants::ActiveModel = participant.into();
        participant.left_at = Set(Some(left_at));
        participant.is_typing = Set(false);
        participant.update(&txn).await?;

        let deleted = private_messages::Entity::update_many()
            .col_expr(private_messages::Column::DeletedAt, Expr::value(left_at))
            .filter(private_messages::Column::ConversationId.eq(conversation_id))
            .filter(private_messages::Column::UserId.eq(user_id))
            .filter(private_messages::Column::DeletedAt.is_null())
            .exec(&txn)
            .await?;

        txn.commit().await?;

        log::debug!(
            "User {} left conversation {} ({} own messages soft-deleted)",
            user_id,
            conversation_id,
            deleted.rows_affected
        );

        Ok(())
    }

    /// Hide or unhide a conversation in the user's own list.
    pub async fn set_hidden(
        &self,
        conversation_id: i32,
        user_id: i32,
        hidden: bool,
    ) -> MessagingResult<Participant> {
        let participant = self.ensure_participant(conversation_id, user_id).await?;

        let mut participant: conversation_participants::ActiveModel = participant.into();
        participant.is_hidden = Set(hidden);
        Ok(participant.update(&self.db).await?)
    }

    /// Conversations the user is active in and has not hidden, most recent first.
    pub async fn list_for_user(&self, user_id: i32) -> MessagingResult<Vec<ConversationSummary>> {
        let rows = conversation_participants::Entity::find()
            .filter(conversation_participants::Column::UserId.eq(user_id))
            .filter(conversation_participants::Column::LeftAt.is_null())
            .filter(conversation_participants::Column::IsHidden.eq(false))
            .find_also_related(conversations::Entity)
            .all(&self.db)
            .await?;

        let mut conversations: Vec<Conversation> =
            rows.into_iter().filter_map(|(_, conv)| conv).collect();

        // NULL ordering differs between backends, so sort here.
        // Never-messaged conversations go last.
        conversations.sort_by(|a, b| {
            b.last_message_at
                .cmp(&a.last_message_at)
                .then_with(|| b.id.cmp(&a.id))
        });

        let mut summaries = Vec::with_capacity(conversations.len());
        for conv in conversations {
            let participant_ids = self.participant_ids(conv.id).await?;
            summaries.push(ConversationSummary {
                id: conv.id,
                title: conv.title,
                subject_ref: conv.subject_ref,
                last_message_at: conv.last_message_at,
                is_active: conv.is_active,
                participant_ids,
            });
        }

        Ok(summaries)
    }

    /// Messages of a conversation as `viewer_id` sees them, oldest first.
    ///
    /// Messages the viewer sent and later soft-deleted are left out for the
    /// viewer only. `before_id` pages backwards from a known message.
    pub async fn list_messages(
        &self,
        conversation_id: i32,
        viewer_id: i32,
        limit: u64,
        before_id: Option<i32>,
    ) -> MessagingResult<Vec<Message>> {
        self.ensure_participant(conversation_id, viewer_id).await?;

        let mut query = private_messages::Entity::find()
            .filter(private_messages::Column::ConversationId.eq(conversation_id))
            .filter(
                Condition::any()
                    .add(private_messages::Column::UserId.ne(viewer_id))
                    .add(private_messages::Column::DeletedAt.is_null()),
            );

        if let Some(before_id) = before_id {
            query = query.filter(private_messages::Column::Id.lt(before_id));
        }

        let mut messages = query
            .order_by_desc(private_messages::Column::CreatedAt)
            .order_by_desc(private_messages::Column::Id)
            .limit(limit)
            .all(&self.db)
            .await?;

        messages.reverse();
        Ok(messages)
    }

    /// Active participant rows of a conversation.
    pub async fn participants(&self, conversation_id: i32) -> MessagingResult<Vec<Participant>> {
        Ok(conversation_participants::Entity::find()
            .filter(conversation_participants::Column::ConversationId.eq(conversation_id))
            .filter(conversation_participants::Column::LeftAt.is_null())
            .order_by_asc(conversation_participants::Column::UserId)
            .all(&self.db)
            .await?)
    }

    /// Users with an active row in the conversation.
    pub async fn participant_ids(&self, conversation_id: i32) -> MessagingResult<Vec<i32>> {
        let participants = self.participants(conversation_id).await?;
        Ok(participants.into_iter().map(|p| p.user_id).collect())
    }

    /// Conversations the user is an active participant of, hidden ones included.
    pub async fn active_conversation_ids(&self, user_id: i32) -> MessagingResult<Vec<i32>> {
        let participants = conversation_participants::Entity::find()
            .filter(conversation_participants::Column::UserId.eq(user_id))
            .filter(conversation_participants::Column::LeftAt.is_null())
            .order_by_asc(conversation_participants::Column::ConversationId)
            .all(&self.db)
            .await?;

        Ok(participants.into_iter().map(|p| p.conversation_id).collect())
    }

    /// Record the user's typing state in their participant row.
    pub async fn set_typing(
        &self,
        conversation_id: i32,
        user_id: i32,
        is_typing: bool,
    ) -> MessagingResult<Participant> {
        let participant = self.ensure_participant(conversation_id, user_id).await?;

        let mut participant: conversation_participants::ActiveModel = participant.into();
        participant.is_typing = Set(is_typing);
        if is_typing {
            participant.last_typing_at = Set(Some(now()));
        }
        Ok(participant.update(&self.db).await?)
    }

    /// Stamp the user's `last_seen_at` for one conversation.
    pub async fn touch_last_seen(&self, conversation_id: i32, user_id: i32) -> MessagingResult<()> {
        conversation_participants::Entity::update_many()
            .col_expr(
                conversation_participants::Column::LastSeenAt,
                Expr::value(now()),
            )
            .filter(conversation_participants::Column::ConversationId.eq(conversation_id))
            .filter(conversation_participants::Column::UserId.eq(user_id))
            .filter(conversation_participants::Column::LeftAt.is_null())
            .exec(&self.db)
            .await?;

        Ok(())
    }

    /// Keep an audit row for a secret fingerprint. Reuse of a secret does not add rows.
    pub async fn record_key_fingerprint(&self, user_id: i32, key_hash: &str) -> MessagingResult<()> {
        let existing = encryption_keys::Entity::find()
            .filter(encryption_keys::Column::UserId.eq(user_id))
            .filter(encryption_keys::Column::KeyHash.eq(key_hash))
            .one(&self.db)
            .await?;

        match existing {
            Some(key) if key.is_active => {}
            Some(key) => {
                let mut key: encryption_keys::ActiveModel = key.into();
                key.is_active = Set(true);
                key.update(&self.db).await?;
            }
            None => {
                encryption_keys::ActiveModel {
                    user_id: Set(user_id),
                    key_hash: Set(key_hash.to_string()),
                    is_active: Set(true),
                    created_at: Set(now()),
                    ..Default::default()
                }
                .insert(&self.db)
                .await?;
            }
        }

        Ok(())
    }
}

/// Verify that a user is an active participant, on any connection or transaction.
/// Move `last_message_at` forward to `at`. Concurrent appends commit in any
/// order, so an older time never overwrites a newer one. True if it moved.
pub async fn advance_last_message_at<C>(
    db: &C,
    conversation_id: i32,
    at: NaiveDateTime,
) -> MessagingResult<bool>
where
    C: ConnectionTrait,
{
    let res = conversations::Entity::update_many()
        .col_expr(conversations::Column::LastMessageAt, Expr::value(at))
        .filter(conversations::Column::Id.eq(conversation_id))
        .filter(
            Condition::any()
                .add(conversations::Column::LastMessageAt.is_null())
                .add(conversations::Column::LastMessageAt.lt(at)),
        )
        .exec(db)
        .await?;

    Ok(res.rows_affected > 0)
}

pub async fn ensure_participant_on<C>(
    db: &C,
    conversation_id: i32,
    user_id: i32,
) -> MessagingResult<Participant>
where
    C: ConnectionTrait,
{
    let participant = conversation_participants::Entity::find()
        .filter(conversation_participants::Column::ConversationId.eq(conversation_id))
        .filter(conversation_participants::Column::UserId.eq(user_id))
        .filter(conversation_participants::Column::LeftAt.is_null())
        .one(db)
        .await?;

    match participant {
        Some(participant) => Ok(participant),
        None => {
            let exists = conversations::Entity::find_by_id(conversation_id)
                .one(db)
                .await?
                .is_some();
            if exists {
                Err(MessagingError::Forbidden)
            } else {
                Err(MessagingError::NotFound)
            }
        }
    }
}
