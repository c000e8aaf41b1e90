//! Messaging service: the boundary every client operation goes through.
//!
//! Each operation takes a [`Caller`], checks membership through the
//! conversation store, persists, and then runs best-effort side effects
//! (fanout, notifications) whose failures never reach the caller.

use crate::accounts::AccountDirectory;
use crate::conversations::{
    now, ConversationStore, ConversationSummary, Conversation, Message, MessageContent,
    SealedContent,
};
use crate::crypto::{self, KdfParams};
use crate::error::{MessagingError, MessagingResult};
use crate::fanout::{ConversationEvent, Fanout, Receipt};
use crate::notifications::{NewNotification, NotificationEmitter};
use crate::orm::private_messages::MessageType;
use crate::presence::{PresenceTracker, PresenceView};
use actix_web::web;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Notification previews are cut to this many characters
const PREVIEW_CHARS: usize = 100;

/// Identity of whoever is calling the service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Caller {
    Guest,
    User(i32),
}

impl Caller {
    pub fn get_id(&self) -> Option<i32> {
        match self {
            Caller::Guest => None,
            Caller::User(id) => Some(*id),
        }
    }

    /// Returns the user id or `Unauthorized`.
    pub fn require_login(&self) -> MessagingResult<i32> {
        self.get_id().ok_or(MessagingError::Unauthorized)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Longest accepted message body, in characters
    pub max_message_length: usize,
    /// Messages per page when the client does not ask for a size
    pub page_size: u64,
    /// Upper bound on the page size a client can ask for
    pub max_page_size: u64,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            max_message_length: 10_000,
            page_size: 50,
            max_page_size: 200,
        }
    }
}

/// Message as returned to clients and published to subscribers.
///
/// `text` is only set for plaintext messages, or for the sender's own
/// response right after sealing. Sealed messages carry their ciphertext,
/// iv and tag so recipients can open them. The key fingerprint is never
/// exposed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageView {
    pub id: i32,
    pub conversation_id: i32,
    pub sender_id: i32,
    pub message_type: MessageType,
    pub text: Option<String>,
    pub is_encrypted: bool,
    pub encrypted_text: Option<String>,
    pub encryption_iv: Option<String>,
    pub encryption_tag: Option<String>,
    /// Salt needed to re-derive the key, base64
    pub encryption_salt: Option<String>,
    pub created_at: NaiveDateTime,
    pub delivered_at: Option<NaiveDateTime>,
    pub read_at: Option<NaiveDateTime>,
}

impl From<Message> for MessageView {
    fn from(m: Message) -> Self {
        Self {
            id: m.id,
            conversation_id: m.conversation_id,
            sender_id: m.user_id,
            message_type: m.message_type,
            text: m.text,
            is_encrypted: m.is_encrypted,
            encrypted_text: m.encrypted_text,
            encryption_iv: m.encryption_iv,
            encryption_tag: m.encryption_tag,
            encryption_salt: m.encryption_salt,
            created_at: m.created_at,
            delivered_at: m.delivered_at,
            read_at: m.read_at,
        }
    }
}

impl MessageView {
    fn with_plaintext(mut self, text: String) -> Self {
        self.text = Some(text);
        self
    }
}

/// Result of a successful decrypt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecryptedMessage {
    pub message_id: i32,
    pub text: String,
}

#[derive(Clone)]
pub struct MessagingService {
    store: ConversationStore,
    presence: Arc<PresenceTracker>,
    fanout: Fanout,
    accounts: Arc<dyn AccountDirectory>,
    notifier: Arc<dyn NotificationEmitter>,
    kdf: KdfParams,
    config: MessagingConfig,
}

impl MessagingService {
    pub fn new(
        store: ConversationStore,
        presence: Arc<PresenceTracker>,
        fanout: Fanout,
        accounts: Arc<dyn AccountDirectory>,
        notifier: Arc<dyn NotificationEmitter>,
        kdf: KdfParams,
        config: MessagingConfig,
    ) -> Self {
        Self {
            store,
            presence,
            fanout,
            accounts,
            notifier,
            kdf,
            config,
        }
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    pub fn presence(&self) -> &Arc<PresenceTracker> {
        &self.presence
    }

    async fn summarize(&self, conversation: Conversation) -> MessagingResult<ConversationSummary> {
        let participant_ids = self.store.participant_ids(conversation.id).await?;
        Ok(ConversationSummary {
            id: conversation.id,
            title: conversation.title,
            subject_ref: conversation.subject_ref,
            last_message_at: conversation.last_message_at,
            is_active: conversation.is_active,
            participant_ids,
        })
    }

    fn validate_text(&self, text: &str) -> MessagingResult<()> {
        if text.trim().is_empty() {
            return Err(MessagingError::InvalidState("message is empty".to_string()));
        }
        if text.chars().count() > self.config.max_message_length {
            return Err(MessagingError::InvalidState(
                "message is too long".to_string(),
            ));
        }
        Ok(())
    }

    async fn derive_key(&self, secret: &str, salt: Vec<u8>) -> MessagingResult<crypto::MessageKey> {
        let secret = secret.to_string();
        let params = self.kdf;

        // Argon2 is memory-hard, keep it off the async workers
        let key = web::block(move || crypto::derive_key(&secret, &salt, &params))
            .await
            .map_err(|e| MessagingError::TransientIo(format!("key derivation aborted: {}", e)))??;

        Ok(key)
    }

    /// Seal `text` under a fresh salt and record the secret's fingerprint.
    async fn seal_text(
        &self,
        user_id: i32,
        text: &str,
        secret: &str,
    ) -> MessagingResult<SealedContent> {
        if secret.is_empty() {
            return Err(MessagingError::InvalidState(
                "encryption secret is empty".to_string(),
            ));
        }

        let salt = crypto::generate_salt();
        let key = self.derive_key(secret, salt.to_vec()).await?;
        let sealed = crypto::seal(text, &key)?;
        let key_hash = crypto::fingerprint(secret);

        self.store.record_key_fingerprint(user_id, &key_hash).await?;

        Ok(SealedContent {
            encrypted_text: crypto::encode(&sealed.ciphertext),
            key_hash,
            salt: crypto::encode(&salt),
            iv: crypto::encode(&sealed.iv),
            auth_tag: crypto::encode(&sealed.auth_tag),
        })
    }

    /// Start a conversation between the caller and `participant_ids`.
    pub async fn start_conversation(
        &self,
        caller: Caller,
        participant_ids: &[i32],
        title: Option<&str>,
        subject_ref: Option<&str>,
    ) -> MessagingResult<ConversationSummary> {
        let user_id = caller.require_login()?;
        let conversation = self
            .store
            .create_conversation(user_id, participant_ids, title, subject_ref)
            .await?;
        self.summarize(conversation).await
    }

    /// Return the caller's two-party conversation with `other_id`, creating it if needed.
    pub async fn open_direct_conversation(
        &self,
        caller: Caller,
        other_id: i32,
        subject_ref: Option<&str>,
    ) -> MessagingResult<ConversationSummary> {
        let user_id = caller.require_login()?;
        let conversation = self
            .store
            .find_or_create_direct(user_id, other_id, subject_ref)
            .await?;
        self.summarize(conversation).await
    }

    /// Send a message, optionally sealed with `encrypt` as the secret.
    ///
    /// The plaintext of a sealed message appears only in the returned view.
    pub async fn send_message(
        &self,
        caller: Caller,
        conversation_id: i32,
        text: &str,
        encrypt: Option<&str>,
    ) -> MessagingResult<MessageView> {
        let user_id = caller.require_login()?;
        self.validate_text(text)?;
        self.store
            .ensure_participant(conversation_id, user_id)
            .await?;

        let content = match encrypt {
            Some(secret) => MessageContent::Sealed(self.seal_text(user_id, text, secret).await?),
            None => MessageContent::Plain(text.to_string()),
        };

        let message = self
            .store
            .append_message(conversation_id, user_id, content)
            .await?;
        let view = MessageView::from(message);

        self.fanout
            .publish(conversation_id, &ConversationEvent::NewMessage(view.clone()));
        self.notify_offline(&view).await;

        log::debug!(
            "User {} sent message {} in conversation {}",
            user_id,
            view.id,
            conversation_id
        );

        if view.is_encrypted {
            Ok(view.with_plaintext(text.to_string()))
        } else {
            Ok(view)
        }
    }

    /// Write a notification for every other participant who is not online.
    async fn notify_offline(&self, message: &MessageView) {
        let recipients = match self.store.participant_ids(message.conversation_id).await {
            Ok(ids) => ids,
            Err(e) => {
                log::warn!(
                    "Skipping notifications for message {}: {}",
                    message.id,
                    e
                );
                return;
            }
        };

        let sender_name = match self.accounts.display_name(message.sender_id).await {
            Ok(Some(name)) => name,
            Ok(None) => "Someone".to_string(),
            Err(e) => {
                log::warn!("Failed to load sender {}: {}", message.sender_id, e);
                "Someone".to_string()
            }
        };

        let preview = match &message.text {
            Some(text) if !message.is_encrypted => {
                let mut preview: String = text.chars().take(PREVIEW_CHARS).collect();
                if text.chars().count() > PREVIEW_CHARS {
                    preview.push_str("...");
                }
                preview
            }
            _ => "Encrypted message".to_string(),
        };

        for recipient in recipients {
            if recipient == message.sender_id || self.presence.is_online(recipient) {
                continue;
            }

            let notification = NewNotification {
                user_id: recipient,
                title: format!("New message from {}", sender_name),
                message: preview.clone(),
                url: Some(format!("/conversations/{}", message.conversation_id)),
                source_user_id: Some(message.sender_id),
                source_content_id: Some(message.id),
            };

            if let Err(e) = self.notifier.emit(notification).await {
                log::warn!(
                    "Failed to notify user {} of message {}: {}",
                    recipient,
                    message.id,
                    e
                );
            }
        }
    }

    /// Seal an existing plaintext message. Only its sender may do this.
    pub async fn encrypt_message(
        &self,
        caller: Caller,
        message_id: i32,
        secret: &str,
    ) -> MessagingResult<MessageView> {
        let user_id = caller.require_login()?;
        let message = self.store.get_message(message_id).await?;
        self.store
            .ensure_participant(message.conversation_id, user_id)
            .await?;

        if message.user_id != user_id {
            return Err(MessagingError::Forbidden);
        }
        if message.deleted_at.is_some() {
            return Err(MessagingError::NotFound);
        }
        if message.is_encrypted {
            return Err(MessagingError::InvalidState(
                "message is already encrypted".to_string(),
            ));
        }

        let text = message.text.clone().ok_or_else(|| {
            MessagingError::InvalidState("message has no text to encrypt".to_string())
        })?;

        let sealed = self.seal_text(user_id, &text, secret).await?;
        let message = self.store.seal_message(message_id, sealed).await?;

        Ok(MessageView::from(message).with_plaintext(text))
    }

    /// Open a sealed message with the secret it was sealed with.
    ///
    /// `salt` defaults to the one stored with the message. A wrong secret
    /// and a tampered message fail the same way.
    pub async fn decrypt_message(
        &self,
        caller: Caller,
        message_id: i32,
        secret: &str,
        salt: Option<&str>,
    ) -> MessagingResult<DecryptedMessage> {
        let user_id = caller.require_login()?;
        let message = self.store.get_message(message_id).await?;
        self.store
            .ensure_participant(message.conversation_id, user_id)
            .await?;

        if !message.is_encrypted {
            return Err(MessagingError::InvalidState(
                "message is not encrypted".to_string(),
            ));
        }

        // Fingerprint check comes before any key derivation
        match &message.encryption_key_hash {
            Some(stored) if crypto::verify_fingerprint(secret, stored) => {}
            _ => return Err(MessagingError::Authentication),
        }

        let salt = match salt.or(message.encryption_salt.as_deref()) {
            Some(salt) => crypto::decode(salt)?,
            None => return Err(MessagingError::Authentication),
        };
        if salt.len() != crypto::SALT_SIZE {
            return Err(MessagingError::Authentication);
        }

        let (ciphertext, iv, auth_tag) = match (
            &message.encrypted_text,
            &message.encryption_iv,
            &message.encryption_tag,
        ) {
            (Some(ciphertext), Some(iv), Some(tag)) => (
                crypto::decode(ciphertext)?,
                crypto::decode(iv)?,
                crypto::decode(tag)?,
            ),
            _ => return Err(MessagingError::Authentication),
        };

        // Anything the caller supplied that cannot yield a key is a failed decrypt
        let key = self.derive_key(secret, salt).await.map_err(|e| match e {
            MessagingError::TransientIo(_) => e,
            _ => MessagingError::Authentication,
        })?;
        let text = crypto::open(&ciphertext, &iv, &auth_tag, &key)?;

        Ok(DecryptedMessage { message_id, text })
    }

    /// Load a message a recipient is acknowledging.
    async fn load_for_receipt(&self, user_id: i32, message_id: i32) -> MessagingResult<Message> {
        let message = self.store.get_message(message_id).await?;
        self.store
            .ensure_participant(message.conversation_id, user_id)
            .await?;

        if message.user_id == user_id {
            return Err(MessagingError::InvalidState(
                "cannot acknowledge your own message".to_string(),
            ));
        }

        Ok(message)
    }

    pub async fn mark_delivered(
        &self,
        caller: Caller,
        message_id: i32,
    ) -> MessagingResult<MessageView> {
        let user_id = caller.require_login()?;
        let before = self.load_for_receipt(user_id, message_id).await?;
        let after = self.store.mark_delivered(message_id).await?;

        if before.delivered_at.is_none() {
            self.fanout.publish(
                after.conversation_id,
                &ConversationEvent::MessageDelivered(Receipt {
                    message_id,
                    at: after.delivered_at,
                }),
            );
        }

        Ok(MessageView::from(after))
    }

    pub async fn mark_read(&self, caller: Caller, message_id: i32) -> MessagingResult<MessageView> {
        let user_id = caller.require_login()?;
        let before = self.load_for_receipt(user_id, message_id).await?;
        let after = self.store.mark_read(message_id).await?;

        if before.delivered_at.is_none() {
            self.fanout.publish(
                after.conversation_id,
                &ConversationEvent::MessageDelivered(Receipt {
                    message_id,
                    at: after.delivered_at,
                }),
            );
        }
        if before.read_at.is_none() {
            self.fanout.publish(
                after.conversation_id,
                &ConversationEvent::MessageRead(Receipt {
                    message_id,
                    at: after.read_at,
                }),
            );
        }

        Ok(MessageView::from(after))
    }

    pub async fn leave_conversation(
        &self,
        caller: Caller,
        conversation_id: i32,
    ) -> MessagingResult<()> {
        let user_id = caller.require_login()?;
        self.store
            .leave_conversation(conversation_id, user_id)
            .await?;

        self.fanout.publish(
            conversation_id,
            &ConversationEvent::ParticipantLeft {
                user_id,
                conversation_id,
            },
        );

        Ok(())
    }

    /// Hide or unhide the conversation in the caller's own list.
    pub async fn hide_conversation(
        &self,
        caller: Caller,
        conversation_id: i32,
        hidden: bool,
    ) -> MessagingResult<()> {
        let user_id = caller.require_login()?;
        self.store
            .set_hidden(conversation_id, user_id, hidden)
            .await?;
        Ok(())
    }

    pub async fn list_conversations(
        &self,
        caller: Caller,
    ) -> MessagingResult<Vec<ConversationSummary>> {
        let user_id = caller.require_login()?;
        self.store.list_for_user(user_id).await
    }

    /// A page of messages, oldest first. Viewing stamps the caller's last-seen time.
    pub async fn list_messages(
        &self,
        caller: Caller,
        conversation_id: i32,
        limit: Option<u64>,
        before_id: Option<i32>,
    ) -> MessagingResult<Vec<MessageView>> {
        let user_id = caller.require_login()?;
        let limit = limit
            .unwrap_or(self.config.page_size)
            .clamp(1, self.config.max_page_size);

        let messages = self
            .store
            .list_messages(conversation_id, user_id, limit, before_id)
            .await?;

        if let Err(e) = self.store.touch_last_seen(conversation_id, user_id).await {
            log::warn!(
                "Failed to stamp last seen for user {} in conversation {}: {}",
                user_id,
                conversation_id,
                e
            );
        }

        Ok(messages.into_iter().map(MessageView::from).collect())
    }

    pub async fn set_typing(
        &self,
        caller: Caller,
        conversation_id: i32,
        is_typing: bool,
    ) -> MessagingResult<()> {
        let user_id = caller.require_login()?;
        self.store
            .set_typing(conversation_id, user_id, is_typing)
            .await?;

        self.fanout.publish(
            conversation_id,
            &ConversationEvent::Typing {
                user_id,
                conversation_id,
                is_typing,
            },
        );

        Ok(())
    }

    /// Other participants currently typing. Stale flags are ignored.
    pub async fn typing_users(
        &self,
        caller: Caller,
        conversation_id: i32,
    ) -> MessagingResult<Vec<i32>> {
        let user_id = caller.require_login()?;
        self.store
            .ensure_participant(conversation_id, user_id)
            .await?;

        let timeout =
            chrono::Duration::seconds(self.presence.config().typing_timeout_secs as i64);
        let at = now();

        Ok(self
            .store
            .participants(conversation_id)
            .await?
            .into_iter()
            .filter(|p| p.user_id != user_id && p.is_typing_at(at, timeout))
            .map(|p| p.user_id)
            .collect())
    }

    pub async fn update_presence(&self, caller: Caller, online: bool) -> MessagingResult<()> {
        let user_id = caller.require_login()?;
        self.presence.set_online(user_id, online).await;
        Ok(())
    }

    pub async fn heartbeat(&self, caller: Caller) -> MessagingResult<()> {
        let user_id = caller.require_login()?;
        self.presence.heartbeat(user_id).await;
        Ok(())
    }

    pub async fn get_presence(
        &self,
        caller: Caller,
        subject_id: i32,
    ) -> MessagingResult<PresenceView> {
        let user_id = caller.require_login()?;
        self.presence.get_presence(user_id, subject_id).await
    }

    /// Change whether the caller's online status is visible to others.
    pub async fn set_show_online(&self, caller: Caller, show: bool) -> MessagingResult<()> {
        let user_id = caller.require_login()?;
        self.accounts.set_show_online(user_id, show).await?;
        Ok(())
    }
}
