/// Integration tests for the conversation store
/// Tests membership, ordering, receipts, hiding and per-user soft deletes
mod common;

use bazaar_messaging::conversations::{
    advance_last_message_at, ConversationStore, MessageContent, SealedContent,
};
use bazaar_messaging::error::MessagingError;
use bazaar_messaging::orm::{conversation_participants, encryption_keys, private_messages};
use common::{database::*, fixtures::*};
use sea_orm::{entity::*, PaginatorTrait, QueryFilter};
use std::time::Duration;

fn plain(text: &str) -> MessageContent {
    MessageContent::Plain(text.to_string())
}

fn sealed_stub(hash: &str) -> SealedContent {
    SealedContent {
        encrypted_text: "Y2lwaGVy".to_string(),
        key_hash: hash.to_string(),
        salt: "c2FsdHNhbHRzYWx0c2FsdA==".to_string(),
        iv: "aXZpdml2aXZpdml2".to_string(),
        auth_tag: "dGFndGFndGFndGFndGFnIQ==".to_string(),
    }
}

#[actix_rt::test]
async fn test_create_conversation() {
    let test_db = setup_test_database().await.expect("Failed to set up database");
    let db = &test_db.db;
    let store = ConversationStore::new(db.clone());

    let alice = create_test_user(db, "alice").await.unwrap();
    let bob = create_test_user(db, "bob").await.unwrap();
    let carol = create_test_user(db, "carol").await.unwrap();

    // Duplicates and the creator in the list are ignored
    let conv = store
        .create_conversation(
            alice.id,
            &[bob.id, carol.id, bob.id, alice.id],
            Some("Vintage lamp"),
            Some("product:77"),
        )
        .await
        .expect("Failed to create conversation");

    assert_eq!(conv.title.as_deref(), Some("Vintage lamp"));
    assert_eq!(conv.subject_ref.as_deref(), Some("product:77"));
    assert!(conv.last_message_at.is_none());
    assert!(!conv.is_active);

    let mut ids = store.participant_ids(conv.id).await.unwrap();
    ids.sort_unstable();
    let mut expected = vec![alice.id, bob.id, carol.id];
    expected.sort_unstable();
    assert_eq!(ids, expected);
}

#[actix_rt::test]
async fn test_create_conversation_needs_someone_else() {
    let test_db = setup_test_database().await.unwrap();
    let store = ConversationStore::new(test_db.db.clone());
    let alice = create_test_user(&test_db.db, "alice").await.unwrap();

    let result = store
        .create_conversation(alice.id, &[alice.id], None, None)
        .await;
    assert!(matches!(result, Err(MessagingError::InvalidState(_))));

    let result = store.create_conversation(alice.id, &[], None, None).await;
    assert!(matches!(result, Err(MessagingError::InvalidState(_))));
}

#[actix_rt::test]
async fn test_ensure_participant() {
    let test_db = setup_test_database().await.unwrap();
    let db = &test_db.db;
    let store = ConversationStore::new(db.clone());

    let alice = create_test_user(db, "alice").await.unwrap();
    let bob = create_test_user(db, "bob").await.unwrap();
    let mallory = create_test_user(db, "mallory").await.unwrap();

    let conv = store
        .create_conversation(alice.id, &[bob.id], None, None)
        .await
        .unwrap();

    let participant = store.ensure_participant(conv.id, bob.id).await.unwrap();
    assert_eq!(participant.user_id, bob.id);
    assert!(participant.is_active());

    assert_eq!(
        store.ensure_participant(conv.id, mallory.id).await.unwrap_err(),
        MessagingError::Forbidden
    );
    assert_eq!(
        store.ensure_participant(conv.id + 100, alice.id).await.unwrap_err(),
        MessagingError::NotFound
    );

    // Leaving revokes access
    store.leave_conversation(conv.id, bob.id).await.unwrap();
    assert_eq!(
        store.ensure_participant(conv.id, bob.id).await.unwrap_err(),
        MessagingError::Forbidden
    );
    assert_eq!(
        store
            .append_message(conv.id, bob.id, plain("still here?"))
            .await
            .unwrap_err(),
        MessagingError::Forbidden
    );
}

#[actix_rt::test]
async fn test_append_message_ordering() {
    let test_db = setup_test_database().await.unwrap();
    let db = &test_db.db;
    let store = ConversationStore::new(db.clone());

    let alice = create_test_user(db, "alice").await.unwrap();
    let bob = create_test_user(db, "bob").await.unwrap();
    let conv = store
        .create_conversation(alice.id, &[bob.id], None, None)
        .await
        .unwrap();

    let mut sent = Vec::new();
    for (i, sender) in [alice.id, bob.id, alice.id, bob.id].iter().enumerate() {
        let message = store
            .append_message(conv.id, *sender, plain(&format!("message {}", i)))
            .await
            .expect("Failed to append message");
        sent.push(message);
    }

    for pair in sent.windows(2) {
        assert!(pair[0].created_at <= pair[1].created_at);
        assert!(pair[0].id < pair[1].id);
    }

    let conv = store.get_conversation(conv.id).await.unwrap();
    assert!(conv.is_active);
    assert_eq!(conv.last_message_at, Some(sent[3].created_at));

    let listed = store.list_messages(conv.id, bob.id, 50, None).await.unwrap();
    let listed_ids: Vec<i32> = listed.iter().map(|m| m.id).collect();
    let sent_ids: Vec<i32> = sent.iter().map(|m| m.id).collect();
    assert_eq!(listed_ids, sent_ids);
    assert_eq!(listed[0].text.as_deref(), Some("message 0"));
    assert!(!listed[0].is_encrypted);
}

#[actix_rt::test]
async fn test_last_message_at_never_moves_backwards() {
    let test_db = setup_test_database().await.unwrap();
    let db = &test_db.db;
    let store = ConversationStore::new(db.clone());

    let alice = create_test_user(db, "alice").await.unwrap();
    let bob = create_test_user(db, "bob").await.unwrap();
    let conv = store
        .create_conversation(alice.id, &[bob.id], None, None)
        .await
        .unwrap();

    let first = store
        .append_message(conv.id, alice.id, plain("first"))
        .await
        .unwrap();
    let second = store
        .append_message(conv.id, bob.id, plain("second"))
        .await
        .unwrap();

    // The first append committing late must not rewind the conversation
    let moved = advance_last_message_at(db, conv.id, first.created_at - chrono::Duration::seconds(1))
        .await
        .unwrap();
    assert!(!moved);
    let conv_after = store.get_conversation(conv.id).await.unwrap();
    assert_eq!(conv_after.last_message_at, Some(second.created_at));

    let later = second.created_at + chrono::Duration::seconds(5);
    assert!(advance_last_message_at(db, conv.id, later).await.unwrap());
    let conv_after = store.get_conversation(conv.id).await.unwrap();
    assert_eq!(conv_after.last_message_at, Some(later));

    // Appending after a later stamp keeps ordering monotonic
    let third = store
        .append_message(conv.id, alice.id, plain("third"))
        .await
        .unwrap();
    assert!(third.created_at >= later);
    let conv_after = store.get_conversation(conv.id).await.unwrap();
    assert_eq!(conv_after.last_message_at, Some(third.created_at));
}

#[actix_rt::test]
async fn test_append_clears_sender_typing() {
    let test_db = setup_test_database().await.unwrap();
    let db = &test_db.db;
    let store = ConversationStore::new(db.clone());

    let alice = create_test_user(db, "alice").await.unwrap();
    let bob = create_test_user(db, "bob").await.unwrap();
    let conv = store
        .create_conversation(alice.id, &[bob.id], None, None)
        .await
        .unwrap();

    let typing = store.set_typing(conv.id, alice.id, true).await.unwrap();
    assert!(typing.is_typing);
    assert!(typing.last_typing_at.is_some());

    store
        .append_message(conv.id, alice.id, plain("done typing"))
        .await
        .unwrap();

    let participant = store.ensure_participant(conv.id, alice.id).await.unwrap();
    assert!(!participant.is_typing);
}

#[actix_rt::test]
async fn test_list_messages_paging() {
    let test_db = setup_test_database().await.unwrap();
    let db = &test_db.db;
    let store = ConversationStore::new(db.clone());

    let alice = create_test_user(db, "alice").await.unwrap();
    let bob = create_test_user(db, "bob").await.unwrap();
    let conv = store
        .create_conversation(alice.id, &[bob.id], None, None)
        .await
        .unwrap();

    let mut ids = Vec::new();
    for i in 0..5 {
        let message = store
            .append_message(conv.id, alice.id, plain(&format!("m{}", i)))
            .await
            .unwrap();
        ids.push(message.id);
    }

    // Latest page, oldest first
    let page = store.list_messages(conv.id, bob.id, 2, None).await.unwrap();
    assert_eq!(page.iter().map(|m| m.id).collect::<Vec<_>>(), ids[3..].to_vec());

    // Older page
    let page = store
        .list_messages(conv.id, bob.id, 2, Some(ids[3]))
        .await
        .unwrap();
    assert_eq!(page.iter().map(|m| m.id).collect::<Vec<_>>(), ids[1..3].to_vec());
}

#[actix_rt::test]
async fn test_list_for_user_ordering() {
    let test_db = setup_test_database().await.unwrap();
    let db = &test_db.db;
    let store = ConversationStore::new(db.clone());

    let alice = create_test_user(db, "alice").await.unwrap();
    let bob = create_test_user(db, "bob").await.unwrap();
    let carol = create_test_user(db, "carol").await.unwrap();

    let older = store
        .create_conversation(alice.id, &[bob.id], Some("older"), None)
        .await
        .unwrap();
    let newer = store
        .create_conversation(alice.id, &[carol.id], Some("newer"), None)
        .await
        .unwrap();
    let silent = store
        .create_conversation(alice.id, &[bob.id, carol.id], Some("silent"), None)
        .await
        .unwrap();

    store
        .append_message(older.id, alice.id, plain("first"))
        .await
        .unwrap();
    actix_rt::time::sleep(Duration::from_millis(20)).await;
    store
        .append_message(newer.id, carol.id, plain("second"))
        .await
        .unwrap();

    let listed: Vec<i32> = store
        .list_for_user(alice.id)
        .await
        .unwrap()
        .iter()
        .map(|c| c.id)
        .collect();
    assert_eq!(listed, vec![newer.id, older.id, silent.id]);

    let bob_list = store.list_for_user(bob.id).await.unwrap();
    assert_eq!(bob_list.len(), 2);
    assert_eq!(bob_list[0].id, older.id);
    assert_eq!(bob_list[0].participant_ids.len(), 2);
}

#[actix_rt::test]
async fn test_hide_is_per_user() {
    let test_db = setup_test_database().await.unwrap();
    let db = &test_db.db;
    let store = ConversationStore::new(db.clone());

    let alice = create_test_user(db, "alice").await.unwrap();
    let bob = create_test_user(db, "bob").await.unwrap();
    let conv = store
        .create_conversation(alice.id, &[bob.id], None, None)
        .await
        .unwrap();

    store.set_hidden(conv.id, alice.id, true).await.unwrap();

    assert!(store.list_for_user(alice.id).await.unwrap().is_empty());
    assert_eq!(store.list_for_user(bob.id).await.unwrap().len(), 1);

    // Hidden is not left: alice can still read the thread
    assert!(store.list_messages(conv.id, alice.id, 10, None).await.is_ok());

    store.set_hidden(conv.id, alice.id, false).await.unwrap();
    assert_eq!(store.list_for_user(alice.id).await.unwrap().len(), 1);
}

#[actix_rt::test]
async fn test_new_message_unhides_for_everyone() {
    let test_db = setup_test_database().await.unwrap();
    let db = &test_db.db;
    let store = ConversationStore::new(db.clone());

    let alice = create_test_user(db, "alice").await.unwrap();
    let bob = create_test_user(db, "bob").await.unwrap();
    let conv = store
        .create_conversation(alice.id, &[bob.id], None, None)
        .await
        .unwrap();

    store.set_hidden(conv.id, alice.id, true).await.unwrap();
    store.set_hidden(conv.id, bob.id, true).await.unwrap();
    assert!(store.list_for_user(alice.id).await.unwrap().is_empty());
    assert!(store.list_for_user(bob.id).await.unwrap().is_empty());

    store
        .append_message(conv.id, bob.id, plain("are you still selling it?"))
        .await
        .unwrap();

    assert_eq!(store.list_for_user(alice.id).await.unwrap().len(), 1);
    assert_eq!(store.list_for_user(bob.id).await.unwrap().len(), 1);

    let hidden_rows = conversation_participants::Entity::find()
        .filter(conversation_participants::Column::ConversationId.eq(conv.id))
        .filter(conversation_participants::Column::IsHidden.eq(true))
        .count(db)
        .await
        .unwrap();
    assert_eq!(hidden_rows, 0);
}

#[actix_rt::test]
async fn test_mark_delivered_is_idempotent() {
    let test_db = setup_test_database().await.unwrap();
    let db = &test_db.db;
    let store = ConversationStore::new(db.clone());

    let alice = create_test_user(db, "alice").await.unwrap();
    let bob = create_test_user(db, "bob").await.unwrap();
    let conv = store
        .create_conversation(alice.id, &[bob.id], None, None)
        .await
        .unwrap();
    let message = store
        .append_message(conv.id, alice.id, plain("hi"))
        .await
        .unwrap();

    let first = store.mark_delivered(message.id).await.unwrap();
    let delivered_at = first.delivered_at.expect("delivered_at should be set");
    assert!(message.created_at <= delivered_at);
    assert!(first.read_at.is_none());

    actix_rt::time::sleep(Duration::from_millis(10)).await;
    let second = store.mark_delivered(message.id).await.unwrap();
    assert_eq!(second.delivered_at, Some(delivered_at));

    assert_eq!(
        store.mark_delivered(message.id + 100).await.unwrap_err(),
        MessagingError::NotFound
    );
}

#[actix_rt::test]
async fn test_mark_read_before_delivered_stamps_both() {
    let test_db = setup_test_database().await.unwrap();
    let db = &test_db.db;
    let store = ConversationStore::new(db.clone());

    let alice = create_test_user(db, "alice").await.unwrap();
    let bob = create_test_user(db, "bob").await.unwrap();
    let conv = store
        .create_conversation(alice.id, &[bob.id], None, None)
        .await
        .unwrap();
    let message = store
        .append_message(conv.id, alice.id, plain("hi"))
        .await
        .unwrap();

    let read = store.mark_read(message.id).await.unwrap();
    let delivered_at = read.delivered_at.expect("read implies delivered");
    let read_at = read.read_at.expect("read_at should be set");
    assert!(message.created_at <= delivered_at);
    assert!(delivered_at <= read_at);

    // Both calls are no-ops now
    actix_rt::time::sleep(Duration::from_millis(10)).await;
    let again = store.mark_read(message.id).await.unwrap();
    assert_eq!(again.read_at, Some(read_at));
    let delivered = store.mark_delivered(message.id).await.unwrap();
    assert_eq!(delivered.delivered_at, Some(delivered_at));
}

#[actix_rt::test]
async fn test_mark_read_after_delivered_keeps_delivery_time() {
    let test_db = setup_test_database().await.unwrap();
    let db = &test_db.db;
    let store = ConversationStore::new(db.clone());

    let alice = create_test_user(db, "alice").await.unwrap();
    let bob = create_test_user(db, "bob").await.unwrap();
    let conv = store
        .create_conversation(alice.id, &[bob.id], None, None)
        .await
        .unwrap();
    let message = store
        .append_message(conv.id, alice.id, plain("hi"))
        .await
        .unwrap();

    let delivered = store.mark_delivered(message.id).await.unwrap();
    actix_rt::time::sleep(Duration::from_millis(10)).await;
    let read = store.mark_read(message.id).await.unwrap();

    assert_eq!(read.delivered_at, delivered.delivered_at);
    assert!(read.delivered_at.unwrap() <= read.read_at.unwrap());
}

#[actix_rt::test]
async fn test_leave_soft_deletes_only_own_messages() {
    let test_db = setup_test_database().await.unwrap();
    let db = &test_db.db;
    let store = ConversationStore::new(db.clone());

    let alice = create_test_user(db, "alice").await.unwrap();
    let bob = create_test_user(db, "bob").await.unwrap();
    let conv = store
        .create_conversation(alice.id, &[bob.id], None, None)
        .await
        .unwrap();

    let from_alice = store
        .append_message(conv.id, alice.id, plain("from alice"))
        .await
        .unwrap();
    let from_bob = store
        .append_message(conv.id, bob.id, plain("from bob"))
        .await
        .unwrap();

    store.leave_conversation(conv.id, alice.id).await.unwrap();

    let alice_row = private_messages::Entity::find_by_id(from_alice.id)
        .one(db)
        .await
        .unwrap()
        .unwrap();
    let bob_row = private_messages::Entity::find_by_id(from_bob.id)
        .one(db)
        .await
        .unwrap()
        .unwrap();
    assert!(alice_row.deleted_at.is_some());
    assert!(bob_row.deleted_at.is_none());

    // Bob's view of the thread is intact
    let bob_view = store.list_messages(conv.id, bob.id, 50, None).await.unwrap();
    assert_eq!(bob_view.len(), 2);
    assert_eq!(store.list_for_user(bob.id).await.unwrap().len(), 1);

    // Alice is gone from it
    assert!(store.list_for_user(alice.id).await.unwrap().is_empty());
    assert_eq!(
        store
            .list_messages(conv.id, alice.id, 50, None)
            .await
            .unwrap_err(),
        MessagingError::Forbidden
    );
    assert_eq!(store.participant_ids(conv.id).await.unwrap(), vec![bob.id]);
}

#[actix_rt::test]
async fn test_seal_message() {
    let test_db = setup_test_database().await.unwrap();
    let db = &test_db.db;
    let store = ConversationStore::new(db.clone());

    let alice = create_test_user(db, "alice").await.unwrap();
    let bob = create_test_user(db, "bob").await.unwrap();
    let conv = store
        .create_conversation(alice.id, &[bob.id], None, None)
        .await
        .unwrap();
    let message = store
        .append_message(conv.id, alice.id, plain("secret address"))
        .await
        .unwrap();

    let sealed = store
        .seal_message(message.id, sealed_stub("fingerprint"))
        .await
        .unwrap();
    assert!(sealed.is_encrypted);
    assert!(sealed.text.is_none());
    assert_eq!(sealed.encryption_key_hash.as_deref(), Some("fingerprint"));
    assert!(sealed.encryption_salt.is_some());

    assert!(matches!(
        store.seal_message(message.id, sealed_stub("again")).await,
        Err(MessagingError::InvalidState(_))
    ));
    assert_eq!(
        store
            .seal_message(message.id + 100, sealed_stub("missing"))
            .await
            .unwrap_err(),
        MessagingError::NotFound
    );
}

#[actix_rt::test]
async fn test_append_sealed_message() {
    let test_db = setup_test_database().await.unwrap();
    let db = &test_db.db;
    let store = ConversationStore::new(db.clone());

    let alice = create_test_user(db, "alice").await.unwrap();
    let bob = create_test_user(db, "bob").await.unwrap();
    let conv = store
        .create_conversation(alice.id, &[bob.id], None, None)
        .await
        .unwrap();

    let message = store
        .append_message(conv.id, alice.id, MessageContent::Sealed(sealed_stub("fp")))
        .await
        .unwrap();

    assert!(message.is_encrypted);
    assert!(message.text.is_none());
    assert_eq!(message.encrypted_text.as_deref(), Some("Y2lwaGVy"));
}

#[actix_rt::test]
async fn test_message_bodies_are_stored_nullable() {
    let test_db = setup_test_database().await.unwrap();
    let db = &test_db.db;
    let store = ConversationStore::new(db.clone());

    let alice = create_test_user(db, "alice").await.unwrap();
    let bob = create_test_user(db, "bob").await.unwrap();
    let conv = store
        .create_conversation(alice.id, &[bob.id], None, None)
        .await
        .unwrap();

    let plain_msg = store
        .append_message(conv.id, alice.id, plain("hello"))
        .await
        .unwrap();
    let sealed_msg = store
        .append_message(conv.id, bob.id, MessageContent::Sealed(sealed_stub("fp")))
        .await
        .unwrap();

    // Read back through the entity so NULL columns round trip
    let stored_plain = private_messages::Entity::find_by_id(plain_msg.id)
        .one(db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored_plain.text.as_deref(), Some("hello"));
    assert!(stored_plain.encrypted_text.is_none());

    let stored_sealed = private_messages::Entity::find_by_id(sealed_msg.id)
        .one(db)
        .await
        .unwrap()
        .unwrap();
    assert!(stored_sealed.text.is_none());
    assert_eq!(stored_sealed.encrypted_text.as_deref(), Some("Y2lwaGVy"));
}

#[actix_rt::test]
async fn test_find_or_create_direct() {
    let test_db = setup_test_database().await.unwrap();
    let db = &test_db.db;
    let store = ConversationStore::new(db.clone());

    let alice = create_test_user(db, "alice").await.unwrap();
    let bob = create_test_user(db, "bob").await.unwrap();
    let carol = create_test_user(db, "carol").await.unwrap();

    let first = store
        .find_or_create_direct(alice.id, bob.id, Some("product:1"))
        .await
        .unwrap();
    let again = store
        .find_or_create_direct(bob.id, alice.id, Some("product:1"))
        .await
        .unwrap();
    assert_eq!(first.id, again.id);

    let other_subject = store
        .find_or_create_direct(alice.id, bob.id, Some("product:2"))
        .await
        .unwrap();
    assert_ne!(first.id, other_subject.id);

    // A group conversation is not a direct one
    let group = store
        .create_conversation(alice.id, &[bob.id, carol.id], None, None)
        .await
        .unwrap();
    let direct = store
        .find_or_create_direct(alice.id, carol.id, None)
        .await
        .unwrap();
    assert_ne!(group.id, direct.id);

    assert!(matches!(
        store.find_or_create_direct(alice.id, alice.id, None).await,
        Err(MessagingError::InvalidState(_))
    ));
}

#[actix_rt::test]
async fn test_record_key_fingerprint_once_per_secret() {
    let test_db = setup_test_database().await.unwrap();
    let db = &test_db.db;
    let store = ConversationStore::new(db.clone());
    let alice = create_test_user(db, "alice").await.unwrap();

    store.record_key_fingerprint(alice.id, "aaaa").await.unwrap();
    store.record_key_fingerprint(alice.id, "aaaa").await.unwrap();
    store.record_key_fingerprint(alice.id, "bbbb").await.unwrap();

    let keys = encryption_keys::Entity::find()
        .filter(encryption_keys::Column::UserId.eq(alice.id))
        .all(db)
        .await
        .unwrap();
    assert_eq!(keys.len(), 2);
    assert!(keys.iter().all(|k| k.is_active));
}

#[actix_rt::test]
async fn test_touch_last_seen_and_active_conversations() {
    let test_db = setup_test_database().await.unwrap();
    let db = &test_db.db;
    let store = ConversationStore::new(db.clone());

    let alice = create_test_user(db, "alice").await.unwrap();
    let bob = create_test_user(db, "bob").await.unwrap();
    let first = store
        .create_conversation(alice.id, &[bob.id], None, None)
        .await
        .unwrap();
    let second = store
        .create_conversation(bob.id, &[alice.id], None, None)
        .await
        .unwrap();

    store.touch_last_seen(first.id, alice.id).await.unwrap();
    let row = store.ensure_participant(first.id, alice.id).await.unwrap();
    assert!(row.last_seen_at.is_some());

    // Hidden conversations still count, left ones do not
    store.set_hidden(first.id, alice.id, true).await.unwrap();
    store.leave_conversation(second.id, alice.id).await.unwrap();
    assert_eq!(
        store.active_conversation_ids(alice.id).await.unwrap(),
        vec![first.id]
    );
}
