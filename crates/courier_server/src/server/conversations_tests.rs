#![forbid(unsafe_code)]

use courier_domain::{ConversationId, DeleteScope, EDIT_WINDOW_MS, Message, MessageId, UserId};

use crate::server::conversations::{ConversationSettings, ConversationStore, OpError};
use crate::server::store::MessageStore;

fn user(id: &str) -> UserId {
	UserId::new(id).expect("valid user id")
}

fn store() -> ConversationStore {
	ConversationStore::new(MessageStore::disabled(), ConversationSettings::default())
}

fn message(sender: &UserId, recipient: &UserId, content: &str, created_at_ms: i64) -> Message {
	Message {
		id: MessageId::new_v4(),
		conversation_id: ConversationId::for_pair(sender, recipient),
		sender_id: sender.clone(),
		recipient_id: recipient.clone(),
		content: content.to_string(),
		created_at_unix_ms: created_at_ms,
		read: false,
		reply_to: None,
		edited: false,
		edited_at_unix_ms: None,
		reactions: Vec::new(),
		deleted_for_everyone: false,
	}
}

#[tokio::test]
async fn open_is_idempotent_for_either_participant() {
	let store = store();
	let alice = user("alice");
	let bob = user("bob");

	let (id_a, _) = store.open(&alice, &bob).await;
	let (id_b, _) = store.open(&bob, &alice).await;
	assert_eq!(id_a, id_b);
}

#[tokio::test]
async fn append_then_open_returns_history() {
	let store = store();
	let alice = user("alice");
	let bob = user("bob");

	store.append(message(&alice, &bob, "first", 1_000)).await;
	store.append(message(&alice, &bob, "second", 2_000)).await;

	let (_, history) = store.open(&bob, &alice).await;
	assert_eq!(history.len(), 2);
	assert_eq!(history[0].content, "first");
	assert_eq!(history[1].content, "second");
}

#[tokio::test]
async fn retention_cap_evicts_oldest() {
	let store = ConversationStore::new(
		MessageStore::disabled(),
		ConversationSettings {
			retention_cap: 3,
			history_limit: 50,
		},
	);
	let alice = user("alice");
	let bob = user("bob");

	for i in 0..5 {
		store.append(message(&alice, &bob, &format!("m{i}"), i)).await;
	}

	let (_, history) = store.open(&alice, &bob).await;
	assert_eq!(history.len(), 3);
	assert_eq!(history[0].content, "m2");
	assert_eq!(history[2].content, "m4");
}

#[tokio::test]
async fn retention_eviction_unindexes_old_messages() {
	let store = ConversationStore::new(
		MessageStore::disabled(),
		ConversationSettings {
			retention_cap: 2,
			history_limit: 50,
		},
	);
	let alice = user("alice");
	let bob = user("bob");

	let first = message(&alice, &bob, "m0", 0);
	let first_id = first.id;
	store.append(first).await;
	store.append(message(&alice, &bob, "m1", 1)).await;

	let last = message(&alice, &bob, "m2", 2);
	let last_id = last.id;
	store.append(last).await;

	// The evicted message is no longer addressable by id.
	assert!(store.find_message(&first_id).await.is_none());
	assert!(matches!(store.mark_read(&bob, &first_id).await, Err(OpError::MessageNotFound)));

	assert!(store.find_message(&last_id).await.is_some());
}

#[tokio::test]
async fn self_deletions_survive_restart_for_either_open_order() {
	let url = format!(
		"sqlite:file:restart_{}?mode=memory&cache=shared",
		uuid::Uuid::new_v4().simple()
	);
	let durable = MessageStore::connect(&url).await.expect("connect sqlite");
	let store = ConversationStore::new(durable, ConversationSettings::default());
	let alice = user("alice");
	let bob = user("bob");

	let kept = message(&alice, &bob, "kept", 1_000);
	let dropped = message(&alice, &bob, "dropped", 2_000);
	let dropped_id = dropped.id;
	store.append(kept).await;
	store.append(dropped).await;
	store
		.delete_message(&alice, &dropped_id, DeleteScope::SelfOnly)
		.await
		.expect("delete");

	// Restart with the deleting side opening first.
	let restarted = ConversationStore::new(
		MessageStore::connect(&url).await.expect("reconnect"),
		ConversationSettings::default(),
	);
	let (_, for_alice) = restarted.open(&alice, &bob).await;
	assert_eq!(for_alice.len(), 1);
	assert_eq!(for_alice[0].content, "kept");

	let (_, for_bob) = restarted.open(&bob, &alice).await;
	assert_eq!(for_bob.len(), 2);

	// Restart again with the other side opening first.
	let restarted = ConversationStore::new(
		MessageStore::connect(&url).await.expect("reconnect"),
		ConversationSettings::default(),
	);
	let (_, for_bob) = restarted.open(&bob, &alice).await;
	assert_eq!(for_bob.len(), 2);

	let (_, for_alice) = restarted.open(&alice, &bob).await;
	assert_eq!(for_alice.len(), 1);
	assert_eq!(for_alice[0].content, "kept");
}

#[tokio::test]
async fn mark_read_requires_recipient() {
	let store = store();
	let alice = user("alice");
	let bob = user("bob");

	let msg = message(&alice, &bob, "hi", 1_000);
	let id = msg.id;
	store.append(msg).await;

	assert!(matches!(store.mark_read(&alice, &id).await, Err(OpError::NotRecipient)));

	let updated = store.mark_read(&bob, &id).await.expect("mark read");
	assert!(updated.read);
}

#[tokio::test]
async fn mark_read_unknown_message_is_rejected() {
	let store = store();
	let bob = user("bob");
	let unknown = MessageId::new_v4();

	assert!(matches!(store.mark_read(&bob, &unknown).await, Err(OpError::MessageNotFound)));
}

#[tokio::test]
async fn edit_enforces_sender_and_window() {
	let store = store();
	let alice = user("alice");
	let bob = user("bob");

	let msg = message(&alice, &bob, "draft", 1_000);
	let id = msg.id;
	store.append(msg).await;

	assert!(matches!(
		store.edit(&bob, &id, "hijack".to_string(), 2_000).await,
		Err(OpError::NotSender)
	));

	assert!(matches!(
		store.edit(&alice, &id, "too late".to_string(), 1_000 + EDIT_WINDOW_MS).await,
		Err(OpError::EditWindowElapsed)
	));

	let updated = store
		.edit(&alice, &id, "fixed".to_string(), 1_000 + EDIT_WINDOW_MS - 1)
		.await
		.expect("edit");
	assert_eq!(updated.content, "fixed");
	assert!(updated.edited);
	assert_eq!(updated.edited_at_unix_ms, Some(1_000 + EDIT_WINDOW_MS - 1));
}

#[tokio::test]
async fn reactions_are_unique_per_user_and_token() {
	let store = store();
	let alice = user("alice");
	let bob = user("bob");

	let msg = message(&alice, &bob, "hi", 1_000);
	let id = msg.id;
	store.append(msg).await;

	let (updated, reaction) = store.add_reaction(&bob, &id, "👍", 2_000).await.expect("add");
	assert_eq!(updated.reactions.len(), 1);
	assert_eq!(reaction.token, "👍");

	assert!(matches!(
		store.add_reaction(&bob, &id, "👍", 2_500).await,
		Err(OpError::DuplicateReaction)
	));

	// Same token from the other participant is a distinct reaction.
	let (updated, _) = store.add_reaction(&alice, &id, "👍", 3_000).await.expect("add");
	assert_eq!(updated.reactions.len(), 2);

	let updated = store.remove_reaction(&bob, &id, "👍").await.expect("remove");
	assert_eq!(updated.reactions.len(), 1);

	assert!(matches!(
		store.remove_reaction(&bob, &id, "👍").await,
		Err(OpError::NoSuchReaction)
	));
}

#[tokio::test]
async fn reaction_token_is_validated() {
	let store = store();
	let alice = user("alice");
	let bob = user("bob");

	let msg = message(&alice, &bob, "hi", 1_000);
	let id = msg.id;
	store.append(msg).await;

	assert!(matches!(
		store.add_reaction(&bob, &id, "", 2_000).await,
		Err(OpError::InvalidReaction(_))
	));
	assert!(matches!(
		store.add_reaction(&bob, &id, "definitely-too-long", 2_000).await,
		Err(OpError::InvalidReaction(_))
	));
}

#[tokio::test]
async fn non_participant_cannot_react() {
	let store = store();
	let alice = user("alice");
	let bob = user("bob");
	let mallory = user("mallory");

	let msg = message(&alice, &bob, "hi", 1_000);
	let id = msg.id;
	store.append(msg).await;

	assert!(matches!(
		store.add_reaction(&mallory, &id, "👍", 2_000).await,
		Err(OpError::NotParticipant)
	));
}

#[tokio::test]
async fn self_delete_hides_only_for_requester() {
	let store = store();
	let alice = user("alice");
	let bob = user("bob");

	let msg = message(&alice, &bob, "oops", 1_000);
	let id = msg.id;
	store.append(msg).await;

	store.delete_message(&bob, &id, DeleteScope::SelfOnly).await.expect("delete");

	let (_, for_bob) = store.open(&bob, &alice).await;
	assert!(for_bob.is_empty());

	let (_, for_alice) = store.open(&alice, &bob).await;
	assert_eq!(for_alice.len(), 1);
}

#[tokio::test]
async fn delete_for_everyone_requires_sender() {
	let store = store();
	let alice = user("alice");
	let bob = user("bob");

	let msg = message(&alice, &bob, "secret", 1_000);
	let id = msg.id;
	store.append(msg).await;

	assert!(matches!(
		store.delete_message(&bob, &id, DeleteScope::Everyone).await,
		Err(OpError::NotSender)
	));

	let (deleted, other) = store.delete_message(&alice, &id, DeleteScope::Everyone).await.expect("delete");
	assert!(deleted.deleted_for_everyone);
	assert_eq!(other, bob);

	let (_, for_bob) = store.open(&bob, &alice).await;
	assert!(for_bob.is_empty());
}

#[tokio::test]
async fn self_deleted_conversation_reappears_on_new_message() {
	let store = store();
	let alice = user("alice");
	let bob = user("bob");

	store.append(message(&alice, &bob, "old", 1_000)).await;

	let (conversation_id, _) = store.open(&bob, &alice).await;
	store
		.delete_conversation(&bob, &conversation_id, DeleteScope::SelfOnly)
		.await
		.expect("delete");

	let (_, hidden) = store.open(&bob, &alice).await;
	assert!(hidden.is_empty());

	store.append(message(&alice, &bob, "new", 2_000)).await;

	let (_, visible) = store.open(&bob, &alice).await;
	assert_eq!(visible.len(), 1);
	assert_eq!(visible[0].content, "new");

	// The other side never lost anything.
	let (_, for_alice) = store.open(&alice, &bob).await;
	assert_eq!(for_alice.len(), 2);
}

#[tokio::test]
async fn delete_conversation_for_everyone_evicts_state() {
	let store = store();
	let alice = user("alice");
	let bob = user("bob");

	let msg = message(&alice, &bob, "gone", 1_000);
	let id = msg.id;
	store.append(msg).await;

	let (conversation_id, _) = store.open(&alice, &bob).await;
	let other = store
		.delete_conversation(&alice, &conversation_id, DeleteScope::Everyone)
		.await
		.expect("delete");
	assert_eq!(other, bob);

	assert!(store.find_message(&id).await.is_none());

	let (_, history) = store.open(&bob, &alice).await;
	assert!(history.is_empty());
}

#[tokio::test]
async fn delete_conversation_requires_participant() {
	let store = store();
	let alice = user("alice");
	let bob = user("bob");
	let mallory = user("mallory");

	store.append(message(&alice, &bob, "hi", 1_000)).await;
	let (conversation_id, _) = store.open(&alice, &bob).await;

	assert!(matches!(
		store.delete_conversation(&mallory, &conversation_id, DeleteScope::Everyone).await,
		Err(OpError::NotParticipant)
	));
}
