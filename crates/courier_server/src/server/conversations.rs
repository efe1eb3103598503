#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use courier_domain::{
	ConversationId, DeleteScope, Message, MessageId, ParseIdError, Reaction, UserId, validate_reaction_token,
};
use tokio::sync::Mutex;
use tracing::warn;

use crate::server::store::MessageStore;

/// Domain-level failure of a conversation operation.
///
/// These map one-to-one onto recoverable error frames; they never tear down
/// the connection.
#[derive(Debug, thiserror::Error)]
pub enum OpError {
	#[error("message not found")]
	MessageNotFound,

	#[error("conversation not found")]
	ConversationNotFound,

	#[error("not a participant in this conversation")]
	NotParticipant,

	#[error("only the recipient may mark a message read")]
	NotRecipient,

	#[error("only the sender may do this")]
	NotSender,

	#[error("edit window has elapsed")]
	EditWindowElapsed,

	#[error("reaction already present")]
	DuplicateReaction,

	#[error("no such reaction")]
	NoSuchReaction,

	#[error("invalid reaction token: {0}")]
	InvalidReaction(ParseIdError),
}

#[derive(Debug, Clone)]
pub struct ConversationSettings {
	/// In-memory retention cap per conversation; older messages age out of
	/// memory but stay in the durable store.
	pub retention_cap: usize,

	/// History window returned when a conversation is opened.
	pub history_limit: usize,
}

impl Default for ConversationSettings {
	fn default() -> Self {
		Self {
			retention_cap: 200,
			history_limit: 50,
		}
	}
}

#[derive(Debug)]
struct Conversation {
	participants: (UserId, UserId),
	messages: VecDeque<Message>,

	/// Per-message self-only deletions.
	exclusions: HashMap<MessageId, HashSet<UserId>>,

	/// Users who self-deleted the whole conversation. Cleared when a new
	/// message arrives so the conversation reappears.
	hidden_for: HashSet<UserId>,
}

impl Conversation {
	fn visible_to(&self, message: &Message, viewer: &UserId) -> bool {
		if message.deleted_for_everyone {
			return false;
		}
		match self.exclusions.get(&message.id) {
			Some(users) => !users.contains(viewer),
			None => true,
		}
	}

	fn message_mut(&mut self, message_id: &MessageId) -> Option<&mut Message> {
		self.messages.iter_mut().find(|m| m.id == *message_id)
	}

	fn other_participant(&self, user: &UserId) -> &UserId {
		if self.participants.0 == *user {
			&self.participants.1
		} else {
			&self.participants.0
		}
	}

	fn has_participant(&self, user: &UserId) -> bool {
		self.participants.0 == *user || self.participants.1 == *user
	}
}

/// State rehydrated from the durable store on first open.
#[derive(Default)]
struct ConversationSeed {
	messages: VecDeque<Message>,
	exclusions: HashMap<MessageId, HashSet<UserId>>,
	hidden_for: HashSet<UserId>,
}

#[derive(Default)]
struct Inner {
	conversations: HashMap<ConversationId, Conversation>,

	/// Message id -> owning conversation, so lookups do not need a hint.
	index: HashMap<MessageId, ConversationId>,
}

/// In-memory conversation state with write-behind persistence.
///
/// All mutations happen under one lock; durable writes run after the lock is
/// released and only log on failure.
#[derive(Clone)]
pub struct ConversationStore {
	inner: Arc<Mutex<Inner>>,
	store: MessageStore,
	settings: ConversationSettings,
}

impl ConversationStore {
	pub fn new(store: MessageStore, settings: ConversationSettings) -> Self {
		Self {
			inner: Arc::new(Mutex::new(Inner::default())),
			store,
			settings,
		}
	}

	/// Opens (or lazily creates) the conversation between `user` and
	/// `recipient` and returns its history as visible to `user`.
	///
	/// The first open after a restart rehydrates the message window together
	/// with the per-user deletion records, so self-only deletions hold for
	/// the right viewer no matter which participant opens first.
	pub async fn open(&self, user: &UserId, recipient: &UserId) -> (ConversationId, Vec<Message>) {
		let conversation_id = ConversationId::for_pair(user, recipient);

		let seed = if self.store.is_enabled() {
			self.load_seed(&conversation_id).await
		} else {
			ConversationSeed::default()
		};

		let history = {
			let mut inner = self.inner.lock().await;
			let conversation = inner
				.conversations
				.entry(conversation_id.clone())
				.or_insert_with(|| Conversation {
					participants: (user.clone(), recipient.clone()),
					messages: seed.messages,
					exclusions: seed.exclusions,
					hidden_for: seed.hidden_for,
				});

			// Reopening always unhides the conversation for the opener.
			conversation.hidden_for.remove(user);

			let history: Vec<Message> = conversation
				.messages
				.iter()
				.filter(|m| conversation.visible_to(m, user))
				.cloned()
				.collect();

			let ids: Vec<MessageId> = conversation.messages.iter().map(|m| m.id).collect();
			for id in ids {
				inner.index.insert(id, conversation_id.clone());
			}

			let start = history.len().saturating_sub(self.settings.history_limit);
			history[start..].to_vec()
		};

		if let Err(e) = self
			.store
			.upsert_conversation(&conversation_id, user, recipient, crate::util::time::unix_ms_now())
			.await
		{
			warn!(conversation = %conversation_id, error = %e, "failed to persist conversation");
		}

		(conversation_id, history)
	}

	/// Loads a conversation's recent window and deletion records from the
	/// durable store. Rows are unfiltered; visibility is decided per viewer.
	async fn load_seed(&self, conversation_id: &ConversationId) -> ConversationSeed {
		let messages = match self.store.recent_messages(conversation_id, self.settings.history_limit).await {
			Ok(messages) => messages,
			Err(e) => {
				warn!(conversation = %conversation_id, error = %e, "failed to load conversation history");
				Vec::new()
			}
		};

		let mut exclusions: HashMap<MessageId, HashSet<UserId>> = HashMap::new();
		match self.store.message_exclusions(conversation_id).await {
			Ok(rows) => {
				for (message_id, user_id) in rows {
					exclusions.entry(message_id).or_default().insert(user_id);
				}
			}
			Err(e) => warn!(conversation = %conversation_id, error = %e, "failed to load message exclusions"),
		}

		let hidden_for = match self.store.conversation_exclusions(conversation_id).await {
			Ok(users) => users.into_iter().collect(),
			Err(e) => {
				warn!(conversation = %conversation_id, error = %e, "failed to load conversation exclusions");
				HashSet::new()
			}
		};

		ConversationSeed {
			messages: messages.into(),
			exclusions,
			hidden_for,
		}
	}

	/// Appends a freshly created message and persists it.
	pub async fn append(&self, message: Message) {
		let conversation_id = message.conversation_id.clone();

		let newly_created = {
			let mut inner = self.inner.lock().await;
			let newly_created = !inner.conversations.contains_key(&conversation_id);
			let conversation = inner
				.conversations
				.entry(conversation_id.clone())
				.or_insert_with(|| Conversation {
					participants: (message.sender_id.clone(), message.recipient_id.clone()),
					messages: VecDeque::new(),
					exclusions: HashMap::new(),
					hidden_for: HashSet::new(),
				});

			conversation.hidden_for.clear();
			conversation.messages.push_back(message.clone());

			let mut evicted = Vec::new();
			while conversation.messages.len() > self.settings.retention_cap {
				if let Some(old) = conversation.messages.pop_front() {
					conversation.exclusions.remove(&old.id);
					evicted.push(old.id);
				}
			}

			for id in evicted {
				inner.index.remove(&id);
			}
			inner.index.insert(message.id, conversation_id.clone());
			newly_created
		};

		if newly_created
			&& let Err(e) = self
				.store
				.upsert_conversation(
					&conversation_id,
					&message.sender_id,
					&message.recipient_id,
					message.created_at_unix_ms,
				)
				.await
		{
			warn!(conversation = %conversation_id, error = %e, "failed to persist conversation");
		}

		if let Err(e) = self.store.insert_message(&message).await {
			warn!(message_id = %message.id, error = %e, "failed to persist message");
		}
	}

	/// Marks a message read on behalf of its recipient.
	pub async fn mark_read(&self, user: &UserId, message_id: &MessageId) -> Result<Message, OpError> {
		let updated = {
			let mut inner = self.inner.lock().await;
			let conversation_id = inner.index.get(message_id).cloned().ok_or(OpError::MessageNotFound)?;
			let conversation = inner
				.conversations
				.get_mut(&conversation_id)
				.ok_or(OpError::MessageNotFound)?;
			let message = conversation.message_mut(message_id).ok_or(OpError::MessageNotFound)?;

			if message.recipient_id != *user {
				return Err(OpError::NotRecipient);
			}

			message.read = true;
			message.clone()
		};

		if let Err(e) = self.store.mark_read(message_id).await {
			warn!(message_id = %message_id, error = %e, "failed to persist read flag");
		}

		Ok(updated)
	}

	/// Replaces a message's content within the edit window.
	pub async fn edit(&self, user: &UserId, message_id: &MessageId, content: String, now_ms: i64) -> Result<Message, OpError> {
		let updated = {
			let mut inner = self.inner.lock().await;
			let conversation_id = inner.index.get(message_id).cloned().ok_or(OpError::MessageNotFound)?;
			let conversation = inner
				.conversations
				.get_mut(&conversation_id)
				.ok_or(OpError::MessageNotFound)?;
			let message = conversation.message_mut(message_id).ok_or(OpError::MessageNotFound)?;

			if message.sender_id != *user {
				return Err(OpError::NotSender);
			}
			if !message.editable_by(user, now_ms) {
				return Err(OpError::EditWindowElapsed);
			}

			message.content = content;
			message.edited = true;
			message.edited_at_unix_ms = Some(now_ms);
			message.clone()
		};

		if let Err(e) = self.store.apply_edit(message_id, &updated.content, now_ms).await {
			warn!(message_id = %message_id, error = %e, "failed to persist edit");
		}

		Ok(updated)
	}

	/// Adds a reaction; unique per `(user, token)` pair.
	pub async fn add_reaction(
		&self,
		user: &UserId,
		message_id: &MessageId,
		token: &str,
		now_ms: i64,
	) -> Result<(Message, Reaction), OpError> {
		validate_reaction_token(token).map_err(OpError::InvalidReaction)?;
		let token = token.trim();

		let (updated, reaction) = {
			let mut inner = self.inner.lock().await;
			let conversation_id = inner.index.get(message_id).cloned().ok_or(OpError::MessageNotFound)?;
			let conversation = inner
				.conversations
				.get_mut(&conversation_id)
				.ok_or(OpError::MessageNotFound)?;

			if !conversation.has_participant(user) {
				return Err(OpError::NotParticipant);
			}

			let message = conversation.message_mut(message_id).ok_or(OpError::MessageNotFound)?;

			if message.reaction_index(user, token).is_some() {
				return Err(OpError::DuplicateReaction);
			}

			let reaction = Reaction {
				user_id: user.clone(),
				token: token.to_string(),
				at_unix_ms: now_ms,
			};
			message.reactions.push(reaction.clone());
			(message.clone(), reaction)
		};

		if let Err(e) = self.store.update_reactions(message_id, &updated.reactions).await {
			warn!(message_id = %message_id, error = %e, "failed to persist reactions");
		}

		Ok((updated, reaction))
	}

	/// Removes a previously added reaction.
	pub async fn remove_reaction(&self, user: &UserId, message_id: &MessageId, token: &str) -> Result<Message, OpError> {
		let token = token.trim();

		let updated = {
			let mut inner = self.inner.lock().await;
			let conversation_id = inner.index.get(message_id).cloned().ok_or(OpError::MessageNotFound)?;
			let conversation = inner
				.conversations
				.get_mut(&conversation_id)
				.ok_or(OpError::MessageNotFound)?;

			if !conversation.has_participant(user) {
				return Err(OpError::NotParticipant);
			}

			let message = conversation.message_mut(message_id).ok_or(OpError::MessageNotFound)?;
			let idx = message.reaction_index(user, token).ok_or(OpError::NoSuchReaction)?;
			message.reactions.remove(idx);
			message.clone()
		};

		if let Err(e) = self.store.update_reactions(message_id, &updated.reactions).await {
			warn!(message_id = %message_id, error = %e, "failed to persist reactions");
		}

		Ok(updated)
	}

	/// Deletes a message for the caller or for everyone.
	///
	/// Returns the affected message and the other participant so the caller
	/// can notify them when the scope is `Everyone`.
	pub async fn delete_message(
		&self,
		user: &UserId,
		message_id: &MessageId,
		scope: DeleteScope,
	) -> Result<(Message, UserId), OpError> {
		let (message, other) = {
			let mut inner = self.inner.lock().await;
			let conversation_id = inner.index.get(message_id).cloned().ok_or(OpError::MessageNotFound)?;
			let conversation = inner
				.conversations
				.get_mut(&conversation_id)
				.ok_or(OpError::MessageNotFound)?;

			if !conversation.has_participant(user) {
				return Err(OpError::NotParticipant);
			}

			let other = conversation.other_participant(user).clone();

			match scope {
				DeleteScope::SelfOnly => {
					let message = conversation.message_mut(message_id).ok_or(OpError::MessageNotFound)?.clone();
					conversation.exclusions.entry(*message_id).or_default().insert(user.clone());
					(message, other)
				}
				DeleteScope::Everyone => {
					let message = conversation.message_mut(message_id).ok_or(OpError::MessageNotFound)?;
					if message.sender_id != *user {
						return Err(OpError::NotSender);
					}
					message.deleted_for_everyone = true;
					(message.clone(), other)
				}
			}
		};

		let result = match scope {
			DeleteScope::SelfOnly => self.store.add_message_exclusion(message_id, user).await,
			DeleteScope::Everyone => self.store.set_deleted_for_everyone(message_id).await,
		};
		if let Err(e) = result {
			warn!(message_id = %message_id, error = %e, "failed to persist message deletion");
		}

		Ok((message, other))
	}

	/// Deletes a whole conversation for the caller or for everyone.
	///
	/// Returns the other participant for notification on `Everyone`.
	pub async fn delete_conversation(
		&self,
		user: &UserId,
		conversation_id: &ConversationId,
		scope: DeleteScope,
	) -> Result<UserId, OpError> {
		let other = {
			let mut inner = self.inner.lock().await;
			let conversation = inner
				.conversations
				.get_mut(conversation_id)
				.ok_or(OpError::ConversationNotFound)?;

			if !conversation.has_participant(user) {
				return Err(OpError::NotParticipant);
			}

			let other = conversation.other_participant(user).clone();

			match scope {
				DeleteScope::SelfOnly => {
					conversation.hidden_for.insert(user.clone());
					let ids: Vec<MessageId> = conversation.messages.iter().map(|m| m.id).collect();
					for id in ids {
						conversation.exclusions.entry(id).or_default().insert(user.clone());
					}
				}
				DeleteScope::Everyone => {
					let ids: Vec<MessageId> = conversation.messages.iter().map(|m| m.id).collect();
					inner.conversations.remove(conversation_id);
					for id in ids {
						inner.index.remove(&id);
					}
				}
			}

			other
		};

		let result = match scope {
			DeleteScope::SelfOnly => self.store.add_conversation_exclusion(conversation_id, user).await,
			DeleteScope::Everyone => self.store.delete_conversation_for_everyone(conversation_id).await,
		};
		if let Err(e) = result {
			warn!(conversation = %conversation_id, error = %e, "failed to persist conversation deletion");
		}

		Ok(other)
	}

	/// Looks up a message by id for read-only purposes.
	pub async fn find_message(&self, message_id: &MessageId) -> Option<Message> {
		let inner = self.inner.lock().await;
		let conversation_id = inner.index.get(message_id)?;
		let conversation = inner.conversations.get(conversation_id)?;
		conversation.messages.iter().find(|m| m.id == *message_id).cloned()
	}
}
