#![forbid(unsafe_code)]

use anyhow::{Context, anyhow};
use courier_domain::{ConversationId, Message, MessageId, Reaction, UserId};
use sqlx::FromRow;

/// Durable conversation history.
///
/// The in-memory conversation state is authoritative for live traffic; this
/// store backs history across restarts. Writes that fail are logged by the
/// caller and never abort the in-memory operation.
#[derive(Clone)]
pub struct MessageStore {
	backend: Option<StoreBackend>,
}

#[derive(Clone)]
enum StoreBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

#[derive(Debug, FromRow)]
struct MessageRow {
	id: String,
	conversation_id: String,
	sender_id: String,
	recipient_id: String,
	content: String,
	created_at_ms: i64,
	read: bool,
	reply_to: Option<String>,
	edited: bool,
	edited_at_ms: Option<i64>,
	reactions: String,
	deleted_for_everyone: bool,
}

impl MessageRow {
	fn into_message(self) -> anyhow::Result<Message> {
		let reactions: Vec<Reaction> = serde_json::from_str(&self.reactions).context("parse stored reactions")?;

		Ok(Message {
			id: MessageId::parse(&self.id).context("parse stored message id")?,
			conversation_id: ConversationId::parse(&self.conversation_id).map_err(|e| anyhow!("{e}"))?,
			sender_id: UserId::new(&self.sender_id).map_err(|e| anyhow!("{e}"))?,
			recipient_id: UserId::new(&self.recipient_id).map_err(|e| anyhow!("{e}"))?,
			content: self.content,
			created_at_unix_ms: self.created_at_ms,
			read: self.read,
			reply_to: match self.reply_to {
				Some(raw) => Some(MessageId::parse(&raw).context("parse stored reply_to")?),
				None => None,
			},
			edited: self.edited,
			edited_at_unix_ms: self.edited_at_ms,
			reactions,
			deleted_for_everyone: self.deleted_for_everyone,
		})
	}
}

impl MessageStore {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			let pool = sqlx::SqlitePool::connect(database_url).await.context("connect sqlite")?;
			sqlx::migrate!("migrations/sqlite").run(&pool).await.context("run sqlite migrations")?;
			Ok(Self {
				backend: Some(StoreBackend::Sqlite(pool)),
			})
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;
			Ok(Self {
				backend: Some(StoreBackend::Postgres(pool)),
			})
		} else {
			Err(anyhow!("unsupported database_url for message store"))
		}
	}

	pub fn disabled() -> Self {
		Self { backend: None }
	}

	pub fn is_enabled(&self) -> bool {
		self.backend.is_some()
	}

	/// Liveness probe used by the readiness endpoint.
	pub async fn ping(&self) -> anyhow::Result<()> {
		let Some(backend) = &self.backend else {
			return Ok(());
		};

		match backend {
			StoreBackend::Sqlite(pool) => {
				sqlx::query("SELECT 1").execute(pool).await.context("ping sqlite")?;
			}
			StoreBackend::Postgres(pool) => {
				sqlx::query("SELECT 1").execute(pool).await.context("ping postgres")?;
			}
		}

		Ok(())
	}

	pub async fn upsert_conversation(
		&self,
		conversation_id: &ConversationId,
		participant_a: &UserId,
		participant_b: &UserId,
		created_at_ms: i64,
	) -> anyhow::Result<()> {
		let Some(backend) = &self.backend else {
			return Ok(());
		};

		match backend {
			StoreBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO conversations (id, participant_a, participant_b, created_at_ms) \
					VALUES (?, ?, ?, ?) ON CONFLICT(id) DO NOTHING",
				)
				.bind(conversation_id.as_str())
				.bind(participant_a.as_str())
				.bind(participant_b.as_str())
				.bind(created_at_ms)
				.execute(pool)
				.await
				.context("upsert conversation (sqlite)")?;
			}
			StoreBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO conversations (id, participant_a, participant_b, created_at_ms) \
					VALUES ($1, $2, $3, $4) ON CONFLICT(id) DO NOTHING",
				)
				.bind(conversation_id.as_str())
				.bind(participant_a.as_str())
				.bind(participant_b.as_str())
				.bind(created_at_ms)
				.execute(pool)
				.await
				.context("upsert conversation (postgres)")?;
			}
		}

		Ok(())
	}

	pub async fn insert_message(&self, message: &Message) -> anyhow::Result<()> {
		let Some(backend) = &self.backend else {
			return Ok(());
		};

		let reactions = serde_json::to_string(&message.reactions).context("encode reactions")?;
		let reply_to = message.reply_to.as_ref().map(|id| id.to_string());

		match backend {
			StoreBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO messages \
					(id, conversation_id, sender_id, recipient_id, content, created_at_ms, read, reply_to, edited, edited_at_ms, reactions, deleted_for_everyone) \
					VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
				)
				.bind(message.id.to_string())
				.bind(message.conversation_id.as_str())
				.bind(message.sender_id.as_str())
				.bind(message.recipient_id.as_str())
				.bind(&message.content)
				.bind(message.created_at_unix_ms)
				.bind(message.read)
				.bind(reply_to)
				.bind(message.edited)
				.bind(message.edited_at_unix_ms)
				.bind(reactions)
				.bind(message.deleted_for_everyone)
				.execute(pool)
				.await
				.context("insert message (sqlite)")?;

				sqlx::query("DELETE FROM conversation_exclusions WHERE conversation_id = ?")
					.bind(message.conversation_id.as_str())
					.execute(pool)
					.await
					.context("clear conversation exclusions (sqlite)")?;
			}
			StoreBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO messages \
					(id, conversation_id, sender_id, recipient_id, content, created_at_ms, read, reply_to, edited, edited_at_ms, reactions, deleted_for_everyone) \
					VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
				)
				.bind(message.id.to_string())
				.bind(message.conversation_id.as_str())
				.bind(message.sender_id.as_str())
				.bind(message.recipient_id.as_str())
				.bind(&message.content)
				.bind(message.created_at_unix_ms)
				.bind(message.read)
				.bind(reply_to)
				.bind(message.edited)
				.bind(message.edited_at_unix_ms)
				.bind(reactions)
				.bind(message.deleted_for_everyone)
				.execute(pool)
				.await
				.context("insert message (postgres)")?;

				sqlx::query("DELETE FROM conversation_exclusions WHERE conversation_id = $1")
					.bind(message.conversation_id.as_str())
					.execute(pool)
					.await
					.context("clear conversation exclusions (postgres)")?;
			}
		}

		Ok(())
	}

	/// Most recent non-deleted messages in a conversation, oldest first.
	///
	/// Self-only deletion records are intentionally not applied here; callers
	/// fetch them via `message_exclusions` and filter per viewer.
	pub async fn recent_messages(&self, conversation_id: &ConversationId, limit: usize) -> anyhow::Result<Vec<Message>> {
		let Some(backend) = &self.backend else {
			return Ok(Vec::new());
		};

		let rows: Vec<MessageRow> = match backend {
			StoreBackend::Sqlite(pool) => {
				sqlx::query_as(
					"SELECT id, conversation_id, sender_id, recipient_id, content, created_at_ms, read, reply_to, edited, edited_at_ms, reactions, deleted_for_everyone \
					FROM messages \
					WHERE conversation_id = ? AND deleted_for_everyone = FALSE \
					ORDER BY created_at_ms DESC LIMIT ?",
				)
				.bind(conversation_id.as_str())
				.bind(limit as i64)
				.fetch_all(pool)
				.await
				.context("load recent messages (sqlite)")?
			}
			StoreBackend::Postgres(pool) => {
				sqlx::query_as(
					"SELECT id, conversation_id, sender_id, recipient_id, content, created_at_ms, read, reply_to, edited, edited_at_ms, reactions, deleted_for_everyone \
					FROM messages \
					WHERE conversation_id = $1 AND deleted_for_everyone = FALSE \
					ORDER BY created_at_ms DESC LIMIT $2",
				)
				.bind(conversation_id.as_str())
				.bind(limit as i64)
				.fetch_all(pool)
				.await
				.context("load recent messages (postgres)")?
			}
		};

		let mut messages = Vec::with_capacity(rows.len());
		for row in rows {
			messages.push(row.into_message()?);
		}
		messages.reverse();

		Ok(messages)
	}

	/// Self-only message deletions within a conversation, as `(message, user)`.
	pub async fn message_exclusions(&self, conversation_id: &ConversationId) -> anyhow::Result<Vec<(MessageId, UserId)>> {
		let Some(backend) = &self.backend else {
			return Ok(Vec::new());
		};

		let rows: Vec<(String, String)> = match backend {
			StoreBackend::Sqlite(pool) => {
				sqlx::query_as(
					"SELECT e.message_id, e.user_id FROM message_exclusions e \
					JOIN messages m ON m.id = e.message_id \
					WHERE m.conversation_id = ?",
				)
				.bind(conversation_id.as_str())
				.fetch_all(pool)
				.await
				.context("load message exclusions (sqlite)")?
			}
			StoreBackend::Postgres(pool) => {
				sqlx::query_as(
					"SELECT e.message_id, e.user_id FROM message_exclusions e \
					JOIN messages m ON m.id = e.message_id \
					WHERE m.conversation_id = $1",
				)
				.bind(conversation_id.as_str())
				.fetch_all(pool)
				.await
				.context("load message exclusions (postgres)")?
			}
		};

		let mut exclusions = Vec::with_capacity(rows.len());
		for (message_id, user_id) in rows {
			exclusions.push((
				MessageId::parse(&message_id).context("parse stored exclusion message id")?,
				UserId::new(&user_id).map_err(|e| anyhow!("{e}"))?,
			));
		}

		Ok(exclusions)
	}

	/// Users who self-deleted the whole conversation.
	pub async fn conversation_exclusions(&self, conversation_id: &ConversationId) -> anyhow::Result<Vec<UserId>> {
		let Some(backend) = &self.backend else {
			return Ok(Vec::new());
		};

		let rows: Vec<(String,)> = match backend {
			StoreBackend::Sqlite(pool) => {
				sqlx::query_as("SELECT user_id FROM conversation_exclusions WHERE conversation_id = ?")
					.bind(conversation_id.as_str())
					.fetch_all(pool)
					.await
					.context("load conversation exclusions (sqlite)")?
			}
			StoreBackend::Postgres(pool) => {
				sqlx::query_as("SELECT user_id FROM conversation_exclusions WHERE conversation_id = $1")
					.bind(conversation_id.as_str())
					.fetch_all(pool)
					.await
					.context("load conversation exclusions (postgres)")?
			}
		};

		let mut users = Vec::with_capacity(rows.len());
		for (user_id,) in rows {
			users.push(UserId::new(&user_id).map_err(|e| anyhow!("{e}"))?);
		}

		Ok(users)
	}

	pub async fn mark_read(&self, message_id: &MessageId) -> anyhow::Result<()> {
		let Some(backend) = &self.backend else {
			return Ok(());
		};

		match backend {
			StoreBackend::Sqlite(pool) => {
				sqlx::query("UPDATE messages SET read = TRUE WHERE id = ?")
					.bind(message_id.to_string())
					.execute(pool)
					.await
					.context("mark read (sqlite)")?;
			}
			StoreBackend::Postgres(pool) => {
				sqlx::query("UPDATE messages SET read = TRUE WHERE id = $1")
					.bind(message_id.to_string())
					.execute(pool)
					.await
					.context("mark read (postgres)")?;
			}
		}

		Ok(())
	}

	pub async fn apply_edit(&self, message_id: &MessageId, content: &str, edited_at_ms: i64) -> anyhow::Result<()> {
		let Some(backend) = &self.backend else {
			return Ok(());
		};

		match backend {
			StoreBackend::Sqlite(pool) => {
				sqlx::query("UPDATE messages SET content = ?, edited = TRUE, edited_at_ms = ? WHERE id = ?")
					.bind(content)
					.bind(edited_at_ms)
					.bind(message_id.to_string())
					.execute(pool)
					.await
					.context("apply edit (sqlite)")?;
			}
			StoreBackend::Postgres(pool) => {
				sqlx::query("UPDATE messages SET content = $1, edited = TRUE, edited_at_ms = $2 WHERE id = $3")
					.bind(content)
					.bind(edited_at_ms)
					.bind(message_id.to_string())
					.execute(pool)
					.await
					.context("apply edit (postgres)")?;
			}
		}

		Ok(())
	}

	pub async fn update_reactions(&self, message_id: &MessageId, reactions: &[Reaction]) -> anyhow::Result<()> {
		let Some(backend) = &self.backend else {
			return Ok(());
		};

		let encoded = serde_json::to_string(reactions).context("encode reactions")?;

		match backend {
			StoreBackend::Sqlite(pool) => {
				sqlx::query("UPDATE messages SET reactions = ? WHERE id = ?")
					.bind(encoded)
					.bind(message_id.to_string())
					.execute(pool)
					.await
					.context("update reactions (sqlite)")?;
			}
			StoreBackend::Postgres(pool) => {
				sqlx::query("UPDATE messages SET reactions = $1 WHERE id = $2")
					.bind(encoded)
					.bind(message_id.to_string())
					.execute(pool)
					.await
					.context("update reactions (postgres)")?;
			}
		}

		Ok(())
	}

	pub async fn set_deleted_for_everyone(&self, message_id: &MessageId) -> anyhow::Result<()> {
		let Some(backend) = &self.backend else {
			return Ok(());
		};

		match backend {
			StoreBackend::Sqlite(pool) => {
				sqlx::query("UPDATE messages SET deleted_for_everyone = TRUE WHERE id = ?")
					.bind(message_id.to_string())
					.execute(pool)
					.await
					.context("delete message (sqlite)")?;
			}
			StoreBackend::Postgres(pool) => {
				sqlx::query("UPDATE messages SET deleted_for_everyone = TRUE WHERE id = $1")
					.bind(message_id.to_string())
					.execute(pool)
					.await
					.context("delete message (postgres)")?;
			}
		}

		Ok(())
	}

	/// Hides one message from `user` only.
	pub async fn add_message_exclusion(&self, message_id: &MessageId, user: &UserId) -> anyhow::Result<()> {
		let Some(backend) = &self.backend else {
			return Ok(());
		};

		match backend {
			StoreBackend::Sqlite(pool) => {
				sqlx::query("INSERT INTO message_exclusions (message_id, user_id) VALUES (?, ?) ON CONFLICT DO NOTHING")
					.bind(message_id.to_string())
					.bind(user.as_str())
					.execute(pool)
					.await
					.context("add message exclusion (sqlite)")?;
			}
			StoreBackend::Postgres(pool) => {
				sqlx::query("INSERT INTO message_exclusions (message_id, user_id) VALUES ($1, $2) ON CONFLICT DO NOTHING")
					.bind(message_id.to_string())
					.bind(user.as_str())
					.execute(pool)
					.await
					.context("add message exclusion (postgres)")?;
			}
		}

		Ok(())
	}

	/// Hides the whole conversation, as it stands now, from `user` only.
	///
	/// Existing messages get per-message exclusions so a later message makes
	/// the conversation reappear without resurrecting the hidden history.
	pub async fn add_conversation_exclusion(&self, conversation_id: &ConversationId, user: &UserId) -> anyhow::Result<()> {
		let Some(backend) = &self.backend else {
			return Ok(());
		};

		match backend {
			StoreBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO message_exclusions (message_id, user_id) \
					SELECT id, ? FROM messages WHERE conversation_id = ? ON CONFLICT DO NOTHING",
				)
				.bind(user.as_str())
				.bind(conversation_id.as_str())
				.execute(pool)
				.await
				.context("exclude conversation messages (sqlite)")?;

				sqlx::query(
					"INSERT INTO conversation_exclusions (conversation_id, user_id) VALUES (?, ?) ON CONFLICT DO NOTHING",
				)
				.bind(conversation_id.as_str())
				.bind(user.as_str())
				.execute(pool)
				.await
				.context("add conversation exclusion (sqlite)")?;
			}
			StoreBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO message_exclusions (message_id, user_id) \
					SELECT id, $1 FROM messages WHERE conversation_id = $2 ON CONFLICT DO NOTHING",
				)
				.bind(user.as_str())
				.bind(conversation_id.as_str())
				.execute(pool)
				.await
				.context("exclude conversation messages (postgres)")?;

				sqlx::query(
					"INSERT INTO conversation_exclusions (conversation_id, user_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
				)
				.bind(conversation_id.as_str())
				.bind(user.as_str())
				.execute(pool)
				.await
				.context("add conversation exclusion (postgres)")?;
			}
		}

		Ok(())
	}

	/// Tombstones a conversation and all of its messages for both sides.
	pub async fn delete_conversation_for_everyone(&self, conversation_id: &ConversationId) -> anyhow::Result<()> {
		let Some(backend) = &self.backend else {
			return Ok(());
		};

		match backend {
			StoreBackend::Sqlite(pool) => {
				sqlx::query("UPDATE messages SET deleted_for_everyone = TRUE WHERE conversation_id = ?")
					.bind(conversation_id.as_str())
					.execute(pool)
					.await
					.context("delete conversation messages (sqlite)")?;

				sqlx::query("UPDATE conversations SET deleted_for_everyone = TRUE WHERE id = ?")
					.bind(conversation_id.as_str())
					.execute(pool)
					.await
					.context("delete conversation (sqlite)")?;
			}
			StoreBackend::Postgres(pool) => {
				sqlx::query("UPDATE messages SET deleted_for_everyone = TRUE WHERE conversation_id = $1")
					.bind(conversation_id.as_str())
					.execute(pool)
					.await
					.context("delete conversation messages (postgres)")?;

				sqlx::query("UPDATE conversations SET deleted_for_everyone = TRUE WHERE id = $1")
					.bind(conversation_id.as_str())
					.execute(pool)
					.await
					.context("delete conversation (postgres)")?;
			}
		}

		Ok(())
	}
}
