#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum accepted length (in characters) of a reaction token.
pub const MAX_REACTION_TOKEN_LEN: usize = 8;

/// Window after creation during which the sender may edit a message.
pub const EDIT_WINDOW_MS: i64 = 5 * 60 * 1000;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("value too long: {0}")]
	TooLong(usize),
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Authenticated user identifier issued by the identity backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
	/// Create a non-empty `UserId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for UserId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for UserId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		UserId::new(s.to_string())
	}
}

/// Server-assigned physical connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "conn-{}", self.0)
	}
}

/// Canonical two-participant conversation identifier.
///
/// The id is derived from the unordered pair of participant ids, so
/// `for_pair(a, b) == for_pair(b, a)` and lookup is idempotent for either
/// participant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
	/// Separator between the two sorted participant ids.
	pub const SEPARATOR: char = ':';

	/// Derive the canonical id for a pair of users.
	pub fn for_pair(a: &UserId, b: &UserId) -> Self {
		let (lo, hi) = if a.as_str() <= b.as_str() { (a, b) } else { (b, a) };
		Self(format!("{}{}{}", lo.as_str(), Self::SEPARATOR, hi.as_str()))
	}

	/// Parse an id previously produced by `for_pair`.
	pub fn parse(s: &str) -> Result<Self, ParseIdError> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		if !s.contains(Self::SEPARATOR) {
			return Err(ParseIdError::InvalidFormat("expected <user>:<user>".into()));
		}
		Ok(Self(s.to_string()))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for ConversationId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for ConversationId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		ConversationId::parse(s)
	}
}

/// Server-assigned message identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub uuid::Uuid);

impl MessageId {
	/// Create a new random message id.
	pub fn new_v4() -> Self {
		Self(uuid::Uuid::new_v4())
	}

	pub fn parse(s: &str) -> Result<Self, ParseIdError> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		uuid::Uuid::parse_str(s)
			.map(Self)
			.map_err(|_| ParseIdError::InvalidFormat("expected a UUID".into()))
	}
}

impl fmt::Display for MessageId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Authenticated identity returned by the identity backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
	pub id: UserId,
	pub username: String,
	#[serde(default)]
	pub display_name: String,
	#[serde(default)]
	pub email: String,
}

/// One reaction on a message; unique per `(user, token)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
	pub user_id: UserId,
	pub token: String,
	pub at_unix_ms: i64,
}

/// Validate a reaction token: non-empty and short.
pub fn validate_reaction_token(token: &str) -> Result<(), ParseIdError> {
	let token = token.trim();
	if token.is_empty() {
		return Err(ParseIdError::Empty);
	}
	let len = token.chars().count();
	if len > MAX_REACTION_TOKEN_LEN {
		return Err(ParseIdError::TooLong(len));
	}
	Ok(())
}

/// Scope of a deletion request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteScope {
	/// Hide from the requesting user only; other participants are unaffected.
	SelfOnly,
	/// Flag as deleted for every participant.
	Everyone,
}

/// External classifier's decision on message content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ModerationVerdict {
	Allow,
	Warn,
	Delete,
}

/// One private message within a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
	pub id: MessageId,
	pub conversation_id: ConversationId,
	pub sender_id: UserId,
	pub recipient_id: UserId,
	pub content: String,
	pub created_at_unix_ms: i64,
	#[serde(default)]
	pub read: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub reply_to: Option<MessageId>,
	#[serde(default)]
	pub edited: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub edited_at_unix_ms: Option<i64>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub reactions: Vec<Reaction>,
	#[serde(default)]
	pub deleted_for_everyone: bool,
}

impl Message {
	/// Whether `user` may still edit this message at `now`.
	pub fn editable_by(&self, user: &UserId, now_unix_ms: i64) -> bool {
		self.sender_id == *user && now_unix_ms - self.created_at_unix_ms < EDIT_WINDOW_MS
	}

	/// Find a reaction by `(user, token)`.
	pub fn reaction_index(&self, user: &UserId, token: &str) -> Option<usize> {
		self.reactions.iter().position(|r| r.user_id == *user && r.token == token)
	}
}
