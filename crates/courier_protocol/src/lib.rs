#![forbid(unsafe_code)]

//! Wire protocol for the courier gateway.
//!
//! Frames are length-prefixed JSON text envelopes. Each envelope is a closed
//! tagged union with a `type` discriminator, so dispatch is exhaustive at
//! compile time rather than string-matched at runtime.

pub mod framing;

pub use framing::{DEFAULT_MAX_FRAME_SIZE, FramingError, decode_frame, encode_frame, encode_frame_default};

use courier_domain::{DeleteScope, Message, Reaction, User};
use serde::{Deserialize, Serialize};

/// v1 protocol version advertised in the `connected` greeting.
pub const PROTOCOL_VERSION: u32 = 1;

/// Client-to-server envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
	Authenticate {
		#[serde(default)]
		token: String,
	},
	GetOnlineUsers,
	StartConversation {
		#[serde(default)]
		recipient_id: String,
	},
	SendPrivateMessage {
		#[serde(default)]
		recipient_id: String,
		#[serde(default)]
		content: String,
		#[serde(default)]
		reply_to: Option<String>,
	},
	MarkMessageRead {
		#[serde(default)]
		message_id: String,
		#[serde(default)]
		conversation_id: Option<String>,
	},
	Typing {
		#[serde(default)]
		recipient_id: String,
		#[serde(default)]
		typing: Option<bool>,
	},
	AddReaction {
		#[serde(default)]
		message_id: String,
		#[serde(default)]
		reaction: String,
		#[serde(default)]
		conversation_id: Option<String>,
	},
	RemoveReaction {
		#[serde(default)]
		message_id: String,
		#[serde(default)]
		reaction: String,
		#[serde(default)]
		conversation_id: Option<String>,
	},
	EditMessage {
		#[serde(default)]
		message_id: String,
		#[serde(default)]
		content: String,
		#[serde(default)]
		conversation_id: Option<String>,
	},
	DeleteMessage {
		#[serde(default)]
		message_id: String,
		#[serde(default)]
		conversation_id: Option<String>,
		#[serde(default = "default_delete_scope")]
		scope: DeleteScope,
	},
	DeleteConversation {
		#[serde(default)]
		conversation_id: String,
		#[serde(default = "default_delete_scope")]
		scope: DeleteScope,
	},
	Ping {
		#[serde(default)]
		client_time_unix_ms: i64,
	},
}

fn default_delete_scope() -> DeleteScope {
	DeleteScope::SelfOnly
}

impl ClientFrame {
	/// Stable name of the operation, used for per-user rate-limit keys and
	/// metrics labels.
	pub const fn kind(&self) -> &'static str {
		match self {
			ClientFrame::Authenticate { .. } => "authenticate",
			ClientFrame::GetOnlineUsers => "get_online_users",
			ClientFrame::StartConversation { .. } => "start_conversation",
			ClientFrame::SendPrivateMessage { .. } => "send_private_message",
			ClientFrame::MarkMessageRead { .. } => "mark_message_read",
			ClientFrame::Typing { .. } => "typing",
			ClientFrame::AddReaction { .. } => "add_reaction",
			ClientFrame::RemoveReaction { .. } => "remove_reaction",
			ClientFrame::EditMessage { .. } => "edit_message",
			ClientFrame::DeleteMessage { .. } => "delete_message",
			ClientFrame::DeleteConversation { .. } => "delete_conversation",
			ClientFrame::Ping { .. } => "ping",
		}
	}

	/// Frames a connection may send before authenticating.
	pub const fn allowed_unauthenticated(&self) -> bool {
		matches!(self, ClientFrame::Authenticate { .. } | ClientFrame::Ping { .. })
	}
}

/// A user visible in presence listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEntry {
	pub user_id: String,
	pub username: String,
	#[serde(default)]
	pub display_name: String,
}

impl From<&User> for PresenceEntry {
	fn from(user: &User) -> Self {
		Self {
			user_id: user.id.as_str().to_string(),
			username: user.username.clone(),
			display_name: user.display_name.clone(),
		}
	}
}

/// Server-to-client envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
	Connected {
		server_name: String,
		connection_id: String,
		server_time_unix_ms: i64,
		protocol_version: u32,
	},
	AuthSuccess {
		user: User,
		online_users: Vec<PresenceEntry>,
	},
	AuthError {
		message: String,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		details: Option<String>,
	},
	SessionConflict {
		message: String,
	},
	UserOnline {
		user: PresenceEntry,
	},
	UserOffline {
		user_id: String,
	},
	OnlineUsers {
		users: Vec<PresenceEntry>,
	},
	ConversationStarted {
		conversation_id: String,
		recipient: PresenceEntry,
		messages: Vec<Message>,
	},
	NewPrivateMessage {
		message: Message,
	},
	PrivateMessageSent {
		message: Message,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		warning: Option<String>,
	},
	MessageMarkedRead {
		message_id: String,
		conversation_id: String,
	},
	MessageRead {
		message_id: String,
		conversation_id: String,
		reader_id: String,
	},
	TypingIndicator {
		sender_id: String,
		typing: bool,
	},
	TypingIndicatorSent {
		recipient_id: String,
		typing: bool,
	},
	ReactionAdded {
		message_id: String,
		conversation_id: String,
		reaction: Reaction,
	},
	ReactionRemoved {
		message_id: String,
		conversation_id: String,
		user_id: String,
		reaction: String,
	},
	MessageEdited {
		message: Message,
	},
	MessageDeleted {
		message_id: String,
		conversation_id: String,
		scope: DeleteScope,
	},
	ConversationDeleted {
		conversation_id: String,
		scope: DeleteScope,
	},
	Error {
		message: String,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		details: Option<String>,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		field: Option<String>,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		retry_after_secs: Option<u64>,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		correlation_id: Option<String>,
	},
	Pong {
		client_time_unix_ms: i64,
		server_time_unix_ms: i64,
	},
}

impl ServerFrame {
	/// Plain error with only a human-readable message.
	pub fn error(message: impl Into<String>) -> Self {
		ServerFrame::Error {
			message: message.into(),
			details: None,
			field: None,
			retry_after_secs: None,
			correlation_id: None,
		}
	}

	/// Validation error naming the offending field.
	pub fn field_error(message: impl Into<String>, field: impl Into<String>) -> Self {
		ServerFrame::Error {
			message: message.into(),
			details: None,
			field: Some(field.into()),
			retry_after_secs: None,
			correlation_id: None,
		}
	}

	/// Rate-limit rejection with a retry hint.
	pub fn rate_limited(message: impl Into<String>, retry_after_secs: u64) -> Self {
		ServerFrame::Error {
			message: message.into(),
			details: None,
			field: None,
			retry_after_secs: Some(retry_after_secs),
			correlation_id: None,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn client_frame_uses_type_discriminator() {
		let json = r#"{"type":"send_private_message","recipient_id":"u2","content":"hi"}"#;
		let frame: ClientFrame = serde_json::from_str(json).expect("decode");
		match frame {
			ClientFrame::SendPrivateMessage {
				recipient_id,
				content,
				reply_to,
			} => {
				assert_eq!(recipient_id, "u2");
				assert_eq!(content, "hi");
				assert!(reply_to.is_none());
			}
			other => panic!("unexpected frame: {other:?}"),
		}
	}

	#[test]
	fn unknown_type_is_a_decode_error() {
		let json = r#"{"type":"fly_to_the_moon"}"#;
		assert!(serde_json::from_str::<ClientFrame>(json).is_err());
	}

	#[test]
	fn delete_scope_defaults_to_self_only() {
		let json = r#"{"type":"delete_message","message_id":"m1"}"#;
		let frame: ClientFrame = serde_json::from_str(json).expect("decode");
		match frame {
			ClientFrame::DeleteMessage { scope, .. } => assert_eq!(scope, DeleteScope::SelfOnly),
			other => panic!("unexpected frame: {other:?}"),
		}
	}

	#[test]
	fn error_frame_serializes_optional_fields_sparsely() {
		let err = ServerFrame::field_error("recipient_id is required", "recipient_id");
		let json = serde_json::to_string(&err).expect("encode");
		assert!(json.contains(r#""type":"error""#));
		assert!(json.contains(r#""field":"recipient_id""#));
		assert!(!json.contains("retry_after_secs"));
	}

	#[test]
	fn kind_matches_wire_discriminator() {
		let frame = ClientFrame::Ping { client_time_unix_ms: 0 };
		let json = serde_json::to_string(&frame).expect("encode");
		assert!(json.contains(r#""type":"ping""#));
		assert_eq!(frame.kind(), "ping");
	}
}
