#![forbid(unsafe_code)]

use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::anyhow;
use courier_domain::{ConversationId, DeleteScope, Message, MessageId, ModerationVerdict, User, UserId};
use courier_protocol::{ClientFrame, PresenceEntry, ServerFrame};
use tokio::sync::{Mutex, mpsc};
use tracing::{info, warn};

use crate::server::conversations::{ConversationStore, OpError};
use crate::server::identity::IdentityVerifier;
use crate::server::moderation::ModerationClient;
use crate::server::presence::{Outbound, PresenceRegistry};
use crate::server::rate_limit::{RateDecision, UserRateLimiter};
use crate::server::session_cache::SessionCache;
use crate::util::time::unix_ms_now;

use courier_domain::ConnectionId;

/// Router-level tunables.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
	pub server_name: String,
	pub max_message_chars: usize,
}

impl Default for GatewaySettings {
	fn default() -> Self {
		Self {
			server_name: format!("courier-server/{}", env!("CARGO_PKG_VERSION")),
			max_message_chars: 2000,
		}
	}
}

/// Cheap process-wide counters surfaced on `/statusz`.
#[derive(Debug, Default)]
pub struct GatewayCounters {
	pub messages_total: AtomicU64,
	pub rate_limit_hits_total: AtomicU64,
	responses_total: AtomicU64,
	response_time_total_us: AtomicU64,
}

impl GatewayCounters {
	pub fn record_response(&self, elapsed: Duration) {
		self.responses_total.fetch_add(1, Ordering::Relaxed);
		self.response_time_total_us
			.fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
	}

	/// Average handler response time in microseconds.
	pub fn avg_response_us(&self) -> u64 {
		let total = self.responses_total.load(Ordering::Relaxed);
		if total == 0 {
			return 0;
		}
		self.response_time_total_us.load(Ordering::Relaxed) / total
	}
}

/// Per-connection state owned by the connection handler.
#[derive(Debug)]
pub struct ConnState {
	pub user: Option<User>,
	pub remote_ip: IpAddr,
}

impl ConnState {
	pub fn new(remote_ip: IpAddr) -> Self {
		Self { user: None, remote_ip }
	}
}

/// All shared gateway services bundled for the frame handlers.
#[derive(Clone)]
pub struct Gateway {
	pub presence: PresenceRegistry,
	pub conversations: ConversationStore,
	pub identity: Arc<dyn IdentityVerifier>,
	pub moderation: Arc<dyn ModerationClient>,
	pub cache: SessionCache,
	pub user_rates: Arc<Mutex<UserRateLimiter>>,
	pub counters: Arc<GatewayCounters>,
	pub settings: GatewaySettings,
}

impl Gateway {
	/// Handles one decoded client frame.
	///
	/// Domain failures are answered with error frames; an `Err` here means
	/// the connection itself is broken and should be torn down.
	pub async fn handle_frame(
		&self,
		conn_id: ConnectionId,
		state: &mut ConnState,
		out: &mpsc::Sender<Outbound>,
		frame: ClientFrame,
	) -> anyhow::Result<()> {
		let kind = frame.kind();

		if state.user.is_none() && !frame.allowed_unauthenticated() {
			metrics::counter!("courier_server_unauthenticated_frames_total").increment(1);
			return reply(
				out,
				ServerFrame::Error {
					message: "authentication required".to_string(),
					details: Some("unauthenticated".to_string()),
					field: None,
					retry_after_secs: None,
					correlation_id: None,
				},
			)
			.await;
		}

		// Per-user rate gate for everything except the ping heartbeat and the
		// authenticate handshake (which is gated per-IP at admission).
		if let Some(user) = state.user.as_ref()
			&& !matches!(frame, ClientFrame::Ping { .. } | ClientFrame::Authenticate { .. })
		{
			let content_len = match &frame {
				ClientFrame::SendPrivateMessage { content, .. } => Some(content.chars().count()),
				_ => None,
			};

			let decision = {
				let mut rates = self.user_rates.lock().await;
				rates.check(&user.id, kind, content_len)
			};

			if let RateDecision::Limited { retry_after_secs } = decision {
				self.counters.rate_limit_hits_total.fetch_add(1, Ordering::Relaxed);
				metrics::counter!("courier_server_rate_limited_total", "kind" => kind).increment(1);
				return reply(
					out,
					ServerFrame::rate_limited(format!("rate limit exceeded for {kind}"), retry_after_secs),
				)
				.await;
			}
		}

		match frame {
			ClientFrame::Authenticate { token } => self.handle_authenticate(conn_id, state, out, token).await,
			ClientFrame::GetOnlineUsers => self.handle_get_online_users(state, out).await,
			ClientFrame::StartConversation { recipient_id } => {
				self.handle_start_conversation(state, out, recipient_id).await
			}
			ClientFrame::SendPrivateMessage {
				recipient_id,
				content,
				reply_to,
			} => self.handle_send(state, out, recipient_id, content, reply_to).await,
			ClientFrame::MarkMessageRead { message_id, .. } => self.handle_mark_read(state, out, message_id).await,
			ClientFrame::Typing { recipient_id, typing } => self.handle_typing(state, out, recipient_id, typing).await,
			ClientFrame::AddReaction {
				message_id, reaction, ..
			} => self.handle_add_reaction(state, out, message_id, reaction).await,
			ClientFrame::RemoveReaction {
				message_id, reaction, ..
			} => self.handle_remove_reaction(state, out, message_id, reaction).await,
			ClientFrame::EditMessage {
				message_id, content, ..
			} => self.handle_edit(state, out, message_id, content).await,
			ClientFrame::DeleteMessage { message_id, scope, .. } => {
				self.handle_delete_message(state, out, message_id, scope).await
			}
			ClientFrame::DeleteConversation { conversation_id, scope } => {
				self.handle_delete_conversation(state, out, conversation_id, scope).await
			}
			ClientFrame::Ping { client_time_unix_ms } => {
				reply(
					out,
					ServerFrame::Pong {
						client_time_unix_ms,
						server_time_unix_ms: unix_ms_now(),
					},
				)
				.await
			}
		}
	}

	async fn handle_authenticate(
		&self,
		conn_id: ConnectionId,
		state: &mut ConnState,
		out: &mpsc::Sender<Outbound>,
		token: String,
	) -> anyhow::Result<()> {
		if state.user.is_some() {
			return reply(out, ServerFrame::error("already authenticated")).await;
		}

		let user = match self.identity.verify(&token, state.remote_ip).await {
			Ok(user) => user,
			Err(e) => {
				metrics::counter!("courier_server_auth_failures_total", "reason" => e.detail()).increment(1);
				warn!(conn = %conn_id, error = %e, "authentication failed");
				return reply(
					out,
					ServerFrame::AuthError {
						message: e.to_string(),
						details: Some(e.detail().to_string()),
					},
				)
				.await;
			}
		};

		if let Some((prior_id, prior_tx)) = self.presence.bind_user(conn_id, user.clone()).await {
			info!(conn = %conn_id, prior = %prior_id, user = %user.id, "evicting prior session");
			metrics::counter!("courier_server_session_conflicts_total").increment(1);

			let _ = prior_tx.try_send(Outbound::Frame(ServerFrame::SessionConflict {
				message: "signed in from another connection".to_string(),
			}));
			let _ = prior_tx.try_send(Outbound::Close);

			self.cache.clear_session(prior_id, None);
		}

		self.cache.record_session(conn_id, &user.id);

		let online = self.presence.online_users(Some(&user.id)).await;
		let entries: Vec<PresenceEntry> = online.iter().map(PresenceEntry::from).collect();

		state.user = Some(user.clone());
		metrics::counter!("courier_server_auth_success_total").increment(1);
		info!(conn = %conn_id, user = %user.id, "authenticated");

		reply(
			out,
			ServerFrame::AuthSuccess {
				user: user.clone(),
				online_users: entries,
			},
		)
		.await?;

		self.presence
			.broadcast(
				&ServerFrame::UserOnline {
					user: PresenceEntry::from(&user),
				},
				Some(conn_id),
			)
			.await;

		Ok(())
	}

	async fn handle_get_online_users(&self, state: &ConnState, out: &mpsc::Sender<Outbound>) -> anyhow::Result<()> {
		let me = authed(state)?;
		let online = self.presence.online_users(Some(&me.id)).await;
		let users = online.iter().map(PresenceEntry::from).collect();
		reply(out, ServerFrame::OnlineUsers { users }).await
	}

	async fn handle_start_conversation(
		&self,
		state: &ConnState,
		out: &mpsc::Sender<Outbound>,
		recipient_id: String,
	) -> anyhow::Result<()> {
		let me = authed(state)?.clone();

		let recipient = match parse_peer(&me.id, &recipient_id) {
			Ok(r) => r,
			Err(frame) => return reply(out, frame).await,
		};

		// Conversations may only be started toward a currently online peer;
		// messages themselves still flow to offline recipients via history.
		let Some(recipient_user) = self.presence.user(&recipient).await else {
			return reply(
				out,
				ServerFrame::Error {
					message: "recipient is not online".to_string(),
					details: Some("peer_offline".to_string()),
					field: None,
					retry_after_secs: None,
					correlation_id: None,
				},
			)
			.await;
		};

		let (conversation_id, messages) = self.conversations.open(&me.id, &recipient).await;

		reply(
			out,
			ServerFrame::ConversationStarted {
				conversation_id: conversation_id.as_str().to_string(),
				recipient: PresenceEntry::from(&recipient_user),
				messages,
			},
		)
		.await
	}

	async fn handle_send(
		&self,
		state: &ConnState,
		out: &mpsc::Sender<Outbound>,
		recipient_id: String,
		content: String,
		reply_to: Option<String>,
	) -> anyhow::Result<()> {
		let me = authed(state)?.clone();

		let recipient = match parse_peer(&me.id, &recipient_id) {
			Ok(r) => r,
			Err(frame) => return reply(out, frame).await,
		};

		let content = content.trim().to_string();
		if content.is_empty() {
			return reply(out, ServerFrame::field_error("content is required", "content")).await;
		}
		if content.chars().count() > self.settings.max_message_chars {
			return reply(
				out,
				ServerFrame::field_error(
					format!("content exceeds {} characters", self.settings.max_message_chars),
					"content",
				),
			)
			.await;
		}

		let reply_to = match reply_to.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
			Some(raw) => match MessageId::parse(raw) {
				Ok(id) => Some(id),
				Err(_) => return reply(out, ServerFrame::field_error("reply_to must be a message id", "reply_to")).await,
			},
			None => None,
		};

		let warning = match self.moderation.score(&me.id, &content).await {
			ModerationVerdict::Allow => None,
			ModerationVerdict::Warn => {
				metrics::counter!("courier_server_moderation_verdicts_total", "verdict" => "warn").increment(1);
				Some("message flagged by moderation".to_string())
			}
			ModerationVerdict::Delete => {
				metrics::counter!("courier_server_moderation_verdicts_total", "verdict" => "delete").increment(1);
				return reply(
					out,
					ServerFrame::Error {
						message: "message blocked by moderation".to_string(),
						details: Some("moderation_delete".to_string()),
						field: None,
						retry_after_secs: None,
						correlation_id: None,
					},
				)
				.await;
			}
		};

		let message = Message {
			id: MessageId::new_v4(),
			conversation_id: ConversationId::for_pair(&me.id, &recipient),
			sender_id: me.id.clone(),
			recipient_id: recipient.clone(),
			content,
			created_at_unix_ms: unix_ms_now(),
			read: false,
			reply_to,
			edited: false,
			edited_at_unix_ms: None,
			reactions: Vec::new(),
			deleted_for_everyone: false,
		};

		self.conversations.append(message.clone()).await;
		self.counters.messages_total.fetch_add(1, Ordering::Relaxed);
		metrics::counter!("courier_server_messages_total").increment(1);

		reply(
			out,
			ServerFrame::PrivateMessageSent {
				message: message.clone(),
				warning,
			},
		)
		.await?;

		// Delivery is best effort; offline recipients pick the message up
		// from history on their next start_conversation.
		self.presence
			.send_to_user(&recipient, ServerFrame::NewPrivateMessage { message })
			.await;

		Ok(())
	}

	async fn handle_mark_read(
		&self,
		state: &ConnState,
		out: &mpsc::Sender<Outbound>,
		message_id: String,
	) -> anyhow::Result<()> {
		let me = authed(state)?.clone();

		let message_id = match parse_message_id(&message_id) {
			Ok(id) => id,
			Err(frame) => return reply(out, frame).await,
		};

		let message = match self.conversations.mark_read(&me.id, &message_id).await {
			Ok(m) => m,
			Err(e) => return reply(out, op_error_frame(e)).await,
		};

		reply(
			out,
			ServerFrame::MessageMarkedRead {
				message_id: message.id.to_string(),
				conversation_id: message.conversation_id.as_str().to_string(),
			},
		)
		.await?;

		self.presence
			.send_to_user(
				&message.sender_id,
				ServerFrame::MessageRead {
					message_id: message.id.to_string(),
					conversation_id: message.conversation_id.as_str().to_string(),
					reader_id: me.id.as_str().to_string(),
				},
			)
			.await;

		Ok(())
	}

	async fn handle_typing(
		&self,
		state: &ConnState,
		out: &mpsc::Sender<Outbound>,
		recipient_id: String,
		typing: Option<bool>,
	) -> anyhow::Result<()> {
		let me = authed(state)?.clone();

		let recipient = match parse_peer(&me.id, &recipient_id) {
			Ok(r) => r,
			Err(frame) => return reply(out, frame).await,
		};

		let Some(typing) = typing else {
			return reply(out, ServerFrame::field_error("typing must be true or false", "typing")).await;
		};

		reply(
			out,
			ServerFrame::TypingIndicatorSent {
				recipient_id: recipient.as_str().to_string(),
				typing,
			},
		)
		.await?;

		self.presence
			.send_to_user(
				&recipient,
				ServerFrame::TypingIndicator {
					sender_id: me.id.as_str().to_string(),
					typing,
				},
			)
			.await;

		Ok(())
	}

	async fn handle_add_reaction(
		&self,
		state: &ConnState,
		out: &mpsc::Sender<Outbound>,
		message_id: String,
		reaction: String,
	) -> anyhow::Result<()> {
		let me = authed(state)?.clone();

		let message_id = match parse_message_id(&message_id) {
			Ok(id) => id,
			Err(frame) => return reply(out, frame).await,
		};

		let (message, added) = match self.conversations.add_reaction(&me.id, &message_id, &reaction, unix_ms_now()).await {
			Ok(v) => v,
			Err(e) => return reply(out, op_error_frame(e)).await,
		};

		let frame = ServerFrame::ReactionAdded {
			message_id: message.id.to_string(),
			conversation_id: message.conversation_id.as_str().to_string(),
			reaction: added,
		};

		reply(out, frame.clone()).await?;
		self.notify_other_participant(&me.id, &message, frame).await;

		Ok(())
	}

	async fn handle_remove_reaction(
		&self,
		state: &ConnState,
		out: &mpsc::Sender<Outbound>,
		message_id: String,
		reaction: String,
	) -> anyhow::Result<()> {
		let me = authed(state)?.clone();

		let message_id = match parse_message_id(&message_id) {
			Ok(id) => id,
			Err(frame) => return reply(out, frame).await,
		};

		let message = match self.conversations.remove_reaction(&me.id, &message_id, &reaction).await {
			Ok(m) => m,
			Err(e) => return reply(out, op_error_frame(e)).await,
		};

		let frame = ServerFrame::ReactionRemoved {
			message_id: message.id.to_string(),
			conversation_id: message.conversation_id.as_str().to_string(),
			user_id: me.id.as_str().to_string(),
			reaction: reaction.trim().to_string(),
		};

		reply(out, frame.clone()).await?;
		self.notify_other_participant(&me.id, &message, frame).await;

		Ok(())
	}

	async fn handle_edit(
		&self,
		state: &ConnState,
		out: &mpsc::Sender<Outbound>,
		message_id: String,
		content: String,
	) -> anyhow::Result<()> {
		let me = authed(state)?.clone();

		let message_id = match parse_message_id(&message_id) {
			Ok(id) => id,
			Err(frame) => return reply(out, frame).await,
		};

		let content = content.trim().to_string();
		if content.is_empty() {
			return reply(out, ServerFrame::field_error("content is required", "content")).await;
		}
		if content.chars().count() > self.settings.max_message_chars {
			return reply(
				out,
				ServerFrame::field_error(
					format!("content exceeds {} characters", self.settings.max_message_chars),
					"content",
				),
			)
			.await;
		}

		let message = match self.conversations.edit(&me.id, &message_id, content, unix_ms_now()).await {
			Ok(m) => m,
			Err(e) => return reply(out, op_error_frame(e)).await,
		};

		let frame = ServerFrame::MessageEdited { message: message.clone() };
		reply(out, frame.clone()).await?;
		self.notify_other_participant(&me.id, &message, frame).await;

		Ok(())
	}

	async fn handle_delete_message(
		&self,
		state: &ConnState,
		out: &mpsc::Sender<Outbound>,
		message_id: String,
		scope: DeleteScope,
	) -> anyhow::Result<()> {
		let me = authed(state)?.clone();

		let message_id = match parse_message_id(&message_id) {
			Ok(id) => id,
			Err(frame) => return reply(out, frame).await,
		};

		let (message, other) = match self.conversations.delete_message(&me.id, &message_id, scope).await {
			Ok(v) => v,
			Err(e) => return reply(out, op_error_frame(e)).await,
		};

		let frame = ServerFrame::MessageDeleted {
			message_id: message.id.to_string(),
			conversation_id: message.conversation_id.as_str().to_string(),
			scope,
		};

		reply(out, frame.clone()).await?;

		if scope == DeleteScope::Everyone {
			self.presence.send_to_user(&other, frame).await;
		}

		Ok(())
	}

	async fn handle_delete_conversation(
		&self,
		state: &ConnState,
		out: &mpsc::Sender<Outbound>,
		conversation_id: String,
		scope: DeleteScope,
	) -> anyhow::Result<()> {
		let me = authed(state)?.clone();

		let conversation_id = match ConversationId::parse(&conversation_id) {
			Ok(id) => id,
			Err(_) => {
				return reply(
					out,
					ServerFrame::field_error("conversation_id is required", "conversation_id"),
				)
				.await;
			}
		};

		let other = match self.conversations.delete_conversation(&me.id, &conversation_id, scope).await {
			Ok(other) => other,
			Err(e) => return reply(out, op_error_frame(e)).await,
		};

		let frame = ServerFrame::ConversationDeleted {
			conversation_id: conversation_id.as_str().to_string(),
			scope,
		};

		reply(out, frame.clone()).await?;

		if scope == DeleteScope::Everyone {
			self.presence.send_to_user(&other, frame).await;
		}

		Ok(())
	}

	async fn notify_other_participant(&self, me: &UserId, message: &Message, frame: ServerFrame) {
		let other = if message.sender_id == *me {
			&message.recipient_id
		} else {
			&message.sender_id
		};
		self.presence.send_to_user(other, frame).await;
	}
}

fn authed(state: &ConnState) -> anyhow::Result<&User> {
	// The unauthenticated gate runs before dispatch; this is unreachable for
	// well-formed flow but kept as an error rather than a panic.
	state.user.as_ref().ok_or_else(|| anyhow!("frame dispatched without authentication"))
}

fn parse_peer(me: &UserId, raw: &str) -> Result<UserId, ServerFrame> {
	let raw = raw.trim();
	if raw.is_empty() {
		return Err(ServerFrame::field_error("recipient_id is required", "recipient_id"));
	}

	let peer = UserId::new(raw).map_err(|_| ServerFrame::field_error("recipient_id is required", "recipient_id"))?;

	if peer == *me {
		return Err(ServerFrame::field_error(
			"cannot address yourself",
			"recipient_id",
		));
	}

	Ok(peer)
}

fn parse_message_id(raw: &str) -> Result<MessageId, ServerFrame> {
	MessageId::parse(raw).map_err(|_| ServerFrame::field_error("message_id must be a message id", "message_id"))
}

fn op_error_frame(e: OpError) -> ServerFrame {
	let details = match &e {
		OpError::MessageNotFound => "message_not_found",
		OpError::ConversationNotFound => "conversation_not_found",
		OpError::NotParticipant => "not_participant",
		OpError::NotRecipient => "not_recipient",
		OpError::NotSender => "not_sender",
		OpError::EditWindowElapsed => "edit_window_elapsed",
		OpError::DuplicateReaction => "duplicate_reaction",
		OpError::NoSuchReaction => "no_such_reaction",
		OpError::InvalidReaction(_) => "invalid_reaction",
	};

	ServerFrame::Error {
		message: e.to_string(),
		details: Some(details.to_string()),
		field: None,
		retry_after_secs: None,
		correlation_id: None,
	}
}

async fn reply(out: &mpsc::Sender<Outbound>, frame: ServerFrame) -> anyhow::Result<()> {
	out.send(Outbound::Frame(frame))
		.await
		.map_err(|_| anyhow!("outbound queue closed"))
}
