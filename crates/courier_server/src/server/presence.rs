#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use courier_domain::{ConnectionId, User, UserId};
use courier_protocol::ServerFrame;
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

/// Item on a connection's outbound queue.
///
/// Only the connection's writer task touches its QUIC send stream; everyone
/// else enqueues through here.
#[derive(Debug, Clone)]
pub enum Outbound {
	Frame(ServerFrame),

	/// Ask the writer to finish the stream and stop.
	Close,
}

struct ConnEntry {
	tx: mpsc::Sender<Outbound>,
	user: Option<User>,
}

#[derive(Default)]
struct Inner {
	connections: HashMap<ConnectionId, ConnEntry>,
	by_user: HashMap<UserId, ConnectionId>,
}

/// Registry of live connections and which user each is bound to.
///
/// One active session per user: binding a user to a new connection evicts
/// any prior one.
#[derive(Clone, Default)]
pub struct PresenceRegistry {
	inner: Arc<Mutex<Inner>>,
}

impl PresenceRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Registers a freshly accepted, not-yet-authenticated connection.
	pub async fn register(&self, conn_id: ConnectionId, tx: mpsc::Sender<Outbound>) {
		let mut inner = self.inner.lock().await;
		inner.connections.insert(conn_id, ConnEntry { tx, user: None });
	}

	/// Binds an authenticated user to a connection.
	///
	/// Returns the evicted prior connection, if the user was already online
	/// elsewhere.
	pub async fn bind_user(&self, conn_id: ConnectionId, user: User) -> Option<(ConnectionId, mpsc::Sender<Outbound>)> {
		let mut inner = self.inner.lock().await;

		let prior = match inner.by_user.get(&user.id) {
			Some(prior_id) if *prior_id != conn_id => {
				let prior_id = *prior_id;
				inner.connections.get(&prior_id).map(|entry| (prior_id, entry.tx.clone()))
			}
			_ => None,
		};

		if let Some((prior_id, _)) = &prior {
			if let Some(entry) = inner.connections.get_mut(prior_id) {
				entry.user = None;
			}
		}

		inner.by_user.insert(user.id.clone(), conn_id);
		if let Some(entry) = inner.connections.get_mut(&conn_id) {
			entry.user = Some(user);
		}

		prior
	}

	/// Removes a connection, returning its bound user if it was the active
	/// session for that user.
	pub async fn unregister(&self, conn_id: ConnectionId) -> Option<User> {
		let mut inner = self.inner.lock().await;
		let entry = inner.connections.remove(&conn_id)?;
		let user = entry.user?;

		match inner.by_user.get(&user.id) {
			Some(active) if *active == conn_id => {
				inner.by_user.remove(&user.id);
				Some(user)
			}
			_ => None,
		}
	}

	pub async fn is_online(&self, user: &UserId) -> bool {
		let inner = self.inner.lock().await;
		inner.by_user.contains_key(user)
	}

	/// Full identity of an online user, if any.
	pub async fn user(&self, user: &UserId) -> Option<User> {
		let inner = self.inner.lock().await;
		let conn_id = inner.by_user.get(user)?;
		inner.connections.get(conn_id)?.user.clone()
	}

	/// Snapshot of all online users, excluding `exclude` if given.
	pub async fn online_users(&self, exclude: Option<&UserId>) -> Vec<User> {
		let inner = self.inner.lock().await;
		let mut users: Vec<User> = inner
			.connections
			.values()
			.filter_map(|entry| entry.user.clone())
			.filter(|user| exclude != Some(&user.id))
			.collect();
		users.sort_by(|a, b| a.id.cmp(&b.id));
		users
	}

	/// Enqueues a frame for a user's active connection.
	///
	/// Returns false if the user is offline or their queue is full.
	pub async fn send_to_user(&self, user: &UserId, frame: ServerFrame) -> bool {
		let inner = self.inner.lock().await;
		let Some(conn_id) = inner.by_user.get(user) else {
			return false;
		};
		let Some(entry) = inner.connections.get(conn_id) else {
			return false;
		};

		enqueue(&entry.tx, Outbound::Frame(frame))
	}

	pub async fn send_to_conn(&self, conn_id: ConnectionId, frame: ServerFrame) -> bool {
		let inner = self.inner.lock().await;
		let Some(entry) = inner.connections.get(&conn_id) else {
			return false;
		};

		enqueue(&entry.tx, Outbound::Frame(frame))
	}

	/// Broadcasts a frame to all authenticated connections except `exclude`.
	pub async fn broadcast(&self, frame: &ServerFrame, exclude: Option<ConnectionId>) {
		let inner = self.inner.lock().await;
		for (conn_id, entry) in inner.connections.iter() {
			if entry.user.is_none() || Some(*conn_id) == exclude {
				continue;
			}
			enqueue(&entry.tx, Outbound::Frame(frame.clone()));
		}
	}

	pub async fn connection_count(&self) -> usize {
		let inner = self.inner.lock().await;
		inner.connections.len()
	}
}

fn enqueue(tx: &mpsc::Sender<Outbound>, item: Outbound) -> bool {
	match tx.try_send(item) {
		Ok(()) => true,
		Err(mpsc::error::TrySendError::Full(_)) => {
			metrics::counter!("courier_server_outbound_dropped_total").increment(1);
			debug!("outbound queue full; frame dropped");
			false
		}
		Err(mpsc::error::TrySendError::Closed(_)) => false,
	}
}
