#![forbid(unsafe_code)]

use courier_domain::{ConnectionId, User, UserId};
use courier_protocol::ServerFrame;
use tokio::sync::mpsc;

use crate::server::presence::{Outbound, PresenceRegistry};

fn user(id: &str) -> User {
	User {
		id: UserId::new(id).expect("valid user id"),
		username: id.to_string(),
		display_name: String::new(),
		email: String::new(),
	}
}

#[tokio::test]
async fn bind_and_unregister_round_trip() {
	let registry = PresenceRegistry::new();
	let conn = ConnectionId(1);
	let (tx, _rx) = mpsc::channel(8);

	registry.register(conn, tx).await;
	assert!(registry.bind_user(conn, user("alice")).await.is_none());
	assert!(registry.is_online(&user("alice").id).await);

	let gone = registry.unregister(conn).await.expect("bound user");
	assert_eq!(gone.id.as_str(), "alice");
	assert!(!registry.is_online(&user("alice").id).await);
}

#[tokio::test]
async fn second_session_evicts_first() {
	let registry = PresenceRegistry::new();
	let (tx1, mut rx1) = mpsc::channel(8);
	let (tx2, _rx2) = mpsc::channel(8);

	registry.register(ConnectionId(1), tx1).await;
	registry.register(ConnectionId(2), tx2).await;

	assert!(registry.bind_user(ConnectionId(1), user("alice")).await.is_none());

	let (prior_id, prior_tx) = registry
		.bind_user(ConnectionId(2), user("alice"))
		.await
		.expect("prior session");
	assert_eq!(prior_id, ConnectionId(1));

	prior_tx
		.try_send(Outbound::Frame(ServerFrame::SessionConflict {
			message: "signed in elsewhere".to_string(),
		}))
		.expect("enqueue");
	assert!(matches!(rx1.recv().await, Some(Outbound::Frame(ServerFrame::SessionConflict { .. }))));

	// The evicted connection no longer owns the user.
	assert!(registry.unregister(ConnectionId(1)).await.is_none());
	assert!(registry.is_online(&user("alice").id).await);
}

#[tokio::test]
async fn send_to_user_targets_active_connection() {
	let registry = PresenceRegistry::new();
	let (tx, mut rx) = mpsc::channel(8);

	registry.register(ConnectionId(7), tx).await;
	registry.bind_user(ConnectionId(7), user("bob")).await;

	assert!(
		registry
			.send_to_user(&user("bob").id, ServerFrame::error("test"))
			.await
	);
	assert!(matches!(rx.recv().await, Some(Outbound::Frame(ServerFrame::Error { .. }))));

	assert!(
		!registry
			.send_to_user(&user("nobody").id, ServerFrame::error("test"))
			.await
	);
}

#[tokio::test]
async fn broadcast_skips_unauthenticated_and_excluded() {
	let registry = PresenceRegistry::new();
	let (tx1, mut rx1) = mpsc::channel(8);
	let (tx2, mut rx2) = mpsc::channel(8);
	let (tx3, mut rx3) = mpsc::channel(8);

	registry.register(ConnectionId(1), tx1).await;
	registry.register(ConnectionId(2), tx2).await;
	registry.register(ConnectionId(3), tx3).await;

	registry.bind_user(ConnectionId(1), user("alice")).await;
	registry.bind_user(ConnectionId(2), user("bob")).await;
	// ConnectionId(3) never authenticates.

	registry
		.broadcast(&ServerFrame::UserOffline { user_id: "x".to_string() }, Some(ConnectionId(1)))
		.await;

	assert!(rx1.try_recv().is_err());
	assert!(matches!(rx2.try_recv(), Ok(Outbound::Frame(ServerFrame::UserOffline { .. }))));
	assert!(rx3.try_recv().is_err());
}

#[tokio::test]
async fn online_users_snapshot_is_sorted_and_filtered() {
	let registry = PresenceRegistry::new();
	let (tx1, _rx1) = mpsc::channel(8);
	let (tx2, _rx2) = mpsc::channel(8);

	registry.register(ConnectionId(1), tx1).await;
	registry.register(ConnectionId(2), tx2).await;
	registry.bind_user(ConnectionId(1), user("zoe")).await;
	registry.bind_user(ConnectionId(2), user("ada")).await;

	let all = registry.online_users(None).await;
	assert_eq!(all.len(), 2);
	assert_eq!(all[0].id.as_str(), "ada");
	assert_eq!(all[1].id.as_str(), "zoe");

	let without_zoe = registry.online_users(Some(&user("zoe").id)).await;
	assert_eq!(without_zoe.len(), 1);
	assert_eq!(without_zoe[0].id.as_str(), "ada");
}

#[tokio::test]
async fn full_queue_drops_instead_of_blocking() {
	let registry = PresenceRegistry::new();
	let (tx, _rx) = mpsc::channel(1);

	registry.register(ConnectionId(1), tx).await;
	registry.bind_user(ConnectionId(1), user("alice")).await;

	assert!(
		registry
			.send_to_user(&user("alice").id, ServerFrame::error("one"))
			.await
	);
	assert!(
		!registry
			.send_to_user(&user("alice").id, ServerFrame::error("two"))
			.await
	);
}
