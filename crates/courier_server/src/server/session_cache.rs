#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::Context as _;
use courier_domain::{ConnectionId, UserId};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::{debug, warn};

/// Best-effort redis mirror of live session state.
///
/// Every write is fire-and-forget; a cache outage must never block or fail
/// message flow. The in-process presence registry stays authoritative.
#[derive(Clone)]
pub struct SessionCache {
	manager: Option<ConnectionManager>,
	ttl: Duration,
}

impl SessionCache {
	pub async fn connect(redis_url: &str, ttl: Duration) -> anyhow::Result<Self> {
		let client = redis::Client::open(redis_url).context("parse redis url")?;
		let manager = ConnectionManager::new(client).await.context("connect redis")?;

		Ok(Self {
			manager: Some(manager),
			ttl,
		})
	}

	pub fn disabled() -> Self {
		Self {
			manager: None,
			ttl: Duration::from_secs(0),
		}
	}

	pub fn is_enabled(&self) -> bool {
		self.manager.is_some()
	}

	/// Mirrors a bound session: user -> connection and connection -> user.
	pub fn record_session(&self, conn_id: ConnectionId, user: &UserId) {
		let Some(manager) = self.manager.clone() else {
			return;
		};

		let ttl_secs = self.ttl.as_secs();
		let session_key = session_key(user);
		let conn_key = conn_key(conn_id);
		let user_value = user.as_str().to_string();
		let conn_value = conn_id.to_string();

		tokio::spawn(async move {
			let mut manager = manager;
			let result: redis::RedisResult<()> = async {
				let _: () = manager.set_ex(&session_key, &conn_value, ttl_secs).await?;
				let _: () = manager.set_ex(&conn_key, &user_value, ttl_secs).await?;
				Ok(())
			}
			.await;

			match result {
				Ok(()) => debug!(user = %user_value, conn = %conn_value, "session mirrored to cache"),
				Err(e) => {
					metrics::counter!("courier_server_session_cache_failures_total").increment(1);
					warn!(error = %e, "failed to mirror session to cache");
				}
			}
		});
	}

	/// Clears the mirror for a closed or evicted session.
	pub fn clear_session(&self, conn_id: ConnectionId, user: Option<&UserId>) {
		let Some(manager) = self.manager.clone() else {
			return;
		};

		let conn_key = conn_key(conn_id);
		let session_key = user.map(session_key);

		tokio::spawn(async move {
			let mut manager = manager;
			let result: redis::RedisResult<()> = async {
				let _: () = manager.del(&conn_key).await?;
				if let Some(key) = session_key {
					let _: () = manager.del(&key).await?;
				}
				Ok(())
			}
			.await;

			if let Err(e) = result {
				metrics::counter!("courier_server_session_cache_failures_total").increment(1);
				warn!(error = %e, "failed to clear session from cache");
			}
		});
	}
}

fn session_key(user: &UserId) -> String {
	format!("courier:session:{user}")
}

fn conn_key(conn_id: ConnectionId) -> String {
	format!("courier:conn:{conn_id}")
}
