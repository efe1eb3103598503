#![forbid(unsafe_code)]

use std::time::Duration;

use async_trait::async_trait;
use courier_domain::{ModerationVerdict, UserId};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Scores outgoing message content before delivery.
#[async_trait]
pub trait ModerationClient: Send + Sync {
	async fn score(&self, sender: &UserId, content: &str) -> ModerationVerdict;
}

#[derive(Debug, Serialize)]
struct ScoreRequest<'a> {
	sender_id: &'a str,
	content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ScoreResponse {
	verdict: ModerationVerdict,
}

/// Moderation backed by an external HTTP classifier.
///
/// Fails open: an unreachable or misbehaving classifier never blocks
/// delivery.
pub struct HttpModerationClient {
	client: reqwest::Client,
	url: String,
}

impl HttpModerationClient {
	pub fn new(url: String, timeout: Duration) -> anyhow::Result<Self> {
		let client = reqwest::Client::builder().timeout(timeout).build()?;
		Ok(Self { client, url })
	}
}

#[async_trait]
impl ModerationClient for HttpModerationClient {
	async fn score(&self, sender: &UserId, content: &str) -> ModerationVerdict {
		let request = ScoreRequest {
			sender_id: sender.as_str(),
			content,
		};

		let response = match self.client.post(&self.url).json(&request).send().await {
			Ok(r) => r,
			Err(e) => {
				metrics::counter!("courier_server_moderation_failures_total").increment(1);
				warn!(error = %e, "moderation backend unreachable; allowing message");
				return ModerationVerdict::Allow;
			}
		};

		if !response.status().is_success() {
			metrics::counter!("courier_server_moderation_failures_total").increment(1);
			warn!(status = %response.status(), "moderation backend error; allowing message");
			return ModerationVerdict::Allow;
		}

		match response.json::<ScoreResponse>().await {
			Ok(body) => body.verdict,
			Err(e) => {
				metrics::counter!("courier_server_moderation_failures_total").increment(1);
				warn!(error = %e, "invalid moderation response; allowing message");
				ModerationVerdict::Allow
			}
		}
	}
}

/// Allow-everything moderation used when no classifier is configured.
#[derive(Debug, Default)]
pub struct DisabledModeration;

#[async_trait]
impl ModerationClient for DisabledModeration {
	async fn score(&self, _sender: &UserId, _content: &str) -> ModerationVerdict {
		ModerationVerdict::Allow
	}
}

#[cfg(test)]
pub(crate) mod test_support {
	use super::*;

	/// Returns a fixed verdict for every message.
	pub struct FixedModeration(pub ModerationVerdict);

	#[async_trait]
	impl ModerationClient for FixedModeration {
		async fn score(&self, _sender: &UserId, _content: &str) -> ModerationVerdict {
			self.0
		}
	}
}
