#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use courier_domain::{User, UserId};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Why an `authenticate` attempt was rejected.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
	#[error("missing auth token")]
	MissingToken,

	#[error("malformed auth token")]
	MalformedToken,

	#[error("token rejected by identity backend")]
	BackendRejected,

	#[error("identity backend unreachable: {0}")]
	BackendUnreachable(String),
}

impl AuthError {
	/// Short machine-readable detail for error frames.
	pub fn detail(&self) -> &'static str {
		match self {
			AuthError::MissingToken => "missing_token",
			AuthError::MalformedToken => "malformed_token",
			AuthError::BackendRejected => "rejected",
			AuthError::BackendUnreachable(_) => "backend_unreachable",
		}
	}
}

/// Cheap local structure check run before any backend round trip.
///
/// Tokens are `v1.<payload-b64>.<signature-b64>`; the backend owns signature
/// verification, this only weeds out garbage early.
pub fn validate_token_structure(token: &str) -> Result<(), AuthError> {
	let token = token.trim();
	if token.is_empty() {
		return Err(AuthError::MissingToken);
	}

	let parts = token.split('.').collect::<Vec<_>>();
	if parts.len() != 3 || parts[0] != "v1" {
		return Err(AuthError::MalformedToken);
	}

	if URL_SAFE_NO_PAD.decode(parts[1]).is_err() || URL_SAFE_NO_PAD.decode(parts[2]).is_err() {
		return Err(AuthError::MalformedToken);
	}

	Ok(())
}

/// Resolves an auth token to a verified identity.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
	async fn verify(&self, token: &str, source_ip: IpAddr) -> Result<User, AuthError>;
}

#[derive(Debug, Serialize)]
struct VerifyRequest<'a> {
	token: &'a str,
	source_ip: String,
}

#[derive(Debug, Deserialize)]
struct VerifyResponse {
	valid: bool,
	user_id: Option<String>,
	username: Option<String>,
	display_name: Option<String>,
	email: Option<String>,
}

/// Identity verifier backed by an external HTTP service.
pub struct HttpIdentityVerifier {
	client: reqwest::Client,
	backend_url: String,
}

impl HttpIdentityVerifier {
	pub fn new(backend_url: String, timeout: Duration) -> anyhow::Result<Self> {
		let client = reqwest::Client::builder().timeout(timeout).build()?;
		Ok(Self { client, backend_url })
	}
}

#[async_trait]
impl IdentityVerifier for HttpIdentityVerifier {
	async fn verify(&self, token: &str, source_ip: IpAddr) -> Result<User, AuthError> {
		validate_token_structure(token)?;

		let request = VerifyRequest {
			token,
			source_ip: source_ip.to_string(),
		};

		let response = self
			.client
			.post(&self.backend_url)
			.json(&request)
			.send()
			.await
			.map_err(|e| AuthError::BackendUnreachable(e.to_string()))?;

		if !response.status().is_success() {
			if response.status().is_client_error() {
				return Err(AuthError::BackendRejected);
			}
			return Err(AuthError::BackendUnreachable(format!(
				"backend returned {}",
				response.status()
			)));
		}

		let body: VerifyResponse = response
			.json()
			.await
			.map_err(|e| AuthError::BackendUnreachable(e.to_string()))?;

		if !body.valid {
			return Err(AuthError::BackendRejected);
		}

		let Some(raw_id) = body.user_id else {
			warn!("identity backend returned valid=true without user_id");
			return Err(AuthError::BackendRejected);
		};

		let id = UserId::new(&raw_id).map_err(|_| AuthError::BackendRejected)?;
		let username = body.username.unwrap_or_else(|| raw_id.clone());

		Ok(User {
			id,
			username,
			display_name: body.display_name.unwrap_or_default(),
			email: body.email.unwrap_or_default(),
		})
	}
}

/// Fixed token-to-user map. Test and dev use only.
#[derive(Default)]
pub struct StaticIdentityVerifier {
	users: HashMap<String, User>,
}

impl StaticIdentityVerifier {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_user(mut self, token: &str, user: User) -> Self {
		self.users.insert(token.to_string(), user);
		self
	}
}

#[async_trait]
impl IdentityVerifier for StaticIdentityVerifier {
	async fn verify(&self, token: &str, _source_ip: IpAddr) -> Result<User, AuthError> {
		let token = token.trim();
		if token.is_empty() {
			return Err(AuthError::MissingToken);
		}

		self.users.get(token).cloned().ok_or(AuthError::BackendRejected)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::net::Ipv4Addr;

	fn b64(s: &str) -> String {
		URL_SAFE_NO_PAD.encode(s.as_bytes())
	}

	#[test]
	fn token_structure_rejects_garbage() {
		assert!(matches!(validate_token_structure(""), Err(AuthError::MissingToken)));
		assert!(matches!(validate_token_structure("   "), Err(AuthError::MissingToken)));
		assert!(matches!(validate_token_structure("abc"), Err(AuthError::MalformedToken)));
		assert!(matches!(
			validate_token_structure("v2.aaaa.bbbb"),
			Err(AuthError::MalformedToken)
		));
		assert!(matches!(
			validate_token_structure("v1.!!.??"),
			Err(AuthError::MalformedToken)
		));
	}

	#[test]
	fn token_structure_accepts_well_formed() {
		let token = format!("v1.{}.{}", b64("{\"sub\":\"alice\"}"), b64("sig"));
		assert!(validate_token_structure(&token).is_ok());
	}

	#[tokio::test]
	async fn static_verifier_resolves_known_tokens() {
		let user = User {
			id: UserId::new("alice").expect("id"),
			username: "alice".to_string(),
			display_name: String::new(),
			email: String::new(),
		};
		let verifier = StaticIdentityVerifier::new().with_user("tok-alice", user.clone());
		let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);

		let got = verifier.verify("tok-alice", ip).await.expect("verify");
		assert_eq!(got.id, user.id);

		assert!(matches!(verifier.verify("tok-bob", ip).await, Err(AuthError::BackendRejected)));
		assert!(matches!(verifier.verify("", ip).await, Err(AuthError::MissingToken)));
	}
}
