#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tracing::info;

/// Default config path: `~/.courier/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".courier").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
#[allow(dead_code)]
pub fn load_server_config() -> anyhow::Result<ServerConfig> {
	let path = default_config_path()?;
	load_server_config_from_path(&path)
}

/// Same as `load_server_config` but with an explicit config path.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

/// Server config (v1).
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub limits: LimitSettings,
	pub identity: IdentitySettings,
	pub moderation: ModerationSettings,
	pub persistence: PersistenceSettings,
	pub cache: CacheSettings,
}

/// Server settings loaded by the server.
#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
	/// PEM-encoded certificate path for QUIC/TLS.
	pub tls_cert_path: Option<PathBuf>,
	/// PEM-encoded private key path for QUIC/TLS.
	pub tls_key_path: Option<PathBuf>,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/status HTTP bind address (host:port).
	pub health_bind: Option<String>,
}

/// Admission and rate-limit tunables.
#[derive(Debug, Clone)]
pub struct LimitSettings {
	/// Maximum concurrent connections per source IP.
	pub max_connections_per_ip: u32,
	/// Coarse per-IP admission window (connections per minute).
	pub ip_admissions_per_minute: u32,
	/// Per-user, per-message-type allowance (events per minute).
	pub messages_per_minute: u32,
	/// Content length above which the message allowance is doubled.
	pub long_message_chars: usize,
	/// Hard cap on message content length.
	pub max_message_chars: usize,
	/// Idle timeout after which a silent connection is closed.
	pub idle_timeout: Duration,
	/// In-memory retention cap per conversation.
	pub conversation_retention: usize,
	/// History window returned by start_conversation.
	pub history_limit: usize,
}

impl Default for LimitSettings {
	fn default() -> Self {
		Self {
			max_connections_per_ip: 8,
			ip_admissions_per_minute: 60,
			messages_per_minute: 30,
			long_message_chars: 500,
			max_message_chars: 2000,
			idle_timeout: Duration::from_secs(300),
			conversation_retention: 200,
			history_limit: 50,
		}
	}
}

/// Identity backend settings.
#[derive(Debug, Clone)]
pub struct IdentitySettings {
	/// Verification endpoint (POST token + source IP).
	pub backend_url: String,
	/// Bound on the identity backend round trip.
	pub timeout: Duration,
}

impl Default for IdentitySettings {
	fn default() -> Self {
		Self {
			backend_url: "http://127.0.0.1:8089/api/verify".to_string(),
			timeout: Duration::from_secs(5),
		}
	}
}

/// Moderation scoring settings.
#[derive(Debug, Clone)]
pub struct ModerationSettings {
	/// Scoring endpoint; when unset moderation is disabled (allow-all).
	pub url: Option<String>,
	pub timeout: Duration,
}

impl Default for ModerationSettings {
	fn default() -> Self {
		Self {
			url: None,
			timeout: Duration::from_secs(3),
		}
	}
}

/// Durable store settings.
#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	/// Enable the durable message store.
	pub enabled: bool,
	/// Database URL (sqlite: or postgres:).
	pub database_url: Option<String>,
}

/// Session cache settings.
#[derive(Debug, Clone)]
pub struct CacheSettings {
	/// Redis URL; when unset the mirror is disabled.
	pub redis_url: Option<String>,
	/// Expiry applied to mirrored session keys.
	pub session_ttl: Duration,
}

impl Default for CacheSettings {
	fn default() -> Self {
		Self {
			redis_url: None,
			session_ttl: Duration::from_secs(24 * 60 * 60),
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	limits: FileLimitSettings,

	#[serde(default)]
	identity: FileIdentitySettings,

	#[serde(default)]
	moderation: FileModerationSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,

	#[serde(default)]
	cache: FileCacheSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	tls_cert_path: Option<String>,
	tls_key_path: Option<String>,
	metrics_bind: Option<String>,
	health_bind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileLimitSettings {
	max_connections_per_ip: Option<u32>,
	ip_admissions_per_minute: Option<u32>,
	messages_per_minute: Option<u32>,
	long_message_chars: Option<usize>,
	max_message_chars: Option<usize>,
	idle_timeout_secs: Option<u64>,
	conversation_retention: Option<usize>,
	history_limit: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileIdentitySettings {
	backend_url: Option<String>,
	timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileModerationSettings {
	url: Option<String>,
	timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	enabled: Option<bool>,
	database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileCacheSettings {
	redis_url: Option<String>,
	session_ttl_secs: Option<u64>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let defaults = LimitSettings::default();
		let limits = LimitSettings {
			max_connections_per_ip: file.limits.max_connections_per_ip.unwrap_or(defaults.max_connections_per_ip),
			ip_admissions_per_minute: file
				.limits
				.ip_admissions_per_minute
				.unwrap_or(defaults.ip_admissions_per_minute),
			messages_per_minute: file.limits.messages_per_minute.unwrap_or(defaults.messages_per_minute),
			long_message_chars: file.limits.long_message_chars.unwrap_or(defaults.long_message_chars),
			max_message_chars: file.limits.max_message_chars.unwrap_or(defaults.max_message_chars),
			idle_timeout: file
				.limits
				.idle_timeout_secs
				.map(Duration::from_secs)
				.unwrap_or(defaults.idle_timeout),
			conversation_retention: file
				.limits
				.conversation_retention
				.unwrap_or(defaults.conversation_retention),
			history_limit: file.limits.history_limit.unwrap_or(defaults.history_limit),
		};

		let identity_defaults = IdentitySettings::default();
		let identity = IdentitySettings {
			backend_url: file
				.identity
				.backend_url
				.filter(|s| !s.trim().is_empty())
				.unwrap_or(identity_defaults.backend_url),
			timeout: file
				.identity
				.timeout_ms
				.map(Duration::from_millis)
				.unwrap_or(identity_defaults.timeout),
		};

		let moderation_defaults = ModerationSettings::default();
		let moderation = ModerationSettings {
			url: file.moderation.url.filter(|s| !s.trim().is_empty()),
			timeout: file
				.moderation
				.timeout_ms
				.map(Duration::from_millis)
				.unwrap_or(moderation_defaults.timeout),
		};

		let cache_defaults = CacheSettings::default();
		let cache = CacheSettings {
			redis_url: file.cache.redis_url.filter(|s| !s.trim().is_empty()),
			session_ttl: file
				.cache
				.session_ttl_secs
				.map(Duration::from_secs)
				.unwrap_or(cache_defaults.session_ttl),
		};

		Self {
			server: ServerSettings {
				tls_cert_path: file.server.tls_cert_path.filter(|s| !s.trim().is_empty()).map(PathBuf::from),
				tls_key_path: file.server.tls_key_path.filter(|s| !s.trim().is_empty()).map(PathBuf::from),
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				health_bind: file.server.health_bind.filter(|s| !s.trim().is_empty()),
			},
			limits,
			identity,
			moderation,
			persistence: PersistenceSettings {
				enabled: file.persistence.enabled.unwrap_or(false),
				database_url: file.persistence.database_url.filter(|s| !s.trim().is_empty()),
			},
			cache,
		}
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Ok(v) = std::env::var("COURIER_TLS_CERT") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.tls_cert_path = Some(PathBuf::from(v));
			info!("server config: tls_cert_path overridden by env");
		}
	}

	if let Ok(v) = std::env::var("COURIER_TLS_KEY") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.tls_key_path = Some(PathBuf::from(v));
			info!("server config: tls_key_path overridden by env");
		}
	}

	if let Ok(v) = std::env::var("COURIER_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("COURIER_HEALTH_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.health_bind = Some(v);
			info!("server config: health_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("COURIER_MAX_CONNECTIONS_PER_IP")
		&& let Ok(n) = v.trim().parse::<u32>()
	{
		cfg.limits.max_connections_per_ip = n;
		info!(n, "limits: max_connections_per_ip overridden by env");
	}

	if let Ok(v) = std::env::var("COURIER_IP_ADMISSIONS_PER_MINUTE")
		&& let Ok(n) = v.trim().parse::<u32>()
	{
		cfg.limits.ip_admissions_per_minute = n;
		info!(n, "limits: ip_admissions_per_minute overridden by env");
	}

	if let Ok(v) = std::env::var("COURIER_MESSAGES_PER_MINUTE")
		&& let Ok(n) = v.trim().parse::<u32>()
	{
		cfg.limits.messages_per_minute = n;
		info!(n, "limits: messages_per_minute overridden by env");
	}

	if let Ok(v) = std::env::var("COURIER_IDLE_TIMEOUT_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
	{
		cfg.limits.idle_timeout = Duration::from_secs(secs);
		info!(secs, "limits: idle_timeout overridden by env");
	}

	if let Ok(v) = std::env::var("COURIER_IDENTITY_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.identity.backend_url = v;
			info!("identity: backend_url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("COURIER_IDENTITY_TIMEOUT_MS")
		&& let Ok(ms) = v.trim().parse::<u64>()
	{
		cfg.identity.timeout = Duration::from_millis(ms);
		info!(ms, "identity: timeout overridden by env");
	}

	if let Ok(v) = std::env::var("COURIER_MODERATION_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.moderation.url = Some(v);
			info!("moderation: url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("COURIER_PERSISTENCE_ENABLED")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.persistence.enabled = enabled;
		info!(enabled, "persistence: enabled overridden by env");
	}

	if let Ok(v) = std::env::var("COURIER_DATABASE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.persistence.database_url = Some(v);
			info!("persistence: database_url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("COURIER_REDIS_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.cache.redis_url = Some(v);
			info!("cache: redis_url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("COURIER_SESSION_TTL_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
	{
		cfg.cache.session_ttl = Duration::from_secs(secs);
		info!(secs, "cache: session_ttl overridden by env");
	}
}
