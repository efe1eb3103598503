#![forbid(unsafe_code)]

mod config;
mod quic;
mod server;
mod util;

use std::net::SocketAddr;
use std::sync::Arc;

use courier_domain::ConnectionId;
use tokio::sync::Mutex;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::quic::config::QuicServerConfig;
use crate::server::connection::{ConnectionSettings, handle_connection};
use crate::server::conversations::{ConversationSettings, ConversationStore};
use crate::server::health::{HealthState, spawn_health_server};
use crate::server::identity::{HttpIdentityVerifier, IdentityVerifier};
use crate::server::moderation::{DisabledModeration, HttpModerationClient, ModerationClient};
use crate::server::presence::PresenceRegistry;
use crate::server::rate_limit::{IpConnectionQuota, IpRateLimiter, UserRateLimiter};
use crate::server::router::{Gateway, GatewayCounters, GatewaySettings};
use crate::server::session_cache::SessionCache;
use crate::server::store::MessageStore;
use crate::util::endpoint::QuicEndpoint;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: courier_server [--bind quic://host:port]\n\
\n\
Options:\n\
\t--bind    Bind endpoint (default: quic://127.0.0.1:18210)\n\
\t         Format: quic://host:port\n\
\t--help   Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> SocketAddr {
	let mut bind_endpoint = "quic://127.0.0.1:18210".to_string();

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected quic://host:port)");
					usage_and_exit();
				}
				bind_endpoint = v;
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	let bind = QuicEndpoint::parse(&bind_endpoint).unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	let addr: SocketAddr = bind.to_socket_addr_if_ip_literal().unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	addr
}

fn init_rustls_crypto_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,courier_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("courier_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_rustls_crypto_provider();
	init_tracing();

	let bind_addr = parse_args();

	let config_path = crate::config::default_config_path()?;
	let server_cfg = crate::config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let store = if server_cfg.persistence.enabled {
		let Some(database_url) = server_cfg.persistence.database_url.as_deref() else {
			return Err(anyhow::anyhow!("persistence enabled but no database_url configured"));
		};
		MessageStore::connect(database_url).await?
	} else {
		MessageStore::disabled()
	};

	let cache = match server_cfg.cache.redis_url.as_deref() {
		Some(redis_url) => match SessionCache::connect(redis_url, server_cfg.cache.session_ttl).await {
			Ok(cache) => {
				info!("session cache connected");
				cache
			}
			Err(e) => {
				warn!(error = %e, "session cache unavailable; continuing without it");
				SessionCache::disabled()
			}
		},
		None => SessionCache::disabled(),
	};

	let identity: Arc<dyn IdentityVerifier> = Arc::new(HttpIdentityVerifier::new(
		server_cfg.identity.backend_url.clone(),
		server_cfg.identity.timeout,
	)?);

	let moderation: Arc<dyn ModerationClient> = match server_cfg.moderation.url.as_deref() {
		Some(url) => Arc::new(HttpModerationClient::new(url.to_string(), server_cfg.moderation.timeout)?),
		None => Arc::new(DisabledModeration),
	};

	let presence = PresenceRegistry::new();
	let counters = Arc::new(GatewayCounters::default());

	let gateway = Gateway {
		presence: presence.clone(),
		conversations: ConversationStore::new(
			store.clone(),
			ConversationSettings {
				retention_cap: server_cfg.limits.conversation_retention,
				history_limit: server_cfg.limits.history_limit,
			},
		),
		identity,
		moderation,
		cache,
		user_rates: Arc::new(Mutex::new(UserRateLimiter::new(
			server_cfg.limits.messages_per_minute,
			server_cfg.limits.long_message_chars,
		))),
		counters: Arc::clone(&counters),
		settings: GatewaySettings {
			max_message_chars: server_cfg.limits.max_message_chars,
			..GatewaySettings::default()
		},
	};

	let health_state = HealthState::new(presence.clone(), Arc::clone(&counters), store.clone());
	if let Some(bind) = server_cfg.server.health_bind.as_deref() {
		match bind.parse::<std::net::SocketAddr>() {
			Ok(addr) => {
				spawn_health_server(addr, health_state.clone());
				info!(%addr, "health server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let quic_cfg = QuicServerConfig::dev(bind_addr);
	let endpoint = if let (Some(cert_path), Some(key_path)) = (
		server_cfg.server.tls_cert_path.as_deref(),
		server_cfg.server.tls_key_path.as_deref(),
	) {
		info!(cert = %cert_path.display(), key = %key_path.display(), "loading TLS cert/key");
		quic_cfg.bind_endpoint_with_tls(cert_path, key_path)?
	} else {
		let (endpoint, server_cert_der) = quic_cfg.bind_dev_endpoint()?;
		info!(
			bind = %bind_addr,
			cert_der_len = server_cert_der.len(),
			"courier_server: QUIC endpoint ready (dev self-signed cert)"
		);
		endpoint
	};

	health_state.mark_ready();

	let conn_settings = ConnectionSettings {
		idle_timeout: server_cfg.limits.idle_timeout,
		..ConnectionSettings::default()
	};

	let ip_rates = Arc::new(Mutex::new(IpRateLimiter::new(server_cfg.limits.ip_admissions_per_minute)));
	let ip_quota = Arc::new(Mutex::new(IpConnectionQuota::default()));
	let max_connections_per_ip = server_cfg.limits.max_connections_per_ip;

	let mut next_conn_id: u64 = 1;

	loop {
		let Some(incoming) = endpoint.accept().await else {
			break;
		};

		let remote_ip = incoming.remote_address().ip();

		let admitted = {
			let mut rates = ip_rates.lock().await;
			rates.check(remote_ip).is_allowed()
		};
		if !admitted {
			metrics::counter!("courier_server_connections_refused_total", "reason" => "ip_rate").increment(1);
			warn!(%remote_ip, "refusing connection: admission rate exceeded");
			incoming.refuse();
			continue;
		}

		let acquired = {
			let mut quota = ip_quota.lock().await;
			quota.try_acquire(remote_ip, max_connections_per_ip)
		};
		if !acquired {
			metrics::counter!("courier_server_connections_refused_total", "reason" => "ip_quota").increment(1);
			warn!(%remote_ip, "refusing connection: per-ip connection quota exhausted");
			incoming.refuse();
			continue;
		}

		let conn_id = ConnectionId(next_conn_id);
		next_conn_id += 1;
		metrics::counter!("courier_server_connections_total").increment(1);

		let gateway = gateway.clone();
		let conn_settings = conn_settings.clone();
		let ip_quota = Arc::clone(&ip_quota);

		tokio::spawn(async move {
			match incoming.await {
				Ok(connection) => {
					info!(conn = %conn_id, remote = %connection.remote_address(), "accepted connection");

					if let Err(e) = handle_connection(conn_id, connection, gateway, conn_settings).await {
						warn!(conn = %conn_id, error = %e, "connection handler exited with error");
					}
				}
				Err(e) => {
					warn!(conn = %conn_id, error = %e, "failed to establish QUIC connection");
				}
			}

			let mut quota = ip_quota.lock().await;
			quota.release(remote_ip);
		});
	}

	Ok(())
}
