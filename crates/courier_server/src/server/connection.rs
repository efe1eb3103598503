#![forbid(unsafe_code)]

use std::time::{Duration, Instant};

use anyhow::{Context as _, anyhow};
use bytes::BytesMut;
use courier_domain::ConnectionId;
use courier_protocol::framing::{DEFAULT_MAX_FRAME_SIZE, FramingError, encode_frame, try_decode_frame_from_buffer};
use courier_protocol::{ClientFrame, PROTOCOL_VERSION, ServerFrame};
use tokio::sync::mpsc;
use tokio::time::sleep_until;
use tracing::{debug, info, warn};

use crate::server::presence::Outbound;
use crate::server::router::{ConnState, Gateway};
use crate::util::time::unix_ms_now;

/// Per-connection server settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	pub max_frame_bytes: usize,

	pub outbound_queue_capacity: usize,

	/// Connections silent for this long are closed.
	pub idle_timeout: Duration,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			outbound_queue_capacity: 256,
			idle_timeout: Duration::from_secs(300),
		}
	}
}

/// Items surfaced by the reader task.
enum Inbound {
	Frame(Box<ClientFrame>),

	/// Length prefix was sound but the payload was not a valid envelope.
	/// Recoverable: the connection stays up.
	Malformed(String),
}

/// Drives one client connection from accept to teardown.
pub async fn handle_connection(
	conn_id: ConnectionId,
	connection: quinn::Connection,
	gateway: Gateway,
	settings: ConnectionSettings,
) -> anyhow::Result<()> {
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("courier_server_active_connections").decrement(1.0);
		}
	}

	metrics::gauge!("courier_server_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	let remote_ip = connection.remote_address().ip();

	let (mut stream_send, mut stream_recv) = connection.accept_bi().await.context("accept bidirectional stream")?;

	let (in_tx, mut in_rx) = mpsc::unbounded_channel::<Inbound>();
	let max_frame_bytes = settings.max_frame_bytes;
	let reader_task = tokio::spawn(async move {
		let mut buf = BytesMut::with_capacity(16 * 1024);
		let mut tmp = [0u8; 8192];

		loop {
			let n = match stream_recv.read(&mut tmp).await {
				Ok(Some(n)) => n,
				Ok(None) => return Ok::<(), anyhow::Error>(()),
				Err(e) => return Err(anyhow!(e).context("stream read failed")),
			};

			metrics::counter!("courier_server_bytes_in_total").increment(n as u64);
			buf.extend_from_slice(&tmp[..n]);

			loop {
				match try_decode_frame_from_buffer::<ClientFrame>(&mut buf, max_frame_bytes) {
					Ok(Some(frame)) => {
						metrics::counter!("courier_server_frames_in_total").increment(1);
						if in_tx.send(Inbound::Frame(Box::new(frame))).is_err() {
							return Ok(());
						}
					}
					Ok(None) => break,
					Err(FramingError::Decode(e)) => {
						metrics::counter!("courier_server_frame_decode_errors_total").increment(1);
						if in_tx.send(Inbound::Malformed(e.to_string())).is_err() {
							return Ok(());
						}
					}
					Err(e) => {
						// Oversized prefixes desynchronize the stream; there
						// is nothing left to recover.
						metrics::counter!("courier_server_frame_decode_errors_total").increment(1);
						return Err(anyhow!(e).context("unrecoverable framing error"));
					}
				}
			}
		}
	});

	let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(settings.outbound_queue_capacity);
	let writer_task = tokio::spawn(async move {
		while let Some(item) = out_rx.recv().await {
			match item {
				Outbound::Frame(frame) => {
					let bytes = match encode_frame(&frame, max_frame_bytes) {
						Ok(b) => b,
						Err(e) => {
							warn!(error = %e, "failed to encode outbound frame; skipping");
							continue;
						}
					};

					metrics::counter!("courier_server_frames_out_total").increment(1);
					metrics::counter!("courier_server_bytes_out_total").increment(bytes.len() as u64);

					if let Err(e) = stream_send.write_all(&bytes).await {
						return Err(anyhow!(e).context("stream write failed"));
					}
				}
				Outbound::Close => break,
			}
		}

		let _ = stream_send.finish();
		Ok::<(), anyhow::Error>(())
	});

	gateway.presence.register(conn_id, out_tx.clone()).await;

	out_tx
		.send(Outbound::Frame(ServerFrame::Connected {
			server_name: gateway.settings.server_name.clone(),
			connection_id: conn_id.to_string(),
			server_time_unix_ms: unix_ms_now(),
			protocol_version: PROTOCOL_VERSION,
		}))
		.await
		.map_err(|_| anyhow!("outbound queue closed before greeting"))?;

	info!(conn = %conn_id, remote = %connection.remote_address(), "connection ready");

	let mut state = ConnState::new(remote_ip);
	let mut idle_deadline = tokio::time::Instant::now() + settings.idle_timeout;

	let loop_result = loop {
		tokio::select! {
			item = in_rx.recv() => {
				let Some(item) = item else {
					break Ok(());
				};

				idle_deadline = tokio::time::Instant::now() + settings.idle_timeout;

				match item {
					Inbound::Malformed(detail) => {
						debug!(conn = %conn_id, detail = %detail, "malformed frame");
						let frame = ServerFrame::Error {
							message: "malformed frame".to_string(),
							details: Some(detail),
							field: None,
							retry_after_secs: None,
							correlation_id: None,
						};
						if out_tx.send(Outbound::Frame(frame)).await.is_err() {
							break Ok(());
						}
					}
					Inbound::Frame(frame) => {
						let started = Instant::now();
						let result = gateway.handle_frame(conn_id, &mut state, &out_tx, *frame).await;
						gateway.counters.record_response(started.elapsed());

						if let Err(e) = result {
							let correlation_id = uuid::Uuid::new_v4().to_string();
							warn!(conn = %conn_id, correlation_id = %correlation_id, error = %e, "frame handler failed");
							metrics::counter!("courier_server_handler_errors_total").increment(1);

							let frame = ServerFrame::Error {
								message: "internal error".to_string(),
								details: None,
								field: None,
								retry_after_secs: None,
								correlation_id: Some(correlation_id),
							};
							if out_tx.send(Outbound::Frame(frame)).await.is_err() {
								break Ok(());
							}
						}
					}
				}
			}
			_ = sleep_until(idle_deadline) => {
				info!(conn = %conn_id, "closing idle connection");
				metrics::counter!("courier_server_idle_closures_total").increment(1);
				break Ok(());
			}
		}
	};

	// Teardown: drop presence, announce offline, clear mirrors.
	let departed = gateway.presence.unregister(conn_id).await;
	if let Some(user) = &departed {
		gateway
			.presence
			.broadcast(
				&ServerFrame::UserOffline {
					user_id: user.id.as_str().to_string(),
				},
				Some(conn_id),
			)
			.await;

		let mut rates = gateway.user_rates.lock().await;
		rates.forget(&user.id);
	}
	gateway.cache.clear_session(conn_id, departed.as_ref().map(|u| &u.id));

	let _ = out_tx.send(Outbound::Close).await;
	drop(out_tx);

	reader_task.abort();
	let _ = reader_task.await;
	if let Ok(Err(e)) = writer_task.await {
		debug!(conn = %conn_id, error = %e, "writer task ended with error");
	}

	connection.close(0u32.into(), b"bye");

	loop_result
}
