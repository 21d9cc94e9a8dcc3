#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use parley_domain::{ConnectionId, PresenceEntry};
use parley_protocol::framing::{decode_frame, encode_frame};
use parley_protocol::{AckStatus, ClientMsg, Envelope, FramingError, ServerMsg};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::server::auth::Authenticator;
use crate::server::error::OpError;
use crate::server::fanout::{FanoutEngine, SendRequest};
use crate::server::hub::Hub;
use crate::server::presence::PresenceRegistry;
use crate::server::reactions::ReactionToggler;
use crate::server::rooms::RoomGate;
use crate::server::status::StatusAggregator;
use crate::server::typing::TypingNotifier;
use crate::util::time::unix_ms_now;

/// Per-connection server settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	pub max_frame_bytes: u32,
	pub server_name: String,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			max_frame_bytes: parley_protocol::DEFAULT_MAX_FRAME_SIZE as u32,
			server_name: format!("parley-server/{}", env!("CARGO_PKG_VERSION")),
		}
	}
}

/// Shared realtime services handed to every connection.
#[derive(Clone)]
pub struct Services {
	pub authenticator: Authenticator,
	pub presence: PresenceRegistry,
	pub hub: Hub,
	pub gate: RoomGate,
	pub fanout: FanoutEngine,
	pub status: StatusAggregator,
	pub reactions: ReactionToggler,
	pub typing: TypingNotifier,
}

/// Drive one authenticated client connection to completion.
///
/// The client opens a bidirectional control stream (requests in, acks
/// out); after authentication the server opens a unidirectional events
/// stream for unsolicited broadcasts. Cleanup on any exit path removes
/// the connection from presence and every broadcast group.
pub async fn handle_connection(
	conn_id: ConnectionId,
	connection: quinn::Connection,
	services: Arc<Services>,
	settings: ConnectionSettings,
) -> anyhow::Result<()> {
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("parley_server_active_connections").decrement(1.0);
		}
	}

	metrics::gauge!("parley_server_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	let max_frame = settings.max_frame_bytes as usize;

	let (mut control_send, mut control_recv) =
		connection.accept_bi().await.context("accept control bidirectional stream")?;

	let (ctrl_tx, mut ctrl_rx) = mpsc::unbounded_channel::<Envelope<ClientMsg>>();
	let reader_task = tokio::spawn(async move {
		let mut buf = Vec::<u8>::with_capacity(16 * 1024);
		let mut tmp = [0u8; 8192];

		loop {
			let n = match control_recv.read(&mut tmp).await {
				Ok(Some(n)) => n,
				Ok(None) => return Ok::<(), anyhow::Error>(()),
				Err(e) => return Err(anyhow!(e).context("control stream read failed")),
			};

			metrics::counter!("parley_server_control_bytes_in_total").increment(n as u64);
			buf.extend_from_slice(&tmp[..n]);

			loop {
				match decode_frame::<Envelope<ClientMsg>>(&buf, max_frame) {
					Ok((msg, used)) => {
						buf.drain(0..used);
						metrics::counter!("parley_server_envelopes_in_total").increment(1);

						if ctrl_tx.send(msg).is_err() {
							return Ok(());
						}
					}
					Err(FramingError::InsufficientData { .. }) => break,
					Err(e) => {
						metrics::counter!("parley_server_control_decode_errors_total").increment(1);
						return Err(anyhow!(e).context("failed to decode control frame"));
					}
				}
			}
		}
	});

	// The first envelope must be Hello; nothing else is reachable
	// without a bound identity.
	let Some(first) = ctrl_rx.recv().await else {
		return Err(anyhow!("connection closed before Hello"));
	};
	let ClientMsg::Hello { token, client_name } = first.msg else {
		send_envelope(
			&mut control_send,
			Envelope::event(ServerMsg::Error {
				code: "PROTOCOL_ERROR".to_string(),
				message: "expected hello".to_string(),
			}),
			max_frame,
		)
		.await
		.ok();
		return Err(anyhow!("first envelope was not Hello"));
	};

	metrics::counter!("parley_server_hello_total").increment(1);

	let identity = match services.authenticator.authenticate(&token).await {
		Ok(identity) => identity,
		Err(e) => {
			warn!(conn_id, error = %e, "connection rejected");
			metrics::counter!("parley_server_auth_rejected_total").increment(1);
			send_envelope(
				&mut control_send,
				Envelope::event(ServerMsg::Error {
					code: "AUTHENTICATION_FAILED".to_string(),
					message: e.detail(),
				}),
				max_frame,
			)
			.await
			.ok();
			return Ok(());
		}
	};

	info!(
		conn_id,
		user_id = %identity.id,
		client_name = %client_name,
		"connection authenticated"
	);

	send_envelope(
		&mut control_send,
		Envelope::event(ServerMsg::Welcome {
			server_name: settings.server_name.clone(),
			server_time_unix_ms: unix_ms_now(),
			max_frame_bytes: settings.max_frame_bytes,
			identity: identity.clone(),
		}),
		max_frame,
	)
	.await
	.context("send Welcome")?;

	// Events stream: server-opened, server-write-only.
	let mut events_send = connection.open_uni().await.context("open events unidirectional stream")?;
	let mut event_rx = services.hub.register_conn(conn_id, identity.id.clone()).await;

	let events_task = tokio::spawn(async move {
		while let Some(msg) = event_rx.recv().await {
			let frame = match encode_frame(&Envelope::event(msg), max_frame) {
				Ok(f) => f,
				Err(e) => {
					warn!(conn_id, error = %e, "failed to encode event frame");
					continue;
				}
			};

			metrics::counter!("parley_server_events_out_total").increment(1);
			if let Err(e) = events_send.write_all(&frame).await {
				return Err(anyhow!(e).context("events stream write failed"));
			}
		}
		Ok::<(), anyhow::Error>(())
	});

	let snapshot = services
		.presence
		.register(PresenceEntry {
			user_id: identity.id.clone(),
			connection_id: conn_id,
			display_name: identity.display_name.clone(),
			email: identity.email.clone(),
		})
		.await;
	services.hub.publish_all(ServerMsg::OnlineUsers { users: snapshot }).await;

	let loop_result = async {
		while let Some(env) = ctrl_rx.recv().await {
			let request_id = env.request_id;

			match env.msg {
				ClientMsg::Hello { .. } => {
					debug!(conn_id, "ignoring duplicate Hello");
				}

				ClientMsg::Ping { client_time_unix_ms } => {
					send_envelope(
						&mut control_send,
						Envelope::reply(
							request_id,
							ServerMsg::Pong {
								client_time_unix_ms,
								server_time_unix_ms: unix_ms_now(),
							},
						),
						max_frame,
					)
					.await?;
				}

				ClientMsg::JoinRoom { room_id } => {
					let ack = match services.gate.join(conn_id, &identity.id, &room_id).await {
						Ok(()) => ok_ack(None),
						Err(e) => err_ack(conn_id, "join-room", &e),
					};
					send_envelope(&mut control_send, Envelope::reply(request_id, ack), max_frame).await?;
				}

				ClientMsg::LeaveRoom { room_id } => {
					services.gate.leave(conn_id, &room_id).await;
				}

				ClientMsg::SendMessage {
					room_id,
					content,
					kind,
					attachment_ref,
					file_name,
					file_size,
				} => {
					let req = SendRequest {
						room_id,
						content,
						kind,
						attachment_ref,
						file_name,
						file_size,
					};
					let ack = match services.fanout.send(&identity, req).await {
						Ok(message) => ok_ack(Some(message)),
						Err(e) => err_ack(conn_id, "send-message", &e),
					};
					send_envelope(&mut control_send, Envelope::reply(request_id, ack), max_frame).await?;
				}

				ClientMsg::DeleteMessage { room_id: _, message_id } => {
					if let Err(e) = services.fanout.delete(&identity, &message_id).await {
						let ack = err_ack(conn_id, "delete-message", &e);
						send_envelope(&mut control_send, Envelope::reply(request_id, ack), max_frame).await?;
					}
				}

				ClientMsg::MarkDelivered { room_id, message_ids } => {
					if let Err(e) = services.status.mark_delivered(&identity.id, &room_id, &message_ids).await {
						let ack = err_ack(conn_id, "mark-delivered", &e);
						send_envelope(&mut control_send, Envelope::reply(request_id, ack), max_frame).await?;
					}
				}

				ClientMsg::MarkRead { room_id, message_ids } => {
					if let Err(e) = services.status.mark_read(&identity.id, &room_id, &message_ids).await {
						let ack = err_ack(conn_id, "mark-read", &e);
						send_envelope(&mut control_send, Envelope::reply(request_id, ack), max_frame).await?;
					}
				}

				ClientMsg::ToggleReaction {
					room_id,
					message_id,
					emoji,
				} => {
					if let Err(e) = services.reactions.toggle(&identity, &room_id, &message_id, &emoji).await {
						let ack = err_ack(conn_id, "toggle-reaction", &e);
						send_envelope(&mut control_send, Envelope::reply(request_id, ack), max_frame).await?;
					}
				}

				ClientMsg::Typing { room_id, is_typing } => {
					if let Err(e) = services.typing.set_typing(conn_id, &identity, &room_id, is_typing).await {
						let ack = err_ack(conn_id, "typing", &e);
						send_envelope(&mut control_send, Envelope::reply(request_id, ack), max_frame).await?;
					}
				}
			}
		}
		Ok::<(), anyhow::Error>(())
	}
	.await;

	// A dropped connection unconditionally leaves every broadcast group
	// and presence, and everyone sees the fresh snapshot.
	services.hub.remove_conn(conn_id).await;
	let snapshot = services.presence.unregister(conn_id).await;
	services.hub.publish_all(ServerMsg::OnlineUsers { users: snapshot }).await;

	info!(conn_id, user_id = %identity.id, "connection closed");

	let _ = reader_task.await;
	let _ = events_task.await;

	loop_result
}

fn ok_ack(message: Option<parley_domain::Message>) -> ServerMsg {
	ServerMsg::Ack {
		status: AckStatus::Ok,
		detail: String::new(),
		message,
	}
}

fn err_ack(conn_id: ConnectionId, op: &str, e: &OpError) -> ServerMsg {
	metrics::counter!("parley_server_op_errors_total").increment(1);
	debug!(conn_id, op, error = %e, "operation rejected");
	ServerMsg::Ack {
		status: e.ack_status(),
		detail: e.detail(),
		message: None,
	}
}

async fn send_envelope(
	send: &mut quinn::SendStream,
	env: Envelope<ServerMsg>,
	max_frame_size: usize,
) -> anyhow::Result<()> {
	let frame = encode_frame(&env, max_frame_size).map_err(|e| anyhow!(e))?;
	metrics::counter!("parley_server_envelopes_out_total").increment(1);
	metrics::counter!("parley_server_control_bytes_out_total").increment(frame.len() as u64);

	send.write_all(&frame).await.context("stream write")?;
	Ok(())
}
