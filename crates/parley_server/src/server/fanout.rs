#![forbid(unsafe_code)]

use std::sync::Arc;

use parley_domain::{Identity, Message, MessageId, MessageKind, RoomId, UserId};
use parley_protocol::ServerMsg;
use parley_store::{NewMessage, Store};
use tracing::{debug, warn};

use crate::server::error::OpError;
use crate::server::hub::Hub;
use crate::server::preview::{PreviewFetcher, detect_first_url};
use crate::server::rooms::RoomGate;

/// An inbound send intent, as decoded from the wire.
#[derive(Debug, Clone)]
pub struct SendRequest {
	pub room_id: RoomId,
	pub content: String,
	pub kind: Option<MessageKind>,
	pub attachment_ref: Option<String>,
	pub file_name: Option<String>,
	pub file_size: Option<i64>,
}

/// Persists outbound messages, fans them out to every member's personal
/// channel, and drives async link-preview enrichment off the send path.
#[derive(Clone)]
pub struct FanoutEngine {
	store: Arc<dyn Store>,
	hub: Hub,
	gate: RoomGate,
	preview: Option<Arc<dyn PreviewFetcher>>,
}

impl FanoutEngine {
	pub fn new(store: Arc<dyn Store>, hub: Hub, gate: RoomGate, preview: Option<Arc<dyn PreviewFetcher>>) -> Self {
		Self {
			store,
			hub,
			gate,
			preview,
		}
	}

	/// Validate, persist, broadcast, then kick off enrichment. The
	/// returned message is the persisted row; the caller acks with it
	/// and the broadcast payload is the same value.
	pub async fn send(&self, sender: &Identity, req: SendRequest) -> Result<Message, OpError> {
		let content = req.content.trim().to_string();
		if content.is_empty() && req.attachment_ref.as_deref().is_none_or(|a| a.trim().is_empty()) {
			return Err(OpError::InvalidPayload("content or attachment required".to_string()));
		}

		self.gate.authorize(&sender.id, &req.room_id).await?;

		let message = self
			.store
			.create_message(NewMessage {
				room_id: req.room_id.clone(),
				sender_id: sender.id.clone(),
				content,
				kind: req.kind.unwrap_or_default(),
				attachment_ref: req.attachment_ref,
				file_name: req.file_name,
				file_size: req.file_size,
			})
			.await?;

		metrics::counter!("parley_server_messages_sent_total").increment(1);

		// Recency bump is best-effort; delivery does not depend on it.
		if let Err(e) = self.store.touch_room_updated_at(&req.room_id).await {
			warn!(room = %req.room_id, error = %e, "failed to touch room updated_at");
		}

		let members = self.store.list_participants(&req.room_id).await?;
		for member in &members {
			self.hub
				.publish_user(
					member,
					ServerMsg::NewMessage {
						message: message.clone(),
					},
				)
				.await;
		}

		if let Some(url) = detect_first_url(&message.content) {
			self.spawn_enrichment(message.id, url, members);
		}

		Ok(message)
	}

	/// Sender-only delete; removes the row and broadcasts the tombstone
	/// to every member's personal channel.
	pub async fn delete(&self, sender: &Identity, message_id: &MessageId) -> Result<(), OpError> {
		let Some(message) = self.store.find_message(message_id).await? else {
			return Err(OpError::NotFound);
		};

		if message.sender_id != sender.id {
			return Err(OpError::Forbidden);
		}

		self.store.delete_message(message_id).await?;
		metrics::counter!("parley_server_messages_deleted_total").increment(1);

		let members = self.store.list_participants(&message.room_id).await?;
		for member in &members {
			self.hub
				.publish_user(
					member,
					ServerMsg::MessageDeleted {
						room_id: message.room_id.clone(),
						message_id: *message_id,
					},
				)
				.await;
		}

		Ok(())
	}

	/// Fire-and-forget enrichment: fetch metadata, rewrite the preview,
	/// re-broadcast the updated message. Failures are logged and
	/// dropped; nothing here ever reaches the sender and nothing is
	/// retried.
	fn spawn_enrichment(&self, message_id: MessageId, url: String, members: Vec<UserId>) {
		let Some(fetcher) = self.preview.clone() else {
			return;
		};
		let store = Arc::clone(&self.store);
		let hub = self.hub.clone();

		tokio::spawn(async move {
			let preview = match fetcher.fetch(&url).await {
				Ok(p) => p,
				Err(e) => {
					metrics::counter!("parley_server_preview_failures_total").increment(1);
					debug!(%url, error = %e, "link preview fetch failed");
					return;
				}
			};

			let updated = match store.update_message_preview(&message_id, preview).await {
				Ok(m) => m,
				Err(e) => {
					metrics::counter!("parley_server_preview_failures_total").increment(1);
					debug!(message_id = %message_id, error = %e, "failed to store link preview");
					return;
				}
			};

			for member in &members {
				hub.publish_user(
					member,
					ServerMsg::MessageUpdated {
						message: updated.clone(),
					},
				)
				.await;
			}
		});
	}
}
