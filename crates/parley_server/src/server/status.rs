#![forbid(unsafe_code)]

use std::sync::Arc;

use parley_domain::{MessageId, RoomId, UserId};
use parley_protocol::ServerMsg;
use parley_store::Store;

use crate::server::error::OpError;
use crate::server::hub::Hub;

/// Maintains the monotonically-growing delivered/read sets.
///
/// The store's add-if-absent returns only the ids actually changed;
/// when that subset is empty there is no write and no broadcast, which
/// keeps repeated client-side re-marking from becoming broadcast storms.
#[derive(Clone)]
pub struct StatusAggregator {
	store: Arc<dyn Store>,
	hub: Hub,
}

impl StatusAggregator {
	pub fn new(store: Arc<dyn Store>, hub: Hub) -> Self {
		Self { store, hub }
	}

	pub async fn mark_delivered(&self, user_id: &UserId, room_id: &RoomId, ids: &[MessageId]) -> Result<(), OpError> {
		if ids.is_empty() {
			return Ok(());
		}

		let changed = self.store.add_delivered_to(ids, user_id).await?;
		if changed.is_empty() {
			return Ok(());
		}

		metrics::counter!("parley_server_messages_marked_delivered_total").increment(changed.len() as u64);
		self.hub
			.publish_room(
				room_id,
				ServerMsg::MessagesDelivered {
					room_id: room_id.clone(),
					message_ids: changed,
					user_id: user_id.clone(),
				},
				None,
			)
			.await;
		Ok(())
	}

	pub async fn mark_read(&self, user_id: &UserId, room_id: &RoomId, ids: &[MessageId]) -> Result<(), OpError> {
		if ids.is_empty() {
			return Ok(());
		}

		let changed = self.store.add_read_by(ids, user_id).await?;
		if changed.is_empty() {
			return Ok(());
		}

		metrics::counter!("parley_server_messages_marked_read_total").increment(changed.len() as u64);
		self.hub
			.publish_room(
				room_id,
				ServerMsg::MessagesRead {
					room_id: room_id.clone(),
					message_ids: changed,
					user_id: user_id.clone(),
				},
				None,
			)
			.await;
		Ok(())
	}
}
