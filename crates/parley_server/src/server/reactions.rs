#![forbid(unsafe_code)]

use std::sync::Arc;

use parley_domain::{Identity, MessageId, RoomId};
use parley_protocol::ServerMsg;
use parley_store::Store;

use crate::server::error::OpError;
use crate::server::hub::Hub;
use crate::server::rooms::RoomGate;

/// At-most-one-reaction-per-user-per-message, with toggle semantics.
///
/// The store's upsert walks the 3-state transition (absent -> added,
/// same emoji -> removed, different emoji -> replaced in place); every
/// branch broadcasts the resulting state so all clients converge.
#[derive(Clone)]
pub struct ReactionToggler {
	store: Arc<dyn Store>,
	hub: Hub,
	gate: RoomGate,
}

impl ReactionToggler {
	pub fn new(store: Arc<dyn Store>, hub: Hub, gate: RoomGate) -> Self {
		Self { store, hub, gate }
	}

	pub async fn toggle(
		&self,
		actor: &Identity,
		room_id: &RoomId,
		message_id: &MessageId,
		emoji: &str,
	) -> Result<(), OpError> {
		let emoji = emoji.trim();
		if emoji.is_empty() {
			return Err(OpError::InvalidPayload("missing emoji".to_string()));
		}

		self.gate.authorize(&actor.id, room_id).await?;

		let change = self.store.upsert_reaction(&actor.id, message_id, emoji).await?;
		metrics::counter!("parley_server_reactions_toggled_total").increment(1);

		// Broadcast with `emoji = null` signalling removal.
		self.hub
			.publish_room(
				room_id,
				ServerMsg::ReactionUpdated {
					room_id: room_id.clone(),
					message_id: *message_id,
					user_id: actor.id.clone(),
					emoji: change.final_emoji,
				},
				None,
			)
			.await;
		Ok(())
	}
}
