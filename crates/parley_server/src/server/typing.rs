#![forbid(unsafe_code)]

use parley_domain::{ConnectionId, Identity, RoomId};
use parley_protocol::ServerMsg;

use crate::server::error::OpError;
use crate::server::hub::Hub;
use crate::server::rooms::RoomGate;

/// Ephemeral typing signals: membership-gated, never persisted, sender
/// excluded from the broadcast. Debounce is a client concern.
#[derive(Clone)]
pub struct TypingNotifier {
	hub: Hub,
	gate: RoomGate,
}

impl TypingNotifier {
	pub fn new(hub: Hub, gate: RoomGate) -> Self {
		Self { hub, gate }
	}

	pub async fn set_typing(
		&self,
		conn_id: ConnectionId,
		who: &Identity,
		room_id: &RoomId,
		is_typing: bool,
	) -> Result<(), OpError> {
		self.gate.authorize(&who.id, room_id).await?;

		self.hub
			.publish_room(
				room_id,
				ServerMsg::UserTyping {
					room_id: room_id.clone(),
					user_id: who.id.clone(),
					display_name: who.visible_name().to_string(),
					is_typing,
				},
				Some(conn_id),
			)
			.await;
		Ok(())
	}
}
