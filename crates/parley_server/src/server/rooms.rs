#![forbid(unsafe_code)]

use std::sync::Arc;

use parley_domain::{ConnectionId, RoomId, UserId};
use parley_store::Store;
use tracing::debug;

use crate::server::error::OpError;
use crate::server::hub::Hub;

/// Authorizes room operations against the persisted participant list.
///
/// Membership is never cached on the connection: every join, send, and
/// typing event re-runs the query, so a user removed from a room loses
/// access immediately.
#[derive(Clone)]
pub struct RoomGate {
	store: Arc<dyn Store>,
	hub: Hub,
}

impl RoomGate {
	pub fn new(store: Arc<dyn Store>, hub: Hub) -> Self {
		Self { store, hub }
	}

	/// `NotAMember` unless the user has a participant row for the room.
	pub async fn authorize(&self, user_id: &UserId, room_id: &RoomId) -> Result<(), OpError> {
		if room_id.as_str().trim().is_empty() {
			return Err(OpError::InvalidPayload("missing room id".to_string()));
		}

		if self.store.is_participant(user_id, room_id).await? {
			Ok(())
		} else {
			Err(OpError::NotAMember)
		}
	}

	/// Join the room's broadcast group, gated on membership.
	pub async fn join(&self, conn_id: ConnectionId, user_id: &UserId, room_id: &RoomId) -> Result<(), OpError> {
		self.authorize(user_id, room_id).await?;
		self.hub.join_room(room_id, conn_id).await;
		debug!(conn_id, room = %room_id, "joined room");
		Ok(())
	}

	/// Leave is always permitted and idempotent.
	pub async fn leave(&self, conn_id: ConnectionId, room_id: &RoomId) {
		self.hub.leave_room(room_id, conn_id).await;
		debug!(conn_id, room = %room_id, "left room");
	}
}
