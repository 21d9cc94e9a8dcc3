#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parley_domain::{ConnectionId, RoomId, UserId};
use parley_protocol::ServerMsg;
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

/// Broadcast hub that fans server events out to connection queues.
///
/// Every connection registers one bounded outbound queue. On top of
/// that the hub keeps three publish scopes: all connections (presence),
/// a room's joined connections (status/reaction/typing), and all of a
/// user's connections (message fanout). Slow consumers never block a
/// publisher: a full queue drops the event for that subscriber only.
#[derive(Debug, Clone)]
pub struct Hub {
	inner: Arc<Mutex<Inner>>,
	cfg: HubConfig,
}

/// Configuration for `Hub`.
#[derive(Debug, Clone)]
pub struct HubConfig {
	/// Maximum number of queued events per connection.
	pub queue_capacity: usize,

	pub debug_logs: bool,
}

impl Default for HubConfig {
	fn default() -> Self {
		Self {
			queue_capacity: 1024,
			debug_logs: false,
		}
	}
}

#[derive(Debug, Default)]
struct Inner {
	conns: HashMap<ConnectionId, ConnEntry>,
	rooms: HashMap<RoomId, HashSet<ConnectionId>>,
}

#[derive(Debug)]
struct ConnEntry {
	user_id: UserId,
	tx: mpsc::Sender<ServerMsg>,
}

impl Hub {
	pub fn new(cfg: HubConfig) -> Self {
		Self {
			inner: Arc::new(Mutex::new(Inner::default())),
			cfg,
		}
	}

	/// Register a connection and hand back its event queue.
	pub async fn register_conn(&self, conn_id: ConnectionId, user_id: UserId) -> mpsc::Receiver<ServerMsg> {
		let (tx, rx) = mpsc::channel(self.cfg.queue_capacity);

		let mut inner = self.inner.lock().await;
		inner.conns.insert(conn_id, ConnEntry { user_id, tx });

		if self.cfg.debug_logs {
			debug!(conn_id, conns = inner.conns.len(), "hub: connection registered");
		}

		rx
	}

	/// Drop a connection from the hub and from every room it joined.
	pub async fn remove_conn(&self, conn_id: ConnectionId) {
		let mut inner = self.inner.lock().await;
		inner.conns.remove(&conn_id);
		inner.rooms.retain(|_, members| {
			members.remove(&conn_id);
			!members.is_empty()
		});

		if self.cfg.debug_logs {
			debug!(conn_id, conns = inner.conns.len(), "hub: connection removed");
		}
	}

	/// Add a connection to a room's broadcast group. Returns false if
	/// the connection is unknown (already gone).
	pub async fn join_room(&self, room_id: &RoomId, conn_id: ConnectionId) -> bool {
		let mut inner = self.inner.lock().await;
		if !inner.conns.contains_key(&conn_id) {
			return false;
		}
		inner.rooms.entry(room_id.clone()).or_default().insert(conn_id);
		true
	}

	/// Remove a connection from a room's broadcast group (idempotent).
	pub async fn leave_room(&self, room_id: &RoomId, conn_id: ConnectionId) {
		let mut inner = self.inner.lock().await;
		if let Some(members) = inner.rooms.get_mut(room_id) {
			members.remove(&conn_id);
			if members.is_empty() {
				inner.rooms.remove(room_id);
			}
		}
	}

	/// Whether a connection is currently in a room's broadcast group.
	pub async fn is_joined(&self, room_id: &RoomId, conn_id: ConnectionId) -> bool {
		let inner = self.inner.lock().await;
		inner.rooms.get(room_id).is_some_and(|members| members.contains(&conn_id))
	}

	/// Publish to every live connection.
	pub async fn publish_all(&self, msg: ServerMsg) {
		let mut inner = self.inner.lock().await;
		let targets: Vec<ConnectionId> = inner.conns.keys().copied().collect();
		deliver_to(&mut inner, &targets, None, msg);
	}

	/// Publish to the connections joined to a room, optionally excluding
	/// one (the typing sender).
	pub async fn publish_room(&self, room_id: &RoomId, msg: ServerMsg, exclude: Option<ConnectionId>) {
		let mut inner = self.inner.lock().await;
		let Some(members) = inner.rooms.get(room_id) else {
			return;
		};
		let targets: Vec<ConnectionId> = members.iter().copied().collect();
		deliver_to(&mut inner, &targets, exclude, msg);
	}

	/// Publish to every connection of a user (their personal channel).
	pub async fn publish_user(&self, user_id: &UserId, msg: ServerMsg) {
		let mut inner = self.inner.lock().await;
		let targets: Vec<ConnectionId> = inner
			.conns
			.iter()
			.filter(|(_, entry)| &entry.user_id == user_id)
			.map(|(id, _)| *id)
			.collect();
		deliver_to(&mut inner, &targets, None, msg);
	}

	/// Snapshot of per-room subscriber counts.
	pub async fn room_subscriber_counts(&self) -> HashMap<RoomId, usize> {
		let inner = self.inner.lock().await;
		inner.rooms.iter().map(|(k, v)| (k.clone(), v.len())).collect()
	}
}

fn deliver_to(inner: &mut Inner, targets: &[ConnectionId], exclude: Option<ConnectionId>, msg: ServerMsg) {
	let mut closed: Vec<ConnectionId> = Vec::new();
	let mut dropped_total: u64 = 0;

	for conn_id in targets {
		if Some(*conn_id) == exclude {
			continue;
		}
		let Some(entry) = inner.conns.get(conn_id) else {
			continue;
		};

		match entry.tx.try_send(msg.clone()) {
			Ok(()) => {}
			Err(mpsc::error::TrySendError::Full(_)) => {
				dropped_total += 1;
			}
			Err(mpsc::error::TrySendError::Closed(_)) => {
				closed.push(*conn_id);
			}
		}
	}

	for conn_id in closed {
		inner.conns.remove(&conn_id);
		inner.rooms.retain(|_, members| {
			members.remove(&conn_id);
			!members.is_empty()
		});
	}

	if dropped_total > 0 {
		metrics::counter!("parley_server_broadcast_dropped_total").increment(dropped_total);
		debug!(dropped = dropped_total, "hub: dropped events due to full subscriber queues");
	}
}
