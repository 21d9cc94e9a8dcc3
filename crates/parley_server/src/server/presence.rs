#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use parley_domain::{ConnectionId, PresenceEntry};
use tokio::sync::Mutex;
use tracing::warn;

/// Instance-local registry of live connections.
///
/// Holds one entry per connection; a user with several devices appears
/// several times and the registry never deduplicates. State is rebuilt
/// empty on restart and is never persisted.
#[derive(Debug, Clone, Default)]
pub struct PresenceRegistry {
	inner: Arc<Mutex<HashMap<ConnectionId, PresenceEntry>>>,
}

impl PresenceRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Insert an entry and return the full snapshot taken after the
	/// mutation, under the same lock.
	pub async fn register(&self, entry: PresenceEntry) -> Vec<PresenceEntry> {
		let mut inner = self.inner.lock().await;
		if let Some(prev) = inner.insert(entry.connection_id, entry) {
			warn!(
				conn_id = prev.connection_id,
				user_id = %prev.user_id,
				"presence entry replaced for an already-registered connection"
			);
		}
		metrics::gauge!("parley_server_presence_entries").set(inner.len() as f64);
		snapshot(&inner)
	}

	/// Remove the entry for a connection (idempotent) and return the
	/// post-mutation snapshot.
	pub async fn unregister(&self, connection_id: ConnectionId) -> Vec<PresenceEntry> {
		let mut inner = self.inner.lock().await;
		inner.remove(&connection_id);
		metrics::gauge!("parley_server_presence_entries").set(inner.len() as f64);
		snapshot(&inner)
	}

	/// Current snapshot (one entry per live connection).
	pub async fn snapshot(&self) -> Vec<PresenceEntry> {
		let inner = self.inner.lock().await;
		snapshot(&inner)
	}
}

fn snapshot(entries: &HashMap<ConnectionId, PresenceEntry>) -> Vec<PresenceEntry> {
	let mut out: Vec<PresenceEntry> = entries.values().cloned().collect();
	out.sort_by_key(|e| e.connection_id);
	out
}
