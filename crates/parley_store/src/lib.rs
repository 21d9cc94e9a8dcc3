#![forbid(unsafe_code)]

//! Persistence collaborator contract for the realtime core.
//!
//! The core never caches membership or message state; every operation
//! reads or writes through this trait. Status-set and reaction writes
//! are atomic at the store level so concurrent callers commute.

pub mod memory;
pub mod sql;

use async_trait::async_trait;
use parley_domain::{Identity, LinkPreview, Message, MessageId, MessageKind, ReactionChange, RoomId, UserId};
use thiserror::Error;

pub use memory::MemoryStore;
pub use sql::SqlStore;

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("row not found")]
	NotFound,

	#[error("unsupported database url (use sqlite: or postgres:)")]
	UnsupportedDatabaseUrl,

	#[error("database error: {0}")]
	Backend(#[from] sqlx::Error),

	#[error("migration error: {0}")]
	Migrate(#[from] sqlx::migrate::MigrateError),

	#[error("stored payload could not be decoded: {0}")]
	Corrupt(#[from] serde_json::Error),

	#[error("invalid stored value: {0}")]
	InvalidRow(String),
}

pub(crate) fn unix_ms_now() -> i64 {
	use std::time::{SystemTime, UNIX_EPOCH};

	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or_default()
		.as_millis() as i64
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Fields for a message about to be created; the store assigns the id,
/// timestamp, and empty status sets.
#[derive(Debug, Clone)]
pub struct NewMessage {
	pub room_id: RoomId,
	pub sender_id: UserId,
	pub content: String,
	pub kind: MessageKind,
	pub attachment_ref: Option<String>,
	pub file_name: Option<String>,
	pub file_size: Option<i64>,
}

/// The persistence collaborator.
///
/// `add_delivered_to` / `add_read_by` are add-if-absent: they return
/// only the ids actually changed, and concurrent calls for the same
/// message never lose updates. `upsert_reaction` enforces the
/// one-reaction-per-user-per-message invariant.
#[async_trait]
pub trait Store: Send + Sync {
	async fn find_user_by_id(&self, id: &UserId) -> StoreResult<Option<Identity>>;

	async fn is_participant(&self, user_id: &UserId, room_id: &RoomId) -> StoreResult<bool>;

	async fn list_participants(&self, room_id: &RoomId) -> StoreResult<Vec<UserId>>;

	async fn create_message(&self, new: NewMessage) -> StoreResult<Message>;

	async fn find_message(&self, id: &MessageId) -> StoreResult<Option<Message>>;

	/// Rewrite the message's preview and return the updated row.
	async fn update_message_preview(&self, id: &MessageId, preview: LinkPreview) -> StoreResult<Message>;

	/// `NotFound` if the message no longer exists.
	async fn delete_message(&self, id: &MessageId) -> StoreResult<()>;

	/// Add `user_id` to the delivered set of each message where absent;
	/// returns the subset of ids that changed.
	async fn add_delivered_to(&self, ids: &[MessageId], user_id: &UserId) -> StoreResult<Vec<MessageId>>;

	/// Same contract as [`Store::add_delivered_to`], for the read set.
	async fn add_read_by(&self, ids: &[MessageId], user_id: &UserId) -> StoreResult<Vec<MessageId>>;

	/// Three-state reaction transition: absent -> added, same emoji ->
	/// removed, different emoji -> updated in place.
	async fn upsert_reaction(&self, user_id: &UserId, message_id: &MessageId, emoji: &str) -> StoreResult<ReactionChange>;

	/// Bump the room's recency timestamp. Best-effort from the caller's
	/// point of view; a missing room is not an error here.
	async fn touch_room_updated_at(&self, room_id: &RoomId) -> StoreResult<()>;
}
