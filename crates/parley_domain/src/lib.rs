#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid uuid: {0}")]
	InvalidUuid(String),
	#[error("unknown message kind: {0}")]
	UnknownKind(String),
}

/// Durable user identifier, assigned by the persistence collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
	/// Create a non-empty `UserId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for UserId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for UserId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		UserId::new(s.to_string())
	}
}

/// Opaque conversation (room) identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
	/// Create a non-empty `RoomId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for RoomId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for RoomId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		RoomId::new(s.to_string())
	}
}

/// Server-assigned message identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub uuid::Uuid);

impl MessageId {
	/// Create a new random message id.
	pub fn new_v4() -> Self {
		Self(uuid::Uuid::new_v4())
	}

	/// Parse from the canonical hyphenated form.
	pub fn parse(s: &str) -> Result<Self, ParseIdError> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		uuid::Uuid::parse_str(s)
			.map(Self)
			.map_err(|_| ParseIdError::InvalidUuid(s.to_string()))
	}
}

impl fmt::Display for MessageId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for MessageId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		MessageId::parse(s)
	}
}

/// Process-local connection identifier, never reused within a server run.
pub type ConnectionId = u64;

/// Resolved identity bound to a connection at authentication time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
	pub id: UserId,
	pub display_name: Option<String>,
	pub email: String,
	pub avatar_ref: Option<String>,
}

impl Identity {
	/// Name shown to other users: display name, falling back to the email.
	pub fn visible_name(&self) -> &str {
		self.display_name.as_deref().unwrap_or(&self.email)
	}
}

/// One live connection in the presence registry.
///
/// Multiple entries may share a `user_id` (multi-device); the registry
/// does not deduplicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEntry {
	pub user_id: UserId,
	pub connection_id: ConnectionId,
	pub display_name: Option<String>,
	pub email: String,
}

/// Payload kind of a chat message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageKind {
	#[default]
	Text,
	Image,
	File,
	Audio,
}

impl MessageKind {
	/// Stable string identifier (matches the wire form).
	pub const fn as_str(self) -> &'static str {
		match self {
			MessageKind::Text => "TEXT",
			MessageKind::Image => "IMAGE",
			MessageKind::File => "FILE",
			MessageKind::Audio => "AUDIO",
		}
	}
}

impl fmt::Display for MessageKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for MessageKind {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_uppercase().as_str() {
			"" => Err(ParseIdError::Empty),
			"TEXT" => Ok(MessageKind::Text),
			"IMAGE" => Ok(MessageKind::Image),
			"FILE" => Ok(MessageKind::File),
			"AUDIO" => Ok(MessageKind::Audio),
			other => Err(ParseIdError::UnknownKind(other.to_string())),
		}
	}
}

/// Page metadata attached to a message by async enrichment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkPreview {
	pub url: String,
	pub title: String,
	pub description: String,
	pub image: Option<String>,
	pub site_name: String,
	pub domain: String,
}

/// A persisted chat message.
///
/// `link_preview` is the only field rewritten after creation (by
/// enrichment); `delivered_to` / `read_by` only ever grow, and only via
/// the store's add-if-absent operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
	pub id: MessageId,
	pub room_id: RoomId,
	pub sender_id: UserId,
	pub content: String,
	pub kind: MessageKind,
	pub attachment_ref: Option<String>,
	pub file_name: Option<String>,
	pub file_size: Option<i64>,
	pub link_preview: Option<LinkPreview>,
	pub delivered_to: Vec<UserId>,
	pub read_by: Vec<UserId>,
	pub created_at_unix_ms: i64,
}

/// A user's reaction to a message; at most one per `(user_id, message_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
	pub user_id: UserId,
	pub message_id: MessageId,
	pub emoji: String,
}

/// Outcome of a reaction upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReactionAction {
	Added,
	Updated,
	Removed,
}

/// Result of toggling a reaction: what happened, and the emoji now in
/// effect (`None` after a toggle-off).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionChange {
	pub action: ReactionAction,
	pub final_emoji: Option<String>,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn user_and_room_ids_reject_blank() {
		assert!(UserId::new("").is_err());
		assert!(UserId::new("   ").is_err());
		assert!(RoomId::new("").is_err());
		assert!("".parse::<RoomId>().is_err());
	}

	#[test]
	fn message_id_parse_roundtrip() {
		let id = MessageId::new_v4();
		let parsed = MessageId::parse(&id.to_string()).unwrap();
		assert_eq!(parsed, id);
		assert!(MessageId::parse("not-a-uuid").is_err());
		assert!(MessageId::parse("").is_err());
	}

	#[test]
	fn message_kind_parse_and_display() {
		assert_eq!("TEXT".parse::<MessageKind>().unwrap(), MessageKind::Text);
		assert_eq!("audio".parse::<MessageKind>().unwrap(), MessageKind::Audio);
		assert_eq!(MessageKind::Image.to_string(), "IMAGE");
		assert!("VIDEO".parse::<MessageKind>().is_err());
	}

	#[test]
	fn message_kind_wire_form_is_uppercase() {
		let json = serde_json::to_string(&MessageKind::File).unwrap();
		assert_eq!(json, "\"FILE\"");
		let kind: MessageKind = serde_json::from_str("\"AUDIO\"").unwrap();
		assert_eq!(kind, MessageKind::Audio);
	}

	#[test]
	fn visible_name_falls_back_to_email() {
		let mut id = Identity {
			id: UserId::new("u1").unwrap(),
			display_name: Some("Ada".to_string()),
			email: "ada@example.com".to_string(),
			avatar_ref: None,
		};
		assert_eq!(id.visible_name(), "Ada");
		id.display_name = None;
		assert_eq!(id.visible_name(), "ada@example.com");
	}
}
