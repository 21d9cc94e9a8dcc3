#![forbid(unsafe_code)]

use parley_domain::{Identity, Message, MessageId, MessageKind, PresenceEntry, RoomId, UserId};
use serde::{Deserialize, Serialize};

/// v1 protocol version written into every envelope.
pub const PROTOCOL_VERSION: u32 = 1;

/// One framed protocol message.
///
/// Requests carry a client-chosen `request_id` echoed by the matching
/// ack; unsolicited events carry an empty one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<M> {
	#[serde(rename = "v")]
	pub version: u32,

	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub request_id: String,

	#[serde(flatten)]
	pub msg: M,
}

impl<M> Envelope<M> {
	/// Envelope for a request or its ack.
	pub fn reply(request_id: impl Into<String>, msg: M) -> Self {
		Self {
			version: PROTOCOL_VERSION,
			request_id: request_id.into(),
			msg,
		}
	}

	/// Envelope for an unsolicited server event.
	pub fn event(msg: M) -> Self {
		Self {
			version: PROTOCOL_VERSION,
			request_id: String::new(),
			msg,
		}
	}
}

/// Client-to-server messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMsg {
	/// Must be the first envelope on a new connection.
	Hello {
		token: String,
		#[serde(default)]
		client_name: String,
	},
	JoinRoom {
		room_id: RoomId,
	},
	LeaveRoom {
		room_id: RoomId,
	},
	SendMessage {
		room_id: RoomId,
		#[serde(default)]
		content: String,
		#[serde(default)]
		kind: Option<MessageKind>,
		#[serde(default)]
		attachment_ref: Option<String>,
		#[serde(default)]
		file_name: Option<String>,
		#[serde(default)]
		file_size: Option<i64>,
	},
	DeleteMessage {
		room_id: RoomId,
		message_id: MessageId,
	},
	MarkDelivered {
		room_id: RoomId,
		message_ids: Vec<MessageId>,
	},
	MarkRead {
		room_id: RoomId,
		message_ids: Vec<MessageId>,
	},
	ToggleReaction {
		room_id: RoomId,
		message_id: MessageId,
		emoji: String,
	},
	Typing {
		room_id: RoomId,
		is_typing: bool,
	},
	Ping {
		#[serde(default)]
		client_time_unix_ms: i64,
	},
}

/// Ack status for client requests; mirrors the operation error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AckStatus {
	Ok,
	AuthenticationFailed,
	NotAMember,
	InvalidPayload,
	NotFound,
	Forbidden,
	Internal,
}

/// Server-to-client messages: acks on the control stream, events on the
/// events stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMsg {
	/// Sent once after successful authentication.
	Welcome {
		server_name: String,
		server_time_unix_ms: i64,
		max_frame_bytes: u32,
		identity: Identity,
	},
	/// Per-request acknowledgment; `message` is set for a successful send.
	Ack {
		status: AckStatus,
		#[serde(default, skip_serializing_if = "String::is_empty")]
		detail: String,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		message: Option<Message>,
	},
	/// Terminal connection error (e.g. rejected credential).
	Error {
		code: String,
		message: String,
	},
	Pong {
		client_time_unix_ms: i64,
		server_time_unix_ms: i64,
	},

	/// Full presence snapshot, broadcast on every register/unregister.
	OnlineUsers {
		users: Vec<PresenceEntry>,
	},
	NewMessage {
		message: Message,
	},
	/// Full message re-broadcast after preview enrichment.
	MessageUpdated {
		message: Message,
	},
	MessageDeleted {
		room_id: RoomId,
		message_id: MessageId,
	},
	MessagesDelivered {
		room_id: RoomId,
		message_ids: Vec<MessageId>,
		user_id: UserId,
	},
	MessagesRead {
		room_id: RoomId,
		message_ids: Vec<MessageId>,
		user_id: UserId,
	},
	ReactionUpdated {
		room_id: RoomId,
		message_id: MessageId,
		user_id: UserId,
		emoji: Option<String>,
	},
	UserTyping {
		room_id: RoomId,
		user_id: UserId,
		display_name: String,
		is_typing: bool,
	},
}

#[cfg(test)]
mod tests {
	use super::*;

	fn room(id: &str) -> RoomId {
		RoomId::new(id).expect("valid RoomId")
	}

	#[test]
	fn client_msg_wire_tags_are_kebab_case() {
		let env = Envelope::reply(
			"r-1",
			ClientMsg::JoinRoom {
				room_id: room("s-42"),
			},
		);
		let json = serde_json::to_value(&env).unwrap();
		assert_eq!(json["v"], 1);
		assert_eq!(json["request_id"], "r-1");
		assert_eq!(json["type"], "join-room");
		assert_eq!(json["room_id"], "s-42");
	}

	#[test]
	fn send_message_defaults_apply() {
		let json = r#"{"v":1,"request_id":"r-2","type":"send-message","room_id":"s-1","content":"hi"}"#;
		let env: Envelope<ClientMsg> = serde_json::from_str(json).unwrap();
		match env.msg {
			ClientMsg::SendMessage {
				room_id,
				content,
				kind,
				attachment_ref,
				..
			} => {
				assert_eq!(room_id.as_str(), "s-1");
				assert_eq!(content, "hi");
				assert!(kind.is_none());
				assert!(attachment_ref.is_none());
			}
			other => panic!("unexpected msg: {other:?}"),
		}
	}

	#[test]
	fn event_envelope_omits_empty_request_id() {
		let env = Envelope::event(ServerMsg::MessageDeleted {
			room_id: room("s-1"),
			message_id: MessageId::new_v4(),
		});
		let json = serde_json::to_value(&env).unwrap();
		assert_eq!(json["type"], "message-deleted");
		assert!(json.get("request_id").is_none());
	}

	#[test]
	fn ack_roundtrip_skips_absent_fields() {
		let env = Envelope::reply(
			"r-3",
			ServerMsg::Ack {
				status: AckStatus::NotAMember,
				detail: "user is not a participant".to_string(),
				message: None,
			},
		);
		let json = serde_json::to_value(&env).unwrap();
		assert_eq!(json["status"], "not-a-member");
		assert!(json.get("message").is_none());

		let back: Envelope<ServerMsg> = serde_json::from_value(json).unwrap();
		assert_eq!(back, env);
	}

	#[test]
	fn reaction_removed_carries_null_emoji() {
		let env = Envelope::event(ServerMsg::ReactionUpdated {
			room_id: room("s-1"),
			message_id: MessageId::new_v4(),
			user_id: UserId::new("u1").unwrap(),
			emoji: None,
		});
		let json = serde_json::to_value(&env).unwrap();
		assert_eq!(json["type"], "reaction-updated");
		assert!(json["emoji"].is_null());
	}
}
