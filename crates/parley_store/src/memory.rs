#![forbid(unsafe_code)]

use std::collections::HashMap;

use async_trait::async_trait;
use parley_domain::{
	Identity, LinkPreview, Message, MessageId, ReactionAction, ReactionChange, RoomId, UserId,
};
use tokio::sync::Mutex;

use crate::{NewMessage, Store, StoreError, StoreResult, unix_ms_now};

/// Instance-local store used by tests and dev mode.
///
/// A single mutex serializes every operation, which is what makes the
/// add-if-absent and reaction-upsert contracts atomic here.
#[derive(Debug, Default)]
pub struct MemoryStore {
	inner: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
	users: HashMap<UserId, Identity>,
	participants: HashMap<RoomId, Vec<UserId>>,
	room_updated_at: HashMap<RoomId, i64>,
	messages: HashMap<MessageId, Message>,
	reactions: HashMap<(UserId, MessageId), String>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// Seed a user (dev/test helper).
	pub async fn insert_user(&self, identity: Identity) {
		let mut st = self.inner.lock().await;
		st.users.insert(identity.id.clone(), identity);
	}

	/// Seed room membership (dev/test helper). Creates the room on first use.
	pub async fn add_participant(&self, room_id: &RoomId, user_id: &UserId) {
		let mut st = self.inner.lock().await;
		let members = st.participants.entry(room_id.clone()).or_default();
		if !members.contains(user_id) {
			members.push(user_id.clone());
		}
		st.room_updated_at.entry(room_id.clone()).or_insert_with(unix_ms_now);
	}

	/// Number of persisted messages (test helper).
	pub async fn message_count(&self) -> usize {
		self.inner.lock().await.messages.len()
	}

	/// Current reaction emoji for a `(user, message)` pair (test helper).
	pub async fn reaction_emoji(&self, user_id: &UserId, message_id: &MessageId) -> Option<String> {
		let st = self.inner.lock().await;
		st.reactions.get(&(user_id.clone(), *message_id)).cloned()
	}

	/// Recency timestamp for a room (test helper).
	pub async fn room_updated_at(&self, room_id: &RoomId) -> Option<i64> {
		self.inner.lock().await.room_updated_at.get(room_id).copied()
	}
}

#[async_trait]
impl Store for MemoryStore {
	async fn find_user_by_id(&self, id: &UserId) -> StoreResult<Option<Identity>> {
		let st = self.inner.lock().await;
		Ok(st.users.get(id).cloned())
	}

	async fn is_participant(&self, user_id: &UserId, room_id: &RoomId) -> StoreResult<bool> {
		let st = self.inner.lock().await;
		Ok(st.participants.get(room_id).is_some_and(|m| m.contains(user_id)))
	}

	async fn list_participants(&self, room_id: &RoomId) -> StoreResult<Vec<UserId>> {
		let st = self.inner.lock().await;
		Ok(st.participants.get(room_id).cloned().unwrap_or_default())
	}

	async fn create_message(&self, new: NewMessage) -> StoreResult<Message> {
		let mut st = self.inner.lock().await;
		let message = Message {
			id: MessageId::new_v4(),
			room_id: new.room_id,
			sender_id: new.sender_id,
			content: new.content,
			kind: new.kind,
			attachment_ref: new.attachment_ref,
			file_name: new.file_name,
			file_size: new.file_size,
			link_preview: None,
			delivered_to: Vec::new(),
			read_by: Vec::new(),
			created_at_unix_ms: unix_ms_now(),
		};
		st.messages.insert(message.id, message.clone());
		Ok(message)
	}

	async fn find_message(&self, id: &MessageId) -> StoreResult<Option<Message>> {
		let st = self.inner.lock().await;
		Ok(st.messages.get(id).cloned())
	}

	async fn update_message_preview(&self, id: &MessageId, preview: LinkPreview) -> StoreResult<Message> {
		let mut st = self.inner.lock().await;
		let message = st.messages.get_mut(id).ok_or(StoreError::NotFound)?;
		message.link_preview = Some(preview);
		Ok(message.clone())
	}

	async fn delete_message(&self, id: &MessageId) -> StoreResult<()> {
		let mut st = self.inner.lock().await;
		if st.messages.remove(id).is_none() {
			return Err(StoreError::NotFound);
		}
		st.reactions.retain(|(_, message_id), _| message_id != id);
		Ok(())
	}

	async fn add_delivered_to(&self, ids: &[MessageId], user_id: &UserId) -> StoreResult<Vec<MessageId>> {
		let mut st = self.inner.lock().await;
		let mut changed = Vec::new();
		for id in ids {
			if let Some(message) = st.messages.get_mut(id)
				&& !message.delivered_to.contains(user_id)
			{
				message.delivered_to.push(user_id.clone());
				changed.push(*id);
			}
		}
		Ok(changed)
	}

	async fn add_read_by(&self, ids: &[MessageId], user_id: &UserId) -> StoreResult<Vec<MessageId>> {
		let mut st = self.inner.lock().await;
		let mut changed = Vec::new();
		for id in ids {
			if let Some(message) = st.messages.get_mut(id)
				&& !message.read_by.contains(user_id)
			{
				message.read_by.push(user_id.clone());
				changed.push(*id);
			}
		}
		Ok(changed)
	}

	async fn upsert_reaction(&self, user_id: &UserId, message_id: &MessageId, emoji: &str) -> StoreResult<ReactionChange> {
		let mut st = self.inner.lock().await;
		if !st.messages.contains_key(message_id) {
			return Err(StoreError::NotFound);
		}

		let key = (user_id.clone(), *message_id);
		match st.reactions.get(&key) {
			None => {
				st.reactions.insert(key, emoji.to_string());
				Ok(ReactionChange {
					action: ReactionAction::Added,
					final_emoji: Some(emoji.to_string()),
				})
			}
			Some(existing) if existing == emoji => {
				st.reactions.remove(&key);
				Ok(ReactionChange {
					action: ReactionAction::Removed,
					final_emoji: None,
				})
			}
			Some(_) => {
				st.reactions.insert(key, emoji.to_string());
				Ok(ReactionChange {
					action: ReactionAction::Updated,
					final_emoji: Some(emoji.to_string()),
				})
			}
		}
	}

	async fn touch_room_updated_at(&self, room_id: &RoomId) -> StoreResult<()> {
		let mut st = self.inner.lock().await;
		st.room_updated_at.insert(room_id.clone(), unix_ms_now());
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use parley_domain::MessageKind;

	use super::*;

	fn user(id: &str) -> UserId {
		UserId::new(id).expect("valid UserId")
	}

	fn room(id: &str) -> RoomId {
		RoomId::new(id).expect("valid RoomId")
	}

	async fn seeded() -> (MemoryStore, RoomId, UserId, UserId) {
		let store = MemoryStore::new();
		let r = room("s-1");
		let alice = user("alice");
		let bob = user("bob");
		for u in [&alice, &bob] {
			store
				.insert_user(Identity {
					id: u.clone(),
					display_name: None,
					email: format!("{u}@example.com"),
					avatar_ref: None,
				})
				.await;
			store.add_participant(&r, u).await;
		}
		(store, r, alice, bob)
	}

	fn new_message(room_id: &RoomId, sender: &UserId, content: &str) -> NewMessage {
		NewMessage {
			room_id: room_id.clone(),
			sender_id: sender.clone(),
			content: content.to_string(),
			kind: MessageKind::Text,
			attachment_ref: None,
			file_name: None,
			file_size: None,
		}
	}

	#[tokio::test]
	async fn create_message_starts_with_empty_status_sets() {
		let (store, r, alice, _) = seeded().await;
		let msg = store.create_message(new_message(&r, &alice, "hi")).await.unwrap();

		assert!(msg.delivered_to.is_empty());
		assert!(msg.read_by.is_empty());
		assert!(msg.link_preview.is_none());

		let found = store.find_message(&msg.id).await.unwrap().unwrap();
		assert_eq!(found, msg);
	}

	#[tokio::test]
	async fn add_read_by_returns_only_changed_subset() {
		let (store, r, alice, bob) = seeded().await;
		let m1 = store.create_message(new_message(&r, &alice, "one")).await.unwrap();
		let m2 = store.create_message(new_message(&r, &alice, "two")).await.unwrap();

		let changed = store.add_read_by(&[m1.id, m2.id], &bob).await.unwrap();
		assert_eq!(changed, vec![m1.id, m2.id]);

		// Second call is a no-op across the board.
		let changed = store.add_read_by(&[m1.id, m2.id], &bob).await.unwrap();
		assert!(changed.is_empty());

		let found = store.find_message(&m1.id).await.unwrap().unwrap();
		assert_eq!(found.read_by, vec![bob.clone()]);
	}

	#[tokio::test]
	async fn add_delivered_skips_unknown_messages() {
		let (store, r, alice, bob) = seeded().await;
		let m1 = store.create_message(new_message(&r, &alice, "one")).await.unwrap();

		let changed = store.add_delivered_to(&[m1.id, MessageId::new_v4()], &bob).await.unwrap();
		assert_eq!(changed, vec![m1.id]);
	}

	#[tokio::test]
	async fn reaction_upsert_walks_all_three_states() {
		let (store, r, alice, bob) = seeded().await;
		let msg = store.create_message(new_message(&r, &alice, "react to me")).await.unwrap();

		let change = store.upsert_reaction(&bob, &msg.id, "👍").await.unwrap();
		assert_eq!(change.action, ReactionAction::Added);
		assert_eq!(change.final_emoji.as_deref(), Some("👍"));

		let change = store.upsert_reaction(&bob, &msg.id, "❤️").await.unwrap();
		assert_eq!(change.action, ReactionAction::Updated);
		assert_eq!(change.final_emoji.as_deref(), Some("❤️"));
		assert_eq!(store.reaction_emoji(&bob, &msg.id).await.as_deref(), Some("❤️"));

		let change = store.upsert_reaction(&bob, &msg.id, "❤️").await.unwrap();
		assert_eq!(change.action, ReactionAction::Removed);
		assert!(change.final_emoji.is_none());
		assert!(store.reaction_emoji(&bob, &msg.id).await.is_none());
	}

	#[tokio::test]
	async fn delete_message_removes_row_and_reactions() {
		let (store, r, alice, bob) = seeded().await;
		let msg = store.create_message(new_message(&r, &alice, "bye")).await.unwrap();
		store.upsert_reaction(&bob, &msg.id, "👍").await.unwrap();

		store.delete_message(&msg.id).await.unwrap();
		assert!(store.find_message(&msg.id).await.unwrap().is_none());
		assert!(store.reaction_emoji(&bob, &msg.id).await.is_none());

		let err = store.delete_message(&msg.id).await.unwrap_err();
		assert!(matches!(err, StoreError::NotFound));
	}

	#[tokio::test]
	async fn update_preview_rewrites_only_that_field() {
		let (store, r, alice, _) = seeded().await;
		let msg = store
			.create_message(new_message(&r, &alice, "check www.example.com"))
			.await
			.unwrap();

		let preview = LinkPreview {
			url: "https://www.example.com".to_string(),
			title: "Example".to_string(),
			description: String::new(),
			image: None,
			site_name: "example.com".to_string(),
			domain: "example.com".to_string(),
		};
		let updated = store.update_message_preview(&msg.id, preview.clone()).await.unwrap();
		assert_eq!(updated.link_preview.as_ref(), Some(&preview));
		assert_eq!(updated.content, msg.content);
		assert_eq!(updated.created_at_unix_ms, msg.created_at_unix_ms);
	}

	#[tokio::test]
	async fn membership_queries_reflect_seeding() {
		let (store, r, alice, bob) = seeded().await;
		let carol = user("carol");

		assert!(store.is_participant(&alice, &r).await.unwrap());
		assert!(!store.is_participant(&carol, &r).await.unwrap());
		assert_eq!(store.list_participants(&r).await.unwrap(), vec![alice, bob]);
		assert!(store.list_participants(&room("missing")).await.unwrap().is_empty());
	}
}
