#![forbid(unsafe_code)]

use async_trait::async_trait;
use parley_domain::{
	Identity, LinkPreview, Message, MessageId, MessageKind, ReactionAction, ReactionChange, RoomId, UserId,
};

use crate::{NewMessage, Store, StoreError, StoreResult, unix_ms_now};

/// sqlx-backed store; the backend is picked from the database URL scheme.
///
/// The add-if-absent status writes use conditional INSERTs so concurrent
/// markers commute without any locking in the core.
#[derive(Clone)]
pub struct SqlStore {
	backend: Backend,
}

#[derive(Clone)]
enum Backend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

type MessageRow = (
	String,         // id
	String,         // room_id
	String,         // sender_id
	String,         // content
	String,         // kind
	Option<String>, // attachment_ref
	Option<String>, // file_name
	Option<i64>,    // file_size
	Option<String>, // link_preview (JSON)
	i64,            // created_at_unix_ms
);

fn user_id_from_row(raw: String) -> StoreResult<UserId> {
	UserId::new(raw).map_err(|e| StoreError::InvalidRow(e.to_string()))
}

fn message_from_row(row: MessageRow, delivered_to: Vec<UserId>, read_by: Vec<UserId>) -> StoreResult<Message> {
	let (id, room_id, sender_id, content, kind, attachment_ref, file_name, file_size, link_preview, created_at_unix_ms) =
		row;

	let link_preview: Option<LinkPreview> = match link_preview {
		Some(raw) => Some(serde_json::from_str(&raw)?),
		None => None,
	};

	Ok(Message {
		id: MessageId::parse(&id).map_err(|e| StoreError::InvalidRow(e.to_string()))?,
		room_id: RoomId::new(room_id).map_err(|e| StoreError::InvalidRow(e.to_string()))?,
		sender_id: user_id_from_row(sender_id)?,
		content,
		kind: kind.parse::<MessageKind>().map_err(|e| StoreError::InvalidRow(e.to_string()))?,
		attachment_ref,
		file_name,
		file_size,
		link_preview,
		delivered_to,
		read_by,
		created_at_unix_ms,
	})
}

impl SqlStore {
	/// Connect and run migrations for the scheme-selected backend.
	pub async fn connect(database_url: &str) -> StoreResult<Self> {
		if database_url.starts_with("sqlite:") {
			let pool = sqlx::SqlitePool::connect(database_url).await?;
			sqlx::migrate!("migrations/sqlite").run(&pool).await?;
			Ok(Self {
				backend: Backend::Sqlite(pool),
			})
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await?;
			sqlx::migrate!("migrations/postgres").run(&pool).await?;
			Ok(Self {
				backend: Backend::Postgres(pool),
			})
		} else {
			Err(StoreError::UnsupportedDatabaseUrl)
		}
	}

	async fn status_set(&self, table: &str, message_id: &MessageId) -> StoreResult<Vec<UserId>> {
		let id = message_id.to_string();
		let rows: Vec<(String,)> = match &self.backend {
			Backend::Sqlite(pool) => {
				sqlx::query_as(&format!(
					"SELECT user_id FROM {table} WHERE message_id = ? ORDER BY user_id"
				))
				.bind(&id)
				.fetch_all(pool)
				.await?
			}
			Backend::Postgres(pool) => {
				sqlx::query_as(&format!(
					"SELECT user_id FROM {table} WHERE message_id = $1 ORDER BY user_id"
				))
				.bind(&id)
				.fetch_all(pool)
				.await?
			}
		};

		rows.into_iter().map(|(raw,)| user_id_from_row(raw)).collect()
	}

	async fn add_to_status_set(&self, table: &str, ids: &[MessageId], user_id: &UserId) -> StoreResult<Vec<MessageId>> {
		let user = user_id.as_str();
		let mut changed = Vec::new();

		for id in ids {
			let raw = id.to_string();
			let affected = match &self.backend {
				Backend::Sqlite(pool) => {
					sqlx::query(&format!(
						"INSERT OR IGNORE INTO {table} (message_id, user_id) \
						SELECT ?, ? WHERE EXISTS (SELECT 1 FROM messages WHERE id = ?)"
					))
					.bind(&raw)
					.bind(user)
					.bind(&raw)
					.execute(pool)
					.await?
					.rows_affected()
				}
				Backend::Postgres(pool) => {
					sqlx::query(&format!(
						"INSERT INTO {table} (message_id, user_id) \
						SELECT $1, $2 WHERE EXISTS (SELECT 1 FROM messages WHERE id = $1) \
						ON CONFLICT DO NOTHING"
					))
					.bind(&raw)
					.bind(user)
					.execute(pool)
					.await?
					.rows_affected()
				}
			};

			if affected > 0 {
				changed.push(*id);
			}
		}

		Ok(changed)
	}

	async fn load_message(&self, id: &MessageId) -> StoreResult<Option<Message>> {
		let raw = id.to_string();
		let row: Option<MessageRow> = match &self.backend {
			Backend::Sqlite(pool) => {
				sqlx::query_as(
					"SELECT id, room_id, sender_id, content, kind, attachment_ref, file_name, file_size, \
					link_preview, created_at_unix_ms FROM messages WHERE id = ?",
				)
				.bind(&raw)
				.fetch_optional(pool)
				.await?
			}
			Backend::Postgres(pool) => {
				sqlx::query_as(
					"SELECT id, room_id, sender_id, content, kind, attachment_ref, file_name, file_size, \
					link_preview, created_at_unix_ms FROM messages WHERE id = $1",
				)
				.bind(&raw)
				.fetch_optional(pool)
				.await?
			}
		};

		let Some(row) = row else {
			return Ok(None);
		};

		let delivered_to = self.status_set("message_delivered", id).await?;
		let read_by = self.status_set("message_read", id).await?;
		Ok(Some(message_from_row(row, delivered_to, read_by)?))
	}
}

#[async_trait]
impl Store for SqlStore {
	async fn find_user_by_id(&self, id: &UserId) -> StoreResult<Option<Identity>> {
		let row: Option<(String, Option<String>, String, Option<String>)> = match &self.backend {
			Backend::Sqlite(pool) => {
				sqlx::query_as("SELECT id, display_name, email, avatar_ref FROM users WHERE id = ?")
					.bind(id.as_str())
					.fetch_optional(pool)
					.await?
			}
			Backend::Postgres(pool) => {
				sqlx::query_as("SELECT id, display_name, email, avatar_ref FROM users WHERE id = $1")
					.bind(id.as_str())
					.fetch_optional(pool)
					.await?
			}
		};

		let Some((id, display_name, email, avatar_ref)) = row else {
			return Ok(None);
		};

		Ok(Some(Identity {
			id: user_id_from_row(id)?,
			display_name,
			email,
			avatar_ref,
		}))
	}

	async fn is_participant(&self, user_id: &UserId, room_id: &RoomId) -> StoreResult<bool> {
		let (count,): (i64,) = match &self.backend {
			Backend::Sqlite(pool) => {
				sqlx::query_as("SELECT COUNT(*) FROM room_participants WHERE room_id = ? AND user_id = ?")
					.bind(room_id.as_str())
					.bind(user_id.as_str())
					.fetch_one(pool)
					.await?
			}
			Backend::Postgres(pool) => {
				sqlx::query_as("SELECT COUNT(*) FROM room_participants WHERE room_id = $1 AND user_id = $2")
					.bind(room_id.as_str())
					.bind(user_id.as_str())
					.fetch_one(pool)
					.await?
			}
		};

		Ok(count > 0)
	}

	async fn list_participants(&self, room_id: &RoomId) -> StoreResult<Vec<UserId>> {
		let rows: Vec<(String,)> = match &self.backend {
			Backend::Sqlite(pool) => {
				sqlx::query_as("SELECT user_id FROM room_participants WHERE room_id = ? ORDER BY user_id")
					.bind(room_id.as_str())
					.fetch_all(pool)
					.await?
			}
			Backend::Postgres(pool) => {
				sqlx::query_as("SELECT user_id FROM room_participants WHERE room_id = $1 ORDER BY user_id")
					.bind(room_id.as_str())
					.fetch_all(pool)
					.await?
			}
		};

		rows.into_iter().map(|(raw,)| user_id_from_row(raw)).collect()
	}

	async fn create_message(&self, new: NewMessage) -> StoreResult<Message> {
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

		match &self.backend {
			Backend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO messages (id, room_id, sender_id, content, kind, attachment_ref, file_name, \
					file_size, link_preview, created_at_unix_ms) VALUES (?, ?, ?, ?, ?, ?, ?, ?, NULL, ?)",
				)
				.bind(message.id.to_string())
				.bind(message.room_id.as_str())
				.bind(message.sender_id.as_str())
				.bind(&message.content)
				.bind(message.kind.as_str())
				.bind(message.attachment_ref.as_deref())
				.bind(message.file_name.as_deref())
				.bind(message.file_size)
				.bind(message.created_at_unix_ms)
				.execute(pool)
				.await?;
			}
			Backend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO messages (id, room_id, sender_id, content, kind, attachment_ref, file_name, \
					file_size, link_preview, created_at_unix_ms) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NULL, $9)",
				)
				.bind(message.id.to_string())
				.bind(message.room_id.as_str())
				.bind(message.sender_id.as_str())
				.bind(&message.content)
				.bind(message.kind.as_str())
				.bind(message.attachment_ref.as_deref())
				.bind(message.file_name.as_deref())
				.bind(message.file_size)
				.bind(message.created_at_unix_ms)
				.execute(pool)
				.await?;
			}
		}

		Ok(message)
	}

	async fn find_message(&self, id: &MessageId) -> StoreResult<Option<Message>> {
		self.load_message(id).await
	}

	async fn update_message_preview(&self, id: &MessageId, preview: LinkPreview) -> StoreResult<Message> {
		let payload = serde_json::to_string(&preview)?;
		let raw = id.to_string();

		let affected = match &self.backend {
			Backend::Sqlite(pool) => {
				sqlx::query("UPDATE messages SET link_preview = ? WHERE id = ?")
					.bind(&payload)
					.bind(&raw)
					.execute(pool)
					.await?
					.rows_affected()
			}
			Backend::Postgres(pool) => {
				sqlx::query("UPDATE messages SET link_preview = $1 WHERE id = $2")
					.bind(&payload)
					.bind(&raw)
					.execute(pool)
					.await?
					.rows_affected()
			}
		};

		if affected == 0 {
			return Err(StoreError::NotFound);
		}

		self.load_message(id).await?.ok_or(StoreError::NotFound)
	}

	async fn delete_message(&self, id: &MessageId) -> StoreResult<()> {
		let raw = id.to_string();

		let affected = match &self.backend {
			Backend::Sqlite(pool) => {
				let mut tx = pool.begin().await?;
				sqlx::query("DELETE FROM reactions WHERE message_id = ?")
					.bind(&raw)
					.execute(&mut *tx)
					.await?;
				sqlx::query("DELETE FROM message_delivered WHERE message_id = ?")
					.bind(&raw)
					.execute(&mut *tx)
					.await?;
				sqlx::query("DELETE FROM message_read WHERE message_id = ?")
					.bind(&raw)
					.execute(&mut *tx)
					.await?;
				let affected = sqlx::query("DELETE FROM messages WHERE id = ?")
					.bind(&raw)
					.execute(&mut *tx)
					.await?
					.rows_affected();
				tx.commit().await?;
				affected
			}
			Backend::Postgres(pool) => {
				let mut tx = pool.begin().await?;
				sqlx::query("DELETE FROM reactions WHERE message_id = $1")
					.bind(&raw)
					.execute(&mut *tx)
					.await?;
				sqlx::query("DELETE FROM message_delivered WHERE message_id = $1")
					.bind(&raw)
					.execute(&mut *tx)
					.await?;
				sqlx::query("DELETE FROM message_read WHERE message_id = $1")
					.bind(&raw)
					.execute(&mut *tx)
					.await?;
				let affected = sqlx::query("DELETE FROM messages WHERE id = $1")
					.bind(&raw)
					.execute(&mut *tx)
					.await?
					.rows_affected();
				tx.commit().await?;
				affected
			}
		};

		if affected == 0 {
			return Err(StoreError::NotFound);
		}
		Ok(())
	}

	async fn add_delivered_to(&self, ids: &[MessageId], user_id: &UserId) -> StoreResult<Vec<MessageId>> {
		self.add_to_status_set("message_delivered", ids, user_id).await
	}

	async fn add_read_by(&self, ids: &[MessageId], user_id: &UserId) -> StoreResult<Vec<MessageId>> {
		self.add_to_status_set("message_read", ids, user_id).await
	}

	async fn upsert_reaction(&self, user_id: &UserId, message_id: &MessageId, emoji: &str) -> StoreResult<ReactionChange> {
		let user = user_id.as_str();
		let raw = message_id.to_string();

		match &self.backend {
			Backend::Sqlite(pool) => {
				let mut tx = pool.begin().await?;

				let existing: Option<(String,)> =
					sqlx::query_as("SELECT emoji FROM reactions WHERE user_id = ? AND message_id = ?")
						.bind(user)
						.bind(&raw)
						.fetch_optional(&mut *tx)
						.await?;

				let change = match existing {
					None => {
						let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM messages WHERE id = ?")
							.bind(&raw)
							.fetch_one(&mut *tx)
							.await?;
						if count == 0 {
							return Err(StoreError::NotFound);
						}

						sqlx::query("INSERT INTO reactions (user_id, message_id, emoji) VALUES (?, ?, ?)")
							.bind(user)
							.bind(&raw)
							.bind(emoji)
							.execute(&mut *tx)
							.await?;
						ReactionChange {
							action: ReactionAction::Added,
							final_emoji: Some(emoji.to_string()),
						}
					}
					Some((existing,)) if existing == emoji => {
						sqlx::query("DELETE FROM reactions WHERE user_id = ? AND message_id = ?")
							.bind(user)
							.bind(&raw)
							.execute(&mut *tx)
							.await?;
						ReactionChange {
							action: ReactionAction::Removed,
							final_emoji: None,
						}
					}
					Some(_) => {
						sqlx::query("UPDATE reactions SET emoji = ? WHERE user_id = ? AND message_id = ?")
							.bind(emoji)
							.bind(user)
							.bind(&raw)
							.execute(&mut *tx)
							.await?;
						ReactionChange {
							action: ReactionAction::Updated,
							final_emoji: Some(emoji.to_string()),
						}
					}
				};

				tx.commit().await?;
				Ok(change)
			}
			Backend::Postgres(pool) => {
				let mut tx = pool.begin().await?;

				let existing: Option<(String,)> =
					sqlx::query_as("SELECT emoji FROM reactions WHERE user_id = $1 AND message_id = $2 FOR UPDATE")
						.bind(user)
						.bind(&raw)
						.fetch_optional(&mut *tx)
						.await?;

				let change = match existing {
					None => {
						let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM messages WHERE id = $1")
							.bind(&raw)
							.fetch_one(&mut *tx)
							.await?;
						if count == 0 {
							return Err(StoreError::NotFound);
						}

						sqlx::query(
							"INSERT INTO reactions (user_id, message_id, emoji) VALUES ($1, $2, $3) \
							ON CONFLICT (user_id, message_id) DO UPDATE SET emoji = EXCLUDED.emoji",
						)
						.bind(user)
						.bind(&raw)
						.bind(emoji)
						.execute(&mut *tx)
						.await?;
						ReactionChange {
							action: ReactionAction::Added,
							final_emoji: Some(emoji.to_string()),
						}
					}
					Some((existing,)) if existing == emoji => {
						sqlx::query("DELETE FROM reactions WHERE user_id = $1 AND message_id = $2")
							.bind(user)
							.bind(&raw)
							.execute(&mut *tx)
							.await?;
						ReactionChange {
							action: ReactionAction::Removed,
							final_emoji: None,
						}
					}
					Some(_) => {
						sqlx::query("UPDATE reactions SET emoji = $1 WHERE user_id = $2 AND message_id = $3")
							.bind(emoji)
							.bind(user)
							.bind(&raw)
							.execute(&mut *tx)
							.await?;
						ReactionChange {
							action: ReactionAction::Updated,
							final_emoji: Some(emoji.to_string()),
						}
					}
				};

				tx.commit().await?;
				Ok(change)
			}
		}
	}

	async fn touch_room_updated_at(&self, room_id: &RoomId) -> StoreResult<()> {
		let now = unix_ms_now();

		match &self.backend {
			Backend::Sqlite(pool) => {
				sqlx::query("UPDATE rooms SET updated_at_unix_ms = ? WHERE id = ?")
					.bind(now)
					.bind(room_id.as_str())
					.execute(pool)
					.await?;
			}
			Backend::Postgres(pool) => {
				sqlx::query("UPDATE rooms SET updated_at_unix_ms = $1 WHERE id = $2")
					.bind(now)
					.bind(room_id.as_str())
					.execute(pool)
					.await?;
			}
		}

		Ok(())
	}
}
