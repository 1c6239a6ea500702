use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::{
    domain::{MessageId, MessageKind, RoomId, RoomRole, UserId},
    protocol::Metadata,
};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct StoredUser {
    pub user_id: UserId,
    pub email: String,
    pub username: String,
    pub nickname: Option<String>,
}

impl StoredUser {
    /// Nickname when set and non-blank, otherwise the username.
    pub fn display_name(&self) -> &str {
        match self.nickname.as_deref() {
            Some(nick) if !nick.trim().is_empty() => nick,
            _ => &self.username,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoredParticipant {
    pub user_id: UserId,
    pub email: String,
    pub username: String,
    pub nickname: Option<String>,
    pub role: RoomRole,
    pub last_read_at: Option<DateTime<Utc>>,
}

impl StoredParticipant {
    pub fn display_name(&self) -> &str {
        match self.nickname.as_deref() {
            Some(nick) if !nick.trim().is_empty() => nick,
            _ => &self.username,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub message_id: MessageId,
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub kind: MessageKind,
    pub content: String,
    pub metadata: Option<Metadata>,
    pub created_at: DateTime<Utc>,
    pub unread_count: i64,
}

fn role_to_str(role: RoomRole) -> &'static str {
    match role {
        RoomRole::Host => "host",
        RoomRole::Member => "member",
    }
}

fn role_from_str(raw: &str) -> RoomRole {
    match raw {
        "host" => RoomRole::Host,
        _ => RoomRole::Member,
    }
}

fn kind_from_str(raw: &str) -> MessageKind {
    match raw {
        "IMAGE" => MessageKind::Image,
        "BILL" => MessageKind::Bill,
        "POLL" => MessageKind::Poll,
        "SYSTEM" => MessageKind::System,
        _ => MessageKind::Text,
    }
}

fn micros(at: DateTime<Utc>) -> i64 {
    at.timestamp_micros()
}

fn from_micros(us: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(us).unwrap_or_default()
}

fn decode_metadata(raw: Option<String>) -> Option<Metadata> {
    raw.and_then(|text| serde_json::from_str(&text).ok())
}

fn row_to_message(r: &sqlx::sqlite::SqliteRow) -> StoredMessage {
    StoredMessage {
        message_id: MessageId(r.get::<i64, _>(0)),
        room_id: RoomId(r.get::<i64, _>(1)),
        sender_id: UserId(r.get::<i64, _>(2)),
        kind: kind_from_str(&r.get::<String, _>(3)),
        content: r.get::<String, _>(4),
        metadata: decode_metadata(r.get::<Option<String>, _>(5)),
        created_at: from_micros(r.get::<i64, _>(6)),
        unread_count: r.get::<i64, _>(7),
    }
}

const MESSAGE_COLUMNS: &str =
    "id, room_id, sender_id, kind, content, metadata, created_at, unread_count";

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // An in-memory database exists per connection, so it must be served by
        // exactly one connection that never gets recycled.
        let pool_options = if database_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options.connect_with(connect_options).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn create_user(
        &self,
        email: &str,
        username: &str,
        nickname: Option<&str>,
    ) -> Result<UserId> {
        let rec = sqlx::query(
            "INSERT INTO users (email, username, nickname) VALUES (?, ?, ?)
             ON CONFLICT(email) DO UPDATE SET username=excluded.username, nickname=excluded.nickname
             RETURNING id",
        )
        .bind(email)
        .bind(username)
        .bind(nickname)
        .fetch_one(&self.pool)
        .await?;
        Ok(UserId(rec.get::<i64, _>(0)))
    }

    pub async fn user_by_email(&self, email: &str) -> Result<Option<StoredUser>> {
        let row = sqlx::query("SELECT id, email, username, nickname FROM users WHERE email = ?")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| StoredUser {
            user_id: UserId(r.get::<i64, _>(0)),
            email: r.get::<String, _>(1),
            username: r.get::<String, _>(2),
            nickname: r.get::<Option<String>, _>(3),
        }))
    }

    pub async fn user_by_id(&self, user_id: UserId) -> Result<Option<StoredUser>> {
        let row = sqlx::query("SELECT id, email, username, nickname FROM users WHERE id = ?")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| StoredUser {
            user_id: UserId(r.get::<i64, _>(0)),
            email: r.get::<String, _>(1),
            username: r.get::<String, _>(2),
            nickname: r.get::<Option<String>, _>(3),
        }))
    }

    /// Rooms are created and deleted by the membership service; this exists
    /// for that service and for tests.
    pub async fn create_room(&self, name: &str) -> Result<RoomId> {
        let rec = sqlx::query("INSERT INTO rooms (name, created_at) VALUES (?, ?) RETURNING id")
            .bind(name)
            .bind(micros(Utc::now()))
            .fetch_one(&self.pool)
            .await?;
        Ok(RoomId(rec.get::<i64, _>(0)))
    }

    pub async fn room_exists(&self, room_id: RoomId) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM rooms WHERE id = ?")
            .bind(room_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Idempotent membership upsert. A new participant starts with a NULL
    /// read watermark; re-joining never resets an existing one.
    pub async fn ensure_participant(
        &self,
        room_id: RoomId,
        user_id: UserId,
        role: RoomRole,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO room_participants (room_id, user_id, role) VALUES (?, ?, ?)
             ON CONFLICT(room_id, user_id) DO NOTHING",
        )
        .bind(room_id.0)
        .bind(user_id.0)
        .bind(role_to_str(role))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn is_participant(&self, room_id: RoomId, user_id: UserId) -> Result<bool> {
        let row =
            sqlx::query("SELECT 1 FROM room_participants WHERE room_id = ? AND user_id = ?")
                .bind(room_id.0)
                .bind(user_id.0)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    /// Advances the read watermark to `at` if that is later than the stored
    /// value. The max lives inside the UPDATE, so concurrent touches cannot
    /// move the watermark backwards.
    pub async fn touch_read(&self, room_id: RoomId, user_id: UserId, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE room_participants
             SET last_read_at = MAX(COALESCE(last_read_at, 0), ?3)
             WHERE room_id = ?1 AND user_id = ?2",
        )
        .bind(room_id.0)
        .bind(user_id.0)
        .bind(micros(at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Participants other than `sender_id` whose watermark is NULL or strictly
    /// before `before`. Pure durable read; presence subtraction happens in the
    /// accounting engine.
    pub async fn count_others_unread(
        &self,
        room_id: RoomId,
        sender_id: UserId,
        before: DateTime<Utc>,
    ) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM room_participants
             WHERE room_id = ?1 AND user_id <> ?2
               AND (last_read_at IS NULL OR last_read_at < ?3)",
        )
        .bind(room_id.0)
        .bind(sender_id.0)
        .bind(micros(before))
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn list_participants(&self, room_id: RoomId) -> Result<Vec<StoredParticipant>> {
        let rows = sqlx::query(
            "SELECT u.id, u.email, u.username, u.nickname, p.role, p.last_read_at
             FROM room_participants p
             INNER JOIN users u ON u.id = p.user_id
             WHERE p.room_id = ?
             ORDER BY lower(u.username) ASC",
        )
        .bind(room_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| StoredParticipant {
                user_id: UserId(r.get::<i64, _>(0)),
                email: r.get::<String, _>(1),
                username: r.get::<String, _>(2),
                nickname: r.get::<Option<String>, _>(3),
                role: role_from_str(&r.get::<String, _>(4)),
                last_read_at: r.get::<Option<i64>, _>(5).map(from_micros),
            })
            .collect())
    }

    /// Appends a message with a server-assigned `created_at` that strictly
    /// increases per room. The previous maximum is read inside the INSERT
    /// itself, under the same write lock, so concurrent sends cannot collide.
    pub async fn append_message(
        &self,
        room_id: RoomId,
        sender_id: UserId,
        kind: MessageKind,
        content: &str,
        metadata: Option<&Metadata>,
    ) -> Result<StoredMessage> {
        let metadata_text = metadata
            .map(serde_json::to_string)
            .transpose()
            .context("failed to encode message metadata")?;

        let row = sqlx::query(
            "INSERT INTO messages (room_id, sender_id, kind, content, metadata, created_at)
             SELECT ?1, ?2, ?3, ?4, ?5,
                    MAX(?6, COALESCE((SELECT MAX(created_at) FROM messages WHERE room_id = ?1), 0) + 1)
             RETURNING id, created_at",
        )
        .bind(room_id.0)
        .bind(sender_id.0)
        .bind(kind.as_str())
        .bind(content)
        .bind(metadata_text)
        .bind(micros(Utc::now()))
        .fetch_one(&self.pool)
        .await?;

        Ok(StoredMessage {
            message_id: MessageId(row.get::<i64, _>(0)),
            room_id,
            sender_id,
            kind,
            content: content.to_string(),
            metadata: metadata.cloned(),
            created_at: from_micros(row.get::<i64, _>(1)),
            unread_count: 0,
        })
    }

    pub async fn message_by_id(&self, message_id: MessageId) -> Result<Option<StoredMessage>> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?"
        ))
        .bind(message_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(row_to_message))
    }

    /// Most-recent-first window over a room's log. Fresh read per call, not a
    /// subscription.
    pub async fn recent_messages(&self, room_id: RoomId, limit: u32) -> Result<Vec<StoredMessage>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE room_id = ?
             ORDER BY created_at DESC, id DESC
             LIMIT ?"
        ))
        .bind(room_id.0)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_message).collect())
    }

    /// One page of history, oldest to newest within the page. Page 0 is the
    /// newest window.
    pub async fn list_messages_page(
        &self,
        room_id: RoomId,
        page: u32,
        size: u32,
    ) -> Result<Vec<StoredMessage>> {
        let mut rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE room_id = ?
             ORDER BY created_at DESC, id DESC
             LIMIT ? OFFSET ?"
        ))
        .bind(room_id.0)
        .bind(size)
        .bind(i64::from(page) * i64::from(size))
        .fetch_all(&self.pool)
        .await?;

        rows.reverse();
        Ok(rows.iter().map(row_to_message).collect())
    }

    pub async fn set_unread_count(&self, message_id: MessageId, unread_count: i64) -> Result<()> {
        sqlx::query("UPDATE messages SET unread_count = ? WHERE id = ?")
            .bind(unread_count)
            .bind(message_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Atomic read-merge-write of a message's metadata. The merge runs on the
    /// current stored value inside one transaction, so the update is
    /// all-or-nothing and never replaces fields the merge did not touch.
    pub async fn update_message_metadata(
        &self,
        message_id: MessageId,
        apply: impl FnOnce(&mut Metadata),
    ) -> Result<Metadata> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT metadata FROM messages WHERE id = ?")
            .bind(message_id.0)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            bail!("message {} not found", message_id.0);
        };

        let mut metadata = decode_metadata(row.get::<Option<String>, _>(0)).unwrap_or_default();
        apply(&mut metadata);
        let encoded =
            serde_json::to_string(&metadata).context("failed to encode merged metadata")?;

        sqlx::query("UPDATE messages SET metadata = ? WHERE id = ?")
            .bind(encoded)
            .bind(message_id.0)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(metadata)
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
