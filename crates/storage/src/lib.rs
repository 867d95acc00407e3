use chrono::Utc;
use rand::{RngCore, rngs::OsRng};
use std::collections::HashMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_postgres::{Client, NoTls};

const INIT_SQL: &str = include_str!("../migrations/001_init.sql");
const TOKEN_LENGTH: usize = 32;
const TOKEN_ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
const SALT_LENGTH: usize = 16;

pub const TOKEN_TTL_SECONDS: i64 = 86_400;
pub const DIRECTORY_KEY: &str = "user_gateway";

#[derive(Debug)]
pub enum StorageError {
    Postgres,
    Redis,
    Invalid,
}

impl Display for StorageError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Postgres => write!(f, "postgres failure"),
            Self::Redis => write!(f, "redis failure"),
            Self::Invalid => write!(f, "invalid state"),
        }
    }
}

impl Error for StorageError {}

/// Read routing for SQL queries. Strong reads always hit the primary;
/// eventual reads may be served by the replica when one is configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consistency {
    Strong,
    Eventual,
}

pub struct Storage {
    primary: Client,
    replica: Option<Client>,
    _pg_tasks: Vec<JoinHandle<()>>,
    redis: Arc<Mutex<redis::aio::MultiplexedConnection>>,
    redis_client: redis::Client,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub user_id: i64,
    pub username: String,
    pub password_hash: String,
    pub salt: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub msg_id: i64,
    pub from_user_id: i64,
    pub to_user_id: i64,
    pub content: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationRow {
    pub peer_id: i64,
    pub last_msg_content: String,
    pub last_msg_ts: i64,
    pub unread_count: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FriendRecord {
    pub user_id: i64,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingFriendRequest {
    pub request_id: i64,
    pub sender_id: i64,
    pub sender_username: String,
    pub created_at: i64,
}

/// Name of the topic an edge subscribes to for cross-node delivery.
pub fn edge_topic(edge_id: &str) -> String {
    format!("edge.{}", edge_id)
}

fn presence_key(user_id: i64) -> String {
    format!("user:status:{}", user_id)
}

fn token_key(token: &str) -> String {
    format!("token:{}", token)
}

/// Resolves the current cache master through a Redis Sentinel.
pub async fn discover_master(
    host: &str,
    port: u16,
    master_name: &str,
) -> Result<(String, u16), StorageError> {
    let client = redis::Client::open(format!("redis://{}:{}/", host, port))
        .map_err(|_| StorageError::Redis)?;
    let mut conn = client
        .get_multiplexed_async_connection()
        .await
        .map_err(|_| StorageError::Redis)?;
    let reply: Vec<String> = redis::cmd("SENTINEL")
        .arg("get-master-addr-by-name")
        .arg(master_name)
        .query_async(&mut conn)
        .await
        .map_err(|_| StorageError::Redis)?;
    if reply.len() != 2 {
        return Err(StorageError::Invalid);
    }
    let master_port = reply[1].parse::<u16>().map_err(|_| StorageError::Invalid)?;
    Ok((reply[0].clone(), master_port))
}

/// Establishes connectivity to the PostgreSQL primary, the optional read
/// replica, and Redis. When the replica DSN is absent or identical to the
/// primary the storage collapses to single-node mode.
pub async fn connect(
    primary_dsn: &str,
    replica_dsn: Option<&str>,
    redis_url: &str,
) -> Result<Storage, StorageError> {
    let mut tasks = Vec::new();
    let (primary, connection) = tokio_postgres::connect(primary_dsn, NoTls)
        .await
        .map_err(|_| StorageError::Postgres)?;
    tasks.push(tokio::spawn(async move {
        if let Err(error) = connection.await {
            tracing::error!("postgres primary connection stopped: {}", error);
        }
    }));
    let replica = match replica_dsn {
        Some(dsn) if dsn != primary_dsn => {
            let (client, connection) = tokio_postgres::connect(dsn, NoTls)
                .await
                .map_err(|_| StorageError::Postgres)?;
            tasks.push(tokio::spawn(async move {
                if let Err(error) = connection.await {
                    tracing::error!("postgres replica connection stopped: {}", error);
                }
            }));
            tracing::info!("replica configured, eventual reads routed to follower");
            Some(client)
        }
        _ => {
            tracing::info!("single node mode detected, all reads routed to primary");
            None
        }
    };
    let redis_client = redis::Client::open(redis_url).map_err(|_| StorageError::Redis)?;
    let redis_connection = redis_client
        .get_multiplexed_async_connection()
        .await
        .map_err(|_| StorageError::Redis)?;
    Ok(Storage {
        primary,
        replica,
        _pg_tasks: tasks,
        redis: Arc::new(Mutex::new(redis_connection)),
        redis_client,
    })
}

impl Storage {
    /// Applies bundled migrations to PostgreSQL.
    pub async fn migrate(&self) -> Result<(), StorageError> {
        self.primary
            .batch_execute(INIT_SQL)
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(())
    }

    /// Executes lightweight probes across PostgreSQL and Redis.
    pub async fn readiness(&self) -> Result<(), StorageError> {
        self.primary
            .simple_query("SELECT 1")
            .await
            .map_err(|_| StorageError::Postgres)?;
        let _: String = self.redis_exec(redis::cmd("PING")).await?;
        Ok(())
    }

    fn reader(&self, consistency: Consistency) -> &Client {
        match consistency {
            Consistency::Strong => &self.primary,
            Consistency::Eventual => self.replica.as_ref().unwrap_or(&self.primary),
        }
    }

    // Runs a Redis command with one retry over a fresh connection, so a
    // single dropped cache connection does not surface to callers.
    async fn redis_exec<T: redis::FromRedisValue>(
        &self,
        cmd: redis::Cmd,
    ) -> Result<T, StorageError> {
        let mut conn = self.redis.lock().await;
        match cmd.query_async::<T>(&mut *conn).await {
            Ok(value) => Ok(value),
            Err(first) => {
                tracing::warn!("redis command failed, retrying on fresh connection: {}", first);
                let fresh = self
                    .redis_client
                    .get_multiplexed_async_connection()
                    .await
                    .map_err(|_| StorageError::Redis)?;
                *conn = fresh;
                cmd.query_async::<T>(&mut *conn)
                    .await
                    .map_err(|_| StorageError::Redis)
            }
        }
    }

    pub async fn create_user(
        &self,
        username: &str,
        password_hash: &str,
        salt: &str,
    ) -> Result<i64, StorageError> {
        let row = self
            .primary
            .query_one(
                "INSERT INTO app_user (username, password_hash, salt) VALUES ($1, $2, $3) RETURNING id",
                &[&username, &password_hash, &salt],
            )
            .await
            .map_err(|_| StorageError::Invalid)?;
        Ok(row.get(0))
    }

    pub async fn find_user_by_username(
        &self,
        username: &str,
        consistency: Consistency,
    ) -> Result<Option<UserRecord>, StorageError> {
        let row = self
            .reader(consistency)
            .query_opt(
                "SELECT id, username, password_hash, salt FROM app_user WHERE username = $1",
                &[&username],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(row.map(|row| UserRecord {
            user_id: row.get(0),
            username: row.get(1),
            password_hash: row.get(2),
            salt: row.get(3),
        }))
    }

    pub async fn user_exists(
        &self,
        user_id: i64,
        consistency: Consistency,
    ) -> Result<bool, StorageError> {
        let row = self
            .reader(consistency)
            .query_opt("SELECT 1 FROM app_user WHERE id = $1", &[&user_id])
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(row.is_some())
    }

    /// Appends one message and updates both conversation rows in a single
    /// atomic statement: the sender's unread count resets to zero, the
    /// receiver's is incremented. Returns the assigned message id.
    pub async fn save_message(
        &self,
        from: i64,
        to: i64,
        content: &str,
        timestamp: i64,
    ) -> Result<i64, StorageError> {
        if from == to {
            return Err(StorageError::Invalid);
        }
        let query = "WITH new_msg AS (
                INSERT INTO message (from_id, to_id, content, created_at_ms)
                VALUES ($1, $2, $3, $4)
                RETURNING id
            ), sender_row AS (
                INSERT INTO conversation (user_id, peer_id, last_msg_content, last_msg_ts, unread_count)
                VALUES ($1, $2, $3, $4, 0)
                ON CONFLICT (user_id, peer_id) DO UPDATE
                    SET last_msg_content = excluded.last_msg_content,
                        last_msg_ts = excluded.last_msg_ts,
                        unread_count = 0
            ), receiver_row AS (
                INSERT INTO conversation (user_id, peer_id, last_msg_content, last_msg_ts, unread_count)
                VALUES ($2, $1, $3, $4, 1)
                ON CONFLICT (user_id, peer_id) DO UPDATE
                    SET last_msg_content = excluded.last_msg_content,
                        last_msg_ts = excluded.last_msg_ts,
                        unread_count = conversation.unread_count + 1
            )
            SELECT id FROM new_msg";
        let row = self
            .primary
            .query_one(query, &[&from, &to, &content, &timestamp])
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(row.get(0))
    }

    /// Conversation history between two users, oldest first, capped at
    /// `limit` entries.
    pub async fn history(
        &self,
        user: i64,
        peer: i64,
        limit: i64,
        consistency: Consistency,
    ) -> Result<Vec<MessageRecord>, StorageError> {
        let rows = self
            .reader(consistency)
            .query(
                "SELECT id, from_id, to_id, content, created_at_ms FROM message
                 WHERE (from_id = $1 AND to_id = $2) OR (from_id = $2 AND to_id = $1)
                 ORDER BY created_at_ms ASC, id ASC
                 LIMIT $3",
                &[&user, &peer, &limit],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(rows.iter().map(message_from_row).collect())
    }

    /// All conversation rows for a user, most recent first. Always a strong
    /// read: the unread counters feed user-visible state.
    pub async fn recent_sessions(&self, user: i64) -> Result<Vec<ConversationRow>, StorageError> {
        let rows = self
            .primary
            .query(
                "SELECT peer_id, last_msg_content, last_msg_ts, unread_count FROM conversation
                 WHERE user_id = $1
                 ORDER BY last_msg_ts DESC",
                &[&user],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(rows
            .iter()
            .map(|row| ConversationRow {
                peer_id: row.get(0),
                last_msg_content: row.get(1),
                last_msg_ts: row.get(2),
                unread_count: row.get(3),
            })
            .collect())
    }

    /// For every conversation with outstanding unread messages, the
    /// messages addressed to `user` inside the latest `unread_count` entries
    /// of that conversation, in chronological order. Read-only: the unread
    /// counters stay untouched until the client acknowledges.
    pub async fn offline_messages(&self, user: i64) -> Result<Vec<MessageRecord>, StorageError> {
        let pending = self
            .primary
            .query(
                "SELECT peer_id, unread_count FROM conversation
                 WHERE user_id = $1 AND unread_count > 0",
                &[&user],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        let mut messages = Vec::new();
        for row in pending.iter() {
            let peer: i64 = row.get(0);
            let unread: i32 = row.get(1);
            let tail = self
                .primary
                .query(
                    "SELECT id, from_id, to_id, content, created_at_ms FROM (
                         SELECT id, from_id, to_id, content, created_at_ms FROM message
                         WHERE (from_id = $1 AND to_id = $2) OR (from_id = $2 AND to_id = $1)
                         ORDER BY created_at_ms DESC, id DESC
                         LIMIT $3
                     ) tail
                     WHERE to_id = $1
                     ORDER BY created_at_ms ASC, id ASC",
                    &[&user, &peer, &(unread as i64)],
                )
                .await
                .map_err(|_| StorageError::Postgres)?;
            messages.extend(tail.iter().map(message_from_row));
        }
        Ok(messages)
    }

    /// Resets the unread counter on the `(user, peer)` conversation row.
    pub async fn ack_messages(&self, user: i64, peer: i64) -> Result<(), StorageError> {
        self.primary
            .execute(
                "UPDATE conversation SET unread_count = 0 WHERE user_id = $1 AND peer_id = $2",
                &[&user, &peer],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(())
    }

    pub async fn are_friends(
        &self,
        user: i64,
        friend: i64,
        consistency: Consistency,
    ) -> Result<bool, StorageError> {
        let row = self
            .reader(consistency)
            .query_opt(
                "SELECT 1 FROM friend WHERE user_id = $1 AND friend_id = $2",
                &[&user, &friend],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(row.is_some())
    }

    pub async fn pending_request_exists(
        &self,
        sender: i64,
        receiver: i64,
        consistency: Consistency,
    ) -> Result<bool, StorageError> {
        let row = self
            .reader(consistency)
            .query_opt(
                "SELECT 1 FROM friend_request WHERE sender_id = $1 AND receiver_id = $2 AND status = 0",
                &[&sender, &receiver],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(row.is_some())
    }

    pub async fn create_friend_request(
        &self,
        sender: i64,
        receiver: i64,
    ) -> Result<(), StorageError> {
        let now = Utc::now().timestamp_millis();
        self.primary
            .execute(
                "INSERT INTO friend_request (sender_id, receiver_id, status, created_at_ms)
                 VALUES ($1, $2, 0, $3)",
                &[&sender, &receiver, &now],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(())
    }

    /// Pending requests addressed to a user, with the sender's username.
    /// Strong read: the list gates an accept/reject decision.
    pub async fn pending_friend_requests(
        &self,
        receiver: i64,
    ) -> Result<Vec<PendingFriendRequest>, StorageError> {
        let rows = self
            .primary
            .query(
                "SELECT fr.id, fr.sender_id, u.username, fr.created_at_ms
                 FROM friend_request fr
                 JOIN app_user u ON fr.sender_id = u.id
                 WHERE fr.receiver_id = $1 AND fr.status = 0
                 ORDER BY fr.id ASC",
                &[&receiver],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(rows
            .iter()
            .map(|row| PendingFriendRequest {
                request_id: row.get(0),
                sender_id: row.get(1),
                sender_username: row.get(2),
                created_at: row.get(3),
            })
            .collect())
    }

    /// Resolves the pending request from `sender` to `receiver`. Accepting
    /// inserts both friend edges. Returns false when no pending row exists.
    pub async fn resolve_friend_request(
        &self,
        receiver: i64,
        sender: i64,
        accept: bool,
    ) -> Result<bool, StorageError> {
        let row = self
            .primary
            .query_opt(
                "SELECT id FROM friend_request
                 WHERE sender_id = $1 AND receiver_id = $2 AND status = 0
                 ORDER BY id ASC LIMIT 1",
                &[&sender, &receiver],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        let request_id: i64 = match row {
            Some(row) => row.get(0),
            None => return Ok(false),
        };
        let status: i16 = if accept { 1 } else { 2 };
        self.primary
            .execute(
                "UPDATE friend_request SET status = $1 WHERE id = $2",
                &[&status, &request_id],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        if accept {
            self.primary
                .execute(
                    "INSERT INTO friend (user_id, friend_id) VALUES ($1, $2), ($2, $1)
                     ON CONFLICT DO NOTHING",
                    &[&receiver, &sender],
                )
                .await
                .map_err(|_| StorageError::Postgres)?;
        }
        Ok(true)
    }

    pub async fn friend_ids(
        &self,
        user: i64,
        consistency: Consistency,
    ) -> Result<Vec<i64>, StorageError> {
        let rows = self
            .reader(consistency)
            .query("SELECT friend_id FROM friend WHERE user_id = $1", &[&user])
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    pub async fn friend_list(
        &self,
        user: i64,
        consistency: Consistency,
    ) -> Result<Vec<FriendRecord>, StorageError> {
        let rows = self
            .reader(consistency)
            .query(
                "SELECT u.id, u.username FROM friend f
                 JOIN app_user u ON f.friend_id = u.id
                 WHERE f.user_id = $1
                 ORDER BY u.id ASC",
                &[&user],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(rows
            .iter()
            .map(|row| FriendRecord {
                user_id: row.get(0),
                username: row.get(1),
            })
            .collect())
    }

    /// Removes both friend edges and any request rows in either direction.
    pub async fn delete_friend(&self, user: i64, friend: i64) -> Result<(), StorageError> {
        self.primary
            .execute(
                "DELETE FROM friend WHERE (user_id = $1 AND friend_id = $2)
                 OR (user_id = $2 AND friend_id = $1)",
                &[&user, &friend],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        self.primary
            .execute(
                "DELETE FROM friend_request WHERE (sender_id = $1 AND receiver_id = $2)
                 OR (sender_id = $2 AND receiver_id = $1)",
                &[&user, &friend],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(())
    }

    pub async fn store_token(
        &self,
        token: &str,
        user_id: i64,
        ttl_seconds: i64,
    ) -> Result<(), StorageError> {
        let mut cmd = redis::cmd("SETEX");
        cmd.arg(token_key(token))
            .arg(ttl_seconds.max(1) as usize)
            .arg(user_id.to_string());
        self.redis_exec::<()>(cmd).await
    }

    pub async fn lookup_token(&self, token: &str) -> Result<Option<i64>, StorageError> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(token_key(token));
        let value: Option<String> = self.redis_exec(cmd).await?;
        match value {
            Some(raw) => raw
                .parse::<i64>()
                .map(Some)
                .map_err(|_| StorageError::Invalid),
            None => Ok(None),
        }
    }

    pub async fn set_presence(&self, user_id: i64, online: bool) -> Result<(), StorageError> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(presence_key(user_id))
            .arg(if online { "1" } else { "0" });
        self.redis_exec::<()>(cmd).await
    }

    pub async fn is_online(&self, user_id: i64) -> Result<bool, StorageError> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(presence_key(user_id));
        let value: Option<String> = self.redis_exec(cmd).await?;
        Ok(value.as_deref() == Some("1"))
    }

    pub async fn presence_flags(
        &self,
        user_ids: &[i64],
    ) -> Result<HashMap<i64, bool>, StorageError> {
        let mut flags = HashMap::with_capacity(user_ids.len());
        for user_id in user_ids.iter() {
            flags.insert(*user_id, self.is_online(*user_id).await?);
        }
        Ok(flags)
    }

    /// Points the directory entry for a user at this edge.
    pub async fn assign_directory(&self, user_id: i64, edge_id: &str) -> Result<(), StorageError> {
        let mut cmd = redis::cmd("HSET");
        cmd.arg(DIRECTORY_KEY).arg(user_id.to_string()).arg(edge_id);
        self.redis_exec::<()>(cmd).await
    }

    pub async fn lookup_directory(&self, user_id: i64) -> Result<Option<String>, StorageError> {
        let mut cmd = redis::cmd("HGET");
        cmd.arg(DIRECTORY_KEY).arg(user_id.to_string());
        self.redis_exec(cmd).await
    }

    /// Removes the directory entry for a user, but only while it still
    /// names this edge. A newer assignment by another node is left alone.
    pub async fn release_directory(&self, user_id: i64, edge_id: &str) -> Result<(), StorageError> {
        let current = self.lookup_directory(user_id).await?;
        if current.as_deref() != Some(edge_id) {
            return Ok(());
        }
        let mut cmd = redis::cmd("HDEL");
        cmd.arg(DIRECTORY_KEY).arg(user_id.to_string());
        self.redis_exec::<()>(cmd).await
    }

    /// Full directory snapshot, used by the reconciliation sweep.
    pub async fn directory_entries(&self) -> Result<HashMap<i64, String>, StorageError> {
        let mut cmd = redis::cmd("HGETALL");
        cmd.arg(DIRECTORY_KEY);
        let raw: HashMap<String, String> = self.redis_exec(cmd).await?;
        let mut entries = HashMap::with_capacity(raw.len());
        for (field, value) in raw.into_iter() {
            // Foreign fields in the hash are skipped rather than failing
            // the whole sweep.
            if let Ok(user_id) = field.parse::<i64>() {
                entries.insert(user_id, value);
            }
        }
        Ok(entries)
    }

    /// Publishes a prepared bus payload onto another edge's topic.
    pub async fn publish_to_edge(&self, edge_id: &str, payload: &[u8]) -> Result<(), StorageError> {
        let mut cmd = redis::cmd("PUBLISH");
        cmd.arg(edge_topic(edge_id)).arg(payload);
        self.redis_exec::<()>(cmd).await
    }

    /// Opens the dedicated subscriber connection for this edge's topic. The
    /// pub-sub consumer never shares the multiplexed connection.
    pub async fn edge_subscriber(&self, edge_id: &str) -> Result<redis::aio::PubSub, StorageError> {
        let mut pubsub = self
            .redis_client
            .get_async_pubsub()
            .await
            .map_err(|_| StorageError::Redis)?;
        pubsub
            .subscribe(edge_topic(edge_id))
            .await
            .map_err(|_| StorageError::Redis)?;
        Ok(pubsub)
    }
}

fn message_from_row(row: &tokio_postgres::Row) -> MessageRecord {
    MessageRecord {
        msg_id: row.get(0),
        from_user_id: row.get(1),
        to_user_id: row.get(2),
        content: row.get(3),
        timestamp: row.get(4),
    }
}

// Alphanumeric string from OS entropy, shared by salts and tokens.
fn random_string(length: usize) -> String {
    let mut seed = vec![0u8; length];
    OsRng.fill_bytes(&mut seed);
    seed.into_iter()
        .map(|byte| TOKEN_ALPHABET[byte as usize % TOKEN_ALPHABET.len()] as char)
        .collect()
}

/// Generates a fresh random salt for password hashing.
pub fn generate_salt() -> String {
    random_string(SALT_LENGTH)
}

/// Salted password digest stored in the users table.
pub fn hash_password(password: &str, salt: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(password.as_bytes());
    hasher.update(salt.as_bytes());
    hasher.finalize().to_hex().to_string()
}

pub fn verify_password(password: &str, salt: &str, hash: &str) -> bool {
    hash_password(password, salt) == hash
}

/// Mints an opaque bearer token: 32 alphanumeric characters drawn from OS
/// entropy, well above the 128 bit floor the token contract requires.
pub fn generate_token() -> String {
    random_string(TOKEN_LENGTH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_sql_declares_relations() {
        assert!(INIT_SQL.contains("app_user"));
        assert!(INIT_SQL.contains("message"));
        assert!(INIT_SQL.contains("conversation"));
        assert!(INIT_SQL.contains("friend_request"));
    }

    #[test]
    fn password_hash_roundtrip() {
        let salt = generate_salt();
        assert_eq!(salt.len(), SALT_LENGTH);
        assert!(salt.bytes().all(|b| b.is_ascii_alphanumeric()));
        let hash = hash_password("secret", &salt);
        assert_eq!(hash.len(), 64);
        assert!(verify_password("secret", &salt, &hash));
        assert!(!verify_password("other", &salt, &hash));
    }

    #[test]
    fn password_hash_depends_on_salt() {
        let first = hash_password("secret", "aa");
        let second = hash_password("secret", "bb");
        assert_ne!(first, second);
    }

    #[test]
    fn token_format() {
        let token = generate_token();
        assert_eq!(token.len(), TOKEN_LENGTH);
        assert!(token.bytes().all(|b| b.is_ascii_alphanumeric()));
        assert_ne!(token, generate_token());
    }

    #[test]
    fn topic_and_key_literals() {
        assert_eq!(edge_topic("7"), "edge.7");
        assert_eq!(presence_key(12), "user:status:12");
        assert_eq!(token_key("abc"), "token:abc");
    }

    #[tokio::test]
    async fn storage_integration_flow() -> Result<(), Box<dyn std::error::Error>> {
        let pg = match std::env::var("EDGECHAT_TEST_PG_DSN") {
            Ok(value) => value,
            Err(_) => {
                eprintln!("skipping storage_integration_flow: EDGECHAT_TEST_PG_DSN not set");
                return Ok(());
            }
        };
        let redis_url = match std::env::var("EDGECHAT_TEST_REDIS_URL") {
            Ok(value) => value,
            Err(_) => {
                eprintln!("skipping storage_integration_flow: EDGECHAT_TEST_REDIS_URL not set");
                return Ok(());
            }
        };
        let storage = connect(&pg, None, &redis_url).await?;
        storage.migrate().await?;
        let suffix = Utc::now().timestamp_nanos_opt().unwrap_or_default();

        let salt = generate_salt();
        let hash = hash_password("pw", &salt);
        let alice = storage
            .create_user(&format!("alice{}", suffix), &hash, &salt)
            .await?;
        let bob = storage
            .create_user(&format!("bob{}", suffix), &hash, &salt)
            .await?;
        assert!(alice > 0 && bob > 0);
        let found = storage
            .find_user_by_username(&format!("alice{}", suffix), Consistency::Strong)
            .await?
            .expect("alice exists");
        assert_eq!(found.user_id, alice);
        assert!(verify_password("pw", &found.salt, &found.password_hash));
        assert!(storage.user_exists(bob, Consistency::Strong).await?);

        let ts = Utc::now().timestamp_millis();
        let msg_id = storage.save_message(alice, bob, "hi", ts).await?;
        assert!(msg_id > 0);
        let sessions = storage.recent_sessions(bob).await?;
        let row = sessions
            .iter()
            .find(|row| row.peer_id == alice)
            .expect("conversation row");
        assert_eq!(row.last_msg_content, "hi");
        assert_eq!(row.unread_count, 1);

        let offline = storage.offline_messages(bob).await?;
        assert_eq!(offline.len(), 1);
        assert_eq!(offline[0].msg_id, msg_id);
        assert_eq!(offline[0].to_user_id, bob);
        // Read-only drain: the counter stays until acknowledged.
        let again = storage.offline_messages(bob).await?;
        assert_eq!(again.len(), 1);

        storage.ack_messages(bob, alice).await?;
        let sessions = storage.recent_sessions(bob).await?;
        let row = sessions
            .iter()
            .find(|row| row.peer_id == alice)
            .expect("conversation row");
        assert_eq!(row.unread_count, 0);
        assert!(storage.offline_messages(bob).await?.is_empty());

        let second = storage.save_message(alice, bob, "again", ts + 1).await?;
        assert!(second > msg_id);
        let history = storage.history(alice, bob, 50, Consistency::Strong).await?;
        assert_eq!(history.len(), 2);
        assert!(history[0].timestamp <= history[1].timestamp);

        storage.create_friend_request(alice, bob).await?;
        assert!(
            storage
                .pending_request_exists(alice, bob, Consistency::Strong)
                .await?
        );
        let pending = storage.pending_friend_requests(bob).await?;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].sender_id, alice);
        assert!(storage.resolve_friend_request(bob, alice, true).await?);
        assert!(storage.are_friends(alice, bob, Consistency::Strong).await?);
        assert!(storage.are_friends(bob, alice, Consistency::Strong).await?);
        let friends = storage.friend_list(alice, Consistency::Strong).await?;
        assert!(friends.iter().any(|f| f.user_id == bob));
        // Resolving twice finds nothing pending.
        assert!(!storage.resolve_friend_request(bob, alice, true).await?);

        storage.delete_friend(alice, bob).await?;
        assert!(!storage.are_friends(alice, bob, Consistency::Strong).await?);
        assert!(!storage.are_friends(bob, alice, Consistency::Strong).await?);

        let token = generate_token();
        storage.store_token(&token, alice, TOKEN_TTL_SECONDS).await?;
        assert_eq!(storage.lookup_token(&token).await?, Some(alice));
        assert_eq!(storage.lookup_token("missing-token").await?, None);

        storage.set_presence(alice, true).await?;
        assert!(storage.is_online(alice).await?);
        storage.set_presence(alice, false).await?;
        assert!(!storage.is_online(alice).await?);
        let flags = storage.presence_flags(&[alice, bob]).await?;
        assert_eq!(flags.get(&alice), Some(&false));

        let edge = format!("edge-test-{}", suffix);
        storage.assign_directory(alice, &edge).await?;
        assert_eq!(storage.lookup_directory(alice).await?.as_deref(), Some(edge.as_str()));
        // A release naming another edge must not clobber the entry.
        storage.release_directory(alice, "someone-else").await?;
        assert_eq!(storage.lookup_directory(alice).await?.as_deref(), Some(edge.as_str()));
        storage.release_directory(alice, &edge).await?;
        assert_eq!(storage.lookup_directory(alice).await?, None);

        storage.publish_to_edge(&edge, b"1|ping").await?;

        Ok(())
    }
}
