use super::presence::PresenceService;
use edgechat_storage::{
    Consistency, PendingFriendRequest, Storage, StorageError, TOKEN_TTL_SECONDS, generate_salt,
    generate_token, hash_password, verify_password,
};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use tracing::info;

const MAX_USERNAME_LEN: usize = 64;

/// A rejected operation carries the message shown to the caller; backend
/// failures surface separately so transport errors stay distinguishable.
#[derive(Debug)]
pub enum AuthError {
    Rejected(String),
    Backend,
}

impl Display for AuthError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rejected(message) => write!(f, "{}", message),
            Self::Backend => write!(f, "backend failure"),
        }
    }
}

impl Error for AuthError {}

impl From<StorageError> for AuthError {
    fn from(_: StorageError) -> Self {
        AuthError::Backend
    }
}

#[derive(Debug, Clone)]
pub struct LoginOutcome {
    pub user_id: i64,
    pub token: String,
}

#[derive(Debug, Clone)]
pub struct FriendInfo {
    pub user_id: i64,
    pub username: String,
    pub online: bool,
}

/// Credential issuing and the friend-graph write path. The edge core only
/// consumes `verify_token` and the friend reads; the rest backs the HTTP
/// surface.
pub struct AuthService {
    storage: Arc<Storage>,
    presence: Arc<PresenceService>,
}

impl AuthService {
    pub fn new(storage: Arc<Storage>, presence: Arc<PresenceService>) -> Self {
        AuthService { storage, presence }
    }

    pub async fn register(&self, username: &str, password: &str) -> Result<i64, AuthError> {
        let username = username.trim();
        if username.is_empty() || username.len() > MAX_USERNAME_LEN {
            return Err(AuthError::Rejected("invalid username".to_string()));
        }
        if password.is_empty() {
            return Err(AuthError::Rejected("invalid password".to_string()));
        }
        let existing = self
            .storage
            .find_user_by_username(username, Consistency::Strong)
            .await?;
        if existing.is_some() {
            return Err(AuthError::Rejected("username already exists".to_string()));
        }
        let salt = generate_salt();
        let hash = hash_password(password, &salt);
        let user_id = self.storage.create_user(username, &hash, &salt).await?;
        info!(user = user_id, "user registered");
        Ok(user_id)
    }

    /// Resolves credentials and mints a bearer token bound to the user for
    /// the token TTL. Login resolution is a strong read.
    pub async fn login(&self, username: &str, password: &str) -> Result<LoginOutcome, AuthError> {
        let record = self
            .storage
            .find_user_by_username(username.trim(), Consistency::Strong)
            .await?
            .ok_or_else(|| AuthError::Rejected("user not found".to_string()))?;
        if !verify_password(password, &record.salt, &record.password_hash) {
            return Err(AuthError::Rejected("invalid password".to_string()));
        }
        let token = generate_token();
        self.storage
            .store_token(&token, record.user_id, TOKEN_TTL_SECONDS)
            .await?;
        info!(user = record.user_id, "login token issued");
        Ok(LoginOutcome {
            user_id: record.user_id,
            token,
        })
    }

    /// The only credential check the edge performs: the opaque bearer
    /// resolves to a user id while its TTL holds.
    pub async fn verify_token(&self, token: &str) -> Result<Option<i64>, StorageError> {
        if token.is_empty() {
            return Ok(None);
        }
        self.storage.lookup_token(token).await
    }

    pub async fn add_friend(&self, user_id: i64, friend_id: i64) -> Result<(), AuthError> {
        if friend_id == user_id {
            return Err(AuthError::Rejected("cannot add yourself".to_string()));
        }
        // Strong read so a freshly registered user is visible.
        if !self.storage.user_exists(friend_id, Consistency::Strong).await? {
            return Err(AuthError::Rejected("user not found".to_string()));
        }
        if self
            .storage
            .are_friends(user_id, friend_id, Consistency::Eventual)
            .await?
        {
            return Err(AuthError::Rejected("already friends".to_string()));
        }
        if self
            .storage
            .pending_request_exists(user_id, friend_id, Consistency::Eventual)
            .await?
        {
            return Err(AuthError::Rejected("request already pending".to_string()));
        }
        self.storage.create_friend_request(user_id, friend_id).await?;
        Ok(())
    }

    /// Friend list annotated with live presence via `GetStatus`, hiding the
    /// presence store from callers.
    pub async fn friend_list(&self, user_id: i64) -> Result<Vec<FriendInfo>, AuthError> {
        let friends = self.storage.friend_list(user_id, Consistency::Strong).await?;
        let ids: Vec<i64> = friends.iter().map(|f| f.user_id).collect();
        let flags = self.presence.get_status(&ids).await?;
        Ok(friends
            .into_iter()
            .map(|record| {
                let online = flags.get(&record.user_id).copied().unwrap_or(false);
                FriendInfo {
                    user_id: record.user_id,
                    username: record.username,
                    online,
                }
            })
            .collect())
    }

    pub async fn pending_requests(
        &self,
        user_id: i64,
    ) -> Result<Vec<PendingFriendRequest>, AuthError> {
        Ok(self.storage.pending_friend_requests(user_id).await?)
    }

    /// Accepts or rejects a pending request. `sender_id` is the requesting
    /// user's id; the wire field is still called `request_id` for
    /// compatibility with existing clients.
    pub async fn handle_friend_request(
        &self,
        user_id: i64,
        sender_id: i64,
        accept: bool,
    ) -> Result<(), AuthError> {
        let resolved = self
            .storage
            .resolve_friend_request(user_id, sender_id, accept)
            .await?;
        if !resolved {
            return Err(AuthError::Rejected("request not found".to_string()));
        }
        Ok(())
    }

    pub async fn delete_friend(&self, user_id: i64, friend_id: i64) -> Result<(), AuthError> {
        self.storage.delete_friend(user_id, friend_id).await?;
        Ok(())
    }
}
