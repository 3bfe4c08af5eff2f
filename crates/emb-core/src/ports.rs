use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{ChatId, ChatKind, UserId},
    messaging::error::ApiResult,
    Result,
};

/// A chat the bot has seen, as kept by the registry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRecord {
    pub id: ChatId,
    pub title: String,
    pub kind: ChatKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Hexagonal port for the set of chats the bot knows about.
///
/// The Bot API cannot enumerate a bot's chats, so candidates for listings
/// come from here; the update consumer keeps it current.
#[async_trait]
pub trait ChatRegistry: Send + Sync {
    async fn all(&self) -> Result<Vec<ChatRecord>>;

    async fn get(&self, chat: ChatId) -> Result<Option<ChatRecord>>;

    /// Insert or update; `registered_at` of an existing record is preserved.
    async fn upsert(&self, record: ChatRecord) -> Result<()>;

    /// Returns whether a record was removed.
    async fn remove(&self, chat: ChatId) -> Result<bool>;
}

/// Hexagonal port answering "who may do what in this chat".
///
/// `Ok(false)` means the answer is a definite no; systemic API failures are
/// returned as errors so callers can degrade instead of skipping.
#[async_trait]
pub trait AuthorizationChecker: Send + Sync {
    /// The bot itself is creator or administrator of `chat`.
    async fn is_bot_privileged(&self, chat: ChatId) -> ApiResult<bool>;

    /// `user` created `chat`.
    async fn is_user_owner(&self, chat: ChatId, user: UserId) -> ApiResult<bool>;
}
