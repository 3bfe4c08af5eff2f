use async_trait::async_trait;

use crate::{
    domain::{ChatId, UserId},
    messaging::{
        error::ApiResult,
        types::{ChatInfo, ChatMember},
    },
};

/// The slice of the Telegram Bot API the gateway depends on.
///
/// Implementations make exactly one upstream call per method and report
/// failures as classified [`ApiError`](crate::messaging::error::ApiError)s;
/// retrying is the caller's job.
#[async_trait]
pub trait MessagingApi: Send + Sync {
    /// Id of the bot account the implementation authenticates as.
    fn bot_id(&self) -> UserId;

    async fn get_chat(&self, chat: ChatId) -> ApiResult<ChatInfo>;

    /// Creator and administrators of a chat. Ordinary members cannot be
    /// enumerated through the Bot API.
    async fn get_chat_administrators(&self, chat: ChatId) -> ApiResult<Vec<ChatMember>>;

    async fn get_chat_member(&self, chat: ChatId, user: UserId) -> ApiResult<ChatMember>;

    async fn leave_chat(&self, chat: ChatId) -> ApiResult<()>;
}
