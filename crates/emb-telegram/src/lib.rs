//! Telegram adapter (teloxide).
//!
//! This crate implements the `emb-core` [`MessagingApi`] port over the Telegram
//! Bot API, and the update consumer that keeps the chat registry current.

use async_trait::async_trait;
use teloxide::{prelude::*, RequestError};

pub mod events;

use emb_core::{
    domain::{ChatId, ChatKind, MemberStatus, UserId},
    messaging::{
        error::{ApiError, ApiResult},
        port::MessagingApi,
        types::{ChatInfo, ChatMember, UserProfile},
    },
};

#[derive(Clone)]
pub struct TelegramApi {
    bot: Bot,
    bot_id: UserId,
}

impl TelegramApi {
    /// Resolve the bot's own id with `getMe`.
    pub async fn connect(bot: Bot) -> ApiResult<Self> {
        let me = bot.get_me().await.map_err(classify)?;
        let bot_id = UserId(me.id.0 as i64);
        tracing::info!(bot_id = bot_id.0, username = %me.username(), "connected to telegram");
        Ok(Self { bot, bot_id })
    }

    /// Build without a network round trip; the bot id is the token's numeric prefix.
    pub fn from_token(token: &str) -> ApiResult<Self> {
        let bot_id = bot_id_from_token(token)
            .ok_or_else(|| ApiError::Unauthorized("malformed bot token".to_string()))?;
        Ok(Self {
            bot: Bot::new(token),
            bot_id,
        })
    }

    pub fn bot(&self) -> Bot {
        self.bot.clone()
    }

    fn tg_chat(chat: ChatId) -> teloxide::types::ChatId {
        teloxide::types::ChatId(chat.0)
    }

    fn tg_user(user: UserId) -> ApiResult<teloxide::types::UserId> {
        u64::try_from(user.0)
            .map(teloxide::types::UserId)
            .map_err(|_| ApiError::BadRequest(format!("invalid user id {user}")))
    }
}

#[async_trait]
impl MessagingApi for TelegramApi {
    fn bot_id(&self) -> UserId {
        self.bot_id
    }

    async fn get_chat(&self, chat: ChatId) -> ApiResult<ChatInfo> {
        let tg = self
            .bot
            .get_chat(Self::tg_chat(chat))
            .await
            .map_err(classify)?;
        Ok(chat_info(&tg))
    }

    async fn get_chat_administrators(&self, chat: ChatId) -> ApiResult<Vec<ChatMember>> {
        let admins = self
            .bot
            .get_chat_administrators(Self::tg_chat(chat))
            .await
            .map_err(classify)?;
        Ok(admins.iter().map(chat_member).collect())
    }

    async fn get_chat_member(&self, chat: ChatId, user: UserId) -> ApiResult<ChatMember> {
        let member = self
            .bot
            .get_chat_member(Self::tg_chat(chat), Self::tg_user(user)?)
            .await
            .map_err(classify)?;
        Ok(chat_member(&member))
    }

    async fn leave_chat(&self, chat: ChatId) -> ApiResult<()> {
        self.bot
            .leave_chat(Self::tg_chat(chat))
            .await
            .map_err(classify)?;
        Ok(())
    }
}

fn bot_id_from_token(token: &str) -> Option<UserId> {
    let (id, secret) = token.trim().split_once(':')?;
    if secret.is_empty() {
        return None;
    }
    id.parse::<i64>().ok().filter(|id| *id > 0).map(UserId)
}

/// Map a teloxide failure onto the core error taxonomy.
pub fn classify(err: RequestError) -> ApiError {
    match err {
        RequestError::RetryAfter(wait) => ApiError::Throttled { retry_after: wait },
        RequestError::Network(e) if e.is_timeout() => ApiError::Timeout,
        RequestError::Network(e) => ApiError::Network(e.to_string()),
        RequestError::Io(e) => ApiError::Network(e.to_string()),
        RequestError::MigrateToChatId(new_id) => {
            ApiError::NotFound(format!("chat migrated to supergroup {new_id}"))
        }
        // teloxide-core 0.9 names the invalid-token ("Unauthorized") variant `NotFound`.
        RequestError::Api(teloxide::ApiError::NotFound) => {
            ApiError::Unauthorized("invalid bot token".to_string())
        }
        RequestError::Api(api) => classify_description(&api.to_string()),
        other => ApiError::BadRequest(other.to_string()),
    }
}

/// Classify a Bot API error by its description text.
fn classify_description(description: &str) -> ApiError {
    let lower = description.to_lowercase();
    let has = |needle: &str| lower.contains(needle);

    if has("unauthorized") {
        ApiError::Unauthorized(description.to_string())
    } else if has("too many requests") {
        ApiError::Throttled {
            retry_after: std::time::Duration::from_secs(1),
        }
    } else if has("chat not found") || has("user not found") || has("participant_id_invalid") {
        ApiError::NotFound(description.to_string())
    } else if has("forbidden")
        || has("kicked")
        || has("not a member")
        || has("bot was blocked")
        || has("not enough rights")
        || has("have no rights")
    {
        ApiError::Forbidden(description.to_string())
    } else if has("conflict") {
        ApiError::Conflict(description.to_string())
    } else {
        ApiError::BadRequest(description.to_string())
    }
}

pub(crate) fn chat_info(chat: &teloxide::types::Chat) -> ChatInfo {
    let kind = if chat.is_supergroup() {
        ChatKind::Supergroup
    } else if chat.is_group() {
        ChatKind::Group
    } else if chat.is_channel() {
        ChatKind::Channel
    } else {
        ChatKind::Private
    };
    ChatInfo {
        id: ChatId(chat.id.0),
        kind,
        title: chat.title().map(str::to_string),
        username: chat.username().map(str::to_string),
    }
}

pub(crate) fn member_status(status: teloxide::types::ChatMemberStatus) -> MemberStatus {
    use teloxide::types::ChatMemberStatus as S;
    match status {
        S::Owner => MemberStatus::Owner,
        S::Administrator => MemberStatus::Administrator,
        S::Member => MemberStatus::Member,
        S::Restricted => MemberStatus::Restricted,
        S::Left => MemberStatus::Left,
        S::Banned => MemberStatus::Banned,
    }
}

fn chat_member(member: &teloxide::types::ChatMember) -> ChatMember {
    let user = &member.user;
    ChatMember {
        user: UserProfile {
            id: UserId(user.id.0 as i64),
            first_name: user.first_name.clone(),
            last_name: user.last_name.clone(),
            username: user.username.clone(),
            is_bot: user.is_bot,
        },
        status: member_status(member.status()),
    }
}
