//! Chat/member aggregation on top of the Bot API.
//!
//! Listings are computed by fanning out over the chat registry, memoized in
//! the [`ResponseCache`], and served stale (flagged `degraded`) when Telegram
//! is unreachable.
//!
//! Registry and membership events only expire cached listings early; the
//! expired values stay behind for the degraded path. Listings that mention a
//! chat the bot left are the exception and are dropped outright.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use futures_util::{stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::{
    cache::{CacheKey, ResponseCache},
    domain::{ChatId, ChatKind, MemberStatus, UserId},
    errors::Error,
    messaging::{error::ApiError, port::MessagingApi, types::ChatInfo},
    ports::{AuthorizationChecker, ChatRecord, ChatRegistry},
    retry::{self, RetryPolicy},
    telemetry, Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GatewayConfig {
    pub chats_ttl: Duration,
    pub members_ttl: Duration,
    /// Upper bound on chats checked at the same time.
    pub concurrency: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            chats_ttl: Duration::from_secs(300),
            members_ttl: Duration::from_secs(3600),
            concurrency: 5,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSummary {
    pub id: ChatId,
    pub title: String,
    #[serde(rename = "type")]
    pub kind: ChatKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatStats {
    pub total: usize,
    pub groups: usize,
    pub supergroups: usize,
}

/// Why candidate chats were left out of a listing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipCounters {
    pub not_group: usize,
    pub bot_not_admin: usize,
    pub user_not_owner: usize,
    pub failed: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatListing {
    pub chats: Vec<ChatSummary>,
    pub stats: ChatStats,
    pub skipped: SkipCounters,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberSummary {
    pub id: UserId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub status: MemberStatus,
    pub is_bot: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberListing {
    pub chat: ChatId,
    pub members: Vec<MemberSummary>,
}

/// Values stored in the gateway's cache.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Aggregate {
    Chats(ChatListing),
    Members(MemberListing),
}

/// A listing plus where it came from.
#[derive(Clone, Debug, PartialEq)]
pub struct Served<T> {
    pub value: T,
    /// Served from an expired or superseded cache entry because Telegram failed.
    pub degraded: bool,
    pub cached: bool,
    /// Age of the cached value, when it came from the cache.
    pub age: Option<Duration>,
}

impl<T> Served<T> {
    fn fresh(value: T) -> Self {
        Self {
            value,
            degraded: false,
            cached: false,
            age: None,
        }
    }

    fn cached(value: T) -> Self {
        Self {
            value,
            degraded: false,
            cached: true,
            age: None,
        }
    }
}

enum Candidate {
    Accepted(ChatRecord, ChatInfo),
    NotGroup,
    BotNotAdmin,
    UserNotOwner,
}

pub struct ChatGateway {
    api: Arc<dyn MessagingApi>,
    authz: Arc<dyn AuthorizationChecker>,
    registry: Arc<dyn ChatRegistry>,
    policy: Arc<RetryPolicy>,
    cache: Arc<ResponseCache<Aggregate>>,
    cfg: GatewayConfig,
}

impl ChatGateway {
    pub fn new(
        api: Arc<dyn MessagingApi>,
        authz: Arc<dyn AuthorizationChecker>,
        registry: Arc<dyn ChatRegistry>,
        policy: Arc<RetryPolicy>,
        cache: Arc<ResponseCache<Aggregate>>,
        cfg: GatewayConfig,
    ) -> Self {
        Self {
            api,
            authz,
            registry,
            policy,
            cache,
            cfg,
        }
    }

    pub fn cache(&self) -> &ResponseCache<Aggregate> {
        &self.cache
    }

    /// Group chats where the bot is an administrator and `user` is the creator.
    pub async fn list_chats(
        &self,
        user: UserId,
        force_refresh: bool,
    ) -> Result<Served<ChatListing>> {
        let key = CacheKey::Chats { user }.to_string();
        if !force_refresh {
            if let Some(Aggregate::Chats(listing)) = self.cache.get_fresh(&key) {
                tracing::debug!(user_id = user.0, "chat listing served from cache");
                return Ok(Served::cached(listing));
            }
        }

        match self.collect_chats(user).await {
            Ok(listing) => {
                tracing::info!(
                    user_id = user.0,
                    chats = listing.stats.total,
                    failed = listing.skipped.failed,
                    "chat listing refreshed"
                );
                self.cache
                    .set(key, Aggregate::Chats(listing.clone()), self.cfg.chats_ttl);
                Ok(Served::fresh(listing))
            }
            Err(err) if is_outage(&err) => {
                self.serve_stale(&key, "chats", err, |agg| match agg {
                    Aggregate::Chats(listing) => Some(listing),
                    Aggregate::Members(_) => None,
                })
            }
            Err(err) => Err(err),
        }
    }

    /// Administrators of `chat`; only its creator may ask.
    pub async fn list_members(
        &self,
        user: UserId,
        chat: ChatId,
        force_refresh: bool,
    ) -> Result<Served<MemberListing>> {
        let key = CacheKey::Members { chat, user }.to_string();
        if !force_refresh {
            if let Some(Aggregate::Members(listing)) = self.cache.get_fresh(&key) {
                tracing::debug!(
                    chat_id = chat.0,
                    user_id = user.0,
                    "member listing served from cache"
                );
                return Ok(Served::cached(listing));
            }
        }

        match self.collect_members(user, chat).await {
            Ok(listing) => {
                self.cache
                    .set(key, Aggregate::Members(listing.clone()), self.cfg.members_ttl);
                Ok(Served::fresh(listing))
            }
            Err(err) if is_outage(&err) => {
                self.serve_stale(&key, "members", err, |agg| match agg {
                    Aggregate::Members(listing) => Some(listing),
                    Aggregate::Chats(_) => None,
                })
            }
            Err(err) => Err(err),
        }
    }

    /// Make the bot leave `chat` on behalf of its creator.
    pub async fn leave_chat(&self, user: UserId, chat: ChatId) -> Result<()> {
        if !self.authz.is_user_owner(chat, user).await? {
            return Err(Error::Forbidden(
                "only the chat creator can remove the bot".to_string(),
            ));
        }
        retry::execute(&self.policy, "leave_chat", || self.api.leave_chat(chat)).await?;
        tracing::info!(chat_id = chat.0, user_id = user.0, "left chat");
        self.forget_chat(chat).await?;
        Ok(())
    }

    pub async fn is_known(&self, chat: ChatId) -> Result<bool> {
        Ok(self.registry.get(chat).await?.is_some())
    }

    /// Register (or refresh) a chat the bot is in.
    ///
    /// Chat listings are expired only when the chat is new or changed kind;
    /// a title change alone does not alter who may see it.
    pub async fn note_chat(&self, info: &ChatInfo) -> Result<()> {
        let previous = self.registry.get(info.id).await?;
        let now = Utc::now();
        let record = ChatRecord {
            id: info.id,
            title: info.display_title(),
            kind: info.kind,
            username: info.username.clone(),
            registered_at: now,
            updated_at: now,
        };
        self.registry.upsert(record).await?;

        if previous.map(|r| r.kind) != Some(info.kind) {
            self.cache.expire_prefix(CacheKey::CHATS_NAMESPACE);
            tracing::debug!(chat_id = info.id.0, kind = info.kind.as_str(), "chat registered");
        }
        Ok(())
    }

    /// Drop a chat the bot is no longer in. Returns whether it was known.
    pub async fn forget_chat(&self, chat: ChatId) -> Result<bool> {
        let removed = self.registry.remove(chat).await?;
        self.cache.invalidate_prefix(&CacheKey::members_prefix(chat));
        self.cache.expire_prefix(CacheKey::CHATS_NAMESPACE);
        if removed {
            tracing::info!(chat_id = chat.0, "chat forgotten");
        }
        Ok(removed)
    }

    /// The administrator set of `chat` changed.
    pub fn expire_members(&self, chat: ChatId) {
        self.cache.expire_prefix(&CacheKey::members_prefix(chat));
    }

    /// Ownership of `chat` or the bot's rights in it changed; both listings may differ.
    pub fn expire_listings(&self, chat: ChatId) {
        self.cache.expire_prefix(CacheKey::CHATS_NAMESPACE);
        self.cache.expire_prefix(&CacheKey::members_prefix(chat));
    }

    async fn collect_chats(&self, user: UserId) -> Result<ChatListing> {
        let candidates = self.registry.all().await?;
        let checks: Vec<_> = candidates
            .into_iter()
            .map(|record| self.check_candidate(record, user))
            .collect();
        let mut results = stream::iter(checks).buffer_unordered(self.cfg.concurrency.max(1));

        let mut accepted = Vec::new();
        let mut skipped = SkipCounters::default();
        while let Some(outcome) = results.next().await {
            match outcome {
                Ok(Candidate::Accepted(record, info)) => accepted.push((record, info)),
                Ok(Candidate::NotGroup) => skipped.not_group += 1,
                Ok(Candidate::BotNotAdmin) => skipped.bot_not_admin += 1,
                Ok(Candidate::UserNotOwner) => skipped.user_not_owner += 1,
                Err(err) if err.is_systemic() => {
                    tracing::warn!(user_id = user.0, error = %err, "chat scan aborted");
                    return Err(Error::Api(err));
                }
                Err(err) => {
                    tracing::warn!(user_id = user.0, error = %err, "chat check failed, skipping");
                    skipped.failed += 1;
                }
            }
        }
        drop(results);

        let mut chats = Vec::with_capacity(accepted.len());
        for (record, info) in accepted {
            let summary = ChatSummary {
                id: info.id,
                title: info.display_title(),
                kind: info.kind,
                username: info.username.clone(),
            };
            let refreshed = ChatRecord {
                title: summary.title.clone(),
                kind: info.kind,
                username: info.username,
                updated_at: Utc::now(),
                ..record
            };
            if let Err(e) = self.registry.upsert(refreshed).await {
                tracing::warn!(
                    chat_id = summary.id.0,
                    error = %e,
                    "failed to update chat registry"
                );
            }
            chats.push(summary);
        }

        chats.sort_by(|a, b| {
            a.title
                .to_lowercase()
                .cmp(&b.title.to_lowercase())
                .then(a.id.cmp(&b.id))
        });
        let stats = ChatStats {
            total: chats.len(),
            groups: chats.iter().filter(|c| c.kind == ChatKind::Group).count(),
            supergroups: chats
                .iter()
                .filter(|c| c.kind == ChatKind::Supergroup)
                .count(),
        };

        Ok(ChatListing {
            chats,
            stats,
            skipped,
        })
    }

    async fn check_candidate(
        &self,
        record: ChatRecord,
        user: UserId,
    ) -> std::result::Result<Candidate, ApiError> {
        let chat = record.id;
        let info = retry::execute(&self.policy, "get_chat", || self.api.get_chat(chat)).await?;
        if !info.kind.is_group() {
            return Ok(Candidate::NotGroup);
        }
        if !self.authz.is_bot_privileged(chat).await? {
            return Ok(Candidate::BotNotAdmin);
        }
        if !self.authz.is_user_owner(chat, user).await? {
            return Ok(Candidate::UserNotOwner);
        }
        Ok(Candidate::Accepted(record, info))
    }

    async fn collect_members(&self, user: UserId, chat: ChatId) -> Result<MemberListing> {
        if !self.authz.is_user_owner(chat, user).await? {
            tracing::warn!(
                chat_id = chat.0,
                user_id = user.0,
                "member listing refused: not owner"
            );
            return Err(Error::Forbidden(
                "only the chat creator can view its members".to_string(),
            ));
        }
        if !self.authz.is_bot_privileged(chat).await? {
            return Err(Error::Forbidden(
                "the bot is not an administrator of this chat".to_string(),
            ));
        }

        let admins = retry::execute(&self.policy, "get_chat_administrators", || {
            self.api.get_chat_administrators(chat)
        })
        .await?;

        let mut members: Vec<MemberSummary> = admins
            .into_iter()
            .map(|m| MemberSummary {
                id: m.user.id,
                name: m.user.full_name(),
                username: m.user.username,
                status: m.status,
                is_bot: m.user.is_bot,
            })
            .collect();
        members.sort_by(|a, b| {
            let rank = |m: &MemberSummary| u8::from(m.status != MemberStatus::Owner);
            rank(a)
                .cmp(&rank(b))
                .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
                .then(a.id.cmp(&b.id))
        });

        Ok(MemberListing { chat, members })
    }

    fn serve_stale<T>(
        &self,
        key: &str,
        listing: &'static str,
        cause: Error,
        pick: impl FnOnce(Aggregate) -> Option<T>,
    ) -> Result<Served<T>> {
        let Some(read) = self.cache.get_even_if_stale(key) else {
            tracing::warn!(key, error = %cause, "telegram unavailable and nothing cached");
            return Err(Error::Unavailable(cause.to_string()));
        };
        let age = read.age;
        let Some(value) = pick(read.value) else {
            return Err(Error::Unavailable(cause.to_string()));
        };
        tracing::warn!(
            key,
            age_secs = age.as_secs(),
            error = %cause,
            "telegram unavailable, serving cached listing"
        );
        telemetry::record_degraded(listing);
        Ok(Served {
            value,
            degraded: true,
            cached: true,
            age: Some(age),
        })
    }
}

fn is_outage(err: &Error) -> bool {
    matches!(err, Error::Api(e) if e.is_systemic())
}
