//! Synchronous entry points for WebApp requests.
//!
//! Each request is authenticated from its `initData`, rate limited per user,
//! and then drives the [`ChatGateway`] to completion through the bridge.
//! Everything a request logs, on either side of the bridge, carries its
//! `request_id`.

use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use tracing::Instrument;
use uuid::Uuid;

use crate::{
    bridge,
    domain::{ChatId, UserId},
    errors::Error,
    gateway::{ChatGateway, ChatStats, ChatSummary, MemberSummary, SkipCounters},
    init_data::{InitDataValidator, WebAppUser},
    security::RateLimiter,
    telemetry, Result,
};

#[derive(Clone, Debug, Deserialize)]
pub struct ChatListRequest {
    pub init_data: String,
    /// User id the caller claims to be; must match the credential when present.
    #[serde(default)]
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub force_refresh: bool,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ChatMembersRequest {
    pub init_data: String,
    pub chat_id: ChatId,
    #[serde(default)]
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub force_refresh: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ChatListResponse {
    pub success: bool,
    pub chats: Vec<ChatSummary>,
    pub stats: ChatStats,
    pub skipped: SkipCounters,
    pub degraded: bool,
    pub cached: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MemberListResponse {
    pub success: bool,
    pub chat_id: ChatId,
    pub members: Vec<MemberSummary>,
    pub total: usize,
    pub degraded: bool,
    pub cached: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl ErrorResponse {
    pub fn from_error(err: &Error) -> Self {
        let retry_after = match err {
            Error::RateLimited { retry_after } => Some(retry_after.as_secs().max(1)),
            _ => None,
        };
        Self {
            success: false,
            error: err.user_message(),
            retry_after,
        }
    }
}

pub struct WebAppHandler {
    validator: InitDataValidator,
    gateway: Arc<ChatGateway>,
    limiter: Mutex<RateLimiter>,
    timeout: Duration,
}

impl WebAppHandler {
    pub fn new(
        validator: InitDataValidator,
        gateway: Arc<ChatGateway>,
        limiter: RateLimiter,
        timeout: Duration,
    ) -> Self {
        Self {
            validator,
            gateway,
            limiter: Mutex::new(limiter),
            timeout,
        }
    }

    /// Verify `init_data` and, when given, that it belongs to `claimed`.
    pub fn authenticate(&self, init_data: &str, claimed: Option<UserId>) -> Result<WebAppUser> {
        let principal = self.validator.validate(init_data)?;
        let user = principal.user()?;
        if let Some(claimed) = claimed {
            if claimed != user.id {
                tracing::warn!(
                    claimed = claimed.0,
                    user_id = user.id.0,
                    "user id does not match credential"
                );
                return Err(Error::Forbidden(
                    "user id does not match the credential".to_string(),
                ));
            }
        }
        Ok(user)
    }

    pub fn chats(&self, req: &ChatListRequest) -> Result<ChatListResponse> {
        self.observe("chats", |span| self.list_chats(req, span))
    }

    pub fn members(&self, req: &ChatMembersRequest) -> Result<MemberListResponse> {
        self.observe("members", |span| self.list_members(req, span))
    }

    /// Run one request inside its own span and record its outcome.
    fn observe<T>(
        &self,
        endpoint: &'static str,
        handle: impl FnOnce(&tracing::Span) -> Result<T>,
    ) -> Result<T> {
        let span = tracing::info_span!(
            "webapp_request",
            request_id = %Uuid::new_v4().simple(),
            endpoint
        );
        let _entered = span.enter();
        let started = Instant::now();

        let result = handle(&span);
        if let Err(e) = &result {
            tracing::debug!(error = %e, "request failed");
        }
        telemetry::record_request(endpoint, result.as_ref().map(|_| ()), started.elapsed());
        result
    }

    fn list_chats(&self, req: &ChatListRequest, span: &tracing::Span) -> Result<ChatListResponse> {
        let user = self.admit(&req.init_data, req.user_id)?;
        let served = bridge::run_to_completion(
            self.gateway
                .list_chats(user, req.force_refresh)
                .instrument(span.clone()),
            self.timeout,
        )??;

        Ok(ChatListResponse {
            success: true,
            stats: served.value.stats,
            skipped: served.value.skipped,
            chats: served.value.chats,
            degraded: served.degraded,
            cached: served.cached,
        })
    }

    fn list_members(
        &self,
        req: &ChatMembersRequest,
        span: &tracing::Span,
    ) -> Result<MemberListResponse> {
        let user = self.admit(&req.init_data, req.user_id)?;
        let served = bridge::run_to_completion(
            self.gateway
                .list_members(user, req.chat_id, req.force_refresh)
                .instrument(span.clone()),
            self.timeout,
        )??;

        Ok(MemberListResponse {
            success: true,
            chat_id: served.value.chat,
            total: served.value.members.len(),
            members: served.value.members,
            degraded: served.degraded,
            cached: served.cached,
        })
    }

    fn admit(&self, init_data: &str, claimed: Option<UserId>) -> Result<UserId> {
        let user = self.authenticate(init_data, claimed)?;
        self.limiter
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .admit(user.id)?;
        Ok(user.id)
    }
}
