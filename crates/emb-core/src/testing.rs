//! Fakes shared by the gateway and request-handler tests.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;

use crate::{
    authz::ApiAuthorization,
    cache::ResponseCache,
    domain::{ChatId, ChatKind, MemberStatus, UserId},
    gateway::{ChatGateway, GatewayConfig},
    messaging::{
        error::{ApiError, ApiResult},
        port::MessagingApi,
        types::{ChatInfo, ChatMember, UserProfile},
    },
    ports::{ChatRecord, ChatRegistry},
    registry::JsonChatRegistry,
    retry::RetryPolicy,
};

pub const BOT: UserId = UserId(999);
pub const OWNER: UserId = UserId(1);
pub const OTHER: UserId = UserId(2);

pub fn profile(id: UserId, name: &str) -> UserProfile {
    UserProfile {
        id,
        first_name: name.to_string(),
        last_name: None,
        username: None,
        is_bot: id == BOT,
    }
}

/// Scripted Bot API. `outage` makes every call fail with the given error;
/// `fail_next` fails only the next few calls.
#[derive(Default)]
pub struct FakeApi {
    chats: HashMap<ChatId, ApiResult<ChatInfo>>,
    members: HashMap<(ChatId, UserId), MemberStatus>,
    outage: Mutex<Option<ApiError>>,
    failures: Mutex<VecDeque<ApiError>>,
    calls: AtomicUsize,
    pub left: Mutex<Vec<ChatId>>,
}

impl FakeApi {
    pub fn chat(mut self, id: i64, kind: ChatKind, title: &str) -> Self {
        self.chats.insert(
            ChatId(id),
            Ok(ChatInfo {
                id: ChatId(id),
                kind,
                title: Some(title.to_string()),
                username: None,
            }),
        );
        self
    }

    pub fn broken_chat(mut self, id: i64, err: ApiError) -> Self {
        self.chats.insert(ChatId(id), Err(err));
        self
    }

    pub fn member(mut self, chat: i64, user: UserId, status: MemberStatus) -> Self {
        self.members.insert((ChatId(chat), user), status);
        self
    }

    pub fn set_outage(&self, err: Option<ApiError>) {
        *self.outage.lock().unwrap() = err;
    }

    pub fn fail_next(&self, err: ApiError, times: usize) {
        let mut failures = self.failures.lock().unwrap();
        failures.extend(std::iter::repeat(err).take(times));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn enter(&self) -> ApiResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = self.outage.lock().unwrap().clone() {
            return Err(e);
        }
        match self.failures.lock().unwrap().pop_front() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl MessagingApi for FakeApi {
    fn bot_id(&self) -> UserId {
        BOT
    }

    async fn get_chat(&self, chat: ChatId) -> ApiResult<ChatInfo> {
        self.enter()?;
        self.chats
            .get(&chat)
            .cloned()
            .unwrap_or_else(|| Err(ApiError::NotFound("chat not found".into())))
    }

    async fn get_chat_administrators(&self, chat: ChatId) -> ApiResult<Vec<ChatMember>> {
        self.enter()?;
        Ok(self
            .members
            .iter()
            .filter(|((c, _), s)| *c == chat && s.is_privileged())
            .map(|((_, u), s)| ChatMember {
                user: profile(*u, &format!("user{}", u.0)),
                status: *s,
            })
            .collect())
    }

    async fn get_chat_member(&self, chat: ChatId, user: UserId) -> ApiResult<ChatMember> {
        self.enter()?;
        match self.members.get(&(chat, user)) {
            Some(s) => Ok(ChatMember {
                user: profile(user, "x"),
                status: *s,
            }),
            None => Err(ApiError::BadRequest("user not found".into())),
        }
    }

    async fn leave_chat(&self, chat: ChatId) -> ApiResult<()> {
        self.enter()?;
        self.left.lock().unwrap().push(chat);
        Ok(())
    }
}

/// Six candidate chats: two listable by [`OWNER`], one of each skip reason.
pub fn standard_api() -> FakeApi {
    FakeApi::default()
        .chat(-1, ChatKind::Supergroup, "beta")
        .member(-1, BOT, MemberStatus::Administrator)
        .member(-1, OWNER, MemberStatus::Owner)
        .member(-1, OTHER, MemberStatus::Administrator)
        .chat(-2, ChatKind::Group, "Alpha")
        .member(-2, BOT, MemberStatus::Administrator)
        .member(-2, OWNER, MemberStatus::Owner)
        .chat(-3, ChatKind::Private, "dm")
        .chat(-4, ChatKind::Group, "bot is plain member")
        .member(-4, BOT, MemberStatus::Member)
        .member(-4, OWNER, MemberStatus::Owner)
        .chat(-5, ChatKind::Group, "someone else's")
        .member(-5, BOT, MemberStatus::Administrator)
        .member(-5, OWNER, MemberStatus::Administrator)
        .broken_chat(-6, ApiError::Forbidden("bot was kicked".into()))
}

pub const STANDARD_CHATS: [i64; 6] = [-1, -2, -3, -4, -5, -6];

pub struct Harness {
    pub api: Arc<FakeApi>,
    pub registry: Arc<JsonChatRegistry>,
    pub gateway: Arc<ChatGateway>,
}

/// Gateway over `api` with a single-attempt retry policy.
pub async fn harness(api: FakeApi, chats: &[i64], cfg: GatewayConfig) -> Harness {
    let policy =
        RetryPolicy::new(1, Duration::from_millis(1), Duration::from_millis(1), 1.0, []).unwrap();
    harness_with_policy(api, chats, cfg, policy).await
}

pub async fn harness_with_policy(
    api: FakeApi,
    chats: &[i64],
    cfg: GatewayConfig,
    policy: RetryPolicy,
) -> Harness {
    let api = Arc::new(api);
    let registry = Arc::new(JsonChatRegistry::in_memory());
    for id in chats {
        let now = Utc::now();
        registry
            .upsert(ChatRecord {
                id: ChatId(*id),
                title: String::new(),
                kind: ChatKind::Group,
                username: None,
                registered_at: now,
                updated_at: now,
            })
            .await
            .unwrap();
    }
    let policy = Arc::new(policy);
    let authz = Arc::new(ApiAuthorization::new(api.clone(), policy.clone()));
    let gateway = Arc::new(ChatGateway::new(
        api.clone(),
        authz,
        registry.clone(),
        policy,
        Arc::new(ResponseCache::new()),
        cfg,
    ));
    Harness {
        api,
        registry,
        gateway,
    }
}
