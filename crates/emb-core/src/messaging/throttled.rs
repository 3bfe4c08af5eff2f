use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use crate::{
    domain::{ChatId, UserId},
    messaging::{
        error::ApiResult,
        port::MessagingApi,
        types::{ChatInfo, ChatMember},
    },
};

/// Per-chat limiters tracked before idle ones are dropped.
const PRUNE_AT: usize = 256;

#[derive(Clone, Copy, Debug)]
pub struct ThrottleConfig {
    /// Minimum spacing between *any* Bot API calls (global flood control).
    pub global_min_interval: Duration,
    /// Minimum spacing between calls touching the same chat.
    pub per_chat_min_interval: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            global_min_interval: Duration::from_millis(40), // ~25/sec
            per_chat_min_interval: Duration::from_millis(350),
        }
    }
}

#[derive(Debug)]
struct IntervalLimiter {
    interval: Duration,
    next: Instant,
}

impl IntervalLimiter {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            next: Instant::now(),
        }
    }

    /// Reserve the next slot and return the wait duration required before executing.
    fn reserve(&mut self) -> Duration {
        let now = Instant::now();
        let start = if now >= self.next { now } else { self.next };
        self.next = start + self.interval;
        start.saturating_duration_since(now)
    }
}

/// `MessagingApi` decorator that paces outbound calls.
///
/// This lowers the odds of a 429 during fan-out; it does not replace honoring
/// `retry_after` in the retry executor.
pub struct ThrottledApi {
    inner: Arc<dyn MessagingApi>,
    cfg: ThrottleConfig,
    global: Mutex<IntervalLimiter>,
    per_chat: Mutex<HashMap<ChatId, Arc<Mutex<IntervalLimiter>>>>,
}

impl ThrottledApi {
    pub fn new(inner: Arc<dyn MessagingApi>, cfg: ThrottleConfig) -> Self {
        Self {
            inner,
            cfg,
            global: Mutex::new(IntervalLimiter::new(cfg.global_min_interval)),
            per_chat: Mutex::new(HashMap::new()),
        }
    }

    async fn limiter_for_chat(&self, chat: ChatId) -> Arc<Mutex<IntervalLimiter>> {
        let mut map = self.per_chat.lock().await;
        if map.len() >= PRUNE_AT && !map.contains_key(&chat) {
            // An idle limiter would grant its next slot immediately anyway.
            let now = Instant::now();
            map.retain(|_, lim| lim.try_lock().map_or(true, |l| l.next > now));
        }
        map.entry(chat)
            .or_insert_with(|| {
                Arc::new(Mutex::new(IntervalLimiter::new(
                    self.cfg.per_chat_min_interval,
                )))
            })
            .clone()
    }

    async fn throttle_chat(&self, chat: ChatId) {
        let global_wait = { self.global.lock().await.reserve() };
        let chat_wait = {
            let lim = self.limiter_for_chat(chat).await;
            let mut guard = lim.lock().await;
            guard.reserve()
        };

        let wait = global_wait.max(chat_wait);
        if !wait.is_zero() {
            sleep(wait).await;
        }
    }

    #[cfg(test)]
    async fn tracked_chats(&self) -> usize {
        self.per_chat.lock().await.len()
    }
}

#[async_trait]
impl MessagingApi for ThrottledApi {
    fn bot_id(&self) -> UserId {
        self.inner.bot_id()
    }

    async fn get_chat(&self, chat: ChatId) -> ApiResult<ChatInfo> {
        self.throttle_chat(chat).await;
        self.inner.get_chat(chat).await
    }

    async fn get_chat_administrators(&self, chat: ChatId) -> ApiResult<Vec<ChatMember>> {
        self.throttle_chat(chat).await;
        self.inner.get_chat_administrators(chat).await
    }

    async fn get_chat_member(&self, chat: ChatId, user: UserId) -> ApiResult<ChatMember> {
        self.throttle_chat(chat).await;
        self.inner.get_chat_member(chat, user).await
    }

    async fn leave_chat(&self, chat: ChatId) -> ApiResult<()> {
        self.throttle_chat(chat).await;
        self.inner.leave_chat(chat).await
    }
}
