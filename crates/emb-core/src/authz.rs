use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    domain::{ChatId, MemberStatus, UserId},
    messaging::{
        error::{ApiError, ApiResult},
        port::MessagingApi,
    },
    ports::AuthorizationChecker,
    retry::{self, RetryPolicy},
};

/// [`AuthorizationChecker`] backed by `getChatMember`, with retries.
pub struct ApiAuthorization {
    api: Arc<dyn MessagingApi>,
    policy: Arc<RetryPolicy>,
}

impl ApiAuthorization {
    pub fn new(api: Arc<dyn MessagingApi>, policy: Arc<RetryPolicy>) -> Self {
        Self { api, policy }
    }

    async fn status_of(&self, chat: ChatId, user: UserId) -> ApiResult<Option<MemberStatus>> {
        let res = retry::execute(&self.policy, "get_chat_member", || {
            self.api.get_chat_member(chat, user)
        })
        .await;

        match res {
            Ok(member) => Ok(Some(member.status)),
            Err(ApiError::NotFound(_) | ApiError::Forbidden(_) | ApiError::BadRequest(_)) => {
                tracing::debug!(chat_id = chat.0, user_id = user.0, "membership unknown");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl AuthorizationChecker for ApiAuthorization {
    async fn is_bot_privileged(&self, chat: ChatId) -> ApiResult<bool> {
        let status = self.status_of(chat, self.api.bot_id()).await?;
        Ok(status.is_some_and(MemberStatus::is_privileged))
    }

    async fn is_user_owner(&self, chat: ChatId, user: UserId) -> ApiResult<bool> {
        let status = self.status_of(chat, user).await?;
        Ok(status == Some(MemberStatus::Owner))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ChatKind;
    use crate::messaging::types::{ChatInfo, ChatMember, UserProfile};
    use std::time::Duration;

    const BOT: UserId = UserId(999);

    /// Answers `getChatMember` from a fixed table; anything else is `NotFound`.
    struct Members(Vec<(ChatId, UserId, ApiResult<MemberStatus>)>);

    #[async_trait]
    impl MessagingApi for Members {
        fn bot_id(&self) -> UserId {
            BOT
        }

        async fn get_chat(&self, chat: ChatId) -> ApiResult<ChatInfo> {
            Ok(ChatInfo {
                id: chat,
                kind: ChatKind::Group,
                title: None,
                username: None,
            })
        }

        async fn get_chat_administrators(&self, _chat: ChatId) -> ApiResult<Vec<ChatMember>> {
            Ok(vec![])
        }

        async fn get_chat_member(&self, chat: ChatId, user: UserId) -> ApiResult<ChatMember> {
            let found = self.0.iter().find(|(c, u, _)| *c == chat && *u == user);
            match found {
                Some((_, _, Ok(status))) => Ok(ChatMember {
                    user: UserProfile {
                        id: user,
                        first_name: "x".into(),
                        last_name: None,
                        username: None,
                        is_bot: user == BOT,
                    },
                    status: *status,
                }),
                Some((_, _, Err(e))) => Err(e.clone()),
                None => Err(ApiError::NotFound("user not found".into())),
            }
        }

        async fn leave_chat(&self, _chat: ChatId) -> ApiResult<()> {
            Ok(())
        }
    }

    fn authz(table: Vec<(ChatId, UserId, ApiResult<MemberStatus>)>) -> ApiAuthorization {
        let policy = RetryPolicy::new(
            1,
            Duration::from_millis(1),
            Duration::from_millis(1),
            1.0,
            [],
        )
        .unwrap();
        ApiAuthorization::new(Arc::new(Members(table)), Arc::new(policy))
    }

    #[tokio::test]
    async fn bot_privilege_requires_admin_or_creator() {
        let a = authz(vec![
            (ChatId(-1), BOT, Ok(MemberStatus::Administrator)),
            (ChatId(-2), BOT, Ok(MemberStatus::Member)),
            (ChatId(-3), BOT, Ok(MemberStatus::Owner)),
        ]);
        assert!(a.is_bot_privileged(ChatId(-1)).await.unwrap());
        assert!(!a.is_bot_privileged(ChatId(-2)).await.unwrap());
        assert!(a.is_bot_privileged(ChatId(-3)).await.unwrap());
        assert!(!a.is_bot_privileged(ChatId(-4)).await.unwrap());
    }

    #[tokio::test]
    async fn only_the_creator_is_owner() {
        let a = authz(vec![
            (ChatId(-1), UserId(1), Ok(MemberStatus::Owner)),
            (ChatId(-1), UserId(2), Ok(MemberStatus::Administrator)),
            (
                ChatId(-2),
                UserId(1),
                Err(ApiError::Forbidden("bot was kicked".into())),
            ),
        ]);
        assert!(a.is_user_owner(ChatId(-1), UserId(1)).await.unwrap());
        assert!(!a.is_user_owner(ChatId(-1), UserId(2)).await.unwrap());
        assert!(!a.is_user_owner(ChatId(-2), UserId(1)).await.unwrap());
    }

    #[tokio::test]
    async fn systemic_failures_propagate() {
        let a = authz(vec![(ChatId(-1), BOT, Err(ApiError::Timeout))]);
        assert_eq!(a.is_bot_privileged(ChatId(-1)).await, Err(ApiError::Timeout));
    }
}
