use std::time::Duration;

/// Failure of a single Bot API call, classified at the adapter boundary.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    #[error("throttled, retry after {retry_after:?}")]
    Throttled { retry_after: Duration },

    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),
}

/// Transient failure kinds a [`RetryPolicy`](crate::retry::RetryPolicy) may opt into.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Transient {
    Network,
    Timeout,
    Conflict,
}

impl Transient {
    pub const ALL: [Transient; 3] = [Transient::Network, Transient::Timeout, Transient::Conflict];
}

/// What the retry executor should do with an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// The server named a wait duration.
    Throttled(Duration),
    Retryable(Transient),
    Fatal,
}

impl ApiError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ApiError::Throttled { retry_after } => ErrorClass::Throttled(*retry_after),
            ApiError::Network(_) => ErrorClass::Retryable(Transient::Network),
            ApiError::Timeout => ErrorClass::Retryable(Transient::Timeout),
            ApiError::Conflict(_) => ErrorClass::Retryable(Transient::Conflict),
            ApiError::Unauthorized(_)
            | ApiError::Forbidden(_)
            | ApiError::NotFound(_)
            | ApiError::BadRequest(_) => ErrorClass::Fatal,
        }
    }

    /// True when the failure says the API as a whole is unusable (unreachable,
    /// throttling us, or rejecting the bot token) rather than something being
    /// wrong with one chat.
    pub fn is_systemic(&self) -> bool {
        matches!(
            self,
            ApiError::Throttled { .. }
                | ApiError::Network(_)
                | ApiError::Timeout
                | ApiError::Unauthorized(_)
        )
    }

    pub fn user_message(&self) -> &'static str {
        match self {
            ApiError::Throttled { .. } => "Telegram rate limit reached. Try again shortly.",
            ApiError::Network(_) | ApiError::Timeout => {
                "Network error while contacting Telegram. Try again later."
            }
            ApiError::Conflict(_) => "Conflicting operation in progress.",
            ApiError::Unauthorized(_) => "The bot is not authorized. Check its token.",
            ApiError::Forbidden(_) => "The bot has no access to this chat.",
            ApiError::NotFound(_) => "Chat or user not found.",
            ApiError::BadRequest(_) => "Telegram rejected the request.",
        }
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_matches_taxonomy() {
        let d = Duration::from_secs(5);
        assert_eq!(
            ApiError::Throttled { retry_after: d }.class(),
            ErrorClass::Throttled(d)
        );
        assert_eq!(
            ApiError::Timeout.class(),
            ErrorClass::Retryable(Transient::Timeout)
        );
        assert_eq!(
            ApiError::Conflict("x".into()).class(),
            ErrorClass::Retryable(Transient::Conflict)
        );
        for fatal in [
            ApiError::Unauthorized("x".into()),
            ApiError::Forbidden("x".into()),
            ApiError::NotFound("x".into()),
            ApiError::BadRequest("x".into()),
        ] {
            assert_eq!(fatal.class(), ErrorClass::Fatal);
        }
    }

    #[test]
    fn per_chat_errors_are_not_systemic() {
        assert!(ApiError::Network("down".into()).is_systemic());
        assert!(ApiError::Unauthorized("token".into()).is_systemic());
        assert!(!ApiError::NotFound("chat".into()).is_systemic());
        assert!(!ApiError::Forbidden("kicked".into()).is_systemic());
        assert!(!ApiError::Conflict("x".into()).is_systemic());
    }
}
