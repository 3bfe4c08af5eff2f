use std::time::Duration;

use crate::{init_data::AuthError, messaging::error::ApiError};

/// Core error type for the gateway.
///
/// Adapter crates map their specific failures into [`ApiError`] so the gateway
/// can tell retryable, systemic and per-chat failures apart.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("telegram api error: {0}")]
    Api(#[from] ApiError),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("external error: {0}")]
    External(String),
}

impl Error {
    /// Text that is safe to hand back to a WebApp caller.
    pub fn user_message(&self) -> String {
        match self {
            Error::Auth(_) => "Authentication failed. Reopen the app from Telegram.".to_string(),
            Error::Forbidden(reason) => format!("Access denied: {reason}."),
            Error::Unavailable(_) => {
                "Telegram is not reachable right now. Please try again later.".to_string()
            }
            Error::Timeout(_) => "The request took too long. Please try again.".to_string(),
            Error::RateLimited { retry_after } => format!(
                "Too many requests. Try again in {} seconds.",
                retry_after.as_secs().max(1)
            ),
            Error::Api(e) => e.user_message().to_string(),
            Error::Config(_) | Error::Io(_) | Error::Json(_) | Error::External(_) => {
                "Internal error.".to_string()
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
