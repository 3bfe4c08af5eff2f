//! Telegram WebApp `initData` verification.
//!
//! The credential is a URL-encoded query string signed by Telegram:
//!
//! ```text
//! data_check_string = sorted("key=value" for every field except hash).join("\n")
//! secret_key        = HMAC-SHA256(key = "WebAppData", msg = bot_token)
//! hash              = hex(HMAC-SHA256(key = secret_key, msg = data_check_string))
//! ```
//!
//! [`KeyDerivation::Direct`] skips the `WebAppData` step for issuers that sign
//! with the raw secret.

use std::{collections::BTreeMap, time::Duration};

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::domain::UserId;

type HmacSha256 = Hmac<Sha256>;

/// Domain separation constant Telegram mixes into the WebApp signing key.
pub const WEBAPP_KEY_DOMAIN: &[u8] = b"WebAppData";

/// Field holding the signature.
pub const HASH_FIELD: &str = "hash";

/// Field holding the issue time (unix seconds).
pub const AUTH_DATE_FIELD: &str = "auth_date";

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("credential is empty")]
    Empty,

    #[error("credential carries no signature")]
    MissingSignature,

    #[error("signature mismatch")]
    BadSignature,

    #[error("credential expired ({age_secs}s old, max {max_age_secs}s)")]
    Expired { age_secs: u64, max_age_secs: u64 },

    #[error("malformed credential: {0}")]
    Malformed(String),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum KeyDerivation {
    /// `HMAC-SHA256(key = "WebAppData", msg = secret)`, as Telegram issues it.
    #[default]
    WebAppData,
    /// The secret bytes are the HMAC key.
    Direct,
}

impl KeyDerivation {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "webappdata" | "webapp" | "telegram" => Some(KeyDerivation::WebAppData),
            "direct" | "raw" => Some(KeyDerivation::Direct),
            _ => None,
        }
    }

    pub fn derive(self, secret: &[u8]) -> Vec<u8> {
        match self {
            KeyDerivation::Direct => secret.to_vec(),
            KeyDerivation::WebAppData => {
                let mut mac = new_mac(WEBAPP_KEY_DOMAIN);
                mac.update(secret);
                mac.finalize().into_bytes().to_vec()
            }
        }
    }
}

/// What to do with an `auth_date` that is present but not an integer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MalformedAuthDate {
    #[default]
    Reject,
    Ignore,
}

/// Verified credential fields (everything except `hash`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidatedPrincipal {
    fields: BTreeMap<String, String>,
}

/// The `user` object embedded in WebApp init data.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct WebAppUser {
    pub id: UserId,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub language_code: Option<String>,
}

impl ValidatedPrincipal {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    pub fn fields(&self) -> &BTreeMap<String, String> {
        &self.fields
    }

    pub fn into_fields(self) -> BTreeMap<String, String> {
        self.fields
    }

    pub fn auth_date(&self) -> Option<i64> {
        self.get(AUTH_DATE_FIELD)?.trim().parse().ok()
    }

    /// Telegram user the credential was issued to.
    pub fn user(&self) -> Result<WebAppUser, AuthError> {
        let raw = self
            .get("user")
            .ok_or_else(|| AuthError::Malformed("user field is missing".to_string()))?;
        serde_json::from_str(raw)
            .map_err(|e| AuthError::Malformed(format!("user field is not valid JSON: {e}")))
    }

    pub fn user_id(&self) -> Result<UserId, AuthError> {
        self.user().map(|u| u.id)
    }
}

/// Preconfigured validator: derived key, max age and malformed-date policy.
#[derive(Clone)]
pub struct InitDataValidator {
    key: Vec<u8>,
    max_age: Duration,
    malformed_auth_date: MalformedAuthDate,
}

impl std::fmt::Debug for InitDataValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitDataValidator")
            .field("key", &"<redacted>")
            .field("max_age", &self.max_age)
            .field("malformed_auth_date", &self.malformed_auth_date)
            .finish()
    }
}

impl InitDataValidator {
    pub fn new(secret: &[u8], derivation: KeyDerivation, max_age: Duration) -> Self {
        Self {
            key: derivation.derive(secret),
            max_age,
            malformed_auth_date: MalformedAuthDate::default(),
        }
    }

    pub fn with_malformed_auth_date(mut self, policy: MalformedAuthDate) -> Self {
        self.malformed_auth_date = policy;
        self
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    pub fn validate(&self, raw: &str) -> Result<ValidatedPrincipal, AuthError> {
        self.validate_at(raw, chrono::Utc::now().timestamp())
    }

    pub fn validate_at(&self, raw: &str, now_unix: i64) -> Result<ValidatedPrincipal, AuthError> {
        let outcome = self.check(raw, now_unix);
        match &outcome {
            Ok(_) => tracing::debug!("init data validated"),
            Err(e) => tracing::warn!(reason = %e, "init data rejected"),
        }
        outcome
    }

    fn check(&self, raw: &str, now_unix: i64) -> Result<ValidatedPrincipal, AuthError> {
        if raw.trim().is_empty() {
            return Err(AuthError::Empty);
        }

        let mut fields = parse_fields(raw);
        let received = fields
            .remove(HASH_FIELD)
            .filter(|h| !h.is_empty())
            .ok_or(AuthError::MissingSignature)?;

        let expected = compute_digest(&self.key, &canonical_string(&fields));
        let received = hex::decode(received.trim()).map_err(|_| AuthError::BadSignature)?;
        if received.len() != expected.len() || !bool::from(expected.ct_eq(received.as_slice())) {
            return Err(AuthError::BadSignature);
        }

        if let Some(raw_date) = fields.get(AUTH_DATE_FIELD) {
            match raw_date.trim().parse::<i64>() {
                Ok(issued) => {
                    let age_secs = now_unix.saturating_sub(issued).max(0) as u64;
                    let max_age_secs = self.max_age.as_secs();
                    if age_secs > max_age_secs {
                        return Err(AuthError::Expired {
                            age_secs,
                            max_age_secs,
                        });
                    }
                }
                Err(_) if self.malformed_auth_date == MalformedAuthDate::Ignore => {}
                Err(_) => {
                    return Err(AuthError::Malformed(
                        "auth_date is not an integer timestamp".to_string(),
                    ))
                }
            }
        }

        Ok(ValidatedPrincipal { fields })
    }
}

/// One-shot validation with the default `WebAppData` key derivation.
pub fn validate(
    raw: &str,
    secret: &[u8],
    max_age: Duration,
) -> Result<ValidatedPrincipal, AuthError> {
    InitDataValidator::new(secret, KeyDerivation::default(), max_age).validate(raw)
}

/// Hex signature for `fields` (the issuer side of [`validate`]).
pub fn sign(fields: &BTreeMap<String, String>, secret: &[u8], derivation: KeyDerivation) -> String {
    let key = derivation.derive(secret);
    hex::encode(compute_digest(&key, &canonical_string(fields)))
}

/// Sorted `key=value` lines joined with `\n`. `BTreeMap` iteration is already
/// ordered by key.
pub fn canonical_string(fields: &BTreeMap<String, String>) -> String {
    fields
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Decoded fields of a query string; a repeated key keeps its last value.
fn parse_fields(raw: &str) -> BTreeMap<String, String> {
    url::form_urlencoded::parse(raw.trim().as_bytes())
        .into_owned()
        .collect()
}

fn compute_digest(key: &[u8], message: &str) -> Vec<u8> {
    let mut mac = new_mac(key);
    mac.update(message.as_bytes());
    mac.finalize().into_bytes().to_vec()
}

fn new_mac(key: &[u8]) -> HmacSha256 {
    // HMAC is defined for keys of any length; this never fails.
    match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => unreachable!("hmac accepts keys of any length"),
    }
}
