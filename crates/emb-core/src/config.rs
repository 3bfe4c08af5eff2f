use std::{
    env, fmt, fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use crate::{
    errors::Error,
    gateway::GatewayConfig,
    init_data::{InitDataValidator, KeyDerivation},
    messaging::error::Transient,
    retry::RetryPolicy,
    security::RateLimiter,
    Result,
};

/// Typed configuration, read from the environment.
#[derive(Clone)]
pub struct Config {
    // Core
    pub bot_token: String,

    // WebApp credentials
    pub webapp_secret: String,
    /// No dedicated secret was configured; the bot token is the signing input.
    pub webapp_secret_is_token: bool,
    pub webapp_data_max_age: Duration,
    pub webapp_key_derivation: KeyDerivation,

    // Cache
    pub chats_cache_ttl: Duration,
    pub members_cache_ttl: Duration,
    pub cache_max_entries: usize,

    // Retries
    pub retry_max_attempts: u32,
    pub retry_initial_delay: Duration,
    pub retry_max_delay: Duration,
    pub retry_backoff_multiplier: f64,

    // Gateway
    pub fetch_concurrency: usize,
    pub request_timeout: Duration,
    pub chat_registry_file: PathBuf,

    // Rate limiting
    pub rate_limit_enabled: bool,
    pub rate_limit_requests: u32,
    pub rate_limit_window: Duration,

    // Observability
    /// Where to serve Prometheus metrics; unset disables the exporter.
    pub metrics_addr: Option<SocketAddr>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("bot_token", &"<redacted>")
            .field("webapp_secret", &"<redacted>")
            .field("webapp_secret_is_token", &self.webapp_secret_is_token)
            .field("webapp_data_max_age", &self.webapp_data_max_age)
            .field("webapp_key_derivation", &self.webapp_key_derivation)
            .field("chats_cache_ttl", &self.chats_cache_ttl)
            .field("members_cache_ttl", &self.members_cache_ttl)
            .field("cache_max_entries", &self.cache_max_entries)
            .field("retry_max_attempts", &self.retry_max_attempts)
            .field("retry_initial_delay", &self.retry_initial_delay)
            .field("retry_max_delay", &self.retry_max_delay)
            .field("retry_backoff_multiplier", &self.retry_backoff_multiplier)
            .field("fetch_concurrency", &self.fetch_concurrency)
            .field("request_timeout", &self.request_timeout)
            .field("chat_registry_file", &self.chat_registry_file)
            .field("rate_limit_enabled", &self.rate_limit_enabled)
            .field("rate_limit_requests", &self.rate_limit_requests)
            .field("rate_limit_window", &self.rate_limit_window)
            .field("metrics_addr", &self.metrics_addr)
            .finish()
    }
}

impl Config {
    /// Read `.env` (if present, without overriding the environment), then the
    /// process environment.
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).and_then(non_empty);

        // Required
        let bot_token = var("BOT_TOKEN").ok_or_else(|| {
            Error::Config("BOT_TOKEN environment variable is required".to_string())
        })?;

        // WebApp secret: dedicated key preferred, bot token as fallback.
        let (webapp_secret, webapp_secret_is_token) = match var("WEBAPP_SECRET_KEY") {
            Some(secret) if secret == bot_token => {
                return Err(Error::Config(
                    "WEBAPP_SECRET_KEY must differ from BOT_TOKEN".to_string(),
                ))
            }
            Some(secret) => (secret, false),
            None => {
                tracing::warn!(
                    "WEBAPP_SECRET_KEY is not set, signing input falls back to the bot token"
                );
                (bot_token.clone(), true)
            }
        };
        let webapp_data_max_age =
            Duration::from_secs(parse_var(&var, "WEBAPP_DATA_MAX_AGE")?.unwrap_or(86_400));
        let webapp_key_derivation = match var("WEBAPP_KEY_DERIVATION") {
            Some(raw) => KeyDerivation::parse(&raw).ok_or_else(|| {
                Error::Config(format!(
                    "WEBAPP_KEY_DERIVATION must be `webappdata` or `direct`, got `{raw}`"
                ))
            })?,
            None => KeyDerivation::default(),
        };

        // Cache
        let chats_cache_ttl =
            Duration::from_secs(parse_var(&var, "CHATS_CACHE_TTL")?.unwrap_or(300));
        let members_cache_ttl =
            Duration::from_secs(parse_var(&var, "MEMBERS_CACHE_TTL")?.unwrap_or(3600));
        let cache_max_entries = parse_var(&var, "CACHE_MAX_ENTRIES")?.unwrap_or(1024);

        // Retries
        let retry_max_attempts = parse_var(&var, "RETRY_MAX_ATTEMPTS")?.unwrap_or(3);
        let retry_initial_delay =
            Duration::from_millis(parse_var(&var, "RETRY_INITIAL_DELAY_MS")?.unwrap_or(1000));
        let retry_max_delay =
            Duration::from_millis(parse_var(&var, "RETRY_MAX_DELAY_MS")?.unwrap_or(10_000));
        let retry_backoff_multiplier =
            parse_var(&var, "RETRY_BACKOFF_MULTIPLIER")?.unwrap_or(2.0);

        // Gateway
        let fetch_concurrency: usize = parse_var(&var, "FETCH_CONCURRENCY")?.unwrap_or(5);
        if fetch_concurrency == 0 {
            return Err(Error::Config(
                "FETCH_CONCURRENCY must be at least 1".to_string(),
            ));
        }
        let request_timeout =
            Duration::from_millis(parse_var(&var, "REQUEST_TIMEOUT_MS")?.unwrap_or(30_000));
        let chat_registry_file = PathBuf::from(
            var("CHAT_REGISTRY_FILE").unwrap_or_else(|| "/tmp/emb-chats.json".to_string()),
        );

        // Rate limiting
        let rate_limit_enabled = var("RATE_LIMIT_ENABLED").map_or(true, |v| parse_bool(&v));
        let rate_limit_requests = parse_var(&var, "RATE_LIMIT_REQUESTS")?.unwrap_or(30);
        let rate_limit_window =
            Duration::from_secs(parse_var(&var, "RATE_LIMIT_WINDOW")?.unwrap_or(60));

        // Observability
        let metrics_addr = parse_var(&var, "METRICS_ADDR")?;

        let cfg = Self {
            bot_token,
            webapp_secret,
            webapp_secret_is_token,
            webapp_data_max_age,
            webapp_key_derivation,
            chats_cache_ttl,
            members_cache_ttl,
            cache_max_entries,
            retry_max_attempts,
            retry_initial_delay,
            retry_max_delay,
            retry_backoff_multiplier,
            fetch_concurrency,
            request_timeout,
            chat_registry_file,
            rate_limit_enabled,
            rate_limit_requests,
            rate_limit_window,
            metrics_addr,
        };
        // Surface bad retry settings at startup rather than on first use.
        cfg.retry_policy()?;
        Ok(cfg)
    }

    pub fn retry_policy(&self) -> Result<RetryPolicy> {
        RetryPolicy::new(
            self.retry_max_attempts,
            self.retry_initial_delay,
            self.retry_max_delay,
            self.retry_backoff_multiplier,
            Transient::ALL,
        )
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            chats_ttl: self.chats_cache_ttl,
            members_ttl: self.members_cache_ttl,
            concurrency: self.fetch_concurrency,
        }
    }

    pub fn validator(&self) -> InitDataValidator {
        InitDataValidator::new(
            self.webapp_secret.as_bytes(),
            self.webapp_key_derivation,
            self.webapp_data_max_age,
        )
    }

    pub fn rate_limiter(&self) -> RateLimiter {
        RateLimiter::new(
            self.rate_limit_enabled,
            self.rate_limit_requests,
            self.rate_limit_window,
        )
    }
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn parse_var<T: FromStr>(var: impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>> {
    let Some(raw) = var(key) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<T>()
        .map(Some)
        .map_err(|_| Error::Config(format!("{key} has an invalid value: `{raw}`")))
}

fn parse_bool(s: &str) -> bool {
    matches!(
        s.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<Config> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_apply() {
        let cfg = load(&[("BOT_TOKEN", "123:abc"), ("WEBAPP_SECRET_KEY", "s3cret")]).unwrap();
        assert_eq!(cfg.webapp_data_max_age, Duration::from_secs(86_400));
        assert_eq!(cfg.webapp_key_derivation, KeyDerivation::WebAppData);
        assert!(!cfg.webapp_secret_is_token);
        assert_eq!(cfg.chats_cache_ttl, Duration::from_secs(300));
        assert_eq!(cfg.members_cache_ttl, Duration::from_secs(3600));
        assert_eq!(cfg.cache_max_entries, 1024);
        assert_eq!(cfg.retry_policy().unwrap(), RetryPolicy::default());
        assert_eq!(cfg.gateway_config(), GatewayConfig::default());
        assert_eq!(cfg.request_timeout, Duration::from_secs(30));
        assert_eq!(cfg.chat_registry_file, PathBuf::from("/tmp/emb-chats.json"));
        assert!(cfg.rate_limit_enabled);
        assert_eq!(cfg.rate_limit_requests, 30);
        assert_eq!(cfg.metrics_addr, None);
    }

    #[test]
    fn bot_token_is_required() {
        assert!(matches!(load(&[]), Err(Error::Config(_))));
        assert!(matches!(load(&[("BOT_TOKEN", "  ")]), Err(Error::Config(_))));
    }

    #[test]
    fn secret_must_differ_from_token() {
        let err = load(&[("BOT_TOKEN", "123:abc"), ("WEBAPP_SECRET_KEY", "123:abc")]);
        assert!(matches!(err, Err(Error::Config(_))));
    }

    #[test]
    fn secret_falls_back_to_token() {
        let cfg = load(&[("BOT_TOKEN", "123:abc")]).unwrap();
        assert!(cfg.webapp_secret_is_token);
        assert_eq!(cfg.webapp_secret, "123:abc");
    }

    #[test]
    fn invalid_values_are_rejected() {
        let base = [("BOT_TOKEN", "123:abc")];
        for bad in [
            ("RETRY_MAX_ATTEMPTS", "0"),
            ("RETRY_MAX_ATTEMPTS", "three"),
            ("RETRY_BACKOFF_MULTIPLIER", "0.5"),
            ("FETCH_CONCURRENCY", "0"),
            ("WEBAPP_KEY_DERIVATION", "sha1"),
            ("CHATS_CACHE_TTL", "-5"),
            ("METRICS_ADDR", "localhost"),
        ] {
            let mut pairs = base.to_vec();
            pairs.push(bad);
            assert!(matches!(load(&pairs), Err(Error::Config(_))), "{bad:?}");
        }
    }

    #[test]
    fn overrides_are_read() {
        let cfg = load(&[
            ("BOT_TOKEN", "123:abc"),
            ("WEBAPP_KEY_DERIVATION", "direct"),
            ("FETCH_CONCURRENCY", "2"),
            ("RATE_LIMIT_ENABLED", "off"),
            ("RETRY_MAX_DELAY_MS", "500"),
            ("RETRY_INITIAL_DELAY_MS", "100"),
            ("METRICS_ADDR", "127.0.0.1:9184"),
        ])
        .unwrap();
        assert_eq!(cfg.webapp_key_derivation, KeyDerivation::Direct);
        assert_eq!(cfg.gateway_config().concurrency, 2);
        assert!(!cfg.rate_limit_enabled);
        assert_eq!(cfg.retry_policy().unwrap().max_delay(), Duration::from_millis(500));
        assert_eq!(cfg.metrics_addr, Some(SocketAddr::from(([127, 0, 0, 1], 9184))));
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let cfg = load(&[("BOT_TOKEN", "123:abc"), ("WEBAPP_SECRET_KEY", "s3cret")]).unwrap();
        let dbg = format!("{cfg:?}");
        assert!(!dbg.contains("123:abc"));
        assert!(!dbg.contains("s3cret"));
    }
}
