//! Metrics emitted by the gateway.
//!
//! Recording goes through the `metrics` facade; without an installed recorder
//! (the binary installs a Prometheus exporter when `METRICS_ADDR` is set)
//! every call is a no-op.
//!
//! # Metrics
//! - `emb_telegram_api_requests_total` (counter): Bot API operations by method and outcome
//! - `emb_telegram_api_request_duration_seconds` (histogram): per method, retries included
//! - `emb_cache_operations_total` (counter): by operation and status (hit, miss, expired, ...)
//! - `emb_cache_size` (gauge): live and last-known-good entries
//! - `emb_degraded_responses_total` (counter): stale listings served during an outage
//! - `emb_requests_total` (counter): WebApp requests by endpoint and status
//! - `emb_request_duration_seconds` (histogram): WebApp request latency by endpoint
//! - `emb_errors_total` (counter): WebApp request failures by error kind and endpoint

use std::time::Duration;

use crate::errors::Error;

pub const API_REQUESTS: &str = "emb_telegram_api_requests_total";
pub const API_DURATION: &str = "emb_telegram_api_request_duration_seconds";
pub const CACHE_OPERATIONS: &str = "emb_cache_operations_total";
pub const CACHE_SIZE: &str = "emb_cache_size";
pub const DEGRADED_RESPONSES: &str = "emb_degraded_responses_total";
pub const REQUESTS: &str = "emb_requests_total";
pub const REQUEST_DURATION: &str = "emb_request_duration_seconds";
pub const ERRORS: &str = "emb_errors_total";

/// Register descriptions with the installed recorder.
pub fn describe() {
    metrics::describe_counter!(API_REQUESTS, "Bot API operations by method and outcome");
    metrics::describe_histogram!(
        API_DURATION,
        metrics::Unit::Seconds,
        "Bot API operation duration, retries included"
    );
    metrics::describe_counter!(CACHE_OPERATIONS, "Response cache operations");
    metrics::describe_gauge!(CACHE_SIZE, "Response cache entries by slot");
    metrics::describe_counter!(DEGRADED_RESPONSES, "Stale listings served during an outage");
    metrics::describe_counter!(REQUESTS, "WebApp requests by endpoint and status");
    metrics::describe_histogram!(
        REQUEST_DURATION,
        metrics::Unit::Seconds,
        "WebApp request duration"
    );
    metrics::describe_counter!(ERRORS, "WebApp request failures by kind");
}

/// How a retried Bot API operation ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApiOutcome {
    Ok,
    Retried,
    Failed,
    Exhausted,
}

impl ApiOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            ApiOutcome::Ok => "ok",
            ApiOutcome::Retried => "ok_after_retry",
            ApiOutcome::Failed => "error",
            ApiOutcome::Exhausted => "exhausted",
        }
    }
}

pub fn record_api_call(method: &str, outcome: ApiOutcome, elapsed: Duration) {
    metrics::counter!(
        API_REQUESTS,
        "method" => method.to_string(),
        "status" => outcome.as_str()
    )
    .increment(1);
    metrics::histogram!(API_DURATION, "method" => method.to_string())
        .record(elapsed.as_secs_f64());
}

pub fn record_cache(operation: &'static str, status: &'static str) {
    metrics::counter!(CACHE_OPERATIONS, "operation" => operation, "status" => status)
        .increment(1);
}

pub fn record_cache_size(live: usize, last_good: usize) {
    metrics::gauge!(CACHE_SIZE, "slot" => "live").set(live as f64);
    metrics::gauge!(CACHE_SIZE, "slot" => "last_good").set(last_good as f64);
}

pub fn record_degraded(listing: &'static str) {
    metrics::counter!(DEGRADED_RESPONSES, "listing" => listing).increment(1);
}

pub fn record_request(endpoint: &'static str, result: Result<(), &Error>, elapsed: Duration) {
    let status = match result {
        Ok(()) => "ok",
        Err(err) => {
            metrics::counter!(ERRORS, "error_type" => error_kind(err), "endpoint" => endpoint)
                .increment(1);
            "error"
        }
    };
    metrics::counter!(REQUESTS, "endpoint" => endpoint, "status" => status).increment(1);
    metrics::histogram!(REQUEST_DURATION, "endpoint" => endpoint).record(elapsed.as_secs_f64());
}

pub fn error_kind(err: &Error) -> &'static str {
    match err {
        Error::Config(_) => "config",
        Error::Auth(_) => "auth",
        Error::Api(_) => "telegram",
        Error::Forbidden(_) => "forbidden",
        Error::Unavailable(_) => "unavailable",
        Error::Timeout(_) => "timeout",
        Error::RateLimited { .. } => "rate_limited",
        Error::Io(_) | Error::Json(_) | Error::External(_) => "internal",
    }
}
