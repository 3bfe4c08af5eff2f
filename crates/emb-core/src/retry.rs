//! Bounded retries for Bot API calls.
//!
//! [`execute`] drives one operation under a [`RetryPolicy`]:
//! - `Throttled(w)` waits `min(w, max_delay)` and does not advance the
//!   exponential schedule;
//! - transient failures the policy opts into wait
//!   `min(initial_delay * multiplier^n, max_delay)`;
//! - everything else is returned immediately.
//!
//! Every invocation counts toward `max_attempts`.

use std::{future::Future, time::Duration};

use crate::{
    errors::Error,
    messaging::error::{ApiError, ErrorClass, Transient},
    telemetry::{self, ApiOutcome},
    Result,
};

#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
    backoff_multiplier: f64,
    retryable: Vec<Transient>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            retryable: Transient::ALL.to_vec(),
        }
    }
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        initial_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
        retryable: impl IntoIterator<Item = Transient>,
    ) -> Result<Self> {
        if max_attempts == 0 {
            return Err(Error::Config(
                "retry policy needs at least one attempt".to_string(),
            ));
        }
        if !backoff_multiplier.is_finite() || backoff_multiplier < 1.0 {
            return Err(Error::Config(format!(
                "retry backoff multiplier must be >= 1.0, got {backoff_multiplier}"
            )));
        }
        if max_delay < initial_delay {
            return Err(Error::Config(format!(
                "retry max delay ({max_delay:?}) is below the initial delay ({initial_delay:?})"
            )));
        }

        let mut kinds: Vec<Transient> = Vec::new();
        for kind in retryable {
            if !kinds.contains(&kind) {
                kinds.push(kind);
            }
        }

        Ok(Self {
            max_attempts,
            initial_delay,
            max_delay,
            backoff_multiplier,
            retryable: kinds,
        })
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn retries(&self, kind: Transient) -> bool {
        self.retryable.contains(&kind)
    }

    /// Backoff before the retry that follows the `n`-th transient failure (0-based).
    pub fn backoff(&self, n: u32) -> Duration {
        let exp = i32::try_from(n).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exp);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }

    /// Wait requested by a throttle signal, capped by `max_delay`.
    pub fn throttle_wait(&self, requested: Duration) -> Duration {
        requested.min(self.max_delay)
    }
}

/// Run `operation` under `policy`, returning the first success or the last error.
pub async fn execute<T, F, Fut>(
    policy: &RetryPolicy,
    op_name: &str,
    mut operation: F,
) -> std::result::Result<T, ApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, ApiError>>,
{
    let started = std::time::Instant::now();
    let mut attempt: u32 = 0;
    let mut transient_failures: u32 = 0;

    loop {
        attempt += 1;
        let err = match operation().await {
            Ok(value) => {
                let outcome = if attempt > 1 {
                    tracing::debug!(op = op_name, attempt, "succeeded after retry");
                    ApiOutcome::Retried
                } else {
                    ApiOutcome::Ok
                };
                telemetry::record_api_call(op_name, outcome, started.elapsed());
                return Ok(value);
            }
            Err(err) => err,
        };

        let delay = match err.class() {
            ErrorClass::Throttled(wait) => policy.throttle_wait(wait),
            ErrorClass::Retryable(kind) if policy.retries(kind) => {
                let d = policy.backoff(transient_failures);
                transient_failures += 1;
                d
            }
            ErrorClass::Retryable(_) | ErrorClass::Fatal => {
                tracing::debug!(op = op_name, attempt, error = %err, "not retrying");
                telemetry::record_api_call(op_name, ApiOutcome::Failed, started.elapsed());
                return Err(err);
            }
        };

        if attempt >= policy.max_attempts {
            telemetry::record_api_call(op_name, ApiOutcome::Exhausted, started.elapsed());
            tracing::warn!(
                op = op_name,
                attempts = attempt,
                error = %err,
                "retries exhausted"
            );
            return Err(err);
        }

        tracing::warn!(
            op = op_name,
            attempt,
            max_attempts = policy.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "retryable error, backing off"
        );
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_attempts,
            Duration::from_secs(1),
            Duration::from_secs(10),
            2.0,
            Transient::ALL,
        )
        .unwrap()
    }

    /// Fails with the scripted errors in order, then succeeds; records call times.
    struct Script {
        errors: Mutex<Vec<ApiError>>,
        calls: Mutex<Vec<Instant>>,
    }

    impl Script {
        fn new(mut errors: Vec<ApiError>) -> Arc<Self> {
            errors.reverse();
            Arc::new(Self {
                errors: Mutex::new(errors),
                calls: Mutex::new(Vec::new()),
            })
        }

        async fn call(&self) -> std::result::Result<&'static str, ApiError> {
            self.calls.lock().unwrap().push(Instant::now());
            match self.errors.lock().unwrap().pop() {
                Some(e) => Err(e),
                None => Ok("ok"),
            }
        }

        fn gaps(&self) -> Vec<Duration> {
            let calls = self.calls.lock().unwrap();
            calls.windows(2).map(|w| w[1] - w[0]).collect()
        }

        fn count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    fn assert_gaps(actual: &[Duration], expected_secs: &[u64]) {
        assert_eq!(actual.len(), expected_secs.len(), "gaps: {actual:?}");
        for (gap, secs) in actual.iter().zip(expected_secs) {
            let want = Duration::from_secs(*secs);
            let diff = if *gap > want { *gap - want } else { want - *gap };
            assert!(diff <= Duration::from_millis(5), "gap {gap:?}, expected {want:?}");
        }
    }

    #[test]
    fn construction_rejects_bad_values() {
        let d = Duration::from_secs(1);
        assert!(RetryPolicy::new(0, d, d, 2.0, Transient::ALL).is_err());
        assert!(RetryPolicy::new(3, d, d, 0.5, Transient::ALL).is_err());
        assert!(RetryPolicy::new(3, d, d, f64::NAN, Transient::ALL).is_err());
        assert!(RetryPolicy::new(3, Duration::from_secs(5), d, 2.0, Transient::ALL).is_err());
        assert!(RetryPolicy::new(1, d, d, 1.0, []).is_ok());
    }

    #[test]
    fn backoff_grows_and_caps() {
        let p = policy(10);
        assert_eq!(p.backoff(0), Duration::from_secs(1));
        assert_eq!(p.backoff(1), Duration::from_secs(2));
        assert_eq!(p.backoff(3), Duration::from_secs(8));
        assert_eq!(p.backoff(4), Duration::from_secs(10));
        assert_eq!(p.backoff(u32::MAX), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_then_success() {
        let script = Script::new(vec![
            ApiError::Timeout,
            ApiError::Network("reset".into()),
            ApiError::Conflict("busy".into()),
            ApiError::Timeout,
        ]);
        let s = script.clone();
        let out = execute(&policy(5), "get_chat", || {
            let s = s.clone();
            async move { s.call().await }
        })
        .await;

        assert_eq!(out, Ok("ok"));
        assert_eq!(script.count(), 5);
        let gaps = script.gaps();
        assert_gaps(&gaps, &[1, 2, 4, 8]);
        assert!(gaps.windows(2).all(|w| w[0] <= w[1]));
        assert!(gaps.iter().all(|g| *g <= Duration::from_millis(10_005)));
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_error_is_not_retried() {
        let script = Script::new(vec![ApiError::Forbidden("kicked".into())]);
        let s = script.clone();
        let out = execute(&policy(5), "get_chat", || {
            let s = s.clone();
            async move { s.call().await }
        })
        .await;

        assert_eq!(out, Err(ApiError::Forbidden("kicked".into())));
        assert_eq!(script.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_wait_ignores_backoff_schedule() {
        let script = Script::new(vec![
            ApiError::Timeout,
            ApiError::Timeout,
            ApiError::Throttled {
                retry_after: Duration::from_secs(5),
            },
            ApiError::Timeout,
        ]);
        let s = script.clone();
        let out = execute(&policy(5), "get_chat", || {
            let s = s.clone();
            async move { s.call().await }
        })
        .await;

        assert_eq!(out, Ok("ok"));
        // 1s, 2s backoff; 5s as instructed; backoff resumes at 4s.
        assert_gaps(&script.gaps(), &[1, 2, 5, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_wait_is_capped_by_max_delay() {
        let script = Script::new(vec![ApiError::Throttled {
            retry_after: Duration::from_secs(60),
        }]);
        let s = script.clone();
        let out = execute(&policy(2), "get_chat", || {
            let s = s.clone();
            async move { s.call().await }
        })
        .await;

        assert_eq!(out, Ok("ok"));
        assert_gaps(&script.gaps(), &[10]);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_returns_last_error() {
        let script = Script::new(vec![
            ApiError::Timeout,
            ApiError::Timeout,
            ApiError::Network("down".into()),
        ]);
        let s = script.clone();
        let out = execute(&policy(3), "get_chat", || {
            let s = s.clone();
            async move { s.call().await }
        })
        .await;

        assert_eq!(out, Err(ApiError::Network("down".into())));
        assert_eq!(script.count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_retryable_set_only_retries_throttles() {
        let p = RetryPolicy::new(
            4,
            Duration::from_secs(1),
            Duration::from_secs(10),
            2.0,
            [],
        )
        .unwrap();

        let script = Script::new(vec![
            ApiError::Throttled {
                retry_after: Duration::from_secs(1),
            },
            ApiError::Timeout,
        ]);
        let s = script.clone();
        let out = execute(&p, "get_chat", || {
            let s = s.clone();
            async move { s.call().await }
        })
        .await;

        assert_eq!(out, Err(ApiError::Timeout));
        assert_eq!(script.count(), 2);
    }

    #[test]
    fn outcomes_are_recorded_per_operation() {
        use crate::telemetry::capture::CaptureRecorder;

        let rec = CaptureRecorder::default();
        metrics::with_local_recorder(&rec, || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .start_paused(true)
                .build()
                .unwrap();
            rt.block_on(async {
                for errors in [
                    vec![ApiError::Timeout],
                    vec![ApiError::Forbidden("kicked".into())],
                    vec![ApiError::Timeout, ApiError::Timeout],
                ] {
                    let script = Script::new(errors);
                    let _ = execute(&policy(2), "get_chat", || {
                        let s = script.clone();
                        async move { s.call().await }
                    })
                    .await;
                }
            });
        });

        let count = |status: &str| {
            rec.counter(&format!(
                "emb_telegram_api_requests_total{{method=get_chat,status={status}}}"
            ))
        };
        assert_eq!(count("ok_after_retry"), 1);
        assert_eq!(count("error"), 1);
        assert_eq!(count("exhausted"), 1);
        assert_eq!(count("ok"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn single_attempt_policy_calls_once() {
        let script = Script::new(vec![ApiError::Timeout]);
        let s = script.clone();
        let out = execute(&policy(1), "get_chat", || {
            let s = s.clone();
            async move { s.call().await }
        })
        .await;

        assert_eq!(out, Err(ApiError::Timeout));
        assert_eq!(script.count(), 1);
    }
}
