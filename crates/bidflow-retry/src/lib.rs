//! Exponential-backoff retry for the external API families the pipeline calls.

use std::future::Future;
use std::sync::OnceLock;
use std::time::Duration;

use regex::RegexBuilder;
use thiserror::Error;
use tracing::{error, warn};

pub const CRATE_NAME: &str = "bidflow-retry";

/// Semantic classification of an API fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    RateLimit,
    Overloaded,
    ServerError,
    Timeout,
    Connection,
    Authentication,
    InvalidRequest,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Overloaded => "overloaded",
            ErrorKind::ServerError => "server_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Connection => "connection",
            ErrorKind::Authentication => "authentication",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::Unknown => "unknown",
        }
    }
}

/// Typed fault raised by API collaborators. Classification inspects this
/// before falling back to message matching.
#[derive(Debug, Error)]
pub enum ApiFault {
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<f64>,
    },
    #[error("overloaded: {0}")]
    Overloaded(String),
    #[error("server error: {0}")]
    Server(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("{0}")]
    Other(String),
}

impl ApiFault {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiFault::RateLimited { .. } => ErrorKind::RateLimit,
            ApiFault::Overloaded(_) => ErrorKind::Overloaded,
            ApiFault::Server(_) => ErrorKind::ServerError,
            ApiFault::Timeout(_) => ErrorKind::Timeout,
            ApiFault::Connection(_) => ErrorKind::Connection,
            ApiFault::Authentication(_) => ErrorKind::Authentication,
            ApiFault::InvalidRequest(_) => ErrorKind::InvalidRequest,
            ApiFault::Other(_) => ErrorKind::Unknown,
        }
    }
}

/// Classify a fault: typed inspection first, message patterns second.
pub fn classify(error: &anyhow::Error) -> ErrorKind {
    if let Some(fault) = error.downcast_ref::<ApiFault>() {
        return fault.kind();
    }

    let text = format!("{error:#}").to_ascii_lowercase();
    if text.contains("rate limit") || text.contains("429") {
        ErrorKind::RateLimit
    } else if text.contains("overloaded") || text.contains("529") {
        ErrorKind::Overloaded
    } else if ["500", "502", "503", "504", "server error"]
        .iter()
        .any(|p| text.contains(p))
    {
        ErrorKind::ServerError
    } else if text.contains("timeout") {
        ErrorKind::Timeout
    } else if ["connection", "network", "socket", "ssl"]
        .iter()
        .any(|p| text.contains(p))
    {
        ErrorKind::Connection
    } else if text.contains("auth") || text.contains("unauthorized") || text.contains("401") {
        ErrorKind::Authentication
    } else if text.contains("invalid") || text.contains("bad request") || text.contains("400") {
        ErrorKind::InvalidRequest
    } else {
        ErrorKind::Unknown
    }
}

fn retry_after_patterns() -> &'static [regex::Regex] {
    static PATTERNS: OnceLock<Vec<regex::Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"try again in (\d+(?:\.\d+)?)\s*(?:seconds|second|secs|sec|s)",
            r"retry.after.?\s*(\d+(?:\.\d+)?)",
            r"wait\s+(\d+(?:\.\d+)?)\s*(?:seconds|second|secs|sec|s)",
            r"cooldown.*?(\d+(?:\.\d+)?)\s*(?:seconds|second|secs|sec|s)",
        ]
        .iter()
        .map(|p| {
            RegexBuilder::new(p)
                .case_insensitive(true)
                .build()
                .expect("retry-after pattern compiles")
        })
        .collect()
    })
}

/// Extract an explicit retry-after hint (seconds) from a fault, if present:
/// the structured field on [`ApiFault::RateLimited`], else free-text patterns
/// like "try again in 30 seconds" or "retry-after: 60".
pub fn retry_after_hint(error: &anyhow::Error) -> Option<f64> {
    if let Some(ApiFault::RateLimited {
        retry_after: Some(secs),
        ..
    }) = error.downcast_ref::<ApiFault>()
    {
        return Some(*secs);
    }

    let text = format!("{error:#}");
    for pattern in retry_after_patterns() {
        if let Some(caps) = pattern.captures(&text) {
            if let Ok(secs) = caps[1].parse::<f64>() {
                return Some(secs);
            }
        }
    }
    None
}

/// Backoff and retry budget for one API family.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Uniform random jitter added on top, up to this fraction of the delay.
    pub jitter_factor: f64,
    pub respect_retry_after: bool,
    pub retryable: Vec<ErrorKind>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(120),
            jitter_factor: 0.25,
            respect_retry_after: true,
            retryable: vec![
                ErrorKind::RateLimit,
                ErrorKind::Overloaded,
                ErrorKind::ServerError,
                ErrorKind::Timeout,
                ErrorKind::Connection,
            ],
        }
    }
}

impl RetryConfig {
    /// Preset for the frequent, low-latency scoring API family.
    pub fn scoring_api() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(120),
            ..Self::default()
        }
    }

    /// Preset for the occasional, expensive document-generation API family.
    pub fn document_api() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_secs(3),
            max_delay: Duration::from_secs(180),
            ..Self::default()
        }
    }

    pub fn is_retryable(&self, kind: ErrorKind) -> bool {
        self.retryable.contains(&kind)
    }

    /// Exponential delay for a 0-based attempt index, capped, plus jitter.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt as u32).unwrap_or(u32::MAX);
        let capped = self.base_delay.saturating_mul(factor).min(self.max_delay);
        let jitter = capped.mul_f64(fastrand::f64() * self.jitter_factor);
        capped + jitter
    }

    /// Delay for a rate-limited fault. An upstream hint wins (plus a small
    /// jitter); otherwise a longer fixed floor applies.
    pub fn rate_limit_delay(&self, hint: Option<f64>) -> Duration {
        if let (Some(secs), true) = (hint, self.respect_retry_after) {
            return Duration::from_secs_f64(secs + 0.1 + fastrand::f64() * 0.9);
        }
        let floor = (self.base_delay * 5).max(Duration::from_secs(10));
        floor + Duration::from_secs_f64(fastrand::f64() * 5.0)
    }

    fn delay_for(&self, attempt: usize, kind: ErrorKind, error: &anyhow::Error) -> Duration {
        if kind == ErrorKind::RateLimit {
            self.rate_limit_delay(retry_after_hint(error))
        } else {
            self.delay_for_attempt(attempt)
        }
    }
}

/// Outcome of a retried operation, for callers that want to inspect retry
/// behavior without error handling. Never raised.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub outcome: Result<T, anyhow::Error>,
    pub error_kind: Option<ErrorKind>,
    pub attempts: usize,
    pub delays: Vec<Duration>,
}

impl<T> RetryOutcome<T> {
    pub fn succeeded(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn total_delay(&self) -> Duration {
        self.delays.iter().sum()
    }
}

async fn drive<T, F, Fut>(
    config: &RetryConfig,
    mut operation: F,
    mut observer: impl FnMut(usize, &anyhow::Error, Duration),
) -> RetryOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut delays = Vec::new();
    let mut last: Option<(anyhow::Error, ErrorKind)> = None;

    for attempt in 0..config.max_attempts {
        match operation().await {
            Ok(value) => {
                return RetryOutcome {
                    outcome: Ok(value),
                    error_kind: None,
                    attempts: attempt + 1,
                    delays,
                };
            }
            Err(err) => {
                let kind = classify(&err);

                if attempt == config.max_attempts - 1 {
                    error!(
                        kind = kind.as_str(),
                        attempts = config.max_attempts,
                        "call failed after exhausting retries: {err:#}"
                    );
                    last = Some((err, kind));
                    break;
                }

                if !config.is_retryable(kind) {
                    warn!(kind = kind.as_str(), "non-retryable fault, not retrying: {err:#}");
                    last = Some((err, kind));
                    break;
                }

                let delay = config.delay_for(attempt, kind, &err);
                warn!(
                    kind = kind.as_str(),
                    attempt = attempt + 1,
                    delay_secs = delay.as_secs_f64(),
                    "call failed, retrying: {err:#}"
                );
                observer(attempt, &err, delay);
                delays.push(delay);
                last = Some((err, kind));
                tokio::time::sleep(delay).await;
            }
        }
    }

    let attempts = delays.len() + 1;
    let (err, kind) = last.unwrap_or_else(|| {
        (anyhow::anyhow!("retry budget of zero attempts"), ErrorKind::Unknown)
    });
    RetryOutcome {
        outcome: Err(err),
        error_kind: Some(kind),
        attempts,
        delays,
    }
}

/// Execute an operation with retry, re-raising the last error once the
/// budget is exhausted (or immediately for non-retryable faults).
pub async fn execute<T, F, Fut>(config: &RetryConfig, operation: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    drive(config, operation, |_, _, _| {}).await.outcome
}

/// Like [`execute`], invoking `observer(attempt, error, delay)` before each
/// backoff sleep.
pub async fn execute_observed<T, F, Fut>(
    config: &RetryConfig,
    operation: F,
    observer: impl FnMut(usize, &anyhow::Error, Duration),
) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    drive(config, operation, observer).await.outcome
}

/// Like [`execute`], but never raises: returns the full [`RetryOutcome`].
pub async fn execute_collecting<T, F, Fut>(config: &RetryConfig, operation: F) -> RetryOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    drive(config, operation, |_, _, _| {}).await
}

/// Blocking driver over the same algorithm, for callers without a runtime.
pub fn execute_blocking<T>(
    config: &RetryConfig,
    mut operation: impl FnMut() -> anyhow::Result<T>,
) -> anyhow::Result<T> {
    let mut last: Option<anyhow::Error> = None;

    for attempt in 0..config.max_attempts {
        match operation() {
            Ok(value) => return Ok(value),
            Err(err) => {
                let kind = classify(&err);

                if attempt == config.max_attempts - 1 {
                    error!(
                        kind = kind.as_str(),
                        attempts = config.max_attempts,
                        "call failed after exhausting retries: {err:#}"
                    );
                    return Err(err);
                }
                if !config.is_retryable(kind) {
                    warn!(kind = kind.as_str(), "non-retryable fault, not retrying: {err:#}");
                    return Err(err);
                }

                let delay = config.delay_for(attempt, kind, &err);
                warn!(
                    kind = kind.as_str(),
                    attempt = attempt + 1,
                    delay_secs = delay.as_secs_f64(),
                    "call failed, retrying: {err:#}"
                );
                last = Some(err);
                std::thread::sleep(delay);
            }
        }
    }

    Err(last.unwrap_or_else(|| anyhow::anyhow!("retry budget of zero attempts")))
}

/// Test helper: records each retry the observer sees.
#[derive(Debug, Default)]
pub struct RetryRecorder {
    pub attempts: Vec<usize>,
    pub delays: Vec<Duration>,
    pub kinds: Vec<ErrorKind>,
}

impl RetryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, attempt: usize, error: &anyhow::Error, delay: Duration) {
        self.attempts.push(attempt);
        self.delays.push(delay);
        self.kinds.push(classify(error));
    }

    pub fn total_retries(&self) -> usize {
        self.attempts.len()
    }

    pub fn had_rate_limit(&self) -> bool {
        self.kinds.contains(&ErrorKind::RateLimit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn no_jitter(max_attempts: usize, base_ms: u64, max_ms: u64) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(max_ms),
            jitter_factor: 0.0,
            ..RetryConfig::default()
        }
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let config = no_jitter(5, 100, 350);
        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(config.delay_for_attempt(6), Duration::from_millis(350));
    }

    #[test]
    fn backoff_is_monotonic_until_cap() {
        let config = no_jitter(8, 50, 100_000);
        for attempt in 0..6 {
            assert!(config.delay_for_attempt(attempt + 1) > config.delay_for_attempt(attempt));
        }
    }

    #[test]
    fn jitter_stays_within_fraction() {
        let config = RetryConfig {
            jitter_factor: 0.25,
            ..no_jitter(5, 1000, 120_000)
        };
        for _ in 0..50 {
            let delay = config.delay_for_attempt(0);
            assert!(delay >= Duration::from_millis(1000));
            assert!(delay <= Duration::from_millis(1250));
        }
    }

    #[test]
    fn rate_limit_floor_without_hint() {
        let config = no_jitter(5, 2000, 120_000);
        for _ in 0..20 {
            let delay = config.rate_limit_delay(None);
            assert!(delay >= Duration::from_secs(10));
            assert!(delay <= Duration::from_secs(15));
        }
        // Large base pushes the floor past the 10s minimum.
        let slow = no_jitter(5, 4000, 120_000);
        assert!(slow.rate_limit_delay(None) >= Duration::from_secs(20));
    }

    #[test]
    fn rate_limit_hint_is_respected() {
        let config = no_jitter(5, 2000, 120_000);
        for _ in 0..20 {
            let delay = config.rate_limit_delay(Some(30.0));
            assert!(delay >= Duration::from_secs(30));
            assert!(delay <= Duration::from_secs_f64(31.1));
        }
    }

    #[test]
    fn classification_prefers_typed_fault() {
        let err = anyhow::Error::new(ApiFault::Timeout("slow upstream".into()));
        assert_eq!(classify(&err), ErrorKind::Timeout);
    }

    #[test]
    fn classification_falls_back_to_message_patterns() {
        let cases = [
            ("Rate limit exceeded, try later", ErrorKind::RateLimit),
            ("got HTTP 429 from api", ErrorKind::RateLimit),
            ("system Overloaded", ErrorKind::Overloaded),
            ("upstream returned 503", ErrorKind::ServerError),
            ("read timeout after 30s", ErrorKind::Timeout),
            ("ssl handshake broke", ErrorKind::Connection),
            ("401 unauthorized", ErrorKind::Authentication),
            ("invalid model name", ErrorKind::InvalidRequest),
            ("what even is this", ErrorKind::Unknown),
        ];
        for (message, expected) in cases {
            assert_eq!(classify(&anyhow::anyhow!("{message}")), expected, "{message}");
        }
    }

    #[test]
    fn retry_after_hint_from_structured_field_and_text() {
        let structured = anyhow::Error::new(ApiFault::RateLimited {
            message: "slow down".into(),
            retry_after: Some(42.0),
        });
        assert_eq!(retry_after_hint(&structured), Some(42.0));

        let texts = [
            ("please try again in 30 seconds", 30.0),
            ("Retry-After: 60", 60.0),
            ("wait 15 seconds before the next call", 15.0),
            ("cooldown period of 7.5 seconds", 7.5),
        ];
        for (message, expected) in texts {
            assert_eq!(retry_after_hint(&anyhow::anyhow!("{message}")), Some(expected), "{message}");
        }
        assert_eq!(retry_after_hint(&anyhow::anyhow!("no hint here")), None);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_invokes_exactly_max_attempts_and_reraises() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let config = no_jitter(3, 5, 50);

        let result: anyhow::Result<()> = execute(&config, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(anyhow::Error::new(ApiFault::Server("boom".into())))
            }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let err = result.expect_err("must fail");
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_fault_short_circuits() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let config = no_jitter(5, 5, 50);

        let result: anyhow::Result<()> = execute(&config, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(anyhow::Error::new(ApiFault::Authentication("bad key".into())))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn eventual_success_returns_value() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let config = no_jitter(5, 5, 50);

        let result = execute(&config, move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(anyhow::Error::new(ApiFault::Timeout("transient".into())))
                } else {
                    Ok(99)
                }
            }
        })
        .await;

        assert_eq!(result.expect("succeeds on third attempt"), 99);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn collecting_never_raises_and_records_delays() {
        let config = no_jitter(4, 5, 50);

        let outcome: RetryOutcome<()> = execute_collecting(&config, || async {
            Err(anyhow::Error::new(ApiFault::Connection("reset".into())))
        })
        .await;

        assert!(!outcome.succeeded());
        assert_eq!(outcome.attempts, 4);
        assert_eq!(outcome.delays.len(), 3);
        assert_eq!(outcome.error_kind, Some(ErrorKind::Connection));
        assert_eq!(
            outcome.delays,
            vec![
                Duration::from_millis(5),
                Duration::from_millis(10),
                Duration::from_millis(20),
            ]
        );
        assert_eq!(outcome.total_delay(), Duration::from_millis(35));
    }

    #[tokio::test(start_paused = true)]
    async fn observer_sees_each_retry() {
        let mut recorder = RetryRecorder::new();
        let config = no_jitter(3, 5, 50);

        let result: anyhow::Result<()> = execute_observed(
            &config,
            || async { Err(anyhow::Error::new(ApiFault::Overloaded("529".into()))) },
            |attempt, error, delay| recorder.record(attempt, error, delay),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(recorder.total_retries(), 2);
        assert_eq!(recorder.attempts, vec![0, 1]);
        assert_eq!(recorder.kinds, vec![ErrorKind::Overloaded, ErrorKind::Overloaded]);
        assert!(!recorder.had_rate_limit());
    }

    #[test]
    fn blocking_driver_matches_async_semantics() {
        let config = no_jitter(3, 1, 4);

        let mut calls = 0;
        let result = execute_blocking(&config, || {
            calls += 1;
            if calls < 3 {
                Err(anyhow::Error::new(ApiFault::Server("503".into())))
            } else {
                Ok("done")
            }
        });
        assert_eq!(result.expect("recovers"), "done");
        assert_eq!(calls, 3);

        let mut calls = 0;
        let result: anyhow::Result<()> = execute_blocking(&config, || {
            calls += 1;
            Err(anyhow::Error::new(ApiFault::InvalidRequest("400".into())))
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn presets_differ_by_family() {
        let scoring = RetryConfig::scoring_api();
        let document = RetryConfig::document_api();
        assert!(scoring.max_attempts > document.max_attempts);
        assert!(scoring.base_delay < document.base_delay);
        assert!(document.max_delay > scoring.max_delay);
    }
}
