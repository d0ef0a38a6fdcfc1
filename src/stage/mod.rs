use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};

/// Failure taxonomy shared by every pipeline stage.
///
/// Only `TransientService` consumes retry budget; `FatalInput` and `Cancelled`
/// short-circuit remaining attempts. `SystemBusy` is produced at admission,
/// never by a running stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    FatalInput,
    TransientService,
    Cancelled,
    SystemBusy,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::FatalInput => "fatal-input",
            FailureKind::TransientService => "transient-service",
            FailureKind::Cancelled => "cancelled",
            FailureKind::SystemBusy => "system-busy",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureKind::TransientService | FailureKind::SystemBusy)
    }
}

/// A classified stage failure.
///
/// `message` is safe to show to end users; `detail` is operator-only and goes
/// to the logs, never to the polling surface.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct StageError {
    pub kind: FailureKind,
    pub message: String,
    pub detail: String,
}

impl StageError {
    pub fn fatal(message: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::FatalInput,
            message: message.into(),
            detail: detail.into(),
        }
    }

    pub fn transient(message: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::TransientService,
            message: message.into(),
            detail: detail.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            kind: FailureKind::Cancelled,
            message: "The job was cancelled".to_string(),
            detail: "cancel flag observed at stage boundary".to_string(),
        }
    }

    fn timed_out(stage: &str, limit: Duration) -> Self {
        Self {
            kind: FailureKind::TransientService,
            message: "The operation timed out, try again later".to_string(),
            detail: format!("stage '{}' exceeded its {}s attempt timeout", stage, limit.as_secs()),
        }
    }
}

/// Outcome of a single stage attempt, as recorded in a job's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptOutcome {
    Succeeded,
    Failed(FailureKind),
}

/// One entry of a job's append-only stage history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageAttempt {
    /// Stage name, e.g. "transcribe" or "generate-blog"
    pub stage: String,

    /// 1-based attempt number within the stage
    pub attempt: u32,

    /// How the attempt ended
    pub outcome: AttemptOutcome,

    /// Wall-clock duration of the attempt in milliseconds
    pub duration_ms: u64,
}

/// Per-call execution policy for one stage.
#[derive(Debug, Clone, Copy)]
pub struct StagePolicy {
    /// Per-attempt timeout
    pub attempt_timeout: Duration,

    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
}

/// Runs one pipeline stage under a uniform timeout + retry + backoff policy.
///
/// This is the only place retry policy lives; every collaborator call goes
/// through it. A shared per-stage failure window acts as a circuit breaker:
/// once tripped, attempts fail immediately as `TransientService` without
/// invoking the collaborator until the window drains.
pub struct StageExecutor {
    base_delay: Duration,
    max_delay: Duration,
    breaker_threshold: u32,
    breaker_window: Duration,
    failures: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl StageExecutor {
    pub fn new(
        base_delay: Duration,
        max_delay: Duration,
        breaker_threshold: u32,
        breaker_window: Duration,
    ) -> Self {
        Self {
            base_delay,
            max_delay,
            breaker_threshold,
            breaker_window,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Execute `work` under the given policy.
    ///
    /// The cancel flag is observed before every attempt. Every attempt is
    /// reported through `record` before this function returns. On exhausted
    /// retries the last error is returned; failures are never swallowed.
    pub async fn execute<T, F, Fut, R>(
        &self,
        stage: &str,
        policy: StagePolicy,
        cancel: &AtomicBool,
        mut record: R,
        mut work: F,
    ) -> Result<T, StageError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, StageError>>,
        R: FnMut(StageAttempt),
    {
        let max_attempts = policy.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            if cancel.load(Ordering::SeqCst) {
                let err = StageError::cancelled();
                record(StageAttempt {
                    stage: stage.to_string(),
                    attempt,
                    outcome: AttemptOutcome::Failed(err.kind),
                    duration_ms: 0,
                });
                return Err(err);
            }

            if self.breaker_open(stage) {
                tracing::warn!(stage, "circuit breaker open, skipping collaborator call");
                let err = StageError::transient(
                    "Service temporarily unavailable, try again later",
                    format!("circuit breaker open for stage '{}'", stage),
                );
                record(StageAttempt {
                    stage: stage.to_string(),
                    attempt,
                    outcome: AttemptOutcome::Failed(err.kind),
                    duration_ms: 0,
                });
                if attempt == max_attempts {
                    return Err(err);
                }
                sleep(self.backoff_delay(attempt)).await;
                continue;
            }

            let started = Instant::now();
            let outcome = timeout(policy.attempt_timeout, work(attempt)).await;
            let elapsed = started.elapsed();

            let err = match outcome {
                Ok(Ok(value)) => {
                    record(StageAttempt {
                        stage: stage.to_string(),
                        attempt,
                        outcome: AttemptOutcome::Succeeded,
                        duration_ms: elapsed.as_millis() as u64,
                    });
                    tracing::debug!(stage, attempt, elapsed_ms = elapsed.as_millis() as u64, "stage attempt succeeded");
                    return Ok(value);
                }
                Ok(Err(err)) => err,
                Err(_) => StageError::timed_out(stage, policy.attempt_timeout),
            };

            record(StageAttempt {
                stage: stage.to_string(),
                attempt,
                outcome: AttemptOutcome::Failed(err.kind),
                duration_ms: elapsed.as_millis() as u64,
            });
            tracing::warn!(
                stage,
                attempt,
                kind = err.kind.as_str(),
                detail = %err.detail,
                "stage attempt failed"
            );

            if !matches!(err.kind, FailureKind::TransientService) {
                return Err(err);
            }
            self.record_failure(stage);

            if attempt == max_attempts {
                return Err(err);
            }
            sleep(self.backoff_delay(attempt)).await;
        }

        unreachable!("retry loop always returns");
    }

    /// Exponential backoff: base * 2^(attempt-1), capped at max_delay.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    fn breaker_open(&self, stage: &str) -> bool {
        let mut failures = self.failures.lock().unwrap();
        let Some(window) = failures.get_mut(stage) else {
            return false;
        };
        if let Some(cutoff) = Instant::now().checked_sub(self.breaker_window) {
            while window.front().is_some_and(|t| *t < cutoff) {
                window.pop_front();
            }
        }
        window.len() as u32 >= self.breaker_threshold
    }

    fn record_failure(&self, stage: &str) {
        let mut failures = self.failures.lock().unwrap();
        failures.entry(stage.to_string()).or_default().push_back(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    fn executor() -> StageExecutor {
        StageExecutor::new(
            Duration::from_millis(1),
            Duration::from_millis(5),
            100,
            Duration::from_secs(30),
        )
    }

    fn policy(max_attempts: u32) -> StagePolicy {
        StagePolicy {
            attempt_timeout: Duration::from_secs(5),
            max_attempts,
        }
    }

    #[tokio::test]
    async fn succeeds_on_third_attempt_after_transient_failures() {
        let exec = executor();
        let cancel = AtomicBool::new(false);
        let calls = Arc::new(AtomicU32::new(0));
        let mut attempts = Vec::new();

        let calls_in = calls.clone();
        let result = exec
            .execute("transcribe", policy(3), &cancel, |a| attempts.push(a), move |_| {
                let calls = calls_in.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(StageError::transient("unavailable", "503"))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(attempts.len(), 3);
        assert_eq!(attempts[0].outcome, AttemptOutcome::Failed(FailureKind::TransientService));
        assert_eq!(attempts[2].outcome, AttemptOutcome::Succeeded);
        assert_eq!(attempts[2].attempt, 3);
    }

    #[tokio::test]
    async fn fatal_failure_never_retries() {
        let exec = executor();
        let cancel = AtomicBool::new(false);
        let calls = Arc::new(AtomicU32::new(0));
        let mut attempts = Vec::new();

        let calls_in = calls.clone();
        let result: Result<u32, _> = exec
            .execute("validate", policy(3), &cancel, |a| attempts.push(a), move |_| {
                let calls = calls_in.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(StageError::fatal("bad url", "no video id"))
                }
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.kind, FailureKind::FatalInput);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(attempts.len(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_return_last_error() {
        let exec = executor();
        let cancel = AtomicBool::new(false);
        let mut attempts = Vec::new();

        let result: Result<u32, _> = exec
            .execute("generate-blog", policy(3), &cancel, |a| attempts.push(a), |n| async move {
                Err(StageError::transient("unavailable", format!("attempt {}", n)))
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.kind, FailureKind::TransientService);
        assert_eq!(err.detail, "attempt 3");
        assert_eq!(attempts.len(), 3);
        assert!(attempts.iter().all(|a| matches!(a.outcome, AttemptOutcome::Failed(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_timeout_is_retryable() {
        let exec = executor();
        let cancel = AtomicBool::new(false);
        let mut attempts = Vec::new();
        let short = StagePolicy {
            attempt_timeout: Duration::from_millis(10),
            max_attempts: 2,
        };

        let result: Result<u32, _> = exec
            .execute("extract", short, &cancel, |a| attempts.push(a), |_| async {
                sleep(Duration::from_secs(3600)).await;
                Ok(1)
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.kind, FailureKind::TransientService);
        assert_eq!(attempts.len(), 2);
    }

    #[tokio::test]
    async fn cancel_flag_short_circuits_before_first_attempt() {
        let exec = executor();
        let cancel = AtomicBool::new(true);
        let calls = Arc::new(AtomicU32::new(0));
        let mut attempts = Vec::new();

        let calls_in = calls.clone();
        let result: Result<u32, _> = exec
            .execute("transcribe", policy(3), &cancel, |a| attempts.push(a), move |_| {
                let calls = calls_in.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(1)
                }
            })
            .await;

        assert_eq!(result.unwrap_err().kind, FailureKind::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(attempts.len(), 1);
    }

    #[tokio::test]
    async fn breaker_trips_after_threshold_and_skips_collaborator() {
        let exec = StageExecutor::new(
            Duration::from_millis(1),
            Duration::from_millis(1),
            2,
            Duration::from_secs(30),
        );
        let cancel = AtomicBool::new(false);

        // Two transient failures trip the breaker for this stage.
        let _: Result<u32, _> = exec
            .execute("generate-blog", policy(2), &cancel, |_| {}, |_| async {
                Err(StageError::transient("unavailable", "503"))
            })
            .await;

        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();
        let result: Result<u32, _> = exec
            .execute("generate-blog", policy(1), &cancel, |_| {}, move |_| {
                let calls = calls_in.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(1)
                }
            })
            .await;

        assert_eq!(result.unwrap_err().kind, FailureKind::TransientService);
        assert_eq!(calls.load(Ordering::SeqCst), 0, "breaker must skip the collaborator");
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let exec = StageExecutor::new(
            Duration::from_millis(100),
            Duration::from_millis(350),
            100,
            Duration::from_secs(30),
        );
        assert_eq!(exec.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(exec.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(exec.backoff_delay(3), Duration::from_millis(350));
        assert_eq!(exec.backoff_delay(10), Duration::from_millis(350));
    }
}
