//! Retry/backoff controller shared by the OCR and extraction stages.
//!
//! ## Retry strategy
//!
//! Only throttling ([`StageError::RateLimited`]) and transient failures
//! ([`StageError::Transient`]) are retried with exponential backoff
//! (`base_delay * factor^(n-1)`, capped at `max_delay`, plus 0–50 % jitter so
//! concurrent workers do not retry in lockstep). A
//! [`StageError::MalformedResponse`] gets exactly one more try and is then
//! surfaced unchanged. Everything else returns on the first failure.
//!
//! ## Cool-down gate
//!
//! A 429 from one document means the whole credential is throttled. Every
//! call against a provider goes through that provider's [`CooldownGate`];
//! when any call is rate-limited the gate is closed until
//! `now + max(retry_after, rate_limit_cooldown)` and every other caller,
//! in flight or not yet started, waits for it before its next attempt. The
//! gate also bounds how many calls run against the provider at once.
//!
//! Gates are plain values owned by the pipeline and passed by reference, so
//! two pipelines (or two tests) never share throttling state by accident.

use crate::config::RetryPolicy;
use crate::error::StageError;
use std::future::Future;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, warn};

/// Per-credential throttling state.
pub struct CooldownGate {
    name: String,
    until: Mutex<Option<Instant>>,
    permits: Semaphore,
}

impl CooldownGate {
    pub fn new(name: impl Into<String>, max_in_flight: usize) -> Self {
        Self {
            name: name.into(),
            until: Mutex::new(None),
            permits: Semaphore::new(max_in_flight.max(1)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Close the gate for at least `pause`. Never shortens an existing cool-down.
    pub async fn trip(&self, pause: Duration) {
        let candidate = Instant::now() + pause;
        let mut until = self.until.lock().await;
        if until.is_none_or(|current| candidate > current) {
            *until = Some(candidate);
            debug!("{}: cool-down for {}ms", self.name, pause.as_millis());
        }
    }

    /// Time left before the gate reopens.
    pub async fn remaining(&self) -> Option<Duration> {
        let until = *self.until.lock().await;
        until
            .map(|t| t.saturating_duration_since(Instant::now()))
            .filter(|d| !d.is_zero())
    }

    /// Wait until the gate is open. Re-checks after sleeping because another
    /// caller may have extended the cool-down meanwhile.
    pub async fn wait_ready(&self) {
        while let Some(left) = self.remaining().await {
            debug!("{}: waiting {}ms for cool-down", self.name, left.as_millis());
            sleep(left).await;
        }
    }
}

/// The result of a retried call and how many attempts it took.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, StageError>,
    pub attempts: u32,
}

/// Run `op` under `policy`, gated by `gate`.
///
/// `op` receives the 1-based attempt number. `label` names the call in logs
/// (typically the document and stage).
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    gate: &CooldownGate,
    label: &str,
    mut op: F,
) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, StageError>>,
{
    let mut attempt = 0u32;
    let mut malformed_seen = 0u32;

    loop {
        attempt += 1;

        let result = {
            // The semaphore is never closed, so acquire cannot fail in practice.
            let _permit = gate.permits.acquire().await.ok();
            // Checked under the permit: the previous holder may have tripped the gate.
            gate.wait_ready().await;
            let result = op(attempt).await;
            if let Err(StageError::RateLimited { retry_after, .. }) = &result {
                let pause = retry_after
                    .unwrap_or_default()
                    .max(policy.rate_limit_cooldown);
                gate.trip(pause).await;
            }
            result
        };

        let err = match result {
            Ok(value) => {
                if attempt > 1 {
                    debug!("{label}: succeeded on attempt {attempt}");
                }
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt,
                };
            }
            Err(e) => e,
        };

        if !err.is_retryable() {
            return RetryOutcome {
                result: Err(err),
                attempts: attempt,
            };
        }

        if matches!(err, StageError::MalformedResponse { .. }) {
            malformed_seen += 1;
            if malformed_seen > 1 || attempt >= policy.max_attempts {
                return RetryOutcome {
                    result: Err(err),
                    attempts: attempt,
                };
            }
        }

        if attempt >= policy.max_attempts {
            warn!("{label}: giving up after {attempt} attempts: {err}");
            return RetryOutcome {
                result: Err(StageError::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(err),
                }),
                attempts: attempt,
            };
        }

        let delay = backoff_with_jitter(policy, attempt);
        warn!(
            "{label}: attempt {attempt}/{} failed ({err}); retrying in {}ms",
            policy.max_attempts,
            delay.as_millis()
        );
        sleep(delay).await;
    }
}

fn backoff_with_jitter(policy: &RetryPolicy, attempt: u32) -> Duration {
    let delay = policy.backoff(attempt);
    if policy.jitter && !delay.is_zero() {
        let ms = delay.as_millis() as u64;
        // Add 0-50% random jitter
        Duration::from_millis(ms + fastrand::u64(0..=ms / 2))
    } else {
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::sync::Arc;

    fn transient() -> StageError {
        StageError::Transient {
            provider: "test".into(),
            detail: "HTTP 503".into(),
        }
    }

    fn malformed() -> StageError {
        StageError::MalformedResponse {
            provider: "test".into(),
            detail: "not json".into(),
        }
    }

    #[tokio::test]
    async fn two_transient_failures_then_success() {
        let gate = CooldownGate::new("test", 2);
        let calls = AtomicU32::new(0);
        let out = with_retry(&RetryPolicy::immediate(3), &gate, "doc", |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(transient())
                } else {
                    Ok("text")
                }
            }
        })
        .await;
        assert_eq!(out.result.unwrap(), "text");
        assert_eq!(out.attempts, 3);
    }

    #[tokio::test]
    async fn auth_rejection_is_not_retried() {
        let gate = CooldownGate::new("test", 2);
        let out: RetryOutcome<()> = with_retry(&RetryPolicy::immediate(5), &gate, "doc", |_| async {
            Err(StageError::AuthRejected {
                provider: "test".into(),
                detail: "401".into(),
            })
        })
        .await;
        assert_eq!(out.attempts, 1);
        assert!(matches!(out.result, Err(StageError::AuthRejected { .. })));
    }

    #[tokio::test]
    async fn exhaustion_wraps_last_error() {
        let gate = CooldownGate::new("test", 2);
        let out: RetryOutcome<()> =
            with_retry(&RetryPolicy::immediate(3), &gate, "doc", |_| async { Err(transient()) })
                .await;
        assert_eq!(out.attempts, 3);
        match out.result {
            Err(StageError::RetriesExhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert_eq!(*last, transient());
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_response_retried_once_then_surfaced() {
        let gate = CooldownGate::new("test", 2);
        let out: RetryOutcome<()> =
            with_retry(&RetryPolicy::immediate(5), &gate, "doc", |_| async { Err(malformed()) })
                .await;
        assert_eq!(out.attempts, 2);
        assert_eq!(out.result.unwrap_err(), malformed());
    }

    #[tokio::test]
    async fn rate_limit_trips_shared_gate() {
        let gate = CooldownGate::new("test", 2);
        let policy = RetryPolicy {
            rate_limit_cooldown: Duration::from_millis(40),
            ..RetryPolicy::immediate(3)
        };
        let start = Instant::now();
        let out = with_retry(&policy, &gate, "doc", |attempt| async move {
            if attempt == 1 {
                Err(StageError::RateLimited {
                    provider: "test".into(),
                    retry_after: None,
                })
            } else {
                Ok(attempt)
            }
        })
        .await;
        assert_eq!(out.result.unwrap(), 2);
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn retry_after_hint_longer_than_cooldown_wins() {
        let gate = CooldownGate::new("test", 2);
        let policy = RetryPolicy {
            rate_limit_cooldown: Duration::from_millis(5),
            ..RetryPolicy::immediate(2)
        };
        let start = Instant::now();
        let _ = with_retry(&policy, &gate, "doc", |attempt| async move {
            if attempt == 1 {
                Err(StageError::RateLimited {
                    provider: "test".into(),
                    retry_after: Some(Duration::from_millis(50)),
                })
            } else {
                Ok(())
            }
        })
        .await;
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn other_callers_wait_for_cooldown() {
        let gate = CooldownGate::new("test", 2);
        gate.trip(Duration::from_millis(60)).await;
        let start = Instant::now();
        let out = with_retry(&RetryPolicy::immediate(1), &gate, "other", |_| async { Ok(()) }).await;
        assert!(out.result.is_ok());
        assert!(start.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn queued_caller_waits_for_cooldown_tripped_by_permit_holder() {
        let gate = Arc::new(CooldownGate::new("test", 1));
        let policy = RetryPolicy {
            rate_limit_cooldown: Duration::from_millis(150),
            ..RetryPolicy::immediate(2)
        };
        let start = Instant::now();
        let log: Arc<std::sync::Mutex<Vec<(&'static str, Duration)>>> = Arc::default();

        let first = {
            let (gate, policy, log) = (gate.clone(), policy.clone(), log.clone());
            tokio::spawn(async move {
                with_retry(&policy, &gate, "a", |attempt| {
                    let log = log.clone();
                    async move {
                        log.lock().unwrap().push(("a", start.elapsed()));
                        if attempt == 1 {
                            sleep(Duration::from_millis(20)).await;
                            Err(StageError::RateLimited {
                                provider: "test".into(),
                                retry_after: None,
                            })
                        } else {
                            Ok(())
                        }
                    }
                })
                .await
            })
        };
        // Let the first caller take the only permit before the second queues.
        sleep(Duration::from_millis(5)).await;
        let second = {
            let (gate, policy, log) = (gate.clone(), policy.clone(), log.clone());
            tokio::spawn(async move {
                with_retry(&policy, &gate, "b", |_| {
                    let log = log.clone();
                    async move {
                        log.lock().unwrap().push(("b", start.elapsed()));
                        Ok(())
                    }
                })
                .await
            })
        };

        assert!(first.await.unwrap().result.is_ok());
        assert!(second.await.unwrap().result.is_ok());

        let log = log.lock().unwrap();
        let b_call = log.iter().find(|(who, _)| *who == "b").unwrap().1;
        assert!(
            b_call >= Duration::from_millis(150),
            "second caller reached the provider during the cool-down: {log:?}"
        );
        assert_eq!(log.iter().filter(|(who, _)| *who == "a").count(), 2);
    }

    #[tokio::test]
    async fn trip_never_shortens_cooldown() {
        let gate = CooldownGate::new("test", 1);
        gate.trip(Duration::from_secs(10)).await;
        gate.trip(Duration::from_millis(1)).await;
        assert!(gate.remaining().await.unwrap() > Duration::from_secs(5));
    }

    #[tokio::test]
    async fn in_flight_calls_are_bounded() {
        let gate = Arc::new(CooldownGate::new("test", 1));
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..3 {
            let (gate, current, peak) = (gate.clone(), current.clone(), peak.clone());
            handles.push(tokio::spawn(async move {
                with_retry(&RetryPolicy::immediate(1), &gate, "doc", |_| {
                    let (current, peak) = (current.clone(), peak.clone());
                    async move {
                        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        sleep(Duration::from_millis(10)).await;
                        current.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    }
                })
                .await
            }));
        }
        for h in handles {
            assert!(h.await.unwrap().result.is_ok());
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn jitter_stays_within_half_delay() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            ..RetryPolicy::default()
        };
        for _ in 0..50 {
            let d = backoff_with_jitter(&policy, 1);
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(150));
        }
    }
}
