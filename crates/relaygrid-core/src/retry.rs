//! Bounded retry and polling.
//!
//! Two shapes cover every wait in the orchestrator:
//!
//! - [`retry`] re-runs an operation that failed transiently, up to a fixed
//!   number of attempts with a fixed delay. A classifier decides which
//!   errors are worth retrying; everything else is returned at once.
//! - [`poll_until`] re-runs a probe until it reports [`Probe::Ready`]. Running
//!   out of attempts is a [`PollError::TimedOut`], distinct from a probe that
//!   hit a hard error ([`PollError::Failed`]).

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

/// Fixed-delay retry bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Zero is treated as one.
    pub max_attempts: u32,
    /// Sleep between attempts.
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// Single attempt, no retry.
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(5))
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy is exhausted. The closure receives the 1-based attempt number.
pub async fn retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    is_retryable: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let attempts = policy.attempts();
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts && is_retryable(&e) => {
                warn!(
                    %operation,
                    attempt,
                    max_attempts = attempts,
                    error = %e,
                    "operation failed, retrying"
                );
                tokio::time::sleep(policy.delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Polling bound: at most `max_attempts` probes, `interval` apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl PollPolicy {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
        }
    }
}

/// Outcome of one probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe<T> {
    Ready(T),
    NotYet,
}

/// Why polling stopped without a result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollError<E> {
    /// The condition never became true within the bound.
    TimedOut { attempts: u32 },
    /// The probe itself failed; polling stopped immediately.
    Failed(E),
}

impl<E: std::fmt::Display> std::fmt::Display for PollError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PollError::TimedOut { attempts } => write!(f, "timed out after {attempts} attempt(s)"),
            PollError::Failed(e) => write!(f, "{e}"),
        }
    }
}

/// Probe until ready, bounded by `policy`.
pub async fn poll_until<T, E, F, Fut>(
    policy: &PollPolicy,
    operation: &str,
    mut probe: F,
) -> Result<T, PollError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Probe<T>, E>>,
{
    let attempts = policy.max_attempts.max(1);
    for attempt in 1..=attempts {
        match probe(attempt).await {
            Ok(Probe::Ready(value)) => {
                debug!(%operation, attempt, "poll condition met");
                return Ok(value);
            }
            Ok(Probe::NotYet) => {
                debug!(%operation, attempt, max_attempts = attempts, "poll condition not met yet");
                if attempt < attempts {
                    tokio::time::sleep(policy.interval).await;
                }
            }
            Err(e) => return Err(PollError::Failed(e)),
        }
    }
    Err(PollError::TimedOut { attempts })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn retry_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result: Result<u32, String> = retry(&fast(3), "op", |_| true, |attempt| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                if attempt < 3 { Err("flaky".to_string()) } else { Ok(attempt) }
            }
        })
        .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_stops_at_bound() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result: Result<(), String> = retry(&fast(3), "op", |_| true, |_| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err("down".to_string())
            }
        })
        .await;

        assert_eq!(result, Err("down".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_surfaces_non_retryable_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result: Result<(), String> =
            retry(&fast(3), "op", |e: &String| e != "exit 1", |_| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err("exit 1".to_string())
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn zero_attempts_still_runs_once() {
        let result: Result<u8, String> =
            retry(&fast(0), "op", |_| true, |_| async { Ok(7) }).await;
        assert_eq!(result, Ok(7));
    }

    #[tokio::test]
    async fn poll_returns_ready_value() {
        let policy = PollPolicy::new(5, Duration::from_millis(1));
        let result: Result<&str, PollError<String>> = poll_until(&policy, "cert", |attempt| async move {
            Ok(if attempt == 2 { Probe::Ready("pem") } else { Probe::NotYet })
        })
        .await;
        assert_eq!(result, Ok("pem"));
    }

    #[tokio::test]
    async fn poll_times_out_distinctly() {
        let policy = PollPolicy::new(4, Duration::from_millis(1));
        let result: Result<(), PollError<String>> =
            poll_until(&policy, "cert", |_| async { Ok(Probe::NotYet) }).await;
        assert_eq!(result, Err(PollError::TimedOut { attempts: 4 }));
    }

    #[tokio::test]
    async fn poll_hard_failure_stops_early() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let policy = PollPolicy::new(10, Duration::from_millis(1));

        let result: Result<(), PollError<String>> = poll_until(&policy, "cert", |_| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err("forbidden".to_string())
            }
        })
        .await;

        assert_eq!(result, Err(PollError::Failed("forbidden".to_string())));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
