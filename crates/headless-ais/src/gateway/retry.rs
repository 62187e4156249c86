//! Retry schedule for Academic System outages.
//!
//! A 5xx or a dropped connection usually clears within seconds and is retried
//! on a short exponential schedule. The maintenance notice means CCXP is down
//! for a window, so it gets a fixed long pause and a separate, smaller budget.

use std::future::Future;
use std::time::Duration;

use rand::RngExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::GatewayError;

/// How a failed request is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Transport failure or 5xx.
    Transient,
    /// The maintenance notice was served.
    Maintenance,
    /// Retrying cannot help.
    Fatal,
}

impl RetryClass {
    pub fn of(err: &GatewayError) -> Self {
        match err {
            GatewayError::UpstreamUnavailable {
                maintenance: true, ..
            } => Self::Maintenance,
            e if e.is_retryable() => Self::Transient,
            _ => Self::Fatal,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after transient failures, not counting the first request.
    pub max_retries: u32,
    /// Ceiling of the first transient pause; doubles per retry.
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Retries after a maintenance notice. `0` reports it at once.
    pub maintenance_retries: u32,
    pub maintenance_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            maintenance_retries: 1,
            maintenance_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// No retries of any kind.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            maintenance_retries: 0,
            ..Self::default()
        }
    }

    /// Pause before the `retry`-th retry (1-based) of a `class` failure, or
    /// `None` once that class has used its budget.
    pub fn next_delay(&self, class: RetryClass, retry: u32) -> Option<Duration> {
        match class {
            RetryClass::Fatal => None,
            RetryClass::Maintenance => {
                (retry <= self.maintenance_retries).then_some(self.maintenance_delay)
            }
            RetryClass::Transient => (retry <= self.max_retries).then(|| self.backoff(retry)),
        }
    }

    /// Uniform in `[ceiling / 2, ceiling]`, where the ceiling doubles per
    /// retry up to `max_delay`.
    fn backoff(&self, retry: u32) -> Duration {
        let doublings = retry.saturating_sub(1).min(31);
        let ceiling = self
            .base_delay
            .saturating_mul(1 << doublings)
            .min(self.max_delay);
        let floor = ceiling / 2;
        let spread_ms = u64::try_from((ceiling - floor).as_millis()).unwrap_or(u64::MAX);
        if spread_ms == 0 {
            return ceiling;
        }
        floor + Duration::from_millis(rand::rng().random_range(0..=spread_ms))
    }
}

/// Run `request` until it succeeds, fails for good, or its class runs out of
/// retries. Each class keeps its own count.
pub(super) async fn run<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    path: &str,
    mut request: F,
) -> Result<T, GatewayError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, GatewayError>>,
{
    let mut transient = 0u32;
    let mut maintenance = 0u32;

    loop {
        let err = match request().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        let class = RetryClass::of(&err);
        let retry = match class {
            RetryClass::Transient => {
                transient += 1;
                transient
            }
            RetryClass::Maintenance => {
                maintenance += 1;
                maintenance
            }
            RetryClass::Fatal => return Err(err),
        };
        let Some(delay) = policy.next_delay(class, retry) else {
            debug!(path, ?class, retries = retry - 1, "Retry budget spent");
            return Err(err);
        };

        warn!(
            path,
            ?class,
            retry,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Academic System unavailable, retrying"
        );
        tokio::select! {
            _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use tokio::time::Instant;

    use super::*;

    fn busy() -> GatewayError {
        GatewayError::upstream(Some(503), "busy")
    }

    #[test]
    fn classes() {
        assert_eq!(RetryClass::of(&busy()), RetryClass::Transient);
        assert_eq!(
            RetryClass::of(&GatewayError::NetworkFailure("reset".into())),
            RetryClass::Transient
        );
        assert_eq!(
            RetryClass::of(&GatewayError::maintenance(Some(200))),
            RetryClass::Maintenance
        );
        assert_eq!(RetryClass::of(&GatewayError::SessionExpired), RetryClass::Fatal);
    }

    #[test]
    fn transient_delay_doubles_within_cap() {
        let policy = RetryPolicy {
            max_retries: 40,
            base_delay: Duration::from_millis(400),
            max_delay: Duration::from_secs(2),
            ..RetryPolicy::default()
        };

        let first = policy.next_delay(RetryClass::Transient, 1).unwrap();
        assert!(first >= Duration::from_millis(200) && first <= Duration::from_millis(400));
        let third = policy.next_delay(RetryClass::Transient, 3).unwrap();
        assert!(third >= Duration::from_millis(800) && third <= Duration::from_millis(1600));
        for retry in [10, 33, 40] {
            let capped = policy.next_delay(RetryClass::Transient, retry).unwrap();
            assert!(capped >= Duration::from_secs(1) && capped <= Duration::from_secs(2));
        }
        assert_eq!(policy.next_delay(RetryClass::Transient, 41), None);
    }

    #[test]
    fn maintenance_budget_is_separate() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.next_delay(RetryClass::Maintenance, 1),
            Some(Duration::from_secs(30))
        );
        assert_eq!(policy.next_delay(RetryClass::Maintenance, 2), None);
        assert!(policy.next_delay(RetryClass::Transient, 3).is_some());
        assert_eq!(RetryPolicy::none().next_delay(RetryClass::Transient, 1), None);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_then_success() {
        let calls = AtomicU32::new(0);
        let result = run(&RetryPolicy::default(), &CancellationToken::new(), "a.php", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { if n < 2 { Err(busy()) } else { Ok(n) } }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn maintenance_waits_the_long_pause_once() {
        let calls = AtomicU32::new(0);
        let started = Instant::now();
        let result: Result<(), _> =
            run(&RetryPolicy::default(), &CancellationToken::new(), "a.php", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(GatewayError::maintenance(Some(200))) }
            })
            .await;

        assert!(matches!(
            result,
            Err(GatewayError::UpstreamUnavailable {
                maintenance: true,
                ..
            })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(started.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn maintenance_does_not_spend_transient_budget() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_retries: 1,
            ..RetryPolicy::default()
        };
        // busy, maintenance, busy, ok: one retry of each class
        let result = run(&policy, &CancellationToken::new(), "a.php", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                match n {
                    0 | 2 => Err(busy()),
                    1 => Err(GatewayError::maintenance(Some(200))),
                    _ => Ok("page"),
                }
            }
        })
        .await;

        assert!(matches!(result, Err(GatewayError::UpstreamUnavailable { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> =
            run(&RetryPolicy::default(), &CancellationToken::new(), "a.php", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(GatewayError::SessionExpired) }
            })
            .await;

        assert!(matches!(result, Err(GatewayError::SessionExpired)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_the_pause() {
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let result: Result<(), _> = run(&RetryPolicy::default(), &cancel, "a.php", || async {
            Err(GatewayError::maintenance(None))
        })
        .await;
        assert!(matches!(result, Err(GatewayError::Cancelled)));
    }
}
