//! Bounded polling for resources that propagate asynchronously, such as
//! freshly issued credential bundles.

use anyhow::{anyhow, Result};
use k8s_openapi::api::core::v1::Secret;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Entries a complete credential bundle must carry
pub const CREDENTIAL_BUNDLE_KEYS: [&str; 3] = ["ca.crt", "tls.crt", "tls.key"];

/// Fixed-step backoff: `steps` attempts, waiting `duration` scaled by
/// `factor` after each, plus up to `jitter * duration` of random delay.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub steps: u32,
    pub duration: Duration,
    pub factor: f64,
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            steps: 60,
            duration: Duration::from_secs(1),
            factor: 1.0,
            jitter: 0.1,
        }
    }
}

impl Backoff {
    /// Delay before attempt `attempt + 1`, without jitter.
    ///
    /// Saturates at `Duration::MAX` when the scaled delay overflows.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let scale = self.factor.max(0.0).powi(attempt.min(i32::MAX as u32) as i32);
        saturating_secs(self.duration.as_secs_f64() * scale)
    }

    fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        // NaN and infinite jitter are ignored
        if !(self.jitter > 0.0 && self.jitter.is_finite()) {
            return base;
        }
        let extra = rand::thread_rng().gen_range(0.0..self.jitter);
        base.saturating_add(saturating_secs(base.as_secs_f64() * extra))
    }
}

fn saturating_secs(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

/// Call `fetch` until its result satisfies `ready` or the backoff runs out.
///
/// Fetch errors are retried. When the steps are exhausted the last fetch
/// error is returned, or a timeout error if the resource was found but
/// never became ready.
pub async fn poll_until_ready<T, F, Fut, R>(
    backoff: Backoff,
    what: &str,
    mut fetch: F,
    ready: R,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    R: Fn(&T) -> bool,
{
    let steps = backoff.steps.max(1);
    let mut last_error = None;

    for attempt in 0..steps {
        match fetch().await {
            Ok(value) if ready(&value) => {
                debug!(what, attempts = attempt + 1, "resource is ready");
                return Ok(value);
            }
            Ok(_) => {
                debug!(what, attempt = attempt + 1, "resource not ready yet");
                last_error = None;
            }
            Err(e) => {
                debug!(what, attempt = attempt + 1, error = %e, "unable to fetch resource");
                last_error = Some(e);
            }
        }
        if attempt + 1 < steps {
            tokio::time::sleep(backoff.delay(attempt)).await;
        }
    }

    warn!(what, attempts = steps, "gave up waiting for resource");
    Err(last_error.unwrap_or_else(|| {
        anyhow!("timed out waiting for {} after {} attempts", what, steps)
    }))
}

/// Whether `secret` carries the CA, certificate and private key entries
pub fn is_credential_bundle_complete(secret: &Secret) -> bool {
    secret.data.as_ref().is_some_and(|data| {
        CREDENTIAL_BUNDLE_KEYS
            .iter()
            .all(|key| data.get(*key).is_some_and(|v| !v.0.is_empty()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::van::token::tests::sample_secret;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick(steps: u32) -> Backoff {
        Backoff {
            steps,
            duration: Duration::from_secs(1),
            factor: 1.0,
            jitter: 0.0,
        }
    }

    #[test]
    fn test_default_backoff() {
        let backoff = Backoff::default();
        assert_eq!(backoff.steps, 60);
        assert_eq!(backoff.duration, Duration::from_secs(1));
        assert_eq!(backoff.base_delay(10), Duration::from_secs(1));
    }

    #[test]
    fn test_factor_scales_delay() {
        let backoff = Backoff {
            factor: 2.0,
            ..quick(5)
        };
        assert_eq!(backoff.base_delay(0), Duration::from_secs(1));
        assert_eq!(backoff.base_delay(3), Duration::from_secs(8));
    }

    #[test]
    fn test_jitter_is_bounded() {
        let backoff = Backoff::default();
        for attempt in 0..50 {
            let delay = backoff.delay(attempt);
            assert!(delay >= Duration::from_secs(1));
            assert!(delay <= Duration::from_millis(1100));
        }
    }

    #[test]
    fn test_delay_saturates_instead_of_overflowing() {
        let backoff = Backoff {
            factor: 2.0,
            jitter: 0.1,
            ..quick(200)
        };
        assert_eq!(backoff.base_delay(199), Duration::MAX);
        assert_eq!(backoff.delay(199), Duration::MAX);

        let infinite = Backoff {
            factor: f64::INFINITY,
            ..quick(3)
        };
        assert_eq!(infinite.base_delay(2), Duration::MAX);
    }

    #[test]
    fn test_non_finite_jitter_is_ignored() {
        for jitter in [f64::NAN, f64::INFINITY, -0.5] {
            let backoff = Backoff {
                jitter,
                ..quick(3)
            };
            assert_eq!(backoff.delay(1), Duration::from_secs(1));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_until_ready() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let value = poll_until_ready(
            quick(10),
            "counter",
            || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(anyhow!("not found"))
                } else {
                    Ok(n)
                }
            },
            |n| *n >= 4,
        )
        .await
        .unwrap();

        assert_eq!(value, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_returns_last_error_when_exhausted() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let err = poll_until_ready(
            quick(3),
            "secret",
            || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Err::<u32, _>(anyhow!("attempt {} failed", n))
            },
            |_| true,
        )
        .await
        .unwrap_err();

        assert_eq!(err.to_string(), "attempt 3 failed");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_when_never_ready() {
        let err = poll_until_ready(quick(2), "secret west-site-w", || async { Ok(0) }, |_| false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out waiting for secret west-site-w"));
    }

    #[test]
    fn test_credential_bundle_completeness() {
        let mut secret = sample_secret("west-site-w", "key");
        assert!(is_credential_bundle_complete(&secret));

        secret.data.as_mut().unwrap().remove("ca.crt");
        assert!(!is_credential_bundle_complete(&secret));

        assert!(!is_credential_bundle_complete(&Secret::default()));
    }
}
