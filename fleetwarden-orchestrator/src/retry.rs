use std::future::Future;
use std::time::Duration;

use fleetwarden_common::FleetError;
use fleetwarden_providers::PermanentError;
use rand::Rng;

use crate::config::ProviderCallSettings;

const PERMANENT_MARKERS: &[&str] = &[
    "quota",
    "invalid",
    "not found",
    "unauthorized",
    "forbidden",
    "400",
    "401",
    "403",
    "404",
    "422",
];

/// Map an adapter error onto the error taxonomy.
/// Adapters signal non-retryable failures with `PermanentError`; anything
/// that looks like a vendor 4xx is permanent too, everything else (timeouts,
/// 429, resets, 5xx) is transient.
pub fn classify(err: &anyhow::Error) -> FleetError {
    if let Some(fe) = err.downcast_ref::<FleetError>() {
        return fe.clone();
    }
    if let Some(pe) = err.downcast_ref::<PermanentError>() {
        return FleetError::PermanentProvider(pe.0.clone());
    }
    let msg = err.to_string();
    let lower = msg.to_ascii_lowercase();
    if lower.contains("429") || lower.contains("rate limit") || lower.contains("too many") {
        return FleetError::TransientProvider(msg);
    }
    if PERMANENT_MARKERS.iter().any(|m| lower.contains(m)) {
        return FleetError::PermanentProvider(msg);
    }
    FleetError::TransientProvider(msg)
}

pub fn backoff_delay(settings: &ProviderCallSettings, attempt: u32) -> Duration {
    let exp = settings
        .backoff_base
        .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
    let capped = exp.min(settings.backoff_max);
    // up to 20% jitter so parallel workers don't hit a rate-limited API in lockstep
    let jitter_ms = (capped.as_millis() as u64) / 5;
    if jitter_ms == 0 {
        return capped;
    }
    capped + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
}

/// Run a provider call with a per-attempt timeout, retrying transient
/// failures with exponential backoff up to `max_attempts`.
pub async fn call_with_retry<T, F, Fut>(
    settings: &ProviderCallSettings,
    op: &str,
    mut f: F,
) -> Result<T, FleetError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let err = match tokio::time::timeout(settings.timeout, f()).await {
            Ok(Ok(v)) => return Ok(v),
            Ok(Err(e)) => classify(&e),
            Err(_) => FleetError::TransientProvider(format!(
                "{} timed out after {}s",
                op,
                settings.timeout.as_secs_f64()
            )),
        };

        if !err.is_transient() || attempt >= settings.max_attempts {
            tracing::warn!("❌ [retry] {} failed after {} attempt(s): {}", op, attempt, err);
            return Err(err);
        }
        let delay = backoff_delay(settings, attempt);
        tracing::debug!(
            "🔁 [retry] {} attempt {}/{} failed ({}), retrying in {:?}",
            op,
            attempt,
            settings.max_attempts,
            err,
            delay
        );
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast() -> ProviderCallSettings {
        ProviderCallSettings {
            timeout: Duration::from_millis(50),
            max_attempts: 3,
            backoff_base: Duration::from_millis(1),
            backoff_max: Duration::from_millis(5),
        }
    }

    #[test]
    fn classification() {
        assert!(classify(&anyhow::anyhow!("HTTP 429 Too Many Requests")).is_transient());
        assert!(classify(&anyhow::anyhow!("connection reset by peer")).is_transient());
        assert!(!classify(&anyhow::anyhow!("quota exceeded for GPU family")).is_transient());
        let pe: anyhow::Error = PermanentError("bad spec".into()).into();
        assert_eq!(classify(&pe), FleetError::PermanentProvider("bad spec".into()));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let s = ProviderCallSettings {
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_millis(300),
            ..fast()
        };
        assert!(backoff_delay(&s, 1) >= Duration::from_millis(100));
        assert!(backoff_delay(&s, 2) >= Duration::from_millis(200));
        assert!(backoff_delay(&s, 10) <= Duration::from_millis(360));
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let out = call_with_retry(&fast(), "op", || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(anyhow::anyhow!("503 service unavailable"))
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(out, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let out: Result<(), _> = call_with_retry(&fast(), "op", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(anyhow::anyhow!("invalid instance spec"))
            }
        })
        .await;
        assert!(matches!(out, Err(FleetError::PermanentProvider(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn hung_calls_time_out_and_exhaust_budget() {
        let out: Result<(), _> = call_with_retry(&fast(), "hang", || async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .await;
        assert!(matches!(out, Err(FleetError::TransientProvider(_))));
    }
}
