//! Retry logic for transient SOAP errors on read-only queries.
//!
//! State-changing calls are never retried here; re-issuing them is the
//! sequencer's decision.

use std::future::Future;
use std::time::Duration;

use crate::error::SoapResult;

/// Retry delays for transient SOAP errors (exponential backoff).
const RETRY_DELAYS_MS: [u64; 3] = [200, 500, 1000];

/// Executes a read-only SOAP query with retry logic for transient errors.
///
/// Retries on transient SOAP faults (701, 714, 716) and timeouts with
/// exponential backoff (200ms, 500ms, 1000ms).
pub(crate) async fn with_retry<T, F, Fut>(action: &str, mut operation: F) -> SoapResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SoapResult<T>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(r) => return Ok(r),
            Err(e) if e.is_transient() && attempt < RETRY_DELAYS_MS.len() => {
                let delay_ms = RETRY_DELAYS_MS[attempt];
                attempt += 1;
                log::info!(
                    "[SOAP] Retrying {} (attempt {}/{}) after {}ms: {}",
                    action,
                    attempt + 1,
                    RETRY_DELAYS_MS.len() + 1,
                    delay_ms,
                    e
                );
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU8, Ordering};

    use super::*;
    use crate::sonos::soap::SoapError;

    #[tokio::test(start_paused = true)]
    async fn retries_transient_faults_until_success() {
        let calls = AtomicU8::new(0);
        let counter = &calls;
        let result = with_retry("GetPositionInfo", || async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(SoapError::Fault("UPnPError (701)".into()))
            } else {
                Ok(42)
            }
        })
        .await;

        assert_eq!(result.ok(), Some(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_last_delay() {
        let calls = AtomicU8::new(0);
        let counter = &calls;
        let result: SoapResult<()> = with_retry("GetMediaInfo", || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(SoapError::Fault("UPnPError (716)".into()))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn permanent_fault_is_not_retried() {
        let calls = AtomicU8::new(0);
        let counter = &calls;
        let result: SoapResult<()> = with_retry("GetVolume", || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(SoapError::Fault("UPnPError (402)".into()))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
