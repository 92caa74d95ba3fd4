// Retry policy wrapping `Allocate` (§4.E, §7): 5 steps, base 10 ms, factor
// 1.0 (constant interval), 0.1 jitter. Retries only on `Contention`; a
// `NoReady` result is terminal and returned immediately.
use rand::Rng;

use common::errors::AllocationError;

pub const MAX_ATTEMPTS: u32 = 5;
pub const BASE_DELAY_MS: u64 = 10;
pub const JITTER_FRACTION: f64 = 0.1;

fn jittered_delay(base_ms: u64) -> std::time::Duration {
    let jitter = (base_ms as f64) * JITTER_FRACTION;
    let offset = rand::thread_rng().gen_range(-jitter..=jitter);
    let millis = (base_ms as f64 + offset).max(0.0);
    std::time::Duration::from_millis(millis as u64)
}

/// Runs `attempt` up to `MAX_ATTEMPTS` times, sleeping a jittered
/// `BASE_DELAY_MS` between `Contention` results. `on_exhausted` runs once,
/// before the final error is returned, if every attempt saw contention.
pub async fn retry_on_contention<F, Fut, T, R>(mut attempt: F, on_exhausted: R) -> Result<T, AllocationError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, AllocationError>>,
    R: std::future::Future<Output = ()>,
{
    let mut last_err = AllocationError::Contention;
    for step in 0..MAX_ATTEMPTS {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(AllocationError::Contention) => {
                last_err = AllocationError::Contention;
                if step + 1 < MAX_ATTEMPTS {
                    tokio::time::sleep(jittered_delay(BASE_DELAY_MS)).await;
                }
            }
            Err(other) => return Err(other),
        }
    }
    on_exhausted.await;
    Err(last_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn stops_retrying_on_first_success() {
        let calls = AtomicU32::new(0);
        let result = retry_on_contention(
            || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(AllocationError::Contention)
                } else {
                    Ok(42)
                }
            },
            async {},
        )
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn no_ready_is_never_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), AllocationError> = retry_on_contention(
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(AllocationError::NoReady)
            },
            async {},
        )
        .await;
        assert!(matches!(result, Err(AllocationError::NoReady)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhaustion_runs_resync_hook_exactly_once() {
        let resyncs = AtomicU32::new(0);
        let result: Result<(), AllocationError> = retry_on_contention(
            || async { Err(AllocationError::Contention) },
            async {
                resyncs.fetch_add(1, Ordering::SeqCst);
            },
        )
        .await;
        assert!(matches!(result, Err(AllocationError::Contention)));
        assert_eq!(resyncs.load(Ordering::SeqCst), 1);
    }
}
