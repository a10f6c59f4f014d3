//! TTL caching decorator for getters
//!
//! A cached getter returns the memoized value while it is fresh and calls
//! through otherwise. Concurrent callers that miss the cache are coalesced:
//! one of them refreshes while the rest wait on the state lock and then
//! observe the outcome of that refresh. Failures are never memoized as
//! values. With backoff enabled, consecutive failures are retried after
//! 1s, 2s, 4s ... capped at the TTL; inside that window the last error is
//! returned without calling through.

use crate::error::Result;
use crate::logging::get_logger;
use crate::value::{Getter, getter};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

struct State<T> {
    value: Option<T>,
    updated: Option<Instant>,
    expired: bool,
    failures: u32,
    retry_at: Option<Instant>,
    last: Option<Result<T>>,
}

/// Memoizing wrapper around one getter
pub struct Cache<T> {
    getter: Getter<T>,
    ttl: Duration,
    backoff: bool,
    refreshes: AtomicU64,
    state: Mutex<State<T>>,
}

impl<T: Clone + Send + 'static> Cache<T> {
    pub fn new(getter: Getter<T>, ttl: Duration) -> Self {
        Self {
            getter,
            ttl,
            backoff: false,
            refreshes: AtomicU64::new(0),
            state: Mutex::new(State {
                value: None,
                updated: None,
                expired: false,
                failures: 0,
                retry_at: None,
                last: None,
            }),
        }
    }

    /// Enable error backoff
    pub fn with_backoff(mut self) -> Self {
        self.backoff = true;
        self
    }

    /// Return the cached value or refresh it
    pub async fn get(&self) -> Result<T> {
        let seen = self.refreshes.load(Ordering::Acquire);
        let mut state = self.state.lock().await;
        let now = Instant::now();

        if !state.expired
            && let (Some(value), Some(updated)) = (&state.value, state.updated)
            && now.duration_since(updated) < self.ttl
        {
            return Ok(value.clone());
        }

        // another caller refreshed while we were waiting for the lock
        if self.refreshes.load(Ordering::Acquire) != seen
            && let Some(outcome) = &state.last
        {
            return outcome.clone();
        }

        if let Some(retry_at) = state.retry_at
            && now < retry_at
            && let Some(Err(err)) = &state.last
        {
            return Err(err.clone());
        }

        let result = (self.getter)().await;
        match &result {
            Ok(value) => {
                state.value = Some(value.clone());
                state.updated = Some(Instant::now());
                state.expired = false;
                state.failures = 0;
                state.retry_at = None;
            }
            Err(err) => {
                if self.backoff {
                    state.failures = state.failures.saturating_add(1);
                    let delay = self.backoff_delay(state.failures);
                    state.retry_at = Some(Instant::now() + delay);
                    get_logger("cache").debug(&format!(
                        "refresh failed ({} in a row), retry in {:?}: {}",
                        state.failures, delay, err
                    ));
                }
            }
        }
        state.last = Some(result.clone());
        self.refreshes.fetch_add(1, Ordering::Release);

        result
    }

    /// Force the next call to refresh regardless of age
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        state.expired = true;
        state.retry_at = None;
        state.failures = 0;
    }

    fn backoff_delay(&self, failures: u32) -> Duration {
        let first = INITIAL_BACKOFF.min(self.ttl);
        let factor = 1u32 << failures.saturating_sub(1).min(16);
        first.saturating_mul(factor).min(self.ttl)
    }
}

/// Expose a shared cache as a getter
pub fn wrap<T: Clone + Send + 'static>(cache: Arc<Cache<T>>) -> Getter<T> {
    getter(move || {
        let cache = cache.clone();
        async move { cache.get().await }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HeliosError;
    use std::sync::atomic::AtomicUsize;

    fn counting(fail_on: &'static [usize]) -> (Getter<usize>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let g = getter(move || {
            let n = c.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if fail_on.contains(&n) {
                    Err(HeliosError::network("down"))
                } else {
                    Ok(n)
                }
            }
        });
        (g, calls)
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_grows_and_caps_at_ttl() {
        let (g, calls) = counting(&[1, 2, 3, 4, 5, 6]);
        let cache = Cache::new(g, Duration::from_secs(3)).with_backoff();

        assert!(cache.get().await.is_err());
        assert!(cache.get().await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_millis(1001)).await;
        assert!(cache.get().await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // second failure backs off 2s
        tokio::time::advance(Duration::from_millis(1500)).await;
        assert!(cache.get().await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        tokio::time::advance(Duration::from_millis(600)).await;
        assert!(cache.get().await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // third would be 4s, capped at the 3s ttl
        tokio::time::advance(Duration::from_millis(3001)).await;
        assert!(cache.get().await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_forces_refresh() {
        let (g, calls) = counting(&[]);
        let cache = Cache::new(g, Duration::from_secs(60));
        assert_eq!(cache.get().await.unwrap(), 1);
        assert_eq!(cache.get().await.unwrap(), 1);
        cache.reset().await;
        assert_eq!(cache.get().await.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_backoff_delay_curve() {
        let (g, _) = counting(&[]);
        let cache = Cache::new(g, Duration::from_secs(10));
        assert_eq!(cache.backoff_delay(1), Duration::from_secs(1));
        assert_eq!(cache.backoff_delay(2), Duration::from_secs(2));
        assert_eq!(cache.backoff_delay(4), Duration::from_secs(8));
        assert_eq!(cache.backoff_delay(5), Duration::from_secs(10));
        assert_eq!(cache.backoff_delay(40), Duration::from_secs(10));

        let (g, _) = counting(&[]);
        let short = Cache::new(g, Duration::from_millis(300));
        assert_eq!(short.backoff_delay(1), Duration::from_millis(300));
    }
}
