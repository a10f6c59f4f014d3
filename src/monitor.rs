//! Last-value cell for push sources
//!
//! MQTT subscriptions and WebSocket readers store every received value in a
//! [`Monitor`]. The first read waits for the first value up to the initial
//! timeout; later reads never block and fail once the value is older than
//! the staleness window.

use crate::error::{HeliosError, Result};
use crate::logging::get_logger;
use crate::value::{Getter, getter};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Interval between "still waiting" diagnostics during the first read
const WAIT_LOG_INTERVAL: Duration = Duration::from_secs(5);

struct Inner<T> {
    value: Option<T>,
    updated: Option<Instant>,
    first_read_done: bool,
}

pub struct Monitor<T> {
    name: String,
    initial_timeout: Duration,
    staleness: Option<Duration>,
    inner: Mutex<Inner<T>>,
    notify: Notify,
}

impl<T: Clone + Send + 'static> Monitor<T> {
    /// `staleness` of `None` disables the outdated check
    pub fn new(name: &str, initial_timeout: Duration, staleness: Option<Duration>) -> Self {
        Self {
            name: name.to_string(),
            initial_timeout,
            staleness: staleness.filter(|d| !d.is_zero()),
            inner: Mutex::new(Inner {
                value: None,
                updated: None,
                first_read_done: false,
            }),
            notify: Notify::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Store a new value and wake waiting readers
    pub fn set(&self, value: T) {
        {
            let mut inner = self.inner.lock();
            inner.value = Some(value);
            inner.updated = Some(Instant::now());
        }
        self.notify.notify_waiters();
    }

    /// Time since the last update, if any value arrived
    pub fn age(&self) -> Option<Duration> {
        self.inner.lock().updated.map(|t| t.elapsed())
    }

    pub async fn get(&self) -> Result<T> {
        let deadline = Instant::now() + self.initial_timeout;
        let logger = get_logger("monitor");

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(result) = self.current() {
                return result;
            }

            let now = Instant::now();
            if now >= deadline {
                self.inner.lock().first_read_done = true;
                return Err(HeliosError::NoInitialValue {
                    name: self.name.clone(),
                });
            }

            let wait = (deadline - now).min(WAIT_LOG_INTERVAL);
            if tokio::time::timeout(wait, notified).await.is_err() && Instant::now() < deadline {
                logger.debug(&format!("{}: waiting for initial value", self.name));
            }
        }
    }

    /// Result of a read that must not block, or `None` if the first read
    /// is still allowed to wait
    fn current(&self) -> Option<Result<T>> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        match (&inner.value, inner.updated) {
            (Some(value), Some(updated)) => {
                let value = value.clone();
                inner.first_read_done = true;
                let elapsed = updated.elapsed();
                match self.staleness {
                    Some(window) if elapsed > window => Some(Err(HeliosError::Outdated {
                        name: self.name.clone(),
                        elapsed,
                    })),
                    _ => Some(Ok(value)),
                }
            }
            _ if inner.first_read_done => Some(Err(HeliosError::NoInitialValue {
                name: self.name.clone(),
            })),
            _ => None,
        }
    }
}

/// Getter reading from a shared monitor
pub fn monitor_getter<T: Clone + Send + 'static>(monitor: Arc<Monitor<T>>) -> Getter<T> {
    getter(move || {
        let monitor = monitor.clone();
        async move { monitor.get().await }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_first_read_times_out_then_fails_fast() {
        let m: Monitor<f64> = Monitor::new("meter/power", Duration::from_secs(2), None);
        let start = Instant::now();
        let err = m.get().await.unwrap_err();
        assert!(matches!(err, HeliosError::NoInitialValue { .. }));
        assert!(start.elapsed() >= Duration::from_secs(2));

        let start = Instant::now();
        assert!(m.get().await.is_err());
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_read_wakes_on_value() {
        let m = Arc::new(Monitor::new("soc", Duration::from_secs(30), None));
        let writer = m.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(7)).await;
            writer.set(81i64);
        });
        assert_eq!(m.get().await.unwrap(), 81);
        assert!(m.age().is_some());
    }
}
