use super::{Config, Context, Provider, scalar_string};
use crate::error::{HeliosError, Result};
use crate::logging::StructuredLogger;
use crate::util::duration;
use crate::value::{Capabilities, Capability, Setter, parse_bool, parse_float, parse_int, setter};
use async_trait::async_trait;
use serde::Deserialize;
use std::fmt::Debug;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{Instant, interval_at, sleep};
use tokio_util::sync::CancellationToken;

const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(3);

#[derive(Deserialize)]
struct Settings {
    set: Config,
    #[serde(deserialize_with = "duration::deserialize")]
    timeout: Duration,
    #[serde(default)]
    reset: Vec<serde_yaml::Value>,
    #[serde(default)]
    initial: Option<serde_yaml::Value>,
    #[serde(default, rename = "defer")]
    deferred: bool,
    #[serde(default, deserialize_with = "duration::option::deserialize")]
    graceperiod: Option<Duration>,
}

/// Re-applies the last value every `timeout / 2` until a new value or a
/// reset value is set
///
/// With `defer`, a non-reset value arriving less than `timeout +
/// graceperiod` after the last write is held back until that much time
/// has passed; a newer value replaces the pending one.
pub struct WatchdogProvider {
    ctx: Context,
    set: Config,
    timeout: Duration,
    reset: Vec<String>,
    initial: Option<String>,
    deferred: bool,
    grace: Duration,
}

impl WatchdogProvider {
    pub fn new(ctx: &Context, cfg: &Config) -> Result<Self> {
        let settings: Settings = ctx.decode(cfg)?;
        if settings.timeout.is_zero() {
            return Err(HeliosError::validation("timeout", "must be positive"));
        }
        let reset = settings
            .reset
            .iter()
            .map(scalar_string)
            .collect::<Result<Vec<_>>>()?;
        let initial = settings.initial.as_ref().map(scalar_string).transpose()?;

        Ok(Self {
            ctx: ctx.clone(),
            set: settings.set,
            timeout: settings.timeout,
            reset,
            initial,
            deferred: settings.deferred,
            grace: settings.graceperiod.unwrap_or(DEFAULT_GRACE_PERIOD),
        })
    }

    async fn build<T, P>(&self, inner: Setter<T>, parse: P) -> Result<Setter<T>>
    where
        T: PartialEq + Clone + Debug + Send + Sync + 'static,
        P: Fn(&str) -> Result<T>,
    {
        let reset = self
            .reset
            .iter()
            .map(|r| parse(r))
            .collect::<Result<Vec<T>>>()?;
        let watchdog = Arc::new(Watchdog {
            cancel: self.ctx.cancellation(),
            inner,
            timeout: self.timeout,
            grace: self.grace,
            deferred: self.deferred,
            reset,
            state: Mutex::new(State::default()),
            logger: self.ctx.logger("watchdog"),
        });

        if let Some(initial) = &self.initial {
            watchdog.set(parse(initial)?).await?;
        }

        Ok(setter(move |value: T| {
            let watchdog = watchdog.clone();
            async move { watchdog.set(value).await }
        }))
    }
}

#[derive(Default)]
struct State {
    ticker: Option<CancellationToken>,
    pending: Option<CancellationToken>,
    updated: Option<Instant>,
}

impl State {
    fn stop_ticker(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.cancel();
        }
    }
}

/// Every write to `inner`, user or ticker, happens under the state lock
struct Watchdog<T> {
    cancel: CancellationToken,
    inner: Setter<T>,
    timeout: Duration,
    grace: Duration,
    deferred: bool,
    reset: Vec<T>,
    state: Mutex<State>,
    logger: StructuredLogger,
}

impl<T: PartialEq + Clone + Debug + Send + Sync + 'static> Watchdog<T> {
    async fn set(self: &Arc<Self>, value: T) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(pending) = state.pending.take() {
            pending.cancel();
        }
        let is_reset = self.reset.contains(&value);

        if self.deferred
            && !is_reset
            && let Some(updated) = state.updated
        {
            let delay = (self.timeout + self.grace).saturating_sub(updated.elapsed());
            if !delay.is_zero() {
                state.stop_ticker();
                self.logger
                    .debug(&format!("deferring update to {:?} by {:?}", value, delay));
                state.pending = Some(self.defer(value, delay));
                return Ok(());
            }
        }

        state.stop_ticker();
        if is_reset {
            self.logger.debug("reset value set, watchdog stopped");
        } else {
            state.ticker = Some(self.tick(value.clone()));
        }

        (self.inner)(value).await?;
        state.updated = Some(Instant::now());
        Ok(())
    }

    /// Apply `value` after `delay` unless cancelled first
    fn defer(self: &Arc<Self>, value: T, delay: Duration) -> CancellationToken {
        let token = self.cancel.child_token();
        let stop = token.clone();
        let weak = Arc::downgrade(self);

        tokio::spawn(async move {
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = sleep(delay) => {}
            }
            let Some(watchdog) = weak.upgrade() else {
                return;
            };
            let mut state = watchdog.state.lock().await;
            if stop.is_cancelled() {
                return;
            }
            state.pending = None;

            watchdog
                .logger
                .debug(&format!("deferred update executing: {:?}", value));
            if let Err(e) = (watchdog.inner)(value.clone()).await {
                watchdog
                    .logger
                    .error(&format!("deferred update failed: {}", e));
                return;
            }
            state.updated = Some(Instant::now());
            state.ticker = Some(watchdog.tick(value));
        });

        token
    }

    /// Start re-applying `value`; the ticker only stops between writes
    fn tick(self: &Arc<Self>, value: T) -> CancellationToken {
        let token = self.cancel.child_token();
        let stop = token.clone();
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.timeout / 2;

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(watchdog) = weak.upgrade() else {
                    break;
                };
                let mut state = watchdog.state.lock().await;
                if stop.is_cancelled() {
                    break;
                }
                match (watchdog.inner)(value.clone()).await {
                    Ok(()) => state.updated = Some(Instant::now()),
                    Err(e) => watchdog
                        .logger
                        .error(&format!("watchdog update failed: {}", e)),
                }
            }
        });

        token
    }
}

impl<T> Drop for Watchdog<T> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        state.stop_ticker();
        if let Some(pending) = state.pending.take() {
            pending.cancel();
        }
    }
}

#[async_trait]
impl Provider for WatchdogProvider {
    fn capabilities(&self) -> Capabilities {
        Capabilities::NONE
            .with(Capability::FloatSetter)
            .with(Capability::IntSetter)
            .with(Capability::BoolSetter)
    }

    async fn float_setter(&self, param: &str) -> Result<Setter<f64>> {
        let inner = self.ctx.child("set").float_setter(&self.set, param).await?;
        self.build(inner, |s| parse_float(s, 1.0)).await
    }

    async fn int_setter(&self, param: &str) -> Result<Setter<i64>> {
        let inner = self.ctx.child("set").int_setter(&self.set, param).await?;
        self.build(inner, |s| parse_int(s, 1.0)).await
    }

    async fn bool_setter(&self, param: &str) -> Result<Setter<bool>> {
        if self.reset.len() > 1 {
            return Err(HeliosError::validation("reset", "bool setters allow at most one reset value"));
        }
        let inner = self.ctx.child("set").bool_setter(&self.set, param).await?;
        self.build(inner, parse_bool).await
    }
}
