use super::{Config, Context, Provider};
use crate::error::{HeliosError, Result};
use crate::logging::StructuredLogger;
use crate::util::duration;
use crate::value::{Capabilities, Getter, Setter, parse_bool, setter};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

const DEFAULT_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Deserialize)]
struct Settings {
    set: Config,
    get: Config,
    #[serde(deserialize_with = "duration::deserialize")]
    timeout: Duration,
    #[serde(default, deserialize_with = "duration::option::deserialize")]
    interval: Option<Duration>,
}

/// Applies a value, then polls a paired getter until it reports whether
/// the device accepted it
pub struct WaitProvider {
    ctx: Context,
    set: Config,
    get: Config,
    timeout: Duration,
    interval: Duration,
}

impl WaitProvider {
    pub fn new(ctx: &Context, cfg: &Config) -> Result<Self> {
        let settings: Settings = ctx.decode(cfg)?;
        if settings.timeout.is_zero() {
            return Err(HeliosError::validation("timeout", "must be positive"));
        }
        Ok(Self {
            ctx: ctx.clone(),
            set: settings.set,
            get: settings.get,
            timeout: settings.timeout,
            interval: settings.interval.unwrap_or(DEFAULT_INTERVAL),
        })
    }

    async fn build<T: Send + 'static>(&self, inner: Setter<T>) -> Result<Setter<T>> {
        let response = self.ctx.child("get").string_getter(&self.get).await?;
        let timeout = self.timeout;
        let interval = self.interval;
        let logger = self.ctx.logger("wait");

        Ok(setter(move |value: T| {
            let inner = inner.clone();
            let response = response.clone();
            let logger = logger.clone();
            async move {
                tokio::time::timeout(timeout, async {
                    inner(value).await?;
                    await_response(&response, interval, &logger).await
                })
                .await
                .map_err(|_| HeliosError::timeout(format!("no response within {:?}", timeout)))?
            }
        }))
    }
}

/// Poll until the response parses as a bool; `false` rejects the value
async fn await_response(
    response: &Getter<String>,
    interval: Duration,
    logger: &StructuredLogger,
) -> Result<()> {
    loop {
        match response().await {
            Ok(raw) => match parse_bool(&raw) {
                Ok(true) => return Ok(()),
                Ok(false) => return Err(HeliosError::generic("rejected by device")),
                Err(_) => logger.trace(&format!("waiting, response '{}'", raw)),
            },
            Err(e) => logger.trace(&format!("waiting, response failed: {}", e)),
        }
        tokio::time::sleep(interval).await;
    }
}

#[async_trait]
impl Provider for WaitProvider {
    fn capabilities(&self) -> Capabilities {
        Capabilities::SETTERS
    }

    async fn float_setter(&self, param: &str) -> Result<Setter<f64>> {
        let inner = self.ctx.child("set").float_setter(&self.set, param).await?;
        self.build(inner).await
    }

    async fn int_setter(&self, param: &str) -> Result<Setter<i64>> {
        let inner = self.ctx.child("set").int_setter(&self.set, param).await?;
        self.build(inner).await
    }

    async fn string_setter(&self, param: &str) -> Result<Setter<String>> {
        let inner = self.ctx.child("set").string_setter(&self.set, param).await?;
        self.build(inner).await
    }

    async fn bool_setter(&self, param: &str) -> Result<Setter<bool>> {
        let inner = self.ctx.child("set").bool_setter(&self.set, param).await?;
        self.build(inner).await
    }
}
