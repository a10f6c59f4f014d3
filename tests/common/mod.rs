#![allow(dead_code)]

use async_trait::async_trait;
use helios::error::{HeliosError, Result};
use helios::provider::{Config, Context, Provider, bootstrap, factory};
use helios::value::{Capabilities, Capability, Getter, Setter, getter, setter};
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

/// Values written to recorder providers, as `name=value`
pub type Log = Arc<Mutex<Vec<String>>>;

#[derive(Deserialize)]
struct Settings {
    #[serde(default)]
    name: String,
    #[serde(default)]
    fail: Option<String>,
    #[serde(default, deserialize_with = "helios::util::duration::option::deserialize")]
    delay: Option<Duration>,
}

/// Test provider recording every write; `fail` makes every call error and
/// `delay` makes writes take that long
struct Recorder {
    log: Log,
    name: String,
    fail: Option<String>,
    delay: Option<Duration>,
}

impl Recorder {
    fn record<T: ToString + Send + 'static>(&self) -> Setter<T> {
        let log = self.log.clone();
        let name = self.name.clone();
        let fail = self.fail.clone();
        let delay = self.delay;
        setter(move |value: T| {
            let entry = format!("{}={}", name, value.to_string());
            let log = log.clone();
            let fail = fail.clone();
            async move {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                match fail {
                    Some(msg) => Err(HeliosError::generic(msg)),
                    None => {
                        log.lock().push(entry);
                        Ok(())
                    }
                }
            }
        })
    }
}

#[async_trait]
impl Provider for Recorder {
    fn capabilities(&self) -> Capabilities {
        Capabilities::SETTERS.with(Capability::StringGetter)
    }

    async fn string_getter(&self) -> Result<Getter<String>> {
        let fail = self.fail.clone();
        let log = self.log.clone();
        Ok(getter(move || {
            let result = match &fail {
                Some(msg) => Err(HeliosError::generic(msg.clone())),
                None => Ok(log.lock().len().to_string()),
            };
            async move { result }
        }))
    }

    async fn float_setter(&self, _param: &str) -> Result<Setter<f64>> {
        Ok(self.record())
    }

    async fn int_setter(&self, _param: &str) -> Result<Setter<i64>> {
        Ok(self.record())
    }

    async fn string_setter(&self, _param: &str) -> Result<Setter<String>> {
        Ok(self.record())
    }

    async fn bool_setter(&self, _param: &str) -> Result<Setter<bool>> {
        Ok(self.record())
    }
}

/// Context whose registry also knows the `recorder` type
pub fn recording_context() -> (Context, Log) {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let mut registry = bootstrap().unwrap();
    let shared = log.clone();
    registry
        .register(
            "recorder",
            factory(move |ctx: &Context, cfg: &Config| {
                let settings: Settings = ctx.decode(cfg)?;
                Ok(Recorder {
                    log: shared.clone(),
                    name: settings.name,
                    fail: settings.fail,
                    delay: settings.delay,
                })
            }),
        )
        .unwrap();
    (Context::new(registry).child("test"), log)
}

pub fn entries(log: &Log) -> Vec<String> {
    log.lock().clone()
}

pub fn yaml(raw: &str) -> Config {
    Config::from_yaml(raw).unwrap()
}
