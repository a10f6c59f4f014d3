use super::{Config, Context, Provider};
use crate::error::{HeliosError, Result};
use crate::value::{Capabilities, Capability, Getter, Setter, getter, setter};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Deserialize)]
struct Settings {
    values: BTreeMap<i64, i64>,
    #[serde(default)]
    set: Option<Config>,
    #[serde(default)]
    get: Option<Config>,
}

/// Translates ints through a fixed table
///
/// The setter maps the incoming value before forwarding it to `set`; the
/// getter reads `get` and maps its value the same way.
pub struct MapProvider {
    ctx: Context,
    values: Arc<BTreeMap<i64, i64>>,
    set: Option<Config>,
    get: Option<Config>,
}

impl MapProvider {
    pub fn new(ctx: &Context, cfg: &Config) -> Result<Self> {
        let settings: Settings = ctx.decode(cfg)?;
        if settings.values.is_empty() {
            return Err(HeliosError::config("map needs values"));
        }
        if settings.set.is_none() && settings.get.is_none() {
            return Err(HeliosError::config("map needs set or get"));
        }
        Ok(Self {
            ctx: ctx.clone(),
            values: Arc::new(settings.values),
            set: settings.set,
            get: settings.get,
        })
    }
}

fn lookup(values: &BTreeMap<i64, i64>, key: i64) -> Result<i64> {
    values
        .get(&key)
        .copied()
        .ok_or_else(|| HeliosError::not_found(key.to_string()))
}

#[async_trait]
impl Provider for MapProvider {
    fn capabilities(&self) -> Capabilities {
        let mut caps = Capabilities::NONE;
        if self.set.is_some() {
            caps = caps.with(Capability::IntSetter);
        }
        if self.get.is_some() {
            caps = caps.with(Capability::IntGetter);
        }
        caps
    }

    async fn int_setter(&self, param: &str) -> Result<Setter<i64>> {
        let cfg = self
            .set
            .as_ref()
            .ok_or_else(|| HeliosError::config("map has no set"))?;
        let inner = self.ctx.child("set").int_setter(cfg, param).await?;
        let values = self.values.clone();
        Ok(setter(move |value: i64| {
            let inner = inner.clone();
            let mapped = lookup(&values, value);
            async move { inner(mapped?).await }
        }))
    }

    async fn int_getter(&self) -> Result<Getter<i64>> {
        let cfg = self
            .get
            .as_ref()
            .ok_or_else(|| HeliosError::config("map has no get"))?;
        let inner = self.ctx.child("get").int_getter(cfg).await?;
        let values = self.values.clone();
        Ok(getter(move || {
            let inner = inner.clone();
            let values = values.clone();
            async move { lookup(&values, inner().await?) }
        }))
    }
}
