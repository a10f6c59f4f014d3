use super::{Config, Context, Provider, scalar_string};
use crate::error::Result;
use crate::value::{Capabilities, Getter, getter, parse_bool, parse_float, parse_int};
use async_trait::async_trait;
use serde::Deserialize;

#[derive(Deserialize)]
struct Settings {
    value: serde_yaml::Value,
    #[serde(default = "default_scale")]
    scale: f64,
}

fn default_scale() -> f64 {
    1.0
}

/// Literal value, coerced when a getter is requested
pub struct ConstProvider {
    value: String,
    scale: f64,
}

impl ConstProvider {
    pub fn new(ctx: &Context, cfg: &Config) -> Result<Self> {
        let settings: Settings = ctx.decode(cfg)?;
        Ok(Self {
            value: scalar_string(&settings.value)?,
            scale: settings.scale,
        })
    }
}

#[async_trait]
impl Provider for ConstProvider {
    fn capabilities(&self) -> Capabilities {
        Capabilities::GETTERS
    }

    async fn float_getter(&self) -> Result<Getter<f64>> {
        let v = parse_float(&self.value, self.scale)?;
        Ok(getter(move || async move { Ok(v) }))
    }

    async fn int_getter(&self) -> Result<Getter<i64>> {
        let v = parse_int(&self.value, self.scale)?;
        Ok(getter(move || async move { Ok(v) }))
    }

    async fn string_getter(&self) -> Result<Getter<String>> {
        let v = self.value.clone();
        Ok(getter(move || {
            let v = v.clone();
            async move { Ok(v) }
        }))
    }

    async fn bool_getter(&self) -> Result<Getter<bool>> {
        let v = parse_bool(&self.value)?;
        Ok(getter(move || async move { Ok(v) }))
    }
}
