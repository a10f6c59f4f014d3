use super::{Config, Context, Provider};
use crate::error::{HeliosError, Result};
use crate::value::{Capabilities, Capability, Setter, setter};
use async_trait::async_trait;
use serde::Deserialize;

#[derive(Deserialize)]
struct Settings {
    convert: String,
    set: Config,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    FloatToInt,
    IntToFloat,
}

/// Adapts a float setter onto an int setter or the reverse
pub struct ConvertProvider {
    ctx: Context,
    direction: Direction,
    set: Config,
}

impl ConvertProvider {
    pub fn new(ctx: &Context, cfg: &Config) -> Result<Self> {
        let settings: Settings = ctx.decode(cfg)?;
        let direction = match settings.convert.to_lowercase().as_str() {
            "float2int" => Direction::FloatToInt,
            "int2float" => Direction::IntToFloat,
            other => {
                return Err(HeliosError::config(format!("invalid conversion: {}", other)));
            }
        };
        Ok(Self {
            ctx: ctx.clone(),
            direction,
            set: settings.set,
        })
    }
}

#[async_trait]
impl Provider for ConvertProvider {
    fn capabilities(&self) -> Capabilities {
        match self.direction {
            Direction::FloatToInt => Capabilities::NONE.with(Capability::FloatSetter),
            Direction::IntToFloat => Capabilities::NONE.with(Capability::IntSetter),
        }
    }

    async fn float_setter(&self, param: &str) -> Result<Setter<f64>> {
        let inner = self.ctx.child("set").int_setter(&self.set, param).await?;
        Ok(setter(move |value: f64| {
            let inner = inner.clone();
            async move { inner(value.trunc() as i64).await }
        }))
    }

    async fn int_setter(&self, param: &str) -> Result<Setter<i64>> {
        let inner = self.ctx.child("set").float_setter(&self.set, param).await?;
        Ok(setter(move |value: i64| {
            let inner = inner.clone();
            async move { inner(value as f64).await }
        }))
    }
}
