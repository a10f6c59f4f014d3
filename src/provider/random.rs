use super::{Config, Context, Provider};
use crate::error::Result;
use crate::value::{Capabilities, Capability, Setter, setter};
use async_trait::async_trait;
use rand::Rng;
use serde::Deserialize;

#[derive(Deserialize)]
struct Settings {
    set: Config,
}

/// Forwards a fresh positive random int instead of the set value
pub struct RandomProvider {
    ctx: Context,
    set: Config,
}

impl RandomProvider {
    pub fn new(ctx: &Context, cfg: &Config) -> Result<Self> {
        let settings: Settings = ctx.decode(cfg)?;
        Ok(Self {
            ctx: ctx.clone(),
            set: settings.set,
        })
    }
}

#[async_trait]
impl Provider for RandomProvider {
    fn capabilities(&self) -> Capabilities {
        Capabilities::NONE.with(Capability::IntSetter)
    }

    async fn int_setter(&self, param: &str) -> Result<Setter<i64>> {
        let inner = self.ctx.child("set").int_setter(&self.set, param).await?;
        Ok(setter(move |_ignored: i64| {
            let inner = inner.clone();
            let value = rand::thread_rng().gen_range(1..i64::MAX);
            async move { inner(value).await }
        }))
    }
}
