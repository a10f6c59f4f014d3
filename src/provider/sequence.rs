use super::{Config, Context, Provider};
use crate::error::{HeliosError, Result};
use crate::value::{Capabilities, Setter, setter};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;

#[derive(Deserialize)]
struct Settings {
    set: Vec<Config>,
}

/// Applies every nested setter in order, stopping at the first failure
pub struct SequenceProvider {
    ctx: Context,
    set: Vec<Config>,
}

impl SequenceProvider {
    pub fn new(ctx: &Context, cfg: &Config) -> Result<Self> {
        let settings: Settings = ctx.decode(cfg)?;
        if settings.set.is_empty() {
            return Err(HeliosError::config("sequence needs at least one set"));
        }
        Ok(Self {
            ctx: ctx.clone(),
            set: settings.set,
        })
    }

    fn member(&self, i: usize) -> Context {
        self.ctx.child("set").child(&format!("[{}]", i))
    }
}

fn chain<T: Clone + Send + 'static>(setters: Vec<Setter<T>>) -> Setter<T> {
    let setters = Arc::new(setters);
    setter(move |value: T| {
        let setters = setters.clone();
        async move {
            for s in setters.iter() {
                s(value.clone()).await?;
            }
            Ok(())
        }
    })
}

#[async_trait]
impl Provider for SequenceProvider {
    fn capabilities(&self) -> Capabilities {
        Capabilities::SETTERS
    }

    async fn float_setter(&self, param: &str) -> Result<Setter<f64>> {
        let mut setters = Vec::with_capacity(self.set.len());
        for (i, cfg) in self.set.iter().enumerate() {
            setters.push(self.member(i).float_setter(cfg, param).await?);
        }
        Ok(chain(setters))
    }

    async fn int_setter(&self, param: &str) -> Result<Setter<i64>> {
        let mut setters = Vec::with_capacity(self.set.len());
        for (i, cfg) in self.set.iter().enumerate() {
            setters.push(self.member(i).int_setter(cfg, param).await?);
        }
        Ok(chain(setters))
    }

    async fn string_setter(&self, param: &str) -> Result<Setter<String>> {
        let mut setters = Vec::with_capacity(self.set.len());
        for (i, cfg) in self.set.iter().enumerate() {
            setters.push(self.member(i).string_setter(cfg, param).await?);
        }
        Ok(chain(setters))
    }

    async fn bool_setter(&self, param: &str) -> Result<Setter<bool>> {
        let mut setters = Vec::with_capacity(self.set.len());
        for (i, cfg) in self.set.iter().enumerate() {
            setters.push(self.member(i).bool_setter(cfg, param).await?);
        }
        Ok(chain(setters))
    }
}
