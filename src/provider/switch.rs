use super::{Config, Context, Provider};
use crate::error::{HeliosError, Result};
use crate::value::{Capabilities, Capability, Setter, setter};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;

#[derive(Deserialize)]
struct Case {
    case: i64,
    set: Config,
}

#[derive(Deserialize)]
struct Settings {
    switch: Vec<Case>,
    #[serde(default)]
    default: Option<Config>,
}

/// Dispatches an int to the setter registered for its value
pub struct SwitchProvider {
    ctx: Context,
    cases: Vec<Case>,
    default: Option<Config>,
}

impl SwitchProvider {
    pub fn new(ctx: &Context, cfg: &Config) -> Result<Self> {
        let settings: Settings = ctx.decode(cfg)?;
        for (i, case) in settings.switch.iter().enumerate() {
            if settings.switch[..i].iter().any(|c| c.case == case.case) {
                return Err(HeliosError::config(format!("duplicate case: {}", case.case)));
            }
        }
        Ok(Self {
            ctx: ctx.clone(),
            cases: settings.switch,
            default: settings.default,
        })
    }
}

#[async_trait]
impl Provider for SwitchProvider {
    fn capabilities(&self) -> Capabilities {
        Capabilities::NONE.with(Capability::IntSetter)
    }

    async fn int_setter(&self, param: &str) -> Result<Setter<i64>> {
        let mut cases = Vec::with_capacity(self.cases.len());
        for (i, case) in self.cases.iter().enumerate() {
            let ctx = self.ctx.child("switch").child(&format!("[{}]", i));
            cases.push((case.case, ctx.int_setter(&case.set, param).await?));
        }
        let default = match &self.default {
            Some(cfg) => Some(self.ctx.child("default").int_setter(cfg, param).await?),
            None => None,
        };

        let cases = Arc::new(cases);
        Ok(setter(move |value: i64| {
            let cases = cases.clone();
            let default = default.clone();
            async move {
                if let Some((_, set)) = cases.iter().find(|(case, _)| *case == value) {
                    return set(value).await;
                }
                match default {
                    Some(set) => set(value).await,
                    None => Err(HeliosError::not_found(value.to_string())),
                }
            }
        }))
    }
}
