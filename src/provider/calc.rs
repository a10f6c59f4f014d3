use super::{Config, Context, Provider};
use crate::error::{HeliosError, Result};
use crate::value::{Capabilities, Capability, Getter, getter, round_int};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;

#[derive(Deserialize, Default)]
#[serde(default)]
struct Settings {
    add: Vec<Config>,
    mul: Vec<Config>,
}

#[derive(Clone, Copy)]
enum Op {
    Add,
    Mul,
}

/// Sum or product of nested float getters
pub struct CalcProvider {
    ctx: Context,
    op: Op,
    members: Vec<Config>,
}

impl CalcProvider {
    pub fn new(ctx: &Context, cfg: &Config) -> Result<Self> {
        let settings: Settings = ctx.decode(cfg)?;
        let (op, members) = match (settings.add.is_empty(), settings.mul.is_empty()) {
            (false, true) => (Op::Add, settings.add),
            (true, false) => (Op::Mul, settings.mul),
            (true, true) => return Err(HeliosError::config("calc needs add or mul")),
            (false, false) => return Err(HeliosError::config("calc can only add or mul")),
        };
        Ok(Self {
            ctx: ctx.clone(),
            op,
            members,
        })
    }

    async fn members(&self) -> Result<Vec<Getter<f64>>> {
        let segment = match self.op {
            Op::Add => "add",
            Op::Mul => "mul",
        };
        let mut getters = Vec::with_capacity(self.members.len());
        for (i, cfg) in self.members.iter().enumerate() {
            let ctx = self.ctx.child(segment).child(&format!("[{}]", i));
            getters.push(ctx.float_getter(cfg).await?);
        }
        Ok(getters)
    }
}

#[async_trait]
impl Provider for CalcProvider {
    fn capabilities(&self) -> Capabilities {
        Capabilities::NONE
            .with(Capability::FloatGetter)
            .with(Capability::IntGetter)
    }

    async fn float_getter(&self) -> Result<Getter<f64>> {
        let members = Arc::new(self.members().await?);
        let op = self.op;
        Ok(getter(move || {
            let members = members.clone();
            async move {
                let mut acc = match op {
                    Op::Add => 0.0,
                    Op::Mul => 1.0,
                };
                for g in members.iter() {
                    let v = g().await?;
                    match op {
                        Op::Add => acc += v,
                        Op::Mul => acc *= v,
                    }
                }
                Ok(acc)
            }
        }))
    }

    async fn int_getter(&self) -> Result<Getter<i64>> {
        let g = self.float_getter().await?;
        Ok(getter(move || {
            let g = g.clone();
            async move { g().await.map(round_int) }
        }))
    }
}
