use super::{Config, Context, Provider, scalar_string};
use crate::error::{HeliosError, Result};
use crate::logging::StructuredLogger;
use crate::value::{Capabilities, Getter, getter, parse_bool, parse_float, parse_int};
use async_trait::async_trait;
use serde::Deserialize;

#[derive(Deserialize)]
struct Settings {
    get: Config,
    value: serde_yaml::Value,
    #[serde(default)]
    mode: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// literal replaces failed reads
    Error,
    /// literal replaces a getter that cannot be built
    Initial,
}

/// Replaces failures of a nested getter with a literal value
pub struct FallbackProvider {
    ctx: Context,
    get: Config,
    value: String,
    mode: Mode,
    logger: StructuredLogger,
}

impl FallbackProvider {
    pub fn new(ctx: &Context, cfg: &Config) -> Result<Self> {
        let settings: Settings = ctx.decode(cfg)?;
        let mode = match settings.mode.as_deref().map(str::to_lowercase).as_deref() {
            None | Some("") | Some("error") => Mode::Error,
            Some("initial") => Mode::Initial,
            Some(other) => {
                return Err(HeliosError::config(format!("invalid fallback mode: {}", other)));
            }
        };
        Ok(Self {
            ctx: ctx.clone(),
            get: settings.get,
            value: scalar_string(&settings.value)?,
            mode,
            logger: ctx.logger("fallback"),
        })
    }

    fn finish<T: Clone + Send + Sync + 'static>(
        &self,
        inner: Result<Getter<T>>,
        literal: T,
    ) -> Result<Getter<T>> {
        match (self.mode, inner) {
            (Mode::Error, Ok(g)) => {
                let logger = self.logger.clone();
                Ok(getter(move || {
                    let g = g.clone();
                    let literal = literal.clone();
                    let logger = logger.clone();
                    async move {
                        match g().await {
                            Ok(v) => Ok(v),
                            Err(e) => {
                                logger.warn(&format!("using fallback value: {}", e));
                                Ok(literal)
                            }
                        }
                    }
                }))
            }
            (Mode::Error, Err(e)) => Err(e),
            (Mode::Initial, Ok(g)) => Ok(g),
            (Mode::Initial, Err(e)) => {
                self.logger
                    .warn(&format!("using fallback value, getter unavailable: {}", e));
                Ok(getter(move || {
                    let literal = literal.clone();
                    async move { Ok(literal) }
                }))
            }
        }
    }
}

#[async_trait]
impl Provider for FallbackProvider {
    fn capabilities(&self) -> Capabilities {
        Capabilities::GETTERS
    }

    async fn float_getter(&self) -> Result<Getter<f64>> {
        let literal = parse_float(&self.value, 1.0)?;
        let inner = self.ctx.child("get").float_getter(&self.get).await;
        self.finish(inner, literal)
    }

    async fn int_getter(&self) -> Result<Getter<i64>> {
        let literal = parse_int(&self.value, 1.0)?;
        let inner = self.ctx.child("get").int_getter(&self.get).await;
        self.finish(inner, literal)
    }

    async fn string_getter(&self) -> Result<Getter<String>> {
        let literal = self.value.clone();
        let inner = self.ctx.child("get").string_getter(&self.get).await;
        self.finish(inner, literal)
    }

    async fn bool_getter(&self) -> Result<Getter<bool>> {
        let literal = parse_bool(&self.value)?;
        let inner = self.ctx.child("get").bool_getter(&self.get).await;
        self.finish(inner, literal)
    }
}
