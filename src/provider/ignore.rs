use super::{Config, Context, Provider};
use crate::error::{HeliosError, Result};
use crate::logging::StructuredLogger;
use crate::value::{Capabilities, Getter, Setter, getter, setter};
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::sync::Arc;

#[derive(Deserialize, Default)]
#[serde(default)]
struct Settings {
    get: Option<Config>,
    set: Option<Config>,
    error: Option<String>,
    errors: Vec<String>,
}

struct Matcher {
    prefix: Option<String>,
    patterns: Vec<Regex>,
    logger: StructuredLogger,
}

impl Matcher {
    /// Prefix and patterns see the bare message, without the error category
    fn matches(&self, err: &HeliosError) -> bool {
        let message = err.message();
        self.prefix
            .as_deref()
            .is_some_and(|p| message.starts_with(p))
            || self.patterns.iter().any(|re| re.is_match(&message))
    }

    /// Swallow matching errors
    fn filter<T>(&self, result: Result<T>, zero: T) -> Result<T> {
        match result {
            Err(e) if self.matches(&e) => {
                self.logger.warn(&format!("ignoring error: {}", e));
                Ok(zero)
            }
            other => other,
        }
    }
}

/// Turns matching getter and setter errors into success
pub struct IgnoreProvider {
    ctx: Context,
    get: Option<Config>,
    set: Option<Config>,
    matcher: Arc<Matcher>,
}

impl IgnoreProvider {
    pub fn new(ctx: &Context, cfg: &Config) -> Result<Self> {
        let settings: Settings = ctx.decode(cfg)?;
        let prefix = settings.error.filter(|e| !e.is_empty());
        if prefix.is_none() && settings.errors.is_empty() {
            return Err(HeliosError::config("ignore needs error or errors"));
        }
        if settings.get.is_none() && settings.set.is_none() {
            return Err(HeliosError::config("ignore needs get or set"));
        }
        let patterns = settings
            .errors
            .iter()
            .map(|p| Regex::new(p))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(Self {
            ctx: ctx.clone(),
            get: settings.get,
            set: settings.set,
            matcher: Arc::new(Matcher {
                prefix,
                patterns,
                logger: ctx.logger("ignore"),
            }),
        })
    }

    fn get_config(&self) -> Result<(&Config, Context)> {
        self.get
            .as_ref()
            .map(|cfg| (cfg, self.ctx.child("get")))
            .ok_or_else(|| HeliosError::config("ignore has no get"))
    }

    fn set_config(&self) -> Result<(&Config, Context)> {
        self.set
            .as_ref()
            .map(|cfg| (cfg, self.ctx.child("set")))
            .ok_or_else(|| HeliosError::config("ignore has no set"))
    }
}

fn guard_getter<T: Default + Send + 'static>(g: Getter<T>, matcher: Arc<Matcher>) -> Getter<T> {
    getter(move || {
        let g = g.clone();
        let matcher = matcher.clone();
        async move { matcher.filter(g().await, T::default()) }
    })
}

fn guard_setter<T: Send + 'static>(s: Setter<T>, matcher: Arc<Matcher>) -> Setter<T> {
    setter(move |value: T| {
        let s = s.clone();
        let matcher = matcher.clone();
        async move { matcher.filter(s(value).await, ()) }
    })
}

#[async_trait]
impl Provider for IgnoreProvider {
    fn capabilities(&self) -> Capabilities {
        let mut caps = Capabilities::NONE;
        if self.get.is_some() {
            caps = caps.union(Capabilities::GETTERS);
        }
        if self.set.is_some() {
            caps = caps.union(Capabilities::SETTERS);
        }
        caps
    }

    async fn float_getter(&self) -> Result<Getter<f64>> {
        let (cfg, ctx) = self.get_config()?;
        Ok(guard_getter(ctx.float_getter(cfg).await?, self.matcher.clone()))
    }

    async fn int_getter(&self) -> Result<Getter<i64>> {
        let (cfg, ctx) = self.get_config()?;
        Ok(guard_getter(ctx.int_getter(cfg).await?, self.matcher.clone()))
    }

    async fn string_getter(&self) -> Result<Getter<String>> {
        let (cfg, ctx) = self.get_config()?;
        Ok(guard_getter(ctx.string_getter(cfg).await?, self.matcher.clone()))
    }

    async fn bool_getter(&self) -> Result<Getter<bool>> {
        let (cfg, ctx) = self.get_config()?;
        Ok(guard_getter(ctx.bool_getter(cfg).await?, self.matcher.clone()))
    }

    async fn float_setter(&self, param: &str) -> Result<Setter<f64>> {
        let (cfg, ctx) = self.set_config()?;
        Ok(guard_setter(ctx.float_setter(cfg, param).await?, self.matcher.clone()))
    }

    async fn int_setter(&self, param: &str) -> Result<Setter<i64>> {
        let (cfg, ctx) = self.set_config()?;
        Ok(guard_setter(ctx.int_setter(cfg, param).await?, self.matcher.clone()))
    }

    async fn string_setter(&self, param: &str) -> Result<Setter<String>> {
        let (cfg, ctx) = self.set_config()?;
        Ok(guard_setter(ctx.string_setter(cfg, param).await?, self.matcher.clone()))
    }

    async fn bool_setter(&self, param: &str) -> Result<Setter<bool>> {
        let (cfg, ctx) = self.set_config()?;
        Ok(guard_setter(ctx.bool_setter(cfg, param).await?, self.matcher.clone()))
    }
}
