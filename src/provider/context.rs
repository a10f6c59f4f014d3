use super::{Config, Provider, ProviderRegistry};
use crate::cache::Cache;
use crate::error::{HeliosError, Result};
use crate::logging::{LogContext, StructuredLogger, get_logger_with_context};
use crate::mqtt::BrokerConfig;
use crate::script::EngineRegistry;
use crate::util::parse_duration;
use crate::value::{Capability, Getter, Setter};
use serde::de::DeserializeOwned;
use serde_yaml::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Aborts its background task when dropped
#[derive(Debug)]
pub struct TaskGuard(JoinHandle<()>);

impl TaskGuard {
    pub fn is_finished(&self) -> bool {
        self.0.is_finished()
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Everything a factory needs to build a provider
#[derive(Clone)]
pub struct Context {
    registry: Arc<ProviderRegistry>,
    engines: Arc<EngineRegistry>,
    mqtt: Option<BrokerConfig>,
    cancel: CancellationToken,
    path: String,
}

impl Context {
    pub fn new(registry: ProviderRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            engines: Arc::new(EngineRegistry::new()),
            mqtt: None,
            cancel: CancellationToken::new(),
            path: String::new(),
        }
    }

    /// Default broker for MQTT providers that do not name one
    pub fn with_mqtt(mut self, broker: BrokerConfig) -> Self {
        self.mqtt = Some(broker).filter(|b| !b.is_empty());
        self
    }

    pub fn with_engines(mut self, engines: Arc<EngineRegistry>) -> Self {
        self.engines = engines;
        self
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn engines(&self) -> &EngineRegistry {
        &self.engines
    }

    pub fn mqtt(&self) -> Option<&BrokerConfig> {
        self.mqtt.as_ref()
    }

    /// Configuration path used in error messages
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Context for a nested configuration; index segments like `[1]`
    /// attach without a separator
    pub fn child(&self, segment: &str) -> Context {
        let mut ctx = self.clone();
        ctx.path = if self.path.is_empty() {
            segment.to_string()
        } else if segment.starts_with('[') {
            format!("{}{}", self.path, segment)
        } else {
            format!("{}.{}", self.path, segment)
        };
        ctx
    }

    pub fn logger(&self, component: &str) -> StructuredLogger {
        get_logger_with_context(LogContext::new(component).with_path(&self.path))
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_disposed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop every background task spawned through this context or its children
    pub fn dispose(&self) {
        self.cancel.cancel();
    }

    /// Spawn a background task that ends on dispose or when the guard drops
    pub fn spawn<F>(&self, task: F) -> TaskGuard
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.cancel.clone();
        TaskGuard(tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = task => {}
            }
        }))
    }

    /// Decode provider settings, prefixing errors with the config path
    pub fn decode<T: DeserializeOwned>(&self, cfg: &Config) -> Result<T> {
        cfg.decode().map_err(|e| self.error(e))
    }

    /// Prefix an error with the config path
    pub fn error(&self, err: HeliosError) -> HeliosError {
        if self.path.is_empty() {
            return err;
        }
        match err {
            // nested paths already start with this one
            HeliosError::Config { message } if !message.starts_with(&self.path) => {
                HeliosError::config(format!("{}: {}", self.path, message))
            }
            other => other,
        }
    }

    /// Resolve and construct the provider named by `cfg.source`
    pub fn build(&self, cfg: &Config) -> Result<Box<dyn Provider>> {
        let factory = self.registry.lookup(&cfg.source).map_err(|e| self.error(e))?;
        factory(self, cfg).map_err(|e| self.error(e))
    }

    fn build_for(&self, cfg: &Config, capability: Capability) -> Result<Box<dyn Provider>> {
        let provider = self.build(cfg)?;
        if !provider.capabilities().contains(capability) {
            return Err(HeliosError::Capability {
                path: self.path.clone(),
                kind: cfg.source.to_lowercase(),
                capability,
            });
        }
        Ok(provider)
    }

    fn cache_settings(&self, cfg: &Config) -> Result<Option<(Duration, bool)>> {
        let ttl = match cfg.get("cache") {
            None | Some(Value::Null) => return Ok(None),
            Some(Value::Number(n)) => n
                .as_f64()
                .and_then(|s| Duration::try_from_secs_f64(s).ok())
                .ok_or_else(|| self.error(HeliosError::config("invalid cache duration")))?,
            Some(Value::String(s)) => parse_duration(s).map_err(|e| self.error(e))?,
            Some(other) => {
                return Err(self.error(HeliosError::config(format!(
                    "invalid cache duration: {:?}",
                    other
                ))));
            }
        };
        if ttl.is_zero() {
            return Ok(None);
        }
        let backoff = matches!(cfg.get("backoff"), Some(Value::Bool(true)));
        Ok(Some((ttl, backoff)))
    }

    fn decorate<T: Clone + Send + 'static>(
        &self,
        provider: &dyn Provider,
        cfg: &Config,
        g: Getter<T>,
    ) -> Result<Getter<T>> {
        if provider.caches_reads() {
            return Ok(g);
        }
        Ok(match self.cache_settings(cfg)? {
            Some((ttl, backoff)) => {
                let mut cache = Cache::new(g, ttl);
                if backoff {
                    cache = cache.with_backoff();
                }
                crate::cache::wrap(Arc::new(cache))
            }
            None => g,
        })
    }

    pub async fn float_getter(&self, cfg: &Config) -> Result<Getter<f64>> {
        let p = self.build_for(cfg, Capability::FloatGetter)?;
        let g = p.float_getter().await.map_err(|e| self.error(e))?;
        self.decorate(p.as_ref(), cfg, g)
    }

    pub async fn int_getter(&self, cfg: &Config) -> Result<Getter<i64>> {
        let p = self.build_for(cfg, Capability::IntGetter)?;
        let g = p.int_getter().await.map_err(|e| self.error(e))?;
        self.decorate(p.as_ref(), cfg, g)
    }

    pub async fn string_getter(&self, cfg: &Config) -> Result<Getter<String>> {
        let p = self.build_for(cfg, Capability::StringGetter)?;
        let g = p.string_getter().await.map_err(|e| self.error(e))?;
        self.decorate(p.as_ref(), cfg, g)
    }

    pub async fn bool_getter(&self, cfg: &Config) -> Result<Getter<bool>> {
        let p = self.build_for(cfg, Capability::BoolGetter)?;
        let g = p.bool_getter().await.map_err(|e| self.error(e))?;
        self.decorate(p.as_ref(), cfg, g)
    }

    pub async fn float_setter(&self, cfg: &Config, param: &str) -> Result<Setter<f64>> {
        let p = self.build_for(cfg, Capability::FloatSetter)?;
        p.float_setter(param).await.map_err(|e| self.error(e))
    }

    pub async fn int_setter(&self, cfg: &Config, param: &str) -> Result<Setter<i64>> {
        let p = self.build_for(cfg, Capability::IntSetter)?;
        p.int_setter(param).await.map_err(|e| self.error(e))
    }

    pub async fn string_setter(&self, cfg: &Config, param: &str) -> Result<Setter<String>> {
        let p = self.build_for(cfg, Capability::StringSetter)?;
        p.string_setter(param).await.map_err(|e| self.error(e))
    }

    pub async fn bool_setter(&self, cfg: &Config, param: &str) -> Result<Setter<bool>> {
        let p = self.build_for(cfg, Capability::BoolSetter)?;
        p.bool_setter(param).await.map_err(|e| self.error(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::bootstrap;

    fn context() -> Context {
        Context::new(bootstrap().unwrap()).child("meter")
    }

    #[test]
    fn test_child_paths() {
        let ctx = context();
        assert_eq!(ctx.child("power").path(), "meter.power");
        assert_eq!(ctx.child("set").child("[1]").path(), "meter.set[1]");
    }

    #[tokio::test]
    async fn test_unknown_type_names_path() {
        let ctx = context().child("power");
        let err = ctx.float_getter(&Config::new("nope")).await.err().unwrap();
        assert_eq!(
            err.to_string(),
            "Configuration error: meter.power: invalid provider type: nope"
        );
    }

    #[tokio::test]
    async fn test_missing_capability_is_construction_error() {
        let ctx = context().child("enable");
        let cfg = Config::new("random").with_config("set", Config::new("const").with("value", 1));
        let err = ctx.bool_getter(&cfg).await.err().unwrap();
        assert!(matches!(
            err,
            HeliosError::Capability {
                capability: Capability::BoolGetter,
                ..
            }
        ));
        assert_eq!(
            err.to_string(),
            "Configuration error: meter.enable: random does not provide bool getter"
        );
    }

    #[tokio::test]
    async fn test_spawned_tasks_end_on_dispose() {
        let ctx = context();
        let guard = ctx.spawn(std::future::pending());
        ctx.dispose();
        tokio::time::timeout(Duration::from_secs(1), async {
            while !guard.is_finished() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }
}
