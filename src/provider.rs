//! Configuration-driven value providers
//!
//! A provider [`Config`] names its type with `source` (alias `type`) and
//! carries transport specific settings. The [`Context`] resolves the type
//! through the provider registry, checks the requested capability and hands
//! back one typed getter or setter.

mod calc;
mod constant;
mod context;
mod convert;
mod eval;
mod exec;
mod fallback;
mod http;
mod ignore;
mod map;
mod modbus;
mod mqtt;
mod random;
mod sequence;
mod sunspec;
mod switch;
mod wait;
mod watchdog;
mod websocket;

pub use context::{Context, TaskGuard};

use crate::error::{HeliosError, Result};
use crate::registry::Registry;
use crate::value::{Capabilities, Capability, Getter, Setter};
use async_trait::async_trait;
use serde::de::{DeserializeOwned, Deserializer, Error as _};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::sync::Arc;

/// Declarative description of one provider instance
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Config {
    pub source: String,
    pub other: Mapping,
}

impl Config {
    pub fn new(source: &str) -> Self {
        Self {
            source: source.to_string(),
            other: Mapping::new(),
        }
    }

    /// Add a setting; the key is stored lowercase
    pub fn with<V: Into<Value>>(mut self, key: &str, value: V) -> Self {
        self.other
            .insert(Value::String(key.to_lowercase()), value.into());
        self
    }

    /// Add a nested provider configuration
    pub fn with_config(self, key: &str, config: Config) -> Self {
        let value = config.to_value();
        self.with(key, value)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Setting by case-insensitive key
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.other.get(key.to_lowercase().as_str())
    }

    /// Decode the settings into `T`; keys are matched case-insensitively
    /// and unknown keys are ignored
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        let value = lowercase_keys(Value::Mapping(self.other.clone()));
        serde_yaml::from_value(value).map_err(|e| HeliosError::config(e.to_string()))
    }

    pub fn to_value(&self) -> Value {
        let mut map = Mapping::new();
        map.insert(
            Value::String("source".to_string()),
            Value::String(self.source.clone()),
        );
        for (k, v) in &self.other {
            map.insert(k.clone(), v.clone());
        }
        Value::Mapping(map)
    }

    fn from_mapping(map: Mapping) -> std::result::Result<Self, String> {
        let mut other = Mapping::new();
        for (key, value) in map {
            let key = match key {
                Value::String(s) => Value::String(s.to_lowercase()),
                other => other,
            };
            other.insert(key, value);
        }

        // `type` is only the discriminator when `source` is absent
        let discriminator = if other.contains_key("source") {
            "source"
        } else {
            "type"
        };
        let source = match other.remove(discriminator) {
            Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
            Some(v) => return Err(format!("invalid provider source: {:?}", v)),
            None => return Err("missing provider source".to_string()),
        };

        Ok(Config { source, other })
    }
}

fn lowercase_keys(value: Value) -> Value {
    match value {
        Value::Mapping(map) => Value::Mapping(
            map.into_iter()
                .map(|(k, v)| {
                    let k = match k {
                        Value::String(s) => Value::String(s.to_lowercase()),
                        other => other,
                    };
                    (k, lowercase_keys(v))
                })
                .collect(),
        ),
        Value::Sequence(items) => Value::Sequence(items.into_iter().map(lowercase_keys).collect()),
        other => other,
    }
}

impl<'de> Deserialize<'de> for Config {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let map = Mapping::deserialize(deserializer)?;
        Config::from_mapping(map).map_err(D::Error::custom)
    }
}

impl Serialize for Config {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.other.len() + 1))?;
        map.serialize_entry("source", &self.source)?;
        for (k, v) in &self.other {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

/// Render a scalar setting as the string a transport would deliver
pub(crate) fn scalar_string(value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(HeliosError::config(format!(
            "expected a scalar value, got {:?}",
            other
        ))),
    }
}

fn unsupported(capability: Capability) -> HeliosError {
    HeliosError::generic(format!("{} not supported", capability))
}

/// A constructed provider
///
/// `capabilities` must list exactly the accessors that the provider can
/// build; the default accessor implementations fail.
#[async_trait]
pub trait Provider: Send + Sync {
    fn capabilities(&self) -> Capabilities;

    /// True when the getters already honor the `cache` and `backoff`
    /// settings, so the context must not wrap them again
    fn caches_reads(&self) -> bool {
        false
    }

    async fn float_getter(&self) -> Result<Getter<f64>> {
        Err(unsupported(Capability::FloatGetter))
    }

    async fn int_getter(&self) -> Result<Getter<i64>> {
        Err(unsupported(Capability::IntGetter))
    }

    async fn string_getter(&self) -> Result<Getter<String>> {
        Err(unsupported(Capability::StringGetter))
    }

    async fn bool_getter(&self) -> Result<Getter<bool>> {
        Err(unsupported(Capability::BoolGetter))
    }

    async fn float_setter(&self, _param: &str) -> Result<Setter<f64>> {
        Err(unsupported(Capability::FloatSetter))
    }

    async fn int_setter(&self, _param: &str) -> Result<Setter<i64>> {
        Err(unsupported(Capability::IntSetter))
    }

    async fn string_setter(&self, _param: &str) -> Result<Setter<String>> {
        Err(unsupported(Capability::StringSetter))
    }

    async fn bool_setter(&self, _param: &str) -> Result<Setter<bool>> {
        Err(unsupported(Capability::BoolSetter))
    }
}

/// Builds a provider from its configuration
pub type Factory = Arc<dyn Fn(&Context, &Config) -> Result<Box<dyn Provider>> + Send + Sync>;

pub type ProviderRegistry = Registry<Factory>;

/// Adapt a typed constructor into a [`Factory`]
pub fn factory<P, F>(new: F) -> Factory
where
    P: Provider + 'static,
    F: Fn(&Context, &Config) -> Result<P> + Send + Sync + 'static,
{
    Arc::new(move |ctx: &Context, cfg: &Config| -> Result<Box<dyn Provider>> {
        Ok(Box::new(new(ctx, cfg)?))
    })
}

/// Registry with every built-in provider type, registered in a fixed order
pub fn bootstrap() -> Result<ProviderRegistry> {
    let mut registry = ProviderRegistry::new("provider");

    registry.register("const", factory(constant::ConstProvider::new))?;
    registry.register("calc", factory(calc::CalcProvider::new))?;
    registry.register("sequence", factory(sequence::SequenceProvider::new))?;
    registry.register("switch", factory(switch::SwitchProvider::new))?;
    registry.register("map", factory(map::MapProvider::new))?;
    registry.register("convert", factory(convert::ConvertProvider::new))?;
    registry.register("fallback", factory(fallback::FallbackProvider::new))?;
    registry.register("ignore", factory(ignore::IgnoreProvider::new))?;
    registry.register("watchdog", factory(watchdog::WatchdogProvider::new))?;
    registry.register("random", factory(random::RandomProvider::new))?;
    registry.register("wait", factory(wait::WaitProvider::new))?;
    registry.register("mqtt", factory(mqtt::MqttProvider::new))?;
    registry.register("http", factory(http::HttpProvider::new))?;
    registry.register("websocket", factory(websocket::WebsocketProvider::new))?;
    registry.register("modbus", factory(modbus::ModbusProvider::new))?;
    registry.register("sunspec", factory(sunspec::SunspecProvider::new))?;
    registry.register("solarman", factory(modbus::ModbusProvider::solarman))?;
    registry.register("script", factory(exec::ScriptProvider::new))?;
    registry.register("eval", factory(eval::EvalProvider::new))?;

    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_source_and_alias() {
        let cfg = Config::from_yaml("Source: MQTT\nTopic: a/b\n").unwrap();
        assert_eq!(cfg.source, "MQTT");
        assert_eq!(cfg.get("topic").and_then(Value::as_str), Some("a/b"));

        let cfg = Config::from_yaml("type: const\nvalue: 1\n").unwrap();
        assert_eq!(cfg.source, "const");

        let cfg = Config::from_yaml("source: modbus\ntype: holding\n").unwrap();
        assert_eq!(cfg.source, "modbus");
        assert_eq!(cfg.get("type").and_then(Value::as_str), Some("holding"));

        assert!(Config::from_yaml("topic: a/b\n").is_err());
    }

    #[test]
    fn test_decode_matches_keys_case_insensitively() {
        #[derive(Deserialize)]
        struct Settings {
            topic: String,
            #[serde(default)]
            scale: Option<f64>,
        }
        let cfg = Config::from_yaml("source: x\nTOPIC: t\nScale: 2\nunknown: 1\n").unwrap();
        let s: Settings = cfg.decode().unwrap();
        assert_eq!(s.topic, "t");
        assert_eq!(s.scale, Some(2.0));

        let missing = Config::new("x").decode::<Settings>();
        assert!(missing.is_err());
    }

    #[test]
    fn test_serialize_round_trip() {
        let cfg = Config::new("http")
            .with("uri", "http://localhost")
            .with_config("get", Config::new("const").with("value", 1));
        let yaml = serde_yaml::to_string(&cfg).unwrap();
        let back = Config::from_yaml(&yaml).unwrap();
        assert_eq!(back, cfg);
    }

    #[test]
    fn test_bootstrap_registers_all_types() {
        let registry = bootstrap().unwrap();
        let types = registry.types();
        for name in [
            "calc", "const", "convert", "eval", "fallback", "http", "ignore", "map", "modbus",
            "mqtt", "random", "script", "sequence", "solarman", "sunspec", "switch", "wait",
            "watchdog", "websocket",
        ] {
            assert!(types.contains(&name.to_string()), "{name}");
        }
        assert_eq!(types.len(), 19);
    }
}
