use super::{Config, Context, Provider};
use crate::error::{HeliosError, Result};
use crate::logging::StructuredLogger;
use crate::modbus::register::{FunctionCode, Operation, Register};
use crate::modbus::{self, Device, Protocol};
use crate::util::duration;
use crate::value::{Capabilities, Capability, Getter, Setter, getter, round_int, setter};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

fn default_scale() -> f64 {
    1.0
}

#[derive(Deserialize)]
struct Settings {
    #[serde(flatten)]
    link: modbus::Settings,
    #[serde(default)]
    register: Register,
    #[serde(default = "default_scale")]
    scale: f64,
    #[serde(default, deserialize_with = "duration::option::deserialize")]
    timeout: Option<Duration>,
    #[serde(default, deserialize_with = "duration::option::deserialize")]
    delay: Option<Duration>,
}

struct Inner {
    device: Device,
    op: Operation,
    scale: f64,
    logger: StructuredLogger,
}

impl Inner {
    async fn read(&self) -> Result<Vec<u8>> {
        let bytes = self.device.read(&self.op).await?;
        self.logger
            .trace(&format!("{} {:?}: {}", self.op.address, self.op.function, hex::encode(&bytes)));
        Ok(bytes)
    }

    async fn read_float(&self) -> Result<f64> {
        let bytes = self.read().await?;
        Ok(self.op.decode(&bytes)? * self.scale)
    }

    async fn write(&self, value: f64) -> Result<()> {
        let request = self.op.write_request(value)?;
        self.logger.debug(&format!("write {:?}", request));
        self.device.execute(&request).await.map(|_| ())
    }
}

/// Register access on a pooled Modbus or Solarman connection
pub struct ModbusProvider {
    inner: Arc<Inner>,
}

impl ModbusProvider {
    pub fn new(ctx: &Context, cfg: &Config) -> Result<Self> {
        Self::build(ctx, cfg, None)
    }

    /// Modbus through a Solarman data logger
    pub fn solarman(ctx: &Context, cfg: &Config) -> Result<Self> {
        Self::build(ctx, cfg, Some(Protocol::Solarman))
    }

    fn build(ctx: &Context, cfg: &Config, protocol: Option<Protocol>) -> Result<Self> {
        let settings: Settings = ctx.decode(cfg)?;
        let op = settings.register.operation()?;
        let protocol = protocol.unwrap_or_else(|| settings.link.protocol());
        let connection = modbus::connection(&settings.link, protocol)?;
        let logger = ctx.logger(if protocol == Protocol::Solarman {
            "solarman"
        } else {
            "modbus"
        });

        let device = Device::new(connection, settings.link.id)
            .with_timeout(settings.timeout)
            .with_delay(settings.delay);

        Ok(Self {
            inner: Arc::new(Inner {
                device,
                op,
                scale: settings.scale,
                logger,
            }),
        })
    }

    fn float_reader(&self) -> Getter<f64> {
        let inner = self.inner.clone();
        getter(move || {
            let inner = inner.clone();
            async move { inner.read_float().await }
        })
    }

    fn writer<T, F>(&self, convert: F) -> Setter<T>
    where
        T: Send + 'static,
        F: Fn(T) -> f64 + Send + Sync + 'static,
    {
        let inner = self.inner.clone();
        let convert = Arc::new(convert);
        setter(move |value: T| {
            let inner = inner.clone();
            let raw = convert(value);
            async move { inner.write(raw).await }
        })
    }
}

/// Text held in registers, without NUL padding
fn register_string(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_matches(|c: char| c == '\0' || c.is_whitespace())
        .to_string()
}

#[async_trait]
impl Provider for ModbusProvider {
    fn capabilities(&self) -> Capabilities {
        let op = &self.inner.op;
        if op.is_read() {
            return Capabilities::GETTERS;
        }
        let caps = Capabilities::NONE
            .with(Capability::IntSetter)
            .with(Capability::BoolSetter);
        if op.function == FunctionCode::WriteMultipleRegisters {
            caps.with(Capability::FloatSetter)
        } else {
            caps
        }
    }

    async fn float_getter(&self) -> Result<Getter<f64>> {
        Ok(self.float_reader())
    }

    async fn int_getter(&self) -> Result<Getter<i64>> {
        let g = self.float_reader();
        Ok(getter(move || {
            let g = g.clone();
            async move { Ok(round_int(g().await?)) }
        }))
    }

    async fn string_getter(&self) -> Result<Getter<String>> {
        let inner = self.inner.clone();
        Ok(getter(move || {
            let inner = inner.clone();
            async move { Ok(register_string(&inner.read().await?)) }
        }))
    }

    async fn bool_getter(&self) -> Result<Getter<bool>> {
        let g = self.float_reader();
        Ok(getter(move || {
            let g = g.clone();
            async move { Ok(g().await? != 0.0) }
        }))
    }

    async fn float_setter(&self, _param: &str) -> Result<Setter<f64>> {
        if self.inner.op.function != FunctionCode::WriteMultipleRegisters {
            return Err(HeliosError::config(format!(
                "float setter needs writemultiple register, got {:?}",
                self.inner.op.function
            )));
        }
        let scale = self.inner.scale;
        Ok(self.writer(move |v: f64| v * scale))
    }

    async fn int_setter(&self, _param: &str) -> Result<Setter<i64>> {
        let scale = self.inner.scale;
        Ok(self.writer(move |v: i64| (v as f64 * scale).round()))
    }

    async fn bool_setter(&self, _param: &str) -> Result<Setter<bool>> {
        Ok(self.writer(|v: bool| if v { 1.0 } else { 0.0 }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_string() {
        assert_eq!(register_string(b"\0\0SN123 \0"), "SN123");
        assert_eq!(register_string(b"\0\0\0\0"), "");
    }

    #[test]
    fn test_settings_decode() {
        let cfg = Config::from_yaml(
            "source: modbus\nuri: 10.0.0.2\nid: 3\ntimeout: 1s\nregister:\n  address: 30775\n  type: input\n  encoding: int32\nscale: 0.001\n",
        )
        .unwrap();
        let settings: Settings = cfg.decode().unwrap();
        assert_eq!(settings.link.id, 3);
        assert_eq!(settings.link.uri, "10.0.0.2");
        assert_eq!(settings.register.address, 30775);
        assert_eq!(settings.timeout, Some(Duration::from_secs(1)));
        assert_eq!(settings.scale, 0.001);

        let op = settings.register.operation().unwrap();
        assert_eq!(op.function, FunctionCode::ReadInputRegisters);
    }
}
