use super::{Config, Context, Provider};
use crate::error::{HeliosError, Result};
use crate::logging::StructuredLogger;
use crate::modbus::{self, Device};
use crate::pipeline::decode::{Encoding, bytes_to_registers};
use crate::util::duration;
use crate::value::{Capabilities, Capability, Getter, Setter, getter, round_int, setter};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

/// Candidate addresses of the `SunS` marker
const BASE_ADDRESSES: [u16; 3] = [40000, 50000, 0];
const SUNS: &[u8] = b"SunS";
const END_MODEL: u16 = 0xFFFF;
const MAX_MODELS: usize = 64;
// int16 value marking an unimplemented scale factor
const SF_NOT_IMPLEMENTED: i16 = i16::MIN;

fn default_scale() -> f64 {
    1.0
}

fn default_encoding() -> String {
    "int16".to_string()
}

#[derive(Deserialize)]
struct Settings {
    #[serde(flatten)]
    link: modbus::Settings,
    model: u16,
    offset: u16,
    #[serde(default = "default_encoding")]
    encoding: String,
    /// model relative offset of the scale factor register
    #[serde(default)]
    scalefactor: Option<u16>,
    #[serde(default = "default_scale")]
    scale: f64,
    #[serde(default, deserialize_with = "duration::option::deserialize")]
    timeout: Option<Duration>,
    #[serde(default, deserialize_with = "duration::option::deserialize")]
    delay: Option<Duration>,
}

struct Inner {
    device: Device,
    model: u16,
    offset: u16,
    encoding: Encoding,
    scalefactor: Option<u16>,
    scale: f64,
    // first register after the model header, found on first use
    start: OnceCell<u16>,
    logger: StructuredLogger,
}

fn word(bytes: &[u8], index: usize) -> Result<u16> {
    bytes
        .get(index * 2..index * 2 + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or_else(|| HeliosError::modbus(format!("short response: {} bytes", bytes.len())))
}

impl Inner {
    async fn discover(&self) -> Result<u16> {
        for base in BASE_ADDRESSES {
            match self.device.read_holding(base, 2).await {
                Ok(bytes) if bytes == SUNS => {
                    self.logger.debug(&format!("found sunspec header at {}", base));
                    return Ok(base + 2);
                }
                Ok(_) => {}
                Err(e) => self
                    .logger
                    .debug(&format!("no sunspec header at {}: {}", base, e)),
            }
        }
        Err(HeliosError::not_found("sunspec header"))
    }

    async fn locate(&self) -> Result<u16> {
        let mut address = self.discover().await?;
        for _ in 0..MAX_MODELS {
            let header = self.device.read_holding(address, 2).await?;
            let (id, len) = (word(&header, 0)?, word(&header, 1)?);
            if id == END_MODEL {
                break;
            }
            if id == self.model {
                return Ok(address + 2);
            }
            address = address
                .checked_add(2 + len)
                .ok_or_else(|| HeliosError::modbus("sunspec model chain overflows"))?;
        }
        Err(HeliosError::not_found(format!("sunspec model {}", self.model)))
    }

    async fn start(&self) -> Result<u16> {
        self.start.get_or_try_init(|| self.locate()).await.copied()
    }

    /// Combined multiplier of the scale factor register and `scale`
    async fn factor(&self, start: u16) -> Result<f64> {
        let Some(offset) = self.scalefactor else {
            return Ok(self.scale);
        };
        let bytes = self.device.read_holding(start + offset, 1).await?;
        let sf = word(&bytes, 0)? as i16;
        if sf == SF_NOT_IMPLEMENTED {
            return Err(HeliosError::NotAvailable);
        }
        Ok(10f64.powi(sf as i32) * self.scale)
    }

    async fn read(&self) -> Result<f64> {
        let start = self.start().await?;
        let bytes = self
            .device
            .read_holding(start + self.offset, self.encoding.registers())
            .await?;
        let value = self.encoding.decode(&bytes)?;
        Ok(value * self.factor(start).await?)
    }

    async fn write(&self, value: f64) -> Result<()> {
        let start = self.start().await?;
        let raw = value / self.factor(start).await?;
        let values = bytes_to_registers(&self.encoding.encode(raw));
        self.device.write_registers(start + self.offset, values).await
    }
}

/// SunSpec model point access on a pooled Modbus connection
pub struct SunspecProvider {
    inner: Arc<Inner>,
}

impl SunspecProvider {
    pub fn new(ctx: &Context, cfg: &Config) -> Result<Self> {
        let settings: Settings = ctx.decode(cfg)?;
        let encoding = Encoding::parse(&settings.encoding, None)?;
        let connection = modbus::connection(&settings.link, settings.link.protocol())?;
        let device = Device::new(connection, settings.link.id)
            .with_timeout(settings.timeout)
            .with_delay(settings.delay);

        Ok(Self {
            inner: Arc::new(Inner {
                device,
                model: settings.model,
                offset: settings.offset,
                encoding,
                scalefactor: settings.scalefactor,
                scale: settings.scale,
                start: OnceCell::new(),
                logger: ctx.logger("sunspec"),
            }),
        })
    }
}

#[async_trait]
impl Provider for SunspecProvider {
    fn capabilities(&self) -> Capabilities {
        Capabilities::NONE
            .with(Capability::FloatGetter)
            .with(Capability::IntGetter)
            .with(Capability::FloatSetter)
            .with(Capability::IntSetter)
    }

    async fn float_getter(&self) -> Result<Getter<f64>> {
        let inner = self.inner.clone();
        Ok(getter(move || {
            let inner = inner.clone();
            async move { inner.read().await }
        }))
    }

    async fn int_getter(&self) -> Result<Getter<i64>> {
        let inner = self.inner.clone();
        Ok(getter(move || {
            let inner = inner.clone();
            async move { Ok(round_int(inner.read().await?)) }
        }))
    }

    async fn float_setter(&self, _param: &str) -> Result<Setter<f64>> {
        let inner = self.inner.clone();
        Ok(setter(move |value: f64| {
            let inner = inner.clone();
            async move { inner.write(value).await }
        }))
    }

    async fn int_setter(&self, _param: &str) -> Result<Setter<i64>> {
        let inner = self.inner.clone();
        Ok(setter(move |value: i64| {
            let inner = inner.clone();
            async move { inner.write(value as f64).await }
        }))
    }
}
