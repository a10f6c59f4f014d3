//! Pooled Modbus device connections
//!
//! Connections are shared per physical link: the serial device path for
//! RTU, or the `host:port` endpoint for TCP, RTU over TCP and Solarman
//! loggers. The bus is half-duplex, so every connection serializes its
//! requests behind one lock. Registering the same link with a different
//! protocol is a configuration error.

pub mod register;
pub mod solarman;

use crate::error::{HeliosError, Result};
use crate::logging::{LogContext, StructuredLogger, get_logger_with_context};
use crate::pipeline::decode::registers_to_bytes;
use crate::util::duration;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use register::Operation;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_modbus::client::{Context as ModbusContext, rtu, tcp};
use tokio_modbus::prelude::*;

pub const DEFAULT_PORT: u16 = 502;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
// a stale socket gets one reconnect before the error surfaces
const MAX_ATTEMPTS: u32 = 2;

/// One Modbus request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    ReadCoils { address: u16, count: u16 },
    ReadHoldingRegisters { address: u16, count: u16 },
    ReadInputRegisters { address: u16, count: u16 },
    WriteSingleCoil { address: u16, on: bool },
    WriteSingleRegister { address: u16, value: u16 },
    WriteMultipleRegisters { address: u16, values: Vec<u16> },
}

/// Wire access to one physical link
///
/// Reads return the raw data bytes: registers big-endian, coils packed
/// least significant bit first. Writes return an empty vector.
#[async_trait]
pub trait Transport: Send {
    async fn call(&mut self, slave: u8, request: &Request) -> Result<Vec<u8>>;

    /// Open the link if it is down; true when a fresh link was opened
    async fn connect(&mut self) -> Result<bool> {
        Ok(false)
    }

    /// Drop the underlying link; the next call reconnects
    fn reset(&mut self);
}

/// Wire protocol of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    RtuOverTcp,
    Serial,
    Solarman,
}

/// Link settings shared by the modbus, sunspec and solarman providers
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub uri: String,
    pub device: String,
    pub comset: String,
    pub baudrate: u32,
    pub rtu: Option<bool>,
    pub id: u8,
    /// Solarman logger serial number
    pub serial: Option<u32>,
    /// Settle time between opening the link and its first request
    #[serde(rename = "connectdelay", deserialize_with = "duration::option::deserialize")]
    pub connect_delay: Option<Duration>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            uri: String::new(),
            device: String::new(),
            comset: "8N1".to_string(),
            baudrate: 0,
            rtu: None,
            id: 1,
            serial: None,
            connect_delay: None,
        }
    }
}

impl Settings {
    /// Protocol implied by the settings for plain Modbus providers
    pub fn protocol(&self) -> Protocol {
        if !self.device.is_empty() {
            Protocol::Serial
        } else if self.rtu == Some(true) {
            Protocol::RtuOverTcp
        } else {
            Protocol::Tcp
        }
    }

    fn validate(&self, protocol: Protocol) -> Result<()> {
        let has_uri = !self.uri.trim().is_empty();
        let has_device = !self.device.trim().is_empty();
        if has_uri == has_device {
            return Err(HeliosError::config(
                "invalid modbus configuration: must have either uri or device",
            ));
        }
        if protocol == Protocol::Solarman && (has_device || self.serial.is_none()) {
            return Err(HeliosError::config(
                "solarman needs uri and logger serial",
            ));
        }
        Ok(())
    }

    /// Pool key of the physical link
    pub fn key(&self, protocol: Protocol) -> String {
        match protocol {
            Protocol::Serial => self.device.trim().to_string(),
            Protocol::Solarman => default_port(self.uri.trim(), solarman::DEFAULT_PORT),
            Protocol::Tcp | Protocol::RtuOverTcp => default_port(self.uri.trim(), DEFAULT_PORT),
        }
    }
}

fn default_port(uri: &str, port: u16) -> String {
    let host = uri.strip_prefix("tcp://").unwrap_or(uri);
    if host.rsplit_once(':').is_some_and(|(_, p)| p.parse::<u16>().is_ok()) {
        host.to_string()
    } else {
        format!("{}:{}", host, port)
    }
}

/// Serial line parameters from a comset such as `8N1`
#[cfg(feature = "serial")]
fn serial_params(
    comset: &str,
) -> Result<(tokio_serial::DataBits, tokio_serial::Parity, tokio_serial::StopBits)> {
    use tokio_serial::{DataBits, Parity, StopBits};
    match comset.trim().to_uppercase().as_str() {
        "8N1" | "" => Ok((DataBits::Eight, Parity::None, StopBits::One)),
        "8E1" | "80" => Ok((DataBits::Eight, Parity::Even, StopBits::One)),
        "8N2" => Ok((DataBits::Eight, Parity::None, StopBits::Two)),
        other => Err(HeliosError::config(format!("invalid comset: {}", other))),
    }
}

enum Link {
    Tcp(String),
    RtuOverTcp(String),
    #[cfg(feature = "serial")]
    Serial {
        device: String,
        baudrate: u32,
        comset: String,
    },
}

impl Link {
    async fn connect(&self) -> Result<ModbusContext> {
        match self {
            Link::Tcp(address) => Ok(tcp::attach(TcpStream::connect(address).await?)),
            Link::RtuOverTcp(address) => Ok(rtu::attach(TcpStream::connect(address).await?)),
            #[cfg(feature = "serial")]
            Link::Serial {
                device,
                baudrate,
                comset,
            } => {
                let (data_bits, parity, stop_bits) = serial_params(comset)?;
                let builder = tokio_serial::new(device.as_str(), *baudrate)
                    .data_bits(data_bits)
                    .parity(parity)
                    .stop_bits(stop_bits);
                let port = tokio_serial::SerialStream::open(&builder)
                    .map_err(|e| HeliosError::modbus(format!("open {}: {}", device, e)))?;
                Ok(rtu::attach(port))
            }
        }
    }
}

/// `tokio-modbus` backed transport for TCP, RTU over TCP and serial RTU
pub struct ModbusTransport {
    link: Link,
    context: Option<ModbusContext>,
}

impl ModbusTransport {
    fn new(link: Link) -> Self {
        Self {
            link,
            context: None,
        }
    }

    async fn context(&mut self) -> Result<&mut ModbusContext> {
        if self.context.is_none() {
            let context = match timeout(CONNECT_TIMEOUT, self.link.connect()).await {
                Ok(result) => result?,
                Err(_) => return Err(HeliosError::timeout("modbus connect")),
            };
            self.context = Some(context);
        }
        self.context
            .as_mut()
            .ok_or_else(|| HeliosError::modbus("not connected"))
    }
}

/// Pack coil states into bytes, first coil in the least significant bit
fn pack_coils(coils: &[bool]) -> Vec<u8> {
    coils
        .chunks(8)
        .map(|chunk| {
            chunk
                .iter()
                .enumerate()
                .fold(0u8, |acc, (i, on)| if *on { acc | (1 << i) } else { acc })
        })
        .collect()
}

#[async_trait]
impl Transport for ModbusTransport {
    async fn connect(&mut self) -> Result<bool> {
        if self.context.is_some() {
            return Ok(false);
        }
        self.context().await?;
        Ok(true)
    }

    async fn call(&mut self, slave: u8, request: &Request) -> Result<Vec<u8>> {
        let context = self.context().await?;
        context.set_slave(Slave(slave));

        let result = match request {
            Request::ReadCoils { address, count } => context
                .read_coils(*address, *count)
                .await
                .map(|r| r.map(|coils| pack_coils(&coils))),
            Request::ReadHoldingRegisters { address, count } => context
                .read_holding_registers(*address, *count)
                .await
                .map(|r| r.map(|words| registers_to_bytes(&words))),
            Request::ReadInputRegisters { address, count } => context
                .read_input_registers(*address, *count)
                .await
                .map(|r| r.map(|words| registers_to_bytes(&words))),
            Request::WriteSingleCoil { address, on } => context
                .write_single_coil(*address, *on)
                .await
                .map(|r| r.map(|()| Vec::new())),
            Request::WriteSingleRegister { address, value } => context
                .write_single_register(*address, *value)
                .await
                .map(|r| r.map(|()| Vec::new())),
            Request::WriteMultipleRegisters { address, values } => context
                .write_multiple_registers(*address, values)
                .await
                .map(|r| r.map(|()| Vec::new())),
        };

        match result {
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(exception)) => Err(HeliosError::modbus(format!(
                "exception {:?} for {:?}",
                exception, request
            ))),
            Err(e) => {
                self.reset();
                Err(HeliosError::modbus(format!("connection: {}", e)))
            }
        }
    }

    fn reset(&mut self) {
        self.context = None;
    }
}

/// Serialized access to one physical link
pub struct Connection {
    key: String,
    protocol: Protocol,
    transport: tokio::sync::Mutex<Box<dyn Transport>>,
    connect_delay: Mutex<Option<Duration>>,
    logger: StructuredLogger,
}

impl Connection {
    pub fn new(key: &str, protocol: Protocol, transport: Box<dyn Transport>) -> Self {
        Self {
            key: key.to_string(),
            protocol,
            transport: tokio::sync::Mutex::new(transport),
            connect_delay: Mutex::new(None),
            logger: get_logger_with_context(
                LogContext::new("modbus").with_field("link", key.to_string()),
            ),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Wait `delay` after every fresh link before its first request; the
    /// last provider to configure a delay on a shared link wins
    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock() = Some(delay);
    }

    async fn attempt(
        &self,
        transport: &mut Box<dyn Transport>,
        slave: u8,
        request: &Request,
        op_timeout: Duration,
    ) -> Result<Vec<u8>> {
        if transport.connect().await? {
            let delay = *self.connect_delay.lock();
            if let Some(delay) = delay {
                self.logger
                    .debug(&format!("link opened, waiting {:?}", delay));
                sleep(delay).await;
            }
        }

        match timeout(op_timeout, transport.call(slave, request)).await {
            Ok(result) => result,
            Err(_) => {
                transport.reset();
                Err(HeliosError::timeout(format!(
                    "{}: slave {}: {:?}",
                    self.key, slave, request
                )))
            }
        }
    }

    /// Run one request; a timed out request resets the link
    pub async fn execute(
        &self,
        slave: u8,
        request: &Request,
        op_timeout: Duration,
        delay: Option<Duration>,
    ) -> Result<Vec<u8>> {
        let mut transport = self.transport.lock().await;
        if let Some(delay) = delay {
            sleep(delay).await;
        }

        let mut attempts = 0;
        loop {
            attempts += 1;
            self.logger
                .trace(&format!("slave {}: {:?}", slave, request));

            let result = self
                .attempt(&mut transport, slave, request, op_timeout)
                .await;

            match result {
                Err(e) if attempts < MAX_ATTEMPTS && is_connection_error(&e) => {
                    self.logger
                        .warn(&format!("request failed due to connection error: {}", e));
                }
                other => return other,
            }
        }
    }
}

fn is_connection_error(error: &HeliosError) -> bool {
    match error {
        HeliosError::Io { .. } => true,
        HeliosError::Modbus { message } => message.starts_with("connection"),
        _ => false,
    }
}

static CONNECTIONS: Lazy<Mutex<HashMap<String, Weak<Connection>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Get the pooled connection for `key`, creating it with `transport` when
/// none is alive
pub fn register_connection<F>(key: &str, protocol: Protocol, transport: F) -> Result<Arc<Connection>>
where
    F: FnOnce() -> Result<Box<dyn Transport>>,
{
    let mut connections = CONNECTIONS.lock();
    if let Some(existing) = connections.get(key).and_then(Weak::upgrade) {
        if existing.protocol != protocol {
            return Err(HeliosError::config(format!(
                "connection already registered with different protocol: {}",
                key
            )));
        }
        return Ok(existing);
    }

    let connection = Arc::new(Connection::new(key, protocol, transport()?));
    connections.retain(|_, weak| weak.strong_count() > 0);
    connections.insert(key.to_string(), Arc::downgrade(&connection));
    Ok(connection)
}

/// Pooled connection for the link described by `settings`; nothing is
/// opened until the first request
pub fn connection(settings: &Settings, protocol: Protocol) -> Result<Arc<Connection>> {
    settings.validate(protocol)?;
    let key = settings.key(protocol);

    let connection = register_connection(&key, protocol, || {
        let transport: Box<dyn Transport> = match protocol {
            Protocol::Tcp => Box::new(ModbusTransport::new(Link::Tcp(key.clone()))),
            Protocol::RtuOverTcp => Box::new(ModbusTransport::new(Link::RtuOverTcp(key.clone()))),
            Protocol::Solarman => Box::new(solarman::SolarmanTransport::new(
                &key,
                settings.serial.unwrap_or_default(),
            )),
            #[cfg(feature = "serial")]
            Protocol::Serial => {
                serial_params(&settings.comset)?;
                if settings.baudrate == 0 {
                    return Err(HeliosError::config(
                        "invalid modbus configuration: need baudrate and comset",
                    ));
                }
                Box::new(ModbusTransport::new(Link::Serial {
                    device: key.clone(),
                    baudrate: settings.baudrate,
                    comset: settings.comset.clone(),
                }))
            }
            #[cfg(not(feature = "serial"))]
            Protocol::Serial => {
                return Err(HeliosError::config("serial modbus support not compiled in"));
            }
        };
        Ok(transport)
    })?;
    if let Some(delay) = settings.connect_delay.filter(|d| !d.is_zero()) {
        connection.set_connect_delay(delay);
    }
    Ok(connection)
}

/// One slave on a pooled connection
#[derive(Clone)]
pub struct Device {
    connection: Arc<Connection>,
    slave: u8,
    timeout: Duration,
    delay: Option<Duration>,
}

impl Device {
    pub fn new(connection: Arc<Connection>, slave: u8) -> Self {
        Self {
            connection,
            slave,
            timeout: DEFAULT_TIMEOUT,
            delay: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        if let Some(t) = timeout.filter(|t| !t.is_zero()) {
            self.timeout = t;
        }
        self
    }

    /// Idle time before each request
    pub fn with_delay(mut self, delay: Option<Duration>) -> Self {
        self.delay = delay.filter(|d| !d.is_zero());
        self
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub async fn execute(&self, request: &Request) -> Result<Vec<u8>> {
        self.connection
            .execute(self.slave, request, self.timeout, self.delay)
            .await
    }

    /// Raw bytes of a read operation
    pub async fn read(&self, op: &Operation) -> Result<Vec<u8>> {
        self.execute(&op.read_request()?).await
    }

    pub async fn read_holding(&self, address: u16, count: u16) -> Result<Vec<u8>> {
        self.execute(&Request::ReadHoldingRegisters { address, count })
            .await
    }

    pub async fn write_registers(&self, address: u16, values: Vec<u16>) -> Result<()> {
        self.execute(&Request::WriteMultipleRegisters { address, values })
            .await
            .map(|_| ())
    }
}
