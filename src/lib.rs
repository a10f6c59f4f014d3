//! # Helios - configuration-driven value providers for energy devices
//!
//! Helios turns heterogeneous device transports into uniform, typed
//! accessors. A declarative provider configuration names a transport or an
//! operator; the provider context resolves it and hands back one async
//! getter or setter for a float, int, string or bool value.
//!
//! ## Architecture
//!
//! - `provider`: provider configurations, the registry of provider types and
//!   the built-in transports and operators
//! - `value`: getter/setter closures, capabilities and string coercion
//! - `pipeline`: regex, query, unpack and binary decode stages for raw payloads
//! - `cache`: TTL caching decorator with optional error backoff
//! - `monitor`: last-value holder for push transports
//! - `mqtt`: pooled MQTT broker connections
//! - `modbus`: pooled Modbus connections, register operations and the
//!   Solarman tunnel
//! - `script`: named persistent script engine contexts
//! - `config`: application configuration for the `helios` binary
//! - `logging`: structured logging and tracing

pub mod cache;
pub mod config;
pub mod error;
pub mod logging;
pub mod modbus;
pub mod monitor;
pub mod mqtt;
pub mod pipeline;
pub mod provider;
pub mod registry;
pub mod script;
pub mod util;
pub mod value;

// Re-export commonly used types
pub use config::AppConfig;
pub use error::{HeliosError, Result};
pub use provider::{Config, Context, Provider, bootstrap};
pub use value::{Capabilities, Capability, Getter, Setter};
