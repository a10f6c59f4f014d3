//! Payload transform pipeline
//!
//! Raw transport payloads run through a fixed chain of optional stages
//! before they are coerced into typed values:
//!
//! 1. XML normalize (only when the payload starts with an XML declaration)
//! 2. regex extract, with optional default
//! 3. jq-style structured query
//! 4. unpack (`hex`)
//! 5. binary decode
//!
//! A configured pipeline is immutable and can be shared between tasks.

pub mod decode;
pub mod query;
pub mod xml;

use crate::error::{HeliosError, Result};
use decode::Encoding;
use query::Query;
use regex::Regex;
use serde::Deserialize;

/// Pipeline settings, flattened into transport configurations
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub regex: Option<String>,
    pub default: Option<String>,
    pub jq: Option<String>,
    pub unpack: Option<String>,
    pub decode: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Unpack {
    Hex,
}

/// Compiled transform chain
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    re: Option<Regex>,
    default: Option<String>,
    query: Option<Query>,
    unpack: Option<Unpack>,
    decode: Option<Encoding>,
}

impl Pipeline {
    /// Compile the configured stages; invalid regex, query, unpack mode
    /// or encoding fail here
    pub fn new(config: &PipelineConfig) -> Result<Self> {
        let re = config.regex.as_deref().map(Regex::new).transpose()?;
        let query = config.jq.as_deref().map(Query::parse).transpose()?;

        let unpack = match config.unpack.as_deref().map(str::to_lowercase).as_deref() {
            None | Some("") => None,
            Some("hex") => Some(Unpack::Hex),
            Some(other) => {
                return Err(HeliosError::config(format!("invalid unpack mode: {}", other)));
            }
        };

        let decode = match config.decode.as_deref() {
            None | Some("") => None,
            Some(name) => Some(Encoding::parse(name, None)?),
        };

        Ok(Pipeline {
            re,
            default: config.default.clone(),
            query,
            unpack,
            decode,
        })
    }

    /// Whether every stage is absent
    pub fn is_identity(&self) -> bool {
        self.re.is_none() && self.query.is_none() && self.unpack.is_none() && self.decode.is_none()
    }

    /// Run the payload through all configured stages
    pub fn process(&self, payload: &[u8]) -> Result<String> {
        let mut value = String::from_utf8_lossy(payload).into_owned();

        if xml::is_xml(&value) {
            let json = xml::to_json(value.trim()).map_err(|e| stage_error("xml", &e, &value))?;
            value = json.to_string();
        }

        if let Some(re) = &self.re {
            value = self.extract(re, value);
        }

        if let Some(query) = &self.query {
            let input: serde_json::Value = serde_json::from_str(&value).map_err(|e| {
                stage_error("jq", &HeliosError::transform(e.to_string()), &value)
            })?;
            let result = query
                .first(&input)
                .map_err(|e| stage_error("jq", &e, &value))?;
            value = query::render(&result);
        }

        let mut bytes: Option<Vec<u8>> = None;
        if let Some(Unpack::Hex) = self.unpack {
            let decoded = hex::decode(value.trim()).map_err(|e| {
                stage_error("unpack", &HeliosError::transform(e.to_string()), &value)
            })?;
            bytes = Some(decoded);
        }

        if let Some(encoding) = self.decode {
            let raw = bytes.take().unwrap_or_else(|| value.as_bytes().to_vec());
            let number = encoding
                .decode(&raw)
                .map_err(|e| stage_error("decode", &e, &hex::encode(&raw)))?;
            value = number.to_string();
        } else if let Some(raw) = bytes {
            value = String::from_utf8_lossy(&raw).into_owned();
        }

        Ok(value)
    }

    fn extract(&self, re: &Regex, value: String) -> String {
        match re.captures(&value) {
            Some(caps) => {
                let m = if re.captures_len() > 1 {
                    caps.get(1).or_else(|| caps.get(0))
                } else {
                    caps.get(0)
                };
                m.map(|m| m.as_str().to_string()).unwrap_or_default()
            }
            None => match &self.default {
                Some(default) => default.clone(),
                None => value,
            },
        }
    }
}

fn stage_error(stage: &str, err: &HeliosError, before: &str) -> HeliosError {
    HeliosError::transform(format!("{}: {} (value: '{}')", stage, err, before))
}
