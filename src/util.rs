//! Small helpers shared by the providers: duration decoding, setter
//! templates and shell-style argument splitting.

use crate::error::{HeliosError, Result};
use std::fmt::Write as _;
use std::time::Duration;

/// Parse a Go-style duration such as `500ms`, `10s` or `1h2m3.5s`.
/// A bare number is taken as seconds.
pub fn parse_duration(raw: &str) -> Result<Duration> {
    let s = raw.trim();
    if s.is_empty() {
        return Err(HeliosError::config("empty duration"));
    }
    if let Ok(secs) = s.parse::<f64>() {
        return seconds(secs, raw);
    }

    let mut total = 0f64;
    let mut rest = s;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if num_len == 0 {
            return Err(HeliosError::config(format!("invalid duration: {}", raw)));
        }
        let value: f64 = rest[..num_len]
            .parse()
            .map_err(|_| HeliosError::config(format!("invalid duration: {}", raw)))?;
        rest = &rest[num_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let factor = match &rest[..unit_len] {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            unit => {
                return Err(HeliosError::config(format!(
                    "invalid duration unit '{}' in {}",
                    unit, raw
                )));
            }
        };
        total += value * factor;
        rest = &rest[unit_len..];
    }

    seconds(total, raw)
}

fn seconds(secs: f64, raw: &str) -> Result<Duration> {
    Duration::try_from_secs_f64(secs)
        .map_err(|_| HeliosError::config(format!("invalid duration: {}", raw)))
}

/// Serde adapters for durations in configuration records
pub mod duration {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
    }

    fn from_raw<E: serde::de::Error>(raw: Raw) -> Result<Duration, E> {
        match raw {
            Raw::Number(secs) => Duration::try_from_secs_f64(secs).map_err(E::custom),
            Raw::Text(s) => super::parse_duration(&s).map_err(E::custom),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        from_raw(Raw::deserialize(deserializer)?)
    }

    pub mod option {
        use super::{Raw, from_raw};
        use serde::{Deserialize, Deserializer};
        use std::time::Duration;

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            match Option::<Raw>::deserialize(deserializer)? {
                Some(raw) => from_raw(raw).map(Some),
                None => Ok(None),
            }
        }
    }
}

/// Value substituted into a setter template
#[derive(Debug, Clone, PartialEq)]
pub enum TemplateValue {
    Float(f64),
    Int(i64),
    Str(String),
    Bool(bool),
}

impl From<f64> for TemplateValue {
    fn from(v: f64) -> Self {
        TemplateValue::Float(v)
    }
}

impl From<i64> for TemplateValue {
    fn from(v: i64) -> Self {
        TemplateValue::Int(v)
    }
}

impl From<String> for TemplateValue {
    fn from(v: String) -> Self {
        TemplateValue::Str(v)
    }
}

impl From<bool> for TemplateValue {
    fn from(v: bool) -> Self {
        TemplateValue::Bool(v)
    }
}

impl TemplateValue {
    fn plain(&self) -> String {
        match self {
            TemplateValue::Float(f) => f.to_string(),
            TemplateValue::Int(i) => i.to_string(),
            TemplateValue::Str(s) => s.clone(),
            TemplateValue::Bool(b) => b.to_string(),
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            TemplateValue::Float(f) => Some(*f),
            TemplateValue::Int(i) => Some(*i as f64),
            TemplateValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            TemplateValue::Str(s) => s.trim().parse().ok(),
        }
    }

    fn as_i64(&self) -> Option<i64> {
        self.as_f64().map(|f| f.round() as i64)
    }

    /// Render with a printf-like verb: `%d`, `%5.2f`, `%x`, `%X`, `%s`, `%v`, `%t`
    fn format(&self, spec: &str) -> Result<String> {
        let bad = || HeliosError::config(format!("invalid format: {}", spec));
        let body = spec.strip_prefix('%').ok_or_else(bad)?;
        let verb = body.chars().last().ok_or_else(bad)?;
        let flags = &body[..body.len() - verb.len_utf8()];

        let zero_pad = flags.starts_with('0');
        let (width, precision) = match flags.trim_start_matches('0').split_once('.') {
            Some((w, p)) => (w, Some(p.parse::<usize>().map_err(|_| bad())?)),
            None => (flags.trim_start_matches('0'), None),
        };
        let width: usize = if width.is_empty() {
            0
        } else {
            width.parse().map_err(|_| bad())?
        };

        let out = match verb {
            'd' => self.as_i64().ok_or_else(bad)?.to_string(),
            'f' => format!("{:.*}", precision.unwrap_or(6), self.as_f64().ok_or_else(bad)?),
            'x' => format!("{:x}", self.as_i64().ok_or_else(bad)?),
            'X' => format!("{:X}", self.as_i64().ok_or_else(bad)?),
            's' | 'v' | 't' => self.plain(),
            _ => return Err(bad()),
        };

        if out.len() >= width {
            return Ok(out);
        }
        let pad = if zero_pad { '0' } else { ' ' };
        let mut padded = String::with_capacity(width);
        for _ in 0..width - out.len() {
            padded.push(pad);
        }
        padded.push_str(&out);
        Ok(padded)
    }
}

/// Replace `${name}` and `${name:%fmt}` placeholders in `template`.
/// Names are matched case-insensitively; an unknown name is an error.
pub fn replace_formatted(template: &str, vars: &[(&str, TemplateValue)]) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find('}').ok_or_else(|| {
            HeliosError::config(format!("unterminated placeholder in '{}'", template))
        })?;
        let inner = &after[..end];
        let (name, fmt) = match inner.split_once(':') {
            Some((n, f)) => (n.trim(), Some(f.trim())),
            None => (inner.trim(), None),
        };

        let value = vars
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
            .ok_or_else(|| {
                let known: Vec<&str> = vars.iter().map(|(k, _)| *k).collect();
                HeliosError::config(format!(
                    "template variable '{}' not provided (have: {})",
                    name,
                    known.join(", ")
                ))
            })?;

        match fmt {
            Some(spec) => out.push_str(&value.format(spec)?),
            None => {
                let _ = write!(out, "{}", value.plain());
            }
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);

    Ok(out)
}

/// Split a command line into arguments, honouring single quotes, double
/// quotes and backslash escapes.
pub fn split_args(cmd: &str) -> Result<Vec<String>> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_arg = false;
    let mut chars = cmd.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_arg = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(ch) => current.push(ch),
                        None => return Err(HeliosError::config(format!("unterminated quote: {}", cmd))),
                    }
                }
            }
            '"' => {
                in_arg = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(ch @ ('"' | '\\' | '$' | '`')) => current.push(ch),
                            Some(ch) => {
                                current.push('\\');
                                current.push(ch);
                            }
                            None => return Err(HeliosError::config(format!("unterminated quote: {}", cmd))),
                        },
                        Some(ch) => current.push(ch),
                        None => return Err(HeliosError::config(format!("unterminated quote: {}", cmd))),
                    }
                }
            }
            '\\' => {
                in_arg = true;
                if let Some(ch) = chars.next() {
                    current.push(ch);
                }
            }
            c if c.is_whitespace() => {
                if in_arg {
                    args.push(std::mem::take(&mut current));
                    in_arg = false;
                }
            }
            c => {
                in_arg = true;
                current.push(c);
            }
        }
    }
    if in_arg {
        args.push(current);
    }

    Ok(args)
}
