//! Typed accessors and capabilities
//!
//! A provider exposes up to eight accessor shapes: a getter and a setter for
//! each of float, int, string and bool. Accessors are shared async closures so
//! they can be cloned into operators, background tasks and device adapters.

use crate::error::{HeliosError, Result};
use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Parameterless accessor returning one typed value
pub type Getter<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T>> + Send + Sync>;

/// Accessor applying one typed value
pub type Setter<T> = Arc<dyn Fn(T) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Wrap an async closure into a [`Getter`]
pub fn getter<T, F, Fut>(f: F) -> Getter<T>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()))
}

/// Wrap an async closure into a [`Setter`]
pub fn setter<T, F, Fut>(f: F) -> Setter<T>
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |v| Box::pin(f(v)))
}

/// One of the eight accessor shapes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    FloatGetter,
    IntGetter,
    StringGetter,
    BoolGetter,
    FloatSetter,
    IntSetter,
    StringSetter,
    BoolSetter,
}

impl Capability {
    pub const ALL: [Capability; 8] = [
        Capability::FloatGetter,
        Capability::IntGetter,
        Capability::StringGetter,
        Capability::BoolGetter,
        Capability::FloatSetter,
        Capability::IntSetter,
        Capability::StringSetter,
        Capability::BoolSetter,
    ];

    const fn bit(self) -> u8 {
        1 << (self as u8)
    }

    pub fn is_setter(self) -> bool {
        matches!(
            self,
            Capability::FloatSetter
                | Capability::IntSetter
                | Capability::StringSetter
                | Capability::BoolSetter
        )
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Capability::FloatGetter => "float getter",
            Capability::IntGetter => "int getter",
            Capability::StringGetter => "string getter",
            Capability::BoolGetter => "bool getter",
            Capability::FloatSetter => "float setter",
            Capability::IntSetter => "int setter",
            Capability::StringSetter => "string setter",
            Capability::BoolSetter => "bool setter",
        };
        f.write_str(s)
    }
}

/// Set of capabilities a constructed provider can supply
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities(u8);

impl Capabilities {
    pub const NONE: Capabilities = Capabilities(0);

    pub const GETTERS: Capabilities = Capabilities(
        Capability::FloatGetter.bit()
            | Capability::IntGetter.bit()
            | Capability::StringGetter.bit()
            | Capability::BoolGetter.bit(),
    );

    pub const SETTERS: Capabilities = Capabilities(
        Capability::FloatSetter.bit()
            | Capability::IntSetter.bit()
            | Capability::StringSetter.bit()
            | Capability::BoolSetter.bit(),
    );

    pub const fn with(self, capability: Capability) -> Self {
        Capabilities(self.0 | capability.bit())
    }

    pub const fn union(self, other: Capabilities) -> Self {
        Capabilities(self.0 | other.0)
    }

    pub fn contains(self, capability: Capability) -> bool {
        self.0 & capability.bit() != 0
    }

    pub fn iter(self) -> impl Iterator<Item = Capability> {
        Capability::ALL.into_iter().filter(move |c| self.contains(*c))
    }
}

impl FromIterator<Capability> for Capabilities {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        iter.into_iter()
            .fold(Capabilities::NONE, |acc, c| acc.with(c))
    }
}

/// Parse a float from a raw string, multiplying by `scale`
pub fn parse_float(raw: &str, scale: f64) -> Result<f64> {
    raw.trim()
        .parse::<f64>()
        .map(|f| f * scale)
        .map_err(|_| HeliosError::type_error(format!("invalid float: '{}'", raw)))
}

/// Round a float to the nearest int, half away from zero
pub fn round_int(f: f64) -> i64 {
    f.round() as i64
}

/// Parse an int from a raw string through float parsing
pub fn parse_int(raw: &str, scale: f64) -> Result<i64> {
    parse_float(raw, scale).map(round_int)
}

/// "1", "true", "on" and "yes" are considered truish
pub fn truish(raw: &str) -> bool {
    matches!(
        raw.trim().to_lowercase().as_str(),
        "1" | "true" | "on" | "yes"
    )
}

/// Strict bool parse for values that must be boolean
pub fn parse_bool(raw: &str) -> Result<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        _ => Err(HeliosError::type_error(format!("invalid bool: '{}'", raw))),
    }
}

/// Derive float, int and bool getters from a raw string getter
pub fn float_from_string(g: Getter<String>, scale: f64) -> Getter<f64> {
    getter(move || {
        let g = g.clone();
        async move { parse_float(&g().await?, scale) }
    })
}

pub fn int_from_float(g: Getter<f64>) -> Getter<i64> {
    getter(move || {
        let g = g.clone();
        async move { g().await.map(round_int) }
    })
}

pub fn bool_from_string(g: Getter<String>) -> Getter<bool> {
    getter(move || {
        let g = g.clone();
        async move { g().await.map(|s| truish(&s)) }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities_set() {
        let caps = Capabilities::NONE
            .with(Capability::FloatGetter)
            .with(Capability::IntSetter);
        assert!(caps.contains(Capability::FloatGetter));
        assert!(caps.contains(Capability::IntSetter));
        assert!(!caps.contains(Capability::BoolGetter));
        assert_eq!(caps.iter().count(), 2);
        assert_eq!(Capabilities::GETTERS.iter().count(), 4);
        assert!(
            Capabilities::SETTERS
                .iter()
                .all(Capability::is_setter)
        );
    }

    #[test]
    fn test_parse_values() {
        assert!((parse_float(" 12.5 ", 2.0).unwrap() - 25.0).abs() < f64::EPSILON);
        assert_eq!(parse_int("2.5", 1.0).unwrap(), 3);
        assert_eq!(parse_int("-2.5", 1.0).unwrap(), -3);
        let err = parse_float("abc", 1.0).unwrap_err();
        assert!(err.to_string().contains("abc"));
        assert!(truish("On"));
        assert!(!truish("off"));
        assert!(parse_bool("maybe").is_err());
    }

    #[tokio::test]
    async fn test_derived_getters() {
        let raw = getter(|| async { Ok("1.5".to_string()) });
        let f = float_from_string(raw.clone(), 10.0);
        assert!((f().await.unwrap() - 15.0).abs() < f64::EPSILON);
        let i = int_from_float(f);
        assert_eq!(i().await.unwrap(), 15);
        let b = bool_from_string(getter(|| async { Ok("true".to_string()) }));
        assert!(b().await.unwrap());
    }
}
