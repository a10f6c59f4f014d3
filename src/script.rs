//! Embedded script engines
//!
//! Scripts run inside named, persistent evaluation contexts: providers that
//! use the same `vm` name share variables. The engine is a trait so the
//! backend can be swapped; the built-in backend is `evalexpr`.

use crate::error::{HeliosError, Result, check_sentinel};
use evalexpr::{ContextWithMutableVariables, HashMapContext, Value};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

pub const DEFAULT_VM: &str = "default";

/// Native result of a script evaluation
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptValue {
    Float(f64),
    Int(i64),
    Str(String),
    Bool(bool),
    Empty,
}

impl fmt::Display for ScriptValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptValue::Float(v) => write!(f, "{}", v),
            ScriptValue::Int(v) => write!(f, "{}", v),
            ScriptValue::Str(v) => write!(f, "'{}'", v),
            ScriptValue::Bool(v) => write!(f, "{}", v),
            ScriptValue::Empty => f.write_str("()"),
        }
    }
}

impl ScriptValue {
    fn mismatch(&self, wanted: &str) -> HeliosError {
        HeliosError::type_error(format!("script result {} is not {}", self, wanted))
    }

    pub fn into_float(self) -> Result<f64> {
        match self {
            ScriptValue::Float(f) => Ok(f),
            ScriptValue::Int(i) => Ok(i as f64),
            other => Err(other.mismatch("a float")),
        }
    }

    pub fn into_int(self) -> Result<i64> {
        match self {
            ScriptValue::Int(i) => Ok(i),
            other => Err(other.mismatch("an int")),
        }
    }

    pub fn into_string(self) -> Result<String> {
        match self {
            ScriptValue::Str(s) => check_sentinel(s),
            other => Err(other.mismatch("a string")),
        }
    }

    pub fn into_bool(self) -> Result<bool> {
        match self {
            ScriptValue::Bool(b) => Ok(b),
            other => Err(other.mismatch("a bool")),
        }
    }
}

/// A persistent evaluation context
pub trait ScriptEngine: Send + Sync {
    /// Bind `bindings` and evaluate `script` as one step; no other
    /// evaluation on the same context runs in between. Bindings and any
    /// variables the script assigns persist.
    fn eval_with(&self, bindings: Vec<(String, ScriptValue)>, script: &str) -> Result<ScriptValue>;

    fn eval(&self, script: &str) -> Result<ScriptValue> {
        self.eval_with(Vec::new(), script)
    }
}

/// `evalexpr` backed engine
#[derive(Default)]
pub struct EvalexprEngine {
    context: Mutex<HashMapContext>,
}

impl EvalexprEngine {
    pub fn new() -> Self {
        Self::default()
    }
}

fn to_evalexpr(value: ScriptValue) -> Value {
    match value {
        ScriptValue::Float(f) => Value::Float(f),
        ScriptValue::Int(i) => Value::Int(i),
        ScriptValue::Str(s) => Value::String(s),
        ScriptValue::Bool(b) => Value::Boolean(b),
        ScriptValue::Empty => Value::Empty,
    }
}

impl ScriptEngine for EvalexprEngine {
    fn eval_with(&self, bindings: Vec<(String, ScriptValue)>, script: &str) -> Result<ScriptValue> {
        let mut context = self.context.lock();
        for (name, value) in bindings {
            context
                .set_value(name.clone(), to_evalexpr(value))
                .map_err(|e| HeliosError::script(format!("set {}: {}", name, e)))?;
        }
        let value = evalexpr::eval_with_context_mut(script, &mut *context)
            .map_err(|e| HeliosError::script(e.to_string()))?;
        match value {
            Value::Float(f) => Ok(ScriptValue::Float(f)),
            Value::Int(i) => Ok(ScriptValue::Int(i)),
            Value::String(s) => Ok(ScriptValue::Str(s)),
            Value::Boolean(b) => Ok(ScriptValue::Bool(b)),
            Value::Empty => Ok(ScriptValue::Empty),
            Value::Tuple(t) => Err(HeliosError::type_error(format!(
                "script returned a tuple of {} values",
                t.len()
            ))),
        }
    }
}

type EngineFactory = Arc<dyn Fn() -> Arc<dyn ScriptEngine> + Send + Sync>;

/// Named, lazily created evaluation contexts
pub struct EngineRegistry {
    engines: Mutex<HashMap<String, Arc<dyn ScriptEngine>>>,
    backend: EngineFactory,
}

impl Default for EngineRegistry {
    fn default() -> Self {
        Self::with_backend(Arc::new(|| Arc::new(EvalexprEngine::new())))
    }
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry creating contexts with a custom backend
    pub fn with_backend(backend: EngineFactory) -> Self {
        Self {
            engines: Mutex::new(HashMap::new()),
            backend,
        }
    }

    /// Context registered under `name`, created on first use
    pub fn get(&self, name: &str) -> Arc<dyn ScriptEngine> {
        let key = match name.trim() {
            "" => DEFAULT_VM.to_string(),
            n => n.to_lowercase(),
        };
        self.engines
            .lock()
            .entry(key)
            .or_insert_with(|| (self.backend)())
            .clone()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.engines.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_named_contexts_share_state() {
        let registry = EngineRegistry::new();
        let a = registry.get("house");
        a.eval("counter = 40").unwrap();
        let b = registry.get("House");
        assert_eq!(b.eval("counter + 2").unwrap(), ScriptValue::Int(42));

        let other = registry.get("");
        assert!(other.eval("counter").is_err());
        assert_eq!(registry.names(), vec!["default".to_string(), "house".to_string()]);
    }

    #[test]
    fn test_result_type_checks() {
        assert_eq!(ScriptValue::Int(3).into_float().unwrap(), 3.0);
        assert!(ScriptValue::Float(3.5).into_int().is_err());
        assert!(ScriptValue::Int(1).into_bool().is_err());
        assert!(matches!(
            ScriptValue::Str("ErrAsleep".to_string()).into_string(),
            Err(HeliosError::Asleep)
        ));
        let err = ScriptValue::Str("x".to_string()).into_float().unwrap_err();
        assert!(err.to_string().contains("'x'"));
    }

    #[test]
    fn test_bound_variables() {
        let engine = EvalexprEngine::new();
        let bindings = vec![("power".to_string(), ScriptValue::Float(1500.0))];
        assert_eq!(
            engine.eval_with(bindings, "power / 1000.0").unwrap(),
            ScriptValue::Float(1.5)
        );
        // bindings persist
        assert_eq!(engine.eval("power").unwrap(), ScriptValue::Float(1500.0));
        assert!(engine.eval("1 +").is_err());
    }

    #[test]
    fn test_concurrent_evaluations_see_their_own_bindings() {
        let engine = EvalexprEngine::new();
        std::thread::scope(|scope| {
            for worker in 0..4i64 {
                let engine = &engine;
                scope.spawn(move || {
                    for _ in 0..500 {
                        let bindings = vec![("x".to_string(), ScriptValue::Int(worker))];
                        assert_eq!(engine.eval_with(bindings, "x * 10").unwrap(), ScriptValue::Int(worker * 10));
                    }
                });
            }
        });
    }
}
