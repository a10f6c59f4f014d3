use super::{Config, Context, Provider};
use crate::error::{HeliosError, Result};
use crate::logging::StructuredLogger;
use crate::script::{ScriptEngine, ScriptValue};
use crate::value::{Capabilities, Getter, Setter, getter, setter};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;

fn default_kind() -> String {
    "float".to_string()
}

/// A variable bound to a nested getter or setter
#[derive(Deserialize)]
struct Binding {
    name: String,
    #[serde(rename = "type", default = "default_kind")]
    kind: String,
    config: Config,
}

#[derive(Deserialize)]
struct Settings {
    #[serde(default)]
    vm: String,
    script: String,
    #[serde(default, rename = "in")]
    inputs: Vec<Binding>,
    #[serde(default, rename = "out")]
    outputs: Vec<Binding>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Float,
    Int,
    Str,
    Bool,
}

impl Kind {
    fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_lowercase().as_str() {
            "float" => Ok(Kind::Float),
            "int" => Ok(Kind::Int),
            "string" => Ok(Kind::Str),
            "bool" => Ok(Kind::Bool),
            other => Err(HeliosError::config(format!("invalid type: {}", other))),
        }
    }
}

enum Input {
    Float(Getter<f64>),
    Int(Getter<i64>),
    Str(Getter<String>),
    Bool(Getter<bool>),
}

impl Input {
    async fn read(&self) -> Result<ScriptValue> {
        Ok(match self {
            Input::Float(g) => ScriptValue::Float(g().await?),
            Input::Int(g) => ScriptValue::Int(g().await?),
            Input::Str(g) => ScriptValue::Str(g().await?),
            Input::Bool(g) => ScriptValue::Bool(g().await?),
        })
    }
}

enum Output {
    Float(Setter<f64>),
    Int(Setter<i64>),
    Str(Setter<String>),
    Bool(Setter<bool>),
}

impl Output {
    async fn write(&self, value: ScriptValue) -> Result<()> {
        match self {
            Output::Float(s) => s(value.into_float()?).await,
            Output::Int(s) => s(value.into_int()?).await,
            Output::Str(s) => s(value.into_string()?).await,
            Output::Bool(s) => s(value.into_bool()?).await,
        }
    }
}

struct Inner {
    engine: Arc<dyn ScriptEngine>,
    script: String,
    inputs: Vec<(String, Input)>,
    outputs: Vec<Output>,
    logger: StructuredLogger,
}

impl Inner {
    /// Read the inputs, then bind them with `param` and evaluate in one
    /// engine step
    async fn evaluate(&self, param: Option<(&str, ScriptValue)>) -> Result<ScriptValue> {
        let mut bindings = Vec::with_capacity(self.inputs.len() + 1);
        for (name, input) in &self.inputs {
            bindings.push((name.clone(), input.read().await?));
        }
        if let Some((name, value)) = param {
            bindings.push((name.to_string(), value));
        }
        let result = self.engine.eval_with(bindings, &self.script)?;
        self.logger.trace(&format!("{} => {}", self.script, result));
        Ok(result)
    }

    async fn apply(&self, param: &str, value: ScriptValue) -> Result<()> {
        let result = self.evaluate(Some((param, value))).await?;
        for output in &self.outputs {
            output.write(result.clone()).await?;
        }
        Ok(())
    }
}

/// Evaluates a script in a named, persistent engine context
pub struct EvalProvider {
    ctx: Context,
    vm: String,
    script: String,
    inputs: Vec<(String, Kind, Config)>,
    outputs: Vec<(Kind, Config)>,
}

impl EvalProvider {
    pub fn new(ctx: &Context, cfg: &Config) -> Result<Self> {
        let settings: Settings = ctx.decode(cfg)?;
        if settings.script.trim().is_empty() {
            return Err(HeliosError::validation("script", "must not be empty"));
        }

        let inputs = settings
            .inputs
            .into_iter()
            .map(|b| {
                if b.name.trim().is_empty() {
                    return Err(HeliosError::validation("in.name", "must not be empty"));
                }
                Ok((b.name, Kind::parse(&b.kind)?, b.config))
            })
            .collect::<Result<Vec<_>>>()?;
        let outputs = settings
            .outputs
            .into_iter()
            .map(|b| Ok((Kind::parse(&b.kind)?, b.config)))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            ctx: ctx.clone(),
            vm: settings.vm,
            script: settings.script,
            inputs,
            outputs,
        })
    }

    async fn build(&self) -> Result<Arc<Inner>> {
        let mut inputs = Vec::with_capacity(self.inputs.len());
        for (i, (name, kind, cfg)) in self.inputs.iter().enumerate() {
            let ctx = self.ctx.child("in").child(&format!("[{}]", i));
            let input = match kind {
                Kind::Float => Input::Float(ctx.float_getter(cfg).await?),
                Kind::Int => Input::Int(ctx.int_getter(cfg).await?),
                Kind::Str => Input::Str(ctx.string_getter(cfg).await?),
                Kind::Bool => Input::Bool(ctx.bool_getter(cfg).await?),
            };
            inputs.push((name.clone(), input));
        }

        let mut outputs = Vec::with_capacity(self.outputs.len());
        for (i, (kind, cfg)) in self.outputs.iter().enumerate() {
            let ctx = self.ctx.child("out").child(&format!("[{}]", i));
            let output = match kind {
                Kind::Float => Output::Float(ctx.float_setter(cfg, "value").await?),
                Kind::Int => Output::Int(ctx.int_setter(cfg, "value").await?),
                Kind::Str => Output::Str(ctx.string_setter(cfg, "value").await?),
                Kind::Bool => Output::Bool(ctx.bool_setter(cfg, "value").await?),
            };
            outputs.push(output);
        }

        Ok(Arc::new(Inner {
            engine: self.ctx.engines().get(&self.vm),
            script: self.script.clone(),
            inputs,
            outputs,
            logger: self.ctx.logger("eval"),
        }))
    }

    async fn result_getter<T, F>(&self, convert: F) -> Result<Getter<T>>
    where
        T: Send + 'static,
        F: Fn(ScriptValue) -> Result<T> + Copy + Send + Sync + 'static,
    {
        let inner = self.build().await?;
        Ok(getter(move || {
            let inner = inner.clone();
            async move { convert(inner.evaluate(None).await?) }
        }))
    }

    async fn param_setter<T, F>(&self, param: &str, convert: F) -> Result<Setter<T>>
    where
        T: Send + 'static,
        F: Fn(T) -> ScriptValue + Copy + Send + Sync + 'static,
    {
        let inner = self.build().await?;
        let param = param.to_string();
        Ok(setter(move |value: T| {
            let inner = inner.clone();
            let param = param.clone();
            async move { inner.apply(&param, convert(value)).await }
        }))
    }
}

#[async_trait]
impl Provider for EvalProvider {
    fn capabilities(&self) -> Capabilities {
        Capabilities::GETTERS.union(Capabilities::SETTERS)
    }

    async fn float_getter(&self) -> Result<Getter<f64>> {
        self.result_getter(ScriptValue::into_float).await
    }

    async fn int_getter(&self) -> Result<Getter<i64>> {
        self.result_getter(ScriptValue::into_int).await
    }

    async fn string_getter(&self) -> Result<Getter<String>> {
        self.result_getter(ScriptValue::into_string).await
    }

    async fn bool_getter(&self) -> Result<Getter<bool>> {
        self.result_getter(ScriptValue::into_bool).await
    }

    async fn float_setter(&self, param: &str) -> Result<Setter<f64>> {
        self.param_setter(param, ScriptValue::Float).await
    }

    async fn int_setter(&self, param: &str) -> Result<Setter<i64>> {
        self.param_setter(param, ScriptValue::Int).await
    }

    async fn string_setter(&self, param: &str) -> Result<Setter<String>> {
        self.param_setter(param, ScriptValue::Str).await
    }

    async fn bool_setter(&self, param: &str) -> Result<Setter<bool>> {
        self.param_setter(param, ScriptValue::Bool).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::bootstrap;

    fn context() -> Context {
        Context::new(bootstrap().unwrap()).child("eval")
    }

    #[tokio::test]
    async fn test_inputs_bound_as_variables() {
        let cfg = Config::from_yaml(
            "source: eval\nscript: power * 2\nin:\n  - name: power\n    type: int\n    config:\n      source: const\n      value: 21\n",
        )
        .unwrap();
        let g = context().int_getter(&cfg).await.unwrap();
        assert_eq!(g().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_result_type_mismatch() {
        let cfg = Config::new("eval").with("script", "\"text\"");
        let g = context().float_getter(&cfg).await.unwrap();
        assert!(matches!(g().await, Err(HeliosError::Type { .. })));

        let g = context().float_getter(&Config::new("eval").with("script", "3")).await.unwrap();
        assert_eq!(g().await.unwrap(), 3.0);
    }

    #[test]
    fn test_invalid_binding_type() {
        let cfg = Config::from_yaml(
            "source: eval\nscript: x\nin:\n  - name: x\n    type: decimal\n    config:\n      source: const\n      value: 1\n",
        )
        .unwrap();
        assert!(EvalProvider::new(&context(), &cfg).is_err());
    }
}
