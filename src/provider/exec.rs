use super::{Config, Context, Provider};
use crate::cache::{self, Cache};
use crate::error::{HeliosError, Result, check_sentinel};
use crate::logging::StructuredLogger;
use crate::pipeline::{Pipeline, PipelineConfig};
use crate::util::{TemplateValue, duration, replace_formatted, split_args};
use crate::value::{
    Capabilities, Getter, Setter, bool_from_string, float_from_string, getter, int_from_float,
    setter,
};
use async_trait::async_trait;
use serde::Deserialize;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

fn default_scale() -> f64 {
    1.0
}

#[derive(Deserialize)]
struct Settings {
    cmd: String,
    #[serde(default = "default_timeout", deserialize_with = "duration::deserialize")]
    timeout: Duration,
    #[serde(default, deserialize_with = "duration::option::deserialize")]
    cache: Option<Duration>,
    #[serde(default)]
    backoff: bool,
    #[serde(default = "default_scale")]
    scale: f64,
    #[serde(flatten)]
    pipeline: PipelineConfig,
}

struct Runner {
    timeout: Duration,
    pipeline: Pipeline,
    logger: StructuredLogger,
}

impl Runner {
    /// Run `cmd` and return its trimmed stdout; the process is killed when
    /// the timeout expires
    async fn exec(&self, cmd: &str) -> Result<String> {
        let args = split_args(cmd)?;
        let (program, rest) = args
            .split_first()
            .ok_or_else(|| HeliosError::config("empty command"))?;

        let mut command = Command::new(program);
        command
            .args(rest)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(output) => output?,
            Err(_) => {
                return Err(HeliosError::timeout(format!(
                    "{}: no result within {:?}",
                    program, self.timeout
                )));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            self.logger
                .error(&format!("{}: {}", args.join(" "), stderr));
            check_sentinel(stderr.clone())?;
            return Err(HeliosError::script(format!(
                "{}: {} ({})",
                program, stderr, output.status
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        self.logger
            .debug(&format!("{}: {}", args.join(" "), stdout));
        Ok(stdout)
    }
}

/// Runs an external command per read or write
pub struct ScriptProvider {
    cmd: String,
    scale: f64,
    runner: Arc<Runner>,
    // shared by every getter of this provider
    cache: Option<Arc<Cache<String>>>,
}

impl ScriptProvider {
    pub fn new(ctx: &Context, cfg: &Config) -> Result<Self> {
        let settings: Settings = ctx.decode(cfg)?;
        if settings.cmd.trim().is_empty() {
            return Err(HeliosError::validation("cmd", "must not be empty"));
        }
        if settings.timeout.is_zero() {
            return Err(HeliosError::validation("timeout", "must be positive"));
        }

        let runner = Arc::new(Runner {
            timeout: settings.timeout,
            pipeline: Pipeline::new(&settings.pipeline)?,
            logger: ctx.logger("script"),
        });

        let mut provider = Self {
            cmd: settings.cmd,
            scale: settings.scale,
            runner,
            cache: None,
        };
        if let Some(ttl) = settings.cache.filter(|t| !t.is_zero()) {
            let mut cache = Cache::new(provider.uncached(), ttl);
            if settings.backoff {
                cache = cache.with_backoff();
            }
            provider.cache = Some(Arc::new(cache));
        }
        Ok(provider)
    }

    fn uncached(&self) -> Getter<String> {
        let runner = self.runner.clone();
        let cmd = self.cmd.clone();
        getter(move || {
            let runner = runner.clone();
            let cmd = cmd.clone();
            async move {
                let stdout = runner.exec(&cmd).await?;
                check_sentinel(runner.pipeline.process(stdout.as_bytes())?)
            }
        })
    }

    fn raw_getter(&self) -> Getter<String> {
        match &self.cache {
            Some(cache) => cache::wrap(cache.clone()),
            None => self.uncached(),
        }
    }

    fn command_setter<T>(&self, param: &str) -> Setter<T>
    where
        T: Into<TemplateValue> + Send + 'static,
    {
        let runner = self.runner.clone();
        let template = self.cmd.clone();
        let param = param.to_string();
        setter(move |value: T| {
            let runner = runner.clone();
            let cmd = replace_formatted(&template, &[(param.as_str(), value.into())]);
            async move {
                runner.exec(&cmd?).await?;
                Ok(())
            }
        })
    }
}

#[async_trait]
impl Provider for ScriptProvider {
    fn capabilities(&self) -> Capabilities {
        Capabilities::GETTERS.union(Capabilities::SETTERS)
    }

    fn caches_reads(&self) -> bool {
        true
    }

    async fn float_getter(&self) -> Result<Getter<f64>> {
        Ok(float_from_string(self.raw_getter(), self.scale))
    }

    async fn int_getter(&self) -> Result<Getter<i64>> {
        Ok(int_from_float(float_from_string(self.raw_getter(), self.scale)))
    }

    async fn string_getter(&self) -> Result<Getter<String>> {
        Ok(self.raw_getter())
    }

    async fn bool_getter(&self) -> Result<Getter<bool>> {
        Ok(bool_from_string(self.raw_getter()))
    }

    async fn float_setter(&self, param: &str) -> Result<Setter<f64>> {
        Ok(self.command_setter(param))
    }

    async fn int_setter(&self, param: &str) -> Result<Setter<i64>> {
        Ok(self.command_setter(param))
    }

    async fn string_setter(&self, param: &str) -> Result<Setter<String>> {
        Ok(self.command_setter(param))
    }

    async fn bool_setter(&self, param: &str) -> Result<Setter<bool>> {
        Ok(self.command_setter(param))
    }
}
