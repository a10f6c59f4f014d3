use anyhow::{Context as _, Result};
use helios::config::AppConfig;
use helios::logging::{get_logger, init_logging};
use helios::provider::{Config, Context, bootstrap};
use helios::value::Getter;
use std::time::Duration;

/// Getter of the value type requested in the configuration
enum Reader {
    Float(Getter<f64>),
    Int(Getter<i64>),
    Str(Getter<String>),
    Bool(Getter<bool>),
}

impl Reader {
    async fn build(ctx: &Context, capability: &str, cfg: &Config) -> helios::Result<Self> {
        Ok(match capability.to_lowercase().as_str() {
            "int" => Reader::Int(ctx.int_getter(cfg).await?),
            "string" => Reader::Str(ctx.string_getter(cfg).await?),
            "bool" => Reader::Bool(ctx.bool_getter(cfg).await?),
            _ => Reader::Float(ctx.float_getter(cfg).await?),
        })
    }

    async fn read(&self) -> helios::Result<String> {
        Ok(match self {
            Reader::Float(g) => g().await?.to_string(),
            Reader::Int(g) => g().await?.to_string(),
            Reader::Str(g) => g().await?,
            Reader::Bool(g) => g().await?.to_string(),
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => AppConfig::from_file(&path)
            .with_context(|| format!("Failed to load configuration from {}", path))?,
        None => AppConfig::load()?,
    };
    config.validate()?;
    init_logging(&config.logging)?;

    let logger = get_logger("main");
    logger.info(&format!(
        "Helios {} starting with {} providers",
        env!("APP_VERSION"),
        config.providers.len()
    ));

    let mut ctx = Context::new(bootstrap()?);
    if let Some(broker) = &config.mqtt {
        ctx = ctx.with_mqtt(broker.clone());
    }

    let mut readers = Vec::with_capacity(config.providers.len());
    for (name, entry) in &config.providers {
        let reader = Reader::build(&ctx.child(name), &entry.capability, &entry.config)
            .await
            .with_context(|| format!("Failed to build provider {}", name))?;
        readers.push((name.clone(), reader));
    }

    let mut ticker = tokio::time::interval(Duration::from_millis(config.poll_interval_ms));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for (name, reader) in &readers {
                    match reader.read().await {
                        Ok(value) => logger.info(&format!("{}: {}", name, value)),
                        Err(e) => logger.warn(&format!("{}: {}", name, e)),
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    logger.info("Shutting down");
    ctx.dispose();
    Ok(())
}
