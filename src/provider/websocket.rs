use super::{Config, Context, Provider, TaskGuard};
use crate::error::{HeliosError, Result, check_sentinel};
use crate::logging::StructuredLogger;
use crate::monitor::Monitor;
use crate::pipeline::{Pipeline, PipelineConfig};
use crate::util::duration;
use crate::value::{
    Capabilities, Getter, bool_from_string, float_from_string, getter, int_from_float,
};
use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};

const INITIAL_TIMEOUT: Duration = Duration::from_secs(10);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

fn default_scale() -> f64 {
    1.0
}

#[derive(Deserialize)]
struct Settings {
    #[serde(alias = "url")]
    uri: String,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default = "default_scale")]
    scale: f64,
    #[serde(default, deserialize_with = "duration::option::deserialize")]
    timeout: Option<Duration>,
    #[serde(flatten)]
    pipeline: PipelineConfig,
}

/// Read-only provider fed by a persistent WebSocket connection
pub struct WebsocketProvider {
    ctx: Context,
    uri: String,
    headers: BTreeMap<String, String>,
    scale: f64,
    staleness: Option<Duration>,
    pipeline: Arc<Pipeline>,
}

impl WebsocketProvider {
    pub fn new(ctx: &Context, cfg: &Config) -> Result<Self> {
        let settings: Settings = ctx.decode(cfg)?;
        let provider = Self {
            ctx: ctx.clone(),
            uri: settings.uri,
            headers: settings.headers,
            scale: settings.scale,
            staleness: settings.timeout,
            pipeline: Arc::new(Pipeline::new(&settings.pipeline)?),
        };
        // surface malformed uri or headers at construction
        build_request(&provider.uri, &provider.headers)?;
        Ok(provider)
    }

    /// Start the reader task and return the raw value getter; the task
    /// stops when the last getter clone is dropped
    fn start(&self) -> Getter<String> {
        let monitor = Arc::new(Monitor::new(&self.uri, INITIAL_TIMEOUT, self.staleness));
        let reader = Reader {
            uri: self.uri.clone(),
            headers: self.headers.clone(),
            pipeline: self.pipeline.clone(),
            monitor: monitor.clone(),
            logger: self.ctx.logger("websocket"),
        };
        let task: Arc<TaskGuard> = Arc::new(self.ctx.spawn(reader.run()));

        getter(move || {
            let monitor = monitor.clone();
            let _task = task.clone();
            async move { check_sentinel(monitor.get().await?) }
        })
    }
}

fn build_request(uri: &str, headers: &BTreeMap<String, String>) -> Result<Request> {
    let mut request = uri
        .into_client_request()
        .map_err(|e| HeliosError::config(format!("invalid websocket uri {}: {}", uri, e)))?;
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| HeliosError::config(format!("invalid header {}: {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| HeliosError::config(format!("invalid header value: {}", e)))?;
        request.headers_mut().insert(name, value);
    }
    Ok(request)
}

struct Reader {
    uri: String,
    headers: BTreeMap<String, String>,
    pipeline: Arc<Pipeline>,
    monitor: Arc<Monitor<String>>,
    logger: StructuredLogger,
}

impl Reader {
    async fn run(self) {
        loop {
            if let Err(e) = self.connect_and_read().await {
                self.logger.error(&e.to_string());
            }
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }

    async fn connect_and_read(&self) -> Result<()> {
        let request = build_request(&self.uri, &self.headers)?;
        let (mut stream, _) = connect_async(request)
            .await
            .map_err(|e| HeliosError::network(format!("connect: {}", e)))?;
        self.logger.debug("connected");

        while let Some(message) = stream.next().await {
            let payload = match message.map_err(|e| HeliosError::network(e.to_string()))? {
                Message::Text(text) => text.into_bytes(),
                Message::Binary(data) => data,
                Message::Close(_) => break,
                _ => continue,
            };
            match self.pipeline.process(&payload) {
                Ok(value) => self.monitor.set(value),
                Err(e) => self.logger.warn(&format!("skipping frame: {}", e)),
            }
        }

        Err(HeliosError::network("connection closed"))
    }
}

#[async_trait]
impl Provider for WebsocketProvider {
    fn capabilities(&self) -> Capabilities {
        Capabilities::GETTERS
    }

    async fn float_getter(&self) -> Result<Getter<f64>> {
        Ok(float_from_string(self.start(), self.scale))
    }

    async fn int_getter(&self) -> Result<Getter<i64>> {
        Ok(int_from_float(float_from_string(self.start(), self.scale)))
    }

    async fn string_getter(&self) -> Result<Getter<String>> {
        Ok(self.start())
    }

    async fn bool_getter(&self) -> Result<Getter<bool>> {
        Ok(bool_from_string(self.start()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_request_headers() {
        let headers = BTreeMap::from([("Authorization".to_string(), "Bearer x".to_string())]);
        let request = build_request("ws://localhost:8080/live", &headers).unwrap();
        assert_eq!(request.headers()["authorization"], "Bearer x");
        assert!(build_request("not a uri", &BTreeMap::new()).is_err());
    }
}
