use super::{Config, Context, Provider};
use crate::error::{HeliosError, Result, check_sentinel};
use crate::monitor::{Monitor, monitor_getter};
use crate::mqtt::{self, BrokerConfig, MqttClient};
use crate::pipeline::{Pipeline, PipelineConfig};
use crate::util::{TemplateValue, duration, replace_formatted};
use crate::value::{
    Capabilities, Getter, Setter, bool_from_string, float_from_string, getter, int_from_float,
    setter,
};
use async_trait::async_trait;
use rumqttc::QoS;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

/// How long the first read waits for a retained or fresh message
const INITIAL_TIMEOUT: Duration = Duration::from_secs(10);

fn default_scale() -> f64 {
    1.0
}

fn default_qos() -> u8 {
    1
}

#[derive(Deserialize)]
struct Settings {
    #[serde(flatten)]
    broker: BrokerConfig,
    topic: String,
    #[serde(default)]
    payload: Option<String>,
    #[serde(default = "default_scale")]
    scale: f64,
    #[serde(default, deserialize_with = "duration::option::deserialize")]
    timeout: Option<Duration>,
    #[serde(default)]
    retained: bool,
    #[serde(default = "default_qos")]
    qos: u8,
    #[serde(flatten)]
    pipeline: PipelineConfig,
}

/// Subscribes on getter construction and publishes on set
pub struct MqttProvider {
    ctx: Context,
    client: Arc<MqttClient>,
    topic: String,
    payload: Option<String>,
    scale: f64,
    staleness: Option<Duration>,
    retained: bool,
    qos: QoS,
    pipeline: Arc<Pipeline>,
}

/// Removes the topic listener when the last getter clone is dropped
struct Subscription {
    client: Arc<MqttClient>,
    topic: String,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.client.unlisten(&self.topic);
    }
}

impl MqttProvider {
    pub fn new(ctx: &Context, cfg: &Config) -> Result<Self> {
        let settings: Settings = ctx.decode(cfg)?;
        if settings.topic.trim().is_empty() {
            return Err(HeliosError::validation("topic", "must not be empty"));
        }

        let broker = if settings.broker.is_empty() {
            ctx.mqtt()
                .cloned()
                .ok_or_else(|| HeliosError::config("missing mqtt broker configuration"))?
        } else {
            settings.broker
        };

        Ok(Self {
            ctx: ctx.clone(),
            client: mqtt::client(&broker)?,
            topic: settings.topic,
            payload: settings.payload,
            scale: settings.scale,
            staleness: settings.timeout,
            retained: settings.retained,
            qos: mqtt::qos(settings.qos)?,
            pipeline: Arc::new(Pipeline::new(&settings.pipeline)?),
        })
    }

    /// Listen on the topic and return the raw value getter
    async fn subscribe(&self) -> Result<Getter<String>> {
        let monitor = Arc::new(Monitor::new(&self.topic, INITIAL_TIMEOUT, self.staleness));
        let logger = self.ctx.logger("mqtt");

        let listener = {
            let monitor = monitor.clone();
            let pipeline = self.pipeline.clone();
            let topic = self.topic.clone();
            Arc::new(move |payload: String| match pipeline.process(payload.as_bytes()) {
                Ok(value) => monitor.set(value),
                Err(e) => logger.warn(&format!("{}: {}", topic, e)),
            })
        };
        self.client.listen(&self.topic, self.qos, listener).await?;

        let subscription = Arc::new(Subscription {
            client: self.client.clone(),
            topic: self.topic.clone(),
        });
        let read = monitor_getter(monitor);
        Ok(getter(move || {
            let read = read.clone();
            let _subscription = subscription.clone();
            async move { check_sentinel(read().await?) }
        }))
    }

    fn publisher<T>(&self, param: &str) -> Setter<T>
    where
        T: Into<TemplateValue> + Send + 'static,
    {
        let template = self
            .payload
            .clone()
            .unwrap_or_else(|| format!("${{{}}}", param));
        let param = param.to_string();
        let client = self.client.clone();
        let topic = self.topic.clone();
        let (qos, retained) = (self.qos, self.retained);

        setter(move |value: T| {
            let payload = replace_formatted(&template, &[(param.as_str(), value.into())]);
            let client = client.clone();
            let topic = topic.clone();
            async move { client.publish(&topic, qos, retained, payload?).await }
        })
    }
}

#[async_trait]
impl Provider for MqttProvider {
    fn capabilities(&self) -> Capabilities {
        Capabilities::GETTERS.union(Capabilities::SETTERS)
    }

    async fn float_getter(&self) -> Result<Getter<f64>> {
        Ok(float_from_string(self.subscribe().await?, self.scale))
    }

    async fn int_getter(&self) -> Result<Getter<i64>> {
        Ok(int_from_float(float_from_string(
            self.subscribe().await?,
            self.scale,
        )))
    }

    async fn string_getter(&self) -> Result<Getter<String>> {
        self.subscribe().await
    }

    async fn bool_getter(&self) -> Result<Getter<bool>> {
        Ok(bool_from_string(self.subscribe().await?))
    }

    async fn float_setter(&self, param: &str) -> Result<Setter<f64>> {
        Ok(self.publisher(param))
    }

    async fn int_setter(&self, param: &str) -> Result<Setter<i64>> {
        Ok(self.publisher(param))
    }

    async fn string_setter(&self, param: &str) -> Result<Setter<String>> {
        Ok(self.publisher(param))
    }

    async fn bool_setter(&self, param: &str) -> Result<Setter<bool>> {
        Ok(self.publisher(param))
    }
}
