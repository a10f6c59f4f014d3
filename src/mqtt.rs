//! Shared MQTT broker connections
//!
//! One [`MqttClient`] exists per `broker/user/clientid` key. Providers hold
//! it through an `Arc`; when the last one is dropped the event loop task is
//! aborted and the connection closes. Each topic has exactly one listener
//! per client, and subscriptions are restored whenever the broker
//! acknowledges a (re)connect.

use crate::error::{HeliosError, Result};
use crate::logging::{LogContext, StructuredLogger, get_logger_with_context};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub const DEFAULT_PORT: u16 = 1883;
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Broker connection settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub broker: String,
    pub user: String,
    pub password: String,
    #[serde(alias = "clientid")]
    pub client_id: String,
}

impl BrokerConfig {
    pub fn is_empty(&self) -> bool {
        self.broker.trim().is_empty()
    }

    fn key(&self) -> String {
        format!("{}/{}/{}", self.broker, self.user, self.client_id)
    }
}

/// Split `host[:port]`, accepting an optional `tcp://` or `mqtt://` scheme
pub fn parse_broker(broker: &str) -> Result<(String, u16)> {
    let raw = broker.trim();
    if raw.starts_with("tls://") || raw.starts_with("ssl://") || raw.starts_with("mqtts://") {
        return Err(HeliosError::config(format!(
            "unsupported mqtt broker scheme: {}",
            raw
        )));
    }
    let raw = raw
        .strip_prefix("tcp://")
        .or_else(|| raw.strip_prefix("mqtt://"))
        .unwrap_or(raw);
    if raw.is_empty() {
        return Err(HeliosError::config("missing mqtt broker"));
    }

    match raw.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| HeliosError::config(format!("invalid mqtt broker port: {}", raw)))?;
            Ok((host.to_string(), port))
        }
        None => Ok((raw.to_string(), DEFAULT_PORT)),
    }
}

/// Map a numeric QoS level
pub fn qos(level: u8) -> Result<QoS> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(HeliosError::config(format!("invalid mqtt qos: {}", other))),
    }
}

/// Callback receiving the payload of each message on a topic
pub type Listener = Arc<dyn Fn(String) + Send + Sync>;

#[derive(Default)]
struct Acks {
    // publishes handed to the client, waiting for their packet id
    queued: VecDeque<(QoS, oneshot::Sender<()>)>,
    // packet id -> waiter for PUBACK / PUBCOMP
    inflight: HashMap<u16, oneshot::Sender<()>>,
}

struct Shared {
    listeners: Mutex<HashMap<String, (QoS, Listener)>>,
    acks: Mutex<Acks>,
}

/// Pooled broker connection
pub struct MqttClient {
    key: String,
    client: AsyncClient,
    shared: Arc<Shared>,
    publish_lock: tokio::sync::Mutex<()>,
    task: JoinHandle<()>,
    logger: StructuredLogger,
}

static CLIENTS: Lazy<Mutex<HashMap<String, Weak<MqttClient>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Get the pooled client for `config`, connecting if none is alive
pub fn client(config: &BrokerConfig) -> Result<Arc<MqttClient>> {
    let key = config.key();
    let mut clients = CLIENTS.lock();
    if let Some(existing) = clients.get(&key).and_then(Weak::upgrade) {
        return Ok(existing);
    }

    let client = Arc::new(MqttClient::connect(config, &key)?);
    clients.retain(|_, weak| weak.strong_count() > 0);
    clients.insert(key, Arc::downgrade(&client));
    Ok(client)
}

impl MqttClient {
    fn connect(config: &BrokerConfig, key: &str) -> Result<Self> {
        let (host, port) = parse_broker(&config.broker)?;
        let client_id = if config.client_id.is_empty() {
            let id = uuid::Uuid::new_v4().simple().to_string();
            format!("helios-{}", &id[..8])
        } else {
            config.client_id.clone()
        };

        let mut options = MqttOptions::new(client_id, host.clone(), port);
        options.set_keep_alive(Duration::from_secs(30));
        if !config.user.is_empty() {
            options.set_credentials(config.user.clone(), config.password.clone());
        }

        let (client, eventloop) = AsyncClient::new(options, 64);
        let shared = Arc::new(Shared {
            listeners: Mutex::new(HashMap::new()),
            acks: Mutex::new(Acks::default()),
        });
        let logger = get_logger_with_context(
            LogContext::new("mqtt").with_field("broker", format!("{}:{}", host, port)),
        );

        let task = tokio::spawn(run_event_loop(
            eventloop,
            client.clone(),
            shared.clone(),
            logger.clone(),
        ));
        logger.debug("connecting");

        Ok(MqttClient {
            key: key.to_string(),
            client,
            shared,
            publish_lock: tokio::sync::Mutex::new(()),
            task,
            logger,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Register the listener for `topic` and subscribe.
    /// A second listener on the same topic is a configuration error.
    pub async fn listen(&self, topic: &str, qos: QoS, listener: Listener) -> Result<()> {
        {
            let mut listeners = self.shared.listeners.lock();
            if listeners.contains_key(topic) {
                return Err(HeliosError::config(format!("duplicate listener: {}", topic)));
            }
            listeners.insert(topic.to_string(), (qos, listener));
        }

        self.logger.debug(&format!("subscribe {}", topic));
        if let Err(e) = self.client.subscribe(topic, qos).await {
            self.shared.listeners.lock().remove(topic);
            return Err(HeliosError::mqtt(format!("subscribe {}: {}", topic, e)));
        }
        Ok(())
    }

    /// Remove the listener for `topic`
    pub fn unlisten(&self, topic: &str) {
        if self.shared.listeners.lock().remove(topic).is_some() {
            let _ = self.client.try_unsubscribe(topic);
        }
    }

    /// Publish and wait for the broker to acknowledge within the publish timeout
    pub async fn publish(&self, topic: &str, qos: QoS, retained: bool, payload: String) -> Result<()> {
        self.logger
            .trace(&format!("send {}: '{}'", topic, payload));
        let (tx, rx) = oneshot::channel();

        {
            let _ordered = self.publish_lock.lock().await;
            self.shared.acks.lock().queued.push_back((qos, tx));
            if let Err(e) = self.client.publish(topic, qos, retained, payload).await {
                self.shared.acks.lock().queued.pop_back();
                return Err(HeliosError::mqtt(format!("publish {}: {}", topic, e)));
            }
        }

        match tokio::time::timeout(PUBLISH_TIMEOUT, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(HeliosError::mqtt(format!(
                "publish {}: connection lost",
                topic
            ))),
            Err(_) => Err(HeliosError::timeout(format!("publish {}", topic))),
        }
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        self.task.abort();
        let _ = self.client.try_disconnect();
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    shared: Arc<Shared>,
    logger: StructuredLogger,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                logger.info("connected");
                let topics: Vec<(String, QoS)> = shared
                    .listeners
                    .lock()
                    .iter()
                    .map(|(t, (q, _))| (t.clone(), *q))
                    .collect();
                for (topic, qos) in topics {
                    if let Err(e) = client.try_subscribe(topic.clone(), qos) {
                        logger.warn(&format!("resubscribe {}: {}", topic, e));
                    }
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                if publish.payload.is_empty() {
                    continue;
                }
                let payload = String::from_utf8_lossy(&publish.payload).into_owned();
                logger.trace(&format!("recv {}: '{}'", publish.topic, payload));
                let matched: Vec<Listener> = shared
                    .listeners
                    .lock()
                    .iter()
                    .filter(|(filter, _)| topic_matches(filter, &publish.topic))
                    .map(|(_, (_, l))| l.clone())
                    .collect();
                for listener in matched {
                    listener(payload.clone());
                }
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                let mut acks = shared.acks.lock();
                if let Some((qos, tx)) = acks.queued.pop_front() {
                    if qos == QoS::AtMostOnce {
                        let _ = tx.send(());
                    } else {
                        acks.inflight.insert(pkid, tx);
                    }
                }
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                if let Some(tx) = shared.acks.lock().inflight.remove(&ack.pkid) {
                    let _ = tx.send(());
                }
            }
            Ok(Event::Incoming(Packet::PubComp(comp))) => {
                if let Some(tx) = shared.acks.lock().inflight.remove(&comp.pkid) {
                    let _ = tx.send(());
                }
            }
            Ok(_) => {}
            Err(e) => {
                logger.warn(&format!("connection error: {}", e));
                {
                    // dropping the senders fails the waiting publishers
                    let mut acks = shared.acks.lock();
                    acks.queued.clear();
                    acks.inflight.clear();
                }
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

/// MQTT topic filter match supporting `+` and `#`
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut levels = topic.split('/');
    for part in filter.split('/') {
        match part {
            "#" => return true,
            "+" => {
                if levels.next().is_none() {
                    return false;
                }
            }
            literal => {
                if levels.next() != Some(literal) {
                    return false;
                }
            }
        }
    }
    levels.next().is_none()
}
