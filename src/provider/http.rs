use super::{Config, Context, Provider};
use crate::error::{HeliosError, Result, check_sentinel};
use crate::logging::StructuredLogger;
use crate::pipeline::{Pipeline, PipelineConfig};
use crate::util::{TemplateValue, duration, replace_formatted};
use crate::value::{
    Capabilities, Getter, Setter, bool_from_string, float_from_string, getter, int_from_float,
    setter,
};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, RequestBuilder};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

fn default_scale() -> f64 {
    1.0
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct Auth {
    #[serde(rename = "type")]
    kind: String,
    user: String,
    password: String,
}

#[derive(Deserialize)]
struct Settings {
    #[serde(alias = "url")]
    uri: String,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    insecure: bool,
    #[serde(default)]
    auth: Option<Auth>,
    #[serde(default = "default_timeout", deserialize_with = "duration::deserialize")]
    timeout: Duration,
    #[serde(default = "default_scale")]
    scale: f64,
    #[serde(flatten)]
    pipeline: PipelineConfig,
}

/// One request template; setters substitute their value before sending
#[derive(Clone)]
struct Request {
    method: String,
    uri: String,
    headers: BTreeMap<String, String>,
    body: Option<String>,
}

impl Request {
    fn render(&self, param: &str, value: TemplateValue) -> Result<Request> {
        let vars = [(param, value)];
        let headers = self
            .headers
            .iter()
            .map(|(k, v)| Ok((k.clone(), replace_formatted(v, &vars)?)))
            .collect::<Result<BTreeMap<_, _>>>()?;
        Ok(Request {
            method: replace_formatted(&self.method, &vars)?,
            uri: replace_formatted(&self.uri, &vars)?,
            headers,
            body: self
                .body
                .as_deref()
                .map(|b| replace_formatted(b, &vars))
                .transpose()?,
        })
    }
}

struct Inner {
    client: Client,
    credentials: Credentials,
    pipeline: Pipeline,
    logger: StructuredLogger,
}

impl Inner {
    async fn send(&self, request: &Request) -> Result<String> {
        let method = Method::from_bytes(request.method.to_uppercase().as_bytes())
            .map_err(|_| HeliosError::config(format!("invalid method: {}", request.method)))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| HeliosError::config(format!("invalid header {}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| HeliosError::config(format!("invalid header value: {}", e)))?;
            headers.insert(name, value);
        }

        self.logger
            .trace(&format!("{} {}", method, request.uri));
        let mut builder = self
            .credentials
            .apply(self.client.request(method, &request.uri).headers(headers));
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let resp = builder.send().await?;
        let status = resp.status();
        let body = resp.bytes().await?;
        if !status.is_success() {
            return Err(HeliosError::network(format!(
                "unexpected status {}: {}",
                status,
                String::from_utf8_lossy(&body).trim()
            )));
        }

        self.pipeline.process(&body)
    }
}

/// Issues one request per call
pub struct HttpProvider {
    request: Request,
    scale: f64,
    inner: Arc<Inner>,
}

fn default_scheme(uri: &str, logger: &StructuredLogger) -> String {
    if uri.contains("://") {
        uri.to_string()
    } else {
        logger.warn(&format!("missing scheme for {}, assuming http", uri));
        format!("http://{}", uri)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Credentials {
    None,
    Basic { user: String, password: String },
    Bearer(String),
}

impl Credentials {
    fn from_auth(auth: Option<Auth>) -> Result<Self> {
        let Some(auth) = auth else {
            return Ok(Credentials::None);
        };
        match auth.kind.to_lowercase().as_str() {
            "" => Ok(Credentials::None),
            "basic" => Ok(Credentials::Basic {
                user: auth.user,
                password: auth.password,
            }),
            "bearer" => Ok(Credentials::Bearer(auth.password)),
            other => Err(HeliosError::config(format!("unsupported auth type: {}", other))),
        }
    }

    fn apply(&self, builder: RequestBuilder) -> RequestBuilder {
        match self {
            Credentials::None => builder,
            Credentials::Basic { user, password } => builder.basic_auth(user, Some(password)),
            Credentials::Bearer(token) => builder.bearer_auth(token),
        }
    }
}

impl HttpProvider {
    pub fn new(ctx: &Context, cfg: &Config) -> Result<Self> {
        let settings: Settings = ctx.decode(cfg)?;
        let logger = ctx.logger("http");
        if settings.uri.trim().is_empty() {
            return Err(HeliosError::validation("uri", "must not be empty"));
        }

        let client = Client::builder()
            .timeout(settings.timeout)
            .danger_accept_invalid_certs(settings.insecure)
            .build()?;

        Ok(Self {
            request: Request {
                method: settings.method,
                uri: default_scheme(settings.uri.trim(), &logger),
                headers: settings.headers,
                body: settings.body,
            },
            scale: settings.scale,
            inner: Arc::new(Inner {
                client,
                credentials: Credentials::from_auth(settings.auth)?,
                pipeline: Pipeline::new(&settings.pipeline)?,
                logger,
            }),
        })
    }

    fn raw_getter(&self) -> Getter<String> {
        let inner = self.inner.clone();
        let request = self.request.clone();
        getter(move || {
            let inner = inner.clone();
            let request = request.clone();
            async move { check_sentinel(inner.send(&request).await?) }
        })
    }

    fn request_setter<T>(&self, param: &str) -> Setter<T>
    where
        T: Into<TemplateValue> + Send + 'static,
    {
        let inner = self.inner.clone();
        let template = self.request.clone();
        let param = param.to_string();
        setter(move |value: T| {
            let inner = inner.clone();
            let request = template.render(&param, value.into());
            async move {
                inner.send(&request?).await?;
                Ok(())
            }
        })
    }
}

#[async_trait]
impl Provider for HttpProvider {
    fn capabilities(&self) -> Capabilities {
        Capabilities::GETTERS.union(Capabilities::SETTERS)
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
        Ok(self.request_setter(param))
    }

    async fn int_setter(&self, param: &str) -> Result<Setter<i64>> {
        Ok(self.request_setter(param))
    }

    async fn string_setter(&self, param: &str) -> Result<Setter<String>> {
        Ok(self.request_setter(param))
    }

    async fn bool_setter(&self, param: &str) -> Result<Setter<bool>> {
        Ok(self.request_setter(param))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials() {
        let bearer = Credentials::from_auth(Some(Auth {
            kind: "Bearer".to_string(),
            user: String::new(),
            password: "tok".to_string(),
        }))
        .unwrap();
        assert_eq!(bearer, Credentials::Bearer("tok".to_string()));
        assert_eq!(Credentials::from_auth(None).unwrap(), Credentials::None);
        assert!(
            Credentials::from_auth(Some(Auth {
                kind: "digest".to_string(),
                ..Default::default()
            }))
            .is_err()
        );
    }

    #[test]
    fn test_render_request() {
        let request = Request {
            method: "POST".to_string(),
            uri: "http://host/set?v=${power:%d}".to_string(),
            headers: BTreeMap::from([("X-Value".to_string(), "${power}".to_string())]),
            body: Some("{\"power\":${power:%.1f}}".to_string()),
        };
        let rendered = request.render("power", TemplateValue::Float(1234.56)).unwrap();
        assert_eq!(rendered.uri, "http://host/set?v=1235");
        assert_eq!(rendered.headers["X-Value"], "1234.56");
        assert_eq!(rendered.body.as_deref(), Some("{\"power\":1234.6}"));
    }
}
