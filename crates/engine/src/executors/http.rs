//! The HTTP step executor.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, SET_COOKIE};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

use trellis_expression::{EvalScope, resolve_string, resolve_value};
use trellis_workflow::{ActualRequest, HttpResponseData, Step, StepResult, StepStatus};

use crate::context::ExecutionContext;
use crate::error::EngineError;
use crate::executor::StepExecutor;

fn default_method() -> String {
    "GET".into()
}

fn default_true() -> bool {
    true
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_redirects() -> usize {
    10
}

#[derive(Debug, Deserialize)]
struct TimeoutConfig {
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    connect: Duration,
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    request: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect: default_connect_timeout(),
            request: default_request_timeout(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SslConfig {
    #[serde(default = "default_true")]
    verify: bool,
}

impl Default for SslConfig {
    fn default() -> Self {
        Self { verify: true }
    }
}

#[derive(Debug, Deserialize)]
struct RedirectConfig {
    #[serde(default = "default_true")]
    follow: bool,
    #[serde(default = "default_max_redirects")]
    max_redirects: usize,
}

impl Default for RedirectConfig {
    fn default() -> Self {
        Self {
            follow: true,
            max_redirects: default_max_redirects(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct HttpConfig {
    #[serde(default = "default_method")]
    method: String,
    url: String,
    #[serde(default)]
    params: HashMap<String, String>,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    body: Option<Value>,
    #[serde(default)]
    timeout: TimeoutConfig,
    #[serde(default)]
    ssl: SslConfig,
    #[serde(default)]
    redirect: RedirectConfig,
}

/// Executes `http` steps with variable substitution, cookie capture, and an
/// actual-request snapshot for diagnostics.
///
/// HTTP-level error statuses (4xx/5xx) are successful executions — whether
/// a 500 fails the step is the business of assertion processors. Transport
/// errors produce a Failed result with the attempted request attached;
/// elapsed deadlines produce Timeout.
#[derive(Debug, Default)]
pub struct HttpExecutor {
    client: reqwest::Client,
}

impl HttpExecutor {
    /// An executor with a default shared client.
    #[must_use]
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    fn client_for(&self, config: &HttpConfig) -> Result<reqwest::Client, EngineError> {
        if config.ssl.verify && config.redirect.follow
            && config.redirect.max_redirects == default_max_redirects()
            && config.timeout.connect == default_connect_timeout()
        {
            return Ok(self.client.clone());
        }
        let redirect = if config.redirect.follow {
            reqwest::redirect::Policy::limited(config.redirect.max_redirects)
        } else {
            reqwest::redirect::Policy::none()
        };
        reqwest::Client::builder()
            .connect_timeout(config.timeout.connect)
            .redirect(redirect)
            .danger_accept_invalid_certs(!config.ssl.verify)
            .build()
            .map_err(|e| EngineError::execution(format!("building http client: {e}")))
    }
}

#[async_trait]
impl StepExecutor for HttpExecutor {
    async fn execute(
        &self,
        step: &Step,
        ctx: &ExecutionContext,
    ) -> Result<StepResult, EngineError> {
        let mut config: HttpConfig =
            serde_json::from_value(Value::Object(step.config.clone()))
                .map_err(|e| EngineError::config(format!("http step {}: {e}", step.id)))?;

        // Substitute variables before anything leaves the process.
        let scope = ctx.scope();
        config.url = resolve_string(&scope, &config.url);
        for value in config.headers.values_mut() {
            *value = resolve_string(&scope, value);
        }
        for value in config.params.values_mut() {
            *value = resolve_string(&scope, value);
        }
        if let Some(body) = &config.body {
            config.body = Some(resolve_value(&scope, body));
        }

        let method = reqwest::Method::from_bytes(config.method.to_uppercase().as_bytes())
            .map_err(|_| EngineError::config(format!("invalid http method: {}", config.method)))?;

        let client = self.client_for(&config)?;
        let mut request = client.request(method.clone(), &config.url);
        if !config.params.is_empty() {
            let pairs: Vec<(&String, &String)> = config.params.iter().collect();
            request = request.query(&pairs);
        }
        for (name, value) in &config.headers {
            request = request.header(name, value);
        }

        let body_text = match &config.body {
            Some(Value::String(text)) => {
                request = request.body(text.clone());
                text.clone()
            }
            Some(Value::Object(map)) => {
                let is_form = config
                    .headers
                    .iter()
                    .any(|(k, v)| {
                        k.eq_ignore_ascii_case("content-type")
                            && v.contains("application/x-www-form-urlencoded")
                    });
                if is_form {
                    let form: HashMap<String, String> = map
                        .iter()
                        .map(|(k, v)| (k.clone(), trellis_expression::resolver::display_value(v)))
                        .collect();
                    request = request.form(&form);
                    serde_urlencoded_like(&form)
                } else {
                    let value = Value::Object(map.clone());
                    request = request.json(&value);
                    value.to_string()
                }
            }
            Some(other) => {
                request = request.json(other);
                other.to_string()
            }
            None => String::new(),
        };

        let actual_request = ActualRequest {
            url: config.url.clone(),
            method: method.to_string(),
            headers: config.headers.clone(),
            body: body_text,
        };

        debug!(step = %step.id, url = %config.url, method = %actual_request.method, "sending http request");
        let started = Instant::now();
        let send = request.send();

        let response = tokio::select! {
            () = ctx.cancellation.cancelled() => {
                return Ok(StepResult::skipped(step.id.clone(), "aborted"));
            }
            outcome = tokio::time::timeout(config.timeout.request, send) => match outcome {
                Err(_) => {
                    return Ok(StepResult::timeout(step.id.clone(), config.timeout.request));
                }
                Ok(Err(error)) => {
                    let mut result = StepResult::failed(
                        step.id.clone(),
                        format!("http request failed: {error}"),
                    )
                    .with_duration(started.elapsed());
                    result.output = serde_json::json!({
                        "error": error.to_string(),
                        "actual_request": actual_request,
                    });
                    return Ok(result);
                }
                Ok(Ok(response)) => response,
            }
        };

        let status = response.status();
        let headers = single_valued(response.headers());
        let cookies = parse_cookies(response.headers());
        let body = match tokio::time::timeout(config.timeout.request, response.text()).await {
            Ok(Ok(text)) => text,
            Ok(Err(error)) => {
                return Ok(StepResult::failed(
                    step.id.clone(),
                    format!("reading http body: {error}"),
                )
                .with_duration(started.elapsed()));
            }
            Err(_) => {
                return Ok(StepResult::timeout(step.id.clone(), config.timeout.request));
            }
        };
        let duration = started.elapsed();

        let data = HttpResponseData {
            status_code: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_owned(),
            headers,
            cookies,
            body,
            duration_ms: duration.as_millis() as u64,
            actual_request,
        };

        let mut result = StepResult::new(step.id.clone(), StepStatus::Success);
        result.duration = duration;
        result
            .metrics
            .insert("status_code".into(), f64::from(data.status_code));
        result
            .metrics
            .insert("duration_ms".into(), data.duration_ms as f64);
        result.output = data.into_value();
        Ok(result)
    }
}

/// Response headers flattened to single values: the first value wins.
fn single_valued(headers: &HeaderMap) -> HashMap<String, String> {
    let mut flat = HashMap::new();
    for (name, value) in headers {
        if let Ok(text) = value.to_str() {
            flat.entry(name.to_string()).or_insert_with(|| text.to_owned());
        }
    }
    flat
}

/// Cookies from `Set-Cookie` headers, name to value.
fn parse_cookies(headers: &HeaderMap) -> HashMap<String, String> {
    let mut cookies = HashMap::new();
    for value in headers.get_all(SET_COOKIE) {
        let Ok(text) = value.to_str() else { continue };
        let first_pair = text.split(';').next().unwrap_or_default();
        if let Some((name, value)) = first_pair.split_once('=') {
            cookies.insert(name.trim().to_owned(), value.trim().to_owned());
        }
    }
    cookies
}

/// Display form of a form body for the actual-request snapshot.
fn serde_urlencoded_like(form: &HashMap<String, String>) -> String {
    form.iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}
