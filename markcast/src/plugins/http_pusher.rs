//! Webhook pusher
//!
//! Sends each TRACK marker to every configured webhook, as query parameters
//! (GET) or a urlencoded form (POST). Each webhook lives in its own table:
//!
//! ```toml
//! [plugin.HttpPusher.webhooks.website]
//! url = "https://example.com/api/now-playing"
//! method = "POST"
//! marker_param = "title"
//! api_key_param = "key"
//! api_key = "secret"
//! show_slug_param = "show"
//! show_episode_param = "episode"
//! extra_delay = 2.0
//! ```
//!
//! Connection errors, timeouts, 429 and 5xx responses are retried with
//! exponential backoff; other failures are logged and the marker is dropped
//! for that webhook.

use std::time::Duration;

use async_trait::async_trait;
use markcast_common::config::SectionReader;
use markcast_common::{
    ConfigError, Error, Lane, Marker, MarkerType, Plugin, PluginControl, PluginKind, Result,
    SubscriberQueue,
};
use reqwest::StatusCode;
use tracing::{debug, info, warn};

use super::{next_marker, Next, PluginContext};
use crate::show::Show;

pub const NAME: &str = "HttpPusher";

const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

/// One webhook target
#[derive(Debug, Clone, PartialEq)]
pub struct Webhook {
    pub name: String,
    pub url: String,
    pub method: HttpMethod,
    pub marker_param: String,
    /// Parameter name and value
    pub api_key: Option<(String, String)>,
    pub show_slug_param: Option<String>,
    pub show_episode_param: Option<String>,
    /// How long to hold the marker before sending
    pub extra_delay: Option<Duration>,
}

impl Webhook {
    fn from_table(name: &str, table: &toml::Table, parent: &mut SectionReader<'_>) -> Self {
        let mut r = SectionReader::new(format!("plugin.{NAME}.webhooks.{name}"), table);
        let url = r.required_str("url");
        let method = match r.required_str("method").as_str() {
            "GET" => HttpMethod::Get,
            "POST" => HttpMethod::Post,
            // Missing or mistyped is already recorded
            _ if !matches!(table.get("method"), Some(toml::Value::String(_))) => HttpMethod::Post,
            _ => {
                r.invalid("method", "must be GET or POST");
                HttpMethod::Post
            }
        };
        let marker_param = r.required_str("marker_param");
        let api_key = r
            .optional_str("api_key_param")
            .map(|param| (param, r.required_str("api_key")));
        let show_slug_param = r.optional_str("show_slug_param");
        let show_episode_param = r.optional_str("show_episode_param");
        let extra_delay = table
            .contains_key("extra_delay")
            .then(|| r.required_seconds("extra_delay"));

        if let Err(e) = r.finish() {
            parent.merge(e);
        }
        Self {
            name: name.to_string(),
            url,
            method,
            marker_param,
            api_key,
            show_slug_param,
            show_episode_param,
            extra_delay,
        }
    }

    /// Request parameters for one marker
    pub fn payload(&self, marker: &Marker, show: &Show) -> Vec<(String, String)> {
        let mut payload = vec![(self.marker_param.clone(), marker.label().to_string())];
        if let Some((param, key)) = &self.api_key {
            payload.push((param.clone(), key.clone()));
        }
        if let Some(param) = &self.show_slug_param {
            payload.push((param.clone(), show.slug().to_string()));
        }
        if let Some(param) = &self.show_episode_param {
            payload.push((param.clone(), show.episode().to_string()));
        }
        payload
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpPusherConfig {
    pub delayed: bool,
    pub webhooks: Vec<Webhook>,
}

impl HttpPusherConfig {
    pub fn from_table(table: &toml::Table) -> std::result::Result<Self, ConfigError> {
        let mut r = SectionReader::new(format!("plugin.{NAME}"), table);
        let delayed = r.optional_bool("delayed", false);
        let hooks = r.subtable("webhooks");
        if hooks.is_none() && !r.has_errors() {
            r.error(format!(
                "is missing a webhooks table; add [plugin.{NAME}.webhooks.<name>]"
            ));
        }

        let mut webhooks = Vec::new();
        for (name, value) in hooks.into_iter().flatten() {
            match value.as_table() {
                Some(hook) => webhooks.push(Webhook::from_table(name, hook, &mut r)),
                None => r.error(format!("webhook \"{name}\" must be a table")),
            }
        }

        r.finish()?;
        Ok(Self { delayed, webhooks })
    }
}

/// Attempt count and backoff base for one webhook request
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Wait before retry number `attempt` (1-based): base, 2×base, 4×base...
    fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

pub struct HttpPusher {
    config: HttpPusherConfig,
    show: Show,
    queue: SubscriberQueue,
    client: reqwest::Client,
    retry: RetryPolicy,
}

pub fn factory(table: &toml::Table, ctx: &PluginContext) -> Result<Box<dyn Plugin>> {
    Ok(Box::new(HttpPusher::from_config(table, ctx)?))
}

impl HttpPusher {
    pub fn from_config(table: &toml::Table, ctx: &PluginContext) -> Result<Self> {
        let config = HttpPusherConfig::from_table(table)?;
        debug!(plugin = NAME, webhooks = config.webhooks.len(), "Configuration valid");
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        let queue =
            ctx.mediator
                .subscribe(&[MarkerType::Track], NAME, Lane::select(config.delayed))?;
        Ok(Self {
            config,
            show: ctx.show.clone(),
            queue,
            client,
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn push_all(&self, marker: &Marker) {
        for hook in &self.config.webhooks {
            let payload = hook.payload(marker, &self.show);
            match hook.extra_delay {
                Some(delay) => {
                    debug!(plugin = NAME, webhook = %hook.name, ?delay, "Delaying marker");
                    let client = self.client.clone();
                    let hook = hook.clone();
                    let retry = self.retry;
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        log_outcome(&hook, send(&client, &hook, &payload, retry).await);
                    });
                }
                None => {
                    debug!(plugin = NAME, webhook = %hook.name, "Sending marker immediately");
                    log_outcome(hook, send(&self.client, hook, &payload, self.retry).await);
                }
            }
        }
    }
}

#[async_trait]
impl Plugin for HttpPusher {
    fn name(&self) -> &str {
        NAME
    }

    fn kind(&self) -> PluginKind {
        PluginKind::Sink
    }

    async fn run(&mut self, control: PluginControl) -> Result<()> {
        info!(plugin = NAME, "Starting plugin");
        loop {
            match next_marker(&mut self.queue, &control).await? {
                Next::Marker(marker) => self.push_all(&marker).await,
                Next::Idle => continue,
                Next::Finished => break,
            }
        }
        Ok(())
    }
}

fn log_outcome(hook: &Webhook, outcome: Result<()>) {
    match outcome {
        Ok(()) => info!(plugin = NAME, webhook = %hook.name, "Request made successfully"),
        Err(e) => warn!(plugin = NAME, webhook = %hook.name, "Giving up on marker: {}", e),
    }
}

fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Make one webhook request, retrying transient failures
pub async fn send(
    client: &reqwest::Client,
    hook: &Webhook,
    payload: &[(String, String)],
    retry: RetryPolicy,
) -> Result<()> {
    let mut last_problem = String::new();
    for attempt in 1..=retry.attempts {
        let request = match hook.method {
            HttpMethod::Get => client.get(&hook.url).query(payload),
            HttpMethod::Post => client.post(&hook.url).form(payload),
        };
        match request.send().await {
            Ok(response) if response.status().is_success() => {
                debug!(plugin = NAME, webhook = %hook.name, status = %response.status(), "Response received");
                return Ok(());
            }
            Ok(response) if is_retryable(response.status()) => {
                last_problem = format!("status {}", response.status());
            }
            Ok(response) => {
                return Err(Error::Http(format!(
                    "{} answered with status {}",
                    hook.url,
                    response.status()
                )));
            }
            Err(e) if e.is_connect() || e.is_timeout() => {
                last_problem = e.to_string();
            }
            Err(e) => return Err(Error::Http(e.to_string())),
        }

        warn!(
            plugin = NAME,
            webhook = %hook.name,
            attempt,
            "Request failed: {}",
            last_problem
        );
        if attempt < retry.attempts {
            tokio::time::sleep(retry.backoff(attempt)).await;
        }
    }
    Err(Error::Http(format!(
        "{} failed after {} attempts: {}",
        hook.url, retry.attempts, last_problem
    )))
}
