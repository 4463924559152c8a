//! Icecast status poller
//!
//! Polls an Icecast `status-json.xsl` endpoint four times a second and
//! publishes a TRACK marker whenever the source's artist/title changes.
//! The first line of `prefix_file` may carry a tag in parentheses (e.g.
//! `Now streaming (FLAC)`); the text of the last such group becomes the
//! marker's `special`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use markcast_common::config::SectionReader;
use markcast_common::{
    ConfigError, Error, Marker, MarkerType, Mediator, Plugin, PluginControl, PluginKind, Result,
};
use serde_json::Value;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::PluginContext;

pub const NAME: &str = "HttpPoller";

const POLL_INTERVAL: Duration = Duration::from_millis(250);
const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub struct HttpPollerConfig {
    pub poll_url: String,
    pub prefix_file: String,
}

impl HttpPollerConfig {
    pub fn from_table(table: &toml::Table) -> std::result::Result<Self, ConfigError> {
        let mut r = SectionReader::new(format!("plugin.{NAME}"), table);
        let poll_url = r.required_str("poll_url");
        let prefix_file = r.required_path("prefix_file");
        r.finish()?;
        Ok(Self {
            poll_url,
            prefix_file,
        })
    }
}

/// Artist and title reported by the streaming server
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Track {
    pub artist: String,
    pub title: String,
}

impl Track {
    pub fn label(&self) -> String {
        format!("{} — {}", self.artist, self.title)
    }

    fn is_blank(&self) -> bool {
        self.artist.trim().is_empty() || self.title.trim().is_empty()
    }
}

/// Pull `icestats.source.{artist,title}` out of an Icecast status document
pub fn track_from_status(status: &Value) -> Option<Track> {
    let source = status.get("icestats")?.get("source")?;
    if !source.is_object() {
        return None;
    }
    let text = |v: &Value| match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    Some(Track {
        artist: text(source.get("artist")?),
        title: text(source.get("title")?),
    })
}

/// Text inside the last parenthesised group of a line
pub fn special_from_line(line: &str) -> Option<String> {
    let line = line.lines().next().unwrap_or_default();
    let close = line.rfind(')')?;
    let open = line[..close].rfind('(')?;
    Some(line[open + 1..close].to_string())
}

pub struct HttpPoller {
    config: HttpPollerConfig,
    mediator: Arc<Mediator>,
    client: reqwest::Client,
    last_track: Track,
}

pub fn factory(table: &toml::Table, ctx: &PluginContext) -> Result<Box<dyn Plugin>> {
    Ok(Box::new(HttpPoller::from_config(table, ctx)?))
}

impl HttpPoller {
    pub fn from_config(table: &toml::Table, ctx: &PluginContext) -> Result<Self> {
        let config = HttpPollerConfig::from_table(table)?;
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(Self {
            config,
            mediator: Arc::clone(&ctx.mediator),
            client,
            last_track: Track::default(),
        })
    }

    async fn poll_server(&self) -> Result<Value> {
        let response = self
            .client
            .get(&self.config.poll_url)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        response
            .json::<Value>()
            .await
            .map_err(|e| Error::Http(format!("invalid JSON from server: {e}")))
    }

    async fn read_special(&self) -> Option<String> {
        let text = tokio::fs::read_to_string(&self.config.prefix_file).await.ok()?;
        special_from_line(&text)
    }

    /// One poll; publishes when the track changed
    async fn run_cycle(&mut self) -> Result<()> {
        let status = match self.poll_server().await {
            Ok(status) => status,
            Err(e) => {
                info!(plugin = NAME, "Polling server failed: {}", e);
                return Ok(());
            }
        };
        let Some(track) = track_from_status(&status) else {
            debug!(plugin = NAME, "No track in server status");
            return Ok(());
        };
        if track == self.last_track || track.is_blank() {
            return Ok(());
        }

        let mut marker = Marker::with_track(track.label(), &track.artist, &track.title)?;
        marker.special = self.read_special().await;
        info!(plugin = NAME, marker = %marker, "New track");
        self.mediator.publish(MarkerType::Track, marker)?;
        self.last_track = track;
        Ok(())
    }
}

#[async_trait]
impl Plugin for HttpPoller {
    fn name(&self) -> &str {
        NAME
    }

    fn kind(&self) -> PluginKind {
        PluginKind::Source
    }

    async fn run(&mut self, control: PluginControl) -> Result<()> {
        info!(plugin = NAME, "Polling {}", self.config.poll_url);
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !control.should_terminate() {
            tokio::select! {
                _ = ticker.tick() => {
                    if control.is_enabled() {
                        self.run_cycle().await?;
                    }
                }
                _ = control.cancelled() => break,
            }
        }
        Ok(())
    }
}
