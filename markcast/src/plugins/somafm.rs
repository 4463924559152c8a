//! ICY stream metadata source
//!
//! Connects to a Shoutcast/Icecast stream (such as a SomaFM channel) with
//! `Icy-MetaData: 1`, skips the audio, and reads the `StreamTitle` out of
//! each metadata block. A changed title is published as a TRACK marker after
//! `extra_delay` seconds, labelled `marker_prefix + title` with the
//! configured `source_name` as its special.
//!
//! The stream is read even while the plugin is disabled, so the server never
//! stalls on a full socket buffer; titles seen while disabled are dropped.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use markcast_common::config::SectionReader;
use markcast_common::{
    ConfigError, Error, Marker, MarkerType, Mediator, Plugin, PluginControl, PluginKind, Result,
};
use tracing::{debug, info, warn};

use super::PluginContext;

pub const NAME: &str = "SomaFM";

const USER_AGENT: &str = concat!("markcast/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, PartialEq)]
pub struct SomaFmConfig {
    pub stream_url: String,
    pub source_name: String,
    /// Time between seeing a title and publishing it
    pub extra_delay: Duration,
    pub start_disabled: bool,
    pub marker_prefix: String,
}

impl SomaFmConfig {
    pub fn from_table(table: &toml::Table) -> std::result::Result<Self, ConfigError> {
        let mut r = SectionReader::new(format!("plugin.{NAME}"), table);
        let stream_url = r.required_str("stream_url");
        let source_name = r.required_str("source_name");
        let extra_delay = r.required_seconds("extra_delay");
        let start_disabled = r.required_bool("start_disabled");
        let marker_prefix = r.required_str("marker_prefix").trim_matches('"').to_string();
        r.finish()?;
        Ok(Self {
            stream_url,
            source_name,
            extra_delay,
            start_disabled,
            marker_prefix,
        })
    }
}

#[derive(Debug)]
enum IcyState {
    /// Audio bytes left before the next length byte
    Audio(usize),
    /// Next byte is the metadata length in 16-byte units
    Length,
    /// Metadata bytes left, and what has been collected so far
    Metadata(usize, Vec<u8>),
}

/// Splits an ICY byte stream into metadata blocks
///
/// Feed it chunks of any size as they arrive; complete non-empty metadata
/// blocks come back as strings.
#[derive(Debug)]
pub struct IcyMetadataReader {
    interval: usize,
    state: IcyState,
}

impl IcyMetadataReader {
    /// # Arguments
    /// * `interval` - Audio bytes between metadata blocks (`Icy-MetaInt`)
    pub fn new(interval: usize) -> Self {
        Self {
            interval,
            state: IcyState::Audio(interval),
        }
    }

    pub fn feed(&mut self, mut chunk: &[u8]) -> Vec<String> {
        let mut blocks = Vec::new();
        while !chunk.is_empty() {
            match &mut self.state {
                IcyState::Audio(remaining) => {
                    let skip = (*remaining).min(chunk.len());
                    *remaining -= skip;
                    chunk = &chunk[skip..];
                    if *remaining == 0 {
                        self.state = IcyState::Length;
                    }
                }
                IcyState::Length => {
                    let len = usize::from(chunk[0]) * 16;
                    chunk = &chunk[1..];
                    self.state = if len == 0 {
                        IcyState::Audio(self.interval)
                    } else {
                        IcyState::Metadata(len, Vec::with_capacity(len))
                    };
                }
                IcyState::Metadata(remaining, buf) => {
                    let take = (*remaining).min(chunk.len());
                    buf.extend_from_slice(&chunk[..take]);
                    *remaining -= take;
                    chunk = &chunk[take..];
                    if *remaining == 0 {
                        let text = String::from_utf8_lossy(buf).into_owned();
                        blocks.push(text);
                        self.state = IcyState::Audio(self.interval);
                    }
                }
            }
        }
        blocks
    }
}

/// Title from a `StreamTitle='...';` metadata block
///
/// The title ends at the first `';` that is followed by a non-whitespace
/// character or by the end of the block, so titles containing `';` followed
/// by a space survive.
pub fn stream_title(metadata: &str) -> Option<&str> {
    const KEY: &str = "StreamTitle='";
    let start = metadata.find(KEY)? + KEY.len();
    let rest = &metadata[start..];
    rest.match_indices("';")
        .find(|(pos, _)| {
            rest[pos + 2..]
                .chars()
                .next()
                .map_or(true, |c| !c.is_whitespace())
        })
        .map(|(pos, _)| &rest[..pos])
}

pub struct SomaFm {
    config: SomaFmConfig,
    mediator: Arc<Mediator>,
    last_title: String,
}

pub fn factory(table: &toml::Table, ctx: &PluginContext) -> Result<Box<dyn Plugin>> {
    Ok(Box::new(SomaFm::from_config(table, ctx)?))
}

impl SomaFm {
    pub fn from_config(table: &toml::Table, ctx: &PluginContext) -> Result<Self> {
        let config = SomaFmConfig::from_table(table)?;
        Ok(Self {
            config,
            mediator: Arc::clone(&ctx.mediator),
            last_title: String::new(),
        })
    }

    /// New title from one metadata block, if it changed
    fn next_title(&mut self, metadata: &str) -> Option<String> {
        let title = stream_title(metadata)?;
        if title == self.last_title {
            debug!(plugin = NAME, "Title unchanged");
            return None;
        }
        info!(plugin = NAME, "New track: {}", title);
        self.last_title = title.to_string();
        Some(self.last_title.clone())
    }

    fn schedule_publish(&self, title: &str) -> Result<()> {
        let mut marker = Marker::new(format!("{}{}", self.config.marker_prefix, title))?;
        marker.special = Some(self.config.source_name.clone());
        let mediator = Arc::clone(&self.mediator);
        let delay = self.config.extra_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = mediator.publish(MarkerType::Track, marker) {
                warn!(plugin = NAME, "Failed to publish marker: {}", e);
            }
        });
        debug!(plugin = NAME, "Started delayed publish");
        Ok(())
    }
}

#[async_trait]
impl Plugin for SomaFm {
    fn name(&self) -> &str {
        NAME
    }

    fn kind(&self) -> PluginKind {
        PluginKind::Source
    }

    fn starts_enabled(&self) -> bool {
        !self.config.start_disabled
    }

    async fn run(&mut self, control: PluginControl) -> Result<()> {
        info!(plugin = NAME, "Connecting to {}", self.config.stream_url);
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        let mut response = client
            .get(&self.config.stream_url)
            .header("Icy-MetaData", "1")
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        let interval = response
            .headers()
            .get("icy-metaint")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<usize>().ok())
            .filter(|n| *n > 0)
            .ok_or_else(|| {
                Error::Http(format!(
                    "{} sent no usable Icy-MetaInt header",
                    self.config.stream_url
                ))
            })?;
        debug!(plugin = NAME, interval, "Metadata interval");
        let mut reader = IcyMetadataReader::new(interval);

        while !control.should_terminate() {
            let chunk = tokio::select! {
                chunk = response.chunk() => chunk.map_err(|e| Error::Http(e.to_string()))?,
                _ = control.cancelled() => break,
            };
            let Some(chunk) = chunk else {
                warn!(plugin = NAME, "Stream ended");
                break;
            };
            for block in reader.feed(&chunk) {
                debug!(plugin = NAME, metadata = %block, "Metadata block");
                let Some(title) = self.next_title(&block) else {
                    continue;
                };
                if control.is_enabled() {
                    self.schedule_publish(&title)?;
                }
            }
        }
        debug!(plugin = NAME, "Closing stream");
        Ok(())
    }
}
