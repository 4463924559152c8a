//! Now-playing text file
//!
//! Overwrites one file with the current TRACK label for streaming encoders
//! that display it. The text is written as Latin-1 because those encoders
//! mishandle UTF-8; em-dashes become `-` and anything else outside Latin-1
//! is dropped.

use async_trait::async_trait;
use markcast_common::config::SectionReader;
use markcast_common::{
    ConfigError, Lane, MarkerType, Plugin, PluginControl, PluginKind, Result, SubscriberQueue,
};
use tracing::{debug, error};

use super::{next_marker, Next, PluginContext};

pub const NAME: &str = "NowPlayingFile";

#[derive(Debug, Clone, PartialEq)]
pub struct NowPlayingFileConfig {
    pub path: String,
    pub delayed: bool,
}

impl NowPlayingFileConfig {
    pub fn from_table(table: &toml::Table) -> std::result::Result<Self, ConfigError> {
        let mut r = SectionReader::new(format!("plugin.{NAME}"), table);
        let path = r.required_path("path");
        let delayed = r.optional_bool("delayed", false);
        r.finish()?;
        Ok(Self { path, delayed })
    }
}

pub struct NowPlayingFile {
    config: NowPlayingFileConfig,
    queue: SubscriberQueue,
}

pub fn factory(table: &toml::Table, ctx: &PluginContext) -> Result<Box<dyn Plugin>> {
    Ok(Box::new(NowPlayingFile::from_config(table, ctx)?))
}

impl NowPlayingFile {
    pub fn from_config(table: &toml::Table, ctx: &PluginContext) -> Result<Self> {
        let config = NowPlayingFileConfig::from_table(table)?;
        let queue =
            ctx.mediator
                .subscribe(&[MarkerType::Track], NAME, Lane::select(config.delayed))?;
        Ok(Self { config, queue })
    }
}

#[async_trait]
impl Plugin for NowPlayingFile {
    fn name(&self) -> &str {
        NAME
    }

    fn kind(&self) -> PluginKind {
        PluginKind::Sink
    }

    async fn run(&mut self, control: PluginControl) -> Result<()> {
        loop {
            match next_marker(&mut self.queue, &control).await? {
                Next::Marker(marker) => {
                    debug!(plugin = NAME, marker = %marker, "Writing now-playing file");
                    let bytes = encode_latin1(marker.label());
                    if let Err(e) = tokio::fs::write(&self.config.path, bytes).await {
                        error!(plugin = NAME, "Failed to write {}: {}", self.config.path, e);
                    }
                }
                Next::Idle => continue,
                Next::Finished => break,
            }
        }
        Ok(())
    }
}

/// Latin-1 bytes for a label, em-dashes replaced, other characters dropped
pub fn encode_latin1(label: &str) -> Vec<u8> {
    label
        .replace('—', "-")
        .chars()
        .filter_map(|c| u8::try_from(u32::from(c)).ok())
        .collect()
}
