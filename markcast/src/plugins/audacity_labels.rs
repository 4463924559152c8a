//! Audacity label-track writer
//!
//! Turns consecutive TRACK markers into Audacity label lines
//! (`start\tend\tlabel`): each marker's label spans from its own time to the
//! next marker's time. The last marker is written as a zero-length label
//! when the plugin shuts down.
//!
//! `path` may contain `{show}` and `{count}`. With `{count}` the first count
//! whose file does not exist yet is used, so restarts never clobber earlier
//! labels. Without it, a `PROGRAM RESTART` label is appended to the existing
//! file instead.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use markcast_common::config::SectionReader;
use markcast_common::{
    ConfigError, Lane, Marker, MarkerType, Plugin, PluginControl, PluginKind, Result,
    SubscriberQueue,
};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

use super::{next_marker, Next, PluginContext};
use crate::show::Show;

pub const NAME: &str = "AudacityLabels";

const RESTART_LABEL: &str = "PROGRAM RESTART";

#[derive(Debug, Clone, PartialEq)]
pub struct AudacityLabelsConfig {
    /// Output path template, env vars already expanded
    pub path: String,
    pub delayed: bool,
}

impl AudacityLabelsConfig {
    pub fn from_table(table: &toml::Table) -> std::result::Result<Self, ConfigError> {
        let mut r = SectionReader::new(format!("plugin.{NAME}"), table);
        let path = r.required_path("path");
        let delayed = r.optional_bool("delayed", false);
        r.finish()?;
        Ok(Self { path, delayed })
    }
}

pub struct AudacityLabels {
    config: AudacityLabelsConfig,
    show: Show,
    queue: SubscriberQueue,
    last_marker: Option<Arc<Marker>>,
}

pub fn factory(table: &toml::Table, ctx: &PluginContext) -> Result<Box<dyn Plugin>> {
    Ok(Box::new(AudacityLabels::from_config(table, ctx)?))
}

impl AudacityLabels {
    pub fn from_config(table: &toml::Table, ctx: &PluginContext) -> Result<Self> {
        let config = AudacityLabelsConfig::from_table(table)?;
        debug!(plugin = NAME, "Configuration valid");
        let queue =
            ctx.mediator
                .subscribe(&[MarkerType::Track], NAME, Lane::select(config.delayed))?;
        Ok(Self {
            config,
            show: ctx.show.clone(),
            queue,
            last_marker: None,
        })
    }

    async fn record(&mut self, path: &Path, marker: Arc<Marker>) {
        debug!(plugin = NAME, marker = %marker, "Received marker");
        if let Some(previous) = self.last_marker.replace(Arc::clone(&marker)) {
            let line = label_line(
                previous.time().unwrap_or(0.0),
                marker.time().unwrap_or(0.0),
                previous.label(),
            );
            if let Err(e) = append(path, &line).await {
                error!(plugin = NAME, "Failed to write label to {}: {}", path.display(), e);
            }
        }
    }
}

#[async_trait]
impl Plugin for AudacityLabels {
    fn name(&self) -> &str {
        NAME
    }

    fn kind(&self) -> PluginKind {
        PluginKind::Sink
    }

    async fn run(&mut self, control: PluginControl) -> Result<()> {
        let path = prepare_output(&self.config.path, &self.show).await?;
        info!(plugin = NAME, "Using {} as the label file", path.display());

        loop {
            match next_marker(&mut self.queue, &control).await? {
                Next::Marker(marker) => self.record(&path, marker).await,
                Next::Idle => continue,
                Next::Finished => break,
            }
        }

        match &self.last_marker {
            Some(last) => {
                info!(plugin = NAME, "Writing final label");
                let time = last.time().unwrap_or(0.0);
                append(&path, &label_line(time, time, last.label())).await?;
            }
            None => warn!(plugin = NAME, "No markers received, no final label written"),
        }
        Ok(())
    }
}

/// One Audacity label line
pub fn label_line(start: f64, end: f64, label: &str) -> String {
    format!("{start:.6}\t{end:.6}\t{label}\n")
}

/// Pick the output file for this run
///
/// With `{count}` in the template, returns the first unused count. Without
/// it, appends a restart label to the fixed path and returns it.
pub async fn prepare_output(template: &str, show: &Show) -> Result<PathBuf> {
    let with_show = template.replace("{show}", show.name());

    if !with_show.contains("{count}") {
        info!(plugin = NAME, "Label path has no {{count}}, writing restart label");
        let path = PathBuf::from(with_show);
        append(&path, &label_line(0.0, 0.0, RESTART_LABEL)).await?;
        return Ok(path);
    }

    let mut count: u32 = 0;
    loop {
        let path = PathBuf::from(with_show.replace("{count}", &count.to_string()));
        if !tokio::fs::try_exists(&path).await? {
            return Ok(path);
        }
        count += 1;
    }
}

async fn append(path: &Path, line: &str) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.flush().await
}
