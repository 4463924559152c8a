//! Built-in plugins
//!
//! Sinks: [`AudacityLabels`], [`NowPlayingFile`], [`HttpPusher`], [`Irc`].
//! Sources: [`HttpPoller`], [`SomaFm`].
//!
//! Every plugin is built from its `[plugin.<Name>]` table by a factory in
//! [`builtin_factories`]. Constructors validate config and, for sinks,
//! subscribe; I/O waits until the plugin's run loop.

use std::sync::Arc;
use std::time::Duration;

use markcast_common::{Error, Marker, Mediator, Plugin, PluginControl, Result, SubscriberQueue};

use crate::show::Show;

pub mod audacity_labels;
pub mod http_poller;
pub mod http_pusher;
pub mod irc;
pub mod now_playing_file;
pub mod somafm;

#[cfg(test)]
pub(crate) mod test_http;

pub use audacity_labels::AudacityLabels;
pub use http_poller::HttpPoller;
pub use http_pusher::HttpPusher;
pub use irc::Irc;
pub use now_playing_file::NowPlayingFile;
pub use somafm::SomaFm;

/// How long a sink waits on its queue before re-checking for termination
pub const LISTEN_TIMEOUT: Duration = Duration::from_millis(200);

/// What every plugin is handed at construction
#[derive(Debug, Clone)]
pub struct PluginContext {
    pub mediator: Arc<Mediator>,
    pub show: Show,
}

/// Builds one plugin from its config table
pub type PluginFactory = fn(&toml::Table, &PluginContext) -> Result<Box<dyn Plugin>>;

/// Every plugin compiled into this build, by config name
pub fn builtin_factories() -> Vec<(&'static str, PluginFactory)> {
    vec![
        (audacity_labels::NAME, audacity_labels::factory as PluginFactory),
        (now_playing_file::NAME, now_playing_file::factory as PluginFactory),
        (http_pusher::NAME, http_pusher::factory as PluginFactory),
        (irc::NAME, irc::factory as PluginFactory),
        (http_poller::NAME, http_poller::factory as PluginFactory),
        (somafm::NAME, somafm::factory as PluginFactory),
    ]
}

/// One step of a sink's run loop
#[derive(Debug)]
pub(crate) enum Next {
    /// A marker to act on (only handed out while enabled)
    Marker(Arc<Marker>),
    /// Nothing to do this round
    Idle,
    /// Unsubscribed or asked to terminate: leave the loop
    Finished,
}

/// Wait up to [`LISTEN_TIMEOUT`] for the next marker
///
/// Markers that arrive while the plugin is disabled are drained and dropped.
pub(crate) async fn next_marker(
    queue: &mut SubscriberQueue,
    control: &PluginControl,
) -> Result<Next> {
    if control.should_terminate() {
        return Ok(Next::Finished);
    }
    match queue.listen_timeout(LISTEN_TIMEOUT).await {
        Ok(Some(marker)) if control.is_enabled() => Ok(Next::Marker(marker)),
        Ok(Some(_)) | Ok(None) => Ok(Next::Idle),
        Err(Error::Unsubscribed) => Ok(Next::Finished),
        Err(e) => Err(e),
    }
}
