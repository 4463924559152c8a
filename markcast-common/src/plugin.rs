//! Plugin contract and lifecycle
//!
//! A plugin is either a source (publishes markers) or a sink (subscribes and
//! consumes them). Each activated plugin runs as its own tokio task. The
//! controller and the plugin share a [`PluginControl`] carrying two flags:
//! `enabled`, toggled from the control shell, and a cancellation token that
//! asks the plugin to leave its run loop.
//!
//! Lifecycle: Constructed → Running → (Terminating) → Stopped.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{Error, Result};

/// Source or sink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginKind {
    Source,
    Sink,
}

impl fmt::Display for PluginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginKind::Source => f.write_str("source"),
            PluginKind::Sink => f.write_str("sink"),
        }
    }
}

/// Observed lifecycle state of a plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginState {
    /// Built and configured, not yet running
    Constructed,
    /// Run loop active
    Running,
    /// Asked to stop, run loop not yet finished
    Terminating,
    /// Run loop finished
    Stopped,
}

/// Flags shared between a running plugin and its controller
///
/// Cheap to clone; every clone observes the same flags.
#[derive(Debug, Clone)]
pub struct PluginControl {
    enabled: Arc<AtomicBool>,
    terminate: CancellationToken,
}

impl PluginControl {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: Arc::new(AtomicBool::new(enabled)),
            terminate: CancellationToken::new(),
        }
    }

    /// Whether the plugin should act on markers right now
    ///
    /// A disabled plugin keeps running and keeps draining its inputs; it just
    /// does nothing with them.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    /// True once the plugin has been asked to leave its run loop
    pub fn should_terminate(&self) -> bool {
        self.terminate.is_cancelled()
    }

    /// Ask the plugin to stop at its next check
    pub fn deactivate(&self) {
        self.terminate.cancel();
    }

    /// Resolves once `deactivate` has been called
    ///
    /// For use in `tokio::select!` around long waits (network reads,
    /// intervals) so a plugin does not sit out its whole wait after shutdown.
    pub async fn cancelled(&self) {
        self.terminate.cancelled().await
    }
}

impl Default for PluginControl {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Behaviour every plugin provides
///
/// Constructors validate configuration and fail early; nothing should touch
/// the network or the filesystem until `run`.
#[async_trait]
pub trait Plugin: Send {
    /// Unique name, also used as the subscriber id
    fn name(&self) -> &str;

    fn kind(&self) -> PluginKind;

    /// Initial value of the `enabled` flag
    fn starts_enabled(&self) -> bool {
        true
    }

    /// Body of the plugin's task
    ///
    /// Sinks return when their queue reports `Unsubscribed` or when
    /// `control.should_terminate()` becomes true, after flushing any final
    /// output. Sources return when `control.should_terminate()` becomes true.
    async fn run(&mut self, control: PluginControl) -> Result<()>;
}

enum Slot {
    Constructed(Box<dyn Plugin>),
    Running(JoinHandle<()>),
    Stopped,
}

/// Controller-side handle on one plugin
pub struct PluginHandle {
    name: String,
    kind: PluginKind,
    control: PluginControl,
    slot: Mutex<Slot>,
}

impl PluginHandle {
    pub fn new(plugin: Box<dyn Plugin>) -> Self {
        let control = PluginControl::new(plugin.starts_enabled());
        Self {
            name: plugin.name().to_string(),
            kind: plugin.kind(),
            control,
            slot: Mutex::new(Slot::Constructed(plugin)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> PluginKind {
        self.kind
    }

    pub fn control(&self) -> &PluginControl {
        &self.control
    }

    pub fn is_enabled(&self) -> bool {
        self.control.is_enabled()
    }

    pub fn enable(&self) {
        self.control.enable();
        info!(plugin = %self.name, "Plugin enabled");
    }

    pub fn disable(&self) {
        self.control.disable();
        info!(plugin = %self.name, "Plugin disabled");
    }

    /// Start the plugin's run loop on its own task
    ///
    /// Must be called inside a tokio runtime.
    ///
    /// # Errors
    /// `InvalidState` if the plugin was already activated.
    pub fn activate(&self) -> Result<()> {
        let mut slot = self.slot.lock();
        let mut plugin = match std::mem::replace(&mut *slot, Slot::Stopped) {
            Slot::Constructed(plugin) => plugin,
            other => {
                *slot = other;
                return Err(Error::InvalidState(format!(
                    "plugin {} already activated",
                    self.name
                )));
            }
        };

        let control = self.control.clone();
        let name = self.name.clone();
        info!(plugin = %name, kind = %self.kind, "Activating plugin");
        let handle = tokio::spawn(async move {
            match plugin.run(control).await {
                Ok(()) => debug!(plugin = %name, "Plugin run loop finished"),
                Err(e) => error!(plugin = %name, "Plugin failed: {}", e),
            }
        });
        *slot = Slot::Running(handle);
        Ok(())
    }

    /// Ask the plugin to stop. Does not wait for it.
    pub fn deactivate(&self) {
        debug!(plugin = %self.name, "Deactivating plugin");
        self.control.deactivate();
    }

    /// Wait for the run loop to finish
    ///
    /// Returns immediately for a plugin that was never activated.
    pub async fn join(&self) {
        let handle = {
            let mut slot = self.slot.lock();
            match std::mem::replace(&mut *slot, Slot::Stopped) {
                Slot::Running(handle) => handle,
                other => {
                    *slot = other;
                    return;
                }
            }
        };
        if let Err(e) = handle.await {
            error!(plugin = %self.name, "Plugin task panicked: {}", e);
        }
        info!(plugin = %self.name, "Plugin stopped");
    }

    pub fn state(&self) -> PluginState {
        match &*self.slot.lock() {
            Slot::Constructed(_) => PluginState::Constructed,
            Slot::Running(handle) if handle.is_finished() => PluginState::Stopped,
            Slot::Running(_) if self.control.should_terminate() => PluginState::Terminating,
            Slot::Running(_) => PluginState::Running,
            Slot::Stopped => PluginState::Stopped,
        }
    }
}

impl fmt::Debug for PluginHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginHandle")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("enabled", &self.is_enabled())
            .field("state", &self.state())
            .finish()
    }
}
