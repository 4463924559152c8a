//! Plugin manager
//!
//! Builds every plugin named in the config from the compiled-in factory
//! registry, activates them, and gives the control shell access to them by
//! name. A plugin whose config is invalid (or whose name is unknown) is
//! logged and skipped; the rest still run.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use markcast_common::{Error, Mediator, PluginHandle, Result};
use tracing::{error, info, warn};

use crate::plugins::{builtin_factories, PluginContext, PluginFactory};

pub struct PluginManager {
    context: PluginContext,
    factories: HashMap<&'static str, PluginFactory>,
    plugins: Vec<PluginHandle>,
}

impl PluginManager {
    /// Manager over the built-in plugins
    pub fn new(context: PluginContext) -> Self {
        Self::with_factories(context, builtin_factories())
    }

    /// Manager over an explicit factory set
    pub fn with_factories(
        context: PluginContext,
        factories: Vec<(&'static str, PluginFactory)>,
    ) -> Self {
        Self {
            context,
            factories: factories.into_iter().collect(),
            plugins: Vec::new(),
        }
    }

    pub fn mediator(&self) -> &Arc<Mediator> {
        &self.context.mediator
    }

    /// Construct every configured plugin
    ///
    /// Returns how many were constructed.
    pub fn load_all(&mut self, configs: &BTreeMap<String, toml::Table>) -> usize {
        for (name, table) in configs {
            let Some(factory) = self.factories.get(name.as_str()) else {
                warn!(plugin = %name, "No such plugin, skipping its config section");
                continue;
            };
            if self.plugin_by_name(name).is_some() {
                warn!(plugin = %name, "Plugin already loaded, skipping");
                continue;
            }
            match factory(table, &self.context) {
                Ok(plugin) => {
                    info!(plugin = %name, kind = %plugin.kind(), "Plugin loaded");
                    self.plugins.push(PluginHandle::new(plugin));
                }
                Err(Error::Config(problems)) => {
                    error!(plugin = %name, "Invalid configuration, plugin skipped:\n{}", problems);
                }
                Err(e) => error!(plugin = %name, "Plugin failed to load: {}", e),
            }
        }
        self.plugins.len()
    }

    /// Start every constructed plugin on its own task
    pub fn activate_all(&self) {
        for plugin in &self.plugins {
            if let Err(e) = plugin.activate() {
                warn!(plugin = plugin.name(), "Not activated: {}", e);
            }
        }
    }

    /// Load then activate everything in the config
    pub fn run_all(&mut self, configs: &BTreeMap<String, toml::Table>) -> usize {
        let loaded = self.load_all(configs);
        self.activate_all();
        info!(plugins = loaded, "Plugins running");
        loaded
    }

    pub fn all_plugins(&self) -> &[PluginHandle] {
        &self.plugins
    }

    pub fn plugin_by_name(&self, name: &str) -> Option<&PluginHandle> {
        self.plugins.iter().find(|p| p.name() == name)
    }

    /// Enable a plugin; returns false if it was already enabled
    ///
    /// # Errors
    /// `InvalidArgument` if no plugin has that name.
    pub fn enable_by_name(&self, name: &str) -> Result<bool> {
        let plugin = self.require(name)?;
        if plugin.is_enabled() {
            return Ok(false);
        }
        plugin.enable();
        Ok(true)
    }

    /// Disable a plugin; returns false if it was already disabled
    pub fn disable_by_name(&self, name: &str) -> Result<bool> {
        let plugin = self.require(name)?;
        if !plugin.is_enabled() {
            return Ok(false);
        }
        plugin.disable();
        Ok(true)
    }

    /// Ask every plugin to stop; does not wait
    pub fn deactivate_all(&self) {
        for plugin in &self.plugins {
            plugin.deactivate();
        }
    }

    /// Wait for every plugin's run loop to finish
    pub async fn join_all(&self) {
        for plugin in &self.plugins {
            plugin.join().await;
        }
    }

    /// Full shutdown: close every queue, stop every plugin, wait for them
    pub async fn shutdown(&self) {
        info!("Shutting down");
        self.context.mediator.terminate();
        self.deactivate_all();
        self.join_all().await;
        info!("All plugins stopped");
    }

    fn require(&self, name: &str) -> Result<&PluginHandle> {
        self.plugin_by_name(name)
            .ok_or_else(|| Error::InvalidArgument(format!("nonexistent plugin \"{name}\"")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::show::Show;
    use async_trait::async_trait;
    use markcast_common::config::SectionReader;
    use markcast_common::{Plugin, PluginControl, PluginKind, PluginState};

    struct Dummy;

    #[async_trait]
    impl Plugin for Dummy {
        fn name(&self) -> &str {
            "Dummy"
        }

        fn kind(&self) -> PluginKind {
            PluginKind::Source
        }

        async fn run(&mut self, control: PluginControl) -> Result<()> {
            control.cancelled().await;
            Ok(())
        }
    }

    fn dummy_factory(table: &toml::Table, _ctx: &PluginContext) -> Result<Box<dyn Plugin>> {
        let mut r = SectionReader::new("plugin.Dummy", table);
        r.required_bool("ok");
        r.finish()?;
        Ok(Box::new(Dummy))
    }

    fn manager() -> PluginManager {
        let context = PluginContext {
            mediator: Arc::new(Mediator::new(0.0).unwrap()),
            show: Show::parse("fnt-1"),
        };
        PluginManager::with_factories(context, vec![("Dummy", dummy_factory as PluginFactory)])
    }

    fn configs(src: &str) -> BTreeMap<String, toml::Table> {
        let table: toml::Table = src.parse().unwrap();
        table
            .into_iter()
            .map(|(k, v)| (k, v.as_table().unwrap().clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_unknown_and_invalid_plugins_are_skipped() {
        let mut manager = manager();
        assert_eq!(manager.load_all(&configs("[Nope]\nx = 1\n[Dummy]\nok = 3\n")), 0);
        assert!(manager.all_plugins().is_empty());
    }

    #[tokio::test]
    async fn test_run_enable_disable_shutdown() {
        let mut manager = manager();
        assert_eq!(manager.run_all(&configs("[Dummy]\nok = true\n")), 1);
        let plugin = manager.plugin_by_name("Dummy").unwrap();
        assert_eq!(plugin.state(), PluginState::Running);

        assert!(!manager.enable_by_name("Dummy").unwrap());
        assert!(manager.disable_by_name("Dummy").unwrap());
        assert!(!manager.disable_by_name("Dummy").unwrap());
        assert!(!manager.plugin_by_name("Dummy").unwrap().is_enabled());
        assert!(manager.enable_by_name("Dummy").unwrap());
        assert!(matches!(
            manager.enable_by_name("Ghost"),
            Err(Error::InvalidArgument(_))
        ));

        manager.shutdown().await;
        assert_eq!(
            manager.plugin_by_name("Dummy").unwrap().state(),
            PluginState::Stopped
        );
        assert_eq!(
            manager.mediator().state(),
            markcast_common::MediatorState::Terminated
        );
    }
}
