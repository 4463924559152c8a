//! Configuration file loading for markcast
//!
//! One TOML file drives a session: a required `[core]` table for the mediator
//! and logging, plus one `[plugin.<Name>]` table per plugin to load.
//!
//! ```toml
//! [core]
//! broadcast_delay = 15.0
//! log_level = "info"
//!
//! [plugin.NowPlayingFile]
//! path = "$HOME/nowplaying.txt"
//! ```
//!
//! Core values are validated in one pass so every problem is reported
//! together. Plugin tables are kept raw and validated by each plugin's
//! constructor.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use markcast_common::config::{default_config_dir, expand_env_vars, SectionReader};
use markcast_common::{ConfigError, Result, QUEUE_MAX};
use serde::Deserialize;
use tracing::info;

/// Raw file shape; values are checked afterwards
#[derive(Debug, Deserialize)]
struct TomlConfig {
    core: Option<toml::Table>,

    #[serde(default)]
    plugin: BTreeMap<String, toml::Table>,
}

/// Settings from the `[core]` table
#[derive(Debug, Clone, PartialEq)]
pub struct CoreConfig {
    /// Seconds the delayed lane lags the instant lane
    pub broadcast_delay: f64,

    /// Backlog at which a slow subscriber is disconnected
    ///
    /// Default: 100
    pub queue_max: usize,

    /// Log level (trace, debug, info, warn, error)
    ///
    /// Default: info. `RUST_LOG` overrides it.
    pub log_level: String,

    /// Log file path (logs to stderr if not specified)
    pub log_file: Option<PathBuf>,

    /// Where shell macros are loaded from and saved to
    pub macro_file: PathBuf,
}

/// Complete configuration for one session
#[derive(Debug, Clone)]
pub struct Config {
    pub core: CoreConfig,

    /// Plugin name → that plugin's raw table
    pub plugins: BTreeMap<String, toml::Table>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_macro_file() -> PathBuf {
    default_config_dir().join("macros.toml")
}

impl Config {
    /// Default config file path: `<config_dir>/markcast/markcast.toml`
    pub fn default_path() -> PathBuf {
        default_config_dir().join("markcast.toml")
    }

    /// Load and validate the configuration file
    ///
    /// # Errors
    /// `Config` with every problem found, including an unreadable file.
    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            ConfigError::single(format!("failed to read config file {}: {}", path.display(), e))
        })?;
        let config = Self::from_toml_str(&text)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let raw: TomlConfig = toml::from_str(text)
            .map_err(|e| ConfigError::single(format!("failed to parse TOML: {e}")))?;

        let Some(core) = raw.core else {
            return Err(ConfigError::single("missing the [core] table").into());
        };
        let core = CoreConfig::from_table(&core)?;

        Ok(Self {
            core,
            plugins: raw.plugin,
        })
    }
}

impl CoreConfig {
    fn from_table(table: &toml::Table) -> std::result::Result<Self, ConfigError> {
        let mut r = SectionReader::new("core", table);

        let broadcast_delay = r.required_seconds("broadcast_delay").as_secs_f64();

        let queue_max = r.optional_integer("queue_max", QUEUE_MAX as i64);
        if queue_max < 1 {
            r.invalid("queue_max", "must be at least 1");
        }

        let log_level = r.optional_str("log_level").unwrap_or_else(default_log_level);
        let log_file = r.optional_path("log_file").map(PathBuf::from);
        let macro_file = r
            .optional_path("macro_file")
            .map(PathBuf::from)
            .unwrap_or_else(default_macro_file);

        r.finish()?;
        Ok(Self {
            broadcast_delay,
            queue_max: usize::try_from(queue_max).unwrap_or(QUEUE_MAX),
            log_level,
            log_file,
            macro_file,
        })
    }
}

/// Expand `$VAR` references in a CLI-supplied path
pub fn expand_path(path: &Path) -> PathBuf {
    PathBuf::from(expand_env_vars(&path.to_string_lossy()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use markcast_common::Error;
    use serial_test::serial;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = Config::from_toml_str("[core]\nbroadcast_delay = 15\n").unwrap();
        assert_eq!(config.core.broadcast_delay, 15.0);
        assert_eq!(config.core.queue_max, QUEUE_MAX);
        assert_eq!(config.core.log_level, "info");
        assert!(config.core.log_file.is_none());
        assert!(config.core.macro_file.ends_with("macros.toml"));
        assert!(config.plugins.is_empty());
    }

    #[test]
    fn test_plugin_tables_are_kept_raw() {
        let config = Config::from_toml_str(
            r#"
            [core]
            broadcast_delay = 2.5
            queue_max = 10

            [plugin.NowPlayingFile]
            path = "/tmp/np.txt"

            [plugin.HttpPusher.webhooks.site]
            url = "http://localhost/"
            "#,
        )
        .unwrap();
        assert_eq!(config.core.queue_max, 10);
        assert_eq!(
            config.plugins.keys().collect::<Vec<_>>(),
            vec!["HttpPusher", "NowPlayingFile"]
        );
        assert_eq!(
            config.plugins["NowPlayingFile"]["path"].as_str(),
            Some("/tmp/np.txt")
        );
    }

    #[test]
    fn test_missing_core_fails() {
        let err = Config::from_toml_str("[plugin.IRC]\nnick = \"x\"\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_core_problems_are_batched() {
        let err = Config::from_toml_str(
            r#"
            [core]
            queue_max = 0
            log_level = 3
            "#,
        )
        .unwrap_err();
        let Error::Config(batch) = err else {
            panic!("expected a config error");
        };
        assert_eq!(
            batch.messages(),
            &[
                "[core] missing \"broadcast_delay\"",
                "[core] \"queue_max\" must be at least 1",
                "[core] \"log_level\" must be a string",
            ]
        );
    }

    #[test]
    fn test_negative_delay_rejected() {
        let err = Config::from_toml_str("[core]\nbroadcast_delay = -3.0\n").unwrap_err();
        assert!(err.to_string().contains("broadcast_delay"));
    }

    #[test]
    fn test_out_of_range_delay_rejected() {
        let err = Config::from_toml_str("[core]\nbroadcast_delay = 1e20\n").unwrap_err();
        let Error::Config(batch) = err else {
            panic!("expected a config error");
        };
        assert_eq!(
            batch.messages(),
            &["[core] \"broadcast_delay\" is too large a number of seconds"]
        );
    }

    #[test]
    fn test_malformed_toml_rejected() {
        assert!(matches!(
            Config::from_toml_str("[core\nbroadcast_delay = 1"),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("markcast.toml");
        std::fs::write(&path, "[core]\nbroadcast_delay = 0.5\nlog_file = \"/tmp/m.log\"\n").unwrap();
        let config = Config::load(&path).await.unwrap();
        assert_eq!(config.core.log_file, Some(PathBuf::from("/tmp/m.log")));

        let missing = Config::load(&dir.path().join("absent.toml")).await;
        assert!(matches!(missing, Err(Error::Config(_))));
    }

    #[test]
    #[serial]
    fn test_paths_expand_env_vars() {
        std::env::set_var("MARKCAST_SHOW_DIR", "/srv/fnt");
        let config = Config::from_toml_str(
            "[core]\nbroadcast_delay = 0\nmacro_file = \"$MARKCAST_SHOW_DIR/macros.toml\"\n",
        )
        .unwrap();
        assert_eq!(config.core.macro_file, PathBuf::from("/srv/fnt/macros.toml"));
        assert_eq!(
            expand_path(Path::new("${MARKCAST_SHOW_DIR}/markcast.toml")),
            PathBuf::from("/srv/fnt/markcast.toml")
        );
        std::env::remove_var("MARKCAST_SHOW_DIR");
    }
}
