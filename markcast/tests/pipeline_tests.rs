//! End-to-end tests: config file → plugin manager → mediator → sink files

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use markcast::{Config, Flow, PluginContext, PluginManager, Shell, Show};
use markcast_common::{Marker, MarkerType, Mediator, PluginState};
use tempfile::TempDir;

fn session(config_text: &str, show: &str) -> Arc<PluginManager> {
    let config = Config::from_toml_str(config_text).unwrap();
    let mediator = Arc::new(
        Mediator::with_queue_max(config.core.broadcast_delay, config.core.queue_max).unwrap(),
    );
    let mut manager = PluginManager::new(PluginContext {
        mediator,
        show: Show::parse(show),
    });
    manager.run_all(&config.plugins);
    Arc::new(manager)
}

fn toml_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

#[tokio::test]
async fn test_file_sinks_from_config() {
    let dir = TempDir::new().unwrap();
    let config = format!(
        r#"
[core]
broadcast_delay = 0.0

[plugin.AudacityLabels]
path = "{dir}/{{show}}-{{count}}.txt"

[plugin.NowPlayingFile]
path = "{dir}/nowplaying.txt"

[plugin.NoSuchPlugin]
x = 1
"#,
        dir = toml_path(dir.path())
    );
    let manager = session(&config, "fnt-42");
    assert_eq!(manager.all_plugins().len(), 2);

    let mediator = Arc::clone(manager.mediator());
    for label in ["Justice — Genesis", "Daft Punk — Touch"] {
        mediator
            .publish(MarkerType::Track, Marker::new(label).unwrap())
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(
        std::fs::read(dir.path().join("nowplaying.txt")).unwrap(),
        b"Daft Punk - Touch".to_vec()
    );

    manager.shutdown().await;
    for plugin in manager.all_plugins() {
        assert_eq!(plugin.state(), PluginState::Stopped);
    }

    let labels = std::fs::read_to_string(dir.path().join("fnt-42-0.txt")).unwrap();
    let labels: Vec<&str> = labels
        .lines()
        .map(|l| l.rsplit('\t').next().unwrap())
        .collect();
    assert_eq!(labels, vec!["Justice — Genesis", "Daft Punk — Touch"]);
}

#[tokio::test]
async fn test_delayed_sink_waits_for_broadcast_delay() {
    let dir = TempDir::new().unwrap();
    let config = format!(
        r#"
[core]
broadcast_delay = 0.5

[plugin.NowPlayingFile]
path = "{}/nowplaying.txt"
delayed = true
"#,
        toml_path(dir.path())
    );
    let manager = session(&config, "fnt-1");
    let path = dir.path().join("nowplaying.txt");

    manager
        .mediator()
        .publish(MarkerType::Track, Marker::new("Late Song").unwrap())
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!path.exists());

    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(std::fs::read(&path).unwrap(), b"Late Song".to_vec());

    manager.shutdown().await;
}

#[tokio::test]
async fn test_shell_controls_running_session() {
    let dir = TempDir::new().unwrap();
    let config = format!(
        r#"
[core]
broadcast_delay = 0.0

[plugin.NowPlayingFile]
path = "{}/nowplaying.txt"
"#,
        toml_path(dir.path())
    );
    let manager = session(&config, "fnt-1");
    let path = dir.path().join("nowplaying.txt");
    let mut shell = Shell::new(Arc::clone(&manager), dir.path().join("macros.toml"));
    let mut out = Vec::new();

    shell.handle_line("inject track First", &mut out);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(std::fs::read(&path).unwrap(), b"First".to_vec());

    shell.handle_line("disable NowPlayingFile", &mut out);
    shell.handle_line("inject TRACK Ignored", &mut out);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(std::fs::read(&path).unwrap(), b"First".to_vec());

    shell.handle_line("enable NowPlayingFile", &mut out);
    shell.handle_line("squelch", &mut out);
    shell.handle_line("inject TRACK Squelched", &mut out);
    shell.handle_line("inject TRACK Second", &mut out);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(std::fs::read(&path).unwrap(), b"Second".to_vec());

    assert!(out.is_empty(), "unexpected shell output: {out:?}");
    assert_eq!(shell.handle_line("quit", &mut out), Flow::Quit);

    manager.shutdown().await;
    shell.save_macros().await.unwrap();
    assert!(dir.path().join("macros.toml").exists());
}
