//! Interactive control shell
//!
//! Reads one command per line and acts on the mediator and the loaded
//! plugins. `define <name>` records the following commands, up to `end`,
//! as a macro; typing the macro's name replays them. Macros are kept in a
//! TOML file between runs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use markcast_common::{Error, Marker, MarkerType, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::manager::PluginManager;

const PREFIX: &str = "markcast: ";

const HELP: &str = "\
Commands:
\tsquelch              drop the next published marker
\tstop                 drop markers until start
\tstart                resume publishing
\tenable <plugin>      enable a plugin
\tdisable <plugin>     disable a plugin
\tinject <TYPE> <text> publish a marker by hand
\tdefine <macro>       record commands until `end`
\tundefine <macro>     forget a macro
\tlist [macros|plugins]
\thelp
\tquit";

/// What the caller does after a line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Listing {
    All,
    Macros,
    Plugins,
}

/// One parsed shell line
#[derive(Debug, Clone, PartialEq)]
enum Command {
    Squelch,
    Stop,
    Start,
    Enable(String),
    Disable(String),
    Inject(MarkerType, String),
    Define(String),
    Undefine(String),
    List(Listing),
    Help,
    Quit,
    End,
    Replay(String),
}

impl Command {
    /// Parse a non-empty, trimmed line; the error is the message to print
    fn parse(line: &str) -> std::result::Result<Command, String> {
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };
        let single_name = |cmd: &str| {
            if rest.is_empty() || rest.contains(char::is_whitespace) {
                Err(format!("{cmd}: invalid command format"))
            } else {
                Ok(rest.to_string())
            }
        };
        let bare = |cmd: Command| {
            if rest.is_empty() {
                Ok(cmd)
            } else {
                Err(format!("{word}: takes no arguments"))
            }
        };

        match word {
            "squelch" => bare(Command::Squelch),
            "stop" => bare(Command::Stop),
            "start" => bare(Command::Start),
            "help" => bare(Command::Help),
            "quit" => bare(Command::Quit),
            "end" => bare(Command::End),
            "enable" => single_name("enable").map(Command::Enable),
            "disable" => single_name("disable").map(Command::Disable),
            "undefine" => single_name("undefine").map(Command::Undefine),
            "define" => {
                if rest.contains(char::is_whitespace) {
                    Err("define: spaces not permitted in macro name".to_string())
                } else {
                    single_name("define").map(Command::Define)
                }
            }
            "list" => match rest {
                "" => Ok(Command::List(Listing::All)),
                "macros" => Ok(Command::List(Listing::Macros)),
                "plugins" => Ok(Command::List(Listing::Plugins)),
                _ => Err("list: invalid argument".to_string()),
            },
            "inject" => {
                let Some((kind, text)) = rest.split_once(char::is_whitespace) else {
                    return Err("inject: invalid command format".to_string());
                };
                let text = text.trim();
                if text.is_empty() {
                    return Err("inject: invalid command format".to_string());
                }
                let kind = MarkerType::from_string(&kind.to_uppercase())
                    .ok_or_else(|| "inject: invalid marker type".to_string())?;
                Ok(Command::Inject(kind, text.to_string()))
            }
            _ => Ok(Command::Replay(line.to_string())),
        }
    }

    /// Commands that may be stored in a macro
    fn recordable(&self) -> bool {
        matches!(
            self,
            Command::Squelch
                | Command::Stop
                | Command::Start
                | Command::Enable(_)
                | Command::Disable(_)
                | Command::Inject(..)
        )
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct MacroFile {
    #[serde(default)]
    macros: BTreeMap<String, String>,
}

/// A macro being recorded
#[derive(Debug)]
struct Recording {
    name: String,
    commands: Vec<String>,
}

pub struct Shell {
    manager: Arc<PluginManager>,
    macros: BTreeMap<String, Vec<String>>,
    macro_file: PathBuf,
    recording: Option<Recording>,
}

impl Shell {
    pub fn new(manager: Arc<PluginManager>, macro_file: impl Into<PathBuf>) -> Self {
        Self {
            manager,
            macros: BTreeMap::new(),
            macro_file: macro_file.into(),
            recording: None,
        }
    }

    pub fn macro_file(&self) -> &Path {
        &self.macro_file
    }

    pub fn macro_names(&self) -> impl Iterator<Item = &str> {
        self.macros.keys().map(String::as_str)
    }

    pub fn is_recording(&self) -> bool {
        self.recording.is_some()
    }

    pub fn prompt(&self) -> &'static str {
        if self.recording.is_some() {
            "macro> "
        } else {
            "> "
        }
    }

    /// Load macros from the macro file; a missing file is an empty set
    pub async fn load_macros(&mut self) -> Result<()> {
        let text = match tokio::fs::read_to_string(&self.macro_file).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.macro_file.display(), "No macro file");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let file: MacroFile = toml::from_str(&text).map_err(|e| {
            Error::InvalidArgument(format!(
                "invalid macro file {}: {}",
                self.macro_file.display(),
                e
            ))
        })?;
        self.macros = file
            .macros
            .into_iter()
            .map(|(name, body)| {
                let commands = body
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(str::to_string)
                    .collect();
                (name, commands)
            })
            .collect();
        info!(count = self.macros.len(), "Macros loaded");
        Ok(())
    }

    /// Write every macro back to the macro file
    pub async fn save_macros(&self) -> Result<()> {
        let file = MacroFile {
            macros: self
                .macros
                .iter()
                .map(|(name, commands)| (name.clone(), commands.join("\n")))
                .collect(),
        };
        let text = toml::to_string(&file)
            .map_err(|e| Error::Internal(format!("serializing macros: {e}")))?;
        if let Some(parent) = self.macro_file.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(&self.macro_file, text).await?;
        info!(path = %self.macro_file.display(), count = self.macros.len(), "Macros saved");
        Ok(())
    }

    /// Act on one input line, collecting what to print in `out`
    pub fn handle_line(&mut self, line: &str, out: &mut Vec<String>) -> Flow {
        let line = line.trim();
        if line.is_empty() {
            return Flow::Continue;
        }
        let command = match Command::parse(line) {
            Ok(command) => command,
            Err(message) => {
                say(out, message);
                return Flow::Continue;
            }
        };

        if self.recording.is_some() {
            self.record(line, command, out);
            return Flow::Continue;
        }
        self.execute(command, out, true)
    }

    fn record(&mut self, line: &str, command: Command, out: &mut Vec<String>) {
        if command == Command::End {
            if let Some(Recording { name, commands }) = self.recording.take() {
                info!(name = %name, commands = commands.len(), "Macro defined");
                self.macros.insert(name, commands);
            }
            return;
        }
        if !command.recordable() {
            say(out, "unrecognized command");
            return;
        }
        if let Command::Enable(name) | Command::Disable(name) = &command {
            if self.manager.plugin_by_name(name).is_none() {
                say(out, format!("nonexistent plugin \"{name}\""));
                return;
            }
        }
        if let Some(recording) = self.recording.as_mut() {
            recording.commands.push(line.to_string());
        }
    }

    fn execute(&mut self, command: Command, out: &mut Vec<String>, allow_replay: bool) -> Flow {
        let mediator = self.manager.mediator();
        match command {
            Command::Squelch => mediator.squelch_next(),
            Command::Stop => mediator.stop(),
            Command::Start => mediator.start(),
            Command::Enable(name) => {
                if let Err(e) = self.manager.enable_by_name(&name) {
                    say(out, format!("enable: {}", plain(&e)));
                }
            }
            Command::Disable(name) => {
                if let Err(e) = self.manager.disable_by_name(&name) {
                    say(out, format!("disable: {}", plain(&e)));
                }
            }
            Command::Inject(kind, text) => {
                let published = Marker::new(text).and_then(|m| mediator.publish(kind, m));
                if let Err(e) = published {
                    say(out, format!("inject: {}", plain(&e)));
                }
            }
            Command::Define(name) => {
                self.recording = Some(Recording {
                    name,
                    commands: Vec::new(),
                });
            }
            Command::Undefine(name) => {
                if self.macros.remove(&name).is_none() {
                    say(out, format!("undefine: no macro named \"{name}\""));
                }
            }
            Command::List(listing) => self.list(listing, out),
            Command::Help => out.extend(HELP.lines().map(str::to_string)),
            Command::Quit => return Flow::Quit,
            Command::End => say(out, "end: not defining a macro"),
            Command::Replay(name) => match self.macros.get(&name).cloned() {
                Some(commands) if allow_replay => {
                    debug!(name = %name, "Replaying macro");
                    for line in commands {
                        match Command::parse(&line) {
                            Ok(command) if command.recordable() => {
                                self.execute(command, out, false);
                            }
                            Ok(_) => say(out, format!("{name}: cannot replay \"{line}\"")),
                            Err(message) => say(out, message),
                        }
                    }
                }
                _ => say(out, "unrecognized command"),
            },
        }
        Flow::Continue
    }

    fn list(&self, listing: Listing, out: &mut Vec<String>) {
        if matches!(listing, Listing::All | Listing::Macros) {
            out.push("Macros:".to_string());
            if self.macros.is_empty() {
                out.push("\t(no macros defined)".to_string());
            }
            out.extend(self.macros.keys().map(|name| format!("\t{name}")));
        }
        if matches!(listing, Listing::All | Listing::Plugins) {
            out.push("Plugins:".to_string());
            out.extend(self.manager.all_plugins().iter().map(|p| {
                let state = if p.is_enabled() { "enabled" } else { "disabled" };
                format!("\t{} ({}, {})", p.name(), p.kind(), state)
            }));
        }
    }

    /// Read commands until `quit` or end of input
    pub async fn run<R, W>(&mut self, input: R, mut output: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = input.lines();
        loop {
            output.write_all(self.prompt().as_bytes()).await?;
            output.flush().await?;

            let Some(line) = lines.next_line().await? else {
                info!("End of input");
                break;
            };
            let mut out = Vec::new();
            let flow = self.handle_line(&line, &mut out);
            for text in out {
                output.write_all(text.as_bytes()).await?;
                output.write_all(b"\n").await?;
            }
            if flow == Flow::Quit {
                break;
            }
        }
        if self.recording.take().is_some() {
            warn!("Input ended while defining a macro, discarded");
        }
        output.flush().await?;
        Ok(())
    }
}

fn say(out: &mut Vec<String>, message: impl AsRef<str>) {
    out.push(format!("{PREFIX}{}", message.as_ref()));
}

/// Error text without the variant's prefix
fn plain(e: &Error) -> String {
    match e {
        Error::InvalidArgument(message) => message.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::{PluginContext, PluginFactory};
    use crate::show::Show;
    use async_trait::async_trait;
    use markcast_common::{Lane, Mediator, Plugin, PluginControl, PluginKind, SubscriberQueue};

    struct Quiet;

    #[async_trait]
    impl Plugin for Quiet {
        fn name(&self) -> &str {
            "Quiet"
        }

        fn kind(&self) -> PluginKind {
            PluginKind::Sink
        }

        async fn run(&mut self, control: PluginControl) -> Result<()> {
            control.cancelled().await;
            Ok(())
        }
    }

    fn quiet_factory(_: &toml::Table, _: &PluginContext) -> Result<Box<dyn Plugin>> {
        Ok(Box::new(Quiet))
    }

    fn new_shell(macro_file: &Path) -> (Shell, SubscriberQueue) {
        let mediator = Arc::new(Mediator::new(0.0).unwrap());
        let queue = mediator
            .subscribe(&MarkerType::ALL, "probe", Lane::Instant)
            .unwrap();
        let context = PluginContext {
            mediator,
            show: Show::parse("fnt-1"),
        };
        let mut manager =
            PluginManager::with_factories(context, vec![("Quiet", quiet_factory as PluginFactory)]);
        let mut configs = BTreeMap::new();
        configs.insert("Quiet".to_string(), toml::Table::new());
        manager.load_all(&configs);
        (Shell::new(Arc::new(manager), macro_file), queue)
    }

    fn run_line(shell: &mut Shell, line: &str) -> Vec<String> {
        let mut out = Vec::new();
        shell.handle_line(line, &mut out);
        out
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse("squelch"), Ok(Command::Squelch));
        assert_eq!(
            Command::parse("inject topic Hello  world"),
            Ok(Command::Inject(MarkerType::Topic, "Hello  world".to_string()))
        );
        assert_eq!(
            Command::parse("inject TRACK"),
            Err("inject: invalid command format".to_string())
        );
        assert_eq!(
            Command::parse("inject SONG x"),
            Err("inject: invalid marker type".to_string())
        );
        assert_eq!(
            Command::parse("enable two words"),
            Err("enable: invalid command format".to_string())
        );
        assert_eq!(
            Command::parse("define a b"),
            Err("define: spaces not permitted in macro name".to_string())
        );
        assert_eq!(Command::parse("list bogus"), Err("list: invalid argument".to_string()));
        assert_eq!(Command::parse("stop now"), Err("stop: takes no arguments".to_string()));
        assert_eq!(Command::parse("intro"), Ok(Command::Replay("intro".to_string())));
    }

    #[tokio::test]
    async fn test_inject_and_gating() {
        let dir = tempfile::tempdir().unwrap();
        let (mut shell, mut queue) = new_shell(&dir.path().join("macros.toml"));

        assert!(run_line(&mut shell, "inject topic First story").is_empty());
        let marker = queue.try_listen().unwrap().unwrap();
        assert_eq!(marker.label(), "First story");

        run_line(&mut shell, "squelch");
        run_line(&mut shell, "inject TOPIC dropped");
        run_line(&mut shell, "stop");
        run_line(&mut shell, "inject TOPIC also dropped");
        run_line(&mut shell, "start");
        run_line(&mut shell, "inject TRACK kept");
        assert_eq!(queue.try_listen().unwrap().unwrap().label(), "kept");
        assert!(queue.try_listen().unwrap().is_none());

        assert_eq!(
            run_line(&mut shell, "inject SONG x"),
            vec!["markcast: inject: invalid marker type"]
        );
        assert_eq!(run_line(&mut shell, "nonsense"), vec!["markcast: unrecognized command"]);
        assert!(run_line(&mut shell, "   ").is_empty());
    }

    #[tokio::test]
    async fn test_enable_disable_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let (mut shell, _queue) = new_shell(&dir.path().join("macros.toml"));

        assert!(run_line(&mut shell, "disable Quiet").is_empty());
        assert!(!shell.manager.plugin_by_name("Quiet").unwrap().is_enabled());
        assert!(run_line(&mut shell, "disable Quiet").is_empty());
        assert_eq!(
            run_line(&mut shell, "enable Ghost"),
            vec!["markcast: enable: nonexistent plugin \"Ghost\""]
        );
        assert_eq!(
            run_line(&mut shell, "list"),
            vec![
                "Macros:",
                "\t(no macros defined)",
                "Plugins:",
                "\tQuiet (sink, disabled)"
            ]
        );
        run_line(&mut shell, "enable Quiet");
        assert_eq!(
            run_line(&mut shell, "list plugins"),
            vec!["Plugins:", "\tQuiet (sink, enabled)"]
        );
    }

    #[tokio::test]
    async fn test_define_replay_undefine() {
        let dir = tempfile::tempdir().unwrap();
        let (mut shell, mut queue) = new_shell(&dir.path().join("macros.toml"));

        run_line(&mut shell, "define intro");
        assert!(shell.is_recording());
        assert_eq!(shell.prompt(), "macro> ");
        assert_eq!(
            run_line(&mut shell, "enable Ghost"),
            vec!["markcast: nonexistent plugin \"Ghost\""]
        );
        assert_eq!(run_line(&mut shell, "quit"), vec!["markcast: unrecognized command"]);
        run_line(&mut shell, "inject TOPIC Welcome");
        run_line(&mut shell, "disable Quiet");
        run_line(&mut shell, "end");
        assert!(!shell.is_recording());
        assert_eq!(shell.macro_names().collect::<Vec<_>>(), vec!["intro"]);
        assert!(queue.try_listen().unwrap().is_none());

        assert!(run_line(&mut shell, "intro").is_empty());
        assert_eq!(queue.try_listen().unwrap().unwrap().label(), "Welcome");
        assert!(!shell.manager.plugin_by_name("Quiet").unwrap().is_enabled());

        assert_eq!(run_line(&mut shell, "list macros"), vec!["Macros:", "\tintro"]);
        run_line(&mut shell, "undefine intro");
        assert_eq!(
            run_line(&mut shell, "undefine intro"),
            vec!["markcast: undefine: no macro named \"intro\""]
        );
        assert_eq!(run_line(&mut shell, "intro"), vec!["markcast: unrecognized command"]);
    }

    #[tokio::test]
    async fn test_macros_persist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("macros.toml");
        let (mut shell, _queue) = new_shell(&path);
        shell.load_macros().await.unwrap();

        for line in ["define breaking", "stop", "inject TOPIC Breaking news", "end"] {
            run_line(&mut shell, line);
        }
        shell.save_macros().await.unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("[macros]"));

        let (mut reloaded, _queue) = new_shell(&path);
        reloaded.load_macros().await.unwrap();
        assert_eq!(
            reloaded.macros.get("breaking").unwrap(),
            &vec!["stop".to_string(), "inject TOPIC Breaking news".to_string()]
        );
    }

    #[tokio::test]
    async fn test_run_until_quit() {
        let dir = tempfile::tempdir().unwrap();
        let (mut shell, mut queue) = new_shell(&dir.path().join("macros.toml"));
        let input: &[u8] = b"inject TOPIC One\nbogus\nquit\ninject TOPIC Never\n";
        let mut output = Vec::new();

        shell.run(input, &mut output).await.unwrap();

        let printed = String::from_utf8(output).unwrap();
        assert!(printed.contains("markcast: unrecognized command\n"));
        assert_eq!(queue.try_listen().unwrap().unwrap().label(), "One");
        assert!(queue.try_listen().unwrap().is_none());
    }
}
