//! IRC announcer
//!
//! Connects to an IRC server as a plain client and posts a message about
//! every TRACK marker to a channel or nick.
//!
//! ```toml
//! [plugin.IRC]
//! nick = "markcast"
//! server = "irc.example.net"
//! port = 6667
//! tls = false
//! ipv6 = false
//! send_to = "#show"
//! message = "Now playing: {marker}{special}"
//! repeat_with = ["#show", "#show-chat"]   # optional, fills {item}
//! nickserv_pass = "hunter2"                # optional
//! ```
//!
//! Markers are only posted after registration (and after joining when
//! `send_to` is a channel); markers that arrive earlier stay queued.

use std::net::SocketAddr;

use async_trait::async_trait;
use markcast_common::config::SectionReader;
use markcast_common::{
    ConfigError, Error, Lane, Marker, MarkerType, Plugin, PluginControl, PluginKind, Result,
    SubscriberQueue,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::{next_marker, Next, PluginContext, LISTEN_TIMEOUT};

pub const NAME: &str = "IRC";

const QUIT_MESSAGE: &str = "Metadata system shutdown";

#[derive(Debug, Clone, PartialEq)]
pub struct IrcConfig {
    pub nick: String,
    pub server: String,
    pub port: u16,
    pub ipv6: bool,
    pub send_to: String,
    /// Template with `{marker}`, `{special}` and `{item}` placeholders
    pub message: String,
    pub repeat_with: Vec<String>,
    pub nickserv_pass: Option<String>,
    pub delayed: bool,
}

impl IrcConfig {
    pub fn from_table(table: &toml::Table) -> std::result::Result<Self, ConfigError> {
        let mut r = SectionReader::new(format!("plugin.{NAME}"), table);
        let nick = r.required_str("nick");
        let server = r.required_str("server");
        let port = r.required_port("port");
        if r.required_bool("tls") {
            r.invalid("tls", "is not supported; connect to a plaintext port");
        }
        let ipv6 = r.required_bool("ipv6");
        let send_to = r.required_str("send_to");
        let message = r.required_str("message");
        let repeat_with = r.string_list("repeat_with");
        let nickserv_pass = r.optional_str("nickserv_pass");
        let delayed = r.optional_bool("delayed", true);
        r.finish()?;
        Ok(Self {
            nick,
            server,
            port,
            ipv6,
            send_to,
            message,
            repeat_with,
            nickserv_pass,
            delayed,
        })
    }
}

/// True for IRC channel names
pub fn is_channel(target: &str) -> bool {
    target.starts_with(['#', '&', '+', '!'])
}

/// One parsed server line
#[derive(Debug, PartialEq, Eq)]
struct IrcLine<'a> {
    prefix: Option<&'a str>,
    command: &'a str,
    params: Vec<&'a str>,
}

impl<'a> IrcLine<'a> {
    fn parse(line: &'a str) -> Option<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        let (prefix, rest) = match line.strip_prefix(':') {
            Some(rest) => {
                let (prefix, rest) = rest.split_once(' ')?;
                (Some(prefix), rest)
            }
            None => (None, line),
        };
        let (head, trailing) = match rest.split_once(" :") {
            Some((head, trailing)) => (head, Some(trailing)),
            None => (rest, None),
        };
        let mut words = head.split(' ').filter(|w| !w.is_empty());
        let command = words.next()?;
        let mut params: Vec<&str> = words.collect();
        params.extend(trailing);
        Some(Self {
            prefix,
            command,
            params,
        })
    }

    fn source_nick(&self) -> Option<&'a str> {
        self.prefix.map(|p| p.split('!').next().unwrap_or(p))
    }
}

/// What the connection should do after a server line
#[derive(Debug, Default, PartialEq, Eq)]
struct Reaction {
    send: Vec<String>,
    closed: bool,
}

/// Client-side protocol state, independent of the socket
#[derive(Debug)]
struct IrcSession {
    config: IrcConfig,
    ready: bool,
}

impl IrcSession {
    fn new(config: IrcConfig) -> Self {
        Self {
            config,
            ready: false,
        }
    }

    fn registration(&self) -> Vec<String> {
        vec![
            format!("NICK {}", self.config.nick),
            format!("USER {} 0 * :{}", self.config.nick, self.config.nick),
        ]
    }

    fn handle(&mut self, line: &str) -> Reaction {
        let mut reaction = Reaction::default();
        let Some(msg) = IrcLine::parse(line) else {
            return reaction;
        };
        match msg.command {
            "PING" => {
                let token = msg.params.first().copied().unwrap_or_default();
                reaction.send.push(format!("PONG :{token}"));
            }
            "001" => {
                debug!(plugin = NAME, "Registered with IRC server");
                if let Some(pass) = &self.config.nickserv_pass {
                    reaction.send.push(format!("PRIVMSG NickServ :identify {pass}"));
                    debug!(plugin = NAME, "Sent NickServ identify");
                }
                if is_channel(&self.config.send_to) {
                    reaction.send.push(format!("JOIN {}", self.config.send_to));
                } else {
                    self.ready = true;
                }
            }
            "JOIN" if msg.source_nick() == Some(self.config.nick.as_str()) => {
                debug!(plugin = NAME, "Joined output channel");
                self.ready = true;
            }
            "ERROR" => {
                info!(plugin = NAME, "IRC server closed the link: {:?}", msg.params);
                reaction.closed = true;
            }
            _ => {}
        }
        reaction
    }

    /// PRIVMSG lines announcing one marker
    fn announce(&self, marker: &Marker) -> Vec<String> {
        let label = marker.label().trim_matches('\n');
        let special = marker
            .special
            .as_ref()
            .map(|s| format!(" ({s})"))
            .unwrap_or_default();
        let render = |item: &str| {
            self.config
                .message
                .replace("{marker}", label)
                .replace("{special}", &special)
                .replace("{item}", item)
        };

        if self.config.repeat_with.is_empty() {
            vec![format!("PRIVMSG {} :{}", self.config.send_to, render(""))]
        } else {
            self.config
                .repeat_with
                .iter()
                .map(|item| format!("PRIVMSG {} :{}", self.config.send_to, render(item)))
                .collect()
        }
    }
}

pub struct Irc {
    session: IrcSession,
    queue: SubscriberQueue,
}

pub fn factory(table: &toml::Table, ctx: &PluginContext) -> Result<Box<dyn Plugin>> {
    Ok(Box::new(Irc::from_config(table, ctx)?))
}

impl Irc {
    pub fn from_config(table: &toml::Table, ctx: &PluginContext) -> Result<Self> {
        let config = IrcConfig::from_table(table)?;
        debug!(plugin = NAME, "Configuration valid");
        let queue =
            ctx.mediator
                .subscribe(&[MarkerType::Track], NAME, Lane::select(config.delayed))?;
        Ok(Self {
            session: IrcSession::new(config),
            queue,
        })
    }

    async fn connect(&self) -> Result<TcpStream> {
        let config = &self.session.config;
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((config.server.as_str(), config.port))
            .await?
            .filter(|a| a.is_ipv6() == config.ipv6)
            .collect();
        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => last_err = Some(e),
            }
        }
        Err(match last_err {
            Some(e) => e.into(),
            None => Error::InvalidState(format!(
                "no {} address for {}",
                if config.ipv6 { "IPv6" } else { "IPv4" },
                config.server
            )),
        })
    }
}

async fn send_lines<W>(writer: &mut W, lines: &[String]) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    for line in lines {
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\r\n").await?;
    }
    writer.flush().await?;
    Ok(())
}

#[async_trait]
impl Plugin for Irc {
    fn name(&self) -> &str {
        NAME
    }

    fn kind(&self) -> PluginKind {
        PluginKind::Sink
    }

    async fn run(&mut self, control: PluginControl) -> Result<()> {
        let config = &self.session.config;
        info!(
            plugin = NAME,
            "Connecting to {}:{} as {}", config.server, config.port, config.nick
        );
        let stream = self.connect().await?;
        let (read_half, mut writer) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        send_lines(&mut writer, &self.session.registration()).await?;

        while !control.should_terminate() {
            tokio::select! {
                line = lines.next_line() => match line? {
                    Some(line) => {
                        let reaction = self.session.handle(&line);
                        send_lines(&mut writer, &reaction.send).await?;
                        if reaction.closed {
                            break;
                        }
                    }
                    None => {
                        info!(plugin = NAME, "IRC server disconnected");
                        return Ok(());
                    }
                },
                next = next_marker(&mut self.queue, &control), if self.session.ready => {
                    match next? {
                        Next::Marker(marker) => {
                            debug!(plugin = NAME, marker = %marker, "Announcing marker");
                            send_lines(&mut writer, &self.session.announce(&marker)).await?;
                        }
                        Next::Idle => {}
                        Next::Finished => break,
                    }
                },
                _ = tokio::time::sleep(LISTEN_TIMEOUT), if !self.session.ready => {}
            }
        }

        info!(plugin = NAME, "Queue closed, leaving IRC");
        if let Err(e) = send_lines(&mut writer, &[format!("QUIT :{QUIT_MESSAGE}")]).await {
            warn!(plugin = NAME, "Failed to send QUIT: {}", e);
        }
        Ok(())
    }
}
