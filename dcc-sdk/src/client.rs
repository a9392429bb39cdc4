//! IRC client that drives the DCC subsystem.
//!
//! This is the main entry point for SDK consumers. It manages the TCP
//! connection and IRC registration, routes CTCP `DCC` traffic into a
//! [`Dcc`] manager, and emits events.
//!
//! The DCC manager lives inside the connection task. Its sockets are
//! awaited in the same `select!` as the server socket, so every DCC
//! operation runs on one task and never races another.
//!
//! ## Reconnection
//!
//! The SDK does not implement automatic reconnection. Listen for
//! [`Event::Disconnected`] and retry. DCC sessions do not survive a
//! reconnect.

use std::net::SocketAddr;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, MissedTickBehavior};

use crate::ctcp;
use crate::dcc::{self, Dcc, DccEvent, DccSettings, Family, Hooks, Refnum, ServerContext};
use crate::event::Event;
use crate::irc::Message;

/// Configuration for connecting to an IRC server.
#[derive(Debug, Clone)]
pub struct ConnectConfig {
    /// Server address (host:port).
    pub server_addr: String,
    /// Desired nickname.
    pub nick: String,
    /// Username (ident).
    pub user: String,
    /// Real name.
    pub realname: String,
    /// DCC tunables.
    pub dcc: DccSettings,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:6667".to_string(),
            nick: "user".to_string(),
            user: "user".to_string(),
            realname: "DCC SDK User".to_string(),
            dcc: DccSettings::default(),
        }
    }
}

/// Commands the consumer can send to the client.
#[derive(Debug)]
pub enum Command {
    Join(String),
    Privmsg { target: String, text: String },
    Raw(String),
    Quit(Option<String>),
    /// A `/DCC` command line, without the `/DCC`.
    Dcc(String),
    /// A line for an active DCC CHAT.
    DccChat { nick: String, text: String },
    /// A DCC introspection request.
    DccCtl {
        request: String,
        reply: oneshot::Sender<Option<String>>,
    },
    RawListen {
        port: u16,
        family: Family,
        reply: oneshot::Sender<dcc::Result<Refnum>>,
    },
    RawConnect {
        host: String,
        port: u16,
        addr: Option<SocketAddr>,
        reply: oneshot::Sender<dcc::Result<Refnum>>,
    },
}

/// A handle to a running IRC client connection.
#[derive(Clone)]
pub struct ClientHandle {
    cmd_tx: mpsc::Sender<Command>,
}

impl ClientHandle {
    pub async fn join(&self, channel: &str) -> Result<()> {
        self.cmd_tx.send(Command::Join(channel.to_string())).await?;
        Ok(())
    }

    pub async fn privmsg(&self, target: &str, text: &str) -> Result<()> {
        self.cmd_tx
            .send(Command::Privmsg {
                target: target.to_string(),
                text: text.to_string(),
            })
            .await?;
        Ok(())
    }

    pub async fn quit(&self, message: Option<&str>) -> Result<()> {
        self.cmd_tx
            .send(Command::Quit(message.map(|s| s.to_string())))
            .await?;
        Ok(())
    }

    pub async fn raw(&self, line: &str) -> Result<()> {
        self.cmd_tx.send(Command::Raw(line.to_string())).await?;
        Ok(())
    }

    // ── DCC ──

    /// Run a `/DCC` command, e.g. `"SEND bob ./notes.txt"`.
    pub async fn dcc(&self, line: &str) -> Result<()> {
        self.cmd_tx.send(Command::Dcc(line.to_string())).await?;
        Ok(())
    }

    /// Send a line over the DCC CHAT with `nick`.
    pub async fn dcc_chat(&self, nick: &str, text: &str) -> Result<()> {
        self.cmd_tx
            .send(Command::DccChat {
                nick: nick.to_string(),
                text: text.to_string(),
            })
            .await?;
        Ok(())
    }

    /// Query or tune sessions (`REFNUMS`, `GET 3 SIZE`, `SET 3 HELD 1`, ...).
    pub async fn dcc_ctl(&self, request: &str) -> Result<Option<String>> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::DccCtl {
                request: request.to_string(),
                reply,
            })
            .await?;
        Ok(rx.await?)
    }

    /// Listen for raw inbound TCP connections on `port` (0 for any).
    pub async fn raw_listen(&self, port: u16, family: Family) -> Result<Refnum> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::RawListen { port, family, reply })
            .await?;
        Ok(rx.await??)
    }

    /// Open a raw outbound TCP connection. The host is resolved here, in the
    /// caller's task, so a slow lookup never stalls the connection loop.
    pub async fn raw_connect(&self, host: &str, port: u16, family: Family) -> Result<Refnum> {
        let addr = dcc::resolve_host(host, port, family).await;
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::RawConnect {
                host: host.to_string(),
                port,
                addr,
                reply,
            })
            .await?;
        Ok(rx.await??)
    }
}

/// DCC hooks that forward everything to the event channel.
///
/// Events are never consumed, so each one is followed by its default text
/// as an [`Event::DccNotice`].
struct ChannelHooks {
    event_tx: mpsc::Sender<Event>,
}

impl Hooks for ChannelHooks {
    fn fire(&mut self, event: &DccEvent) -> bool {
        if let Err(e) = self.event_tx.try_send(Event::Dcc(event.clone())) {
            tracing::debug!(error = %e, "dropping DCC event");
        }
        false
    }

    fn say(&mut self, text: &str) {
        if let Err(e) = self.event_tx.try_send(Event::DccNotice {
            text: text.to_string(),
        }) {
            tracing::debug!(error = %e, "dropping DCC notice");
        }
    }
}

/// Establish the TCP connection to the server.
///
/// Done before the event loop starts so that connection errors are
/// visible to the caller. Pass the stream to [`connect_with_stream`].
pub async fn establish_connection(config: &ConnectConfig) -> Result<TcpStream> {
    tracing::debug!("Resolving {}...", config.server_addr);
    let tcp = TcpStream::connect(&config.server_addr)
        .await
        .map_err(|e| anyhow::anyhow!("TCP connect to {} failed: {e}", config.server_addr))?;
    tracing::debug!("TCP connected to {}", config.server_addr);
    Ok(tcp)
}

/// Connect using an already-established connection.
///
/// Returns a handle for sending commands and a receiver for events.
/// The IRC protocol runs in a spawned task.
pub fn connect_with_stream(
    tcp: TcpStream,
    config: ConnectConfig,
) -> (ClientHandle, mpsc::Receiver<Event>) {
    let (event_tx, event_rx) = mpsc::channel(4096);
    let (cmd_tx, cmd_rx) = mpsc::channel(256);

    let handle = ClientHandle { cmd_tx };

    tokio::spawn(async move {
        let _ = event_tx.send(Event::Connected).await;
        if let Err(e) = run_stream(tcp, &config, event_tx.clone(), cmd_rx).await {
            let _ = event_tx
                .send(Event::Disconnected {
                    reason: e.to_string(),
                })
                .await;
        }
    });

    (handle, event_rx)
}

/// Connect to an IRC server and run the client.
///
/// Returns a handle for sending commands and a receiver for events.
/// The connection runs in a spawned task.
pub fn connect(config: ConnectConfig) -> (ClientHandle, mpsc::Receiver<Event>) {
    let (event_tx, event_rx) = mpsc::channel(4096);
    let (cmd_tx, cmd_rx) = mpsc::channel(256);

    let handle = ClientHandle { cmd_tx };

    tokio::spawn(async move {
        let result = async {
            let tcp = establish_connection(&config).await?;
            let _ = event_tx.send(Event::Connected).await;
            run_stream(tcp, &config, event_tx.clone(), cmd_rx).await
        }
        .await;
        if let Err(e) = result {
            let _ = event_tx
                .send(Event::Disconnected {
                    reason: e.to_string(),
                })
                .await;
        }
    });

    (handle, event_rx)
}

async fn run_stream(
    tcp: TcpStream,
    config: &ConnectConfig,
    event_tx: mpsc::Sender<Event>,
    cmd_rx: mpsc::Receiver<Command>,
) -> Result<()> {
    let local_addr = tcp.local_addr().ok();
    let (reader, writer) = tokio::io::split(tcp);
    run_irc(BufReader::new(reader), writer, config, local_addr, event_tx, cmd_rx).await
}

async fn run_irc<R, W>(
    reader: R,
    mut writer: W,
    config: &ConnectConfig,
    local_addr: Option<SocketAddr>,
    event_tx: mpsc::Sender<Event>,
    mut cmd_rx: mpsc::Receiver<Command>,
) -> Result<()>
where
    R: tokio::io::AsyncBufRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    writer
        .write_all(format!("NICK {}\r\n", config.nick).as_bytes())
        .await?;
    writer
        .write_all(format!("USER {} 0 * :{}\r\n", config.user, config.realname).as_bytes())
        .await?;

    let mut dcc = Dcc::new(
        config.dcc.clone(),
        Box::new(ChannelHooks {
            event_tx: event_tx.clone(),
        }),
    );
    let mut ctx = ServerContext {
        nickname: config.nick.clone(),
        registered: false,
        local_addr,
    };
    let mut nick_tries: u32 = 0;
    let mut pending_commands: Vec<Command> = Vec::new();
    // `next_line` keeps partial input across cancellation, so a line split
    // over several segments survives the other select branches.
    let mut lines = reader.lines();
    let mut last_activity = tokio::time::Instant::now();
    let ping_interval = Duration::from_secs(60);
    let ping_timeout = Duration::from_secs(120);
    let mut supervisor = tokio::time::interval(Duration::from_secs(1));
    supervisor.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            result = lines.next_line() => {
                let Some(line) = result? else {
                    let _ = event_tx.send(Event::Disconnected { reason: "EOF".to_string() }).await;
                    break;
                };

                last_activity = tokio::time::Instant::now();
                let raw = line.trim_end().to_string();
                let _ = event_tx.send(Event::RawLine(raw)).await;

                if let Some(msg) = Message::parse(&line) {
                    match msg.command.as_str() {
                        // ERR_NICKNAMEINUSE
                        "433" if !ctx.registered => {
                            nick_tries = nick_tries.saturating_add(1);
                            if nick_tries <= 5 {
                                let alt = format!("{}{}", config.nick, nick_tries);
                                writer.write_all(format!("NICK {alt}\r\n").as_bytes()).await?;
                                ctx.nickname = alt;
                            } else {
                                let _ = event_tx.send(Event::Disconnected { reason: "Nick in use".to_string() }).await;
                                break;
                            }
                        }
                        "001" => {
                            let nick = msg.params.first().cloned().unwrap_or_default();
                            ctx.nickname = nick.clone();
                            ctx.registered = true;
                            let _ = event_tx.send(Event::Registered { nick }).await;
                            // Flush any commands that were queued before registration
                            for cmd in pending_commands.drain(..) {
                                execute_command(&mut writer, &mut dcc, &ctx, cmd).await?;
                            }
                        }
                        "PING" => {
                            let token = msg.params.first().map(|s| s.as_str()).unwrap_or("");
                            writer.write_all(format!("PONG :{token}\r\n").as_bytes()).await?;
                        }
                        "NICK" => {
                            let old_nick = msg.source_nick().unwrap_or("").to_string();
                            let new_nick = msg.params.first().cloned().unwrap_or_default();
                            if old_nick.eq_ignore_ascii_case(&ctx.nickname) {
                                ctx.nickname = new_nick.clone();
                            }
                            if !old_nick.is_empty() && !new_nick.is_empty() {
                                let _ = event_tx.send(Event::NickChanged { old_nick, new_nick }).await;
                            }
                        }
                        // RPL_ISON, answering an automatic REJECT check
                        "303" => {
                            let online = msg.params.last().map(|s| s.as_str()).unwrap_or("");
                            dcc.on_ison_reply(online);
                        }
                        "PRIVMSG" | "NOTICE" => {
                            handle_message(&msg, &mut dcc, &ctx, &event_tx).await;
                        }
                        "ERROR" => {
                            let reason = msg.params.last().cloned().unwrap_or_default();
                            let _ = event_tx.send(Event::Disconnected { reason }).await;
                            break;
                        }
                        cmd => {
                            // Surface error numerics; everything else stays a raw line.
                            if cmd.len() == 3 && (cmd.starts_with('4') || cmd.starts_with('5')) {
                                let text = if msg.params.len() > 1 {
                                    msg.params[1..].join(" ")
                                } else {
                                    msg.params.join(" ")
                                };
                                let _ = event_tx.send(Event::ServerNotice { text }).await;
                            }
                        }
                    }
                }
            }
            Some(cmd) = cmd_rx.recv() => {
                if ctx.registered || matches!(cmd, Command::Quit(_)) {
                    execute_command(&mut writer, &mut dcc, &ctx, cmd).await?;
                    if !ctx.registered {
                        break; // Quit before registration
                    }
                } else {
                    // Queue until registered; commands silently wait
                    pending_commands.push(cmd);
                }
            }
            ready = dcc.wait_ready() => {
                dcc.service(&ready);
            }
            _ = supervisor.tick() => {
                let expired = dcc.supervise();
                if expired > 0 {
                    tracing::debug!(expired, "DCC sessions expired");
                }
            }
            // Periodic client-to-server PING and timeout detection
            _ = tokio::time::sleep_until(last_activity + ping_interval) => {
                if last_activity.elapsed() > ping_timeout {
                    let _ = event_tx.send(Event::Disconnected { reason: "Ping timeout".to_string() }).await;
                    break;
                }
                writer.write_all(b"PING :keepalive\r\n").await?;
            }
        }

        flush_dcc(&mut writer, &mut dcc, &ctx).await?;
    }

    if !dcc.registry().is_empty() {
        let _ = dcc.close_all();
    }
    Ok(())
}

/// Write whatever the DCC manager queued for the server. Held back until
/// registration completes.
async fn flush_dcc<W: AsyncWrite + Unpin>(
    writer: &mut W,
    dcc: &mut Dcc,
    ctx: &ServerContext,
) -> Result<()> {
    if !ctx.registered || !dcc.has_outbound() {
        return Ok(());
    }
    for item in dcc.drain_outbound() {
        writer
            .write_all(format!("{}\r\n", item.to_message()).as_bytes())
            .await?;
    }
    Ok(())
}

/// PRIVMSG or NOTICE: CTCP DCC goes to the DCC manager, the rest becomes
/// an event.
async fn handle_message(
    msg: &Message,
    dcc: &mut Dcc,
    ctx: &ServerContext,
    event_tx: &mpsc::Sender<Event>,
) {
    let is_notice = msg.command == "NOTICE";
    let target = msg.params.first().cloned().unwrap_or_default();
    let text = msg.params.get(1).cloned().unwrap_or_default();
    let Some(from) = msg.source_nick() else {
        let _ = event_tx.send(Event::ServerNotice { text }).await;
        return;
    };

    if let Some((kind, args)) = ctcp::parse(&text) {
        if kind.eq_ignore_ascii_case("DCC") {
            if let Err(e) = dcc.handle_ctcp(ctx, from, msg.source_userhost(), args, is_notice) {
                tracing::debug!(from, error = %e, "DCC handshake refused");
            }
        } else {
            tracing::debug!(from, ctcp = kind, "ignoring CTCP");
        }
        return;
    }

    let from = from.to_string();
    let event = if is_notice && !from.contains('.') {
        Event::Notice { from, target, text }
    } else if is_notice {
        Event::ServerNotice { text }
    } else {
        Event::Message { from, target, text }
    };
    let _ = event_tx.send(event).await;
}

/// Execute a single consumer command.
async fn execute_command<W: AsyncWrite + Unpin>(
    writer: &mut W,
    dcc: &mut Dcc,
    ctx: &ServerContext,
    cmd: Command,
) -> Result<()> {
    match cmd {
        Command::Join(channel) => {
            writer.write_all(format!("JOIN {channel}\r\n").as_bytes()).await?;
        }
        Command::Privmsg { target, text } => {
            writer.write_all(format!("PRIVMSG {target} :{text}\r\n").as_bytes()).await?;
        }
        Command::Raw(line) => {
            writer.write_all(format!("{line}\r\n").as_bytes()).await?;
        }
        Command::Quit(msg) => {
            let quit_line = match msg {
                Some(m) => format!("QUIT :{m}\r\n"),
                None => "QUIT\r\n".to_string(),
            };
            writer.write_all(quit_line.as_bytes()).await?;
        }
        Command::Dcc(line) => {
            // Failures have already been reported through the hooks.
            if let Err(e) = dcc.command(ctx, &line) {
                tracing::debug!(%line, error = %e, "DCC command failed");
            }
        }
        Command::DccChat { nick, text } => {
            if let Err(e) = dcc.send_chat(&nick, &text) {
                tracing::debug!(%nick, error = %e, "DCC CHAT send failed");
            }
        }
        Command::DccCtl { request, reply } => {
            let _ = reply.send(dcc.ctl(&request));
        }
        Command::RawListen { port, family, reply } => {
            let _ = reply.send(dcc.raw_listen(ctx, port, family));
        }
        Command::RawConnect { host, port, addr, reply } => {
            let _ = reply.send(dcc.raw_connect(&host, port, addr));
        }
    }
    Ok(())
}
