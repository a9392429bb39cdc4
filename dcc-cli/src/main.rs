//! dcc-cli: a line-oriented IRC client for DCC chat and file transfer.
//!
//! Reads commands from stdin and prints server and DCC activity to stdout.
//!
//!   /dcc <command> [args]   : CHAT, SEND, GET, RESUME, CLOSE, LIST, RENAME, RAW
//!   /chat <nick> <text>     : Say something over an open DCC CHAT
//!   /ctl <request>          : Query or tune sessions (REFNUMS, GET 3 SIZE, ...)
//!   /listen <port>          : Accept raw TCP connections on a port
//!   /connect <host> <port>  : Open a raw TCP connection
//!   /msg <target> <text>    : Send a PRIVMSG
//!   /join <channel>
//!   /quit [message]
//!
//! Anything else that starts with `/` is sent to the server verbatim.

mod config;

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use dcc_sdk::client::{self, ClientHandle, ConnectConfig};
use dcc_sdk::dcc::Family;
use dcc_sdk::event::Event;
use tokio::io::{AsyncBufReadExt, BufReader};

use config::{Config, Resolved};

#[derive(Parser, Debug)]
#[command(name = "dcc-cli", about = "IRC client with DCC chat and file transfer")]
pub struct Cli {
    /// IRC server address (host:port)
    #[arg(long)]
    server: Option<String>,

    /// Nickname
    #[arg(long)]
    nick: Option<String>,

    /// Channels to join, comma separated
    #[arg(long)]
    channels: Option<String>,

    /// Directory incoming files are saved to
    #[arg(long)]
    store_path: Option<PathBuf>,

    /// Unacknowledged packets allowed per outgoing transfer
    #[arg(long)]
    window: Option<usize>,

    /// Enable mIRC-style RESUME
    #[arg(long)]
    resume: bool,

    /// Config file (default: ~/.config/dcc-cli/config.toml)
    #[arg(long, env = "DCC_CLI_CONFIG")]
    config: Option<PathBuf>,

    /// Write the effective server and nick back to the config file
    #[arg(long)]
    save_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dcc_cli=info,dcc_sdk=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(config::default_path);
    let mut config = Config::load(&config_path);
    let resolved = Resolved::merge(&cli, &config);

    if cli.save_config {
        config.server = Some(resolved.server.clone());
        config.nick = Some(resolved.nick.clone());
        config.dcc = resolved.dcc.clone();
        config.save(&config_path);
    }

    tracing::info!(server = %resolved.server, nick = %resolved.nick, "Starting dcc-cli");

    let connect_config = ConnectConfig {
        server_addr: resolved.server.clone(),
        nick: resolved.nick.clone(),
        user: resolved.nick.clone(),
        realname: resolved.realname.clone(),
        dcc: resolved.dcc.clone(),
    };
    let conn = client::establish_connection(&connect_config).await?;
    let (handle, mut events) = client::connect_with_stream(conn, connect_config);

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut channels = resolved.channels.clone();

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    tracing::warn!("Event channel closed, exiting");
                    break;
                };
                if let Event::Registered { .. } = event {
                    for channel in channels.drain(..) {
                        handle.join(&channel).await?;
                    }
                }
                if !print_event(&event) {
                    break;
                }
            }
            line = stdin.next_line() => {
                match line? {
                    Some(line) => {
                        if let Err(e) = handle_input(&handle, line.trim()).await {
                            eprintln!("{e}");
                        }
                    }
                    None => {
                        handle.quit(None).await?;
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}

fn stamp() -> String {
    chrono::Local::now().format("%H:%M:%S").to_string()
}

/// Print one event. Returns false once the connection is gone.
fn print_event(event: &Event) -> bool {
    let ts = stamp();
    match event {
        Event::Connected => println!("{ts} -- connected"),
        Event::Registered { nick } => println!("{ts} -- registered as {nick}"),
        Event::Message { from, target, text } => println!("{ts} <{from}:{target}> {text}"),
        Event::Notice { from, text, .. } => println!("{ts} -{from}- {text}"),
        Event::NickChanged { old_nick, new_nick } => {
            println!("{ts} -- {old_nick} is now known as {new_nick}")
        }
        Event::ServerNotice { text } => println!("{ts} !! {text}"),
        Event::DccNotice { text } => println!("{ts} ** {text}"),
        // The default text for every DCC event follows as a DccNotice.
        Event::Dcc(dcc) => tracing::debug!(?dcc, "DCC event"),
        Event::RawLine(line) => tracing::trace!(%line, "raw"),
        Event::Disconnected { reason } => {
            println!("{ts} -- disconnected: {reason}");
            return false;
        }
    }
    true
}

/// Dispatch one line typed by the user.
async fn handle_input(handle: &ClientHandle, line: &str) -> Result<()> {
    if line.is_empty() {
        return Ok(());
    }
    let Some(cmd_line) = line.strip_prefix('/') else {
        eprintln!("Commands start with /; try /dcc, /chat, /msg, /join or /quit");
        return Ok(());
    };
    let (cmd, rest) = cmd_line.split_once(' ').unwrap_or((cmd_line, ""));
    let rest = rest.trim();

    match cmd.to_ascii_lowercase().as_str() {
        "dcc" => handle.dcc(rest).await?,
        "chat" => match rest.split_once(' ') {
            Some((nick, text)) => handle.dcc_chat(nick, text).await?,
            None => eprintln!("Usage: /chat <nick> <text>"),
        },
        "ctl" => match handle.dcc_ctl(rest).await? {
            Some(reply) => println!("{} == {reply}", stamp()),
            None => println!("{} == (no such session or field)", stamp()),
        },
        "listen" => {
            let port = rest.parse::<u16>().unwrap_or(0);
            let refnum = handle.raw_listen(port, Family::V4).await?;
            println!("{} -- raw listener #{refnum}", stamp());
        }
        "connect" => {
            let mut parts = rest.split_whitespace();
            let (Some(host), Some(port)) = (parts.next(), parts.next()) else {
                eprintln!("Usage: /connect <host> <port>");
                return Ok(());
            };
            let port = port.parse::<u16>()?;
            let refnum = handle.raw_connect(host, port, Family::V4).await?;
            println!("{} -- raw connection #{refnum} to {host}:{port}", stamp());
        }
        "msg" => match rest.split_once(' ') {
            Some((target, text)) => handle.privmsg(target, text).await?,
            None => eprintln!("Usage: /msg <target> <text>"),
        },
        "join" if !rest.is_empty() => handle.join(rest).await?,
        "quit" => {
            handle.quit((!rest.is_empty()).then_some(rest)).await?;
        }
        _ => handle.raw(cmd_line).await?,
    }
    Ok(())
}
