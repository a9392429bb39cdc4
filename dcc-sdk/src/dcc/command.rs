//! The `/DCC` command surface and the RAW socket primitives.

use std::fs::{self, OpenOptions};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::ctcp::{self, CtcpKind};

use super::codec;
use super::error::{DccError, Result};
use super::hooks::LostReason;
use super::registry::{Activity, Search};
use super::session::{ConnectionKind, ConnectionPhase, Family, Refnum};
use super::{Dcc, ServerContext};

/// Resolve `host` to its first address of the given family.
pub async fn resolve_host(host: &str, port: u16, family: Family) -> Option<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await
        .ok()?
        .find(|a| Family::of(a) == family)
}

/// Lowest port a RAW listener may bind explicitly.
const PRIVILEGED_PORTS: u16 = 1024;

fn is_wildcard(arg: &str) -> bool {
    arg == "*" || arg.eq_ignore_ascii_case("-all")
}

fn looks_like_channel(name: &str) -> bool {
    name.starts_with(['#', '&', '+', '!'])
}

impl Dcc {
    /// Run one `/DCC` command line (without the `/DCC` itself). An empty
    /// line lists sessions.
    pub fn command(&mut self, ctx: &ServerContext, line: &str) -> Result<()> {
        let line = line.trim();
        let (cmd, rest) = match line.split_once(char::is_whitespace) {
            Some((cmd, rest)) => (cmd, rest.trim_start()),
            None => (line, ""),
        };
        let cmd = if cmd.is_empty() { "LIST".to_string() } else { cmd.to_ascii_uppercase() };
        tracing::debug!(%cmd, args = rest, "DCC command");

        self.guarded(|dcc| match cmd.as_str() {
            "CHAT" => dcc.chat_command(ctx, &ctcp::split_args(rest)),
            "SEND" => dcc.send_command(ctx, &ctcp::split_args(rest)),
            "GET" => dcc.get_command(false, &ctcp::split_args(rest)),
            "RESUME" => dcc.get_command(true, &ctcp::split_args(rest)),
            "CLOSE" => dcc.close_command(&ctcp::split_args(rest)),
            "CLOSEALL" => dcc.close_all(),
            "LIST" => {
                dcc.list();
                Ok(())
            }
            "RENAME" => dcc.rename_command(&ctcp::split_args(rest)),
            "RAW" => dcc.raw_command(rest),
            other => {
                let text = format!("Unknown DCC command: {other}");
                dcc.say(&text);
                Err(DccError::Usage(text))
            }
        })
    }

    fn usage(&mut self, text: &str) -> Result<()> {
        self.say(text);
        Err(DccError::Usage(text.to_string()))
    }

    /// Requested port, or the configured default when none was given.
    fn port_or_default(&self, port: u16) -> u16 {
        if port == 0 { self.settings.default_port.unwrap_or(0) } else { port }
    }

    // ── CHAT ────────────────────────────────────────────────────────

    fn chat_command(&mut self, ctx: &ServerContext, argv: &[String]) -> Result<()> {
        const USAGE: &str = "Usage: /DCC CHAT <nick> [-p port]|[-6]|[-4]";
        if argv.is_empty() {
            return self.usage(USAGE);
        }

        let mut user: Option<&str> = None;
        let mut port = 0u16;
        let mut family = Family::V4;
        let mut i = 0;
        while i < argv.len() {
            match argv[i].as_str() {
                "-4" => family = Family::V4,
                "-6" => family = Family::V6,
                "-p" => match argv.get(i + 1).map(|p| p.parse::<u16>()) {
                    None => self.say("DCC CHAT: Argument to -p missing -- ignored"),
                    Some(Err(_)) => self.say("DCC CHAT: Argument to -p non-numeric -- ignored"),
                    Some(Ok(p)) => {
                        port = p;
                        i += 1;
                    }
                },
                opt if opt.starts_with('-') => {
                    self.say(&format!("DCC CHAT: Option {opt} not supported"));
                }
                nick if user.is_some() => self.say(&format!(
                    "DCC CHAT: Opening multiple chats per command not supported yet -- \
                     ignoring extra nick {nick}"
                )),
                nick => user = Some(nick),
            }
            i += 1;
        }
        let Some(user) = user else {
            return self.usage(USAGE);
        };

        let refnum = match self.registry.search(&Search::kind(ConnectionKind::Chat).user(user)) {
            Some(refnum) => {
                let phase = self.registry.get(refnum).map(|s| s.phase);
                if matches!(phase, Some(ConnectionPhase::Active | ConnectionPhase::MyOffer)) {
                    self.say(&format!(
                        "Sending a booster CTCP handshake for an existing DCC CHAT to {user}"
                    ));
                    return self.send_offer(ctx, refnum);
                }
                refnum
            }
            None => self.registry.create(
                ConnectionKind::Chat,
                user,
                Some("chat"),
                None,
                family,
                0,
                self.settings.block_size(),
            ),
        };

        let want_port = self.port_or_default(port);
        let Some(s) = self.registry.get_mut(refnum) else {
            return Err(DccError::NotFound(refnum.to_string()));
        };
        s.two_clients = true;
        s.want_port = want_port;
        if s.phase == ConnectionPhase::TheirOffer {
            self.connect(refnum)
        } else {
            self.listen(ctx, refnum)
        }
    }

    // ── SEND ────────────────────────────────────────────────────────

    fn send_command(&mut self, ctx: &ServerContext, argv: &[String]) -> Result<()> {
        const USAGE: &str = "Usage: /DCC SEND <[=]nick> <file> [<file> ...]";
        let Some((user, rest)) = argv.split_first() else {
            return self.usage(USAGE);
        };

        let mut family = Family::V4;
        let mut port = 0u16;
        let mut parsed = 0usize;
        let mut args = rest.iter();
        while let Some(arg) = args.next() {
            if let Some(flag) = arg.strip_prefix('-') {
                match flag.chars().next() {
                    Some('p') => port = args.next().and_then(|p| p.parse().ok()).unwrap_or(0),
                    Some('6') => family = Family::V6,
                    Some('4') => family = Family::V4,
                    _ => {}
                }
                continue;
            }

            let Ok(fullname) = fs::canonicalize(arg) else {
                self.say(&format!("{arg} is not a valid file"));
                continue;
            };
            parsed += 1;
            let shown = fullname.display().to_string();
            if fs::File::open(&fullname).is_err() {
                self.say(&format!("Cannot send {shown} because you dont have read permission"));
                continue;
            }
            let size = match fs::metadata(&fullname) {
                Ok(meta) if meta.is_dir() => {
                    self.say(&format!("Cannot send {shown} because it is a directory"));
                    continue;
                }
                Ok(meta) => meta.len(),
                Err(e) => {
                    self.say(&format!("Unable to open {shown}: {e}"));
                    continue;
                }
            };

            let existing = self.registry.search(
                &Search::kind(ConnectionKind::SendOffer)
                    .user(user)
                    .description(Some(shown.as_str()))
                    .othername(Some(arg.as_str())),
            );
            let refnum = match existing {
                Some(refnum) => {
                    let phase = self.registry.get(refnum).map(|s| s.phase);
                    if matches!(phase, Some(ConnectionPhase::Active | ConnectionPhase::MyOffer)) {
                        self.say(&format!(
                            "Sending a booster CTCP handshake for an existing DCC SEND:{shown} to {user}"
                        ));
                        if let Err(e) = self.send_offer(ctx, refnum) {
                            tracing::debug!(%refnum, error = %e, "booster handshake failed");
                        }
                        continue;
                    }
                    refnum
                }
                None => self.registry.create(
                    ConnectionKind::SendOffer,
                    user,
                    Some(&shown),
                    Some(arg),
                    family,
                    size,
                    self.settings.block_size(),
                ),
            };

            let want_port = self.port_or_default(port);
            if let Some(s) = self.registry.get_mut(refnum) {
                s.two_clients = true;
                s.want_port = want_port;
            }
            if let Err(e) = self.listen(ctx, refnum) {
                tracing::warn!(%refnum, error = %e, "DCC SEND offer failed");
            }
        }

        if parsed == 0 {
            return self.usage(USAGE);
        }
        Ok(())
    }

    // ── GET / RESUME ────────────────────────────────────────────────

    fn get_command(&mut self, resume: bool, argv: &[String]) -> Result<()> {
        let Some((user, files)) = argv.split_first() else {
            return self.usage("You must supply a nickname for DCC GET");
        };
        let user = user.as_str();
        let mut files: Vec<&str> = files.iter().map(String::as_str).collect();

        // A directory as the last argument overrides the store path.
        let mut savedir = None;
        if let Some(last) = files.last() {
            if Path::new(*last).is_dir() {
                savedir = Some(PathBuf::from(*last));
                files.pop();
            }
        }
        // `GET nick old new` renames a single pending offer first.
        if savedir.is_none()
            && files.len() == 2
            && self.registry.get_bucket(Some(user), Some(files[0])).len() == 1
            && self.registry.get_bucket(Some(user), Some(files[1])).is_empty()
        {
            let old = self.registry.get_bucket(Some(user), Some(files[0]));
            if let Some(s) = old.first().and_then(|&r| self.registry.get_mut(r)) {
                s.description = Some(files[1].to_string());
            }
            files.remove(0);
        }

        let savedir = savedir.unwrap_or_else(|| self.settings.store_path());
        let mut savedir_warned = false;
        let wanted: Vec<Option<&str>> = if files.is_empty() {
            vec![None]
        } else {
            files.iter().copied().map(Some).collect()
        };

        let mut count = 0usize;
        let mut last_wanted = None;
        for filename in wanted {
            last_wanted = filename;
            let bucket = self.registry.get_bucket(Some(user), filename);
            count += bucket.len();
            for refnum in bucket {
                let Some(s) = self.registry.get(refnum) else { continue };
                let realname = codec::url_decode(s.description.as_deref().unwrap_or(""));
                let fullname = if Path::new(&realname).is_absolute() {
                    PathBuf::from(&realname)
                } else {
                    if !savedir.is_dir() {
                        if !savedir_warned {
                            savedir_warned = true;
                            self.say(&format!(
                                "DCC GET: Can't save file because {} is not a valid directory.",
                                savedir.display()
                            ));
                            self.say("DCC GET: Check the DCC store path and try again.");
                        }
                        continue;
                    }
                    savedir.join(&realname)
                };
                self.lock(Some(refnum));
                self.accept_file(refnum, user, fullname, resume);
                self.unlock(Some(refnum));
            }
        }

        if count == 0 {
            let text = match last_wanted {
                Some(f) => format!("No file ({f}) offered in SEND mode by {user}"),
                None => format!("No file offered in SEND mode by {user}"),
            };
            self.say(&text);
            return Err(DccError::NotFound(text));
        }
        Ok(())
    }

    /// Open the local file for an offered GET and either connect or ask the
    /// peer to resume.
    fn accept_file(&mut self, refnum: Refnum, user: &str, fullname: PathBuf, resume: bool) {
        let existing = fs::metadata(&fullname).ok().map(|m| m.len());
        let resuming = resume && self.settings.mirc_resume && existing.is_some();
        let opened = if resuming {
            OpenOptions::new().append(true).open(&fullname)
        } else {
            OpenOptions::new().write(true).create(true).truncate(true).open(&fullname)
        };
        let file = match opened {
            Ok(f) => f,
            Err(e) => {
                self.say(&format!("Unable to open {}: {e}", fullname.display()));
                return;
            }
        };
        let Some(s) = self.registry.get_mut(refnum) else { return };
        s.local_filename = Some(fullname);
        s.open_callback = None;
        s.file = Some(file);

        if !resuming {
            s.two_clients = true;
            if let Err(e) = self.connect(refnum) {
                tracing::warn!(%refnum, error = %e, "DCC GET connect failed");
            }
            return;
        }

        let size = existing.unwrap_or(0);
        s.bytes_sent = 0;
        s.bytes_read = size;
        s.resume_size = size;
        s.resume_requested = true;
        let port = s.offer.map(|a| a.port().to_string()).unwrap_or_default();
        s.othername = Some(port.clone());
        let description = s.description.clone().unwrap_or_default();
        let body = if description.contains(' ') {
            format!("DCC RESUME \"{description}\" {port} {size}")
        } else {
            format!("DCC RESUME {description} {port} {size}")
        };
        tracing::debug!(%refnum, user, %description, size, "requesting DCC RESUME");
        self.send_ctcp(CtcpKind::Request, user, body);
    }

    // ── CLOSE / CLOSEALL ────────────────────────────────────────────

    fn close_command(&mut self, argv: &[String]) -> Result<()> {
        if argv.len() < 2 {
            return self.usage("Usage: /DCC CLOSE <type> <nick> [<file>]");
        }
        let kind = if is_wildcard(&argv[0]) {
            None
        } else {
            match ConnectionKind::from_name(&argv[0]) {
                Some(kind) => Some(kind),
                None => {
                    let text = format!("DCC CLOSE: Unknown DCC type: {}", argv[0]);
                    self.say(&text);
                    return Err(DccError::UnknownType(argv[0].clone()));
                }
            }
        };
        let user = (!is_wildcard(&argv[1])).then_some(argv[1].as_str());
        self.close_matching(kind, user, argv.get(2).map(String::as_str))
    }

    /// Close every session.
    pub fn close_all(&mut self) -> Result<()> {
        self.guarded(|dcc| dcc.close_matching(None, None, None))
    }

    fn close_matching(
        &mut self,
        kind: Option<ConnectionKind>,
        user: Option<&str>,
        file: Option<&str>,
    ) -> Result<()> {
        let query = Search {
            kind,
            user,
            description: file,
            othername: file,
            activity: Activity::Any,
        };
        let mut count = 0usize;
        while let Some(refnum) = self.registry.search(&query) {
            count += 1;
            let Some(s) = self.registry.get(refnum) else { break };
            let text = format!(
                "DCC {}:{} to {} closed",
                s.kind,
                file.unwrap_or("<any>"),
                s.user
            );
            self.lock(Some(refnum));
            self.lost(refnum, LostReason::UserAborted, None, text);
            self.delete(refnum);
            self.unlock(Some(refnum));
        }

        if count == 0 {
            let text = format!(
                "No DCC {}:{} to {} found",
                kind.map_or("<any>", ConnectionKind::as_str),
                file.unwrap_or("<any>"),
                user.unwrap_or("<any>")
            );
            self.say(&text);
            return Err(DccError::NotFound(text));
        }
        Ok(())
    }

    // ── RENAME ──────────────────────────────────────────────────────

    fn rename_command(&mut self, argv: &[String]) -> Result<()> {
        let (user, old, new) = match argv {
            [user, new] => (user.as_str(), None, new.as_str()),
            [user, old, new, ..] => (user.as_str(), Some(old.as_str()), new.as_str()),
            _ => return self.usage("You must specify a nick and new filename for DCC RENAME"),
        };

        let (kind, user, old) = if user.eq_ignore_ascii_case("-CHAT") {
            let Some(nick) = old else {
                return self.usage("You must specify a new nickname for DCC RENAME -CHAT");
            };
            (ConnectionKind::Chat, nick, Some("chat"))
        } else {
            (ConnectionKind::GetOffer, user, old)
        };

        let Some(refnum) = self
            .registry
            .search(&Search::kind(kind).user(user).description(old))
        else {
            let text = format!(
                "{user} has not yet offered you the file {}",
                old.unwrap_or("<any>")
            );
            self.say(&text);
            return Err(DccError::NotFound(text));
        };

        if kind == ConnectionKind::Chat {
            if looks_like_channel(new) {
                return self.usage(
                    "I can't permit you to DCC RENAME to something that looks like a channel, sorry.",
                );
            }
            self.say(&format!("DCC CHAT from {user} changed to new nick {new}"));
            if let Some(s) = self.registry.get_mut(refnum) {
                s.user = new.to_string();
            }
            return Ok(());
        }

        let Some(s) = self.registry.get_mut(refnum) else {
            return Err(DccError::NotFound(refnum.to_string()));
        };
        if s.phase == ConnectionPhase::Active {
            return self.usage("Too late to rename that file");
        }
        let text = format!(
            "File {} from {user} renamed to {new}",
            s.description.as_deref().unwrap_or("<any>")
        );
        s.description = Some(new.to_string());
        self.say(&text);
        Ok(())
    }

    // ── RAW ─────────────────────────────────────────────────────────

    fn raw_command(&mut self, rest: &str) -> Result<()> {
        let mut words = rest.splitn(3, char::is_whitespace);
        let Some(name) = words.next().filter(|w| !w.is_empty()) else {
            return self.usage("No name specified for DCC RAW");
        };
        let Some(host) = words.next().filter(|w| !w.is_empty()) else {
            return self.usage("No hostname specified for DCC RAW");
        };
        self.send_raw(name, host, words.next().unwrap_or(""))
    }

    /// Accept arbitrary inbound TCP connections on `port` (0 for any).
    /// Each accepted connection becomes its own RAW session.
    pub fn raw_listen(&mut self, ctx: &ServerContext, port: u16, family: Family) -> Result<Refnum> {
        self.guarded(|dcc| {
            if port != 0 && port < PRIVILEGED_PORTS {
                let text = "May not bind to a privileged port";
                dcc.say(text);
                return Err(DccError::Usage(text.to_string()));
            }
            let name = port.to_string();
            let refnum = match dcc
                .registry
                .search(&Search::kind(ConnectionKind::RawListen).user(&name))
            {
                Some(refnum) => {
                    let phase = dcc.registry.get(refnum).map(|s| s.phase);
                    if matches!(phase, Some(ConnectionPhase::Active | ConnectionPhase::MyOffer)) {
                        let text = format!("A previous DCC RAW_LISTEN on {name} exists");
                        dcc.say(&text);
                        return Err(DccError::Usage(text));
                    }
                    refnum
                }
                None => dcc.registry.create(
                    ConnectionKind::RawListen,
                    &name,
                    Some("raw_listen"),
                    None,
                    family,
                    0,
                    dcc.settings.block_size(),
                ),
            };

            dcc.lock(Some(refnum));
            if let Some(s) = dcc.registry.get_mut(refnum) {
                s.want_port = port;
            }
            let listened = dcc.listen(ctx, refnum);
            if listened.is_ok() {
                if let Some(s) = dcc.registry.get_mut(refnum) {
                    s.phase = ConnectionPhase::Active;
                    s.mark_started();
                    if let Some(bound) = s.local_addr {
                        s.user = bound.port().to_string();
                    }
                }
            }
            dcc.unlock(Some(refnum));
            listened.map(|()| refnum)
        })
    }

    /// Open an outbound RAW connection to `host:port`. `addr` is what
    /// [`resolve_host`] found for `host`; `None` means the lookup failed.
    pub fn raw_connect(&mut self, host: &str, port: u16, addr: Option<SocketAddr>) -> Result<Refnum> {
        self.guarded(|dcc| {
            let Some(addr) = addr else {
                let text = format!("Unknown host: {host}");
                dcc.say(&text);
                return Err(DccError::Address(text));
            };
            let family = Family::of(&addr);

            let name = port.to_string();
            let existing = dcc.registry.search(
                &Search::kind(ConnectionKind::Raw)
                    .user(&name)
                    .description(Some(host)),
            );
            let refnum = match existing {
                Some(refnum) => {
                    if dcc.registry.get(refnum).map(|s| s.phase) == Some(ConnectionPhase::Active) {
                        let text = format!("A previous DCC RAW to {host} on {name} exists");
                        dcc.say(&text);
                        return Err(DccError::Usage(text));
                    }
                    refnum
                }
                None => dcc.registry.create(
                    ConnectionKind::Raw,
                    &name,
                    Some(host),
                    None,
                    family,
                    0,
                    dcc.settings.block_size(),
                ),
            };

            dcc.lock(Some(refnum));
            if let Some(s) = dcc.registry.get_mut(refnum) {
                s.offer = Some(addr);
                s.phase = ConnectionPhase::TheirOffer;
            }
            let connected = dcc.connect(refnum);
            dcc.unlock(Some(refnum));
            connected.map(|()| refnum)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::super::hooks::DccEvent;
    use super::super::test_support::*;
    use super::super::{DccSettings, Outbound};
    use super::*;

    fn offered(dcc: &mut Dcc, args: &str) {
        dcc.handle_ctcp(&ctx(), "bob", Some("bob@example.org"), args, false)
            .unwrap();
    }

    fn bodies(dcc: &mut Dcc) -> Vec<String> {
        dcc.drain_outbound()
            .into_iter()
            .filter_map(|o| match o {
                Outbound::Ctcp { body, .. } => Some(body),
                Outbound::Ison(_) => None,
            })
            .collect()
    }

    fn storing_in(dir: &Path) -> DccSettings {
        DccSettings {
            store_path: Some(dir.to_path_buf()),
            ..DccSettings::default()
        }
    }

    #[test]
    fn unknown_commands_and_missing_arguments() {
        let (mut dcc, rec) = manager(DccSettings::default());
        assert!(dcc.command(&ctx(), "FROB bob").is_err());
        assert!(rec.said_containing("Unknown DCC command: FROB"));

        assert!(dcc.command(&ctx(), "CHAT").is_err());
        assert!(rec.said_containing("Usage: /DCC CHAT"));
        assert!(dcc.command(&ctx(), "GET").is_err());
        assert!(rec.said_containing("You must supply a nickname for DCC GET"));
        assert!(dcc.command(&ctx(), "RAW").is_err());
        assert!(rec.said_containing("No name specified for DCC RAW"));
        assert!(dcc.command(&ctx(), "RAW 3").is_err());
        assert!(rec.said_containing("No hostname specified for DCC RAW"));
        assert!(dcc.command(&ctx(), "CLOSE GET").is_err());
        assert!(rec.said_containing("Usage: /DCC CLOSE"));
    }

    #[test]
    fn empty_command_lists() {
        let (mut dcc, rec) = manager(DccSettings::default());
        dcc.command(&ctx(), "").unwrap();
        assert!(rec.said_containing("Type"));
    }

    #[tokio::test]
    async fn chat_listens_offers_and_boosts() {
        let (mut dcc, rec) = manager(DccSettings::default());
        dcc.command(&ctx(), "chat bob").unwrap();

        let r = dcc.registry.search(&Search::kind(ConnectionKind::Chat).user("bob")).unwrap();
        let s = dcc.session(r).unwrap();
        assert_eq!(s.phase, ConnectionPhase::MyOffer);
        let port = s.local_addr.unwrap().port();
        assert_eq!(bodies(&mut dcc), vec![format!("DCC CHAT chat 2130706433 {port}")]);

        dcc.command(&ctx(), "CHAT bob").unwrap();
        assert!(rec.said_containing("Sending a booster CTCP handshake for an existing DCC CHAT to bob"));
        assert_eq!(bodies(&mut dcc).len(), 1);
        assert_eq!(dcc.registry.len(), 1);
    }

    #[tokio::test]
    async fn send_checks_files_before_offering() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        fs::File::create(&path).unwrap().write_all(b"hello").unwrap();
        let (mut dcc, rec) = manager(DccSettings::default());

        let missing = dir.path().join("missing.txt");
        assert!(dcc.command(&ctx(), &format!("SEND bob {}", missing.display())).is_err());
        assert!(rec.said_containing("is not a valid file"));
        assert!(rec.said_containing("Usage: /DCC SEND"));

        dcc.command(&ctx(), &format!("SEND bob {}", dir.path().display())).unwrap();
        assert!(rec.said_containing("because it is a directory"));
        assert!(dcc.registry.is_empty());

        dcc.command(&ctx(), &format!("SEND bob {}", path.display())).unwrap();
        let r = dcc.registry.search(&Search::kind(ConnectionKind::SendOffer)).unwrap();
        let s = dcc.session(r).unwrap();
        assert_eq!(s.filesize, 5);
        assert_eq!(s.phase, ConnectionPhase::MyOffer);
        let port = s.local_addr.unwrap().port();
        assert_eq!(bodies(&mut dcc), vec![format!("DCC SEND a.txt 2130706433 {port} 5")]);
        assert!(rec.said_containing("Sent DCC SEND request (a.txt 5) to bob"));

        dcc.command(&ctx(), &format!("SEND bob {}", path.display())).unwrap();
        assert!(rec.said_containing("Sending a booster CTCP handshake for an existing DCC SEND:"));
        assert_eq!(bodies(&mut dcc), vec![format!("DCC SEND a.txt 2130706433 {port} 5")]);
        assert_eq!(dcc.registry.len(), 1);
    }

    #[test]
    fn get_without_an_offer() {
        let (mut dcc, rec) = manager(DccSettings::default());
        assert!(dcc.command(&ctx(), "GET bob").is_err());
        assert!(rec.said_containing("No file offered in SEND mode by bob"));
        assert!(dcc.command(&ctx(), "GET bob a.txt").is_err());
        assert!(rec.said_containing("No file (a.txt) offered in SEND mode by bob"));
    }

    #[tokio::test]
    async fn get_opens_the_file_and_dials_the_offer() {
        let dir = tempfile::tempdir().unwrap();
        let (mut dcc, _) = manager(storing_in(dir.path()));
        offered(&mut dcc, "SEND a.txt 2130706433 4000 10");

        dcc.command(&ctx(), "GET bob").unwrap();
        let r = dcc.registry.search(&Search::kind(ConnectionKind::GetOffer)).unwrap();
        let s = dcc.session(r).unwrap();
        assert_eq!(s.phase, ConnectionPhase::Connecting);
        assert_eq!(s.local_filename.as_deref(), Some(dir.path().join("a.txt").as_path()));
        assert!(dir.path().join("a.txt").exists());
    }

    #[tokio::test]
    async fn get_with_two_names_renames_first() {
        let dir = tempfile::tempdir().unwrap();
        let (mut dcc, _) = manager(storing_in(dir.path()));
        offered(&mut dcc, "SEND a.txt 2130706433 4000 10");

        dcc.command(&ctx(), "GET bob a.txt c.txt").unwrap();
        let r = dcc.registry.search(&Search::kind(ConnectionKind::GetOffer)).unwrap();
        assert_eq!(dcc.session(r).unwrap().description.as_deref(), Some("c.txt"));
        assert!(dir.path().join("c.txt").exists());
        assert!(!dir.path().join("a.txt").exists());
    }

    #[test]
    fn resume_asks_the_peer_for_the_remainder() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), [7u8; 40]).unwrap();
        let (mut dcc, _) = manager(DccSettings {
            mirc_resume: true,
            ..storing_in(dir.path())
        });
        offered(&mut dcc, "SEND a.txt 2130706433 4000 100");

        dcc.command(&ctx(), "RESUME bob a.txt").unwrap();
        assert_eq!(bodies(&mut dcc), vec!["DCC RESUME a.txt 4000 40".to_string()]);
        let r = dcc.registry.search(&Search::kind(ConnectionKind::GetOffer)).unwrap();
        let s = dcc.session(r).unwrap();
        assert!(s.resume_requested);
        assert_eq!((s.resume_size, s.bytes_read), (40, 40));
        assert_eq!(s.othername.as_deref(), Some("4000"));
        assert_eq!(s.phase, ConnectionPhase::TheirOffer);
    }

    #[test]
    fn close_reports_and_deletes() {
        let (mut dcc, rec) = manager(DccSettings::default());
        offered(&mut dcc, "SEND a.txt 2130706433 4000 10");

        dcc.command(&ctx(), "CLOSE get bob").unwrap();
        assert!(dcc.registry.is_empty());
        assert!(rec.said_containing("DCC GET:<any> to bob closed"));
        assert!(rec.events.lock().iter().any(|e| matches!(
            e,
            DccEvent::Lost { reason: LostReason::UserAborted, .. }
        )));

        assert!(dcc.command(&ctx(), "CLOSE GET bob").is_err());
        assert!(rec.said_containing("No DCC GET:<any> to bob found"));
        assert!(dcc.command(&ctx(), "CLOSE FOO bob").is_err());
        assert!(rec.said_containing("DCC CLOSE: Unknown DCC type: FOO"));
    }

    #[test]
    fn closeall_empties_the_registry() {
        let (mut dcc, _) = manager(DccSettings::default());
        offered(&mut dcc, "SEND a.txt 2130706433 4000 10");
        offered(&mut dcc, "CHAT chat 2130706433 4001");
        dcc.command(&ctx(), "CLOSEALL").unwrap();
        assert!(dcc.registry.is_empty());
    }

    #[test]
    fn rename_offers_and_chats() {
        let (mut dcc, rec) = manager(DccSettings::default());
        offered(&mut dcc, "SEND a.txt 2130706433 4000 10");
        offered(&mut dcc, "CHAT chat 2130706433 4001");

        dcc.command(&ctx(), "RENAME bob a.txt b.txt").unwrap();
        assert!(rec.said_containing("File a.txt from bob renamed to b.txt"));
        assert_eq!(dcc.registry.get_bucket(Some("bob"), Some("b.txt")).len(), 1);

        assert!(dcc.command(&ctx(), "RENAME bob nothing.txt x.txt").is_err());
        assert!(rec.said_containing("bob has not yet offered you the file nothing.txt"));

        assert!(dcc.command(&ctx(), "RENAME -CHAT bob").is_err());
        assert!(rec.said_containing("You must specify a new nickname for DCC RENAME -CHAT"));
        assert!(dcc.command(&ctx(), "RENAME -CHAT bob #chan").is_err());

        dcc.command(&ctx(), "RENAME -CHAT bob robert").unwrap();
        assert!(rec.said_containing("DCC CHAT from bob changed to new nick robert"));
        assert!(dcc.registry.search(&Search::kind(ConnectionKind::Chat).user("robert")).is_some());
    }

    #[test]
    fn raw_listen_refuses_privileged_ports() {
        let (mut dcc, rec) = manager(DccSettings::default());
        assert!(dcc.raw_listen(&ctx(), 80, Family::V4).is_err());
        assert!(rec.said_containing("May not bind to a privileged port"));
        assert!(dcc.registry.is_empty());
    }

    #[tokio::test]
    async fn raw_listen_then_connect() {
        let (mut dcc, rec) = manager(DccSettings::default());
        let listener = dcc.raw_listen(&ctx(), 0, Family::V4).unwrap();
        let s = dcc.session(listener).unwrap();
        assert_eq!(s.phase, ConnectionPhase::Active);
        let port = s.local_addr.unwrap().port();
        assert_eq!(s.user, port.to_string());
        assert!(!dcc.has_outbound());

        let addr = resolve_host("127.0.0.1", port, Family::V4).await;
        assert_eq!(addr, Some(SocketAddr::from(([127, 0, 0, 1], port))));
        let raw = dcc.raw_connect("127.0.0.1", port, addr).unwrap();
        let s = dcc.session(raw).unwrap();
        assert_eq!(s.kind, ConnectionKind::Raw);
        assert_eq!(s.phase, ConnectionPhase::Connecting);
        assert_eq!(s.description.as_deref(), Some("127.0.0.1"));

        let addr = resolve_host("127.0.0.1", port, Family::V6).await;
        assert!(addr.is_none());
        assert!(dcc.raw_connect("127.0.0.1", port, addr).is_err());
        assert!(rec.said_containing("Unknown host: 127.0.0.1"));
    }
}
