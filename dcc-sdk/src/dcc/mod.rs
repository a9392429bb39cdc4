//! DCC (Direct Client Connection) subsystem.
//!
//! A [`Dcc`] manager owns every DCC session. It never spawns tasks: the
//! enclosing client loop awaits [`Dcc::wait_ready`] next to its server
//! socket, hands the ready refnums to [`Dcc::service`], calls
//! [`Dcc::supervise`] once a second, and drains [`Dcc::drain_outbound`] to
//! the server after each step.
//!
//! Sessions are never freed while anything iterates the registry. Every
//! entry point runs under a global borrow; deleted sessions are reclaimed
//! when the outermost borrow is released.

mod chat;
pub mod codec;
mod command;
pub mod ctl;
pub mod error;
mod handshake;
pub mod hooks;
pub mod list;
pub mod registry;
mod resume;
pub mod session;
pub mod settings;
mod socket;
mod supervisor;
mod transfer;

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::ctcp::{self, CtcpKind};
use crate::irc::Message;

pub use command::resolve_host;
pub use error::{DccError, Result};
pub use hooks::{DccEvent, Hooks, LogHooks, LostReason, RawActivity};
pub use list::{ListEntry, calc_size, calc_speed};
pub use registry::{Activity, Registry, Search};
pub use session::{ConnectionKind, ConnectionPhase, Family, OpenCallback, Refnum, Session};
pub use settings::DccSettings;

/// Automatic REJECTs are sent at most this often.
const REJECT_THROTTLE: Duration = Duration::from_secs(2);

/// What the DCC core needs to know about the server connection.
#[derive(Debug, Clone, Default)]
pub struct ServerContext {
    /// Our current nick.
    pub nickname: String,
    /// Registration (001) has completed.
    pub registered: bool,
    /// Local address of the server socket, used as the "virtual host" when
    /// an offer is bound to the unspecified address.
    pub local_addr: Option<SocketAddr>,
}

impl ServerContext {
    pub fn new(nickname: &str) -> Self {
        Self {
            nickname: nickname.to_string(),
            ..Self::default()
        }
    }
}

/// Something the DCC core wants written to the IRC server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Ctcp {
        kind: CtcpKind,
        target: String,
        body: String,
    },
    /// Liveness check ahead of an automatic REJECT.
    Ison(String),
}

impl Outbound {
    /// The IRC line that carries this item.
    pub fn to_message(&self) -> Message {
        match self {
            Outbound::Ctcp { kind, target, body } => {
                let text = ctcp::frame(body);
                Message::new(kind.command(), vec![target.as_str(), text.as_str()])
            }
            Outbound::Ison(nick) => Message::new("ISON", vec![nick.as_str()]),
        }
    }
}

/// A REJECT waiting on its ISON reply.
#[derive(Debug)]
struct PendingReject {
    nick: String,
    kind: &'static str,
    description: String,
}

pub struct Dcc {
    pub(crate) registry: Registry,
    pub(crate) settings: DccSettings,
    hooks: Box<dyn Hooks>,
    outbox: VecDeque<Outbound>,
    pending_rejects: VecDeque<PendingReject>,
    last_reject: Option<Instant>,
    status: String,
}

impl std::fmt::Debug for Dcc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dcc")
            .field("sessions", &self.registry.len())
            .field("settings", &self.settings)
            .field("outbox", &self.outbox)
            .finish_non_exhaustive()
    }
}

impl Dcc {
    pub fn new(settings: DccSettings, hooks: Box<dyn Hooks>) -> Self {
        Self {
            registry: Registry::new(),
            settings,
            hooks,
            outbox: VecDeque::new(),
            pending_rejects: VecDeque::new(),
            last_reject: None,
            status: String::new(),
        }
    }

    pub fn settings(&self) -> &DccSettings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut DccSettings {
        &mut self.settings
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Live session by refnum.
    pub fn session(&self, refnum: Refnum) -> Option<&Session> {
        self.registry.get(refnum)
    }

    /// Mutable access for embedders (hold/unhold, callbacks).
    pub fn session_mut(&mut self, refnum: Refnum) -> Option<&mut Session> {
        self.registry.get_mut(refnum)
    }

    /// Most recent transfer progress text, empty when idle.
    pub fn current_transfer(&self) -> &str {
        &self.status
    }

    /// Take everything queued for the server.
    pub fn drain_outbound(&mut self) -> Vec<Outbound> {
        self.outbox.drain(..).collect()
    }

    pub fn has_outbound(&self) -> bool {
        !self.outbox.is_empty()
    }

    /// Route a CTCP `DCC` payload. `reply` is true when it arrived in a
    /// NOTICE.
    pub fn handle_ctcp(
        &mut self,
        ctx: &ServerContext,
        from: &str,
        userhost: Option<&str>,
        args: &str,
        reply: bool,
    ) -> Result<()> {
        let argv = ctcp::split_args(args);
        let Some(kind) = argv.first() else {
            return Err(DccError::ProtocolViolation(format!("empty DCC from {from}")));
        };
        let arg = |i: usize| argv.get(i).map(String::as_str);
        if reply {
            if kind.eq_ignore_ascii_case("REJECT") {
                self.guarded(|dcc| dcc.receive_reject(from, arg(1).unwrap_or(""), arg(2)));
            } else {
                tracing::debug!(from, kind = %kind, "ignoring DCC reply");
            }
            return Ok(());
        }
        let description = arg(1).unwrap_or("");
        self.guarded(|dcc| {
            dcc.receive_offer(
                ctx,
                from,
                userhost,
                kind,
                description,
                arg(2).unwrap_or(""),
                arg(3).unwrap_or(""),
                arg(4),
            )
        })
    }

    /// Feed the trailing parameter of a 303 (ISON) reply.
    pub fn on_ison_reply(&mut self, online: &str) {
        let Some(pending) = self.pending_rejects.pop_front() else {
            return;
        };
        if online
            .split_whitespace()
            .any(|n| n.eq_ignore_ascii_case(&pending.nick))
        {
            self.queue_reject(&pending.nick, pending.kind, &pending.description);
        } else {
            tracing::debug!(nick = %pending.nick, "peer offline, REJECT dropped");
        }
    }

    // ── Borrow discipline ───────────────────────────────────────────

    /// Run `f` under a global borrow, sweeping afterwards.
    pub(crate) fn guarded<T>(&mut self, f: impl FnOnce(&mut Self) -> T) -> T {
        self.lock(None);
        let out = f(self);
        self.unlock(None);
        out
    }

    pub(crate) fn lock(&mut self, refnum: Option<Refnum>) {
        self.registry.lock(refnum);
    }

    pub(crate) fn unlock(&mut self, refnum: Option<Refnum>) {
        if self.registry.unlock(refnum) {
            self.gc();
        }
    }

    /// Erase every deleted, unborrowed session.
    pub(crate) fn gc(&mut self) {
        if self.registry.global_lock() > 0 {
            return;
        }
        let mut file_erased = false;
        while let Some(session) = self.registry.take_reclaimable() {
            file_erased |= session.kind.is_file();
            self.erase(session);
        }
        if file_erased {
            self.set_status(None, String::new());
        }
    }

    fn erase(&mut self, mut session: Session) {
        debug_assert!(session.locked() == 0 && self.registry.global_lock() == 0);
        if !session.rejected && session.phase.is_offer() && self.settings.auto_send_rejects {
            let now = Instant::now();
            if self
                .last_reject
                .is_none_or(|t| now.duration_since(t) >= REJECT_THROTTLE)
            {
                self.last_reject = Some(now);
                session.rejected = true;
                let description = session.nopath().unwrap_or("<any>").to_string();
                let kind = session.kind.peer_name();
                if session.user.starts_with('=') {
                    self.queue_reject(&session.user, kind, &description);
                } else {
                    self.outbox.push_back(Outbound::Ison(session.user.clone()));
                    self.pending_rejects.push_back(PendingReject {
                        nick: session.user.clone(),
                        kind,
                        description,
                    });
                }
            }
        }
        session.close();
        tracing::debug!(refnum = %session.refnum, kind = %session.kind, user = %session.user, "DCC session erased");
    }

    fn queue_reject(&mut self, nick: &str, kind: &str, description: &str) {
        self.send_ctcp(CtcpKind::Reply, nick, format!("DCC REJECT {kind} {description}"));
    }

    // ── Helpers shared by the submodules ────────────────────────────

    /// Flag a session for deletion.
    pub(crate) fn delete(&mut self, refnum: Refnum) {
        if let Some(s) = self.registry.get_mut(refnum) {
            s.delete = true;
        }
    }

    pub(crate) fn send_ctcp(&mut self, kind: CtcpKind, target: &str, body: String) {
        tracing::debug!(target, %body, "queueing CTCP");
        self.outbox.push_back(Outbound::Ctcp {
            kind,
            target: target.to_string(),
            body,
        });
    }

    /// Offer an event to the hooks with the session borrowed.
    pub(crate) fn fire(&mut self, refnum: Option<Refnum>, event: &DccEvent) -> bool {
        self.lock(refnum);
        let consumed = self.hooks.fire(event);
        self.unlock(refnum);
        consumed
    }

    pub(crate) fn say(&mut self, text: &str) {
        tracing::debug!(%text, "dcc");
        self.hooks.say(text);
    }

    /// Fire `event`, printing `text` if nothing consumed it.
    pub(crate) fn announce(&mut self, refnum: Option<Refnum>, event: DccEvent, text: String) {
        if !self.fire(refnum, &event) {
            self.say(&text);
        }
    }

    /// Fire a lost event for a live session. The caller deletes it.
    pub(crate) fn lost(
        &mut self,
        refnum: Refnum,
        reason: LostReason,
        speed_kbps: Option<f64>,
        text: String,
    ) {
        let Some(s) = self.registry.get(refnum) else { return };
        let event = DccEvent::Lost {
            refnum,
            user: s.user.clone(),
            kind: s.kind,
            description: s.description.clone(),
            reason,
            speed_kbps,
        };
        self.announce(Some(refnum), event, text);
    }

    /// Replace the transfer status text and tell the hooks.
    pub(crate) fn set_status(&mut self, refnum: Option<Refnum>, status: String) {
        if refnum.is_some() && !self.settings.updates_status {
            return;
        }
        self.status = status.clone();
        self.fire(refnum, &DccEvent::Activity { refnum, status });
    }
}
