//! The per-connection record and its small value types.

use std::collections::VecDeque;
use std::fmt;
use std::fs::File;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use serde::Serialize;

use super::socket::{DccSocket, SocketEvent};

/// Process-unique session handle. Never reused while the process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Refnum(pub u64);

impl fmt::Display for Refnum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a session is for. Fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionKind {
    Chat,
    /// We are sending a file.
    SendOffer,
    /// We are receiving a file.
    GetOffer,
    Raw,
    RawListen,
}

impl ConnectionKind {
    pub const ALL: [ConnectionKind; 5] = [
        ConnectionKind::Chat,
        ConnectionKind::SendOffer,
        ConnectionKind::GetOffer,
        ConnectionKind::Raw,
        ConnectionKind::RawListen,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionKind::Chat => "CHAT",
            ConnectionKind::SendOffer => "SEND",
            ConnectionKind::GetOffer => "GET",
            ConnectionKind::Raw => "RAW",
            ConnectionKind::RawListen => "RAW_LISTEN",
        }
    }

    /// Case-insensitive lookup of the names used in commands and REJECTs.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(name))
    }

    /// The name the peer files this session under: our SEND is their GET.
    pub fn peer_name(self) -> &'static str {
        match self {
            ConnectionKind::SendOffer => "GET",
            ConnectionKind::GetOffer => "SEND",
            other => other.as_str(),
        }
    }

    pub fn is_file(self) -> bool {
        matches!(self, ConnectionKind::SendOffer | ConnectionKind::GetOffer)
    }
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a session is in its lifecycle.
///
/// `Connecting` is still their offer (we are dialing it); it only becomes
/// `Active` once the socket is up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionPhase {
    #[default]
    Unknown,
    MyOffer,
    TheirOffer,
    Connecting,
    Active,
}

impl ConnectionPhase {
    /// An offer nobody has consummated yet.
    pub fn is_offer(self) -> bool {
        matches!(
            self,
            ConnectionPhase::MyOffer | ConnectionPhase::TheirOffer | ConnectionPhase::Connecting
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Family {
    #[default]
    V4,
    V6,
}

impl Family {
    pub fn of(addr: &SocketAddr) -> Self {
        if addr.is_ipv4() { Family::V4 } else { Family::V6 }
    }

    pub fn unspecified(self) -> IpAddr {
        match self {
            Family::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            Family::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }
}

/// Continuation run once when the session's socket becomes active.
pub type OpenCallback = Box<dyn FnOnce(&mut Session) + Send>;

/// One DCC connection attempt or connection.
pub struct Session {
    pub refnum: Refnum,
    pub kind: ConnectionKind,
    pub phase: ConnectionPhase,
    pub delete: bool,
    /// A two-peer negotiation (handshake goes over IRC).
    pub two_clients: bool,
    /// A REJECT has already been sent or received for this offer.
    pub rejected: bool,
    /// We asked the peer to RESUME and are waiting for ACCEPT.
    pub resume_requested: bool,
    pub held: bool,
    pub updates_status: bool,
    pub(crate) locked: u32,
    pub family: Family,

    pub user: String,
    pub userhost: Option<String>,
    pub description: Option<String>,
    /// Alternate name. For listening offers this is the bound port.
    pub othername: Option<String>,
    pub local_filename: Option<PathBuf>,

    /// Address the peer offered.
    pub offer: Option<SocketAddr>,
    pub peer_addr: Option<SocketAddr>,
    pub local_addr: Option<SocketAddr>,
    pub want_port: u16,

    pub filesize: u64,
    pub bytes_read: u64,
    pub bytes_sent: u64,
    pub bytes_acked: u64,
    pub resume_size: u64,
    pub packets_total: u64,
    pub packets_transferred: u64,
    pub packets_acked: u64,
    /// End offsets of sent-but-unacknowledged packets, oldest first.
    pub(crate) in_flight: VecDeque<u64>,
    /// Bytes handed to us for the socket that it has not taken yet.
    pub(crate) unsent: Vec<u8>,
    pub(crate) line_buf: Vec<u8>,

    pub lasttime: Instant,
    pub starttime: Option<Instant>,
    pub started_at: Option<DateTime<Local>>,
    pub holdtime: Option<Instant>,
    pub heldtime: Duration,

    pub(crate) socket: DccSocket,
    pub(crate) pending: Option<SocketEvent>,
    pub(crate) file: Option<File>,
    pub(crate) open_callback: Option<OpenCallback>,
}

impl Session {
    pub(crate) fn new(
        refnum: Refnum,
        kind: ConnectionKind,
        user: &str,
        description: Option<&str>,
        othername: Option<&str>,
        family: Family,
        filesize: u64,
        block_size: usize,
    ) -> Self {
        Self {
            refnum,
            kind,
            phase: ConnectionPhase::Unknown,
            delete: false,
            two_clients: false,
            rejected: false,
            resume_requested: false,
            held: false,
            updates_status: true,
            locked: 0,
            family,
            user: user.to_string(),
            userhost: None,
            description: description.map(str::to_string),
            othername: othername.map(str::to_string),
            local_filename: None,
            offer: None,
            peer_addr: None,
            local_addr: None,
            want_port: 0,
            filesize,
            bytes_read: 0,
            bytes_sent: 0,
            bytes_acked: 0,
            resume_size: 0,
            packets_total: filesize.div_ceil(block_size.max(1) as u64),
            packets_transferred: 0,
            packets_acked: 0,
            in_flight: VecDeque::new(),
            unsent: Vec::new(),
            line_buf: Vec::new(),
            lasttime: Instant::now(),
            starttime: None,
            started_at: None,
            holdtime: None,
            heldtime: Duration::ZERO,
            socket: DccSocket::Closed,
            pending: None,
            file: None,
            open_callback: None,
        }
    }

    pub fn locked(&self) -> u32 {
        self.locked
    }

    /// Unacknowledged packets currently on the wire.
    pub fn packets_outstanding(&self) -> usize {
        self.in_flight.len()
    }

    /// LIST status column.
    pub fn status(&self) -> &'static str {
        if self.delete {
            return "Closed";
        }
        match self.phase {
            ConnectionPhase::Active => "Active",
            ConnectionPhase::MyOffer => "Waiting",
            ConnectionPhase::TheirOffer | ConnectionPhase::Connecting => "Offered",
            ConnectionPhase::Unknown => "Unknown",
        }
    }

    /// Last path segment of the description.
    pub fn nopath(&self) -> Option<&str> {
        self.description
            .as_deref()
            .map(|d| d.rsplit('/').next().unwrap_or(d))
    }

    /// Total bytes moved in whichever direction this session carries data.
    pub fn transferred(&self) -> u64 {
        if self.bytes_sent > 0 { self.bytes_sent } else { self.bytes_read }
    }

    /// Active time since start, excluding time spent on hold.
    pub fn active_time(&self, now: Instant) -> Duration {
        let Some(start) = self.starttime else { return Duration::ZERO };
        let mut held = self.heldtime;
        if self.held {
            if let Some(since) = self.holdtime {
                held += now.saturating_duration_since(since);
            }
        }
        now.saturating_duration_since(start).saturating_sub(held)
    }

    pub(crate) fn mark_started(&mut self) {
        let now = Instant::now();
        self.starttime = Some(now);
        self.lasttime = now;
        self.started_at = Some(Local::now());
    }

    /// Bytes already read from the local file: written plus still queued.
    pub(crate) fn queued_end(&self) -> u64 {
        self.bytes_sent + self.unsent.len() as u64
    }

    /// Whether the socket should be polled for writability.
    pub(crate) fn wants_write(&self, window: usize) -> bool {
        if !self.unsent.is_empty() {
            return true;
        }
        self.kind == ConnectionKind::SendOffer
            && self.phase == ConnectionPhase::Active
            && self.file.is_some()
            && self.in_flight.len() < window
            && self.queued_end() < self.filesize
    }

    /// Pause polling. Returns false if already held.
    pub fn hold(&mut self) -> bool {
        if self.held {
            return false;
        }
        self.held = true;
        self.holdtime = Some(Instant::now());
        true
    }

    /// Resume polling and account the paused time. Returns false if not held.
    pub fn unhold(&mut self) -> bool {
        if !self.held {
            return false;
        }
        let now = Instant::now();
        if let Some(since) = self.holdtime {
            self.heldtime += now.saturating_duration_since(since);
        }
        self.holdtime = Some(now);
        self.held = false;
        true
    }

    /// Release the socket and any backing file.
    pub(crate) fn close(&mut self) {
        self.socket = DccSocket::Closed;
        self.pending = None;
        self.file = None;
        self.unsent.clear();
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("refnum", &self.refnum)
            .field("kind", &self.kind)
            .field("phase", &self.phase)
            .field("delete", &self.delete)
            .field("user", &self.user)
            .field("description", &self.description)
            .field("othername", &self.othername)
            .field("filesize", &self.filesize)
            .field("bytes_sent", &self.bytes_sent)
            .field("bytes_read", &self.bytes_read)
            .field("bytes_acked", &self.bytes_acked)
            .field("locked", &self.locked)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(kind: ConnectionKind, desc: Option<&str>) -> Session {
        Session::new(Refnum(1), kind, "bob", desc, None, Family::V4, 5000, 2048)
    }

    #[test]
    fn kind_names_round_trip_case_insensitively() {
        for kind in ConnectionKind::ALL {
            assert_eq!(ConnectionKind::from_name(&kind.as_str().to_lowercase()), Some(kind));
        }
        assert_eq!(ConnectionKind::from_name("FOO"), None);
        assert_eq!(ConnectionKind::SendOffer.peer_name(), "GET");
        assert_eq!(ConnectionKind::GetOffer.peer_name(), "SEND");
        assert_eq!(ConnectionKind::Chat.peer_name(), "CHAT");
    }

    #[test]
    fn packets_total_rounds_up() {
        assert_eq!(session(ConnectionKind::SendOffer, None).packets_total, 3);
    }

    #[test]
    fn status_column_prefers_closed() {
        let mut s = session(ConnectionKind::GetOffer, Some("/tmp/a.txt"));
        assert_eq!(s.status(), "Unknown");
        s.phase = ConnectionPhase::Connecting;
        assert_eq!(s.status(), "Offered");
        s.delete = true;
        assert_eq!(s.status(), "Closed");
        assert_eq!(s.nopath(), Some("a.txt"));
    }

    #[test]
    fn hold_accounting_excludes_paused_time() {
        let mut s = session(ConnectionKind::Chat, Some("chat"));
        s.mark_started();
        assert!(s.hold());
        assert!(!s.hold());
        let later = Instant::now() + Duration::from_secs(5);
        assert!(s.active_time(later) < Duration::from_secs(1));
        assert!(s.unhold());
        assert!(!s.unhold());
    }
}
