//! Hook events fired to the embedding application.
//!
//! Every event has a default textual rendering that is printed through
//! [`Hooks::say`] when [`Hooks::fire`] does not consume it.

use std::fmt;
use std::net::SocketAddr;

use super::list::ListEntry;
use super::session::{ConnectionKind, Refnum};

/// Why a session went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LostReason {
    TransferComplete,
    RemotePeerClosed,
    ConnectionLost,
    UserAborted,
    ConnectTimedOut,
    IdleTimeExceeded,
    Rejected,
    Error,
    PortInUse,
}

impl fmt::Display for LostReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LostReason::TransferComplete => "TRANSFER COMPLETE",
            LostReason::RemotePeerClosed => "REMOTE PEER CLOSED",
            LostReason::ConnectionLost => "CONNECTION LOST",
            LostReason::UserAborted => "USER ABORTED",
            LostReason::ConnectTimedOut => "CONNECT TIMED OUT",
            LostReason::IdleTimeExceeded => "IDLE TIME EXCEEDED",
            LostReason::Rejected => "REJECTED",
            LostReason::Error => "ERROR",
            LostReason::PortInUse => "PORT IN USE",
        })
    }
}

/// Activity on a RAW session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawActivity {
    /// A listener accepted a connection (which got its own session).
    NewConnection { port: u16 },
    /// An outbound RAW connect completed.
    Established { port: u16 },
    Data(String),
    Closed,
}

#[derive(Debug, Clone)]
pub enum DccEvent {
    /// A socket became active.
    Connected {
        refnum: Refnum,
        user: String,
        kind: ConnectionKind,
        peer: Option<SocketAddr>,
        description: Option<String>,
        filesize: u64,
    },
    /// A peer offered us something.
    Request {
        refnum: Refnum,
        user: String,
        kind: ConnectionKind,
        description: Option<String>,
        address: SocketAddr,
        filesize: u64,
    },
    /// We sent an offer.
    Offered {
        refnum: Refnum,
        user: String,
        kind: ConnectionKind,
        description: Option<String>,
        filesize: u64,
    },
    Lost {
        refnum: Refnum,
        user: String,
        kind: ConnectionKind,
        description: Option<String>,
        reason: LostReason,
        /// Set for completed transfers.
        speed_kbps: Option<f64>,
    },
    ChatLine {
        refnum: Refnum,
        user: String,
        text: String,
    },
    ChatSent {
        refnum: Refnum,
        user: String,
        text: String,
    },
    Raw {
        refnum: Refnum,
        user: String,
        description: Option<String>,
        activity: RawActivity,
    },
    ListStart,
    ListRow(ListEntry),
    ListEnd,
    /// Transfer progress changed (`refnum` is `None` when cleared).
    Activity {
        refnum: Option<Refnum>,
        status: String,
    },
}

impl DccEvent {
    pub fn refnum(&self) -> Option<Refnum> {
        match self {
            DccEvent::Connected { refnum, .. }
            | DccEvent::Request { refnum, .. }
            | DccEvent::Offered { refnum, .. }
            | DccEvent::Lost { refnum, .. }
            | DccEvent::ChatLine { refnum, .. }
            | DccEvent::ChatSent { refnum, .. }
            | DccEvent::Raw { refnum, .. } => Some(*refnum),
            DccEvent::ListRow(entry) => Some(entry.refnum),
            DccEvent::Activity { refnum, .. } => *refnum,
            DccEvent::ListStart | DccEvent::ListEnd => None,
        }
    }
}

/// Consumer side of the DCC subsystem.
pub trait Hooks: Send {
    /// Offer an event to the consumer. Returning true suppresses the
    /// default message.
    fn fire(&mut self, _event: &DccEvent) -> bool {
        false
    }

    /// Show a line of text to the user.
    fn say(&mut self, text: &str);
}

/// Hooks that only log.
#[derive(Debug, Default)]
pub struct LogHooks;

impl Hooks for LogHooks {
    fn say(&mut self, text: &str) {
        tracing::info!("{text}");
    }
}
