//! Events emitted by the IRC client for the UI layer to consume.

use crate::dcc::DccEvent;

/// Events that the SDK emits to the consumer (CLI, bot, etc.)
#[derive(Debug, Clone)]
pub enum Event {
    /// Successfully connected to the server.
    Connected,

    /// IRC registration complete. `nick` is our confirmed nick.
    Registered {
        nick: String,
    },

    /// A message in a channel or private message.
    Message {
        from: String,
        target: String,
        text: String,
    },

    /// A NOTICE addressed to us or a channel.
    Notice {
        from: String,
        target: String,
        text: String,
    },

    /// A user changed nick.
    NickChanged {
        old_nick: String,
        new_nick: String,
    },

    /// Server sent an error or numeric we do not otherwise surface.
    ServerNotice {
        text: String,
    },

    /// A DCC hook fired.
    Dcc(DccEvent),

    /// A line of DCC status text that no hook consumed.
    DccNotice {
        text: String,
    },

    /// Connection was closed.
    Disconnected {
        reason: String,
    },

    /// Raw server line (for debugging).
    RawLine(String),
}
