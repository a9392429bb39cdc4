//! IRC client SDK with a DCC (Direct Client Connection) subsystem.
//!
//! The [`client`] module owns the server connection and drives a single
//! [`dcc::Dcc`] manager from its event loop. Consumers receive [`event::Event`]s
//! and send commands through a [`client::ClientHandle`].

pub mod client;
pub mod ctcp;
pub mod dcc;
pub mod event;
pub mod irc;
