//! Socket lifecycle: listening offers, outbound connects, accepts and the
//! readiness wait that drives every session.

use std::fs::File;
use std::future::{Future, poll_fn};
use std::io::{self, Seek, SeekFrom};
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use tokio::net::{TcpListener, TcpSocket, TcpStream};

use super::error::{DccError, Result};
use super::hooks::{DccEvent, LostReason, RawActivity};
use super::session::{ConnectionKind, ConnectionPhase, Family, Refnum, Session};
use super::{Dcc, ServerContext};

pub(crate) type ConnectFuture = Pin<Box<dyn Future<Output = io::Result<TcpStream>> + Send>>;

/// The network side of a session.
#[derive(Default)]
pub(crate) enum DccSocket {
    #[default]
    Closed,
    Listening(TcpListener),
    Connecting(ConnectFuture),
    Stream(TcpStream),
}

impl DccSocket {
    pub(crate) fn stream(&self) -> Option<&TcpStream> {
        match self {
            DccSocket::Stream(s) => Some(s),
            _ => None,
        }
    }

    #[cfg(unix)]
    pub(crate) fn raw_fd(&self) -> Option<std::os::fd::RawFd> {
        use std::os::fd::AsRawFd;
        match self {
            DccSocket::Listening(l) => Some(l.as_raw_fd()),
            DccSocket::Stream(s) => Some(s.as_raw_fd()),
            _ => None,
        }
    }
}

/// A readiness result stashed on the session until it is serviced.
pub(crate) enum SocketEvent {
    Accepted(TcpStream, SocketAddr),
    AcceptFailed(io::Error),
    Connected(io::Result<TcpStream>),
}

fn new_socket(family: Family) -> io::Result<TcpSocket> {
    match family {
        Family::V4 => TcpSocket::new_v4(),
        Family::V6 => TcpSocket::new_v6(),
    }
}

/// Bind and listen on `port` (0 for ephemeral) on the unspecified address.
pub(crate) fn bind(family: Family, port: u16) -> io::Result<TcpListener> {
    let socket = new_socket(family)?;
    socket.set_reuseaddr(true)?;
    socket.bind(SocketAddr::new(family.unspecified(), port))?;
    socket.listen(5)
}

/// Start a nonblocking connect. Completion is observed by `wait_ready`.
pub(crate) fn start_connect(addr: SocketAddr) -> io::Result<ConnectFuture> {
    let socket = new_socket(Family::of(&addr))?;
    Ok(Box::pin(socket.connect(addr)))
}

/// Poll one session, stashing accept/connect results. True if it needs
/// servicing.
fn poll_session(s: &mut Session, window: usize, cx: &mut Context<'_>) -> bool {
    if s.pending.is_some() {
        return true;
    }
    let wants_write = s.wants_write(window);
    match &mut s.socket {
        DccSocket::Closed => false,
        DccSocket::Listening(listener) => match listener.poll_accept(cx) {
            Poll::Ready(Ok((stream, addr))) => {
                s.pending = Some(SocketEvent::Accepted(stream, addr));
                true
            }
            Poll::Ready(Err(e)) => {
                s.pending = Some(SocketEvent::AcceptFailed(e));
                true
            }
            Poll::Pending => false,
        },
        DccSocket::Connecting(fut) => match fut.as_mut().poll(cx) {
            Poll::Ready(res) => {
                s.socket = DccSocket::Closed;
                s.pending = Some(SocketEvent::Connected(res));
                true
            }
            Poll::Pending => false,
        },
        DccSocket::Stream(stream) => {
            let readable = stream.poll_read_ready(cx).is_ready();
            let writable = wants_write && stream.poll_write_ready(cx).is_ready();
            readable || writable
        }
    }
}

impl Dcc {
    /// Wait until at least one session needs servicing and return every
    /// ready refnum in registry order. Held and deleted sessions are not
    /// polled. Pending forever when nothing is open.
    ///
    /// Cancel safe: readiness results are stored on the session.
    pub async fn wait_ready(&mut self) -> Vec<Refnum> {
        let window = self.settings.window();
        let registry = &mut self.registry;
        poll_fn(|cx| {
            let ready: Vec<Refnum> = registry
                .iter_mut()
                .filter(|s| !s.delete && !s.held)
                .filter_map(|s| poll_session(s, window, cx).then_some(s.refnum))
                .collect();
            if ready.is_empty() {
                Poll::Pending
            } else {
                Poll::Ready(ready)
            }
        })
        .await
    }

    /// Service each ready session once, in order.
    pub fn service(&mut self, ready: &[Refnum]) {
        self.guarded(|dcc| {
            for &refnum in ready {
                let Some(s) = dcc.registry.get_mut(refnum) else { continue };
                let kind = s.kind;
                let pending = s.pending.take();
                dcc.lock(Some(refnum));
                match pending {
                    Some(SocketEvent::Connected(res)) => dcc.on_connected(refnum, res),
                    Some(SocketEvent::Accepted(stream, addr)) => dcc.on_accept(refnum, stream, addr),
                    Some(SocketEvent::AcceptFailed(e)) => {
                        tracing::warn!(%refnum, error = %e, "DCC accept failed");
                        dcc.say("### DCC Error: accept() failed.");
                        dcc.delete(refnum);
                    }
                    None => match kind {
                        ConnectionKind::Chat => dcc.chat_data(refnum),
                        ConnectionKind::Raw => dcc.raw_data(refnum),
                        ConnectionKind::SendOffer => {
                            dcc.handle_ack(refnum);
                            dcc.send_data(refnum);
                        }
                        ConnectionKind::GetOffer => dcc.get_data(refnum),
                        ConnectionKind::RawListen => {}
                    },
                }
                if let Some(s) = dcc.registry.get_mut(refnum) {
                    s.lasttime = Instant::now();
                }
                dcc.unlock(Some(refnum));
            }
        });
    }

    // ── Opening ─────────────────────────────────────────────────────

    /// Listen for the peer on our offer and, for two-peer sessions, send
    /// the handshake.
    pub(crate) fn listen(&mut self, ctx: &ServerContext, refnum: Refnum) -> Result<()> {
        let Some(s) = self.registry.get_mut(refnum) else {
            return Err(DccError::NotFound(refnum.to_string()));
        };
        if s.phase == ConnectionPhase::TheirOffer {
            s.delete = true;
            self.say("Mixup: dcc_offer on a remote offer");
            return Err(DccError::ProtocolViolation("listen on a remote offer".into()));
        }
        s.phase = ConnectionPhase::MyOffer;
        let family = s.family;

        let listener = loop {
            let Some(s) = self.registry.get_mut(refnum) else {
                return Err(DccError::NotFound(refnum.to_string()));
            };
            let port = s.want_port;
            match bind(family, port) {
                Ok(listener) => break listener,
                Err(e) => {
                    tracing::warn!(%refnum, port, error = %e, "DCC bind failed");
                    let fallback = self.settings.default_port.unwrap_or(0);
                    s.want_port = fallback;
                    let event = DccEvent::Lost {
                        refnum,
                        user: s.user.clone(),
                        kind: s.kind,
                        description: s.description.clone(),
                        reason: LostReason::PortInUse,
                        speed_kbps: None,
                    };
                    self.fire(Some(refnum), &event);
                    if fallback == port {
                        self.delete(refnum);
                        self.say(&format!(
                            "Unable to bind local port [{port}] for inbound connection."
                        ));
                        return Err(DccError::Connection(e));
                    }
                }
            }
        };

        let local = listener.local_addr().map_err(DccError::Connection)?;
        let two_clients = {
            let Some(s) = self.registry.get_mut(refnum) else {
                return Err(DccError::NotFound(refnum.to_string()));
            };
            s.local_addr = Some(local);
            s.othername = Some(local.port().to_string());
            s.socket = DccSocket::Listening(listener);
            s.two_clients
        };
        tracing::debug!(%refnum, %local, "DCC listening");
        if two_clients {
            self.send_offer(ctx, refnum)?;
        }
        if let Some(s) = self.registry.get_mut(refnum) {
            s.lasttime = Instant::now();
        }
        Ok(())
    }

    /// Dial the address the peer offered.
    pub(crate) fn connect(&mut self, refnum: Refnum) -> Result<()> {
        let Some(s) = self.registry.get_mut(refnum) else {
            return Err(DccError::NotFound(refnum.to_string()));
        };
        let offer = match (s.phase, s.offer) {
            (ConnectionPhase::TheirOffer, Some(offer)) => offer,
            _ => {
                let text = format!("Can't connect on a dcc that was not offered [{}]", s.user);
                s.delete = true;
                self.say(&text);
                return Err(DccError::ProtocolViolation(text));
            }
        };
        match start_connect(offer) {
            Ok(fut) => {
                s.socket = DccSocket::Connecting(fut);
                s.phase = ConnectionPhase::Connecting;
                s.lasttime = Instant::now();
                tracing::debug!(%refnum, %offer, "DCC connecting");
                Ok(())
            }
            Err(e) => {
                self.lost(
                    refnum,
                    LostReason::Error,
                    None,
                    format!("Unable to create connection: {e}"),
                );
                self.delete(refnum);
                Err(DccError::Connection(e))
            }
        }
    }

    // ── Becoming active ─────────────────────────────────────────────

    fn on_connected(&mut self, refnum: Refnum, res: io::Result<TcpStream>) {
        let Some(s) = self.registry.get_mut(refnum) else { return };
        let res = res.and_then(|stream| {
            let peer = stream.peer_addr()?;
            let local = stream.local_addr()?;
            Ok((stream, peer, local))
        });
        let (stream, peer, local) = match res {
            Ok(parts) => parts,
            Err(e) => {
                tracing::warn!(%refnum, error = %e, "DCC connect failed");
                let text = format!(
                    "DCC {} connection with {} could not be established: {e}",
                    s.kind, s.user
                );
                self.lost(refnum, LostReason::Error, None, text);
                self.delete(refnum);
                return;
            }
        };
        s.socket = DccSocket::Stream(stream);
        s.peer_addr = Some(peer);
        s.local_addr = Some(local);
        if s.kind == ConnectionKind::Raw {
            s.othername = Some(peer.port().to_string());
            s.user = refnum.to_string();
            let event = DccEvent::Raw {
                refnum,
                user: s.user.clone(),
                description: s.description.clone(),
                activity: RawActivity::Established { port: peer.port() },
            };
            self.fire(Some(refnum), &event);
        }
        self.activate(refnum);
    }

    /// Mark active, announce, start the clock and run the open callback.
    fn activate(&mut self, refnum: Refnum) {
        let Some(s) = self.registry.get_mut(refnum) else { return };
        s.phase = ConnectionPhase::Active;
        s.mark_started();
        if !matches!(s.kind, ConnectionKind::Raw | ConnectionKind::RawListen) {
            let peer = s.peer_addr;
            let text = match peer {
                Some(p) => format!(
                    "DCC {} connection with {}[{}:{}] established",
                    s.kind,
                    s.user,
                    p.ip(),
                    p.port()
                ),
                None => format!("DCC {} connection with {} established", s.kind, s.user),
            };
            let event = DccEvent::Connected {
                refnum,
                user: s.user.clone(),
                kind: s.kind,
                peer,
                description: s.description.clone(),
                filesize: s.filesize,
            };
            self.announce(Some(refnum), event, text);
        }
        if let Some(s) = self.registry.get_mut(refnum) {
            if let Some(callback) = s.open_callback.take() {
                callback(s);
            }
        }
    }

    fn on_accept(&mut self, refnum: Refnum, stream: TcpStream, addr: SocketAddr) {
        let Some(s) = self.registry.get_mut(refnum) else { return };
        match s.kind {
            ConnectionKind::RawListen => self.accept_raw(refnum, stream, addr),
            ConnectionKind::Chat | ConnectionKind::SendOffer => {
                s.socket = DccSocket::Stream(stream);
                s.peer_addr = Some(addr);
                s.local_addr = s.socket.stream().and_then(|st| st.local_addr().ok());
                s.phase = ConnectionPhase::Active;
                s.mark_started();
                let kind = s.kind;
                let label = if kind == ConnectionKind::Chat { "chat" } else { "SEND" };
                let text = format!(
                    "DCC {label} connection to {}[{}:{}] established",
                    s.user,
                    addr.ip(),
                    addr.port()
                );
                let event = DccEvent::Connected {
                    refnum,
                    user: s.user.clone(),
                    kind,
                    peer: Some(addr),
                    description: s.description.clone(),
                    filesize: s.filesize,
                };
                self.announce(Some(refnum), event, text);
                if kind == ConnectionKind::SendOffer {
                    if let Err(e) = self.open_outgoing_file(refnum) {
                        tracing::warn!(%refnum, error = %e, "cannot open file to send");
                        return;
                    }
                    self.send_data(refnum);
                }
                if let Some(s) = self.registry.get_mut(refnum) {
                    if let Some(callback) = s.open_callback.take() {
                        callback(s);
                    }
                }
            }
            ConnectionKind::GetOffer | ConnectionKind::Raw => {
                tracing::warn!(%refnum, "accept on a session that does not listen");
            }
        }
    }

    /// Open the file behind an accepted SEND, positioned at any resume
    /// offset.
    fn open_outgoing_file(&mut self, refnum: Refnum) -> Result<()> {
        let Some(s) = self.registry.get_mut(refnum) else {
            return Err(DccError::NotFound(refnum.to_string()));
        };
        let path = s.description.clone().unwrap_or_default();
        let opened = File::open(&path).and_then(|mut f| {
            if s.bytes_sent > 0 {
                f.seek(SeekFrom::Start(s.bytes_sent))?;
            }
            Ok(f)
        });
        match opened {
            Ok(f) => {
                s.file = Some(f);
                Ok(())
            }
            Err(e) => {
                s.delete = true;
                self.say(&format!("Unable to open {path}: {e}"));
                Err(DccError::Connection(e))
            }
        }
    }

    /// A RAW listener accepted a connection: give it its own session.
    fn accept_raw(&mut self, listener: Refnum, stream: TcpStream, addr: SocketAddr) {
        let listen_port = self
            .registry
            .get(listener)
            .and_then(|s| s.local_addr)
            .map(|a| a.port())
            .unwrap_or(0);
        let host = addr.ip().to_string();
        let block = self.settings.block_size();
        let refnum = self.registry.create(
            ConnectionKind::Raw,
            "",
            Some(&host),
            None,
            Family::of(&addr),
            0,
            block,
        );
        let Some(s) = self.registry.get_mut(refnum) else { return };
        s.user = refnum.to_string();
        s.local_addr = stream.local_addr().ok();
        s.socket = DccSocket::Stream(stream);
        s.peer_addr = Some(addr);
        s.offer = Some(addr);
        s.phase = ConnectionPhase::Active;
        s.mark_started();
        let user = s.user.clone();
        let new_conn = DccEvent::Raw {
            refnum,
            user: user.clone(),
            description: Some(host.clone()),
            activity: RawActivity::NewConnection { port: listen_port },
        };
        self.lock(Some(listener));
        if !self.fire(Some(refnum), &new_conn) {
            let connected = DccEvent::Connected {
                refnum,
                user: user.clone(),
                kind: ConnectionKind::Raw,
                peer: Some(addr),
                description: Some(host.clone()),
                filesize: 0,
            };
            let text = format!(
                "DCC RAW connection to {host} on {user} via {} established",
                addr.port()
            );
            self.announce(Some(refnum), connected, text);
        }
        self.unlock(Some(listener));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_ephemeral_and_connect() {
        let listener = bind(Family::V4, 0).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert_ne!(port, 0);
        let fut = start_connect(SocketAddr::from(([127, 0, 0, 1], port))).unwrap();
        let (stream, accepted) = tokio::join!(fut, listener.accept());
        assert!(stream.is_ok());
        assert!(accepted.is_ok());
    }

    #[tokio::test]
    async fn socket_helpers() {
        let listener = bind(Family::V4, 0).unwrap();
        let socket = DccSocket::Listening(listener);
        assert!(socket.stream().is_none());
        #[cfg(unix)]
        assert!(socket.raw_fd().is_some());
        assert!(DccSocket::Closed.stream().is_none());
    }
}
