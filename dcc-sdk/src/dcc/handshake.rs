//! CTCP DCC handshakes: advertising our offers and vetting the peer's.

use std::net::{IpAddr, SocketAddr};

use crate::ctcp::CtcpKind;

use super::codec;
use super::error::{DccError, Result};
use super::hooks::{DccEvent, LostReason};
use super::registry::Search;
use super::session::{ConnectionKind, ConnectionPhase, Family, Refnum};
use super::{Dcc, ServerContext};

/// Ports below this are refused in offers.
const RESERVED_PORTS: u16 = 1024;

impl Dcc {
    /// Send (or re-send) the CTCP offer for a listening session.
    pub(crate) fn send_offer(&mut self, ctx: &ServerContext, refnum: Refnum) -> Result<()> {
        if !ctx.registered {
            let text = "You cannot use DCC while not connected to a server.";
            self.say(text);
            return Err(DccError::Usage(text.into()));
        }
        let Some(s) = self.registry.get(refnum) else {
            return Err(DccError::NotFound(refnum.to_string()));
        };
        let Some(bound) = s.local_addr else {
            return Err(DccError::Address(format!("session {refnum} is not listening")));
        };

        let ip: Option<IpAddr> = match self.settings.gateway_addr {
            Some(gateway) => Some(gateway),
            None if bound.ip().is_unspecified() => ctx.local_addr.map(|a| a.ip()),
            None => Some(bound.ip()),
        };
        let ip = match ip {
            Some(ip) if Family::of(&SocketAddr::new(ip, 0)) == s.family => ip,
            _ => {
                let text = match (self.settings.gateway_addr, s.family) {
                    (Some(_), _) => "The gateway address must be in the same address family \
                                     (IPv4 or IPv6) as the DCC."
                        .to_string(),
                    (None, Family::V4) => "I do not know what your IPv4 address is.".to_string(),
                    (None, Family::V6) => "I do not know what your IPv6 address is.".to_string(),
                };
                self.delete(refnum);
                self.say(&text);
                return Err(DccError::Address(text));
            }
        };

        if !s.two_clients {
            return Ok(());
        }

        let host = codec::format_host(ip);
        let port = bound.port();
        let (kind, user, filesize) = (s.kind, s.user.clone(), s.filesize);
        let description = s.description.clone();
        let (body, text, shown) = if kind == ConnectionKind::SendOffer {
            let nopath = s.nopath().unwrap_or("").to_string();
            let body = format!(
                "DCC SEND {} {host} {port} {filesize}",
                codec::url_encode(&nopath)
            );
            let text = format!("Sent DCC SEND request ({nopath} {filesize}) to {user}");
            (body, text, Some(nopath))
        } else {
            let desc = description.clone().unwrap_or_default();
            let body = format!("DCC {kind} {desc} {host} {port}");
            (body, format!("Sent DCC {kind} request to {user}"), description)
        };

        if let Some(s) = self.registry.get_mut(refnum) {
            s.mark_started();
        }
        self.send_ctcp(CtcpKind::Request, &user, body);
        let event = DccEvent::Offered {
            refnum,
            user,
            kind,
            description: shown,
            filesize,
        };
        self.announce(Some(refnum), event, text);
        Ok(())
    }

    /// Handle `DCC <type> <description> <address> <port> [size]` from a
    /// peer.
    pub(crate) fn receive_offer(
        &mut self,
        ctx: &ServerContext,
        user: &str,
        userhost: Option<&str>,
        wire_type: &str,
        description: &str,
        address: &str,
        port: &str,
        size: Option<&str>,
    ) -> Result<()> {
        let description = codec::normalize_description(description);
        let filesize = size.and_then(|s| s.parse::<u64>().ok());

        let kind = if wire_type.eq_ignore_ascii_case("CHAT") {
            ConnectionKind::Chat
        } else if wire_type.eq_ignore_ascii_case("SEND") {
            if filesize.is_none() {
                let text = format!("DCC SEND ({description}) received from {user} without a file size");
                self.say(&text);
                return Err(DccError::ProtocolViolation(text));
            }
            ConnectionKind::GetOffer
        } else if wire_type.eq_ignore_ascii_case("RESUME") {
            // mIRC order: filename, port, offset.
            if port.is_empty() {
                let text = format!("DCC RESUME received from {user} without a resume location");
                self.say(&text);
                return Err(DccError::ProtocolViolation(text));
            }
            return self.resume_demanded(user, &description, address, port);
        } else if wire_type.eq_ignore_ascii_case("ACCEPT") {
            return self.resume_start(user, &description, address, port);
        } else {
            let text = format!("Unknown DCC {wire_type} ({description}) received from {user}");
            self.say(&text);
            return Err(DccError::UnknownType(wire_type.to_string()));
        };
        let filesize = filesize.unwrap_or(0);

        let offer = match codec::parse_offer_addr(address, port) {
            Ok(offer) => offer,
            Err(e) => {
                self.say(&format!(
                    "DCC {wire_type} ({description}) request from {user} had mangled return address [{address}]"
                ));
                return Err(e);
            }
        };
        if offer.ip().is_unspecified() {
            let text = format!("DCC handshake from {user} ignored because it had an null address");
            self.say(&text);
            return Err(DccError::Address(text));
        }
        if offer.port() < RESERVED_PORTS {
            let text = format!(
                "DCC {wire_type} ({description}) request from {user} rejected because it specified reserved port number ({})",
                offer.port()
            );
            self.say(&text);
            return Err(DccError::Address(text));
        }

        let existing = self.registry.search(
            &Search::kind(kind)
                .user(user)
                .description(Some(&description)),
        );
        let refnum = match existing {
            Some(r) => {
                let Some(s) = self.registry.get_mut(r) else {
                    return Err(DccError::NotFound(r.to_string()));
                };
                if s.phase == ConnectionPhase::MyOffer {
                    // Revoke ours. The peer already knows about the collision.
                    s.delete = true;
                    s.rejected = true;
                    return self.resolve_collision(ctx, kind, user, &description, offer, filesize);
                }
                if s.phase == ConnectionPhase::Active {
                    let text = format!(
                        "Received DCC {wire_type} request from {user} while previous session still active"
                    );
                    self.say(&text);
                    return Err(DccError::ProtocolViolation(text));
                }
                r
            }
            None => {
                let block = self.settings.block_size();
                self.registry.create(
                    kind,
                    user,
                    Some(&description),
                    None,
                    Family::of(&offer),
                    filesize,
                    block,
                )
            }
        };

        if let Some(s) = self.registry.get_mut(refnum) {
            s.phase = ConnectionPhase::TheirOffer;
            s.offer = Some(offer);
            s.filesize = filesize;
            s.family = Family::of(&offer);
            s.userhost = userhost.map(str::to_string);
        }
        tracing::debug!(%refnum, user, kind = %kind, %offer, "DCC offer received");

        let event = DccEvent::Request {
            refnum,
            user: user.to_string(),
            kind,
            description: Some(description.clone()),
            address: offer,
            filesize,
        };
        if !self.fire(Some(refnum), &event) {
            if kind == ConnectionKind::GetOffer {
                self.warn_existing_file(user, &description, filesize);
            }
            let uh = userhost.unwrap_or("");
            let text = if kind == ConnectionKind::GetOffer {
                format!(
                    "DCC {wire_type} ({description} {filesize}) request received from {user}!{uh} [{} ({})]",
                    offer.ip(),
                    offer.port()
                )
            } else {
                format!(
                    "DCC {wire_type} ({description}) request received from {user}!{uh} [{} ({})]",
                    offer.ip(),
                    offer.port()
                )
            };
            self.say(&text);
        }

        if let Some(s) = self.registry.get_mut(refnum) {
            s.mark_started();
        }
        Ok(())
    }

    /// Both sides offered each other the same thing.
    fn resolve_collision(
        &mut self,
        ctx: &ServerContext,
        kind: ConnectionKind,
        user: &str,
        description: &str,
        offer: SocketAddr,
        filesize: u64,
    ) -> Result<()> {
        if kind == ConnectionKind::Chat {
            self.say(&format!("DCC CHAT already requested by {user}, connecting."));
            let block = self.settings.block_size();
            let refnum = self.registry.create(
                ConnectionKind::Chat,
                user,
                Some("chat"),
                None,
                Family::of(&offer),
                filesize,
                block,
            );
            if let Some(s) = self.registry.get_mut(refnum) {
                s.phase = ConnectionPhase::TheirOffer;
                s.offer = Some(offer);
                s.two_clients = true;
            }
            return self.connect(refnum);
        }
        let name = kind.peer_name();
        self.say(&format!("DCC {name} collision for {user}:{description}"));
        self.send_ctcp(
            CtcpKind::Reply,
            user,
            format!(
                "DCC {name} collision occurred while connecting to {} ({description})",
                ctx.nickname
            ),
        );
        Err(DccError::ProtocolViolation(format!("{name} collision with {user}")))
    }

    /// Tell the user a file with the offered name is already on disk.
    fn warn_existing_file(&mut self, user: &str, description: &str, filesize: u64) {
        let path = self.settings.store_path().join(description);
        let Ok(meta) = std::fs::metadata(&path) else { return };
        let shown = path.display();
        let smaller = meta.len() < filesize;
        if smaller {
            self.say(&format!(
                "WARNING: File [{shown}] exists but is smaller than the file offered."
            ));
        } else if meta.len() == filesize {
            self.say(&format!("WARNING: File [{shown}] exists, and its the same size."));
        } else {
            self.say(&format!("WARNING: File [{shown}] already exists."));
        }
        self.say(&format!(
            "Use /DCC CLOSE GET {user} {description}        to not get the file."
        ));
        if smaller && self.settings.mirc_resume {
            self.say(&format!(
                "Use /DCC RESUME {user} {description}           to continue the copy where it left off."
            ));
        }
        self.say(&format!(
            "Use /DCC GET {user} {description}              to overwrite the existing file."
        ));
        self.say(&format!(
            "Use /DCC RENAME {user} {description} newname   to save it to a different filename."
        ));
    }

    /// `DCC REJECT <type> <description>` arrived in a NOTICE.
    pub(crate) fn receive_reject(&mut self, from: &str, wire_type: &str, description: Option<&str>) {
        let Some(kind) = ConnectionKind::from_name(wire_type) else {
            tracing::debug!(from, wire_type, "REJECT for unknown DCC type");
            return;
        };
        let found = self.registry.search(
            &Search::kind(kind)
                .user(from)
                .description(description)
                .othername(description),
        );
        let Some(refnum) = found else { return };
        let desc = description.unwrap_or("<any>");
        self.lost(
            refnum,
            LostReason::Rejected,
            None,
            format!("DCC {wire_type}:{desc} rejected by {from}: closing"),
        );
        if let Some(s) = self.registry.get_mut(refnum) {
            s.rejected = true;
            s.delete = true;
        }
    }
}
