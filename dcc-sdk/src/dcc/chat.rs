//! Line traffic on DCC CHAT and RAW sessions.

use std::io;

use super::Dcc;
use super::error::{DccError, Result};
use super::hooks::{DccEvent, LostReason, RawActivity};
use super::registry::{Activity, Search};
use super::session::{ConnectionKind, Refnum};

const READ_CHUNK: usize = 4096;

/// Longest chat line kept whole. A peer that sends more without a newline
/// has the excess delivered as a line of its own.
const MAX_LINE: usize = 8192;

enum Inbound {
    Data(Vec<u8>),
    Closed,
    Nothing,
}

/// Append `data` to `buf` and split off every complete line. The buffer
/// never holds more than `MAX_LINE` bytes afterwards.
fn take_lines(buf: &mut Vec<u8>, data: &[u8]) -> Vec<String> {
    buf.extend_from_slice(data);
    let mut lines = Vec::new();
    loop {
        let end = match buf.iter().position(|&b| b == b'\n') {
            Some(pos) if pos < MAX_LINE => pos + 1,
            _ if buf.len() >= MAX_LINE => MAX_LINE,
            _ => break,
        };
        let line: Vec<u8> = buf.drain(..end).collect();
        let line = String::from_utf8_lossy(&line);
        let line = line.trim_end_matches(['\r', '\n']);
        if !line.is_empty() {
            lines.push(line.to_string());
        }
    }
    lines
}

impl Dcc {
    /// Push out anything a previous write left behind, then read once.
    fn read_stream(&mut self, refnum: Refnum) -> Inbound {
        let Some(s) = self.registry.get_mut(refnum) else { return Inbound::Nothing };
        let Some(stream) = s.socket.stream() else { return Inbound::Nothing };
        if !s.unsent.is_empty() {
            match stream.try_write(&s.unsent) {
                Ok(n) => {
                    s.unsent.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    tracing::debug!(%refnum, error = %e, "DCC write failed");
                    return Inbound::Closed;
                }
            }
        }
        let mut buf = vec![0u8; READ_CHUNK];
        match stream.try_read(&mut buf) {
            Ok(0) => Inbound::Closed,
            Ok(n) => {
                buf.truncate(n);
                s.bytes_read += n as u64;
                Inbound::Data(buf)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Inbound::Nothing,
            Err(e) => {
                tracing::debug!(%refnum, error = %e, "DCC read failed");
                Inbound::Closed
            }
        }
    }

    pub(crate) fn chat_data(&mut self, refnum: Refnum) {
        match self.read_stream(refnum) {
            Inbound::Nothing => {}
            Inbound::Closed => {
                let Some(s) = self.registry.get(refnum) else { return };
                let text = format!("DCC CHAT connection to {} lost", s.user);
                self.lost(refnum, LostReason::Error, None, text);
                self.delete(refnum);
            }
            Inbound::Data(data) => {
                let Some(s) = self.registry.get_mut(refnum) else { return };
                let lines = take_lines(&mut s.line_buf, &data);
                let user = s.user.clone();
                for text in lines {
                    let shown = format!("={user}= {text}");
                    let event = DccEvent::ChatLine {
                        refnum,
                        user: user.clone(),
                        text,
                    };
                    self.announce(Some(refnum), event, shown);
                }
            }
        }
    }

    pub(crate) fn raw_data(&mut self, refnum: Refnum) {
        let inbound = self.read_stream(refnum);
        let Some(s) = self.registry.get(refnum) else { return };
        let user = s.user.clone();
        let description = s.description.clone();
        let desc = description.clone().unwrap_or_default();
        match inbound {
            Inbound::Nothing => {}
            Inbound::Closed => {
                let closed = DccEvent::Raw {
                    refnum,
                    user: user.clone(),
                    description,
                    activity: RawActivity::Closed,
                };
                if !self.fire(Some(refnum), &closed) {
                    self.lost(
                        refnum,
                        LostReason::Error,
                        None,
                        format!("DCC RAW connection to {user} on {desc} lost"),
                    );
                }
                self.delete(refnum);
            }
            Inbound::Data(data) => {
                let text = String::from_utf8_lossy(&data).into_owned();
                let text = text.strip_suffix('\n').unwrap_or(&text).to_string();
                let shown = format!("Raw data on {user} from {desc}: {text}");
                let event = DccEvent::Raw {
                    refnum,
                    user,
                    description,
                    activity: RawActivity::Data(text),
                };
                self.announce(Some(refnum), event, shown);
            }
        }
    }

    /// Write a line to a live session, queueing what the socket will not
    /// take right now.
    fn transmit(
        &mut self,
        kind: ConnectionKind,
        user: &str,
        description: Option<&str>,
        text: &str,
    ) -> Result<Refnum> {
        let found = self.registry.search(
            &Search::kind(kind)
                .user(user)
                .description(description)
                .activity(Activity::ActiveOnly),
        );
        let Some(refnum) = found else {
            let text = format!(
                "No active DCC {kind}:{} connection for {user}",
                description.unwrap_or("<any>")
            );
            self.say(&text);
            return Err(DccError::NotFound(text));
        };
        let Some(s) = self.registry.get_mut(refnum) else {
            return Err(DccError::NotFound(refnum.to_string()));
        };
        let mut line = text.as_bytes().to_vec();
        line.push(b'\n');
        s.unsent.extend_from_slice(&line);
        let written = match s.socket.stream() {
            Some(stream) => match stream.try_write(&s.unsent) {
                Ok(n) => Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
                Err(e) => Err(e),
            },
            None => Ok(0),
        };
        match written {
            Ok(n) => {
                s.unsent.drain(..n);
                s.bytes_sent += line.len() as u64;
                s.lasttime = std::time::Instant::now();
                Ok(refnum)
            }
            Err(e) => {
                s.delete = true;
                self.say(&format!("Outbound write() failed: {e}"));
                Err(DccError::WriteFailure(e))
            }
        }
    }

    /// Send a line over the DCC CHAT with `user`.
    pub fn send_chat(&mut self, user: &str, text: &str) -> Result<()> {
        self.guarded(|dcc| {
            let refnum = dcc.transmit(ConnectionKind::Chat, user, None, text)?;
            let event = DccEvent::ChatSent {
                refnum,
                user: user.to_string(),
                text: text.to_string(),
            };
            dcc.announce(Some(refnum), event, format!("=> ={user}= {text}"));
            Ok(())
        })
    }

    /// Send a line over a RAW session, named by its refnum-style user.
    pub(crate) fn send_raw(&mut self, name: &str, host: &str, text: &str) -> Result<()> {
        self.transmit(ConnectionKind::Raw, name, Some(host), text).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::super::DccSettings;
    use super::super::session::{ConnectionPhase, Family};
    use super::super::test_support::*;
    use super::*;

    #[test]
    fn lines_split_on_newlines_and_keep_the_tail() {
        let mut buf = Vec::new();
        assert_eq!(take_lines(&mut buf, b"hello\r\nwor"), vec!["hello"]);
        assert_eq!(buf, b"wor");
        assert_eq!(take_lines(&mut buf, b"ld\n\n"), vec!["world"]);
        assert!(buf.is_empty());
    }

    #[test]
    fn endless_line_is_cut_at_the_cap() {
        let mut buf = Vec::new();
        let mut delivered = Vec::new();
        for _ in 0..5 {
            delivered.extend(take_lines(&mut buf, &[b'x'; READ_CHUNK]));
            assert!(buf.len() < MAX_LINE);
        }
        assert_eq!(delivered.len(), 5 * READ_CHUNK / MAX_LINE);
        assert!(delivered.iter().all(|l| l.len() == MAX_LINE));
        assert_eq!(buf.len(), 5 * READ_CHUNK % MAX_LINE);
    }

    #[test]
    fn chat_needs_an_active_session() {
        let (mut dcc, rec) = manager(DccSettings::default());
        let err = dcc.send_chat("bob", "hi").unwrap_err();
        assert!(matches!(err, DccError::NotFound(_)));
        assert!(rec.said_containing("No active DCC CHAT:<any> connection for bob"));

        // An offer that has not connected yet is not enough.
        let r = dcc.registry.create(ConnectionKind::Chat, "bob", Some("chat"), None, Family::V4, 0, 2048);
        dcc.registry.get_mut(r).unwrap().phase = ConnectionPhase::TheirOffer;
        assert!(dcc.send_chat("bob", "hi").is_err());
    }

    #[test]
    fn raw_writes_are_matched_by_host() {
        let (mut dcc, rec) = manager(DccSettings::default());
        let r = dcc.registry.create(ConnectionKind::Raw, "7", Some("10.0.0.1"), None, Family::V4, 0, 2048);
        dcc.registry.get_mut(r).unwrap().phase = ConnectionPhase::Active;
        assert!(dcc.send_raw("7", "10.0.0.2", "x").is_err());
        assert!(rec.said_containing("No active DCC RAW:10.0.0.2 connection for 7"));
    }
}
