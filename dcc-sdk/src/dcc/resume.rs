//! mIRC's RESUME/ACCEPT extension.
//!
//! Both messages carry `<filename> <port> <offset>`, where `port` is the
//! port the original SEND offer listened on and identifies the transfer.
//! mIRC sends `file.ext` as the filename, which matches any file.

use crate::ctcp::CtcpKind;

use super::Dcc;
use super::error::{DccError, Result};
use super::registry::{Activity, Search};
use super::session::ConnectionKind;

const ANY_FILE: &str = "file.ext";

fn wildcard(filename: &str) -> Option<&str> {
    (filename != ANY_FILE).then_some(filename)
}

impl Dcc {
    /// The peer wants to resume a file we offered: rewind our counters to
    /// `offset` and ACCEPT.
    pub(crate) fn resume_demanded(
        &mut self,
        user: &str,
        filename: &str,
        port: &str,
        offset: &str,
    ) -> Result<()> {
        if !self.settings.mirc_resume {
            return Ok(());
        }
        tracing::debug!(user, filename, port, offset, "DCC RESUME requested");
        let found = self.registry.search(
            &Search::kind(ConnectionKind::SendOffer)
                .user(user)
                .description(wildcard(filename))
                .othername(Some(port))
                .activity(Activity::PendingOnly),
        );
        let Some(refnum) = found else {
            tracing::debug!(user, filename, "RESUME for a transfer that does not exist");
            return Err(DccError::NotFound(format!("RESUME {filename} from {user}")));
        };
        let Ok(offset_bytes) = offset.parse::<u64>() else {
            return Err(DccError::ProtocolViolation(format!("bad RESUME offset {offset}")));
        };
        if let Some(s) = self.registry.get_mut(refnum) {
            s.bytes_acked = offset_bytes;
            s.bytes_sent = offset_bytes;
            s.resume_size = offset_bytes;
            s.bytes_read = 0;
        }
        self.send_ctcp(
            CtcpKind::Request,
            user,
            format!("DCC ACCEPT {filename} {port} {offset}"),
        );
        Ok(())
    }

    /// The peer accepted our RESUME: connect and append.
    pub(crate) fn resume_start(
        &mut self,
        nick: &str,
        filename: &str,
        port: &str,
        offset: &str,
    ) -> Result<()> {
        if !self.settings.mirc_resume {
            return Ok(());
        }
        tracing::debug!(nick, filename, port, offset, "DCC ACCEPT received");
        let found = self.registry.search(
            &Search::kind(ConnectionKind::GetOffer)
                .user(nick)
                .description(wildcard(filename))
                .othername(Some(port))
                .activity(Activity::PendingOnly),
        );
        let Some(refnum) = found else {
            return Err(DccError::NotFound(format!("ACCEPT {filename} from {nick}")));
        };
        let Some(s) = self.registry.get_mut(refnum) else {
            return Err(DccError::NotFound(refnum.to_string()));
        };
        if !s.resume_requested {
            tracing::debug!(nick, filename, "unsolicited DCC ACCEPT");
            return Err(DccError::ProtocolViolation(format!(
                "unsolicited ACCEPT from {nick}"
            )));
        }
        s.two_clients = true;
        self.connect(refnum)
    }
}
