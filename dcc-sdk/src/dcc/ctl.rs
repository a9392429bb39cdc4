//! Introspection and tuning of individual sessions by refnum.
//!
//! `ctl` takes a whitespace-separated request and returns its answer as
//! text, or `None` when the request names no session or no field. Keywords
//! are case-insensitive and may be abbreviated; the first keyword in the
//! documented order that starts with the given word wins.
//!
//! ```text
//! REFNUMS
//! GET <refnum> <field>
//! SET <refnum> <field> <value>
//! TYPEMATCH | DESCMATCH | FILEMATCH | USERMATCH | USERHOSTMATCH | OTHERMATCH <glob>
//! HELD | UNHELD
//! ```

use std::net::SocketAddr;
use std::time::Instant;

use super::Dcc;
use super::registry::Registry;
use super::session::{ConnectionPhase, Refnum, Session};

const COMMANDS: &[&str] = &[
    "REFNUMS",
    "GET",
    "SET",
    "TYPEMATCH",
    "DESCMATCH",
    "FILEMATCH",
    "USERMATCH",
    "USERHOSTMATCH",
    "OTHERMATCH",
    "HELD",
    "UNHELD",
];

const GET_FIELDS: &[&str] = &[
    "REFNUM",
    "TYPE",
    "DESCRIPTION",
    "FILENAME",
    "USER",
    "USERHOST",
    "OTHERNAME",
    "SIZE",
    "RESUMESIZE",
    "READBYTES",
    "SENTBYTES",
    "LOCKED",
    "HELD",
    "HELDTIME",
    "FLAGS",
    "OFFERADDR",
    "REMADDR",
    "LOCADDR",
    "WANT_PORT",
    "UPDATES_STATUS",
];

const SET_FIELDS: &[&str] = &[
    "DESCRIPTION",
    "FILENAME",
    "USER",
    "USERHOST",
    "OTHERNAME",
    "WANT_PORT",
    "HELD",
    "UPDATES_STATUS",
];

/// Resolve a possibly abbreviated keyword against `table`.
fn keyword(word: &str, table: &[&'static str]) -> Option<&'static str> {
    if word.is_empty() {
        return None;
    }
    let word = word.to_ascii_uppercase();
    table.iter().copied().find(|k| k.starts_with(&word))
}

/// Split off the first word, returning it and the trimmed remainder.
fn next_word(input: &str) -> (&str, &str) {
    let input = input.trim_start();
    match input.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim_start()),
        None => (input, ""),
    }
}

/// Simple wildcard matching (* and ?), case-insensitive.
pub fn wildcard_match(pattern: &str, text: &str) -> bool {
    let pattern = pattern.to_lowercase();
    let text = text.to_lowercase();
    wildcard_match_inner(pattern.as_bytes(), text.as_bytes())
}

fn wildcard_match_inner(pattern: &[u8], text: &[u8]) -> bool {
    match (pattern.first(), text.first()) {
        (None, None) => true,
        (Some(b'*'), _) => {
            wildcard_match_inner(&pattern[1..], text)
                || (!text.is_empty() && wildcard_match_inner(pattern, &text[1..]))
        }
        (Some(b'?'), Some(_)) => wildcard_match_inner(&pattern[1..], &text[1..]),
        (Some(a), Some(b)) if a == b => wildcard_match_inner(&pattern[1..], &text[1..]),
        _ => false,
    }
}

/// Refnums of every live session whose picked field matches `glob`.
fn matching(registry: &Registry, glob: &str, pick: fn(&Session) -> String) -> Option<String> {
    let refs: Vec<String> = registry
        .iter()
        .filter(|s| !s.delete && wildcard_match(glob, &pick(s)))
        .map(|s| s.refnum.to_string())
        .collect();
    Some(refs.join(" "))
}

fn addr(a: Option<SocketAddr>) -> Option<String> {
    a.map(|a| format!("{} {}", a.ip(), a.port()))
}

fn flag(b: bool) -> String {
    u8::from(b).to_string()
}

/// Phase and boolean state as words.
fn flags(s: &Session) -> String {
    let phase = match s.phase {
        ConnectionPhase::Unknown => "UNKNOWN",
        ConnectionPhase::MyOffer => "MY_OFFER",
        ConnectionPhase::TheirOffer => "THEIR_OFFER",
        ConnectionPhase::Connecting => "CONNECTING",
        ConnectionPhase::Active => "ACTIVE",
    };
    let mut words = vec![phase];
    for (set, name) in [
        (s.delete, "DELETE"),
        (s.two_clients, "TWO_CLIENTS"),
        (s.rejected, "REJECTED"),
        (s.resume_requested, "RESUME_REQUESTED"),
    ] {
        if set {
            words.push(name);
        }
    }
    words.join(" ")
}

fn get_field(s: &Session, field: &str) -> Option<String> {
    let text = |o: &Option<String>| o.clone().unwrap_or_default();
    Some(match field {
        "REFNUM" => s.refnum.to_string(),
        "TYPE" => s.kind.to_string(),
        "DESCRIPTION" => text(&s.description),
        "FILENAME" => s
            .local_filename
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default(),
        "USER" => s.user.clone(),
        "USERHOST" => text(&s.userhost),
        "OTHERNAME" => text(&s.othername),
        "SIZE" => s.filesize.to_string(),
        "RESUMESIZE" => s.resume_size.to_string(),
        "READBYTES" => s.bytes_read.to_string(),
        "SENTBYTES" => s.bytes_sent.to_string(),
        "LOCKED" => s.locked().to_string(),
        "HELD" => flag(s.held),
        "HELDTIME" => {
            let mut held = s.heldtime;
            if s.held {
                if let Some(since) = s.holdtime {
                    held += Instant::now().saturating_duration_since(since);
                }
            }
            format!("{:.3}", held.as_secs_f64())
        }
        "FLAGS" => flags(s),
        "OFFERADDR" => addr(s.offer)?,
        "REMADDR" => addr(s.peer_addr)?,
        "LOCADDR" => addr(s.local_addr)?,
        "WANT_PORT" => s.want_port.to_string(),
        "UPDATES_STATUS" => flag(s.updates_status),
        _ => return None,
    })
}

fn set_field(s: &mut Session, field: &str, value: &str) -> Option<String> {
    let int = || value.split_whitespace().next()?.parse::<i64>().ok();
    match field {
        "DESCRIPTION" => s.description = Some(value.to_string()),
        "FILENAME" => s.local_filename = Some(value.into()),
        "USER" => s.user = value.to_string(),
        "USERHOST" => s.userhost = Some(value.to_string()),
        "OTHERNAME" => s.othername = Some(value.to_string()),
        "WANT_PORT" => s.want_port = u16::try_from(int()?).ok()?,
        "HELD" => {
            let changed = if int()? != 0 { s.hold() } else { s.unhold() };
            return Some(flag(changed));
        }
        "UPDATES_STATUS" => s.updates_status = int()? != 0,
        _ => return None,
    }
    Some("1".to_string())
}

impl Dcc {
    /// Answer an introspection request. See the module docs for the
    /// grammar.
    pub fn ctl(&mut self, input: &str) -> Option<String> {
        let (word, rest) = next_word(input);
        let command = keyword(word, COMMANDS)?;
        tracing::trace!(command, args = rest, "dcc ctl");

        match command {
            "REFNUMS" => Some(
                self.registry
                    .iter()
                    .filter(|s| !s.delete)
                    .map(|s| s.refnum.to_string())
                    .collect::<Vec<_>>()
                    .join(" "),
            ),
            "GET" => {
                let (refnum, rest) = next_word(rest);
                let refnum = Refnum(refnum.parse().ok()?);
                let (field, _) = next_word(rest);
                let s = self.registry.get(refnum)?;
                get_field(s, keyword(field, GET_FIELDS)?)
            }
            "SET" => {
                let (refnum, rest) = next_word(rest);
                let refnum = Refnum(refnum.parse().ok()?);
                let (field, value) = next_word(rest);
                let field = keyword(field, SET_FIELDS)?;
                let s = self.registry.get_mut(refnum)?;
                tracing::debug!(%refnum, field, value, "dcc ctl set");
                set_field(s, field, value)
            }
            "TYPEMATCH" => matching(&self.registry, rest, |s| s.kind.to_string()),
            "DESCMATCH" => matching(&self.registry, rest, |s| {
                s.description.clone().unwrap_or_default()
            }),
            "FILEMATCH" => matching(&self.registry, rest, |s| {
                s.local_filename
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default()
            }),
            "USERMATCH" => matching(&self.registry, rest, |s| s.user.clone()),
            "USERHOSTMATCH" => {
                matching(&self.registry, rest, |s| s.userhost.clone().unwrap_or_default())
            }
            "OTHERMATCH" => {
                matching(&self.registry, rest, |s| s.othername.clone().unwrap_or_default())
            }
            "HELD" | "UNHELD" => {
                let want = command == "HELD";
                Some(
                    self.registry
                        .iter()
                        .filter(|s| !s.delete && s.held == want)
                        .map(|s| s.refnum.to_string())
                        .collect::<Vec<_>>()
                        .join(" "),
                )
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::session::{ConnectionKind, Family};
    use super::super::test_support::*;
    use super::super::DccSettings;
    use super::*;

    fn two_sessions(dcc: &mut Dcc) -> (Refnum, Refnum) {
        let chat = dcc.registry.create(
            ConnectionKind::Chat,
            "bob",
            Some("chat"),
            None,
            Family::V4,
            0,
            2048,
        );
        let get = dcc.registry.create(
            ConnectionKind::GetOffer,
            "carol",
            Some("notes.txt"),
            None,
            Family::V4,
            5000,
            2048,
        );
        (chat, get)
    }

    #[test]
    fn wildcards() {
        assert!(wildcard_match("*.txt", "Notes.TXT"));
        assert!(wildcard_match("b?b", "bob"));
        assert!(wildcard_match("*", ""));
        assert!(!wildcard_match("a*c", "abd"));
    }

    #[test]
    fn refnums_and_matches() {
        let (mut dcc, _) = manager(DccSettings::default());
        let (chat, get) = two_sessions(&mut dcc);
        assert_eq!(dcc.ctl("REFNUMS").unwrap(), format!("{get} {chat}"));
        assert_eq!(dcc.ctl("typematch G*").unwrap(), get.to_string());
        assert_eq!(dcc.ctl("USERMATCH b*").unwrap(), chat.to_string());
        assert_eq!(dcc.ctl("DESCMATCH *.txt").unwrap(), get.to_string());
        assert_eq!(dcc.ctl("DESCMATCH *.jpg").unwrap(), "");
        assert_eq!(dcc.ctl("FROB"), None);
    }

    #[test]
    fn deleted_sessions_are_not_listed() {
        let (mut dcc, _) = manager(DccSettings::default());
        let (chat, get) = two_sessions(&mut dcc);
        dcc.delete(chat);
        assert_eq!(dcc.ctl("REFNUMS").unwrap(), get.to_string());
        assert_eq!(dcc.ctl("USERMATCH b*").unwrap(), "");
        assert_eq!(dcc.ctl("TYPEMATCH *").unwrap(), get.to_string());
        assert_eq!(dcc.ctl("UNHELD").unwrap(), get.to_string());
    }

    #[test]
    fn get_fields() {
        let (mut dcc, _) = manager(DccSettings::default());
        let (chat, get) = two_sessions(&mut dcc);
        assert_eq!(dcc.ctl(&format!("GET {get} TYPE")).unwrap(), "GET");
        assert_eq!(dcc.ctl(&format!("GET {get} size")).unwrap(), "5000");
        assert_eq!(dcc.ctl(&format!("GET {chat} USER")).unwrap(), "bob");
        assert_eq!(dcc.ctl(&format!("GET {chat} DESC")).unwrap(), "chat");
        assert_eq!(dcc.ctl(&format!("GET {chat} FLAGS")).unwrap(), "UNKNOWN");
        assert_eq!(dcc.ctl(&format!("GET {chat} UPDATES_STATUS")).unwrap(), "1");
        assert_eq!(dcc.ctl(&format!("GET {chat} OFFERADDR")), None);
        assert_eq!(dcc.ctl(&format!("GET {chat} NOPE")), None);
        assert_eq!(dcc.ctl("GET 999 USER"), None);
    }

    #[test]
    fn set_fields_and_hold() {
        let (mut dcc, _) = manager(DccSettings::default());
        let (chat, get) = two_sessions(&mut dcc);
        assert_eq!(dcc.ctl(&format!("SET {get} DESCRIPTION my notes.txt")).unwrap(), "1");
        assert_eq!(dcc.session(get).unwrap().description.as_deref(), Some("my notes.txt"));
        assert_eq!(dcc.ctl(&format!("SET {get} WANT_PORT 5555")).unwrap(), "1");
        assert_eq!(dcc.session(get).unwrap().want_port, 5555);
        assert_eq!(dcc.ctl(&format!("SET {get} WANT_PORT 70000")), None);

        assert_eq!(dcc.ctl(&format!("SET {chat} HELD 1")).unwrap(), "1");
        assert_eq!(dcc.ctl(&format!("SET {chat} HELD 1")).unwrap(), "0");
        assert_eq!(dcc.ctl("HELD").unwrap(), chat.to_string());
        assert_eq!(dcc.ctl("UNHELD").unwrap(), get.to_string());
        assert_eq!(dcc.ctl(&format!("SET {chat} HELD 0")).unwrap(), "1");
        assert_eq!(dcc.ctl("HELD").unwrap(), "");

        assert_eq!(dcc.ctl(&format!("SET {chat} UPDATES_STATUS 0")).unwrap(), "1");
        assert!(!dcc.session(chat).unwrap().updates_status);
        assert_eq!(dcc.ctl(&format!("SET {chat} TYPE RAW")), None);
    }
}
