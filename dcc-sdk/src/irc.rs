//! Minimal IRC message parsing and serialization.

use std::collections::HashMap;
use std::fmt;

/// A parsed IRC protocol line.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    /// IRCv3 message tags (empty if none).
    pub tags: HashMap<String, String>,
    /// Source prefix without the leading `:`.
    pub prefix: Option<String>,
    pub command: String,
    pub params: Vec<String>,
}

impl Message {
    pub fn new(command: &str, params: Vec<&str>) -> Self {
        Self {
            tags: HashMap::new(),
            prefix: None,
            command: command.to_string(),
            params: params.into_iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Parse a raw line. Returns `None` for empty input.
    pub fn parse(line: &str) -> Option<Self> {
        let mut rest = line.trim_end_matches(['\r', '\n']);
        if rest.is_empty() {
            return None;
        }

        let mut tags = HashMap::new();
        if let Some(stripped) = rest.strip_prefix('@') {
            let (raw_tags, after) = stripped.split_once(' ')?;
            for tag in raw_tags.split(';').filter(|t| !t.is_empty()) {
                match tag.split_once('=') {
                    Some((k, v)) => tags.insert(k.to_string(), v.to_string()),
                    None => tags.insert(tag.to_string(), String::new()),
                };
            }
            rest = after.trim_start();
        }

        let mut prefix = None;
        if let Some(stripped) = rest.strip_prefix(':') {
            let (p, after) = stripped.split_once(' ')?;
            prefix = Some(p.to_string());
            rest = after.trim_start();
        }

        let (command, mut rest) = match rest.split_once(' ') {
            Some((c, r)) => (c, r),
            None => (rest, ""),
        };
        if command.is_empty() {
            return None;
        }

        let mut params = Vec::new();
        loop {
            rest = rest.trim_start_matches(' ');
            if rest.is_empty() {
                break;
            }
            if let Some(trailing) = rest.strip_prefix(':') {
                params.push(trailing.to_string());
                break;
            }
            match rest.split_once(' ') {
                Some((p, r)) => {
                    params.push(p.to_string());
                    rest = r;
                }
                None => {
                    params.push(rest.to_string());
                    break;
                }
            }
        }

        Some(Self {
            tags,
            prefix,
            command: command.to_ascii_uppercase(),
            params,
        })
    }

    /// Nick portion of the prefix (`nick!user@host` → `nick`).
    pub fn source_nick(&self) -> Option<&str> {
        self.prefix.as_deref().and_then(|p| p.split('!').next())
    }

    /// `user@host` portion of the prefix, if present.
    pub fn source_userhost(&self) -> Option<&str> {
        self.prefix.as_deref().and_then(|p| p.split_once('!')).map(|(_, uh)| uh)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.tags.is_empty() {
            let mut keys: Vec<_> = self.tags.keys().collect();
            keys.sort();
            let rendered: Vec<String> = keys
                .into_iter()
                .map(|k| match self.tags[k].as_str() {
                    "" => k.clone(),
                    v => format!("{k}={v}"),
                })
                .collect();
            write!(f, "@{} ", rendered.join(";"))?;
        }
        if let Some(prefix) = &self.prefix {
            write!(f, ":{prefix} ")?;
        }
        write!(f, "{}", self.command)?;
        let last = self.params.len().saturating_sub(1);
        for (i, param) in self.params.iter().enumerate() {
            if i == last && (param.is_empty() || param.contains(' ') || param.starts_with(':')) {
                write!(f, " :{param}")?;
            } else {
                write!(f, " {param}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_privmsg_with_prefix() {
        let msg = Message::parse(":bob!b@host.example PRIVMSG alice :hello there\r\n").unwrap();
        assert_eq!(msg.command, "PRIVMSG");
        assert_eq!(msg.source_nick(), Some("bob"));
        assert_eq!(msg.source_userhost(), Some("b@host.example"));
        assert_eq!(msg.params, vec!["alice", "hello there"]);
    }

    #[test]
    fn parse_tags_and_numeric() {
        let msg = Message::parse("@time=2024;+typing :srv 303 me :bob carol").unwrap();
        assert_eq!(msg.tags.get("time").map(String::as_str), Some("2024"));
        assert_eq!(msg.tags.get("+typing").map(String::as_str), Some(""));
        assert_eq!(msg.command, "303");
        assert_eq!(msg.params, vec!["me", "bob carol"]);
    }

    #[test]
    fn display_uses_trailing_for_spaces() {
        let msg = Message::new("NOTICE", vec!["bob", "\x01DCC REJECT GET a.txt\x01"]);
        assert_eq!(msg.to_string(), "NOTICE bob :\x01DCC REJECT GET a.txt\x01");
        assert!(Message::parse("").is_none());
    }
}
