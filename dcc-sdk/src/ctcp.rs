//! CTCP framing helpers.
//!
//! A CTCP payload travels inside PRIVMSG (request) or NOTICE (reply) text,
//! delimited by `\x01`.

pub const DELIM: char = '\x01';

/// Which IRC command carries a CTCP payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtcpKind {
    /// Carried in a PRIVMSG.
    Request,
    /// Carried in a NOTICE.
    Reply,
}

impl CtcpKind {
    pub fn command(self) -> &'static str {
        match self {
            CtcpKind::Request => "PRIVMSG",
            CtcpKind::Reply => "NOTICE",
        }
    }
}

/// Split `\x01COMMAND args\x01` into `(COMMAND, args)`.
pub fn parse(text: &str) -> Option<(&str, &str)> {
    let inner = text.strip_prefix(DELIM)?;
    let inner = inner.strip_suffix(DELIM).unwrap_or(inner);
    match inner.split_once(' ') {
        Some((cmd, args)) => Some((cmd, args)),
        None if !inner.is_empty() => Some((inner, "")),
        None => None,
    }
}

/// Wrap a payload in CTCP delimiters.
pub fn frame(payload: &str) -> String {
    format!("{DELIM}{payload}{DELIM}")
}

/// Split whitespace-separated arguments, keeping `"quoted words"` together.
pub fn split_args(input: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut chars = input.chars().peekable();
    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        let Some(&first) = chars.peek() else { break };
        let mut word = String::new();
        if first == '"' {
            chars.next();
            for c in chars.by_ref() {
                if c == '"' {
                    break;
                }
                word.push(c);
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                word.push(c);
                chars.next();
            }
        }
        args.push(word);
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_dcc_payload() {
        let (cmd, args) = parse("\x01DCC SEND file.txt 2130706433 5000 100\x01").unwrap();
        assert_eq!(cmd, "DCC");
        assert_eq!(args, "SEND file.txt 2130706433 5000 100");
        assert_eq!(parse("\x01VERSION"), Some(("VERSION", "")));
        assert!(parse("plain text").is_none());
    }

    #[test]
    fn split_respects_quotes() {
        assert_eq!(
            split_args(r#"RESUME "my file.txt" 4000 40"#),
            vec!["RESUME", "my file.txt", "4000", "40"]
        );
        assert_eq!(split_args("  a   b "), vec!["a", "b"]);
        assert!(split_args("").is_empty());
    }
}
