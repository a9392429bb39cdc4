//! `DCC LIST` and the size/speed formatting it shares with transfers.

use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use serde::Serialize;

use super::Dcc;
use super::hooks::DccEvent;
use super::session::{Refnum, Session};

/// Human-readable size: plain bytes below 1 KiB, then Kb/Mb/Gb.
pub fn calc_size(size: u64) -> String {
    const KB: u64 = 1 << 10;
    const MB: u64 = 1 << 20;
    const GB: u64 = 1 << 30;
    match size {
        s if s < KB => s.to_string(),
        s if s < MB => format!("{:3.1}Kb", s as f64 / KB as f64),
        s if s < GB => format!("{:3.1}Mb", s as f64 / MB as f64),
        s => format!("{:3.1}Gb", s as f64 / GB as f64),
    }
}

/// KB/s over `elapsed`, or `N/A` when nothing moved or no time passed.
pub fn calc_speed(sofar: u64, elapsed: Duration) -> String {
    let secs = elapsed.as_secs_f64();
    if sofar == 0 || secs <= 0.0 {
        return "N/A".to_string();
    }
    format!("{:4.1}", sofar as f64 / 1024.0 / secs)
}

fn columns(cols: [&str; 9]) -> String {
    let [kind, crypt, nick, status, start, size, compl, speed, args] = cols;
    format!(
        "{kind:<7.7}{crypt:<3.3} {nick:<9.9} {status:<9.9} {start:<20.20} {size:<6.6} {compl:<5.5} {speed:<6.6} {args}"
    )
}

/// One row of `DCC LIST`, deleted sessions included.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ListEntry {
    pub refnum: Refnum,
    pub kind: &'static str,
    pub user: String,
    /// Closed, Active, Waiting, Offered or Unknown.
    pub status: &'static str,
    pub started_at: Option<DateTime<Local>>,
    pub filesize: u64,
    /// Bytes moved in total, including any resumed prefix.
    pub transferred: u64,
    pub resume_size: u64,
    pub description: Option<String>,
    /// Description as shown in the Args column.
    pub display_name: String,
    #[serde(skip)]
    pub elapsed: Duration,
}

impl ListEntry {
    pub fn from_session(s: &Session, long_pathnames: bool, now: Instant) -> Self {
        let display_name = match (long_pathnames, s.nopath()) {
            (false, Some(last)) => last.to_string(),
            _ => s.description.clone().unwrap_or_default(),
        };
        Self {
            refnum: s.refnum,
            kind: s.kind.as_str(),
            user: s.user.clone(),
            status: s.status(),
            started_at: s.started_at,
            filesize: s.filesize,
            transferred: s.transferred(),
            resume_size: s.resume_size,
            description: s.description.clone(),
            display_name,
            elapsed: s.active_time(now),
        }
    }

    pub fn header() -> String {
        columns([
            "Type", " ", "Nick", "Status", "Start time", "Size", "Compl", "Kb/s", "Args",
        ])
    }

    /// The default rendering of this row.
    pub fn row(&self) -> String {
        let (size, completed) = if self.filesize > 0 {
            let percent = (self.transferred as f64 / self.filesize as f64 * 100.0) as u64;
            (calc_size(self.filesize), format!("{percent}%"))
        } else {
            (String::new(), calc_size(self.transferred))
        };
        let started = self
            .started_at
            .map(|t| t.format("%H:%M:%S %b %d %Y").to_string())
            .unwrap_or_default();
        let act_sent = self.transferred.saturating_sub(self.resume_size);
        let speed = if act_sent > 0 {
            calc_speed(act_sent, self.elapsed)
        } else {
            String::new()
        };
        columns([
            self.kind,
            "",
            &self.user,
            self.status,
            &started,
            &size,
            &completed,
            &speed,
            &self.display_name,
        ])
    }
}

impl Dcc {
    /// Enumerate every session through the list hooks.
    pub fn list(&mut self) {
        self.guarded(|dcc| {
            if !dcc.fire(None, &DccEvent::ListStart) {
                dcc.say(&ListEntry::header());
            }
            let now = Instant::now();
            let long = dcc.settings.long_pathnames;
            let entries: Vec<ListEntry> = dcc
                .registry
                .iter()
                .map(|s| ListEntry::from_session(s, long, now))
                .collect();
            for entry in entries {
                let refnum = entry.refnum;
                let row = entry.row();
                if !dcc.fire(Some(refnum), &DccEvent::ListRow(entry)) {
                    dcc.say(&row);
                }
            }
            dcc.fire(None, &DccEvent::ListEnd);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::super::session::{ConnectionKind, Family};
    use super::*;

    #[test]
    fn sizes() {
        assert_eq!(calc_size(0), "0");
        assert_eq!(calc_size(1023), "1023");
        assert_eq!(calc_size(1536), "1.5Kb");
        assert_eq!(calc_size(5 * 1024 * 1024), "5.0Mb");
        assert_eq!(calc_size(3 << 30), "3.0Gb");
    }

    #[test]
    fn speeds() {
        assert_eq!(calc_speed(0, Duration::from_secs(1)), "N/A");
        assert_eq!(calc_speed(1024, Duration::ZERO), "N/A");
        assert_eq!(calc_speed(10 * 1024, Duration::from_secs(2)), " 5.0");
    }

    #[test]
    fn header_columns() {
        assert_eq!(
            ListEntry::header(),
            "Type       Nick      Status    Start time           Size   Compl Kb/s   Args"
        );
    }

    #[test]
    fn row_for_a_partial_transfer() {
        let mut s = Session::new(
            Refnum(7),
            ConnectionKind::GetOffer,
            "bob",
            Some("/srv/files/a.txt"),
            None,
            Family::V4,
            200,
            2048,
        );
        s.bytes_read = 50;
        let entry = ListEntry::from_session(&s, false, Instant::now());
        assert_eq!(entry.display_name, "a.txt");
        assert_eq!(entry.status, "Unknown");
        let row = entry.row();
        assert!(row.starts_with("GET        bob       Unknown"));
        assert!(row.contains("200    25%"));
        assert!(row.ends_with("a.txt"));

        let entry = ListEntry::from_session(&s, true, Instant::now());
        assert_eq!(entry.display_name, "/srv/files/a.txt");
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["refnum"], 7);
        assert_eq!(json["kind"], "GET");
    }
}
