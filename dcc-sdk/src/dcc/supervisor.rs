//! Periodic aging of offers and connects.

use std::time::{Duration, Instant};

use super::Dcc;
use super::error::DccError;
use super::hooks::LostReason;
use super::session::{ConnectionKind, ConnectionPhase, Refnum};

impl Dcc {
    /// One supervisor pass. Returns how many sessions were expired.
    pub fn supervise(&mut self) -> usize {
        let now = Instant::now();
        self.expire_idle(now) + self.expire_connects(now)
    }

    /// Flag offers that have been idle longer than `idle_timeout_secs`.
    /// Active sessions and RAW listeners never idle out.
    pub fn expire_idle(&mut self, now: Instant) -> usize {
        let timeout = self.settings.idle_timeout_secs;
        if timeout == 0 {
            return 0;
        }
        let limit = Duration::from_secs(timeout);
        self.expire(now, limit, LostReason::IdleTimeExceeded, "idle time exceeded", |phase, kind| {
            phase != ConnectionPhase::Active && kind != ConnectionKind::RawListen
        })
    }

    /// Flag outbound connects that have not completed within
    /// `connect_timeout_secs`.
    pub fn expire_connects(&mut self, now: Instant) -> usize {
        let timeout = self.settings.connect_timeout_secs;
        if timeout == 0 {
            return 0;
        }
        let limit = Duration::from_secs(timeout);
        self.expire(now, limit, LostReason::ConnectTimedOut, "connection timed out", |phase, _| {
            phase == ConnectionPhase::Connecting
        })
    }

    fn expire(
        &mut self,
        now: Instant,
        limit: Duration,
        reason: LostReason,
        why: &str,
        eligible: impl Fn(ConnectionPhase, ConnectionKind) -> bool,
    ) -> usize {
        self.guarded(|dcc| {
            let stale: Vec<Refnum> = dcc
                .registry
                .iter()
                .filter(|s| !s.delete && eligible(s.phase, s.kind))
                .filter(|s| now.saturating_duration_since(s.lasttime) >= limit)
                .map(|s| s.refnum)
                .collect();
            for &refnum in &stale {
                let Some(s) = dcc.registry.get(refnum) else { continue };
                let text = format!(
                    "DCC {}:{} to {} -- {why}",
                    s.kind,
                    s.description.as_deref().unwrap_or("<any>"),
                    s.user
                );
                let error = DccError::Timeout(text.clone());
                tracing::info!(%refnum, %reason, %error, "DCC session expired");
                dcc.lost(refnum, reason, None, text);
                dcc.delete(refnum);
            }
            stale.len()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::DccSettings;
    use super::super::hooks::DccEvent;
    use super::super::session::Family;
    use super::super::test_support::*;
    use super::*;

    #[test]
    fn idle_offer_expires_exactly_once() {
        let settings = DccSettings {
            idle_timeout_secs: 10,
            ..DccSettings::default()
        };
        let (mut dcc, rec) = manager(settings);
        let r = dcc.registry.create(
            ConnectionKind::SendOffer,
            "bob",
            Some("/tmp/a.txt"),
            None,
            Family::V4,
            100,
            2048,
        );
        dcc.registry.get_mut(r).unwrap().phase = ConnectionPhase::MyOffer;
        let later = Instant::now() + Duration::from_secs(11);

        assert_eq!(dcc.expire_idle(later), 1);
        assert_eq!(dcc.expire_idle(later), 0);
        let lost: Vec<_> = rec
            .events
            .lock()
            .iter()
            .filter(|e| matches!(e, DccEvent::Lost { reason: LostReason::IdleTimeExceeded, .. }))
            .cloned()
            .collect();
        assert_eq!(lost.len(), 1);
        assert!(rec.said_containing("DCC SEND:/tmp/a.txt to bob -- idle time exceeded"));
        assert!(dcc.session(r).is_none());
    }

    #[test]
    fn fresh_active_and_listening_sessions_survive() {
        let settings = DccSettings {
            idle_timeout_secs: 10,
            ..DccSettings::default()
        };
        let (mut dcc, _) = manager(settings);
        let fresh = dcc.registry.create(ConnectionKind::Chat, "a", None, None, Family::V4, 0, 2048);
        let active = dcc.registry.create(ConnectionKind::Chat, "b", None, None, Family::V4, 0, 2048);
        let listener = dcc.registry.create(ConnectionKind::RawListen, "4000", None, None, Family::V4, 0, 2048);
        dcc.registry.get_mut(active).unwrap().phase = ConnectionPhase::Active;
        let later = Instant::now() + Duration::from_secs(60);
        dcc.registry.get_mut(fresh).unwrap().lasttime = later;

        assert_eq!(dcc.expire_idle(later), 0);
        assert!(dcc.session(listener).is_some());
    }

    #[test]
    fn zero_disables_timeouts() {
        let settings = DccSettings {
            idle_timeout_secs: 0,
            connect_timeout_secs: 0,
            ..DccSettings::default()
        };
        let (mut dcc, _) = manager(settings);
        let r = dcc.registry.create(ConnectionKind::Chat, "a", None, None, Family::V4, 0, 2048);
        dcc.registry.get_mut(r).unwrap().phase = ConnectionPhase::Connecting;
        let later = Instant::now() + Duration::from_secs(100_000);
        assert_eq!(dcc.expire_idle(later) + dcc.expire_connects(later), 0);
    }

    #[test]
    fn stalled_connect_times_out() {
        let (mut dcc, rec) = manager(DccSettings::default());
        let r = dcc.registry.create(ConnectionKind::GetOffer, "bob", Some("a.txt"), None, Family::V4, 5, 2048);
        dcc.registry.get_mut(r).unwrap().phase = ConnectionPhase::Connecting;
        let later = Instant::now() + Duration::from_secs(31);
        assert_eq!(dcc.expire_connects(later), 1);
        assert!(rec.said_containing("connection timed out"));
    }
}
