//! Session registry with cooperative borrow counting.
//!
//! Sessions are kept newest-first. A session flagged `delete` is invisible to
//! every lookup but stays in the list until it is unlocked and no iteration
//! holds the global lock; only then does [`Registry::take_reclaimable`] hand
//! it out for erasure.

use super::codec;
use super::session::{ConnectionKind, ConnectionPhase, Family, Refnum, Session};

/// Which phase a search should accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Activity {
    /// Only sessions that are not yet active.
    PendingOnly,
    ActiveOnly,
    #[default]
    Any,
}

/// Composite search criteria. `None` fields are wildcards.
#[derive(Debug, Clone, Copy, Default)]
pub struct Search<'a> {
    pub kind: Option<ConnectionKind>,
    pub user: Option<&'a str>,
    pub description: Option<&'a str>,
    pub othername: Option<&'a str>,
    pub activity: Activity,
}

impl<'a> Search<'a> {
    pub fn kind(kind: ConnectionKind) -> Self {
        Self { kind: Some(kind), ..Self::default() }
    }

    pub fn user(mut self, user: &'a str) -> Self {
        self.user = Some(user);
        self
    }

    pub fn description(mut self, description: Option<&'a str>) -> Self {
        self.description = description;
        self
    }

    pub fn othername(mut self, othername: Option<&'a str>) -> Self {
        self.othername = othername;
        self
    }

    pub fn activity(mut self, activity: Activity) -> Self {
        self.activity = activity;
        self
    }

    fn matches(&self, s: &Session, decoded: Option<&str>) -> bool {
        if s.delete {
            return false;
        }
        if self.kind.is_some_and(|k| k != s.kind) {
            return false;
        }
        if self.user.is_some_and(|u| !u.eq_ignore_ascii_case(&s.user)) {
            return false;
        }
        if let (Some(want), Some(have)) = (self.description, s.description.as_deref()) {
            if !description_matches(want, decoded, have, self.othername, s.othername.as_deref()) {
                return false;
            }
        }
        match self.activity {
            Activity::PendingOnly => s.phase != ConnectionPhase::Active,
            Activity::ActiveOnly => s.phase == ConnectionPhase::Active,
            Activity::Any => true,
        }
    }
}

/// Exact, url-decoded exact, last path segment, then `othername` equality.
fn description_matches(
    want: &str,
    decoded: Option<&str>,
    have: &str,
    want_other: Option<&str>,
    have_other: Option<&str>,
) -> bool {
    let same = |candidate: &str| {
        want.eq_ignore_ascii_case(candidate)
            || decoded.is_some_and(|d| d.eq_ignore_ascii_case(candidate))
    };
    if same(have) {
        return true;
    }
    let Some((_, last)) = have.rsplit_once('/') else {
        return false;
    };
    if same(last) {
        return true;
    }
    match (want_other, have_other) {
        (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
        _ => false,
    }
}

#[derive(Debug, Default)]
pub struct Registry {
    sessions: Vec<Session>,
    next_refnum: u64,
    global_lock: u32,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a session, give it the next refnum and put it at the head.
    pub fn create(
        &mut self,
        kind: ConnectionKind,
        user: &str,
        description: Option<&str>,
        othername: Option<&str>,
        family: Family,
        filesize: u64,
        block_size: usize,
    ) -> Refnum {
        let refnum = Refnum(self.next_refnum);
        self.next_refnum += 1;
        let session = Session::new(
            refnum,
            kind,
            user,
            description,
            othername,
            family,
            filesize,
            block_size,
        );
        tracing::debug!(%refnum, kind = %kind, user, "DCC session created");
        self.sessions.insert(0, session);
        refnum
    }

    /// First live session matching `query`, newest first.
    pub fn search(&self, query: &Search<'_>) -> Option<Refnum> {
        let decoded = query.description.map(codec::url_decode);
        self.sessions
            .iter()
            .find(|s| query.matches(s, decoded.as_deref()))
            .map(|s| s.refnum)
    }

    /// Every live, pending GET from `user` whose description matches `fname`
    /// (exactly or by last path segment). `None` matches all.
    pub fn get_bucket(&self, user: Option<&str>, fname: Option<&str>) -> Vec<Refnum> {
        let decoded = fname.map(codec::url_decode);
        self.sessions
            .iter()
            .filter(|s| !s.delete && s.phase != ConnectionPhase::Active)
            .filter(|s| s.kind == ConnectionKind::GetOffer)
            .filter(|s| user.is_none_or(|u| u.eq_ignore_ascii_case(&s.user)))
            .filter(|s| {
                let Some(desc) = s.description.as_deref() else { return false };
                let last = desc.rsplit_once('/').map(|(_, l)| l);
                [fname, decoded.as_deref()].into_iter().any(|want| match want {
                    None => true,
                    Some(w) => {
                        w.eq_ignore_ascii_case(desc) || last.is_some_and(|l| w.eq_ignore_ascii_case(l))
                    }
                })
            })
            .map(|s| s.refnum)
            .collect()
    }

    /// Live session by refnum.
    pub fn get(&self, refnum: Refnum) -> Option<&Session> {
        self.sessions.iter().find(|s| s.refnum == refnum && !s.delete)
    }

    pub fn get_mut(&mut self, refnum: Refnum) -> Option<&mut Session> {
        self.sessions.iter_mut().find(|s| s.refnum == refnum && !s.delete)
    }

    /// Session by refnum even if it is flagged for deletion.
    pub(crate) fn get_any_mut(&mut self, refnum: Refnum) -> Option<&mut Session> {
        self.sessions.iter_mut().find(|s| s.refnum == refnum)
    }

    /// Live session owning the given OS socket descriptor.
    #[cfg(unix)]
    pub fn lookup_by_fd(&self, fd: std::os::fd::RawFd) -> Option<Refnum> {
        self.sessions
            .iter()
            .find(|s| !s.delete && s.socket.raw_fd() == Some(fd))
            .map(|s| s.refnum)
    }

    /// All refnums in registry order, deleted ones included.
    pub fn refnums(&self) -> Vec<Refnum> {
        self.sessions.iter().map(|s| s.refnum).collect()
    }

    /// Every session in registry order, deleted ones included.
    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Session> {
        self.sessions.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn global_lock(&self) -> u32 {
        self.global_lock
    }

    /// Borrow a session (if given) and always the registry as a whole.
    pub fn lock(&mut self, refnum: Option<Refnum>) {
        if let Some(s) = refnum.and_then(|r| self.get_any_mut(r)) {
            s.locked += 1;
        }
        self.global_lock += 1;
    }

    /// Release a borrow. Returns true when the global count reaches zero and
    /// the caller should sweep.
    pub fn unlock(&mut self, refnum: Option<Refnum>) -> bool {
        if let Some(s) = refnum.and_then(|r| self.get_any_mut(r)) {
            s.locked = s.locked.saturating_sub(1);
        }
        self.global_lock = self.global_lock.saturating_sub(1);
        self.global_lock == 0
    }

    /// Detach the first deleted, unlocked session, if nothing holds the
    /// global lock.
    pub(crate) fn take_reclaimable(&mut self) -> Option<Session> {
        if self.global_lock > 0 {
            return None;
        }
        let idx = self.sessions.iter().position(|s| s.delete && s.locked == 0)?;
        Some(self.sessions.remove(idx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create(reg: &mut Registry, kind: ConnectionKind, user: &str, desc: &str) -> Refnum {
        reg.create(kind, user, Some(desc), None, Family::V4, 100, 2048)
    }

    #[test]
    fn refnums_strictly_increase_and_newest_is_first() {
        let mut reg = Registry::new();
        let a = create(&mut reg, ConnectionKind::Chat, "bob", "chat");
        let b = create(&mut reg, ConnectionKind::Chat, "carol", "chat");
        let c = create(&mut reg, ConnectionKind::Chat, "dave", "chat");
        assert!(a < b && b < c);
        assert_eq!(reg.refnums(), vec![c, b, a]);
    }

    #[test]
    fn refnums_not_reused_after_reclaim() {
        let mut reg = Registry::new();
        let a = create(&mut reg, ConnectionKind::Chat, "bob", "chat");
        reg.get_mut(a).unwrap().delete = true;
        assert!(reg.take_reclaimable().is_some());
        let b = create(&mut reg, ConnectionKind::Chat, "bob", "chat");
        assert!(b > a);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn listener_is_found_by_its_descriptor() {
        use super::super::DccSettings;
        use super::super::test_support::{ctx, manager};

        let (mut dcc, _) = manager(DccSettings::default());
        let r = dcc.raw_listen(&ctx(), 0, Family::V4).unwrap();
        let fd = dcc.registry.get(r).unwrap().socket.raw_fd().unwrap();
        assert_eq!(dcc.registry.lookup_by_fd(fd), Some(r));
        assert_eq!(dcc.registry.lookup_by_fd(-1), None);

        dcc.delete(r);
        assert_eq!(dcc.registry.lookup_by_fd(fd), None);
    }

    #[test]
    fn deleted_sessions_are_invisible() {
        let mut reg = Registry::new();
        let r = create(&mut reg, ConnectionKind::GetOffer, "bob", "file.txt");
        assert_eq!(reg.search(&Search::kind(ConnectionKind::GetOffer).user("BOB")), Some(r));
        reg.get_mut(r).unwrap().delete = true;
        assert!(reg.get(r).is_none());
        assert!(reg.get_mut(r).is_none());
        assert!(reg.search(&Search::default()).is_none());
        assert!(reg.get_bucket(None, None).is_empty());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn description_matching_rules() {
        let mut reg = Registry::new();
        let r = reg.create(
            ConnectionKind::SendOffer,
            "bob",
            Some("/home/me/my file.txt"),
            Some("4000"),
            Family::V4,
            10,
            2048,
        );
        let find = |desc: &str, other: Option<&str>| {
            reg.search(
                &Search::kind(ConnectionKind::SendOffer)
                    .user("bob")
                    .description(Some(desc))
                    .othername(other),
            )
        };
        assert_eq!(find("/home/me/my file.txt", None), Some(r));
        assert_eq!(find("my file.txt", None), Some(r));
        assert_eq!(find("my%20file.txt", None), Some(r));
        assert_eq!(find("file.ext", Some("4000")), Some(r));
        assert_eq!(find("file.ext", Some("4001")), None);
        assert_eq!(find("other.txt", None), None);
    }

    #[test]
    fn activity_filter() {
        let mut reg = Registry::new();
        let r = create(&mut reg, ConnectionKind::Chat, "bob", "chat");
        let active = Search::kind(ConnectionKind::Chat).activity(Activity::ActiveOnly);
        let pending = Search::kind(ConnectionKind::Chat).activity(Activity::PendingOnly);
        assert_eq!(reg.search(&active), None);
        assert_eq!(reg.search(&pending), Some(r));
        reg.get_mut(r).unwrap().phase = ConnectionPhase::Active;
        assert_eq!(reg.search(&active), Some(r));
        assert_eq!(reg.search(&pending), None);
    }

    #[test]
    fn bucket_matches_last_segment_and_skips_active() {
        let mut reg = Registry::new();
        let a = create(&mut reg, ConnectionKind::GetOffer, "bob", "a.txt");
        let b = create(&mut reg, ConnectionKind::GetOffer, "bob", "dir/b.txt");
        create(&mut reg, ConnectionKind::GetOffer, "carol", "a.txt");
        assert_eq!(reg.get_bucket(Some("bob"), None), vec![b, a]);
        assert_eq!(reg.get_bucket(Some("bob"), Some("b.txt")), vec![b]);
        reg.get_mut(a).unwrap().phase = ConnectionPhase::Active;
        assert!(reg.get_bucket(Some("bob"), Some("a.txt")).is_empty());
    }

    #[test]
    fn reclaim_waits_for_both_locks() {
        let mut reg = Registry::new();
        let r = create(&mut reg, ConnectionKind::Chat, "bob", "chat");
        reg.get_mut(r).unwrap().delete = true;

        reg.lock(Some(r));
        assert!(reg.take_reclaimable().is_none());
        assert!(reg.unlock(Some(r)));

        reg.lock(None);
        assert!(reg.take_reclaimable().is_none());
        assert!(reg.unlock(None));

        let erased = reg.take_reclaimable().unwrap();
        assert_eq!(erased.refnum, r);
        assert_eq!(erased.locked(), 0);
        assert!(reg.is_empty());
    }

    #[test]
    fn nested_locks_only_report_zero_at_the_outermost() {
        let mut reg = Registry::new();
        reg.lock(None);
        reg.lock(None);
        assert!(!reg.unlock(None));
        assert_eq!(reg.global_lock(), 1);
        assert!(reg.unlock(None));
    }
}
