use crate::session::{Session, SessionState};
use ember::{SessionId, Usn};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering};

/// Outcome counters for the resume policy. Relaxed: they are operator
/// telemetry, not synchronization.
pub struct ReconnectStats {
    success: AtomicU64,
    fail_not_found: AtomicU64,
    fail_token_mismatch: AtomicU64,
    fail_invalid_state: AtomicU64,
    fail_expired: AtomicU64,
}

#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct ReconnectCounts {
    pub success: u64,
    pub fail_not_found: u64,
    pub fail_token_mismatch: u64,
    pub fail_invalid_state: u64,
    pub fail_expired: u64,
}

impl ReconnectStats {
    fn new() -> ReconnectStats {
        ReconnectStats {
            success: AtomicU64::new(0),
            fail_not_found: AtomicU64::new(0),
            fail_token_mismatch: AtomicU64::new(0),
            fail_invalid_state: AtomicU64::new(0),
            fail_expired: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> ReconnectCounts {
        ReconnectCounts {
            success: self.success.load(Ordering::Relaxed),
            fail_not_found: self.fail_not_found.load(Ordering::Relaxed),
            fail_token_mismatch: self.fail_token_mismatch.load(Ordering::Relaxed),
            fail_invalid_state: self.fail_invalid_state.load(Ordering::Relaxed),
            fail_expired: self.fail_expired.load(Ordering::Relaxed),
        }
    }
}

/// Session population by state, for the stats printer.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct ConnectionCounts {
    pub total: usize,
    pub connected: usize,
    pub waiting: usize,
}

struct Slot {
    used: AtomicBool,
    ptr: AtomicPtr<Session>,
}

/// Process-wide session directory: an open-addressed pointer table keyed by
/// session id, with a linear-scan secondary lookup by USN. A slot is claimed
/// by a CAS on its pointer and becomes visible once the used flag is set
/// with release ordering, so readers that see the flag also see the pointer.
///
/// The pointers refer into the workers' session slabs, which live for the
/// process lifetime.
pub struct SessionRegistry {
    slots: Box<[Slot]>,
    stats: ReconnectStats,
}

impl SessionRegistry {
    pub fn new(capacity: usize) -> SessionRegistry {
        let slots = (0..capacity)
            .map(|_| Slot {
                used: AtomicBool::new(false),
                ptr: AtomicPtr::new(ptr::null_mut()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        SessionRegistry {
            slots,
            stats: ReconnectStats::new(),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn reconnect_stats(&self) -> &ReconnectStats {
        &self.stats
    }

    #[inline]
    fn probe_start(&self, session_id: SessionId) -> usize {
        (session_id.wrapping_mul(0x9E37_79B9_7F4A_7C15) as usize) % self.slots.len()
    }

    /// Inserts a session, probing linearly from its id hash. Returns false
    /// when the table is full.
    pub fn register(&self, session: *mut Session) -> bool {
        let session_id = unsafe { (*session).session_id() };
        let start = self.probe_start(session_id);
        let len = self.slots.len();

        for step in 0..len {
            let slot = &self.slots[(start + step) % len];

            if slot
                .ptr
                .compare_exchange(
                    ptr::null_mut(),
                    session,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                slot.used.store(true, Ordering::Release);
                return true;
            }
        }

        false
    }

    /// Removes a session. A session that is not present is a no-op.
    pub fn deregister(&self, session: *mut Session) -> bool {
        let session_id = unsafe { (*session).session_id() };
        let start = self.probe_start(session_id);
        let len = self.slots.len();

        for step in 0..len {
            let slot = &self.slots[(start + step) % len];

            if slot.ptr.load(Ordering::Acquire) == session {
                slot.used.store(false, Ordering::Release);
                slot.ptr.store(ptr::null_mut(), Ordering::Release);
                return true;
            }
        }

        false
    }

    /// Primary lookup by session id.
    pub fn find(&self, session_id: SessionId) -> Option<*mut Session> {
        let start = self.probe_start(session_id);
        let len = self.slots.len();

        for step in 0..len {
            let slot = &self.slots[(start + step) % len];

            if !slot.used.load(Ordering::Acquire) {
                continue;
            }

            let session = slot.ptr.load(Ordering::Acquire);
            if !session.is_null() && unsafe { (*session).session_id() } == session_id {
                return Some(session);
            }
        }

        None
    }

    /// Raw slot access for broadcast sweeps over the live population.
    #[inline]
    pub fn slot_ptr(&self, index: usize) -> Option<*mut Session> {
        let slot = &self.slots[index];

        if !slot.used.load(Ordering::Acquire) {
            return None;
        }

        let session = slot.ptr.load(Ordering::Acquire);
        if session.is_null() {
            return None;
        }

        Some(session)
    }

    /// The resume decision, in one place. Scans for a session owning `usn`
    /// and either hands it back for promotion or cleans the stale entry up,
    /// bumping exactly one outcome counter.
    ///
    /// Any state other than TempDisconnect is treated as a hijack attempt
    /// against a live session: the old connection is severed and the entry
    /// retired, and the caller proceeds as a new login.
    pub fn find_by_usn(
        &self,
        usn: Usn,
        token: u64,
        is_reconnect: bool,
        now_ms: u64,
    ) -> Option<*mut Session> {
        if usn == 0 {
            if is_reconnect {
                self.stats.fail_not_found.fetch_add(1, Ordering::Relaxed);
            }
            return None;
        }

        for slot in self.slots.iter() {
            if !slot.used.load(Ordering::Acquire) {
                continue;
            }

            let ptr = slot.ptr.load(Ordering::Acquire);
            if ptr.is_null() {
                continue;
            }

            let session = unsafe { &*ptr };
            if session.usn() != usn {
                continue;
            }

            if session.state() != SessionState::TempDisconnect {
                self.retire(ptr);
                self.stats.fail_invalid_state.fetch_add(1, Ordering::Relaxed);
                return None;
            }

            if !session.validate_reconnect_token(token) {
                self.retire(ptr);
                self.stats.fail_token_mismatch.fetch_add(1, Ordering::Relaxed);
                return None;
            }

            if session.is_disconnect_timer_expired(now_ms) {
                self.retire(ptr);
                self.stats.fail_expired.fetch_add(1, Ordering::Relaxed);
                return None;
            }

            self.stats.success.fetch_add(1, Ordering::Relaxed);
            return Some(ptr);
        }

        if is_reconnect {
            self.stats.fail_not_found.fetch_add(1, Ordering::Relaxed);
        }

        None
    }

    /// Severs a stale session: old socket closed, state Closed, entry
    /// removed. The owning worker harvests the slot on its next tick.
    fn retire(&self, session: *mut Session) {
        let session_ref = unsafe { &*session };

        let socket = session_ref.unbind_socket();
        if !socket.is_null() {
            unsafe {
                (*socket).unbind_session();
                (*socket).close();
            }
        }

        session_ref.set_state(SessionState::Closed);
        self.deregister(session);
    }

    /// Number of registered sessions.
    pub fn active_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.used.load(Ordering::Relaxed))
            .count()
    }

    pub fn connection_counts(&self) -> ConnectionCounts {
        let mut counts = ConnectionCounts::default();

        for slot in self.slots.iter() {
            if !slot.used.load(Ordering::Acquire) {
                continue;
            }

            let session = slot.ptr.load(Ordering::Acquire);
            if session.is_null() {
                continue;
            }

            counts.total += 1;
            match unsafe { (*session).state() } {
                SessionState::Active => counts.connected += 1,
                SessionState::TempDisconnect => counts.waiting += 1,
                _ => {}
            }
        }

        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;

    fn session(id: SessionId) -> Box<Session> {
        let session = Box::new(Session::new());
        session.initialize(id, 0);
        session
    }

    fn as_ptr(session: &Session) -> *mut Session {
        session as *const Session as *mut Session
    }

    #[test]
    fn test_register_find_deregister() {
        let registry = SessionRegistry::new(8);
        let s = session(17);

        assert!(registry.register(as_ptr(&s)));
        assert_eq!(registry.active_count(), 1);
        assert_eq!(registry.find(17), Some(as_ptr(&s)));

        assert!(registry.deregister(as_ptr(&s)));
        assert_eq!(registry.find(17), None);
        assert_eq!(registry.active_count(), 0);

        // Deregistering twice is a no-op.
        assert!(!registry.deregister(as_ptr(&s)));
    }

    #[test]
    fn test_register_probes_past_collisions() {
        let registry = SessionRegistry::new(8);
        let sessions: Vec<_> = (1..=8).map(session).collect();

        for s in &sessions {
            assert!(registry.register(as_ptr(s)));
        }

        assert_eq!(registry.active_count(), 8);

        for s in &sessions {
            assert_eq!(registry.find(s.session_id()), Some(as_ptr(s)));
        }

        // Table full.
        let extra = session(9);
        assert!(!registry.register(as_ptr(&extra)));
    }

    #[test]
    fn test_find_by_usn_not_found() {
        let registry = SessionRegistry::new(8);

        assert!(registry.find_by_usn(7, 1, false, 0).is_none());
        assert_eq!(registry.reconnect_stats().snapshot().fail_not_found, 0);

        assert!(registry.find_by_usn(7, 1, true, 0).is_none());
        assert_eq!(registry.reconnect_stats().snapshot().fail_not_found, 1);
    }

    #[test]
    fn test_find_by_usn_success() {
        let registry = SessionRegistry::new(8);
        let s = session(1);
        s.set_usn(7);
        s.set_state(SessionState::Active);
        s.on_socket_disconnected(1_000);
        registry.register(as_ptr(&s));

        let token = s.reconnect_token();
        let found = registry.find_by_usn(7, token, true, 2_000);

        assert_eq!(found, Some(as_ptr(&s)));
        assert_eq!(registry.reconnect_stats().snapshot().success, 1);
        // Successful lookup leaves the entry registered for promotion.
        assert_eq!(registry.find(1), Some(as_ptr(&s)));
    }

    #[test]
    fn test_find_by_usn_invalid_state_retires_the_session() {
        let registry = SessionRegistry::new(8);
        let s = session(1);
        s.set_usn(7);
        s.set_state(SessionState::Active);
        registry.register(as_ptr(&s));

        let token = s.reconnect_token();
        let found = registry.find_by_usn(7, token, true, 2_000);

        assert!(found.is_none());
        assert_eq!(registry.reconnect_stats().snapshot().fail_invalid_state, 1);
        assert_eq!(s.state(), SessionState::Closed);
        assert_eq!(registry.find(1), None);
    }

    #[test]
    fn test_find_by_usn_token_mismatch_retires_the_session() {
        let registry = SessionRegistry::new(8);
        let s = session(1);
        s.set_usn(7);
        s.set_state(SessionState::Active);
        s.on_socket_disconnected(1_000);
        registry.register(as_ptr(&s));

        let found = registry.find_by_usn(7, 0xbad, true, 2_000);

        assert!(found.is_none());
        assert_eq!(registry.reconnect_stats().snapshot().fail_token_mismatch, 1);
        assert_eq!(s.state(), SessionState::Closed);
        assert_eq!(registry.find(1), None);
    }

    #[test]
    fn test_find_by_usn_expired_retires_the_session() {
        let registry = SessionRegistry::new(8);
        let s = session(1);
        s.set_usn(7);
        s.set_state(SessionState::Active);
        s.on_socket_disconnected(1_000);
        registry.register(as_ptr(&s));

        let token = s.reconnect_token();
        let expiry = 1_000 + crate::RECONNECT_TIMEOUT_SEC * 1000;
        let found = registry.find_by_usn(7, token, true, expiry);

        assert!(found.is_none());
        assert_eq!(registry.reconnect_stats().snapshot().fail_expired, 1);
        assert_eq!(s.state(), SessionState::Closed);
    }

    #[test]
    fn test_connection_counts() {
        let registry = SessionRegistry::new(8);

        let active = session(1);
        active.set_state(SessionState::Active);
        registry.register(as_ptr(&active));

        let waiting = session(2);
        waiting.set_state(SessionState::Active);
        waiting.on_socket_disconnected(1_000);
        registry.register(as_ptr(&waiting));

        let connecting = session(3);
        registry.register(as_ptr(&connecting));

        let counts = registry.connection_counts();

        assert_eq!(counts.total, 3);
        assert_eq!(counts.connected, 1);
        assert_eq!(counts.waiting, 1);
    }
}
