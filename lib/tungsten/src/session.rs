use crate::net::socket::Socket;
use crate::pool::{BufferPool, BufferPtr};
use crate::queue::SpscQueue;
use crate::server::Services;
use crate::{RECONNECT_TIMEOUT_SEC, SESSION_RECV_QUEUE_SIZE};
use ember::time;
use ember::{MapId, SessionId, ThreadId, Usn};
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};

static SESSION_ID_SEQUENCE: AtomicU64 = AtomicU64::new(1);
static RECONNECT_TOKEN_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Next session id. Strictly increasing within a process; never zero.
#[inline]
pub fn next_session_id() -> SessionId {
    SESSION_ID_SEQUENCE.fetch_add(1, Ordering::Relaxed)
}

/// Next resume token. Strictly increasing within a process; never zero, so
/// a zero token on the wire always means "new login".
#[inline]
pub fn next_reconnect_token() -> u64 {
    RECONNECT_TOKEN_SEQUENCE.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum SessionState {
    None = 0,
    Connecting = 1,
    Active = 2,
    TempDisconnect = 3,
    Disconnecting = 4,
    Closed = 5,
}

impl SessionState {
    #[inline]
    fn from_u8(value: u8) -> SessionState {
        match value {
            1 => SessionState::Connecting,
            2 => SessionState::Active,
            3 => SessionState::TempDisconnect,
            4 => SessionState::Disconnecting,
            5 => SessionState::Closed,
            _ => SessionState::None,
        }
    }
}

/// Logical user identity: survives the socket it is currently bound to, so a
/// dropped connection can reattach within the resume window. All fields are
/// atomic: the state machine is driven from the owning worker, but the
/// socket's I/O thread reports disconnects and other workers promote the
/// session during resume.
pub struct Session {
    session_id: AtomicU64,
    usn: AtomicU64,
    account_id: AtomicU64,
    owner: AtomicU16,
    map_id: AtomicU32,
    state: AtomicU8,
    socket: AtomicPtr<Socket>,
    reconnect_token: AtomicU64,
    token_time_ms: AtomicU64,
    disconnect_time_ms: AtomicU64,
    last_active_ms: AtomicU64,
    inbound: SpscQueue<BufferPtr>,
}

impl Session {
    pub fn new() -> Session {
        Session {
            session_id: AtomicU64::new(0),
            usn: AtomicU64::new(0),
            account_id: AtomicU64::new(0),
            owner: AtomicU16::new(0),
            map_id: AtomicU32::new(0),
            state: AtomicU8::new(SessionState::None as u8),
            socket: AtomicPtr::new(ptr::null_mut()),
            reconnect_token: AtomicU64::new(0),
            token_time_ms: AtomicU64::new(0),
            disconnect_time_ms: AtomicU64::new(0),
            last_active_ms: AtomicU64::new(0),
            inbound: SpscQueue::new(SESSION_RECV_QUEUE_SIZE),
        }
    }

    /// Brings a reclaimed slot to life: Connecting state, fresh resume
    /// token, timers reset.
    pub fn initialize(&self, session_id: SessionId, owner: ThreadId) {
        let now = time::timestamp_ms();

        self.session_id.store(session_id, Ordering::Relaxed);
        self.usn.store(0, Ordering::Relaxed);
        self.account_id.store(0, Ordering::Relaxed);
        self.owner.store(owner, Ordering::Relaxed);
        self.map_id.store(0, Ordering::Relaxed);
        self.reconnect_token
            .store(next_reconnect_token(), Ordering::Relaxed);
        self.token_time_ms.store(now, Ordering::Relaxed);
        self.disconnect_time_ms.store(0, Ordering::Relaxed);
        self.last_active_ms.store(now, Ordering::Relaxed);
        self.state
            .store(SessionState::Connecting as u8, Ordering::Release);
    }

    #[inline]
    pub fn session_id(&self) -> SessionId {
        self.session_id.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn usn(&self) -> Usn {
        self.usn.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_usn(&self, usn: Usn) {
        self.usn.store(usn, Ordering::Relaxed);
    }

    #[inline]
    pub fn account_id(&self) -> u64 {
        self.account_id.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_account_id(&self, account_id: u64) {
        self.account_id.store(account_id, Ordering::Relaxed);
    }

    #[inline]
    pub fn owner(&self) -> ThreadId {
        self.owner.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn map_id(&self) -> MapId {
        self.map_id.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_map_id(&self, map_id: MapId) {
        self.map_id.store(map_id, Ordering::Relaxed);
    }

    #[inline]
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Single state transition. Returns false when the session has moved on.
    #[inline]
    pub fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[inline]
    pub fn reconnect_token(&self) -> u64 {
        self.reconnect_token.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn validate_reconnect_token(&self, token: u64) -> bool {
        token != 0 && token == self.reconnect_token()
    }

    /// When the current resume token was minted.
    #[inline]
    pub fn token_time_ms(&self) -> u64 {
        self.token_time_ms.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn last_active_ms(&self) -> u64 {
        self.last_active_ms.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn touch(&self, now_ms: u64) {
        self.last_active_ms.store(now_ms, Ordering::Relaxed);
    }

    #[inline]
    pub fn disconnect_time_ms(&self) -> u64 {
        self.disconnect_time_ms.load(Ordering::Relaxed)
    }

    /// True once a TempDisconnect session has outlived the resume window.
    #[inline]
    pub fn is_disconnect_timer_expired(&self, now_ms: u64) -> bool {
        let disconnected = self.disconnect_time_ms();
        disconnected != 0 && now_ms.saturating_sub(disconnected) >= RECONNECT_TIMEOUT_SEC * 1000
    }

    /// Associates a socket. At most one socket may be bound at a time;
    /// binding over an existing one is refused.
    #[inline]
    pub fn bind_socket(&self, socket: *mut Socket) -> bool {
        self.socket
            .compare_exchange(
                ptr::null_mut(),
                socket,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Clears the socket binding, returning the previous one.
    #[inline]
    pub fn unbind_socket(&self) -> *mut Socket {
        self.socket.swap(ptr::null_mut(), Ordering::AcqRel)
    }

    #[inline]
    pub fn socket(&self) -> *mut Socket {
        self.socket.load(Ordering::Acquire)
    }

    /// Called from the I/O context with a freshly framed packet. Sessions
    /// that are not taking traffic hand the buffer straight back.
    pub fn on_packet_received(&self, buf: BufferPtr, pool: &BufferPool) {
        match self.state() {
            SessionState::Connecting | SessionState::Active => {}
            _ => {
                pool.release(buf);
                return;
            }
        }

        if let Err(buf) = self.inbound.push(buf) {
            // Inbound overflow drops the newest packet.
            pool.release(buf);
        }
    }

    /// Called only from the owning worker.
    #[inline]
    pub fn pop_incoming(&self) -> Option<BufferPtr> {
        self.inbound.pop()
    }

    #[inline]
    pub fn incoming_len(&self) -> usize {
        self.inbound.len()
    }

    /// Hands an outbound buffer to the bound socket. The buffer must
    /// already carry a full frame, header included. Returns false (and
    /// leaves the buffer with the caller) when no socket is bound or the
    /// socket refuses it.
    pub fn send(&self, buf: BufferPtr, services: &Services) -> bool {
        let socket = self.socket();

        if socket.is_null() {
            return false;
        }

        unsafe { (*socket).send(buf, services) }
    }

    /// Convenience form: frames `payload` under a fresh header and sends
    /// it. The pool buffer is managed internally.
    pub fn send_packet(&self, protocol_id: u16, payload: &[u8], services: &Services) -> bool {
        let size = crate::PACKET_HEADER_SIZE + payload.len();
        if size > crate::MAX_PACKET_SIZE {
            return false;
        }

        let buf = match services.pool.acquire() {
            Some(buf) => buf,
            None => return false,
        };

        {
            let data = buf.data_mut();
            data[0..2].copy_from_slice(&(size as u16).to_le_bytes());
            data[2..4].copy_from_slice(&protocol_id.to_le_bytes());
            data[crate::PACKET_HEADER_SIZE..size].copy_from_slice(payload);
        }

        buf.set_size(size);
        buf.set_tags(protocol_id, self.session_id());

        if self.send(buf, services) {
            return true;
        }

        services.pool.release(buf);
        false
    }

    /// Socket-side disconnect report, called from the I/O thread. Unbinds
    /// the socket and either opens the resume window or finishes the
    /// session off. A session that never authenticated goes straight to
    /// Closed so it cannot linger in the resume pool.
    pub fn on_socket_disconnected(&self, now_ms: u64) {
        self.unbind_socket();

        loop {
            let current = self.state();

            let next = match current {
                SessionState::Active | SessionState::TempDisconnect => SessionState::TempDisconnect,
                _ => SessionState::Closed,
            };

            if self.transition(current, next) {
                if next == SessionState::TempDisconnect {
                    self.disconnect_time_ms.store(now_ms, Ordering::Relaxed);
                }
                break;
            }
        }
    }

    /// Resume promotion: TempDisconnect back to Active. Loses to a
    /// concurrent expiry, in which case the caller falls back to a new
    /// login.
    pub fn try_promote(&self) -> bool {
        if self.transition(SessionState::TempDisconnect, SessionState::Active) {
            self.disconnect_time_ms.store(0, Ordering::Relaxed);
            return true;
        }

        false
    }

    /// Returns the slot to its dormant state, draining any queued inbound
    /// packets back to the pool.
    pub fn reset(&self, pool: &BufferPool) {
        while let Some(buf) = self.inbound.pop() {
            pool.release(buf);
        }

        self.session_id.store(0, Ordering::Relaxed);
        self.usn.store(0, Ordering::Relaxed);
        self.account_id.store(0, Ordering::Relaxed);
        self.map_id.store(0, Ordering::Relaxed);
        self.reconnect_token.store(0, Ordering::Relaxed);
        self.token_time_ms.store(0, Ordering::Relaxed);
        self.disconnect_time_ms.store(0, Ordering::Relaxed);
        self.last_active_ms.store(0, Ordering::Relaxed);
        self.socket.store(ptr::null_mut(), Ordering::Release);
        self.state.store(SessionState::None as u8, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::BufferPool;
    use ember::logging;
    use std::ptr::NonNull;

    fn dummy_socket() -> *mut Socket {
        // Bind/unbind never dereference the pointer.
        NonNull::dangling().as_ptr()
    }

    #[test]
    fn test_id_generators_are_strictly_increasing() {
        let a = next_session_id();
        let b = next_session_id();
        let c = next_session_id();

        assert!(a < b && b < c);

        let x = next_reconnect_token();
        let y = next_reconnect_token();

        assert!(x < y);
        assert!(x > 0);
    }

    #[test]
    fn test_initialize() {
        let session = Session::new();

        assert_eq!(session.state(), SessionState::None);

        session.initialize(42, 3);

        assert_eq!(session.state(), SessionState::Connecting);
        assert_eq!(session.session_id(), 42);
        assert_eq!(session.owner(), 3);
        assert_eq!(session.usn(), 0);
        assert!(session.reconnect_token() > 0);
        assert_eq!(session.disconnect_time_ms(), 0);
    }

    #[test]
    fn test_bind_socket_is_exclusive() {
        let session = Session::new();
        let socket = dummy_socket();

        assert!(session.bind_socket(socket));
        assert!(!session.bind_socket(socket));

        assert_eq!(session.unbind_socket(), socket);
        assert!(session.socket().is_null());

        assert!(session.bind_socket(socket));
    }

    #[test]
    fn test_packets_accepted_while_connecting_and_active() {
        let pool = BufferPool::new(16, &logging::discard());
        let session = Session::new();
        session.initialize(1, 0);

        let buf = pool.acquire().unwrap();
        session.on_packet_received(buf, &pool);
        assert_eq!(session.incoming_len(), 1);

        session.set_state(SessionState::Active);
        let buf = pool.acquire().unwrap();
        session.on_packet_received(buf, &pool);
        assert_eq!(session.incoming_len(), 2);

        assert_eq!(pool.used_count(), 2);

        let first = session.pop_incoming().unwrap();
        let second = session.pop_incoming().unwrap();
        pool.release(first);
        pool.release(second);
    }

    #[test]
    fn test_packets_rejected_in_other_states() {
        let pool = BufferPool::new(16, &logging::discard());
        let session = Session::new();
        session.initialize(1, 0);

        for state in [
            SessionState::TempDisconnect,
            SessionState::Disconnecting,
            SessionState::Closed,
        ]
        .iter()
        {
            session.set_state(*state);

            let buf = pool.acquire().unwrap();
            session.on_packet_received(buf, &pool);

            assert_eq!(session.incoming_len(), 0);
            assert_eq!(pool.used_count(), 0);
        }
    }

    #[test]
    fn test_inbound_overflow_drops_newest() {
        let pool = BufferPool::new(SESSION_RECV_QUEUE_SIZE * 2, &logging::discard());
        let session = Session::new();
        session.initialize(1, 0);
        session.set_state(SessionState::Active);

        for _ in 0..SESSION_RECV_QUEUE_SIZE {
            session.on_packet_received(pool.acquire().unwrap(), &pool);
        }
        assert_eq!(session.incoming_len(), SESSION_RECV_QUEUE_SIZE);

        // One past capacity goes straight back to the pool.
        session.on_packet_received(pool.acquire().unwrap(), &pool);
        assert_eq!(session.incoming_len(), SESSION_RECV_QUEUE_SIZE);
        assert_eq!(pool.used_count(), SESSION_RECV_QUEUE_SIZE);

        session.reset(&pool);
        assert_eq!(pool.used_count(), 0);
    }

    #[test]
    fn test_disconnect_from_active_opens_resume_window() {
        let session = Session::new();
        session.initialize(1, 0);
        session.set_state(SessionState::Active);
        session.bind_socket(dummy_socket());

        session.on_socket_disconnected(5_000);

        assert_eq!(session.state(), SessionState::TempDisconnect);
        assert_eq!(session.disconnect_time_ms(), 5_000);
        assert!(session.socket().is_null());
    }

    #[test]
    fn test_disconnect_while_connecting_closes() {
        let session = Session::new();
        session.initialize(1, 0);
        session.bind_socket(dummy_socket());

        session.on_socket_disconnected(5_000);

        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.disconnect_time_ms(), 0);
    }

    #[test]
    fn test_disconnect_timer() {
        let session = Session::new();
        session.initialize(1, 0);
        session.set_state(SessionState::Active);

        session.on_socket_disconnected(1_000);

        assert!(!session.is_disconnect_timer_expired(1_000));
        assert!(!session.is_disconnect_timer_expired(1_000 + RECONNECT_TIMEOUT_SEC * 1000 - 1));
        assert!(session.is_disconnect_timer_expired(1_000 + RECONNECT_TIMEOUT_SEC * 1000));
    }

    #[test]
    fn test_promote_wins_only_from_temp_disconnect() {
        let session = Session::new();
        session.initialize(1, 0);
        session.set_state(SessionState::Active);
        session.on_socket_disconnected(1_000);

        assert!(session.try_promote());
        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(session.disconnect_time_ms(), 0);

        // A second promotion has nothing to promote.
        assert!(!session.try_promote());

        session.set_state(SessionState::Closed);
        assert!(!session.try_promote());
    }

    #[test]
    fn test_token_validation() {
        let session = Session::new();
        session.initialize(1, 0);

        let token = session.reconnect_token();

        assert!(session.validate_reconnect_token(token));
        assert!(!session.validate_reconnect_token(token + 1));
        assert!(!session.validate_reconnect_token(0));
    }

    #[test]
    fn test_reset_returns_slot_to_dormant() {
        let pool = BufferPool::new(16, &logging::discard());
        let session = Session::new();
        session.initialize(9, 2);
        session.set_state(SessionState::Active);
        session.on_packet_received(pool.acquire().unwrap(), &pool);

        session.reset(&pool);

        assert_eq!(session.state(), SessionState::None);
        assert_eq!(session.session_id(), 0);
        assert_eq!(session.reconnect_token(), 0);
        assert_eq!(session.incoming_len(), 0);
        assert_eq!(pool.used_count(), 0);
    }
}
