use crate::net::socket::Socket;
use crate::pool::BufferPtr;
use crate::protocol::{LoginPacket, LoginResponsePacket, PKT_LOGIN_REQ, PKT_LOGIN_RES, PKT_MOVE};
use crate::server::Services;
use crate::session::{next_session_id, Session, SessionState};
use crate::{MAX_BROADCAST_TARGETS, MAX_SESSIONS_PER_THREAD, WORKER_COMMAND_QUEUE_SIZE, WORKER_TICK_MS};
use crate::queue::MpscQueue;
use ember::logging::{self, Logger};
use ember::time;
use ember::{MapId, SessionId, ThreadId};
use rand::Rng;
use std::io::Cursor;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Work posted to a worker thread. Drained at the top of every tick.
pub enum WorkerCommand {
    /// Allocate a session for a fresh connection and start its I/O.
    CreateSession(Arc<Socket>),
    /// Tear down a session by id.
    RemoveSession(SessionId),
    /// Send a copy of the packet to this worker's matching sessions.
    Broadcast {
        map_id: MapId,
        exclude: SessionId,
        buf: BufferPtr,
    },
    /// Finish the current tick and exit.
    Shutdown,
}

pub struct WorkerStats {
    ticks: AtomicU64,
    total_tick_us: AtomicU64,
    max_tick_us: AtomicU64,
    packets_processed: AtomicU64,
    packets_sent: AtomicU64,
}

#[derive(Debug, Copy, Clone, Default)]
pub struct WorkerStatsSnapshot {
    pub ticks: u64,
    pub total_tick_us: u64,
    pub max_tick_us: u64,
    pub packets_processed: u64,
    pub packets_sent: u64,
}

impl WorkerStatsSnapshot {
    pub fn avg_tick_us(&self) -> f64 {
        if self.ticks == 0 {
            return 0.0;
        }
        self.total_tick_us as f64 / self.ticks as f64
    }
}

impl WorkerStats {
    fn new() -> WorkerStats {
        WorkerStats {
            ticks: AtomicU64::new(0),
            total_tick_us: AtomicU64::new(0),
            max_tick_us: AtomicU64::new(0),
            packets_processed: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            total_tick_us: self.total_tick_us.load(Ordering::Relaxed),
            max_tick_us: self.max_tick_us.load(Ordering::Relaxed),
            packets_processed: self.packets_processed.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
        }
    }
}

/// The cross-thread face of a worker: its command queue and load counters.
pub struct WorkerShared {
    id: ThreadId,
    commands: MpscQueue<WorkerCommand>,
    session_count: AtomicUsize,
    stats: WorkerStats,
}

impl WorkerShared {
    fn new(id: ThreadId) -> WorkerShared {
        WorkerShared {
            id,
            commands: MpscQueue::new(WORKER_COMMAND_QUEUE_SIZE),
            session_count: AtomicUsize::new(0),
            stats: WorkerStats::new(),
        }
    }

    #[inline]
    pub fn id(&self) -> ThreadId {
        self.id
    }

    #[inline]
    pub fn session_count(&self) -> usize {
        self.session_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn max_sessions(&self) -> usize {
        MAX_SESSIONS_PER_THREAD
    }

    #[inline]
    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Posts a command. The worker picks it up on its next tick. On failure
    /// ownership of any carried buffer stays with the caller.
    pub fn post(&self, command: WorkerCommand) -> bool {
        self.commands.push(command).is_ok()
    }
}

/// A logic thread owning a fixed slab of sessions.
pub struct Worker {
    shared: Arc<WorkerShared>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Worker {
    pub fn start(id: ThreadId, services: Arc<Services>, log: &Logger) -> Worker {
        let shared = Arc::new(WorkerShared::new(id));

        let thread_shared = shared.clone();
        let thread_log = log.new(logging::o!("worker" => id));

        let thread = thread::Builder::new()
            .name(format!("worker-{}", id))
            .spawn(move || WorkerLocal::new(id, thread_shared, services, thread_log).run())
            .expect("Failed to spawn worker thread");

        Worker {
            shared,
            thread: Some(thread),
        }
    }

    #[inline]
    pub fn shared(&self) -> &Arc<WorkerShared> {
        &self.shared
    }

    pub(crate) fn stop_and_join(&mut self) {
        self.shared.post(WorkerCommand::Shutdown);

        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Thread-local worker state: the session slab, its used flags and free
/// list, and the compacted array of active slots the tick iterates.
struct WorkerLocal {
    id: ThreadId,
    shared: Arc<WorkerShared>,
    services: Arc<Services>,
    sessions: Box<[Session]>,
    used: Box<[bool]>,
    free: Vec<usize>,
    active: Vec<usize>,
    log: Logger,
}

impl WorkerLocal {
    fn new(
        id: ThreadId,
        shared: Arc<WorkerShared>,
        services: Arc<Services>,
        log: Logger,
    ) -> WorkerLocal {
        let sessions = (0..MAX_SESSIONS_PER_THREAD)
            .map(|_| Session::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();

        WorkerLocal {
            id,
            shared,
            services,
            sessions,
            used: vec![false; MAX_SESSIONS_PER_THREAD].into_boxed_slice(),
            free: (0..MAX_SESSIONS_PER_THREAD).rev().collect(),
            active: Vec::with_capacity(MAX_SESSIONS_PER_THREAD),
            log,
        }
    }

    fn run(mut self) {
        logging::debug!(self.log, "worker running");

        loop {
            let tick_start = Instant::now();
            let now_ms = time::timestamp_ms();

            let shutdown = self.drain_commands();
            self.tick_sessions(now_ms);

            let elapsed = tick_start.elapsed();
            let elapsed_us = elapsed.as_micros() as u64;

            let stats = &self.shared.stats;
            stats.ticks.fetch_add(1, Ordering::Relaxed);
            stats.total_tick_us.fetch_add(elapsed_us, Ordering::Relaxed);

            let mut max = stats.max_tick_us.load(Ordering::Relaxed);
            while elapsed_us > max {
                match stats.max_tick_us.compare_exchange_weak(
                    max,
                    elapsed_us,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(current) => max = current,
                }
            }

            if shutdown {
                break;
            }

            let tick = Duration::from_millis(WORKER_TICK_MS);
            if elapsed < tick {
                thread::sleep(tick - elapsed);
            }
        }

        self.cleanup();
        logging::debug!(self.log, "worker stopped");
    }

    fn drain_commands(&mut self) -> bool {
        let mut shutdown = false;

        while let Some(command) = self.shared.commands.pop() {
            match command {
                WorkerCommand::CreateSession(socket) => self.create_session(socket),
                WorkerCommand::RemoveSession(session_id) => self.remove_by_id(session_id),
                WorkerCommand::Broadcast {
                    map_id,
                    exclude,
                    buf,
                } => self.handle_broadcast(map_id, exclude, buf),
                WorkerCommand::Shutdown => shutdown = true,
            }
        }

        shutdown
    }

    /// Allocate a slab slot, wire the session and socket together, publish
    /// the session and start reads.
    fn create_session(&mut self, socket: Arc<Socket>) {
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                logging::warn!(self.log, "session slab full, dropping connection");
                socket.discard();
                return;
            }
        };

        self.used[slot] = true;
        self.active.push(slot);
        self.shared.session_count.fetch_add(1, Ordering::Relaxed);

        let session = &self.sessions[slot];
        session.initialize(next_session_id(), self.id);

        let session_ptr = session as *const Session as *mut Session;
        let socket_ptr = Arc::as_ptr(&socket) as *mut Socket;

        socket.bind_session(session_ptr, session.session_id());
        session.bind_socket(socket_ptr);

        if !self.services.registry.register(session_ptr) {
            logging::warn!(self.log, "session registry full, dropping connection";
                           "session_id" => session.session_id());

            session.unbind_socket();
            socket.unbind_session();
            // The socket was never started, so it goes down the discard
            // path.
            socket.discard();
            session.reset(&self.services.pool);

            self.used[slot] = false;
            self.free.push(slot);
            self.active.pop();
            self.shared.session_count.fetch_sub(1, Ordering::Relaxed);
            return;
        }

        socket.start();

        logging::debug!(self.log, "session created";
                        "session_id" => session.session_id(),
                        "socket" => socket.slot());
    }

    fn remove_by_id(&mut self, session_id: SessionId) {
        let position = self
            .active
            .iter()
            .position(|&slot| self.sessions[slot].session_id() == session_id);

        if let Some(position) = position {
            self.remove_at(position);
        }
    }

    /// Tears a session down: registry entry out, socket severed, slot
    /// recycled, active array compacted by swap-with-last.
    fn remove_at(&mut self, position: usize) {
        let slot = self.active[position];

        {
            let session = &self.sessions[slot];

            logging::debug!(self.log, "session removed";
                            "session_id" => session.session_id(),
                            "state" => ?session.state());

            self.services
                .registry
                .deregister(session as *const Session as *mut Session);

            let socket = session.unbind_socket();
            if !socket.is_null() {
                unsafe {
                    (*socket).unbind_session();
                    (*socket).close();
                }
            }

            session.reset(&self.services.pool);
        }

        self.used[slot] = false;
        self.free.push(slot);
        self.active.swap_remove(position);
        self.shared.session_count.fetch_sub(1, Ordering::Relaxed);
    }

    /// One pass over the active array, in reverse so removals can swap with
    /// the already-visited tail.
    fn tick_sessions(&mut self, now_ms: u64) {
        let mut index = self.active.len();

        while index > 0 {
            index -= 1;
            let slot = self.active[index];

            match self.sessions[slot].state() {
                SessionState::Connecting | SessionState::Active => loop {
                    let buf = match self.sessions[slot].pop_incoming() {
                        Some(buf) => buf,
                        None => break,
                    };

                    self.shared
                        .stats
                        .packets_processed
                        .fetch_add(1, Ordering::Relaxed);
                    self.dispatch(slot, buf, now_ms);
                },
                SessionState::TempDisconnect => {
                    // Reaping is claimed by the Closed transition: a resume
                    // promotion on another worker can win the session
                    // between the expiry check and the removal, and a lost
                    // claim must leave the now-Active session untouched.
                    if self.sessions[slot].is_disconnect_timer_expired(now_ms)
                        && self.sessions[slot]
                            .transition(SessionState::TempDisconnect, SessionState::Closed)
                    {
                        self.remove_at(index);
                    }
                }
                _ => self.remove_at(index),
            }
        }
    }

    /// Routes one inbound packet by protocol id. Unrecognized ids fall
    /// through to the registered hooks; a hook owns the buffer it is given.
    fn dispatch(&self, slot: usize, buf: BufferPtr, now_ms: u64) {
        match buf.protocol_id() {
            PKT_MOVE => self.handle_move(slot, buf, now_ms),
            PKT_LOGIN_REQ => self.handle_login(slot, buf, now_ms),
            protocol_id => {
                if let Some(hook) = self.services.hooks.get(protocol_id) {
                    hook(&self.services, self.sessions[slot].session_id(), buf);
                } else {
                    self.services.pool.release(buf);
                }
            }
        }
    }

    fn handle_move(&self, slot: usize, buf: BufferPtr, now_ms: u64) {
        let sender = &self.sessions[slot];

        if sender.state() != SessionState::Active {
            self.services.pool.release(buf);
            return;
        }

        sender.touch(now_ms);
        self.broadcast_registry(sender.map_id(), sender.session_id(), buf);

        // The source buffer goes back exactly once, after the fan-out.
        self.services.pool.release(buf);
    }

    /// Map-wide fan-out over the registry table from a random start index,
    /// capped at MAX_BROADCAST_TARGETS recipients. Every recipient gets its
    /// own pool copy.
    fn broadcast_registry(&self, map_id: MapId, exclude: SessionId, src: BufferPtr) {
        let registry = &self.services.registry;
        let capacity = registry.capacity();
        let start = rand::thread_rng().gen_range(0..capacity);
        let mut sent = 0;

        for step in 0..capacity {
            if sent >= MAX_BROADCAST_TARGETS {
                break;
            }

            let target = match registry.slot_ptr((start + step) % capacity) {
                Some(target) => target,
                None => continue,
            };

            let target = unsafe { &*target };
            if target.session_id() == exclude
                || target.map_id() != map_id
                || target.state() != SessionState::Active
            {
                continue;
            }

            self.send_copy(target, src);
            sent += 1;
        }
    }

    /// The Broadcast command: same sweep, over this worker's own sessions.
    fn handle_broadcast(&self, map_id: MapId, exclude: SessionId, buf: BufferPtr) {
        let len = self.active.len();

        if len > 0 {
            let start = rand::thread_rng().gen_range(0..len);
            let mut sent = 0;

            for step in 0..len {
                if sent >= MAX_BROADCAST_TARGETS {
                    break;
                }

                let slot = self.active[(start + step) % len];
                let target = &self.sessions[slot];

                if target.session_id() == exclude
                    || target.map_id() != map_id
                    || target.state() != SessionState::Active
                {
                    continue;
                }

                self.send_copy(target, buf);
                sent += 1;
            }
        }

        self.services.pool.release(buf);
    }

    fn send_copy(&self, target: &Session, src: BufferPtr) {
        // Fan-out under pool exhaustion drops this recipient's copy only.
        if let Some(copy) = self.services.pool.acquire() {
            copy.copy_from(src.frame());
            copy.set_tags(src.protocol_id(), target.session_id());

            if target.send(copy, &self.services) {
                self.shared.stats.packets_sent.fetch_add(1, Ordering::Relaxed);
            } else {
                self.services.pool.release(copy);
            }
        }
    }

    /// The login state machine. A zero token is a new login; a non-zero
    /// token runs the registry's resume policy and falls back to a new
    /// login when that fails.
    ///
    /// On resume the temporary session donates its socket to the restored
    /// one. If the temporary session has already lost its socket to a
    /// disconnect, the request is silently dropped: there is nobody left to
    /// answer.
    fn handle_login(&self, slot: usize, buf: BufferPtr, now_ms: u64) {
        let request = {
            let mut frame = buf.frame();
            match LoginPacket::read(&mut frame) {
                Ok(request) => request,
                Err(err) => {
                    logging::debug!(self.log, "malformed login"; "error" => %err);
                    self.services.pool.release(buf);
                    return;
                }
            }
        };

        if request.token != 0 {
            let restored = self.services.registry.find_by_usn(
                request.usn,
                request.token,
                request.is_reconnect,
                now_ms,
            );

            if let Some(restored) = restored {
                let restored = unsafe { &*restored };
                let temp = &self.sessions[slot];

                let socket_ptr = temp.socket();
                if socket_ptr.is_null() {
                    self.services.pool.release(buf);
                    return;
                }

                if restored.try_promote() {
                    temp.unbind_socket();

                    let socket = unsafe { &*socket_ptr };
                    socket.unbind_session();
                    socket.bind_session(
                        restored as *const Session as *mut Session,
                        restored.session_id(),
                    );

                    // Only the promotion winner reaches this point, and the
                    // session unbound its socket when it entered
                    // TempDisconnect, so the slot must be free.
                    let bound = restored.bind_socket(socket_ptr);
                    debug_assert!(bound, "resumed session already had a socket bound");

                    restored.touch(now_ms);

                    logging::debug!(self.log, "session resumed";
                                    "session_id" => restored.session_id(),
                                    "usn" => restored.usn());

                    self.send_login_response(
                        restored,
                        restored.session_id(),
                        restored.reconnect_token(),
                    );

                    // The temporary session is done; the tick harvests it.
                    temp.set_state(SessionState::Disconnecting);
                    self.services.pool.release(buf);
                    return;
                }

                // Promotion lost to a concurrent expiry: new login below.
            }
        }

        let temp = &self.sessions[slot];

        temp.set_usn(request.usn);
        temp.set_account_id(request.usn);
        temp.set_map_id(1);
        temp.touch(now_ms);
        temp.transition(SessionState::Connecting, SessionState::Active);

        logging::debug!(self.log, "session logged in";
                        "session_id" => temp.session_id(),
                        "usn" => request.usn);

        self.send_login_response(temp, temp.session_id(), temp.reconnect_token());
        self.services.pool.release(buf);
    }

    fn send_login_response(&self, session: &Session, session_id: SessionId, token: u64) {
        let buf = match self.services.pool.acquire() {
            Some(buf) => buf,
            None => {
                logging::warn!(self.log, "pool exhausted, login response dropped";
                               "session_id" => session_id);
                return;
            }
        };

        let response = LoginResponsePacket {
            session_id,
            token,
            success: true,
        };

        {
            let mut cursor = Cursor::new(buf.data_mut());
            response
                .write(&mut cursor)
                .expect("Login response must fit a packet buffer");
        }

        buf.set_size(LoginResponsePacket::SIZE);
        buf.set_tags(PKT_LOGIN_RES, session.session_id());

        if session.send(buf, &self.services) {
            self.shared.stats.packets_sent.fetch_add(1, Ordering::Relaxed);
        } else {
            self.services.pool.release(buf);
        }
    }

    /// Shutdown pass: every remaining session is torn down so their buffers
    /// and registry entries are accounted for.
    fn cleanup(&mut self) {
        while !self.active.is_empty() {
            self.remove_at(self.active.len() - 1);
        }
    }
}
