use crate::net::buffer::RecvBuffer;
use crate::pool::{BufferPool, BufferPtr};
use crate::protocol::PacketHeader;
use crate::queue::MpscQueue;
use crate::server::Services;
use crate::session::Session;
use crate::sync::RwCell;
use crate::thread::io::{IoCommand, IoHandle, SOCKET_TOKEN_BASE};
use crate::{MAX_SOCKETS, SEND_BATCH_SIZE, SEND_QUEUE_CAPACITY};
use ember::logging::{self, Logger};
use ember::time;
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use std::io;
use std::io::{IoSlice, Read, Write};
use std::net::Shutdown;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

/// Test hook: while set, the send pipeline stops draining so queues back up
/// and the backpressure close fires. Toggled from the server console.
pub static NETWORK_STALL_TEST: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum SocketState {
    None = 0,
    Connected = 1,
    Sending = 2,
    Closing = 3,
    Closed = 4,
}

impl SocketState {
    #[inline]
    fn from_u8(value: u8) -> SocketState {
        match value {
            1 => SocketState::Connected,
            2 => SocketState::Sending,
            3 => SocketState::Closing,
            4 => SocketState::Closed,
            _ => SocketState::None,
        }
    }
}

/// Mutable I/O state. Only ever touched on the socket's pinned I/O thread
/// (and during `open`, before the socket is registered anywhere); the RwCell
/// turns violations of that discipline into panics.
struct SocketIo {
    stream: Option<TcpStream>,
    recv: RecvBuffer,
    pending: Vec<BufferPtr>,
    pending_pos: usize,
    pending_offset: usize,
}

enum WriteOutcome {
    Complete,
    WouldBlock,
    Error(io::Error),
}

/// A physical connection. Lives in a pool slot for the process lifetime and
/// is recycled between connections, so the raw session and socket bindings
/// never dangle.
///
/// Sends may be issued from any thread; everything else runs on the I/O
/// thread the socket is pinned to.
pub struct Socket {
    slot: usize,
    state: AtomicU8,
    is_sending: AtomicBool,
    session: AtomicPtr<Session>,
    session_id: AtomicU64,
    send_queue: MpscQueue<BufferPtr>,
    io_home: IoHandle,
    io: RwCell<SocketIo>,
    log: Logger,
}

impl Socket {
    pub(crate) fn new(slot: usize, io_home: IoHandle, log: &Logger) -> Socket {
        Socket {
            slot,
            state: AtomicU8::new(SocketState::None as u8),
            is_sending: AtomicBool::new(false),
            session: AtomicPtr::new(ptr::null_mut()),
            session_id: AtomicU64::new(0),
            send_queue: MpscQueue::new(SEND_QUEUE_CAPACITY),
            io_home,
            io: RwCell::new(SocketIo {
                stream: None,
                recv: RecvBuffer::new(),
                pending: Vec::with_capacity(SEND_BATCH_SIZE),
                pending_pos: 0,
                pending_offset: 0,
            }),
            log: log.new(logging::o!("socket" => slot)),
        }
    }

    #[inline]
    pub fn slot(&self) -> usize {
        self.slot
    }

    #[inline]
    pub fn state(&self) -> SocketState {
        SocketState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Connected or mid-send: traffic may flow.
    #[inline]
    pub fn is_connected(&self) -> bool {
        matches!(self.state(), SocketState::Connected | SocketState::Sending)
    }

    #[inline]
    pub fn session_id(&self) -> u64 {
        self.session_id.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn queued_send_len(&self) -> usize {
        self.send_queue.len()
    }

    /// Installs a fresh connection into this (dormant) slot.
    pub(crate) fn open(&self, stream: TcpStream) {
        let mut io = self.io.write();

        io.stream = Some(stream);
        io.recv.clear();
        io.pending.clear();
        io.pending_pos = 0;
        io.pending_offset = 0;

        logging::debug!(self.log, "socket opened");
    }

    /// Moves to Connected and asks the I/O thread to begin reads. Called
    /// from the owning worker once the session is bound.
    pub fn start(&self) {
        self.state
            .store(SocketState::Connected as u8, Ordering::Release);
        self.io_home.post(IoCommand::Start(self.slot));
    }

    /// Associates the logical session. Called from the owning worker before
    /// `start`, and again on resume transfer.
    #[inline]
    pub fn bind_session(&self, session: *mut Session, session_id: u64) {
        self.session_id.store(session_id, Ordering::Relaxed);
        self.session.store(session, Ordering::Release);
    }

    #[inline]
    pub fn unbind_session(&self) {
        self.session.store(ptr::null_mut(), Ordering::Release);
        self.session_id.store(0, Ordering::Relaxed);
    }

    /// Enqueues a buffer for transmission. On success the socket owns the
    /// buffer; on failure it stays with the caller. A send queue at the
    /// monitor limit closes the socket: a consumer this far behind is not
    /// coming back.
    pub fn send(&self, buf: BufferPtr, services: &Services) -> bool {
        if !self.is_connected() {
            return false;
        }

        let limit = services.monitor.current_send_queue_limit();
        if self.send_queue.len() >= limit {
            logging::warn!(self.log, "send queue over limit, closing";
                           "queued" => self.send_queue.len(),
                           "limit" => limit);
            self.close();
            return false;
        }

        if self.send_queue.push(buf).is_err() {
            logging::warn!(self.log, "send queue full, closing";
                           "capacity" => self.send_queue.capacity());
            self.close();
            return false;
        }

        if self
            .is_sending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
            && !self.io_home.post(IoCommand::ProcessSend(self.slot))
        {
            // Command queue full: drop the claim so a later send re-arms.
            self.is_sending.store(false, Ordering::Release);
        }

        true
    }

    /// First winner of the close race. The heavy lifting happens on the I/O
    /// thread in `finish_close`.
    pub fn close(&self) {
        if self.begin_close() {
            self.io_home.post(IoCommand::FinishClose(self.slot));
        }
    }

    /// Claims the one Closing transition, from Connected or Sending only.
    /// Anything else is either not started or already on its way down.
    pub(crate) fn begin_close(&self) -> bool {
        for &from in &[SocketState::Connected, SocketState::Sending] {
            if self
                .state
                .compare_exchange(
                    from as u8,
                    SocketState::Closing as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return true;
            }
        }

        false
    }

    /// Teardown for a socket that was never started, e.g. one rejected by
    /// the router before `start`. Runs the same once-only cleanup without
    /// routing a never-connected socket through the Connected/Sending
    /// machinery that `close` is reserved for.
    pub fn discard(&self) {
        if self
            .state
            .compare_exchange(
                SocketState::None as u8,
                SocketState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            self.io_home.post(IoCommand::FinishClose(self.slot));
        }
    }

    /// The once-only teardown, on the I/O thread: every queued buffer back
    /// to the pool, monitor notified, stream shut down, bound session told.
    pub(crate) fn finish_close(&self, services: &Services, registry: &Registry) {
        {
            let mut io = self.io.write();

            for buf in io.pending.drain(..) {
                services.pool.release(buf);
            }
            io.pending_pos = 0;
            io.pending_offset = 0;

            while let Some(buf) = self.send_queue.pop() {
                services.pool.release(buf);
            }

            if let Some(mut stream) = io.stream.take() {
                let _ = registry.deregister(&mut stream);
                let _ = stream.shutdown(Shutdown::Both);
            }

            io.recv.clear();
        }

        services.monitor.on_disconnect();

        let session = self.session.swap(ptr::null_mut(), Ordering::AcqRel);
        self.session_id.store(0, Ordering::Relaxed);
        if !session.is_null() {
            unsafe { (*session).on_socket_disconnected(time::timestamp_ms()) };
        }

        self.is_sending.store(false, Ordering::Release);
        self.state.store(SocketState::Closed as u8, Ordering::Release);

        logging::debug!(self.log, "socket closed");
    }

    /// Registers the stream on the owning I/O thread's poll.
    pub(crate) fn register_io(&self, registry: &Registry) -> io::Result<()> {
        let mut io = self.io.write();

        let stream = io
            .stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "Socket has no stream"))?;

        registry.register(
            stream,
            Token(SOCKET_TOKEN_BASE + self.slot),
            Interest::READABLE | Interest::WRITABLE,
        )
    }

    /// Readable event: pull bytes until WouldBlock, framing out packets as
    /// they complete.
    pub(crate) fn handle_readable(&self, services: &Services) {
        if !self.is_connected() {
            return;
        }

        let mut disconnect = false;

        {
            let mut io = self.io.write();
            let io = &mut *io;

            loop {
                io.recv.compact();

                let stream = match io.stream.as_mut() {
                    Some(stream) => stream,
                    None => return,
                };

                match stream.read(io.recv.write_slice()) {
                    Ok(0) => {
                        disconnect = true;
                        break;
                    }
                    Ok(count) => {
                        if io.recv.commit(count).is_err() {
                            logging::warn!(self.log, "receive buffer overrun");
                            disconnect = true;
                            break;
                        }

                        if !self.drain_frames(&mut io.recv, services) {
                            disconnect = true;
                            break;
                        }
                    }
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        logging::debug!(self.log, "read failed"; "error" => %err);
                        disconnect = true;
                        break;
                    }
                }
            }
        }

        if disconnect {
            self.close();
        }
    }

    /// Frames complete packets out of the receive buffer into pool buffers
    /// and hands them to the bound session. Returns false on a malformed
    /// header, which the caller turns into a close.
    fn drain_frames(&self, recv: &mut RecvBuffer, services: &Services) -> bool {
        while let Some(header) = PacketHeader::peek(recv.read_slice()) {
            if !header.is_valid_size() {
                logging::warn!(self.log, "invalid packet size, closing";
                               "size" => header.size,
                               "protocol_id" => header.protocol_id);
                return false;
            }

            let size = header.size as usize;
            if recv.len() < size {
                break;
            }

            match services.pool.acquire() {
                Some(buf) => {
                    buf.copy_from(&recv.read_slice()[..size]);
                    buf.set_tags(header.protocol_id, self.session_id.load(Ordering::Relaxed));

                    let session = self.session.load(Ordering::Acquire);
                    if session.is_null() {
                        services.pool.release(buf);
                    } else {
                        unsafe { (*session).on_packet_received(buf, &services.pool) };
                    }
                }
                None => {
                    // Pool exhausted: this packet is dropped, the stream
                    // stays up.
                    logging::warn!(self.log, "buffer pool exhausted, dropping packet";
                                   "protocol_id" => header.protocol_id);
                }
            }

            recv.consume(size);
        }

        true
    }

    /// Writable event: resume a parked send batch.
    pub(crate) fn handle_writable(&self, services: &Services) {
        if self.is_sending.load(Ordering::Acquire) {
            self.process_send_queue(services);
        }
    }

    /// Drains the send queue in batches of gathered writes. Runs on the I/O
    /// thread; `is_sending` stays set for as long as a batch is in flight so
    /// producers do not double-schedule.
    pub(crate) fn process_send_queue(&self, services: &Services) {
        if !self.is_connected() {
            let mut io = self.io.write();

            for buf in io.pending.drain(..) {
                services.pool.release(buf);
            }
            io.pending_pos = 0;
            io.pending_offset = 0;

            while let Some(buf) = self.send_queue.pop() {
                services.pool.release(buf);
            }

            drop(io);
            self.is_sending.store(false, Ordering::Release);
            return;
        }

        if NETWORK_STALL_TEST.load(Ordering::Relaxed) {
            // Stall simulation: leave is_sending set and let the queue grow.
            return;
        }

        let _ = self.state.compare_exchange(
            SocketState::Connected as u8,
            SocketState::Sending as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );

        let mut write_error = None;

        {
            let mut io = self.io.write();
            let io = &mut *io;

            loop {
                if io.pending.is_empty() {
                    io.pending_pos = 0;
                    io.pending_offset = 0;

                    if self.send_queue.pop_batch(&mut io.pending, SEND_BATCH_SIZE) == 0 {
                        self.is_sending.store(false, Ordering::Release);

                        // A producer may have slipped in between the empty
                        // pop and the flag clear: re-arm instead of losing
                        // the wakeup.
                        if !self.send_queue.is_empty()
                            && self
                                .is_sending
                                .compare_exchange(
                                    false,
                                    true,
                                    Ordering::AcqRel,
                                    Ordering::Acquire,
                                )
                                .is_ok()
                        {
                            continue;
                        }

                        break;
                    }
                }

                match Self::do_write(io) {
                    WriteOutcome::Complete => {
                        for buf in io.pending.drain(..) {
                            services.pool.release(buf);
                        }
                        io.pending_pos = 0;
                        io.pending_offset = 0;
                    }
                    WriteOutcome::WouldBlock => {
                        // The writable edge resumes the batch; is_sending
                        // stays set.
                        break;
                    }
                    WriteOutcome::Error(err) => {
                        for buf in io.pending.drain(..) {
                            services.pool.release(buf);
                        }
                        write_error = Some(err);
                        break;
                    }
                }
            }
        }

        let _ = self.state.compare_exchange(
            SocketState::Sending as u8,
            SocketState::Connected as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );

        if let Some(err) = write_error {
            logging::debug!(self.log, "write failed"; "error" => %err);
            self.is_sending.store(false, Ordering::Release);
            self.close();
        }
    }

    /// One gathered write over the pending batch, resuming from wherever the
    /// previous attempt stopped.
    fn do_write(io: &mut SocketIo) -> WriteOutcome {
        loop {
            if io.pending_pos >= io.pending.len() {
                return WriteOutcome::Complete;
            }

            let stream = match io.stream.as_mut() {
                Some(stream) => stream,
                None => {
                    return WriteOutcome::Error(io::Error::new(
                        io::ErrorKind::NotConnected,
                        "Socket has no stream",
                    ))
                }
            };

            let result = {
                let mut slices: Vec<IoSlice> =
                    Vec::with_capacity(io.pending.len() - io.pending_pos);

                for (index, buf) in io.pending.iter().enumerate().skip(io.pending_pos) {
                    let frame = buf.frame();
                    if index == io.pending_pos {
                        slices.push(IoSlice::new(&frame[io.pending_offset..]));
                    } else {
                        slices.push(IoSlice::new(frame));
                    }
                }

                stream.write_vectored(&slices)
            };

            match result {
                Ok(0) => return WriteOutcome::Error(io::ErrorKind::WriteZero.into()),
                Ok(mut count) => {
                    while count > 0 {
                        let remaining = io.pending[io.pending_pos].size() - io.pending_offset;

                        if count >= remaining {
                            count -= remaining;
                            io.pending_pos += 1;
                            io.pending_offset = 0;

                            if io.pending_pos == io.pending.len() {
                                return WriteOutcome::Complete;
                            }
                        } else {
                            io.pending_offset += count;
                            count = 0;
                        }
                    }
                    // Partial write: go around again.
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return WriteOutcome::WouldBlock
                }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return WriteOutcome::Error(err),
            }
        }
    }

    /// Returns a Closed slot to its dormant state before reuse.
    pub(crate) fn reset_for_reuse(&self, pool: &BufferPool) {
        while let Some(buf) = self.send_queue.pop() {
            pool.release(buf);
        }

        self.session.store(ptr::null_mut(), Ordering::Release);
        self.session_id.store(0, Ordering::Relaxed);
        self.is_sending.store(false, Ordering::Release);
        self.state.store(SocketState::None as u8, Ordering::Release);
    }
}

/// Slab of pooled sockets. Slots are created on demand up to `MAX_SOCKETS`,
/// recycled through a free list, and never deallocated, which keeps every
/// raw socket pointer in the system valid for the process lifetime.
pub struct SocketPool {
    slots: Mutex<Vec<Arc<Socket>>>,
    free: Mutex<Vec<usize>>,
    io_handles: Vec<IoHandle>,
    log: Logger,
}

impl SocketPool {
    pub fn new(io_handles: Vec<IoHandle>, log: &Logger) -> SocketPool {
        SocketPool {
            slots: Mutex::new(Vec::new()),
            free: Mutex::new(Vec::new()),
            io_handles,
            log: log.new(logging::o!("module" => "socket_pool")),
        }
    }

    /// Wraps an accepted stream in a pooled socket pinned to an I/O thread.
    /// Returns `None` (dropping the stream) when the pool is saturated.
    pub fn create(&self, stream: TcpStream) -> Option<Arc<Socket>> {
        if self.io_handles.is_empty() {
            return None;
        }

        let reused = self.free.lock().expect("Socket free list poisoned").pop();

        let socket = match reused {
            Some(slot) => self.slots.lock().expect("Socket slots poisoned")[slot].clone(),
            None => {
                let mut slots = self.slots.lock().expect("Socket slots poisoned");

                if slots.len() >= MAX_SOCKETS {
                    logging::warn!(self.log, "socket pool saturated, dropping connection";
                                   "slots" => slots.len());
                    return None;
                }

                let slot = slots.len();
                let io_home = self.io_handles[slot % self.io_handles.len()].clone();
                let socket = Arc::new(Socket::new(slot, io_home, &self.log));
                slots.push(socket.clone());
                socket
            }
        };

        socket.open(stream);
        Some(socket)
    }

    pub fn get(&self, slot: usize) -> Option<Arc<Socket>> {
        self.slots
            .lock()
            .expect("Socket slots poisoned")
            .get(slot)
            .cloned()
    }

    /// Returns a closed socket's slot to the free list.
    pub(crate) fn recycle(&self, slot: usize, pool: &BufferPool) {
        let socket = match self.get(slot) {
            Some(socket) => socket,
            None => return,
        };

        socket.reset_for_reuse(pool);
        self.free.lock().expect("Socket free list poisoned").push(slot);
    }

    /// Total slots ever created.
    pub fn slot_count(&self) -> usize {
        self.slots.lock().expect("Socket slots poisoned").len()
    }
}
