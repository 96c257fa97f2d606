use crate::net::listener::{Listener, LISTENER_TOKEN};
use crate::queue::MpscQueue;
use crate::server::Services;
use crate::{IO_COMMAND_QUEUE_SIZE, MAX_IO_THREADS};
use ember::logging::{self, Logger};
use indexmap::IndexMap;
use mio::{Events, Poll, Token, Waker};
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub(crate) const WAKER_TOKEN: Token = Token(0);
pub(crate) const SOCKET_TOKEN_BASE: usize = 2;

/// Work posted to a specific I/O thread. Everything that touches a socket's
/// I/O state arrives here, which is what serializes the socket.
pub enum IoCommand {
    /// Hand the listener to this thread (thread 0 by convention).
    AdoptListener(Box<Listener>),
    /// Stop accepting and drop the listener.
    DropListener,
    /// Register a started socket and kick off its first read.
    Start(usize),
    /// Drain a socket's send queue.
    ProcessSend(usize),
    /// Run the once-only close teardown for a socket.
    FinishClose(usize),
    /// Exit the poll loop.
    Shutdown,
}

struct IoShared {
    commands: MpscQueue<IoCommand>,
    waker: Waker,
    index: usize,
}

/// Cheap address of one I/O thread: post a command, wake the poll.
#[derive(Clone)]
pub struct IoHandle {
    shared: Arc<IoShared>,
}

impl IoHandle {
    fn new(waker: Waker, index: usize) -> IoHandle {
        IoHandle {
            shared: Arc::new(IoShared {
                commands: MpscQueue::new(IO_COMMAND_QUEUE_SIZE),
                waker,
                index,
            }),
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests(waker: Waker) -> IoHandle {
        IoHandle::new(waker, 0)
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.shared.index
    }

    /// Posts a command and wakes the thread. Returns false when the command
    /// queue is full.
    pub fn post(&self, command: IoCommand) -> bool {
        if self.shared.commands.push(command).is_err() {
            return false;
        }

        let _ = self.shared.waker.wake();
        true
    }

    /// Consumer side; only the owning I/O thread calls this.
    fn pop_command(&self) -> Option<IoCommand> {
        self.shared.commands.pop()
    }
}

pub(crate) struct IoCore {
    index: usize,
    poll: Poll,
}

/// The I/O thread fleet. Sockets are pinned to a thread at creation; each
/// thread runs a poll loop over its sockets plus a waker-driven command
/// queue.
pub struct IoThreadPool {
    handles: Vec<IoHandle>,
    threads: Vec<thread::JoinHandle<()>>,
}

impl IoThreadPool {
    /// Builds the polls, wakers and command queues without starting any
    /// threads, so the handles can be wired into the services first.
    pub(crate) fn prepare(count: usize) -> io::Result<(Vec<IoCore>, Vec<IoHandle>)> {
        debug_assert!(count >= 1 && count <= MAX_IO_THREADS);

        let mut cores = Vec::with_capacity(count);
        let mut handles = Vec::with_capacity(count);

        for index in 0..count {
            let poll = Poll::new()?;
            let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;

            cores.push(IoCore { index, poll });
            handles.push(IoHandle::new(waker, index));
        }

        Ok((cores, handles))
    }

    pub(crate) fn spawn(
        cores: Vec<IoCore>,
        handles: &[IoHandle],
        services: Arc<Services>,
        log: &Logger,
    ) -> IoThreadPool {
        let mut threads = Vec::with_capacity(cores.len());

        for core in cores {
            let handle = handles[core.index].clone();
            let services = services.clone();
            let thread_log = log.new(logging::o!("io_thread" => core.index));

            let join = thread::Builder::new()
                .name(format!("io-{}", core.index))
                .spawn(move || io_loop(core, handle, services, thread_log))
                .expect("Failed to spawn I/O thread");

            threads.push(join);
        }

        IoThreadPool {
            handles: handles.to_vec(),
            threads,
        }
    }

    #[inline]
    pub fn handle(&self, index: usize) -> &IoHandle {
        &self.handles[index]
    }

    #[inline]
    pub fn thread_count(&self) -> usize {
        self.handles.len()
    }

    /// Stops every thread. Commands already queued (socket closes from the
    /// workers) are drained before the Shutdown is reached.
    pub fn shutdown(&mut self) {
        for handle in &self.handles {
            handle.post(IoCommand::Shutdown);
        }

        for join in self.threads.drain(..) {
            let _ = join.join();
        }
    }
}

fn io_loop(mut core: IoCore, handle: IoHandle, services: Arc<Services>, log: Logger) {
    let mut events = Events::with_capacity(8192);
    let mut live: IndexMap<usize, Arc<crate::net::socket::Socket>> = IndexMap::new();
    let mut listener: Option<Listener> = None;
    let mut running = true;

    logging::debug!(log, "I/O thread running");

    while running {
        if let Err(err) = core.poll.poll(&mut events, Some(Duration::from_millis(100))) {
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            logging::error!(log, "poll failed"; "error" => %err);
            break;
        }

        for event in events.iter() {
            match event.token() {
                WAKER_TOKEN => {}
                LISTENER_TOKEN => {
                    if let Some(listener) = listener.as_mut() {
                        listener.accept_ready(&services);
                    }
                }
                token => {
                    let slot = token.0 - SOCKET_TOKEN_BASE;

                    if let Some(socket) = live.get(&slot).cloned() {
                        if event.is_readable() {
                            socket.handle_readable(&services);
                        }
                        if event.is_writable() {
                            socket.handle_writable(&services);
                        }
                    }
                }
            }
        }

        while let Some(command) = handle.pop_command() {
            match command {
                IoCommand::AdoptListener(mut boxed) => {
                    match boxed.register(core.poll.registry()) {
                        Ok(()) => {
                            boxed.accept_ready(&services);
                            listener = Some(*boxed);
                        }
                        Err(err) => {
                            logging::error!(log, "listener registration failed"; "error" => %err)
                        }
                    }
                }
                IoCommand::DropListener => {
                    if let Some(mut listener) = listener.take() {
                        listener.deregister(core.poll.registry());
                    }
                }
                IoCommand::Start(slot) => {
                    if let Some(socket) = services.sockets.get(slot) {
                        match socket.register_io(core.poll.registry()) {
                            Ok(()) => {
                                live.insert(slot, socket.clone());
                                // Bytes that arrived before registration are
                                // reported as an initial edge; reading now
                                // covers platforms that miss it.
                                socket.handle_readable(&services);
                            }
                            Err(err) => {
                                logging::warn!(log, "socket registration failed";
                                               "socket" => slot,
                                               "error" => %err);
                                socket.close();
                            }
                        }
                    }
                }
                IoCommand::ProcessSend(slot) => {
                    if let Some(socket) = services.sockets.get(slot) {
                        socket.process_send_queue(&services);
                    }
                }
                IoCommand::FinishClose(slot) => {
                    if let Some(socket) = services.sockets.get(slot) {
                        socket.finish_close(&services, core.poll.registry());
                        live.swap_remove(&slot);
                        services.sockets.recycle(slot, &services.pool);
                    }
                }
                IoCommand::Shutdown => running = false,
            }
        }
    }

    // Pending async work ends here: every live socket is torn down before
    // the thread exits.
    for (slot, socket) in live.iter() {
        if socket.begin_close() {
            socket.finish_close(&services, core.poll.registry());
            services.sockets.recycle(*slot, &services.pool);
        }
    }

    drop(listener);
    logging::debug!(log, "I/O thread stopped");
}
