use crate::net::listener::{ConnectionHandler, Listener, ListenerStats};
use crate::net::monitor::NetworkMonitor;
use crate::net::socket::SocketPool;
use crate::pool::{BufferPool, BufferPtr};
use crate::registry::SessionRegistry;
use crate::thread::io::{IoCommand, IoHandle, IoThreadPool};
use crate::thread::manager::{route_connection, ThreadManager};
use crate::thread::worker::Worker;
use crate::{BUFFER_POOL_INIT_SIZE, MAX_IO_THREADS, MAX_LOCAL_THREADS, MAX_TOTAL_SESSIONS};
use ember::logging::{self, Logger};
use ember::{SessionId, ThreadId};
use hashbrown::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

/// An application handler for one protocol id. The hook owns the buffer it
/// is handed and must release it to the pool when done. The built-in move
/// and login handlers take precedence over hooks on their ids.
pub type PacketHook = Box<dyn Fn(&Services, SessionId, BufferPtr) + Send + Sync>;

/// Dispatch table keyed by protocol id, fixed once the server starts.
pub struct DispatchHooks {
    table: HashMap<u16, PacketHook>,
}

impl DispatchHooks {
    pub fn new() -> DispatchHooks {
        DispatchHooks {
            table: HashMap::new(),
        }
    }

    /// Registers a hook, replacing any previous one on the same id.
    pub fn register(&mut self, protocol_id: u16, hook: PacketHook) {
        self.table.insert(protocol_id, hook);
    }

    #[inline]
    pub fn get(&self, protocol_id: u16) -> Option<&PacketHook> {
        self.table.get(&protocol_id)
    }
}

/// The explicitly constructed service set everything runs against: buffer
/// pool, socket pool, session registry, backpressure monitor and dispatch
/// hooks. Tests build private copies.
pub struct Services {
    pub pool: BufferPool,
    pub sockets: SocketPool,
    pub registry: SessionRegistry,
    pub monitor: NetworkMonitor,
    pub hooks: DispatchHooks,
    pub log: Logger,
}

impl Services {
    pub fn new(
        pool_init: usize,
        hooks: DispatchHooks,
        io_handles: Vec<IoHandle>,
        log: &Logger,
    ) -> Services {
        Services {
            pool: BufferPool::new(pool_init, log),
            sockets: SocketPool::new(io_handles, log),
            registry: SessionRegistry::new(MAX_TOTAL_SESSIONS),
            monitor: NetworkMonitor::new(log),
            hooks,
            log: log.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub addr: SocketAddr,
    pub io_threads: usize,
    pub local_threads: usize,
    pub pool_init: usize,
}

impl Default for ServerOptions {
    fn default() -> ServerOptions {
        ServerOptions {
            addr: "0.0.0.0:9000".parse().expect("Default address must parse"),
            io_threads: 2,
            local_threads: MAX_LOCAL_THREADS,
            pool_init: BUFFER_POOL_INIT_SIZE,
        }
    }
}

/// The assembled session runtime: services, thread fleet and listener.
pub struct Server {
    services: Arc<Services>,
    manager: ThreadManager,
    listener_stats: Arc<ListenerStats>,
    local_addr: SocketAddr,
    stopped: bool,
}

impl Server {
    /// Brings the whole runtime up: I/O threads, workers, then the
    /// listener, which is adopted by I/O thread 0. The returned server is
    /// already accepting.
    pub fn start(
        options: ServerOptions,
        hooks: DispatchHooks,
        log: &Logger,
    ) -> io::Result<Server> {
        let io_threads = if options.io_threads == 0 || options.io_threads > MAX_IO_THREADS {
            2
        } else {
            options.io_threads
        };

        let local_threads =
            if options.local_threads == 0 || options.local_threads > MAX_LOCAL_THREADS {
                MAX_LOCAL_THREADS
            } else {
                options.local_threads
            };

        let (cores, handles) = IoThreadPool::prepare(io_threads)?;

        let services = Arc::new(Services::new(
            options.pool_init,
            hooks,
            handles.clone(),
            log,
        ));

        let io_pool = IoThreadPool::spawn(cores, &handles, services.clone(), log);

        let workers = (0..local_threads)
            .map(|id| Worker::start(id as ThreadId, services.clone(), log))
            .collect::<Vec<_>>();

        let manager = ThreadManager::new(io_pool, workers, log);

        // The default connection handler: least-loaded routing, reject by
        // closing when the workers are saturated.
        let handler_workers = manager.worker_shareds();
        let handler_log = log.new(logging::o!("module" => "connection_handler"));
        let handler: ConnectionHandler = Box::new(move |_services, socket| {
            if !route_connection(&handler_workers, socket.clone()) {
                logging::warn!(handler_log, "connection rejected, server full";
                               "socket" => socket.slot());
                // Never started: the discard path tears it down.
                socket.discard();
            }
        });

        let listener = Listener::bind(options.addr, handler, log)?;
        let local_addr = listener.local_addr();
        let listener_stats = listener.stats();

        manager
            .io()
            .handle(0)
            .post(IoCommand::AdoptListener(Box::new(listener)));

        logging::info!(log, "server started";
                       "addr" => %local_addr,
                       "io_threads" => io_threads,
                       "local_threads" => local_threads);

        Ok(Server {
            services,
            manager,
            listener_stats,
            local_addr,
            stopped: false,
        })
    }

    #[inline]
    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    #[inline]
    pub fn manager(&self) -> &ThreadManager {
        &self.manager
    }

    #[inline]
    pub fn listener_stats(&self) -> &Arc<ListenerStats> {
        &self.listener_stats
    }

    /// The bound address; useful when the options asked for port 0.
    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Ordered shutdown: listener first, then workers, then I/O threads.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        self.manager.io().handle(0).post(IoCommand::DropListener);
        self.manager.shutdown();

        logging::info!(self.services.log, "server stopped");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}
