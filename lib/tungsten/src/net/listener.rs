use crate::net::socket::Socket;
use crate::server::Services;
use ember::logging::{self, Logger};
use mio::net::TcpListener;
use mio::{Interest, Registry, Token};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub(crate) const LISTENER_TOKEN: Token = Token(1);

/// Invoked once per accepted connection, with the freshly pooled socket.
/// The default handler routes the socket to the least-loaded worker.
pub type ConnectionHandler = Box<dyn Fn(&Services, Arc<Socket>) + Send + Sync>;

/// Accept throughput counters for the stats printer.
pub struct ListenerStats {
    accepts: AtomicU64,
    rejects: AtomicU64,
}

impl ListenerStats {
    fn new() -> ListenerStats {
        ListenerStats {
            accepts: AtomicU64::new(0),
            rejects: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn accept_count(&self) -> u64 {
        self.accepts.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn reject_count(&self) -> u64 {
        self.rejects.load(Ordering::Relaxed)
    }
}

/// Accepts connections on one TCP port. Owned by I/O thread 0 once adopted;
/// only the counters are shared out.
pub struct Listener {
    inner: TcpListener,
    local_addr: SocketAddr,
    stats: Arc<ListenerStats>,
    handler: ConnectionHandler,
    log: Logger,
}

impl Listener {
    pub fn bind(addr: SocketAddr, handler: ConnectionHandler, log: &Logger) -> io::Result<Listener> {
        let inner = TcpListener::bind(addr)?;
        let local_addr = inner.local_addr()?;

        Ok(Listener {
            inner,
            local_addr,
            stats: Arc::new(ListenerStats::new()),
            handler,
            log: log.new(logging::o!("module" => "listener", "port" => local_addr.port())),
        })
    }

    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[inline]
    pub fn stats(&self) -> Arc<ListenerStats> {
        self.stats.clone()
    }

    pub(crate) fn register(&mut self, registry: &Registry) -> io::Result<()> {
        registry.register(&mut self.inner, LISTENER_TOKEN, Interest::READABLE)?;
        logging::info!(self.log, "listener accepting connections");
        Ok(())
    }

    pub(crate) fn deregister(&mut self, registry: &Registry) {
        let _ = registry.deregister(&mut self.inner);
        logging::info!(self.log, "listener stopped");
    }

    /// Accepts until the backlog is drained. Each connection gets nodelay, a
    /// pooled socket and a pass through the connection handler.
    pub(crate) fn accept_ready(&mut self, services: &Services) {
        loop {
            match self.inner.accept() {
                Ok((stream, peer)) => {
                    if let Err(err) = stream.set_nodelay(true) {
                        logging::debug!(self.log, "nodelay failed"; "error" => %err);
                    }

                    self.stats.accepts.fetch_add(1, Ordering::Relaxed);

                    match services.sockets.create(stream) {
                        Some(socket) => {
                            logging::trace!(self.log, "connection accepted";
                                            "peer" => %peer,
                                            "socket" => socket.slot());
                            (self.handler)(services, socket);
                        }
                        None => {
                            // Pool saturated: the dropped stream closes the
                            // connection.
                            self.stats.rejects.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.stats.rejects.fetch_add(1, Ordering::Relaxed);
                    logging::warn!(self.log, "accept failed"; "error" => %err);
                    break;
                }
            }
        }
    }
}
