use crate::net::socket::Socket;
use crate::protocol::PacketHeader;
use crate::server::Services;
use crate::thread::io::IoThreadPool;
use crate::thread::worker::{Worker, WorkerCommand, WorkerShared};
use ember::logging::{self, Logger};
use ember::{MapId, SessionId};
use std::sync::Arc;

/// Routes a new connection to the least-loaded worker. Returns false (the
/// caller destroys the socket) when every worker is saturated or the
/// worker's command queue refuses the hand-off.
pub fn route_connection(workers: &[Arc<WorkerShared>], socket: Arc<Socket>) -> bool {
    let target = workers
        .iter()
        .min_by_key(|worker| worker.session_count());

    let target = match target {
        Some(target) => target,
        None => return false,
    };

    if target.session_count() >= target.max_sessions() {
        return false;
    }

    target.post(WorkerCommand::CreateSession(socket))
}

/// Owns the static thread fleet: the I/O pool and the workers. No threads
/// are created after start-up.
pub struct ThreadManager {
    io: IoThreadPool,
    workers: Vec<Worker>,
    log: Logger,
}

impl ThreadManager {
    pub(crate) fn new(io: IoThreadPool, workers: Vec<Worker>, log: &Logger) -> ThreadManager {
        ThreadManager {
            io,
            workers,
            log: log.new(logging::o!("module" => "thread_manager")),
        }
    }

    #[inline]
    pub fn io(&self) -> &IoThreadPool {
        &self.io
    }

    #[inline]
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn worker_shareds(&self) -> Vec<Arc<WorkerShared>> {
        self.workers
            .iter()
            .map(|worker| worker.shared().clone())
            .collect()
    }

    pub fn total_sessions(&self) -> usize {
        self.workers
            .iter()
            .map(|worker| worker.shared().session_count())
            .sum()
    }

    /// Least-loaded routing; see `route_connection`.
    pub fn route_new_connection(&self, socket: Arc<Socket>) -> bool {
        let shareds = self.worker_shareds();
        let routed = route_connection(&shareds, socket);

        if !routed {
            logging::warn!(self.log, "connection rejected, workers saturated";
                           "sessions" => self.total_sessions());
        }

        routed
    }

    /// Posts a Broadcast command to every worker, each with its own pool
    /// copy of the frame.
    pub fn broadcast_to_all(
        &self,
        services: &Services,
        map_id: MapId,
        exclude: SessionId,
        frame: &[u8],
    ) -> bool {
        let header = match PacketHeader::peek(frame) {
            Some(header) => header,
            None => return false,
        };

        let mut all_posted = true;

        for worker in &self.workers {
            let buf = match services.pool.acquire() {
                Some(buf) => buf,
                None => {
                    all_posted = false;
                    continue;
                }
            };

            buf.copy_from(frame);
            buf.set_tags(header.protocol_id, 0);

            let posted = worker.shared().post(WorkerCommand::Broadcast {
                map_id,
                exclude,
                buf,
            });

            if !posted {
                services.pool.release(buf);
                all_posted = false;
            }
        }

        all_posted
    }

    /// Workers first (they close their sockets through the I/O threads),
    /// then the I/O pool drains those closes and exits.
    pub fn shutdown(&mut self) {
        logging::info!(self.log, "shutting down thread fleet");

        for worker in &mut self.workers {
            worker.stop_and_join();
        }
        self.workers.clear();

        self.io.shutdown();
    }
}
