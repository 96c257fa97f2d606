#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

//! The session runtime: packet buffer pool, lock-free queues, sockets with
//! framed receive and batched gathered sends, logical sessions with
//! reconnect/resume, and the two-tier I/O + worker thread model.

/// Largest framed packet, header included.
pub const MAX_PACKET_SIZE: usize = 2048;
/// Framed packet header: `[u16 size][u16 protocol_id]`, little-endian.
pub const PACKET_HEADER_SIZE: usize = 4;
/// Per-socket receive staging buffer.
pub const RECV_BUFFER_SIZE: usize = 8192;

/// Buffers allocated by the pool up front.
pub const BUFFER_POOL_INIT_SIZE: usize = 8192;
/// Buffers added per pool expansion page.
pub const BUFFER_POOL_EXPAND_SIZE: usize = 4096;
/// Upper bound of a thread's local buffer cache.
pub const LOCAL_CACHE_MAX: usize = 1000;
/// Buffers moved between a local cache and the global free list at a time.
pub const LOCAL_CACHE_BATCH: usize = 500;

/// Capacity of a session's inbound packet queue.
pub const SESSION_RECV_QUEUE_SIZE: usize = 512;
/// Capacity of a socket's outbound packet queue.
pub const SEND_QUEUE_CAPACITY: usize = 4096;
/// Capacity of a worker thread's command queue.
pub const WORKER_COMMAND_QUEUE_SIZE: usize = 4096;
/// Capacity of an I/O thread's command queue.
pub const IO_COMMAND_QUEUE_SIZE: usize = 8192;
/// Outbound packets drained from the send queue per gathered write.
pub const SEND_BATCH_SIZE: usize = 32;

pub const MAX_IO_THREADS: usize = 4;
pub const MAX_LOCAL_THREADS: usize = 4;
pub const MAX_SESSIONS_PER_THREAD: usize = 2500;
pub const MAX_TOTAL_SESSIONS: usize = MAX_LOCAL_THREADS * MAX_SESSIONS_PER_THREAD;
/// Socket slots may outnumber sessions: reconnecting clients briefly hold a
/// second connection while their old session is still registered.
pub const MAX_SOCKETS: usize = MAX_TOTAL_SESSIONS + 2048;

/// Recipients reached by a single broadcast.
pub const MAX_BROADCAST_TARGETS: usize = 30;
/// Window a disconnected session stays eligible for resume.
pub const RECONNECT_TIMEOUT_SEC: u64 = 10;
/// Soft period of the worker tick loop.
pub const WORKER_TICK_MS: u64 = 16;

pub mod pool;
pub mod protocol;
pub mod queue;
pub mod registry;
pub mod server;
pub mod session;
pub mod sync;

pub mod net;
pub mod thread;
