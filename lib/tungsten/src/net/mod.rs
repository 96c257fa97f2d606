//! The networking modules handle the physical side of a connection: receive
//! framing, the per-socket send pipeline, accepting, and the adaptive
//! backpressure monitor.

pub mod buffer;
pub mod listener;
pub mod monitor;
pub mod socket;
