//! Beam configuration constants and default values.
//!
//! This module defines the default tuning parameters for a beam and the
//! initial capacities of its internal queues. These constants control the
//! backpressure threshold, wait bounds, and allocation behavior of every
//! beam created without explicit configuration.

use std::time::Duration;

// -----------------------------------------------------------------------------
// Defaults
// -----------------------------------------------------------------------------

/// Default send-buffer capacity in bytes.
///
/// A beam blocks (or reports [`WouldBlock`]) once the memory footprint of
/// its send queue reaches this threshold. The value matches the chunk of an
/// HTTP/2 stream window a worker is expected to produce ahead of the
/// multiplexer.
///
/// A capacity of `0` disables backpressure entirely.
///
/// [`WouldBlock`]: crate::BeamError::WouldBlock
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

/// Default bound for each blocking wait on a beam.
///
/// Applies to every suspension point (send waiting for space, receive
/// waiting for data, [`wait_empty`]). A beam configured with `None` waits
/// indefinitely.
///
/// [`wait_empty`]: crate::Beam::wait_empty
pub const DEFAULT_TIMEOUT: Option<Duration> = Some(Duration::from_secs(30));

// -----------------------------------------------------------------------------
// Memory Allocation
// -----------------------------------------------------------------------------

/// Initial capacity of the send queue.
pub const CAP_SEND_QUEUE: usize = 8;

/// Initial capacity of the hold queue.
pub const CAP_HOLD_QUEUE: usize = 8;

/// Initial capacity of the receiver overflow queue.
pub const CAP_RECV_QUEUE: usize = 4;

/// Initial capacity of the live-proxy index.
pub const CAP_PROXY_INDEX: usize = 8;
