use bitflags::bitflags;
use hashbrown::HashSet;
use parking_lot::Condvar;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc as StdArc;
use std::time::Duration;

use crate::beam::Endpoint;
use crate::chunk::Chunk;
use crate::chunk::CustomMeta;
use crate::chunk::RecvChunk;
use crate::consts::CAP_HOLD_QUEUE;
use crate::consts::CAP_PROXY_INDEX;
use crate::consts::CAP_RECV_QUEUE;
use crate::consts::CAP_SEND_QUEUE;

// -----------------------------------------------------------------------------
// Hooks
// -----------------------------------------------------------------------------

/// Notification hook carrying no arguments.
pub type EventHook = StdArc<dyn Fn() + Send + Sync>;

/// Consumption hook carrying the number of bytes consumed since the last
/// report.
pub type IoHook = StdArc<dyn Fn(u64) + Send + Sync>;

/// Translator hook for [`Custom`] markers the beam cannot translate
/// natively. The first hook returning chunks wins.
///
/// [`Custom`]: crate::Chunk::Custom
pub type Beamer = StdArc<dyn Fn(&dyn CustomMeta) -> Option<Vec<RecvChunk>> + Send + Sync>;

/// Single-slot hook registry. Hooks are never invoked while the beam's
/// mutex is held.
#[derive(Default)]
pub(crate) struct Hooks {
  pub(crate) cons_io: Option<IoHook>,
  pub(crate) cons_ev: Option<EventHook>,
  pub(crate) was_empty: Option<EventHook>,
  pub(crate) send_block: Option<EventHook>,
  pub(crate) beamers: Vec<Beamer>,
}

// -----------------------------------------------------------------------------
// Beam Flags
// -----------------------------------------------------------------------------

bitflags! {
  #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
  pub(crate) struct BeamFlags: u8 {
    const CLOSED     = 1 << 0;
    const ABORTED    = 1 << 1;
    const CLOSE_SENT = 1 << 2;
    const TORN_DOWN  = 1 << 3;
  }
}

// -----------------------------------------------------------------------------
// Hold Entry
// -----------------------------------------------------------------------------

/// A sender chunk whose ownership the receiver has borrowed.
///
/// `seq` is present when a proxy was minted over the chunk; metadata,
/// zero-length, and re-homed file/mmap chunks ride in the hold without one.
pub(crate) struct HoldEntry {
  pub(crate) seq: Option<u64>,
  pub(crate) chunk: Chunk,
}

// -----------------------------------------------------------------------------
// State
// -----------------------------------------------------------------------------

/// Everything the beam mutex guards.
pub(crate) struct State {
  pub(crate) send: VecDeque<Chunk>,
  pub(crate) hold: VecDeque<HoldEntry>,
  pub(crate) purge: VecDeque<Chunk>,
  pub(crate) recv: VecDeque<RecvChunk>,
  pub(crate) proxies: HashSet<u64>,
  pub(crate) max_buf_size: usize,
  pub(crate) timeout: Option<Duration>,
  pub(crate) copy_files: bool,
  pub(crate) tx_mem_limits: bool,
  pub(crate) sent_bytes: u64,
  pub(crate) received_bytes: u64,
  pub(crate) cons_bytes_reported: u64,
  pub(crate) buckets_sent: u64,
  pub(crate) flags: BeamFlags,
  pub(crate) hooks: Hooks,
}

impl State {
  pub(crate) fn new(max_buf_size: usize, timeout: Option<Duration>) -> Self {
    Self {
      send: VecDeque::with_capacity(CAP_SEND_QUEUE),
      hold: VecDeque::with_capacity(CAP_HOLD_QUEUE),
      purge: VecDeque::new(),
      recv: VecDeque::with_capacity(CAP_RECV_QUEUE),
      proxies: HashSet::with_capacity(CAP_PROXY_INDEX),
      max_buf_size,
      timeout,
      copy_files: false,
      tx_mem_limits: true,
      sent_bytes: 0,
      received_bytes: 0,
      cons_bytes_reported: 0,
      buckets_sent: 0,
      flags: BeamFlags::default(),
      hooks: Hooks::default(),
    }
  }

  /// Total payload length queued in `send`.
  pub(crate) fn buffered_data_len(&self) -> usize {
    self.send.iter().map(Chunk::len).sum()
  }

  /// Memory footprint of `send` counted against `max_buf_size`.
  ///
  /// Borrowed file and mmap windows are pinned at zero cost.
  pub(crate) fn occupied(&self) -> usize {
    self.send.iter().map(Chunk::space_cost).sum()
  }

  /// Memory held by `send` chunks themselves.
  pub(crate) fn mem_used(&self) -> usize {
    self.send.iter().map(Chunk::mem_used).sum()
  }

  /// Remaining space before the beam exerts backpressure.
  ///
  /// `max_buf_size == 0` means unbounded.
  pub(crate) fn space_left(&self) -> usize {
    if self.max_buf_size == 0 {
      return usize::MAX;
    }

    self.max_buf_size.saturating_sub(self.occupied())
  }

  /// `true` when neither queued nor overflowed chunks remain observable.
  pub(crate) fn is_empty(&self) -> bool {
    self.send.is_empty() && self.recv.is_empty()
  }
}

// -----------------------------------------------------------------------------
// Shared
// -----------------------------------------------------------------------------

/// The reference-counted beam core, shared between the owning handle and
/// every outstanding proxy.
pub(crate) struct Shared {
  pub(crate) name: String,
  pub(crate) from: Endpoint,
  pub(crate) state: Mutex<State>,
  pub(crate) change: Condvar,
}
