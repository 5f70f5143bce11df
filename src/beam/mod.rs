use parking_lot::Condvar;
use parking_lot::Mutex;
use parking_lot::MutexGuard;
use std::collections::VecDeque;
use std::fmt::Debug;
use std::fmt::Display;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::mem;
use std::num::NonZeroU64;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use triomphe::Arc;

mod proxy;
mod recv;
mod send;
mod state;

pub use self::proxy::ProxyChunk;
pub use self::state::Beamer;
pub use self::state::EventHook;
pub use self::state::IoHook;

use self::state::BeamFlags;
use self::state::HoldEntry;
use self::state::Shared;
use self::state::State;
use crate::chunk::Chunk;
use crate::chunk::RecvChunk;
use crate::chunk::SendQueue;
use crate::error::BeamError;

// -----------------------------------------------------------------------------
// Endpoint
// -----------------------------------------------------------------------------

/// Opaque identity of one side of a beam.
///
/// A beam remembers the sender's identity at creation; role-checked calls
/// compare the caller against it. The identity carries no other meaning.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
#[repr(transparent)]
pub struct Endpoint {
  inner: NonZeroU64,
}

impl Endpoint {
  /// Returns a process-unique endpoint identity.
  #[inline]
  pub fn next() -> Self {
    static ID: AtomicU64 = AtomicU64::new(0);

    Self {
      inner: NonZeroU64::MIN.saturating_add(ID.fetch_add(1, Ordering::Relaxed)),
    }
  }

  /// Returns this `Endpoint` as a numeric identifier.
  #[inline]
  pub fn as_u64(&self) -> NonZeroU64 {
    self.inner
  }
}

impl Display for Endpoint {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    write!(f, "ep-{}", self.inner)
  }
}

// -----------------------------------------------------------------------------
// Block
// -----------------------------------------------------------------------------

/// Blocking mode of a send, receive, or wait call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Block {
  /// Suspend until progress is possible, bounded by the beam's timeout.
  Blocking,
  /// Fail with [`WouldBlock`] instead of suspending.
  ///
  /// [`WouldBlock`]: BeamError::WouldBlock
  Nonblocking,
}

// -----------------------------------------------------------------------------
// Beam
// -----------------------------------------------------------------------------

/// A bounded single-producer single-consumer chunk conduit.
///
/// The sender admits an ordered sequence of data and metadata chunks; the
/// receiver pulls them from another thread. Internally the beam keeps the
/// admitted chunks (`send`), the chunks the receiver has borrowed (`hold`),
/// the chunks ready to die on the sender thread (`purge`), and the
/// receiver's overflow from a previous pull (`recv`), all serialized by a
/// single mutex with one condition for every waiter.
///
/// The `Beam` value is the sender's owning handle. Dropping it tears the
/// beam down; outstanding [`ProxyChunk`]s keep the shared core alive and
/// degrade gracefully (reads report connection-reset, drops release
/// nothing).
///
/// Chunk destruction is thread-disciplined: sender-owned chunks are only
/// ever destroyed on the sender thread, and no user hook runs while the
/// beam's mutex is held.
pub struct Beam {
  shared: Arc<Shared>,
}

impl Beam {
  /// Creates a beam owned by the `from` endpoint.
  ///
  /// `max_buf_size == 0` disables backpressure; `timeout` bounds each
  /// blocking wait (`None` waits indefinitely). `id` and `tag` only name
  /// the beam in logs.
  pub fn new(
    from: Endpoint,
    id: u32,
    tag: &str,
    max_buf_size: usize,
    timeout: Option<Duration>,
  ) -> Self {
    let name: String = format!("{id}-{tag}");

    tracing::trace!(beam = %name, %from, max_buf_size, "created");

    Self {
      shared: Arc::new(Shared {
        name,
        from,
        state: Mutex::new(State::new(max_buf_size, timeout)),
        change: Condvar::new(),
      }),
    }
  }

  /// Returns the sender endpoint identity.
  #[inline]
  pub fn sender(&self) -> Endpoint {
    self.shared.from
  }

  // ---------------------------------------------------------------------------
  // Configuration
  // ---------------------------------------------------------------------------

  /// Sets the send-buffer capacity in bytes (`0` = unbounded).
  pub fn set_buffer_size(&self, max_buf_size: usize) {
    self.shared.state.lock().max_buf_size = max_buf_size;
  }

  /// Returns the send-buffer capacity in bytes.
  pub fn buffer_size(&self) -> usize {
    self.shared.state.lock().max_buf_size
  }

  /// Sets the bound applied to each blocking wait.
  pub fn set_timeout(&self, timeout: Option<Duration>) {
    self.shared.state.lock().timeout = timeout;
  }

  /// Returns the bound applied to each blocking wait.
  pub fn timeout(&self) -> Option<Duration> {
    self.shared.state.lock().timeout
  }

  /// When enabled, file and mmap chunks are never borrowed across the beam;
  /// the receiver always gets its own re-homed reference.
  pub fn set_copy_files(&self, enabled: bool) {
    self.shared.state.lock().copy_files = enabled;
  }

  /// When enabled (the default), the receive byte budget counts memory
  /// cost instead of raw length, so file-backed chunks ride for free.
  pub fn set_tx_mem_limits(&self, enabled: bool) {
    self.shared.state.lock().tx_mem_limits = enabled;
  }

  // ---------------------------------------------------------------------------
  // Hooks
  // ---------------------------------------------------------------------------

  /// Registers the consumption hooks: `ev` fires when chunks are handed to
  /// the receiver, `io` receives the number of bytes consumed since the
  /// last report.
  pub fn on_consumed(&self, ev: Option<EventHook>, io: Option<IoHook>) {
    let mut state: MutexGuard<'_, State> = self.shared.state.lock();
    state.hooks.cons_ev = ev;
    state.hooks.cons_io = io;
  }

  /// Registers the hook fired when the beam goes from empty to non-empty.
  pub fn on_was_empty(&self, hook: Option<EventHook>) {
    self.shared.state.lock().hooks.was_empty = hook;
  }

  /// Registers the hook fired just before a sender blocks waiting for
  /// space.
  pub fn on_send_block(&self, hook: Option<EventHook>) {
    self.shared.state.lock().hooks.send_block = hook;
  }

  /// Appends a translator for [`Custom`] markers.
  ///
  /// [`Custom`]: crate::Chunk::Custom
  pub fn add_beamer(&self, beamer: Beamer) {
    self.shared.state.lock().hooks.beamers.push(beamer);
  }

  // ---------------------------------------------------------------------------
  // Accounting
  // ---------------------------------------------------------------------------

  /// Returns `true` once [`close`] was called on the beam.
  ///
  /// [`close`]: Beam::close
  pub fn is_closed(&self) -> bool {
    self.shared.state.lock().flags.contains(BeamFlags::CLOSED)
  }

  /// Returns `true` if no chunk is observable by the receiver.
  pub fn is_empty(&self) -> bool {
    self.shared.state.lock().is_empty()
  }

  /// Returns the total payload length queued for the receiver.
  pub fn buffered(&self) -> usize {
    self.shared.state.lock().buffered_data_len()
  }

  /// Returns the memory held by queued chunks (file and mmap windows hold
  /// none).
  pub fn mem_used(&self) -> usize {
    self.shared.state.lock().mem_used()
  }

  /// Returns the total payload bytes admitted by the sender.
  pub fn sent_bytes(&self) -> u64 {
    self.shared.state.lock().sent_bytes
  }

  /// Returns the total payload bytes handed to the receiver.
  pub fn received_bytes(&self) -> u64 {
    self.shared.state.lock().received_bytes
  }

  /// Reports bytes consumed since the last report to the `io` consumption
  /// hook, if any are pending. Returns `true` if the hook fired.
  pub fn report_consumption(&self) -> bool {
    let mut state: MutexGuard<'_, State> = self.shared.state.lock();
    self.report_locked(&mut state)
  }

  // ---------------------------------------------------------------------------
  // Close / Abort / Wait
  // ---------------------------------------------------------------------------

  /// Closes the beam without discarding pending chunks.
  ///
  /// A sender-side close leaves everything already admitted readable and
  /// never injects an end-of-stream (the receive path synthesizes one only
  /// once the beam drains). A receiver-side close is an abort. Idempotent.
  pub fn close(&self, caller: Endpoint) -> Result<(), BeamError> {
    let mut graveyard: Vec<Chunk> = Vec::new();
    let mut state: MutexGuard<'_, State> = self.shared.state.lock();

    tracing::trace!(beam = %self.shared.name, %caller, "close");
    state.flags.insert(BeamFlags::CLOSED);

    if caller == self.shared.from {
      graveyard.extend(state.purge.drain(..));
      self.report_locked(&mut state);

      if state.is_empty() {
        if let Some(hook) = state.hooks.was_empty.clone() {
          MutexGuard::unlocked(&mut state, || hook());
        }
      }
    } else {
      state.flags.insert(BeamFlags::ABORTED);
      self.drop_overflow(&mut state);
    }

    let aborted: bool = state.flags.contains(BeamFlags::ABORTED);

    drop(state);
    self.shared.change.notify_all();
    drop(graveyard);

    if aborted {
      return Err(BeamError::ConnAborted);
    }

    Ok(())
  }

  /// Aborts the beam: sends and receives fail from here on; queues may
  /// only drain.
  ///
  /// A sender-side abort additionally silences the consumption hooks and
  /// drains everything the sender still owns. A receiver-side abort
  /// discards the receiver overflow and closes the beam. Idempotent.
  pub fn abort(&self, caller: Endpoint) {
    let mut graveyard: Vec<Chunk> = Vec::new();
    let mut state: MutexGuard<'_, State> = self.shared.state.lock();

    tracing::trace!(beam = %self.shared.name, %caller, "abort");
    state.flags.insert(BeamFlags::ABORTED);

    if caller == self.shared.from {
      if state.is_empty() {
        if let Some(hook) = state.hooks.was_empty.clone() {
          MutexGuard::unlocked(&mut state, || hook());
        }
      }

      // no more consumption reporting to a dying producer
      state.hooks.cons_ev = None;
      state.hooks.cons_io = None;

      graveyard.extend(state.purge.drain(..));
      graveyard.extend(state.send.drain(..));
      self.report_locked(&mut state);
    } else {
      state.flags.insert(BeamFlags::CLOSED);
      self.drop_overflow(&mut state);
    }

    drop(state);
    self.shared.change.notify_all();
    drop(graveyard);
  }

  /// Waits until the beam is empty.
  pub fn wait_empty(&self, block: Block) -> Result<(), BeamError> {
    let mut state: MutexGuard<'_, State> = self.shared.state.lock();

    while !state.is_empty() {
      if block == Block::Nonblocking {
        return Err(BeamError::WouldBlock);
      }

      self.wait(&mut state)?;
    }

    Ok(())
  }

  /// Tears the beam down now, with the consumption hook still armed so a
  /// final report can fire. Outstanding proxies degrade gracefully.
  pub fn destroy(&self) {
    self.teardown(false);
  }

  // ---------------------------------------------------------------------------
  // Internals
  // ---------------------------------------------------------------------------

  /// One bounded wait on the beam condition. Callers re-check their
  /// predicate on return.
  fn wait(&self, state: &mut MutexGuard<'_, State>) -> Result<(), BeamError> {
    match state.timeout {
      None => self.shared.change.wait(state),
      Some(timeout) => {
        if self.shared.change.wait_for(state, timeout).timed_out() {
          return Err(BeamError::TimedOut);
        }
      }
    }

    Ok(())
  }

  /// Reports pending consumption. The hook runs with the lock released;
  /// the counter advances after reacquisition.
  fn report_locked(&self, state: &mut MutexGuard<'_, State>) -> bool {
    let len: u64 = state.received_bytes - state.cons_bytes_reported;

    if len == 0 {
      return false;
    }

    let fired: bool = match state.hooks.cons_io.clone() {
      None => false,
      Some(hook) => {
        MutexGuard::unlocked(state, || hook(len));
        true
      }
    };

    state.cons_bytes_reported += len;
    fired
  }

  /// Discards the receiver overflow. Chunk destruction happens with the
  /// lock released: dropping a proxy re-enters the beam.
  fn drop_overflow(&self, state: &mut MutexGuard<'_, State>) {
    if state.recv.is_empty() {
      return;
    }

    let stash: VecDeque<RecvChunk> = mem::take(&mut state.recv);
    MutexGuard::unlocked(state, move || drop(stash));

    self.shared.change.notify_all();

    if let Some(hook) = state.hooks.cons_ev.clone() {
      MutexGuard::unlocked(state, || hook());
    }
  }

  /// Absorbs late or refused input into the hold, to die at teardown.
  fn absorb(state: &mut State, input: &mut SendQueue) {
    for chunk in input.drain(..) {
      state.hold.push_back(HoldEntry { seq: None, chunk });
    }
  }

  /// Sender cleanup. Runs once; every chunk the beam still owns dies here,
  /// on the calling (sender) thread, outside the lock. Live proxies are
  /// neutralized: their reads report connection-reset and their drops
  /// release nothing.
  fn teardown(&self, from_scope: bool) {
    let mut graveyard: Vec<Chunk> = Vec::new();
    let mut state: MutexGuard<'_, State> = self.shared.state.lock();

    if state.flags.contains(BeamFlags::TORN_DOWN) {
      return;
    }

    state.flags.insert(BeamFlags::TORN_DOWN);

    if from_scope {
      state.hooks.cons_io = None;
    }

    tracing::trace!(beam = %self.shared.name, from_scope, "teardown");

    graveyard.extend(state.purge.drain(..));
    graveyard.extend(state.send.drain(..));
    self.report_locked(&mut state);

    state.proxies.clear();
    graveyard.extend(state.hold.drain(..).map(|entry| entry.chunk));

    let stash: VecDeque<RecvChunk> = mem::take(&mut state.recv);

    drop(state);
    self.shared.change.notify_all();
    drop(stash);
    drop(graveyard);
  }
}

impl Drop for Beam {
  fn drop(&mut self) {
    // scope teardown disables the consumption hook before cleanup
    self.teardown(true);
  }
}

impl Debug for Beam {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    let state: MutexGuard<'_, State> = self.shared.state.lock();

    f.debug_struct("Beam")
      .field("name", &self.shared.name)
      .field("closed", &state.flags.contains(BeamFlags::CLOSED))
      .field("aborted", &state.flags.contains(BeamFlags::ABORTED))
      .field("buffered", &state.buffered_data_len())
      .finish()
  }
}
