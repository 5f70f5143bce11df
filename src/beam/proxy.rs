use bytes::Bytes;
use memmap2::Mmap;
use parking_lot::MutexGuard;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::fs::File;
use triomphe::Arc;

use crate::beam::state::BeamFlags;
use crate::beam::state::HoldEntry;
use crate::beam::state::Shared;
use crate::beam::state::State;
use crate::chunk::read_file_window;
use crate::chunk::Chunk;
use crate::error::BeamError;

// -----------------------------------------------------------------------------
// Proxy Core
// -----------------------------------------------------------------------------

/// The shared identity of a proxy: the beam core plus the sequence number
/// of the sender chunk it borrows.
///
/// Splitting a proxy clones the core, so the borrowed chunk is released
/// only when the last window over it drops.
pub(crate) struct ProxyCore {
  beam: Arc<Shared>,
  seq: u64,
  zero_cost: bool,
}

impl Drop for ProxyCore {
  fn drop(&mut self) {
    emitted(&self.beam, self.seq);
  }
}

/// Releases the sender chunk borrowed by a destroyed proxy.
///
/// Chunks reach the purge queue strictly in admission order: the walk moves
/// the hold prefix that no live proxy guards, and stops once the released
/// chunk itself has moved. A chunk guarded by a live proxy blocks everything
/// behind it; a dead chunk left behind is collected by a later release (or
/// by teardown).
fn emitted(beam: &Shared, seq: u64) {
  let mut state: MutexGuard<'_, State> = beam.state.lock();

  if !state.proxies.remove(&seq) {
    // neutralized at teardown, nothing left to release
    return;
  }

  if !state.hold.iter().any(|entry| entry.seq == Some(seq)) {
    tracing::warn!(beam = %beam.name, seq, "released proxy not in hold");
    return;
  }

  'walk: loop {
    let blocked: bool = match state.hold.front() {
      None => true,
      Some(entry) => entry.seq.is_some_and(|n| state.proxies.contains(&n)),
    };

    if blocked {
      break 'walk;
    }

    let Some(entry) = state.hold.pop_front() else {
      break 'walk;
    };

    let own: bool = entry.seq == Some(seq);
    state.purge.push_back(entry.chunk);

    if own {
      break 'walk;
    }
  }

  drop(state);
  beam.change.notify_all();
}

// -----------------------------------------------------------------------------
// Proxy Chunk
// -----------------------------------------------------------------------------

/// A receiver-side window over a sender chunk pinned in the beam's hold.
///
/// The sender chunk outlives every window over it; dropping the last one
/// schedules the chunk for destruction on the sender thread.
pub struct ProxyChunk {
  core: Arc<ProxyCore>,
  start: usize,
  length: usize,
}

impl ProxyChunk {
  pub(crate) fn new(beam: Arc<Shared>, seq: u64, length: usize, zero_cost: bool) -> Self {
    Self {
      core: Arc::new(ProxyCore {
        beam,
        seq,
        zero_cost,
      }),
      start: 0,
      length,
    }
  }

  /// Returns the window length in bytes.
  #[inline]
  pub fn len(&self) -> usize {
    self.length
  }

  /// Returns `true` if the window is empty.
  #[inline]
  pub fn is_empty(&self) -> bool {
    self.length == 0
  }

  pub(crate) fn mem_used(&self) -> usize {
    if self.core.zero_cost {
      return 0;
    }

    self.length
  }

  pub(crate) fn split_to(&mut self, at: usize) -> Self {
    let head: Self = Self {
      core: Arc::clone(&self.core),
      start: self.start,
      length: at,
    };

    self.start += at;
    self.length -= at;
    head
  }

  /// Produces the window's bytes from the borrowed sender chunk.
  ///
  /// Fails with [`ConnReset`] once the sender chunk is gone: after an
  /// abort, or after the beam itself was torn down.
  ///
  /// [`ConnReset`]: BeamError::ConnReset
  pub fn read(&self) -> Result<Bytes, BeamError> {
    // Clone the payload handle out under the lock; produce bytes after it
    // drops so no IO happens while the beam is held.
    let payload: Payload = {
      let state: MutexGuard<'_, State> = self.core.beam.state.lock();

      if state.flags.contains(BeamFlags::ABORTED) {
        return Err(BeamError::ConnReset);
      }

      let found: Option<&HoldEntry> = state
        .hold
        .iter()
        .find(|entry| entry.seq == Some(self.core.seq));

      let Some(entry) = found else {
        return Err(BeamError::ConnReset);
      };

      match &entry.chunk {
        Chunk::Heap(data) => Payload::Heap(data.clone()),
        Chunk::File(inner) => Payload::File(Arc::clone(&inner.file), inner.start),
        Chunk::Mmap(inner) => Payload::Mmap(Arc::clone(&inner.map), inner.start),
        _ => return Err(BeamError::ConnReset),
      }
    };

    match payload {
      Payload::Heap(data) => Ok(data.slice(self.start..self.start + self.length)),
      Payload::File(file, base) => {
        read_file_window(&file, base + self.start as u64, self.length).map_err(BeamError::Io)
      }
      Payload::Mmap(map, base) => {
        let start: usize = base + self.start;
        Ok(Bytes::copy_from_slice(&map[start..start + self.length]))
      }
    }
  }
}

impl Debug for ProxyChunk {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    write!(f, "Proxy(#{}, {}+{})", self.core.seq, self.start, self.length)
  }
}

enum Payload {
  Heap(Bytes),
  File(Arc<File>, u64),
  Mmap(Arc<Mmap>, usize),
}
