use parking_lot::MutexGuard;

use crate::beam::state::BeamFlags;
use crate::beam::state::State;
use crate::beam::Beam;
use crate::beam::Block;
use crate::beam::Endpoint;
use crate::chunk::Chunk;
use crate::chunk::SendQueue;
use crate::error::BeamError;

impl Beam {
  /// Admits an ordered sequence of chunks from the sender endpoint.
  ///
  /// Chunks are drained from the front of `input` as they are admitted;
  /// whatever was not admitted (including the split-off tail of a chunk
  /// that only partially fit) stays with the caller. A full buffer
  /// suspends the call per `block`, bounded by the beam's timeout.
  ///
  /// After a close, input is absorbed silently; after an abort, input is
  /// absorbed and the call fails with [`ConnAborted`]. A failure to
  /// materialize an external chunk propagates unchanged, with the chunk
  /// still at the front of `input` and the beam untouched.
  ///
  /// # Panics
  ///
  /// Panics if `from` is not the beam's sender endpoint.
  ///
  /// [`ConnAborted`]: BeamError::ConnAborted
  pub fn send(&self, from: Endpoint, input: &mut SendQueue, block: Block) -> Result<(), BeamError> {
    assert_eq!(from, self.shared.from, "send from a non-sender endpoint");

    let mut graveyard: Vec<Chunk> = Vec::new();
    let mut state: MutexGuard<'_, State> = self.shared.state.lock();

    tracing::trace!(beam = %self.shared.name, chunks = input.len(), "send: enter");
    graveyard.extend(state.purge.drain(..));

    let mut result: Result<(), BeamError> = Ok(());

    if state.flags.contains(BeamFlags::ABORTED) {
      Self::absorb(&mut state, input);
      result = Err(BeamError::ConnAborted);
    } else if state.flags.contains(BeamFlags::CLOSED) {
      // late writes after end-of-stream are absorbed without complaint
      Self::absorb(&mut state, input);
    } else {
      let mut was_empty: bool = state.is_empty();
      let mut space_left: usize = state.space_left();

      'admit: while !input.is_empty() {
        if space_left == 0 {
          graveyard.extend(state.purge.drain(..));

          if was_empty {
            if let Some(hook) = state.hooks.was_empty.clone() {
              MutexGuard::unlocked(&mut state, || hook());
            }
          }

          if let Err(error) = self.wait_not_full(&mut state, block, &mut space_left) {
            result = Err(error);
            break 'admit;
          }

          was_empty = state.is_empty();
        }

        let Some(chunk) = input.pop_front() else {
          break 'admit;
        };

        if let Err(error) = Self::admit(&mut state, chunk, input, &mut space_left, &mut graveyard) {
          result = Err(error);
          break 'admit;
        }
      }

      if was_empty && !state.is_empty() {
        if let Some(hook) = state.hooks.was_empty.clone() {
          MutexGuard::unlocked(&mut state, || hook());
        }
      }
    }

    self.report_locked(&mut state);
    tracing::trace!(beam = %self.shared.name, ok = result.is_ok(), "send: leave");

    drop(state);
    self.shared.change.notify_all();
    drop(graveyard);
    result
  }

  /// Waits until the send buffer has room, leaving the fresh space in
  /// `space_left`.
  fn wait_not_full(
    &self,
    state: &mut MutexGuard<'_, State>,
    block: Block,
    space_left: &mut usize,
  ) -> Result<(), BeamError> {
    'wait: loop {
      *space_left = state.space_left();

      if *space_left > 0 {
        break 'wait Ok(());
      }

      if state.flags.contains(BeamFlags::ABORTED) {
        break 'wait Err(BeamError::ConnAborted);
      }

      if block == Block::Nonblocking {
        break 'wait Err(BeamError::WouldBlock);
      }

      if let Some(hook) = state.hooks.send_block.clone() {
        MutexGuard::unlocked(state, || hook());

        // the hook ran unlocked; re-check before committing to the wait
        *space_left = state.space_left();

        if *space_left > 0 {
          break 'wait Ok(());
        }

        if state.flags.contains(BeamFlags::ABORTED) {
          break 'wait Err(BeamError::ConnAborted);
        }
      }

      self.wait(state)?;
    }
  }

  /// Places one chunk into the send queue such that the receiver can
  /// consume it without touching sender-thread-only resources.
  fn admit(
    state: &mut MutexGuard<'_, State>,
    chunk: Chunk,
    input: &mut SendQueue,
    space_left: &mut usize,
    graveyard: &mut Vec<Chunk>,
  ) -> Result<(), BeamError> {
    if state.flags.contains(BeamFlags::ABORTED) {
      input.push_front(chunk);
      return Err(BeamError::ConnAborted);
    }

    if chunk.is_metadata() {
      state.send.push_back(chunk);
      return Ok(());
    }

    // External bytes live in sender-owned memory; reading them anywhere
    // else is off limits, so they become heap right here.
    let mut chunk: Chunk = match chunk {
      Chunk::External(mut source) => match source.materialize() {
        Ok(data) => Chunk::Heap(data),
        Err(error) => {
          input.push_front(Chunk::External(source));
          return Err(BeamError::Io(error));
        }
      },
      other => other,
    };

    let check_len: bool = match &mut chunk {
      Chunk::Heap(_) => true,
      Chunk::File(inner) => {
        // A shared file handle leaves the beam without full control of the
        // file's lifetime, so only a uniquely held one may be borrowed.
        inner.borrowed = !state.copy_files && inner.file.is_unique();
        !inner.borrowed
      }
      Chunk::Mmap(inner) => {
        inner.borrowed = !state.copy_files;
        !inner.borrowed
      }
      _ => unreachable!("metadata and external chunks are handled above"),
    };

    if check_len {
      if chunk.len() > *space_left {
        let head: Chunk = chunk.split_to(*space_left);
        input.push_front(chunk);
        chunk = head;
      }

      *space_left -= chunk.len();
    }

    let len: usize = chunk.len();

    if len == 0 {
      graveyard.push(chunk);
      return Ok(());
    }

    state.send.push_back(chunk);
    state.sent_bytes += len as u64;
    Ok(())
  }
}
