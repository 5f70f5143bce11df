use parking_lot::MutexGuard;
use triomphe::Arc;

use crate::beam::proxy::ProxyChunk;
use crate::beam::state::BeamFlags;
use crate::beam::state::Beamer;
use crate::beam::state::HoldEntry;
use crate::beam::state::State;
use crate::beam::Beam;
use crate::beam::Block;
use crate::beam::Endpoint;
use crate::chunk::Chunk;
use crate::chunk::FileView;
use crate::chunk::MmapView;
use crate::chunk::RecvChunk;
use crate::chunk::RecvQueue;
use crate::error::BeamError;

impl Beam {
  /// Transfers chunks to the receiver endpoint, appending to `out`.
  ///
  /// At most `max_bytes` payload bytes are delivered (`None` or zero means
  /// unbounded); surplus from an overshooting translation is kept as
  /// receiver overflow for the next call. When nothing is available the call suspends per
  /// `block`, bounded by the beam's timeout; a drained and closed beam
  /// yields [`Eof`]. On success the returned flag reports whether the beam
  /// is now closed.
  ///
  /// # Panics
  ///
  /// Panics if `to` is the beam's sender endpoint.
  ///
  /// [`Eof`]: BeamError::Eof
  pub fn receive(
    &self,
    to: Endpoint,
    out: &mut RecvQueue,
    block: Block,
    max_bytes: Option<usize>,
  ) -> Result<bool, BeamError> {
    assert_ne!(to, self.shared.from, "receive from the sender endpoint");

    let mut state: MutexGuard<'_, State> = self.shared.state.lock();

    tracing::trace!(beam = %self.shared.name, ?max_bytes, "receive: enter");

    let budget: i64 = match max_bytes {
      None | Some(0) => i64::MAX,
      Some(n) => i64::try_from(n).unwrap_or(i64::MAX),
    };

    let mut remain: i64 = budget;
    let mut transferred: usize = 0;

    let result: Result<(), BeamError> = 'transfer: loop {
      if state.flags.contains(BeamFlags::ABORTED) {
        self.drop_overflow(&mut state);
        break 'transfer Err(BeamError::ConnAborted);
      }

      // hand over what a previous call already translated
      while remain >= 0 {
        let stop: bool = match state.recv.front() {
          None => true,
          Some(chunk) => chunk.len() > 0 && remain <= 0,
        };

        if stop {
          break;
        }

        let Some(chunk) = state.recv.pop_front() else {
          break;
        };

        remain -= chunk.len() as i64;
        out.push_back(chunk);
        transferred += 1;
      }

      // translate sender chunks into receiver ones until we have enough
      let mut handed: usize = 0;

      while remain >= 0 {
        let stop: bool = match state.send.front() {
          None => true,
          Some(chunk) => {
            (chunk.len() > 0 && remain <= 0)
              || (chunk.is_data() && state.flags.contains(BeamFlags::CLOSE_SENT))
          }
        };

        if stop {
          break;
        }

        let Some(chunk) = state.send.pop_front() else {
          break;
        };

        match chunk {
          Chunk::Eos => {
            state.flags.insert(BeamFlags::CLOSE_SENT);
            out.push_back(RecvChunk::Eos);
            transferred += 1;
            state.hold.push_back(HoldEntry {
              seq: None,
              chunk: Chunk::Eos,
            });
            handed += 1;
          }
          Chunk::Flush => {
            out.push_back(RecvChunk::Flush);
            transferred += 1;
            state.hold.push_back(HoldEntry {
              seq: None,
              chunk: Chunk::Flush,
            });
            handed += 1;
          }
          Chunk::Error(meta) => {
            out.push_back(RecvChunk::Error(meta.clone()));
            transferred += 1;
            state.hold.push_back(HoldEntry {
              seq: None,
              chunk: Chunk::Error(meta),
            });
            handed += 1;
          }
          Chunk::Custom(meta) => {
            // somebody else may know how to translate this marker
            let beamers: Vec<Beamer> = state.hooks.beamers.clone();
            let mut produced: Vec<RecvChunk> = Vec::new();

            MutexGuard::unlocked(&mut state, || {
              for beamer in &beamers {
                if let Some(chunks) = beamer(&*meta) {
                  produced = chunks;
                  break;
                }
              }
            });

            for translated in produced {
              remain -= translated.len() as i64;
              out.push_back(translated);
              transferred += 1;
            }

            state.hold.push_back(HoldEntry {
              seq: None,
              chunk: Chunk::Custom(meta),
            });
            handed += 1;
          }
          chunk if chunk.len() == 0 => {
            state.hold.push_back(HoldEntry { seq: None, chunk });
          }
          Chunk::File(inner) if !inner.borrowed => {
            // re-home the handle so reads touch the receiver's scope, and
            // never let a borrowed mapping go stale underneath it
            let len: usize = inner.length;

            out.push_back(RecvChunk::File(FileView::new(
              Arc::clone(&inner.file),
              inner.start,
              len,
            )));

            state.hold.push_back(HoldEntry {
              seq: None,
              chunk: Chunk::File(inner),
            });

            remain -= len as i64;
            state.received_bytes += len as u64;
            transferred += 1;
            handed += 1;
          }
          Chunk::Mmap(inner) if !inner.borrowed => {
            let len: usize = inner.length;

            out.push_back(RecvChunk::Mmap(MmapView::new(
              Arc::clone(&inner.map),
              inner.start,
              len,
            )));

            state.hold.push_back(HoldEntry {
              seq: None,
              chunk: Chunk::Mmap(inner),
            });

            remain -= len as i64;
            state.received_bytes += len as u64;
            transferred += 1;
            handed += 1;
          }
          chunk => {
            // heap or a borrowed file/mmap window: pin the sender chunk in
            // the hold and hand the receiver a proxy over it
            let len: usize = chunk.len();
            let zero_cost: bool = matches!(chunk, Chunk::File(_) | Chunk::Mmap(_));
            let seq: u64 = state.buckets_sent;

            state.buckets_sent += 1;
            state.proxies.insert(seq);
            state.hold.push_back(HoldEntry {
              seq: Some(seq),
              chunk,
            });

            out.push_back(RecvChunk::Proxy(ProxyChunk::new(
              Arc::clone(&self.shared),
              seq,
              len,
              zero_cost,
            )));

            remain -= len as i64;
            state.received_bytes += len as u64;
            transferred += 1;
            handed += 1;
          }
        }
      }

      // too much: return the surplus to the overflow for the next call
      if remain < 0 {
        Self::trim(&mut state, out, budget);
      }

      if state.flags.contains(BeamFlags::CLOSED)
        && state.is_empty()
        && !state.flags.contains(BeamFlags::CLOSE_SENT)
      {
        // the sender never said end-of-stream; say it for them
        state.flags.insert(BeamFlags::CLOSE_SENT);
        out.push_back(RecvChunk::Eos);
        transferred += 1;
      }

      if handed > 0 {
        if let Some(hook) = state.hooks.cons_ev.clone() {
          MutexGuard::unlocked(&mut state, || hook());
        }
      }

      if transferred > 0 {
        self.shared.change.notify_all();
        break 'transfer Ok(());
      }

      if state.flags.contains(BeamFlags::CLOSED) {
        break 'transfer Err(BeamError::Eof);
      }

      if let Err(error) = self.wait_not_empty(&mut state, block) {
        break 'transfer Err(error);
      }
    };

    let closed: bool = state.flags.contains(BeamFlags::CLOSED);

    tracing::trace!(beam = %self.shared.name, ok = result.is_ok(), closed, "receive: leave");
    result.map(|()| closed)
  }

  /// Walks `out` from the head until the byte budget is spent, splits the
  /// surplus chunk, and moves the tail to the front of the overflow queue
  /// in order.
  fn trim(state: &mut MutexGuard<'_, State>, out: &mut RecvQueue, budget: i64) {
    let mut remain: i64 = budget;
    let mut index: usize = 0;

    while index < out.len() {
      let cost: usize = if state.tx_mem_limits {
        out[index].mem_used()
      } else {
        out[index].len()
      };

      remain -= cost as i64;

      if remain < 0 {
        let keep: usize = (out[index].len() as i64 + remain) as usize;

        let cut: usize = if keep > 0 {
          let head: RecvChunk = out[index].split_to(keep);
          out.insert(index, head);
          index + 1
        } else {
          index
        };

        let tail: Vec<RecvChunk> = out.drain(cut..).collect();

        for chunk in tail.into_iter().rev() {
          state.recv.push_front(chunk);
        }

        return;
      }

      index += 1;
    }
  }

  /// Waits until the beam has something for the receiver.
  fn wait_not_empty(
    &self,
    state: &mut MutexGuard<'_, State>,
    block: Block,
  ) -> Result<(), BeamError> {
    'wait: loop {
      if !state.is_empty() {
        break 'wait Ok(());
      }

      if state.flags.contains(BeamFlags::ABORTED) {
        break 'wait Err(BeamError::ConnAborted);
      }

      if state.flags.contains(BeamFlags::CLOSED) {
        break 'wait Err(BeamError::Eof);
      }

      if block == Block::Nonblocking {
        break 'wait Err(BeamError::WouldBlock);
      }

      self.wait(state)?;
    }
  }
}
