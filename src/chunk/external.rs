use bytes::Bytes;
use std::io;

// -----------------------------------------------------------------------------
// External Source
// -----------------------------------------------------------------------------

/// A source of bytes that live in memory owned by the sender.
///
/// External chunks must never be read from the receiver thread: their
/// backing memory belongs to the sender and may be reclaimed the moment the
/// sender's scope unwinds. The beam therefore materializes them on the
/// sender thread during admission and forwards the resulting heap bytes.
pub trait ExternalSource: Send {
  /// Returns the number of bytes this source will yield, if that is known
  /// before the first read.
  fn length(&self) -> Option<usize>;

  /// Reads and returns all remaining bytes of the source.
  ///
  /// Called on the sender thread only. A failure leaves the chunk with the
  /// caller and the beam unchanged.
  fn materialize(&mut self) -> io::Result<Bytes>;
}
