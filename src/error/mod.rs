use std::error::Error;
use std::fmt::Display;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::io;

// -----------------------------------------------------------------------------
// Beam Error
// -----------------------------------------------------------------------------

/// Status of a beam operation that did not complete normally.
///
/// The first three variants are flow-control signals and do not tear the
/// beam down; [`ConnAborted`] and [`ConnReset`] are terminal for the caller.
///
/// [`ConnAborted`]: BeamError::ConnAborted
/// [`ConnReset`]: BeamError::ConnReset
#[derive(Debug)]
#[non_exhaustive]
pub enum BeamError {
  /// A non-blocking call would have suspended.
  WouldBlock,
  /// A timed wait expired before progress was possible.
  TimedOut,
  /// The beam is closed and fully drained.
  Eof,
  /// The beam was aborted by one of its endpoints.
  ConnAborted,
  /// A proxy was read after its sender chunk was released.
  ConnReset,
  /// Materializing or reading chunk bytes failed.
  Io(io::Error),
}

impl BeamError {
  /// Returns `true` if the error is a flow-control signal.
  #[inline]
  pub fn is_flow_control(&self) -> bool {
    matches!(self, Self::WouldBlock | Self::TimedOut | Self::Eof)
  }

  /// Returns `true` if a non-blocking call would have suspended.
  #[inline]
  pub fn is_would_block(&self) -> bool {
    matches!(self, Self::WouldBlock)
  }

  /// Returns `true` if the beam is closed and fully drained.
  #[inline]
  pub fn is_eof(&self) -> bool {
    matches!(self, Self::Eof)
  }
}

impl Display for BeamError {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    match self {
      Self::WouldBlock => f.write_str("operation would block"),
      Self::TimedOut => f.write_str("wait timed out"),
      Self::Eof => f.write_str("beam closed and drained"),
      Self::ConnAborted => f.write_str("beam aborted"),
      Self::ConnReset => f.write_str("sender chunk released"),
      Self::Io(inner) => write!(f, "chunk read failed: {inner}"),
    }
  }
}

impl Error for BeamError {
  fn source(&self) -> Option<&(dyn Error + 'static)> {
    match self {
      Self::Io(inner) => Some(inner),
      _ => None,
    }
  }
}

impl From<io::Error> for BeamError {
  #[inline]
  fn from(other: io::Error) -> Self {
    Self::Io(other)
  }
}
