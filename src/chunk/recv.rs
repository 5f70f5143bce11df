use bytes::Bytes;
use bytes::BytesMut;
use memmap2::Mmap;
use std::collections::VecDeque;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use triomphe::Arc;

use crate::beam::ProxyChunk;
use crate::chunk::ErrorMeta;
use crate::error::BeamError;

/// Ordered queue of receiver-side chunks.
pub type RecvQueue = VecDeque<RecvChunk>;

// -----------------------------------------------------------------------------
// File View
// -----------------------------------------------------------------------------

/// A receiver-owned reference to a file window, re-homed out of the
/// sender's scope.
///
/// Memory-map translation is always disabled on a view: a mapping handed
/// across threads would go stale if the backing file changes underneath it.
pub struct FileView {
  file: Arc<File>,
  start: u64,
  length: usize,
  mmap_enabled: bool,
}

impl FileView {
  pub(crate) fn new(file: Arc<File>, start: u64, length: usize) -> Self {
    Self {
      file,
      start,
      length,
      mmap_enabled: false,
    }
  }

  /// Returns the offset of the window within the file.
  #[inline]
  pub fn start(&self) -> u64 {
    self.start
  }

  /// Returns the window length in bytes.
  #[inline]
  pub fn len(&self) -> usize {
    self.length
  }

  /// Returns `true` if memory-map translation is permitted (never, for a
  /// view produced by a beam).
  #[inline]
  pub fn mmap_enabled(&self) -> bool {
    self.mmap_enabled
  }

  /// Reads the window into freshly allocated bytes.
  pub fn read(&self) -> io::Result<Bytes> {
    read_file_window(&self.file, self.start, self.length)
  }

  fn split_to(&mut self, at: usize) -> Self {
    let head: Self = Self {
      file: Arc::clone(&self.file),
      start: self.start,
      length: at,
      mmap_enabled: self.mmap_enabled,
    };

    self.start += at as u64;
    self.length -= at;
    head
  }
}

pub(crate) fn read_file_window(file: &File, start: u64, length: usize) -> io::Result<Bytes> {
  let mut data: BytesMut = BytesMut::zeroed(length);
  let mut filled: usize = 0;

  while filled < length {
    let n: usize = file.read_at(&mut data[filled..], start + filled as u64)?;

    if n == 0 {
      return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
    }

    filled += n;
  }

  Ok(data.freeze())
}

// -----------------------------------------------------------------------------
// Mmap View
// -----------------------------------------------------------------------------

/// A receiver-owned window over a shared memory map.
pub struct MmapView {
  map: Arc<Mmap>,
  start: usize,
  length: usize,
}

impl MmapView {
  pub(crate) fn new(map: Arc<Mmap>, start: usize, length: usize) -> Self {
    Self { map, start, length }
  }

  /// Returns the offset of the window within the map.
  #[inline]
  pub fn start(&self) -> usize {
    self.start
  }

  /// Returns the window length in bytes.
  #[inline]
  pub fn len(&self) -> usize {
    self.length
  }

  /// Copies the window out of the map.
  pub fn read(&self) -> Bytes {
    Bytes::copy_from_slice(&self.map[self.start..self.start + self.length])
  }

  fn split_to(&mut self, at: usize) -> Self {
    let head: Self = Self {
      map: Arc::clone(&self.map),
      start: self.start,
      length: at,
    };

    self.start += at;
    self.length -= at;
    head
  }
}

// -----------------------------------------------------------------------------
// Recv Chunk
// -----------------------------------------------------------------------------

/// A receiver-side unit produced by [`Beam::receive`].
///
/// Proxy chunks borrow sender memory and release it when dropped; file and
/// mmap views own a re-homed reference; metadata markers are fresh
/// receiver-owned values.
///
/// [`Beam::receive`]: crate::Beam::receive
pub enum RecvChunk {
  /// A window over a borrowed sender chunk.
  Proxy(ProxyChunk),
  /// A re-homed file window.
  File(FileView),
  /// A window over a shared memory map.
  Mmap(MmapView),
  /// Receiver-owned bytes (produced by beamer hooks).
  Heap(Bytes),
  /// End-of-stream marker.
  Eos,
  /// Boundary marker.
  Flush,
  /// Error marker.
  Error(ErrorMeta),
}

impl RecvChunk {
  /// Returns `true` if the chunk is a metadata marker.
  #[inline]
  pub fn is_metadata(&self) -> bool {
    matches!(self, Self::Eos | Self::Flush | Self::Error(_))
  }

  /// Returns the payload length in bytes.
  #[inline]
  pub fn len(&self) -> usize {
    match self {
      Self::Proxy(inner) => inner.len(),
      Self::File(inner) => inner.len(),
      Self::Mmap(inner) => inner.len(),
      Self::Heap(data) => data.len(),
      Self::Eos | Self::Flush | Self::Error(_) => 0,
    }
  }

  /// Returns `true` if the chunk carries no payload bytes.
  #[inline]
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Memory the chunk pins on the receiver side.
  ///
  /// File and mmap backed chunks cost nothing until read.
  pub(crate) fn mem_used(&self) -> usize {
    match self {
      Self::Proxy(inner) => inner.mem_used(),
      Self::File(_) | Self::Mmap(_) => 0,
      Self::Heap(data) => data.len(),
      Self::Eos | Self::Flush | Self::Error(_) => 0,
    }
  }

  /// Produces the chunk's bytes.
  ///
  /// Metadata markers yield empty bytes. A proxy read fails with
  /// [`ConnReset`] once its sender chunk is gone.
  ///
  /// [`ConnReset`]: BeamError::ConnReset
  pub fn read(&self) -> Result<Bytes, BeamError> {
    match self {
      Self::Proxy(inner) => inner.read(),
      Self::File(inner) => inner.read().map_err(BeamError::Io),
      Self::Mmap(inner) => Ok(inner.read()),
      Self::Heap(data) => Ok(data.clone()),
      Self::Eos | Self::Flush | Self::Error(_) => Ok(Bytes::new()),
    }
  }

  /// Splits off and returns the first `at` bytes; `self` keeps the rest.
  pub(crate) fn split_to(&mut self, at: usize) -> Self {
    debug_assert!(at <= self.len());

    match self {
      Self::Proxy(inner) => Self::Proxy(inner.split_to(at)),
      Self::File(inner) => Self::File(inner.split_to(at)),
      Self::Mmap(inner) => Self::Mmap(inner.split_to(at)),
      Self::Heap(data) => Self::Heap(data.split_to(at)),
      _ => unreachable!("split of a metadata chunk"),
    }
  }
}

impl Debug for RecvChunk {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    match self {
      Self::Proxy(inner) => Debug::fmt(inner, f),
      Self::File(inner) => write!(f, "FileView({}+{})", inner.start, inner.length),
      Self::Mmap(inner) => write!(f, "MmapView({}+{})", inner.start, inner.length),
      Self::Heap(data) => write!(f, "Heap({})", data.len()),
      Self::Eos => f.write_str("Eos"),
      Self::Flush => f.write_str("Flush"),
      Self::Error(inner) => write!(f, "Error({})", inner.status()),
    }
  }
}
