use bytes::Bytes;
use memmap2::Mmap;
use std::any::Any;
use std::collections::VecDeque;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::fs::File;
use triomphe::Arc;

mod external;
mod recv;

pub(crate) use self::recv::read_file_window;

pub use self::external::ExternalSource;
pub use self::recv::FileView;
pub use self::recv::MmapView;
pub use self::recv::RecvChunk;
pub use self::recv::RecvQueue;

/// Ordered queue of sender-side chunks awaiting admission.
pub type SendQueue = VecDeque<Chunk>;

// -----------------------------------------------------------------------------
// Error Meta
// -----------------------------------------------------------------------------

/// Status code and optional diagnostic payload carried by an error marker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorMeta {
  status: u16,
  message: Option<String>,
}

impl ErrorMeta {
  /// Creates a new error marker payload.
  #[inline]
  pub fn new(status: u16, message: Option<String>) -> Self {
    Self { status, message }
  }

  /// Returns the status code.
  #[inline]
  pub fn status(&self) -> u16 {
    self.status
  }

  /// Returns the diagnostic payload, if any.
  #[inline]
  pub fn message(&self) -> Option<&str> {
    self.message.as_deref()
  }
}

// -----------------------------------------------------------------------------
// Custom Meta
// -----------------------------------------------------------------------------

/// Extension metadata carried through the beam and translated by beamer
/// hooks on the receiver side.
///
/// Custom markers carry no payload bytes of their own; a beamer inspects
/// the marker (downcasting through [`as_any`]) and produces the receiver
/// representation.
///
/// [`as_any`]: CustomMeta::as_any
pub trait CustomMeta: Debug + Send {
  /// Upcast used by beamer hooks to downcast to the concrete marker type.
  fn as_any(&self) -> &dyn Any;
}

// -----------------------------------------------------------------------------
// File Chunk
// -----------------------------------------------------------------------------

/// A windowed reference to an open file.
pub struct FileChunk {
  pub(crate) file: Arc<File>,
  pub(crate) start: u64,
  pub(crate) length: usize,
  pub(crate) borrowed: bool,
}

impl FileChunk {
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

  pub(crate) fn split_to(&mut self, at: usize) -> Self {
    let head: Self = Self {
      file: Arc::clone(&self.file),
      start: self.start,
      length: at,
      borrowed: self.borrowed,
    };

    self.start += at as u64;
    self.length -= at;
    head
  }
}

// -----------------------------------------------------------------------------
// Mmap Chunk
// -----------------------------------------------------------------------------

/// A windowed reference to a memory-mapped file.
pub struct MmapChunk {
  pub(crate) map: Arc<Mmap>,
  pub(crate) start: usize,
  pub(crate) length: usize,
  pub(crate) borrowed: bool,
}

impl MmapChunk {
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

  pub(crate) fn split_to(&mut self, at: usize) -> Self {
    let head: Self = Self {
      map: Arc::clone(&self.map),
      start: self.start,
      length: at,
      borrowed: self.borrowed,
    };

    self.start += at;
    self.length -= at;
    head
  }
}

// -----------------------------------------------------------------------------
// Chunk
// -----------------------------------------------------------------------------

/// A sender-side unit of data or metadata flowing through a beam.
///
/// Data chunks carry bytes in one of four ownership shapes; metadata chunks
/// carry none. Which shapes may be pinned by the receiver (rather than
/// copied or re-homed) is decided during admission.
pub enum Chunk {
  /// Owns its bytes; safely readable from any thread.
  Heap(Bytes),
  /// A windowed reference to an open file.
  File(FileChunk),
  /// A windowed reference to a memory-mapped file.
  Mmap(MmapChunk),
  /// Bytes in sender-owned memory; materialized on admission.
  External(Box<dyn ExternalSource>),
  /// End-of-stream marker.
  Eos,
  /// Boundary marker.
  Flush,
  /// Error marker with status and optional diagnostic payload.
  Error(ErrorMeta),
  /// Extension marker translated by beamer hooks.
  Custom(Box<dyn CustomMeta>),
}

impl Chunk {
  /// Creates a heap data chunk.
  #[inline]
  pub fn heap(data: impl Into<Bytes>) -> Self {
    Self::Heap(data.into())
  }

  /// Creates a file data chunk over `[start, start + length)`.
  #[inline]
  pub fn file(file: File, start: u64, length: usize) -> Self {
    Self::file_shared(Arc::new(file), start, length)
  }

  /// Creates a file data chunk over an already shared handle.
  #[inline]
  pub fn file_shared(file: Arc<File>, start: u64, length: usize) -> Self {
    Self::File(FileChunk {
      file,
      start,
      length,
      borrowed: false,
    })
  }

  /// Creates a memory-mapped data chunk over `[start, start + length)`.
  #[inline]
  pub fn mmap(map: Mmap, start: usize, length: usize) -> Self {
    Self::mmap_shared(Arc::new(map), start, length)
  }

  /// Creates a memory-mapped data chunk over an already shared map.
  #[inline]
  pub fn mmap_shared(map: Arc<Mmap>, start: usize, length: usize) -> Self {
    Self::Mmap(MmapChunk {
      map,
      start,
      length,
      borrowed: false,
    })
  }

  /// Creates an external data chunk.
  #[inline]
  pub fn external(source: impl ExternalSource + 'static) -> Self {
    Self::External(Box::new(source))
  }

  /// Creates an error marker.
  #[inline]
  pub fn error(status: u16, message: Option<String>) -> Self {
    Self::Error(ErrorMeta::new(status, message))
  }

  /// Creates an extension marker.
  #[inline]
  pub fn custom(meta: impl CustomMeta + 'static) -> Self {
    Self::Custom(Box::new(meta))
  }

  /// Returns `true` if the chunk is a metadata marker.
  #[inline]
  pub fn is_metadata(&self) -> bool {
    matches!(self, Self::Eos | Self::Flush | Self::Error(_) | Self::Custom(_))
  }

  /// Returns `true` if the chunk carries payload bytes.
  #[inline]
  pub fn is_data(&self) -> bool {
    !self.is_metadata()
  }

  /// Returns the payload length in bytes.
  ///
  /// Metadata chunks report zero. An external chunk whose length is unknown
  /// before the first read also reports zero; admission materializes it
  /// before any length-based decision.
  #[inline]
  pub fn len(&self) -> usize {
    match self {
      Self::Heap(data) => data.len(),
      Self::File(inner) => inner.length,
      Self::Mmap(inner) => inner.length,
      Self::External(source) => source.length().unwrap_or(0),
      Self::Eos | Self::Flush | Self::Error(_) | Self::Custom(_) => 0,
    }
  }

  /// Returns `true` if the chunk carries no payload bytes.
  #[inline]
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Memory footprint the chunk contributes to the send buffer.
  ///
  /// Borrowed file and mmap windows are pinned at zero cost; everything
  /// else costs its length.
  pub(crate) fn space_cost(&self) -> usize {
    match self {
      Self::File(inner) if inner.borrowed => 0,
      Self::Mmap(inner) if inner.borrowed => 0,
      _ => self.len(),
    }
  }

  /// Memory held by the chunk itself (file and mmap windows hold none).
  pub(crate) fn mem_used(&self) -> usize {
    match self {
      Self::File(_) | Self::Mmap(_) => 0,
      _ => self.len(),
    }
  }

  /// Splits off and returns the first `at` bytes; `self` keeps the rest.
  ///
  /// Only length-checked data chunks are ever split, after externals have
  /// been materialized.
  pub(crate) fn split_to(&mut self, at: usize) -> Self {
    match self {
      Self::Heap(data) => Self::Heap(data.split_to(at)),
      Self::File(inner) => Self::File(inner.split_to(at)),
      Self::Mmap(inner) => Self::Mmap(inner.split_to(at)),
      _ => unreachable!("split of a metadata or external chunk"),
    }
  }
}

impl Debug for Chunk {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    match self {
      Self::Heap(data) => write!(f, "Heap({})", data.len()),
      Self::File(inner) => write!(f, "File({}+{})", inner.start, inner.length),
      Self::Mmap(inner) => write!(f, "Mmap({}+{})", inner.start, inner.length),
      Self::External(source) => write!(f, "External({:?})", source.length()),
      Self::Eos => f.write_str("Eos"),
      Self::Flush => f.write_str("Flush"),
      Self::Error(inner) => write!(f, "Error({})", inner.status),
      Self::Custom(inner) => write!(f, "Custom({inner:?})"),
    }
  }
}
