use bytes::Bytes;
use std::any::Any;
use std::collections::VecDeque;
use std::io;
use std::io::Write;
use std::sync::Arc as StdArc;

use beamline::Beam;
use beamline::BeamError;
use beamline::Block;
use beamline::Chunk;
use beamline::CustomMeta;
use beamline::Endpoint;
use beamline::ExternalSource;
use beamline::RecvChunk;
use beamline::RecvQueue;
use beamline::SendQueue;

fn beam(max_buf_size: usize) -> (Beam, Endpoint, Endpoint) {
  let from: Endpoint = Endpoint::next();
  let to: Endpoint = Endpoint::next();

  (Beam::new(from, 1, "transfer", max_buf_size, None), from, to)
}

fn heap(len: usize, fill: u8) -> Chunk {
  Chunk::heap(vec![fill; len])
}

#[test]
fn simple_transfer() {
  let (beam, from, to) = beam(1024);
  let mut input: SendQueue = VecDeque::from([heap(10, b'a'), heap(20, b'b'), heap(30, b'c'), Chunk::Eos]);

  beam.send(from, &mut input, Block::Blocking).unwrap();
  assert!(input.is_empty());
  assert_eq!(beam.sent_bytes(), 60);

  let mut out: RecvQueue = VecDeque::new();
  beam.receive(to, &mut out, Block::Blocking, None).unwrap();

  assert_eq!(out.len(), 4);
  assert_eq!(out[0].read().unwrap(), Bytes::from(vec![b'a'; 10]));
  assert_eq!(out[1].read().unwrap(), Bytes::from(vec![b'b'; 20]));
  assert_eq!(out[2].read().unwrap(), Bytes::from(vec![b'c'; 30]));
  assert!(matches!(out[3], RecvChunk::Eos));
  assert_eq!(beam.received_bytes(), 60);

  drop(out);
  assert!(beam.is_empty());
}

#[test]
fn backpressure_splits_and_blocks() {
  let (beam, from, to) = beam(32);

  let mut input: SendQueue = VecDeque::from([heap(20, b'x')]);
  beam.send(from, &mut input, Block::Blocking).unwrap();

  // 12 bytes fit; the tail of the second chunk stays with the caller
  let mut input: SendQueue = VecDeque::from([heap(20, b'y')]);
  let result = beam.send(from, &mut input, Block::Nonblocking);

  assert!(matches!(result, Err(BeamError::WouldBlock)));
  assert_eq!(input.len(), 1);
  assert_eq!(input[0].len(), 8);
  assert_eq!(beam.buffered(), 32);

  // draining 20 bytes opens exactly 20 bytes of space
  let mut out: RecvQueue = VecDeque::new();
  beam
    .receive(to, &mut out, Block::Blocking, Some(20))
    .unwrap();
  assert_eq!(out.len(), 1);
  assert_eq!(out[0].len(), 20);

  let mut input: SendQueue = VecDeque::from([heap(20, b'z')]);
  beam.send(from, &mut input, Block::Nonblocking).unwrap();
  assert!(input.is_empty());
}

#[test]
fn unbounded_never_blocks() {
  let (beam, from, _to) = beam(0);
  let mut input: SendQueue = VecDeque::from([heap(1 << 20, 0)]);

  beam.send(from, &mut input, Block::Nonblocking).unwrap();
  assert!(input.is_empty());
  assert_eq!(beam.buffered(), 1 << 20);
}

#[test]
fn zero_length_data_is_dropped() {
  let (beam, from, to) = beam(64);
  let mut input: SendQueue = VecDeque::from([Chunk::heap(Bytes::new())]);

  beam.send(from, &mut input, Block::Blocking).unwrap();
  assert_eq!(beam.sent_bytes(), 0);
  assert!(beam.is_empty());

  let mut out: RecvQueue = VecDeque::new();
  let result = beam.receive(to, &mut out, Block::Nonblocking, None);

  assert!(matches!(result, Err(BeamError::WouldBlock)));
  assert!(out.is_empty());
}

#[test]
fn close_then_drain_then_eof() {
  let (beam, from, to) = beam(1024);
  let mut input: SendQueue = VecDeque::from([heap(3, b'a'), heap(4, b'b'), Chunk::Eos]);

  beam.send(from, &mut input, Block::Blocking).unwrap();
  beam.close(from).unwrap();

  let mut out: RecvQueue = VecDeque::new();
  let closed: bool = beam.receive(to, &mut out, Block::Blocking, None).unwrap();

  assert!(closed);
  assert_eq!(out.len(), 3);
  assert!(matches!(out[2], RecvChunk::Eos));

  let result = beam.receive(to, &mut out, Block::Blocking, None);
  assert!(matches!(result, Err(BeamError::Eof)));
}

#[test]
fn eos_is_synthesized_after_close() {
  let (beam, from, to) = beam(1024);
  let mut input: SendQueue = VecDeque::from([heap(5, b'q')]);

  beam.send(from, &mut input, Block::Blocking).unwrap();
  beam.close(from).unwrap();

  let mut out: RecvQueue = VecDeque::new();
  beam.receive(to, &mut out, Block::Blocking, None).unwrap();

  assert_eq!(out.len(), 2);
  assert_eq!(out[0].len(), 5);
  assert!(matches!(out[1], RecvChunk::Eos));
}

#[test]
fn eos_alone_does_not_close() {
  let (beam, from, to) = beam(1024);
  let mut input: SendQueue = VecDeque::from([Chunk::Eos]);

  beam.send(from, &mut input, Block::Blocking).unwrap();
  assert!(!beam.is_closed(), "eos admission must not close the beam");

  let mut out: RecvQueue = VecDeque::new();
  let closed: bool = beam.receive(to, &mut out, Block::Blocking, None).unwrap();

  assert!(!closed);
  assert!(matches!(out[0], RecvChunk::Eos));
}

#[test]
fn late_writes_after_close_are_absorbed() {
  let (beam, from, to) = beam(1024);
  let mut input: SendQueue = VecDeque::from([heap(3, b'a'), Chunk::Eos]);

  beam.send(from, &mut input, Block::Blocking).unwrap();
  beam.close(from).unwrap();

  let mut late: SendQueue = VecDeque::from([heap(9, b'z')]);
  beam.send(from, &mut late, Block::Blocking).unwrap();
  assert!(late.is_empty(), "late writes are absorbed, not refused");

  let mut out: RecvQueue = VecDeque::new();
  beam.receive(to, &mut out, Block::Blocking, None).unwrap();

  assert_eq!(out.len(), 2, "absorbed chunks never reach the receiver");
  assert_eq!(out[0].len(), 3);
  assert!(matches!(out[1], RecvChunk::Eos));
}

#[test]
fn error_marker_survives_translation() {
  let (beam, from, to) = beam(1024);
  let mut input: SendQueue = VecDeque::from([Chunk::error(502, Some("upstream gone".into()))]);

  beam.send(from, &mut input, Block::Blocking).unwrap();

  let mut out: RecvQueue = VecDeque::new();
  beam.receive(to, &mut out, Block::Blocking, None).unwrap();

  let RecvChunk::Error(meta) = &out[0] else {
    panic!("expected an error marker, got {:?}", out[0]);
  };

  assert_eq!(meta.status(), 502);
  assert_eq!(meta.message(), Some("upstream gone"));
}

#[test]
fn byte_budget_splits_and_resumes() {
  let (beam, from, to) = beam(1024);
  let mut input: SendQueue = VecDeque::from([heap(10, b'a'), heap(20, b'b'), heap(30, b'c'), Chunk::Eos]);

  beam.send(from, &mut input, Block::Blocking).unwrap();

  let mut first: RecvQueue = VecDeque::new();
  beam
    .receive(to, &mut first, Block::Blocking, Some(15))
    .unwrap();

  let got: usize = first.iter().map(RecvChunk::len).sum();
  assert_eq!(got, 15);

  let mut second: RecvQueue = VecDeque::new();
  beam.receive(to, &mut second, Block::Blocking, None).unwrap();

  let mut bytes: Vec<u8> = Vec::new();
  for chunk in first.iter().chain(second.iter()) {
    bytes.extend_from_slice(&chunk.read().unwrap());
  }

  let mut expected: Vec<u8> = Vec::new();
  expected.extend(vec![b'a'; 10]);
  expected.extend(vec![b'b'; 20]);
  expected.extend(vec![b'c'; 30]);

  assert_eq!(bytes, expected);
  assert!(matches!(second.back().unwrap(), RecvChunk::Eos));
}

// -----------------------------------------------------------------------------
// File / Mmap
// -----------------------------------------------------------------------------

fn scratch_file(content: &[u8]) -> std::fs::File {
  let mut file = tempfile::tempfile().expect("tempfile");
  file.write_all(content).expect("write");
  file
}

#[test]
fn unique_file_is_borrowed_as_proxy() {
  let (beam, from, to) = beam(16);
  let file = scratch_file(b"0123456789abcdef0123456789abcdef");

  // a borrowed file is pinned at zero memory cost, so it ignores the
  // 16-byte buffer bound
  let mut input: SendQueue = VecDeque::from([Chunk::file(file, 4, 24)]);
  beam.send(from, &mut input, Block::Nonblocking).unwrap();
  assert!(input.is_empty());
  assert_eq!(beam.mem_used(), 0);
  assert_eq!(beam.buffered(), 24);

  let mut out: RecvQueue = VecDeque::new();
  beam.receive(to, &mut out, Block::Blocking, None).unwrap();

  let RecvChunk::Proxy(proxy) = &out[0] else {
    panic!("unique file under copy_files=false must proxy, got {:?}", out[0]);
  };

  assert_eq!(
    proxy.read().unwrap(),
    Bytes::from_static(b"456789abcdef0123456789ab")
  );
}

#[test]
fn copied_file_becomes_receiver_view() {
  let (beam, from, to) = beam(64);
  beam.set_copy_files(true);

  let file = scratch_file(b"hello file world");
  let mut input: SendQueue = VecDeque::from([Chunk::file(file, 6, 4)]);

  beam.send(from, &mut input, Block::Blocking).unwrap();

  let mut out: RecvQueue = VecDeque::new();
  beam.receive(to, &mut out, Block::Blocking, None).unwrap();

  let RecvChunk::File(view) = &out[0] else {
    panic!("copy_files must re-home instead of proxying, got {:?}", out[0]);
  };

  assert!(!view.mmap_enabled(), "re-homed views never re-enable mmap");
  assert_eq!(view.read().unwrap(), Bytes::from_static(b"file"));
  assert_eq!(beam.received_bytes(), 4);
}

#[test]
fn shared_file_handle_is_never_borrowed() {
  let (beam, from, to) = beam(64);
  let file = triomphe::Arc::new(scratch_file(b"shared handle bytes"));
  let clone = triomphe::Arc::clone(&file);

  let mut input: SendQueue = VecDeque::from([Chunk::file_shared(file, 0, 6)]);
  beam.send(from, &mut input, Block::Blocking).unwrap();

  let mut out: RecvQueue = VecDeque::new();
  beam.receive(to, &mut out, Block::Blocking, None).unwrap();

  assert!(
    matches!(out[0], RecvChunk::File(_)),
    "a shared handle leaves the beam without lifetime control"
  );

  drop(clone);
}

#[test]
fn mmap_borrows_and_copies() {
  let file = scratch_file(b"mapped bytes here!");
  let map = unsafe { memmap2::Mmap::map(&file) }.expect("mmap");

  let (beam, from, to) = beam(64);
  let mut input: SendQueue = VecDeque::from([Chunk::mmap(map, 7, 5)]);

  beam.send(from, &mut input, Block::Blocking).unwrap();

  let mut out: RecvQueue = VecDeque::new();
  beam.receive(to, &mut out, Block::Blocking, None).unwrap();

  let RecvChunk::Proxy(proxy) = &out[0] else {
    panic!("mmap under copy_files=false must proxy, got {:?}", out[0]);
  };
  assert_eq!(proxy.read().unwrap(), Bytes::from_static(b"bytes"));

  // with copy_files the receiver gets its own window
  let file = scratch_file(b"mapped bytes here!");
  let map = unsafe { memmap2::Mmap::map(&file) }.expect("mmap");

  let (beam, from, to) = crate::beam(64);
  beam.set_copy_files(true);

  let mut input: SendQueue = VecDeque::from([Chunk::mmap(map, 0, 6)]);
  beam.send(from, &mut input, Block::Blocking).unwrap();

  let mut out: RecvQueue = VecDeque::new();
  beam.receive(to, &mut out, Block::Blocking, None).unwrap();

  let RecvChunk::Mmap(view) = &out[0] else {
    panic!("copy_files mmap must re-home, got {:?}", out[0]);
  };
  assert_eq!(view.read(), Bytes::from_static(b"mapped"));
}

// -----------------------------------------------------------------------------
// External
// -----------------------------------------------------------------------------

struct Streamed {
  data: Option<Bytes>,
  advertise: bool,
}

impl ExternalSource for Streamed {
  fn length(&self) -> Option<usize> {
    if self.advertise {
      self.data.as_ref().map(Bytes::len)
    } else {
      None
    }
  }

  fn materialize(&mut self) -> io::Result<Bytes> {
    self.data.take().ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))
  }
}

struct Broken;

impl ExternalSource for Broken {
  fn length(&self) -> Option<usize> {
    None
  }

  fn materialize(&mut self) -> io::Result<Bytes> {
    Err(io::Error::from(io::ErrorKind::ConnectionRefused))
  }
}

#[test]
fn external_is_materialized_on_admission() {
  let (beam, from, to) = beam(1024);
  let source: Streamed = Streamed {
    data: Some(Bytes::from_static(b"external payload")),
    advertise: false,
  };

  let mut input: SendQueue = VecDeque::from([Chunk::external(source)]);
  beam.send(from, &mut input, Block::Blocking).unwrap();
  assert_eq!(beam.sent_bytes(), 16);

  let mut out: RecvQueue = VecDeque::new();
  beam.receive(to, &mut out, Block::Blocking, None).unwrap();

  assert!(matches!(out[0], RecvChunk::Proxy(_)));
  assert_eq!(out[0].read().unwrap(), Bytes::from_static(b"external payload"));
}

#[test]
fn external_failure_leaves_chunk_with_caller() {
  let (beam, from, _to) = beam(1024);
  let mut input: SendQueue = VecDeque::from([Chunk::external(Broken)]);

  let result = beam.send(from, &mut input, Block::Blocking);

  assert!(matches!(result, Err(BeamError::Io(_))));
  assert_eq!(input.len(), 1, "the failed chunk stays with the caller");
  assert!(beam.is_empty());
  assert_eq!(beam.sent_bytes(), 0);
}

// -----------------------------------------------------------------------------
// Beamer
// -----------------------------------------------------------------------------

#[derive(Debug)]
struct Trailer {
  name: &'static str,
}

impl CustomMeta for Trailer {
  fn as_any(&self) -> &dyn Any {
    self
  }
}

#[test]
fn beamer_translates_custom_markers() {
  let (beam, from, to) = beam(1024);

  beam.add_beamer(StdArc::new(|meta: &dyn CustomMeta| {
    let trailer: &Trailer = meta.as_any().downcast_ref::<Trailer>()?;
    Some(vec![RecvChunk::Heap(Bytes::from(format!("trailer:{}", trailer.name)))])
  }));

  let mut input: SendQueue = VecDeque::from([heap(2, b'd'), Chunk::custom(Trailer { name: "x-done" })]);
  beam.send(from, &mut input, Block::Blocking).unwrap();

  let mut out: RecvQueue = VecDeque::new();
  beam.receive(to, &mut out, Block::Blocking, None).unwrap();

  assert_eq!(out.len(), 2);
  assert_eq!(out[1].read().unwrap(), Bytes::from_static(b"trailer:x-done"));
}
