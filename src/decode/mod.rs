// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Content-decoding pipeline for captured bodies.
//!
//! [`decompress`] turns a compressed byte stream into a plaintext one,
//! according to a `Content-Encoding` header value. It only ever sees the
//! *copy* of a body that goes to a logging sink; wire bytes are never
//! decoded.
//!
//! The `flate2` and `brotli` decoders are synchronous `Read` adapters, so
//! each decoded stream gets a worker on tokio's blocking pool. The worker
//! pulls raw chunks from the async side, decodes, and hands plaintext back
//! through a small bounded channel.
//!
//! If the data turns out to be corrupt, the decoded stream carries an
//! `X-Decompression-Error` marker line followed by the raw bytes instead of
//! failing. When no plaintext had been produced yet the raw body replays
//! from its first byte (up to 64 KiB). Otherwise the raw bytes resume at
//! the first byte the decoders had not yet pulled from the source; input
//! already buffered inside `flate2`/`brotli` is not repeated, so the raw
//! tail is a suffix of the body, not necessarily the exact remainder after
//! the last decoded byte.


use bytes::{Buf, Bytes};
use flate2::read::{DeflateDecoder, MultiGzDecoder, ZlibDecoder};
use futures_util::stream::{self, BoxStream, StreamExt};
use std::cell::RefCell;
use std::fmt;
use std::io::{self, Cursor, Read};
use std::rc::Rc;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

/// A boxed stream of body chunks.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// Name of the marker emitted when decoding fails.
pub const DECODE_ERROR_HEADER: &str = "X-Decompression-Error";

const CHUNK_SIZE: usize = 16 * 1024;
const REPLAY_LIMIT: usize = 64 * 1024;
const DECODED_QUEUE: usize = 8;

/// Reasons an encoding header cannot be decoded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unsupported content encoding '{0}'")]
    Unsupported(String),

    #[error("unknown content encoding '{0}'")]
    Unknown(String),

    #[error("content decoding requires a tokio runtime")]
    NoRuntime,
}

/// A single supported content coding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Gzip,
    Deflate,
    Brotli,
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Encoding::Gzip => write!(f, "gzip"),
            Encoding::Deflate => write!(f, "deflate"),
            Encoding::Brotli => write!(f, "br"),
        }
    }
}

/// Parse a `Content-Encoding` value into codings, in the order they were
/// applied. `identity` and empty items are dropped.
pub fn parse_encodings(header: &str) -> Result<Vec<Encoding>, DecodeError> {
    let mut encodings = Vec::new();

    for token in header.split(',') {
        let token = token.trim().to_ascii_lowercase();
        match token.as_str() {
            "" | "identity" => {}
            "gzip" | "x-gzip" => encodings.push(Encoding::Gzip),
            "deflate" => encodings.push(Encoding::Deflate),
            "br" => encodings.push(Encoding::Brotli),
            "compress" | "x-compress" => return Err(DecodeError::Unsupported(token)),
            _ => return Err(DecodeError::Unknown(token)),
        }
    }

    Ok(encodings)
}

/// Wrap `stream` so that it yields the body with every coding in
/// `encoding` undone, last-applied first.
///
/// Passthrough when the header is empty or only `identity`.
pub fn decompress(stream: ByteStream, encoding: &str) -> Result<ByteStream, DecodeError> {
    let encodings = parse_encodings(encoding)?;
    if encodings.is_empty() {
        return Ok(stream);
    }
    let handle = Handle::try_current().map_err(|_| DecodeError::NoRuntime)?;
    Ok(decode_stream(stream, encodings, &handle))
}

/// Decode `stream` with already-parsed codings on `handle`'s blocking pool.
pub fn decode_stream(
    stream: ByteStream,
    encodings: Vec<Encoding>,
    handle: &Handle,
) -> ByteStream {
    if encodings.is_empty() {
        return stream;
    }

    let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(DECODED_QUEUE);
    let worker_handle = handle.clone();
    handle.spawn_blocking(move || {
        let worker = DecodeWorker::new(stream, worker_handle, tx);
        worker.run(&encodings);
    });

    receiver_stream(rx)
}

fn receiver_stream(rx: mpsc::Receiver<io::Result<Bytes>>) -> ByteStream {
    stream::unfold(rx, |mut rx| async move {
        let item = rx.recv().await?;
        Some((item, rx))
    })
    .boxed()
}

/// Raw bytes as pulled from the async stream, shared between the decoder
/// chain and the fallback path.
struct RawSource {
    stream: ByteStream,
    handle: Handle,
    pending: Bytes,
    /// Copy of everything handed to the decoder while no output exists yet
    replay: Option<Vec<u8>>,
    /// Set when the *source* failed, as opposed to the decoder
    source_error: Option<io::Error>,
}

impl RawSource {
    fn next_chunk(&mut self) -> io::Result<Option<Bytes>> {
        match self.handle.block_on(self.stream.next()) {
            Some(Ok(chunk)) => Ok(Some(chunk)),
            Some(Err(e)) => {
                let message = e.to_string();
                self.source_error = Some(e);
                Err(io::Error::other(message))
            }
            None => Ok(None),
        }
    }
}

#[derive(Clone)]
struct SharedSource(Rc<RefCell<RawSource>>);

impl Read for SharedSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut src = self.0.borrow_mut();

        while src.pending.is_empty() {
            match src.next_chunk()? {
                Some(chunk) => src.pending = chunk,
                None => return Ok(0),
            }
        }

        let n = buf.len().min(src.pending.len());
        buf[..n].copy_from_slice(&src.pending[..n]);

        let overflow = match src.replay.as_mut() {
            Some(replay) if replay.len() + n <= REPLAY_LIMIT => {
                replay.extend_from_slice(&buf[..n]);
                false
            }
            Some(_) => true,
            None => false,
        };
        if overflow {
            src.replay = None;
        }

        src.pending.advance(n);
        Ok(n)
    }
}

enum Outcome {
    Finished,
    ReceiverGone,
}

struct DecodeWorker {
    source: SharedSource,
    tx: mpsc::Sender<io::Result<Bytes>>,
    produced: bool,
}

impl DecodeWorker {
    fn new(stream: ByteStream, handle: Handle, tx: mpsc::Sender<io::Result<Bytes>>) -> Self {
        let source = RawSource {
            stream,
            handle,
            pending: Bytes::new(),
            replay: Some(Vec::new()),
            source_error: None,
        };
        Self {
            source: SharedSource(Rc::new(RefCell::new(source))),
            tx,
            produced: false,
        }
    }

    fn run(mut self, encodings: &[Encoding]) {
        let result = build_chain(self.source.clone(), encodings)
            .and_then(|mut reader| self.pump(&mut reader));

        let err = match result {
            Ok(Outcome::Finished) | Ok(Outcome::ReceiverGone) => return,
            Err(err) => err,
        };

        let source_error = self.source.0.borrow_mut().source_error.take();
        if let Some(source_error) = source_error {
            let _ = self.tx.blocking_send(Err(source_error));
            return;
        }

        log::debug!("Falling back to raw body after decode failure: {}", err);
        self.fall_back(&err);
    }

    fn pump(&mut self, reader: &mut dyn Read) -> io::Result<Outcome> {
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => return Ok(Outcome::Finished),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };

            if !self.produced {
                self.produced = true;
                self.source.0.borrow_mut().replay = None;
            }

            if !self.send(Bytes::copy_from_slice(&buf[..n])) {
                return Ok(Outcome::ReceiverGone);
            }
        }
    }

    /// Emit the marker line, then whatever raw bytes can still be recovered:
    /// the replay buffer if nothing was decoded, otherwise only what the
    /// decoders never pulled.
    fn fall_back(&mut self, err: &io::Error) {
        let marker = format!("\r\n{DECODE_ERROR_HEADER}: {err}\r\n");
        if !self.send(Bytes::from(marker)) {
            return;
        }

        let (replay, pending) = {
            let mut src = self.source.0.borrow_mut();
            let replay = if self.produced { None } else { src.replay.take() };
            (replay, std::mem::take(&mut src.pending))
        };

        for chunk in [replay.map(Bytes::from), Some(pending)].into_iter().flatten() {
            if !chunk.is_empty() && !self.send(chunk) {
                return;
            }
        }

        loop {
            let next = self.source.0.borrow_mut().next_chunk();
            match next {
                Ok(Some(chunk)) => {
                    if !self.send(chunk) {
                        return;
                    }
                }
                Ok(None) => return,
                Err(_) => {
                    if let Some(e) = self.source.0.borrow_mut().source_error.take() {
                        let _ = self.tx.blocking_send(Err(e));
                    }
                    return;
                }
            }
        }
    }

    fn send(&self, chunk: Bytes) -> bool {
        self.tx.blocking_send(Ok(chunk)).is_ok()
    }
}

/// Stack decoders so the last-applied coding is undone first.
fn build_chain(source: SharedSource, encodings: &[Encoding]) -> io::Result<Box<dyn Read>> {
    let mut reader: Box<dyn Read> = Box::new(source);
    for encoding in encodings.iter().rev() {
        reader = match encoding {
            Encoding::Gzip => Box::new(MultiGzDecoder::new(reader)),
            Encoding::Deflate => deflate_reader(reader)?,
            Encoding::Brotli => Box::new(brotli::Decompressor::new(reader, CHUNK_SIZE)),
        };
    }
    Ok(reader)
}

/// `deflate` is zlib-wrapped per RFC 9110 but raw deflate is common in the
/// wild; sniff the first two bytes to tell them apart.
fn deflate_reader(mut inner: Box<dyn Read>) -> io::Result<Box<dyn Read>> {
    let mut head = [0u8; 2];
    let mut filled = 0;
    while filled < head.len() {
        match inner.read(&mut head[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    let zlib = filled == 2 && is_zlib_header(head[0], head[1]);
    let reader = Read::chain(Cursor::new(head[..filled].to_vec()), inner);

    Ok(if zlib {
        Box::new(ZlibDecoder::new(reader))
    } else {
        Box::new(DeflateDecoder::new(reader))
    })
}

fn is_zlib_header(cmf: u8, flg: u8) -> bool {
    cmf & 0x0f == 8 && (u16::from(cmf) << 8 | u16::from(flg)) % 31 == 0
}
