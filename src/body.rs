use std::fmt;
use std::ops::{Deref, DerefMut};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, Method, StatusCode};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::errors::{Error, Result};
use crate::socket::with_timeout;

const PIECE_SIZE: usize = 16 * 1024;
const MAX_CHUNK_LINE: u64 = 4096;

/// A body.
#[derive(Clone, PartialEq)]
pub struct Body {
  inner: Bytes,
}

impl Deref for Body {
  type Target = Bytes;

  fn deref(&self) -> &Self::Target {
    &self.inner
  }
}

impl DerefMut for Body {
  fn deref_mut(&mut self) -> &mut Self::Target {
    &mut self.inner
  }
}

impl Default for Body {
  fn default() -> Self {
    Self {
      inner: Bytes::new(),
    }
  }
}

impl From<Bytes> for Body {
  #[inline]
  fn from(b: Bytes) -> Body {
    Body { inner: b }
  }
}

impl From<String> for Body {
  #[inline]
  fn from(s: String) -> Body {
    s.into_bytes().into()
  }
}

impl From<&'static str> for Body {
  #[inline]
  fn from(s: &'static str) -> Body {
    s.as_bytes().into()
  }
}

impl From<&'static [u8]> for Body {
  #[inline]
  fn from(s: &'static [u8]) -> Body {
    Body {
      inner: Bytes::from_static(s),
    }
  }
}

impl From<Vec<u8>> for Body {
  #[inline]
  fn from(v: Vec<u8>) -> Body {
    Body { inner: v.into() }
  }
}

impl fmt::Debug for Body {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match std::str::from_utf8(&self.inner) {
      Ok(s) if s.len() <= 256 => fmt::Debug::fmt(s, f),
      Ok(_) => write!(f, "<{} bytes of text>", self.inner.len()),
      Err(_err) => write!(f, "<{} bytes>", self.inner.len()),
    }
  }
}

/// How the length of a message body is delimited on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
  /// No body at all
  Empty,
  /// Exactly this many bytes
  Length(u64),
  /// `Transfer-Encoding: chunked`
  Chunked,
  /// Everything until the peer closes (responses only)
  UntilClose,
}

impl Framing {
  /// Framing of a request body. A request without `Content-Length` or
  /// `Transfer-Encoding` has no body.
  pub fn for_request(headers: &HeaderMap) -> Result<Framing> {
    match Self::from_headers(headers)? {
      Some(framing) => Ok(framing),
      None => Ok(Framing::Empty),
    }
  }

  /// Framing of a response to a `method` request
  pub fn for_response(method: &Method, status: StatusCode, headers: &HeaderMap) -> Result<Framing> {
    if method == Method::HEAD
      || status.is_informational()
      || status == StatusCode::NO_CONTENT
      || status == StatusCode::NOT_MODIFIED
    {
      return Ok(Framing::Empty);
    }
    match Self::from_headers(headers)? {
      Some(framing) => Ok(framing),
      None => Ok(Framing::UntilClose),
    }
  }

  fn from_headers(headers: &HeaderMap) -> Result<Option<Framing>> {
    let mut chunked = false;
    for te in headers.get_all(http::header::TRANSFER_ENCODING) {
      let te = te
        .to_str()
        .map_err(|_| Error::protocol("invalid transfer-encoding"))?;
      let last = te.rsplit(',').next().unwrap_or_default().trim();
      if last.eq_ignore_ascii_case("chunked") {
        chunked = true;
      } else if !last.is_empty() {
        return Err(Error::protocol(format!("unsupported transfer-encoding {}", te)));
      }
    }
    let mut length: Option<u64> = None;
    for cl in headers.get_all(http::header::CONTENT_LENGTH) {
      let value: u64 = cl
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .ok_or_else(|| Error::protocol("invalid content-length"))?;
      if length.is_some_and(|l| l != value) {
        return Err(Error::protocol("conflicting content-length headers"));
      }
      length = Some(value);
    }
    match (chunked, length) {
      (true, Some(_)) => Err(Error::protocol(
        "both content-length and transfer-encoding present",
      )),
      (true, None) => Ok(Some(Framing::Chunked)),
      (false, Some(0)) => Ok(Some(Framing::Empty)),
      (false, Some(n)) => Ok(Some(Framing::Length(n))),
      (false, None) => Ok(None),
    }
  }

  /// Whether the body ends only with the connection
  pub fn is_until_close(&self) -> bool {
    matches!(self, Framing::UntilClose)
  }
}

/// One step of a body as read from the wire
#[derive(Debug)]
pub struct Piece {
  /// bytes exactly as they were on the wire, framing included
  pub raw: Bytes,
  /// payload bytes with chunk framing removed
  pub data: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
  Size,
  Data(u64),
  Done,
}

/// Incremental body decoder
#[derive(Debug)]
pub struct BodyReader {
  framing: Framing,
  remaining: u64,
  chunk: ChunkState,
  finished: bool,
  read_timeout: Option<Duration>,
}

impl BodyReader {
  /// Create a decoder for `framing`, bounding each read by `read_timeout`
  pub fn new(framing: Framing, read_timeout: Option<Duration>) -> Self {
    let remaining = match framing {
      Framing::Length(n) => n,
      _ => 0,
    };
    Self {
      framing,
      remaining,
      chunk: ChunkState::Size,
      finished: matches!(framing, Framing::Empty),
      read_timeout,
    }
  }

  /// Read the next piece of the body, `None` once it is complete
  pub async fn next<R>(&mut self, reader: &mut R) -> Result<Option<Piece>>
  where
    R: AsyncBufRead + Unpin,
  {
    if self.finished {
      return Ok(None);
    }
    match self.framing {
      Framing::Empty => {
        self.finished = true;
        Ok(None)
      }
      Framing::Length(_) => {
        let want = std::cmp::min(self.remaining, PIECE_SIZE as u64) as usize;
        let data = self.read_some(reader, want).await?;
        if data.is_empty() {
          return Err(Error::protocol(format!(
            "body ended {} bytes early",
            self.remaining
          )));
        }
        self.remaining -= data.len() as u64;
        if self.remaining == 0 {
          self.finished = true;
        }
        Ok(Some(Piece {
          raw: data.clone(),
          data,
        }))
      }
      Framing::UntilClose => {
        let data = self.read_some(reader, PIECE_SIZE).await?;
        if data.is_empty() {
          self.finished = true;
          return Ok(None);
        }
        Ok(Some(Piece {
          raw: data.clone(),
          data,
        }))
      }
      Framing::Chunked => self.next_chunk(reader).await,
    }
  }

  async fn next_chunk<R>(&mut self, reader: &mut R) -> Result<Option<Piece>>
  where
    R: AsyncBufRead + Unpin,
  {
    match self.chunk {
      ChunkState::Size => {
        let line = self.read_line(reader).await?;
        let size = parse_chunk_size(&line)?;
        if size == 0 {
          let mut raw = BytesMut::from(&line[..]);
          // trailer section up to the empty line
          loop {
            let trailer = self.read_line(reader).await?;
            raw.extend_from_slice(&trailer);
            if trailer == b"\r\n" || trailer == b"\n" {
              break;
            }
          }
          self.chunk = ChunkState::Done;
          self.finished = true;
          return Ok(Some(Piece {
            raw: raw.freeze(),
            data: Bytes::new(),
          }));
        }
        self.chunk = ChunkState::Data(size);
        Ok(Some(Piece {
          raw: Bytes::from(line),
          data: Bytes::new(),
        }))
      }
      ChunkState::Data(left) => {
        let want = std::cmp::min(left, PIECE_SIZE as u64) as usize;
        let data = self.read_some(reader, want).await?;
        if data.is_empty() {
          return Err(Error::protocol("chunk ended early"));
        }
        let left = left - data.len() as u64;
        if left > 0 {
          self.chunk = ChunkState::Data(left);
          return Ok(Some(Piece {
            raw: data.clone(),
            data,
          }));
        }
        let crlf = self.read_line(reader).await?;
        if crlf != b"\r\n" && crlf != b"\n" {
          return Err(Error::protocol("missing CRLF after chunk"));
        }
        self.chunk = ChunkState::Size;
        let mut raw = BytesMut::with_capacity(data.len() + crlf.len());
        raw.extend_from_slice(&data);
        raw.extend_from_slice(&crlf);
        Ok(Some(Piece {
          raw: raw.freeze(),
          data,
        }))
      }
      ChunkState::Done => {
        self.finished = true;
        Ok(None)
      }
    }
  }

  async fn read_some<R>(&self, reader: &mut R, want: usize) -> Result<Bytes>
  where
    R: AsyncBufRead + Unpin,
  {
    let mut buf = vec![0; want];
    let n = with_timeout(self.read_timeout, reader.read(&mut buf)).await?;
    buf.truncate(n);
    Ok(Bytes::from(buf))
  }

  async fn read_line<R>(&self, reader: &mut R) -> Result<Vec<u8>>
  where
    R: AsyncBufRead + Unpin,
  {
    let mut line = Vec::new();
    let mut limited = reader.take(MAX_CHUNK_LINE);
    let n = with_timeout(self.read_timeout, limited.read_until(b'\n', &mut line)).await?;
    if n == 0 {
      return Err(Error::protocol("body ended inside chunk framing"));
    }
    if !line.ends_with(b"\n") {
      return Err(Error::protocol("chunk line too long"));
    }
    Ok(line)
  }
}

fn parse_chunk_size(line: &[u8]) -> Result<u64> {
  let line = std::str::from_utf8(line).map_err(|_| Error::protocol("invalid chunk size"))?;
  let size = line.trim_end().split(';').next().unwrap_or_default().trim();
  u64::from_str_radix(size, 16).map_err(|_| Error::protocol(format!("invalid chunk size {:?}", size)))
}

/// Relay a body verbatim from `reader` to `writer`, returning the number of
/// wire bytes written.
pub async fn relay<R, W>(
  body: &mut BodyReader,
  reader: &mut R,
  writer: &mut W,
  write_timeout: Option<Duration>,
) -> Result<u64>
where
  R: AsyncBufRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let mut written = 0;
  while let Some(piece) = body.next(reader).await? {
    with_timeout(write_timeout, writer.write_all(&piece.raw)).await?;
    written += piece.raw.len() as u64;
  }
  Ok(written)
}

/// Result of buffering a body for inspection
#[derive(Debug)]
pub enum Collected {
  /// The whole payload fit under the cap
  Complete(Bytes),
  /// The cap was hit; holds the wire bytes consumed so far, which must be
  /// written out before relaying the rest.
  Overflow(Bytes),
}

/// Buffer a body up to `cap` payload bytes
pub async fn collect<R>(body: &mut BodyReader, reader: &mut R, cap: usize) -> Result<Collected>
where
  R: AsyncBufRead + Unpin,
{
  let mut raw = BytesMut::new();
  let mut data = BytesMut::new();
  while let Some(piece) = body.next(reader).await? {
    raw.extend_from_slice(&piece.raw);
    data.extend_from_slice(&piece.data);
    if data.len() > cap {
      tracing::debug!("Inspection buffer passed {} bytes, relaying the rest", cap);
      return Ok(Collected::Overflow(raw.freeze()));
    }
  }
  Ok(Collected::Complete(data.freeze()))
}

#[cfg(test)]
mod tests {
  use super::*;
  use http::HeaderValue;

  fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (k, v) in pairs {
      map.append(*k, HeaderValue::from_static(v));
    }
    map
  }

  #[test]
  fn framing_rules() {
    assert_eq!(Framing::for_request(&headers(&[])).unwrap(), Framing::Empty);
    assert_eq!(
      Framing::for_request(&headers(&[("content-length", "5")])).unwrap(),
      Framing::Length(5)
    );
    assert_eq!(
      Framing::for_response(&Method::GET, StatusCode::OK, &headers(&[])).unwrap(),
      Framing::UntilClose
    );
    assert_eq!(
      Framing::for_response(
        &Method::HEAD,
        StatusCode::OK,
        &headers(&[("content-length", "5")])
      )
      .unwrap(),
      Framing::Empty
    );
    assert!(Framing::for_request(&headers(&[
      ("content-length", "5"),
      ("transfer-encoding", "chunked")
    ]))
    .is_err());
    assert!(Framing::for_request(&headers(&[("content-length", "x")])).is_err());
  }

  #[tokio::test]
  async fn chunked_body_decodes_and_keeps_wire_bytes() {
    let wire: &[u8] = b"5;ext=1\r\nhello\r\n6\r\n world\r\n0\r\nx-trailer: 1\r\n\r\nNEXT";
    let mut reader = tokio::io::BufReader::new(wire);
    let mut body = BodyReader::new(Framing::Chunked, None);
    let mut raw = Vec::new();
    let mut data = Vec::new();
    while let Some(piece) = body.next(&mut reader).await.unwrap() {
      raw.extend_from_slice(&piece.raw);
      data.extend_from_slice(&piece.data);
    }
    assert_eq!(data, b"hello world");
    assert_eq!(raw, &wire[..wire.len() - 4]);
    let mut rest = String::new();
    reader.read_to_string(&mut rest).await.unwrap();
    assert_eq!(rest, "NEXT");
  }

  #[tokio::test]
  async fn collect_reports_overflow_with_consumed_bytes() {
    let wire = vec![b'a'; 100];
    let mut reader = tokio::io::BufReader::new(&wire[..]);
    let mut body = BodyReader::new(Framing::Length(100), None);
    match collect(&mut body, &mut reader, 10).await.unwrap() {
      Collected::Overflow(raw) => {
        let mut out = raw.to_vec();
        relay(&mut body, &mut reader, &mut out, None).await.unwrap();
        assert_eq!(out, wire);
      }
      Collected::Complete(_) => panic!("expected overflow"),
    }
  }

  #[tokio::test]
  async fn short_length_body_is_a_protocol_error() {
    let wire: &[u8] = b"abc";
    let mut reader = tokio::io::BufReader::new(wire);
    let mut body = BodyReader::new(Framing::Length(10), None);
    assert!(collect(&mut body, &mut reader, 100).await.is_err());
  }
}
