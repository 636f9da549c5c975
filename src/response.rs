use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Version};
use std::collections::HashMap;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::body::Body;
use crate::errors::{Error, Result};
use crate::{COLON_SPACE, CR_LF, SPACE};

/// A response head plus, once buffered, its body.
#[derive(Debug, Default, Clone)]
pub struct Response {
  version: Version,
  status_code: StatusCode,
  reason: Option<String>,
  headers: HeaderMap<HeaderValue>,
  header_order: HeaderOrder,
  body: Option<Body>,
}

impl PartialEq for Response {
  fn eq(&self, other: &Self) -> bool {
    self.version == other.version
      && self.status_code == other.status_code
      && self.headers == other.headers
      && self.body == other.body
  }
}

impl<T> From<http::Response<T>> for Response
where
  T: Into<Body>,
{
  fn from(value: http::Response<T>) -> Self {
    let (parts, body) = value.into_parts();
    let body = body.into();
    Self {
      version: parts.version,
      status_code: parts.status,
      reason: None,
      headers: parts.headers,
      header_order: HeaderOrder::default(),
      body: if body.is_empty() { None } else { Some(body) },
    }
  }
}

impl Response {
  /// Serialize the status line and headers. The body is written separately
  /// so that it can be streamed.
  pub(crate) fn to_raw(&self) -> Bytes {
    let mut http_response = Vec::new();
    http_response.extend(format!("{:?}", self.version).as_bytes());
    http_response.extend(SPACE);
    http_response.extend(self.status_code.as_str().as_bytes());
    http_response.extend(SPACE);
    http_response.extend(self.reason_phrase().as_bytes());
    http_response.extend(CR_LF);
    write_headers(&mut http_response, &self.headers, &self.header_order);
    http_response.extend(CR_LF);
    Bytes::from(http_response)
  }
  /// An HTTP response builder
  ///
  /// This type can be used to construct an instance of `Response` through a
  /// builder-like pattern.
  pub fn builder() -> http::response::Builder {
    http::response::Builder::new()
  }

  /// A complete response generated by the proxy itself, closing the
  /// connection unless `keep_alive`.
  pub fn synthesized(status: StatusCode, message: impl Into<String>, keep_alive: bool) -> Self {
    let message = message.into();
    let mut headers = HeaderMap::new();
    headers.insert(
      http::header::CONTENT_TYPE,
      HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(http::header::CONTENT_LENGTH, HeaderValue::from(message.len()));
    headers.insert(
      http::header::CONNECTION,
      HeaderValue::from_static(if keep_alive { "keep-alive" } else { "close" }),
    );
    Self {
      version: Version::HTTP_11,
      status_code: status,
      reason: None,
      headers,
      header_order: HeaderOrder::default(),
      body: Some(Body::from(message)),
    }
  }

  /// `502 Bad Gateway` for an upstream that could not be reached
  pub fn bad_gateway(reason: &Error, keep_alive: bool) -> Self {
    Self::synthesized(
      StatusCode::BAD_GATEWAY,
      format!("twiproxy: {}\n", reason),
      keep_alive,
    )
  }

  /// `504 Gateway Timeout` for an upstream that did not answer in time
  pub fn gateway_timeout(reason: &Error, keep_alive: bool) -> Self {
    Self::synthesized(
      StatusCode::GATEWAY_TIMEOUT,
      format!("twiproxy: {}\n", reason),
      keep_alive,
    )
  }
}

impl Response {
  /// Get the `StatusCode` of this `Response`.
  #[inline]
  pub fn status_code(&self) -> StatusCode {
    self.status_code
  }
  /// Get a mutable reference to the `StatusCode`.
  #[inline]
  pub fn status_code_mut(&mut self) -> &mut StatusCode {
    self.reason = None;
    &mut self.status_code
  }
  /// Reason phrase as received, or the canonical one
  pub fn reason_phrase(&self) -> &str {
    match &self.reason {
      Some(reason) => reason,
      None => self.status_code.canonical_reason().unwrap_or(""),
    }
  }
  /// Get the HTTP `Version` of this `Response`.
  #[inline]
  pub fn version(&self) -> Version {
    self.version
  }
  /// Get the `Headers` of this `Response`.
  #[inline]
  pub fn headers(&self) -> &HeaderMap {
    &self.headers
  }
  /// Get a mutable reference to the `Headers` of this `Response`.
  #[inline]
  pub fn headers_mut(&mut self) -> &mut HeaderMap {
    &mut self.headers
  }
  /// Get the content-length of the response, if it is known.
  pub fn content_length(&self) -> Option<u64> {
    self
      .headers
      .get(http::header::CONTENT_LENGTH)
      .and_then(|x| x.to_str().ok()?.parse().ok())
  }
  /// The buffered body, if any
  pub fn body(&self) -> Option<&Body> {
    self.body.as_ref()
  }
  /// Mutable access to the buffered body
  pub fn body_mut(&mut self) -> &mut Option<Body> {
    &mut self.body
  }
  /// Get the response text, lossily decoded as UTF-8.
  pub fn text(&self) -> String {
    self
      .body
      .as_ref()
      .map(|b| String::from_utf8_lossy(b).to_string())
      .unwrap_or_default()
  }
}

/// Reads a response head off an upstream stream.
#[derive(Debug)]
pub struct ResponseBuilder<'a, R> {
  reader: &'a mut R,
  budget: usize,
}

impl<'a, R: AsyncBufRead + Unpin> ResponseBuilder<'a, R> {
  /// Read from `reader`, refusing heads larger than `max_head_size`.
  pub fn new(reader: &'a mut R, max_head_size: usize) -> ResponseBuilder<'a, R> {
    ResponseBuilder {
      reader,
      budget: max_head_size,
    }
  }

  async fn parser_version(&mut self) -> Result<(Version, StatusCode, Option<String>)> {
    let line = loop {
      let line = read_head_line(self.reader, &mut self.budget).await?;
      if line.is_empty() {
        return Err(Error::protocol("upstream closed before sending a response"));
      }
      // tolerate stray blank lines before the status line
      if line != b"\r\n" && line != b"\n" {
        break line;
      }
    };
    let line = line.strip_suffix(b"\n").unwrap_or(&line[..]);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let mut parts = line.splitn(3, |b| b == &b' ');
    let version = match parts.next() {
      Some(b"HTTP/1.0") => Version::HTTP_10,
      Some(b"HTTP/1.1") => Version::HTTP_11,
      _ => return Err(Error::protocol("invalid http version in status line")),
    };
    let status = parts
      .next()
      .ok_or_else(|| Error::protocol("missing status code"))
      .and_then(|sc| {
        StatusCode::from_bytes(sc).map_err(|_| Error::protocol("invalid status code"))
      })?;
    let reason = parts
      .next()
      .map(|r| String::from_utf8_lossy(r).to_string())
      .filter(|r| Some(r.as_str()) != status.canonical_reason());
    Ok((version, status, reason))
  }

  /// Read the status line and headers. The body stays on the stream.
  pub async fn build_head(mut self) -> Result<Response> {
    let (version, status_code, reason) = self.parser_version().await?;
    let (headers, header_order) = read_headers(self.reader, &mut self.budget).await?;
    Ok(Response {
      version,
      status_code,
      reason,
      headers,
      header_order,
      body: None,
    })
  }
}

/// Read one CRLF-terminated line, charging it to `budget`. An empty vector
/// means the stream ended before any byte.
pub(crate) async fn read_head_line<R>(reader: &mut R, budget: &mut usize) -> Result<Vec<u8>>
where
  R: AsyncBufRead + Unpin,
{
  let mut line = Vec::new();
  let n = (&mut *reader)
    .take(*budget as u64 + 1)
    .read_until(b'\n', &mut line)
    .await?;
  if n > *budget {
    return Err(Error::protocol("message head too large"));
  }
  *budget -= n;
  if n > 0 && !line.ends_with(b"\n") {
    return Err(Error::protocol("message head ended mid-line"));
  }
  Ok(line)
}

/// Header names exactly as they appeared on the wire, one entry per line
pub(crate) type HeaderOrder = Vec<(Bytes, HeaderName)>;

/// Read header lines up to and including the blank line
pub(crate) async fn read_headers<R>(reader: &mut R, budget: &mut usize) -> Result<(HeaderMap, HeaderOrder)>
where
  R: AsyncBufRead + Unpin,
{
  let mut headers = HeaderMap::new();
  let mut order = HeaderOrder::new();
  loop {
    let header_line = read_head_line(reader, budget).await?;
    if header_line.is_empty() {
      return Err(Error::protocol("message head ended before blank line"));
    }
    if header_line == b"\r\n" || header_line == b"\n" {
      break;
    }
    match parser_headers(&header_line)? {
      (Some(k), Some(v)) => {
        let raw = header_line.split(|b| b == &b':').next().unwrap_or_default();
        order.push((Bytes::copy_from_slice(raw), k.clone()));
        headers.append(k, v);
      }
      _ => return Err(Error::protocol("header line without colon")),
    }
  }
  Ok((headers, order))
}

/// Write `headers` in wire order with their original spelling. Lines whose
/// header was removed are dropped; headers added since are written last.
pub(crate) fn write_headers(out: &mut Vec<u8>, headers: &HeaderMap, order: &[(Bytes, HeaderName)]) {
  let mut written: HashMap<&HeaderName, usize> = HashMap::new();
  for (raw, name) in order {
    let seen = written.entry(name).or_insert(0);
    if let Some(value) = headers.get_all(name).iter().nth(*seen) {
      *seen += 1;
      write_header_line(out, raw, value);
    }
  }
  for name in headers.keys() {
    let seen = written.get(name).copied().unwrap_or(0);
    for value in headers.get_all(name).iter().skip(seen) {
      write_header_line(out, name.as_str().as_bytes(), value);
    }
  }
}

fn write_header_line(out: &mut Vec<u8>, name: &[u8], value: &HeaderValue) {
  out.extend(name);
  out.extend(COLON_SPACE);
  out.extend(value.as_bytes());
  out.extend(CR_LF);
}

pub(crate) fn parser_headers(
  buffer: &[u8],
) -> Result<(Option<http::HeaderName>, Option<http::HeaderValue>)> {
  let mut k = None;
  let mut v = None;
  let buffer = buffer.strip_suffix(b"\n").unwrap_or(buffer);
  let buffer = buffer.strip_suffix(b"\r").unwrap_or(buffer);
  for (index, h) in buffer.splitn(2, |s| s == &b':').enumerate() {
    match index {
      0 => match http::HeaderName::from_bytes(h) {
        Ok(hk) => k = Some(hk),
        Err(err) => {
          return Err(Error::protocol(format!("invalid header name: {}", err)));
        }
      },
      1 => match http::HeaderValue::from_bytes(h.trim_ascii()) {
        Ok(hv) => v = Some(hv),
        Err(err) => {
          return Err(Error::protocol(format!("invalid header value: {}", err)));
        }
      },
      _ => {}
    }
  }
  Ok((k, v))
}
