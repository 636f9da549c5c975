use std::fmt::{Debug, Formatter};

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, Version};
use tokio::io::AsyncBufRead;

use crate::body::Body;
use crate::connector::Scheme;
use crate::errors::{Error, Result};
use crate::response::{read_head_line, read_headers, write_headers, HeaderOrder};
use crate::{CR_LF, SPACE};

/// Headers that describe one hop only and are never forwarded.
const HOP_BY_HOP: [&str; 8] = [
  "connection",
  "keep-alive",
  "proxy-connection",
  "proxy-authenticate",
  "proxy-authorization",
  "te",
  "trailer",
  "upgrade",
];

/// A request head plus, once buffered, its body.
#[derive(Default, Clone, PartialEq)]
pub struct Request {
  uri: http::Uri,
  version: Version,
  method: Method,
  headers: HeaderMap<HeaderValue>,
  header_order: HeaderOrder,
  body: Option<Body>,
}

impl Debug for Request {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Request")
      .field("uri", &self.uri)
      .field("version", &self.version)
      .field("method", &self.method)
      .field("headers", &self.headers)
      .field("body", &self.body)
      .finish()
  }
}

impl<T> From<http::Request<T>> for Request
where
  T: Into<Body>,
{
  fn from(value: http::Request<T>) -> Self {
    let (parts, body) = value.into_parts();
    let body = body.into();
    Self {
      uri: parts.uri,
      version: parts.version,
      method: parts.method,
      headers: parts.headers,
      header_order: HeaderOrder::default(),
      body: if body.is_empty() { None } else { Some(body) },
    }
  }
}

impl Request {
  /// Serialize the request line and headers. Bodies are written separately.
  pub(crate) fn to_raw(&self) -> Bytes {
    let mut http_requests = Vec::new();
    http_requests.extend(self.method.as_str().as_bytes());
    http_requests.extend(SPACE);
    if self.method == Method::CONNECT {
      if let Some(authority) = self.uri.authority() {
        http_requests.extend(authority.as_str().as_bytes());
      }
    } else if self.uri.scheme().is_some() {
      http_requests.extend(self.uri.to_string().as_bytes());
    } else {
      let target = self.uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
      http_requests.extend(target.as_bytes());
    }
    http_requests.extend(SPACE);
    http_requests.extend(format!("{:?}", self.version).as_bytes());
    http_requests.extend(CR_LF);
    write_headers(&mut http_requests, &self.headers, &self.header_order);
    http_requests.extend(CR_LF);
    Bytes::from(http_requests)
  }
  /// Creates a new builder-style object to manufacture a `Request`
  pub fn builder() -> http::request::Builder {
    http::request::Builder::new()
  }
}

impl Request {
  /// Get the HTTP `Method` of this `Request`.
  #[inline]
  pub fn method(&self) -> &Method {
    &self.method
  }
  /// Get a mutable reference to the `Method`.
  #[inline]
  pub fn method_mut(&mut self) -> &mut Method {
    &mut self.method
  }
  /// Get the request target as a `Uri`.
  #[inline]
  pub fn uri(&self) -> &http::Uri {
    &self.uri
  }
  /// Get a mutable reference to the target.
  #[inline]
  pub fn uri_mut(&mut self) -> &mut http::Uri {
    &mut self.uri
  }
  /// Get the `Headers` of this `Request`.
  #[inline]
  pub fn headers(&self) -> &HeaderMap {
    &self.headers
  }
  /// Get a mutable reference to the `Headers`.
  #[inline]
  pub fn headers_mut(&mut self) -> &mut HeaderMap {
    &mut self.headers
  }
  /// The buffered body, if any
  #[inline]
  pub fn body(&self) -> Option<&Body> {
    self.body.as_ref()
  }
  /// Mutable access to the buffered body
  #[inline]
  pub fn body_mut(&mut self) -> &mut Option<Body> {
    &mut self.body
  }
  /// Get the HTTP `Version` of this `Request`.
  #[inline]
  pub fn version(&self) -> Version {
    self.version
  }
  /// Get a mutable reference to the `Version`.
  #[inline]
  pub fn version_mut(&mut self) -> &mut Version {
    &mut self.version
  }

  /// Whether the client asked to keep the connection open after this
  /// exchange. HTTP/1.1 defaults to yes, HTTP/1.0 to no.
  pub fn wants_keep_alive(&self) -> bool {
    keep_alive(self.version, &self.headers)
  }

  /// `host` and `port` of the CONNECT target
  pub fn connect_target(&self) -> Result<(String, u16)> {
    let authority = self
      .uri
      .authority()
      .ok_or_else(|| Error::protocol("CONNECT without host:port"))?;
    let port = authority
      .port_u16()
      .ok_or_else(|| Error::protocol(format!("CONNECT {} without port", authority)))?;
    let host = authority.host();
    if host.is_empty() {
      return Err(Error::protocol("CONNECT with empty host"));
    }
    Ok((host.trim_start_matches('[').trim_end_matches(']').to_string(), port))
  }

  /// Where this request should go: the absolute-form target if there is
  /// one, otherwise the `Host` header under `default_scheme`.
  pub fn destination(&self, default_scheme: Scheme) -> Result<(String, u16, Scheme)> {
    if let Some(authority) = self.uri.authority() {
      let scheme = match self.uri.scheme_str() {
        Some(s) if s.eq_ignore_ascii_case("https") => Scheme::Https,
        Some(s) if s.eq_ignore_ascii_case("http") => Scheme::Http,
        Some(s) => return Err(Error::protocol(format!("unsupported scheme {}", s))),
        None => default_scheme,
      };
      let port = authority.port_u16().unwrap_or(scheme.default_port());
      let host = authority.host().trim_start_matches('[').trim_end_matches(']');
      return Ok((host.to_string(), port, scheme));
    }
    let host = self
      .headers
      .get(http::header::HOST)
      .and_then(|h| h.to_str().ok())
      .ok_or_else(|| Error::protocol("request without Host header"))?;
    let authority: http::uri::Authority = host
      .parse()
      .map_err(|_| Error::protocol(format!("invalid Host header {}", host)))?;
    let port = authority.port_u16().unwrap_or(default_scheme.default_port());
    let host = authority.host().trim_start_matches('[').trim_end_matches(']');
    Ok((host.to_string(), port, default_scheme))
  }

  /// Rewrite an absolute-form target to origin-form, moving the authority
  /// into `Host` when the client did not send one.
  pub fn into_origin_form(&mut self) -> Result<()> {
    if self.uri.scheme().is_none() {
      return Ok(());
    }
    if let Some(authority) = self.uri.authority() {
      if !self.headers.contains_key(http::header::HOST) {
        let value = HeaderValue::from_str(authority.as_str())?;
        self.headers.insert(http::header::HOST, value);
      }
    }
    let path = self
      .uri
      .path_and_query()
      .map(|pq| pq.as_str().to_string())
      .unwrap_or_else(|| "/".to_string());
    self.uri = path
      .parse()
      .map_err(|_| Error::protocol(format!("invalid request path {}", path)))?;
    Ok(())
  }

  /// Full URL of this request as seen by the client, for observers.
  /// Without a `Host` header the authority is built from `host` and `port`.
  pub fn url(&self, scheme: Scheme, host: &str, port: u16) -> String {
    if self.uri.scheme().is_some() {
      return self.uri.to_string();
    }
    let authority = match self
      .headers
      .get(http::header::HOST)
      .and_then(|h| h.to_str().ok())
    {
      Some(authority) => authority.to_string(),
      None if port == scheme.default_port() => host.to_string(),
      None => format!("{}:{}", host, port),
    };
    let path = self.uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    format!("{}://{}{}", scheme.as_str(), authority, path)
  }
}

/// Reads a request head off a client stream.
#[derive(Debug)]
pub struct RequestBuilder<'a, R> {
  reader: &'a mut R,
  budget: usize,
}

impl<'a, R: AsyncBufRead + Unpin> RequestBuilder<'a, R> {
  /// Read from `reader`, refusing heads larger than `max_head_size`.
  pub fn new(reader: &'a mut R, max_head_size: usize) -> RequestBuilder<'a, R> {
    RequestBuilder {
      reader,
      budget: max_head_size,
    }
  }

  /// Read the request line and headers. `None` when the client closed the
  /// connection cleanly between exchanges.
  pub async fn build_head(mut self) -> Result<Option<Request>> {
    let line = loop {
      let line = read_head_line(self.reader, &mut self.budget).await?;
      if line.is_empty() {
        return Ok(None);
      }
      if line != b"\r\n" && line != b"\n" {
        break line;
      }
    };
    let (method, uri, version) = parse_request_line(&line)?;
    let (headers, header_order) = read_headers(self.reader, &mut self.budget).await?;
    Ok(Some(Request {
      uri,
      version,
      method,
      headers,
      header_order,
      body: None,
    }))
  }
}

/// Split `METHOD SP target SP HTTP/1.x`
pub(crate) fn parse_request_line(line: &[u8]) -> Result<(Method, http::Uri, Version)> {
  let line = line.strip_suffix(b"\n").unwrap_or(line);
  let line = line.strip_suffix(b"\r").unwrap_or(line);
  let mut parts = line.split(|b| b == &b' ');
  let (Some(method), Some(target), Some(version), None) =
    (parts.next(), parts.next(), parts.next(), parts.next())
  else {
    return Err(Error::protocol(format!(
      "malformed request line {:?}",
      String::from_utf8_lossy(line)
    )));
  };
  let method =
    Method::from_bytes(method).map_err(|_| Error::protocol("invalid request method"))?;
  let uri = http::Uri::try_from(target)
    .map_err(|_| Error::protocol(format!("invalid request target {:?}", String::from_utf8_lossy(target))))?;
  let version = match version {
    b"HTTP/1.1" => Version::HTTP_11,
    b"HTTP/1.0" => Version::HTTP_10,
    _ => return Err(Error::protocol("unsupported http version")),
  };
  Ok((method, uri, version))
}

pub(crate) fn keep_alive(version: Version, headers: &HeaderMap) -> bool {
  let mut close = false;
  let mut keep = false;
  for value in headers.get_all(http::header::CONNECTION) {
    for token in value.to_str().unwrap_or_default().split(',') {
      let token = token.trim();
      close |= token.eq_ignore_ascii_case("close");
      keep |= token.eq_ignore_ascii_case("keep-alive");
    }
  }
  if close {
    return false;
  }
  version == Version::HTTP_11 || keep
}

/// Remove hop-by-hop headers, including any named by `Connection`.
/// `Transfer-Encoding` is left for the caller, which re-frames the body.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
  let named: Vec<HeaderName> = headers
    .get_all(http::header::CONNECTION)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(','))
    .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
    .collect();
  for name in named {
    headers.remove(name);
  }
  for name in HOP_BY_HOP {
    headers.remove(name);
  }
}
