//! One request/response pair flowing through the proxy

use crate::connector::Scheme;
use crate::request::Request;
use crate::response::Response;
use std::fmt;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

/// How much of the response body the response interceptors got to see
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inspection {
  /// The full body is in [`Response::body`]
  Complete,
  /// The body passed `limit` bytes; it was relayed unmodified and
  /// [`Response::body`] is `None`
  Truncated {
    /// the inspection cap in effect
    limit: usize,
  },
  /// Nobody asked for the body and it was streamed straight through
  Skipped,
}

/// A single exchange owned by the connection that produced it.
#[derive(Clone)]
pub struct HttpExchange {
  id: u64,
  client: Option<SocketAddr>,
  scheme: Scheme,
  host: String,
  port: u16,
  url: String,
  timestamp: u64,
  request: Request,
  response: Option<Response>,
  inspection: Inspection,
  failure: Option<String>,
}

impl HttpExchange {
  /// Wrap a request received from `client`, bound for `host:port`
  pub fn new(
    id: u64,
    client: Option<SocketAddr>,
    scheme: Scheme,
    host: impl Into<String>,
    port: u16,
    url: impl Into<String>,
    request: Request,
  ) -> Self {
    Self {
      id,
      client,
      scheme,
      host: host.into(),
      port,
      url: url.into(),
      timestamp: SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0),
      request,
      response: None,
      inspection: Inspection::Skipped,
      failure: None,
    }
  }

  /// Position of this exchange on its client connection, from 0
  pub fn id(&self) -> u64 {
    self.id
  }

  /// Address of the client, when known
  pub fn client(&self) -> Option<SocketAddr> {
    self.client
  }

  /// Scheme of the upstream leg
  pub fn scheme(&self) -> Scheme {
    self.scheme
  }

  /// Destination host
  pub fn host(&self) -> &str {
    &self.host
  }

  /// Destination port
  pub fn port(&self) -> u16 {
    self.port
  }

  /// Full URL as the client addressed it
  pub fn url(&self) -> &str {
    &self.url
  }

  /// Milliseconds since the epoch at which the request head arrived
  pub fn timestamp(&self) -> u64 {
    self.timestamp
  }

  /// The request as it will be (or was) sent upstream
  pub fn request(&self) -> &Request {
    &self.request
  }

  /// Mutable access for request interceptors
  pub fn request_mut(&mut self) -> &mut Request {
    &mut self.request
  }

  /// The response, once one has been received or synthesized
  pub fn response(&self) -> Option<&Response> {
    self.response.as_ref()
  }

  /// Mutable access for response interceptors
  pub fn response_mut(&mut self) -> Option<&mut Response> {
    self.response.as_mut()
  }

  pub(crate) fn set_response(&mut self, response: Response, inspection: Inspection) {
    self.response = Some(response);
    self.inspection = inspection;
  }

  pub(crate) fn set_inspection(&mut self, inspection: Inspection) {
    self.inspection = inspection;
  }

  /// How much of the response body is available
  pub fn inspection(&self) -> Inspection {
    self.inspection
  }

  /// Why the exchange failed, if it did
  pub fn failure(&self) -> Option<&str> {
    self.failure.as_deref()
  }

  /// Whether the exchange ended with a proxy-generated error
  pub fn is_failed(&self) -> bool {
    self.failure.is_some()
  }

  pub(crate) fn mark_failed(&mut self, reason: impl ToString) {
    self.failure = Some(reason.to_string());
  }
}

impl fmt::Debug for HttpExchange {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("HttpExchange")
      .field("id", &self.id)
      .field("client", &self.client)
      .field("url", &self.url)
      .field("method", self.request.method())
      .field("status", &self.response.as_ref().map(|r| r.status_code()))
      .field("inspection", &self.inspection)
      .field("failure", &self.failure)
      .finish()
  }
}
