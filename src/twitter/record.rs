//! Raw exchange log
use super::decode_body;
use super::store::JsonLinesStore;
use crate::errors::Result;
use crate::exchange::{HttpExchange, Inspection};
use crate::interceptor::ResponseInterceptor;
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// One proxied exchange, as written to the request log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeRecord {
  /// RFC 3339 time the response was seen
  pub recorded_at: String,
  /// request method
  pub method: String,
  /// full URL as the client addressed it
  pub url: String,
  /// upstream status code
  pub status: u16,
  /// request headers; repeated headers are joined with `, `
  pub headers: BTreeMap<String, String>,
  /// decoded response body, when it was inspected and is UTF-8
  pub body: Option<String>,
}

impl ExchangeRecord {
  /// Snapshot `exchange`, or `None` while it has no response
  pub fn from_exchange(exchange: &HttpExchange, recorded_at: OffsetDateTime) -> Option<Self> {
    let response = exchange.response()?;
    let body = match (exchange.inspection(), response.body()) {
      (Inspection::Complete, Some(body)) => decode_body(response.headers(), body)
        .ok()
        .and_then(|decoded| String::from_utf8(decoded).ok()),
      _ => None,
    };
    Some(Self {
      recorded_at: recorded_at.format(&Rfc3339).unwrap_or_default(),
      method: exchange.request().method().to_string(),
      url: exchange.url().to_string(),
      status: response.status_code().as_u16(),
      headers: flatten_headers(exchange.request().headers()),
      body,
    })
  }
}

fn flatten_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
  let mut flat = BTreeMap::new();
  for name in headers.keys() {
    let joined = headers
      .get_all(name)
      .iter()
      .map(|v| String::from_utf8_lossy(v.as_bytes()).to_string())
      .collect::<Vec<_>>()
      .join(", ");
    flat.insert(name.as_str().to_string(), joined);
  }
  flat
}

/// Appends every exchange matching its patterns to a JSON Lines file.
///
/// Matching exchanges have their response body buffered for the record,
/// up to the inspection cap.
#[derive(Debug)]
pub struct ExchangeRecorder {
  patterns: Vec<String>,
  store: JsonLinesStore,
}

impl ExchangeRecorder {
  /// Record every exchange to `path`
  pub fn new(path: impl AsRef<Path>) -> Self {
    Self::with_patterns(path, Vec::<String>::new())
  }

  /// Record exchanges whose URL contains one of `patterns`; no patterns
  /// means everything.
  pub fn with_patterns<I, S>(path: impl AsRef<Path>, patterns: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self {
      patterns: patterns.into_iter().map(Into::into).collect(),
      store: JsonLinesStore::new(path),
    }
  }

  /// Whether `url` is recorded
  pub fn matches(&self, url: &str) -> bool {
    self.patterns.is_empty() || self.patterns.iter().any(|p| url.contains(p.as_str()))
  }

  /// File the records go to
  pub fn path(&self) -> &Path {
    self.store.path()
  }
}

#[async_trait::async_trait]
impl ResponseInterceptor for ExchangeRecorder {
  fn needs_body(&self, exchange: &HttpExchange) -> bool {
    self.matches(exchange.url())
  }

  async fn intercept_response(&self, exchange: &mut HttpExchange) -> Result<()> {
    if !self.matches(exchange.url()) {
      return Ok(());
    }
    if let Some(record) = ExchangeRecord::from_exchange(exchange, OffsetDateTime::now_utc()) {
      self.store.append(&record).await?;
    }
    Ok(())
  }
}
