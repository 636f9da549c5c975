//! Observers for timeline traffic
//!
//! [`TimelineObserver`] records tweets and their engagement counts from the
//! home timeline responses a browser receives through the proxy, and
//! [`TokenObserver`] keeps the session credentials that came with them.
//! [`ExchangeRecorder`] keeps a raw log of the exchanges themselves.

mod record;
mod store;
mod timeline;
mod tokens;

pub use record::{ExchangeRecord, ExchangeRecorder};
pub use store::{JsonLinesStore, MemoryStore, ObservationStore};
pub use timeline::{parse_timeline, TweetObservation};
pub use tokens::{TokenObserver, TokenStore};

use crate::errors::{Error, Result};
use crate::exchange::{HttpExchange, Inspection};
use crate::interceptor::{RequestAction, RequestInterceptor, ResponseInterceptor};
use flate2::read::{DeflateDecoder, MultiGzDecoder, ZlibDecoder};
use http::header::{ACCEPT_ENCODING, CONTENT_ENCODING};
use http::{HeaderMap, HeaderValue};
use std::io::Read;
use std::sync::Arc;
use time::OffsetDateTime;

/// URL fragments of the GraphQL operations that return the home timeline
pub const DEFAULT_TIMELINE_PATTERNS: [&str; 2] = ["HomeTimeline", "HomeLatestTimeline"];

const DECODABLE_ENCODINGS: &str = "gzip, deflate";

/// Stores a [`TweetObservation`] for every tweet in a matching timeline
/// response.
pub struct TimelineObserver {
  patterns: Vec<String>,
  store: Arc<dyn ObservationStore>,
}

impl TimelineObserver {
  /// Observer for the default timeline URLs
  pub fn new(store: Arc<dyn ObservationStore>) -> Self {
    Self::with_patterns(store, DEFAULT_TIMELINE_PATTERNS)
  }

  /// Observer for URLs containing any of `patterns`
  pub fn with_patterns<I, S>(store: Arc<dyn ObservationStore>, patterns: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self {
      patterns: patterns.into_iter().map(Into::into).collect(),
      store,
    }
  }

  /// Whether `url` is a timeline this observer records
  pub fn matches(&self, url: &str) -> bool {
    self.patterns.iter().any(|pattern| url.contains(pattern.as_str()))
  }
}

#[async_trait::async_trait]
impl RequestInterceptor for TimelineObserver {
  async fn intercept_request(&self, exchange: &mut HttpExchange) -> Result<RequestAction> {
    if self.matches(exchange.url()) {
      // keep the upstream away from encodings we cannot read back
      exchange
        .request_mut()
        .headers_mut()
        .insert(ACCEPT_ENCODING, HeaderValue::from_static(DECODABLE_ENCODINGS));
    }
    Ok(RequestAction::Forward)
  }
}

#[async_trait::async_trait]
impl ResponseInterceptor for TimelineObserver {
  fn needs_body(&self, exchange: &HttpExchange) -> bool {
    self.matches(exchange.url())
  }

  async fn intercept_response(&self, exchange: &mut HttpExchange) -> Result<()> {
    if !self.matches(exchange.url()) {
      return Ok(());
    }
    let Some(response) = exchange.response() else {
      return Ok(());
    };
    if !response.status_code().is_success() {
      tracing::debug!("Timeline {} answered {}", exchange.url(), response.status_code());
      return Ok(());
    }
    match exchange.inspection() {
      Inspection::Complete => {}
      Inspection::Truncated { limit } => {
        tracing::warn!(
          "Timeline {} not recorded: {}",
          exchange.url(),
          Error::CapacityExceeded { limit }
        );
        return Ok(());
      }
      other => {
        tracing::warn!("Timeline {} not recorded, body was {:?}", exchange.url(), other);
        return Ok(());
      }
    }
    let Some(body) = response.body() else {
      return Ok(());
    };

    let decoded = decode_body(response.headers(), body)?;
    let json: serde_json::Value = serde_json::from_slice(&decoded)?;
    let tweets = parse_timeline(&json, OffsetDateTime::now_utc());
    tracing::info!("Recorded {} tweets from {}", tweets.len(), exchange.url());
    for tweet in &tweets {
      self.store.store_observation(tweet).await?;
    }
    Ok(())
  }
}

/// Undo `Content-Encoding` on a buffered body
pub fn decode_body(headers: &HeaderMap, body: &[u8]) -> Result<Vec<u8>> {
  let encoding = headers
    .get(CONTENT_ENCODING)
    .and_then(|v| v.to_str().ok())
    .map(|v| v.trim().to_ascii_lowercase())
    .unwrap_or_default();
  let mut decoded = Vec::new();
  match encoding.as_str() {
    "" | "identity" => decoded.extend_from_slice(body),
    "gzip" | "x-gzip" => {
      MultiGzDecoder::new(body).read_to_end(&mut decoded)?;
    }
    "deflate" => {
      // servers disagree whether deflate means zlib-wrapped or raw
      if ZlibDecoder::new(body).read_to_end(&mut decoded).is_err() {
        decoded.clear();
        DeflateDecoder::new(body).read_to_end(&mut decoded)?;
      }
    }
    other => {
      return Err(Error::interceptor(format!(
        "unsupported content-encoding {}",
        other
      )))
    }
  }
  Ok(decoded)
}
