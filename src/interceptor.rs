//! Traffic interception and modification interfaces

use crate::errors::{Error, Result};
use crate::exchange::{HttpExchange, Inspection};
use crate::response::Response;
use std::sync::Arc;
use std::time::Duration;

/// What the pipeline should do with a request after the request interceptors
#[derive(Debug)]
pub enum RequestAction {
  /// Send the (possibly modified) request upstream
  Forward,
  /// Answer the client locally; nothing is sent upstream
  Respond(Response),
}

/// Runs before a request is forwarded. May modify the request in place or
/// answer it directly.
#[async_trait::async_trait]
pub trait RequestInterceptor: Send + Sync {
  /// Intercept and optionally modify a request
  async fn intercept_request(&self, exchange: &mut HttpExchange) -> Result<RequestAction>;
}

/// Runs before a response reaches the client.
#[async_trait::async_trait]
pub trait ResponseInterceptor: Send + Sync {
  /// Whether this interceptor wants the whole response body buffered for
  /// `exchange`. Decided from the request and the response head.
  fn needs_body(&self, _exchange: &HttpExchange) -> bool {
    false
  }

  /// Intercept and optionally modify a response
  async fn intercept_response(&self, exchange: &mut HttpExchange) -> Result<()>;
}

/// Ordered set of interceptors, invoked in registration order.
///
/// Each call is bounded by `hook_timeout`. A failing or slow interceptor is
/// logged, its changes are discarded, and the exchange carries on.
pub struct InterceptorHandler {
  request_interceptors: Vec<Arc<dyn RequestInterceptor>>,
  response_interceptors: Vec<Arc<dyn ResponseInterceptor>>,
  hook_timeout: Duration,
}

impl InterceptorHandler {
  /// Create a new interceptor handler
  pub fn new(hook_timeout: Duration) -> Self {
    Self {
      request_interceptors: Vec::new(),
      response_interceptors: Vec::new(),
      hook_timeout,
    }
  }

  /// Add a request interceptor
  pub fn add_request_interceptor(&mut self, interceptor: Arc<dyn RequestInterceptor>) {
    self.request_interceptors.push(interceptor);
  }

  /// Add a response interceptor
  pub fn add_response_interceptor(&mut self, interceptor: Arc<dyn ResponseInterceptor>) {
    self.response_interceptors.push(interceptor);
  }

  /// Process a request through all interceptors
  pub async fn process_request(&self, exchange: &mut HttpExchange) -> RequestAction {
    for (index, interceptor) in self.request_interceptors.iter().enumerate() {
      let mut candidate = exchange.clone();
      let outcome = tokio::time::timeout(
        self.hook_timeout,
        interceptor.intercept_request(&mut candidate),
      )
      .await
      .unwrap_or_else(|_| Err(self.timed_out("request", index)));
      match outcome {
        Ok(RequestAction::Forward) => *exchange = candidate,
        Ok(RequestAction::Respond(response)) => {
          *exchange = candidate;
          tracing::debug!("Request interceptor #{} answered {}", index, exchange.url());
          return RequestAction::Respond(response);
        }
        Err(e) => tracing::warn!("Request interceptor #{} failed on {}: {}", index, exchange.url(), e),
      }
    }
    RequestAction::Forward
  }

  /// Process a response through all interceptors
  pub async fn process_response(&self, exchange: &mut HttpExchange) {
    for (index, interceptor) in self.response_interceptors.iter().enumerate() {
      let mut candidate = exchange.clone();
      let outcome = tokio::time::timeout(
        self.hook_timeout,
        interceptor.intercept_response(&mut candidate),
      )
      .await
      .unwrap_or_else(|_| Err(self.timed_out("response", index)));
      match outcome {
        Ok(()) => *exchange = candidate,
        Err(e) => tracing::warn!("Response interceptor #{} failed on {}: {}", index, exchange.url(), e),
      }
    }
  }

  /// Whether any response interceptor wants the full body of `exchange`
  pub fn needs_response_body(&self, exchange: &HttpExchange) -> bool {
    self
      .response_interceptors
      .iter()
      .any(|interceptor| interceptor.needs_body(exchange))
  }

  fn timed_out(&self, side: &str, index: usize) -> Error {
    Error::interceptor(format!(
      "{} interceptor #{} exceeded {:?}",
      side, index, self.hook_timeout
    ))
  }
}

impl Default for InterceptorHandler {
  fn default() -> Self {
    Self::new(Duration::from_secs(2))
  }
}

/// Logs every exchange at `info`, headers at `debug`.
pub struct LoggingInterceptor;

#[async_trait::async_trait]
impl RequestInterceptor for LoggingInterceptor {
  async fn intercept_request(&self, exchange: &mut HttpExchange) -> Result<RequestAction> {
    let request = exchange.request();
    tracing::info!("[{}] {} {}", exchange.id(), request.method(), exchange.url());
    for (name, value) in request.headers() {
      tracing::debug!("  {}: {:?}", name, value);
    }
    if let Some(client) = exchange.client() {
      tracing::debug!("  From: {}", client);
    }
    Ok(RequestAction::Forward)
  }
}

#[async_trait::async_trait]
impl ResponseInterceptor for LoggingInterceptor {
  async fn intercept_response(&self, exchange: &mut HttpExchange) -> Result<()> {
    if let Some(response) = exchange.response() {
      tracing::info!(
        "[{}] {} {} ({:?})",
        exchange.id(),
        response.status_code(),
        exchange.url(),
        exchange.inspection()
      );
      for (name, value) in response.headers() {
        tracing::debug!("  {}: {:?}", name, value);
      }
    }
    if let Inspection::Truncated { limit } = exchange.inspection() {
      tracing::debug!("  body over {} bytes, not inspected", limit);
    }
    Ok(())
  }
}
