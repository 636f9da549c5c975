//! proxy error
//!
//! Every per-connection failure maps onto one of the variants below, and the
//! pipeline decides from the variant whether the client still gets a
//! well-formed HTTP answer or just a closed socket.
use std::io::ErrorKind;
use thiserror::Error as ThisError;

/// A `Result` alias where the `Err` case is `twiproxy::Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// The Errors that may occur while proxying a connection.
#[derive(ThisError, Debug)]
pub enum Error {
  /// Malformed initial line, framing violation or oversized head.
  #[error("protocol error: {0}")]
  Protocol(String),
  /// TLS failure on either leg. Never downgraded to plaintext.
  #[error("handshake error: {0}")]
  Handshake(String),
  /// DNS failure or connection refused while reaching the real destination.
  #[error("upstream {target} unavailable: {reason}")]
  UpstreamUnavailable {
    /// host:port that could not be reached
    target: String,
    /// underlying cause
    reason: String,
  },
  /// The upstream did not answer within the configured timeout.
  #[error("upstream {0} timed out")]
  UpstreamTimeout(String),
  /// A body under inspection grew past the buffering cap.
  #[error("inspection buffer exceeded {limit} bytes")]
  CapacityExceeded {
    /// the configured cap
    limit: usize,
  },
  /// CA load, generation or signing failure. Fatal for the process.
  #[error("certificate authority error: {0}")]
  Ca(String),
  /// An interceptor failed. Logged and swallowed by the pipeline.
  #[error("interceptor error: {0}")]
  Interceptor(String),
  /// IO Error
  #[error(transparent)]
  Io(#[from] std::io::Error),
  /// http::Error
  #[error(transparent)]
  Http(http::Error),
  /// serde_json::Error
  #[error(transparent)]
  Json(#[from] serde_json::Error),
}

impl Error {
  /// Create a protocol error and log it
  pub fn protocol(msg: impl Into<String>) -> Self {
    let error = Error::Protocol(msg.into());
    tracing::debug!("{}", error);
    error
  }

  /// Create a handshake error and log it
  pub fn handshake(msg: impl Into<String>) -> Self {
    let error = Error::Handshake(msg.into());
    tracing::warn!("{}", error);
    error
  }

  /// Create an upstream-unavailable error and log it
  pub fn upstream_unavailable(target: impl Into<String>, reason: impl ToString) -> Self {
    let error = Error::UpstreamUnavailable {
      target: target.into(),
      reason: reason.to_string(),
    };
    tracing::warn!("{}", error);
    error
  }

  /// Create a CA error and log it
  pub fn ca(msg: impl Into<String>) -> Self {
    let error = Error::Ca(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create an interceptor error
  pub fn interceptor(msg: impl Into<String>) -> Self {
    Error::Interceptor(msg.into())
  }

  /// Whether the failure belongs to the upstream leg, so the client can
  /// still receive a synthesized response.
  pub fn is_upstream(&self) -> bool {
    matches!(
      self,
      Error::UpstreamUnavailable { .. } | Error::UpstreamTimeout(_)
    )
  }

  /// Whether the error is a timeout on any leg.
  pub fn is_timeout(&self) -> bool {
    match self {
      Error::UpstreamTimeout(_) => true,
      Error::Io(e) => e.kind() == ErrorKind::TimedOut,
      _ => false,
    }
  }
}

impl From<http::Error> for Error {
  fn from(value: http::Error) -> Self {
    Error::Http(value)
  }
}

impl From<http::header::InvalidHeaderValue> for Error {
  fn from(value: http::header::InvalidHeaderValue) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<http::header::InvalidHeaderName> for Error {
  fn from(value: http::header::InvalidHeaderName) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<rcgen::Error> for Error {
  fn from(value: rcgen::Error) -> Self {
    Error::ca(value.to_string())
  }
}
