#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # twiproxy
//!
//! An intercepting HTTP/HTTPS proxy. Clients configure it as their HTTP
//! proxy and trust its CA; every exchange, including the ones inside CONNECT
//! tunnels, is then visible to a chain of interceptors before it continues.
//!
//! - CA generated on first start and reused afterwards
//! - Per-host leaf certificates issued on demand and cached
//! - HTTP/1.1 keep-alive on both legs, chunked and close-delimited bodies
//! - Ordered, time-bounded request and response interceptors
//! - Bodies streamed through unless an interceptor asks to see them
//!
//! The [`twitter`] module holds interceptors that record home timeline
//! engagement and session tokens.
//!
//! ## Running a proxy
//!
//! ```no_run
//! use std::sync::Arc;
//! use twiproxy::{LoggingInterceptor, MitmConfig, MitmProxy};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!   let proxy = MitmProxy::new(MitmConfig::default()).await?;
//!   println!("{}", proxy.ca_cert_pem());
//!   {
//!     let handler = proxy.interceptor_handler();
//!     let mut handler = handler.write().await;
//!     handler.add_request_interceptor(Arc::new(LoggingInterceptor));
//!     handler.add_response_interceptor(Arc::new(LoggingInterceptor));
//!   }
//!   proxy.start().await?;
//!   Ok(())
//! }
//! ```
//!
//! ## Interceptors
//!
//! A [`RequestInterceptor`] may edit the request or answer it with
//! [`RequestAction::Respond`]; the upstream is then never contacted. A
//! [`ResponseInterceptor`] sees the response head, and the whole body when
//! its [`needs_body`](ResponseInterceptor::needs_body) says so and the body
//! fits `inspect_cap`. Errors and timeouts roll back that interceptor's edits.
mod body;
mod ca;
mod connector;
mod errors;
mod exchange;
mod interceptor;
mod pipeline;
mod proxy;
mod request;
mod response;
mod server;
mod socket;
mod tls;
/// Timeline and session token observers
pub mod twitter;

pub use body::Body;
pub use ca::{CertificateAuthority, CertificateManager, LeafCertificate};
pub use connector::{Connector, ConnectorBuilder, Scheme};
pub use errors::{Error, Result};
pub use exchange::{HttpExchange, Inspection};
pub use http::header;
pub use http::Method;
pub use http::{StatusCode, Version};
pub use interceptor::{
  InterceptorHandler, LoggingInterceptor, RequestAction, RequestInterceptor, ResponseInterceptor,
};
pub use proxy::{MitmConfig, MitmProxy};
pub use request::{strip_hop_by_hop, Request};
pub use response::Response;
pub use server::ProxyServer;
pub use tls::Certificate;

pub(crate) const CR_LF: &[u8] = &[13, 10];
pub(crate) const SPACE: &[u8] = &[32];
pub(crate) const COLON_SPACE: &[u8] = &[58, 32];
