//! HTTP message pipeline
//!
//! Frames requests off the client leg, runs the request interceptors,
//! forwards upstream, runs the response interceptors and relays the answer.
//! Request interceptors always finish before the upstream send and response
//! interceptors before the first response byte reaches the client. The loop
//! continues while both sides keep the connection alive.

use crate::body::{collect, relay, Body, BodyReader, Collected, Framing};
use crate::connector::{Connector, Scheme, UpstreamConnection, UpstreamKey, UpstreamPool};
use crate::errors::{Error, Result};
use crate::exchange::{HttpExchange, Inspection};
use crate::interceptor::{InterceptorHandler, RequestAction};
use crate::request::{keep_alive, strip_hop_by_hop, Request, RequestBuilder};
use crate::response::Response;
use crate::socket::with_timeout;
use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_LENGTH, EXPECT, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderValue, Method, StatusCode, Version};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::RwLock;

const CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// Size and time limits applied to every exchange
#[derive(Debug, Clone)]
pub struct Limits {
  /// largest accepted request or response head
  pub max_head_size: usize,
  /// bodies up to this size are buffered even when nobody inspects them
  pub stream_threshold: usize,
  /// hard cap for bodies buffered for inspection
  pub inspect_cap: usize,
  /// how long a kept-alive client may stay silent between exchanges
  pub idle_timeout: Duration,
  /// per-read timeout on both legs
  pub read_timeout: Option<Duration>,
  /// per-write timeout on both legs
  pub write_timeout: Option<Duration>,
}

impl Default for Limits {
  fn default() -> Self {
    Self {
      max_head_size: 64 * 1024,
      stream_threshold: 64 * 1024,
      inspect_cap: 8 * 1024 * 1024,
      idle_timeout: Duration::from_secs(60),
      read_timeout: Some(Duration::from_secs(30)),
      write_timeout: Some(Duration::from_secs(30)),
    }
  }
}

/// Per client connection facts the pipeline needs
#[derive(Debug, Clone, Default)]
pub struct ConnectionContext {
  /// client address
  pub peer: Option<SocketAddr>,
  /// `host:port` of an intercepted tunnel. Every exchange on the
  /// connection goes there over TLS.
  pub tunnel: Option<(String, u16)>,
}

enum Flow {
  KeepAlive,
  Close,
  Connect(Request),
}

/// Runs exchanges for client connections
pub struct Pipeline {
  handler: Arc<RwLock<InterceptorHandler>>,
  connector: Arc<Connector>,
  limits: Limits,
}

impl Pipeline {
  /// Create a pipeline forwarding through `connector`
  pub fn new(
    handler: Arc<RwLock<InterceptorHandler>>,
    connector: Arc<Connector>,
    limits: Limits,
  ) -> Self {
    Self {
      handler,
      connector,
      limits,
    }
  }

  /// The limits in effect
  pub fn limits(&self) -> &Limits {
    &self.limits
  }

  /// Serve exchanges on `client` until either side stops keeping the
  /// connection alive. `first` is a request head the caller already read.
  ///
  /// Returns a CONNECT request that arrived on a plain connection, for the
  /// caller to turn into a tunnel.
  pub async fn serve<S>(
    &self,
    client: &mut BufReader<S>,
    ctx: &ConnectionContext,
    pool: &mut UpstreamPool,
    first: Option<Request>,
  ) -> Result<Option<Request>>
  where
    S: AsyncRead + AsyncWrite + Unpin + Send,
  {
    let mut pending = first;
    let mut id = 0;
    loop {
      let request = match pending.take() {
        Some(request) => request,
        None => match self.next_request(client).await? {
          Some(request) => request,
          None => break,
        },
      };
      match self.exchange(client, ctx, pool, id, request).await? {
        Flow::KeepAlive => id += 1,
        Flow::Close => break,
        Flow::Connect(request) => return Ok(Some(request)),
      }
    }
    with_timeout(self.limits.write_timeout, client.shutdown())
      .await
      .ok();
    Ok(None)
  }

  async fn next_request<S>(&self, client: &mut BufReader<S>) -> Result<Option<Request>>
  where
    S: AsyncRead + Unpin,
  {
    let head = RequestBuilder::new(client, self.limits.max_head_size).build_head();
    match tokio::time::timeout(self.limits.idle_timeout, head).await {
      Ok(head) => head,
      Err(_) => {
        tracing::debug!("Client idle for {:?}, closing", self.limits.idle_timeout);
        Ok(None)
      }
    }
  }

  async fn exchange<S>(
    &self,
    client: &mut BufReader<S>,
    ctx: &ConnectionContext,
    pool: &mut UpstreamPool,
    id: u64,
    mut request: Request,
  ) -> Result<Flow>
  where
    S: AsyncRead + AsyncWrite + Unpin + Send,
  {
    if request.method() == Method::CONNECT {
      if ctx.tunnel.is_some() {
        return Err(Error::protocol("CONNECT inside an intercepted tunnel"));
      }
      return Ok(Flow::Connect(request));
    }
    let client_keep_alive = request.wants_keep_alive();
    let client_version = request.version();
    let request_framing = Framing::for_request(request.headers())?;
    let (host, port, scheme) = match &ctx.tunnel {
      Some((host, port)) => (host.clone(), *port, Scheme::Https),
      None => request.destination(Scheme::Http)?,
    };
    let url = request.url(scheme, &host, port);
    request.into_origin_form()?;
    strip_hop_by_hop(request.headers_mut());
    request.headers_mut().remove(TRANSFER_ENCODING);
    if request_framing != Framing::Empty && expects_continue(request.headers()) {
      // the body is consumed here, before any upstream is contacted
      request.headers_mut().remove(EXPECT);
      if client_version == Version::HTTP_11 {
        self.write_client(client, CONTINUE).await?;
        with_timeout(self.limits.write_timeout, client.flush()).await?;
      }
    }

    let mut request_body = BodyReader::new(request_framing, self.limits.read_timeout);
    let streaming_request = match request_framing {
      Framing::Empty => false,
      Framing::Length(n) if n <= self.limits.stream_threshold as u64 => {
        match collect(&mut request_body, client, n as usize).await? {
          Collected::Complete(data) => *request.body_mut() = Some(Body::from(data)),
          Collected::Overflow(_) => return Err(Error::protocol("request body overran its length")),
        }
        false
      }
      _ => true,
    };

    let mut exchange = HttpExchange::new(id, ctx.peer, scheme, host.as_str(), port, url, request);
    let action = self.handler.read().await.process_request(&mut exchange).await;
    if let RequestAction::Respond(response) = action {
      if streaming_request {
        relay(&mut request_body, client, &mut tokio::io::sink(), None).await?;
      }
      exchange.set_response(response, Inspection::Complete);
      return self
        .deliver_local(client, &exchange, client_keep_alive, client_version)
        .await;
    }

    let key = UpstreamKey::new(&host, port, scheme);
    let mut upstream = match self.checkout(pool, &key).await {
      Ok(upstream) => upstream,
      Err(e) => {
        if streaming_request && e.is_upstream() {
          relay(&mut request_body, client, &mut tokio::io::sink(), None).await?;
        }
        return self.fail(client, &mut exchange, e, client_keep_alive, client_version).await;
      }
    };

    let original_length = request_framing != Framing::Empty
      || exchange.request().headers().contains_key(CONTENT_LENGTH);
    frame_request(
      exchange.request_mut(),
      streaming_request,
      request_framing,
      original_length,
      client_keep_alive,
    );
    let sent = async {
      upstream.send(exchange.request()).await?;
      if streaming_request {
        relay(
          &mut request_body,
          client,
          upstream.stream(),
          self.limits.write_timeout,
        )
        .await?;
      } else if let Some(body) = exchange.request().body() {
        upstream.send_body(body).await?;
      }
      upstream.flush().await
    }
    .await;
    if let Err(e) = sent {
      if streaming_request {
        // the client body is half consumed, the connection cannot continue
        return Err(e);
      }
      return self.fail(client, &mut exchange, e, client_keep_alive, client_version).await;
    }

    let mut response = loop {
      let received = tokio::select! {
        received = upstream.receive(self.limits.max_head_size) => received,
        _ = client_gone(client) => {
          tracing::debug!("Client went away while waiting on {}", exchange.url());
          return Ok(Flow::Close);
        }
      };
      match received {
        Ok(interim) if interim.status_code() == StatusCode::SWITCHING_PROTOCOLS => {
          return Err(Error::protocol("protocol upgrades are not relayed"));
        }
        Ok(interim) if interim.status_code().is_informational() => {
          self.write_client(client, &interim.to_raw()).await?;
        }
        Ok(response) => break response,
        Err(e) => {
          return self.fail(client, &mut exchange, e, client_keep_alive, client_version).await;
        }
      }
    };

    let method = exchange.request().method().clone();
    let framing = match Framing::for_response(&method, response.status_code(), response.headers()) {
      Ok(framing) => framing,
      Err(e) => {
        let e = Error::upstream_unavailable(key.to_string(), e);
        return self.fail(client, &mut exchange, e, client_keep_alive, client_version).await;
      }
    };
    let upstream_keep_alive =
      keep_alive(response.version(), response.headers()) && !framing.is_until_close();
    strip_hop_by_hop(response.headers_mut());
    response.headers_mut().remove(TRANSFER_ENCODING);

    exchange.set_response(response, Inspection::Skipped);
    let needs_body = self.handler.read().await.needs_response_body(&exchange);
    let cap = if needs_body {
      Some(self.limits.inspect_cap)
    } else {
      match framing {
        Framing::Empty => Some(0),
        Framing::Length(n) if n <= self.limits.stream_threshold as u64 => Some(n as usize),
        _ => None,
      }
    };

    let mut body = BodyReader::new(framing, self.limits.read_timeout);
    let mut prefix: Option<Bytes> = None;
    let inspection = match cap {
      None => Inspection::Skipped,
      Some(cap) => match collect(&mut body, upstream.stream(), cap).await {
        Ok(Collected::Complete(data)) => {
          if let Some(response) = exchange.response_mut() {
            if !data.is_empty() {
              *response.body_mut() = Some(Body::from(data));
            }
          }
          Inspection::Complete
        }
        Ok(Collected::Overflow(raw)) => {
          prefix = Some(raw);
          Inspection::Truncated { limit: cap }
        }
        Err(e) => {
          let e = upstream_read_error(&key, e);
          return self.fail(client, &mut exchange, e, client_keep_alive, client_version).await;
        }
      },
    };
    exchange.set_inspection(inspection);

    self.handler.read().await.process_response(&mut exchange).await;

    let Some(mut response) = exchange.response().cloned() else {
      return Err(Error::protocol("exchange lost its response"));
    };
    let streamed = inspection != Inspection::Complete;
    let mut keep = client_keep_alive;
    if streamed {
      match framing {
        Framing::Chunked => {
          response
            .headers_mut()
            .insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        }
        Framing::UntilClose => keep = false,
        Framing::Empty | Framing::Length(_) => {}
      }
    } else if framing != Framing::Empty {
      let length = response.body().map(|b| b.len()).unwrap_or(0);
      response
        .headers_mut()
        .insert(CONTENT_LENGTH, HeaderValue::from(length));
    }
    set_connection(response.headers_mut(), keep, client_version);

    self.write_client(client, &response.to_raw()).await?;
    if streamed {
      if let Some(prefix) = prefix {
        self.write_client(client, &prefix).await?;
      }
      relay(&mut body, upstream.stream(), client, self.limits.write_timeout).await?;
    } else if framing != Framing::Empty {
      if let Some(body) = response.body() {
        self.write_client(client, body).await?;
      }
    }
    with_timeout(self.limits.write_timeout, client.flush()).await?;

    tracing::debug!(
      "[{}] {} {} -> {} ({:?})",
      exchange.id(),
      method,
      exchange.url(),
      response.status_code(),
      inspection
    );
    if upstream_keep_alive {
      pool.put(upstream);
    }
    Ok(if keep { Flow::KeepAlive } else { Flow::Close })
  }

  async fn checkout(&self, pool: &mut UpstreamPool, key: &UpstreamKey) -> Result<UpstreamConnection> {
    if let Some(mut upstream) = pool.take(key) {
      if upstream.is_alive().await {
        tracing::trace!("Reusing upstream {}", key);
        return Ok(upstream);
      }
      tracing::debug!("Idle upstream {} went away", key);
    }
    UpstreamConnection::connect(&self.connector, key.clone()).await
  }

  /// Answer the client with a synthesized error when the upstream leg
  /// failed; anything else tears the connection down.
  async fn fail<S>(
    &self,
    client: &mut BufReader<S>,
    exchange: &mut HttpExchange,
    error: Error,
    client_keep_alive: bool,
    version: Version,
  ) -> Result<Flow>
  where
    S: AsyncRead + AsyncWrite + Unpin + Send,
  {
    if !error.is_upstream() {
      return Err(error);
    }
    exchange.mark_failed(&error);
    let response = if error.is_timeout() {
      Response::gateway_timeout(&error, client_keep_alive)
    } else {
      Response::bad_gateway(&error, client_keep_alive)
    };
    tracing::info!(
      "[{}] {} {} failed: {}",
      exchange.id(),
      exchange.request().method(),
      exchange.url(),
      error
    );
    exchange.set_response(response, Inspection::Complete);
    self
      .deliver_local(client, exchange, client_keep_alive, version)
      .await
  }

  /// Write a response that did not come from upstream
  async fn deliver_local<S>(
    &self,
    client: &mut BufReader<S>,
    exchange: &HttpExchange,
    client_keep_alive: bool,
    version: Version,
  ) -> Result<Flow>
  where
    S: AsyncRead + AsyncWrite + Unpin + Send,
  {
    let Some(mut response) = exchange.response().cloned() else {
      return Err(Error::protocol("exchange has no response"));
    };
    let keep = client_keep_alive && keep_alive(Version::HTTP_11, response.headers());
    strip_hop_by_hop(response.headers_mut());
    response.headers_mut().remove(TRANSFER_ENCODING);
    let length = response.body().map(|b| b.len()).unwrap_or(0);
    response
      .headers_mut()
      .insert(CONTENT_LENGTH, HeaderValue::from(length));
    set_connection(response.headers_mut(), keep, version);

    self.write_client(client, &response.to_raw()).await?;
    if exchange.request().method() != Method::HEAD {
      if let Some(body) = response.body() {
        self.write_client(client, body).await?;
      }
    }
    with_timeout(self.limits.write_timeout, client.flush()).await?;
    Ok(if keep { Flow::KeepAlive } else { Flow::Close })
  }

  async fn write_client<W>(&self, client: &mut W, bytes: &[u8]) -> Result<()>
  where
    W: AsyncWrite + Unpin,
  {
    with_timeout(self.limits.write_timeout, client.write_all(bytes)).await?;
    Ok(())
  }
}

/// Restore framing and connection headers after hop-by-hop stripping
fn frame_request(
  request: &mut Request,
  streaming: bool,
  framing: Framing,
  had_length: bool,
  keep_alive: bool,
) {
  let version = request.version();
  let length = request.body().map(|b| b.len()).unwrap_or(0);
  let headers = request.headers_mut();
  if streaming {
    if framing == Framing::Chunked {
      headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
    }
  } else if length > 0 || had_length {
    headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
  } else {
    headers.remove(CONTENT_LENGTH);
  }
  set_connection(headers, keep_alive, version);
}

fn set_connection(headers: &mut HeaderMap, keep_alive: bool, version: Version) {
  if !keep_alive {
    headers.insert(CONNECTION, HeaderValue::from_static("close"));
  } else if version == Version::HTTP_10 {
    headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
  }
}

fn expects_continue(headers: &HeaderMap) -> bool {
  headers
    .get(EXPECT)
    .and_then(|v| v.to_str().ok())
    .is_some_and(|v| v.trim().eq_ignore_ascii_case("100-continue"))
}

fn upstream_read_error(key: &UpstreamKey, error: Error) -> Error {
  if error.is_timeout() {
    Error::UpstreamTimeout(key.to_string())
  } else {
    Error::upstream_unavailable(key.to_string(), error)
  }
}

/// Resolves once the client has closed its side; stays pending while the
/// client is silent or has pipelined the next request.
async fn client_gone<R>(client: &mut R)
where
  R: AsyncBufRead + Unpin,
{
  match client.fill_buf().await {
    Ok(buf) if !buf.is_empty() => std::future::pending::<()>().await,
    _ => {}
  }
}
