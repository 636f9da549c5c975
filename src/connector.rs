use crate::errors::{Error, Result};
use crate::request::Request;
use crate::response::{Response, ResponseBuilder};
use crate::socket::{with_timeout, MaybeTlsStream, Socket};
use crate::tls::{upstream_client_config, Certificate};
use socket2::Socket as RawSocket;
use socket2::{Domain, Protocol, Type};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpSocket;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;

/// Scheme of an upstream leg
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
  /// plain TCP
  Http,
  /// TCP wrapped in client-role TLS
  Https,
}

impl Scheme {
  /// Port used when a URI does not name one
  pub fn default_port(&self) -> u16 {
    match self {
      Scheme::Http => 80,
      Scheme::Https => 443,
    }
  }

  /// Lowercase scheme name
  pub fn as_str(&self) -> &'static str {
    match self {
      Scheme::Http => "http",
      Scheme::Https => "https",
    }
  }
}

/// ConnectorBuilder
#[derive(Clone)]
pub struct ConnectorBuilder {
  read_timeout: Option<Duration>,
  write_timeout: Option<Duration>,
  connect_timeout: Option<Duration>,
  nodelay: bool,
  keepalive: bool,
  certificate: Vec<Certificate>,
}

impl Default for ConnectorBuilder {
  fn default() -> Self {
    Self {
      read_timeout: Some(Duration::from_secs(30)),
      write_timeout: Some(Duration::from_secs(30)),
      connect_timeout: Some(Duration::from_secs(10)),
      nodelay: true,
      keepalive: false,
      certificate: vec![],
    }
  }
}

impl ConnectorBuilder {
  /// Set that all sockets have `SO_NODELAY` set to the supplied value `nodelay`.
  ///
  /// Default is `true`.
  pub fn nodelay(mut self, value: bool) -> ConnectorBuilder {
    self.nodelay = value;
    self
  }
  /// Sets value for the `SO_KEEPALIVE` option on this socket.
  ///
  /// Default is `false`.
  pub fn keepalive(mut self, value: bool) -> ConnectorBuilder {
    self.keepalive = value;
    self
  }
  /// Adds certificates to the set of roots trusted for upstream TLS, on top
  /// of the platform roots.
  pub fn certificate(mut self, value: Vec<Certificate>) -> ConnectorBuilder {
    self.certificate = value;
    self
  }
  /// Enables a read timeout.
  ///
  /// The timeout applies to each read operation, and resets after a
  /// successful read.
  ///
  /// Default is 30 seconds.
  pub fn read_timeout(mut self, timeout: Option<Duration>) -> ConnectorBuilder {
    self.read_timeout = timeout;
    self
  }
  /// Enables a write timeout.
  ///
  /// Default is 30 seconds.
  pub fn write_timeout(mut self, timeout: Option<Duration>) -> ConnectorBuilder {
    self.write_timeout = timeout;
    self
  }
  /// Set a timeout covering DNS resolution, the TCP connect and the upstream
  /// TLS handshake.
  ///
  /// Default is 10 seconds.
  pub fn connect_timeout(mut self, timeout: Option<Duration>) -> ConnectorBuilder {
    self.connect_timeout = timeout;
    self
  }

  /// Combine the configuration of this builder to create a `Connector`.
  pub fn build(&self) -> Result<Connector> {
    let tls = upstream_client_config(&self.certificate)?;
    Ok(Connector {
      connect_timeout: self.connect_timeout,
      nodelay: self.nodelay,
      keepalive: self.keepalive,
      read_timeout: self.read_timeout,
      write_timeout: self.write_timeout,
      tls: TlsConnector::from(Arc::new(tls)),
    })
  }
}

/// Opens upstream connections: DNS, TCP, and TLS for HTTPS destinations.
pub struct Connector {
  connect_timeout: Option<Duration>,
  nodelay: bool,
  keepalive: bool,
  read_timeout: Option<Duration>,
  write_timeout: Option<Duration>,
  tls: TlsConnector,
}

impl fmt::Debug for Connector {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Connector")
      .field("connect_timeout", &self.connect_timeout)
      .field("read_timeout", &self.read_timeout)
      .field("write_timeout", &self.write_timeout)
      .finish_non_exhaustive()
  }
}

impl Connector {
  /// A builder with default timeouts
  pub fn builder() -> ConnectorBuilder {
    ConnectorBuilder::default()
  }

  /// Connect to `host:port`, wrapping the stream in TLS for [`Scheme::Https`].
  ///
  /// Every resolved address is tried in order. Refusal and DNS failure map
  /// to [`Error::UpstreamUnavailable`], expiry to [`Error::UpstreamTimeout`],
  /// certificate problems to [`Error::Handshake`].
  pub async fn connect(&self, host: &str, port: u16, scheme: Scheme) -> Result<Socket> {
    let target = format!("{}:{}", host, port);
    let addrs = self.resolve(host, port, &target).await?;

    let mut last_err: Option<std::io::Error> = None;
    for addr in addrs {
      match self.connect_with_addr(addr).await {
        Ok(socket) => {
          tracing::debug!("Connected to {} via {}", target, addr);
          return match scheme {
            Scheme::Http => Ok(socket),
            Scheme::Https => self.upgrade_to_tls(socket, host).await,
          };
        }
        Err(e) => {
          tracing::debug!("Connecting to {} via {} failed: {}", target, addr, e);
          last_err = Some(e);
        }
      }
    }
    Err(match last_err {
      Some(e) if e.kind() == std::io::ErrorKind::TimedOut => {
        tracing::warn!("Connecting to {} timed out", target);
        Error::UpstreamTimeout(target)
      }
      Some(e) => Error::upstream_unavailable(target, e),
      None => Error::upstream_unavailable(target, "no addresses resolved"),
    })
  }

  async fn resolve(&self, host: &str, port: u16, target: &str) -> Result<Vec<SocketAddr>> {
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare.parse::<IpAddr>() {
      return Ok(vec![SocketAddr::new(ip, port)]);
    }
    let lookup = async {
      tokio::net::lookup_host((bare, port))
        .await
        .map(|addrs| addrs.collect::<Vec<_>>())
    };
    match with_timeout(self.connect_timeout, lookup).await {
      Ok(addrs) => Ok(addrs),
      Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
        Err(Error::UpstreamTimeout(target.to_string()))
      }
      Err(e) => Err(Error::upstream_unavailable(target, format!("DNS: {}", e))),
    }
  }

  /// Connect to a remote endpoint with addr
  async fn connect_with_addr(&self, addr: SocketAddr) -> std::io::Result<Socket> {
    let raw_socket = RawSocket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    raw_socket.set_nonblocking(true)?;
    let socket = TcpSocket::from_std_stream(raw_socket.into());
    if self.nodelay {
      socket.set_nodelay(self.nodelay)?;
    }
    if self.keepalive {
      socket.set_keepalive(self.keepalive)?;
    }
    let s = with_timeout(self.connect_timeout, socket.connect(addr)).await?;
    Ok(Socket::new(
      MaybeTlsStream::Tcp(s),
      self.read_timeout,
      self.write_timeout,
    ))
  }

  /// Client-role TLS handshake with SNI = `domain`
  async fn upgrade_to_tls(&self, stream: Socket, domain: &str) -> Result<Socket> {
    let bare = domain.trim_start_matches('[').trim_end_matches(']');
    let server_name = ServerName::try_from(bare.to_owned())
      .map_err(|e| Error::handshake(format!("Invalid upstream name {}: {}", domain, e)))?;
    let this = self.tls.clone();
    let timeout = self.connect_timeout;
    stream
      .tls(move |t| async move { with_timeout(timeout, this.connect(server_name, t)).await })
      .await
      .map_err(|e| {
        if e.kind() == std::io::ErrorKind::TimedOut {
          Error::UpstreamTimeout(domain.to_string())
        } else {
          Error::handshake(format!("TLS handshake with {} failed: {}", domain, e))
        }
      })
  }
}

/// Identity of an upstream connection. Connections are only ever reused for
/// an identical key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UpstreamKey {
  /// lowercase host
  pub host: String,
  /// port
  pub port: u16,
  /// scheme
  pub scheme: Scheme,
}

impl UpstreamKey {
  /// Build a key, normalizing the host
  pub fn new(host: &str, port: u16, scheme: Scheme) -> Self {
    Self {
      host: host.to_ascii_lowercase(),
      port,
      scheme,
    }
  }
}

impl fmt::Display for UpstreamKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}://{}:{}", self.scheme.as_str(), self.host, self.port)
  }
}

/// One open connection to the real destination
#[derive(Debug)]
pub struct UpstreamConnection {
  key: UpstreamKey,
  stream: BufReader<Socket>,
}

impl UpstreamConnection {
  /// Open a connection for `key`
  pub async fn connect(connector: &Connector, key: UpstreamKey) -> Result<Self> {
    let socket = connector.connect(&key.host, key.port, key.scheme).await?;
    Ok(Self::from_socket(key, socket))
  }

  /// Wrap an already established socket
  pub fn from_socket(key: UpstreamKey, socket: Socket) -> Self {
    Self {
      key,
      stream: BufReader::new(socket),
    }
  }

  /// The key this connection was opened for
  pub fn key(&self) -> &UpstreamKey {
    &self.key
  }

  /// Send the request head exactly as it will be seen upstream
  pub async fn send(&mut self, request: &Request) -> Result<()> {
    let raw = request.to_raw();
    self
      .stream
      .get_mut()
      .write_all(&raw)
      .await
      .map_err(|e| self.map_io(e))
  }

  /// Send buffered body bytes after the head
  pub async fn send_body(&mut self, body: &[u8]) -> Result<()> {
    self
      .stream
      .get_mut()
      .write_all(body)
      .await
      .map_err(|e| self.map_io(e))
  }

  /// Flush everything written so far
  pub async fn flush(&mut self) -> Result<()> {
    self.stream.get_mut().flush().await.map_err(|e| self.map_io(e))
  }

  /// Check a parked connection before reuse. A peer that closed, failed or
  /// sent unsolicited bytes is not alive.
  pub async fn is_alive(&mut self) -> bool {
    tokio::time::timeout(Duration::ZERO, self.stream.fill_buf())
      .await
      .is_err()
  }

  /// Read the response head; the body is left on the stream for the
  /// pipeline to relay or buffer.
  pub async fn receive(&mut self, max_head_size: usize) -> Result<Response> {
    let timeout = self.stream.get_ref().read_timeout();
    let key = self.key.to_string();
    let head = ResponseBuilder::new(&mut self.stream, max_head_size).build_head();
    match tokio::time::timeout(timeout.unwrap_or(Duration::MAX), head).await {
      Ok(Ok(response)) => Ok(response),
      Ok(Err(Error::Io(e))) => Err(self.map_io(e)),
      Ok(Err(e)) => Err(Error::upstream_unavailable(key, e)),
      Err(_) => Err(Error::UpstreamTimeout(key)),
    }
  }

  /// The buffered stream, for body relaying
  pub fn stream(&mut self) -> &mut BufReader<Socket> {
    &mut self.stream
  }

  /// Only a connection with nothing left in its read buffer can carry
  /// another exchange.
  pub fn is_clean(&self) -> bool {
    self.stream.buffer().is_empty()
  }

  fn map_io(&self, e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::TimedOut {
      Error::UpstreamTimeout(self.key.to_string())
    } else {
      Error::upstream_unavailable(self.key.to_string(), e)
    }
  }
}

/// Idle upstream connection kept for one client connection.
///
/// Holds at most one connection; asking for a different key drops it, so a
/// socket is never carried over to another domain or client.
#[derive(Debug, Default)]
pub struct UpstreamPool {
  idle: Option<UpstreamConnection>,
}

impl UpstreamPool {
  /// An empty pool
  pub fn new() -> Self {
    Self::default()
  }

  /// A pool pre-filled with the connection established during interception
  pub fn seeded(connection: UpstreamConnection) -> Self {
    Self {
      idle: Some(connection),
    }
  }

  /// Take the idle connection if it matches `key`
  pub fn take(&mut self, key: &UpstreamKey) -> Option<UpstreamConnection> {
    match self.idle.take() {
      Some(conn) if conn.key() == key => Some(conn),
      Some(conn) => {
        tracing::debug!("Dropping idle upstream {} for {}", conn.key(), key);
        None
      }
      None => None,
    }
  }

  /// Park a connection for the next exchange
  pub fn put(&mut self, connection: UpstreamConnection) {
    if connection.is_clean() {
      self.idle = Some(connection);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::net::TcpListener;

  #[tokio::test]
  async fn refused_connection_is_upstream_unavailable() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let connector = Connector::builder().build().unwrap();
    let err = connector
      .connect("127.0.0.1", port, Scheme::Http)
      .await
      .unwrap_err();
    assert!(matches!(err, Error::UpstreamUnavailable { .. }), "{:?}", err);
  }

  #[tokio::test]
  async fn pool_never_hands_out_another_domain() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let connector = Connector::builder().build().unwrap();
    let key = UpstreamKey::new("127.0.0.1", port, Scheme::Http);
    let conn = UpstreamConnection::connect(&connector, key.clone())
      .await
      .unwrap();

    let mut pool = UpstreamPool::seeded(conn);
    let other = UpstreamKey::new("localhost", port, Scheme::Http);
    assert!(pool.take(&other).is_none());
    assert!(pool.take(&key).is_none());

    let conn = UpstreamConnection::connect(&connector, key.clone())
      .await
      .unwrap();
    pool.put(conn);
    assert!(pool.take(&key).is_some());
  }
}
