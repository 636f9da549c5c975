//! MITM Proxy server implementation
//!
//! Accepts client connections, reads the first request head, and either
//! intercepts a CONNECT tunnel or hands the plain connection to the pipeline.

use crate::ca::CertificateManager;
use crate::connector::{Connector, Scheme, UpstreamConnection, UpstreamKey, UpstreamPool};
use crate::errors::{Error, Result};
use crate::interceptor::InterceptorHandler;
use crate::pipeline::{ConnectionContext, Limits, Pipeline};
use crate::proxy::MitmConfig;
use crate::request::{Request, RequestBuilder};
use crate::socket::{with_timeout, Rewind};
use crate::tls::TlsInterceptor;
use bytes::Bytes;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, RwLock, Semaphore};

const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Proxy server implementation
pub struct ProxyServer {
  listener: TcpListener,
  handler: Arc<ConnectionHandler>,
  permits: Arc<Semaphore>,
  max_connections: usize,
}

impl ProxyServer {
  /// Bind `config.listen_addr`
  pub async fn bind(
    config: &MitmConfig,
    cert_manager: Arc<CertificateManager>,
    connector: Arc<Connector>,
    interceptor_handler: Arc<RwLock<InterceptorHandler>>,
  ) -> Result<Self> {
    let listener = TcpListener::bind(config.listen_addr).await?;
    let limits = Limits::from(config);
    let handler = ConnectionHandler {
      tls: TlsInterceptor::new(cert_manager, connector.clone(), config.handshake_timeout),
      pipeline: Pipeline::new(interceptor_handler, connector, limits),
      handshake_timeout: config.handshake_timeout,
    };
    let max_connections = config.max_connections.max(1);
    Ok(Self {
      listener,
      handler: Arc::new(handler),
      permits: Arc::new(Semaphore::new(max_connections)),
      max_connections,
    })
  }

  /// Address actually bound, useful with port 0
  pub fn local_addr(&self) -> Result<SocketAddr> {
    Ok(self.listener.local_addr()?)
  }

  /// Serve until the process is interrupted with Ctrl-C
  pub async fn run(self) -> Result<()> {
    self
      .run_until(async {
        if tokio::signal::ctrl_c().await.is_err() {
          std::future::pending::<()>().await;
        }
      })
      .await
  }

  /// Serve until `shutdown` resolves or a CA failure makes further
  /// interception impossible.
  pub async fn run_until<F>(self, shutdown: F) -> Result<()>
  where
    F: Future<Output = ()>,
  {
    tracing::info!(
      "MITM proxy listening on {}",
      self.listener.local_addr()?
    );
    let (fatal_tx, mut fatal_rx) = watch::channel::<Option<String>>(None);
    tokio::pin!(shutdown);

    let outcome = loop {
      let accepted = tokio::select! {
        _ = &mut shutdown => break Ok(()),
        _ = fatal_rx.changed() => {
          let reason = fatal_rx.borrow().clone().unwrap_or_default();
          break Err(Error::Ca(reason));
        }
        accepted = self.listener.accept() => accepted,
      };
      let (stream, peer) = match accepted {
        Ok(accepted) => accepted,
        Err(e) => {
          tracing::warn!("Failed to accept connection: {}", e);
          continue;
        }
      };
      let permit = match self.permits.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
          tracing::debug!(
            "All {} connection slots busy, {} waits",
            self.max_connections,
            peer
          );
          tokio::select! {
            _ = &mut shutdown => break Ok(()),
            permit = self.permits.clone().acquire_owned() => match permit {
              Ok(permit) => permit,
              Err(_) => break Ok(()),
            },
          }
        }
      };
      let handler = self.handler.clone();
      let fatal = fatal_tx.clone();
      tokio::spawn(async move {
        let _permit = permit;
        match handler.handle(stream, peer).await {
          Ok(()) => tracing::trace!("Connection from {} finished", peer),
          Err(Error::Ca(reason)) => {
            tracing::error!("CA failure while serving {}: {}", peer, reason);
            fatal.send(Some(reason)).ok();
          }
          Err(e) => tracing::debug!("Connection from {} closed: {}", peer, e),
        }
      });
    };

    tracing::info!("MITM proxy shutting down");
    let in_flight = u32::try_from(self.max_connections).unwrap_or(u32::MAX);
    if tokio::time::timeout(DRAIN_GRACE, self.permits.acquire_many(in_flight))
      .await
      .is_err()
    {
      tracing::warn!("Dropping connections still open after {:?}", DRAIN_GRACE);
    }
    outcome
  }
}

/// Per-connection state machine shared by all connection tasks
struct ConnectionHandler {
  tls: TlsInterceptor,
  pipeline: Pipeline,
  handshake_timeout: Duration,
}

impl ConnectionHandler {
  async fn handle(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
    stream.set_nodelay(true).ok();
    let mut reader = BufReader::new(stream);

    let head = RequestBuilder::new(&mut reader, self.pipeline.limits().max_head_size).build_head();
    let first = match tokio::time::timeout(self.handshake_timeout, head).await {
      Ok(first) => first?,
      Err(_) => return Err(Error::protocol(format!("{} sent no request in time", peer))),
    };
    let Some(first) = first else {
      return Ok(());
    };

    let connect = if first.method() == http::Method::CONNECT {
      first
    } else {
      tracing::debug!("Plain HTTP from {}", peer);
      let ctx = ConnectionContext {
        peer: Some(peer),
        tunnel: None,
      };
      let mut pool = UpstreamPool::new();
      match self
        .pipeline
        .serve(&mut reader, &ctx, &mut pool, Some(first))
        .await?
      {
        Some(connect) => connect,
        None => return Ok(()),
      }
    };
    self.tunnel(reader, peer, connect).await
  }

  /// Acknowledge the CONNECT, terminate the client's TLS, open the upstream
  /// TLS leg and run the pipeline between the two plaintext streams.
  async fn tunnel(
    &self,
    mut reader: BufReader<TcpStream>,
    peer: SocketAddr,
    connect: Request,
  ) -> Result<()> {
    let (host, port) = connect.connect_target()?;
    let write_timeout = self.pipeline.limits().write_timeout;
    with_timeout(write_timeout, reader.get_mut().write_all(CONNECT_ESTABLISHED)).await?;
    with_timeout(write_timeout, reader.get_mut().flush()).await?;
    tracing::debug!("Tunnel {} -> {}:{}", peer, host, port);

    // the ClientHello may already sit in the read buffer
    let leftover = Bytes::copy_from_slice(reader.buffer());
    let stream = Rewind::new_buffered(reader.into_inner(), leftover);
    let client = self.tls.accept_client(stream, &host).await?;

    let key = UpstreamKey::new(&host, port, Scheme::Https);
    let mut pool = match self.tls.connect_upstream(&host, port).await {
      Ok(upstream) => UpstreamPool::seeded(UpstreamConnection::from_socket(key, upstream)),
      // reported to the client as 502/504 by the first exchange
      Err(e) if e.is_upstream() => UpstreamPool::new(),
      Err(e) => return Err(e),
    };

    let ctx = ConnectionContext {
      peer: Some(peer),
      tunnel: Some((host, port)),
    };
    let mut client = BufReader::new(client);
    self
      .pipeline
      .serve(&mut client, &ctx, &mut pool, None)
      .await
      .map(|_| ())
  }
}
