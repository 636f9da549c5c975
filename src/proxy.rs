//! MITM Proxy configuration and main proxy implementation

use crate::ca::CertificateManager;
use crate::connector::Connector;
use crate::errors::Result;
use crate::interceptor::InterceptorHandler;
use crate::pipeline::Limits;
use crate::server::ProxyServer;
use crate::tls::Certificate;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Configuration for MITM proxy
#[derive(Debug, Clone)]
pub struct MitmConfig {
  /// Address the listener binds to
  pub listen_addr: SocketAddr,
  /// Directory holding `ca_cert.pem` and `ca_key.pem`
  pub ca_storage_path: PathBuf,
  /// Validity of a newly generated CA
  pub ca_validity: Duration,
  /// Validity of issued leaf certificates
  pub leaf_validity: Duration,
  /// Number of leaf certificates kept in memory
  pub leaf_cache_capacity: u64,
  /// Maximum concurrent client connections
  pub max_connections: usize,
  /// Upstream DNS + connect + TLS handshake timeout
  pub connect_timeout: Duration,
  /// Client-facing TLS handshake timeout, also bounds the first request line
  pub handshake_timeout: Duration,
  /// Per-read timeout on both legs
  pub read_timeout: Duration,
  /// Per-write timeout on both legs
  pub write_timeout: Duration,
  /// Time a kept-alive client may stay silent between requests
  pub idle_timeout: Duration,
  /// Upper bound for a single interceptor call
  pub hook_timeout: Duration,
  /// Bodies larger than this are streamed unless an interceptor needs them
  pub stream_threshold: usize,
  /// Hard cap for bodies buffered for inspection
  pub inspect_cap: usize,
  /// Largest accepted request or response head
  pub max_head_size: usize,
  /// Roots trusted for upstream TLS next to the platform store
  pub extra_root_certs: Vec<Certificate>,
}

impl Default for MitmConfig {
  fn default() -> Self {
    Self {
      listen_addr: SocketAddr::from(([127, 0, 0, 1], 8082)),
      ca_storage_path: PathBuf::from(".twiproxy"),
      ca_validity: 3650 * DAY,
      leaf_validity: 30 * DAY,
      leaf_cache_capacity: 1000,
      max_connections: 512,
      connect_timeout: Duration::from_secs(10),
      handshake_timeout: Duration::from_secs(10),
      read_timeout: Duration::from_secs(30),
      write_timeout: Duration::from_secs(30),
      idle_timeout: Duration::from_secs(60),
      hook_timeout: Duration::from_secs(2),
      stream_threshold: 64 * 1024,
      inspect_cap: 8 * 1024 * 1024,
      max_head_size: 64 * 1024,
      extra_root_certs: Vec::new(),
    }
  }
}

impl From<&MitmConfig> for Limits {
  fn from(config: &MitmConfig) -> Self {
    Limits {
      max_head_size: config.max_head_size,
      stream_threshold: config.stream_threshold,
      inspect_cap: config.inspect_cap,
      idle_timeout: config.idle_timeout,
      read_timeout: Some(config.read_timeout),
      write_timeout: Some(config.write_timeout),
    }
  }
}

/// MITM Proxy main struct.
///
/// Owns everything shared between connections: the CA and leaf cache, the
/// upstream connector and the interceptors. Separate instances share nothing,
/// so several proxies can run side by side in one process.
pub struct MitmProxy {
  config: MitmConfig,
  cert_manager: Arc<CertificateManager>,
  connector: Arc<Connector>,
  interceptor_handler: Arc<RwLock<InterceptorHandler>>,
}

impl MitmProxy {
  /// Create a new MITM proxy with the given configuration.
  ///
  /// Loads or generates the CA; an [`Error::Ca`](crate::Error::Ca) here means
  /// the proxy cannot start.
  pub async fn new(config: MitmConfig) -> Result<Self> {
    let cert_manager = Arc::new(
      CertificateManager::new(
        &config.ca_storage_path,
        config.ca_validity,
        config.leaf_validity,
        config.leaf_cache_capacity,
      )
      .await?,
    );
    let connector = Connector::builder()
      .connect_timeout(Some(config.connect_timeout))
      .read_timeout(Some(config.read_timeout))
      .write_timeout(Some(config.write_timeout))
      .certificate(config.extra_root_certs.clone())
      .build()?;
    let interceptor_handler = Arc::new(RwLock::new(InterceptorHandler::new(config.hook_timeout)));

    Ok(Self {
      config,
      cert_manager,
      connector: Arc::new(connector),
      interceptor_handler,
    })
  }

  /// The configuration this proxy was built with
  pub fn config(&self) -> &MitmConfig {
    &self.config
  }

  /// Get the CA certificate in PEM format
  ///
  /// This certificate should be installed in the client's trust store
  pub fn ca_cert_pem(&self) -> String {
    self.cert_manager.ca_cert_pem()
  }

  /// Get the CA certificate path
  pub fn ca_cert_path(&self) -> PathBuf {
    self.cert_manager.ca_cert_path()
  }

  /// The shared certificate manager
  pub fn cert_manager(&self) -> Arc<CertificateManager> {
    self.cert_manager.clone()
  }

  /// Get a reference to the interceptor handler
  pub fn interceptor_handler(&self) -> Arc<RwLock<InterceptorHandler>> {
    self.interceptor_handler.clone()
  }

  /// Bind the listener without accepting yet
  pub async fn bind(&self) -> Result<ProxyServer> {
    ProxyServer::bind(
      &self.config,
      self.cert_manager.clone(),
      self.connector.clone(),
      self.interceptor_handler.clone(),
    )
    .await
  }

  /// Start the MITM proxy server on the configured address
  pub async fn start(&self) -> Result<()> {
    self.bind().await?.run().await
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_mitm_proxy_creation() {
    let config = MitmConfig {
      ca_storage_path: std::env::temp_dir().join("twiproxy-test-proxy-creation"),
      ..Default::default()
    };

    let proxy = MitmProxy::new(config.clone()).await.unwrap();
    assert!(proxy.ca_cert_pem().contains("BEGIN CERTIFICATE"));
    assert!(proxy.ca_cert_path().exists());

    let limits = Limits::from(proxy.config());
    assert_eq!(limits.inspect_cap, 8 * 1024 * 1024);
    std::fs::remove_dir_all(&config.ca_storage_path).ok();
  }
}
