//! TLS interception
//!
//! After a CONNECT the client leg is terminated with a leaf certificate issued
//! for the tunneled host, then a second, independent handshake is made with
//! the real upstream. Either handshake failing closes both legs; there is no
//! plaintext fallback.
use crate::ca::{CertificateManager, LeafCertificate};
use crate::connector::{Connector, Scheme};
use crate::errors::{Error, Result};
use crate::socket::Socket;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::rustls;
use tokio_rustls::rustls::pki_types::CertificateDer;
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::server::TlsStream;
use tokio_rustls::LazyConfigAcceptor;

const ALPN_HTTP_11: &[u8] = b"http/1.1";

/// Represents a trusted X509 root certificate for upstream connections.
#[derive(Clone, Debug)]
pub struct Certificate {
  der: CertificateDer<'static>,
}

impl Certificate {
  /// Create a `Certificate` from a binary DER encoded certificate
  pub fn from_der(der: &[u8]) -> Certificate {
    Certificate {
      der: CertificateDer::from(der.to_vec()),
    }
  }

  /// Create a collection of `Certificate`s from a PEM encoded certificate bundle.
  /// Example byte sources may be `.crt`, `.cer` or `.pem` files.
  pub fn from_pem_bundle(pem_bundle: &[u8]) -> Result<Vec<Certificate>> {
    let mut reader = BufReader::new(pem_bundle);
    Self::read_pem_certs(&mut reader)
  }

  /// Read every certificate of a PEM bundle on disk
  pub fn from_pem_file(path: impl AsRef<Path>) -> Result<Vec<Certificate>> {
    let path = path.as_ref();
    let buf = std::fs::read(path).map_err(|e| {
      Error::handshake(format!(
        "Failed to read root certificates from {}: {}",
        path.display(),
        e
      ))
    })?;
    Self::from_pem_bundle(&buf)
  }

  fn add_to_tls(&self, root_cert_store: &mut RootCertStore) -> Result<()> {
    root_cert_store
      .add(self.der.clone())
      .map_err(|e| Error::handshake(format!("Invalid root certificate: {}", e)))
  }

  fn read_pem_certs(reader: &mut impl BufRead) -> Result<Vec<Certificate>> {
    rustls_pemfile::certs(reader)
      .map(|result| match result {
        Ok(der) => Ok(Certificate { der }),
        Err(_) => Err(Error::handshake("invalid certificate encoding")),
      })
      .collect()
  }
}

impl From<CertificateDer<'static>> for Certificate {
  fn from(der: CertificateDer<'static>) -> Self {
    Certificate { der }
  }
}

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
  rustls::crypto::CryptoProvider::get_default()
    .cloned()
    .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()))
}

/// Client-role TLS configuration for the upstream leg.
///
/// Trusts the platform roots plus `extra_roots`. Verification is never
/// relaxed: a certificate or hostname mismatch fails the handshake.
pub fn upstream_client_config(extra_roots: &[Certificate]) -> Result<ClientConfig> {
  let mut root_cert_store = RootCertStore::empty();
  for cert in extra_roots {
    cert.add_to_tls(&mut root_cert_store)?;
  }
  let native = rustls_native_certs::load_native_certs();
  for err in &native.errors {
    tracing::debug!("Skipping platform root store entry: {}", err);
  }
  let (added, ignored) = root_cert_store.add_parsable_certificates(native.certs);
  tracing::debug!("Loaded {} platform roots ({} ignored)", added, ignored);

  let mut config = ClientConfig::builder_with_provider(provider())
    .with_safe_default_protocol_versions()
    .map_err(|e| Error::handshake(format!("invalid TLS versions: {}", e)))?
    .with_root_certificates(root_cert_store)
    .with_no_client_auth();
  config.alpn_protocols = vec![ALPN_HTTP_11.to_vec()];
  Ok(config)
}

/// Server-role TLS configuration presenting `leaf` to the client
pub fn leaf_server_config(leaf: &LeafCertificate) -> Result<ServerConfig> {
  let mut config = ServerConfig::builder_with_provider(provider())
    .with_safe_default_protocol_versions()
    .map_err(|e| Error::handshake(format!("invalid TLS versions: {}", e)))?
    .with_no_client_auth()
    .with_single_cert(leaf.cert_chain().to_vec(), leaf.private_key())
    .map_err(|e| Error::handshake(format!("Failed to create TLS config: {}", e)))?;
  config.alpn_protocols = vec![ALPN_HTTP_11.to_vec()];
  Ok(config)
}

/// Drives both handshakes of an intercepted tunnel.
#[derive(Clone)]
pub struct TlsInterceptor {
  cert_manager: Arc<CertificateManager>,
  connector: Arc<Connector>,
  handshake_timeout: Duration,
}

impl TlsInterceptor {
  /// Create an interceptor issuing leaves from `cert_manager` and reaching
  /// upstreams through `connector`
  pub fn new(
    cert_manager: Arc<CertificateManager>,
    connector: Arc<Connector>,
    handshake_timeout: Duration,
  ) -> Self {
    Self {
      cert_manager,
      connector,
      handshake_timeout,
    }
  }

  /// Terminate TLS from the client for `host`.
  ///
  /// The ClientHello is read first; an SNI naming a different host than the
  /// CONNECT target aborts the handshake.
  pub async fn accept_client<IO>(&self, stream: IO, host: &str) -> Result<TlsStream<IO>>
  where
    IO: AsyncRead + AsyncWrite + Unpin,
  {
    let handshake = async {
      let start = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream)
        .await
        .map_err(|e| Error::handshake(format!("Failed to read ClientHello: {}", e)))?;
      let sni = start.client_hello().server_name().map(str::to_string);
      if let Some(sni) = &sni {
        if !sni_matches(sni, host) {
          return Err(Error::handshake(format!(
            "SNI {} does not match CONNECT host {}",
            sni, host
          )));
        }
      }
      let leaf = self.cert_manager.issue_leaf(host).await?;
      let config = leaf_server_config(&leaf)?;
      start
        .into_stream(Arc::new(config))
        .await
        .map_err(|e| Error::handshake(format!("TLS handshake with client failed: {}", e)))
    };
    tokio::time::timeout(self.handshake_timeout, handshake)
      .await
      .map_err(|_| Error::handshake(format!("TLS handshake with client for {} timed out", host)))?
  }

  /// Open the upstream leg: TCP connect, then a client-role handshake with
  /// SNI = `host`.
  pub async fn connect_upstream(&self, host: &str, port: u16) -> Result<Socket> {
    self.connector.connect(host, port, Scheme::Https).await
  }
}

fn sni_matches(sni: &str, host: &str) -> bool {
  let host = host.trim_start_matches('[').trim_end_matches(']');
  sni.trim_end_matches('.').eq_ignore_ascii_case(host.trim_end_matches('.'))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn sni_comparison_ignores_case_and_trailing_dot() {
    assert!(sni_matches("X.Example.", "x.example"));
    assert!(!sni_matches("evil.example", "x.example"));
  }

  #[tokio::test]
  async fn leaf_builds_a_server_config() {
    let dir = std::env::temp_dir().join(format!("twiproxy-tls-{}", std::process::id()));
    let day = Duration::from_secs(86400);
    let manager = CertificateManager::new(&dir, 365 * day, 30 * day, 10)
      .await
      .unwrap();
    let leaf = manager.issue_leaf("x.example").await.unwrap();
    let config = leaf_server_config(&leaf).unwrap();
    assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);

    let roots = Certificate::from_pem_bundle(manager.ca_cert_pem().as_bytes()).unwrap();
    assert_eq!(roots.len(), 1);
    assert!(upstream_client_config(&roots).is_ok());
    std::fs::remove_dir_all(&dir).ok();
  }
}
