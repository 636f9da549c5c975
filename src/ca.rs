//! Certificate Authority (CA) management
//!
//! The root CA is loaded from (or generated into) a storage directory once at
//! startup. Leaf certificates are issued per intercepted hostname, cached, and
//! always chain to the CA that is current when they are handed out.
//!

use crate::errors::{Error, Result};
use moka::future::Cache;
use rand::Rng;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
  Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use x509_parser::prelude::{FromDer, X509Certificate};

const CA_CERT_FILE: &str = "ca_cert.pem";
const CA_KEY_FILE: &str = "ca_key.pem";
/// Offset for not_before timestamp to handle clock skew (60 seconds)
const NOT_BEFORE_OFFSET: i64 = 60;
/// Leaves this close to expiry are re-issued instead of served from cache
const RENEW_MARGIN: i64 = 60 * 60;

/// Root certificate authority used to sign every leaf certificate.
pub struct CertificateAuthority {
  issuer: Issuer<'static, KeyPair>,
  ca_cert_der: CertificateDer<'static>,
  ca_cert_pem: String,
  not_after: OffsetDateTime,
  storage_path: PathBuf,
}

impl CertificateAuthority {
  /// Load the CA stored under `storage_path`, or generate and persist a new one.
  ///
  /// A stored CA is reused only while it is unexpired and allowed to sign
  /// certificates. PEM files that cannot be parsed are reported as
  /// [`Error::Ca`] rather than silently replaced, because clients may already
  /// trust them.
  pub async fn ensure_ca(
    storage_path: impl AsRef<Path>,
    validity: std::time::Duration,
  ) -> Result<Self> {
    let storage_path = storage_path.as_ref().to_path_buf();

    if !storage_path.exists() {
      fs::create_dir_all(&storage_path).await.map_err(|e| {
        Error::ca(format!(
          "Failed to create CA directory {}: {}",
          storage_path.display(),
          e
        ))
      })?;
    }

    let cert_path = storage_path.join(CA_CERT_FILE);
    let key_path = storage_path.join(CA_KEY_FILE);
    if cert_path.exists() && key_path.exists() {
      match Self::load_ca(&storage_path).await? {
        Some(ca) => {
          tracing::info!("Loaded CA certificate from {}", cert_path.display());
          return Ok(ca);
        }
        None => tracing::warn!(
          "CA at {} is expired or cannot sign certificates; generating a new one",
          cert_path.display()
        ),
      }
    }
    Self::generate_ca(&storage_path, validity).await
  }

  /// Returns `Ok(None)` when the stored CA parses but is no longer usable.
  async fn load_ca(storage_path: &Path) -> Result<Option<Self>> {
    let cert_pem = fs::read_to_string(storage_path.join(CA_CERT_FILE))
      .await
      .map_err(|e| Error::ca(format!("Failed to read CA cert: {}", e)))?;
    let key_pem = fs::read_to_string(storage_path.join(CA_KEY_FILE))
      .await
      .map_err(|e| Error::ca(format!("Failed to read CA key: {}", e)))?;

    let ca_cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
      .next()
      .ok_or_else(|| Error::ca("No certificate found in PEM"))?
      .map_err(|e| Error::ca(format!("Failed to parse PEM: {}", e)))?;
    let not_after = match signing_validity(&ca_cert_der)? {
      Some(not_after) => not_after,
      None => return Ok(None),
    };

    let key_pair = KeyPair::from_pem(&key_pem)
      .map_err(|e| Error::ca(format!("Failed to parse CA key: {}", e)))?;
    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
      .map_err(|e| Error::ca(format!("Failed to create issuer from CA cert: {}", e)))?;

    Ok(Some(Self {
      issuer,
      ca_cert_der,
      ca_cert_pem: cert_pem,
      not_after,
      storage_path: storage_path.to_path_buf(),
    }))
  }

  /// Generate a new CA certificate and key and persist both
  async fn generate_ca(storage_path: &Path, validity: std::time::Duration) -> Result<Self> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "twiproxy Interception CA");
    dn.push(DnType::OrganizationName, "twiproxy");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
      KeyUsagePurpose::KeyCertSign,
      KeyUsagePurpose::CrlSign,
      KeyUsagePurpose::DigitalSignature,
    ];

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = now + to_time_duration(validity);
    let not_after = params.not_after;

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::ca(format!("Failed to generate key pair: {}", e)))?;
    let cert = params
      .self_signed(&key_pair)
      .map_err(|e| Error::ca(format!("Failed to generate CA: {}", e)))?;

    let cert_pem = cert.pem();
    let key_pem = key_pair.serialize_pem();

    let key_path = storage_path.join(CA_KEY_FILE);
    fs::write(&key_path, key_pem.as_bytes())
      .await
      .map_err(|e| Error::ca(format!("Failed to write CA key: {}", e)))?;
    #[cfg(unix)]
    {
      use std::os::unix::fs::PermissionsExt;
      fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600))
        .await
        .map_err(|e| Error::ca(format!("Failed to restrict CA key permissions: {}", e)))?;
    }
    fs::write(storage_path.join(CA_CERT_FILE), cert_pem.as_bytes())
      .await
      .map_err(|e| Error::ca(format!("Failed to write CA cert: {}", e)))?;

    let ca_cert_der = CertificateDer::from(cert.der().to_vec());
    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
      .map_err(|e| Error::ca(format!("Failed to create issuer: {}", e)))?;

    tracing::info!(
      "Generated new CA certificate at {}",
      storage_path.join(CA_CERT_FILE).display()
    );

    Ok(Self {
      issuer,
      ca_cert_der,
      ca_cert_pem: cert_pem,
      not_after,
      storage_path: storage_path.to_path_buf(),
    })
  }

  /// Sign a leaf certificate for `hostname`.
  fn sign_leaf(&self, hostname: &str, validity: Duration, epoch: u64) -> Result<LeafCertificate> {
    let mut params = CertificateParams::default();
    params.serial_number = Some(rand::thread_rng().gen::<u64>().into());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, hostname);
    params.distinguished_name = dn;

    // IP literals get an iPAddress SAN, and a dNSName one when rcgen accepts it.
    params.subject_alt_names = if let Ok(ip) = hostname.parse::<IpAddr>() {
      let mut sans = vec![SanType::IpAddress(ip)];
      if let Ok(dns_name) = hostname.try_into() {
        sans.push(SanType::DnsName(dns_name));
      }
      sans
    } else {
      vec![SanType::DnsName(hostname.try_into().map_err(|_| {
        Error::handshake(format!("Invalid domain name: {}", hostname))
      })?)]
    };
    params.key_usages = vec![
      KeyUsagePurpose::DigitalSignature,
      KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    // a leaf never outlives its issuer
    params.not_after = std::cmp::min(now + validity, self.not_after);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::ca(format!("Failed to generate key pair: {}", e)))?;
    let cert = params
      .signed_by(&key_pair, &self.issuer)
      .map_err(|e| Error::ca(format!("Failed to sign leaf for {}: {}", hostname, e)))?;

    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
      .map_err(|_| Error::ca("Failed to serialize leaf key"))?;

    Ok(LeafCertificate {
      hostname: hostname.to_string(),
      cert_chain: vec![
        CertificateDer::from(cert.der().to_vec()),
        self.ca_cert_der.clone(),
      ],
      key_der,
      not_after: params.not_after,
      ca_epoch: epoch,
    })
  }

  /// Get CA certificate in PEM format for client installation
  pub fn ca_cert_pem(&self) -> &str {
    &self.ca_cert_pem
  }

  /// Get CA certificate in DER format
  pub fn ca_cert_der(&self) -> &CertificateDer<'static> {
    &self.ca_cert_der
  }

  /// Get CA certificate path
  pub fn ca_cert_path(&self) -> PathBuf {
    self.storage_path.join(CA_CERT_FILE)
  }

  /// When the CA stops being valid
  pub fn not_after(&self) -> OffsetDateTime {
    self.not_after
  }
}

impl fmt::Debug for CertificateAuthority {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CertificateAuthority")
      .field("storage_path", &self.storage_path)
      .field("not_after", &self.not_after)
      .finish_non_exhaustive()
  }
}

/// A per-host certificate signed by the current [`CertificateAuthority`].
pub struct LeafCertificate {
  hostname: String,
  /// [leaf, ca]
  cert_chain: Vec<CertificateDer<'static>>,
  key_der: PrivateKeyDer<'static>,
  not_after: OffsetDateTime,
  ca_epoch: u64,
}

impl LeafCertificate {
  /// The hostname the certificate was issued for
  pub fn hostname(&self) -> &str {
    &self.hostname
  }

  /// The leaf certificate itself
  pub fn cert_der(&self) -> &CertificateDer<'static> {
    &self.cert_chain[0]
  }

  /// Chain presented to clients: the leaf followed by the CA
  pub fn cert_chain(&self) -> &[CertificateDer<'static>] {
    &self.cert_chain
  }

  /// A copy of the private key, for building a TLS server config
  pub fn private_key(&self) -> PrivateKeyDer<'static> {
    self.key_der.clone_key()
  }

  /// Expiry of the leaf
  pub fn not_after(&self) -> OffsetDateTime {
    self.not_after
  }

  /// Rotation counter of the CA that signed this leaf
  pub fn ca_epoch(&self) -> u64 {
    self.ca_epoch
  }

  fn expires_within(&self, margin: Duration) -> bool {
    self.not_after <= OffsetDateTime::now_utc() + margin
  }
}

impl fmt::Debug for LeafCertificate {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("LeafCertificate")
      .field("hostname", &self.hostname)
      .field("not_after", &self.not_after)
      .field("ca_epoch", &self.ca_epoch)
      .finish_non_exhaustive()
  }
}

struct CaSlot {
  epoch: u64,
  ca: Arc<CertificateAuthority>,
}

/// Issues leaf certificates and caches them by hostname.
///
/// Concurrent first use of a hostname is coalesced by the cache, so exactly
/// one certificate is signed per hostname and CA epoch.
pub struct CertificateManager {
  slot: RwLock<CaSlot>,
  ca_validity: std::time::Duration,
  leaf_validity: Duration,
  cert_cache: Cache<(u64, String), Arc<LeafCertificate>>,
}

impl CertificateManager {
  /// Create a new certificate manager around the CA stored at `storage_path`
  pub async fn new(
    storage_path: impl AsRef<Path>,
    ca_validity: std::time::Duration,
    leaf_validity: std::time::Duration,
    capacity: u64,
  ) -> Result<Self> {
    let ca = CertificateAuthority::ensure_ca(storage_path, ca_validity).await?;
    Ok(Self::with_authority(ca, ca_validity, leaf_validity, capacity))
  }

  /// Create a certificate manager from an already loaded CA
  pub fn with_authority(
    ca: CertificateAuthority,
    ca_validity: std::time::Duration,
    leaf_validity: std::time::Duration,
    capacity: u64,
  ) -> Self {
    // Entries leave the cache well before the leaf itself expires
    let cert_cache = Cache::builder()
      .max_capacity(capacity)
      .time_to_live(leaf_validity / 2)
      .build();
    Self {
      slot: RwLock::new(CaSlot {
        epoch: 0,
        ca: Arc::new(ca),
      }),
      ca_validity,
      leaf_validity: to_time_duration(leaf_validity),
      cert_cache,
    }
  }

  fn current(&self) -> (u64, Arc<CertificateAuthority>) {
    let slot = self.slot.read().unwrap_or_else(|e| e.into_inner());
    (slot.epoch, slot.ca.clone())
  }

  /// Get or issue the leaf certificate for `hostname`.
  pub async fn issue_leaf(&self, hostname: &str) -> Result<Arc<LeafCertificate>> {
    let host = normalize_host(hostname);
    let (epoch, ca) = self.current();
    let key = (epoch, host.clone());

    if let Some(leaf) = self.cert_cache.get(&key).await {
      if !leaf.expires_within(Duration::seconds(RENEW_MARGIN)) {
        return Ok(leaf);
      }
      self.cert_cache.invalidate(&key).await;
    }

    let validity = self.leaf_validity;
    self
      .cert_cache
      .try_get_with(key, async move {
        tracing::debug!("Issuing leaf certificate for {}", host);
        ca.sign_leaf(&host, validity, epoch).map(Arc::new)
      })
      .await
      .map_err(|e| match e.as_ref() {
        Error::Handshake(msg) => Error::Handshake(msg.clone()),
        other => Error::Ca(other.to_string()),
      })
  }

  /// Replace the CA with a freshly generated one.
  ///
  /// Every leaf issued before the rotation stops being served; clients must
  /// trust the new CA.
  pub async fn rotate_ca(&self) -> Result<()> {
    let (_, old) = self.current();
    let fresh = CertificateAuthority::generate_ca(&old.storage_path, self.ca_validity).await?;
    {
      let mut slot = self.slot.write().unwrap_or_else(|e| e.into_inner());
      slot.epoch += 1;
      slot.ca = Arc::new(fresh);
    }
    self.cert_cache.invalidate_all();
    tracing::info!("Rotated CA certificate");
    Ok(())
  }

  /// The CA currently used for signing
  pub fn authority(&self) -> Arc<CertificateAuthority> {
    self.current().1
  }

  /// Get the CA certificate in PEM format
  pub fn ca_cert_pem(&self) -> String {
    self.current().1.ca_cert_pem().to_string()
  }

  /// Get the CA certificate path
  pub fn ca_cert_path(&self) -> PathBuf {
    self.current().1.ca_cert_path()
  }
}

/// Expiry of a stored CA certificate, or `None` when it is expired, not a
/// CA, or not allowed to sign certificates.
fn signing_validity(der: &[u8]) -> Result<Option<OffsetDateTime>> {
  let (_, cert) = X509Certificate::from_der(der)
    .map_err(|e| Error::ca(format!("Failed to parse CA cert: {}", e)))?;
  let not_after = cert.validity().not_after.to_datetime();
  if not_after <= OffsetDateTime::now_utc() {
    tracing::debug!("Stored CA expired at {}", not_after);
    return Ok(None);
  }
  let can_sign = cert
    .key_usage()
    .ok()
    .flatten()
    .is_some_and(|usage| usage.value.key_cert_sign());
  if !cert.is_ca() || !can_sign {
    tracing::debug!("Stored CA lacks basicConstraints CA or keyCertSign");
    return Ok(None);
  }
  Ok(Some(not_after))
}

fn normalize_host(hostname: &str) -> String {
  hostname
    .trim_start_matches('[')
    .trim_end_matches(']')
    .trim_end_matches('.')
    .to_ascii_lowercase()
}

fn to_time_duration(d: std::time::Duration) -> Duration {
  Duration::try_from(d).unwrap_or(Duration::MAX)
}
