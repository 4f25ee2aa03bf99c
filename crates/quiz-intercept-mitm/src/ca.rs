//! Certificate Authority (CA) management
//!
//! The proxy terminates TLS for intercepted hosts with leaf certificates signed by a local
//! root CA. The root is generated once and kept next to the proxy so the browser only has to
//! trust it a single time.

use crate::error::{Error, Result};
use moka::future::Cache;
use rand::Rng;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
  KeyUsagePurpose, SanType,
};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};

const CA_CERT_FILE: &str = "ca_cert.pem";
const CA_KEY_FILE: &str = "ca_key.pem";
const CA_COMMON_NAME: &str = "Quiz Intercept CA";
/// Root validity in days
const CA_VALIDITY_DAYS: i64 = 3650;
/// Leaf validity (1 year)
const LEAF_TTL_SECS: i64 = 365 * 24 * 60 * 60;
/// Cached leaves are dropped well before they expire
const CACHE_TTL_SECS: u64 = (LEAF_TTL_SECS / 2) as u64;
/// Backdate `not_before` to tolerate clock skew
const NOT_BEFORE_SKEW_SECS: i64 = 60;

/// A leaf chain (`[leaf, root]`) and its private key
pub type ServerCert = (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>);

/// Root CA able to sign per-host leaf certificates
pub struct CertificateAuthority {
  issuer: Issuer<'static, KeyPair>,
  ca_cert_der: CertificateDer<'static>,
  storage_path: PathBuf,
}

impl CertificateAuthority {
  /// Load the CA stored under `storage_path`, generating a fresh one when absent.
  pub async fn new(storage_path: impl AsRef<Path>) -> Result<Self> {
    let storage_path = storage_path.as_ref().to_path_buf();
    fs::create_dir_all(&storage_path).await?;

    let cert_path = storage_path.join(CA_CERT_FILE);
    let key_path = storage_path.join(CA_KEY_FILE);

    let (cert_pem, key_pem) = if cert_path.exists() && key_path.exists() {
      tracing::debug!("loading CA from {}", storage_path.display());
      (
        fs::read_to_string(&cert_path).await?,
        fs::read_to_string(&key_path).await?,
      )
    } else {
      let (cert_pem, key_pem) = Self::generate_root()?;
      fs::write(&cert_path, cert_pem.as_bytes()).await?;
      fs::write(&key_path, key_pem.as_bytes()).await?;
      tracing::info!("generated new CA certificate at {}", cert_path.display());
      (cert_pem, key_pem)
    };

    let key_pair = KeyPair::from_pem(&key_pem)
      .map_err(|e| Error::certificate_error(format!("Failed to parse CA key: {}", e)))?;
    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
      .map_err(|e| Error::certificate_error(format!("Failed to load CA certificate: {}", e)))?;
    let ca_cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
      .next()
      .ok_or_else(|| Error::certificate_error("No certificate found in CA PEM"))?
      .map_err(|e| Error::certificate_error(format!("Failed to parse CA PEM: {}", e)))?;

    Ok(Self {
      issuer,
      ca_cert_der,
      storage_path,
    })
  }

  /// Self-sign a new root, returning `(cert_pem, key_pem)`.
  fn generate_root() -> Result<(String, String)> {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, CA_COMMON_NAME);
    dn.push(DnType::OrganizationName, "quiz-intercept");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_SKEW_SECS);
    params.not_after = now + Duration::days(CA_VALIDITY_DAYS);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate_error(format!("Failed to generate key pair: {}", e)))?;
    let cert = params
      .self_signed(&key_pair)
      .map_err(|e| Error::certificate_error(format!("Failed to generate CA: {}", e)))?;

    Ok((cert.pem(), key_pair.serialize_pem()))
  }

  /// Sign a leaf certificate for `domain`.
  pub fn generate_server_cert(&self, domain: &str) -> Result<ServerCert> {
    let mut params = CertificateParams::default();
    params.serial_number = Some(rand::thread_rng().gen::<u64>().into());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, domain);
    params.distinguished_name = dn;

    // IP literals get both SAN kinds, clients disagree on which one they check.
    params.subject_alt_names = match domain.parse::<IpAddr>() {
      Ok(ip) => {
        let mut sans = vec![SanType::IpAddress(ip)];
        if let Ok(dns_name) = domain.try_into() {
          sans.push(SanType::DnsName(dns_name));
        }
        sans
      }
      Err(_) => vec![SanType::DnsName(domain.try_into().map_err(|_| {
        Error::certificate_error(format!("Invalid domain name: {}", domain))
      })?)],
    };

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_SKEW_SECS);
    params.not_after = now + Duration::seconds(LEAF_TTL_SECS);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate_error(format!("Failed to generate key pair: {}", e)))?;
    let cert = params
      .signed_by(&key_pair, &self.issuer)
      .map_err(|e| Error::certificate_error(format!("Failed to sign leaf for {}: {}", domain, e)))?;

    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
      .map_err(|_| Error::certificate_error("Failed to serialize leaf key"))?;

    Ok((
      vec![CertificateDer::from(cert.der().to_vec()), self.ca_cert_der.clone()],
      key_der,
    ))
  }

  /// CA certificate in PEM format, for installation in the browser trust store
  pub fn ca_cert_pem(&self) -> Result<String> {
    std::fs::read_to_string(self.ca_cert_path())
      .map_err(|e| Error::certificate_error(format!("Failed to read CA cert: {}", e)))
  }

  /// Path of the CA certificate file
  pub fn ca_cert_path(&self) -> PathBuf {
    self.storage_path.join(CA_CERT_FILE)
  }
}

/// Caches minted leaf certificates per host
pub struct CertificateManager {
  ca: CertificateAuthority,
  cert_cache: Cache<String, Arc<ServerCert>>,
}

impl CertificateManager {
  pub async fn new(storage_path: impl AsRef<Path>) -> Result<Self> {
    let ca = CertificateAuthority::new(storage_path).await?;
    let cert_cache = Cache::builder()
      .max_capacity(256)
      .time_to_live(std::time::Duration::from_secs(CACHE_TTL_SECS))
      .build();
    Ok(Self { ca, cert_cache })
  }

  /// Get the cached leaf for `domain`, minting one on first use.
  pub async fn get_server_cert(&self, domain: &str) -> Result<ServerCert> {
    if let Some(cached) = self.cert_cache.get(domain).await {
      let (chain, key) = cached.as_ref();
      return Ok((chain.clone(), key.clone_key()));
    }

    let (chain, key) = self.ca.generate_server_cert(domain)?;
    self
      .cert_cache
      .insert(domain.to_string(), Arc::new((chain.clone(), key.clone_key())))
      .await;
    Ok((chain, key))
  }

  pub fn ca_cert_pem(&self) -> Result<String> {
    self.ca.ca_cert_pem()
  }

  pub fn ca_cert_path(&self) -> PathBuf {
    self.ca.ca_cert_path()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn reuses_existing_root() {
    let dir = tempfile::tempdir().unwrap();
    let first = CertificateAuthority::new(dir.path()).await.unwrap();
    let pem = first.ca_cert_pem().unwrap();

    let second = CertificateAuthority::new(dir.path()).await.unwrap();
    assert_eq!(second.ca_cert_pem().unwrap(), pem);
  }

  #[tokio::test]
  async fn ip_literal_gets_a_leaf() {
    let dir = tempfile::tempdir().unwrap();
    let ca = CertificateAuthority::new(dir.path()).await.unwrap();
    let (chain, _key) = ca.generate_server_cert("127.0.0.1").unwrap();
    assert_eq!(chain.len(), 2);
  }
}
