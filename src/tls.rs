//! TLS/certificate handling for rprox.
//!
//! This module provides:
//! - Certificate and key loading from PEM files
//! - Self-signed certificate auto-provisioning (ECDSA P-256)
//! - SHA-256 fingerprint computation
//! - rustls configuration builders for the inbound and outbound legs
//!
//! The outbound leg never verifies the backend's certificate: rprox is an
//! interception tool and the backend is chosen by the operator.

use rcgen::{CertificateParams, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, ServerConfig};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// File names used by `--auto-cert`.
const AUTO_CERT_FILENAME: &str = "autocert.pem";
const AUTO_KEY_FILENAME: &str = "autocert-key.pem";

/// Error type for TLS operations.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("cert file {0} doesn't exist")]
    CertFileMissing(PathBuf),

    #[error("certificate generation failed: {0}")]
    CertificateGeneration(String),

    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),
}

/// Result type for TLS operations.
pub type TlsResult<T> = std::result::Result<T, TlsError>;

/// TLS protocol selection for either leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsVersion {
    /// Negotiate the highest version both sides support.
    #[default]
    Negotiated,
    /// TLS 1.2 only.
    Tls12,
    /// TLS 1.3 only.
    Tls13,
}

impl TlsVersion {
    /// Maps the `--tls12`/`--tls13` flags onto a version selection.
    pub fn from_flags(tls12: bool, tls13: bool) -> Self {
        match (tls12, tls13) {
            (true, _) => TlsVersion::Tls12,
            (_, true) => TlsVersion::Tls13,
            _ => TlsVersion::Negotiated,
        }
    }

    fn protocol_versions(self) -> &'static [&'static rustls::SupportedProtocolVersion] {
        static TLS12_ONLY: [&rustls::SupportedProtocolVersion; 1] = [&rustls::version::TLS12];
        static TLS13_ONLY: [&rustls::SupportedProtocolVersion; 1] = [&rustls::version::TLS13];
        match self {
            TlsVersion::Negotiated => rustls::DEFAULT_VERSIONS,
            TlsVersion::Tls12 => &TLS12_ONLY,
            TlsVersion::Tls13 => &TLS13_ONLY,
        }
    }
}

/// Certificate chain and key with the leaf's computed fingerprint.
#[derive(Debug, Clone)]
pub struct CertKeyPair {
    /// Certificate chain in DER format.
    pub cert_der: Vec<Vec<u8>>,
    /// Private key in DER format.
    pub key_der: Vec<u8>,
    /// SHA-256 fingerprint of the leaf certificate (colon-separated hex).
    pub fingerprint: String,
}

impl CertKeyPair {
    fn cert_chain(&self) -> Vec<CertificateDer<'static>> {
        self.cert_der
            .iter()
            .map(|c| CertificateDer::from(c.clone()))
            .collect()
    }

    fn private_key(&self) -> TlsResult<PrivateKeyDer<'static>> {
        PrivateKeyDer::try_from(self.key_der.clone())
            .map_err(|e| TlsError::InvalidCertificate(e.to_string()))
    }
}

/// Generates a self-signed ECDSA P-256 certificate for the given common name.
///
/// Returns a tuple of (certificate PEM, private key PEM, fingerprint).
pub fn generate_self_signed_cert(common_name: &str) -> TlsResult<(String, String, String)> {
    let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
        .map_err(|e| TlsError::CertificateGeneration(e.to_string()))?;

    let mut params = CertificateParams::new(vec![common_name.to_string()])
        .map_err(|e| TlsError::CertificateGeneration(e.to_string()))?;

    // Valid for 1 year from now
    let now = time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + time::Duration::days(365);

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| TlsError::CertificateGeneration(e.to_string()))?;

    let cert_pem = cert.pem();
    let key_pem = key_pair.serialize_pem();
    let fingerprint = compute_fingerprint(cert.der());

    Ok((cert_pem, key_pem, fingerprint))
}

/// Provisions a self-signed certificate for `common_name` under `dir`,
/// reusing existing files from a previous run.
///
/// Returns the certificate and key paths to feed the listener config.
pub fn provision_auto_cert(common_name: &str, dir: &Path) -> TlsResult<(PathBuf, PathBuf)> {
    let cert_path = dir.join(AUTO_CERT_FILENAME);
    let key_path = dir.join(AUTO_KEY_FILENAME);

    if cert_path.exists() && key_path.exists() {
        return Ok((cert_path, key_path));
    }

    fs::create_dir_all(dir)?;
    let (cert_pem, key_pem, fingerprint) = generate_self_signed_cert(common_name)?;

    fs::write(&cert_path, &cert_pem)?;
    fs::write(&key_path, &key_pem)?;

    // Private key readable by owner only on Unix
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let permissions = fs::Permissions::from_mode(0o600);
        fs::set_permissions(&key_path, permissions)?;
    }

    tracing::info!(%common_name, %fingerprint, cert = %cert_path.display(), "provisioned self-signed certificate");

    Ok((cert_path, key_path))
}

/// Loads a certificate chain and key from PEM files.
///
/// When `key_path` is `None` the private key is read from the certificate
/// file, which then must carry both.
pub fn load_cert_key(cert_path: &Path, key_path: Option<&Path>) -> TlsResult<CertKeyPair> {
    if !cert_path.exists() {
        return Err(TlsError::CertFileMissing(cert_path.to_path_buf()));
    }
    if let Some(key_path) = key_path {
        if !key_path.exists() {
            return Err(TlsError::CertFileMissing(key_path.to_path_buf()));
        }
    }

    let cert_pem = fs::read_to_string(cert_path)?;
    let key_pem = match key_path {
        Some(path) => fs::read_to_string(path)?,
        None => cert_pem.clone(),
    };

    let cert_der = parse_cert_pem(&cert_pem)?;
    let key_der = parse_key_pem(&key_pem)?;
    let fingerprint = compute_fingerprint(&cert_der[0]);

    Ok(CertKeyPair {
        cert_der,
        key_der,
        fingerprint,
    })
}

/// Parses PEM-encoded certificates into DER format.
fn parse_cert_pem(pem: &str) -> TlsResult<Vec<Vec<u8>>> {
    let mut reader = BufReader::new(pem.as_bytes());
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::InvalidCertificate(e.to_string()))?;

    if certs.is_empty() {
        return Err(TlsError::InvalidCertificate(
            "no certificates found in PEM".to_string(),
        ));
    }

    Ok(certs.into_iter().map(|c| c.to_vec()).collect())
}

/// Parses a PEM-encoded private key into DER format.
fn parse_key_pem(pem: &str) -> TlsResult<Vec<u8>> {
    let mut reader = BufReader::new(pem.as_bytes());

    loop {
        match rustls_pemfile::read_one(&mut reader)
            .map_err(|e| TlsError::InvalidCertificate(e.to_string()))?
        {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => {
                return Ok(key.secret_pkcs1_der().to_vec());
            }
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => {
                return Ok(key.secret_pkcs8_der().to_vec());
            }
            Some(rustls_pemfile::Item::Sec1Key(key)) => {
                return Ok(key.secret_sec1_der().to_vec());
            }
            Some(_) => continue, // Skip other items (certificates, etc.)
            None => {
                return Err(TlsError::InvalidCertificate(
                    "no private key found in PEM".to_string(),
                ))
            }
        }
    }
}

/// Computes the SHA-256 fingerprint of a DER-encoded certificate.
///
/// Returns the fingerprint in colon-separated lowercase hex format.
pub fn compute_fingerprint(cert_der: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(cert_der);
    let hash = hasher.finalize();

    hash.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Builds the rustls server config for the inbound leg.
pub fn build_server_config(cert_key: &CertKeyPair, version: TlsVersion) -> TlsResult<ServerConfig> {
    ServerConfig::builder_with_protocol_versions(version.protocol_versions())
        .with_no_client_auth()
        .with_single_cert(cert_key.cert_chain(), cert_key.private_key()?)
        .map_err(|e| TlsError::TlsConfig(e.to_string()))
}

/// Builds the rustls client config for the outbound leg.
///
/// The backend's certificate is not verified; a client certificate is
/// presented when one was configured.
pub fn build_client_config(
    version: TlsVersion,
    client_cert: Option<&CertKeyPair>,
) -> TlsResult<ClientConfig> {
    let builder = ClientConfig::builder_with_protocol_versions(version.protocol_versions())
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerify));

    match client_cert {
        Some(cert_key) => builder
            .with_client_auth_cert(cert_key.cert_chain(), cert_key.private_key()?)
            .map_err(|e| TlsError::TlsConfig(e.to_string())),
        None => Ok(builder.with_no_client_auth()),
    }
}

/// Certificate verifier that accepts any backend certificate.
#[derive(Debug)]
pub struct NoVerify;

impl rustls::client::danger::ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn generate_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");

        let (cert_pem, key_pem, fingerprint) = generate_self_signed_cert("localhost").unwrap();
        fs::write(&cert_path, &cert_pem).unwrap();
        fs::write(&key_path, &key_pem).unwrap();

        let pair = load_cert_key(&cert_path, Some(&key_path)).unwrap();
        assert_eq!(pair.fingerprint, fingerprint);
        assert!(!pair.cert_der.is_empty());
        assert!(!pair.key_der.is_empty());
    }

    #[test]
    fn key_can_live_in_the_cert_file() {
        let dir = TempDir::new().unwrap();
        let combined_path = dir.path().join("combined.pem");

        let (cert_pem, key_pem, _) = generate_self_signed_cert("localhost").unwrap();
        fs::write(&combined_path, format!("{}{}", cert_pem, key_pem)).unwrap();

        let pair = load_cert_key(&combined_path, None).unwrap();
        assert!(!pair.key_der.is_empty());
    }

    #[test]
    fn missing_cert_file_is_reported() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope.pem");
        let err = load_cert_key(&missing, None).unwrap_err();
        assert!(matches!(err, TlsError::CertFileMissing(_)));
        assert!(err.to_string().contains("doesn't exist"));
    }

    #[test]
    fn auto_cert_reuses_existing_files() {
        let dir = TempDir::new().unwrap();
        let (cert1, key1) = provision_auto_cert("proxy.test", dir.path()).unwrap();
        let first = fs::read_to_string(&cert1).unwrap();

        let (cert2, key2) = provision_auto_cert("proxy.test", dir.path()).unwrap();
        assert_eq!(cert1, cert2);
        assert_eq!(key1, key2);
        assert_eq!(fs::read_to_string(&cert2).unwrap(), first);
    }

    #[test]
    fn fingerprint_is_colon_separated_hex() {
        let fp = compute_fingerprint(b"test data");
        assert_eq!(fp.len(), 95);
        assert_eq!(fp.split(':').count(), 32);
    }

    #[test]
    fn version_flags_map_to_selection() {
        assert_eq!(TlsVersion::from_flags(false, false), TlsVersion::Negotiated);
        assert_eq!(TlsVersion::from_flags(true, false), TlsVersion::Tls12);
        assert_eq!(TlsVersion::from_flags(false, true), TlsVersion::Tls13);
    }

    #[test]
    fn version_pins_offer_exactly_one_protocol() {
        let pinned12 = TlsVersion::Tls12.protocol_versions();
        assert_eq!(pinned12.len(), 1);
        assert_eq!(pinned12[0].version, rustls::ProtocolVersion::TLSv1_2);

        let pinned13 = TlsVersion::Tls13.protocol_versions();
        assert_eq!(pinned13.len(), 1);
        assert_eq!(pinned13[0].version, rustls::ProtocolVersion::TLSv1_3);

        assert!(TlsVersion::Negotiated.protocol_versions().len() > 1);
    }

    #[test]
    fn builds_server_and_client_configs() {
        let _ = rustls::crypto::ring::default_provider().install_default();

        let dir = TempDir::new().unwrap();
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");
        let (cert_pem, key_pem, _) = generate_self_signed_cert("localhost").unwrap();
        fs::write(&cert_path, cert_pem).unwrap();
        fs::write(&key_path, key_pem).unwrap();

        let pair = load_cert_key(&cert_path, Some(&key_path)).unwrap();
        build_server_config(&pair, TlsVersion::Negotiated).unwrap();
        build_server_config(&pair, TlsVersion::Tls12).unwrap();
        build_client_config(TlsVersion::Tls13, None).unwrap();
        build_client_config(TlsVersion::Negotiated, Some(&pair)).unwrap();
    }
}
