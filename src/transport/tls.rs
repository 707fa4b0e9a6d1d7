//! TLS material and rustls configurations shared by both transports.

use std::{
    fs::File,
    io::{self, BufReader},
    net::{IpAddr, Ipv4Addr},
    path::Path,
    sync::Arc,
};

use rcgen::{CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, KeyUsagePurpose};
use time::{Duration, OffsetDateTime};
use tracing::{info, warn};

use crate::error::{Result, TunnelError};

/// How long generated certificates stay valid.
pub const GENERATED_CERT_VALIDITY_DAYS: i64 = 3650;

/// A certificate chain and the private key for its leaf.
#[derive(Clone)]
pub struct TlsMaterial {
    pub cert_chain: Vec<rustls::Certificate>,
    pub key: rustls::PrivateKey,
}

impl TlsMaterial {
    /// Loads a PEM certificate chain and a PEM private key (PKCS#8, PKCS#1 or SEC1).
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let cert_chain = read_pem_file(cert_path, |reader| rustls_pemfile::certs(reader))?;
        if cert_chain.is_empty() {
            return Err(TunnelError::Certificate(format!("No certificates found in {}", cert_path.display())));
        }

        let items = read_pem_file(key_path, |reader| rustls_pemfile::read_all(reader))?;
        let key = items
            .into_iter()
            .find_map(|item| match item {
                rustls_pemfile::Item::PKCS8Key(key) | rustls_pemfile::Item::RSAKey(key) | rustls_pemfile::Item::ECKey(key) => {
                    Some(key)
                }
                _ => None,
            })
            .ok_or_else(|| TunnelError::Certificate(format!("No private key found in {}", key_path.display())))?;

        Ok(Self {
            cert_chain: cert_chain.into_iter().map(rustls::Certificate).collect(),
            key: rustls::PrivateKey(key),
        })
    }

    /// Generates a self-signed server certificate, returning it together with its PEM encoding as
    /// `(certificate, private key)`.
    pub fn generate() -> Result<(Self, String, String)> {
        let mut params = CertificateParams::new(vec!["localhost".to_string()]);
        let mut distinguished_name = DistinguishedName::new();
        distinguished_name.push(DnType::OrganizationName, "Phantom Tunnel");
        params.distinguished_name = distinguished_name;

        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + Duration::days(GENERATED_CERT_VALIDITY_DAYS);
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature, KeyUsagePurpose::KeyEncipherment];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let cert = rcgen::Certificate::from_params(params).map_err(certificate_error)?;
        let cert_der = cert.serialize_der().map_err(certificate_error)?;
        let cert_pem = cert.serialize_pem().map_err(certificate_error)?;
        let key_pem = cert.serialize_private_key_pem();

        let material = Self {
            cert_chain: vec![rustls::Certificate(cert_der)],
            key: rustls::PrivateKey(cert.serialize_private_key_der()),
        };

        Ok((material, cert_pem, key_pem))
    }

    /// Loads the certificate and key at the given paths. If neither file exists, a self-signed
    /// certificate is generated and written to them first.
    pub fn load_or_generate(cert_path: &Path, key_path: &Path) -> Result<Self> {
        match (cert_path.exists(), key_path.exists()) {
            (true, true) => Self::load(cert_path, key_path),
            (false, false) => {
                info!(
                    "No certificate found, generating a self-signed one at {} and {}",
                    cert_path.display(),
                    key_path.display()
                );

                let (material, cert_pem, key_pem) = Self::generate()?;
                write_file(cert_path, &cert_pem)?;
                write_file(key_path, &key_pem)?;
                Ok(material)
            }
            (cert_exists, _) => {
                let missing = if cert_exists { key_path } else { cert_path };
                Err(TunnelError::Certificate(format!("Missing {}", missing.display())))
            }
        }
    }
}

fn certificate_error(error: rcgen::Error) -> TunnelError {
    TunnelError::Certificate(error.to_string())
}

fn read_pem_file<T, F>(path: &Path, f: F) -> Result<T>
where
    F: FnOnce(&mut dyn io::BufRead) -> io::Result<T>,
{
    let file = File::open(path).map_err(|error| TunnelError::Certificate(format!("Couldn't open {}: {error}", path.display())))?;
    let mut reader = BufReader::new(file);
    f(&mut reader).map_err(|error| TunnelError::Certificate(format!("Couldn't parse {}: {error}", path.display())))
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    std::fs::write(path, contents)
        .map_err(|error| TunnelError::Certificate(format!("Couldn't write {}: {error}", path.display())))
}

/// A TLS server configuration for the WebSocket transport.
pub fn websocket_server_config(material: &TlsMaterial) -> Result<Arc<rustls::ServerConfig>> {
    let mut config = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(material.cert_chain.clone(), material.key.clone())?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

/// A TLS client configuration for the WebSocket transport. The server's certificate is not
/// verified.
pub fn websocket_client_config() -> Arc<rustls::ClientConfig> {
    let mut config = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(SkipServerVerification::new())
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Arc::new(config)
}

/// A QUIC-compatible TLS server configuration whose only application protocol is `alpn`.
pub fn quic_server_config(material: &TlsMaterial, alpn: &[u8]) -> Result<rustls::ServerConfig> {
    let mut config = rustls::ServerConfig::builder()
        .with_safe_default_cipher_suites()
        .with_safe_default_kx_groups()
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .with_no_client_auth()
        .with_single_cert(material.cert_chain.clone(), material.key.clone())?;
    config.alpn_protocols = vec![alpn.to_vec()];
    config.max_early_data_size = u32::MAX;

    Ok(config)
}

/// A QUIC-compatible TLS client configuration offering `alpn` as its only application protocol.
/// The server's certificate is not verified.
pub fn quic_client_config(alpn: &[u8]) -> Result<rustls::ClientConfig> {
    let mut config = rustls::ClientConfig::builder()
        .with_safe_default_cipher_suites()
        .with_safe_default_kx_groups()
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .with_custom_certificate_verifier(SkipServerVerification::new())
        .with_no_client_auth();
    config.alpn_protocols = vec![alpn.to_vec()];
    config.enable_early_data = true;

    Ok(config)
}

/// The server name to present during the TLS handshake. Hosts that aren't valid DNS names or IP
/// addresses fall back to the loopback address, as the certificate isn't verified anyway.
pub fn server_name(host: &str) -> rustls::ServerName {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    match rustls::ServerName::try_from(host) {
        Ok(name) => name,
        Err(_) => {
            warn!("{host} is not a valid TLS server name, sending no SNI");
            rustls::ServerName::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST))
        }
    }
}

struct SkipServerVerification;

impl SkipServerVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl rustls::client::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> std::result::Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("server.crt");
        let key_path = dir.path().join("server.key");

        let generated = TlsMaterial::load_or_generate(&cert_path, &key_path).unwrap();
        assert!(cert_path.exists());
        assert!(key_path.exists());

        let loaded = TlsMaterial::load(&cert_path, &key_path).unwrap();
        assert_eq!(loaded.cert_chain, generated.cert_chain);
        assert_eq!(loaded.key, generated.key);

        let reloaded = TlsMaterial::load_or_generate(&cert_path, &key_path).unwrap();
        assert_eq!(reloaded.cert_chain, generated.cert_chain);
    }

    #[test]
    fn test_only_one_file_present_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("server.crt");
        let key_path = dir.path().join("server.key");
        std::fs::write(&cert_path, "not a certificate").unwrap();

        let error = TlsMaterial::load_or_generate(&cert_path, &key_path).err().unwrap();
        assert!(error.is_startup_fatal());
    }

    #[test]
    fn test_load_rejects_empty_files() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("server.crt");
        let key_path = dir.path().join("server.key");
        std::fs::write(&cert_path, "").unwrap();
        std::fs::write(&key_path, "").unwrap();

        assert!(matches!(TlsMaterial::load(&cert_path, &key_path), Err(TunnelError::Certificate(_))));
    }

    #[test]
    fn test_configs_build() {
        let (material, _, _) = TlsMaterial::generate().unwrap();
        websocket_server_config(&material).unwrap();
        websocket_client_config();

        let server = quic_server_config(&material, b"secret").unwrap();
        assert_eq!(server.alpn_protocols, vec![b"secret".to_vec()]);
        let client = quic_client_config(b"secret").unwrap();
        assert_eq!(client.alpn_protocols, vec![b"secret".to_vec()]);
    }

    #[test]
    fn test_server_name() {
        assert!(matches!(server_name("example.com"), rustls::ServerName::DnsName(_)));
        assert!(matches!(server_name("127.0.0.1"), rustls::ServerName::IpAddress(_)));
        assert!(matches!(server_name("[::1]"), rustls::ServerName::IpAddress(_)));
    }
}
