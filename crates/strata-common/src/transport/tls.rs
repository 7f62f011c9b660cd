//! TLS client configuration and handshake.
//!
//! Server certificates are validated against the bundled web PKI roots plus
//! an optional extra CA certificate, and the certificate must match the
//! configured server name. A client certificate is presented when one is
//! configured.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::client::TlsStream;

use crate::protocol::error::{Result, StrataError};

/// Certificate and key presented to the server during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCertificate {
    /// PEM file with the certificate chain, leaf first.
    pub cert_path: PathBuf,
    /// PEM file with the private key (PKCS#8, PKCS#1 or SEC1).
    pub key_path: PathBuf,
}

/// TLS settings for connections to a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsConfig {
    server_name: String,
    ca_cert_path: Option<PathBuf>,
    client_certificate: Option<ClientCertificate>,
}

impl TlsConfig {
    /// Starts a builder; `server_name` is the host name the server
    /// certificate must be issued for.
    pub fn builder(server_name: impl Into<String>) -> TlsConfigBuilder {
        TlsConfigBuilder {
            server_name: server_name.into(),
            ca_cert_path: None,
            client_certificate: None,
        }
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn ca_cert_path(&self) -> Option<&Path> {
        self.ca_cert_path.as_deref()
    }

    pub fn client_certificate(&self) -> Option<&ClientCertificate> {
        self.client_certificate.as_ref()
    }

    /// Builds a rustls `ClientConfig` from this configuration.
    pub fn build_client_config(&self) -> Result<Arc<ClientConfig>> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        if let Some(ca_path) = &self.ca_cert_path {
            for cert in load_certs(ca_path)? {
                roots.add(cert)?;
            }
        }

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let builder = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots);

        let config = match &self.client_certificate {
            Some(client) => {
                let certs = load_certs(&client.cert_path)?;
                let key = load_private_key(&client.key_path)?;
                builder.with_client_auth_cert(certs, key)?
            }
            None => builder.with_no_client_auth(),
        };

        Ok(Arc::new(config))
    }
}

/// Builder for [`TlsConfig`].
#[derive(Debug, Clone)]
pub struct TlsConfigBuilder {
    server_name: String,
    ca_cert_path: Option<PathBuf>,
    client_certificate: Option<ClientCertificate>,
}

impl TlsConfigBuilder {
    /// Trusts an additional CA certificate (PEM) not present in the default roots.
    pub fn ca_certificate(mut self, path: impl AsRef<Path>) -> Self {
        self.ca_cert_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Presents a client certificate during the handshake.
    pub fn client_certificate(mut self, cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Self {
        self.client_certificate = Some(ClientCertificate {
            cert_path: cert_path.as_ref().to_path_buf(),
            key_path: key_path.as_ref().to_path_buf(),
        });
        self
    }

    /// # Errors
    ///
    /// `InvalidArgument` if the server name is empty or not a valid DNS name
    /// or IP address.
    pub fn build(self) -> Result<TlsConfig> {
        if self.server_name.trim().is_empty() {
            return Err(StrataError::InvalidArgument(
                "TLS server name must not be empty".to_string(),
            ));
        }
        ServerName::try_from(self.server_name.clone()).map_err(|e| {
            StrataError::InvalidArgument(format!(
                "invalid TLS server name '{}': {}",
                self.server_name, e
            ))
        })?;

        Ok(TlsConfig {
            server_name: self.server_name,
            ca_cert_path: self.ca_cert_path,
            client_certificate: self.client_certificate,
        })
    }
}

/// Performs client handshakes for one [`TlsConfig`].
///
/// Building the rustls configuration reads certificate files, so a connector
/// is created once per node and reused for every connection.
#[derive(Clone)]
pub struct TlsConnector {
    connector: tokio_rustls::TlsConnector,
    server_name: ServerName<'static>,
}

impl TlsConnector {
    pub fn new(config: &TlsConfig) -> Result<Self> {
        let client_config = config.build_client_config()?;
        let server_name = ServerName::try_from(config.server_name.clone()).map_err(|e| {
            StrataError::InvalidArgument(format!("invalid TLS server name: {}", e))
        })?;

        Ok(Self {
            connector: tokio_rustls::TlsConnector::from(client_config),
            server_name,
        })
    }

    /// Runs the handshake over an established stream.
    pub async fn connect<S>(&self, stream: S) -> Result<TlsStream<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.connector
            .connect(self.server_name.clone(), stream)
            .await
            .map_err(|e| StrataError::Tls(format!("handshake failed: {}", e)))
    }
}

impl std::fmt::Debug for TlsConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConnector")
            .field("server_name", &self.server_name)
            .finish()
    }
}

/// Loads certificates from a PEM file.
fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| {
        StrataError::Tls(format!(
            "failed to open certificate file {}: {}",
            path.display(),
            e
        ))
    })?;
    let mut reader = BufReader::new(file);

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .filter_map(std::result::Result::ok)
        .collect();

    if certs.is_empty() {
        return Err(StrataError::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }

    Ok(certs)
}

/// Loads the first private key from a PEM file.
fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(|e| {
        StrataError::Tls(format!("failed to open key file {}: {}", path.display(), e))
    })?;
    let mut reader = BufReader::new(file);

    loop {
        match rustls_pemfile::read_one(&mut reader) {
            Ok(Some(rustls_pemfile::Item::Pkcs1Key(key))) => return Ok(PrivateKeyDer::Pkcs1(key)),
            Ok(Some(rustls_pemfile::Item::Pkcs8Key(key))) => return Ok(PrivateKeyDer::Pkcs8(key)),
            Ok(Some(rustls_pemfile::Item::Sec1Key(key))) => return Ok(PrivateKeyDer::Sec1(key)),
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(e) => {
                return Err(StrataError::Tls(format!(
                    "failed to parse key file {}: {}",
                    path.display(),
                    e
                )));
            }
        }
    }

    Err(StrataError::Tls(format!(
        "no private key found in {}",
        path.display()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_tls_config_builder() {
        let config = TlsConfig::builder("db.example.com")
            .ca_certificate("/etc/strata/ca.pem")
            .client_certificate("/etc/strata/client.pem", "/etc/strata/client.key")
            .build()
            .unwrap();

        assert_eq!(config.server_name(), "db.example.com");
        assert_eq!(config.ca_cert_path(), Some(Path::new("/etc/strata/ca.pem")));
        let client = config.client_certificate().unwrap();
        assert_eq!(client.cert_path, PathBuf::from("/etc/strata/client.pem"));
        assert_eq!(client.key_path, PathBuf::from("/etc/strata/client.key"));
    }

    #[test]
    fn test_empty_server_name_rejected() {
        let err = TlsConfig::builder("  ").build().unwrap_err();
        assert!(matches!(err, StrataError::InvalidArgument(_)));
    }

    #[test]
    fn test_ip_server_name_accepted() {
        assert!(TlsConfig::builder("10.0.0.5").build().is_ok());
    }

    #[test]
    fn test_default_roots_without_extra_ca() {
        let config = TlsConfig::builder("db.example.com").build().unwrap();
        assert!(config.build_client_config().is_ok());
        assert!(TlsConnector::new(&config).is_ok());
    }

    #[test]
    fn test_missing_ca_file_is_tls_error() {
        let config = TlsConfig::builder("db.example.com")
            .ca_certificate("/nonexistent/ca.pem")
            .build()
            .unwrap();
        assert!(matches!(config.build_client_config(), Err(StrataError::Tls(_))));
    }

    #[test]
    fn test_ca_file_without_certificates_is_tls_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not a certificate").unwrap();

        let config = TlsConfig::builder("db.example.com")
            .ca_certificate(file.path())
            .build()
            .unwrap();
        let err = config.build_client_config().unwrap_err();
        assert!(err.to_string().contains("no certificates found"));
    }
}
