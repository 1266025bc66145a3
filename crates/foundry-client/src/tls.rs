// Verified TLS for the direct (raw socket) backend.
//
// The session backend delegates TLS to its pre-built HTTP client; here we
// assemble a rustls `ClientConfig` by hand from a declarative policy value:
// peer verification against an explicit or discovered CA bundle, an
// accept-anything verifier when verification is disabled, and optional
// client-certificate authentication.

use std::path::PathBuf;
use std::sync::Arc;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::error::Error;

/// Well-known system CA bundle locations (Debian/Ubuntu, RedHat/Fedora,
/// Suse, FreeBSD/OpenBSD), searched in order when no bundle is configured.
const SYSTEM_CA_BUNDLES: &[&str] = &[
    "/etc/ssl/certs/ca-certificates.crt",
    "/etc/pki/tls/certs/ca-bundle.crt",
    "/etc/ssl/ca-bundle.pem",
    "/etc/ssl/cert.pem",
];

/// Client certificate to present during the handshake. If `key` is not
/// separately configured, the certificate file is expected to also hold
/// the private key.
#[derive(Debug, Clone)]
pub struct ClientCert {
    pub cert: PathBuf,
    pub key: Option<PathBuf>,
}

/// Declarative TLS policy for the direct backend.
#[derive(Debug, Clone)]
pub struct TlsPolicy {
    /// When `false`, peer verification is disabled entirely (for lab
    /// deployments with self-signed certificates).
    pub verify_peer: bool,
    /// CA bundle to verify the peer against. When absent, the first
    /// existing system bundle from a well-known list is used; if none
    /// exists the handshake will fail for any peer that needs validation.
    pub ca_bundle: Option<PathBuf>,
    /// Client certificate (and optionally separate key) to present.
    pub client_cert: Option<ClientCert>,
}

impl Default for TlsPolicy {
    fn default() -> Self {
        Self {
            verify_peer: true,
            ca_bundle: None,
            client_cert: None,
        }
    }
}

impl TlsPolicy {
    /// Resolve the CA bundle this policy would verify against.
    pub(crate) fn resolved_ca_bundle(&self) -> Option<PathBuf> {
        self.ca_bundle.clone().or_else(system_ca_bundle)
    }

    /// Build the rustls client configuration for this policy.
    ///
    /// Fails with [`Error::Tls`] when configured PEM material cannot be
    /// read or parsed.
    pub(crate) fn client_config(&self) -> Result<ClientConfig, Error> {
        // Pin the crypto provider explicitly: other crates in the build may
        // enable a second rustls provider feature, which would make the
        // implicit-default builder panic.
        let base = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Tls(format!("unsupported protocol configuration: {e}")))?;

        let builder = if self.verify_peer {
            let mut roots = RootCertStore::empty();
            if let Some(path) = self.resolved_ca_bundle() {
                debug!("loading CA bundle from {}", path.display());
                for cert in CertificateDer::pem_file_iter(&path)
                    .map_err(|e| Error::Tls(format!("failed to read CA bundle {}: {e}", path.display())))?
                {
                    let cert = cert.map_err(|e| {
                        Error::Tls(format!("invalid certificate in {}: {e}", path.display()))
                    })?;
                    roots.add(cert).map_err(|e| {
                        Error::Tls(format!("unusable certificate in {}: {e}", path.display()))
                    })?;
                }
            }
            base.with_root_certificates(roots)
        } else {
            base.dangerous()
                .with_custom_certificate_verifier(Arc::new(danger::AcceptAnyServerCert::new()))
        };

        match &self.client_cert {
            Some(client_cert) => {
                let certs: Vec<CertificateDer<'static>> =
                    CertificateDer::pem_file_iter(&client_cert.cert)
                        .map_err(|e| {
                            Error::Tls(format!(
                                "failed to read client certificate {}: {e}",
                                client_cert.cert.display()
                            ))
                        })?
                        .collect::<Result<_, _>>()
                        .map_err(|e| {
                            Error::Tls(format!(
                                "invalid client certificate {}: {e}",
                                client_cert.cert.display()
                            ))
                        })?;
                let key_path = client_cert.key.as_ref().unwrap_or(&client_cert.cert);
                let key = PrivateKeyDer::from_pem_file(key_path).map_err(|e| {
                    Error::Tls(format!("failed to read client key {}: {e}", key_path.display()))
                })?;
                builder
                    .with_client_auth_cert(certs, key)
                    .map_err(|e| Error::Tls(format!("invalid client certificate chain: {e}")))
            }
            None => Ok(builder.with_no_client_auth()),
        }
    }
}

/// First existing path from the well-known system CA bundle list.
fn system_ca_bundle() -> Option<PathBuf> {
    SYSTEM_CA_BUNDLES
        .iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
}

/// Wrap an established TCP stream in TLS for `host`.
///
/// I/O and handshake failures surface as `io::Error` so the caller can
/// classify them alongside other socket errors (they are retryable).
pub(crate) async fn wrap(
    stream: TcpStream,
    host: &str,
    config: Arc<ClientConfig>,
) -> std::io::Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let server_name = ServerName::try_from(host.to_owned())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let connector = TlsConnector::from(config);
    connector.connect(server_name, stream).await
}

mod danger {
    // Verifier used when peer verification is explicitly disabled: accepts
    // any certificate chain but still checks handshake signatures so the
    // connection is encrypted and un-tampered.

    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, SignatureScheme};

    #[derive(Debug)]
    pub(super) struct AcceptAnyServerCert {
        provider: CryptoProvider,
    }

    impl AcceptAnyServerCert {
        pub(super) fn new() -> Self {
            Self {
                provider: rustls::crypto::ring::default_provider(),
            }
        }
    }

    impl ServerCertVerifier for AcceptAnyServerCert {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls12_signature(
                message,
                cert,
                dss,
                &self.provider.signature_verification_algorithms,
            )
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls13_signature(
                message,
                cert,
                dss,
                &self.provider.signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.provider
                .signature_verification_algorithms
                .supported_schemes()
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn explicit_ca_bundle_wins_over_system_search() {
        let policy = TlsPolicy {
            ca_bundle: Some(PathBuf::from("/nonexistent/bundle.pem")),
            ..TlsPolicy::default()
        };
        assert_eq!(
            policy.resolved_ca_bundle(),
            Some(PathBuf::from("/nonexistent/bundle.pem"))
        );
    }

    #[test]
    fn insecure_policy_builds_without_any_ca_material() {
        let policy = TlsPolicy {
            verify_peer: false,
            ..TlsPolicy::default()
        };
        policy.client_config().unwrap();
    }

    #[test]
    fn verified_policy_with_empty_roots_still_builds() {
        // No bundle configured and (possibly) none on the system: the config
        // builds, and verification fails later at handshake time instead.
        let policy = TlsPolicy {
            ca_bundle: None,
            ..TlsPolicy::default()
        };
        if policy.resolved_ca_bundle().is_none() {
            policy.client_config().unwrap();
        }
    }

    #[test]
    fn unreadable_ca_bundle_is_a_tls_error() {
        let policy = TlsPolicy {
            ca_bundle: Some(PathBuf::from("/nonexistent/bundle.pem")),
            ..TlsPolicy::default()
        };
        assert!(matches!(policy.client_config(), Err(Error::Tls(_))));
    }

    #[test]
    fn missing_client_certificate_is_a_tls_error() {
        let policy = TlsPolicy {
            verify_peer: false,
            ca_bundle: None,
            client_cert: Some(ClientCert {
                cert: PathBuf::from("/nonexistent/client.crt"),
                key: None,
            }),
        };
        assert!(matches!(policy.client_config(), Err(Error::Tls(_))));
    }

    #[test]
    fn client_certificate_without_pem_material_is_a_tls_error() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"not pem at all").unwrap();

        // No separate key configured, so the key is expected in the cert
        // file too; an empty PEM file cannot satisfy that.
        let policy = TlsPolicy {
            verify_peer: false,
            ca_bundle: None,
            client_cert: Some(ClientCert {
                cert: file.path().to_owned(),
                key: None,
            }),
        };
        assert!(matches!(policy.client_config(), Err(Error::Tls(_))));
    }
}
