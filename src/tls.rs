//! TLS configuration for `wss://` targets.
//!
//! A [`TlsConfig`] is either a ready-made rustls [`ClientConfig`] or a [`TlsOptions`] record
//! that is resolved into one every time a secure connection is opened.

use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bon::Builder;
use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, ring, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
};

use crate::Result;
use crate::error::{Error, Kind};

/// TLS settings used when [`Target::secure`](crate::types::Target::secure) is set.
#[non_exhaustive]
#[derive(Clone, Debug)]
pub enum TlsConfig {
    /// A pre-built rustls configuration, used as-is
    Context(Arc<ClientConfig>),
    /// Options resolved into a rustls configuration at connect time
    Options(TlsOptions),
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self::Options(TlsOptions::default())
    }
}

impl From<TlsOptions> for TlsConfig {
    fn from(options: TlsOptions) -> Self {
        Self::Options(options)
    }
}

impl From<Arc<ClientConfig>> for TlsConfig {
    fn from(config: Arc<ClientConfig>) -> Self {
        Self::Context(config)
    }
}

impl TlsConfig {
    /// Produce the rustls configuration for one connection attempt.
    pub fn resolve(&self) -> Result<Arc<ClientConfig>> {
        match self {
            Self::Context(config) => Ok(Arc::clone(config)),
            Self::Options(options) => options.client_config().map(Arc::new),
        }
    }
}

/// Recognized TLS options.
///
/// When no CA material is available (`ca` and `capath` unset and `native_roots` disabled),
/// certificate verification and hostname checking are both turned off. With CA material,
/// `check_hostname = false` still verifies the chain but tolerates a name mismatch.
///
/// Only TLS 1.2 and 1.3 are ever offered.
///
/// ```
/// use resilient_ws::tls::TlsOptions;
///
/// let options = TlsOptions::builder()
///     .ca("/etc/ssl/private-ca.pem")
///     .native_roots(false)
///     .build();
/// assert!(options.check_hostname);
/// ```
#[non_exhaustive]
#[derive(Clone, Debug, Builder)]
pub struct TlsOptions {
    /// PEM bundle of trusted CA certificates.
    #[builder(into)]
    pub ca: Option<PathBuf>,
    /// Directory of PEM files with trusted CA certificates.
    #[builder(into)]
    pub capath: Option<PathBuf>,
    /// Trust the bundled Mozilla root set. Defaults to `true`.
    #[builder(default = true)]
    pub native_roots: bool,
    /// Verify that the certificate is valid for the target host. Defaults to `true`.
    #[builder(default = true)]
    pub check_hostname: bool,
    /// PEM client certificate chain.
    #[builder(into)]
    pub cert: Option<PathBuf>,
    /// PEM private key for `cert`. Read from the `cert` file when unset.
    #[builder(into)]
    pub key: Option<PathBuf>,
    /// Colon-separated rustls cipher suite names, e.g.
    /// `TLS13_AES_256_GCM_SHA384:TLS13_CHACHA20_POLY1305_SHA256`.
    #[builder(into)]
    pub cipher: Option<String>,
}

impl Default for TlsOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl TlsOptions {
    fn has_ca_material(&self) -> bool {
        self.native_roots || self.ca.is_some() || self.capath.is_some()
    }

    /// Build a rustls client configuration from these options.
    pub fn client_config(&self) -> Result<ClientConfig> {
        let provider = Arc::new(self.crypto_provider()?);
        let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()?;

        let builder = if !self.has_ca_material() {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerification { provider }))
        } else if self.check_hostname {
            builder.with_root_certificates(self.root_store()?)
        } else {
            let inner =
                WebPkiServerVerifier::builder_with_provider(Arc::new(self.root_store()?), provider)
                    .build()
                    .map_err(|e| Error::with_source(Kind::Tls, e))?;
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(IgnoreHostname { inner }))
        };

        let config = match (&self.cert, &self.key) {
            (Some(cert), key) => {
                let chain = load_certs(cert)?;
                let key = load_private_key(key.as_deref().unwrap_or(cert))?;
                builder.with_client_auth_cert(chain, key)?
            }
            (None, Some(_)) => {
                return Err(Error::validation("`key` was given without `cert`"));
            }
            (None, None) => builder.with_no_client_auth(),
        };

        Ok(config)
    }

    fn crypto_provider(&self) -> Result<CryptoProvider> {
        let mut provider = ring::default_provider();

        if let Some(cipher) = &self.cipher {
            let wanted: Vec<&str> = cipher
                .split(':')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .collect();

            provider.cipher_suites.retain(|suite| {
                let name = format!("{:?}", suite.suite());
                wanted.iter().any(|w| w.eq_ignore_ascii_case(&name))
            });

            if provider.cipher_suites.is_empty() {
                return Err(Error::validation(format!(
                    "no supported cipher suite matches `{cipher}`"
                )));
            }
        }

        Ok(provider)
    }

    fn root_store(&self) -> Result<RootCertStore> {
        let mut roots = RootCertStore::empty();

        if self.native_roots {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }

        if let Some(ca) = &self.ca {
            for cert in load_certs(ca)? {
                roots.add(cert)?;
            }
        }

        if let Some(dir) = &self.capath {
            for entry in fs::read_dir(dir).map_err(tls_io)? {
                let path = entry.map_err(tls_io)?.path();
                if path.is_file() {
                    // Non-certificate files in the directory are skipped.
                    let (_added, _ignored) = roots.add_parsable_certificates(load_certs(&path)?);
                }
            }
        }

        if roots.is_empty() {
            return Err(Error::validation("no CA certificates could be loaded"));
        }

        Ok(roots)
    }
}

/// Server name used for SNI and certificate verification.
pub fn server_name(host: &str) -> Result<ServerName<'static>> {
    Ok(ServerName::try_from(host.to_owned())?)
}

fn tls_io(e: std::io::Error) -> Error {
    Error::with_source(Kind::Tls, e)
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(File::open(path).map_err(tls_io)?);
    rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(tls_io)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(File::open(path).map_err(tls_io)?);
    rustls_pemfile::private_key(&mut reader)
        .map_err(tls_io)?
        .ok_or_else(|| Error::validation(format!("no private key found in {}", path.display())))
}

/// Accepts any server certificate. Handshake signatures are still checked.
#[derive(Debug)]
struct NoVerification {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
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
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
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

/// Full chain verification that tolerates a certificate issued for another name.
#[derive(Debug)]
struct IgnoreHostname {
    inner: Arc<WebPkiServerVerifier>,
}

const fn is_name_mismatch(e: &CertificateError) -> bool {
    matches!(
        e,
        CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. }
    )
}

impl ServerCertVerifier for IgnoreHostname {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        match self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        ) {
            Err(rustls::Error::InvalidCertificate(e)) if is_name_mismatch(&e) => {
                Ok(ServerCertVerified::assertion())
            }
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_trust_bundled_roots() {
        let options = TlsOptions::default();

        assert!(options.native_roots);
        assert!(options.check_hostname);
        assert!(options.client_config().is_ok());
    }

    #[test]
    fn no_ca_material_still_builds() {
        let options = TlsOptions::builder().native_roots(false).build();

        assert!(!options.has_ca_material());
        assert!(TlsConfig::from(options).resolve().is_ok());
    }

    #[test]
    fn hostname_check_can_be_disabled_with_roots() {
        let options = TlsOptions::builder().check_hostname(false).build();

        assert!(options.client_config().is_ok());
    }

    #[test]
    fn cipher_override_filters_suites() {
        let options = TlsOptions::builder()
            .cipher("TLS13_AES_256_GCM_SHA384")
            .build();

        let provider = options.crypto_provider().unwrap();
        assert_eq!(provider.cipher_suites.len(), 1);
    }

    #[test]
    fn unknown_cipher_is_rejected() {
        let options = TlsOptions::builder().cipher("RC4-MD5").build();

        let err = options.client_config().unwrap_err();
        assert_eq!(err.kind(), Kind::Validation);
    }

    #[test]
    fn key_without_cert_is_rejected() {
        let options = TlsOptions::builder().key("/nonexistent/key.pem").build();

        let err = options.client_config().unwrap_err();
        assert_eq!(err.kind(), Kind::Validation);
    }

    #[test]
    fn missing_ca_file_is_a_tls_error() {
        let options = TlsOptions::builder().ca("/nonexistent/ca.pem").build();

        let err = options.client_config().unwrap_err();
        assert_eq!(err.kind(), Kind::Tls);
    }

    #[test]
    fn prebuilt_context_is_reused() {
        let config = Arc::new(TlsOptions::default().client_config().unwrap());
        let tls = TlsConfig::from(Arc::clone(&config));

        assert!(Arc::ptr_eq(&tls.resolve().unwrap(), &config));
    }

    #[test]
    fn name_mismatch_covers_both_variants() {
        let with_context = CertificateError::NotValidForNameContext {
            expected: server_name("127.0.0.1").unwrap(),
            presented: vec!["DnsName(\"localhost\")".to_owned()],
        };

        assert!(is_name_mismatch(&CertificateError::NotValidForName));
        assert!(is_name_mismatch(&with_context));
        assert!(!is_name_mismatch(&CertificateError::UnknownIssuer));
        assert!(!is_name_mismatch(&CertificateError::Expired));
    }

    #[test]
    fn server_name_accepts_ip_literals() {
        assert!(server_name("127.0.0.1").is_ok());
        assert!(server_name("echo.websocket.org").is_ok());
        assert!(server_name("not a host").is_err());
    }
}
