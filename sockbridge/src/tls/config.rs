//! TLS session settings and certificate verification.
//!
//! Every TLS socket keeps its own [`TlsSettings`], seeded from the engine's
//! [`TlsDefaults`]. A fresh `rustls` client configuration is built from them
//! on each connect, so options changed between connects take effect on the
//! next one.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{
    AlertDescription, CertificateError, ClientConfig, DigitallySignedStruct, PeerIncompatible,
    RootCertStore, SignatureScheme, SupportedProtocolVersion,
};
use sockbridge_core::config::TlsDefaults;
use sockbridge_core::error::{EngineError, ErrorKind, Result};
use sockbridge_core::options::{SocketOption, TlsPathOption, TlsVersion};
use tracing::debug;

/// A TLS failure, classified into the event kind it is reported as.
#[derive(Debug)]
pub(crate) struct TlsFailure {
    pub(crate) kind: ErrorKind,
    pub(crate) source: io::Error,
}

impl TlsFailure {
    fn version(message: &str) -> Self {
        Self {
            kind: ErrorKind::TlsVersionError,
            source: io::Error::new(io::ErrorKind::InvalidInput, message.to_owned()),
        }
    }

    pub(crate) fn from_rustls(err: rustls::Error) -> Self {
        Self {
            kind: classify(&err),
            source: io::Error::new(io::ErrorKind::InvalidData, err),
        }
    }

    /// Classify an I/O error raised while driving a handshake.
    ///
    /// `rustls` errors surface wrapped in `InvalidData`; anything else is a
    /// transport failure during the handshake.
    pub(crate) fn from_io(err: io::Error) -> Self {
        let kind = err
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<rustls::Error>())
            .map_or(ErrorKind::TlsHandshakeError, classify);
        Self { kind, source: err }
    }
}

/// Map a `rustls` error onto the TLS error kinds.
pub(crate) fn classify(err: &rustls::Error) -> ErrorKind {
    match err {
        rustls::Error::InvalidCertificate(_) => ErrorKind::TlsCertificateError,
        rustls::Error::PeerIncompatible(
            PeerIncompatible::ServerTlsVersionIsDisabledByOurConfig
            | PeerIncompatible::ServerDoesNotSupportTls12Or13
            | PeerIncompatible::SupportedVersionsExtensionRequired
            | PeerIncompatible::Tls12NotOffered
            | PeerIncompatible::Tls12NotOfferedOrEnabled,
        )
        | rustls::Error::AlertReceived(AlertDescription::ProtocolVersion) => {
            ErrorKind::TlsVersionError
        }
        rustls::Error::AlertReceived(
            AlertDescription::BadCertificate
            | AlertDescription::UnknownCA
            | AlertDescription::CertificateExpired
            | AlertDescription::CertificateRevoked
            | AlertDescription::CertificateUnknown,
        ) => ErrorKind::TlsCertificateError,
        _ => ErrorKind::TlsHandshakeError,
    }
}

/// Per-socket TLS settings.
pub(crate) struct TlsSettings {
    pub(crate) verify_peer: bool,
    pub(crate) verify_host: bool,
    pub(crate) min_version: TlsVersion,
    pub(crate) max_version: TlsVersion,
    cert_chain: Vec<CertificateDer<'static>>,
    private_key: Option<PrivateKeyDer<'static>>,
    extra_roots: Vec<CertificateDer<'static>>,
}

impl TlsSettings {
    pub(crate) fn new(defaults: TlsDefaults) -> Self {
        Self {
            verify_peer: defaults.verify_peer,
            verify_host: defaults.verify_host,
            min_version: defaults.min_version,
            max_version: defaults.max_version,
            cert_chain: Vec::new(),
            private_key: None,
            extra_roots: Vec::new(),
        }
    }

    /// Apply a TLS option.
    ///
    /// Version values outside {12, 13} are rejected. The relation between
    /// floor and ceiling is only checked when a connection is configured.
    pub(crate) fn set(&mut self, option: SocketOption, value: i32) -> io::Result<()> {
        let version = || {
            TlsVersion::from_raw(value).ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("unsupported TLS version {value}; expected 12 or 13"),
                )
            })
        };
        match option {
            SocketOption::TlsVerifyPeer => self.verify_peer = value != 0,
            SocketOption::TlsVerifyHost => self.verify_host = value != 0,
            SocketOption::TlsMinVersion => self.min_version = version()?,
            SocketOption::TlsMaxVersion => self.max_version = version()?,
            _ => {}
        }
        Ok(())
    }

    pub(crate) fn get(&self, option: SocketOption) -> Option<i32> {
        match option {
            SocketOption::TlsVerifyPeer => Some(i32::from(self.verify_peer)),
            SocketOption::TlsVerifyHost => Some(i32::from(self.verify_host)),
            SocketOption::TlsMinVersion => Some(self.min_version.as_raw()),
            SocketOption::TlsMaxVersion => Some(self.max_version.as_raw()),
            _ => None,
        }
    }

    /// Load PEM material from `path`.
    pub(crate) fn load(&mut self, option: TlsPathOption, path: &Path) -> Result<()> {
        let mut reader = File::open(path)
            .map(BufReader::new)
            .map_err(|e| EngineError::tls(format!("{}: {e}", path.display())))?;

        match option {
            TlsPathOption::CertificateFile | TlsPathOption::CaFile => {
                let certs = rustls_pemfile::certs(&mut reader)
                    .collect::<io::Result<Vec<_>>>()
                    .map_err(|e| EngineError::tls(format!("{}: {e}", path.display())))?;
                if certs.is_empty() {
                    return Err(EngineError::tls(format!(
                        "{}: no certificates found",
                        path.display()
                    )));
                }
                debug!(path = %path.display(), count = certs.len(), ?option, "loaded certificates");
                if option == TlsPathOption::CaFile {
                    self.extra_roots.extend(certs);
                } else {
                    self.cert_chain = certs;
                }
            }
            TlsPathOption::PrivateKeyFile => {
                let key = rustls_pemfile::private_key(&mut reader)
                    .map_err(|e| EngineError::tls(format!("{}: {e}", path.display())))?
                    .ok_or_else(|| {
                        EngineError::tls(format!("{}: no private key found", path.display()))
                    })?;
                debug!(path = %path.display(), "loaded private key");
                self.private_key = Some(key);
            }
        }
        Ok(())
    }

    fn versions(&self) -> std::result::Result<Vec<&'static SupportedProtocolVersion>, TlsFailure> {
        if self.min_version > self.max_version {
            return Err(TlsFailure::version("minimum TLS version is above the maximum"));
        }
        let range = self.min_version..=self.max_version;
        Ok([
            (TlsVersion::Tls12, &rustls::version::TLS12),
            (TlsVersion::Tls13, &rustls::version::TLS13),
        ]
        .into_iter()
        .filter(|(version, _)| range.contains(version))
        .map(|(_, supported)| supported)
        .collect())
    }

    /// Build the client configuration for one connection.
    pub(crate) fn client_config(&self) -> std::result::Result<Arc<ClientConfig>, TlsFailure> {
        let versions = self.versions()?;
        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let mut roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let (added, ignored) = roots.add_parsable_certificates(self.extra_roots.iter().cloned());
        if !self.extra_roots.is_empty() {
            debug!(added, ignored, "extra trust anchors");
        }

        let verifier = SessionVerifier::new(
            roots,
            Arc::clone(&provider),
            self.verify_peer,
            self.verify_host,
        )?;
        let builder = ClientConfig::builder_with_provider(provider)
            .with_protocol_versions(&versions)
            .map_err(TlsFailure::from_rustls)?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier));

        let config = match (self.cert_chain.is_empty(), self.private_key.as_ref()) {
            (false, Some(key)) => builder
                .with_client_auth_cert(self.cert_chain.clone(), key.clone_key())
                .map_err(TlsFailure::from_rustls)?,
            _ => builder.with_no_client_auth(),
        };
        Ok(Arc::new(config))
    }
}

/// Server certificate check honouring the per-session verify flags.
///
/// Chain validation and hostname matching are delegated to the `webpki`
/// verifier; the flags only decide which of its verdicts count.
#[derive(Debug)]
struct SessionVerifier {
    inner: Arc<WebPkiServerVerifier>,
    verify_peer: bool,
    verify_host: bool,
}

impl SessionVerifier {
    fn new(
        roots: RootCertStore,
        provider: Arc<CryptoProvider>,
        verify_peer: bool,
        verify_host: bool,
    ) -> std::result::Result<Self, TlsFailure> {
        let inner = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider)
            .build()
            .map_err(|e| TlsFailure {
                kind: ErrorKind::TlsCertificateError,
                source: io::Error::new(io::ErrorKind::InvalidInput, e),
            })?;
        Ok(Self {
            inner,
            verify_peer,
            verify_host,
        })
    }
}

impl ServerCertVerifier for SessionVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        if !self.verify_peer {
            return Ok(ServerCertVerified::assertion());
        }
        match self
            .inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Err(rustls::Error::InvalidCertificate(
                CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. },
            )) if !self.verify_host => Ok(ServerCertVerified::assertion()),
            verdict => verdict,
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
