//! TLS transport, trust decision hook and cipher-suite restriction.

use std::{
    fmt,
    io::{Read, Write},
    sync::Arc,
};

use log::*;
use rustls::{
    client::{
        danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        WebPkiServerVerifier,
    },
    crypto::{ring, verify_tls12_signature, verify_tls13_signature, CryptoProvider},
    CertificateError, ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore,
    SignatureScheme, StreamOwned, SupportedCipherSuite,
};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};

use crate::{
    error::{Result, TlsError},
    stream::{MaybeTlsStream, Mode},
};

/// A caller-supplied predicate consulted for the peer's certificate chain.
///
/// Receives the presented chain (end-entity certificate first, DER encoded)
/// and the expected host name. Returning `false` rejects the peer and the
/// connection fails with a certificate-invalid error before it ever opens.
pub type TrustEvaluator = Arc<dyn Fn(&[CertificateDer<'static>], &str) -> bool + Send + Sync>;

/// TLS options for a connection.
#[derive(Clone, Default)]
pub struct TlsSettings {
    /// Disable chain validation and host name matching entirely.
    pub(crate) allow_self_signed: bool,
    /// Extra trust decision on top of (or instead of) chain validation.
    pub(crate) trust_evaluator: Option<TrustEvaluator>,
    /// When present, restricts the cipher suites offered for negotiation.
    pub(crate) cipher_suites: Option<Vec<SupportedCipherSuite>>,
}

impl fmt::Debug for TlsSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsSettings")
            .field("allow_self_signed", &self.allow_self_signed)
            .field("trust_evaluator", &self.trust_evaluator.as_ref().map(|_| ".."))
            .field("cipher_suites", &self.cipher_suites)
            .finish()
    }
}

/// Wrap a socket with TLS when the mode asks for it.
///
/// The TLS handshake is driven to completion here, so certificate
/// rejections (platform validation or the trust evaluator) surface before
/// the WebSocket handshake starts.
pub(crate) fn wrap_stream<S>(
    socket: S,
    domain: &str,
    mode: Mode,
    tls: &TlsSettings,
) -> Result<MaybeTlsStream<S>>
where
    S: Read + Write,
{
    match mode {
        Mode::Plain => Ok(MaybeTlsStream::Plain(socket)),
        Mode::Tls => {
            let config = Arc::new(client_config(tls)?);
            let server_name = ServerName::try_from(domain.to_string())
                .map_err(|_| TlsError::InvalidDnsName)?;
            let connection =
                ClientConnection::new(config, server_name).map_err(TlsError::Rustls)?;
            let mut stream = StreamOwned::new(connection, socket);

            // Drive the handshake eagerly so trust decisions happen now.
            while stream.conn.is_handshaking() {
                if let Err(err) = stream.conn.complete_io(&mut stream.sock) {
                    return Err(handshake_error(err).into());
                }
            }
            debug!("TLS negotiated with {domain}");

            Ok(MaybeTlsStream::Rustls(stream))
        }
    }
}

/// Classify a handshake IO failure, surfacing certificate rejections
/// as their own error kind.
fn handshake_error(err: std::io::Error) -> TlsError {
    let cert_invalid = err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        .map(|e| matches!(e, rustls::Error::InvalidCertificate(_)))
        .unwrap_or(false);
    if cert_invalid {
        TlsError::CertificateInvalid
    } else {
        TlsError::Handshake(err)
    }
}

/// Build the rustls client configuration for the given settings.
fn client_config(tls: &TlsSettings) -> Result<ClientConfig, TlsError> {
    let provider = Arc::new(match tls.cipher_suites {
        Some(ref suites) => CryptoProvider { cipher_suites: suites.clone(), ..ring::default_provider() },
        None => ring::default_provider(),
    });

    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(rustls::DEFAULT_VERSIONS)
        .map_err(TlsError::Rustls)?;

    let config = if tls.allow_self_signed || tls.trust_evaluator.is_some() {
        let chain_validation = if tls.allow_self_signed {
            None
        } else {
            let verifier = WebPkiServerVerifier::builder_with_provider(
                Arc::new(root_store()),
                provider.clone(),
            )
            .build()
            .map_err(|e| TlsError::Rustls(rustls::Error::General(e.to_string())))?;
            Some(verifier)
        };
        let verifier = TrustDecision {
            chain_validation,
            evaluator: tls.trust_evaluator.clone(),
            provider,
        };
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_no_client_auth()
    } else {
        builder.with_root_certificates(root_store()).with_no_client_auth()
    };

    Ok(config)
}

/// Collect trusted roots: the platform store when available, the bundled
/// webpki roots always.
fn root_store() -> RootCertStore {
    let mut roots = RootCertStore::empty();

    #[cfg(feature = "native-roots")]
    {
        let loaded = rustls_native_certs::load_native_certs();
        if !loaded.errors.is_empty() {
            warn!("native root CA certificate loading errors: {:?}", loaded.errors);
        }
        let total = loaded.certs.len();
        let (added, ignored) = roots.add_parsable_certificates(loaded.certs);
        debug!("added {added}/{total} native root certificates (ignored {ignored})");
    }

    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    roots
}

/// Certificate verifier combining optional chain validation with the
/// caller's trust evaluator.
struct TrustDecision {
    /// `None` when self-signed certificates are allowed.
    chain_validation: Option<Arc<WebPkiServerVerifier>>,
    evaluator: Option<TrustEvaluator>,
    provider: Arc<CryptoProvider>,
}

impl fmt::Debug for TrustDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustDecision")
            .field("chain_validation", &self.chain_validation.is_some())
            .field("evaluator", &self.evaluator.as_ref().map(|_| ".."))
            .finish()
    }
}

impl ServerCertVerifier for TrustDecision {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if let Some(ref chain_validation) = self.chain_validation {
            chain_validation.verify_server_cert(
                end_entity,
                intermediates,
                server_name,
                ocsp_response,
                now,
            )?;
        }

        if let Some(ref evaluate) = self.evaluator {
            let chain: Vec<CertificateDer<'static>> = std::iter::once(end_entity)
                .chain(intermediates.iter())
                .map(|cert| cert.clone().into_owned())
                .collect();
            let host = match server_name {
                ServerName::DnsName(dns) => dns.as_ref().to_string(),
                ServerName::IpAddress(ip) => std::net::IpAddr::from(*ip).to_string(),
                _ => String::new(),
            };
            if !evaluate(&chain, &host) {
                debug!("trust evaluator rejected the peer certificate for {host}");
                return Err(rustls::Error::InvalidCertificate(
                    CertificateError::ApplicationVerificationFailure,
                ));
            }
        }

        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        match self.chain_validation {
            Some(ref v) => v.verify_tls12_signature(message, cert, dss),
            None => verify_tls12_signature(
                message,
                cert,
                dss,
                &self.provider.signature_verification_algorithms,
            ),
        }
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        match self.chain_validation {
            Some(ref v) => v.verify_tls13_signature(message, cert, dss),
            None => verify_tls13_signature(
                message,
                cert,
                dss,
                &self.provider.signature_verification_algorithms,
            ),
        }
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}
