use std::{fmt, io};

/// TLS errors.
#[non_exhaustive]
pub enum TlsError {
    /// The peer certificate was rejected, either by the platform validation
    /// or by a caller-supplied trust evaluator.
    CertificateInvalid,
    /// The URL host is not a valid DNS name or IP address.
    InvalidDnsName,
    /// The TLS handshake failed before the connection opened.
    Handshake(io::Error),
    /// Rustls error.
    Rustls(rustls::Error),
}

impl fmt::Debug for TlsError {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::CertificateInvalid => write!(f, "Invalid peer certificate"),
            Self::InvalidDnsName => write!(f, "Invalid DNS name"),
            Self::Handshake(ref elem) => write!(f, "TLS handshake failed: {elem}"),
            Self::Rustls(ref elem) => write!(f, "rustls error: {elem}"),
        }
    }
}

impl fmt::Display for TlsError {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl std::error::Error for TlsError {}
