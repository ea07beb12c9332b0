//! Error handling.

mod capacity_error;
mod protocol_error;
mod tls_error;
mod url_error;

pub use self::{
    capacity_error::CapacityError, protocol_error::ProtocolError, tls_error::TlsError,
    url_error::UrlError,
};

use crate::protocol::frame::{coding::CloseCode, CloseFrame};
use std::{fmt, io, result, str, string};

/// The domain tag carried by every error of this crate.
pub const ERROR_DOMAIN: &str = "WebSocket";

/// Internal error code for a failed transport write.
pub const CODE_WRITE_ERROR: u16 = 1;
/// Internal error code for a rejected peer certificate.
pub const CODE_CERT_INVALID: u16 = 2;
/// Internal error code for a transport-level failure.
pub const CODE_TRANSPORT: u16 = 3;

/// A convenience alias for this crate's `Result`.
pub type Result<T, E = Error> = result::Result<T, E>;

/// Possible WebSocket errors.
#[derive(Debug)]
pub enum Error {
    /// WebSocket connection closed by a close handshake, carrying the peer's
    /// close frame when one was present.
    ConnectionClosed(Option<CloseFrame>),
    /// Trying to work with an already closed connection.
    AlreadyClosed,
    /// Trying to connect a connection that is connecting or open.
    AlreadyConnected,
    /// Input-output error. Apart from `WouldBlock`, these are generally
    /// errors with the underlying connection and you should probably
    /// consider them fatal.
    Io(io::Error),
    /// Failure writing an outbound frame to the transport.
    Write(io::Error),
    /// TLS error.
    Tls(TlsError),
    /// - When reading: buffer capacity exhausted.
    /// - When writing: your message is bigger than the configured max message size.
    Capacity(CapacityError),
    /// Protocol violation.
    Protocol(ProtocolError),
    /// UTF-8 coding error.
    Utf8(str::Utf8Error),
    /// Invalid URL.
    Url(UrlError),
    /// The server replied to the opening handshake with the given non-101
    /// HTTP status code.
    Http(u16),
}

impl Error {
    /// The integer code of this error.
    ///
    /// Close-code-shaped failures report the relevant RFC 6455 close code
    /// (1002 for protocol violations, 1007 for encoding errors, 1009 for
    /// capacity violations, the received code for a close handshake).
    /// Handshake failures report the HTTP status. Everything else uses the
    /// internal code space starting at [`CODE_WRITE_ERROR`].
    pub fn code(&self) -> u16 {
        match self {
            Error::ConnectionClosed(Some(frame)) => frame.code.into(),
            Error::ConnectionClosed(None) => CloseCode::NoStatus.into(),
            Error::AlreadyClosed | Error::AlreadyConnected => 0,
            Error::Io(_) => CODE_TRANSPORT,
            Error::Write(_) => CODE_WRITE_ERROR,
            Error::Tls(TlsError::CertificateInvalid) => CODE_CERT_INVALID,
            Error::Tls(_) => CODE_TRANSPORT,
            Error::Capacity(_) => CloseCode::MessageTooBig.into(),
            Error::Protocol(err) => err.close_code().into(),
            Error::Utf8(_) => CloseCode::Encoding.into(),
            Error::Url(_) => CODE_TRANSPORT,
            Error::Http(code) => *code,
        }
    }

    /// The close code to fail the connection with, if this error calls for
    /// sending a close frame at all.
    pub(crate) fn close_code(&self) -> Option<CloseCode> {
        match self {
            Error::Protocol(err) => Some(err.close_code()),
            Error::Utf8(_) => Some(CloseCode::Encoding),
            Error::Capacity(_) => Some(CloseCode::MessageTooBig),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::ConnectionClosed(Some(frame)) => write!(f, "Connection closed: {frame}"),
            Error::ConnectionClosed(None) => write!(f, "Connection closed"),
            Error::AlreadyClosed => write!(f, "Trying to work with closed connection"),
            Error::AlreadyConnected => write!(f, "Connection is already in progress"),
            Error::Io(err) => write!(f, "IO error: {err}"),
            Error::Write(err) => write!(f, "Output stream write error: {err}"),
            Error::Tls(err) => write!(f, "TLS error: {err}"),
            Error::Capacity(err) => write!(f, "Space limit exceeded: {err}"),
            Error::Protocol(err) => write!(f, "WebSocket protocol error: {err}"),
            Error::Utf8(err) => write!(f, "UTF-8 encoding error: {err}"),
            Error::Url(err) => write!(f, "URL error: {err}"),
            Error::Http(code) => write!(f, "HTTP error: {code}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) | Error::Write(err) => Some(err),
            Error::Tls(err) => Some(err),
            Error::Capacity(err) => Some(err),
            Error::Protocol(err) => Some(err),
            Error::Utf8(err) => Some(err),
            Error::Url(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<str::Utf8Error> for Error {
    fn from(err: str::Utf8Error) -> Self {
        Error::Utf8(err)
    }
}

impl From<string::FromUtf8Error> for Error {
    fn from(err: string::FromUtf8Error) -> Self {
        Error::Utf8(err.utf8_error())
    }
}

impl From<TlsError> for Error {
    fn from(err: TlsError) -> Self {
        Error::Tls(err)
    }
}

impl From<UrlError> for Error {
    fn from(err: UrlError) -> Self {
        Error::Url(err)
    }
}

impl From<httparse::Error> for Error {
    fn from(err: httparse::Error) -> Self {
        match err {
            httparse::Error::TooManyHeaders => Error::Capacity(CapacityError::TooManyHeaders),
            e => Error::Protocol(ProtocolError::HttparseError(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_mapping() {
        let write = Error::Write(io::Error::new(io::ErrorKind::BrokenPipe, "pipe"));
        assert_eq!(write.code(), 1);

        assert_eq!(Error::Tls(TlsError::CertificateInvalid).code(), 2);
        assert_eq!(Error::Http(403).code(), 403);
        assert_eq!(Error::Protocol(ProtocolError::NonZeroReservedBits).code(), 1002);
        assert_eq!(
            Error::Capacity(CapacityError::MessageTooLong { size: 2, max_size: 1 }).code(),
            1009
        );
        assert_eq!(Error::ConnectionClosed(None).code(), 1005);
    }

    #[test]
    fn close_code_selection() {
        assert_eq!(
            Error::Protocol(ProtocolError::InvalidCloseCode(1006)).close_code(),
            Some(CloseCode::ProtocolError)
        );
        let io_err = Error::Io(io::Error::new(io::ErrorKind::BrokenPipe, "pipe"));
        assert_eq!(io_err.close_code(), None);
    }
}
