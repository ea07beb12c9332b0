//! Convenience wrapper for streams to switch between plain TCP and TLS at runtime.
//!
//! There is no dependency on actual TLS handshakes here. The TLS negotiation
//! is done by [`crate::tls::wrap_stream`].

use std::{
    io::{Read, Result as IoResult, Write},
    net::TcpStream,
};

use rustls::{ClientConnection, StreamOwned};

/// A stream mode, either plain TCP or TLS, derived from the URL scheme.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Plain mode (`ws://` and `http://` URLs).
    Plain,
    /// TLS mode (`wss://` and `https://` URLs).
    Tls,
}

/// A stream that might be protected with TLS.
#[non_exhaustive]
pub enum MaybeTlsStream<S: Read + Write> {
    /// Unencrypted socket stream.
    Plain(S),
    /// Encrypted socket stream using `rustls`.
    Rustls(StreamOwned<ClientConnection, S>),
}

impl<S: Read + Write> MaybeTlsStream<S> {
    /// Returns a shared reference to the inner socket.
    #[allow(dead_code)]
    pub fn get_ref(&self) -> &S {
        match self {
            MaybeTlsStream::Plain(s) => s,
            MaybeTlsStream::Rustls(s) => &s.sock,
        }
    }
}

impl<S: Read + Write> Read for MaybeTlsStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> IoResult<usize> {
        match *self {
            MaybeTlsStream::Plain(ref mut s) => s.read(buf),
            MaybeTlsStream::Rustls(ref mut s) => s.read(buf),
        }
    }
}

impl<S: Read + Write> Write for MaybeTlsStream<S> {
    fn write(&mut self, buf: &[u8]) -> IoResult<usize> {
        match *self {
            MaybeTlsStream::Plain(ref mut s) => s.write(buf),
            MaybeTlsStream::Rustls(ref mut s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> IoResult<()> {
        match *self {
            MaybeTlsStream::Plain(ref mut s) => s.flush(),
            MaybeTlsStream::Rustls(ref mut s) => s.flush(),
        }
    }
}

/// Helper trait to apply the `TCP_NODELAY` socket option to streams that
/// have a TCP socket underneath.
pub trait NoDelay {
    /// Set the `TCP_NODELAY` option.
    fn set_nodelay(&mut self, nodelay: bool) -> IoResult<()>;
}

impl NoDelay for TcpStream {
    fn set_nodelay(&mut self, nodelay: bool) -> IoResult<()> {
        TcpStream::set_nodelay(self, nodelay)
    }
}

impl<S: Read + Write + NoDelay> NoDelay for MaybeTlsStream<S> {
    fn set_nodelay(&mut self, nodelay: bool) -> IoResult<()> {
        match *self {
            MaybeTlsStream::Plain(ref mut s) => s.set_nodelay(nodelay),
            MaybeTlsStream::Rustls(ref mut s) => s.sock.set_nodelay(nodelay),
        }
    }
}
