//! HTTP upgrade request construction and response validation.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use httparse::Status;
use log::*;
use std::fmt::Write as _;
use url::Url;

use super::{derive_accept_key, Headers, TryParse, MAX_HEADERS};
use crate::error::{Error, ProtocolError, Result, UrlError};

/// Client's opening handshake request.
///
/// Renders the HTTP/1.1 GET upgrade request, carrying a freshly generated
/// `Sec-WebSocket-Key` plus any caller-configured origin, subprotocols and
/// pass-through headers.
#[derive(Debug)]
pub struct Request {
    url: Url,
    protocols: Vec<String>,
    origin: Option<String>,
    extra_headers: Vec<(String, String)>,
    key: String,
}

impl Request {
    /// Create a request for the given URL with a random key.
    pub fn new(
        url: Url,
        protocols: Vec<String>,
        origin: Option<String>,
        extra_headers: Vec<(String, String)>,
    ) -> Self {
        Request { url, protocols, origin, extra_headers, key: generate_key() }
    }

    /// The `Sec-WebSocket-Key` this request carries.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The GET part of the request.
    fn uri(&self) -> String {
        let path = if self.url.path().is_empty() { "/" } else { self.url.path() };
        if let Some(query) = self.url.query() {
            format!("{path}?{query}")
        } else {
            path.into()
        }
    }

    /// The Host: part of the request. The port is always rendered,
    /// defaulting to 443 for `wss`/`https` and 80 otherwise.
    fn host(&self) -> Result<String> {
        let host = self.url.host_str().ok_or(Error::Url(UrlError::NoHostName))?;
        let port = self.url.port_or_known_default().unwrap_or(match self.url.scheme() {
            "wss" | "https" => 443,
            _ => 80,
        });
        Ok(format!("{host}:{port}"))
    }

    /// Render the request, terminated by an empty line.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut req = String::with_capacity(256);
        write!(
            req,
            "GET {uri} HTTP/1.1\r\n\
             Host: {host}\r\n\
             Connection: Upgrade\r\n\
             Upgrade: websocket\r\n\
             Sec-WebSocket-Version: 13\r\n\
             Sec-WebSocket-Key: {key}\r\n",
            uri = self.uri(),
            host = self.host()?,
            key = self.key
        )
        .expect("Bug: can't write to string");
        if let Some(ref origin) = self.origin {
            write!(req, "Origin: {origin}\r\n").expect("Bug: can't write to string");
        }
        if !self.protocols.is_empty() {
            write!(req, "Sec-WebSocket-Protocol: {}\r\n", self.protocols.join(", "))
                .expect("Bug: can't write to string");
        }
        for (name, value) in &self.extra_headers {
            write!(req, "{name}: {value}\r\n").expect("Bug: can't write to string");
        }
        req.push_str("\r\n");
        trace!("request: {req:?}");
        Ok(req.into_bytes())
    }
}

/// Server's handshake response.
#[derive(Debug)]
pub struct Response {
    code: u16,
    headers: Headers,
}

impl Response {
    /// The HTTP status code of the response.
    pub fn code(&self) -> u16 {
        self.code
    }

    /// The headers of the response.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// The subprotocol the server selected, if any.
    pub fn protocol(&self) -> Option<&str> {
        self.headers
            .find_first("Sec-WebSocket-Protocol")
            .and_then(|v| std::str::from_utf8(v).ok())
    }
}

impl TryParse for Response {
    fn try_parse(data: &[u8]) -> Result<Option<(usize, Self)>> {
        let mut hbuffer = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut resp = httparse::Response::new(&mut hbuffer);
        Ok(match resp.parse(data)? {
            Status::Partial => None,
            Status::Complete(size) => {
                if resp.version.expect("Bug: no HTTP version") < /*1.*/1 {
                    return Err(Error::Protocol(ProtocolError::WrongHttpVersion));
                }
                let code = resp.code.expect("Bug: no HTTP response code");
                let headers = Headers::from_httparse(resp.headers);
                Some((size, Response { code, headers }))
            }
        })
    }
}

/// Information for handshake verification.
#[derive(Debug)]
pub(crate) struct VerifyData {
    /// The expected `Sec-WebSocket-Accept` value.
    pub accept_key: String,
}

impl VerifyData {
    pub(crate) fn for_request(request: &Request) -> Self {
        VerifyData { accept_key: derive_accept_key(request.key().as_bytes()) }
    }

    pub(crate) fn verify_response(&self, response: &Response) -> Result<()> {
        // 1. If the status code received from the server is not 101, the
        // client handles the response per HTTP [RFC2616] procedures. (RFC 6455)
        if response.code != 101 {
            return Err(Error::Http(response.code));
        }
        // 2. If the response lacks an |Upgrade| header field or the |Upgrade|
        // header field contains a value that is not an ASCII case-
        // insensitive match for the value "websocket", the client MUST
        // _Fail the WebSocket Connection_. (RFC 6455)
        if !response.headers.header_is_ignore_case("Upgrade", "websocket") {
            return Err(Error::Protocol(ProtocolError::MissingUpgradeWebSocketHeader));
        }
        // 3. If the response lacks a |Connection| header field or the
        // |Connection| header field doesn't contain a token that is an
        // ASCII case-insensitive match for the value "Upgrade", the client
        // MUST _Fail the WebSocket Connection_. (RFC 6455)
        if !response.headers.header_contains_token("Connection", "Upgrade") {
            return Err(Error::Protocol(ProtocolError::MissingConnectionUpgradeHeader));
        }
        // 4. If the response lacks a |Sec-WebSocket-Accept| header field or
        // the |Sec-WebSocket-Accept| contains a value other than the
        // base64-encoded SHA-1 of the concatenation of the |Sec-WebSocket-
        // Key| with "258EAFA5-E914-47DA-95CA-C5AB0DC85B11", the client MUST
        // _Fail the WebSocket Connection_. (RFC 6455)
        if response.headers.find_first("Sec-WebSocket-Accept") != Some(self.accept_key.as_bytes())
        {
            return Err(Error::Protocol(ProtocolError::SecWebSocketAcceptKeyMismatch));
        }
        debug!("handshake response verified");
        Ok(())
    }
}

/// Generate a random key for the `Sec-WebSocket-Key` header.
pub fn generate_key() -> String {
    // a base64-encoded (see Section 4 of [RFC4648]) value that,
    // when decoded, is 16 bytes in length (RFC 6455)
    let r: [u8; 16] = rand::random();
    BASE64.encode(r)
}

#[cfg(test)]
mod tests {
    use super::{generate_key, Request, Response, TryParse, VerifyData};
    use crate::error::{Error, ProtocolError};
    use url::Url;

    fn request_for(url: &str) -> Request {
        Request::new(Url::parse(url).unwrap(), Vec::new(), None, Vec::new())
    }

    fn rendered(request: &Request) -> String {
        String::from_utf8(request.to_bytes().unwrap()).unwrap()
    }

    #[test]
    fn random_keys() {
        let k1 = generate_key();
        let k2 = generate_key();
        assert_ne!(k1, k2);
        assert_eq!(k1.len(), 24);
        assert_eq!(k2.len(), 24);
        assert!(k1.ends_with("=="));
        assert!(k2.ends_with("=="));
        assert!(k1[..22].find('=').is_none());
        assert!(k2[..22].find('=').is_none());
    }

    #[test]
    fn request_rendering() {
        let request = request_for("ws://example.com/chat?room=1");
        let text = rendered(&request);
        assert!(text.starts_with("GET /chat?room=1 HTTP/1.1\r\n"));
        assert!(text.contains("Host: example.com:80\r\n"));
        assert!(text.contains("Connection: Upgrade\r\n"));
        assert!(text.contains("Upgrade: websocket\r\n"));
        assert!(text.contains("Sec-WebSocket-Version: 13\r\n"));
        assert!(text.contains(&format!("Sec-WebSocket-Key: {}\r\n", request.key())));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn request_host_port_defaults() {
        assert!(rendered(&request_for("wss://example.com/")).contains("Host: example.com:443\r\n"));
        assert!(rendered(&request_for("https://example.com/"))
            .contains("Host: example.com:443\r\n"));
        assert!(rendered(&request_for("http://example.com/")).contains("Host: example.com:80\r\n"));
        assert!(rendered(&request_for("ws://example.com:9001/"))
            .contains("Host: example.com:9001\r\n"));
    }

    #[test]
    fn request_optional_headers() {
        let request = Request::new(
            Url::parse("ws://example.com/").unwrap(),
            vec!["chat.v2".into(), "chat.v1".into()],
            Some("http://example.com".into()),
            vec![("Authorization".into(), "Bearer token".into())],
        );
        let text = rendered(&request);
        assert!(text.contains("Origin: http://example.com\r\n"));
        assert!(text.contains("Sec-WebSocket-Protocol: chat.v2, chat.v1\r\n"));
        assert!(text.contains("Authorization: Bearer token\r\n"));
    }

    #[test]
    fn response_parsing() {
        const DATA: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\n\r\n";
        let (size, resp) = Response::try_parse(DATA).unwrap().unwrap();
        assert_eq!(size, DATA.len());
        assert_eq!(resp.code(), 200);
        assert_eq!(resp.headers().find_first("Content-Type"), Some(&b"text/html"[..]));
    }

    #[test]
    fn response_needs_terminator() {
        const DATA: &[u8] = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n";
        assert!(Response::try_parse(DATA).unwrap().is_none());
    }

    #[test]
    fn response_reports_excess_bytes() {
        const DATA: &[u8] = b"HTTP/1.1 101 Switching Protocols\r\n\r\n\x81\x05Hello";
        let (size, _) = Response::try_parse(DATA).unwrap().unwrap();
        assert_eq!(&DATA[size..], b"\x81\x05Hello");
    }

    fn accepting_response(request: &Request) -> Vec<u8> {
        format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {}\r\n\r\n",
            super::derive_accept_key(request.key().as_bytes())
        )
        .into_bytes()
    }

    #[test]
    fn verify_accepts_valid_response() {
        let request = request_for("ws://example.com/");
        let raw = accepting_response(&request);
        let (_, resp) = Response::try_parse(&raw).unwrap().unwrap();
        VerifyData::for_request(&request).verify_response(&resp).unwrap();
    }

    #[test]
    fn verify_rejects_bad_status() {
        let request = request_for("ws://example.com/");
        let raw = b"HTTP/1.1 404 Not Found\r\n\r\n";
        let (_, resp) = Response::try_parse(raw).unwrap().unwrap();
        assert!(matches!(
            VerifyData::for_request(&request).verify_response(&resp),
            Err(Error::Http(404))
        ));
    }

    #[test]
    fn verify_rejects_wrong_accept_key() {
        let request = request_for("ws://example.com/");
        let raw = b"HTTP/1.1 101 Switching Protocols\r\n\
                    Upgrade: websocket\r\n\
                    Connection: Upgrade\r\n\
                    Sec-WebSocket-Accept: AAAAAAAAAAAAAAAAAAAAAAAAAAA=\r\n\r\n";
        let (_, resp) = Response::try_parse(raw).unwrap().unwrap();
        assert!(matches!(
            VerifyData::for_request(&request).verify_response(&resp),
            Err(Error::Protocol(ProtocolError::SecWebSocketAcceptKeyMismatch))
        ));
    }

    #[test]
    fn verify_rejects_missing_upgrade() {
        let request = request_for("ws://example.com/");
        let raw = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {}\r\n\r\n",
            super::derive_accept_key(request.key().as_bytes())
        );
        let (_, resp) = Response::try_parse(raw.as_bytes()).unwrap().unwrap();
        assert!(matches!(
            VerifyData::for_request(&request).verify_response(&resp),
            Err(Error::Protocol(ProtocolError::MissingUpgradeWebSocketHeader))
        ));
    }
}
