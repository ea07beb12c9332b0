//! Client-side opening handshake (RFC 6455, section 4).

pub mod client;

use crate::error::Result;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use httparse::Status;
use sha1::{Digest, Sha1};
use std::str::from_utf8;

/// Limit for the number of header lines.
pub(crate) const MAX_HEADERS: usize = 124;

/// Turns a Sec-WebSocket-Key into a Sec-WebSocket-Accept.
pub fn derive_accept_key(request_key: &[u8]) -> String {
    // ... field is constructed by concatenating /key/ ...
    // ... with the string "258EAFA5-E914-47DA-95CA-C5AB0DC85B11" (RFC 6455)
    const WS_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
    let mut sha1 = Sha1::default();
    sha1.update(request_key);
    sha1.update(WS_GUID);
    BASE64.encode(sha1.finalize())
}

/// An incrementally parseable HTTP object.
///
/// `Ok(None)` means the accumulated bytes do not yet contain the
/// end-of-headers terminator; nothing is consumed and the caller should
/// read more. `Ok(Some((size, obj)))` reports how many bytes the object
/// occupied, so the remainder can be forwarded to the framing layer.
pub trait TryParse: Sized {
    /// Try to parse this object out of the accumulated bytes.
    fn try_parse(data: &[u8]) -> Result<Option<(usize, Self)>>;
}

/// HTTP response headers.
#[derive(Debug)]
pub struct Headers {
    data: Vec<(String, Box<[u8]>)>,
}

impl Headers {
    /// Get the first header with the given name, if any.
    pub fn find_first(&self, name: &str) -> Option<&[u8]> {
        self.data
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_ref())
    }

    /// Check if the given header has the given value (case-insensitive).
    pub fn header_is_ignore_case(&self, name: &str, value: &str) -> bool {
        self.find_first(name)
            .and_then(|val_raw| from_utf8(val_raw).ok())
            .map(|val| val.eq_ignore_ascii_case(value))
            .unwrap_or(false)
    }

    /// Check if the given header contains the given token in its
    /// comma-separated value list (case-insensitive).
    pub fn header_contains_token(&self, name: &str, token: &str) -> bool {
        self.find_first(name)
            .and_then(|val_raw| from_utf8(val_raw).ok())
            .map(|val| val.split(',').any(|part| part.trim().eq_ignore_ascii_case(token)))
            .unwrap_or(false)
    }

    pub(crate) fn from_httparse(raw: &[httparse::Header<'_>]) -> Self {
        Headers {
            data: raw
                .iter()
                .map(|h| (h.name.into(), Vec::from(h.value).into_boxed_slice()))
                .collect(),
        }
    }
}

impl TryParse for Headers {
    fn try_parse(data: &[u8]) -> Result<Option<(usize, Self)>> {
        let mut hbuffer = [httparse::EMPTY_HEADER; MAX_HEADERS];
        Ok(match httparse::parse_headers(data, &mut hbuffer)? {
            Status::Partial => None,
            Status::Complete((size, hdr)) => Some((size, Headers::from_httparse(hdr))),
        })
    }
}
