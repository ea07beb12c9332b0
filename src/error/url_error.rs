use std::fmt;

/// Indicates the specific type/cause of URL error.
#[derive(PartialEq, Eq)]
pub enum UrlError {
    /// The URL could not be parsed at all.
    Malformed(url::ParseError),
    /// The URL does not include a host name.
    NoHostName,
    /// Failed to connect with this URL.
    UnableToConnect(String),
    /// Unsupported URL scheme used (only `ws`, `wss`, `http` or `https` may be used).
    UnsupportedUrlScheme,
}

impl fmt::Debug for UrlError {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Malformed(ref elem) => write!(f, "Malformed URL: {elem}"),
            Self::NoHostName => write!(f, "No host name in the URL"),
            Self::UnableToConnect(ref elem) => write!(f, "Unable to connect to {elem}"),
            Self::UnsupportedUrlScheme => write!(f, "URL scheme not supported"),
        }
    }
}

impl fmt::Display for UrlError {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl std::error::Error for UrlError {}
