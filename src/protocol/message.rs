use super::frame::{CloseFrame, Utf8Bytes};
use crate::error::{CapacityError, Error, Result};
use bytes::{Bytes, BytesMut};
use std::fmt;

/// A message in the process of being reassembled from fragments.
///
/// Text payloads are UTF-8 validated once, when [`Self::complete`] is
/// called on the final fragment.
#[derive(Debug)]
pub(crate) struct IncompleteMessage {
    kind: IncompleteMessageType,
    buf: BytesMut,
    frame_count: usize,
}

/// The type of an incomplete message, determined by the opcode of its
/// initial frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IncompleteMessageType {
    Text,
    Binary,
}

impl IncompleteMessage {
    pub(crate) fn new(kind: IncompleteMessageType) -> Self {
        Self { kind, buf: BytesMut::new(), frame_count: 0 }
    }

    /// Add the payload of another fragment.
    pub(crate) fn extend(&mut self, fragment: Bytes, size_limit: Option<usize>) -> Result<()> {
        // Always have a max size. This ensures an error in case of
        // concatenating two buffers of more than `usize::MAX` bytes in total.
        let max_size = size_limit.unwrap_or(usize::MAX);
        let my_size = self.buf.len();
        let portion_size = fragment.len();
        // Be careful about integer overflows here.
        if my_size > max_size || portion_size > max_size - my_size {
            return Err(Error::Capacity(CapacityError::MessageTooLong {
                size: my_size.saturating_add(portion_size),
                max_size,
            }));
        }

        self.buf.extend_from_slice(&fragment);
        self.frame_count += 1;
        Ok(())
    }

    /// Number of fragments accumulated so far.
    #[allow(dead_code)]
    pub(crate) fn frame_count(&self) -> usize {
        self.frame_count
    }

    /// Convert an incomplete message into a complete one.
    pub(crate) fn complete(self) -> Result<Message> {
        Ok(match self.kind {
            IncompleteMessageType::Binary => Message::Binary(self.buf.freeze()),
            IncompleteMessageType::Text => Message::Text(self.buf.try_into()?),
        })
    }
}

/// An enum representing the various forms of a WebSocket message.
#[derive(Debug, Eq, PartialEq, Clone)]
pub enum Message {
    /// A text WebSocket message.
    Text(Utf8Bytes),
    /// A binary WebSocket message.
    Binary(Bytes),
    /// A ping message with the specified payload.
    ///
    /// The payload here must have a length less than 125 bytes.
    Ping(Bytes),
    /// A pong message with the specified payload.
    ///
    /// The payload here must have a length less than 125 bytes.
    Pong(Bytes),
    /// A close message with the optional close frame.
    Close(Option<CloseFrame>),
}

impl Message {
    /// Create a new text WebSocket message from a stringable.
    pub fn text<S>(string: S) -> Message
    where
        S: Into<Utf8Bytes>,
    {
        Message::Text(string.into())
    }

    /// Create a new binary WebSocket message by converting to `Bytes`.
    pub fn binary<B>(bin: B) -> Message
    where
        B: Into<Bytes>,
    {
        Message::Binary(bin.into())
    }

    /// Indicates whether a message is a text message.
    pub fn is_text(&self) -> bool {
        matches!(*self, Message::Text(_))
    }

    /// Indicates whether a message is a binary message.
    pub fn is_binary(&self) -> bool {
        matches!(*self, Message::Binary(_))
    }

    /// Indicates whether a message is a close message.
    pub fn is_close(&self) -> bool {
        matches!(*self, Message::Close(_))
    }

    /// Get the length of the WebSocket message.
    pub fn len(&self) -> usize {
        match *self {
            Message::Text(ref string) => string.len(),
            Message::Binary(ref data) | Message::Ping(ref data) | Message::Pong(ref data) => {
                data.len()
            }
            Message::Close(ref data) => data.as_ref().map(|d| d.reason.len()).unwrap_or(0),
        }
    }

    /// Returns true if the WebSocket message has no content.
    /// For example, if the other side of the connection sent an empty string.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Consume the WebSocket message and return it as binary data.
    pub fn into_data(self) -> Bytes {
        match self {
            Message::Text(utf8) => utf8.into(),
            Message::Binary(data) | Message::Ping(data) | Message::Pong(data) => data,
            Message::Close(None) => <_>::default(),
            Message::Close(Some(frame)) => frame.reason.into(),
        }
    }
}

impl From<String> for Message {
    #[inline]
    fn from(string: String) -> Self {
        Message::text(string)
    }
}

impl<'s> From<&'s str> for Message {
    #[inline]
    fn from(string: &'s str) -> Self {
        Message::text(string)
    }
}

impl From<Vec<u8>> for Message {
    #[inline]
    fn from(data: Vec<u8>) -> Self {
        Message::binary(data)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Message::Text(string) => write!(f, "{string}"),
            _ => write!(f, "Binary Data<length={}>", self.len()),
        }
    }
}
