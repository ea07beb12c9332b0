//! Generic WebSocket message stream.

pub mod frame;

mod message;

pub use self::{
    frame::{CloseFrame, Utf8Bytes},
    message::Message,
};

use self::{
    frame::{
        coding::{Control as OpCtl, Data as OpData, OpCode},
        Frame, FrameCodec,
    },
    message::{IncompleteMessage, IncompleteMessageType},
};
use crate::error::{CapacityError, Error, ProtocolError, Result};
use log::*;

/// The configuration for a WebSocket connection.
///
/// # Example
/// ```
/// # use websock::protocol::WebSocketConfig;
/// let conf = WebSocketConfig::default()
///     .max_message_size(Some(256 * 1024))
///     .max_frame_size(Some(64 * 1024));
/// ```
#[derive(Debug, Clone, Copy)]
#[non_exhaustive]
pub struct WebSocketConfig {
    /// The maximum size of an incoming message. `None` means no size limit. The default
    /// value is 64 MiB which should be reasonably big for all normal use-cases but small
    /// enough to prevent memory eating by a malicious peer.
    pub max_message_size: Option<usize>,
    /// The maximum size of a single incoming message frame. `None` means no size limit.
    /// The limit is for frame payload NOT including the frame header. The default value
    /// is 16 MiB.
    pub max_frame_size: Option<usize>,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self { max_message_size: Some(64 << 20), max_frame_size: Some(16 << 20) }
    }
}

impl WebSocketConfig {
    /// Set [`Self::max_message_size`].
    pub fn max_message_size(mut self, max_message_size: Option<usize>) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    /// Set [`Self::max_frame_size`].
    pub fn max_frame_size(mut self, max_frame_size: Option<usize>) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }
}

/// A post-handshake machine for the receiving half of a client WebSocket.
///
/// Transport bytes are pushed in with [`feed`](Self::feed) exactly as they
/// arrive; [`read_message`](Self::read_message) reassembles them into
/// complete messages, enforcing the protocol rules for reserved bits,
/// masking direction, control frames and fragmentation. The caller owns
/// frame transmission, so ping replies and close echoes are left to it.
#[derive(Debug)]
pub struct WebSocketContext {
    /// Incremental decoder of frames.
    codec: FrameCodec,
    /// Receive: an incomplete message being reassembled.
    incomplete: Option<IncompleteMessage>,
    /// Set once a close frame has been received; everything after is junk.
    close_received: bool,
    /// The configuration for the websocket session.
    config: WebSocketConfig,
}

impl WebSocketContext {
    /// Create a context for a freshly opened connection.
    pub fn new(config: WebSocketConfig) -> Self {
        Self::from_partially_read(&[][..], config)
    }

    /// Create a context over bytes that were read past the handshake
    /// terminator and therefore already belong to the framing layer.
    pub fn from_partially_read(part: impl AsRef<[u8]>, config: WebSocketConfig) -> Self {
        Self {
            codec: FrameCodec::from_partially_read(part),
            incomplete: None,
            close_received: false,
            config,
        }
    }

    /// Read the configuration.
    pub fn get_config(&self) -> &WebSocketConfig {
        &self.config
    }

    /// Append bytes received from the transport.
    pub fn feed(&mut self, data: &[u8]) {
        self.codec.feed(data);
    }

    /// Try to produce the next complete message from the buffered bytes.
    ///
    /// Returns `Ok(None)` when more transport bytes are needed. Any `Err`
    /// is a fatal condition: the connection must be failed with the close
    /// code the error maps to.
    pub fn read_message(&mut self) -> Result<Option<Message>> {
        loop {
            if self.close_received {
                // The peer is not allowed to follow a close frame with
                // anything else.
                return match self.codec.read_frame(self.config.max_frame_size)? {
                    Some(_) => Err(Error::Protocol(ProtocolError::ReceivedAfterClosing)),
                    None => Ok(None),
                };
            }

            let frame = match self.codec.read_frame(self.config.max_frame_size)? {
                Some(frame) => frame,
                None => return Ok(None),
            };

            if let Some(message) = self.handle_frame(frame)? {
                return Ok(Some(message));
            }
            // A non-final fragment was absorbed; try to parse the rest of
            // the buffer.
        }
    }

    /// Apply the protocol rules to a single parsed frame.
    ///
    /// Returns `None` when the frame did not complete a message (i.e. a
    /// non-final fragment was appended to the reassembly accumulator).
    fn handle_frame(&mut self, frame: Frame) -> Result<Option<Message>> {
        // MUST be 0 unless an extension is negotiated that defines meanings
        // for non-zero values. No extension is ever negotiated here, so any
        // set bit fails the connection, pong frames included.
        {
            let hdr = frame.header();
            if hdr.rsv1 || hdr.rsv2 || hdr.rsv3 {
                return Err(Error::Protocol(ProtocolError::NonZeroReservedBits));
            }
        }

        if frame.is_masked() {
            // A client MUST close a connection if it detects a masked frame. (RFC 6455)
            return Err(Error::Protocol(ProtocolError::MaskedFrameFromServer));
        }

        match frame.header().opcode {
            OpCode::Control(ctl) => {
                match ctl {
                    // All control frames MUST have a payload length of 125 bytes or less
                    // and MUST NOT be fragmented. (RFC 6455)
                    _ if !frame.header().is_final => {
                        Err(Error::Protocol(ProtocolError::FragmentedControlFrame))
                    }
                    _ if frame.payload().len() > 125 => {
                        Err(Error::Protocol(ProtocolError::ControlFrameTooBig))
                    }
                    OpCtl::Reserved(i) => {
                        Err(Error::Protocol(ProtocolError::UnknownControlFrameType(i)))
                    }
                    OpCtl::Close => {
                        self.close_received = true;
                        let close = frame.into_close()?;
                        debug!("received close frame: {close:?}");
                        Ok(Some(Message::Close(close)))
                    }
                    OpCtl::Ping => Ok(Some(Message::Ping(frame.into_payload()))),
                    OpCtl::Pong => Ok(Some(Message::Pong(frame.into_payload()))),
                }
            }

            OpCode::Data(data) => {
                let fin = frame.header().is_final;
                match data {
                    OpData::Continue => {
                        if let Some(ref mut msg) = self.incomplete {
                            msg.extend(frame.into_payload(), self.config.max_message_size)?;
                        } else {
                            return Err(Error::Protocol(ProtocolError::UnexpectedContinueFrame));
                        }
                        if fin {
                            Ok(Some(
                                self.incomplete.take().expect("Bug: no accumulator").complete()?,
                            ))
                        } else {
                            Ok(None)
                        }
                    }
                    c if self.incomplete.is_some() => {
                        Err(Error::Protocol(ProtocolError::ExpectedFragment(c)))
                    }
                    OpData::Text if fin => {
                        check_max_size(frame.payload().len(), self.config.max_message_size)?;
                        Ok(Some(Message::Text(frame.into_text()?)))
                    }
                    OpData::Binary if fin => {
                        check_max_size(frame.payload().len(), self.config.max_message_size)?;
                        Ok(Some(Message::Binary(frame.into_payload())))
                    }
                    OpData::Text | OpData::Binary => {
                        let message_type = match data {
                            OpData::Text => IncompleteMessageType::Text,
                            _ => IncompleteMessageType::Binary,
                        };
                        let mut incomplete = IncompleteMessage::new(message_type);
                        incomplete.extend(frame.into_payload(), self.config.max_message_size)?;
                        self.incomplete = Some(incomplete);
                        Ok(None)
                    }
                    OpData::Reserved(i) => {
                        Err(Error::Protocol(ProtocolError::UnknownDataFrameType(i)))
                    }
                }
            }
        }
    }
}

fn check_max_size(size: usize, max_size: Option<usize>) -> Result<()> {
    if let Some(max_size) = max_size {
        if size > max_size {
            return Err(Error::Capacity(CapacityError::MessageTooLong { size, max_size }));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{Message, WebSocketConfig, WebSocketContext};
    use crate::{
        error::{CapacityError, Error, ProtocolError},
        protocol::frame::coding::CloseCode,
    };
    use bytes::Bytes;

    fn context() -> WebSocketContext {
        WebSocketContext::new(WebSocketConfig::default())
    }

    /// Feed everything at once and collect messages until the buffer is dry.
    fn collect(ctx: &mut WebSocketContext) -> Vec<Message> {
        let mut out = Vec::new();
        while let Some(message) = ctx.read_message().unwrap() {
            out.push(message);
        }
        out
    }

    #[test]
    fn single_text_frame() {
        let mut ctx = context();
        ctx.feed(&[0x81, 0x05, 0x48, 0x65, 0x6C, 0x6C, 0x6F]);
        assert_eq!(collect(&mut ctx), vec![Message::text("Hello")]);
    }

    #[test]
    fn fragmented_text() {
        let mut ctx = context();
        ctx.feed(&[0x01, 0x03, 0x48, 0x65, 0x6C]);
        assert!(ctx.read_message().unwrap().is_none());
        ctx.feed(&[0x80, 0x02, 0x6C, 0x6F]);
        assert_eq!(collect(&mut ctx), vec![Message::text("Hello")]);
    }

    #[test]
    fn ping_during_fragmented_message() {
        let mut ctx = context();
        ctx.feed(&[0x01, 0x03, 0x48, 0x65, 0x6C]);
        ctx.feed(&[0x89, 0x04, 0x70, 0x69, 0x6E, 0x67]);
        assert_eq!(
            ctx.read_message().unwrap(),
            Some(Message::Ping(Bytes::from_static(b"ping")))
        );
        ctx.feed(&[0x80, 0x02, 0x6C, 0x6F]);
        assert_eq!(collect(&mut ctx), vec![Message::text("Hello")]);
    }

    #[test]
    fn interleaved_control_frames() {
        let mut ctx = context();
        ctx.feed(&[
            0x89, 0x02, 0x01, 0x02, 0x8a, 0x01, 0x03, 0x01, 0x07, 0x48, 0x65, 0x6c, 0x6c, 0x6f,
            0x2c, 0x20, 0x80, 0x06, 0x57, 0x6f, 0x72, 0x6c, 0x64, 0x21, 0x82, 0x03, 0x01, 0x02,
            0x03,
        ]);
        assert_eq!(
            collect(&mut ctx),
            vec![
                Message::Ping(Bytes::from_static(&[1, 2])),
                Message::Pong(Bytes::from_static(&[3])),
                Message::text("Hello, World!"),
                Message::binary(vec![0x01, 0x02, 0x03]),
            ]
        );
    }

    #[test]
    fn close_with_normal_code() {
        let mut ctx = context();
        ctx.feed(&[0x88, 0x02, 0x03, 0xE8]);
        match ctx.read_message().unwrap() {
            Some(Message::Close(Some(frame))) => assert_eq!(frame.code, CloseCode::Normal),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn data_after_close_is_an_error() {
        let mut ctx = context();
        ctx.feed(&[0x88, 0x00, 0x81, 0x01, 0x41]);
        assert!(matches!(ctx.read_message().unwrap(), Some(Message::Close(None))));
        assert!(matches!(
            ctx.read_message(),
            Err(Error::Protocol(ProtocolError::ReceivedAfterClosing))
        ));
    }

    #[test]
    fn invalid_utf8_text() {
        let mut ctx = context();
        ctx.feed(&[0x81, 0x02, 0xC3, 0x28]);
        let err = ctx.read_message().unwrap_err();
        assert!(matches!(err, Error::Utf8(_)));
        assert_eq!(err.code(), 1007);
    }

    #[test]
    fn reserved_bits_rejected_on_every_opcode() {
        // Data frame with RSV1.
        let mut ctx = context();
        ctx.feed(&[0xC1, 0x01, 0x41]);
        assert!(matches!(
            ctx.read_message(),
            Err(Error::Protocol(ProtocolError::NonZeroReservedBits))
        ));

        // Pong with RSV1; historically exempted by some stacks, not here.
        let mut ctx = context();
        ctx.feed(&[0xCA, 0x00]);
        assert!(matches!(
            ctx.read_message(),
            Err(Error::Protocol(ProtocolError::NonZeroReservedBits))
        ));
    }

    #[test]
    fn masked_inbound_frame_rejected() {
        let mut ctx = context();
        ctx.feed(&[0x81, 0x81, 0x01, 0x02, 0x03, 0x04, 0x40]);
        assert!(matches!(
            ctx.read_message(),
            Err(Error::Protocol(ProtocolError::MaskedFrameFromServer))
        ));
    }

    #[test]
    fn unknown_opcode_rejected() {
        let mut ctx = context();
        ctx.feed(&[0x83, 0x00]);
        assert!(matches!(
            ctx.read_message(),
            Err(Error::Protocol(ProtocolError::UnknownDataFrameType(3)))
        ));

        let mut ctx = context();
        ctx.feed(&[0x8B, 0x00]);
        assert!(matches!(
            ctx.read_message(),
            Err(Error::Protocol(ProtocolError::UnknownControlFrameType(11)))
        ));
    }

    #[test]
    fn fragmented_control_frame_rejected() {
        let mut ctx = context();
        ctx.feed(&[0x09, 0x01, 0x41]);
        assert!(matches!(
            ctx.read_message(),
            Err(Error::Protocol(ProtocolError::FragmentedControlFrame))
        ));
    }

    #[test]
    fn oversized_control_frame_rejected() {
        let mut ctx = context();
        let mut bytes = vec![0x89, 0x7E, 0x00, 0x7E];
        bytes.extend_from_slice(&[0u8; 126]);
        ctx.feed(&bytes);
        assert!(matches!(
            ctx.read_message(),
            Err(Error::Protocol(ProtocolError::ControlFrameTooBig))
        ));
    }

    #[test]
    fn unexpected_continuation_rejected() {
        let mut ctx = context();
        ctx.feed(&[0x80, 0x01, 0x41]);
        assert!(matches!(
            ctx.read_message(),
            Err(Error::Protocol(ProtocolError::UnexpectedContinueFrame))
        ));
    }

    #[test]
    fn new_message_during_fragmentation_rejected() {
        let mut ctx = context();
        ctx.feed(&[0x01, 0x01, 0x41, 0x81, 0x01, 0x42]);
        assert!(ctx.read_message().unwrap().is_none());
        assert!(matches!(
            ctx.read_message(),
            Err(Error::Protocol(ProtocolError::ExpectedFragment(_)))
        ));
    }

    #[test]
    fn invalid_close_code_rejected() {
        for code in [1004u16, 1005, 1006, 1012, 1015, 1016, 2999, 999] {
            let mut ctx = context();
            let bytes = code.to_be_bytes();
            ctx.feed(&[0x88, 0x02, bytes[0], bytes[1]]);
            let err = ctx.read_message().unwrap_err();
            assert!(
                matches!(err, Error::Protocol(ProtocolError::InvalidCloseCode(c)) if c == code),
                "{code}: {err:?}"
            );
            assert_eq!(err.code(), 1002);
        }
    }

    #[test]
    fn size_limiting_text_fragmented() {
        let limit = WebSocketConfig::default().max_message_size(Some(10));
        let mut ctx = WebSocketContext::new(limit);
        ctx.feed(&[
            0x01, 0x07, 0x48, 0x65, 0x6c, 0x6c, 0x6f, 0x2c, 0x20, 0x80, 0x06, 0x57, 0x6f, 0x72,
            0x6c, 0x64, 0x21,
        ]);
        assert!(matches!(
            ctx.read_message(),
            Err(Error::Capacity(CapacityError::MessageTooLong { size: 13, max_size: 10 }))
        ));
    }

    #[test]
    fn size_limiting_binary() {
        let limit = WebSocketConfig::default().max_message_size(Some(2));
        let mut ctx = WebSocketContext::new(limit);
        ctx.feed(&[0x82, 0x03, 0x01, 0x02, 0x03]);
        assert!(matches!(
            ctx.read_message(),
            Err(Error::Capacity(CapacityError::MessageTooLong { size: 3, max_size: 2 }))
        ));
    }

    #[test]
    fn chunk_boundary_independence() {
        // The same byte stream must decode to the same messages no matter
        // how it is partitioned.
        let stream: Vec<u8> = vec![
            0x01, 0x03, 0x48, 0x65, 0x6C, // text fragment "Hel"
            0x89, 0x04, 0x70, 0x69, 0x6E, 0x67, // interleaved ping
            0x80, 0x02, 0x6C, 0x6F, // final fragment "lo"
            0x82, 0x7E, 0x00, 0x80, // binary, 16-bit length 128
        ]
        .into_iter()
        .chain(std::iter::repeat(0xAB).take(128))
        .chain([0x8A, 0x00]) // empty pong
        .collect();

        let mut reference = context();
        reference.feed(&stream);
        let expected = collect(&mut reference);
        assert_eq!(expected.len(), 4);

        for chunk_size in [1, 2, 3, 7, 64, stream.len()] {
            let mut ctx = context();
            let mut got = Vec::new();
            for chunk in stream.chunks(chunk_size) {
                ctx.feed(chunk);
                got.extend(collect(&mut ctx));
            }
            assert_eq!(got, expected, "chunk size {chunk_size}");
        }
    }

    #[test]
    fn tail_bytes_from_handshake() {
        let ctx =
            WebSocketContext::from_partially_read([0x81, 0x05, 0x48], WebSocketConfig::default());
        let mut ctx = ctx;
        assert!(ctx.read_message().unwrap().is_none());
        ctx.feed(&[0x65, 0x6C, 0x6C, 0x6F]);
        assert_eq!(ctx.read_message().unwrap(), Some(Message::text("Hello")));
    }
}
