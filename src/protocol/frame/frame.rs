use byteorder::{ByteOrder, NetworkEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use log::*;
use std::{
    fmt,
    io::{Cursor, Read, Write},
    result::Result as StdResult,
    str,
};

use super::{
    coding::{CloseCode, Control, OpCode},
    mask::{apply_mask, generate_mask},
};
use crate::{
    error::{Error, ProtocolError, Result},
    protocol::frame::Utf8Bytes,
};

/// A struct representing the close command.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CloseFrame {
    /// The reason as a code.
    pub code: CloseCode,
    /// The reason as text string.
    pub reason: Utf8Bytes,
}

impl fmt::Display for CloseFrame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({})", self.reason, self.code)
    }
}

/// A struct representing a WebSocket frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Indicates that the frame is the last one of a possibly fragmented message.
    pub is_final: bool,
    /// Reserved for protocol extensions.
    pub rsv1: bool,
    /// Reserved for protocol extensions.
    pub rsv2: bool,
    /// Reserved for protocol extensions.
    pub rsv3: bool,
    /// WebSocket protocol opcode.
    pub opcode: OpCode,
    /// A frame mask, if any.
    pub mask: Option<[u8; 4]>,
}

impl Default for FrameHeader {
    fn default() -> Self {
        FrameHeader {
            is_final: true,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            opcode: OpCode::Control(Control::Close),
            mask: None,
        }
    }
}

impl FrameHeader {
    /// Parse a header from the cursor.
    ///
    /// Returns `None` when the underlying buffer does not yet contain the
    /// whole header (including the extended length and the mask key, when
    /// present). In that case the cursor position is left untouched so the
    /// accumulated bytes carry over to the next attempt.
    pub fn parse(cursor: &mut Cursor<&[u8]>) -> Result<Option<(FrameHeader, u64)>> {
        let initial = cursor.position();
        match Self::parse_internal(cursor) {
            ret @ Ok(Some(_)) => ret,
            ret => {
                cursor.set_position(initial);
                ret
            }
        }
    }

    /// Get the size of the header formatted with the given payload length.
    pub fn len(&self, length: u64) -> usize {
        2 + LengthFormat::for_length(length).extra_bytes() + if self.mask.is_some() { 4 } else { 0 }
    }

    /// Format a header for the given payload size.
    pub fn format(&self, length: u64, output: &mut impl Write) -> Result<()> {
        let code: u8 = self.opcode.into();

        let one = {
            code | if self.is_final { 0x80 } else { 0 }
                | if self.rsv1 { 0x40 } else { 0 }
                | if self.rsv2 { 0x20 } else { 0 }
                | if self.rsv3 { 0x10 } else { 0 }
        };

        let lenfmt = LengthFormat::for_length(length);

        let two = { lenfmt.length_byte() | if self.mask.is_some() { 0x80 } else { 0 } };

        output.write_all(&[one, two])?;
        match lenfmt {
            LengthFormat::U8(_) => (),
            LengthFormat::U16 => output.write_u16::<NetworkEndian>(length as u16)?,
            LengthFormat::U64 => output.write_u64::<NetworkEndian>(length)?,
        }

        if let Some(ref mask) = self.mask {
            output.write_all(mask)?;
        }

        Ok(())
    }

    /// Internal parse engine. Returns `None` if insufficient data is available.
    fn parse_internal(cursor: &mut impl Read) -> Result<Option<(Self, u64)>> {
        let (first, second) = {
            let mut head = [0u8; 2];
            if cursor.read(&mut head)? != 2 {
                return Ok(None);
            }
            (head[0], head[1])
        };

        trace!("parsed header bytes {first:#04x} {second:#04x}");

        let is_final = first & 0x80 != 0;

        let rsv1 = first & 0x40 != 0;
        let rsv2 = first & 0x20 != 0;
        let rsv3 = first & 0x10 != 0;

        let opcode = OpCode::from(first & 0x0F);

        let masked = second & 0x80 != 0;

        let length = {
            let length_byte = second & 0x7F;
            let length_length = LengthFormat::for_byte(length_byte).extra_bytes();
            if length_length > 0 {
                match cursor.read_uint::<NetworkEndian>(length_length) {
                    Err(ref err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                        return Ok(None);
                    }
                    Err(err) => {
                        return Err(err.into());
                    }
                    Ok(read) => read,
                }
            } else {
                u64::from(length_byte)
            }
        };

        let mask = if masked {
            let mut mask_bytes = [0u8; 4];
            if cursor.read(&mut mask_bytes)? != 4 {
                return Ok(None);
            }
            Some(mask_bytes)
        } else {
            None
        };

        let hdr = FrameHeader { is_final, rsv1, rsv2, rsv3, opcode, mask };

        Ok(Some((hdr, length)))
    }
}

/// A struct representing a WebSocket frame.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Frame {
    header: FrameHeader,
    payload: Bytes,
}

impl Frame {
    /// Get the length of the frame.
    /// This is the length of the header + the length of the payload.
    #[inline]
    pub fn len(&self) -> usize {
        let length = self.payload.len();
        self.header.len(length as u64) + length
    }

    /// Check if the frame is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get a reference to the frame's header.
    #[inline]
    pub fn header(&self) -> &FrameHeader {
        &self.header
    }

    /// Get a reference to the frame's payload.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Test whether the frame is masked.
    #[inline]
    pub(crate) fn is_masked(&self) -> bool {
        self.header.mask.is_some()
    }

    /// Generate a random mask for the frame.
    ///
    /// This just generates and stores the mask; the payload is masked when
    /// the frame is formatted for the wire.
    #[inline]
    pub(crate) fn set_random_mask(&mut self) {
        self.header.mask = Some(generate_mask());
    }

    /// Consume the frame into its payload as binary.
    #[inline]
    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Consume the frame into its payload as string.
    #[inline]
    pub fn into_text(self) -> StdResult<Utf8Bytes, str::Utf8Error> {
        self.payload.try_into()
    }

    /// Consume the frame into a closing frame.
    ///
    /// The close code is validated against the receive-validity ranges and
    /// the reason against UTF-8; both violations are protocol errors.
    pub(crate) fn into_close(self) -> Result<Option<CloseFrame>> {
        match self.payload.len() {
            0 => Ok(None),
            1 => Err(Error::Protocol(ProtocolError::InvalidCloseSequence)),
            _ => {
                let mut data = self.payload;
                let code = CloseCode::from(NetworkEndian::read_u16(&data.split_to(2)));
                if !code.is_allowed() {
                    return Err(Error::Protocol(ProtocolError::InvalidCloseCode(code.into())));
                }
                let text = Utf8Bytes::try_from(data)
                    .map_err(|_| Error::Protocol(ProtocolError::InvalidCloseSequence))?;
                Ok(Some(CloseFrame { code, reason: text }))
            }
        }
    }

    /// Create a new data frame.
    #[inline]
    pub fn message(data: impl Into<Bytes>, opcode: OpCode, is_final: bool) -> Frame {
        debug_assert!(matches!(opcode, OpCode::Data(_)), "Invalid opcode for data frame.");
        Frame {
            header: FrameHeader { is_final, opcode, ..FrameHeader::default() },
            payload: data.into(),
        }
    }

    /// Create a new Pong control frame.
    #[inline]
    pub fn pong(data: impl Into<Bytes>) -> Frame {
        Frame {
            header: FrameHeader { opcode: OpCode::Control(Control::Pong), ..<_>::default() },
            payload: data.into(),
        }
    }

    /// Create a new Ping control frame.
    #[inline]
    pub fn ping(data: impl Into<Bytes>) -> Frame {
        Frame {
            header: FrameHeader { opcode: OpCode::Control(Control::Ping), ..<_>::default() },
            payload: data.into(),
        }
    }

    /// Create a new Close control frame.
    #[inline]
    pub fn close(msg: Option<CloseFrame>) -> Frame {
        let payload = if let Some(CloseFrame { code, reason }) = msg {
            let mut p = Vec::with_capacity(reason.len() + 2);
            p.extend(u16::from(code).to_be_bytes());
            p.extend_from_slice(reason.as_bytes());
            p
        } else {
            Vec::new()
        };

        Frame { header: FrameHeader::default(), payload: payload.into() }
    }

    /// Create a frame from a parsed header and its payload.
    pub(crate) fn from_payload(header: FrameHeader, payload: Bytes) -> Self {
        Frame { header, payload }
    }

    /// Write a frame out to a buffer, masking the payload if a mask is set.
    pub fn format(self, output: &mut Vec<u8>) -> Result<()> {
        self.header.format(self.payload.len() as u64, output)?;
        let start = output.len();
        output.extend_from_slice(&self.payload);
        if let Some(mask) = self.header.mask {
            apply_mask(&mut output[start..], mask);
        }
        Ok(())
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "<FRAME final={} opcode={} length={} payload 0x{}>",
            self.header.is_final,
            self.header.opcode,
            self.len(),
            self.payload.iter().fold(String::new(), |mut s, byte| {
                use fmt::Write as _;
                _ = write!(s, "{byte:02x}");
                s
            })
        )
    }
}

/// Handling of the length format.
enum LengthFormat {
    U8(u8),
    U16,
    U64,
}

impl LengthFormat {
    /// Get the length format for a given data size.
    #[inline]
    fn for_length(length: u64) -> Self {
        if length < 126 {
            LengthFormat::U8(length as u8)
        } else if length < 65536 {
            LengthFormat::U16
        } else {
            LengthFormat::U64
        }
    }

    /// Get the size of the length encoding.
    #[inline]
    fn extra_bytes(&self) -> usize {
        match *self {
            LengthFormat::U8(_) => 0,
            LengthFormat::U16 => 2,
            LengthFormat::U64 => 8,
        }
    }

    /// Encode the given length.
    #[inline]
    fn length_byte(&self) -> u8 {
        match *self {
            LengthFormat::U8(b) => b,
            LengthFormat::U16 => 126,
            LengthFormat::U64 => 127,
        }
    }

    /// Get the length format for a given length byte.
    #[inline]
    fn for_byte(byte: u8) -> Self {
        match byte & 0x7F {
            126 => LengthFormat::U16,
            127 => LengthFormat::U64,
            b => LengthFormat::U8(b),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::coding::{Data, OpCode};

    #[test]
    fn parse() {
        let raw: &[u8] = &[0x82, 0x07, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07];
        let mut cursor = Cursor::new(raw);
        let (header, length) = FrameHeader::parse(&mut cursor).unwrap().unwrap();
        assert_eq!(header.opcode, OpCode::Data(Data::Binary));
        assert_eq!(length, 7);
        assert_eq!(cursor.position(), 2);
    }

    #[test]
    fn parse_incomplete_header_consumes_nothing() {
        // Lone first byte of "81 05 ..." must be stashed, not consumed.
        let raw: &[u8] = &[0x81];
        let mut cursor = Cursor::new(raw);
        assert!(FrameHeader::parse(&mut cursor).unwrap().is_none());
        assert_eq!(cursor.position(), 0);
    }

    #[test]
    fn parse_incomplete_extended_length() {
        let raw: &[u8] = &[0x82, 0x7E, 0x01];
        let mut cursor = Cursor::new(raw);
        assert!(FrameHeader::parse(&mut cursor).unwrap().is_none());
        assert_eq!(cursor.position(), 0);
    }

    #[test]
    fn parse_extended_lengths() {
        let raw: &[u8] = &[0x82, 0x7E, 0x01, 0x00];
        let (_, length) = FrameHeader::parse(&mut Cursor::new(raw)).unwrap().unwrap();
        assert_eq!(length, 256);

        let raw: &[u8] = &[0x82, 0x7F, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x86, 0xA0];
        let (_, length) = FrameHeader::parse(&mut Cursor::new(raw)).unwrap().unwrap();
        assert_eq!(length, 100_000);
    }

    #[test]
    fn parse_masked_header() {
        let raw: &[u8] = &[0x81, 0x85, 0x01, 0x02, 0x03, 0x04];
        let (header, length) = FrameHeader::parse(&mut Cursor::new(raw)).unwrap().unwrap();
        assert_eq!(header.mask, Some([0x01, 0x02, 0x03, 0x04]));
        assert_eq!(length, 5);
    }

    #[test]
    fn format_pong() {
        let frame = Frame::pong(vec![0x01, 0x02]);
        let mut buf = Vec::with_capacity(frame.len());
        frame.format(&mut buf).unwrap();
        assert_eq!(buf, vec![0x8A, 0x02, 0x01, 0x02]);
    }

    #[test]
    fn format_sixty_four_bit_length() {
        let frame = Frame::message(vec![0u8; 100_000], OpCode::Data(Data::Binary), true);
        let mut buf = Vec::with_capacity(frame.len());
        frame.format(&mut buf).unwrap();
        assert_eq!(&buf[..10], &[0x82, 0x7F, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x86, 0xA0]);
        assert_eq!(buf.len(), 10 + 100_000);
    }

    #[test]
    fn format_masked_roundtrip() {
        let payload = b"Hello".to_vec();
        let mut frame = Frame::message(payload.clone(), OpCode::Data(Data::Text), true);
        frame.set_random_mask();
        let mut buf = Vec::with_capacity(frame.len());
        frame.format(&mut buf).unwrap();

        // MASK bit must be set, length inline.
        assert_eq!(buf[0], 0x81);
        assert_eq!(buf[1], 0x80 | 5);

        let mut cursor = Cursor::new(&buf[..]);
        let (header, length) = FrameHeader::parse(&mut cursor).unwrap().unwrap();
        assert_eq!(length, 5);
        let mask = header.mask.unwrap();
        let mut body = buf[cursor.position() as usize..].to_vec();
        apply_mask(&mut body, mask);
        assert_eq!(body, payload);
    }

    #[test]
    fn close_frame_with_code_and_reason() {
        let frame = Frame::from_payload(
            FrameHeader::default(),
            Bytes::from_static(&[0x03, 0xE8, b'b', b'y', b'e']),
        );
        let close = frame.into_close().unwrap().unwrap();
        assert_eq!(close.code, CloseCode::Normal);
        assert_eq!(close.reason.as_str(), "bye");
    }

    #[test]
    fn close_frame_one_byte_payload() {
        let frame = Frame::from_payload(FrameHeader::default(), Bytes::from_static(&[0x03]));
        assert!(matches!(
            frame.into_close(),
            Err(Error::Protocol(ProtocolError::InvalidCloseSequence))
        ));
    }

    #[test]
    fn close_frame_reserved_code() {
        // 1005 must never appear on the wire.
        let frame = Frame::from_payload(FrameHeader::default(), Bytes::from_static(&[0x03, 0xED]));
        assert!(matches!(
            frame.into_close(),
            Err(Error::Protocol(ProtocolError::InvalidCloseCode(1005)))
        ));
    }

    #[test]
    fn close_frame_encodes_code() {
        let frame =
            Frame::close(Some(CloseFrame { code: CloseCode::Normal, reason: <_>::default() }));
        let mut buf = Vec::new();
        frame.format(&mut buf).unwrap();
        assert_eq!(buf, vec![0x88, 0x02, 0x03, 0xE8]);
    }

    #[test]
    fn display() {
        let f = Frame::message(b"hi there".to_vec(), OpCode::Data(Data::Text), true);
        let view = format!("{f}");
        assert!(view.contains("payload"));
    }
}
