//! Utilities to work with raw WebSocket frames.

pub mod coding;

#[allow(clippy::module_inception)]
mod frame;
mod mask;
mod utf8;

pub use self::{
    frame::{CloseFrame, Frame, FrameHeader},
    utf8::Utf8Bytes,
};

use crate::error::{CapacityError, Error, Result};
use bytes::{Buf, BytesMut};
use log::*;
use std::io::Cursor;

/// Initial capacity of the incoming buffer.
const READ_BUF_LEN: usize = 16 * 1024;

/// An incremental decoder and encoder for WebSocket frames.
///
/// Incoming bytes are pushed with [`feed`](FrameCodec::feed) in whatever
/// chunks the transport produces; [`read_frame`](FrameCodec::read_frame)
/// yields a frame once enough bytes have accumulated, keeping any partial
/// header or payload buffered until the rest arrives.
#[derive(Debug)]
pub(crate) struct FrameCodec {
    /// Bytes received from the transport but not yet parsed.
    in_buffer: BytesMut,
    /// Header and remaining payload size of the frame being received.
    header: Option<(FrameHeader, u64)>,
}

impl FrameCodec {
    /// Create a new frame codec.
    pub(crate) fn new() -> Self {
        Self { in_buffer: BytesMut::with_capacity(READ_BUF_LEN), header: None }
    }

    /// Create a new frame codec over data already read from the transport.
    pub(crate) fn from_partially_read(part: impl AsRef<[u8]>) -> Self {
        let mut codec = Self::new();
        codec.feed(part.as_ref());
        codec
    }

    /// Append transport bytes to the incoming buffer.
    pub(crate) fn feed(&mut self, data: &[u8]) {
        self.in_buffer.extend_from_slice(data);
    }

    /// Try to parse one complete frame out of the buffered bytes.
    ///
    /// Returns `None` when more bytes are needed. Frames whose declared
    /// payload exceeds `max_frame_size` are rejected before any payload
    /// accumulation happens.
    pub(crate) fn read_frame(&mut self, max_frame_size: Option<usize>) -> Result<Option<Frame>> {
        let max_frame_size = max_frame_size.unwrap_or(usize::MAX);

        if self.header.is_none() {
            let mut cursor = Cursor::new(&self.in_buffer[..]);
            self.header = FrameHeader::parse(&mut cursor)?;
            let advanced = cursor.position() as usize;
            self.in_buffer.advance(advanced);
        }

        let len = match self.header {
            Some((_, len)) => len,
            // Partial header: everything stays buffered.
            None => return Ok(None),
        };

        // Enforce the frame size limit early and make sure the length
        // fits into `usize`.
        if len > max_frame_size as u64 {
            return Err(Error::Capacity(CapacityError::FrameTooLong {
                size: len,
                max_size: max_frame_size,
            }));
        }
        let len = len as usize;

        if self.in_buffer.len() < len {
            return Ok(None);
        }

        let payload = self.in_buffer.split_to(len).freeze();
        let (header, _) = self.header.take().expect("Bug: no frame header");
        let frame = Frame::from_payload(header, payload);
        trace!("received frame {frame}");
        Ok(Some(frame))
    }
}
