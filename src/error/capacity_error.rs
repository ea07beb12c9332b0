use std::fmt;

/// Indicates the specific type/cause of a capacity error.
#[derive(PartialEq, Eq, Clone, Copy)]
pub enum CapacityError {
    /// Too many headers provided (see [`httparse::Error::TooManyHeaders`]).
    TooManyHeaders,
    /// The handshake response grew beyond the permitted size before its
    /// end-of-headers terminator was found.
    HeaderTooLong,
    /// Received a message that is too big.
    MessageTooLong {
        /// The size of the message.
        size: usize,
        /// The maximum allowed message size.
        max_size: usize,
    },
    /// Received a frame whose declared payload is too big.
    FrameTooLong {
        /// The declared payload size of the frame.
        size: u64,
        /// The maximum allowed frame size.
        max_size: usize,
    },
}

impl fmt::Debug for CapacityError {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::TooManyHeaders => write!(f, "Too many headers"),
            Self::HeaderTooLong => write!(f, "Header too long"),
            Self::MessageTooLong { size, max_size } => {
                write!(f, "Message too long: {size} > {max_size}")
            }
            Self::FrameTooLong { size, max_size } => {
                write!(f, "Frame too long: {size} > {max_size}")
            }
        }
    }
}

impl fmt::Display for CapacityError {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl std::error::Error for CapacityError {}
