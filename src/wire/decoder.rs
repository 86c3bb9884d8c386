use std::{error, fmt, io};

use bytes::{Buf, Bytes};
use tokio_util::codec;

use super::DEFAULT_MAX_FRAME;

/// A decoder for a stream of length-prefixed frames.
///
/// Each frame is a `u32` little-endian payload length followed by exactly
/// that many payload bytes. The decoder yields the raw payload; interpreting
/// it is the job of [protocol](super::protocol).
///
/// A peer that announces a frame larger than the configured limit is out of
/// contract (or out of sync at the framing level), so an unrecoverable error
/// is returned and the connection should be dropped.
#[derive(Debug)]
pub struct Decoder {
    max_frame: u32,
    state: State,
}

#[derive(Debug)]
enum State {
    ReadLen,
    ReadPayload { len: usize },
}

impl Default for Decoder {
    fn default() -> Self {
        Self::with_limit(DEFAULT_MAX_FRAME)
    }
}

impl Decoder {
    pub fn with_limit(max_frame: u32) -> Self {
        Self {
            max_frame,
            state: State::ReadLen,
        }
    }
}

impl codec::Decoder for Decoder {
    type Item = Bytes;

    type Error = Error;

    fn decode(
        &mut self,
        src: &mut bytes::BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        match self.state {
            State::ReadLen => {
                if src.len() < 4 {
                    return Ok(None);
                }

                // Panic safety: get_u32_le panics unless src.len() >= 4,
                // which we've just asserted.
                let len = src.get_u32_le();

                if len > self.max_frame {
                    return Err(Error::FrameTooLarge {
                        len,
                        max: self.max_frame,
                    });
                }

                let len = len as usize;

                // Reserve up to 16 KiB ahead of time to reduce re-allocations
                // while the payload accumulates; anything larger grows as
                // bytes arrive.
                src.reserve(len.min(16_384));

                self.state = State::ReadPayload { len };

                // The payload may already be buffered, so try again.
                self.decode(src)
            },
            State::ReadPayload { len } => {
                if src.len() < len {
                    return Ok(None);
                }

                self.state = State::ReadLen;

                // Panic safety: split_to panics unless len <= src.len(),
                // which we've just asserted.
                Ok(Some(src.split_to(len).freeze()))
            },
        }
    }
}

#[derive(Debug)]
pub enum Error {
    FrameTooLarge { len: u32, max: u32 },
    IO(io::Error),
}

impl error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FrameTooLarge { len, max } => {
                write!(f, "frame of {len} bytes exceeds limit of {max}")
            },
            Self::IO(e) => write!(f, "{e}"),
        }
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Self::IO(value)
    }
}
