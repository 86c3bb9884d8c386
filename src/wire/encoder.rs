use std::{error, fmt, io};

use bytes::BufMut;
use serde::Serialize;

// An encoder producing length-prefixed MessagePack frames.
//
// Anything serde can serialize goes on the wire as `u32 LE length | payload`,
// with struct fields written as string-keyed map entries so the payload stays
// self-describing.
#[derive(Debug, Default)]
pub struct Encoder {}

impl Encoder {
    pub fn encode(
        &mut self,
        item: impl Serialize,
        dst: &mut bytes::BytesMut,
    ) -> Result<(), Error> {
        let payload = rmp_serde::to_vec_named(&item)?;

        let len: u32 = payload
            .len()
            .try_into()
            .map_err(|_| Error::FrameTooLarge(payload.len()))?;

        dst.reserve(4 + payload.len());

        dst.put_u32_le(len);
        dst.extend(payload);

        Ok(())
    }
}

#[derive(Debug)]
pub enum Error {
    FrameTooLarge(usize),
    IO(io::Error),
    Serde(rmp_serde::encode::Error),
}

impl error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FrameTooLarge(len) => {
                write!(f, "payload of {len} bytes does not fit a u32 length")
            },
            Self::IO(e) => write!(f, "{e}"),
            Self::Serde(e) => write!(f, "{e}"),
        }
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Self::IO(value)
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(value: rmp_serde::encode::Error) -> Self {
        Self::Serde(value)
    }
}
