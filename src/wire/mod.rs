use bytes::Bytes;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{self, Framed};

pub mod decoder;
pub mod encoder;
pub mod protocol;

/// Default cap on a single frame's payload. Scene bundles routinely run to
/// hundreds of megabytes, so this is deliberately generous.
pub const DEFAULT_MAX_FRAME: u32 = 1 << 30;

pub fn framed<T: AsyncRead + AsyncWrite>(stream: T) -> Framed<T, Codec> {
    Framed::new(stream, Default::default())
}

pub fn framed_with_limit<T: AsyncRead + AsyncWrite>(
    stream: T,
    max_frame: u32,
) -> Framed<T, Codec> {
    Framed::new(stream, Codec::with_limit(max_frame))
}

#[derive(Default)]
pub struct Codec {
    d: decoder::Decoder,
    e: encoder::Encoder,
}

impl Codec {
    pub fn with_limit(max_frame: u32) -> Self {
        Self {
            d: decoder::Decoder::with_limit(max_frame),
            e: Default::default(),
        }
    }
}

impl codec::Decoder for Codec {
    type Item = Bytes;

    type Error = decoder::Error;

    fn decode(
        &mut self,
        src: &mut bytes::BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        self.d.decode(src)
    }
}

impl<M: Serialize> codec::Encoder<M> for Codec {
    type Error = encoder::Error;

    fn encode(
        &mut self,
        item: M,
        dst: &mut bytes::BytesMut,
    ) -> Result<(), Self::Error> {
        self.e.encode(item, dst)
    }
}
