use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::core::{Error, ENCAPSULATION_HEADER_SIZE};
use crate::encapsulation::header::{self, EncapsulationHeader};

/// Frames encapsulation packets on a TCP byte stream
#[derive(Clone, Default)]
pub struct EncapsulationCodec;

impl EncapsulationCodec {
    /// Creates a new encapsulation codec
    pub fn new() -> Self {
        EncapsulationCodec
    }
}

impl Decoder for EncapsulationCodec {
    type Item = EncapsulationHeader;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < ENCAPSULATION_HEADER_SIZE {
            // Need more data to read the length field
            return Ok(None);
        }

        let length = usize::from((&src[2..4]).get_u16_le());
        let total = ENCAPSULATION_HEADER_SIZE + length;

        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let frame = src.split_to(total);
        let header = header::parse(&frame)?;
        trace!(command = header.command, length, "decoded encapsulation packet");
        Ok(Some(header))
    }
}

impl Encoder<Bytes> for EncapsulationCodec {
    type Error = Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() < ENCAPSULATION_HEADER_SIZE {
            return Err(Error::MalformedHeader(item.len()));
        }
        dst.extend_from_slice(&item);
        Ok(())
    }
}
