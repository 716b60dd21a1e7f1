//! Documents as the gateway sees them: the few fields it reads, plus every
//! other field kept as the bytes it arrived with.

use std::ops::{Deref, DerefMut};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use prost::encoding::{decode_varint, encode_key, encode_varint, DecodeContext, WireType};
use prost::{DecodeError, Message};

use crate::proto::DocumentProto;

/// Highest field number `DocumentProto` declares.
const MAX_KNOWN_TAG: u32 = 5;

/// A `DocumentProto` that re-emits undeclared fields verbatim, so embeddings,
/// tensors and matches pass through a re-encode untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
    proto: DocumentProto,
    unknown: Bytes,
}

impl Document {
    /// Encoded fields this build does not declare.
    pub fn unknown_fields(&self) -> &Bytes {
        &self.unknown
    }
}

impl From<DocumentProto> for Document {
    fn from(proto: DocumentProto) -> Self {
        Self {
            proto,
            unknown: Bytes::new(),
        }
    }
}

impl Deref for Document {
    type Target = DocumentProto;

    fn deref(&self) -> &DocumentProto {
        &self.proto
    }
}

impl DerefMut for Document {
    fn deref_mut(&mut self) -> &mut DocumentProto {
        &mut self.proto
    }
}

impl Message for Document {
    fn encode_raw(&self, buf: &mut impl BufMut) {
        self.proto.encode_raw(buf);
        buf.put_slice(&self.unknown);
    }

    fn merge_field(
        &mut self,
        tag: u32,
        wire_type: WireType,
        buf: &mut impl Buf,
        ctx: DecodeContext,
    ) -> Result<(), DecodeError> {
        if tag <= MAX_KNOWN_TAG {
            return self.proto.merge_field(tag, wire_type, buf, ctx);
        }
        let mut raw = BytesMut::from(&self.unknown[..]);
        encode_key(tag, wire_type, &mut raw);
        match wire_type {
            WireType::Varint => encode_varint(decode_varint(buf)?, &mut raw),
            WireType::SixtyFourBit => copy_exact(buf, 8, &mut raw)?,
            WireType::ThirtyTwoBit => copy_exact(buf, 4, &mut raw)?,
            WireType::LengthDelimited => {
                let len = decode_varint(buf)?;
                encode_varint(len, &mut raw);
                copy_exact(buf, len as usize, &mut raw)?;
            }
            WireType::StartGroup | WireType::EndGroup => {
                return Err(DecodeError::new("groups are not supported"))
            }
        }
        self.unknown = raw.freeze();
        Ok(())
    }

    fn encoded_len(&self) -> usize {
        self.proto.encoded_len() + self.unknown.len()
    }

    fn clear(&mut self) {
        self.proto.clear();
        self.unknown = Bytes::new();
    }
}

fn copy_exact(buf: &mut impl Buf, len: usize, dst: &mut BytesMut) -> Result<(), DecodeError> {
    if buf.remaining() < len {
        return Err(DecodeError::new("buffer underflow"));
    }
    dst.put(buf.take(len));
    Ok(())
}
