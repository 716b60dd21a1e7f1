//! tonic codec that moves requests as raw bytes.
//!
//! Decoding only splits the frame off the transport buffer; nothing is parsed
//! until a component reads the request. Encoding writes the cached bytes of
//! clean requests unchanged.

use std::marker::PhantomData;

use bytes::{Buf, BufMut, Bytes};
use prost::DecodeError;
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::Status;

use super::{DataRequest, DataRequestList};

/// Messages the codec can write.
pub trait WireEncode {
    fn encode_wire(&self, dst: &mut impl BufMut);
}

/// Messages the codec can read.
pub trait WireDecode: Sized {
    fn decode_wire(buf: Bytes) -> Result<Self, DecodeError>;
}

impl WireEncode for DataRequest {
    fn encode_wire(&self, dst: &mut impl BufMut) {
        self.encode_to(dst)
    }
}

impl WireDecode for DataRequest {
    fn decode_wire(buf: Bytes) -> Result<Self, DecodeError> {
        Ok(DataRequest::from_bytes(buf))
    }
}

impl WireEncode for DataRequestList {
    fn encode_wire(&self, dst: &mut impl BufMut) {
        self.encode_to(dst)
    }
}

impl WireDecode for DataRequestList {
    fn decode_wire(buf: Bytes) -> Result<Self, DecodeError> {
        DataRequestList::from_bytes(buf)
    }
}

#[derive(Debug)]
pub struct LazyCodec<E, D> {
    _marker: PhantomData<(E, D)>,
}

impl<E, D> Default for LazyCodec<E, D> {
    fn default() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<E, D> Codec for LazyCodec<E, D>
where
    E: WireEncode + Send + 'static,
    D: WireDecode + Send + 'static,
{
    type Encode = E;
    type Decode = D;
    type Encoder = LazyEncoder<E>;
    type Decoder = LazyDecoder<D>;

    fn encoder(&mut self) -> Self::Encoder {
        LazyEncoder(PhantomData)
    }

    fn decoder(&mut self) -> Self::Decoder {
        LazyDecoder(PhantomData)
    }
}

#[derive(Debug)]
pub struct LazyEncoder<E>(PhantomData<E>);

impl<E: WireEncode> Encoder for LazyEncoder<E> {
    type Item = E;
    type Error = Status;

    fn encode(&mut self, item: E, dst: &mut EncodeBuf<'_>) -> Result<(), Status> {
        item.encode_wire(dst);
        Ok(())
    }
}

#[derive(Debug)]
pub struct LazyDecoder<D>(PhantomData<D>);

impl<D: WireDecode> Decoder for LazyDecoder<D> {
    type Item = D;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<D>, Status> {
        let frame = src.copy_to_bytes(src.remaining());
        D::decode_wire(frame)
            .map(Some)
            .map_err(|e| Status::invalid_argument(format!("malformed message: {e}")))
    }
}
