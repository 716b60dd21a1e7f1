//! The request type every component passes around.
//!
//! A [`DataRequest`] holds the bytes it arrived with and only decodes them
//! when somebody reads a field. Reading never dirties a request; taking
//! [`DataRequest::body_mut`] does, and only dirty requests are re-encoded on
//! the way out. Route records are the one mutation that keeps a request
//! clean: they are appended to the encoded form as extra occurrences of the
//! repeated `routes` field, which protobuf parsers concatenate.

pub mod codec;
pub mod document;
pub mod envelope;
pub mod json;
pub mod routes;

use std::fmt;
use std::sync::OnceLock;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use prost::encoding::{decode_key, decode_varint, WireType};
use prost::{DecodeError, Message};
use prost_types::Struct;

use crate::error::{GatewayError, Result};
use crate::proto::{HeaderProto, RouteProto, StatusCode, StatusProto};

pub use document::Document;

/// Endpoint of requests that do not name one.
pub const DEFAULT_ENDPOINT: &str = "/default";

const ROUTES_TAG: u32 = 4;
const MAX_KNOWN_TAG: u32 = 7;

/// Decoded view of `jina.DataRequestProto`.
#[derive(Clone, PartialEq, Message)]
pub struct DataRequestBody {
    #[prost(message, optional, tag = "1")]
    pub header: Option<HeaderProto>,
    #[prost(message, optional, tag = "2")]
    pub parameters: Option<Struct>,
    #[prost(message, repeated, tag = "3")]
    pub data: Vec<Document>,
    #[prost(message, repeated, tag = "4")]
    pub routes: Vec<RouteProto>,
    #[prost(message, optional, tag = "5")]
    pub status: Option<StatusProto>,
    #[prost(string, tag = "6")]
    pub target_executor: String,
    #[prost(string, tag = "7")]
    pub exec_endpoint: String,
}

impl DataRequestBody {
    pub fn request_id(&self) -> &str {
        self.header.as_ref().map_or("", |h| h.request_id.as_str())
    }

    pub fn set_request_id(&mut self, id: impl Into<String>) {
        self.header.get_or_insert_with(Default::default).request_id = id.into();
    }

    pub fn status_code(&self) -> StatusCode {
        self.status.as_ref().map_or(StatusCode::Success, StatusProto::code)
    }

    pub fn is_error(&self) -> bool {
        self.status.as_ref().is_some_and(StatusProto::is_error)
    }

    pub fn parameters_mut(&mut self) -> &mut Struct {
        self.parameters.get_or_insert_with(Default::default)
    }
}

#[derive(Clone)]
struct Decoded {
    body: DataRequestBody,
    /// Top-level fields this build does not know, re-emitted verbatim.
    unknown: Bytes,
}

#[derive(Clone)]
pub struct DataRequest {
    buf: Bytes,
    /// Route records appended while clean, already encoded as field 4.
    tail: BytesMut,
    decoded: OnceLock<Decoded>,
    dirty: bool,
}

impl DataRequest {
    /// Wraps an encoded `DataRequestProto` without decoding it.
    pub fn from_bytes(buf: Bytes) -> Self {
        Self {
            buf,
            tail: BytesMut::new(),
            decoded: OnceLock::new(),
            dirty: false,
        }
    }

    pub fn from_body(body: DataRequestBody) -> Self {
        Self {
            buf: Bytes::new(),
            tail: BytesMut::new(),
            decoded: OnceLock::from(Decoded {
                body,
                unknown: Bytes::new(),
            }),
            dirty: true,
        }
    }

    pub fn new(exec_endpoint: impl Into<String>) -> Self {
        Self::from_body(DataRequestBody {
            exec_endpoint: exec_endpoint.into(),
            ..Default::default()
        })
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn decoded(&self) -> std::result::Result<&Decoded, DecodeError> {
        if let Some(decoded) = self.decoded.get() {
            return Ok(decoded);
        }
        let mut body = DataRequestBody::decode(self.buf.clone())?;
        if !self.tail.is_empty() {
            body.merge(&self.tail[..])?;
        }
        let unknown = unknown_fields(&self.buf)?;
        Ok(self.decoded.get_or_init(|| Decoded { body, unknown }))
    }

    pub fn body(&self) -> Result<&DataRequestBody> {
        Ok(&self.decoded()?.body)
    }

    /// Mutable access. From here on the request is re-encoded when sent.
    pub fn body_mut(&mut self) -> Result<&mut DataRequestBody> {
        self.decoded()?;
        self.dirty = true;
        self.buf = Bytes::new();
        self.tail.clear();
        self.decoded
            .get_mut()
            .map(|decoded| &mut decoded.body)
            .ok_or_else(|| GatewayError::Internal("request body vanished after decode".into()))
    }

    pub fn into_body(mut self) -> Result<DataRequestBody> {
        self.decoded()?;
        self.decoded
            .take()
            .map(|decoded| decoded.body)
            .ok_or_else(|| GatewayError::Internal("request body vanished after decode".into()))
    }

    /// Appends a route record. Clean requests stay clean.
    pub fn add_route(&mut self, route: RouteProto) {
        if self.dirty {
            if let Some(decoded) = self.decoded.get_mut() {
                decoded.body.routes.push(route);
            }
            return;
        }
        prost::encoding::message::encode(ROUTES_TAG, &route, &mut self.tail);
        if let Some(decoded) = self.decoded.get_mut() {
            decoded.body.routes.push(route);
        }
    }

    /// Size of the encoded form; the cached buffer's size while clean.
    pub fn encoded_len(&self) -> usize {
        if !self.dirty {
            return self.buf.len() + self.tail.len();
        }
        match self.decoded.get() {
            Some(decoded) => decoded.body.encoded_len() + decoded.unknown.len(),
            None => 0,
        }
    }

    pub fn encode_to(&self, dst: &mut impl BufMut) {
        if !self.dirty {
            dst.put_slice(&self.buf);
            dst.put_slice(&self.tail);
            return;
        }
        if let Some(decoded) = self.decoded.get() {
            // encode_raw cannot fail on length, unlike encode
            decoded.body.encode_raw(dst);
            dst.put_slice(&decoded.unknown);
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        if !self.dirty && self.tail.is_empty() {
            return self.buf.clone();
        }
        let mut out = BytesMut::with_capacity(self.encoded_len());
        self.encode_to(&mut out);
        out.freeze()
    }

    pub fn request_id(&self) -> Result<&str> {
        Ok(self.body()?.request_id())
    }

    pub fn exec_endpoint(&self) -> Result<&str> {
        let endpoint = self.body()?.exec_endpoint.as_str();
        Ok(if endpoint.is_empty() {
            DEFAULT_ENDPOINT
        } else {
            endpoint
        })
    }

    pub fn is_error(&self) -> Result<bool> {
        Ok(self.body()?.is_error())
    }

    /// Assigns a fresh UUIDv4 id when the client sent none, and returns the id.
    pub fn ensure_request_id(&mut self) -> Result<String> {
        let current = self.request_id()?;
        if !current.is_empty() {
            return Ok(current.to_string());
        }
        let id = uuid::Uuid::new_v4().simple().to_string();
        self.body_mut()?.set_request_id(id.clone());
        Ok(id)
    }

    /// A request carrying only `status`, used to answer for requests that
    /// never completed.
    pub fn failed(request_id: &str, exec_endpoint: &str, status: StatusProto) -> Self {
        let mut body = DataRequestBody {
            exec_endpoint: exec_endpoint.to_string(),
            status: Some(status),
            ..Default::default()
        };
        body.set_request_id(request_id);
        Self::from_body(body)
    }
}

impl Default for DataRequest {
    fn default() -> Self {
        Self::from_body(DataRequestBody::default())
    }
}

impl From<DataRequestBody> for DataRequest {
    fn from(body: DataRequestBody) -> Self {
        Self::from_body(body)
    }
}

impl fmt::Debug for DataRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("DataRequest");
        s.field("len", &self.encoded_len()).field("dirty", &self.dirty);
        if let Some(decoded) = self.decoded.get() {
            s.field("request_id", &decoded.body.request_id())
                .field("exec_endpoint", &decoded.body.exec_endpoint)
                .field("docs", &decoded.body.data.len())
                .field("routes", &decoded.body.routes.len());
        }
        s.finish()
    }
}

/// `jina.DataRequestListProto`, the join matrix sent to reducer executors.
#[derive(Debug, Clone, Default)]
pub struct DataRequestList {
    pub requests: Vec<DataRequest>,
}

impl DataRequestList {
    pub fn new(requests: Vec<DataRequest>) -> Self {
        Self { requests }
    }

    pub fn encoded_len(&self) -> usize {
        self.requests
            .iter()
            .map(|r| {
                let len = r.encoded_len();
                prost::encoding::key_len(1) + prost::encoding::encoded_len_varint(len as u64) + len
            })
            .sum()
    }

    pub fn encode_to(&self, dst: &mut impl BufMut) {
        for request in &self.requests {
            prost::encoding::encode_key(1, WireType::LengthDelimited, dst);
            prost::encoding::encode_varint(request.encoded_len() as u64, dst);
            request.encode_to(dst);
        }
    }

    /// Splits the list into lazily decoded requests without copying them.
    pub fn from_bytes(buf: Bytes) -> std::result::Result<Self, DecodeError> {
        let mut requests = Vec::new();
        let mut cursor = &buf[..];
        while cursor.has_remaining() {
            let (tag, wire_type) = decode_key(&mut cursor)?;
            if tag == 1 && wire_type == WireType::LengthDelimited {
                let len = decode_varint(&mut cursor)? as usize;
                if len > cursor.len() {
                    return Err(DecodeError::new("buffer underflow"));
                }
                let start = buf.len() - cursor.len();
                requests.push(DataRequest::from_bytes(buf.slice(start..start + len)));
                cursor.advance(len);
            } else {
                skip(wire_type, &mut cursor)?;
            }
        }
        Ok(Self { requests })
    }
}

/// Collects every top-level field whose tag the body does not declare.
fn unknown_fields(buf: &[u8]) -> std::result::Result<Bytes, DecodeError> {
    let mut unknown = BytesMut::new();
    let mut cursor = buf;
    while cursor.has_remaining() {
        let field_start = buf.len() - cursor.len();
        let (tag, wire_type) = decode_key(&mut cursor)?;
        skip(wire_type, &mut cursor)?;
        if tag > MAX_KNOWN_TAG {
            unknown.put_slice(&buf[field_start..buf.len() - cursor.len()]);
        }
    }
    Ok(unknown.freeze())
}

fn skip(wire_type: WireType, cursor: &mut &[u8]) -> std::result::Result<(), DecodeError> {
    let len = match wire_type {
        WireType::Varint => {
            decode_varint(cursor)?;
            0
        }
        WireType::SixtyFourBit => 8,
        WireType::ThirtyTwoBit => 4,
        WireType::LengthDelimited => decode_varint(cursor)? as usize,
        WireType::StartGroup | WireType::EndGroup => {
            return Err(DecodeError::new("groups are not supported"))
        }
    };
    if len > cursor.len() {
        return Err(DecodeError::new("buffer underflow"));
    }
    cursor.advance(len);
    Ok(())
}
