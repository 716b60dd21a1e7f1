use std::io::{Read, Write};

use byteorder::{ByteOrder, LittleEndian};
use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::error::{GatewayError, Result};

pub const MAGIC: u8 = 0xf6;
pub const VERSION: u8 = 1;
pub const HEADER_LEN: usize = 8;

/// Framing of a binary WebSocket message:
///
/// ```text
/// 0       1         2           3       4               8
/// | magic | version | algorithm | flags | body len (LE) | body ...
/// ```
///
/// The body is a `DataRequestProto` compressed with `algorithm`. The sender
/// picks the algorithm; there is no negotiation.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Algorithm {
    #[default]
    None = 0,
    Gzip = 1,
    Lz4 = 2,
    Zstd = 3,
}

impl TryFrom<u8> for Algorithm {
    type Error = GatewayError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Algorithm::None),
            1 => Ok(Algorithm::Gzip),
            2 => Ok(Algorithm::Lz4),
            3 => Ok(Algorithm::Zstd),
            other => Err(GatewayError::BadRequest(format!(
                "unknown envelope compression {other}"
            ))),
        }
    }
}

impl std::str::FromStr for Algorithm {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "" => Ok(Algorithm::None),
            "gzip" => Ok(Algorithm::Gzip),
            "lz4" => Ok(Algorithm::Lz4),
            "zstd" => Ok(Algorithm::Zstd),
            other => Err(GatewayError::BadRequest(format!(
                "unknown envelope compression `{other}`"
            ))),
        }
    }
}

/// Reserved header flag bits. Unknown bits are ignored on read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags(u8);

impl Flags {
    pub fn byte(&self) -> u8 {
        self.0
    }
}

impl From<u8> for Flags {
    fn from(byte: u8) -> Self {
        Self(byte)
    }
}

pub fn encode(body: &[u8], algorithm: Algorithm) -> Result<Vec<u8>> {
    let compressed = match algorithm {
        Algorithm::None => body.to_vec(),
        Algorithm::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(body)?;
            encoder.finish()?
        }
        Algorithm::Lz4 => lz4_flex::compress_prepend_size(body),
        Algorithm::Zstd => zstd::stream::encode_all(body, 0)?,
    };
    let len = u32::try_from(compressed.len()).map_err(|_| {
        GatewayError::ResourceExhausted(format!(
            "message of {} bytes does not fit an envelope",
            compressed.len()
        ))
    })?;

    let mut out = vec![0u8; HEADER_LEN];
    out[0] = MAGIC;
    out[1] = VERSION;
    out[2] = algorithm as u8;
    out[3] = Flags::default().byte();
    LittleEndian::write_u32(&mut out[4..8], len);
    out.extend_from_slice(&compressed);
    Ok(out)
}

/// Returns the decompressed body and the algorithm the sender used.
pub fn decode(frame: &[u8]) -> Result<(Bytes, Algorithm)> {
    if frame.len() < HEADER_LEN {
        return Err(GatewayError::BadRequest(format!(
            "envelope of {} bytes is shorter than its header",
            frame.len()
        )));
    }
    if frame[0] != MAGIC {
        return Err(GatewayError::BadRequest("not an envelope".into()));
    }
    if frame[1] != VERSION {
        return Err(GatewayError::BadRequest(format!(
            "unsupported envelope version {}",
            frame[1]
        )));
    }
    let algorithm = Algorithm::try_from(frame[2])?;
    let len = LittleEndian::read_u32(&frame[4..8]) as usize;
    let body = &frame[HEADER_LEN..];
    if body.len() != len {
        return Err(GatewayError::BadRequest(format!(
            "envelope announces {len} bytes but carries {}",
            body.len()
        )));
    }

    let decompressed = match algorithm {
        Algorithm::None => body.to_vec(),
        Algorithm::Gzip => {
            let mut out = Vec::new();
            GzDecoder::new(body)
                .read_to_end(&mut out)
                .map_err(|e| GatewayError::BadRequest(format!("bad gzip body: {e}")))?;
            out
        }
        Algorithm::Lz4 => lz4_flex::decompress_size_prepended(body)
            .map_err(|e| GatewayError::BadRequest(format!("bad lz4 body: {e}")))?,
        Algorithm::Zstd => zstd::stream::decode_all(body)
            .map_err(|e| GatewayError::BadRequest(format!("bad zstd body: {e}")))?,
    };
    Ok((Bytes::from(decompressed), algorithm))
}
