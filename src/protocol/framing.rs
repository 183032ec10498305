//! Request/response framing strategies.
//!
//! A connection picks one [`Framing`] at handshake time and keeps it for its
//! whole lifetime. [`WireCodec`] adapts the chosen strategy to
//! `tokio_util::codec` so partial reads are buffered across polls.
//!
//! ```text
//! JSON:   [token: i64 LE][len: u32 LE][payload]
//! Packed: [len: u32 LE][token: i64 LE][payload: len - 8]
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::protocol::message::Response;

const TOKEN_LEN: usize = 8;
const SIZE_LEN: usize = 4;

/// Errors produced while framing requests or responses.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame of {len} bytes exceeds maximum of {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("failed to encode response: {0}")]
    Encode(#[from] serde_json::Error),
}

/// One framed request, payload not yet parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRequest {
    pub token: i64,
    pub payload: Bytes,
}

/// Strategy for splitting a byte stream into requests and writing responses.
pub trait Framing: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Try to take one request off the front of `src`.
    ///
    /// Returns `Ok(None)` when more bytes are needed. Must not consume
    /// anything from `src` in that case.
    fn decode_frame(&self, src: &mut BytesMut, max_size: usize)
        -> Result<Option<RawRequest>, WireError>;

    fn encode_frame(&self, token: i64, payload: &[u8], dst: &mut BytesMut)
        -> Result<(), WireError>;
}

fn payload_len(len: usize) -> Result<u32, WireError> {
    u32::try_from(len).map_err(|_| WireError::FrameTooLarge {
        len,
        max: u32::MAX as usize,
    })
}

/// Token-first framing used by the JSON wire format.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonFraming;

impl Framing for JsonFraming {
    fn name(&self) -> &'static str {
        "json"
    }

    fn decode_frame(
        &self,
        src: &mut BytesMut,
        max_size: usize,
    ) -> Result<Option<RawRequest>, WireError> {
        const HEADER: usize = TOKEN_LEN + SIZE_LEN;
        if src.len() < HEADER {
            return Ok(None);
        }

        let mut header = &src[..HEADER];
        let token = header.get_i64_le();
        let len = header.get_u32_le() as usize;
        if len > max_size {
            return Err(WireError::FrameTooLarge { len, max: max_size });
        }
        if src.len() < HEADER + len {
            src.reserve(HEADER + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER);
        let payload = src.split_to(len).freeze();
        Ok(Some(RawRequest { token, payload }))
    }

    fn encode_frame(&self, token: i64, payload: &[u8], dst: &mut BytesMut) -> Result<(), WireError> {
        let len = payload_len(payload.len())?;
        dst.reserve(TOKEN_LEN + SIZE_LEN + payload.len());
        dst.put_i64_le(token);
        dst.put_u32_le(len);
        dst.put_slice(payload);
        Ok(())
    }
}

/// Size-first framing used by the packed wire format and older protocol versions.
#[derive(Debug, Default, Clone, Copy)]
pub struct PackedFraming;

impl Framing for PackedFraming {
    fn name(&self) -> &'static str {
        "packed"
    }

    fn decode_frame(
        &self,
        src: &mut BytesMut,
        max_size: usize,
    ) -> Result<Option<RawRequest>, WireError> {
        if src.len() < SIZE_LEN {
            return Ok(None);
        }

        let len = (&src[..SIZE_LEN]).get_u32_le() as usize;
        if len < TOKEN_LEN {
            return Err(WireError::Malformed(format!(
                "packed frame of {} bytes is shorter than its token",
                len
            )));
        }
        if len > max_size {
            return Err(WireError::FrameTooLarge { len, max: max_size });
        }
        if src.len() < SIZE_LEN + len {
            src.reserve(SIZE_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(SIZE_LEN);
        let token = src.get_i64_le();
        let payload = src.split_to(len - TOKEN_LEN).freeze();
        Ok(Some(RawRequest { token, payload }))
    }

    fn encode_frame(&self, token: i64, payload: &[u8], dst: &mut BytesMut) -> Result<(), WireError> {
        let len = payload_len(payload.len() + TOKEN_LEN)?;
        dst.reserve(SIZE_LEN + TOKEN_LEN + payload.len());
        dst.put_u32_le(len);
        dst.put_i64_le(token);
        dst.put_slice(payload);
        Ok(())
    }
}

/// Codec for the query phase of a driver connection.
#[derive(Debug)]
pub struct WireCodec {
    framing: Box<dyn Framing>,
    max_size: usize,
}

impl WireCodec {
    pub fn new(framing: Box<dyn Framing>, max_size: usize) -> Self {
        Self { framing, max_size }
    }

    pub fn framing_name(&self) -> &'static str {
        self.framing.name()
    }
}

impl Decoder for WireCodec {
    type Item = RawRequest;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.framing.decode_frame(src, self.max_size)
    }
}

impl Encoder<Response> for WireCodec {
    type Error = WireError;

    fn encode(&mut self, item: Response, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = item.to_json()?;
        self.framing.encode_frame(item.token, &payload, dst)
    }
}
