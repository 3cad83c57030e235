//! Frame codec.
//!
//! Every message travels in a frame made of a fixed 9-byte header followed by a
//! body of `length` bytes:
//!
//! ```text
//! 0         1         2         4         5         9
//! +---------+---------+---------+---------+---------+----------
//! | version |  flags  | stream  | opcode  | length  |  body ...
//! +---------+---------+---------+---------+---------+----------
//! ```
//!
//! The high bit of `version` marks the direction (set on responses), `stream` is
//! a signed connection-scoped id and `length` is the size of the (possibly
//! compressed) body.
use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::compression::{Compression, CompressionError};

pub const PROTOCOL_VERSION: u8 = 0x04;
pub const RESPONSE_DIRECTION: u8 = 0x80;
pub const HEADER_LEN: usize = 9;
pub const DEFAULT_MAX_FRAME_SIZE: usize = 256 * 1024 * 1024;
/// Stream used by the server for pushed events.
pub const EVENT_STREAM_ID: i16 = -1;

pub mod flags {
    pub const COMPRESSION: u8 = 0x01;
    pub const TRACING: u8 = 0x02;
    pub const CUSTOM_PAYLOAD: u8 = 0x04;
    pub const WARNING: u8 = 0x08;
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame truncated: expected {expected} bytes, found {found}")]
    Truncated { expected: usize, found: usize },

    #[error("unsupported protocol version {0:#04x}")]
    Version(u8),

    #[error("unknown opcode {0:#04x}")]
    Opcode(u8),

    #[error("frame body of {size} bytes exceeds the maximum of {max} bytes")]
    TooLarge { size: usize, max: usize },

    #[error("failed to (de)compress frame body: {0}")]
    Compression(#[from] CompressionError),

    #[error("malformed frame body: {0}")]
    Body(String),

    #[error("frame IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Error,
    Startup,
    Ready,
    Authenticate,
    Options,
    Supported,
    Query,
    Result,
    Prepare,
    Execute,
    Register,
    Event,
    Batch,
    AuthChallenge,
    AuthResponse,
    AuthSuccess,
}

impl TryFrom<u8> for Opcode {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, FrameError> {
        Ok(match value {
            0x00 => Opcode::Error,
            0x01 => Opcode::Startup,
            0x02 => Opcode::Ready,
            0x03 => Opcode::Authenticate,
            0x05 => Opcode::Options,
            0x06 => Opcode::Supported,
            0x07 => Opcode::Query,
            0x08 => Opcode::Result,
            0x09 => Opcode::Prepare,
            0x0A => Opcode::Execute,
            0x0B => Opcode::Register,
            0x0C => Opcode::Event,
            0x0D => Opcode::Batch,
            0x0E => Opcode::AuthChallenge,
            0x0F => Opcode::AuthResponse,
            0x10 => Opcode::AuthSuccess,
            other => return Err(FrameError::Opcode(other)),
        })
    }
}

impl From<Opcode> for u8 {
    fn from(value: Opcode) -> Self {
        match value {
            Opcode::Error => 0x00,
            Opcode::Startup => 0x01,
            Opcode::Ready => 0x02,
            Opcode::Authenticate => 0x03,
            Opcode::Options => 0x05,
            Opcode::Supported => 0x06,
            Opcode::Query => 0x07,
            Opcode::Result => 0x08,
            Opcode::Prepare => 0x09,
            Opcode::Execute => 0x0A,
            Opcode::Register => 0x0B,
            Opcode::Event => 0x0C,
            Opcode::Batch => 0x0D,
            Opcode::AuthChallenge => 0x0E,
            Opcode::AuthResponse => 0x0F,
            Opcode::AuthSuccess => 0x10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u8,
    pub flags: u8,
    pub stream: i16,
    pub opcode: Opcode,
    pub length: u32,
}

impl FrameHeader {
    pub fn parse(raw: &[u8]) -> Result<Self, FrameError> {
        if raw.len() < HEADER_LEN {
            return Err(FrameError::Truncated {
                expected: HEADER_LEN,
                found: raw.len(),
            });
        }
        let version = raw[0];
        if version & !RESPONSE_DIRECTION != PROTOCOL_VERSION {
            return Err(FrameError::Version(version));
        }
        Ok(Self {
            version,
            flags: raw[1],
            stream: i16::from_be_bytes([raw[2], raw[3]]),
            opcode: raw[4].try_into()?,
            length: u32::from_be_bytes([raw[5], raw[6], raw[7], raw[8]]),
        })
    }

    pub fn is_response(&self) -> bool {
        self.version & RESPONSE_DIRECTION != 0
    }

    fn put(&self, dst: &mut BytesMut) {
        dst.put_u8(self.version);
        dst.put_u8(self.flags);
        dst.put_i16(self.stream);
        dst.put_u8(self.opcode.into());
        dst.put_u32(self.length);
    }
}

/// A decoded frame; `body` is always uncompressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub body: Bytes,
}

impl Frame {
    pub fn stream(&self) -> i16 {
        self.header.stream
    }

    pub fn opcode(&self) -> Opcode {
        self.header.opcode
    }

    pub fn is_error(&self) -> bool {
        self.header.opcode == Opcode::Error
    }
}

/// Encoder/decoder bound to the compression negotiated on one connection.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    compression: Compression,
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new(compression: Compression, max_frame_size: usize) -> Self {
        Self {
            compression,
            max_frame_size,
        }
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    pub fn encode_request(
        &self,
        stream: i16,
        opcode: Opcode,
        flags: u8,
        body: &[u8],
    ) -> Result<Bytes, FrameError> {
        self.encode(PROTOCOL_VERSION, stream, opcode, flags, body)
    }

    pub fn encode_response(
        &self,
        stream: i16,
        opcode: Opcode,
        flags: u8,
        body: &[u8],
    ) -> Result<Bytes, FrameError> {
        self.encode(PROTOCOL_VERSION | RESPONSE_DIRECTION, stream, opcode, flags, body)
    }

    fn encode(
        &self,
        version: u8,
        stream: i16,
        opcode: Opcode,
        mut flags: u8,
        body: &[u8],
    ) -> Result<Bytes, FrameError> {
        let compressed;
        let body = if self.compression.is_enabled() && !body.is_empty() {
            flags |= flags::COMPRESSION;
            compressed = self.compression.compress(body)?;
            compressed.as_slice()
        } else {
            flags &= !flags::COMPRESSION;
            body
        };
        if body.len() > self.max_frame_size {
            return Err(FrameError::TooLarge {
                size: body.len(),
                max: self.max_frame_size,
            });
        }

        let header = FrameHeader {
            version,
            flags,
            stream,
            opcode,
            length: body.len() as u32,
        };
        let mut dst = BytesMut::with_capacity(HEADER_LEN + body.len());
        header.put(&mut dst);
        dst.put_slice(body);
        Ok(dst.freeze())
    }

    /// Check a freshly read header before its body is pulled off the wire.
    pub fn check_length(&self, header: &FrameHeader) -> Result<(), FrameError> {
        let size = header.length as usize;
        if size > self.max_frame_size {
            return Err(FrameError::TooLarge {
                size,
                max: self.max_frame_size,
            });
        }
        Ok(())
    }

    /// Finish decoding a frame whose header and raw body were already read.
    pub fn decode(&self, mut header: FrameHeader, body: Bytes) -> Result<Frame, FrameError> {
        self.check_length(&header)?;
        if body.len() != header.length as usize {
            return Err(FrameError::Truncated {
                expected: header.length as usize,
                found: body.len(),
            });
        }
        let body = if header.flags & flags::COMPRESSION != 0 {
            if !self.compression.is_enabled() {
                return Err(FrameError::Body(
                    "compressed frame on a connection without compression".into(),
                ));
            }
            header.flags &= !flags::COMPRESSION;
            let inflated = self
                .compression
                .decompress(&body, self.max_frame_size)
                .map_err(|e| match e {
                    CompressionError::TooLarge { size, max } => FrameError::TooLarge { size, max },
                    e => FrameError::Compression(e),
                })?;
            Bytes::from(inflated)
        } else {
            body
        };
        Ok(Frame { header, body })
    }

    /// Decode one complete frame held in `raw`.
    pub fn decode_bytes(&self, raw: &[u8]) -> Result<Frame, FrameError> {
        let header = FrameHeader::parse(raw)?;
        let end = HEADER_LEN + header.length as usize;
        if raw.len() < end {
            return Err(FrameError::Truncated {
                expected: end,
                found: raw.len(),
            });
        }
        self.decode(header, Bytes::copy_from_slice(&raw[HEADER_LEN..end]))
    }
}
