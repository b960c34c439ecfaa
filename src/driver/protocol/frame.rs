//! Frame header and frame encoding
//!
//! Every frame is a fixed 9-byte header followed by `length` body bytes:
//!
//! ```text
//! 0         1         2         4         5                   9
//! +---------+---------+---------+---------+-------------------+
//! | version |  flags  | stream  | opcode  |      length       |
//! +---------+---------+---------+---------+-------------------+
//! ```
//!
//! The header and the body are always read separately; a header never
//! implies that its body has already arrived.

use bytes::{BufMut, Bytes, BytesMut};

use super::types::{Opcode, RESPONSE_FLAG};
use crate::error::{DriverError, DriverResult};

/// Size of the fixed frame header.
pub const HEADER_SIZE: usize = 9;

/// Maximum body size accepted in either direction (256 MiB).
pub const MAX_FRAME_BODY: usize = 256 * 1024 * 1024;

pub const FLAG_COMPRESSION: u8 = 0x01;
pub const FLAG_TRACING: u8 = 0x02;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Raw version byte, including the response direction bit.
    pub version: u8,
    pub flags: u8,
    pub stream: i16,
    pub opcode: Opcode,
    pub length: u32,
}

impl FrameHeader {
    /// Protocol version with the direction bit masked off.
    pub fn protocol_version(&self) -> u8 {
        self.version & !RESPONSE_FLAG
    }

    pub fn is_response(&self) -> bool {
        self.version & RESPONSE_FLAG != 0
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u8(self.version);
        buf.put_u8(self.flags);
        buf.put_i16(self.stream);
        buf.put_u8(self.opcode.as_u8());
        buf.put_u32(self.length);
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0] = self.version;
        out[1] = self.flags;
        out[2..4].copy_from_slice(&self.stream.to_be_bytes());
        out[4] = self.opcode.as_u8();
        out[5..9].copy_from_slice(&self.length.to_be_bytes());
        out
    }

    /// Decode a header from the first 9 bytes of `data`.
    pub fn decode(data: &[u8]) -> DriverResult<Self> {
        if data.len() < HEADER_SIZE {
            return Err(DriverError::TruncatedData {
                needed: HEADER_SIZE,
                available: data.len(),
            });
        }
        Ok(Self {
            version: data[0],
            flags: data[1],
            stream: i16::from_be_bytes([data[2], data[3]]),
            opcode: Opcode::from(data[4]),
            length: u32::from_be_bytes([data[5], data[6], data[7], data[8]]),
        })
    }

    pub fn body_len(&self) -> usize {
        self.length as usize
    }
}

/// A header plus its opaque body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    header: FrameHeader,
    body: Bytes,
}

impl Frame {
    /// Build a request frame. The header length is taken from `body`.
    pub fn request(
        version: u8,
        stream: i16,
        opcode: Opcode,
        body: impl Into<Bytes>,
    ) -> DriverResult<Self> {
        Self::with_flags(version & !RESPONSE_FLAG, 0, stream, opcode, body)
    }

    /// Build a frame with an explicit raw version byte and flags.
    pub fn with_flags(
        version: u8,
        flags: u8,
        stream: i16,
        opcode: Opcode,
        body: impl Into<Bytes>,
    ) -> DriverResult<Self> {
        let body = body.into();
        if body.len() > MAX_FRAME_BODY {
            return Err(DriverError::ValueTooLarge {
                len: body.len(),
                max: MAX_FRAME_BODY,
            });
        }
        Ok(Self {
            header: FrameHeader {
                version,
                flags,
                stream,
                opcode,
                length: body.len() as u32,
            },
            body,
        })
    }

    /// Pair a decoded header with the body read after it.
    pub fn from_parts(header: FrameHeader, body: Bytes) -> DriverResult<Self> {
        if body.len() != header.body_len() {
            return Err(DriverError::TruncatedData {
                needed: header.body_len(),
                available: body.len(),
            });
        }
        Ok(Self { header, body })
    }

    pub fn header(&self) -> &FrameHeader {
        &self.header
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn into_body(self) -> Bytes {
        self.body
    }

    pub fn stream(&self) -> i16 {
        self.header.stream
    }

    pub fn opcode(&self) -> Opcode {
        self.header.opcode
    }

    /// Re-stamp the stream id; the writer assigns it at send time.
    pub fn set_stream(&mut self, stream: i16) {
        self.header.stream = stream;
    }

    pub fn encode(&self) -> Bytes {
        debug_assert_eq!(self.header.body_len(), self.body.len());
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.body.len());
        self.header.encode_into(&mut buf);
        buf.put_slice(&self.body);
        buf.freeze()
    }
}
