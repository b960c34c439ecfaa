use std::fmt;

use serde::{Deserialize, Serialize};

/// Highest native protocol version this driver speaks.
pub const MAX_SUPPORTED_VERSION: u8 = 4;

/// Lowest native protocol version this driver speaks.
pub const MIN_SUPPORTED_VERSION: u8 = 1;

/// CQL language version advertised in STARTUP when the caller sets none.
pub const DEFAULT_CQL_VERSION: &str = "3.0.0";

/// STARTUP option key carrying the CQL language version.
pub const CQL_VERSION_KEY: &str = "CQL_VERSION";

/// Direction bit set in the version byte of every response frame.
pub const RESPONSE_FLAG: u8 = 0x80;

/// Frame opcodes. Unknown values are carried through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Error,
    Startup,
    Ready,
    Authenticate,
    Credentials,
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
    Other(u8),
}

impl Opcode {
    pub fn as_u8(self) -> u8 {
        match self {
            Opcode::Error => 0x00,
            Opcode::Startup => 0x01,
            Opcode::Ready => 0x02,
            Opcode::Authenticate => 0x03,
            Opcode::Credentials => 0x04,
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
            Opcode::Other(code) => code,
        }
    }
}

impl From<u8> for Opcode {
    fn from(code: u8) -> Self {
        match code {
            0x00 => Opcode::Error,
            0x01 => Opcode::Startup,
            0x02 => Opcode::Ready,
            0x03 => Opcode::Authenticate,
            0x04 => Opcode::Credentials,
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
            other => Opcode::Other(other),
        }
    }
}

impl From<Opcode> for u8 {
    fn from(opcode: Opcode) -> Self {
        opcode.as_u8()
    }
}

/// Consistency level carried by QUERY requests and server error bodies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Consistency {
    Any,
    #[default]
    One,
    Two,
    Three,
    Quorum,
    All,
    LocalQuorum,
    EachQuorum,
    Serial,
    LocalSerial,
    LocalOne,
    Unknown(u16),
}

impl Consistency {
    pub fn as_u16(self) -> u16 {
        match self {
            Consistency::Any => 0x0000,
            Consistency::One => 0x0001,
            Consistency::Two => 0x0002,
            Consistency::Three => 0x0003,
            Consistency::Quorum => 0x0004,
            Consistency::All => 0x0005,
            Consistency::LocalQuorum => 0x0006,
            Consistency::EachQuorum => 0x0007,
            Consistency::Serial => 0x0008,
            Consistency::LocalSerial => 0x0009,
            Consistency::LocalOne => 0x000A,
            Consistency::Unknown(code) => code,
        }
    }
}

impl From<u16> for Consistency {
    fn from(code: u16) -> Self {
        match code {
            0x0000 => Consistency::Any,
            0x0001 => Consistency::One,
            0x0002 => Consistency::Two,
            0x0003 => Consistency::Three,
            0x0004 => Consistency::Quorum,
            0x0005 => Consistency::All,
            0x0006 => Consistency::LocalQuorum,
            0x0007 => Consistency::EachQuorum,
            0x0008 => Consistency::Serial,
            0x0009 => Consistency::LocalSerial,
            0x000A => Consistency::LocalOne,
            other => Consistency::Unknown(other),
        }
    }
}

impl fmt::Display for Consistency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Consistency::Any => write!(f, "ANY"),
            Consistency::One => write!(f, "ONE"),
            Consistency::Two => write!(f, "TWO"),
            Consistency::Three => write!(f, "THREE"),
            Consistency::Quorum => write!(f, "QUORUM"),
            Consistency::All => write!(f, "ALL"),
            Consistency::LocalQuorum => write!(f, "LOCAL_QUORUM"),
            Consistency::EachQuorum => write!(f, "EACH_QUORUM"),
            Consistency::Serial => write!(f, "SERIAL"),
            Consistency::LocalSerial => write!(f, "LOCAL_SERIAL"),
            Consistency::LocalOne => write!(f, "LOCAL_ONE"),
            Consistency::Unknown(code) => write!(f, "UNKNOWN({:#06x})", code),
        }
    }
}

/// Largest stream id a request may use. Negative ids belong to the server.
pub const MAX_STREAM_ID: i16 = i16::MAX;

/// Stream id the server uses for pushed event frames.
pub const EVENT_STREAM_ID: i16 = -1;
