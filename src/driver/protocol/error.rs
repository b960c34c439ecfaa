//! Classification of ERROR response bodies.
//!
//! An ERROR body is `[int] code`, `[string] message`, then code-specific
//! fields. Each known code has one row in [`SERVER_ERRORS`]; codes missing
//! from the table map to [`DriverError::Server`], so every code classifies.

use super::codec::WireReader;
use super::types::Consistency;
use crate::error::{DriverError, DriverResult};

pub const SERVER_ERROR: u32 = 0x0000;
pub const PROTOCOL_ERROR: u32 = 0x000A;
pub const BAD_CREDENTIALS: u32 = 0x0100;
pub const UNAVAILABLE: u32 = 0x1000;
pub const OVERLOADED: u32 = 0x1001;
pub const IS_BOOTSTRAPPING: u32 = 0x1002;
pub const TRUNCATE_ERROR: u32 = 0x1003;
pub const WRITE_TIMEOUT: u32 = 0x1100;
pub const READ_TIMEOUT: u32 = 0x1200;
pub const READ_FAILURE: u32 = 0x1300;
pub const FUNCTION_FAILURE: u32 = 0x1400;
pub const WRITE_FAILURE: u32 = 0x1500;
pub const SYNTAX_ERROR: u32 = 0x2000;
pub const UNAUTHORIZED: u32 = 0x2100;
pub const INVALID: u32 = 0x2200;
pub const CONFIG_ERROR: u32 = 0x2300;
pub const ALREADY_EXISTS: u32 = 0x2400;
pub const UNPREPARED: u32 = 0x2500;

type Decoder = fn(&mut WireReader<'_>, String) -> DriverResult<DriverError>;

/// One row of the server error table.
pub struct ServerErrorKind {
    pub code: u32,
    pub name: &'static str,
    decode: Decoder,
}

pub static SERVER_ERRORS: &[ServerErrorKind] = &[
    ServerErrorKind {
        code: SERVER_ERROR,
        name: "server_error",
        decode: plain::<SERVER_ERROR>,
    },
    ServerErrorKind {
        code: PROTOCOL_ERROR,
        name: "protocol_error",
        decode: plain::<PROTOCOL_ERROR>,
    },
    ServerErrorKind {
        code: BAD_CREDENTIALS,
        name: "bad_credentials",
        decode: bad_credentials,
    },
    ServerErrorKind {
        code: UNAVAILABLE,
        name: "unavailable",
        decode: plain::<UNAVAILABLE>,
    },
    ServerErrorKind {
        code: OVERLOADED,
        name: "overloaded",
        decode: plain::<OVERLOADED>,
    },
    ServerErrorKind {
        code: IS_BOOTSTRAPPING,
        name: "is_bootstrapping",
        decode: plain::<IS_BOOTSTRAPPING>,
    },
    ServerErrorKind {
        code: TRUNCATE_ERROR,
        name: "truncate_error",
        decode: plain::<TRUNCATE_ERROR>,
    },
    ServerErrorKind {
        code: WRITE_TIMEOUT,
        name: "write_timeout",
        decode: write_timeout,
    },
    ServerErrorKind {
        code: READ_TIMEOUT,
        name: "read_timeout",
        decode: read_timeout,
    },
    ServerErrorKind {
        code: READ_FAILURE,
        name: "read_failure",
        decode: read_failure,
    },
    ServerErrorKind {
        code: FUNCTION_FAILURE,
        name: "function_failure",
        decode: plain::<FUNCTION_FAILURE>,
    },
    ServerErrorKind {
        code: WRITE_FAILURE,
        name: "write_failure",
        decode: write_failure,
    },
    ServerErrorKind {
        code: SYNTAX_ERROR,
        name: "syntax_error",
        decode: plain::<SYNTAX_ERROR>,
    },
    ServerErrorKind {
        code: UNAUTHORIZED,
        name: "unauthorized",
        decode: plain::<UNAUTHORIZED>,
    },
    ServerErrorKind {
        code: INVALID,
        name: "invalid",
        decode: plain::<INVALID>,
    },
    ServerErrorKind {
        code: CONFIG_ERROR,
        name: "config_error",
        decode: config_error,
    },
    ServerErrorKind {
        code: ALREADY_EXISTS,
        name: "already_exists",
        decode: already_exists,
    },
    ServerErrorKind {
        code: UNPREPARED,
        name: "unprepared",
        decode: plain::<UNPREPARED>,
    },
];

/// Look up the table row for a code.
pub fn lookup(code: u32) -> Option<&'static ServerErrorKind> {
    SERVER_ERRORS.iter().find(|kind| kind.code == code)
}

/// A decoded ERROR body before classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerErrorBody {
    pub code: u32,
    pub message: String,
}

/// Read the code and message of an ERROR body.
pub fn decode_header(body: &[u8]) -> DriverResult<ServerErrorBody> {
    let mut reader = WireReader::new(body);
    let code = reader.read_int()? as u32;
    let message = reader.read_string()?;
    Ok(ServerErrorBody { code, message })
}

/// Classify a full ERROR body into the driver's error taxonomy.
///
/// A body too short for its code's fields yields the decode error itself.
pub fn classify(body: &[u8]) -> DriverError {
    match try_classify(body) {
        Ok(err) | Err(err) => err,
    }
}

fn try_classify(body: &[u8]) -> DriverResult<DriverError> {
    let mut reader = WireReader::new(body);
    let code = reader.read_int()? as u32;
    let message = reader.read_string()?;
    match lookup(code) {
        Some(kind) => (kind.decode)(&mut reader, message),
        None => Ok(DriverError::Server {
            code,
            name: "unknown",
            message,
        }),
    }
}

fn name_of(code: u32) -> &'static str {
    lookup(code).map(|kind| kind.name).unwrap_or("unknown")
}

fn plain<const CODE: u32>(_: &mut WireReader<'_>, message: String) -> DriverResult<DriverError> {
    Ok(DriverError::Server {
        code: CODE,
        name: name_of(CODE),
        message,
    })
}

fn bad_credentials(_: &mut WireReader<'_>, message: String) -> DriverResult<DriverError> {
    Ok(DriverError::Authentication(message))
}

fn config_error(_: &mut WireReader<'_>, message: String) -> DriverResult<DriverError> {
    Ok(DriverError::ConfigurationException { message })
}

fn already_exists(reader: &mut WireReader<'_>, message: String) -> DriverResult<DriverError> {
    let keyspace = reader.read_string()?;
    let table = reader.read_string()?;
    Ok(DriverError::AlreadyExists {
        keyspace,
        table,
        message,
    })
}

fn read_timeout(reader: &mut WireReader<'_>, message: String) -> DriverResult<DriverError> {
    let consistency = Consistency::from(reader.read_short()?);
    let received = reader.read_int()?;
    let block_for = reader.read_int()?;
    let data_present = reader.read_u8()? != 0;
    Ok(DriverError::ReadTimeout {
        message,
        consistency,
        received,
        block_for,
        data_present,
    })
}

fn read_failure(reader: &mut WireReader<'_>, message: String) -> DriverResult<DriverError> {
    let consistency = Consistency::from(reader.read_short()?);
    let received = reader.read_int()?;
    let block_for = reader.read_int()?;
    let failures = reader.read_int()?;
    let data_present = reader.read_u8()? != 0;
    Ok(DriverError::ReadFailure {
        message,
        consistency,
        received,
        block_for,
        failures,
        data_present,
    })
}

fn write_timeout(reader: &mut WireReader<'_>, message: String) -> DriverResult<DriverError> {
    let consistency = Consistency::from(reader.read_short()?);
    let received = reader.read_int()?;
    let block_for = reader.read_int()?;
    let write_type = reader.read_string()?;
    Ok(DriverError::WriteTimeout {
        message,
        consistency,
        received,
        block_for,
        write_type,
    })
}

fn write_failure(reader: &mut WireReader<'_>, message: String) -> DriverResult<DriverError> {
    let consistency = Consistency::from(reader.read_short()?);
    let received = reader.read_int()?;
    let block_for = reader.read_int()?;
    let failures = reader.read_int()?;
    let write_type = reader.read_string()?;
    Ok(DriverError::WriteFailure {
        message,
        consistency,
        received,
        block_for,
        failures,
        write_type,
    })
}

/// Whether an ERROR body reports that the attempted protocol version is not
/// supported by the server.
pub fn is_unsupported_version(error: &ServerErrorBody) -> bool {
    if error.code != PROTOCOL_ERROR && error.code != SERVER_ERROR {
        return false;
    }
    let message = error.message.to_ascii_lowercase();
    message.contains("protocol version")
}

/// The highest version below `attempted` that the server's message names.
///
/// Servers phrase this differently ("the greatest is 3", "supported
/// versions are (3/v3, 4/v4)"), so every standalone digit run is a
/// candidate.
pub fn advertised_version(message: &str, attempted: u8) -> Option<u8> {
    let mut best: Option<u8> = None;
    let mut chars = message.char_indices().peekable();
    while let Some((start, c)) = chars.next() {
        if !c.is_ascii_digit() {
            continue;
        }
        let mut end = start + c.len_utf8();
        while let Some(&(idx, next)) = chars.peek() {
            if next.is_ascii_digit() {
                end = idx + next.len_utf8();
                chars.next();
            } else {
                break;
            }
        }
        let preceded_by_dot = message[..start].ends_with('.');
        let followed_by_dot = message[end..].starts_with('.');
        if preceded_by_dot || followed_by_dot {
            continue;
        }
        if let Ok(version) = message[start..end].parse::<u8>() {
            if version >= 1 && version < attempted && best.map_or(true, |b| version > b) {
                best = Some(version);
            }
        }
    }
    best
}
