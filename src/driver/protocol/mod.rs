//! Native protocol definitions for the driver
//!
//! Every frame starts with a fixed 9-byte big-endian header:
//! - **version** (1 byte): protocol version, high bit set on responses
//! - **flags** (1 byte)
//! - **stream** (2 bytes, signed): request/response correlation id
//! - **opcode** (1 byte)
//! - **length** (4 bytes): body length
//!
//! The body layouts are built from the primitive notations in [`codec`].

pub mod codec;
pub mod error;
pub mod frame;
pub mod query;
pub mod startup;
pub mod types;

pub use codec::{StringMultimap, StringPair, WireReader};
pub use frame::{Frame, FrameHeader, HEADER_SIZE};
pub use query::{ColumnSpec, ColumnType, QueryResults, ResultKind, Row};
pub use startup::{Handshake, HandshakeOutcome, NegotiationState};
pub use types::{Consistency, Opcode, MAX_SUPPORTED_VERSION, MIN_SUPPORTED_VERSION};
