//! Native protocol client driver
//!
//! # Protocol Overview
//!
//! Every exchange is a sequence of frames over one TCP connection:
//! - **Header**: 9 bytes, `{version, flags, stream, opcode, length}`
//! - **Body**: exactly `length` bytes
//!
//! A connection starts with STARTUP, stepping the protocol version down
//! until the server accepts one, then multiplexes requests by stream id.

pub mod auth;
pub mod cluster;
pub mod connection;
pub mod events;
pub mod policy;
pub mod protocol;
pub mod session;

pub use auth::{Authenticator, PlainTextAuthenticator};
pub use cluster::Cluster;
pub use connection::{Connection, ConnectionHooks};
pub use events::{DriverEvent, DriverEventListener, TracingEventListener};
pub use policy::{ConnectionPolicy, LeastBusyPolicy, RoundRobinPolicy};
pub use session::{ExecuteOptions, Session};
