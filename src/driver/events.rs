//! Observability hook for protocol activity
//!
//! The connection and handshake layers report what they do through a
//! [`DriverEventListener`] instead of logging inline. The default listener
//! forwards everything to `tracing`; any `Fn(&DriverEvent)` closure also works.

use std::sync::Arc;

use crate::driver::protocol::startup::NegotiationState;
use crate::driver::protocol::types::Opcode;

/// A single observable step in the driver's life.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverEvent<'a> {
    FrameSent {
        address: &'a str,
        stream: i16,
        opcode: Opcode,
        length: u32,
    },
    FrameReceived {
        address: &'a str,
        stream: i16,
        opcode: Opcode,
        length: u32,
    },
    /// A transition of the version negotiation state machine.
    HandshakeStep {
        address: &'a str,
        from: NegotiationState,
        to: NegotiationState,
    },
    ConnectionOpened {
        address: &'a str,
        protocol_version: u8,
    },
    ConnectionClosed {
        address: &'a str,
        reason: &'a str,
    },
    HostUnavailable {
        address: &'a str,
        reason: &'a str,
    },
    /// A request gave up waiting; its stream id is held until reclaimed.
    StreamOrphaned {
        address: &'a str,
        stream: i16,
    },
    StreamReclaimed {
        address: &'a str,
        stream: i16,
    },
    /// A server-pushed frame on the event stream, discarded by the core.
    ServerEvent {
        address: &'a str,
        length: u32,
    },
}

pub trait DriverEventListener: Send + Sync {
    fn on_event(&self, event: &DriverEvent<'_>);
}

impl<F> DriverEventListener for F
where
    F: Fn(&DriverEvent<'_>) + Send + Sync,
{
    fn on_event(&self, event: &DriverEvent<'_>) {
        self(event)
    }
}

/// Renders driver events as structured `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventListener;

impl DriverEventListener for TracingEventListener {
    fn on_event(&self, event: &DriverEvent<'_>) {
        match *event {
            DriverEvent::FrameSent {
                address,
                stream,
                opcode,
                length,
            } => tracing::trace!(%address, stream, ?opcode, length, "frame sent"),
            DriverEvent::FrameReceived {
                address,
                stream,
                opcode,
                length,
            } => tracing::trace!(%address, stream, ?opcode, length, "frame received"),
            DriverEvent::HandshakeStep { address, from, to } => {
                tracing::debug!(%address, ?from, ?to, "handshake step")
            }
            DriverEvent::ConnectionOpened {
                address,
                protocol_version,
            } => tracing::debug!(%address, protocol_version, "connection opened"),
            DriverEvent::ConnectionClosed { address, reason } => {
                tracing::debug!(%address, reason, "connection closed")
            }
            DriverEvent::HostUnavailable { address, reason } => {
                tracing::warn!(%address, reason, "host unavailable")
            }
            DriverEvent::StreamOrphaned { address, stream } => {
                tracing::debug!(%address, stream, "stream orphaned")
            }
            DriverEvent::StreamReclaimed { address, stream } => {
                tracing::trace!(%address, stream, "stream reclaimed")
            }
            DriverEvent::ServerEvent { address, length } => {
                tracing::trace!(%address, length, "server event discarded")
            }
        }
    }
}

pub type SharedEventListener = Arc<dyn DriverEventListener>;

pub fn default_listener() -> SharedEventListener {
    Arc::new(TracingEventListener)
}
