//! Startup handshake and protocol version negotiation
//!
//! A fresh socket is probed with STARTUP at the highest candidate version.
//! A server that rejects the version and names a lower one is probed again
//! at exactly that version, on the same socket, until one is accepted or no
//! lower version remains.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite};

use super::codec::{put_bytes, StringMultimap, WireReader};
use super::error::{self as server_error, ServerErrorBody};
use super::frame::Frame;
use super::types::{
    Opcode, CQL_VERSION_KEY, DEFAULT_CQL_VERSION, MAX_SUPPORTED_VERSION, MIN_SUPPORTED_VERSION,
};
use crate::driver::auth::Authenticator;
use crate::driver::connection::io::{read_frame, write_frame};
use crate::driver::events::{DriverEvent, DriverEventListener};
use crate::error::{DriverError, DriverResult};

/// Stream id used for every frame of the handshake.
pub const HANDSHAKE_STREAM: i16 = 0;

/// Version negotiation states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Probing(u8),
    Negotiated(u8),
    Exhausted,
}

/// What a single STARTUP reply means for the negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// READY, or AUTHENTICATE carrying the authenticator class.
    Accepted { authenticator: Option<String> },
    /// The server rejected the version and named a lower one.
    StepDown(u8),
    /// Terminal failure for this connection.
    Failed(DriverError),
}

/// Build a STARTUP frame. `CQL_VERSION` is added when the caller left it out.
pub fn startup_frame(stream: i16, version: u8, options: &StringMultimap) -> DriverResult<Frame> {
    let mut options = options.clone();
    if !options.contains_key(CQL_VERSION_KEY) {
        options.add_pair(CQL_VERSION_KEY, DEFAULT_CQL_VERSION);
    }
    let body = options.encode()?;
    Frame::request(version, stream, Opcode::Startup, body)
}

/// Interpret the reply to a STARTUP sent at `attempted`.
pub fn next_transition(attempted: u8, reply: &Frame) -> Transition {
    match reply.opcode() {
        Opcode::Ready => Transition::Accepted { authenticator: None },
        Opcode::Authenticate => match WireReader::new(reply.body()).read_string() {
            Ok(class) => Transition::Accepted {
                authenticator: Some(class),
            },
            Err(e) => Transition::Failed(e),
        },
        Opcode::Error => {
            let error = match server_error::decode_header(reply.body()) {
                Ok(error) => error,
                Err(e) => return Transition::Failed(e),
            };
            if !server_error::is_unsupported_version(&error) {
                return Transition::Failed(server_error::classify(reply.body()));
            }
            match lower_version(attempted, &error, reply.header().protocol_version()) {
                Some(lower) => Transition::StepDown(lower),
                None => Transition::Failed(DriverError::UnsupportedProtocolVersion {
                    attempted,
                    message: error.message,
                }),
            }
        }
        other => Transition::Failed(DriverError::Protocol(format!(
            "Unexpected {:?} in reply to STARTUP",
            other
        ))),
    }
}

/// The server's stated version wins; the reply header's version is the
/// fallback. With neither, step down by one.
fn lower_version(attempted: u8, error: &ServerErrorBody, reply_version: u8) -> Option<u8> {
    if attempted <= MIN_SUPPORTED_VERSION {
        return None;
    }
    if let Some(version) = server_error::advertised_version(&error.message, attempted) {
        return Some(version);
    }
    if reply_version >= MIN_SUPPORTED_VERSION && reply_version < attempted {
        return Some(reply_version);
    }
    Some(attempted - 1)
}

/// Result of a completed handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeOutcome {
    pub version: u8,
    /// Every version a STARTUP was sent with, in order.
    pub attempts: Vec<u8>,
    pub authenticated: bool,
}

/// Drives negotiation and authentication over one socket.
pub struct Handshake<'a> {
    address: &'a str,
    ceiling: u8,
    options: StringMultimap,
    authenticator: Option<&'a dyn Authenticator>,
    events: &'a dyn DriverEventListener,
}

impl<'a> Handshake<'a> {
    pub fn new(address: &'a str, ceiling: u8, events: &'a dyn DriverEventListener) -> Self {
        Self {
            address,
            ceiling: ceiling.clamp(MIN_SUPPORTED_VERSION, MAX_SUPPORTED_VERSION),
            options: StringMultimap::new(),
            authenticator: None,
            events,
        }
    }

    pub fn options(mut self, options: StringMultimap) -> Self {
        self.options = options;
        self
    }

    pub fn authenticator(mut self, authenticator: Option<&'a dyn Authenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }

    fn step(&self, from: NegotiationState, to: NegotiationState) -> NegotiationState {
        self.events.on_event(&DriverEvent::HandshakeStep {
            address: self.address,
            from,
            to,
        });
        to
    }

    async fn round_trip<S>(&self, socket: &mut S, frame: &Frame) -> DriverResult<Frame>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        write_frame(socket, frame)
            .await
            .map_err(|e| DriverError::broken(self.address, format!("Write failed: {}", e)))?;
        self.events.on_event(&DriverEvent::FrameSent {
            address: self.address,
            stream: frame.stream(),
            opcode: frame.opcode(),
            length: frame.header().length,
        });

        let reply = read_frame(socket)
            .await
            .map_err(|e| DriverError::broken(self.address, format!("Read failed: {}", e)))?;
        self.events.on_event(&DriverEvent::FrameReceived {
            address: self.address,
            stream: reply.stream(),
            opcode: reply.opcode(),
            length: reply.header().length,
        });

        if reply.stream() != frame.stream() {
            return Err(DriverError::Protocol(format!(
                "Handshake reply on stream {} (expected {})",
                reply.stream(),
                frame.stream()
            )));
        }
        Ok(reply)
    }

    /// Run the negotiation to a terminal state.
    pub async fn negotiate<S>(&self, socket: &mut S) -> DriverResult<HandshakeOutcome>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut attempts = Vec::new();
        let mut state = NegotiationState::Probing(self.ceiling);

        loop {
            let NegotiationState::Probing(version) = state else {
                break;
            };
            attempts.push(version);

            let frame = startup_frame(HANDSHAKE_STREAM, version, &self.options)?;
            let reply = match self.round_trip(socket, &frame).await {
                Ok(reply) => reply,
                Err(e) => {
                    self.step(state, NegotiationState::Exhausted);
                    return Err(e);
                }
            };

            match next_transition(version, &reply) {
                Transition::Accepted { authenticator } => {
                    state = self.step(state, NegotiationState::Negotiated(version));
                    let authenticated = match authenticator {
                        Some(class) => {
                            self.authenticate(socket, version, &class).await?;
                            true
                        }
                        None => false,
                    };
                    return Ok(HandshakeOutcome {
                        version,
                        attempts,
                        authenticated,
                    });
                }
                Transition::StepDown(lower) => {
                    state = self.step(state, NegotiationState::Probing(lower));
                }
                Transition::Failed(err) => {
                    self.step(state, NegotiationState::Exhausted);
                    return Err(err);
                }
            }
        }

        Err(DriverError::Protocol(format!(
            "Negotiation ended in {:?}",
            state
        )))
    }

    async fn authenticate<S>(&self, socket: &mut S, version: u8, class: &str) -> DriverResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let authenticator = self.authenticator.ok_or_else(|| {
            DriverError::Authentication(format!(
                "Server requires authentication ({}) but no authenticator is configured",
                class
            ))
        })?;

        if version == 1 {
            let body = authenticator.credentials().encode()?;
            let frame = Frame::request(version, HANDSHAKE_STREAM, Opcode::Credentials, body)?;
            let reply = self.round_trip(socket, &frame).await?;
            return match reply.opcode() {
                Opcode::Ready => Ok(()),
                Opcode::Error => Err(server_error::classify(reply.body())),
                other => Err(DriverError::Protocol(format!(
                    "Unexpected {:?} in reply to CREDENTIALS",
                    other
                ))),
            };
        }

        let mut token = authenticator.initial_response(class)?;
        loop {
            let mut body = BytesMut::with_capacity(4 + token.len());
            put_bytes(&mut body, Some(&token))?;
            let frame =
                Frame::request(version, HANDSHAKE_STREAM, Opcode::AuthResponse, body.freeze())?;
            let reply = self.round_trip(socket, &frame).await?;
            match reply.opcode() {
                Opcode::AuthSuccess => return Ok(()),
                Opcode::AuthChallenge => {
                    let challenge: Option<Bytes> = WireReader::new(reply.body()).read_bytes()?;
                    token = authenticator.evaluate_challenge(challenge.as_deref())?;
                }
                Opcode::Error => return Err(server_error::classify(reply.body())),
                other => {
                    return Err(DriverError::Protocol(format!(
                        "Unexpected {:?} during authentication",
                        other
                    )))
                }
            }
        }
    }
}
