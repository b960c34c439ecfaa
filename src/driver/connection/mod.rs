//! A single TCP connection to one node
//!
//! After the handshake the socket is split: the write half sits behind an
//! async lock so each frame goes out whole, and a dedicated reader task
//! routes every reply to its waiting request by stream id. Any I/O failure
//! breaks the connection for good and fails everything still pending.

pub mod io;
pub mod registry;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use self::io::{read_frame, write_frame};
use self::registry::{Completion, PendingRequest, ReplyReceiver, StreamRegistry};
use crate::config::ClusterConfig;
use crate::driver::auth::Authenticator;
use crate::driver::events::{DriverEvent, SharedEventListener};
use crate::driver::protocol::codec::{StringListMap, StringMultimap, WireReader};
use crate::driver::protocol::frame::Frame;
use crate::driver::protocol::query::{
    decode_reply, encode_query, use_keyspace_statement, QueryResults, ResultKind,
};
use crate::driver::protocol::startup::Handshake;
use crate::driver::protocol::types::{Consistency, Opcode, CQL_VERSION_KEY};
use crate::error::{DriverError, DriverResult};

/// Pluggable collaborators shared by every connection of a cluster.
#[derive(Clone)]
pub struct ConnectionHooks {
    pub events: SharedEventListener,
    pub authenticator: Option<Arc<dyn Authenticator>>,
}

struct Shared {
    address: String,
    protocol_version: u8,
    registry: StreamRegistry,
    events: SharedEventListener,
    broken: AtomicBool,
}

impl Shared {
    /// Mark the connection dead and fail every pending request. Only the
    /// first call has any effect.
    fn tear_down(&self, reason: &str) {
        if self.broken.swap(true, Ordering::AcqRel) {
            return;
        }
        self.registry
            .fail_all(DriverError::broken(&self.address, reason));
        self.events.on_event(&DriverEvent::ConnectionClosed {
            address: &self.address,
            reason,
        });
    }
}

/// Tears the connection down if a write is abandoned halfway.
struct WriteGuard<'a> {
    shared: &'a Shared,
    armed: bool,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.tear_down("Write cancelled mid-frame");
        }
    }
}

/// A stream id reserved on a connection, ready to carry one request.
pub struct Reservation<'a> {
    pending: PendingRequest<'a>,
    reply: ReplyReceiver,
}

impl Reservation<'_> {
    pub fn stream(&self) -> i16 {
        self.pending.stream()
    }
}

pub struct Connection {
    shared: Arc<Shared>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    reader: parking_lot::Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Connection {
    /// Connect, negotiate at most `version`, and start the reader task.
    pub async fn open(
        address: &str,
        version: u8,
        config: &ClusterConfig,
        hooks: &ConnectionHooks,
    ) -> DriverResult<Self> {
        let unavailable = |reason: String| {
            hooks.events.on_event(&DriverEvent::HostUnavailable {
                address,
                reason: &reason,
            });
            DriverError::HostUnavailable {
                address: address.to_string(),
                reason,
            }
        };

        let connect_timeout = config.connect_timeout();
        let connect = tokio::time::timeout(connect_timeout, TcpStream::connect(address));
        let mut stream = match connect.await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(unavailable(format!("Failed to connect: {}", e))),
            Err(_) => {
                return Err(unavailable(format!(
                    "Connect timed out after {:?}",
                    connect_timeout
                )))
            }
        };
        stream
            .set_nodelay(true)
            .map_err(|e| unavailable(format!("Failed to set TCP_NODELAY: {}", e)))?;

        let mut options = StringMultimap::new();
        options.add_pair(CQL_VERSION_KEY, config.cql_version.as_str());
        let handshake = Handshake::new(address, version, &*hooks.events)
            .options(options)
            .authenticator(hooks.authenticator.as_deref());

        let negotiate = tokio::time::timeout(connect_timeout, handshake.negotiate(&mut stream));
        let outcome = match negotiate.await {
            Ok(result) => result?,
            Err(_) => {
                return Err(unavailable(format!(
                    "Handshake timed out after {:?}",
                    connect_timeout
                )))
            }
        };

        let (read, write) = stream.into_split();
        let shared = Arc::new(Shared {
            address: address.to_string(),
            protocol_version: outcome.version,
            registry: StreamRegistry::new(address, config.orphan_grace(), hooks.events.clone()),
            events: hooks.events.clone(),
            broken: AtomicBool::new(false),
        });
        let reader = tokio::spawn(read_loop(read, shared.clone()));

        let connection = Self {
            shared,
            writer: tokio::sync::Mutex::new(Some(write)),
            reader: parking_lot::Mutex::new(Some(reader)),
            closed: AtomicBool::new(false),
        };

        if let Some(keyspace) = &config.keyspace {
            if let Err(e) = connection.use_keyspace(keyspace, config.request_timeout()).await {
                connection.close().await;
                return Err(e);
            }
        }

        hooks.events.on_event(&DriverEvent::ConnectionOpened {
            address,
            protocol_version: outcome.version,
        });
        Ok(connection)
    }

    pub fn address(&self) -> &str {
        &self.shared.address
    }

    pub fn protocol_version(&self) -> u8 {
        self.shared.protocol_version
    }

    pub fn is_broken(&self) -> bool {
        self.shared.broken.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Requests written and still waiting for their reply.
    pub fn in_flight(&self) -> usize {
        self.shared.registry.in_flight()
    }

    /// Reserve a stream id. `Ok(None)` means every id is taken.
    pub fn reserve(&self) -> DriverResult<Option<Reservation<'_>>> {
        if self.is_closed() {
            return Err(DriverError::broken(self.address(), "Connection closed"));
        }
        let Some((stream, reply)) = self.shared.registry.allocate()? else {
            return Ok(None);
        };
        Ok(Some(Reservation {
            pending: PendingRequest::new(&self.shared.registry, stream),
            reply,
        }))
    }

    /// Send one request on a reserved stream and wait for its reply.
    ///
    /// `timeout` bounds the whole exchange, including the wait for the
    /// writer lock and the write itself. A write cut short by the timeout
    /// breaks the connection.
    pub async fn send(
        &self,
        reservation: Reservation<'_>,
        opcode: Opcode,
        body: Bytes,
        timeout: Duration,
    ) -> DriverResult<Frame> {
        let Reservation { mut pending, reply } = reservation;
        let stream = pending.stream();
        let frame = Frame::request(self.protocol_version(), stream, opcode, body)?;

        let exchange = async {
            self.write(&frame).await?;
            pending.mark_sent();
            let result = reply.await;
            pending.disarm();
            result.unwrap_or_else(|_| {
                Err(DriverError::broken(self.address(), "Reader task stopped"))
            })
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(DriverError::OperationTimedOut {
                address: self.address().to_string(),
                stream,
                timeout,
            }),
        }
    }

    /// Reserve a stream and send, failing if the connection is saturated.
    pub async fn request(
        &self,
        opcode: Opcode,
        body: Bytes,
        timeout: Duration,
    ) -> DriverResult<Frame> {
        let reservation = self.reserve()?.ok_or_else(|| {
            DriverError::Protocol(format!("No free stream id on {}", self.address()))
        })?;
        self.send(reservation, opcode, body, timeout).await
    }

    async fn write(&self, frame: &Frame) -> DriverResult<()> {
        let mut writer = self.writer.lock().await;
        let Some(half) = writer.as_mut() else {
            return Err(DriverError::broken(self.address(), "Connection closed"));
        };
        if self.is_broken() {
            return Err(DriverError::broken(self.address(), "Connection is broken"));
        }

        let mut guard = WriteGuard {
            shared: &self.shared,
            armed: true,
        };
        let result = write_frame(half, frame).await;
        guard.armed = false;

        match result {
            Ok(()) => {
                self.shared.events.on_event(&DriverEvent::FrameSent {
                    address: self.address(),
                    stream: frame.stream(),
                    opcode: frame.opcode(),
                    length: frame.header().length,
                });
                Ok(())
            }
            Err(e) => {
                let reason = format!("Write failed: {}", e);
                self.shared.tear_down(&reason);
                Err(DriverError::broken(self.address(), reason))
            }
        }
    }

    /// OPTIONS round trip; returns the SUPPORTED map.
    pub async fn options(&self, timeout: Duration) -> DriverResult<StringListMap> {
        let reply = self.request(Opcode::Options, Bytes::new(), timeout).await?;
        match reply.opcode() {
            Opcode::Supported => WireReader::new(reply.body()).read_string_list_map(),
            Opcode::Error => Err(crate::driver::protocol::error::classify(reply.body())),
            other => Err(DriverError::Protocol(format!(
                "Unexpected {:?} in reply to OPTIONS",
                other
            ))),
        }
    }

    /// Run a single query on this connection.
    pub async fn query(
        &self,
        query: &str,
        consistency: Consistency,
        page_size: Option<i32>,
        timeout: Duration,
    ) -> DriverResult<QueryResults> {
        let body = encode_query(self.protocol_version(), query, consistency, page_size)?;
        let reply = self.request(Opcode::Query, body, timeout).await?;
        decode_reply(&reply)
    }

    async fn use_keyspace(&self, keyspace: &str, timeout: Duration) -> DriverResult<()> {
        let statement = use_keyspace_statement(keyspace);
        let results = self
            .query(&statement, Consistency::default(), None, timeout)
            .await?;
        match results.kind() {
            ResultKind::SetKeyspace(_) | ResultKind::Void => Ok(()),
            other => Err(DriverError::Protocol(format!(
                "Unexpected {:?} result for USE",
                other
            ))),
        }
    }

    /// Close the socket and fail pending requests. Later calls do nothing.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        self.shared.tear_down("Closed by client");

        let write = self.writer.lock().await.take();
        if let Some(mut write) = write {
            let _ = write.shutdown().await;
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.get_mut().take() {
            reader.abort();
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("address", &self.shared.address)
            .field("protocol_version", &self.shared.protocol_version)
            .field("broken", &self.is_broken())
            .finish()
    }
}

async fn read_loop(mut read: OwnedReadHalf, shared: Arc<Shared>) {
    let reason = loop {
        let frame = match read_frame(&mut read).await {
            Ok(frame) => frame,
            Err(e) => break format!("Read failed: {}", e),
        };
        let stream = frame.stream();
        shared.events.on_event(&DriverEvent::FrameReceived {
            address: &shared.address,
            stream,
            opcode: frame.opcode(),
            length: frame.header().length,
        });

        if stream < 0 {
            shared.events.on_event(&DriverEvent::ServerEvent {
                address: &shared.address,
                length: frame.header().length,
            });
            continue;
        }

        match shared.registry.complete(stream, frame) {
            Completion::Delivered | Completion::Reclaimed => {}
            Completion::Unknown => break format!("Reply on unknown stream {}", stream),
        }
    };
    shared.tear_down(&reason);
}
