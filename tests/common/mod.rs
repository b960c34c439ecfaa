//! Common test utilities for driver tests
//!
//! Provides:
//! - A scripted mock node speaking the native protocol over real TCP
//! - A recording event listener
//! - Tracing initialisation for `RUST_LOG`-filtered test output

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use cqlwire::driver::connection::io::{read_frame, write_frame};
use cqlwire::driver::protocol::codec::{
    put_bytes, put_int, put_short, put_string, put_string_list, StringMultimap, WireReader,
};
use cqlwire::driver::protocol::error::{BAD_CREDENTIALS, PROTOCOL_ERROR};
use cqlwire::driver::protocol::{Frame, NegotiationState, Opcode};
use cqlwire::{ClusterConfigBuilder, DriverEvent, DriverEventListener};

pub const AUTHENTICATOR_CLASS: &str = "org.apache.cassandra.auth.PasswordAuthenticator";

pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cqlwire=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

// ============================================================================
// Scripted replies
// ============================================================================

/// What the mock node does with one QUERY.
#[derive(Debug, Clone)]
pub enum Reply {
    /// One row, one `varchar` column holding the query text.
    Echo,
    Void,
    Rows(Vec<Vec<Option<Vec<u8>>>>),
    /// Arbitrary ERROR body after the code and message.
    Error {
        code: u32,
        message: String,
        extra: Vec<u8>,
    },
    Delayed(Duration, Box<Reply>),
    /// Never answer.
    Silent,
    /// Close the connection instead of answering.
    Hangup,
}

impl Reply {
    pub fn error(code: u32, message: &str) -> Self {
        Reply::Error {
            code,
            message: message.to_string(),
            extra: Vec::new(),
        }
    }

    pub fn delayed(delay: Duration, reply: Reply) -> Self {
        Reply::Delayed(delay, Box::new(reply))
    }
}

pub type Responder = Arc<dyn Fn(&str) -> Reply + Send + Sync>;

#[derive(Clone)]
pub struct MockOptions {
    /// Protocol versions the node accepts
    pub versions: Vec<u8>,
    /// Require SASL PLAIN (or v1 CREDENTIALS) with these credentials
    pub credentials: Option<(String, String)>,
    pub responder: Responder,
    /// Push a server event on stream -1 ahead of every QUERY reply
    pub push_events: bool,
    /// Stop reading once a connection has handled this many queries
    pub read_limit: Option<(usize, AfterLimit)>,
}

/// What a connection does once its read limit is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterLimit {
    /// Keep the socket open but never read from it again.
    Stall,
    /// Read the next frame header, then drop the socket with data unread.
    Reset,
}

impl Default for MockOptions {
    fn default() -> Self {
        Self {
            versions: vec![1, 2, 3, 4],
            credentials: None,
            responder: Arc::new(|_| Reply::Echo),
            push_events: false,
            read_limit: None,
        }
    }
}

impl MockOptions {
    pub fn versions(mut self, versions: &[u8]) -> Self {
        self.versions = versions.to_vec();
        self
    }

    pub fn credentials(mut self, username: &str, password: &str) -> Self {
        self.credentials = Some((username.to_string(), password.to_string()));
        self
    }

    pub fn responder<F>(mut self, responder: F) -> Self
    where
        F: Fn(&str) -> Reply + Send + Sync + 'static,
    {
        self.responder = Arc::new(responder);
        self
    }

    pub fn push_events(mut self) -> Self {
        self.push_events = true;
        self
    }

    pub fn read_limit(mut self, queries: usize, after: AfterLimit) -> Self {
        self.read_limit = Some((queries, after));
        self
    }
}

/// Everything the mock node observed.
#[derive(Default)]
pub struct ServerLog {
    pub startup_versions: Mutex<Vec<u8>>,
    /// `(connection id, query text)`
    pub queries: Mutex<Vec<(usize, String)>>,
    pub connections: AtomicUsize,
}

impl ServerLog {
    pub fn startup_versions(&self) -> Vec<u8> {
        self.startup_versions.lock().clone()
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().iter().map(|(_, q)| q.clone()).collect()
    }

    pub fn queries_on(&self, connection: usize) -> usize {
        self.queries
            .lock()
            .iter()
            .filter(|(id, _)| *id == connection)
            .count()
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Mock node
// ============================================================================

pub struct MockServer {
    addr: SocketAddr,
    log: Arc<ServerLog>,
    accept_task: JoinHandle<()>,
}

impl MockServer {
    pub async fn start(options: MockOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let log = Arc::new(ServerLog::default());

        let accept_log = log.clone();
        let accept_task = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let id = accept_log.connections.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve_connection(socket, id, options.clone(), accept_log.clone()));
            }
        });

        Self {
            addr,
            log,
            accept_task,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn log(&self) -> &ServerLog {
        &self.log
    }

    /// Cluster configuration pointing at this node only.
    pub fn config(&self) -> ClusterConfigBuilder {
        ClusterConfigBuilder::new()
            .contact_points(["127.0.0.1"])
            .port(self.port())
            .connect_timeout(Duration::from_secs(2))
            .request_timeout(Duration::from_secs(2))
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

/// An address nothing listens on.
pub async fn refused_address() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr.to_string()
}

type SharedWriter = Arc<tokio::sync::Mutex<OwnedWriteHalf>>;

async fn send(writer: &SharedWriter, version: u8, stream: i16, opcode: Opcode, body: Bytes) {
    let frame = Frame::with_flags(0x80 | version, 0, stream, opcode, body).unwrap();
    let mut writer = writer.lock().await;
    let _ = write_frame(&mut *writer, &frame).await;
}

async fn serve_connection(socket: TcpStream, id: usize, options: MockOptions, log: Arc<ServerLog>) {
    let (mut read, write) = socket.into_split();
    let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(write));
    let mut established = false;
    let mut handled = 0usize;

    loop {
        match options.read_limit {
            Some((limit, AfterLimit::Stall)) if established && handled >= limit => {
                std::future::pending::<()>().await;
            }
            Some((limit, AfterLimit::Reset)) if established && handled >= limit => {
                let mut header = [0u8; 9];
                let _ = read.read_exact(&mut header).await;
                return;
            }
            _ => {}
        }

        let frame = match read_frame(&mut read).await {
            Ok(frame) => frame,
            Err(_) => return,
        };
        let version = frame.header().protocol_version();
        let stream = frame.stream();

        match frame.opcode() {
            Opcode::Startup => {
                log.startup_versions.lock().push(version);
                if options.versions.contains(&version) {
                    if options.credentials.is_some() {
                        let mut body = BytesMut::new();
                        put_string(&mut body, AUTHENTICATOR_CLASS).unwrap();
                        send(&writer, version, stream, Opcode::Authenticate, body.freeze()).await;
                    } else {
                        send(&writer, version, stream, Opcode::Ready, Bytes::new()).await;
                        established = true;
                    }
                } else {
                    let highest = options.versions.iter().copied().max().unwrap_or(1);
                    let supported: Vec<String> = options
                        .versions
                        .iter()
                        .map(|v| format!("{}/v{}", v, v))
                        .collect();
                    let message = format!(
                        "Invalid or unsupported protocol version ({}); supported versions are ({})",
                        version,
                        supported.join(", ")
                    );
                    let body = error_body(PROTOCOL_ERROR, &message, &[]);
                    send(&writer, highest, stream, Opcode::Error, body).await;
                }
            }
            Opcode::AuthResponse => {
                let token = WireReader::new(frame.body()).read_bytes().unwrap_or(None);
                let expected = options
                    .credentials
                    .as_ref()
                    .map(|(u, p)| format!("\0{}\0{}", u, p).into_bytes());
                if token.as_deref() == expected.as_deref() {
                    let mut body = BytesMut::new();
                    put_bytes(&mut body, None).unwrap();
                    send(&writer, version, stream, Opcode::AuthSuccess, body.freeze()).await;
                    established = true;
                } else {
                    let body = error_body(BAD_CREDENTIALS, "Bad credentials", &[]);
                    send(&writer, version, stream, Opcode::Error, body).await;
                }
            }
            Opcode::Credentials => {
                let accepted = match (StringMultimap::decode(frame.body()), &options.credentials) {
                    (Ok((map, _)), Some((u, p))) => {
                        map.get("username") == Some(u.as_str())
                            && map.get("password") == Some(p.as_str())
                    }
                    _ => false,
                };
                if accepted {
                    send(&writer, version, stream, Opcode::Ready, Bytes::new()).await;
                    established = true;
                } else {
                    let body = error_body(BAD_CREDENTIALS, "Bad credentials", &[]);
                    send(&writer, version, stream, Opcode::Error, body).await;
                }
            }
            Opcode::Options => {
                let mut body = BytesMut::new();
                put_short(&mut body, 2);
                put_string(&mut body, "CQL_VERSION").unwrap();
                put_string_list(&mut body, &["3.0.0".to_string()]).unwrap();
                put_string(&mut body, "COMPRESSION").unwrap();
                put_string_list(&mut body, &[]).unwrap();
                send(&writer, version, stream, Opcode::Supported, body.freeze()).await;
            }
            Opcode::Query => {
                let query = WireReader::new(frame.body()).read_long_string().unwrap_or_default();
                log.queries.lock().push((id, query.clone()));
                handled += 1;

                if options.push_events {
                    let body = Bytes::from_static(b"\x00\x0dSCHEMA_CHANGE");
                    send(&writer, version, -1, Opcode::Event, body).await;
                }

                if let Some(keyspace) = query.strip_prefix("USE ") {
                    let mut body = BytesMut::new();
                    put_int(&mut body, 3);
                    put_string(&mut body, keyspace.trim_matches('"')).unwrap();
                    send(&writer, version, stream, Opcode::Result, body.freeze()).await;
                    continue;
                }

                let mut reply = (options.responder)(&query);
                let mut delay = Duration::ZERO;
                while let Reply::Delayed(extra, inner) = reply {
                    delay += extra;
                    reply = *inner;
                }

                match reply {
                    Reply::Silent => {}
                    Reply::Hangup => {
                        let _ = writer.lock().await.shutdown().await;
                        return;
                    }
                    reply => {
                        let (opcode, body) = encode_reply(&reply, &query);
                        if delay.is_zero() {
                            send(&writer, version, stream, opcode, body).await;
                        } else {
                            let writer = writer.clone();
                            tokio::spawn(async move {
                                tokio::time::sleep(delay).await;
                                send(&writer, version, stream, opcode, body).await;
                            });
                        }
                    }
                }
            }
            _ => {
                let body = error_body(PROTOCOL_ERROR, "Unsupported request", &[]);
                send(&writer, version, stream, Opcode::Error, body).await;
            }
        }
    }
}

pub fn error_body(code: u32, message: &str, extra: &[u8]) -> Bytes {
    let mut body = BytesMut::new();
    put_int(&mut body, code as i32);
    put_string(&mut body, message).unwrap();
    body.extend_from_slice(extra);
    body.freeze()
}

fn encode_reply(reply: &Reply, query: &str) -> (Opcode, Bytes) {
    match reply {
        Reply::Echo => (Opcode::Result, rows_body(&[vec![Some(query.as_bytes().to_vec())]])),
        Reply::Rows(rows) => (Opcode::Result, rows_body(rows)),
        Reply::Void => {
            let mut body = BytesMut::new();
            put_int(&mut body, 1);
            (Opcode::Result, body.freeze())
        }
        Reply::Error {
            code,
            message,
            extra,
        } => (Opcode::Error, error_body(*code, message, extra)),
        Reply::Delayed(_, inner) => encode_reply(inner, query),
        Reply::Silent | Reply::Hangup => {
            (Opcode::Error, error_body(PROTOCOL_ERROR, "unreachable", &[]))
        }
    }
}

/// RESULT Rows with a global table spec and `varchar` columns.
pub fn rows_body(rows: &[Vec<Option<Vec<u8>>>]) -> Bytes {
    let columns = rows.first().map_or(1, |row| row.len());
    let mut body = BytesMut::new();
    put_int(&mut body, 2);
    put_int(&mut body, 0x0001);
    put_int(&mut body, columns as i32);
    put_string(&mut body, "ks").unwrap();
    put_string(&mut body, "tbl").unwrap();
    for i in 0..columns {
        put_string(&mut body, &format!("c{}", i)).unwrap();
        put_short(&mut body, 0x000D);
    }
    put_int(&mut body, rows.len() as i32);
    for row in rows {
        for cell in row {
            put_bytes(&mut body, cell.as_deref()).unwrap();
        }
    }
    body.freeze()
}

// ============================================================================
// Event recording
// ============================================================================

#[derive(Debug, Default)]
pub struct Recorded {
    pub steps: Vec<(NegotiationState, NegotiationState)>,
    pub opened: Vec<(String, u8)>,
    pub closed: Vec<String>,
    pub unavailable: Vec<String>,
    pub orphaned: Vec<i16>,
    pub reclaimed: Vec<i16>,
    pub server_events: usize,
}

#[derive(Clone, Default)]
pub struct RecordingListener {
    inner: Arc<Mutex<Recorded>>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<R>(&self, f: impl FnOnce(&Recorded) -> R) -> R {
        f(&self.inner.lock())
    }

    /// Every version a STARTUP was sent at, in order. Each attempt leaves
    /// exactly one step out of its `Probing` state.
    pub fn probed_versions(&self) -> Vec<u8> {
        self.with(|r| {
            r.steps
                .iter()
                .filter_map(|(from, _)| match from {
                    NegotiationState::Probing(v) => Some(*v),
                    _ => None,
                })
                .collect()
        })
    }

    pub fn final_state(&self) -> Option<NegotiationState> {
        self.with(|r| r.steps.last().map(|(_, to)| *to))
    }
}

impl DriverEventListener for RecordingListener {
    fn on_event(&self, event: &DriverEvent<'_>) {
        let mut recorded = self.inner.lock();
        match *event {
            DriverEvent::HandshakeStep { from, to, .. } => recorded.steps.push((from, to)),
            DriverEvent::ConnectionOpened {
                address,
                protocol_version,
            } => recorded.opened.push((address.to_string(), protocol_version)),
            DriverEvent::ConnectionClosed { reason, .. } => {
                recorded.closed.push(reason.to_string())
            }
            DriverEvent::HostUnavailable { address, .. } => {
                recorded.unavailable.push(address.to_string())
            }
            DriverEvent::StreamOrphaned { stream, .. } => recorded.orphaned.push(stream),
            DriverEvent::StreamReclaimed { stream, .. } => recorded.reclaimed.push(stream),
            DriverEvent::ServerEvent { .. } => recorded.server_events += 1,
            DriverEvent::FrameSent { .. } | DriverEvent::FrameReceived { .. } => {}
        }
    }
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
