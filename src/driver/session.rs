//! Query sessions
//!
//! A session owns a pool of connections opened at one negotiated protocol
//! version. Requests are spread over the pool by a [`ConnectionPolicy`];
//! broken connections are evicted before each selection.
//!
//! [`ConnectionPolicy`]: super::policy::ConnectionPolicy

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::RwLock;
use tracing::{debug, warn};

use super::connection::Connection;
use super::policy::SharedConnectionPolicy;
use crate::config::ClusterConfig;
use crate::driver::protocol::query::{decode_reply, encode_query, QueryResults};
use crate::driver::protocol::types::{Consistency, Opcode};
use crate::error::{DriverError, DriverResult};

/// Per-request overrides of the session defaults.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub timeout: Option<Duration>,
    pub consistency: Option<Consistency>,
    pub page_size: Option<i32>,
}

impl ExecuteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn consistency(mut self, consistency: Consistency) -> Self {
        self.consistency = Some(consistency);
        self
    }

    pub fn page_size(mut self, page_size: i32) -> Self {
        self.page_size = Some(page_size);
        self
    }
}

struct SessionInner {
    protocol_version: u8,
    config: Arc<ClusterConfig>,
    pool: RwLock<Vec<Arc<Connection>>>,
    policy: SharedConnectionPolicy,
    shutdown: AtomicBool,
}

/// Cheap to clone; clones share the same pool.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub(crate) fn new(
        protocol_version: u8,
        config: Arc<ClusterConfig>,
        connections: Vec<Connection>,
        policy: SharedConnectionPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                protocol_version,
                config,
                pool: RwLock::new(connections.into_iter().map(Arc::new).collect()),
                policy,
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    pub fn protocol_version(&self) -> u8 {
        self.inner.protocol_version
    }

    pub fn default_timeout(&self) -> Duration {
        self.inner.config.request_timeout()
    }

    pub fn keyspace(&self) -> Option<&str> {
        self.inner.config.keyspace.as_deref()
    }

    /// Live connections currently in the pool.
    pub fn connection_count(&self) -> usize {
        self.inner
            .pool
            .read()
            .iter()
            .filter(|conn| !conn.is_broken())
            .count()
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    pub async fn execute(&self, query: &str) -> DriverResult<QueryResults> {
        self.execute_with(query, &ExecuteOptions::default()).await
    }

    pub async fn execute_with(
        &self,
        query: &str,
        options: &ExecuteOptions,
    ) -> DriverResult<QueryResults> {
        if self.is_shutdown() {
            return Err(DriverError::SessionShutdown);
        }

        let timeout = options.timeout.unwrap_or_else(|| self.default_timeout());
        let consistency = options.consistency.unwrap_or(self.inner.config.consistency);
        let body = encode_query(self.protocol_version(), query, consistency, options.page_size)?;

        let mut errors = Vec::new();
        for conn in self.candidates() {
            let reservation = match conn.reserve() {
                Ok(Some(reservation)) => reservation,
                Ok(None) => {
                    debug!(address = conn.address(), "connection saturated, trying next");
                    continue;
                }
                Err(e) => {
                    errors.push(e);
                    continue;
                }
            };

            let reply = conn
                .send(reservation, Opcode::Query, body.clone(), timeout)
                .await;
            return match reply {
                Ok(reply) => decode_reply(&reply),
                Err(e) => {
                    // A timed-out write also leaves the connection broken.
                    if e.is_connection_fatal() || conn.is_broken() {
                        self.evict_broken();
                    }
                    Err(e)
                }
            };
        }

        Err(DriverError::NoHostAvailable { errors })
    }

    /// OPTIONS round trip on every pooled connection. Connections that fail
    /// are evicted; succeeds if at least one answered.
    pub async fn ping(&self) -> DriverResult<()> {
        if self.is_shutdown() {
            return Err(DriverError::SessionShutdown);
        }

        let timeout = self.default_timeout();
        let mut errors = Vec::new();
        let mut alive = 0usize;
        for conn in self.candidates() {
            match conn.options(timeout).await {
                Ok(_) => alive += 1,
                Err(e) => {
                    warn!(address = conn.address(), error = %e, "ping failed");
                    errors.push(e);
                }
            }
        }
        self.evict_broken();

        if alive == 0 {
            return Err(DriverError::NoHostAvailable { errors });
        }
        Ok(())
    }

    fn candidates(&self) -> Vec<Arc<Connection>> {
        self.evict_broken();
        let pool = self.inner.pool.read();
        self.inner.policy.candidates(&pool)
    }

    fn evict_broken(&self) {
        let mut pool = self.inner.pool.write();
        let before = pool.len();
        pool.retain(|conn| !conn.is_broken());
        if pool.len() != before {
            debug!(
                evicted = before - pool.len(),
                remaining = pool.len(),
                "evicted broken connections"
            );
        }
    }

    /// Close every connection. Later calls do nothing.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        let connections: Vec<Arc<Connection>> = std::mem::take(&mut *self.inner.pool.write());
        join_all(connections.iter().map(|conn| conn.close())).await;
        debug!("session shut down");
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("protocol_version", &self.inner.protocol_version)
            .field("connections", &self.connection_count())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}
