//! Cluster entry point: configuration plus the sessions opened from it.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::auth::Authenticator;
use super::connection::{Connection, ConnectionHooks};
use super::events::{default_listener, DriverEventListener};
use super::policy::{default_policy, ConnectionPolicy, SharedConnectionPolicy};
use super::session::Session;
use crate::config::ClusterConfig;
use crate::error::{DriverError, DriverResult};

pub struct Cluster {
    config: Arc<ClusterConfig>,
    hooks: ConnectionHooks,
    policy: SharedConnectionPolicy,
    sessions: Mutex<Vec<Session>>,
    /// Zero until a session has been opened.
    negotiated_version: AtomicU8,
    shutdown: AtomicBool,
}

impl Cluster {
    /// Never fails; connection problems surface from [`Cluster::connect`].
    pub fn new(config: ClusterConfig) -> Self {
        Self {
            config: Arc::new(config),
            hooks: ConnectionHooks {
                events: default_listener(),
                authenticator: None,
            },
            policy: default_policy(),
            sessions: Mutex::new(Vec::new()),
            negotiated_version: AtomicU8::new(0),
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn with_authenticator(mut self, authenticator: impl Authenticator + 'static) -> Self {
        self.hooks.authenticator = Some(Arc::new(authenticator));
        self
    }

    pub fn with_event_listener(mut self, listener: impl DriverEventListener + 'static) -> Self {
        self.hooks.events = Arc::new(listener);
        self
    }

    pub fn with_connection_policy(mut self, policy: impl ConnectionPolicy + 'static) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Protocol version of the most recently opened session.
    pub fn negotiated_protocol_version(&self) -> Option<u8> {
        match self.negotiated_version.load(Ordering::Acquire) {
            0 => None,
            version => Some(version),
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Sessions opened from this cluster and not yet shut down.
    pub fn session_count(&self) -> usize {
        self.sessions
            .lock()
            .iter()
            .filter(|session| !session.is_shutdown())
            .count()
    }

    pub async fn connect(&self) -> DriverResult<Session> {
        self.open_session(self.config.clone()).await
    }

    /// Like [`Cluster::connect`], with every connection switched to
    /// `keyspace` right after its handshake.
    pub async fn connect_keyspace(&self, keyspace: &str) -> DriverResult<Session> {
        let mut config = (*self.config).clone();
        config.keyspace = Some(keyspace.to_string());
        self.open_session(Arc::new(config)).await
    }

    async fn open_session(&self, config: Arc<ClusterConfig>) -> DriverResult<Session> {
        if self.is_shutdown() {
            return Err(DriverError::ClusterShutdown);
        }

        let addresses = config.addresses();
        let mut errors = Vec::new();
        let mut seed = None;
        for (index, address) in addresses.iter().enumerate() {
            match Connection::open(address, config.protocol_version, &config, &self.hooks).await {
                Ok(conn) => {
                    seed = Some((index, conn));
                    break;
                }
                Err(e) => {
                    warn!(%address, error = %e, "contact point failed");
                    errors.push(e);
                }
            }
        }

        let Some((seed_index, seed)) = seed else {
            return Err(DriverError::NoHostAvailable { errors });
        };
        let version = seed.protocol_version();
        info!(address = seed.address(), protocol_version = version, "negotiated protocol version");

        let mut pool = vec![seed];
        for (index, address) in addresses.iter().enumerate().skip(seed_index) {
            let wanted = if index == seed_index {
                config.connections_per_host.saturating_sub(1)
            } else {
                config.connections_per_host
            };
            for _ in 0..wanted {
                match Connection::open(address, version, &config, &self.hooks).await {
                    Ok(conn) if conn.protocol_version() == version => pool.push(conn),
                    Ok(conn) => {
                        warn!(
                            %address,
                            protocol_version = conn.protocol_version(),
                            expected = version,
                            "skipping host with mismatched protocol version"
                        );
                        conn.close().await;
                        break;
                    }
                    Err(e) => {
                        warn!(%address, error = %e, "skipping host");
                        break;
                    }
                }
            }
        }

        debug!(connections = pool.len(), "session pool filled");
        let session = Session::new(version, config, pool, self.policy.clone());
        self.negotiated_version.store(version, Ordering::Release);

        {
            let mut sessions = self.sessions.lock();
            if !self.is_shutdown() {
                sessions.retain(|s| !s.is_shutdown());
                sessions.push(session.clone());
                return Ok(session);
            }
        }
        session.shutdown().await;
        Err(DriverError::ClusterShutdown)
    }

    /// Shut down every session opened from this cluster. Later calls do
    /// nothing.
    pub async fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        let sessions = std::mem::take(&mut *self.sessions.lock());
        for session in sessions {
            session.shutdown().await;
        }
        info!("cluster shut down");
    }
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("config", &self.config)
            .field("negotiated_version", &self.negotiated_protocol_version())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}
