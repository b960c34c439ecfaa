//! Cluster Tests
//!
//! Configuration defaults, contact point probing, pool filling, keyspace
//! sessions and shutdown semantics.

mod common;

use std::time::Duration;

use common::{refused_address, MockOptions, MockServer, RecordingListener};
use cqlwire::{Cluster, ClusterConfig, DriverError};

// ============================================================================
// Configuration
// ============================================================================

#[test]
fn test_default_cluster_config() {
    let cluster = Cluster::new(ClusterConfig::default());
    assert_eq!(cluster.config().port, 9042);
    assert_eq!(cluster.config().contact_points, vec!["127.0.0.1".to_string()]);
    assert_eq!(cluster.config().protocol_version, 4);
    assert_eq!(cluster.negotiated_protocol_version(), None);
}

#[test]
fn test_port_override_keeps_defaults() {
    let cluster = Cluster::new(ClusterConfig::builder().port(9999).build().unwrap());
    assert_eq!(cluster.config().port, 9999);
    assert_eq!(cluster.config().contact_points, vec!["127.0.0.1".to_string()]);
    assert_eq!(cluster.config().protocol_version, 4);
}

// ============================================================================
// Contact points
// ============================================================================

#[tokio::test]
async fn test_all_contact_points_unreachable() {
    let listener = RecordingListener::new();
    let config = ClusterConfig::builder()
        .contact_points([refused_address().await, refused_address().await])
        .connect_timeout(Duration::from_millis(500))
        .build()
        .unwrap();
    let cluster = Cluster::new(config).with_event_listener(listener.clone());

    match cluster.connect().await {
        Err(DriverError::NoHostAvailable { errors }) => {
            assert_eq!(errors.len(), 2);
            assert!(errors
                .iter()
                .all(|e| matches!(e, DriverError::HostUnavailable { .. })));
        }
        other => panic!("expected NoHostAvailable, got {:?}", other),
    }
    assert_eq!(listener.with(|r| r.unavailable.len()), 2);

    // The cluster stays usable: a second attempt fails the same way.
    assert!(matches!(
        cluster.connect().await,
        Err(DriverError::NoHostAvailable { .. })
    ));
    assert!(!cluster.is_shutdown());
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_skips_unreachable_contact_point() {
    let server = MockServer::start(MockOptions::default()).await;
    let config = ClusterConfig::builder()
        .contact_points([refused_address().await, server.address()])
        .build()
        .unwrap();
    let cluster = Cluster::new(config);

    let session = cluster.connect().await.unwrap();
    assert_eq!(session.connection_count(), 1);
    assert_eq!(server.log().connections(), 1);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_pool_fills_at_negotiated_version() {
    let server = MockServer::start(MockOptions::default().versions(&[3])).await;
    let cluster = Cluster::new(server.config().connections_per_host(3).build().unwrap());

    let session = cluster.connect().await.unwrap();
    assert_eq!(session.connection_count(), 3);
    assert_eq!(session.protocol_version(), 3);
    // Only the seed connection had to step down.
    assert_eq!(server.log().startup_versions(), vec![4, 3, 3, 3]);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_connect_keyspace_switches_every_connection() {
    let server = MockServer::start(MockOptions::default()).await;
    let cluster = Cluster::new(server.config().connections_per_host(2).build().unwrap());

    let session = cluster.connect_keyspace("clustertests").await.unwrap();
    assert_eq!(session.keyspace(), Some("clustertests"));
    assert_eq!(
        server.log().queries(),
        vec![
            "USE \"clustertests\"".to_string(),
            "USE \"clustertests\"".to_string()
        ]
    );
    cluster.shutdown().await;
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test]
async fn test_shutdown_twice_is_harmless() {
    let server = MockServer::start(MockOptions::default()).await;
    let listener = RecordingListener::new();
    let cluster =
        Cluster::new(server.config().build().unwrap()).with_event_listener(listener.clone());

    let session = cluster.connect().await.unwrap();
    assert_eq!(cluster.session_count(), 1);

    cluster.shutdown().await;
    cluster.shutdown().await;
    session.shutdown().await;

    assert!(cluster.is_shutdown());
    assert!(session.is_shutdown());
    assert_eq!(cluster.session_count(), 0);
    assert_eq!(listener.with(|r| r.closed.len()), 1);
}

#[tokio::test]
async fn test_connect_after_shutdown() {
    let cluster = Cluster::new(ClusterConfig::default());
    cluster.shutdown().await;
    assert!(matches!(
        cluster.connect().await,
        Err(DriverError::ClusterShutdown)
    ));
}

#[tokio::test]
async fn test_session_unusable_after_cluster_shutdown() {
    let server = MockServer::start(MockOptions::default()).await;
    let cluster = Cluster::new(server.config().build().unwrap());
    let session = cluster.connect().await.unwrap();
    session.execute("SELECT 1").await.unwrap();

    cluster.shutdown().await;
    assert!(matches!(
        session.execute("SELECT 1").await,
        Err(DriverError::SessionShutdown)
    ));
    assert_eq!(session.connection_count(), 0);
}
