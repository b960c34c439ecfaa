//! Connection selection inside a session.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::connection::Connection;

/// Orders a session's live connections for one request.
///
/// The session tries candidates in the returned order, moving on when a
/// connection has no free stream id.
pub trait ConnectionPolicy: Send + Sync {
    fn candidates(&self, pool: &[Arc<Connection>]) -> Vec<Arc<Connection>>;
}

/// Rotates the starting connection on every request.
#[derive(Debug, Default)]
pub struct RoundRobinPolicy {
    next_index: AtomicUsize,
}

impl RoundRobinPolicy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConnectionPolicy for RoundRobinPolicy {
    fn candidates(&self, pool: &[Arc<Connection>]) -> Vec<Arc<Connection>> {
        if pool.is_empty() {
            return Vec::new();
        }
        let start = self.next_index.fetch_add(1, Ordering::Relaxed) % pool.len();
        pool[start..].iter().chain(&pool[..start]).cloned().collect()
    }
}

/// Prefers the connection with the fewest requests in flight.
#[derive(Debug, Default, Clone, Copy)]
pub struct LeastBusyPolicy;

impl ConnectionPolicy for LeastBusyPolicy {
    fn candidates(&self, pool: &[Arc<Connection>]) -> Vec<Arc<Connection>> {
        let mut ranked: Vec<(usize, Arc<Connection>)> = pool
            .iter()
            .map(|conn| (conn.in_flight(), conn.clone()))
            .collect();
        ranked.sort_by_key(|(load, _)| *load);
        ranked.into_iter().map(|(_, conn)| conn).collect()
    }
}

pub type SharedConnectionPolicy = Arc<dyn ConnectionPolicy>;

pub fn default_policy() -> SharedConnectionPolicy {
    Arc::new(RoundRobinPolicy::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_pool_has_no_candidates() {
        assert!(RoundRobinPolicy::new().candidates(&[]).is_empty());
        assert!(LeastBusyPolicy.candidates(&[]).is_empty());
        assert!(default_policy().candidates(&[]).is_empty());
    }
}
