//! Per-client destination registry
//!
//! Maps a client connection to the one destination dialed for it. TCP keys
//! connections by peer address; QUIC keys them by connection id, since one
//! client socket can carry several connections. Dialing happens outside any map lock; concurrent callers for the
//! same client race on insert and the loser closes its own dial.

use crate::StreamError;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt;
use std::hash::Hash;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

/// A dialed destination that can be told to close
pub trait Destination: Send + Sync + 'static {
    /// Cancel every relay task using this destination
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Opens destinations of one kind
#[async_trait]
pub trait DestinationDialer: Send + Sync + 'static {
    type Conn: Destination;

    async fn dial(&self, host: &str, port: &str) -> Result<Self::Conn, StreamError>;
}

pub struct ConnectionRegistry<D: DestinationDialer, K = SocketAddr> {
    dialer: D,
    conns: DashMap<K, Arc<D::Conn>>,
}

impl<D, K> ConnectionRegistry<D, K>
where
    D: DestinationDialer,
    K: Eq + Hash + Clone + fmt::Debug,
{
    pub fn new(dialer: D) -> Self {
        Self {
            dialer,
            conns: DashMap::new(),
        }
    }

    /// Destination for `client`, dialing `host:port` if there is none yet
    pub async fn get_or_create(
        &self,
        client: K,
        host: &str,
        port: &str,
    ) -> Result<Arc<D::Conn>, StreamError> {
        if let Some(conn) = self.conns.get(&client).map(|c| Arc::clone(c.value())) {
            return Ok(conn);
        }

        let conn = Arc::new(self.dialer.dial(host, port).await?);

        match self.conns.entry(client.clone()) {
            Entry::Occupied(entry) => {
                let winner = Arc::clone(entry.get());
                drop(entry);
                debug!(client = ?client, "Lost destination insert race, closing duplicate dial");
                conn.close();
                Ok(winner)
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&conn));
                Ok(conn)
            }
        }
    }

    pub fn get(&self, client: &K) -> Option<Arc<D::Conn>> {
        self.conns.get(client).map(|c| Arc::clone(c.value()))
    }

    /// Remove and close the destination of `client`, if any
    pub fn delete(&self, client: &K) {
        if let Some((_, conn)) = self.conns.remove(client) {
            conn.close();
        }
    }

    pub fn close_all(&self) {
        self.conns.retain(|_, conn| {
            conn.close();
            false
        });
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug, Default)]
    struct MockConn {
        closed: AtomicBool,
    }

    impl Destination for MockConn {
        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    #[derive(Default)]
    struct CountingDialer {
        dials: Arc<AtomicUsize>,
        delay: Duration,
        fail: bool,
    }

    #[async_trait]
    impl DestinationDialer for CountingDialer {
        type Conn = MockConn;

        async fn dial(&self, host: &str, port: &str) -> Result<MockConn, StreamError> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(StreamError::Dial {
                    address: format!("{}:{}", host, port),
                    source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
                });
            }
            Ok(MockConn::default())
        }
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[tokio::test]
    async fn test_get_or_create_reuses_entry() {
        let dialer = CountingDialer::default();
        let dials = dialer.dials.clone();
        let registry = ConnectionRegistry::new(dialer);

        let a = registry.get_or_create(addr(1), "h", "1").await.unwrap();
        let b = registry.get_or_create(addr(1), "h", "1").await.unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(dials.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_same_client_keeps_one_entry() {
        let dialer = CountingDialer {
            delay: Duration::from_millis(20),
            ..Default::default()
        };
        let registry = Arc::new(ConnectionRegistry::new(dialer));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.get_or_create(addr(7), "h", "1").await })
            })
            .collect();

        let mut conns = Vec::new();
        for handle in handles {
            conns.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(registry.len(), 1);
        let winner = registry.get(&addr(7)).unwrap();
        assert!(!winner.is_closed());
        for conn in &conns {
            assert!(Arc::ptr_eq(conn, &winner));
        }
    }

    #[tokio::test]
    async fn test_distinct_clients_get_distinct_destinations() {
        let dialer = CountingDialer::default();
        let dials = dialer.dials.clone();
        let registry = Arc::new(ConnectionRegistry::new(dialer));

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.get_or_create(addr(100 + i), "h", "1").await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(registry.len(), 16);
        assert_eq!(dials.load(Ordering::SeqCst), 16);
    }

    #[tokio::test]
    async fn test_failed_dial_leaves_no_entry() {
        let registry = ConnectionRegistry::new(CountingDialer {
            fail: true,
            ..Default::default()
        });

        let err = registry.get_or_create(addr(1), "h", "1").await.unwrap_err();
        assert!(matches!(err, StreamError::Dial { .. }));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_delete_closes_and_is_idempotent() {
        let registry = ConnectionRegistry::new(CountingDialer::default());
        let conn = registry.get_or_create(addr(1), "h", "1").await.unwrap();

        registry.delete(&addr(1));
        assert!(conn.is_closed());
        assert!(registry.is_empty());

        registry.delete(&addr(1));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_connection_id_keys() {
        let registry: ConnectionRegistry<CountingDialer, usize> =
            ConnectionRegistry::new(CountingDialer::default());
        let a = registry.get_or_create(1, "a", "1").await.unwrap();
        let b = registry.get_or_create(2, "b", "1").await.unwrap();
        assert!(!Arc::ptr_eq(&a, &b));

        registry.delete(&2);
        assert!(b.is_closed());
        assert!(!a.is_closed());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_close_all() {
        let registry = ConnectionRegistry::new(CountingDialer::default());
        let a = registry.get_or_create(addr(1), "h", "1").await.unwrap();
        let b = registry.get_or_create(addr(2), "h", "1").await.unwrap();

        registry.close_all();
        assert!(a.is_closed());
        assert!(b.is_closed());
        assert!(registry.is_empty());
    }
}
