//! Connection pool keyed by logical client id.

use event_octopus_core::transport::{Connection, Transport, TransportError};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Lazily opens and caches one transport connection per client id.
///
/// The cache lock is held while a connection is being opened, so concurrent
/// requests for the same unseen id never open two connections.
pub struct ConnectionPool {
    transport: Arc<dyn Transport>,
    connections: Mutex<HashMap<String, Arc<dyn Connection>>>,
}

impl ConnectionPool {
    /// Create an empty pool over `transport`.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Return the cached connection for `client_id`, opening it on first use.
    ///
    /// # Errors
    ///
    /// Propagates the transport's connect error unchanged; nothing is cached.
    pub async fn get_connection(
        &self,
        client_id: &str,
    ) -> Result<Arc<dyn Connection>, TransportError> {
        let mut connections = self.connections.lock().await;
        if let Some(connection) = connections.get(client_id) {
            return Ok(Arc::clone(connection));
        }

        let connection = self.transport.connect(client_id).await?;
        connections.insert(client_id.to_string(), Arc::clone(&connection));

        tracing::info!(client_id = %client_id, "Connection opened");
        Ok(connection)
    }

    /// Forget the connection for `client_id` without closing it.
    pub async fn evict(&self, client_id: &str) -> Option<Arc<dyn Connection>> {
        self.connections.lock().await.remove(client_id)
    }

    /// Close and forget the connection for `client_id`.
    ///
    /// Returns `false` if no connection was cached.
    ///
    /// # Errors
    ///
    /// Propagates the transport's close error. The connection is forgotten
    /// either way.
    pub async fn close(&self, client_id: &str) -> Result<bool, TransportError> {
        let Some(connection) = self.evict(client_id).await else {
            return Ok(false);
        };
        connection.close().await?;

        tracing::info!(client_id = %client_id, "Connection closed");
        Ok(true)
    }

    /// Close and forget every connection. Close failures are logged.
    pub async fn close_all(&self) {
        let drained: Vec<(String, Arc<dyn Connection>)> =
            self.connections.lock().await.drain().collect();

        for (client_id, connection) in drained {
            if let Err(error) = connection.close().await {
                tracing::warn!(client_id = %client_id, error = %error, "Failed to close connection");
            }
        }
    }

    /// Whether a connection is cached for `client_id`.
    pub async fn contains(&self, client_id: &str) -> bool {
        self.connections.lock().await.contains_key(client_id)
    }

    /// Number of cached connections.
    pub async fn len(&self) -> usize {
        self.connections.lock().await.len()
    }

    /// Whether the pool is empty.
    pub async fn is_empty(&self) -> bool {
        self.connections.lock().await.is_empty()
    }
}
