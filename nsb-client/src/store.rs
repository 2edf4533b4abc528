//! Payload store client: keeps large payloads off the daemon wire.
//!
//! Senders `store` and transmit only the key; the simulator `peek`s (non-destructive) and the
//! final receiver `check_out`s (retrieve-and-delete, single consumption).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use nsb_core::MessageKeyGenerator;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;

/// Key-value backend the store client writes through. Shared across clients; needs no cross-client locking.
#[async_trait]
pub trait PayloadStore: Send + Sync {
    async fn put(&self, key: &str, payload: &[u8]) -> Result<(), StoreError>;

    /// Read without deleting.
    async fn peek(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Read and delete atomically. A second check-out of the same key finds nothing.
    async fn check_out(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn is_connected(&self) -> bool;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Per-client view of a store: generates keys under this client's identity.
#[derive(Clone)]
pub struct StoreClient {
    backend: Arc<dyn PayloadStore>,
    keys: Arc<MessageKeyGenerator>,
}

impl StoreClient {
    pub fn new(client_id: &str, backend: Arc<dyn PayloadStore>) -> Self {
        Self {
            backend,
            keys: Arc::new(MessageKeyGenerator::new(client_id)),
        }
    }

    /// Store `payload` under a fresh key and return the key.
    pub async fn store(&self, payload: &[u8]) -> Result<String, StoreError> {
        let key = self.keys.next_key();
        self.backend.put(&key, payload).await?;
        tracing::debug!(%key, size = payload.len(), "payload stored");
        Ok(key)
    }

    pub async fn peek(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.backend.peek(key).await
    }

    pub async fn check_out(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.backend.check_out(key).await
    }

    pub async fn is_connected(&self) -> bool {
        self.backend.is_connected().await
    }
}

/// Redis-backed store, as announced by the daemon in the INIT config.
pub struct RedisStore {
    conn: MultiplexedConnection,
}

impl RedisStore {
    pub async fn connect(address: &str, port: u16, index: u32) -> Result<Self, StoreError> {
        let client = redis::Client::open(format!("redis://{}:{}/{}", address, port, index))?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl PayloadStore for RedisStore {
    async fn put(&self, key: &str, payload: &[u8]) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(key, payload).await?;
        Ok(())
    }

    async fn peek(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.get::<_, Option<Vec<u8>>>(key).await?)
    }

    async fn check_out(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.conn.clone();
        let value = redis::cmd("GETDEL")
            .arg(key)
            .query_async::<_, Option<Vec<u8>>>(&mut conn)
            .await?;
        Ok(value)
    }

    async fn is_connected(&self) -> bool {
        let mut conn = self.conn.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .is_ok()
    }
}

/// In-process store for single-host setups and tests.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl PayloadStore for MemoryStore {
    async fn put(&self, key: &str, payload: &[u8]) -> Result<(), StoreError> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), payload.to_vec());
        Ok(())
    }

    async fn peek(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned())
    }

    async fn check_out(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key))
    }

    async fn is_connected(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(id: &str) -> (StoreClient, Arc<MemoryStore>) {
        let backend = Arc::new(MemoryStore::new());
        (StoreClient::new(id, backend.clone()), backend)
    }

    #[tokio::test]
    async fn check_out_consumes_exactly_once() {
        let (store, backend) = client("alice");
        let key = store.store(b"hello world").await.unwrap();
        assert_eq!(
            store.check_out(&key).await.unwrap().as_deref(),
            Some(&b"hello world"[..])
        );
        assert_eq!(store.check_out(&key).await.unwrap(), None);
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn peek_is_repeatable_then_check_out_succeeds() {
        let (store, _) = client("sim");
        let key = store.store(b"abc").await.unwrap();
        for _ in 0..3 {
            assert_eq!(store.peek(&key).await.unwrap().as_deref(), Some(&b"abc"[..]));
        }
        assert_eq!(store.check_out(&key).await.unwrap().as_deref(), Some(&b"abc"[..]));
        assert_eq!(store.peek(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn clients_sharing_a_backend_never_collide() {
        let backend = Arc::new(MemoryStore::new());
        let a = StoreClient::new("a", backend.clone());
        let b = StoreClient::new("b", backend.clone());
        let mut keys = Vec::new();
        for i in 0..50u8 {
            keys.push(a.store(&[i]).await.unwrap());
            keys.push(b.store(&[i]).await.unwrap());
        }
        assert_eq!(backend.len(), 100);
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), 100);
    }

    #[tokio::test]
    async fn concurrent_stores_from_one_client() {
        let (store, backend) = client("busy");
        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move { store.store(&[i as u8; 32]).await.unwrap() })
            })
            .collect();
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(backend.len(), 16);
    }

    /// Needs a Redis server (>= 6.2 for GETDEL) on localhost:6379.
    #[tokio::test]
    #[ignore]
    async fn redis_store_contract() {
        let backend = Arc::new(RedisStore::connect("127.0.0.1", 6379, 0).await.unwrap());
        assert!(backend.is_connected().await);
        let store = StoreClient::new("redis-test", backend);
        let key = store.store(b"payload").await.unwrap();
        assert_eq!(store.peek(&key).await.unwrap().as_deref(), Some(&b"payload"[..]));
        assert_eq!(store.check_out(&key).await.unwrap().as_deref(), Some(&b"payload"[..]));
        assert_eq!(store.check_out(&key).await.unwrap(), None);
    }
}
