//! Blocking wrappers for sequential, thread-per-caller code.
//!
//! Each wrapper owns a single-threaded runtime and drives the async client on it. Do not call
//! these from inside an async context.

use std::sync::Arc;
use std::time::Duration;

use nsb_core::{Message, Payload};
use tokio::runtime::Runtime;

use crate::client::{self, Fetched};
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::session::{PingStatus, SessionConfig};
use crate::store::PayloadStore;

fn runtime() -> Result<Runtime, ClientError> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(ClientError::Runtime)
}

/// Blocking `client::AppClient`.
pub struct AppClient {
    // Dropped before the runtime it was created on.
    inner: client::AppClient,
    rt: Runtime,
}

impl AppClient {
    pub fn connect(identifier: impl Into<String>, config: &ClientConfig) -> Result<Self, ClientError> {
        let rt = runtime()?;
        let inner = rt.block_on(client::AppClient::connect(identifier, config))?;
        Ok(Self { inner, rt })
    }

    pub fn connect_with_store(
        identifier: impl Into<String>,
        config: &ClientConfig,
        store: Arc<dyn PayloadStore>,
    ) -> Result<Self, ClientError> {
        let rt = runtime()?;
        let inner = rt.block_on(client::AppClient::connect_with_store(identifier, config, store))?;
        Ok(Self { inner, rt })
    }

    pub fn identifier(&self) -> &str {
        self.inner.identifier()
    }

    pub fn session_config(&self) -> &SessionConfig {
        self.inner.session_config()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn ping(&self) -> Result<PingStatus, ClientError> {
        self.rt.block_on(self.inner.ping())
    }

    pub fn ping_timeout(&self, timeout: Duration) -> Result<PingStatus, ClientError> {
        self.rt.block_on(self.inner.ping_timeout(timeout))
    }

    pub fn send(&self, destination: &str, payload: &[u8]) -> Result<Option<String>, ClientError> {
        self.rt.block_on(self.inner.send(destination, payload))
    }

    pub fn receive(
        &self,
        destination: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<Option<Message>, ClientError> {
        self.rt.block_on(self.inner.receive(destination, timeout))
    }

    pub fn exit(&self) -> Result<(), ClientError> {
        self.rt.block_on(self.inner.exit())
    }
}

/// Blocking `client::SimClient`.
pub struct SimClient {
    inner: client::SimClient,
    rt: Runtime,
}

impl SimClient {
    pub fn connect(identifier: impl Into<String>, config: &ClientConfig) -> Result<Self, ClientError> {
        let rt = runtime()?;
        let inner = rt.block_on(client::SimClient::connect(identifier, config))?;
        Ok(Self { inner, rt })
    }

    pub fn connect_with_store(
        identifier: impl Into<String>,
        config: &ClientConfig,
        store: Arc<dyn PayloadStore>,
    ) -> Result<Self, ClientError> {
        let rt = runtime()?;
        let inner = rt.block_on(client::SimClient::connect_with_store(identifier, config, store))?;
        Ok(Self { inner, rt })
    }

    pub fn identifier(&self) -> &str {
        self.inner.identifier()
    }

    pub fn session_config(&self) -> &SessionConfig {
        self.inner.session_config()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn ping(&self) -> Result<PingStatus, ClientError> {
        self.rt.block_on(self.inner.ping())
    }

    pub fn ping_timeout(&self, timeout: Duration) -> Result<PingStatus, ClientError> {
        self.rt.block_on(self.inner.ping_timeout(timeout))
    }

    pub fn fetch(
        &self,
        source: Option<&str>,
        timeout: Option<Duration>,
        want_payload: bool,
    ) -> Result<Option<Fetched>, ClientError> {
        self.rt.block_on(self.inner.fetch(source, timeout, want_payload))
    }

    pub fn post(
        &self,
        source: &str,
        destination: &str,
        payload: Payload,
        payload_size: u64,
        success: bool,
    ) -> Result<(), ClientError> {
        self.rt
            .block_on(self.inner.post(source, destination, payload, payload_size, success))
    }

    pub fn post_fetched(&self, fetched: &Fetched, success: bool) -> Result<(), ClientError> {
        self.rt.block_on(self.inner.post_fetched(fetched, success))
    }

    pub fn exit(&self) -> Result<(), ClientError> {
        self.rt.block_on(self.inner.exit())
    }
}
