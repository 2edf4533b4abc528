//! Client-level errors. Receive timeouts are `Ok(None)`, not errors.

use std::time::Duration;

use nsb_core::{FrameEncodeError, ProtocolError};

use crate::store::StoreError;
use crate::transport::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// No complete channel set within the connect window. Not retried further.
    #[error("could not connect to {address} within {timeout:?}")]
    ConnectTimeout { address: String, timeout: Duration },
    /// Handshake produced no usable config; the client is unusable.
    #[error("initialization failed: {0}")]
    Initialization(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("message encode error: {0}")]
    Encode(#[from] FrameEncodeError),
    #[error("payload store error: {0}")]
    Store(#[from] StoreError),
    /// The blocking facade could not start its runtime.
    #[error("runtime error: {0}")]
    Runtime(#[source] std::io::Error),
    /// Operation attempted after `exit`.
    #[error("client is closed")]
    Closed,
}
