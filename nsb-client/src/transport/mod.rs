//! Channel transport: three independent channels to the daemon, each with framed send and timed receive.
//!
//! `receive` timeout semantics shared by every binding:
//! - `None` waits until a message arrives or the transport is closed,
//! - `Some(Duration::ZERO)` polls,
//! - `Some(t)` waits up to `t`.
//!
//! A timeout is `Ok(None)`, never an error. Sends and receives are cancel-safe: dropping a
//! pending `receive` loses no bytes, dropping a pending `send` never splits a message, and the
//! channel stays usable either way.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use nsb_core::{FrameDecodeError, FrameEncodeError};

pub mod broker;
pub mod socket;

pub use broker::BrokerTransport;
pub use socket::SocketTransport;

/// Logical channel. CTRL carries handshake/ping/exit, SEND outbound payloads, RECV inbound payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Ctrl,
    Send,
    Recv,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Ctrl, Channel::Send, Channel::Recv];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Ctrl => "ctrl",
            Channel::Send => "send",
            Channel::Recv => "recv",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Local view of the connection, reported to the daemon in INIT.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Endpoints {
    pub address: String,
    pub ctrl_port: u16,
    pub send_port: u16,
    pub recv_port: u16,
}

/// Capability set both bindings provide. Object-safe (`Box<dyn Transport>`).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transmit one whole message on `channel`, or fail. Dropping the future never leaves a
    /// partial message on the wire.
    async fn send(&self, channel: Channel, message: &[u8]) -> Result<(), TransportError>;

    /// Next whole message on `channel`; `Ok(None)` on timeout.
    async fn receive(
        &self,
        channel: Channel,
        timeout: Option<Duration>,
    ) -> Result<Option<Vec<u8>>, TransportError>;

    /// Release all channels. Idempotent; pending receives fail with `Closed`.
    async fn close(&self);

    fn is_closed(&self) -> bool;

    fn endpoints(&self) -> Endpoints;
}

/// Error at the transport level. The channel should be treated as suspect afterwards.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("broker error: {0}")]
    Broker(#[from] lapin::Error),
    #[error("frame encode error: {0}")]
    Encode(#[from] FrameEncodeError),
    #[error("frame decode error: {0}")]
    Decode(#[from] FrameDecodeError),
    #[error("channel closed")]
    Closed,
}

/// Apply receive timeout semantics to a pending read.
pub(crate) async fn with_timeout<F>(
    timeout: Option<Duration>,
    read: F,
) -> Result<Option<Vec<u8>>, TransportError>
where
    F: Future<Output = Result<Vec<u8>, TransportError>>,
{
    match timeout {
        None => read.await.map(Some),
        Some(t) => match tokio::time::timeout(t, read).await {
            Ok(r) => r.map(Some),
            Err(_) => Ok(None),
        },
    }
}
