//! NSB clients: application and simulator endpoints that talk to the NSB daemon over
//! three channels (CTRL, SEND, RECV), with optional payload indirection through an external store.
//!
//! ```no_run
//! # async fn demo() -> Result<(), nsb_client::ClientError> {
//! let config = nsb_client::config::load();
//! let app = nsb_client::AppClient::connect("alice", &config).await?;
//! app.send("bob", b"hello world").await?;
//! app.exit().await?;
//! # Ok(())
//! # }
//! ```

pub mod blocking;
pub mod client;
pub mod config;
pub mod error;
pub mod session;
pub mod store;
pub mod transport;

pub use client::{AppClient, Fetched, SimClient};
pub use config::{ClientConfig, TransportKind};
pub use error::ClientError;
pub use session::{PingStatus, SessionConfig, StoreParams};
pub use store::{MemoryStore, PayloadStore, RedisStore, StoreClient, StoreError};
pub use transport::{Channel, Transport, TransportError};

pub use nsb_core::{Message, Payload, SystemMode};
