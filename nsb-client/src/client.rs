//! Application and simulator roles on top of a shared session.
//!
//! PULL sessions request each delivery on RECV and wait for a MESSAGE/NO_MESSAGE answer;
//! PUSH sessions just wait on RECV for whatever the daemon forwards.

use std::sync::Arc;
use std::time::Duration;

use nsb_core::{Message, Operation, Originator, Payload, ProtocolError, ResultCode, SystemMode};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::session::{PingStatus, Session, SessionConfig};
use crate::store::PayloadStore;
use crate::transport::Channel;

/// Check a RECV-channel reply before it is resolved. `None` means "no usable delivery".
fn accept_delivery(msg: Message, expected: Operation) -> Option<Message> {
    let op = msg.operation();
    if op != expected && op != Operation::Forward {
        warn!(?op, ?expected, "ignoring unexpected response");
        return None;
    }
    match msg.result_code() {
        ResultCode::Message => Some(msg),
        ResultCode::NoMessage => {
            debug!(?op, "no message available");
            None
        }
        code => {
            warn!(?op, ?code, "ignoring response with unexpected result code");
            None
        }
    }
}

/// One PULL round trip on RECV.
///
/// Replies that arrived after an earlier request timed out are drained first. Deliveries among
/// them are kept and handed to the first request they match, so a late reply is never taken as
/// the answer to a different request. A reply that does not match `matches` is kept the same way.
async fn pull(
    session: &Session,
    request: &Message,
    expected: Operation,
    timeout: Duration,
    matches: impl Fn(&Message) -> bool,
) -> Result<Option<Message>, ClientError> {
    while let Some(stale) = session
        .receive_message(Channel::Recv, Some(Duration::ZERO))
        .await?
    {
        warn!(op = ?stale.operation(), code = ?stale.result_code(), "late reply on RECV");
        if let Some(delivery) = accept_delivery(stale, expected) {
            session.keep_late(delivery);
        }
    }
    if let Some(found) = session.take_late(&matches) {
        debug!(?expected, "answered from a late reply");
        return Ok(Some(found));
    }
    session.send_message(Channel::Recv, request).await?;
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let msg = match session.receive_message(Channel::Recv, Some(remaining)).await? {
            Some(m) => m,
            None => return Ok(None),
        };
        let msg = match accept_delivery(msg, expected) {
            Some(m) => m,
            None => return Ok(None),
        };
        if matches(&msg) {
            return Ok(Some(msg));
        }
        warn!(
            from = msg.source_id().unwrap_or(""),
            to = msg.destination_id().unwrap_or(""),
            "reply belongs to another request; keeping it"
        );
        session.keep_late(msg);
    }
}

/// Application endpoint: sends payloads to peers and receives the ones delivered to it.
pub struct AppClient {
    session: Session,
}

impl AppClient {
    /// Dial the daemon and complete INIT. Fails with `ConnectTimeout` or `Initialization`.
    pub async fn connect(
        identifier: impl Into<String>,
        config: &ClientConfig,
    ) -> Result<Self, ClientError> {
        let session =
            Session::establish(config, identifier.into(), Originator::AppClient, None).await?;
        Ok(Self { session })
    }

    /// Like `connect`, but payload indirection goes through `store` instead of the store the daemon names.
    pub async fn connect_with_store(
        identifier: impl Into<String>,
        config: &ClientConfig,
        store: Arc<dyn PayloadStore>,
    ) -> Result<Self, ClientError> {
        let session =
            Session::establish(config, identifier.into(), Originator::AppClient, Some(store))
                .await?;
        Ok(Self { session })
    }

    pub fn identifier(&self) -> &str {
        self.session.identifier()
    }

    pub fn session_config(&self) -> &SessionConfig {
        self.session.config()
    }

    pub fn is_closed(&self) -> bool {
        self.session.is_closed()
    }

    /// Liveness check bounded by the response timeout.
    pub async fn ping(&self) -> Result<PingStatus, ClientError> {
        self.session.ping(self.session.response_timeout()).await
    }

    pub async fn ping_timeout(&self, timeout: Duration) -> Result<PingStatus, ClientError> {
        self.session.ping(timeout).await
    }

    /// Send `payload` to `destination`. Fire-and-forget; returns the store key when the payload was indirected.
    pub async fn send(
        &self,
        destination: &str,
        payload: &[u8],
    ) -> Result<Option<String>, ClientError> {
        self.session.ensure_open()?;
        let (body, key) = self.session.outbound_payload(payload).await?;
        let msg = Message::send(
            self.session.originator(),
            self.identifier(),
            destination,
            body,
            payload.len() as u64,
        );
        self.session.send_message(Channel::Send, &msg).await?;
        info!(
            to = destination,
            size = payload.len(),
            key = key.as_deref().unwrap_or(""),
            "SEND"
        );
        Ok(key)
    }

    /// Receive a payload addressed to `destination` (default: this client).
    ///
    /// PULL: requests one delivery and waits up to `timeout` (default: the response timeout).
    /// PUSH: waits on RECV; `None` blocks, `Some(Duration::ZERO)` polls.
    /// Returns the whole message with any store reference already resolved to bytes.
    pub async fn receive(
        &self,
        destination: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<Option<Message>, ClientError> {
        self.session.ensure_open()?;
        match self.session.config().system_mode {
            SystemMode::Pull => {
                let dest = destination.unwrap_or_else(|| self.identifier());
                let request = Message::receive_request(self.session.originator(), dest);
                debug!(destination = dest, "RECEIVE requested");
                let timeout = timeout.unwrap_or_else(|| self.session.response_timeout());
                let reply = pull(&self.session, &request, Operation::Receive, timeout, |m| {
                    m.destination_id() == Some(dest)
                })
                .await?;
                match reply {
                    Some(msg) => self.resolve(msg).await,
                    None => Ok(None),
                }
            }
            SystemMode::Push => self.await_delivery(timeout).await,
        }
    }

    /// Wait for the next delivery without issuing a request. Cancel-safe: drop the future to stop listening.
    pub async fn listen(&self) -> Result<Option<Message>, ClientError> {
        self.await_delivery(None).await
    }

    async fn await_delivery(
        &self,
        timeout: Option<Duration>,
    ) -> Result<Option<Message>, ClientError> {
        let msg = match self.session.receive_message(Channel::Recv, timeout).await? {
            Some(m) => m,
            None => return Ok(None),
        };
        match accept_delivery(msg, Operation::Receive) {
            Some(m) => self.resolve(m).await,
            None => Ok(None),
        }
    }

    /// Swap a store key for the checked-out bytes.
    async fn resolve(&self, mut msg: Message) -> Result<Option<Message>, ClientError> {
        if let Some(key) = msg.payload_key().map(str::to_string) {
            let store = match self.session.store() {
                Some(s) => s,
                None => {
                    warn!(%key, "delivery carries a store key but the session has no store");
                    return Ok(None);
                }
            };
            match store.check_out(&key).await? {
                Some(bytes) => msg.payload = Some(Payload::Inline(bytes)),
                None => {
                    warn!(%key, "payload already checked out or expired");
                    return Ok(None);
                }
            }
        }
        info!(
            from = msg.source_id().unwrap_or(""),
            to = msg.destination_id().unwrap_or(""),
            size = msg.payload_size(),
            "RECEIVE"
        );
        Ok(Some(msg))
    }

    /// Send EXIT and close all channels. Later operations fail with `Closed`.
    pub async fn exit(&self) -> Result<(), ClientError> {
        self.session.exit().await
    }
}

/// A payload the simulator fetched. `payload` holds bytes peeked from the store when requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetched {
    pub message: Message,
    pub payload: Option<Vec<u8>>,
}

impl Fetched {
    /// Payload bytes: the peeked ones, else the ones carried inline.
    pub fn payload_bytes(&self) -> Option<&[u8]> {
        self.payload
            .as_deref()
            .or_else(|| self.message.payload_bytes())
    }

    /// Store key, when the payload was indirected.
    pub fn key(&self) -> Option<&str> {
        self.message.payload_key()
    }

    pub fn source_id(&self) -> Option<&str> {
        self.message.source_id()
    }

    pub fn destination_id(&self) -> Option<&str> {
        self.message.destination_id()
    }

    pub fn payload_size(&self) -> u64 {
        self.message.payload_size()
    }
}

/// Simulator endpoint: fetches payloads to carry through the simulated network and posts them back.
pub struct SimClient {
    session: Session,
}

impl SimClient {
    pub async fn connect(
        identifier: impl Into<String>,
        config: &ClientConfig,
    ) -> Result<Self, ClientError> {
        let session =
            Session::establish(config, identifier.into(), Originator::SimClient, None).await?;
        Ok(Self { session })
    }

    pub async fn connect_with_store(
        identifier: impl Into<String>,
        config: &ClientConfig,
        store: Arc<dyn PayloadStore>,
    ) -> Result<Self, ClientError> {
        let session =
            Session::establish(config, identifier.into(), Originator::SimClient, Some(store))
                .await?;
        Ok(Self { session })
    }

    pub fn identifier(&self) -> &str {
        self.session.identifier()
    }

    pub fn session_config(&self) -> &SessionConfig {
        self.session.config()
    }

    pub fn is_closed(&self) -> bool {
        self.session.is_closed()
    }

    pub async fn ping(&self) -> Result<PingStatus, ClientError> {
        self.session.ping(self.session.response_timeout()).await
    }

    pub async fn ping_timeout(&self, timeout: Duration) -> Result<PingStatus, ClientError> {
        self.session.ping(timeout).await
    }

    /// Fetch the next payload to simulate, optionally only from `source`.
    ///
    /// Timeout semantics match `AppClient::receive`. With a store-backed session the payload
    /// is peeked (never consumed) and only when `want_payload` is set; otherwise just the key comes back.
    pub async fn fetch(
        &self,
        source: Option<&str>,
        timeout: Option<Duration>,
        want_payload: bool,
    ) -> Result<Option<Fetched>, ClientError> {
        self.session.ensure_open()?;
        match self.session.config().system_mode {
            SystemMode::Pull => {
                let request = Message::fetch_request(self.session.originator(), source);
                debug!(source = source.unwrap_or("*"), "FETCH requested");
                let timeout = timeout.unwrap_or_else(|| self.session.response_timeout());
                let reply = pull(&self.session, &request, Operation::Fetch, timeout, |m| {
                    source.is_none() || m.source_id() == source
                })
                .await?;
                match reply {
                    Some(msg) => self.resolve(msg, want_payload).await,
                    None => Ok(None),
                }
            }
            SystemMode::Push => self.await_fetch(timeout, want_payload).await,
        }
    }

    /// Wait for the next forwarded payload without issuing a request. Cancel-safe.
    pub async fn listen(&self, want_payload: bool) -> Result<Option<Fetched>, ClientError> {
        self.await_fetch(None, want_payload).await
    }

    async fn await_fetch(
        &self,
        timeout: Option<Duration>,
        want_payload: bool,
    ) -> Result<Option<Fetched>, ClientError> {
        let msg = match self.session.receive_message(Channel::Recv, timeout).await? {
            Some(m) => m,
            None => return Ok(None),
        };
        match accept_delivery(msg, Operation::Fetch) {
            Some(m) => self.resolve(m, want_payload).await,
            None => Ok(None),
        }
    }

    /// Peek the stored payload when asked for it.
    async fn resolve(
        &self,
        msg: Message,
        want_payload: bool,
    ) -> Result<Option<Fetched>, ClientError> {
        let mut payload = None;
        if want_payload {
            if let (Some(key), Some(store)) = (msg.payload_key(), self.session.store()) {
                match store.peek(key).await? {
                    Some(bytes) => payload = Some(bytes),
                    None => {
                        warn!(%key, "fetched key not found in store");
                        return Ok(None);
                    }
                }
            }
        }
        info!(
            from = msg.source_id().unwrap_or(""),
            to = msg.destination_id().unwrap_or(""),
            size = msg.payload_size(),
            "FETCH"
        );
        Ok(Some(Fetched {
            message: msg,
            payload,
        }))
    }

    /// Hand a payload back after simulation. `success == false` reports a drop (NO_MESSAGE, no payload).
    ///
    /// Inline bytes are stored first when the session is store-backed; an existing key is passed through.
    pub async fn post(
        &self,
        source: &str,
        destination: &str,
        payload: Payload,
        payload_size: u64,
        success: bool,
    ) -> Result<(), ClientError> {
        self.session.ensure_open()?;
        let payload = match (payload, self.session.store()) {
            (Payload::Inline(bytes), Some(store)) if success => Payload::Key(store.store(&bytes).await?),
            (Payload::Key(key), Some(store)) if !success => {
                // Nobody will check a dropped payload out; release it now.
                if let Err(e) = store.check_out(&key).await {
                    warn!(%key, error = %e, "could not release dropped payload");
                }
                Payload::Key(key)
            }
            (p, _) => p,
        };
        let msg = Message::post(
            self.session.originator(),
            source,
            destination,
            payload,
            payload_size,
            success,
        );
        self.session.send_message(Channel::Send, &msg).await?;
        info!(
            from = source,
            to = destination,
            size = payload_size,
            success,
            "POST"
        );
        Ok(())
    }

    /// Post a previously fetched payload back, keeping its routing metadata and payload reference.
    pub async fn post_fetched(&self, fetched: &Fetched, success: bool) -> Result<(), ClientError> {
        let (source, destination) = match (fetched.source_id(), fetched.destination_id()) {
            (Some(s), Some(d)) => (s, d),
            _ => {
                return Err(ProtocolError::Invalid("fetched message has no routing metadata").into())
            }
        };
        let payload = fetched
            .message
            .payload
            .clone()
            .or_else(|| fetched.payload.clone().map(Payload::Inline))
            .unwrap_or(Payload::Inline(Vec::new()));
        self.post(
            source,
            destination,
            payload,
            fetched.payload_size(),
            success,
        )
        .await
    }

    pub async fn exit(&self) -> Result<(), ClientError> {
        self.session.exit().await
    }
}
