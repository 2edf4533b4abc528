//! Connection and handshake lifecycle shared by both client roles.
//!
//! DISCONNECTED -> CONNECTING (dial with backoff until the connect timeout) -> CONNECTED
//! -> INITIALIZED (INIT round trip on CTRL yields the session config) -> CLOSED (after exit).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nsb_core::{
    decode, encode, ConfigParams, Intro, Message, Operation, Originator, Payload, ResultCode,
    SystemMode,
};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{ClientConfig, TransportKind};
use crate::error::ClientError;
use crate::store::{PayloadStore, RedisStore, StoreClient};
use crate::transport::{BrokerTransport, Channel, SocketTransport, Transport};

/// Pause between failed connect attempts.
pub const CONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Where the daemon keeps indirected payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreParams {
    pub address: String,
    pub port: u16,
    pub index: u32,
}

/// Negotiated once during INIT; never changes afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub system_mode: SystemMode,
    /// Present when payloads travel through the external store.
    pub store: Option<StoreParams>,
}

impl SessionConfig {
    pub fn uses_store(&self) -> bool {
        self.store.is_some()
    }
}

impl From<ConfigParams> for SessionConfig {
    fn from(p: ConfigParams) -> Self {
        let store = p.use_external_store.then(|| StoreParams {
            address: p.store_address,
            port: p.store_port,
            index: p.store_index,
        });
        Self {
            system_mode: p.system_mode,
            store,
        }
    }
}

/// Result of a liveness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingStatus {
    /// Daemon answered SUCCESS.
    Healthy,
    /// Daemon answered, but not with SUCCESS.
    Degraded,
    /// No usable answer in time.
    Unreachable,
}

/// One attempt at opening a full channel set with the configured binding.
async fn connect_once(
    config: &ClientConfig,
    identifier: &str,
) -> Result<Box<dyn Transport>, ClientError> {
    let transport: Box<dyn Transport> = match config.transport {
        TransportKind::Socket => Box::new(
            SocketTransport::connect(&config.server_address, config.server_port).await?,
        ),
        TransportKind::Broker => Box::new(
            BrokerTransport::connect(
                &config.server_address,
                config.server_port,
                &config.broker_exchange,
                identifier,
            )
            .await?,
        ),
    };
    Ok(transport)
}

/// Retry `connect_once` every `CONNECT_BACKOFF` until the connect timeout has elapsed.
pub(crate) async fn dial(
    config: &ClientConfig,
    identifier: &str,
) -> Result<Box<dyn Transport>, ClientError> {
    let window = config.connect_timeout();
    let deadline = Instant::now() + window;
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match tokio::time::timeout_at(deadline, connect_once(config, identifier)).await {
            Ok(Ok(transport)) => {
                info!(server = %config.server(), attempt, "connected to daemon");
                return Ok(transport);
            }
            Ok(Err(e)) => debug!(server = %config.server(), attempt, error = %e, "connect attempt failed"),
            Err(_) => debug!(server = %config.server(), attempt, "connect attempt timed out"),
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(ClientError::ConnectTimeout {
                address: config.server(),
                timeout: window,
            });
        }
        tokio::time::sleep(remaining.min(CONNECT_BACKOFF)).await;
    }
}

/// Send INIT on CTRL and wait for the daemon's config.
pub(crate) async fn initialize(
    transport: &dyn Transport,
    originator: Originator,
    identifier: &str,
    response_timeout: Duration,
) -> Result<SessionConfig, ClientError> {
    let init_err = |what: String| ClientError::Initialization(what);
    let ep = transport.endpoints();
    debug!(
        address = %ep.address,
        ctrl = ep.ctrl_port,
        send = ep.send_port,
        recv = ep.recv_port,
        "sending INIT"
    );
    let intro = Intro {
        identifier: identifier.to_string(),
        address: ep.address,
        ctrl_port: ep.ctrl_port,
        send_port: ep.send_port,
        recv_port: ep.recv_port,
    };
    let request = encode(&Message::init(originator, intro))
        .map_err(|e| init_err(format!("encode INIT: {}", e)))?;
    transport
        .send(Channel::Ctrl, &request)
        .await
        .map_err(|e| init_err(format!("send INIT: {}", e)))?;
    let reply = transport
        .receive(Channel::Ctrl, Some(response_timeout))
        .await
        .map_err(|e| init_err(format!("await INIT response: {}", e)))?
        .ok_or_else(|| init_err(format!("no INIT response within {:?}", response_timeout)))?;
    let msg = decode(&reply).map_err(|e| init_err(format!("malformed INIT response: {}", e)))?;
    if msg.operation() != Operation::Init {
        return Err(init_err(format!(
            "expected INIT response, got {:?}",
            msg.operation()
        )));
    }
    if msg.result_code() == ResultCode::Failure {
        return Err(init_err("daemon refused INIT".to_string()));
    }
    let params = msg
        .config
        .ok_or_else(|| init_err("INIT response carries no config".to_string()))?;
    Ok(SessionConfig::from(params))
}

/// An initialized connection: channel set, negotiated config and (optionally) the payload store.
pub(crate) struct Session {
    identifier: String,
    originator: Originator,
    transport: Box<dyn Transport>,
    config: SessionConfig,
    store: Option<StoreClient>,
    response_timeout: Duration,
    closed: AtomicBool,
    /// Deliveries that arrived after their request gave up, oldest first.
    late: Mutex<VecDeque<Message>>,
}

impl Session {
    /// Dial, handshake and open the store. `store` replaces the backend named by the daemon.
    pub(crate) async fn establish(
        config: &ClientConfig,
        identifier: String,
        originator: Originator,
        store: Option<Arc<dyn PayloadStore>>,
    ) -> Result<Self, ClientError> {
        info!(
            %identifier,
            server = %config.server(),
            "initializing client"
        );
        let transport = dial(config, &identifier).await?;
        let response_timeout = config.response_timeout();
        let session_config =
            match initialize(transport.as_ref(), originator, &identifier, response_timeout).await {
                Ok(c) => c,
                Err(e) => {
                    transport.close().await;
                    return Err(e);
                }
            };
        info!(
            mode = ?session_config.system_mode,
            store = ?session_config.store,
            "session configured"
        );
        let store = match open_store(&identifier, &session_config, store).await {
            Ok(s) => s,
            Err(e) => {
                transport.close().await;
                return Err(e);
            }
        };
        Ok(Self {
            identifier,
            originator,
            transport,
            config: session_config,
            store,
            response_timeout,
            closed: AtomicBool::new(false),
            late: Mutex::new(VecDeque::new()),
        })
    }

    pub(crate) fn identifier(&self) -> &str {
        &self.identifier
    }

    pub(crate) fn originator(&self) -> Originator {
        self.originator
    }

    pub(crate) fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub(crate) fn store(&self) -> Option<&StoreClient> {
        self.store.as_ref()
    }

    pub(crate) fn response_timeout(&self) -> Duration {
        self.response_timeout
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn ensure_open(&self) -> Result<(), ClientError> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        Ok(())
    }

    pub(crate) async fn send_message(
        &self,
        channel: Channel,
        msg: &Message,
    ) -> Result<(), ClientError> {
        self.ensure_open()?;
        let bytes = encode(msg)?;
        self.transport.send(channel, &bytes).await?;
        Ok(())
    }

    /// Next message on `channel`. Timeouts and undecodable messages are `Ok(None)`.
    pub(crate) async fn receive_message(
        &self,
        channel: Channel,
        timeout: Option<Duration>,
    ) -> Result<Option<Message>, ClientError> {
        self.ensure_open()?;
        let bytes = match self.transport.receive(channel, timeout).await? {
            Some(b) => b,
            None => return Ok(None),
        };
        match decode(&bytes) {
            Ok(msg) => Ok(Some(msg)),
            Err(e) => {
                warn!(%channel, error = %e, "dropping malformed message");
                Ok(None)
            }
        }
    }

    /// Payload to put on the wire: a store key when the session is store-backed, else the bytes.
    pub(crate) async fn outbound_payload(
        &self,
        bytes: &[u8],
    ) -> Result<(Payload, Option<String>), ClientError> {
        match &self.store {
            Some(store) => {
                let key = store.store(bytes).await?;
                Ok((Payload::Key(key.clone()), Some(key)))
            }
            None => Ok((Payload::Inline(bytes.to_vec()), None)),
        }
    }

    /// Hold a delivery no pending request asked for.
    pub(crate) fn keep_late(&self, msg: Message) {
        if let Ok(mut late) = self.late.lock() {
            late.push_back(msg);
        }
    }

    /// Oldest kept delivery that satisfies `matches`.
    pub(crate) fn take_late(&self, matches: impl Fn(&Message) -> bool) -> Option<Message> {
        let mut late = self.late.lock().ok()?;
        let idx = late.iter().position(|m| matches(m))?;
        late.remove(idx)
    }

    pub(crate) async fn ping(&self, timeout: Duration) -> Result<PingStatus, ClientError> {
        self.ensure_open()?;
        // A reply to an earlier ping that timed out must not answer this one.
        loop {
            match self.receive_message(Channel::Ctrl, Some(Duration::ZERO)).await {
                Ok(Some(stale)) => {
                    warn!(op = ?stale.operation(), code = ?stale.result_code(), "late reply on CTRL")
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "PING: receive failed");
                    return Ok(PingStatus::Unreachable);
                }
            }
        }
        if let Err(e) = self
            .send_message(Channel::Ctrl, &Message::ping(self.originator))
            .await
        {
            warn!(error = %e, "PING not sent");
            return Ok(PingStatus::Unreachable);
        }
        debug!("PING sent");
        let reply = match self.receive_message(Channel::Ctrl, Some(timeout)).await {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                info!(?timeout, "PING: no answer");
                return Ok(PingStatus::Unreachable);
            }
            Err(e) => {
                warn!(error = %e, "PING: receive failed");
                return Ok(PingStatus::Unreachable);
            }
        };
        if reply.operation() != Operation::Ping {
            warn!(op = ?reply.operation(), "PING: unexpected response");
            return Ok(PingStatus::Unreachable);
        }
        match reply.result_code() {
            ResultCode::Success => {
                info!("PING: daemon healthy");
                Ok(PingStatus::Healthy)
            }
            code => {
                info!(?code, "PING: daemon reachable but degraded");
                Ok(PingStatus::Degraded)
            }
        }
    }

    /// Send EXIT (no reply awaited) and close every channel. A second call does nothing.
    pub(crate) async fn exit(&self) -> Result<(), ClientError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let sent = match encode(&Message::exit(self.originator)) {
            Ok(bytes) => self
                .transport
                .send(Channel::Ctrl, &bytes)
                .await
                .map_err(ClientError::from),
            Err(e) => Err(e.into()),
        };
        self.transport.close().await;
        info!(identifier = %self.identifier, "client exited");
        sent
    }
}

async fn open_store(
    identifier: &str,
    config: &SessionConfig,
    injected: Option<Arc<dyn PayloadStore>>,
) -> Result<Option<StoreClient>, ClientError> {
    let params = match &config.store {
        Some(p) => p,
        None => {
            if injected.is_some() {
                debug!("daemon did not request a payload store; ignoring the provided one");
            }
            return Ok(None);
        }
    };
    let backend: Arc<dyn PayloadStore> = match injected {
        Some(b) => b,
        None => {
            let redis = RedisStore::connect(&params.address, params.port, params.index)
                .await
                .map_err(|e| {
                    ClientError::Initialization(format!(
                        "payload store {}:{} unavailable: {}",
                        params.address, params.port, e
                    ))
                })?;
            Arc::new(redis)
        }
    };
    Ok(Some(StoreClient::new(identifier, backend)))
}
