//! Minimal in-test daemon: socket transport only, one task, buffers like the real daemon.
//!
//! PULL: SEND is queued for FETCH, delivered POSTs are queued for RECEIVE.
//! PUSH: SEND is forwarded to the registered simulator (or straight to the destination when
//! there is none), delivered POSTs are forwarded to the destination.
//!
//! `ManualDaemon` instead hands the raw channels to the test, which answers when it likes.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nsb_client::ClientConfig;
use nsb_core::{
    decode, encode, encode_frame, ConfigParams, Message, Operation, Originator, ResultCode,
    SystemMode,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn config(port: u16) -> ClientConfig {
    ClientConfig::new("127.0.0.1", port)
        .with_connect_timeout(Duration::from_secs(2))
        .with_response_timeout(Duration::from_secs(5))
}

#[derive(Debug, Clone, Copy)]
pub struct DaemonOptions {
    pub mode: SystemMode,
    pub use_store: bool,
    /// When false the daemon accepts connections but never answers INIT.
    pub answer_init: bool,
}

impl DaemonOptions {
    pub fn pull() -> Self {
        Self {
            mode: SystemMode::Pull,
            use_store: false,
            answer_init: true,
        }
    }

    pub fn push() -> Self {
        Self {
            mode: SystemMode::Push,
            ..Self::pull()
        }
    }

    pub fn with_store(mut self) -> Self {
        self.use_store = true;
        self
    }

    pub fn silent(mut self) -> Self {
        self.answer_init = false;
        self
    }
}

pub struct FakeDaemon {
    pub port: u16,
    wire: Arc<Mutex<Vec<(Operation, usize)>>>,
    task: JoinHandle<()>,
}

impl FakeDaemon {
    pub async fn start(opts: DaemonOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let wire = Arc::new(Mutex::new(Vec::new()));
        let task = tokio::spawn(run(listener, opts, wire.clone()));
        Self { port, wire, task }
    }

    /// Framed sizes of every message of `op` the daemon has read.
    pub fn wire_sizes(&self, op: Operation) -> Vec<usize> {
        self.wire
            .lock()
            .unwrap()
            .iter()
            .filter(|(o, _)| *o == op)
            .map(|(_, n)| *n)
            .collect()
    }
}

impl Drop for FakeDaemon {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Registered {
    originator: Originator,
    recv_port: u16,
}

struct State {
    opts: DaemonOptions,
    writers: HashMap<u16, OwnedWriteHalf>,
    clients: HashMap<String, Registered>,
    tx_buffer: VecDeque<Message>,
    rx_buffer: VecDeque<Message>,
}

async fn run(listener: TcpListener, opts: DaemonOptions, wire: Arc<Mutex<Vec<(Operation, usize)>>>) {
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let mut state = State {
        opts,
        writers: HashMap::new(),
        clients: HashMap::new(),
        tx_buffer: VecDeque::new(),
        rx_buffer: VecDeque::new(),
    };
    loop {
        tokio::select! {
            // Accept first so a client's three channels are all known before its INIT is handled.
            biased;
            accepted = listener.accept() => {
                let Ok((stream, peer)) = accepted else { return };
                let (reader, writer) = stream.into_split();
                state.writers.insert(peer.port(), writer);
                tokio::spawn(read_frames(reader, peer.port(), events_tx.clone(), wire.clone()));
            }
            Some((port, msg)) = events_rx.recv() => state.handle(port, msg).await,
        }
    }
}

async fn read_frames(
    mut reader: OwnedReadHalf,
    port: u16,
    events: mpsc::UnboundedSender<(u16, Message)>,
    wire: Arc<Mutex<Vec<(Operation, usize)>>>,
) {
    loop {
        let mut len = [0u8; 4];
        if reader.read_exact(&mut len).await.is_err() {
            return;
        }
        let mut body = vec![0u8; u32::from_le_bytes(len) as usize];
        if reader.read_exact(&mut body).await.is_err() {
            return;
        }
        let Ok(msg) = decode(&body) else { continue };
        wire.lock().unwrap().push((msg.operation(), 4 + body.len()));
        if events.send((port, msg)).is_err() {
            return;
        }
    }
}

pub fn relabel(mut msg: Message, operation: Operation, result_code: ResultCode) -> Message {
    msg.manifest.operation = operation;
    msg.manifest.originator = Originator::Daemon;
    msg.manifest.result_code = result_code;
    msg
}

impl State {
    async fn handle(&mut self, port: u16, msg: Message) {
        match msg.operation() {
            Operation::Init => {
                let Some(intro) = msg.intro.clone() else { return };
                self.clients.insert(
                    intro.identifier,
                    Registered {
                        originator: msg.manifest.originator,
                        recv_port: intro.recv_port,
                    },
                );
                if self.opts.answer_init {
                    let config = ConfigParams {
                        system_mode: self.opts.mode,
                        use_external_store: self.opts.use_store,
                        store_address: "127.0.0.1".into(),
                        store_port: 6379,
                        store_index: 0,
                    };
                    self.write(port, Message::init_response(ResultCode::Success, config))
                        .await;
                }
            }
            Operation::Ping => {
                self.write(
                    port,
                    Message::new(Operation::Ping, Originator::Daemon, ResultCode::Success),
                )
                .await
            }
            Operation::Send => match self.opts.mode {
                SystemMode::Pull => self.tx_buffer.push_back(msg),
                SystemMode::Push => {
                    let target = self
                        .simulator_recv_port()
                        .or_else(|| msg.destination_id().and_then(|d| self.recv_port_of(d)));
                    if let Some(p) = target {
                        self.write(p, relabel(msg, Operation::Forward, ResultCode::Message))
                            .await;
                    }
                }
            },
            Operation::Fetch => {
                let idx = match msg.source_id() {
                    Some(src) => self
                        .tx_buffer
                        .iter()
                        .position(|m| m.source_id() == Some(src)),
                    None => (!self.tx_buffer.is_empty()).then_some(0),
                };
                let reply = match idx.and_then(|i| self.tx_buffer.remove(i)) {
                    Some(found) => relabel(found, Operation::Fetch, ResultCode::Message),
                    None => Message::new(Operation::Fetch, Originator::Daemon, ResultCode::NoMessage),
                };
                self.write(port, reply).await;
            }
            Operation::Post => {
                if msg.result_code() != ResultCode::Message {
                    return;
                }
                match self.opts.mode {
                    SystemMode::Pull => self.rx_buffer.push_back(msg),
                    SystemMode::Push => {
                        if let Some(p) = msg.destination_id().and_then(|d| self.recv_port_of(d)) {
                            self.write(p, relabel(msg, Operation::Forward, ResultCode::Message))
                                .await;
                        }
                    }
                }
            }
            Operation::Receive => {
                let dest = msg.destination_id().map(str::to_string);
                let idx = self
                    .rx_buffer
                    .iter()
                    .position(|m| m.destination_id() == dest.as_deref());
                let reply = match idx.and_then(|i| self.rx_buffer.remove(i)) {
                    Some(found) => relabel(found, Operation::Receive, ResultCode::Message),
                    None => Message::new(
                        Operation::Receive,
                        Originator::Daemon,
                        ResultCode::NoMessage,
                    ),
                };
                self.write(port, reply).await;
            }
            Operation::Exit | Operation::Forward => {}
        }
    }

    fn simulator_recv_port(&self) -> Option<u16> {
        self.clients
            .values()
            .find(|c| c.originator == Originator::SimClient)
            .map(|c| c.recv_port)
    }

    fn recv_port_of(&self, identifier: &str) -> Option<u16> {
        self.clients.get(identifier).map(|c| c.recv_port)
    }

    async fn write(&mut self, port: u16, msg: Message) {
        let frame = encode_frame(&encode(&msg).unwrap()).unwrap();
        if let Some(w) = self.writers.get_mut(&port) {
            let _ = w.write_all(&frame).await;
        }
    }
}

/// One client's raw channels, as seen from the daemon side.
pub struct DaemonLink {
    pub ctrl: TcpStream,
    pub send: TcpStream,
    pub recv: TcpStream,
}

/// Daemon whose replies are written by the test itself, at the moment it chooses.
pub struct ManualDaemon {
    listener: TcpListener,
    pub port: u16,
}

impl ManualDaemon {
    pub async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        Self { listener, port }
    }

    /// Accept one client's CTRL, SEND and RECV connections (in that order) and configure it for PULL.
    pub async fn accept(&self) -> DaemonLink {
        let (mut ctrl, _) = self.listener.accept().await.unwrap();
        let (send, _) = self.listener.accept().await.unwrap();
        let (recv, _) = self.listener.accept().await.unwrap();
        let init = read_message(&mut ctrl).await;
        assert_eq!(init.operation(), Operation::Init);
        let config = ConfigParams {
            system_mode: SystemMode::Pull,
            ..ConfigParams::default()
        };
        write_message(&mut ctrl, &Message::init_response(ResultCode::Success, config)).await;
        DaemonLink { ctrl, send, recv }
    }
}

pub async fn read_message(stream: &mut TcpStream) -> Message {
    let mut len = [0u8; 4];
    stream.read_exact(&mut len).await.unwrap();
    let mut body = vec![0u8; u32::from_le_bytes(len) as usize];
    stream.read_exact(&mut body).await.unwrap();
    decode(&body).unwrap()
}

pub async fn write_message(stream: &mut TcpStream, msg: &Message) {
    let frame = encode_frame(&encode(msg).unwrap()).unwrap();
    stream.write_all(&frame).await.unwrap();
}
