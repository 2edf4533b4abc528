//! Stream-socket binding: one TCP connection per channel, length-prefixed frames (see nsb_core::wire).
//!
//! Each channel has a writer task that owns the write half, so a frame is always written whole
//! even when the `send` that queued it is dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use nsb_core::wire::{decode_frame, encode_frame};
use nsb_core::FrameDecodeError;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::debug;

use super::{with_timeout, Channel, Endpoints, Transport, TransportError};

const READ_CHUNK: usize = 16 * 1024;
const WRITE_QUEUE: usize = 64;

/// Read half plus the bytes received but not yet returned as a frame.
/// Keeping the buffer here (not on the stack of `receive`) is what makes receive cancel-safe.
struct FrameReader {
    half: OwnedReadHalf,
    buf: Vec<u8>,
}

impl FrameReader {
    async fn next_frame(&mut self) -> Result<Vec<u8>, TransportError> {
        loop {
            let found = match decode_frame(&self.buf) {
                Ok((body, consumed)) => Some((body.to_vec(), consumed)),
                Err(FrameDecodeError::NeedMore) => None,
                Err(e) => return Err(e.into()),
            };
            if let Some((frame, consumed)) = found {
                self.buf.drain(..consumed);
                return Ok(frame);
            }
            self.buf.reserve(READ_CHUNK);
            let n = self.half.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Err(TransportError::Closed);
            }
        }
    }
}

/// A frame for the writer task and where to report the outcome.
struct Outgoing {
    frame: Vec<u8>,
    done: oneshot::Sender<std::io::Result<()>>,
}

/// Writes queued frames in order. Stops at the first write error or when every sender is gone.
async fn write_frames(mut half: OwnedWriteHalf, mut queue: mpsc::Receiver<Outgoing>) {
    while let Some(out) = queue.recv().await {
        let result = async {
            half.write_all(&out.frame).await?;
            half.flush().await
        }
        .await;
        let failed = result.is_err();
        let _ = out.done.send(result);
        if failed {
            return;
        }
    }
    let _ = half.shutdown().await;
}

struct SocketChannel {
    reader: Mutex<Option<FrameReader>>,
    writer: Mutex<Option<mpsc::Sender<Outgoing>>>,
    local_port: u16,
}

/// Three TCP connections to the daemon, one per channel.
pub struct SocketTransport {
    ctrl: SocketChannel,
    send: SocketChannel,
    recv: SocketChannel,
    local_address: String,
    closed: AtomicBool,
    close_tx: watch::Sender<bool>,
}

impl SocketTransport {
    /// One attempt at connecting all three channels. Either all connect or none survive.
    pub async fn connect(address: &str, port: u16) -> Result<Self, TransportError> {
        let (ctrl, local_address) = connect_channel(address, port, Channel::Ctrl).await?;
        let (send, _) = connect_channel(address, port, Channel::Send).await?;
        let (recv, _) = connect_channel(address, port, Channel::Recv).await?;
        let (close_tx, _) = watch::channel(false);
        Ok(Self {
            ctrl,
            send,
            recv,
            local_address,
            closed: AtomicBool::new(false),
            close_tx,
        })
    }

    fn channel(&self, channel: Channel) -> &SocketChannel {
        match channel {
            Channel::Ctrl => &self.ctrl,
            Channel::Send => &self.send,
            Channel::Recv => &self.recv,
        }
    }
}

async fn connect_channel(
    address: &str,
    port: u16,
    channel: Channel,
) -> Result<(SocketChannel, String), TransportError> {
    let stream = TcpStream::connect((address, port)).await?;
    configure(&stream)?;
    let local = stream.local_addr()?;
    debug!(%channel, %local, "channel connected");
    let (half, write_half) = stream.into_split();
    let (writer, queue) = mpsc::channel(WRITE_QUEUE);
    tokio::spawn(write_frames(write_half, queue));
    let ch = SocketChannel {
        reader: Mutex::new(Some(FrameReader {
            half,
            buf: Vec::new(),
        })),
        writer: Mutex::new(Some(writer)),
        local_port: local.port(),
    };
    Ok((ch, local.ip().to_string()))
}

/// Low latency (no Nagle) and dead-peer detection (keepalive).
fn configure(stream: &TcpStream) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    socket2::SockRef::from(stream).set_keepalive(true)?;
    Ok(())
}

#[async_trait]
impl Transport for SocketTransport {
    async fn send(&self, channel: Channel, message: &[u8]) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let frame = encode_frame(message)?;
        let writer = self
            .channel(channel)
            .writer
            .lock()
            .await
            .clone()
            .ok_or(TransportError::Closed)?;
        let (done, written) = oneshot::channel();
        writer
            .send(Outgoing { frame, done })
            .await
            .map_err(|_| TransportError::Closed)?;
        written.await.map_err(|_| TransportError::Closed)??;
        Ok(())
    }

    async fn receive(
        &self,
        channel: Channel,
        timeout: Option<Duration>,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        let mut close_rx = self.close_tx.subscribe();
        if *close_rx.borrow() {
            return Err(TransportError::Closed);
        }
        let ch = self.channel(channel);
        let read = async {
            let mut guard = ch.reader.lock().await;
            match guard.as_mut() {
                Some(reader) => reader.next_frame().await,
                None => Err(TransportError::Closed),
            }
        };
        let read_or_close = async {
            tokio::select! {
                r = read => r,
                _ = close_rx.changed() => Err(TransportError::Closed),
            }
        };
        with_timeout(timeout, read_or_close).await
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.close_tx.send_replace(true);
        for channel in Channel::ALL {
            let ch = self.channel(channel);
            // The writer task drains what is queued, then shuts the write half down.
            ch.writer.lock().await.take();
            ch.reader.lock().await.take();
        }
        debug!("socket channels closed");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn endpoints(&self) -> Endpoints {
        Endpoints {
            address: self.local_address.clone(),
            ctrl_port: self.ctrl.local_port,
            send_port: self.send.local_port,
            recv_port: self.recv.local_port,
        }
    }
}
