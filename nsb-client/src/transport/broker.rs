//! AMQP broker binding. One broker message is one protocol message, so no framing is added.
//!
//! Topology on a single direct exchange:
//! - client to daemon: routing key `daemon.<channel>`, `reply_to` naming the client's inbound queue;
//! - daemon to client: exclusive queue `<identifier>.<channel>`, bound with its own name as routing key.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use lapin::message::Delivery;
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Connection, ConnectionProperties, Consumer, ExchangeKind};
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

use super::{with_timeout, Channel, Endpoints, Transport, TransportError};

const REPLY_SUCCESS: u16 = 200;

/// Routing key the daemon consumes `channel` traffic on.
pub fn daemon_routing_key(channel: Channel) -> String {
    format!("daemon.{}", channel)
}

/// Queue (and routing key) the daemon replies to for `identifier` on `channel`.
pub fn inbound_queue(identifier: &str, channel: Channel) -> String {
    format!("{}.{}", identifier, channel)
}

struct BrokerChannel {
    amqp: lapin::Channel,
    queue: String,
    consumer: Mutex<Consumer>,
}

/// One broker connection; one AMQP channel and inbound queue per logical channel.
pub struct BrokerTransport {
    connection: Connection,
    exchange: String,
    address: String,
    ctrl: BrokerChannel,
    send: BrokerChannel,
    recv: BrokerChannel,
    closed: AtomicBool,
    close_tx: watch::Sender<bool>,
}

impl BrokerTransport {
    /// One attempt at connecting to the broker and declaring all three queues.
    pub async fn connect(
        address: &str,
        port: u16,
        exchange: &str,
        identifier: &str,
    ) -> Result<Self, TransportError> {
        let uri = format!("amqp://{}:{}/%2f", address, port);
        let connection = Connection::connect(&uri, ConnectionProperties::default()).await?;
        let ctrl = open_channel(&connection, exchange, identifier, Channel::Ctrl).await?;
        let send = open_channel(&connection, exchange, identifier, Channel::Send).await?;
        let recv = open_channel(&connection, exchange, identifier, Channel::Recv).await?;
        let (close_tx, _) = watch::channel(false);
        Ok(Self {
            connection,
            exchange: exchange.to_string(),
            address: address.to_string(),
            ctrl,
            send,
            recv,
            closed: AtomicBool::new(false),
            close_tx,
        })
    }

    fn channel(&self, channel: Channel) -> &BrokerChannel {
        match channel {
            Channel::Ctrl => &self.ctrl,
            Channel::Send => &self.send,
            Channel::Recv => &self.recv,
        }
    }
}

async fn open_channel(
    connection: &Connection,
    exchange: &str,
    identifier: &str,
    channel: Channel,
) -> Result<BrokerChannel, TransportError> {
    let amqp = connection.create_channel().await?;
    amqp.exchange_declare(
        exchange,
        ExchangeKind::Direct,
        ExchangeDeclareOptions::default(),
        FieldTable::default(),
    )
    .await?;
    let queue = inbound_queue(identifier, channel);
    amqp.queue_declare(
        &queue,
        QueueDeclareOptions {
            exclusive: true,
            auto_delete: true,
            ..QueueDeclareOptions::default()
        },
        FieldTable::default(),
    )
    .await?;
    amqp.queue_bind(
        &queue,
        exchange,
        &queue,
        QueueBindOptions::default(),
        FieldTable::default(),
    )
    .await?;
    let consumer = amqp
        .basic_consume(
            &queue,
            &format!("{}-consumer", queue),
            BasicConsumeOptions {
                no_ack: true,
                ..BasicConsumeOptions::default()
            },
            FieldTable::default(),
        )
        .await?;
    debug!(%channel, %queue, "broker channel ready");
    Ok(BrokerChannel {
        amqp,
        queue,
        consumer: Mutex::new(consumer),
    })
}

fn delivery_body(delivery: Delivery) -> Vec<u8> {
    delivery.data
}

/// Next delivery body from `consumer` under the shared receive timeout semantics.
/// `Closed` once the transport is closed or the consumer stream ends.
async fn next_delivery<S, D>(
    consumer: &Mutex<S>,
    mut close_rx: watch::Receiver<bool>,
    timeout: Option<Duration>,
    body: fn(D) -> Vec<u8>,
) -> Result<Option<Vec<u8>>, TransportError>
where
    S: Stream<Item = Result<D, lapin::Error>> + Unpin,
{
    if *close_rx.borrow() {
        return Err(TransportError::Closed);
    }
    let next = async {
        let mut consumer = consumer.lock().await;
        match consumer.next().await {
            Some(Ok(delivery)) => Ok(body(delivery)),
            Some(Err(e)) => Err(TransportError::from(e)),
            None => Err(TransportError::Closed),
        }
    };
    let next_or_close = async {
        tokio::select! {
            r = next => r,
            _ = close_rx.changed() => Err(TransportError::Closed),
        }
    };
    with_timeout(timeout, next_or_close).await
}

#[async_trait]
impl Transport for BrokerTransport {
    async fn send(&self, channel: Channel, message: &[u8]) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let ch = self.channel(channel);
        let properties = BasicProperties::default().with_reply_to(ch.queue.clone().into());
        ch.amqp
            .basic_publish(
                &self.exchange,
                &daemon_routing_key(channel),
                BasicPublishOptions::default(),
                message,
                properties,
            )
            .await?
            .await?;
        Ok(())
    }

    async fn receive(
        &self,
        channel: Channel,
        timeout: Option<Duration>,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        next_delivery(
            &self.channel(channel).consumer,
            self.close_tx.subscribe(),
            timeout,
            delivery_body,
        )
        .await
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.close_tx.send_replace(true);
        for channel in Channel::ALL {
            if let Err(e) = self
                .channel(channel)
                .amqp
                .close(REPLY_SUCCESS, "client exit")
                .await
            {
                debug!(%channel, error = %e, "broker channel already closed");
            }
        }
        if let Err(e) = self.connection.close(REPLY_SUCCESS, "client exit").await {
            warn!(error = %e, "broker connection close failed");
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Broker clients have no per-channel ports; the daemon addresses them by queue.
    fn endpoints(&self) -> Endpoints {
        Endpoints {
            address: self.address.clone(),
            ..Endpoints::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topology_names() {
        assert_eq!(daemon_routing_key(Channel::Ctrl), "daemon.ctrl");
        assert_eq!(inbound_queue("bob", Channel::Recv), "bob.recv");
    }

    type Queue = futures::channel::mpsc::UnboundedReceiver<Result<Vec<u8>, lapin::Error>>;

    fn queue() -> (
        futures::channel::mpsc::UnboundedSender<Result<Vec<u8>, lapin::Error>>,
        Mutex<Queue>,
    ) {
        let (tx, rx) = futures::channel::mpsc::unbounded();
        (tx, Mutex::new(rx))
    }

    fn body(v: Vec<u8>) -> Vec<u8> {
        v
    }

    #[tokio::test]
    async fn delivery_then_timeout() {
        let (tx, consumer) = queue();
        let (_close_tx, close_rx) = watch::channel(false);
        tx.unbounded_send(Ok(b"one".to_vec())).unwrap();
        let r = next_delivery(&consumer, close_rx.clone(), None, body).await.unwrap();
        assert_eq!(r.as_deref(), Some(&b"one"[..]));
        let r = next_delivery(&consumer, close_rx.clone(), Some(Duration::ZERO), body)
            .await
            .unwrap();
        assert!(r.is_none());
        let r = next_delivery(&consumer, close_rx, Some(Duration::from_millis(20)), body)
            .await
            .unwrap();
        assert!(r.is_none());
    }

    #[tokio::test]
    async fn delivery_after_timeout_is_not_lost() {
        let (tx, consumer) = queue();
        let (_close_tx, close_rx) = watch::channel(false);
        let r = next_delivery(&consumer, close_rx.clone(), Some(Duration::from_millis(20)), body)
            .await
            .unwrap();
        assert!(r.is_none());
        tx.unbounded_send(Ok(b"late".to_vec())).unwrap();
        let r = next_delivery(&consumer, close_rx, Some(Duration::from_secs(5)), body)
            .await
            .unwrap();
        assert_eq!(r.as_deref(), Some(&b"late"[..]));
    }

    #[tokio::test]
    async fn close_wakes_blocked_consumer() {
        let (_tx, consumer) = queue();
        let consumer = std::sync::Arc::new(consumer);
        let (close_tx, close_rx) = watch::channel(false);
        let waiter = {
            let consumer = consumer.clone();
            let close_rx = close_rx.clone();
            tokio::spawn(async move { next_delivery(&*consumer, close_rx, None, body).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        close_tx.send_replace(true);
        let r = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(r, Err(TransportError::Closed)));
        // Already closed: fails without waiting.
        let r = next_delivery(&*consumer, close_rx, None, body).await;
        assert!(matches!(r, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn ended_stream_is_closed() {
        let (tx, consumer) = queue();
        let (_close_tx, close_rx) = watch::channel(false);
        drop(tx);
        let r = next_delivery(&consumer, close_rx, Some(Duration::from_secs(5)), body).await;
        assert!(matches!(r, Err(TransportError::Closed)));
    }

    /// Needs a RabbitMQ broker on localhost:5672 and a daemon consuming `daemon.*`.
    #[tokio::test]
    #[ignore]
    async fn connects_and_closes_against_local_broker() {
        let transport = BrokerTransport::connect("127.0.0.1", 5672, "nsb-test", "probe")
            .await
            .unwrap();
        transport.send(Channel::Ctrl, b"probe").await.unwrap();
        let r = transport
            .receive(Channel::Recv, Some(Duration::ZERO))
            .await
            .unwrap();
        assert!(r.is_none());
        transport.close().await;
        assert!(transport.is_closed());
    }
}
