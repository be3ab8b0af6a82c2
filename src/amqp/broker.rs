//! The broker capabilities the pools and the delivery service are built on.
//!
//! The traits are object safe: pools store `Arc<dyn BrokerConnection>` and
//! `Arc<dyn BrokerChannel>` so that the same pooling logic runs against [`lapin`] (see
//! [`ConnectionFactory`](super::ConnectionFactory)) and against the
//! [`InMemoryBroker`](super::in_memory::InMemoryBroker).
use amq_protocol_types::{DeliveryTag, ShortString};
use futures_util::stream::BoxStream;
use lapin::BasicProperties;
use std::sync::Arc;

/// A shared handle over an open channel.
pub type ChannelHandle = Arc<dyn BrokerChannel>;

/// A shared handle over an open connection.
pub type ConnectionHandle = Arc<dyn BrokerConnection>;

/// Stream of deliveries pushed by the broker to a registered consumer.
pub type DeliveryStream = BoxStream<'static, Result<Message, BrokerError>>;

/// Something capable of opening connections to a message broker.
#[async_trait::async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Open a new connection, advertising `name` to the broker as the connection name.
    async fn open_connection(&self, name: &str) -> Result<ConnectionHandle, BrokerError>;
}

/// A physical connection to the broker, multiplexing channels.
#[async_trait::async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn is_open(&self) -> bool;

    async fn open_channel(&self) -> Result<ChannelHandle, BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// A channel: the lightweight virtual connection used to publish and consume.
///
/// A channel must be driven by a single logical flow of operations at a time.
#[async_trait::async_trait]
pub trait BrokerChannel: Send + Sync + 'static {
    fn is_closed(&self) -> bool;

    /// Turn on publisher confirms for every following publish on this channel.
    async fn enable_confirm_mode(&self) -> Result<(), BrokerError>;

    /// Publish `body` on `exchange`.
    ///
    /// On a channel in confirm mode the call only completes once the broker confirmed the
    /// message: a negative acknowledgement, or a mandatory message that could not be routed,
    /// is reported as an error.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        properties: BasicProperties,
        body: &[u8],
    ) -> Result<(), BrokerError>;

    /// Fetch a single message, `None` if the queue is empty.
    async fn get(&self, queue: &str, auto_ack: bool) -> Result<Option<Message>, BrokerError>;

    async fn ack(&self, delivery_tag: DeliveryTag, multiple: bool) -> Result<(), BrokerError>;

    async fn nack(
        &self,
        delivery_tag: DeliveryTag,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), BrokerError>;

    /// Number of messages ready for delivery in `queue`, without side effects.
    async fn message_count(&self, queue: &str) -> Result<u32, BrokerError>;

    /// Register a push consumer on `queue`, limited to `prefetch_count` unacknowledged deliveries.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch_count: u16,
        auto_ack: bool,
    ) -> Result<DeliveryStream, BrokerError>;

    async fn cancel_consumer(&self, consumer_tag: &str) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// assert they are object safe
type _CHECK = (Box<dyn Broker>, Box<dyn BrokerConnection>, Box<dyn BrokerChannel>);

/// A message received from the broker, either fetched or pushed to a consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Identifies the delivery on the channel it was received on; required to ack/nack it.
    pub delivery_tag: DeliveryTag,
    /// May be empty if the default exchange was used.
    pub exchange: ShortString,
    pub routing_key: ShortString,
    /// Whether this message was delivered before and requeued.
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
    /// Messages left in the queue after a fetch. `None` for pushed deliveries.
    pub message_count: Option<u32>,
}

/// Failures reported by a broker implementation.
#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
    #[error("Failed to connect to the broker")]
    ConnectionFailed(#[source] anyhow::Error),
    #[error("The connection to the broker is closed")]
    ConnectionClosed,
    #[error("The channel is closed")]
    ChannelClosed,
    #[error("The message could not be routed (exchange: `{exchange}`, routing key: `{routing_key}`)")]
    Unroutable {
        exchange: String,
        routing_key: String,
    },
    #[error("The broker nacked the publishing of the message")]
    NegativeAck,
    #[error("Queue `{0}` does not exist")]
    QueueNotFound(String),
    #[error("Unknown delivery tag {0}")]
    UnknownDeliveryTag(DeliveryTag),
    #[error("The broker rejected the message: {0}")]
    Rejected(String),
    #[error("The operation timed out")]
    TimedOut,
    #[error(transparent)]
    Amqp(#[from] lapin::Error),
}
