//! A process-local [`Broker`], useful to exercise pools and delivery logic without RabbitMq.
//!
//! It models the parts of AMQP the pools rely on:
//! - queues fed by the default exchange (routing key = queue name) or by direct bindings;
//! - unacknowledged deliveries tracked per channel, requeued (and flagged as redelivered) on
//!   nack-with-requeue or when their channel closes;
//! - per-consumer prefetch limits for push consumers;
//! - protocol errors (unknown queue, unknown delivery tag) closing the offending channel.
//!
//! Faults can be injected to simulate a misbehaving broker: see
//! [`InMemoryBroker::refuse_connections`], [`InMemoryBroker::sever_connection`] and
//! [`InMemoryBroker::reject_publishes_where`].
use super::broker::{
    Broker, BrokerChannel, BrokerConnection, BrokerError, ChannelHandle, ConnectionHandle,
    DeliveryStream, Message,
};
use amq_protocol_types::DeliveryTag;
use futures_util::StreamExt;
use lapin::BasicProperties;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;

/// Upper bound on how long an idle consumer waits before looking at its queue again.
const CONSUMER_POLL_INTERVAL: Duration = Duration::from_millis(25);

type PublishFilter = Arc<dyn Fn(&[u8]) -> bool + Send + Sync>;

/// A broker living in the current process. Cloning it yields a handle to the same broker.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

#[derive(Default)]
struct BrokerState {
    queues: Mutex<HashMap<String, QueueState>>,
    bindings: Mutex<HashMap<(String, String), Vec<String>>>,
    connections: Mutex<Vec<Weak<ConnectionInner>>>,
    refused_connections: AtomicUsize,
    rejected_publishes: Mutex<Option<PublishFilter>>,
    next_delivery_tag: AtomicU64,
    next_channel_id: AtomicU64,
    connections_opened: AtomicUsize,
    channels_opened: AtomicUsize,
    deliveries: Notify,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    unacked: BTreeMap<DeliveryTag, Unacked>,
}

struct Unacked {
    channel_id: u64,
    consumer_tag: Option<String>,
    message: StoredMessage,
}

#[derive(Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    properties: BasicProperties,
    data: Vec<u8>,
    redelivered: bool,
}

impl StoredMessage {
    fn into_message(self, delivery_tag: DeliveryTag, message_count: Option<u32>) -> Message {
        Message {
            delivery_tag,
            exchange: self.exchange.into(),
            routing_key: self.routing_key.into(),
            redelivered: self.redelivered,
            properties: self.properties,
            data: self.data,
            message_count,
        }
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare `queue`. Declaring an existing queue is a no-op.
    pub fn declare_queue(&self, queue: &str) {
        self.state
            .queues
            .lock()
            .entry(queue.to_owned())
            .or_default();
    }

    /// Route messages published on `exchange` with `routing_key` to `queue`.
    pub fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) {
        self.declare_queue(queue);
        let mut bindings = self.state.bindings.lock();
        let queues = bindings
            .entry((exchange.to_owned(), routing_key.to_owned()))
            .or_default();
        if !queues.iter().any(|q| q == queue) {
            queues.push(queue.to_owned());
        }
    }

    /// Messages ready for delivery in `queue`; 0 if the queue does not exist.
    pub fn message_count(&self, queue: &str) -> usize {
        self.state
            .queues
            .lock()
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    /// Messages delivered from `queue` and not yet settled.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.state
            .queues
            .lock()
            .get(queue)
            .map_or(0, |q| q.unacked.len())
    }

    /// Make the next `attempts` connection attempts fail.
    pub fn refuse_connections(&self, attempts: usize) {
        self.state
            .refused_connections
            .store(attempts, Ordering::SeqCst);
    }

    /// Reject every publish whose body matches `filter`.
    pub fn reject_publishes_where(&self, filter: impl Fn(&[u8]) -> bool + Send + Sync + 'static) {
        *self.state.rejected_publishes.lock() = Some(Arc::new(filter));
    }

    /// Stop rejecting publishes.
    pub fn accept_all_publishes(&self) {
        *self.state.rejected_publishes.lock() = None;
    }

    /// Close the connection named `name` from the broker side, along with all its channels.
    ///
    /// Returns `false` if no open connection has that name.
    pub fn sever_connection(&self, name: &str) -> bool {
        let connection = self
            .state
            .connections
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .find(|c| c.name == name && c.open.load(Ordering::SeqCst));
        match connection {
            Some(connection) => {
                connection.shut();
                true
            }
            None => false,
        }
    }

    /// Names of the connections currently open, in opening order.
    pub fn open_connections(&self) -> Vec<String> {
        self.state
            .connections
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|c| c.open.load(Ordering::SeqCst))
            .map(|c| c.name.clone())
            .collect()
    }

    pub fn connections_opened(&self) -> usize {
        self.state.connections_opened.load(Ordering::SeqCst)
    }

    pub fn channels_opened(&self) -> usize {
        self.state.channels_opened.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Broker for InMemoryBroker {
    async fn open_connection(&self, name: &str) -> Result<ConnectionHandle, BrokerError> {
        let refused = self
            .state
            .refused_connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(BrokerError::ConnectionFailed(anyhow::anyhow!(
                "Connection refused by the in-memory broker"
            )));
        }

        let inner = Arc::new(ConnectionInner {
            name: name.to_owned(),
            open: Arc::new(AtomicBool::new(true)),
            state: self.state.clone(),
            channels: Mutex::new(Vec::new()),
        });
        self.state.connections.lock().push(Arc::downgrade(&inner));
        self.state.connections_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(InMemoryConnection(inner)))
    }
}

/// A connection to an [`InMemoryBroker`].
pub struct InMemoryConnection(Arc<ConnectionInner>);

struct ConnectionInner {
    name: String,
    open: Arc<AtomicBool>,
    state: Arc<BrokerState>,
    channels: Mutex<Vec<Arc<ChannelInner>>>,
}

impl ConnectionInner {
    fn shut(&self) {
        self.open.store(false, Ordering::SeqCst);
        let channels = std::mem::take(&mut *self.channels.lock());
        for channel in channels {
            channel.shut();
        }
    }
}

#[async_trait::async_trait]
impl BrokerConnection for InMemoryConnection {
    fn name(&self) -> &str {
        &self.0.name
    }

    fn is_open(&self) -> bool {
        self.0.open.load(Ordering::SeqCst)
    }

    async fn open_channel(&self) -> Result<ChannelHandle, BrokerError> {
        if !self.is_open() {
            return Err(BrokerError::ConnectionClosed);
        }
        let channel = Arc::new(ChannelInner {
            id: self.0.state.next_channel_id.fetch_add(1, Ordering::SeqCst) + 1,
            state: self.0.state.clone(),
            connection_open: self.0.open.clone(),
            closed: AtomicBool::new(false),
            confirm_mode: AtomicBool::new(false),
            consumers: Mutex::new(HashSet::new()),
        });
        self.0.channels.lock().push(channel.clone());
        self.0.state.channels_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(InMemoryChannel(channel)))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.0.shut();
        Ok(())
    }
}

/// A channel opened on an [`InMemoryConnection`].
pub struct InMemoryChannel(Arc<ChannelInner>);

struct ChannelInner {
    id: u64,
    state: Arc<BrokerState>,
    connection_open: Arc<AtomicBool>,
    closed: AtomicBool,
    confirm_mode: AtomicBool,
    consumers: Mutex<HashSet<String>>,
}

impl ChannelInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || !self.connection_open.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.is_closed() {
            Err(BrokerError::ChannelClosed)
        } else {
            Ok(())
        }
    }

    /// Close the channel, requeueing whatever it left unsettled.
    fn shut(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.consumers.lock().clear();
        {
            let mut queues = self.state.queues.lock();
            for queue in queues.values_mut() {
                let tags: Vec<DeliveryTag> = queue
                    .unacked
                    .iter()
                    .filter(|(_, u)| u.channel_id == self.id)
                    .map(|(tag, _)| *tag)
                    .collect();
                requeue(queue, &tags);
            }
        }
        self.state.deliveries.notify_waiters();
    }

    /// Remove the unacked deliveries targeted by `delivery_tag` from their queue.
    ///
    /// An unknown tag is a protocol error: the channel is closed.
    fn settle(
        &self,
        delivery_tag: DeliveryTag,
        multiple: bool,
        requeue_messages: bool,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let settled = {
            let mut queues = self.state.queues.lock();
            let mut settled = false;
            for queue in queues.values_mut() {
                let tags: Vec<DeliveryTag> = queue
                    .unacked
                    .iter()
                    .filter(|(tag, u)| {
                        u.channel_id == self.id
                            && (**tag == delivery_tag || (multiple && **tag < delivery_tag))
                    })
                    .map(|(tag, _)| *tag)
                    .collect();
                if tags.is_empty() {
                    continue;
                }
                settled = true;
                if requeue_messages {
                    requeue(queue, &tags);
                } else {
                    for tag in tags {
                        queue.unacked.remove(&tag);
                    }
                }
            }
            settled
        };
        if !settled {
            self.shut();
            return Err(BrokerError::UnknownDeliveryTag(delivery_tag));
        }
        // Settling frees prefetch slots as well as requeueing.
        self.state.deliveries.notify_waiters();
        Ok(())
    }

    fn queue_not_found(&self, queue: &str) -> BrokerError {
        self.shut();
        BrokerError::QueueNotFound(queue.to_owned())
    }
}

/// Move `tags` from the unacked set back to the head of the queue, preserving their order.
fn requeue(queue: &mut QueueState, tags: &[DeliveryTag]) {
    for tag in tags.iter().rev() {
        if let Some(unacked) = queue.unacked.remove(tag) {
            let mut message = unacked.message;
            message.redelivered = true;
            queue.ready.push_front(message);
        }
    }
}

#[async_trait::async_trait]
impl BrokerChannel for InMemoryChannel {
    fn is_closed(&self) -> bool {
        self.0.is_closed()
    }

    async fn enable_confirm_mode(&self) -> Result<(), BrokerError> {
        self.0.ensure_open()?;
        self.0.confirm_mode.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        properties: BasicProperties,
        body: &[u8],
    ) -> Result<(), BrokerError> {
        self.0.ensure_open()?;
        let filter = self.0.state.rejected_publishes.lock().clone();
        if let Some(filter) = filter {
            if filter(body) {
                return Err(BrokerError::Rejected("publish refused by filter".into()));
            }
        }

        let message = StoredMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            properties,
            data: body.to_vec(),
            redelivered: false,
        };
        let routed = {
            let mut queues = self.0.state.queues.lock();
            let targets: Vec<String> = if exchange.is_empty() {
                vec![routing_key.to_owned()]
            } else {
                self.0
                    .state
                    .bindings
                    .lock()
                    .get(&(exchange.to_owned(), routing_key.to_owned()))
                    .cloned()
                    .unwrap_or_default()
            };
            let mut routed = false;
            for target in targets {
                if let Some(queue) = queues.get_mut(&target) {
                    queue.ready.push_back(message.clone());
                    routed = true;
                }
            }
            routed
        };

        if routed {
            self.0.state.deliveries.notify_waiters();
        } else if mandatory && self.0.confirm_mode.load(Ordering::SeqCst) {
            return Err(BrokerError::Unroutable {
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
            });
        }
        Ok(())
    }

    async fn get(&self, queue: &str, auto_ack: bool) -> Result<Option<Message>, BrokerError> {
        self.0.ensure_open()?;
        let fetched = {
            let mut queues = self.0.state.queues.lock();
            match queues.get_mut(queue) {
                None => None,
                Some(state) => Some(state.ready.pop_front().map(|message| {
                    let tag = self.0.state.next_delivery_tag.fetch_add(1, Ordering::SeqCst) + 1;
                    if !auto_ack {
                        state.unacked.insert(
                            tag,
                            Unacked {
                                channel_id: self.0.id,
                                consumer_tag: None,
                                message: message.clone(),
                            },
                        );
                    }
                    message.into_message(tag, Some(state.ready.len() as u32))
                })),
            }
        };
        fetched.ok_or_else(|| self.0.queue_not_found(queue))
    }

    async fn ack(&self, delivery_tag: DeliveryTag, multiple: bool) -> Result<(), BrokerError> {
        self.0.settle(delivery_tag, multiple, false)
    }

    async fn nack(
        &self,
        delivery_tag: DeliveryTag,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), BrokerError> {
        self.0.settle(delivery_tag, multiple, requeue)
    }

    async fn message_count(&self, queue: &str) -> Result<u32, BrokerError> {
        self.0.ensure_open()?;
        let count = self
            .0
            .state
            .queues
            .lock()
            .get(queue)
            .map(|q| q.ready.len() as u32);
        count.ok_or_else(|| self.0.queue_not_found(queue))
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch_count: u16,
        auto_ack: bool,
    ) -> Result<DeliveryStream, BrokerError> {
        self.0.ensure_open()?;
        if !self.0.state.queues.lock().contains_key(queue) {
            return Err(self.0.queue_not_found(queue));
        }
        self.0.consumers.lock().insert(consumer_tag.to_owned());

        let consumer = PushConsumer {
            channel: self.0.clone(),
            queue: queue.to_owned(),
            consumer_tag: consumer_tag.to_owned(),
            prefetch_count,
            auto_ack,
        };
        let stream = futures_util::stream::unfold(consumer, |consumer| async move {
            loop {
                if !consumer.is_active() {
                    return None;
                }
                if let Some(message) = consumer.try_deliver() {
                    return Some((Ok(message), consumer));
                }
                let notified = consumer.channel.state.deliveries.notified();
                let _ = tokio::time::timeout(CONSUMER_POLL_INTERVAL, notified).await;
            }
        });
        Ok(stream.boxed())
    }

    async fn cancel_consumer(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        self.0.ensure_open()?;
        self.0.consumers.lock().remove(consumer_tag);
        self.0.state.deliveries.notify_waiters();
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.0.shut();
        Ok(())
    }
}

struct PushConsumer {
    channel: Arc<ChannelInner>,
    queue: String,
    consumer_tag: String,
    prefetch_count: u16,
    auto_ack: bool,
}

impl PushConsumer {
    fn is_active(&self) -> bool {
        !self.channel.is_closed() && self.channel.consumers.lock().contains(&self.consumer_tag)
    }

    fn try_deliver(&self) -> Option<Message> {
        let mut queues = self.channel.state.queues.lock();
        let queue = queues.get_mut(&self.queue)?;
        if !self.auto_ack && self.prefetch_count > 0 {
            let outstanding = queue
                .unacked
                .values()
                .filter(|u| {
                    u.channel_id == self.channel.id
                        && u.consumer_tag.as_deref() == Some(self.consumer_tag.as_str())
                })
                .count();
            if outstanding >= self.prefetch_count as usize {
                return None;
            }
        }
        let message = queue.ready.pop_front()?;
        let tag = self
            .channel
            .state
            .next_delivery_tag
            .fetch_add(1, Ordering::SeqCst)
            + 1;
        if !self.auto_ack {
            queue.unacked.insert(
                tag,
                Unacked {
                    channel_id: self.channel.id,
                    consumer_tag: Some(self.consumer_tag.clone()),
                    message: message.clone(),
                },
            );
        }
        Some(message.into_message(tag, None))
    }
}
