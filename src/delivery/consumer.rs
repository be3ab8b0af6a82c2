//! Push consumers running on dedicated, non-pooled channels.
use crate::amqp::{BrokerChannel, BrokerError, ChannelHandle, DeliveryStream, Message};
use futures_util::{stream::FuturesUnordered, FutureExt, StreamExt};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::DeliveryError;

/// Implementers of `DeliveryHandler` process the messages pushed to a consumer created with
/// [`DeliveryService::create_consumer`](super::DeliveryService::create_consumer).
///
/// The returned [`BrokerAction`] settles the message with the broker (unless the consumer runs in
/// auto-ack mode). A handler error, or a panic, settles it with [`BrokerAction::Nack`]: the
/// message is requeued, never dropped.
#[async_trait::async_trait]
pub trait DeliveryHandler: Send + Sync + 'static {
    async fn handle(&self, message: &Message) -> Result<BrokerAction, anyhow::Error>;
}

/// assert it's object safe
type _CHECK = Box<dyn DeliveryHandler>;

/// The action we ask the broker to take when finalising the processing of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerAction {
    /// Positive acknowledgement - the message can be removed from the queue.
    Ack,
    /// Negative acknowledgement - the message is requeued and will be delivered again.
    Nack,
    /// Rejection - the message is not requeued.
    /// It goes to the dead letter exchange if one is configured.
    Reject,
}

impl BrokerAction {
    async fn execute(
        &self,
        channel: &dyn BrokerChannel,
        message: &Message,
    ) -> Result<(), BrokerError> {
        match self {
            Self::Ack => channel.ack(message.delivery_tag, false).await,
            Self::Nack => channel.nack(message.delivery_tag, false, true).await,
            Self::Reject => channel.nack(message.delivery_tag, false, false).await,
        }
    }
}

/// The reference retry policy: requeue one out of every `every` first-time deliveries, and let
/// `inner` decide for everything else.
///
/// Redelivered messages are never sampled, so a requeued message is settled by `inner` the
/// second time around.
pub struct SampledRequeue<H> {
    inner: H,
    every: u64,
    seen: AtomicU64,
}

impl<H: DeliveryHandler> SampledRequeue<H> {
    /// `every == 0` disables sampling.
    pub fn every(every: u64, inner: H) -> Self {
        Self {
            inner,
            every,
            seen: AtomicU64::new(0),
        }
    }
}

#[async_trait::async_trait]
impl<H: DeliveryHandler> DeliveryHandler for SampledRequeue<H> {
    async fn handle(&self, message: &Message) -> Result<BrokerAction, anyhow::Error> {
        if self.every > 0 && !message.redelivered {
            let seen = self.seen.fetch_add(1, Ordering::SeqCst) + 1;
            if seen % self.every == 0 {
                debug!(delivery_tag = message.delivery_tag, "Sampled message for redelivery");
                return Ok(BrokerAction::Nack);
            }
        }
        self.inner.handle(message).await
    }
}

/// A running push consumer.
///
/// The consumer runs until [`ConsumerHandle::stop`] is called, its channel closes or the broker
/// cancels it. Dropping the handle does not stop it.
pub struct ConsumerHandle {
    consumer_tag: String,
    queue: String,
    shutdown: CancellationToken,
    task: JoinHandle<Result<(), BrokerError>>,
}

impl ConsumerHandle {
    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel the consumer, wait for in-flight deliveries to be settled and close its channel.
    pub async fn stop(self) -> Result<(), DeliveryError> {
        self.shutdown.cancel();
        match self.task.await {
            Ok(result) => result.map_err(DeliveryError::from),
            Err(e) => Err(DeliveryError::ConsumerTask(e)),
        }
    }
}

/// Register a consumer on `channel` and start pushing its deliveries to `handler`.
pub(crate) async fn start(
    channel: ChannelHandle,
    handler: Arc<dyn DeliveryHandler>,
    queue: &str,
    prefetch_count: u16,
    auto_ack: bool,
) -> Result<ConsumerHandle, BrokerError> {
    let consumer_tag = Uuid::new_v4().to_string();
    let deliveries = match channel
        .consume(queue, &consumer_tag, prefetch_count, auto_ack)
        .await
    {
        Ok(deliveries) => deliveries,
        Err(e) => {
            let _ = channel.close().await;
            return Err(e);
        }
    };
    info!(queue, consumer_tag = %consumer_tag, prefetch_count, auto_ack, "Consumer started");

    let shutdown = CancellationToken::new();
    let task = tokio::spawn(run(
        channel,
        deliveries,
        handler,
        consumer_tag.clone(),
        auto_ack,
        shutdown.clone(),
    ));
    Ok(ConsumerHandle {
        consumer_tag,
        queue: queue.to_owned(),
        shutdown,
        task,
    })
}

#[tracing::instrument(name = "consumer_run", skip_all, fields(consumer_tag = %consumer_tag))]
async fn run(
    channel: ChannelHandle,
    mut deliveries: DeliveryStream,
    handler: Arc<dyn DeliveryHandler>,
    consumer_tag: String,
    auto_ack: bool,
    shutdown: CancellationToken,
) -> Result<(), BrokerError> {
    let mut in_flight = FuturesUnordered::new();

    let result = loop {
        tokio::select! {
            // Prefer shutting down over picking up more deliveries.
            biased;

            _ = shutdown.cancelled() => {
                if let Err(e) = channel.cancel_consumer(&consumer_tag).await {
                    warn!(error = %e, "Failed to cancel consumer");
                }
                break Ok(());
            }

            _ = in_flight.next(), if !in_flight.is_empty() => {}

            delivery = deliveries.next() => match delivery {
                None => break Ok(()),
                Some(Err(e)) => {
                    error!(error = %e, "Consumer error");
                    break Err(e);
                }
                // Each delivery is processed on its own task, concurrently up to the prefetch limit.
                Some(Ok(message)) => in_flight.push(tokio::spawn(process(
                    channel.clone(),
                    handler.clone(),
                    message,
                    auto_ack,
                ))),
            }
        }
    };

    // In-flight deliveries must be settled before the channel goes away.
    while in_flight.next().await.is_some() {}
    if !channel.is_closed() {
        if let Err(e) = channel.close().await {
            debug!(error = %e, "Failed to close consumer channel");
        }
    }
    info!("Consumer stopped");
    result
}

#[tracing::instrument(
    name = "process_message",
    skip_all,
    fields(delivery_tag = message.delivery_tag),
    level = "debug"
)]
async fn process(
    channel: ChannelHandle,
    handler: Arc<dyn DeliveryHandler>,
    message: Message,
    auto_ack: bool,
) {
    let action = match AssertUnwindSafe(handler.handle(&message))
        .catch_unwind()
        .await
    {
        Ok(Ok(action)) => action,
        Ok(Err(e)) => {
            warn!(error = %e, "Handler failed, requeueing message");
            BrokerAction::Nack
        }
        Err(_) => {
            error!("Handler panicked, requeueing message");
            BrokerAction::Nack
        }
    };
    if auto_ack {
        return;
    }
    if let Err(e) = action.execute(channel.as_ref(), &message).await {
        error!(error = %e, ?action, "Failed to settle message");
    }
}
