use crate::amqp::{BrokerError, Message};
use crate::configuration::DeliverySettings;
use crate::pool::{ChannelKind, ChannelPair, ChannelPool};
use futures_util::future::join_all;
use rand::Rng;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::consumer::{self, ConsumerHandle, DeliveryHandler};
use super::envelope::outgoing_properties;
use super::{DeliveryError, Envelope};

/// Publish and consume messages on channels leased from a [`ChannelPool`].
///
/// Every operation leases the channels it needs for its own duration and hands them back before
/// returning, with the exception of the manual-ack operations (see
/// [`DeliveryService::get_with_manual_ack`]).
///
/// # Failures
///
/// Batch publishes never fail because of a single message: failures are caught, logged and
/// reported as indices into the payload slice. A failure that leaves the channel in an unknown
/// state (closed channel, timed out publish) flags the channel as dead, so that the next lease
/// repairs it.
///
/// `DeliveryService` is cheap to clone: clones share the same pool.
#[derive(Clone)]
pub struct DeliveryService {
    channel_pool: Arc<ChannelPool>,
    settings: Arc<DeliverySettings>,
}

impl DeliveryService {
    pub fn new(channel_pool: Arc<ChannelPool>, settings: DeliverySettings) -> Self {
        Self {
            channel_pool,
            settings: Arc::new(settings),
        }
    }

    pub fn channel_pool(&self) -> &Arc<ChannelPool> {
        &self.channel_pool
    }

    /// Publish a single message on a plain channel.
    ///
    /// Returns `true` if the broker accepted the publish call. It does not wait for a broker
    /// confirmation: use [`DeliveryService::publish_confirmed`] for that.
    pub async fn publish(&self, envelope: &Envelope) -> bool {
        let never = CancellationToken::new();
        self.publish_with_cancellation(envelope, &never).await
    }

    /// [`DeliveryService::publish`], giving up (and returning `false`) if `cancel` fires while
    /// waiting for a channel.
    #[tracing::instrument(
        skip_all,
        fields(exchange = %envelope.exchange_name, routing_key = %envelope.routing_key)
    )]
    pub async fn publish_with_cancellation(
        &self,
        envelope: &Envelope,
        cancel: &CancellationToken,
    ) -> bool {
        match self.publish_envelope(ChannelKind::Plain, envelope, cancel).await {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "Failed to publish message");
                false
            }
        }
    }

    /// Publish a single message on a confirm-mode channel, waiting for the broker to confirm it.
    ///
    /// A mandatory message that cannot be routed is reported as
    /// [`BrokerError::Unroutable`].
    #[tracing::instrument(
        skip_all,
        fields(exchange = %envelope.exchange_name, routing_key = %envelope.routing_key)
    )]
    pub async fn publish_confirmed(&self, envelope: &Envelope) -> Result<(), DeliveryError> {
        let never = CancellationToken::new();
        self.publish_envelope(ChannelKind::Ackable, envelope, &never)
            .await
    }

    async fn publish_envelope(
        &self,
        kind: ChannelKind,
        envelope: &Envelope,
        cancel: &CancellationToken,
    ) -> Result<(), DeliveryError> {
        let lease = Lease::acquire(&self.channel_pool, kind, cancel).await?;
        let outcome = self
            .publish_one(
                lease.pair(),
                &envelope.exchange_name,
                &envelope.routing_key,
                envelope.mandatory,
                envelope.properties.as_ref(),
                &envelope.payload,
            )
            .await;
        lease.release(outcome.as_ref().err());
        outcome
    }

    /// Publish every payload, in order, to `exchange` with `routing_key`, on a single plain
    /// channel.
    ///
    /// Returns the indices of the payloads that failed to publish: an empty vector means every
    /// publish succeeded. Failures do not interrupt the loop.
    pub async fn publish_many(
        &self,
        exchange: &str,
        routing_key: &str,
        payloads: &[Vec<u8>],
    ) -> Result<Vec<usize>, DeliveryError> {
        let never = CancellationToken::new();
        self.publish_many_with_cancellation(exchange, routing_key, payloads, &never)
            .await
    }

    /// [`DeliveryService::publish_many`], stopping early once `cancel` fires.
    ///
    /// Payloads not yet published when the cancellation is observed are reported as failed.
    /// Fails only if no channel could be leased before cancellation.
    #[tracing::instrument(skip(self, payloads, cancel), fields(count = payloads.len()))]
    pub async fn publish_many_with_cancellation(
        &self,
        exchange: &str,
        routing_key: &str,
        payloads: &[Vec<u8>],
        cancel: &CancellationToken,
    ) -> Result<Vec<usize>, DeliveryError> {
        let mut lease = Lease::acquire(&self.channel_pool, ChannelKind::Plain, cancel).await?;

        let mut failed = Vec::new();
        for (index, payload) in payloads.iter().enumerate() {
            if cancel.is_cancelled() {
                warn!(
                    remaining = payloads.len() - index,
                    "Publishing cancelled, reporting remaining messages as failed"
                );
                failed.extend(index..payloads.len());
                break;
            }
            if index > 0 && self.settings.throttle_fast_body_loops {
                self.throttle().await;
            }

            let outcome = self
                .publish_one(lease.pair(), exchange, routing_key, false, None, payload)
                .await;
            let Err(e) = outcome else { continue };
            warn!(index, error = %e, "Failed to publish message");
            failed.push(index);

            if needs_repair(lease.pair(), &e) {
                // Swap the broken channel for a healthy one and carry on.
                lease.release(Some(&e));
                lease = match Lease::acquire(&self.channel_pool, ChannelKind::Plain, cancel).await {
                    Ok(lease) => lease,
                    Err(e) => {
                        error!(error = %e, "Failed to lease a replacement channel");
                        failed.extend(index + 1..payloads.len());
                        return Ok(failed);
                    }
                };
            }
        }
        lease.release(None);
        Ok(failed)
    }

    /// Split `payloads` in contiguous batches of `batch_size` and publish them with
    /// [`DeliveryService::publish_many`], one batch after the other.
    ///
    /// Each batch may be published on a different channel. The returned indices refer to
    /// positions in `payloads`.
    pub async fn publish_many_as_batches(
        &self,
        exchange: &str,
        routing_key: &str,
        payloads: &[Vec<u8>],
        batch_size: usize,
    ) -> Result<Vec<usize>, DeliveryError> {
        let never = CancellationToken::new();
        self.publish_many_as_batches_with_cancellation(
            exchange,
            routing_key,
            payloads,
            batch_size,
            &never,
        )
        .await
    }

    /// [`DeliveryService::publish_many_as_batches`], stopping early once `cancel` fires.
    #[tracing::instrument(skip(self, payloads, cancel), fields(count = payloads.len()))]
    pub async fn publish_many_as_batches_with_cancellation(
        &self,
        exchange: &str,
        routing_key: &str,
        payloads: &[Vec<u8>],
        batch_size: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<usize>, DeliveryError> {
        let mut failed = Vec::new();
        for range in batches(payloads.len(), batch_size)? {
            let offset = range.start;
            match self
                .publish_many_with_cancellation(exchange, routing_key, &payloads[range.clone()], cancel)
                .await
            {
                Ok(batch_failed) => failed.extend(batch_failed.into_iter().map(|i| i + offset)),
                Err(e) => {
                    warn!(offset, error = %e, "Failed to publish batch");
                    failed.extend(range);
                }
            }
        }
        Ok(failed)
    }

    /// Publish `payloads` in batches of `batch_size`, all batches concurrently.
    ///
    /// This is a best-effort mode: failures are logged, not reported. Use
    /// [`DeliveryService::publish_many_as_batches`] to learn which messages failed.
    #[tracing::instrument(skip(self, payloads), fields(count = payloads.len()))]
    pub async fn publish_many_as_batches_in_parallel(
        &self,
        exchange: &str,
        routing_key: &str,
        payloads: &[Vec<u8>],
        batch_size: usize,
    ) -> Result<(), DeliveryError> {
        let batches = batches(payloads.len(), batch_size)?;
        let outcomes = join_all(
            batches
                .iter()
                .map(|range| self.publish_many(exchange, routing_key, &payloads[range.clone()])),
        )
        .await;

        for (range, outcome) in batches.into_iter().zip(outcomes) {
            match outcome {
                Ok(failed) if failed.is_empty() => {}
                Ok(failed) => {
                    warn!(offset = range.start, failed = failed.len(), "Some messages failed to publish")
                }
                Err(e) => warn!(offset = range.start, error = %e, "Failed to publish batch"),
            }
        }
        Ok(())
    }

    /// Number of messages ready in `queue`. Has no side effect on the queue.
    #[tracing::instrument(skip(self))]
    pub async fn get_message_count(&self, queue: &str) -> Result<u32, DeliveryError> {
        let lease = self.lease(ChannelKind::Plain).await?;
        let outcome = lease
            .pair()
            .handle()
            .message_count(queue)
            .await
            .map_err(DeliveryError::from);
        lease.release(outcome.as_ref().err());
        outcome
    }

    /// Fetch a single message from `queue`, acknowledged on delivery.
    ///
    /// `None` if the queue is empty.
    #[tracing::instrument(skip(self))]
    pub async fn get(&self, queue: &str) -> Result<Option<Message>, DeliveryError> {
        let lease = self.lease(ChannelKind::Plain).await?;
        let outcome = lease
            .pair()
            .handle()
            .get(queue, true)
            .await
            .map_err(DeliveryError::from);
        lease.release(outcome.as_ref().err());
        outcome
    }

    /// Fetch up to `batch_count` messages from `queue`, acknowledged on delivery.
    ///
    /// Stops at the first empty fetch. If a fetch fails after some messages were received, the
    /// received messages are returned: they are already acknowledged and would otherwise be lost.
    #[tracing::instrument(skip(self))]
    pub async fn get_many(
        &self,
        queue: &str,
        batch_count: usize,
    ) -> Result<Vec<Message>, DeliveryError> {
        let lease = self.lease(ChannelKind::Plain).await?;
        let outcome = self.fetch(lease.pair(), queue, true, Some(batch_count)).await;
        lease.release(outcome.as_ref().err());
        outcome
    }

    /// Fetch messages from `queue` until it is empty, acknowledged on delivery.
    ///
    /// Like [`DeliveryService::get_many`], a failure after the first message ends the drain
    /// without losing what was received.
    #[tracing::instrument(skip(self))]
    pub async fn get_all(&self, queue: &str) -> Result<Vec<Message>, DeliveryError> {
        let lease = self.lease(ChannelKind::Plain).await?;
        let outcome = self.fetch(lease.pair(), queue, true, None).await;
        lease.release(outcome.as_ref().err());
        outcome
    }

    /// Fetch a single message from `queue` on a confirm-mode channel, without acknowledging it.
    ///
    /// The leased channel is handed over to the caller, who must settle the message on it
    /// (`ack`, or `nack` with requeue) and then give it back with
    /// [`DeliveryService::return_channel`]. A message that is never settled stays unacknowledged
    /// on the broker until the channel closes.
    #[tracing::instrument(skip(self))]
    pub async fn get_with_manual_ack(
        &self,
        queue: &str,
    ) -> Result<(ChannelPair, Option<Message>), DeliveryError> {
        let lease = self.lease(ChannelKind::Ackable).await?;
        match lease.pair().handle().get(queue, false).await {
            Ok(message) => Ok((lease.into_pair(), message)),
            Err(e) => {
                let e = DeliveryError::from(e);
                lease.release(Some(&e));
                Err(e)
            }
        }
    }

    /// Fetch up to `batch_count` messages from `queue` without acknowledging them.
    ///
    /// Same contract as [`DeliveryService::get_with_manual_ack`]: every returned message must be
    /// settled on the returned channel before it is given back.
    #[tracing::instrument(skip(self))]
    pub async fn get_many_with_manual_ack(
        &self,
        queue: &str,
        batch_count: usize,
    ) -> Result<(ChannelPair, Vec<Message>), DeliveryError> {
        let lease = self.lease(ChannelKind::Ackable).await?;
        match self.fetch(lease.pair(), queue, false, Some(batch_count)).await {
            Ok(messages) => Ok((lease.into_pair(), messages)),
            Err(e) => {
                lease.release(Some(&e));
                Err(e)
            }
        }
    }

    /// Give back a channel obtained from a manual-ack operation.
    ///
    /// Returns `false` if the channel was not leased.
    pub fn return_channel(&self, pair: ChannelPair) -> bool {
        if pair.handle().is_closed() {
            self.channel_pool.flag_dead(pair.id());
        }
        self.channel_pool.return_pair(pair)
    }

    /// Start a push consumer on `queue`, on a dedicated channel outside of the pool.
    ///
    /// `prefetch_count` caps the deliveries held by the consumer without being settled; it
    /// defaults to the configured `consumer_prefetch_count`. With `auto_ack`, messages are
    /// acknowledged on delivery and the actions returned by `handler` are ignored.
    #[tracing::instrument(skip(self, handler))]
    pub async fn create_consumer(
        &self,
        handler: impl DeliveryHandler,
        queue: &str,
        prefetch_count: Option<u16>,
        auto_ack: bool,
    ) -> Result<ConsumerHandle, DeliveryError> {
        let connection = self.channel_pool.connection_pool().get_connection().await?;
        let channel = connection.open_channel().await?;
        let prefetch_count = prefetch_count.unwrap_or(self.settings.consumer_prefetch_count);
        let handle = consumer::start(channel, Arc::new(handler), queue, prefetch_count, auto_ack)
            .await?;
        Ok(handle)
    }

    /// Publish on `pair`, bounded by the configured publish timeout.
    async fn publish_one(
        &self,
        pair: &ChannelPair,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        properties: Option<&lapin::BasicProperties>,
        payload: &[u8],
    ) -> Result<(), DeliveryError> {
        let properties = outgoing_properties(properties);
        let publish = pair
            .handle()
            .publish(exchange, routing_key, mandatory, properties, payload);
        match tokio::time::timeout(self.settings.publish_timeout(), publish).await {
            Ok(outcome) => outcome.map_err(DeliveryError::from),
            Err(_) => Err(DeliveryError::Timeout),
        }
    }

    /// Fetch from `queue` on `pair` until it is empty, or `limit` messages were received.
    async fn fetch(
        &self,
        pair: &ChannelPair,
        queue: &str,
        auto_ack: bool,
        limit: Option<usize>,
    ) -> Result<Vec<Message>, DeliveryError> {
        let mut messages = Vec::with_capacity(limit.unwrap_or_default().min(1024));
        while limit.map_or(true, |limit| messages.len() < limit) {
            match pair.handle().get(queue, auto_ack).await {
                Ok(Some(message)) => messages.push(message),
                Ok(None) => break,
                Err(e) if messages.is_empty() => return Err(e.into()),
                Err(e) => {
                    warn!(received = messages.len(), error = %e, "Fetch interrupted");
                    break;
                }
            }
        }
        Ok(messages)
    }

    async fn lease(&self, kind: ChannelKind) -> Result<Lease<'_>, DeliveryError> {
        let never = CancellationToken::new();
        Lease::acquire(&self.channel_pool, kind, &never).await
    }

    async fn throttle(&self) {
        let max = self.settings.throttle_max_delay();
        let delay = rand::rng().random_range(Duration::ZERO..=max);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

/// A channel leased for the duration of a single operation.
///
/// If the lease is dropped before being released, e.g. because the operation's future was dropped
/// half-way through, the pair still goes back to the pool, flagged as dead: nothing is known about
/// the state of the channel.
struct Lease<'a> {
    pool: &'a ChannelPool,
    pair: ChannelPair,
    armed: bool,
}

impl<'a> Lease<'a> {
    async fn acquire(
        pool: &'a ChannelPool,
        kind: ChannelKind,
        cancel: &CancellationToken,
    ) -> Result<Lease<'a>, DeliveryError> {
        let pair = pool.lease_with_cancellation(kind, cancel).await?;
        Ok(Self {
            pool,
            pair,
            armed: true,
        })
    }

    fn pair(&self) -> &ChannelPair {
        &self.pair
    }

    /// Hand the pair back to the pool, flagging it as dead first if `failure` left it unusable.
    fn release(mut self, failure: Option<&DeliveryError>) {
        self.armed = false;
        if failure.map_or(self.pair.handle().is_closed(), |e| needs_repair(&self.pair, e)) {
            debug!(channel_id = self.pair.id(), "Channel needs repair");
            self.pool.flag_dead(self.pair.id());
        }
        self.pool.return_pair(self.pair.clone());
    }

    /// Hand the pair over to the caller, who becomes responsible for returning it.
    fn into_pair(mut self) -> ChannelPair {
        self.armed = false;
        self.pair.clone()
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!(
                channel_id = self.pair.id(),
                "Operation abandoned with a leased channel, flagging it for repair"
            );
            self.pool.flag_dead(self.pair.id());
            self.pool.return_pair(self.pair.clone());
        }
    }
}

/// Whether `error`, raised while using `pair`, leaves the channel in a state where it can no
/// longer be trusted.
fn needs_repair(pair: &ChannelPair, error: &DeliveryError) -> bool {
    pair.handle().is_closed()
        || matches!(
            error,
            DeliveryError::Timeout
                | DeliveryError::Broker(
                    BrokerError::ChannelClosed
                        | BrokerError::ConnectionClosed
                        | BrokerError::Amqp(_)
                )
        )
}

/// The ranges covering `len` items in contiguous batches of `batch_size`.
fn batches(len: usize, batch_size: usize) -> Result<Vec<Range<usize>>, DeliveryError> {
    if batch_size == 0 {
        return Err(DeliveryError::InvalidBatchSize);
    }
    Ok((0..len)
        .step_by(batch_size)
        .map(|start| start..(start + batch_size).min(len))
        .collect())
}
