//! `warren` multiplexes a handful of RabbitMQ connections into a larger, always-available pool
//! of channels, built on top of [`lapin`].
//!
//! The crate is organised in three layers:
//! - [`ConnectionPool`](crate::pool::ConnectionPool) owns a fixed set of broker connections and
//!   hands them out round-robin, reopening them lazily when they die;
//! - [`ChannelPool`](crate::pool::ChannelPool) leases long-lived channels (plain or with publisher
//!   confirms) to concurrent callers, repairs dead channels on their next lease and grows its
//!   capacity under sustained starvation;
//! - [`DeliveryService`](crate::delivery::DeliveryService) publishes and consumes messages on
//!   leased channels, defining what success and partial failure mean for batches.
//!
//! The broker itself is consumed through the traits in [`amqp::broker`]: use
//! [`ConnectionFactory`](crate::amqp::ConnectionFactory) to talk to a real RabbitMQ instance and
//! [`InMemoryBroker`](crate::amqp::in_memory::InMemoryBroker) in tests.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use warren::configuration::Settings;
//! use warren::delivery::{DeliveryService, Envelope};
//! use warren::pool::{ChannelPool, ConnectionPool};
//!
//! async fn example() -> Result<(), anyhow::Error> {
//!     let settings = Settings::default();
//!     let broker = Arc::new(settings.connection_factory()?);
//!
//!     let connection_pool = ConnectionPool::create(broker, &settings.pool).await?;
//!     let channel_pool = ChannelPool::create(connection_pool, &settings.pool).await?;
//!     let service = DeliveryService::new(channel_pool, settings.delivery);
//!
//!     let envelope = Envelope::default()
//!         .with_routing_key("hello".into())
//!         .with_payload(b"Hello world!".to_vec());
//!     assert!(service.publish(&envelope).await);
//!     Ok(())
//! }
//! ```

pub mod amqp;
pub mod configuration;
pub mod delivery;
pub mod pool;
