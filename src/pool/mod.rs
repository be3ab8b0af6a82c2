//! Pooling of broker connections and channels.
//!
//! This module provides three key guarantees:
//! - connections are shared round-robin and reopened on demand;
//! - channels are leased exclusively, and dead channels are repaired on their next lease;
//! - an empty channel pool means waiting, never failing, and sustained starvation grows it.
//!
//! ```rust
//! use std::sync::Arc;
//! use warren::amqp::in_memory::InMemoryBroker;
//! use warren::configuration::PoolSettings;
//! use warren::pool::{ChannelKind, ChannelPool, ConnectionPool};
//!
//! async fn example() -> Result<(), anyhow::Error> {
//!     let settings = PoolSettings::default();
//!     let connection_pool = ConnectionPool::create(Arc::new(InMemoryBroker::new()), &settings).await?;
//!     let pool = ChannelPool::create(connection_pool, &settings).await?;
//!
//!     let pair = pool.lease(ChannelKind::Plain).await?;
//!     // ... publish or fetch on `pair.handle()` ...
//!     assert!(pool.return_pair(pair));
//!     Ok(())
//! }
//! ```

mod channel;
mod connection;
mod error;
mod scaling;

pub use channel::{ChannelId, ChannelKind, ChannelPair, ChannelPool};
pub use connection::ConnectionPool;
pub use error::Error;
