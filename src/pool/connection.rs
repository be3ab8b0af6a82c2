//! A fixed set of broker connections, handed out round-robin.
use crate::amqp::{Broker, ConnectionHandle};
use crate::configuration::PoolSettings;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::Error;

/// `ConnectionPool` owns `max_connections` connections to the broker.
///
/// Connections are shared, not leased: [`ConnectionPool::get_connection`] rotates through them
/// so that channels end up spread across all connections. A connection found closed (or that
/// could not be opened at construction) is reopened, under the same name, by the next caller
/// that lands on it. Once [`ConnectionPool::close`] was called, nothing is reopened.
pub struct ConnectionPool {
    broker: Arc<dyn Broker>,
    slots: Vec<ConnectionSlot>,
    cursor: AtomicUsize,
    closed: CancellationToken,
}

struct ConnectionSlot {
    name: String,
    // Async mutex: at most one caller reopens a given slot.
    connection: Mutex<Option<ConnectionHandle>>,
}

impl ConnectionPool {
    /// Open `settings.max_connections` connections named `{prefix}:PoolConnection:{i}`.
    ///
    /// A connection that fails to open aborts construction if
    /// `settings.propagate_internal_failures` is set; otherwise it is logged and its slot is
    /// left empty, to be filled on first use. Construction fails if no connection opens at all.
    #[tracing::instrument(name = "connection_pool_create", skip_all, fields(prefix = %settings.connection_name_prefix))]
    pub async fn create(
        broker: Arc<dyn Broker>,
        settings: &PoolSettings,
    ) -> Result<Arc<Self>, Error> {
        let mut slots = Vec::with_capacity(settings.max_connections);
        let mut opened = 0;
        for i in 0..settings.max_connections {
            let name = format!("{}:PoolConnection:{i}", settings.connection_name_prefix);
            let connection = match broker.open_connection(&name).await {
                Ok(connection) => {
                    opened += 1;
                    Some(connection)
                }
                Err(source) if settings.propagate_internal_failures => {
                    return Err(Error::BrokerUnreachable { name, source });
                }
                Err(e) => {
                    warn!(connection = %name, error = %e, "Failed to open pooled connection, skipping it");
                    None
                }
            };
            slots.push(ConnectionSlot {
                name,
                connection: Mutex::new(connection),
            });
        }
        if opened == 0 {
            return Err(Error::NoConnections);
        }
        info!(opened, size = slots.len(), "Connection pool ready");

        Ok(Arc::new(Self {
            broker,
            slots,
            cursor: AtomicUsize::new(0),
            closed: CancellationToken::new(),
        }))
    }

    /// Get the next connection in round-robin order, reopening it if it is missing or closed.
    ///
    /// Fails with [`Error::Closed`] once the pool is closed.
    pub async fn get_connection(&self) -> Result<ConnectionHandle, Error> {
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.slots.len();
        let slot = &self.slots[index];

        let mut connection = slot.connection.lock().await;
        // Checked under the slot lock: `close` flags the pool before emptying any slot.
        if self.closed.is_cancelled() {
            return Err(Error::Closed);
        }
        match connection.as_ref() {
            Some(c) if c.is_open() => Ok(c.clone()),
            _ => {
                let reopened = self
                    .broker
                    .open_connection(&slot.name)
                    .await
                    .map_err(|source| Error::BrokerUnreachable {
                        name: slot.name.clone(),
                        source,
                    })?;
                info!(connection = %slot.name, "Reopened pooled connection");
                *connection = Some(reopened.clone());
                Ok(reopened)
            }
        }
    }

    /// Close every pooled connection. Failures are logged and otherwise ignored.
    #[tracing::instrument(name = "connection_pool_close", skip_all)]
    pub async fn close(&self) {
        self.closed.cancel();
        for slot in &self.slots {
            let connection = slot.connection.lock().await.take();
            if let Some(connection) = connection {
                if let Err(e) = connection.close().await {
                    warn!(connection = %slot.name, error = %e, "Failed to close pooled connection");
                }
            }
        }
    }
}
