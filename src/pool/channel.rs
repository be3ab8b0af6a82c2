//! Leasing of long-lived channels, with lazy repair and elastic growth.
use crate::amqp::ChannelHandle;
use crate::configuration::PoolSettings;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::scaling::StarvationTracker;
use super::{ConnectionPool, Error};

/// Identifies a channel for the lifetime of the pool, across repairs.
///
/// Ids are unique across both sub-pools.
pub type ChannelId = u64;

/// The two flavours of pooled channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Channels without publisher confirms.
    Plain,
    /// Channels in confirm mode: publishes wait for the broker's acknowledgement, and they are
    /// the ones handed out for manual-ack consumption.
    Ackable,
}

impl ChannelKind {
    fn confirm_mode(self) -> bool {
        matches!(self, Self::Ackable)
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plain => write!(f, "plain"),
            Self::Ackable => write!(f, "ackable"),
        }
    }
}

/// A pooled channel: a stable id and the handle currently backing it.
#[derive(Clone)]
pub struct ChannelPair {
    id: ChannelId,
    kind: ChannelKind,
    handle: ChannelHandle,
}

impl ChannelPair {
    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn handle(&self) -> &ChannelHandle {
        &self.handle
    }
}

impl fmt::Debug for ChannelPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelPair")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("closed", &self.handle.is_closed())
            .finish()
    }
}

/// `ChannelPool` leases channels to concurrent callers.
///
/// It keeps two sub-pools, one of [`ChannelKind::Plain`] and one of [`ChannelKind::Ackable`]
/// channels, each pre-populated with `max_channels` channels opened round-robin over the
/// [`ConnectionPool`]. Every pair is, at any time, either available or in use.
///
/// # Leasing
///
/// [`ChannelPool::lease`] never fails because the sub-pool is empty: it polls every
/// `sleep_on_empty_pool_ms` until a pair is returned. With `auto_scaling` enabled, sustained
/// starvation adds channels to the sub-pool (capacity only ever grows).
///
/// # Dead channels
///
/// A channel found closed, or flagged with [`ChannelPool::flag_dead`], is repaired by the next
/// lease that dequeues it: a fresh handle replaces the old one under the same id. There is no
/// background health check.
///
/// # Ownership
///
/// A lease guarantees exclusive ownership, not thread-safety of the handle: callers must drive a
/// leased channel from a single flow of operations and hand it back with
/// [`ChannelPool::return_pair`].
pub struct ChannelPool {
    connection_pool: Arc<ConnectionPool>,
    plain: SubPool,
    ackable: SubPool,
    next_id: AtomicU64,
    dead: DashSet<ChannelId>,
    sleep_on_empty_pool: Duration,
    auto_scaling: bool,
    auto_scaling_step: usize,
    auto_scaling_ceiling: usize,
    propagate_internal_failures: bool,
    shutdown: CancellationToken,
}

struct SubPool {
    kind: ChannelKind,
    available: Mutex<VecDeque<ChannelPair>>,
    in_use: DashMap<ChannelId, ChannelPair>,
    capacity: AtomicUsize,
    scaling_iterations: AtomicU64,
    starvation: StarvationTracker,
    growing: AtomicBool,
}

impl SubPool {
    fn new(kind: ChannelKind, settings: &PoolSettings) -> Self {
        Self {
            kind,
            available: Mutex::new(VecDeque::with_capacity(settings.max_channels)),
            in_use: DashMap::new(),
            capacity: AtomicUsize::new(0),
            scaling_iterations: AtomicU64::new(0),
            starvation: StarvationTracker::new(
                settings.auto_scaling_threshold,
                settings.auto_scaling_window(),
            ),
            growing: AtomicBool::new(false),
        }
    }

    fn add(&self, pair: ChannelPair) {
        self.available.lock().push_back(pair);
        self.capacity.fetch_add(1, Ordering::SeqCst);
    }

    /// Move the head of the available queue into the in-use set.
    ///
    /// Both moves happen under the queue lock, so a pair is never seen in both places.
    fn check_out(&self) -> Option<ChannelPair> {
        let mut available = self.available.lock();
        let pair = available.pop_front()?;
        self.in_use.insert(pair.id, pair.clone());
        Some(pair)
    }

    /// Move an in-use pair back to the available queue. `false` if `id` is not in use.
    fn check_in(&self, id: ChannelId) -> bool {
        let mut available = self.available.lock();
        match self.in_use.remove(&id) {
            Some((_, pair)) => {
                available.push_back(pair);
                true
            }
            None => false,
        }
    }

    fn replace_in_use(&self, pair: ChannelPair) {
        if let Some(mut entry) = self.in_use.get_mut(&pair.id) {
            *entry = pair;
        }
    }
}

/// Puts a checked-out pair back if the lease does not complete, e.g. when the lease future is
/// dropped mid-repair.
struct CheckoutGuard<'a> {
    sub_pool: &'a SubPool,
    id: ChannelId,
    armed: bool,
}

impl CheckoutGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for CheckoutGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.sub_pool.check_in(self.id);
        }
    }
}

/// Clears the "growth in progress" flag, even if the growing lease is dropped.
struct GrowthGuard<'a>(&'a AtomicBool);

impl Drop for GrowthGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl ChannelPool {
    /// Build a pool on top of `connection_pool`, opening `settings.max_channels` channels for each
    /// sub-pool.
    #[tracing::instrument(name = "channel_pool_create", skip_all, fields(capacity = settings.max_channels))]
    pub async fn create(
        connection_pool: Arc<ConnectionPool>,
        settings: &PoolSettings,
    ) -> Result<Arc<Self>, Error> {
        let pool = Self {
            connection_pool,
            plain: SubPool::new(ChannelKind::Plain, settings),
            ackable: SubPool::new(ChannelKind::Ackable, settings),
            next_id: AtomicU64::new(1),
            dead: DashSet::new(),
            sleep_on_empty_pool: settings.sleep_on_empty_pool(),
            auto_scaling: settings.auto_scaling,
            auto_scaling_step: settings.auto_scaling_step.max(1),
            auto_scaling_ceiling: settings.auto_scaling_ceiling,
            propagate_internal_failures: settings.propagate_internal_failures,
            shutdown: CancellationToken::new(),
        };
        for kind in [ChannelKind::Plain, ChannelKind::Ackable] {
            for _ in 0..settings.max_channels {
                let pair = pool.create_pair(kind).await?;
                pool.sub_pool(kind).add(pair);
            }
        }
        info!(capacity = settings.max_channels, "Channel pool ready");
        Ok(Arc::new(pool))
    }

    /// Lease a channel of the given kind, waiting for one to become available if needed.
    ///
    /// Waiting ends only when a pair is leased or the pool is closed.
    pub async fn lease(&self, kind: ChannelKind) -> Result<ChannelPair, Error> {
        self.lease_with_cancellation(kind, &self.shutdown).await
    }

    /// Lease a channel of the given kind, giving up with [`Error::Cancelled`] once `cancel`
    /// fires.
    ///
    /// A cancelled lease leaves the pool untouched.
    #[tracing::instrument(level = "trace", skip(self, cancel))]
    pub async fn lease_with_cancellation(
        &self,
        kind: ChannelKind,
        cancel: &CancellationToken,
    ) -> Result<ChannelPair, Error> {
        let sub_pool = self.sub_pool(kind);
        loop {
            if self.shutdown.is_cancelled() {
                return Err(Error::Closed);
            }
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            if let Some(pair) = sub_pool.check_out() {
                let id = pair.id;
                let guard = CheckoutGuard {
                    sub_pool,
                    id,
                    armed: true,
                };
                match self.ensure_healthy(sub_pool, pair).await {
                    Ok(pair) => {
                        guard.disarm();
                        trace!(channel_id = id, %kind, "Leased channel");
                        return Ok(pair);
                    }
                    Err(e) => {
                        self.dead.insert(id);
                        drop(guard);
                        if self.propagate_internal_failures {
                            return Err(e);
                        }
                        warn!(channel_id = id, %kind, error = %e, "Failed to repair channel, will retry");
                    }
                }
            } else if self.auto_scaling && sub_pool.starvation.record_miss() {
                self.grow(sub_pool).await;
                continue;
            }

            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => return Err(Error::Closed),
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(self.sleep_on_empty_pool) => {}
            }
        }
    }

    /// Hand a leased pair back to its sub-pool.
    ///
    /// Returns `false`, and changes nothing, if the pair is not currently in use.
    pub fn return_pair(&self, pair: ChannelPair) -> bool {
        let returned = self.sub_pool(pair.kind).check_in(pair.id);
        if returned {
            trace!(channel_id = pair.id, kind = %pair.kind, "Returned channel");
        } else {
            warn!(channel_id = pair.id, kind = %pair.kind, "Returned a channel that was not in use");
        }
        returned
    }

    /// Mark a channel as broken: it will be repaired the next time it is leased.
    pub fn flag_dead(&self, id: ChannelId) {
        if self.dead.insert(id) {
            debug!(channel_id = id, "Flagged channel as dead");
        }
    }

    pub fn is_dead(&self, id: ChannelId) -> bool {
        self.dead.contains(&id)
    }

    /// Number of growth events the sub-pool went through.
    pub fn scaling_iteration_count(&self, kind: ChannelKind) -> u64 {
        self.sub_pool(kind).scaling_iterations.load(Ordering::SeqCst)
    }

    /// Number of channels owned by the sub-pool, available or in use.
    pub fn capacity(&self, kind: ChannelKind) -> usize {
        self.sub_pool(kind).capacity.load(Ordering::SeqCst)
    }

    /// Ids of the available channels, in leasing order.
    pub fn available_ids(&self, kind: ChannelKind) -> Vec<ChannelId> {
        self.sub_pool(kind)
            .available
            .lock()
            .iter()
            .map(ChannelPair::id)
            .collect()
    }

    pub fn in_use_ids(&self, kind: ChannelKind) -> Vec<ChannelId> {
        self.sub_pool(kind)
            .in_use
            .iter()
            .map(|entry| *entry.key())
            .collect()
    }

    pub fn connection_pool(&self) -> &Arc<ConnectionPool> {
        &self.connection_pool
    }

    /// Close the pool: pending leases fail with [`Error::Closed`], every channel is closed and
    /// the connection pool is closed. Failures are logged and otherwise ignored.
    #[tracing::instrument(name = "channel_pool_close", skip_all)]
    pub async fn close(&self) {
        self.shutdown.cancel();
        for sub_pool in [&self.plain, &self.ackable] {
            let handles: Vec<ChannelHandle> = {
                let available = sub_pool.available.lock();
                available
                    .iter()
                    .map(|pair| pair.handle.clone())
                    .chain(sub_pool.in_use.iter().map(|entry| entry.handle.clone()))
                    .collect()
            };
            for handle in handles.into_iter().filter(|h| !h.is_closed()) {
                if let Err(e) = handle.close().await {
                    debug!(kind = %sub_pool.kind, error = %e, "Failed to close pooled channel");
                }
            }
        }
        self.connection_pool.close().await;
    }

    fn sub_pool(&self, kind: ChannelKind) -> &SubPool {
        match kind {
            ChannelKind::Plain => &self.plain,
            ChannelKind::Ackable => &self.ackable,
        }
    }

    async fn open_handle(&self, kind: ChannelKind) -> Result<ChannelHandle, Error> {
        let connection = self.connection_pool.get_connection().await?;
        let handle = connection
            .open_channel()
            .await
            .map_err(Error::ChannelCreation)?;
        if kind.confirm_mode() {
            handle
                .enable_confirm_mode()
                .await
                .map_err(Error::ChannelCreation)?;
        }
        Ok(handle)
    }

    async fn create_pair(&self, kind: ChannelKind) -> Result<ChannelPair, Error> {
        let handle = self.open_handle(kind).await?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        debug!(channel_id = id, %kind, "Opened channel");
        Ok(ChannelPair { id, kind, handle })
    }

    /// Swap the handle of a dead or closed pair for a fresh one, keeping its id.
    async fn ensure_healthy(
        &self,
        sub_pool: &SubPool,
        pair: ChannelPair,
    ) -> Result<ChannelPair, Error> {
        let flagged = self.dead.contains(&pair.id);
        if !flagged && !pair.handle.is_closed() {
            return Ok(pair);
        }
        self.repair(sub_pool, pair).await
    }

    #[tracing::instrument(name = "channel_repair", skip_all, fields(channel_id = pair.id, kind = %pair.kind))]
    async fn repair(&self, sub_pool: &SubPool, pair: ChannelPair) -> Result<ChannelPair, Error> {
        if !pair.handle.is_closed() {
            // Flagged but still open: don't leak it on the broker.
            let _ = pair.handle.close().await;
        }
        let handle = self
            .open_handle(pair.kind)
            .await
            .map_err(|e| match e {
                Error::ChannelCreation(source) => Error::ChannelRepair {
                    id: pair.id,
                    source,
                },
                e => e,
            })?;
        let repaired = ChannelPair { handle, ..pair };
        sub_pool.replace_in_use(repaired.clone());
        self.dead.remove(&repaired.id);
        info!("Repaired dead channel");
        Ok(repaired)
    }

    /// Add up to `auto_scaling_step` channels to `sub_pool`; one growth event at a time.
    #[tracing::instrument(name = "channel_pool_grow", skip_all, fields(kind = %sub_pool.kind))]
    async fn grow(&self, sub_pool: &SubPool) {
        if sub_pool.growing.swap(true, Ordering::SeqCst) {
            return;
        }
        let _growth = GrowthGuard(&sub_pool.growing);

        let capacity = sub_pool.capacity.load(Ordering::SeqCst);
        let step = self
            .auto_scaling_step
            .min(self.auto_scaling_ceiling.saturating_sub(capacity));
        if step == 0 {
            warn!(capacity, "Channel pool is starved but reached its scaling ceiling");
            return;
        }

        let mut added = 0;
        for _ in 0..step {
            match self.create_pair(sub_pool.kind).await {
                Ok(pair) => {
                    sub_pool.add(pair);
                    added += 1;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to open a channel while scaling up");
                    break;
                }
            }
        }
        if added > 0 {
            let iteration = sub_pool.scaling_iterations.fetch_add(1, Ordering::SeqCst) + 1;
            info!(
                added,
                capacity = capacity + added,
                iteration,
                "Scaled up starved channel pool"
            );
        }
    }
}
