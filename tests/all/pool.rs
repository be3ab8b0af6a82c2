use crate::helpers::{get_channel_pool, get_pool_settings};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use warren::amqp::in_memory::InMemoryBroker;
use warren::configuration::PoolSettings;
use warren::pool::{ChannelKind, Error};

#[tokio::test]
async fn a_leased_pair_is_never_both_available_and_in_use() {
    let broker = InMemoryBroker::new();
    let pool = get_channel_pool(&broker, &get_pool_settings(3)).await;

    let mut workers = Vec::new();
    for _ in 0..10 {
        let pool = pool.clone();
        workers.push(tokio::spawn(async move {
            for _ in 0..20 {
                let pair = pool.lease(ChannelKind::Plain).await.unwrap();
                assert!(!pool.available_ids(ChannelKind::Plain).contains(&pair.id()));
                assert!(pool.in_use_ids(ChannelKind::Plain).contains(&pair.id()));
                tokio::task::yield_now().await;
                assert!(pool.return_pair(pair));
            }
        }));
    }
    for worker in workers {
        worker.await.unwrap();
    }

    let available = pool.available_ids(ChannelKind::Plain);
    assert_eq!(available.len(), 3);
    assert_eq!(available.iter().collect::<HashSet<_>>().len(), 3);
    assert!(pool.in_use_ids(ChannelKind::Plain).is_empty());
}

#[tokio::test]
async fn ids_are_unique_across_sub_pools() {
    let broker = InMemoryBroker::new();
    let pool = get_channel_pool(&broker, &get_pool_settings(5)).await;

    let ids: HashSet<_> = pool
        .available_ids(ChannelKind::Plain)
        .into_iter()
        .chain(pool.available_ids(ChannelKind::Ackable))
        .collect();

    assert_eq!(ids.len(), 10);
    assert_eq!(broker.channels_opened(), 10);
}

#[tokio::test]
async fn returning_a_pair_that_is_not_in_use_is_a_no_op() {
    let broker = InMemoryBroker::new();
    let pool = get_channel_pool(&broker, &get_pool_settings(2)).await;

    let pair = pool.lease(ChannelKind::Plain).await.unwrap();
    let copy = pair.clone();
    assert!(pool.return_pair(pair));
    let before = pool.available_ids(ChannelKind::Plain);

    assert!(!pool.return_pair(copy));

    assert_eq!(pool.available_ids(ChannelKind::Plain), before);
    assert_eq!(pool.capacity(ChannelKind::Plain), 2);
}

#[tokio::test]
async fn returning_a_pair_to_the_wrong_pool_kind_is_impossible() {
    let broker = InMemoryBroker::new();
    let pool = get_channel_pool(&broker, &get_pool_settings(1)).await;

    let pair = pool.lease(ChannelKind::Ackable).await.unwrap();
    assert_eq!(pair.kind(), ChannelKind::Ackable);
    assert!(pool.return_pair(pair));

    assert_eq!(pool.available_ids(ChannelKind::Ackable).len(), 1);
    assert_eq!(pool.available_ids(ChannelKind::Plain).len(), 1);
}

#[tokio::test]
async fn a_pair_flagged_dead_is_repaired_on_its_next_lease() {
    let broker = InMemoryBroker::new();
    let pool = get_channel_pool(&broker, &get_pool_settings(1)).await;
    let pair = pool.lease(ChannelKind::Plain).await.unwrap();
    let (id, old_handle) = (pair.id(), pair.handle().clone());
    assert!(pool.return_pair(pair));

    pool.flag_dead(id);
    pool.flag_dead(id);
    assert!(pool.is_dead(id));
    let repaired = pool.lease(ChannelKind::Plain).await.unwrap();

    assert_eq!(repaired.id(), id);
    assert!(!repaired.handle().is_closed());
    assert!(!Arc::ptr_eq(repaired.handle(), &old_handle));
    assert!(old_handle.is_closed());
    assert!(!pool.is_dead(id));
}

#[tokio::test]
async fn a_closed_channel_is_repaired_on_its_next_lease() {
    let broker = InMemoryBroker::new();
    let pool = get_channel_pool(&broker, &get_pool_settings(1)).await;
    let pair = pool.lease(ChannelKind::Ackable).await.unwrap();
    let id = pair.id();
    pair.handle().close().await.unwrap();
    assert!(pool.return_pair(pair));

    let repaired = pool.lease(ChannelKind::Ackable).await.unwrap();

    assert_eq!(repaired.id(), id);
    assert!(!repaired.handle().is_closed());
    // Confirm mode is re-applied: unroutable mandatory messages are reported.
    let outcome = repaired
        .handle()
        .publish("missing-exchange", "key", true, <_>::default(), b"body")
        .await;
    assert!(outcome.is_err());
}

#[tokio::test]
async fn a_severed_connection_heals_on_next_use() {
    let broker = InMemoryBroker::new();
    let settings = PoolSettings {
        max_connections: 1,
        ..get_pool_settings(1)
    };
    let pool = get_channel_pool(&broker, &settings).await;
    assert!(broker.sever_connection("test:PoolConnection:0"));
    assert!(broker.open_connections().is_empty());

    let pair = pool.lease(ChannelKind::Plain).await.unwrap();

    assert!(!pair.handle().is_closed());
    assert_eq!(broker.open_connections(), vec!["test:PoolConnection:0"]);
    assert_eq!(broker.connections_opened(), 2);
}

#[tokio::test]
async fn a_blocked_lease_receives_the_first_returned_pair() {
    let broker = InMemoryBroker::new();
    let pool = get_channel_pool(&broker, &get_pool_settings(2)).await;
    let first = pool.lease(ChannelKind::Plain).await.unwrap();
    let _second = pool.lease(ChannelKind::Plain).await.unwrap();

    let third = tokio::spawn({
        let pool = pool.clone();
        async move { pool.lease(ChannelKind::Plain).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!third.is_finished());

    let first_id = first.id();
    assert!(pool.return_pair(first));
    let third = tokio::time::timeout(Duration::from_secs(1), third)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert_eq!(third.id(), first_id);
}

#[tokio::test]
async fn starvation_grows_the_pool_once_per_growth_event() {
    let broker = InMemoryBroker::new();
    let settings = PoolSettings {
        auto_scaling: true,
        auto_scaling_threshold: 3,
        auto_scaling_window_ms: 60_000,
        ..get_pool_settings(1)
    };
    let pool = get_channel_pool(&broker, &settings).await;
    let _first = pool.lease(ChannelKind::Plain).await.unwrap();

    let _second = pool.lease(ChannelKind::Plain).await.unwrap();
    assert_eq!(pool.capacity(ChannelKind::Plain), 2);
    assert_eq!(pool.scaling_iteration_count(ChannelKind::Plain), 1);

    let _third = pool.lease(ChannelKind::Plain).await.unwrap();
    assert_eq!(pool.capacity(ChannelKind::Plain), 3);
    assert_eq!(pool.scaling_iteration_count(ChannelKind::Plain), 2);

    // The other sub-pool is untouched.
    assert_eq!(pool.capacity(ChannelKind::Ackable), 1);
    assert_eq!(pool.scaling_iteration_count(ChannelKind::Ackable), 0);
}

#[tokio::test]
async fn grown_channels_keep_the_confirm_mode_of_their_sub_pool() {
    let broker = InMemoryBroker::new();
    let settings = PoolSettings {
        auto_scaling: true,
        auto_scaling_threshold: 1,
        ..get_pool_settings(1)
    };
    let pool = get_channel_pool(&broker, &settings).await;
    let _first = pool.lease(ChannelKind::Ackable).await.unwrap();

    let grown = pool.lease(ChannelKind::Ackable).await.unwrap();

    assert_eq!(pool.scaling_iteration_count(ChannelKind::Ackable), 1);
    let outcome = grown
        .handle()
        .publish("missing-exchange", "key", true, <_>::default(), b"body")
        .await;
    assert!(outcome.is_err());
}

#[tokio::test]
async fn growth_stops_at_the_scaling_ceiling() {
    let broker = InMemoryBroker::new();
    let settings = PoolSettings {
        auto_scaling: true,
        auto_scaling_threshold: 1,
        auto_scaling_ceiling: 1,
        ..get_pool_settings(1)
    };
    let pool = get_channel_pool(&broker, &settings).await;
    let _first = pool.lease(ChannelKind::Plain).await.unwrap();

    let outcome =
        tokio::time::timeout(Duration::from_millis(100), pool.lease(ChannelKind::Plain)).await;

    assert!(outcome.is_err());
    assert_eq!(pool.capacity(ChannelKind::Plain), 1);
    assert_eq!(pool.scaling_iteration_count(ChannelKind::Plain), 0);
}

#[tokio::test]
async fn a_cancelled_lease_leaves_the_pool_untouched() {
    let broker = InMemoryBroker::new();
    let pool = get_channel_pool(&broker, &get_pool_settings(1)).await;
    let leased = pool.lease(ChannelKind::Plain).await.unwrap();
    let cancel = CancellationToken::new();

    let pending = tokio::spawn({
        let (pool, cancel) = (pool.clone(), cancel.clone());
        async move { pool.lease_with_cancellation(ChannelKind::Plain, &cancel).await }
    });
    tokio::time::sleep(Duration::from_millis(30)).await;
    cancel.cancel();

    assert!(matches!(pending.await.unwrap(), Err(Error::Cancelled)));
    assert_eq!(pool.in_use_ids(ChannelKind::Plain), vec![leased.id()]);
    assert!(pool.available_ids(ChannelKind::Plain).is_empty());
    assert!(pool.return_pair(leased));
}

#[tokio::test]
async fn a_dropped_lease_does_not_shrink_the_pool() {
    let broker = InMemoryBroker::new();
    let pool = get_channel_pool(&broker, &get_pool_settings(1)).await;
    let pair = pool.lease(ChannelKind::Plain).await.unwrap();
    pool.flag_dead(pair.id());
    assert!(pool.return_pair(pair));
    broker.refuse_connections(usize::MAX);
    assert!(broker.sever_connection("test:PoolConnection:0"));
    assert!(broker.sever_connection("test:PoolConnection:1"));

    // The repair cannot succeed: the lease keeps retrying until it is dropped.
    let outcome =
        tokio::time::timeout(Duration::from_millis(100), pool.lease(ChannelKind::Plain)).await;

    assert!(outcome.is_err());
    assert_eq!(pool.available_ids(ChannelKind::Plain).len(), 1);
    assert!(pool.in_use_ids(ChannelKind::Plain).is_empty());
}

#[tokio::test]
async fn failed_repairs_are_reported_when_failures_propagate() {
    let broker = InMemoryBroker::new();
    let settings = PoolSettings {
        propagate_internal_failures: true,
        ..get_pool_settings(1)
    };
    let pool = get_channel_pool(&broker, &settings).await;
    let pair = pool.lease(ChannelKind::Plain).await.unwrap();
    let id = pair.id();
    assert!(pool.return_pair(pair));
    broker.refuse_connections(usize::MAX);
    assert!(broker.sever_connection("test:PoolConnection:0"));
    assert!(broker.sever_connection("test:PoolConnection:1"));

    let outcome = pool.lease(ChannelKind::Plain).await;

    assert!(matches!(outcome, Err(Error::BrokerUnreachable { .. })));
    assert!(pool.is_dead(id));
    assert_eq!(pool.available_ids(ChannelKind::Plain), vec![id]);
}

#[tokio::test]
async fn closing_the_pool_ends_pending_leases() {
    let broker = InMemoryBroker::new();
    let pool = get_channel_pool(&broker, &get_pool_settings(1)).await;
    let _leased = pool.lease(ChannelKind::Plain).await.unwrap();
    let pending = tokio::spawn({
        let pool = pool.clone();
        async move { pool.lease(ChannelKind::Plain).await }
    });
    tokio::time::sleep(Duration::from_millis(30)).await;

    pool.close().await;

    assert!(matches!(pending.await.unwrap(), Err(Error::Closed)));
    assert!(broker.open_connections().is_empty());
    assert!(matches!(
        pool.lease(ChannelKind::Ackable).await,
        Err(Error::Closed)
    ));
}
