use std::time::Duration;

use tokio::time::{self, Instant};

use super::*;
use crate::error::TelemetryError;
use crate::hooks::NoopHooks;
use crate::instrument::{EventKind, QueryEvent, TelemetrySink};
use crate::testing::{Fault, MemoryCluster};

fn config(max: u32, min: u32) -> PoolConfiguration {
    PoolConfiguration::builder()
        .hosts("127.0.0.1:5433")
        .max_connections(max)
        .min_connections(min)
        .max_connection_lifetime_jitter(Duration::ZERO)
        .health_check_period(Duration::from_secs(3600))
        .build()
        .unwrap()
}

fn pool(cluster: &MemoryCluster, config: PoolConfiguration) -> Pool {
    Pool::builder(config)
        .connector(cluster.clone())
        .hooks(NoopHooks)
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_build_requires_runtime() {
    let config = config(1, 0);
    let result = std::thread::spawn(move || Pool::builder(config).build().map(|_| ()))
        .join()
        .unwrap();
    assert!(matches!(result, Err(DbError::Configuration { .. })));
}

#[tokio::test]
async fn test_released_connection_is_reused() {
    let cluster = MemoryCluster::default();
    let pool = pool(&cluster, config(2, 0));

    let conn = pool.acquire().await.unwrap();
    conn.release().await;
    let conn = pool.acquire().await.unwrap();
    conn.release().await;

    assert_eq!(cluster.connects(), 1);
    let stats = pool.stat();
    assert_eq!(stats.total_connections, 1);
    assert_eq!(stats.idle_connections, 1);
    assert_eq!(stats.acquired_connections, 0);
    assert_eq!(stats.acquire_count, 2);
    assert_eq!(stats.new_connections_count, 1);
    assert_eq!(stats.empty_acquire_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_pool_fails_at_deadline() {
    let cluster = MemoryCluster::default();
    let pool = pool(&cluster, config(1, 0));
    let held = pool.acquire().await.unwrap();

    let started = Instant::now();
    let err = pool
        .acquire_until(started + Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::PoolExhausted { max_connections: 1, .. }));
    assert!(started.elapsed() >= Duration::from_millis(100));

    held.release().await;
    assert!(pool.acquire().await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_waiter_gets_connection_when_one_is_released() {
    let cluster = MemoryCluster::default();
    let pool = pool(&cluster, config(1, 0));
    let held = pool.acquire().await.unwrap();

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire().await.map(|conn| conn.endpoint().to_string()) })
    };
    time::sleep(Duration::from_millis(50)).await;
    held.release().await;

    assert_eq!(waiter.await.unwrap().unwrap(), "127.0.0.1:5433");
    assert_eq!(cluster.connects(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_acquire_does_not_leak() {
    let cluster = MemoryCluster::default();
    cluster.set_connect_latency(Duration::from_secs(1));
    let pool = pool(&cluster, config(1, 0));

    let abandoned = time::timeout(Duration::from_millis(100), pool.acquire()).await;
    assert!(abandoned.is_err());

    // the checkout finishes in the background and parks the connection
    time::sleep(Duration::from_secs(2)).await;
    let stats = pool.stat();
    assert_eq!(stats.acquired_connections, 0);
    assert_eq!(stats.idle_connections, 1);
    assert_eq!(stats.total_connections, 1);

    let conn = pool.acquire().await.unwrap();
    conn.release().await;
    assert_eq!(cluster.connects(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_acquire_dropped_after_handoff_returns_connection() {
    let cluster = MemoryCluster::default();
    cluster.set_connect_latency(Duration::from_millis(100));
    let pool = pool(&cluster, config(1, 0));

    let mut acquire = Box::pin(pool.acquire());
    assert!(time::timeout(Duration::from_millis(1), &mut acquire)
        .await
        .is_err());
    // the checkout completes and hands over a connection nobody reads
    time::sleep(Duration::from_millis(500)).await;
    drop(acquire);
    time::sleep(Duration::from_millis(10)).await;

    let stats = pool.stat();
    assert_eq!(stats.acquired_connections, 0);
    assert_eq!(stats.idle_connections, 1);
    assert_eq!(stats.total_connections, 1);
    assert_eq!(cluster.open_sessions().len(), 1);

    let conn = pool.acquire().await.unwrap();
    conn.release().await;
    assert_eq!(cluster.connects(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_slow_connect_hits_deadline() {
    let cluster = MemoryCluster::default();
    cluster.set_connect_latency(Duration::from_secs(10));
    let pool = pool(&cluster, config(1, 0));

    let err = pool
        .acquire_until(Instant::now() + Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::ConnectTimeout { .. }));
    assert!(err.is_unavailable());
}

#[tokio::test(start_paused = true)]
async fn test_refused_connects_are_retried() {
    let cluster = MemoryCluster::default();
    cluster.refuse_connects(2);
    let pool = pool(&cluster, config(1, 0));

    let conn = pool.acquire().await.unwrap();
    conn.release().await;
    assert_eq!(cluster.connects(), 1);
    assert_eq!(pool.stat().new_connections_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_cluster_is_unavailable() {
    let cluster = MemoryCluster::default();
    cluster.refuse_connects(u64::MAX);
    let pool = pool(&cluster, config(1, 0));

    let err = pool
        .acquire_until(Instant::now() + Duration::from_millis(500))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DbError::Connection { .. } | DbError::ConnectTimeout { .. }
    ));
    assert_eq!(pool.stat().total_connections, 0);
}

#[tokio::test]
async fn test_release_turns_follower_reads_off() {
    let cluster = MemoryCluster::default();
    let pool = pool(&cluster, config(1, 0));

    let mut conn = pool.acquire().await.unwrap();
    conn.set_follower_reads(true).await.unwrap();
    assert!(conn.session().follower_reads);
    conn.release().await;

    let sessions = cluster.open_sessions();
    assert_eq!(sessions.len(), 1);
    assert!(!sessions[0].follower_reads);
    let last = cluster.statements().pop().unwrap();
    assert_eq!(last.sql, DISABLE_FOLLOWER_READS);
    assert_eq!(pool.stat().idle_connections, 1);
}

#[tokio::test]
async fn test_release_rolls_back_abandoned_transaction() {
    let cluster = MemoryCluster::default();
    let pool = pool(&cluster, config(1, 0));

    let mut conn = pool.acquire().await.unwrap();
    conn.set_follower_reads(true).await.unwrap();
    {
        let mut tx = conn.begin_read_only().await.unwrap();
        tx.fetch_all("SELECT * FROM location", &[]).await.unwrap();
        // dropped without commit or rollback
    }
    conn.release().await;

    let tail: Vec<String> = cluster
        .statements()
        .into_iter()
        .rev()
        .take(2)
        .map(|s| s.sql)
        .collect();
    assert_eq!(tail, vec![DISABLE_FOLLOWER_READS.to_string(), ROLLBACK.to_string()]);
    let sessions = cluster.open_sessions();
    assert!(!sessions[0].in_transaction);
    assert!(!sessions[0].follower_reads);
}

#[tokio::test]
async fn test_failed_reset_destroys_connection() {
    let cluster = MemoryCluster::default();
    let pool = pool(&cluster, config(1, 0));

    let mut conn = pool.acquire().await.unwrap();
    conn.set_follower_reads(true).await.unwrap();
    cluster.fail_next(
        "yb_read_from_followers = false",
        Fault::Execution {
            sql_state: "57014".to_string(),
        },
        1,
    );
    conn.release().await;

    let stats = pool.stat();
    assert_eq!(stats.total_connections, 0);
    assert_eq!(stats.idle_connections, 0);
    assert_eq!(stats.destroyed_count, 1);
    assert!(cluster.open_sessions().is_empty());
}

#[tokio::test]
async fn test_broken_connection_is_not_reused() {
    let cluster = MemoryCluster::default();
    let pool = pool(&cluster, config(1, 0));

    let mut conn = pool.acquire().await.unwrap();
    cluster.fail_next("SELECT 2", Fault::Disconnect, 1);
    let err = conn.fetch_all("SELECT 2", &[]).await.unwrap_err();
    assert!(err.is_fatal_to_connection());
    assert!(conn.session().broken);
    conn.release().await;

    assert_eq!(pool.stat().total_connections, 0);
    let conn = pool.acquire().await.unwrap();
    conn.release().await;
    assert_eq!(cluster.connects(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_expired_connection_is_retired() {
    let cluster = MemoryCluster::default();
    let config = PoolConfiguration::builder()
        .max_connections(1)
        .min_connections(0)
        .max_connection_lifetime(Duration::from_secs(1))
        .max_connection_lifetime_jitter(Duration::ZERO)
        .health_check_period(Duration::from_secs(3600))
        .build()
        .unwrap();
    let pool = pool(&cluster, config);

    let conn = pool.acquire().await.unwrap();
    time::sleep(Duration::from_secs(2)).await;
    conn.release().await;

    let stats = pool.stat();
    assert_eq!(stats.max_lifetime_destroy_count, 1);
    assert_eq!(stats.total_connections, 0);

    let conn = pool.acquire().await.unwrap();
    conn.release().await;
    assert_eq!(cluster.connects(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_min_connections_are_opened_in_background() {
    let cluster = MemoryCluster::default();
    let pool = pool(&cluster, config(5, 3));

    time::sleep(Duration::from_millis(10)).await;
    let stats = pool.stat();
    assert_eq!(stats.total_connections, 3);
    assert_eq!(stats.idle_connections, 3);
    assert_eq!(cluster.connects(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_health_check_drops_dead_idle_connections() {
    let cluster = MemoryCluster::default();
    let config = PoolConfiguration::builder()
        .max_connections(2)
        .min_connections(0)
        .health_check_period(Duration::from_secs(1))
        .build()
        .unwrap();
    let pool = pool(&cluster, config);

    let conn = pool.acquire().await.unwrap();
    conn.release().await;
    assert_eq!(pool.stat().idle_connections, 1);

    cluster.terminate_all_sessions();
    time::sleep(Duration::from_millis(1500)).await;

    let stats = pool.stat();
    assert_eq!(stats.idle_connections, 0);
    assert_eq!(stats.health_check_destroy_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_close_waits_for_outstanding_connections() {
    let cluster = MemoryCluster::default();
    let pool = pool(&cluster, config(2, 0));

    let idle = pool.acquire().await.unwrap();
    let held = pool.acquire().await.unwrap();
    idle.release().await;

    tokio::spawn(async move {
        time::sleep(Duration::from_millis(100)).await;
        held.release().await;
    });
    pool.close(Duration::from_secs(5)).await;

    assert!(pool.is_closed());
    let stats = pool.stat();
    assert_eq!(stats.acquired_connections, 0);
    assert_eq!(stats.total_connections, 0);
    assert!(cluster.open_sessions().is_empty());
    assert!(matches!(pool.acquire().await, Err(DbError::PoolClosed)));
}

#[tokio::test(start_paused = true)]
async fn test_close_forces_stragglers_after_grace() {
    let cluster = MemoryCluster::default();
    let pool = pool(&cluster, config(1, 0));

    let mut held = pool.acquire().await.unwrap();
    pool.close(Duration::from_millis(100)).await;

    // terminated while the handle is still held
    assert!(cluster.open_sessions().is_empty());
    let stats = pool.stat();
    assert_eq!(stats.acquired_connections, 0);
    assert_eq!(stats.total_connections, 0);

    let err = held.execute("SELECT 1", &[]).await.unwrap_err();
    assert!(matches!(err, DbError::PoolClosed));

    held.release().await;
    let stats = pool.stat();
    assert_eq!(stats.total_connections, 0);
    assert_eq!(stats.destroyed_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_forced_close_cancels_statement_in_flight() {
    let cluster = MemoryCluster::default();
    let pool = pool(&cluster, config(1, 0));
    let mut held = pool.acquire().await.unwrap();
    cluster.set_latency(Duration::from_secs(60));

    let running = tokio::spawn(async move {
        let result = held.fetch_all("SELECT 1", &[]).await;
        held.release().await;
        result
    });
    time::sleep(Duration::from_millis(10)).await;
    pool.close(Duration::from_millis(100)).await;

    let result = time::timeout(Duration::from_secs(1), running)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(DbError::PoolClosed)));
    assert!(cluster.open_sessions().is_empty());
    assert_eq!(pool.stat().total_connections, 0);
}

#[tokio::test(start_paused = true)]
async fn test_close_during_warm_up_does_not_leak() {
    let cluster = MemoryCluster::default();
    cluster.set_connect_latency(Duration::from_millis(100));
    let pool = pool(&cluster, config(2, 1));

    // the warm-up connect is in flight when the pool closes
    time::sleep(Duration::from_millis(50)).await;
    pool.close(Duration::ZERO).await;
    time::sleep(Duration::from_secs(1)).await;

    let stats = pool.stat();
    assert_eq!(stats.total_connections, 0);
    assert_eq!(stats.idle_connections, 0);
    assert!(cluster.open_sessions().is_empty());
}

#[derive(Default)]
struct EventKinds(std::sync::Mutex<Vec<EventKind>>);

impl TelemetrySink for EventKinds {
    fn record(&self, event: &QueryEvent) -> Result<(), TelemetryError> {
        self.0.lock().unwrap().push(event.kind);
        Ok(())
    }
}

#[tokio::test]
async fn test_destroyed_connection_emits_close_event() {
    let cluster = MemoryCluster::default();
    let events = Arc::new(EventKinds::default());
    let config = config(1, 0);
    let pool = Pool::builder(config.clone())
        .connector(cluster.clone())
        .hooks(NoopHooks)
        .instrumentation(QueryInstrumentation::new(&config).with_sink(events.clone()))
        .build()
        .unwrap();

    let conn = pool.acquire().await.unwrap();
    conn.release().await;
    pool.close(Duration::from_secs(1)).await;

    let kinds = events.0.lock().unwrap().clone();
    assert_eq!(kinds.first(), Some(&EventKind::Connect));
    assert_eq!(kinds.last(), Some(&EventKind::Close));
    assert_eq!(kinds.iter().filter(|k| **k == EventKind::Close).count(), 1);
}

#[tokio::test]
async fn test_pooled_connection_debug_shows_endpoint() {
    let cluster = MemoryCluster::default();
    let pool = pool(&cluster, config(1, 0));

    let conn = pool.acquire().await.unwrap();
    let rendered = format!("{conn:?}");
    assert!(rendered.contains("127.0.0.1:5433"));
    assert!(rendered.contains("follower_reads: false"));
    conn.release().await;
}

#[tokio::test(start_paused = true)]
async fn test_dropped_connection_returns_to_pool() {
    let cluster = MemoryCluster::default();
    let pool = pool(&cluster, config(1, 0));

    let mut conn = pool.acquire().await.unwrap();
    conn.set_follower_reads(true).await.unwrap();
    drop(conn);
    time::sleep(Duration::from_millis(10)).await;

    let stats = pool.stat();
    assert_eq!(stats.acquired_connections, 0);
    assert_eq!(stats.idle_connections, 1);
    assert!(!cluster.open_sessions()[0].follower_reads);
}

#[tokio::test]
async fn test_counters_never_decrease() {
    let cluster = MemoryCluster::default();
    let pool = pool(&cluster, config(2, 0));

    let mut previous = pool.stat();
    for _ in 0..5 {
        let conn = pool.acquire().await.unwrap();
        conn.release().await;
        let current = pool.stat();
        assert!(current.acquire_count > previous.acquire_count);
        assert!(current.acquire_duration >= previous.acquire_duration);
        assert!(current.new_connections_count >= previous.new_connections_count);
        assert!(current.destroyed_count >= previous.destroyed_count);
        previous = current;
    }
    assert_eq!(previous.acquire_count, 5);
}
