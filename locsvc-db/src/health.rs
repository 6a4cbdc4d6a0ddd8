//! Pool health reporting.
//!
//! [`PoolHealthReporter`] registers observable instruments whose callbacks
//! read [`Pool::stat`] when the meter pipeline collects. The callbacks hold
//! a weak handle and only read counters: they never acquire a connection
//! and never keep a closed pool alive.

use std::time::Duration;

use opentelemetry::metrics::{Meter, ObservableCounter, ObservableGauge};
use opentelemetry::KeyValue;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::debug;

use crate::instrument::DB_SYSTEM;
use crate::pool::{Pool, PoolStatistics, WeakPool};

/// Keeps the registered pool instruments alive
pub struct PoolHealthReporter {
    _idle: ObservableGauge<u64>,
    _total: ObservableGauge<u64>,
    _acquire_count: ObservableCounter<u64>,
    _new_count: ObservableCounter<u64>,
    _max_lifetime_destroy_count: ObservableCounter<u64>,
    _acquire_duration: ObservableGauge<f64>,
}

fn observe<T>(pool: &WeakPool, read: impl Fn(&PoolStatistics) -> T) -> Option<T> {
    pool.upgrade().map(|pool| read(&pool.stat()))
}

impl PoolHealthReporter {
    /// Register the pool's instruments on `meter`
    pub fn register(pool: &Pool, meter: &Meter) -> Self {
        let attributes = vec![
            KeyValue::new("db.system", DB_SYSTEM),
            KeyValue::new(
                "pool.name",
                pool.config().application_name().to_string(),
            ),
        ];

        let idle = {
            let (pool, attrs) = (pool.downgrade(), attributes.clone());
            meter
                .u64_observable_gauge("db.client.connections.idle")
                .with_description("Idle connections in the pool")
                .with_callback(move |observer| {
                    if let Some(v) = observe(&pool, |s| u64::from(s.idle_connections)) {
                        observer.observe(v, &attrs);
                    }
                })
                .build()
        };

        let total = {
            let (pool, attrs) = (pool.downgrade(), attributes.clone());
            meter
                .u64_observable_gauge("db.client.connections.total")
                .with_description("Open connections, idle and in use")
                .with_callback(move |observer| {
                    if let Some(v) = observe(&pool, |s| u64::from(s.total_connections)) {
                        observer.observe(v, &attrs);
                    }
                })
                .build()
        };

        let acquire_count = {
            let (pool, attrs) = (pool.downgrade(), attributes.clone());
            meter
                .u64_observable_counter("db.client.connections.acquire_count")
                .with_description("Successful acquires since the pool started")
                .with_callback(move |observer| {
                    if let Some(v) = observe(&pool, |s| s.acquire_count) {
                        observer.observe(v, &attrs);
                    }
                })
                .build()
        };

        let new_count = {
            let (pool, attrs) = (pool.downgrade(), attributes.clone());
            meter
                .u64_observable_counter("db.client.connections.new_count")
                .with_description("Connections opened since the pool started")
                .with_callback(move |observer| {
                    if let Some(v) = observe(&pool, |s| s.new_connections_count) {
                        observer.observe(v, &attrs);
                    }
                })
                .build()
        };

        let max_lifetime_destroy_count = {
            let (pool, attrs) = (pool.downgrade(), attributes.clone());
            meter
                .u64_observable_counter("db.client.connections.max_lifetime_destroy_count")
                .with_description("Connections retired for reaching their max lifetime")
                .with_callback(move |observer| {
                    if let Some(v) = observe(&pool, |s| s.max_lifetime_destroy_count) {
                        observer.observe(v, &attrs);
                    }
                })
                .build()
        };

        let acquire_duration = {
            let (pool, attrs) = (pool.downgrade(), attributes);
            meter
                .f64_observable_gauge("db.client.connections.acquire_duration")
                .with_unit("ms")
                .with_description("Total time spent acquiring connections")
                .with_callback(move |observer| {
                    if let Some(v) =
                        observe(&pool, |s| s.acquire_duration.as_secs_f64() * 1000.0)
                    {
                        observer.observe(v, &attrs);
                    }
                })
                .build()
        };

        Self {
            _idle: idle,
            _total: total,
            _acquire_count: acquire_count,
            _new_count: new_count,
            _max_lifetime_destroy_count: max_lifetime_destroy_count,
            _acquire_duration: acquire_duration,
        }
    }
}

/// Log the pool statistics at DEBUG every `period`, until the pool is
/// closed or dropped
pub fn spawn_stats_logger(pool: &Pool, period: Duration) -> JoinHandle<()> {
    let pool = pool.downgrade();
    tokio::spawn(async move {
        let mut ticker = time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(pool) = pool.upgrade() else {
                break;
            };
            if pool.is_closed() {
                break;
            }
            let stats = pool.stat();
            debug!(
                idle = stats.idle_connections,
                total = stats.total_connections,
                acquired = stats.acquired_connections,
                max = stats.max_connections,
                acquire_count = stats.acquire_count,
                mean_acquire = ?stats.mean_acquire_duration(),
                new_connections = stats.new_connections_count,
                max_lifetime_destroyed = stats.max_lifetime_destroy_count,
                health_check_destroyed = stats.health_check_destroy_count,
                "pool statistics"
            );
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfiguration;
    use crate::hooks::NoopHooks;
    use crate::testing::MemoryCluster;
    use opentelemetry::metrics::MeterProvider as _;
    use opentelemetry_sdk::metrics::SdkMeterProvider;

    fn pool(cluster: &MemoryCluster) -> Pool {
        let config = PoolConfiguration::builder()
            .max_connections(2)
            .min_connections(0)
            .build()
            .unwrap();
        Pool::builder(config)
            .connector(cluster.clone())
            .hooks(NoopHooks)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_register_does_not_touch_the_pool() {
        let cluster = MemoryCluster::default();
        let pool = pool(&cluster);
        let provider = SdkMeterProvider::builder().build();
        let meter = provider.meter("locsvc-db-test");

        let before = pool.stat();
        let _reporter = PoolHealthReporter::register(&pool, &meter);
        assert_eq!(pool.stat(), before);
        assert_eq!(cluster.connects(), 0);
    }

    #[tokio::test]
    async fn test_observe_reads_only_live_pools() {
        let cluster = MemoryCluster::default();
        let pool = pool(&cluster);
        let weak = pool.downgrade();

        let conn = pool.acquire().await.unwrap();
        conn.release().await;
        assert_eq!(observe(&weak, |s| s.acquire_count), Some(1));
        assert_eq!(observe(&weak, |s| s.idle_connections), Some(1));

        drop(pool);
        assert_eq!(observe(&weak, |s| s.acquire_count), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_logger_stops_with_the_pool() {
        let cluster = MemoryCluster::default();
        let pool = pool(&cluster);
        let handle = spawn_stats_logger(&pool, Duration::from_secs(1));

        pool.close(Duration::ZERO).await;
        time::sleep(Duration::from_secs(2)).await;
        assert!(handle.is_finished());
    }
}
