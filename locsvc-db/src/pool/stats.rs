//! Pool statistics: lock-free counters and the snapshot handed to readers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Live counters, updated by the pool
#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
    pub(crate) idle: AtomicU64,
    pub(crate) total: AtomicU64,
    pub(crate) acquired: AtomicU64,
    pub(crate) acquire_count: AtomicU64,
    pub(crate) acquire_duration_nanos: AtomicU64,
    pub(crate) empty_acquire_count: AtomicU64,
    pub(crate) new_connections_count: AtomicU64,
    pub(crate) max_lifetime_destroy_count: AtomicU64,
    pub(crate) health_check_destroy_count: AtomicU64,
    pub(crate) destroyed_count: AtomicU64,
}

impl PoolCounters {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Saturating decrement for the gauges
    pub(crate) fn decr(counter: &AtomicU64) {
        let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
            Some(v.saturating_sub(1))
        });
    }

    pub(crate) fn record_acquire(&self, waited: Duration) {
        self.acquire_count.fetch_add(1, Ordering::Relaxed);
        let nanos = u64::try_from(waited.as_nanos()).unwrap_or(u64::MAX);
        self.acquire_duration_nanos
            .fetch_add(nanos, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, max_connections: u32) -> PoolStatistics {
        let gauge = |c: &AtomicU64| u32::try_from(c.load(Ordering::Relaxed)).unwrap_or(u32::MAX);
        PoolStatistics {
            idle_connections: gauge(&self.idle),
            total_connections: gauge(&self.total),
            acquired_connections: gauge(&self.acquired),
            max_connections,
            acquire_count: self.acquire_count.load(Ordering::Relaxed),
            acquire_duration: Duration::from_nanos(
                self.acquire_duration_nanos.load(Ordering::Relaxed),
            ),
            empty_acquire_count: self.empty_acquire_count.load(Ordering::Relaxed),
            new_connections_count: self.new_connections_count.load(Ordering::Relaxed),
            max_lifetime_destroy_count: self.max_lifetime_destroy_count.load(Ordering::Relaxed),
            health_check_destroy_count: self.health_check_destroy_count.load(Ordering::Relaxed),
            destroyed_count: self.destroyed_count.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the pool.
///
/// Gauges (`idle`, `total`, `acquired`) move both ways; every `*_count` and
/// `acquire_duration` only grow over the life of the pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStatistics {
    pub idle_connections: u32,
    pub total_connections: u32,
    pub acquired_connections: u32,
    pub max_connections: u32,
    /// Successful acquires
    pub acquire_count: u64,
    /// Time spent in successful acquires, summed
    pub acquire_duration: Duration,
    /// Acquires that found no idle connection
    pub empty_acquire_count: u64,
    pub new_connections_count: u64,
    pub max_lifetime_destroy_count: u64,
    pub health_check_destroy_count: u64,
    pub destroyed_count: u64,
}

impl PoolStatistics {
    pub fn mean_acquire_duration(&self) -> Duration {
        match u32::try_from(self.acquire_count) {
            Ok(0) => Duration::ZERO,
            Ok(n) => self.acquire_duration / n,
            Err(_) => Duration::from_secs_f64(
                self.acquire_duration.as_secs_f64() / self.acquire_count as f64,
            ),
        }
    }

    /// The reported series, by metric name. Acquire duration is in
    /// milliseconds.
    pub fn measurements(&self) -> [(&'static str, f64); 6] {
        [
            ("db.client.connections.idle", f64::from(self.idle_connections)),
            ("db.client.connections.total", f64::from(self.total_connections)),
            ("db.client.connections.acquire_count", self.acquire_count as f64),
            ("db.client.connections.new_count", self.new_connections_count as f64),
            (
                "db.client.connections.max_lifetime_destroy_count",
                self.max_lifetime_destroy_count as f64,
            ),
            (
                "db.client.connections.acquire_duration",
                self.acquire_duration.as_secs_f64() * 1000.0,
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decrement_saturates() {
        let counters = PoolCounters::default();
        PoolCounters::decr(&counters.idle);
        assert_eq!(counters.idle.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_mean_acquire_duration() {
        let counters = PoolCounters::default();
        assert_eq!(counters.snapshot(4).mean_acquire_duration(), Duration::ZERO);

        counters.record_acquire(Duration::from_millis(10));
        counters.record_acquire(Duration::from_millis(30));
        let stats = counters.snapshot(4);
        assert_eq!(stats.acquire_count, 2);
        assert_eq!(stats.acquire_duration, Duration::from_millis(40));
        assert_eq!(stats.mean_acquire_duration(), Duration::from_millis(20));
    }

    #[test]
    fn test_measurements_report_milliseconds() {
        let stats = PoolStatistics {
            idle_connections: 3,
            total_connections: 5,
            acquire_count: 7,
            acquire_duration: Duration::from_millis(1500),
            ..Default::default()
        };
        let m = stats.measurements();
        assert_eq!(m[0], ("db.client.connections.idle", 3.0));
        assert_eq!(m[1], ("db.client.connections.total", 5.0));
        assert_eq!(m[2].1, 7.0);
        assert_eq!(m[5], ("db.client.connections.acquire_duration", 1500.0));
    }
}
