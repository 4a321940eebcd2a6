/// Global and per-user traffic statistics (component A's stats half).
///
/// Kept as atomics rather than behind a mutex, per the Design Notes'
/// suggested strengthening: the user table is contention-sensitive (string
/// comparisons, growth/shrink), stats updates are on the hot relay path and
/// need to stay lock-free.
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

#[derive(Debug, Default)]
pub struct GlobalStats {
    pub total_connections: AtomicU64,
    pub current_connections: AtomicU64,
    pub total_bytes_transferred: AtomicU64,
    pub current_bytes_transferred: AtomicU64,
    pub peak_concurrent_connections: AtomicU64,
    server_start_time: Mutex<Option<DateTime<Utc>>>,
}

impl GlobalStats {
    pub fn new() -> Self {
        let stats = Self::default();
        *stats.server_start_time.lock() = Some(Utc::now());
        stats
    }

    pub fn server_start_time(&self) -> DateTime<Utc> {
        self.server_start_time.lock().unwrap_or_else(Utc::now)
    }

    /// See SPEC_FULL.md §4.1: positive `conn_delta` bumps totals/current and
    /// advances the peak if needed; negative decrements current only.
    pub fn update(&self, bytes: u64, conn_delta: i64) {
        if conn_delta > 0 {
            self.total_connections.fetch_add(conn_delta as u64, Ordering::Relaxed);
            let current = self.current_connections.fetch_add(conn_delta as u64, Ordering::Relaxed)
                + conn_delta as u64;
            self.bump_peak(current);
        } else if conn_delta < 0 {
            let delta = (-conn_delta) as u64;
            self.current_connections.fetch_sub(delta.min(self.current_connections.load(Ordering::Relaxed)), Ordering::Relaxed);
        }

        if bytes > 0 {
            self.total_bytes_transferred.fetch_add(bytes, Ordering::Relaxed);
            self.current_bytes_transferred.fetch_add(bytes, Ordering::Relaxed);
        }
    }

    fn bump_peak(&self, current: u64) {
        let mut peak = self.peak_concurrent_connections.load(Ordering::Relaxed);
        while current > peak {
            match self.peak_concurrent_connections.compare_exchange_weak(
                peak,
                current,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => peak = observed,
            }
        }
    }

    pub fn snapshot(&self) -> GlobalStatsSnapshot {
        GlobalStatsSnapshot {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            current_connections: self.current_connections.load(Ordering::Relaxed),
            total_bytes_transferred: self.total_bytes_transferred.load(Ordering::Relaxed),
            current_bytes_transferred: self.current_bytes_transferred.load(Ordering::Relaxed),
            peak_concurrent_connections: self.peak_concurrent_connections.load(Ordering::Relaxed),
            server_start_time: self.server_start_time(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GlobalStatsSnapshot {
    pub total_connections: u64,
    pub current_connections: u64,
    pub total_bytes_transferred: u64,
    pub current_bytes_transferred: u64,
    pub peak_concurrent_connections: u64,
    pub server_start_time: DateTime<Utc>,
}

/// Per-user traffic counters. `first_connection_time`/`last_connection_time`
/// and `total_connection_time` survive across connection close; the
/// `current_*` fields track in-flight state only.
#[derive(Debug, Default)]
pub struct UserStats {
    pub total_connections: AtomicU64,
    pub current_connections: AtomicU64,
    pub total_bytes_transferred: AtomicU64,
    pub current_bytes_transferred: AtomicU64,
    pub total_connection_time_secs: AtomicU64,
    first_connection_time: Mutex<Option<DateTime<Utc>>>,
    last_connection_time: Mutex<Option<DateTime<Utc>>>,
}

impl UserStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Per-user equivalent of `GlobalStats::update`, additionally stamping
    /// first/last connection times and, on close, accumulating connected
    /// seconds since the last open.
    pub fn update(&self, bytes: u64, conn_delta: i64) {
        let now = Utc::now();

        if conn_delta > 0 {
            self.total_connections.fetch_add(conn_delta as u64, Ordering::Relaxed);
            self.current_connections.fetch_add(conn_delta as u64, Ordering::Relaxed);

            let mut first = self.first_connection_time.lock();
            if first.is_none() {
                *first = Some(now);
            }
            *self.last_connection_time.lock() = Some(now);
        } else if conn_delta < 0 {
            let delta = (-conn_delta) as u64;
            self.current_connections.fetch_sub(delta.min(self.current_connections.load(Ordering::Relaxed)), Ordering::Relaxed);

            if let Some(last) = *self.last_connection_time.lock() {
                let elapsed = (now - last).num_seconds().max(0) as u64;
                self.total_connection_time_secs.fetch_add(elapsed, Ordering::Relaxed);
            }
        }

        if bytes > 0 {
            self.total_bytes_transferred.fetch_add(bytes, Ordering::Relaxed);
            self.current_bytes_transferred.fetch_add(bytes, Ordering::Relaxed);
        }
    }

    pub fn first_connection_time(&self) -> Option<DateTime<Utc>> {
        *self.first_connection_time.lock()
    }

    pub fn last_connection_time(&self) -> Option<DateTime<Utc>> {
        *self.last_connection_time.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_stats_tracks_peak() {
        let stats = GlobalStats::new();
        stats.update(0, 3);
        assert_eq!(stats.current_connections.load(Ordering::Relaxed), 3);
        assert_eq!(stats.peak_concurrent_connections.load(Ordering::Relaxed), 3);

        stats.update(0, -1);
        assert_eq!(stats.current_connections.load(Ordering::Relaxed), 2);
        // peak never decreases
        assert_eq!(stats.peak_concurrent_connections.load(Ordering::Relaxed), 3);

        stats.update(0, 5);
        assert_eq!(stats.peak_concurrent_connections.load(Ordering::Relaxed), 7);
    }

    #[test]
    fn global_stats_tracks_bytes() {
        let stats = GlobalStats::new();
        stats.update(100, 1);
        stats.update(50, 0);
        assert_eq!(stats.total_bytes_transferred.load(Ordering::Relaxed), 150);
        assert_eq!(stats.current_bytes_transferred.load(Ordering::Relaxed), 150);
    }

    #[test]
    fn user_stats_stamps_first_and_last() {
        let stats = UserStats::new();
        assert!(stats.first_connection_time().is_none());
        stats.update(0, 1);
        assert!(stats.first_connection_time().is_some());
        assert!(stats.last_connection_time().is_some());
        let first = stats.first_connection_time().unwrap();

        stats.update(0, 1);
        // first_connection_time does not move on subsequent opens
        assert_eq!(stats.first_connection_time().unwrap(), first);
    }

    #[test]
    fn user_stats_accumulates_connected_seconds_on_close() {
        let stats = UserStats::new();
        stats.update(0, 1);
        stats.update(0, -1);
        // elapsed between open/close in the same tick can be zero, but the
        // field must never underflow or panic.
        let _ = stats.total_connection_time_secs.load(Ordering::Relaxed);
    }
}
