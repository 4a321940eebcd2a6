/// Shared state store (component A): users, global stats, the connection-id
/// counter, and live config, tied into one `Arc` handle passed into both the
/// relay tasks and the management handlers (Design Notes §9).
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::{RuntimeConfig, SharedConfig};
use crate::stats::GlobalStats;
use crate::users::UserTable;

pub struct SharedState {
    pub users: UserTable,
    pub global_stats: GlobalStats,
    pub config: SharedConfig,
    connection_id_counter: AtomicU64,
}

impl SharedState {
    /// `init()` in the source's vocabulary: loads the user database and
    /// seeds stats/config/id-counter for a fresh process.
    pub fn init(db_path: PathBuf, config: RuntimeConfig) -> Arc<Self> {
        Arc::new(Self {
            users: UserTable::load(db_path),
            global_stats: GlobalStats::new(),
            config: SharedConfig::new(config),
            connection_id_counter: AtomicU64::new(0),
        })
    }

    /// Monotone, process-lifetime-unique, starting at 1. No mutex: a single
    /// atomic fetch-add, per SPEC_FULL.md §4.1.
    pub fn next_connection_id(&self) -> u64 {
        self.connection_id_counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn update_global_stats(&self, bytes: u64, conn_delta: i64) {
        self.global_stats.update(bytes, conn_delta);
    }

    /// Per SPEC_FULL.md §4.1: always also updates global stats, so callers
    /// with an authenticated user only need this one call.
    pub fn update_user_stats(&self, username: &str, bytes: u64, conn_delta: i64) {
        if let Some(stats) = self.users.stats_for(username) {
            stats.update(bytes, conn_delta);
        }
        self.update_global_stats(bytes, conn_delta);
    }

    /// Stamps an authenticated user's connection-open counters once CONNECT
    /// succeeds. Global stats are already charged at accept time, so this
    /// touches only the per-user side (unlike `update_user_stats`, which
    /// also charges global — used here to avoid double-counting the open).
    pub fn note_user_connection_open(&self, username: &str) {
        if let Some(stats) = self.users.stats_for(username) {
            stats.update(0, 1);
        }
    }

    /// No explicit teardown state to release beyond dropping the `Arc`;
    /// kept as an explicit method so callers (e.g. the signal handler) have
    /// a single named place documenting process shutdown, matching the
    /// source's `init`/`teardown` pairing.
    pub fn teardown(self: &Arc<Self>) {
        log::info!("shared state teardown: shutting down");
    }
}
