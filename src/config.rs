/// Runtime configuration (component A's config half) plus the optional
/// startup TOML seed file (component H).
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use serde_derive::Deserialize;

use crate::errors::Error;

pub const MIN_BUFFER_SIZE: u32 = 512;
pub const MAX_BUFFER_CAPACITY: u32 = 65536;
pub const DEFAULT_BUFFER_SIZE: u32 = 4096;
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_MAX_CLIENTS: u32 = 1024;
pub const RETRY_DELAY_MS: u64 = 100;

/// A single immutable snapshot of the mutable runtime config. Swapped
/// wholesale under `ArcSwap` so readers never observe a torn mix of old and
/// new scalars.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeConfig {
    pub timeout_ms: u64,
    pub buffer_size: u32,
    pub max_clients: u32,
    pub dissectors_enabled: bool,
    /// 0 disables the idle timeout (the source's default behavior).
    pub idle_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_clients: DEFAULT_MAX_CLIENTS,
            dissectors_enabled: false,
            idle_timeout_secs: 0,
        }
    }
}

/// Holds the live config behind a lock-free snapshot pointer. The event
/// loop reads `load()` at decision points; the management plane calls the
/// `set_*` methods, each of which validates then swaps in a fresh snapshot.
#[derive(Debug)]
pub struct SharedConfig {
    inner: arc_swap::ArcSwap<RuntimeConfig>,
    // Individual atomics mirror the snapshot for lock-free single-field
    // reads from hot paths that only need one scalar (e.g. the byte pump
    // checking `buffer_size` without reconstructing the whole struct).
    buffer_size_hint: AtomicU32,
    timeout_ms_hint: AtomicU64,
    dissectors_hint: AtomicBool,
}

impl SharedConfig {
    pub fn new(initial: RuntimeConfig) -> Self {
        Self {
            buffer_size_hint: AtomicU32::new(initial.buffer_size),
            timeout_ms_hint: AtomicU64::new(initial.timeout_ms),
            dissectors_hint: AtomicBool::new(initial.dissectors_enabled),
            inner: arc_swap::ArcSwap::from_pointee(initial),
        }
    }

    pub fn load(&self) -> Arc<RuntimeConfig> {
        self.inner.load_full()
    }

    pub fn buffer_size_hint(&self) -> u32 {
        self.buffer_size_hint.load(Ordering::Relaxed)
    }

    pub fn dissectors_enabled_hint(&self) -> bool {
        self.dissectors_hint.load(Ordering::Relaxed)
    }

    pub fn timeout_ms_hint(&self) -> u64 {
        self.timeout_ms_hint.load(Ordering::Relaxed)
    }

    fn swap(&self, mutate: impl FnOnce(&mut RuntimeConfig)) {
        let mut next = *self.load();
        mutate(&mut next);
        self.buffer_size_hint.store(next.buffer_size, Ordering::Relaxed);
        self.timeout_ms_hint.store(next.timeout_ms, Ordering::Relaxed);
        self.dissectors_hint.store(next.dissectors_enabled, Ordering::Relaxed);
        self.inner.store(Arc::new(next));
    }

    pub fn set_timeout_ms(&self, timeout_ms: u64) -> Result<(), Error> {
        if timeout_ms == 0 {
            return Err(Error::ConfigInvalid("timeout_ms must be > 0".into()));
        }
        self.swap(|c| c.timeout_ms = timeout_ms);
        Ok(())
    }

    pub fn set_buffer_size(&self, buffer_size: u32) -> Result<(), Error> {
        if !(MIN_BUFFER_SIZE..=MAX_BUFFER_CAPACITY).contains(&buffer_size) {
            return Err(Error::ConfigInvalid(format!(
                "buffer_size must be between {MIN_BUFFER_SIZE} and {MAX_BUFFER_CAPACITY}"
            )));
        }
        self.swap(|c| c.buffer_size = buffer_size);
        Ok(())
    }

    pub fn set_max_clients(&self, max_clients: u32) -> Result<(), Error> {
        if max_clients == 0 {
            return Err(Error::ConfigInvalid("max_clients must be > 0".into()));
        }
        self.swap(|c| c.max_clients = max_clients);
        Ok(())
    }

    pub fn set_dissectors_enabled(&self, enabled: bool) {
        self.swap(|c| c.dissectors_enabled = enabled);
    }
}

/// The optional startup TOML file (SPEC_FULL.md §3 H). Never rewritten by
/// the running process; only consulted once, before the CLI flags are
/// layered on top.
#[derive(Debug, Default, Deserialize)]
pub struct StartupFile {
    pub socks_port: Option<u16>,
    pub mgmt_port: Option<u16>,
    pub buffer_size: Option<u32>,
    pub max_clients: Option<u32>,
    pub timeout_ms: Option<u64>,
    pub dissectors_enabled: Option<bool>,
    pub idle_timeout_secs: Option<u64>,
    #[serde(default)]
    pub users: Vec<StartupUser>,
}

#[derive(Debug, Deserialize)]
pub struct StartupUser {
    pub username: String,
    pub password: String,
}

impl StartupFile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path)?;
        toml::from_str(&contents)
            .map_err(|err| Error::ConfigInvalid(format!("malformed config file: {err}")))
    }
}
