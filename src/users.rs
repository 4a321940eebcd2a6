/// User records and the user-database persistence (components A/B).
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::warn;

use crate::stats::UserStats;

pub const MAX_USERNAME_LEN: usize = 64;
pub const MAX_PASSWORD_LEN: usize = 64;
pub const MAX_USERS: usize = 10;

/// A read-only traffic snapshot of one user, for the management plane.
#[derive(Debug, Clone)]
pub struct UserSnapshot {
    pub username: String,
    pub active: bool,
    pub total_connections: u64,
    pub current_connections: u64,
    pub total_bytes_transferred: u64,
}

#[derive(Debug)]
pub struct User {
    pub username: String,
    pub password: String,
    pub active: bool,
    pub stats: Arc<UserStats>,
}

impl User {
    fn new(username: String, password: String) -> Self {
        Self {
            username,
            password,
            active: true,
            stats: Arc::new(UserStats::new()),
        }
    }
}

/// In-memory user table guarded by a single mutex, backed by a line-oriented
/// text file (`username:password\n` per active user).
pub struct UserTable {
    path: PathBuf,
    users: parking_lot::Mutex<HashMap<String, User>>,
}

impl UserTable {
    /// Loads the table from `path` (non-fatal if the file can't be opened —
    /// the table just starts empty), truncating to `MAX_USERS` and keeping
    /// the first entry on duplicate usernames.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let mut users = HashMap::new();

        match fs::read_to_string(&path) {
            Ok(contents) => {
                for line in contents.lines() {
                    if users.len() >= MAX_USERS {
                        break;
                    }
                    if let Some((user, pass)) = line.split_once(':') {
                        users
                            .entry(user.to_string())
                            .or_insert_with(|| User::new(user.to_string(), pass.to_string()));
                    }
                }
            }
            Err(err) => {
                warn!("could not open user database {}: {err}", path.display());
            }
        }

        Self {
            path,
            users: parking_lot::Mutex::new(users),
        }
    }

    /// Re-reads the file from disk, merging newly-found active users into
    /// the in-memory table (first-wins on conflicting usernames already
    /// present). Used by the management plane's RELOAD_CONFIG.
    pub fn reload(&self) {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) => {
                warn!("could not reload user database {}: {err}", self.path.display());
                return;
            }
        };

        let mut users = self.users.lock();
        for line in contents.lines() {
            if users.len() >= MAX_USERS {
                break;
            }
            if let Some((user, pass)) = line.split_once(':') {
                users
                    .entry(user.to_string())
                    .or_insert_with(|| User::new(user.to_string(), pass.to_string()));
            }
        }
    }

    /// Preloads a user (from CLI flags or the startup config file) if
    /// there's room and the username doesn't already exist.
    pub fn preload(&self, username: &str, password: &str) {
        let mut users = self.users.lock();
        if users.len() >= MAX_USERS || users.contains_key(username) {
            return;
        }
        users.insert(
            username.to_string(),
            User::new(username.to_string(), password.to_string()),
        );
    }

    pub fn add(&self, username: &str, password: &str) -> Result<(), String> {
        if username.is_empty() || username.len() >= MAX_USERNAME_LEN {
            return Err(format!("username must be 1-{} bytes", MAX_USERNAME_LEN - 1));
        }
        if password.len() >= MAX_PASSWORD_LEN {
            return Err(format!("password must be under {MAX_PASSWORD_LEN} bytes"));
        }

        {
            let mut users = self.users.lock();
            if users.values().any(|u| u.active && u.username == username) {
                return Err(format!("user '{username}' already exists"));
            }
            if users.len() >= MAX_USERS {
                return Err(format!("user capacity ({MAX_USERS}) reached"));
            }
            users.insert(username.to_string(), User::new(username.to_string(), password.to_string()));
        }

        self.save();
        Ok(())
    }

    pub fn delete(&self, username: &str) -> Result<(), String> {
        {
            let mut users = self.users.lock();
            if users.remove(username).is_none() {
                return Err(format!("user '{username}' not found"));
            }
        }

        self.save();
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.users.lock().values().filter(|u| u.active).count()
    }

    /// Validates `username`/`password` against the in-memory table. The
    /// disk file and any CLI/config preload users are folded into this same
    /// table at load time, so a single lookup here covers all three sources
    /// named in SPEC_FULL.md §4.5.
    pub fn validate(&self, username: &str, password: &str) -> Option<Arc<UserStats>> {
        let users = self.users.lock();
        users
            .get(username)
            .filter(|u| u.active && u.password == password)
            .map(|u| u.stats.clone())
    }

    /// Looks up an authenticated user's stats handle by username alone
    /// (password was already checked once, at AUTH time).
    pub fn stats_for(&self, username: &str) -> Option<Arc<UserStats>> {
        self.users.lock().get(username).map(|u| u.stats.clone())
    }

    pub fn is_populated(&self) -> bool {
        !self.users.lock().is_empty()
    }

    pub fn list_active(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .users
            .lock()
            .values()
            .filter(|u| u.active)
            .map(|u| u.username.clone())
            .collect();
        names.sort();
        names
    }

    /// Snapshot of every user plus their live traffic counters, for the
    /// management plane's LIST_USERS response.
    pub fn list_snapshots(&self) -> Vec<UserSnapshot> {
        use std::sync::atomic::Ordering;

        let mut snapshots: Vec<UserSnapshot> = self
            .users
            .lock()
            .values()
            .map(|u| UserSnapshot {
                username: u.username.clone(),
                active: u.active,
                total_connections: u.stats.total_connections.load(Ordering::Relaxed),
                current_connections: u.stats.current_connections.load(Ordering::Relaxed),
                total_bytes_transferred: u.stats.total_bytes_transferred.load(Ordering::Relaxed),
            })
            .collect();
        snapshots.sort_by(|a, b| a.username.cmp(&b.username));
        snapshots
    }

    /// Rewrites the whole file from the current table. Acceptable because
    /// the user count is tiny (`MAX_USERS` = 10).
    fn save(&self) {
        let users = self.users.lock();
        let mut contents = String::new();
        let mut names: Vec<&User> = users.values().filter(|u| u.active).collect();
        names.sort_by(|a, b| a.username.cmp(&b.username));
        for user in names {
            contents.push_str(&user.username);
            contents.push(':');
            contents.push_str(&user.password);
            contents.push('\n');
        }
        drop(users);

        if let Err(err) = write_file(&self.path, &contents) {
            warn!("could not write user database {}: {err}", self.path.display());
        }
    }
}

fn write_file(path: &Path, contents: &str) -> std::io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(contents.as_bytes())
}
