//! State versioning and named exclusive locks.
//!
//! The version counter lets readers detect stale snapshots: every
//! acknowledged mutation bumps it exactly once, tagged for debugging.
//! Named locks make multi-step transitions atomic across suspension
//! points; they carry a hard expiry so a crashed holder cannot wedge the
//! session forever.

use crate::constants::VERSION_LOG_LIMIT;
use parking_lot::Mutex;
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{debug, warn};

/// One retained version-log record.
#[derive(Clone, Debug)]
pub struct VersionEntry {
    /// The version this mutation produced.
    pub version: u64,
    /// Mutation tag, e.g. `skip_complete`.
    pub tag: &'static str,
    /// Small free-form details record.
    pub details: String,
}

#[derive(Debug, Default)]
struct VersionInner {
    version: u64,
    log: VecDeque<VersionEntry>,
}

/// Monotonic per-session state version with a bounded debug log.
#[derive(Debug, Default)]
pub(crate) struct StateVersion {
    inner: Mutex<VersionInner>,
}

impl StateVersion {
    /// Records one committed mutation and returns the new version.
    pub(crate) fn bump(&self, tag: &'static str, details: impl Into<String>) -> u64 {
        let mut inner = self.inner.lock();
        inner.version += 1;
        let version = inner.version;

        let entry = VersionEntry {
            version,
            tag,
            details: details.into(),
        };
        debug!("v{} {}: {}", entry.version, entry.tag, entry.details);

        inner.log.push_back(entry);
        while inner.log.len() > VERSION_LOG_LIMIT {
            inner.log.pop_front();
        }

        version
    }

    pub(crate) fn current(&self) -> u64 {
        self.inner.lock().version
    }

    /// Snapshot of the retained log, oldest first.
    pub(crate) fn log(&self) -> Vec<VersionEntry> {
        self.inner.lock().log.iter().cloned().collect()
    }

    /// The most recent entry, if any mutation has been recorded.
    pub(crate) fn last_entry(&self) -> Option<VersionEntry> {
        self.inner.lock().log.back().cloned()
    }
}

#[derive(Debug)]
struct LockEntry {
    holder: u64,
    expires_at: Instant,
}

/// Registry of named exclusive locks with hard expiry.
#[derive(Debug, Default)]
pub(crate) struct LockSet {
    inner: Mutex<HashMap<String, LockEntry>>,
    next_holder: Mutex<u64>,
}

/// Guard for one held named lock; releases on drop.
///
/// If the lock expired and was re-acquired elsewhere in the meantime,
/// dropping this guard leaves the newer holder untouched.
#[derive(Debug)]
pub(crate) struct LockHandle {
    set: Arc<LockSet>,
    name: String,
    holder: u64,
}

impl LockSet {
    /// Tries to take the named lock. Returns `None` while a live,
    /// unexpired holder exists.
    pub(crate) fn acquire(self: &Arc<Self>, name: &str, expiry: Duration) -> Option<LockHandle> {
        let holder = {
            let mut next = self.next_holder.lock();
            *next += 1;
            *next
        };

        let mut inner = self.inner.lock();
        if let Some(existing) = inner.get(name) {
            if existing.expires_at > Instant::now() {
                return None;
            }
            warn!("Reclaiming expired lock {:?}.", name);
        }

        inner.insert(
            name.to_string(),
            LockEntry {
                holder,
                expires_at: Instant::now() + expiry,
            },
        );

        Some(LockHandle {
            set: Arc::clone(self),
            name: name.to_string(),
            holder,
        })
    }

    /// Whether the named lock currently has an unexpired holder.
    pub(crate) fn has_active_lock(&self, name: &str) -> bool {
        self.inner
            .lock()
            .get(name)
            .map_or(false, |entry| entry.expires_at > Instant::now())
    }

    /// Drops every held lock, for session teardown.
    pub(crate) fn clear(&self) {
        self.inner.lock().clear();
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        let mut inner = self.set.inner.lock();
        if inner.get(&self.name).map_or(false, |e| e.holder == self.holder) {
            inner.remove(&self.name);
        }
    }
}
