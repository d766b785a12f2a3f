//! # Liveness Tracker
//!
//! Peer node id → last observed heartbeat time.
//!
//! Written by the inbound dispatcher (heartbeats) and by the maintenance sweep
//! (seeding, eviction), possibly at the same time, so the table is a
//! `DashMap`. Keys are `NodeId`, which hashes case-insensitively.
//!
//! ## Ordering
//!
//! Heartbeats may arrive out of order. [`LivenessTracker::touch`] only moves a
//! record forward in time.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use sync_types::NodeId;

/// Concurrent table of peer liveness records.
#[derive(Debug, Default)]
pub struct LivenessTracker {
    peers: DashMap<NodeId, DateTime<Utc>>,
}

impl LivenessTracker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            peers: DashMap::new(),
        }
    }

    /// Record a heartbeat from `peer` sent at `at`.
    ///
    /// Returns `true` if the stored value changed. An `at` older than the
    /// stored value is ignored.
    pub fn touch(&self, peer: &NodeId, at: DateTime<Utc>) -> bool {
        match self.peers.entry(peer.clone()) {
            Entry::Occupied(mut entry) => {
                if at > *entry.get() {
                    entry.insert(at);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(at);
                true
            }
        }
    }

    /// Create a record at `now` for a peer that has none yet.
    ///
    /// Returns `true` if a record was created. Existing records are untouched,
    /// so a peer discovered through the broker gets a full inactivity window
    /// before it can be considered stale.
    pub fn seed(&self, peer: &NodeId, now: DateTime<Utc>) -> bool {
        match self.peers.entry(peer.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(now);
                true
            }
        }
    }

    /// True iff a record exists and `now - last_seen > timeout`.
    #[must_use]
    pub fn is_stale(&self, peer: &NodeId, now: DateTime<Utc>, timeout: Duration) -> bool {
        let Some(last_seen) = self.last_seen(peer) else {
            return false;
        };
        match now.signed_duration_since(last_seen).to_std() {
            Ok(elapsed) => elapsed > timeout,
            // last_seen is in the future relative to `now`
            Err(_) => false,
        }
    }

    /// Drop the record for `peer`. Returns `true` if one existed.
    pub fn forget(&self, peer: &NodeId) -> bool {
        self.peers.remove(peer).is_some()
    }

    #[must_use]
    pub fn last_seen(&self, peer: &NodeId) -> Option<DateTime<Utc>> {
        self.peers.get(peer).map(|entry| *entry.value())
    }

    #[must_use]
    pub fn contains(&self, peer: &NodeId) -> bool {
        self.peers.contains_key(peer)
    }

    /// Snapshot of tracked peers.
    #[must_use]
    pub fn peers(&self) -> Vec<NodeId> {
        self.peers.iter().map(|entry| entry.key().clone()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn clear(&self) {
        self.peers.clear();
    }
}
