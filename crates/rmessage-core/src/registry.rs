//! Presence and group membership registry.
//!
//! The registry is the only structure shared across connections. It maps each
//! online key to its session and each group to its member keys, using
//! sharded maps so that updates for one key never serialize reads of
//! unrelated keys or groups.

use crate::session::{ConnectionSession, SessionId};
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

/// A client key or group id.
pub type Key = Bytes;

/// Shared map of key → session and group → members.
///
/// Lock discipline: a `sessions` entry may be held while touching
/// `memberships` and `groups`, never the reverse. No other operation holds
/// more than one entry at a time.
#[derive(Default)]
pub struct SessionRegistry {
    /// Online keys.
    sessions: DashMap<Key, Arc<ConnectionSession>>,
    /// Group id → member keys.
    groups: DashMap<Key, DashSet<Key>>,
    /// Key → groups it belongs to.
    memberships: DashMap<Key, DashSet<Key>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        info!("Creating session registry");
        Self::default()
    }

    /// Bind `key` to `session`.
    ///
    /// If the key was bound to another session, that session is disposed once
    /// the new binding is in place and is returned.
    pub fn register(
        &self,
        key: Key,
        session: Arc<ConnectionSession>,
    ) -> Option<Arc<ConnectionSession>> {
        let displaced = self
            .sessions
            .insert(key.clone(), session.clone())
            .filter(|previous| previous.id() != session.id());

        if let Some(previous) = &displaced {
            previous.dispose();
            info!(
                key = ?key,
                previous = previous.id(),
                session = session.id(),
                "Key re-registered, previous session disposed"
            );
        } else {
            debug!(key = ?key, session = session.id(), "Registered");
        }

        displaced
    }

    /// Remove `session`'s key binding and every group membership of that key.
    ///
    /// Nothing is removed when the key has meanwhile been bound to a newer
    /// session. Returns the groups the key was removed from.
    pub fn unregister(&self, session: &ConnectionSession) -> HashSet<Key> {
        let Some(key) = session.key() else {
            return HashSet::new();
        };

        // The binding stays locked until the memberships are gone, so a
        // session registering the same key only joins groups afterwards.
        let binding = match self.sessions.entry(key.clone()) {
            Entry::Occupied(binding) if binding.get().id() == session.id() => binding,
            _ => return HashSet::new(),
        };

        let groups: HashSet<Key> = self
            .memberships
            .remove(key)
            .map(|(_, groups)| groups.into_iter().collect())
            .unwrap_or_default();

        for group in &groups {
            self.remove_member(group, key);
        }
        binding.remove();

        debug!(key = ?key, session = session.id(), groups = groups.len(), "Unregistered");
        groups
    }

    /// Add `key` to `group`. Returns `true` if the membership is new.
    pub fn join(&self, key: &Key, group: &Key) -> bool {
        let added = self
            .groups
            .entry(group.clone())
            .or_default()
            .insert(key.clone());
        self.memberships
            .entry(key.clone())
            .or_default()
            .insert(group.clone());

        if added {
            debug!(key = ?key, group = ?group, "Joined group");
        }
        added
    }

    /// Remove `key` from `group`. Returns `true` if it was a member.
    pub fn leave(&self, key: &Key, group: &Key) -> bool {
        let removed = self.remove_member(group, key);
        if let Some(groups) = self.memberships.get(key) {
            groups.remove(group);
        }
        self.memberships.remove_if(key, |_, groups| groups.is_empty());

        if removed {
            debug!(key = ?key, group = ?group, "Left group");
        }
        removed
    }

    fn remove_member(&self, group: &Key, key: &Key) -> bool {
        let removed = self
            .groups
            .get(group)
            .map(|members| members.remove(key).is_some())
            .unwrap_or(false);

        // Empty groups are dropped.
        self.groups.remove_if(group, |_, members| members.is_empty());
        removed
    }

    /// Look up the session bound to `key`.
    #[must_use]
    pub fn resolve(&self, key: &[u8]) -> Option<Arc<ConnectionSession>> {
        self.sessions.get(key).map(|entry| entry.value().clone())
    }

    /// Whether `key` is bound to a live session.
    #[must_use]
    pub fn is_online(&self, key: &[u8]) -> bool {
        self.sessions
            .get(key)
            .map(|entry| !entry.is_closed())
            .unwrap_or(false)
    }

    /// Snapshot of the member keys of `group`.
    #[must_use]
    pub fn members(&self, group: &[u8]) -> HashSet<Key> {
        self.groups
            .get(group)
            .map(|members| members.iter().map(|k| k.key().clone()).collect())
            .unwrap_or_default()
    }

    /// Snapshot of the groups `key` belongs to.
    #[must_use]
    pub fn groups_of(&self, key: &[u8]) -> HashSet<Key> {
        self.memberships
            .get(key)
            .map(|groups| groups.iter().map(|g| g.key().clone()).collect())
            .unwrap_or_default()
    }

    /// Id of the session bound to `key`.
    #[must_use]
    pub fn session_id(&self, key: &[u8]) -> Option<SessionId> {
        self.sessions.get(key).map(|entry| entry.id())
    }

    /// Registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            online_keys: self.sessions.len(),
            group_count: self.groups.len(),
            total_memberships: self.groups.iter().map(|g| g.len()).sum(),
        }
    }
}

/// Registry statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    /// Number of keys bound to a session.
    pub online_keys: usize,
    /// Number of non-empty groups.
    pub group_count: usize,
    /// Total group memberships.
    pub total_memberships: usize,
}
