//! Downstream token cache keyed by parent session token.

use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;

use super::{DownstreamKind, DownstreamToken, SecondarySystem};

/// Tokens this close to expiry are treated as expired.
const EXPIRY_SKEW: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    system: SecondarySystem,
    kind: DownstreamKind,
    parent: String,
}

#[derive(Default)]
pub struct TokenCache {
    entries: DashMap<CacheKey, DownstreamToken>,
    /// Parent named by the last `retain_parent`, unset before the first call.
    current: RwLock<Option<Option<String>>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh token derived from `parent`, or `None`.
    ///
    /// Expired entries are removed on lookup.
    pub fn get(
        &self,
        system: SecondarySystem,
        kind: DownstreamKind,
        parent: &str,
    ) -> Option<DownstreamToken> {
        let key = CacheKey {
            system,
            kind,
            parent: parent.to_string(),
        };
        let entry = self.entries.get(&key)?;

        if is_expired(&entry) {
            drop(entry); // Release the shard lock before removing
            self.entries.remove(&key);
            return None;
        }

        Some(entry.clone())
    }

    /// Store `token` unless its parent has already been superseded.
    ///
    /// Returns whether the token was kept.
    pub fn insert(&self, token: DownstreamToken) -> bool {
        let key = CacheKey {
            system: token.system,
            kind: token.kind,
            parent: token.parent.clone(),
        };
        self.entries.insert(key.clone(), token);
        // checked after inserting so a concurrent purge cannot be missed
        if self.is_superseded(&key.parent) {
            self.entries.remove(&key);
            return false;
        }
        true
    }

    fn is_superseded(&self, parent: &str) -> bool {
        match &*self.current.read() {
            Some(current) => current.as_deref() != Some(parent),
            None => false,
        }
    }

    /// Drop every token not derived from `parent`; with `None`, drop all.
    ///
    /// Later inserts derived from any other parent are refused.
    pub fn retain_parent(&self, parent: Option<&str>) -> usize {
        *self.current.write() = Some(parent.map(str::to_string));
        let before = self.entries.len();
        self.entries
            .retain(|key, _| parent.is_some_and(|p| key.parent == p));
        before.saturating_sub(self.entries.len())
    }

    pub fn remove(&self, system: SecondarySystem, kind: DownstreamKind, parent: &str) {
        self.entries.remove(&CacheKey {
            system,
            kind,
            parent: parent.to_string(),
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn is_expired(token: &DownstreamToken) -> bool {
    token.expires_at.is_some_and(|at| {
        let skew = chrono::Duration::from_std(EXPIRY_SKEW).unwrap_or_default();
        at - skew <= Utc::now()
    })
}
