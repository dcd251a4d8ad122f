//! Session cache for multi-turn chat continuity.
//!
//! The outer service keeps live chat sessions between webhook-style
//! requests; this cache holds them keyed by session id with TTL-based
//! eviction. Eviction is driven by an explicit clock argument rather
//! than an ambient timer, so lifecycle is testable without wall-clock
//! waits; the service calls [`SessionCache::evict_expired`] from its
//! own scheduler tick.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

struct CachedEntry<S> {
    session: S,
    last_used: Instant,
}

pub struct SessionCache<S> {
    entries: HashMap<String, CachedEntry<S>>,
    ttl: Duration,
}

impl<S> SessionCache<S> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert or replace a session; returns the replaced session so the
    /// caller can close it.
    pub fn insert(&mut self, session_id: impl Into<String>, session: S, now: Instant) -> Option<S> {
        self.entries
            .insert(
                session_id.into(),
                CachedEntry {
                    session,
                    last_used: now,
                },
            )
            .map(|entry| entry.session)
    }

    /// Fetch a session and refresh its TTL.
    pub fn touch(&mut self, session_id: &str, now: Instant) -> Option<&mut S> {
        let entry = self.entries.get_mut(session_id)?;
        entry.last_used = now;
        Some(&mut entry.session)
    }

    /// Remove a session explicitly (e.g. the conversation ended).
    pub fn remove(&mut self, session_id: &str) -> Option<S> {
        self.entries.remove(session_id).map(|entry| entry.session)
    }

    /// Drop every session idle longer than the TTL, returning the evicted
    /// sessions so the caller can tear them down.
    pub fn evict_expired(&mut self, now: Instant) -> Vec<(String, S)> {
        let ttl = self.ttl;
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.last_used) >= ttl)
            .map(|(id, _)| id.clone())
            .collect();

        let evicted: Vec<(String, S)> = expired
            .into_iter()
            .filter_map(|id| self.entries.remove(&id).map(|entry| (id, entry.session)))
            .collect();

        if !evicted.is_empty() {
            debug!("Evicted {} idle sessions", evicted.len());
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_touch() {
        let now = Instant::now();
        let mut cache: SessionCache<&str> = SessionCache::new(Duration::from_secs(60));

        cache.insert("s1", "session-one", now);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.touch("s1", now), Some(&mut "session-one"));
        assert_eq!(cache.touch("missing", now), None);
    }

    #[test]
    fn test_eviction_respects_ttl_without_waiting() {
        let start = Instant::now();
        let ttl = Duration::from_secs(60);
        let mut cache: SessionCache<u32> = SessionCache::new(ttl);

        cache.insert("old", 1, start);
        cache.insert("fresh", 2, start + Duration::from_secs(59));

        let evicted = cache.evict_expired(start + ttl);
        assert_eq!(evicted, vec![("old".to_string(), 1)]);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_touch_refreshes_ttl() {
        let start = Instant::now();
        let ttl = Duration::from_secs(60);
        let mut cache: SessionCache<u32> = SessionCache::new(ttl);

        cache.insert("s", 7, start);
        cache.touch("s", start + Duration::from_secs(50));

        assert!(cache.evict_expired(start + ttl).is_empty());
        let evicted = cache.evict_expired(start + Duration::from_secs(110));
        assert_eq!(evicted.len(), 1);
    }

    #[test]
    fn test_insert_replacement_returns_old_session() {
        let now = Instant::now();
        let mut cache: SessionCache<u32> = SessionCache::new(Duration::from_secs(10));

        assert_eq!(cache.insert("s", 1, now), None);
        assert_eq!(cache.insert("s", 2, now), Some(1));
        assert_eq!(cache.remove("s"), Some(2));
        assert!(cache.is_empty());
    }
}
