//! Best-effort view of who is on a channel topic.
//!
//! Any message from a participant refreshes their liveness; participants
//! silent for longer than the timeout are evicted.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use tokio::time::Instant;

use voxlink_protocol::UserId;

pub struct PresenceTracker {
    last_seen: HashMap<UserId, Instant>,
    timeout: Duration,
}

impl PresenceTracker {
    /// `timeout` of zero disables eviction
    pub fn new(timeout: Duration) -> Self {
        Self {
            last_seen: HashMap::new(),
            timeout,
        }
    }

    /// Record a join. Returns true if the user was not present before.
    pub fn join(&mut self, user: &UserId, now: Instant) -> bool {
        self.last_seen.insert(user.clone(), now).is_none()
    }

    /// Refresh liveness of a present user. Unknown users are ignored.
    pub fn touch(&mut self, user: &UserId, now: Instant) {
        if let Some(seen) = self.last_seen.get_mut(user) {
            *seen = now;
        }
    }

    /// Record a departure. Returns true if the user was present.
    pub fn leave(&mut self, user: &UserId) -> bool {
        self.last_seen.remove(user).is_some()
    }

    /// Remove and return everyone silent for longer than the timeout
    pub fn evict_stale(&mut self, now: Instant) -> Vec<UserId> {
        if self.timeout.is_zero() {
            return Vec::new();
        }
        let timeout = self.timeout;
        let stale: Vec<UserId> = self
            .last_seen
            .iter()
            .filter(|(_, seen)| now.duration_since(**seen) > timeout)
            .map(|(user, _)| user.clone())
            .collect();
        for user in &stale {
            self.last_seen.remove(user);
        }
        stale
    }

    pub fn contains(&self, user: &UserId) -> bool {
        self.last_seen.contains_key(user)
    }

    pub fn users(&self) -> BTreeSet<UserId> {
        self.last_seen.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.last_seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_seen.is_empty()
    }

    pub fn clear(&mut self) {
        self.last_seen.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_is_deduplicated() {
        let mut presence = PresenceTracker::new(Duration::from_secs(30));
        let now = Instant::now();
        assert!(presence.join(&"a".into(), now));
        assert!(!presence.join(&"a".into(), now));
        assert_eq!(presence.len(), 1);

        assert!(presence.leave(&"a".into()));
        assert!(!presence.leave(&"a".into()));
        assert!(presence.is_empty());
    }

    #[test]
    fn test_eviction() {
        let mut presence = PresenceTracker::new(Duration::from_secs(30));
        let start = Instant::now();
        presence.join(&"quiet".into(), start);
        presence.join(&"chatty".into(), start);
        presence.touch(&"chatty".into(), start + Duration::from_secs(20));

        let evicted = presence.evict_stale(start + Duration::from_secs(31));
        assert_eq!(evicted, vec![UserId::from("quiet")]);
        assert!(presence.contains(&"chatty".into()));
    }

    #[test]
    fn test_zero_timeout_never_evicts() {
        let mut presence = PresenceTracker::new(Duration::ZERO);
        let start = Instant::now();
        presence.join(&"a".into(), start);
        assert!(presence.evict_stale(start + Duration::from_secs(3600)).is_empty());
    }
}
