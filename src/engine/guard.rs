//! Removeparam redirect-loop guard.
//!
//! Sanitizing a URL answers the request with a redirect; the browser then
//! re-requests the original URL from the same tab and frame when something
//! re-navigates. Without a guard that ping-pongs forever. Each sanitized
//! `(tab, frame, url)` is armed for a TTL; a second match inside the window
//! reports suppression and the pipeline answers ALLOW.
//!
//! Expired entries are collected lazily: a prune runs when the map outgrows
//! its soft cap on the way in.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Soft cap before lazy pruning kicks in.
const PRUNE_THRESHOLD: usize = 1024;

pub struct RemoveparamGuard {
    armed: HashMap<(i32, i32, u64), Instant, ahash::RandomState>,
    ttl: Duration,
}

impl RemoveparamGuard {
    pub fn new(ttl: Duration) -> Self {
        Self {
            armed: HashMap::default(),
            ttl,
        }
    }

    /// Returns true when this key was sanitized within the TTL (suppress);
    /// otherwise arms the key and returns false.
    pub fn check_and_arm(&mut self, tab_id: i32, frame_id: i32, url_hash: u64) -> bool {
        self.check_and_arm_at(tab_id, frame_id, url_hash, Instant::now())
    }

    fn check_and_arm_at(&mut self, tab_id: i32, frame_id: i32, url_hash: u64, now: Instant) -> bool {
        let key = (tab_id, frame_id, url_hash);
        if let Some(&armed_at) = self.armed.get(&key) {
            if now.duration_since(armed_at) < self.ttl {
                return true;
            }
        }

        if self.armed.len() >= PRUNE_THRESHOLD {
            let ttl = self.ttl;
            self.armed.retain(|_, &mut at| now.duration_since(at) < ttl);
        }

        self.armed.insert(key, now);
        false
    }

    pub fn clear(&mut self) {
        self.armed.clear();
    }

    pub fn len(&self) -> usize {
        self.armed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_hit_within_ttl_suppresses() {
        let mut guard = RemoveparamGuard::new(Duration::from_millis(1500));
        let t0 = Instant::now();
        assert!(!guard.check_and_arm_at(7, 0, 42, t0));
        assert!(guard.check_and_arm_at(7, 0, 42, t0 + Duration::from_millis(100)));
    }

    #[test]
    fn expired_entry_rearms() {
        let mut guard = RemoveparamGuard::new(Duration::from_millis(100));
        let t0 = Instant::now();
        assert!(!guard.check_and_arm_at(7, 0, 42, t0));
        assert!(!guard.check_and_arm_at(7, 0, 42, t0 + Duration::from_millis(200)));
    }

    #[test]
    fn keys_are_per_tab_frame_url() {
        let mut guard = RemoveparamGuard::new(Duration::from_millis(1500));
        let t0 = Instant::now();
        assert!(!guard.check_and_arm_at(7, 0, 42, t0));
        assert!(!guard.check_and_arm_at(8, 0, 42, t0));
        assert!(!guard.check_and_arm_at(7, 1, 42, t0));
        assert!(!guard.check_and_arm_at(7, 0, 43, t0));
    }

    #[test]
    fn prune_keeps_fresh_entries() {
        let mut guard = RemoveparamGuard::new(Duration::from_millis(100));
        let t0 = Instant::now();
        for i in 0..PRUNE_THRESHOLD as u64 {
            guard.check_and_arm_at(0, 0, i, t0);
        }
        assert_eq!(guard.len(), PRUNE_THRESHOLD);
        // All stale by now; the next insert prunes them.
        let later = t0 + Duration::from_millis(500);
        assert!(!guard.check_and_arm_at(0, 0, 9999, later));
        assert_eq!(guard.len(), 1);
    }
}
