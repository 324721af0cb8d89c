// Copyright (c) 2020-present, UMD Database Group.
//
// This program is free software: you can use, redistribute, and/or modify
// it under the terms of the GNU Affero General Public License, version 3
// or later ("AGPL"), as published by the Free Software Foundation.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <http://www.gnu.org/licenses/>.

//! The Cache Index (C9): a per-session map from task fingerprint to the
//! wall-clock time of its last successful execution.
//!
//! Keyed by task fingerprint rather than stage id, since identical Scan
//! tasks produced by unrelated queries share a fingerprint and can share a
//! result. An entry is only ever a hint: the Controller must still confirm
//! the backing object exists in the BlobStore before trusting a hit (a
//! missing object is `CacheInconsistency`, recovered by dropping the entry
//! and re-dispatching).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// In-memory, process-lifetime cache of fingerprint -> last-success time.
#[derive(Default)]
pub struct CacheIndex {
    entries: Mutex<HashMap<String, Instant>>,
}

impl CacheIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, fingerprint: &str, at: Instant) {
        self.entries.lock().unwrap().insert(fingerprint.to_owned(), at);
    }

    pub fn get(&self, fingerprint: &str) -> Option<Instant> {
        self.entries.lock().unwrap().get(fingerprint).copied()
    }

    /// Whether `fingerprint` has an entry younger than `ttl`, as of `now`.
    pub fn is_fresh(&self, fingerprint: &str, ttl: Duration, now: Instant) -> bool {
        match self.get(fingerprint) {
            Some(recorded) => now.saturating_duration_since(recorded) < ttl,
            None => false,
        }
    }

    pub fn invalidate(&self, fingerprint: &str) {
        self.entries.lock().unwrap().remove(fingerprint);
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_entry_within_ttl() {
        let cache = CacheIndex::new();
        let t0 = Instant::now();
        cache.put("fp1", t0);
        assert!(cache.is_fresh("fp1", Duration::from_secs(60), t0 + Duration::from_secs(10)));
    }

    #[test]
    fn stale_entry_past_ttl_is_not_fresh() {
        let cache = CacheIndex::new();
        let t0 = Instant::now();
        cache.put("fp1", t0);
        assert!(!cache.is_fresh("fp1", Duration::from_secs(5), t0 + Duration::from_secs(10)));
    }

    #[test]
    fn missing_entry_is_never_fresh() {
        let cache = CacheIndex::new();
        assert!(!cache.is_fresh("nope", Duration::from_secs(600), Instant::now()));
    }

    #[test]
    fn invalidate_removes_the_entry() {
        let cache = CacheIndex::new();
        let t0 = Instant::now();
        cache.put("fp1", t0);
        cache.invalidate("fp1");
        assert!(cache.get("fp1").is_none());
    }

    #[test]
    fn clear_removes_every_entry() {
        let cache = CacheIndex::new();
        let t0 = Instant::now();
        cache.put("fp1", t0);
        cache.put("fp2", t0);
        cache.clear();
        assert!(cache.get("fp1").is_none());
        assert!(cache.get("fp2").is_none());
    }
}
