use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

/// Best-effort memory of when each (printing, source) pair was last
/// refreshed in this process. The store's day key is the real dedupe.
#[derive(Debug)]
pub struct LastUpdatedCache {
    min_interval: Duration,
    seen: Mutex<HashMap<(String, i16), DateTime<Utc>>>,
}

impl Default for LastUpdatedCache {
    fn default() -> Self {
        Self::new(Duration::hours(1))
    }
}

impl LastUpdatedCache {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            seen: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_fresh(&self, printing_id: &str, source_id: i16, now: DateTime<Utc>) -> bool {
        let seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        seen.get(&(printing_id.to_string(), source_id))
            .is_some_and(|at| now - *at < self.min_interval)
    }

    pub fn mark(&self, printing_id: &str, source_id: i16, at: DateTime<Utc>) {
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        seen.insert((printing_id.to_string(), source_id), at);
    }

    pub fn len(&self) -> usize {
        self.seen.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_within_interval_only() {
        let cache = LastUpdatedCache::default();
        let t0 = Utc::now();
        assert!(!cache.is_fresh("p1", 1, t0));
        cache.mark("p1", 1, t0);
        assert!(cache.is_fresh("p1", 1, t0 + Duration::minutes(59)));
        assert!(!cache.is_fresh("p1", 1, t0 + Duration::minutes(61)));
        assert!(!cache.is_fresh("p1", 2, t0));
    }
}
