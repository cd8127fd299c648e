// =============================================================================
// Verdict cache — short-lived per-source response cache
// =============================================================================
//
// Keyed by `(symbol, bucket_timestamp)` where the bucket is the fetch time
// floored to the source's TTL. Two fetches inside the same bucket return the
// cached verdict without spending a rate-limit token or an upstream call.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::signal::SourceVerdict;
use crate::types::Symbol;

pub struct VerdictCache {
    ttl_ms: i64,
    entries: Mutex<HashMap<(Symbol, i64), SourceVerdict>>,
}

impl VerdictCache {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            ttl_ms: (ttl_secs.max(1) * 1000) as i64,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn bucket(&self, now_ms: i64) -> i64 {
        now_ms - now_ms.rem_euclid(self.ttl_ms)
    }

    pub fn get(&self, symbol: &Symbol, now_ms: i64) -> Option<SourceVerdict> {
        let bucket = self.bucket(now_ms);
        self.entries.lock().get(&(symbol.clone(), bucket)).cloned()
    }

    pub fn put(&self, symbol: &Symbol, now_ms: i64, verdict: SourceVerdict) {
        let bucket = self.bucket(now_ms);
        let mut entries = self.entries.lock();
        entries.insert((symbol.clone(), bucket), verdict);

        // Drop stale buckets so the map stays bounded.
        let min_bucket = bucket - 2 * self.ttl_ms;
        entries.retain(|(_, b), _| *b >= min_bucket);
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Verdict;

    fn verdict(confidence: f64) -> SourceVerdict {
        SourceVerdict::new("alpha", Verdict::Long, confidence, 0)
    }

    #[test]
    fn hit_within_same_bucket() {
        let cache = VerdictCache::new(10);
        let symbol = Symbol::from("AAPL");
        cache.put(&symbol, 1_000, verdict(80.0));
        let hit = cache.get(&symbol, 9_999).unwrap();
        assert!((hit.confidence - 80.0).abs() < f64::EPSILON);
    }

    #[test]
    fn miss_across_buckets() {
        let cache = VerdictCache::new(10);
        let symbol = Symbol::from("AAPL");
        cache.put(&symbol, 1_000, verdict(80.0));
        assert!(cache.get(&symbol, 11_000).is_none());
    }

    #[test]
    fn miss_across_symbols() {
        let cache = VerdictCache::new(10);
        cache.put(&Symbol::from("AAPL"), 1_000, verdict(80.0));
        assert!(cache.get(&Symbol::from("MSFT"), 1_000).is_none());
    }

    #[test]
    fn stale_buckets_are_evicted() {
        let cache = VerdictCache::new(10);
        let symbol = Symbol::from("AAPL");
        cache.put(&symbol, 0, verdict(80.0));
        cache.put(&symbol, 100_000, verdict(85.0));
        assert!(cache.get(&symbol, 0).is_none());
        assert!(cache.get(&symbol, 100_000).is_some());
    }
}
