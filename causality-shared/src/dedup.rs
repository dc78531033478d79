use bloomfilter::Bloom;
use metrics::counter;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Sliding-window probabilistic set keyed by idempotency key.
///
/// Two bloom filters, *current* and *previous*, rotate every `window / 2`:
/// any key inserted within the last full window is still represented in at
/// least one filter. Memory is bounded by `capacity` and `fp_rate`; a false
/// positive drops a legitimate event at the configured rate, which ingest
/// tolerates by design (clients treat dedup drops as accepted).
pub struct DedupCache {
    filters: RwLock<Filters>,
    capacity: usize,
    fp_rate: f64,
}

struct Filters {
    current: Bloom<str>,
    previous: Bloom<str>,
}

impl DedupCache {
    pub fn new(capacity: usize, fp_rate: f64) -> Self {
        Self {
            filters: RwLock::new(Filters {
                current: Bloom::new_for_fp_rate(capacity, fp_rate),
                previous: Bloom::new_for_fp_rate(capacity, fp_rate),
            }),
            capacity,
            fp_rate,
        }
    }

    /// Check-and-insert. Empty keys are never deduplicated. A `true` return
    /// means the key was seen within the sliding window and the event must
    /// be silently dropped.
    pub fn is_duplicate(&self, key: &str) -> bool {
        if key.is_empty() {
            return false;
        }

        {
            let filters = self.filters.read().expect("dedup lock poisoned");
            if filters.current.check(key) || filters.previous.check(key) {
                counter!("dedup_duplicates_total").increment(1);
                return true;
            }
        }

        // Double-checked: another task may have inserted between the read
        // release and the write acquire.
        let mut filters = self.filters.write().expect("dedup lock poisoned");
        if filters.current.check(key) || filters.previous.check(key) {
            counter!("dedup_duplicates_total").increment(1);
            return true;
        }
        filters.current.set(key);
        false
    }

    /// `previous ← current`, `current ← fresh`.
    pub fn rotate(&self) {
        let fresh = Bloom::new_for_fp_rate(self.capacity, self.fp_rate);
        let mut filters = self.filters.write().expect("dedup lock poisoned");
        filters.previous = std::mem::replace(&mut filters.current, fresh);
        counter!("dedup_rotations_total").increment(1);
    }

    /// Rotate every `window / 2` until the process exits.
    pub fn spawn_rotation(self: &Arc<Self>, window: Duration) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        let period = window / 2;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // first tick fires immediately
            loop {
                interval.tick().await;
                cache.rotate();
                tracing::debug!("dedup filters rotated");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sighting_is_not_duplicate() {
        let cache = DedupCache::new(1000, 0.01);
        assert!(!cache.is_duplicate("k1"));
        assert!(cache.is_duplicate("k1"));
    }

    #[test]
    fn empty_keys_are_transparent() {
        let cache = DedupCache::new(1000, 0.01);
        assert!(!cache.is_duplicate(""));
        assert!(!cache.is_duplicate(""));
    }

    #[test]
    fn one_rotation_keeps_coverage() {
        let cache = DedupCache::new(1000, 0.01);
        assert!(!cache.is_duplicate("k1"));
        cache.rotate();
        // k1 now lives in the previous filter and is still caught.
        assert!(cache.is_duplicate("k1"));
    }

    #[test]
    fn two_rotations_expire_a_key() {
        let cache = DedupCache::new(1000, 0.01);
        assert!(!cache.is_duplicate("k1"));
        cache.rotate();
        cache.rotate();
        assert!(!cache.is_duplicate("k1"));
    }

    #[test]
    fn distinct_keys_do_not_suppress_each_other() {
        let cache = DedupCache::new(1000, 0.01);
        assert!(!cache.is_duplicate("k1"));
        assert!(!cache.is_duplicate("k2"));
        assert!(!cache.is_duplicate("k3"));
    }
}
