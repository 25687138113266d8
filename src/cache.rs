//! Bounded in-memory trace cache with TTL and per-key single-flight (C2).

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::EngineError;
use crate::model::Trace;

struct CacheEntry {
    trace: Arc<Trace>,
    inserted_at: Instant,
    insertion_seq: u64,
}

/// Result of an in-flight or completed single-flight load, shared by every
/// joiner for a given key.
type GateResult = Option<Result<Arc<Trace>, EngineError>>;

struct SingleFlightGate {
    result: Mutex<GateResult>,
    done: Condvar,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub total_entries: usize,
    pub expired_entries: usize,
    pub active_entries: usize,
}

pub struct TraceCache {
    max_entries: usize,
    ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
    gates: Mutex<HashMap<String, Arc<SingleFlightGate>>>,
    next_seq: Mutex<u64>,
}

impl TraceCache {
    pub fn new(max_entries: usize, ttl_ms: u64) -> Self {
        Self {
            max_entries,
            ttl: Duration::from_millis(ttl_ms),
            entries: Mutex::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
            next_seq: Mutex::new(0),
        }
    }

    pub fn put(&self, key: impl Into<String>, trace: Arc<Trace>) {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        let mut seq = self.next_seq.lock().expect("seq lock poisoned");
        let key = key.into();
        entries.insert(
            key,
            CacheEntry {
                trace,
                inserted_at: Instant::now(),
                insertion_seq: *seq,
            },
        );
        *seq += 1;
        if entries.len() > self.max_entries {
            if let Some(oldest_key) = entries
                .iter()
                .min_by_key(|(_, e)| e.insertion_seq)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&oldest_key);
            }
        }
    }

    /// Returns a fresh entry, evicting it first if it has expired.
    pub fn get(&self, key: &str) -> Option<Arc<Trace>> {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        match entries.get(key) {
            Some(entry) if entry.inserted_at.elapsed() <= self.ttl => Some(entry.trace.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn clear(&self) {
        self.entries.lock().expect("cache lock poisoned").clear();
    }

    pub fn size(&self) -> usize {
        self.entries.lock().expect("cache lock poisoned").len()
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.entries.lock().expect("cache lock poisoned");
        let total = entries.len();
        let expired = entries
            .values()
            .filter(|e| e.inserted_at.elapsed() > self.ttl)
            .count();
        CacheStats {
            total_entries: total,
            expired_entries: expired,
            active_entries: total - expired,
        }
    }

    /// Fetches `key`, joining an in-flight load for the same key if one
    /// exists. `loader` is invoked at most once per key per cache miss,
    /// regardless of how many callers race on it.
    pub fn get_or_fetch<F>(&self, key: &str, loader: F) -> Result<Arc<Trace>, EngineError>
    where
        F: FnOnce() -> Result<Trace, EngineError>,
    {
        if let Some(trace) = self.get(key) {
            return Ok(trace);
        }

        let (gate, is_leader) = {
            let mut gates = self.gates.lock().expect("gate lock poisoned");
            if let Some(existing) = gates.get(key) {
                (existing.clone(), false)
            } else {
                let gate = Arc::new(SingleFlightGate {
                    result: Mutex::new(None),
                    done: Condvar::new(),
                });
                gates.insert(key.to_string(), gate.clone());
                (gate, true)
            }
        };

        if is_leader {
            debug!(key, "single-flight: running loader");
            let outcome = loader().map(Arc::new);
            {
                let mut slot = gate.result.lock().expect("gate result lock poisoned");
                if let Ok(trace) = &outcome {
                    self.put(key.to_string(), trace.clone());
                }
                *slot = Some(outcome.clone());
            }
            gate.done.notify_all();
            self.gates.lock().expect("gate lock poisoned").remove(key);
            outcome
        } else {
            debug!(key, "single-flight: joining in-flight loader");
            let mut slot = gate.result.lock().expect("gate result lock poisoned");
            while slot.is_none() {
                slot = gate.done.wait(slot).expect("condvar wait poisoned");
            }
            slot.clone().expect("gate result set before notify")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn trace(id: &str) -> Trace {
        Trace {
            trace_id: id.to_string(),
            project: "p".to_string(),
            duration_ms: 1.0,
            spans: vec![],
        }
    }

    #[test]
    fn put_then_get_within_ttl() {
        let cache = TraceCache::new(10, 10_000);
        cache.put("k", Arc::new(trace("k")));
        assert!(cache.get("k").is_some());
    }

    #[test]
    fn get_after_ttl_is_miss() {
        let cache = TraceCache::new(10, 1);
        cache.put("k", Arc::new(trace("k")));
        thread::sleep(Duration::from_millis(20));
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn eviction_drops_oldest_when_over_capacity() {
        let cache = TraceCache::new(2, 10_000);
        cache.put("a", Arc::new(trace("a")));
        cache.put("b", Arc::new(trace("b")));
        cache.put("c", Arc::new(trace("c")));
        assert_eq!(cache.size(), 2);
        assert!(cache.get("a").is_none());
    }

    #[test]
    fn clear_empties_cache() {
        let cache = TraceCache::new(10, 10_000);
        cache.put("k", Arc::new(trace("k")));
        cache.clear();
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn stats_report_expired_without_evicting() {
        let cache = TraceCache::new(10, 1);
        cache.put("a", Arc::new(trace("a")));
        thread::sleep(Duration::from_millis(20));
        let stats = cache.stats();
        assert_eq!(stats.total_entries, 1);
        assert_eq!(stats.expired_entries, 1);
        assert_eq!(stats.active_entries, 0);
        // stats() does not evict; entries remain until get() touches them.
        assert_eq!(cache.size(), 1);
    }

    #[test]
    fn single_flight_invokes_loader_once_under_contention() {
        let cache = Arc::new(TraceCache::new(10, 10_000));
        let call_count = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let call_count = call_count.clone();
                thread::spawn(move || {
                    cache
                        .get_or_fetch("shared", || {
                            call_count.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(Duration::from_millis(30));
                            Ok(trace("shared"))
                        })
                        .unwrap()
                })
            })
            .collect();

        for h in handles {
            let t = h.join().unwrap();
            assert_eq!(t.trace_id, "shared");
        }
        assert_eq!(call_count.load(Ordering::SeqCst), 1);

        // A later call observes the cached value without invoking the loader again.
        let t = cache
            .get_or_fetch("shared", || {
                call_count.fetch_add(1, Ordering::SeqCst);
                Ok(trace("shared"))
            })
            .unwrap();
        assert_eq!(t.trace_id, "shared");
        assert_eq!(call_count.load(Ordering::SeqCst), 1);
    }
}
