//! Cache metrics through the `metrics` facade.
//!
//! The embedding application decides whether and how these are exported.

use std::time::Instant;

pub fn record_lookup(hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    metrics::counter!("reelcache_lookups_total", "result" => result).increment(1);
}

pub fn record_fetch(outcome: &'static str, start: Instant) {
    metrics::counter!("reelcache_fetches_total", "outcome" => outcome).increment(1);
    metrics::histogram!("reelcache_fetch_duration_seconds", "outcome" => outcome)
        .record(start.elapsed().as_secs_f64());
}

pub fn record_bytes(bytes: u64) {
    metrics::counter!("reelcache_bytes_downloaded_total").increment(bytes);
}

pub fn record_eviction(count: usize, bytes: u64) {
    metrics::counter!("reelcache_evictions_total").increment(count as u64);
    metrics::counter!("reelcache_evicted_bytes_total").increment(bytes);
}

pub fn set_footprint(bytes: u64) {
    metrics::gauge!("reelcache_footprint_bytes").set(bytes as f64);
}
