// pulsegate/src/state/timing.rs
//
// Per-key latency buckets for keystroke timing.
//
// Key composition (stable, the remote classifier is trained on it):
//   dwell   "<a>"               one normalized key
//   flight  "<a><b>"            released key, then pressed key
//   n-gram  "<t><h>-><e>"       1..K context keys, then pressed key
//
// Each bucket holds samples in arrival order. Two bounding policies:
//   PerKey  every bucket keeps at most `cap` samples
//   Total   all buckets together keep at most `cap`; the globally oldest
//            sample goes first and a bucket emptied by eviction is removed

use std::collections::{BTreeMap, HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{CapScope, KeystrokeConfig};

pub fn flight_key(from: &str, to: &str) -> String {
    format!("{from}{to}")
}

pub fn ngram_key<S: AsRef<str>>(context: &[S], next: &str) -> String {
    let mut k: String = context.iter().map(|s| s.as_ref()).collect();
    k.push_str("->");
    k.push_str(next);
    k
}

#[derive(Debug, Clone)]
pub struct TimingMap {
    buckets: HashMap<String, VecDeque<f64>>,
    // Owning key of every retained sample, oldest first (Total scope only).
    order:   VecDeque<String>,
    cap:     usize,
    scope:   CapScope,
    total:   usize,
}

impl TimingMap {
    pub fn new(cap: usize, scope: CapScope) -> Self {
        Self {
            buckets: HashMap::new(),
            order:   VecDeque::new(),
            cap:     cap.max(1),
            scope,
            total:   0,
        }
    }

    /// Append a sample. Returns the number of samples evicted to make room.
    pub fn push(&mut self, key: &str, value_ms: f64) -> usize {
        match self.scope {
            CapScope::PerKey => {
                let bucket = self.buckets.entry(key.to_string()).or_default();
                let mut evicted = 0;
                while bucket.len() >= self.cap {
                    bucket.pop_front();
                    evicted += 1;
                }
                bucket.push_back(value_ms);
                self.total = self.total + 1 - evicted;
                evicted
            }
            CapScope::Total => {
                self.buckets.entry(key.to_string()).or_default().push_back(value_ms);
                self.order.push_back(key.to_string());
                self.total += 1;

                let mut evicted = 0;
                while self.total > self.cap {
                    let Some(oldest) = self.order.pop_front() else { break };
                    if let Some(bucket) = self.buckets.get_mut(&oldest) {
                        bucket.pop_front();
                        self.total -= 1;
                        evicted += 1;
                        if bucket.is_empty() {
                            self.buckets.remove(&oldest);
                            debug!(key = %oldest, "timing bucket emptied by eviction");
                        }
                    }
                }
                evicted
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&VecDeque<f64>> {
        self.buckets.get(key)
    }

    pub fn buckets(&self) -> impl Iterator<Item = (&str, &VecDeque<f64>)> {
        self.buckets.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Every retained sample across all buckets.
    pub fn values(&self) -> Vec<f64> {
        self.buckets.values().flat_map(|b| b.iter().copied()).collect()
    }

    pub fn n_buckets(&self) -> usize { self.buckets.len() }
    pub fn n_samples(&self) -> usize { self.total }
    pub fn is_empty(&self) -> bool { self.total == 0 }

    pub fn clear(&mut self) {
        self.buckets.clear();
        self.order.clear();
        self.total = 0;
    }

    pub fn to_map(&self) -> BTreeMap<String, Vec<f64>> {
        self.buckets.iter()
            .map(|(k, v)| (k.clone(), v.iter().copied().collect()))
            .collect()
    }
}

/// JSON-serializable copy of all three timing maps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimingSnapshot {
    pub dwell:  BTreeMap<String, Vec<f64>>,
    pub flight: BTreeMap<String, Vec<f64>>,
    pub ngram:  BTreeMap<String, Vec<f64>>,
}

impl TimingSnapshot {
    pub fn is_empty(&self) -> bool {
        self.dwell.is_empty() && self.flight.is_empty() && self.ngram.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct TimingBuffers {
    pub dwell:  TimingMap,
    pub flight: TimingMap,
    pub ngram:  TimingMap,
}

impl TimingBuffers {
    pub fn new(config: &KeystrokeConfig) -> Self {
        Self {
            dwell:  TimingMap::new(config.buffer_cap, CapScope::PerKey),
            flight: TimingMap::new(config.buffer_cap, CapScope::PerKey),
            ngram:  TimingMap::new(config.ngram_cap, config.ngram_scope),
        }
    }

    pub fn snapshot(&self) -> TimingSnapshot {
        TimingSnapshot {
            dwell:  self.dwell.to_map(),
            flight: self.flight.to_map(),
            ngram:  self.ngram.to_map(),
        }
    }

    pub fn clear(&mut self) {
        self.dwell.clear();
        self.flight.clear();
        self.ngram.clear();
    }
}
