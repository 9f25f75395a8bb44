// pulsegate/src/workers/keystroke.rs
//
// Keystroke dynamics: dwell, flight and n-gram timing.
//
//   key-down  → flight  = now − last key-up         bucket "<prev><cur>"
//             → n-gram  = now − last key-down       buckets "<ctx…>-><cur>", j = 1..K
//               (only while the gap stays inside the burst gate; a broken
//                burst clears the context so no n-gram spans the gap)
//             → dwell start recorded, key pushed onto the rolling context
//   key-up    → dwell   = now − dwell start         bucket "<cur>"
//
// A script replaying keystrokes on a fixed clock produces near-zero spread in
// all three distributions. Human typing has 20–60ms of dwell jitter and wide
// flight spread that depends on the key pair.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::config::KeystrokeConfig;
use crate::events::{Channel, ChannelScore, KeyEvent};
use crate::state::timing::{flight_key, ngram_key, TimingBuffers, TimingSnapshot};
use crate::stats::{mean, mean_and_cv, range, std_dev};

// Held keys without a matching key-up (focus lost mid-press) are forgotten past this.
const MAX_PENDING_DWELL: usize = 32;
const MIN_KEYSTROKES: u64 = 5;

/// Canonical token for a raw key identifier: lowercase, wrapped in `<>`.
pub fn normalize_key(raw: &str) -> String {
    match raw {
        " " | "Spacebar" => "<space>".to_string(),
        ""               => "<unidentified>".to_string(),
        k                => format!("<{}>", k.to_lowercase()),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeystrokeMetrics {
    pub avg_dwell_time:    f64,
    pub dwell_variability: f64,
    pub avg_flight_time:   f64,
    pub flight_variability:f64,
    pub typing_rhythm:     f64,
    /// Estimated words per minute
    pub typing_speed:      f64,
    pub unique_keys:       usize,
    pub total_keystrokes:  u64,
    pub dwell_samples:     usize,
    pub flight_samples:    usize,
    pub ngram_buckets:     usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeystrokeAssessment {
    /// 0–100 bot likelihood
    pub score: u8,
    pub flags: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct KeystrokeExtractor {
    config:        KeystrokeConfig,
    buffers:       TimingBuffers,
    dwell_start:   HashMap<String, f64>,
    last_key_up:   Option<(String, f64)>,
    last_key_down: Option<f64>,
    context:       VecDeque<String>,
    seen_keys:     HashSet<String>,
    total_keys:    u64,
    first_key_ms:  Option<f64>,
    last_event_ms: Option<f64>,
    since_submit:  u32,
}

impl KeystrokeExtractor {
    pub fn new(config: KeystrokeConfig) -> Self {
        let buffers = TimingBuffers::new(&config);
        Self {
            config,
            buffers,
            dwell_start:   HashMap::new(),
            last_key_up:   None,
            last_key_down: None,
            context:       VecDeque::new(),
            seen_keys:     HashSet::new(),
            total_keys:    0,
            first_key_ms:  None,
            last_event_ms: None,
            since_submit:  0,
        }
    }

    /// Returns false when the event was ignored (auto-repeat, bad timestamp).
    pub fn key_down(&mut self, ev: &KeyEvent) -> bool {
        let now = ev.timestamp_ms;
        if ev.repeat || !now.is_finite() {
            return false;
        }
        let key = normalize_key(&ev.key);

        // ── Flight: last release → this press ─────────────────────────────────
        // The last release stays current until the next key-up, so rolled-over
        // presses each get a flight from it.
        if let Some((up_key, up_ts)) = &self.last_key_up {
            let flight = now - up_ts;
            if flight >= 0.0 {
                self.buffers.flight.push(&flight_key(up_key, &key), flight);
                self.seen_keys.insert(up_key.clone());
                self.seen_keys.insert(key.clone());
            }
        }

        // ── N-gram: press → press within one burst ───────────────────────────
        if let Some(prev_down) = self.last_key_down {
            let gap = now - prev_down;
            if gap >= 0.0 && gap < self.config.burst_gap_ms && gap <= self.config.hard_cap_ms {
                let ctx: Vec<&String> = self.context.iter().collect();
                let max_j = self.config.max_context.min(ctx.len());
                for j in 1..=max_j {
                    let suffix = &ctx[ctx.len() - j..];
                    self.buffers.ngram.push(&ngram_key(suffix, &key), gap);
                }
            } else {
                debug!(gap_ms = gap, "keystroke burst broken, context reset");
                self.context.clear();
            }
        }

        if self.dwell_start.len() >= MAX_PENDING_DWELL {
            self.dwell_start.clear();
        }
        self.dwell_start.insert(key.clone(), now);

        self.context.push_back(key);
        while self.context.len() > self.config.max_context {
            self.context.pop_front();
        }

        self.last_key_down = Some(now);
        self.first_key_ms.get_or_insert(now);
        self.last_event_ms = Some(now);
        self.total_keys   += 1;
        self.since_submit += 1;
        true
    }

    /// Returns false when no matching key-down was pending.
    pub fn key_up(&mut self, ev: &KeyEvent) -> bool {
        let now = ev.timestamp_ms;
        if !now.is_finite() {
            return false;
        }
        let key = normalize_key(&ev.key);
        let Some(start) = self.dwell_start.remove(&key) else { return false };

        let dwell = now - start;
        if dwell >= 0.0 {
            self.buffers.dwell.push(&key, dwell);
            self.seen_keys.insert(key.clone());
        }
        self.last_key_up   = Some((key, now));
        self.last_event_ms = Some(now);
        true
    }

    /// True once every `submit_every` keystrokes; resets the counter.
    pub fn take_submit_due(&mut self) -> bool {
        if self.config.submit_every == 0 || self.since_submit < self.config.submit_every {
            return false;
        }
        self.since_submit = 0;
        true
    }

    pub fn buffers(&self) -> &TimingBuffers { &self.buffers }

    pub fn snapshot(&self) -> TimingSnapshot { self.buffers.snapshot() }

    pub fn total_keystrokes(&self) -> u64 { self.total_keys }

    pub fn clear(&mut self) {
        self.buffers.clear();
        self.dwell_start.clear();
        self.last_key_up   = None;
        self.last_key_down = None;
        self.context.clear();
        self.seen_keys.clear();
        self.total_keys    = 0;
        self.first_key_ms  = None;
        self.last_event_ms = None;
        self.since_submit  = 0;
    }

    pub fn metrics(&self) -> KeystrokeMetrics {
        let dwell  = self.buffers.dwell.values();
        let flight = self.buffers.flight.values();
        let (avg_dwell, dwell_cv)   = mean_and_cv(&dwell);
        let (avg_flight, flight_cv) = mean_and_cv(&flight);

        let typing_rhythm = if flight.len() >= 2 && flight_cv < 0.2 { 1.0 - flight_cv } else { 0.0 };

        let typing_speed = match (self.first_key_ms, self.last_event_ms) {
            (Some(first), Some(last)) if last > first && self.total_keys > 0 => {
                let minutes = (last - first) / 60_000.0;
                (self.total_keys as f64 / 5.0) / minutes
            }
            _ => 0.0,
        };

        KeystrokeMetrics {
            avg_dwell_time:     avg_dwell,
            dwell_variability:  dwell_cv,
            avg_flight_time:    avg_flight,
            flight_variability: flight_cv,
            typing_rhythm,
            typing_speed,
            unique_keys:        self.seen_keys.len(),
            total_keystrokes:   self.total_keys,
            dwell_samples:      dwell.len(),
            flight_samples:     flight.len(),
            ngram_buckets:      self.buffers.ngram.n_buckets(),
        }
    }

    /// Additive rule table. Thresholds are in milliseconds of spread (stddev).
    pub fn assess(&self) -> KeystrokeAssessment {
        let dwell  = self.buffers.dwell.values();
        let flight = self.buffers.flight.values();
        let dwell_std  = std_dev(&dwell);
        let flight_std = std_dev(&flight);

        let mut score: i32 = 0;
        let mut flags = Vec::new();

        if dwell.len() > 10 && dwell_std < 15.0 {
            score += 25;
            flags.push("extremely consistent dwell times".to_string());
        }
        if flight.len() > 5 && mean(&flight) < 80.0 {
            score += 20;
            flags.push("unrealistically fast typing".to_string());
        }
        if flight.len() > 5 && flight_std < 20.0 {
            score += 20;
            flags.push("highly consistent flight times".to_string());
        }
        if dwell.len() > 15 {
            let unique: HashSet<i64> = dwell.iter().map(|v| v.round() as i64).collect();
            if (unique.len() as f64 / dwell.len() as f64) < 0.3 {
                score += 15;
                flags.push("repetitive dwell values".to_string());
            }
        }
        if dwell.len() > 10 && range(&dwell) < 50.0 {
            score += 10;
            flags.push("narrow dwell time range".to_string());
        }

        let ngram_stds: Vec<f64> = self.buffers.ngram.buckets()
            .filter(|(_, b)| b.len() >= 2)
            .map(|(_, b)| std_dev(&b.iter().copied().collect::<Vec<_>>()))
            .collect();
        if ngram_stds.len() > 3 && mean(&ngram_stds) < 25.0 {
            score += 15;
            flags.push("uniform n-gram timing".to_string());
        }

        if dwell_std > 30.0 && flight_std > 40.0 {
            score -= 10;
            flags.push("human-like timing variation".to_string());
        }

        KeystrokeAssessment { score: score.clamp(0, 100) as u8, flags }
    }

    pub fn channel_score(&self) -> ChannelScore {
        if self.total_keys < MIN_KEYSTROKES {
            return ChannelScore::neutral(Channel::Keystroke, "insufficient_data");
        }
        let metrics    = self.metrics();
        let assessment = self.assess();
        let confidence = (metrics.dwell_samples as f32 / 30.0).min(1.0);

        ChannelScore {
            channel:  Channel::Keystroke,
            score:    assessment.score,
            confidence,
            evidence: assessment.flags,
            meta: [
                ("avg_dwell_ms".into(),       json!(metrics.avg_dwell_time)),
                ("dwell_variability".into(),  json!(metrics.dwell_variability)),
                ("avg_flight_ms".into(),      json!(metrics.avg_flight_time)),
                ("flight_variability".into(), json!(metrics.flight_variability)),
                ("typing_wpm".into(),         json!(metrics.typing_speed)),
                ("keystrokes".into(),         json!(metrics.total_keystrokes)),
            ].into_iter().collect(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn down(x: &mut KeystrokeExtractor, key: &str, t: f64) {
        assert!(x.key_down(&KeyEvent::new("f", key, t)));
    }

    fn up(x: &mut KeystrokeExtractor, key: &str, t: f64) {
        assert!(x.key_up(&KeyEvent::new("f", key, t)));
    }

    /// `n` presses of one key; `flight(i)` separates press i from press i+1.
    fn typed(n: usize, dwell: impl Fn(usize) -> f64, flight: impl Fn(usize) -> f64) -> KeystrokeExtractor {
        let mut x = KeystrokeExtractor::new(KeystrokeConfig::default());
        let mut t = 0.0;
        for i in 0..n {
            down(&mut x, "a", t);
            t += dwell(i);
            up(&mut x, "a", t);
            t += flight(i);
        }
        x
    }

    // Flights of 1000ms and up keep every key-down gap past the burst gate,
    // so the n-gram rule stays out of the dwell and flight cases.
    fn slow_flight(i: usize) -> f64 { 1000.0 + 30.0 * (i % 3) as f64 }

    #[test]
    fn consistent_dwell_needs_eleven_samples() {
        let x = typed(10, |_| 80.0, |i| 1000.0 + 100.0 * i as f64);
        assert_eq!(x.assess(), KeystrokeAssessment { score: 0, flags: vec![] });

        let a = typed(11, |_| 80.0, |i| 1000.0 + 100.0 * i as f64).assess();
        assert_eq!(a.flags, vec!["extremely consistent dwell times", "narrow dwell time range"]);
        assert_eq!(a.score, 35);
    }

    #[test]
    fn fast_flight_needs_six_samples() {
        // 960ms dwell + 50ms flight puts each key-down 1010ms after the last
        let x = typed(6, |_| 960.0, |_| 50.0);
        assert_eq!(x.metrics().flight_samples, 5);
        assert_eq!(x.assess().score, 0);

        let a = typed(7, |_| 960.0, |_| 50.0).assess();
        assert_eq!(a.flags, vec!["unrealistically fast typing", "highly consistent flight times"]);
        assert_eq!(a.score, 40);
    }

    #[test]
    fn repetitive_dwell_values() {
        // three distinct dwells, spread and range too wide for the other dwell rules
        let dwell = |i: usize| [40.0, 100.0, 160.0][i % 3];
        let a = typed(16, dwell, slow_flight).assess();
        assert_eq!(a.flags, vec!["repetitive dwell values"]);
        assert_eq!(a.score, 15);

        assert_eq!(typed(15, dwell, slow_flight).assess().score, 0);
    }

    #[test]
    fn narrow_dwell_range() {
        // stddev 22.5ms clears the consistency rule, range 45ms does not clear this one
        let a = typed(12, |i| if i % 2 == 0 { 60.0 } else { 105.0 }, slow_flight).assess();
        assert_eq!(a.flags, vec!["narrow dwell time range"]);
        assert_eq!(a.score, 10);
    }

    #[test]
    fn uniform_ngram_timing_needs_four_buckets() {
        // One key at a fixed 300ms cadence: bucket j holds n - j samples, and
        // only buckets with two or more samples count.
        let x = typed(5, |_| 100.0, |_| 200.0);
        assert_eq!(x.metrics().ngram_buckets, 4);
        assert_eq!(x.assess().score, 0);

        let a = typed(6, |_| 100.0, |_| 200.0).assess();
        assert_eq!(a.flags, vec!["uniform n-gram timing"]);
        assert_eq!(a.score, 15);
    }

    #[test]
    fn normalizes_keys() {
        assert_eq!(normalize_key("A"), "<a>");
        assert_eq!(normalize_key("Enter"), "<enter>");
        assert_eq!(normalize_key(" "), "<space>");
        assert_eq!(normalize_key(""), "<unidentified>");
    }

    #[test]
    fn dwell_and_flight_pairing() {
        let mut x = KeystrokeExtractor::new(KeystrokeConfig::default());
        down(&mut x, "h", 100.0);
        up(&mut x, "h", 180.0);
        down(&mut x, "i", 250.0);
        up(&mut x, "i", 340.0);

        let b = x.buffers();
        assert_eq!(b.dwell.get("<h>").unwrap()[0], 80.0);
        assert_eq!(b.dwell.get("<i>").unwrap()[0], 90.0);
        assert_eq!(b.flight.get("<h><i>").unwrap()[0], 70.0);
        assert_eq!(b.ngram.get("<h>-><i>").unwrap()[0], 150.0);
    }

    #[test]
    fn ngrams_cover_every_suffix_length() {
        let mut x = KeystrokeExtractor::new(KeystrokeConfig::default());
        for (i, k) in ["t", "h", "e", "n"].iter().enumerate() {
            let t = i as f64 * 100.0;
            down(&mut x, k, t);
            up(&mut x, k, t + 40.0);
        }
        let ng = &x.buffers().ngram;
        assert!(ng.get("<e>-><n>").is_some());
        assert!(ng.get("<h><e>-><n>").is_some());
        assert!(ng.get("<t><h><e>-><n>").is_some());
        assert_eq!(ng.n_buckets(), 3 + 2 + 1);
    }

    #[test]
    fn auto_repeat_and_stray_key_up_are_ignored() {
        let mut x = KeystrokeExtractor::new(KeystrokeConfig::default());
        down(&mut x, "a", 0.0);
        let mut rep = KeyEvent::new("f", "a", 30.0);
        rep.repeat = true;
        assert!(!x.key_down(&rep));
        assert!(!x.key_up(&KeyEvent::new("f", "z", 40.0)));
        up(&mut x, "a", 90.0);
        assert_eq!(x.total_keystrokes(), 1);
        assert_eq!(x.buffers().dwell.get("<a>").unwrap()[0], 90.0);
    }

    #[test]
    fn typing_rhythm_needs_flight_samples() {
        let x = KeystrokeExtractor::new(KeystrokeConfig::default());
        assert_eq!(x.metrics().typing_rhythm, 0.0);
    }

    #[test]
    fn submit_cadence() {
        let cfg = KeystrokeConfig { submit_every: 3, ..KeystrokeConfig::default() };
        let mut x = KeystrokeExtractor::new(cfg);
        let mut due = 0;
        for i in 0..9 {
            down(&mut x, "a", i as f64 * 200.0);
            up(&mut x, "a", i as f64 * 200.0 + 50.0);
            if x.take_submit_due() {
                due += 1;
            }
        }
        assert_eq!(due, 3);
    }

    #[test]
    fn human_variation_earns_bonus() {
        let mut x = KeystrokeExtractor::new(KeystrokeConfig::default());
        // Dwell 60–190ms, flight 40–300ms, spread well above the bonus thresholds.
        let dwells  = [60.0, 190.0, 85.0, 150.0, 70.0, 175.0, 95.0, 130.0, 65.0, 185.0, 110.0, 140.0];
        let flights = [40.0, 300.0, 120.0, 260.0, 60.0, 210.0, 90.0, 280.0, 150.0, 45.0, 230.0];
        let keys = ["q", "w", "e", "r", "t", "y", "u", "i", "o", "p", "a", "s"];
        let mut t = 0.0;
        for i in 0..keys.len() {
            down(&mut x, keys[i], t);
            t += dwells[i];
            up(&mut x, keys[i], t);
            if i < flights.len() {
                t += flights[i];
            }
        }
        let a = x.assess();
        assert!(a.flags.iter().any(|f| f == "human-like timing variation"), "{:?}", a.flags);
        assert_eq!(a.score, 0);
    }
}
