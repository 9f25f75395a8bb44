// pulsegate/src/workers/pointer.rs
//
// Pointer worker: trajectory straightness, velocity consistency,
// teleportation, movement density, click regularity.
//
// Every metric is a pure function of the trajectory buffer, 0.0–1.0,
// higher = more automated. The combined score weights them by
// DetectionMode and compounds on extreme or co-occurring signals.
//
// Mode weights        straight  velocity  teleport  density  click
//   movement            0.30      0.25      0.25      0.20    0.00
//   clicks              0.10      0.15      0.15      0.00    0.60
//   combined            0.25      0.20      0.20      0.10    0.25

use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::{DetectionMode, PointerConfig};
use crate::events::{Channel, ChannelScore, ClickSample, PointerSample};
use crate::state::trajectory::Trajectory;
use crate::stats::{mean_and_cv, to_percent};

const CLICK_MIN_INTERVAL_MS: f64 = 50.0;
const CLICK_MAX_INTERVAL_MS: f64 = 10_000.0;
const CLICK_BUCKET_MS:       f64 = 50.0;
const MIN_SAMPLES:           usize = 5;
const MIN_CLICKS:            usize = 4;

// ── Teleportation types ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeleportationEvent {
    pub from:       PointerSample,
    pub to:         PointerSample,
    pub distance:   f64,
    pub time_delta: f64,
    pub severity:   Severity,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TeleportAnalysis {
    pub score:    f64,
    pub analyzed: usize,
    pub critical: usize,
    pub events:   Vec<TeleportationEvent>,
}

// ── Metrics ───────────────────────────────────────────────────────────────────

/// Inputs to the combined score.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PointerComponents {
    pub straightness:         f64,
    pub velocity_consistency: f64,
    pub teleportation:        f64,
    pub density:              f64,
    pub click_regularity:     f64,
    pub critical_jumps:       usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PointerMetrics {
    #[serde(flatten)]
    pub components:      PointerComponents,
    /// 0–100
    pub bot_score:       u8,
    pub flags:           Vec<String>,
    pub teleport_events: Vec<TeleportationEvent>,
    pub samples:         usize,
    pub clicks:          usize,
}

// ── Straightness ──────────────────────────────────────────────────────────────

/// Fraction of analyzed windows that look ruler-straight.
pub fn straightness(samples: &[PointerSample], cfg: &PointerConfig) -> f64 {
    let w = cfg.straightness_window.max(3);
    if samples.len() < w {
        return 0.0;
    }
    let stride = (w / 2).max(1);

    let mut analyzed = 0usize;
    let mut flagged  = 0usize;
    let mut start    = 0usize;
    while start + w <= samples.len() {
        let win = &samples[start..start + w];
        start += stride;

        let chord = win[0].distance_to(&win[w - 1]);
        if chord < cfg.min_segment_px {
            continue;
        }
        let path = path_length(win);
        if path <= 0.0 {
            continue;
        }
        analyzed += 1;

        let efficient = chord / path > cfg.straightness_threshold;
        let suspicious = if cfg.enhanced {
            let linear  = max_deviation(win) <= cfg.linearity_tolerance_px;
            let uniform = window_velocity_uniform(win, cfg.window_velocity_cv);
            let combined = 0.4 * efficient as u8 as f64
                         + 0.3 * linear as u8 as f64
                         + 0.3 * uniform as u8 as f64;
            combined >= 0.6
        } else {
            efficient
        };
        if suspicious {
            flagged += 1;
        }
    }

    if analyzed == 0 { 0.0 } else { flagged as f64 / analyzed as f64 }
}

fn path_length(samples: &[PointerSample]) -> f64 {
    samples.windows(2).map(|p| p[0].distance_to(&p[1])).sum()
}

/// Largest perpendicular distance of any point from the first→last chord.
fn max_deviation(win: &[PointerSample]) -> f64 {
    let (a, b) = (win[0], win[win.len() - 1]);
    let chord = a.distance_to(&b);
    if chord == 0.0 {
        return 0.0;
    }
    win.iter()
        .map(|p| ((b.x - a.x) * (p.y - a.y) - (b.y - a.y) * (p.x - a.x)).abs() / chord)
        .fold(0.0, f64::max)
}

fn window_velocity_uniform(win: &[PointerSample], max_cv: f64) -> bool {
    let v: Vec<f64> = win.windows(2)
        .filter_map(|p| {
            let dt = p[1].timestamp_ms - p[0].timestamp_ms;
            (dt > 0.0).then(|| p[0].distance_to(&p[1]) / dt)
        })
        .collect();
    if v.len() < 2 {
        return false;
    }
    let (m, cv) = mean_and_cv(&v);
    m > 0.0 && cv < max_cv
}

// ── Velocity consistency ──────────────────────────────────────────────────────

/// Constant speed → 1.0. CV of 0.5 or more → 0.0.
pub fn velocity_consistency(samples: &[PointerSample], cfg: &PointerConfig) -> f64 {
    let v: Vec<f64> = samples.windows(2)
        .filter_map(|p| {
            let dt = p[1].timestamp_ms - p[0].timestamp_ms;
            (dt >= cfg.velocity_floor_ms && dt < cfg.velocity_ceiling_ms)
                .then(|| p[0].distance_to(&p[1]) / dt)
        })
        .collect();
    if v.len() < 3 {
        return 0.0;
    }
    let (m, cv) = mean_and_cv(&v);
    if m == 0.0 {
        return 0.0;
    }
    (1.0 - (cv / 0.5).min(1.0)).max(0.0)
}

// ── Teleportation ─────────────────────────────────────────────────────────────

pub fn teleportation(samples: &[PointerSample], cfg: &PointerConfig) -> TeleportAnalysis {
    let t = &cfg.teleport;
    let mut out = TeleportAnalysis::default();

    for p in samples.windows(2) {
        let dt = p[1].timestamp_ms - p[0].timestamp_ms;
        if dt < 0.0 || dt > t.pause_ms {
            continue;
        }
        out.analyzed += 1;

        let d = p[0].distance_to(&p[1]);
        let severity = if t.critical.matches(d, dt) { Severity::Critical }
            else if t.high.matches(d, dt)   { Severity::High }
            else if t.medium.matches(d, dt) { Severity::Medium }
            else if t.low.matches(d, dt)    { Severity::Low }
            else { continue };

        if severity == Severity::Critical {
            out.critical += 1;
        }
        out.events.push(TeleportationEvent {
            from: p[0], to: p[1], distance: d, time_delta: dt, severity,
        });
    }

    if out.analyzed == 0 {
        return out;
    }
    let ratio = out.events.len() as f64 / out.analyzed as f64;
    let boosted = if ratio > 0.5 { ratio * 2.0 } else if ratio > 0.3 { ratio * 1.5 } else { ratio };
    out.score = (boosted + out.critical as f64 * t.critical_penalty).min(1.0);
    out
}

// ── Density ───────────────────────────────────────────────────────────────────

/// Too few samples for the distance covered → programmatic positioning.
pub fn movement_density(samples: &[PointerSample], cfg: &PointerConfig) -> f64 {
    if samples.len() < MIN_SAMPLES {
        return 0.0;
    }
    let distance = path_length(samples);
    if distance < cfg.min_density_distance_px {
        return 0.0;
    }
    let density = samples.len() as f64 / distance;
    if density < cfg.density_threshold {
        (cfg.density_threshold - density) / cfg.density_threshold
    } else {
        0.0
    }
}

// ── Clicks ────────────────────────────────────────────────────────────────────

pub fn click_regularity(clicks: &[ClickSample]) -> f64 {
    let intervals: Vec<f64> = clicks.windows(2)
        .map(|c| c[1].timestamp_ms - c[0].timestamp_ms)
        .filter(|i| (CLICK_MIN_INTERVAL_MS..=CLICK_MAX_INTERVAL_MS).contains(i))
        .collect();
    if intervals.len() < 3 {
        return 0.0;
    }

    let mut score = 0.0;
    let (_, cv) = mean_and_cv(&intervals);
    if cv < 0.15 {
        score += 0.6;
    }

    let mut buckets: HashMap<i64, usize> = HashMap::new();
    for i in &intervals {
        *buckets.entry((i / CLICK_BUCKET_MS).round() as i64).or_default() += 1;
    }
    let top = buckets.values().copied().max().unwrap_or(0);
    if top as f64 / intervals.len() as f64 >= 0.4 {
        score += 0.4;
    }
    f64::min(score, 1.0)
}

// ── Combined ──────────────────────────────────────────────────────────────────

fn mode_weights(mode: DetectionMode) -> [f64; 5] {
    match mode {
        DetectionMode::Movement => [0.30, 0.25, 0.25, 0.20, 0.00],
        DetectionMode::Clicks   => [0.10, 0.15, 0.15, 0.00, 0.60],
        DetectionMode::Combined => [0.25, 0.20, 0.20, 0.10, 0.25],
    }
}

/// Mode-weighted sum with compounding multipliers, as a 0–100 score.
pub fn combined_score(c: &PointerComponents, mode: DetectionMode) -> (u8, Vec<String>) {
    let w = mode_weights(mode);
    let mut raw = w[0] * c.straightness
                + w[1] * c.velocity_consistency
                + w[2] * c.teleportation
                + w[3] * c.density
                + w[4] * c.click_regularity;
    let mut flags = Vec::new();

    if c.straightness > 0.8 {
        flags.push(format!("straight_trajectory:{:.2}", c.straightness));
    }
    if c.velocity_consistency > 0.9 {
        flags.push(format!("constant_velocity:{:.2}", c.velocity_consistency));
    }
    if c.click_regularity > 0.7 {
        flags.push(format!("regular_clicks:{:.2}", c.click_regularity));
    }
    if !flags.is_empty() {
        raw *= 1.3;
    }

    let teleport_hot = c.teleportation > 0.3 || c.critical_jumps > 0;
    let density_hot  = c.density > 0.5;
    match (teleport_hot, density_hot) {
        (true, true) => {
            raw *= 2.0;
            flags.push("teleport_with_sparse_motion".into());
        }
        (true, false) => {
            raw *= 1.5;
            if c.critical_jumps > 0 {
                flags.push(format!("critical_teleport:{}", c.critical_jumps));
            } else {
                flags.push(format!("teleportation:{:.2}", c.teleportation));
            }
        }
        (false, true) => {
            raw *= 1.3;
            flags.push(format!("sparse_motion:{:.2}", c.density));
        }
        (false, false) => {}
    }

    (to_percent(raw.min(1.0)), flags)
}

// ── Extractor ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PointerExtractor {
    config:     PointerConfig,
    trajectory: Trajectory,
}

impl PointerExtractor {
    pub fn new(config: PointerConfig) -> Self {
        let trajectory = Trajectory::new(&config);
        Self { config, trajectory }
    }

    pub fn trajectory(&self) -> &Trajectory { &self.trajectory }
    pub fn trajectory_mut(&mut self) -> &mut Trajectory { &mut self.trajectory }
    pub fn config(&self) -> &PointerConfig { &self.config }

    pub fn clear(&mut self) { self.trajectory.clear(); }

    pub fn metrics(&self) -> PointerMetrics {
        let samples = self.trajectory.samples.to_vec();
        let clicks  = self.trajectory.clicks.to_vec();
        let cfg     = &self.config;

        let teleport = teleportation(&samples, cfg);
        let components = PointerComponents {
            straightness:         straightness(&samples, cfg),
            velocity_consistency: velocity_consistency(&samples, cfg),
            teleportation:        teleport.score,
            density:              movement_density(&samples, cfg),
            click_regularity:     click_regularity(&clicks),
            critical_jumps:       teleport.critical,
        };
        let (bot_score, flags) = combined_score(&components, cfg.mode);

        PointerMetrics {
            components,
            bot_score,
            flags,
            teleport_events: teleport.events,
            samples: samples.len(),
            clicks:  clicks.len(),
        }
    }

    pub fn channel_score(&self) -> ChannelScore {
        let n_samples = self.trajectory.samples.len();
        let n_clicks  = self.trajectory.clicks.len();
        if n_samples < MIN_SAMPLES && n_clicks < MIN_CLICKS {
            return ChannelScore::neutral(Channel::Pointer, "insufficient_data");
        }
        let m = self.metrics();
        let confidence = ((n_samples as f32 / 100.0) + (n_clicks as f32 / 10.0)).min(1.0);
        let c = m.components;

        ChannelScore {
            channel:  Channel::Pointer,
            score:    m.bot_score,
            confidence,
            evidence: m.flags,
            meta: [
                ("straightness".into(),         json!(c.straightness)),
                ("velocity_consistency".into(), json!(c.velocity_consistency)),
                ("teleportation".into(),        json!(c.teleportation)),
                ("density".into(),              json!(c.density)),
                ("click_regularity".into(),     json!(c.click_regularity)),
                ("teleport_events".into(),      json!(m.teleport_events.len())),
            ].into_iter().collect(),
            timestamp: Utc::now(),
        }
    }
}
