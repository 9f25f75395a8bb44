// pulsegate/src/config.rs
//
// Configuration types. Every section is #[serde(default)], so a partial JSON
// file only needs the values it overrides.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};

/// Main configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PulsegateConfig {
    /// Keystroke timing capture and scoring
    pub keystroke: KeystrokeConfig,

    /// Pointer trajectory capture and scoring
    pub pointer: PointerConfig,

    /// Device fingerprint refresh
    pub device: DeviceConfig,

    /// Trust fusion
    pub fusion: FusionConfig,

    /// Periodic keystroke/pointer analysis
    pub analysis: AnalysisConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Seconds between analysis passes
    pub interval_secs: u64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self { interval_secs: 2 }
    }
}

impl PulsegateConfig {
    pub fn from_json_str(s: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        let k = &self.keystroke;
        if k.buffer_cap == 0 || k.ngram_cap == 0 {
            return Err(Error::Config("keystroke buffer caps must be > 0".into()));
        }
        if k.max_context == 0 {
            return Err(Error::Config("keystroke.max_context must be > 0".into()));
        }
        if k.hard_cap_ms < k.burst_gap_ms {
            return Err(Error::Config(format!(
                "keystroke.hard_cap_ms ({}) must be >= burst_gap_ms ({})",
                k.hard_cap_ms, k.burst_gap_ms
            )));
        }

        let p = &self.pointer;
        if p.max_samples == 0 || p.max_clicks == 0 {
            return Err(Error::Config("pointer buffer caps must be > 0".into()));
        }
        if p.straightness_window < 3 {
            return Err(Error::Config("pointer.straightness_window must be >= 3".into()));
        }
        if !(0.0..=1.0).contains(&p.straightness_threshold) {
            return Err(Error::Config("pointer.straightness_threshold must be within 0..=1".into()));
        }

        let w = &self.fusion.weights;
        let sum = w.device + w.bot_detection + w.consistency;
        if (sum - 1.0).abs() > 0.01 {
            return Err(Error::Config(format!("fusion weights must sum to 1.0 (got {:.3})", sum)));
        }
        if !(0.0..=1.0).contains(&self.fusion.remote_weight) {
            return Err(Error::Config("fusion.remote_weight must be within 0..=1".into()));
        }
        if self.fusion.history_len == 0 {
            return Err(Error::Config("fusion.history_len must be > 0".into()));
        }
        if self.fusion.gate.block_below > self.fusion.gate.challenge_below {
            return Err(Error::Config("fusion.gate.block_below must be <= challenge_below".into()));
        }
        Ok(())
    }
}

// ── Keystroke ─────────────────────────────────────────────────────────────────

/// How a timing map bounds itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapScope {
    /// Each key keeps at most `cap` samples.
    PerKey,
    /// All keys together keep at most `cap` samples, oldest evicted first.
    Total,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeystrokeConfig {
    /// Dwell / flight samples kept per key
    pub buffer_cap: usize,

    /// N-gram samples kept (see `ngram_scope`)
    pub ngram_cap: usize,

    pub ngram_scope: CapScope,

    /// Rolling context length K
    pub max_context: usize,

    /// Key-down gap at or above which a burst ends
    pub burst_gap_ms: f64,

    /// Absolute ceiling on an accepted n-gram gap
    pub hard_cap_ms: f64,

    /// Keystrokes between automatic classifier pushes (0 = never)
    pub submit_every: u32,
}

impl Default for KeystrokeConfig {
    fn default() -> Self {
        Self {
            buffer_cap:   50,
            ngram_cap:    50,
            ngram_scope:  CapScope::Total,
            max_context:  5,
            burst_gap_ms: 1000.0,
            hard_cap_ms:  1500.0,
            submit_every: 13,
        }
    }
}

// ── Pointer ───────────────────────────────────────────────────────────────────

/// Which channel scores dominate the combined pointer score.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMode {
    Movement,
    Clicks,
    #[default]
    Combined,
}

/// Distance/time bound for one teleportation severity tier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JumpTier {
    pub min_distance_px: f64,
    pub max_elapsed_ms:  f64,
}

impl JumpTier {
    pub const fn new(min_distance_px: f64, max_elapsed_ms: f64) -> Self {
        Self { min_distance_px, max_elapsed_ms }
    }

    pub fn matches(&self, distance: f64, elapsed_ms: f64) -> bool {
        distance > self.min_distance_px && elapsed_ms < self.max_elapsed_ms
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TeleportConfig {
    pub critical: JumpTier,
    pub high:     JumpTier,
    pub medium:   JumpTier,
    pub low:      JumpTier,
    /// Pairs further apart than this are a deliberate pause, not a jump
    pub pause_ms: f64,
    /// Added to the teleport score per critical jump
    pub critical_penalty: f64,
}

impl Default for TeleportConfig {
    fn default() -> Self {
        Self {
            critical:         JumpTier::new(500.0, 50.0),
            high:             JumpTier::new(300.0, 30.0),
            medium:           JumpTier::new(150.0, 20.0),
            low:              JumpTier::new(80.0, 10.0),
            pause_ms:         1000.0,
            critical_penalty: 0.15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PointerConfig {
    pub max_samples: usize,
    pub max_clicks:  usize,
    pub mode:        DetectionMode,

    /// Points per straightness window
    pub straightness_window: usize,
    /// Windows with a shorter chord are not analyzed
    pub min_segment_px: f64,
    /// chord / path ratio above which a window is "straight"
    pub straightness_threshold: f64,
    /// Enhanced window test: efficiency + linearity + velocity uniformity
    pub enhanced: bool,
    /// Max perpendicular deviation from the chord for the linearity signal
    pub linearity_tolerance_px: f64,
    /// In-window velocity CV below which speed is "uniform"
    pub window_velocity_cv: f64,

    pub velocity_floor_ms:   f64,
    pub velocity_ceiling_ms: f64,

    pub teleport: TeleportConfig,

    /// Samples per pixel of travel below which motion is "sparse"
    pub density_threshold: f64,
    /// Minimum travel before density is judged
    pub min_density_distance_px: f64,
}

impl Default for PointerConfig {
    fn default() -> Self {
        Self {
            max_samples:             1000,
            max_clicks:              500,
            mode:                    DetectionMode::Combined,
            straightness_window:     10,
            min_segment_px:          20.0,
            straightness_threshold:  0.95,
            enhanced:                true,
            linearity_tolerance_px:  3.0,
            window_velocity_cv:      0.15,
            velocity_floor_ms:       8.0,
            velocity_ceiling_ms:     1000.0,
            teleport:                TeleportConfig::default(),
            density_threshold:       0.02,
            min_density_distance_px: 200.0,
        }
    }
}

// ── Device ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Seconds between fingerprint regenerations (0 = on demand only)
    pub refresh_secs: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self { refresh_secs: 30 }
    }
}

// ── Fusion ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionWeights {
    pub device:        f64,
    pub bot_detection: f64,
    pub consistency:   f64,
}

impl Default for FusionWeights {
    fn default() -> Self {
        Self { device: 0.50, bot_detection: 0.40, consistency: 0.10 }
    }
}

/// Trust thresholds for form-submission gating.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Trust below which the submission is challenged
    pub challenge_below: u8,
    /// Trust below which the submission is blocked
    pub block_below: u8,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self { challenge_below: 60, block_below: 30 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    pub weights: FusionWeights,

    /// Classifier share of the bot-detection component when local
    /// keystroke/pointer scores are also available
    pub remote_weight: f64,

    /// Past overall scores kept for the consistency component
    pub history_len: usize,

    /// Seconds between trust recomputations
    pub interval_secs: u64,

    pub gate: GateConfig,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            weights:       FusionWeights::default(),
            remote_weight: 0.6,
            history_len:   10,
            interval_secs: 30,
            gate:          GateConfig::default(),
        }
    }
}
