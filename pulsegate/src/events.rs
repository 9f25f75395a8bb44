// pulsegate/src/events.rs
//
// Shared event types and all domain types flowing through pulsegate.
//
//   raw input events → channel buffers (state/) → workers → ChannelScore
//   ChannelScore + DeviceFingerprint + ClassifierVerdict → engine::fusion → TrustScore
//
// Timestamps on raw events are monotonic high-resolution milliseconds
// (performance.now() on the sensor side), carried as f64.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::fingerprint::DeviceReport;

// ── Raw input events ──────────────────────────────────────────────────────────

/// Key-down / key-up from one input element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyEvent {
    /// Input element the event fired on (matched against attached subscriptions).
    pub target:       String,
    /// Raw key identifier as reported by the browser ("a", "Enter", " ").
    pub key:          String,
    pub timestamp_ms: f64,
    /// Auto-repeat while held, ignored by the extractor.
    #[serde(default)]
    pub repeat:       bool,
}

impl KeyEvent {
    pub fn new(target: impl Into<String>, key: impl Into<String>, timestamp_ms: f64) -> Self {
        Self { target: target.into(), key: key.into(), timestamp_ms, repeat: false }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PointerSample {
    pub x:            f64,
    pub y:            f64,
    pub timestamp_ms: f64,
}

impl PointerSample {
    pub fn new(x: f64, y: f64, timestamp_ms: f64) -> Self {
        Self { x, y, timestamp_ms }
    }

    pub fn distance_to(&self, other: &PointerSample) -> f64 {
        ((other.x - self.x).powi(2) + (other.y - self.y).powi(2)).sqrt()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MouseButton {
    #[default]
    Left,
    Middle,
    Right,
    Other,
}

impl From<u8> for MouseButton {
    // DOM MouseEvent.button numbering
    fn from(v: u8) -> Self {
        match v {
            0 => Self::Left,
            1 => Self::Middle,
            2 => Self::Right,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClickSample {
    pub x:            f64,
    pub y:            f64,
    pub timestamp_ms: f64,
    #[serde(default)]
    pub button:       MouseButton,
}

impl ClickSample {
    pub fn new(x: f64, y: f64, timestamp_ms: f64, button: MouseButton) -> Self {
        Self { x, y, timestamp_ms, button }
    }
}

/// The core's only input contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputEvent {
    KeyDown(KeyEvent),
    KeyUp(KeyEvent),
    PointerMove(PointerSample),
    Click(ClickSample),
    ContextMenu(ClickSample),
}

/// One line of a JSONL session recording (replay / tail / eval modes).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    #[serde(flatten)]
    pub payload:    RecordPayload,
    /// Ground truth for eval mode: true = automated session.
    #[serde(default)]
    pub label_bot:  Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecordPayload {
    KeyDown(KeyEvent),
    KeyUp(KeyEvent),
    PointerMove(PointerSample),
    Click(ClickSample),
    ContextMenu(ClickSample),
    /// Sensor-side device report, fed to the fingerprint collector.
    Device(Box<DeviceReport>),
    /// Pointer tracking flag toggled by the page.
    Tracking { enabled: bool },
    /// Form submitted. Buffers are cleared after a final score.
    Submit,
}

impl RecordPayload {
    pub fn as_input(&self) -> Option<InputEvent> {
        match self {
            Self::KeyDown(e)     => Some(InputEvent::KeyDown(e.clone())),
            Self::KeyUp(e)       => Some(InputEvent::KeyUp(e.clone())),
            Self::PointerMove(p) => Some(InputEvent::PointerMove(*p)),
            Self::Click(c)       => Some(InputEvent::Click(*c)),
            Self::ContextMenu(c) => Some(InputEvent::ContextMenu(*c)),
            _ => None,
        }
    }
}

// ── Detection types ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Keystroke, // dwell / flight / n-gram timing
    Pointer,   // trajectory + click regularity
    Device,    // fingerprint risk rules
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Keystroke => write!(f, "keystroke"),
            Self::Pointer   => write!(f, "pointer"),
            Self::Device    => write!(f, "device"),
        }
    }
}

/// Per-channel bot score. 0 = human-like, 100 = automated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelScore {
    pub channel:    Channel,
    pub score:      u8,
    /// 0.0–1.0, grows with sample count.
    pub confidence: f32,
    pub evidence:   Vec<String>,
    pub meta:       HashMap<String, serde_json::Value>,
    pub timestamp:  DateTime<Utc>,
}

impl ChannelScore {
    pub fn neutral(channel: Channel, reason: impl Into<String>) -> Self {
        Self {
            channel,
            score:      0,
            confidence: 0.0,
            evidence:   vec![reason.into()],
            meta:       HashMap::new(),
            timestamp:  Utc::now(),
        }
    }

    /// Enough samples behind this score for it to count in fusion.
    pub fn is_informative(&self) -> bool {
        self.confidence > 0.0
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum RiskTier {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskTier {
    /// Tier for a 0–100 bot score.
    pub fn from_bot_score(score: u8) -> Self {
        match score {
            75..=u8::MAX => Self::Critical,
            50..=74      => Self::High,
            25..=49      => Self::Medium,
            _            => Self::Low,
        }
    }
}

impl std::fmt::Display for RiskTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low      => write!(f, "LOW"),
            Self::Medium   => write!(f, "MEDIUM"),
            Self::High     => write!(f, "HIGH"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

// ── Trust score ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustComponents {
    pub device:        u8,
    pub bot_detection: u8,
    pub consistency:   u8,
}

/// Fused trust. 100 = confidently human. Replaced whole on every cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustScore {
    pub overall:      u8,
    pub components:   TrustComponents,
    pub risk_factors: Vec<String>,
    pub last_updated: DateTime<Utc>,
}

impl TrustScore {
    /// Neutral starting value before the first fusion cycle.
    pub fn neutral() -> Self {
        Self {
            overall:      50,
            components:   TrustComponents { device: 50, bot_detection: 50, consistency: 50 },
            risk_factors: Vec::new(),
            last_updated: Utc::now(),
        }
    }

    pub fn decision(&self, gate: &crate::config::GateConfig) -> GateDecision {
        if self.overall < gate.block_below {
            GateDecision::Block
        } else if self.overall < gate.challenge_below {
            GateDecision::Challenge
        } else {
            GateDecision::Allow
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GateDecision {
    Allow,
    Challenge,
    Block,
}

impl std::fmt::Display for GateDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Allow     => write!(f, "ALLOW"),
            Self::Challenge => write!(f, "CHALLENGE"),
            Self::Block     => write!(f, "BLOCK"),
        }
    }
}
