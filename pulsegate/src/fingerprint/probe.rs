// pulsegate/src/fingerprint/probe.rs
//
// Signal sources for the device collector.
//
// A DeviceProbe answers one question per signal. Every method may fail;
// the collector turns failures into sentinel values and risk factors, so
// implementations should return an error rather than a guessed value.
//
// RecordedProbe replays a DeviceReport produced by the sensor script on the
// page (one JSON object, each section optional).

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{BasicInfo, NetworkInfo, ScreenInfo, SensorInfo, TimezoneInfo};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    #[error("signal unavailable")]
    Unavailable,
    #[error("permission denied")]
    PermissionDenied,
    #[error("probe failed: {0}")]
    Failed(String),
}

pub type ProbeResult<T> = std::result::Result<T, ProbeError>;

/// WebGL context parameters plus the rendered test scene.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebGlReport {
    pub vendor:     String,
    pub renderer:   String,
    pub extensions: Vec<String>,
    /// Pixel readback of the test scene (base64 or hex, opaque here)
    pub pixels:     String,
}

/// Measured text widths: one per candidate font, plus the fallback family.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FontWidths {
    pub fallback_width: f64,
    pub widths:         BTreeMap<String, f64>,
}

pub trait DeviceProbe: Send + Sync {
    fn basic(&self) -> ProbeResult<BasicInfo>;
    fn screen(&self) -> ProbeResult<ScreenInfo>;
    /// Data URL (or raw pixels) of the canvas test drawing.
    fn canvas(&self) -> ProbeResult<String>;
    fn webgl(&self) -> ProbeResult<WebGlReport>;
    /// Rendered samples from an offline audio context.
    fn audio(&self) -> ProbeResult<Vec<f32>>;
    fn fonts(&self) -> ProbeResult<FontWidths>;
    fn network(&self) -> ProbeResult<NetworkInfo>;
    fn sensors(&self) -> ProbeResult<SensorInfo>;
    fn timezone(&self) -> ProbeResult<TimezoneInfo>;
    /// Consecutive high-resolution clock readings.
    fn timer_samples(&self) -> ProbeResult<Vec<f64>>;
    /// Layout height of the ad-bait element after insertion.
    fn ad_bait_height(&self) -> ProbeResult<f64>;
    /// Attempt a storage write. Err means storage is blocked.
    fn storage_write(&self) -> ProbeResult<()>;
    fn do_not_track(&self) -> ProbeResult<bool> { Ok(false) }
}

// ── Recorded report ───────────────────────────────────────────────────────────

/// Sensor-side device report. Absent sections read as `Unavailable`;
/// sections named in `denied` read as `PermissionDenied`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceReport {
    pub basic:          Option<BasicInfo>,
    pub screen:         Option<ScreenInfo>,
    pub canvas:         Option<String>,
    pub webgl:          Option<WebGlReport>,
    pub audio:          Option<Vec<f32>>,
    pub fonts:          Option<FontWidths>,
    pub network:        Option<NetworkInfo>,
    pub sensors:        Option<SensorInfo>,
    pub timezone:       Option<TimezoneInfo>,
    pub timer_samples:  Option<Vec<f64>>,
    pub ad_bait_height: Option<f64>,
    /// false when the storage write threw
    pub storage_ok:     Option<bool>,
    pub do_not_track:   bool,
    pub denied:         Vec<String>,
    /// Section → error message reported by the page
    pub errors:         BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct RecordedProbe {
    report: DeviceReport,
    denied: HashSet<String>,
}

impl RecordedProbe {
    pub fn new(report: DeviceReport) -> Self {
        let denied = report.denied.iter().cloned().collect();
        Self { report, denied }
    }

    pub fn from_json_str(s: &str) -> crate::Result<Self> {
        Ok(Self::new(serde_json::from_str(s)?))
    }

    fn section<T: Clone>(&self, name: &str, value: &Option<T>) -> ProbeResult<T> {
        if self.denied.contains(name) {
            return Err(ProbeError::PermissionDenied);
        }
        if let Some(msg) = self.report.errors.get(name) {
            return Err(ProbeError::Failed(msg.clone()));
        }
        value.clone().ok_or(ProbeError::Unavailable)
    }
}

impl From<DeviceReport> for RecordedProbe {
    fn from(report: DeviceReport) -> Self { Self::new(report) }
}

impl DeviceProbe for RecordedProbe {
    fn basic(&self) -> ProbeResult<BasicInfo>       { self.section("basic", &self.report.basic) }
    fn screen(&self) -> ProbeResult<ScreenInfo>     { self.section("screen", &self.report.screen) }
    fn canvas(&self) -> ProbeResult<String>         { self.section("canvas", &self.report.canvas) }
    fn webgl(&self) -> ProbeResult<WebGlReport>     { self.section("webgl", &self.report.webgl) }
    fn audio(&self) -> ProbeResult<Vec<f32>>        { self.section("audio", &self.report.audio) }
    fn fonts(&self) -> ProbeResult<FontWidths>      { self.section("fonts", &self.report.fonts) }
    fn network(&self) -> ProbeResult<NetworkInfo>   { self.section("network", &self.report.network) }
    fn sensors(&self) -> ProbeResult<SensorInfo>    { self.section("sensors", &self.report.sensors) }
    fn timezone(&self) -> ProbeResult<TimezoneInfo> { self.section("timezone", &self.report.timezone) }

    fn timer_samples(&self) -> ProbeResult<Vec<f64>> {
        self.section("performance", &self.report.timer_samples)
    }

    fn ad_bait_height(&self) -> ProbeResult<f64> {
        self.section("ad_bait", &self.report.ad_bait_height)
    }

    fn storage_write(&self) -> ProbeResult<()> {
        match self.section("storage", &self.report.storage_ok)? {
            true  => Ok(()),
            false => Err(ProbeError::Failed("storage write rejected".into())),
        }
    }

    fn do_not_track(&self) -> ProbeResult<bool> { Ok(self.report.do_not_track) }
}
