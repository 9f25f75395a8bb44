// pulsegate/src/fingerprint/mod.rs
//
// Device fingerprint: one record per collection, replaced whole on refresh.
//
// Sections: basic, screen, graphics, audio, fonts, network, sensors,
// timezone, performance, privacy. A probe failure never aborts collection:
// the section falls back to its default (graphics/audio to a sentinel hash)
// and the failure is listed in `probe_failures`. The risk rules in
// workers::device read the sentinels.

pub mod probe;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::workers::device;

pub use probe::{DeviceProbe, DeviceReport, FontWidths, ProbeError, ProbeResult, RecordedProbe, WebGlReport};

pub const CANVAS_UNAVAILABLE: &str = "canvas-unavailable";
pub const AUDIO_UNAVAILABLE:  &str = "audio-unavailable";
pub const WEBGL_UNAVAILABLE:  &str = "webgl-unavailable";

// ── Sections ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BasicInfo {
    pub user_agent:           String,
    pub platform:             String,
    pub language:             String,
    pub languages:            Vec<String>,
    pub hardware_concurrency: u32,
    pub device_memory_gb:     Option<f64>,
    pub max_touch_points:     u32,
    pub webdriver:            bool,
    pub cookie_enabled:       bool,
    pub plugins:              Vec<String>,
    pub mobile:               bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScreenInfo {
    pub width:        u32,
    pub height:       u32,
    pub avail_width:  u32,
    pub avail_height: u32,
    pub color_depth:  u32,
    pub pixel_ratio:  f64,
    /// Browser window (viewport) size
    pub inner_width:  u32,
    pub inner_height: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphicsInfo {
    pub canvas_hash:      String,
    pub webgl_vendor:     String,
    pub webgl_renderer:   String,
    pub webgl_extensions: Vec<String>,
    pub webgl_hash:       String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AudioInfo {
    pub hash:       String,
    /// Sum of absolute sample values, the classic audio fingerprint scalar
    pub sample_sum: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FontInfo {
    pub available: Vec<String>,
    pub probed:    usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkInfo {
    pub effective_type: Option<String>,
    pub downlink_mbps:  Option<f64>,
    pub rtt_ms:         Option<f64>,
    pub save_data:      bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorInfo {
    pub accelerometer: bool,
    pub gyroscope:     bool,
    pub magnetometer:  bool,
    pub ambient_light: bool,
    pub battery:       bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimezoneInfo {
    /// IANA name, e.g. "Europe/Berlin"
    pub timezone:       String,
    pub offset_minutes: i32,
    pub locale:         String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceInfo {
    /// Smallest observed clock step. 0.0 when not measured.
    pub timer_precision_ms: f64,
    pub timer_samples:      usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrivacyInfo {
    pub ad_block:         bool,
    pub private_browsing: bool,
    pub do_not_track:     bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceFingerprint {
    pub basic:          BasicInfo,
    pub screen:         ScreenInfo,
    pub graphics:       GraphicsInfo,
    pub audio:          AudioInfo,
    pub fonts:          FontInfo,
    pub network:        NetworkInfo,
    pub sensors:        SensorInfo,
    pub timezone:       TimezoneInfo,
    pub performance:    PerformanceInfo,
    pub privacy:        PrivacyInfo,
    pub hash:           String,
    /// 0–100
    pub risk_score:     u8,
    pub risk_factors:   Vec<String>,
    pub probe_failures: Vec<String>,
    pub collected_at:   DateTime<Utc>,
}

// ── Collector ─────────────────────────────────────────────────────────────────

/// Turns probe answers into a scored fingerprint. Remembers the previous
/// hash so a device change between refreshes is logged.
#[derive(Debug, Default)]
pub struct Collector {
    last_hash: Option<String>,
}

impl Collector {
    pub fn new() -> Self { Self::default() }

    pub fn last_hash(&self) -> Option<&str> { self.last_hash.as_deref() }

    pub fn collect(&mut self, probe: &dyn DeviceProbe) -> DeviceFingerprint {
        let mut failures = Vec::new();

        let basic    = probe.basic().unwrap_or_else(|e| degraded(&mut failures, "basic", &e));
        let screen   = probe.screen().unwrap_or_else(|e| degraded(&mut failures, "screen", &e));
        let network  = probe.network().unwrap_or_else(|e| degraded(&mut failures, "network", &e));
        let sensors  = probe.sensors().unwrap_or_else(|e| degraded(&mut failures, "sensors", &e));
        let timezone = probe.timezone().unwrap_or_else(|e| degraded(&mut failures, "timezone", &e));

        let graphics    = collect_graphics(probe, &mut failures);
        let audio       = collect_audio(probe, &mut failures);
        let fonts       = collect_fonts(probe, &mut failures);
        let performance = collect_performance(probe, &mut failures);
        let privacy     = collect_privacy(probe, &mut failures);

        let mut fp = DeviceFingerprint {
            basic, screen, graphics, audio, fonts, network, sensors, timezone, performance, privacy,
            hash:           String::new(),
            risk_score:     0,
            risk_factors:   Vec::new(),
            probe_failures: failures,
            collected_at:   Utc::now(),
        };

        let assessment  = device::assess(&fp);
        fp.risk_score   = assessment.score;
        fp.risk_factors = assessment.factors;
        fp.hash         = device::fingerprint_hash(&fp);

        match self.last_hash.as_deref() {
            Some(prev) if prev != fp.hash => {
                info!(prev = %prev, current = %fp.hash, "device fingerprint changed between refreshes");
            }
            _ => {}
        }
        debug!(hash = %fp.hash, risk = fp.risk_score, factors = fp.risk_factors.len(), "fingerprint collected");
        self.last_hash = Some(fp.hash.clone());
        fp
    }
}

fn degraded<T: Default>(failures: &mut Vec<String>, section: &str, err: &ProbeError) -> T {
    warn!(section, error = %err, "device probe degraded");
    failures.push(format!("{section}-unavailable"));
    T::default()
}

fn collect_graphics(probe: &dyn DeviceProbe, failures: &mut Vec<String>) -> GraphicsInfo {
    let canvas_hash = match probe.canvas() {
        Ok(data) if !data.is_empty() => device::short_digest(data.as_bytes()),
        Ok(_) => {
            failures.push(CANVAS_UNAVAILABLE.into());
            CANVAS_UNAVAILABLE.into()
        }
        Err(e) => {
            warn!(section = "canvas", error = %e, "device probe degraded");
            failures.push(CANVAS_UNAVAILABLE.into());
            CANVAS_UNAVAILABLE.into()
        }
    };

    match probe.webgl() {
        Ok(gl) => GraphicsInfo {
            canvas_hash,
            webgl_hash: if gl.pixels.is_empty() {
                WEBGL_UNAVAILABLE.into()
            } else {
                device::short_digest(gl.pixels.as_bytes())
            },
            webgl_vendor:     gl.vendor,
            webgl_renderer:   gl.renderer,
            webgl_extensions: gl.extensions,
        },
        Err(e) => {
            warn!(section = "webgl", error = %e, "device probe degraded");
            failures.push(WEBGL_UNAVAILABLE.into());
            GraphicsInfo {
                canvas_hash,
                webgl_vendor:     WEBGL_UNAVAILABLE.into(),
                webgl_renderer:   WEBGL_UNAVAILABLE.into(),
                webgl_extensions: Vec::new(),
                webgl_hash:       WEBGL_UNAVAILABLE.into(),
            }
        }
    }
}

fn collect_audio(probe: &dyn DeviceProbe, failures: &mut Vec<String>) -> AudioInfo {
    match probe.audio() {
        Ok(samples) if !samples.is_empty() => {
            let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
            AudioInfo {
                hash:       device::short_digest(&bytes),
                sample_sum: samples.iter().map(|s| s.abs() as f64).sum(),
            }
        }
        other => {
            if let Err(e) = other {
                warn!(section = "audio", error = %e, "device probe degraded");
            }
            failures.push(AUDIO_UNAVAILABLE.into());
            AudioInfo { hash: AUDIO_UNAVAILABLE.into(), sample_sum: 0.0 }
        }
    }
}

/// A font is present iff its measured width differs from the fallback's.
fn collect_fonts(probe: &dyn DeviceProbe, failures: &mut Vec<String>) -> FontInfo {
    match probe.fonts() {
        Ok(fw) => FontInfo {
            available: fw.widths.iter()
                .filter(|(_, w)| (**w - fw.fallback_width).abs() > f64::EPSILON)
                .map(|(name, _)| name.clone())
                .collect(),
            probed: fw.widths.len(),
        },
        Err(e) => degraded(failures, "fonts", &e),
    }
}

fn collect_performance(probe: &dyn DeviceProbe, failures: &mut Vec<String>) -> PerformanceInfo {
    match probe.timer_samples() {
        Ok(samples) => PerformanceInfo {
            timer_precision_ms: samples.windows(2)
                .map(|w| w[1] - w[0])
                .filter(|d| *d > 0.0 && d.is_finite())
                .fold(None, |min: Option<f64>, d| Some(min.map_or(d, |m| m.min(d))))
                .unwrap_or(0.0),
            timer_samples: samples.len(),
        },
        Err(e) => degraded(failures, "performance", &e),
    }
}

fn collect_privacy(probe: &dyn DeviceProbe, failures: &mut Vec<String>) -> PrivacyInfo {
    // Bait element collapsed to zero height → a content blocker removed it.
    let ad_block = match probe.ad_bait_height() {
        Ok(h) => h == 0.0,
        Err(e) => {
            debug!(error = %e, "ad-bait probe skipped");
            false
        }
    };
    let private_browsing = match probe.storage_write() {
        Ok(()) => false,
        Err(ProbeError::Unavailable) => false,
        Err(_) => true,
    };
    let do_not_track = probe.do_not_track().unwrap_or_else(|e| {
        failures.push("do-not-track-unavailable".into());
        debug!(error = %e, "do-not-track probe failed");
        false
    });
    PrivacyInfo { ad_block, private_browsing, do_not_track }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::BTreeMap;

    pub(crate) fn desktop_report() -> DeviceReport {
        DeviceReport {
            basic: Some(BasicInfo {
                user_agent: "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 Chrome/126.0 Safari/537.36".into(),
                platform: "Linux x86_64".into(),
                language: "de-DE".into(),
                languages: vec!["de-DE".into(), "en".into()],
                hardware_concurrency: 8,
                device_memory_gb: Some(8.0),
                cookie_enabled: true,
                plugins: vec!["PDF Viewer".into()],
                ..Default::default()
            }),
            screen: Some(ScreenInfo {
                width: 1920, height: 1080, avail_width: 1920, avail_height: 1050,
                color_depth: 24, pixel_ratio: 1.0, inner_width: 1600, inner_height: 900,
            }),
            canvas: Some("data:image/png;base64,iVBORw0KGgo".into()),
            webgl: Some(WebGlReport {
                vendor: "Google Inc. (Intel)".into(),
                renderer: "ANGLE (Intel, Intel(R) UHD Graphics 620 Direct3D11 vs_5_0 ps_5_0)".into(),
                extensions: (0..25).map(|i| format!("EXT_{i}")).collect(),
                pixels: "00ff00ff".into(),
            }),
            audio: Some(vec![0.1, -0.2, 0.3]),
            fonts: Some(FontWidths {
                fallback_width: 100.0,
                widths: (0..12).map(|i| (format!("Font{i}"), 100.0 + i as f64)).collect::<BTreeMap<_, _>>(),
            }),
            timezone: Some(TimezoneInfo { timezone: "Europe/Berlin".into(), offset_minutes: -120, locale: "de-DE".into() }),
            timer_samples: Some(vec![0.0, 0.1, 0.2, 0.35]),
            ad_bait_height: Some(10.0),
            storage_ok: Some(true),
            ..Default::default()
        }
    }

    #[test]
    fn font_presence_by_width() {
        let mut c = Collector::new();
        let fp = c.collect(&RecordedProbe::new(desktop_report()));
        // Font0 measures exactly the fallback width
        assert_eq!(fp.fonts.probed, 12);
        assert_eq!(fp.fonts.available.len(), 11);
        assert!(!fp.fonts.available.contains(&"Font0".to_string()));
    }

    #[test]
    fn failures_become_sentinels() {
        let mut c = Collector::new();
        let fp = c.collect(&RecordedProbe::new(DeviceReport::default()));
        assert_eq!(fp.graphics.canvas_hash, CANVAS_UNAVAILABLE);
        assert_eq!(fp.graphics.webgl_renderer, WEBGL_UNAVAILABLE);
        assert_eq!(fp.audio.hash, AUDIO_UNAVAILABLE);
        assert!(fp.probe_failures.contains(&"basic-unavailable".to_string()));
        assert!(fp.risk_score > 0);
        assert!(!fp.privacy.private_browsing, "unreported storage is not private mode");
    }

    #[test]
    fn privacy_and_timer_probes() {
        let mut report = desktop_report();
        report.ad_bait_height = Some(0.0);
        report.storage_ok = Some(false);
        let fp = Collector::new().collect(&RecordedProbe::new(report));
        assert!(fp.privacy.ad_block);
        assert!(fp.privacy.private_browsing);
        assert!((fp.performance.timer_precision_ms - 0.1).abs() < 1e-9);
    }

    #[test]
    fn hash_is_stable_across_refreshes() {
        let mut c = Collector::new();
        let a = c.collect(&RecordedProbe::new(desktop_report()));
        let mut report = desktop_report();
        // volatile sections do not move the hash
        report.audio = Some(vec![0.9, 0.9]);
        report.timer_samples = Some(vec![0.0, 5.0]);
        let b = c.collect(&RecordedProbe::new(report));
        assert_eq!(a.hash, b.hash);
        assert_eq!(c.last_hash(), Some(b.hash.as_str()));
    }
}
