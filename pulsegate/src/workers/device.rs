// pulsegate/src/workers/device.rs
//
// Device worker: additive risk rules over a collected fingerprint, plus the
// session-stable fingerprint hash.
//
// Rule table (points, each rule fires at most once):
//   automation UA      headless +50 · framework +45 · crawler +40
//   navigator.webdriver                                     +40
//   software renderer  swiftshader/llvmpipe +30 · mesa +25
//   single core on a non-mobile device                      +20
//   fonts              <3 +30 · <10 +15
//   canvas / audio / WebGL unavailable                      +25 / +20 / +15
//   timezone region ≠ language region                       +15
//   bare UTC timezone                                       +10
//   screen 0×0 or smaller than the window                   +15
//   no languages                                            +15
//   coarse timer · private browsing                         +5 each
// Capped at 100.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use aho_corasick::{AhoCorasick, AhoCorasickBuilder, MatchKind};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::error;

use crate::events::{Channel, ChannelScore};
use crate::fingerprint::{DeviceFingerprint, AUDIO_UNAVAILABLE, CANVAS_UNAVAILABLE, WEBGL_UNAVAILABLE};

// (pattern, group). Groups score independently; order = reporting order.
const UA_PATTERNS: &[(&str, usize)] = &[
    ("headlesschrome", 0),
    ("phantomjs",      0),
    ("selenium",       1),
    ("webdriver",      1),
    ("puppeteer",      1),
    ("playwright",     1),
    ("crawler",        2),
    ("spider",         2),
    ("bot",            2),
];

const UA_GROUPS: &[(u32, &str)] = &[
    (50, "headless browser user agent"),
    (45, "automation framework in user agent"),
    (40, "crawler user agent"),
];

// IANA zone → ISO regions whose languages are plausible there
const TZ_REGIONS: &[(&str, &[&str])] = &[
    ("America/New_York",    &["US", "CA"]),
    ("America/Chicago",     &["US", "CA", "MX"]),
    ("America/Denver",      &["US", "CA"]),
    ("America/Los_Angeles", &["US", "CA", "MX"]),
    ("America/Sao_Paulo",   &["BR"]),
    ("America/Mexico_City", &["MX", "US"]),
    ("Europe/London",       &["GB", "IE"]),
    ("Europe/Berlin",       &["DE", "AT", "CH"]),
    ("Europe/Paris",        &["FR", "BE", "CH"]),
    ("Europe/Madrid",       &["ES"]),
    ("Europe/Rome",         &["IT"]),
    ("Europe/Moscow",       &["RU", "BY"]),
    ("Asia/Tokyo",          &["JP"]),
    ("Asia/Shanghai",       &["CN"]),
    ("Asia/Kolkata",        &["IN"]),
    ("Asia/Seoul",          &["KR"]),
    ("Australia/Sydney",    &["AU"]),
];

const UTC_ZONES: &[&str] = &["UTC", "Etc/UTC", "Etc/GMT", "GMT"];

const COARSE_TIMER_MS: f64 = 1.0;

static UA_AC: OnceLock<Option<AhoCorasick>> = OnceLock::new();

fn ua_automaton() -> Option<&'static AhoCorasick> {
    UA_AC.get_or_init(|| {
        let patterns: Vec<&str> = UA_PATTERNS.iter().map(|(p, _)| *p).collect();
        match AhoCorasickBuilder::new()
            .ascii_case_insensitive(true)
            .match_kind(MatchKind::LeftmostFirst)
            .build(&patterns)
        {
            Ok(ac) => Some(ac),
            Err(e) => {
                error!(error = %e, "user-agent automaton build failed");
                None
            }
        }
    })
    .as_ref()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceAssessment {
    /// 0–100 risk
    pub score:   u8,
    pub factors: Vec<String>,
}

pub fn assess(fp: &DeviceFingerprint) -> DeviceAssessment {
    let mut score: u32 = 0;
    let mut factors = Vec::new();
    let mut hit = |points: u32, factor: String| {
        score += points;
        factors.push(factor);
    };

    // ── Automation ────────────────────────────────────────────────────────────
    if let Some(ac) = ua_automaton() {
        let mut groups = [false; 3];
        for m in ac.find_iter(&fp.basic.user_agent) {
            groups[UA_PATTERNS[m.pattern().as_usize()].1] = true;
        }
        for (g, &(points, label)) in UA_GROUPS.iter().enumerate() {
            if groups[g] {
                hit(points, label.to_string());
            }
        }
    }
    if fp.basic.webdriver {
        hit(40, "webdriver property present".into());
    }

    // ── Graphics ──────────────────────────────────────────────────────────────
    let gl = format!("{} {}", fp.graphics.webgl_vendor, fp.graphics.webgl_renderer).to_lowercase();
    if gl.contains("swiftshader") || gl.contains("llvmpipe") {
        hit(30, "software renderer".into());
    } else if gl.contains("mesa") {
        hit(25, "mesa software renderer".into());
    }

    // ── Hardware ──────────────────────────────────────────────────────────────
    if fp.basic.hardware_concurrency == 1 && !fp.basic.mobile {
        hit(20, "single-core desktop".into());
    }

    let n_fonts = fp.fonts.available.len();
    if n_fonts < 3 {
        hit(30, format!("very few fonts ({n_fonts})"));
    } else if n_fonts < 10 {
        hit(15, format!("few fonts ({n_fonts})"));
    }

    if fp.graphics.canvas_hash == CANVAS_UNAVAILABLE {
        hit(25, "canvas unavailable".into());
    }
    if fp.audio.hash == AUDIO_UNAVAILABLE {
        hit(20, "audio unavailable".into());
    }
    if fp.graphics.webgl_hash == WEBGL_UNAVAILABLE {
        hit(15, "webgl unavailable".into());
    }

    // ── Locale ────────────────────────────────────────────────────────────────
    let tz = fp.timezone.timezone.as_str();
    if let (Some(region), Some(allowed)) = (language_region(&fp.basic.language), tz_regions(tz)) {
        if !allowed.contains(&region.as_str()) {
            hit(15, format!("timezone {tz} inconsistent with language region {region}"));
        }
    }
    if UTC_ZONES.contains(&tz) {
        hit(10, "generic UTC timezone".into());
    }
    if fp.basic.languages.is_empty() {
        hit(15, "no languages".into());
    }

    // ── Screen ────────────────────────────────────────────────────────────────
    let s = &fp.screen;
    if s.width == 0 || s.height == 0 {
        hit(15, "zero screen dimensions".into());
    } else if s.inner_width > s.width || s.inner_height > s.height {
        hit(15, "window larger than screen".into());
    }

    // ── Privacy / timing ──────────────────────────────────────────────────────
    if fp.performance.timer_precision_ms >= COARSE_TIMER_MS {
        hit(5, format!("coarse timer precision ({:.1}ms)", fp.performance.timer_precision_ms));
    }
    if fp.privacy.private_browsing {
        hit(5, "private browsing".into());
    }

    DeviceAssessment { score: score.min(100) as u8, factors }
}

/// "de-DE" → "DE", "zh-Hans-CN" → "CN". None for a bare language ("de").
fn language_region(lang: &str) -> Option<String> {
    lang.split(['-', '_'])
        .skip(1)
        .filter(|t| t.len() == 2 && t.chars().all(|c| c.is_ascii_alphabetic()))
        .last()
        .map(|r| r.to_ascii_uppercase())
}

fn tz_regions(tz: &str) -> Option<&'static [&'static str]> {
    TZ_REGIONS.iter().find(|(z, _)| *z == tz).map(|(_, r)| *r)
}

/// First 8 bytes of SHA-256, hex.
pub fn short_digest(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    hex::encode(&digest[..8])
}

/// Stable identifier over the non-volatile sections. Audio, network,
/// performance and privacy are excluded; field order does not matter.
pub fn fingerprint_hash(fp: &DeviceFingerprint) -> String {
    let b = &fp.basic;
    let s = &fp.screen;
    let g = &fp.graphics;
    let t = &fp.timezone;
    let mut fields: BTreeMap<&str, String> = BTreeMap::new();

    fields.insert("ua",        b.user_agent.clone());
    fields.insert("platform",  b.platform.clone());
    fields.insert("language",  b.language.clone());
    fields.insert("languages", b.languages.join(","));
    fields.insert("cores",     b.hardware_concurrency.to_string());
    fields.insert("memory",    b.device_memory_gb.map(|m| m.to_string()).unwrap_or_default());
    fields.insert("touch",     b.max_touch_points.to_string());
    fields.insert("plugins",   b.plugins.join(","));
    fields.insert("screen",    format!("{}x{}x{}@{}", s.width, s.height, s.color_depth, s.pixel_ratio));
    fields.insert("canvas",    g.canvas_hash.clone());
    fields.insert("gl_vendor", g.webgl_vendor.clone());
    fields.insert("gl_render", g.webgl_renderer.clone());
    fields.insert("gl_hash",   g.webgl_hash.clone());
    fields.insert("fonts",     fp.fonts.available.join(","));
    fields.insert("tz",        format!("{}{:+}", t.timezone, t.offset_minutes));
    fields.insert("locale",    t.locale.clone());
    fields.insert("sensors",   format!(
        "{}{}{}{}{}",
        fp.sensors.accelerometer as u8, fp.sensors.gyroscope as u8, fp.sensors.magnetometer as u8,
        fp.sensors.ambient_light as u8, fp.sensors.battery as u8,
    ));

    let joined: Vec<String> = fields.iter().map(|(k, v)| format!("{k}={v}")).collect();
    short_digest(joined.join(";").as_bytes())
}

pub fn channel_score(fp: &DeviceFingerprint) -> ChannelScore {
    let failed = fp.probe_failures.len() as f32;
    ChannelScore {
        channel:    Channel::Device,
        score:      fp.risk_score,
        confidence: (1.0 - failed / 12.0).clamp(0.1, 1.0),
        evidence:   fp.risk_factors.clone(),
        meta: [
            ("hash".into(),     json!(fp.hash)),
            ("fonts".into(),    json!(fp.fonts.available.len())),
            ("failures".into(), json!(fp.probe_failures)),
        ].into_iter().collect(),
        timestamp: Utc::now(),
    }
}
