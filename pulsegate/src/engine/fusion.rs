// pulsegate/src/engine/fusion.rs
//
// Trust fusion: three components, 0–100 each, higher = more trustworthy.
//
//   device         0.50  100 − fingerprint risk, +5 rich fonts (≥30),
//                        +5 rich WebGL (≥20 extensions), −10 hidden plugins
//   bot_detection  0.40  classifier (1 − p)·100 blended with local
//                        keystroke/pointer trust (remote_weight = 0.6)
//   consistency    0.10  100 − 5·stddev over the last N overall scores
//
// A component that cannot be computed sits at 50 and leaves a factor string
// behind. The engine owns only derived scores and its history ring.

use chrono::Utc;
use tracing::debug;

use crate::config::FusionConfig;
use crate::engine::classifier::ClassifierVerdict;
use crate::events::{Channel, ChannelScore, TrustComponents, TrustScore};
use crate::fingerprint::DeviceFingerprint;
use crate::state::ring::Ring;
use crate::stats::{clamp_finite, mean, std_dev};

const NEUTRAL: f64 = 50.0;
const RICH_FONTS: usize = 30;
const RICH_WEBGL_EXTENSIONS: usize = 20;
// local channel evidence is surfaced from this bot score upward
const EVIDENCE_FLOOR: u8 = 25;

/// Everything one fusion cycle reads.
#[derive(Debug, Clone, Copy, Default)]
pub struct FusionInputs<'a> {
    pub device:     Option<&'a DeviceFingerprint>,
    pub classifier: Option<&'a ClassifierVerdict>,
    /// Keystroke / pointer channel scores
    pub local:      &'a [ChannelScore],
}

#[derive(Debug, Clone)]
pub struct FusionEngine {
    config:  FusionConfig,
    history: Ring<f64>,
}

impl FusionEngine {
    pub fn new(config: FusionConfig) -> Self {
        let history = Ring::new(config.history_len);
        Self { config, history }
    }

    pub fn history(&self) -> Vec<f64> { self.history.to_vec() }

    pub fn reset_history(&mut self) { self.history.clear(); }

    pub fn fuse(&mut self, inputs: FusionInputs<'_>) -> TrustScore {
        let mut factors = Vec::new();

        let device = self.device_trust(inputs.device, &mut factors);
        let bot    = self.bot_detection_trust(inputs.classifier, inputs.local, &mut factors);
        let cons   = self.consistency(&mut factors);

        let device = finite_or_neutral(device, "device", &mut factors);
        let bot    = finite_or_neutral(bot, "bot-detection", &mut factors);
        let cons   = finite_or_neutral(cons, "consistency", &mut factors);

        let w = &self.config.weights;
        let overall = finite_or_neutral(
            w.device * device + w.bot_detection * bot + w.consistency * cons,
            "overall",
            &mut factors,
        );
        let overall = clamp_finite(overall, 0.0, 100.0);
        self.history.push(overall);

        debug!(overall, device, bot, cons, history = self.history.len(), "trust fused");

        TrustScore {
            overall: overall.round() as u8,
            components: TrustComponents {
                device:        device.round() as u8,
                bot_detection: bot.round() as u8,
                consistency:   cons.round() as u8,
            },
            risk_factors: factors,
            last_updated: Utc::now(),
        }
    }

    fn device_trust(&self, fp: Option<&DeviceFingerprint>, factors: &mut Vec<String>) -> f64 {
        let Some(fp) = fp else {
            factors.push("device-fingerprint-unavailable".into());
            return NEUTRAL;
        };
        let mut trust = 100.0 - fp.risk_score as f64;
        if fp.fonts.available.len() >= RICH_FONTS {
            trust += 5.0;
        }
        if fp.graphics.webgl_extensions.len() >= RICH_WEBGL_EXTENSIONS {
            trust += 5.0;
        }
        if fp.basic.plugins.is_empty() && !fp.basic.mobile {
            trust -= 10.0;
            factors.push("device: plugins hidden on desktop".into());
        }
        factors.extend(fp.risk_factors.iter().map(|f| format!("device: {f}")));
        clamp_finite(trust, 0.0, 100.0)
    }

    fn bot_detection_trust(
        &self,
        verdict: Option<&ClassifierVerdict>,
        local:   &[ChannelScore],
        factors: &mut Vec<String>,
    ) -> f64 {
        let remote = verdict.map(|v| {
            if v.is_bot {
                factors.push(format!("classifier: bot probability {:.2}", v.probability));
            }
            (1.0 - v.probability) * 100.0
        });

        let informative: Vec<&ChannelScore> = local.iter()
            .filter(|s| matches!(s.channel, Channel::Keystroke | Channel::Pointer) && s.is_informative())
            .collect();
        for s in &informative {
            if s.score >= EVIDENCE_FLOOR {
                factors.extend(s.evidence.iter().map(|e| format!("{}: {e}", s.channel)));
            }
        }
        let local_trust = if informative.is_empty() {
            None
        } else {
            let scores: Vec<f64> = informative.iter().map(|s| s.score as f64).collect();
            Some(100.0 - mean(&scores))
        };

        match (remote, local_trust) {
            (Some(r), Some(l)) => {
                let rw = self.config.remote_weight;
                rw * r + (1.0 - rw) * l
            }
            (Some(r), None) => r,
            (None, Some(l)) => l,
            (None, None) => {
                factors.push("bot-detection-unavailable".into());
                NEUTRAL
            }
        }
    }

    fn consistency(&self, factors: &mut Vec<String>) -> f64 {
        let past = self.history.to_vec();
        if past.len() < 2 {
            return NEUTRAL;
        }
        let sd = std_dev(&past);
        if sd > 10.0 {
            factors.push(format!("trust unstable across cycles (sd {sd:.1})"));
        }
        clamp_finite(100.0 - 5.0 * sd, 0.0, 100.0)
    }
}

fn finite_or_neutral(v: f64, component: &str, factors: &mut Vec<String>) -> f64 {
    if v.is_finite() {
        v
    } else {
        factors.push(format!("{component}-score-invalid"));
        NEUTRAL
    }
}
