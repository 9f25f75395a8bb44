// pulsegate/src/eval/mod.rs
//
// Labelled-recording evaluation harness.
//
//   1. Loads a JSONL recording of SessionRecord lines with `label_bot` set
//   2. Replays every record through full capture sessions (see replay.rs)
//   3. Scores each session at its submit boundaries and at end of file
//   4. Computes global and per-channel precision / recall / F1 / FPR
//   5. Prints a markdown or JSON report (report.rs)
//
// A session is labelled by the last `label_bot` any of its records carried;
// unlabelled sessions are replayed but left out of the metrics.
//
// Prediction rules:
//   global   bot when trust.overall < threshold  (default: gate challenge_below)
//   channel  bot when that channel's score >= CHANNEL_FLOOR
//
// Run:
//   pulsegate --mode eval --path labelled.jsonl
//   pulsegate --mode eval --path labelled.jsonl --threshold 50 --format json

pub mod replay;
pub mod report;

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;
use tracing::{info, warn};

use crate::config::PulsegateConfig;
use crate::error::Result;
use crate::events::{RiskTier, SessionRecord};

pub use replay::{Replayer, SessionVerdict};

/// Channel bot score from which a channel counts as having fired.
pub const CHANNEL_FLOOR: u8 = 50;
const HISTOGRAM_BINS: usize = 20;

// ── Confusion matrix ──────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChannelMetrics {
    pub tp:  u64,
    pub fp:  u64,
    pub tn:  u64,
    pub fn_: u64,
}

impl ChannelMetrics {
    pub fn record(&mut self, predicted_bot: bool, is_bot: bool) {
        match (predicted_bot, is_bot) {
            (true,  true)  => self.tp  += 1,
            (true,  false) => self.fp  += 1,
            (false, true)  => self.fn_ += 1,
            (false, false) => self.tn  += 1,
        }
    }

    pub fn total(&self) -> u64 { self.tp + self.fp + self.tn + self.fn_ }

    pub fn precision(&self) -> f64 {
        let denom = self.tp + self.fp;
        if denom == 0 { 1.0 } else { self.tp as f64 / denom as f64 }
    }

    pub fn recall(&self) -> f64 {
        let denom = self.tp + self.fn_;
        if denom == 0 { 0.0 } else { self.tp as f64 / denom as f64 }
    }

    pub fn f1(&self) -> f64 {
        let p = self.precision();
        let r = self.recall();
        if p + r == 0.0 { 0.0 } else { 2.0 * p * r / (p + r) }
    }

    pub fn fpr(&self) -> f64 {
        let denom = self.fp + self.tn;
        if denom == 0 { 0.0 } else { self.fp as f64 / denom as f64 }
    }
}

// ── Aggregate result ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct EvalResult {
    pub n_records:       usize,
    pub n_sessions:      usize,
    /// Scored verdicts that carried a label
    pub n_scored:        usize,
    pub n_positive:      usize,
    pub n_negative:      usize,
    pub n_unlabelled:    usize,
    /// Trust below this counts as a bot prediction
    pub threshold:       u8,
    pub global:          ChannelMetrics,
    pub per_channel:     BTreeMap<String, ChannelMetrics>,
    pub tier_counts:     BTreeMap<String, u64>,
    /// (bot score bin lower bound, count), 5 points wide
    pub score_histogram: Vec<(u8, usize)>,
    /// (bot score, is_bot) per labelled verdict
    pub outcomes:        Vec<(u8, bool)>,
}

// ── Evaluator ─────────────────────────────────────────────────────────────────

pub struct Evaluator {
    config:    PulsegateConfig,
    threshold: u8,
}

impl Evaluator {
    pub fn new(config: PulsegateConfig) -> Self {
        let threshold = config.fusion.gate.challenge_below;
        Self { config, threshold }
    }

    pub fn with_threshold(mut self, threshold: u8) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn threshold(&self) -> u8 { self.threshold }

    pub async fn run_dataset(&self, path: &Path) -> Result<EvalResult> {
        let content = tokio::fs::read_to_string(path).await?;
        let mut records: Vec<SessionRecord> = Vec::new();

        for (n, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() { continue; }
            match serde_json::from_str::<SessionRecord>(line) {
                Ok(rec) => records.push(rec),
                Err(e) => warn!(line = n + 1, error = %e, "eval dataset parse error"),
            }
        }

        info!(records = records.len(), path = %path.display(), "eval dataset loaded");
        self.evaluate(&records)
    }

    pub fn evaluate(&self, records: &[SessionRecord]) -> Result<EvalResult> {
        let mut replayer = Replayer::new(self.config.clone());
        let mut verdicts = Vec::new();
        for rec in records {
            if let Some(v) = replayer.apply(rec)? {
                verdicts.push(v);
            }
        }
        verdicts.extend(replayer.finish());

        let mut global      = ChannelMetrics::default();
        let mut per_channel: BTreeMap<String, ChannelMetrics> = BTreeMap::new();
        let mut tier_counts: BTreeMap<String, u64> = BTreeMap::new();
        let mut score_bins  = vec![0usize; HISTOGRAM_BINS];
        let mut outcomes    = Vec::new();
        let mut n_unlabelled = 0;

        for v in &verdicts {
            let Some(is_bot) = v.label_bot else {
                n_unlabelled += 1;
                continue;
            };

            for s in &v.scores {
                per_channel.entry(s.channel.to_string())
                    .or_default()
                    .record(s.score >= CHANNEL_FLOOR, is_bot);
            }
            global.record(v.trust.overall < self.threshold, is_bot);

            let bot = v.bot_score();
            let bin = (bot as usize / 5).min(HISTOGRAM_BINS - 1);
            score_bins[bin] += 1;
            *tier_counts.entry(RiskTier::from_bot_score(bot).to_string()).or_default() += 1;
            outcomes.push((bot, is_bot));
        }

        let n_positive = outcomes.iter().filter(|(_, b)| *b).count();
        let score_histogram = score_bins.iter().enumerate()
            .map(|(i, &c)| ((i * 5) as u8, c))
            .collect();

        Ok(EvalResult {
            n_records:    replayer.n_records(),
            n_sessions:   replayer.n_sessions(),
            n_scored:     outcomes.len(),
            n_positive,
            n_negative:   outcomes.len() - n_positive,
            n_unlabelled,
            threshold:    self.threshold,
            global,
            per_channel,
            tier_counts,
            score_histogram,
            outcomes,
        })
    }
}
