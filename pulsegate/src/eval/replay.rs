// pulsegate/src/eval/replay.rs
//
// Drives JSONL session recordings through a SessionRegistry.
//
// Each record is routed to its session by `session_id`. A session scores
// itself on `submit` (trust recomputed, all channels analysed, buffers
// cleared afterwards) and once more in `finish()` if events arrived after
// its last submit. Key targets are attached the first time a session sees
// them, so recordings do not need explicit attach records.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::PulsegateConfig;
use crate::error::Result;
use crate::events::{ChannelScore, GateDecision, InputEvent, RecordPayload, SessionRecord, TrustScore};
use crate::fingerprint::RecordedProbe;
use crate::session::{CaptureSession, SessionRegistry, Subscription};

/// One scored session at a submit boundary.
#[derive(Debug, Clone)]
pub struct SessionVerdict {
    pub session_id: String,
    pub trust:      Arc<TrustScore>,
    pub decision:   GateDecision,
    /// Keystroke, pointer and (once collected) device channel scores
    pub scores:     Vec<ChannelScore>,
    pub label_bot:  Option<bool>,
}

impl SessionVerdict {
    /// 0 = human, 100 = bot.
    pub fn bot_score(&self) -> u8 {
        100u8.saturating_sub(self.trust.overall)
    }
}

pub struct Replayer {
    registry:      SessionRegistry,
    subscriptions: HashMap<(String, String), Subscription>,
    labels:        HashMap<String, bool>,
    pending:       BTreeSet<String>,
    /// Start periodic tasks on every new session (tail mode).
    live:          bool,
    n_records:     usize,
}

impl Replayer {
    pub fn new(config: PulsegateConfig) -> Self {
        Self::with_registry(SessionRegistry::new(config))
    }

    pub fn with_registry(registry: SessionRegistry) -> Self {
        Self {
            registry,
            subscriptions: HashMap::new(),
            labels:        HashMap::new(),
            pending:       BTreeSet::new(),
            live:          false,
            n_records:     0,
        }
    }

    /// Start interval tasks for each session as it appears. Needs a runtime.
    pub fn live(mut self, live: bool) -> Self {
        self.live = live;
        self
    }

    pub fn registry(&self) -> &SessionRegistry { &self.registry }

    pub fn n_records(&self) -> usize { self.n_records }

    pub fn n_sessions(&self) -> usize { self.registry.len() }

    /// Apply one record. Returns a verdict when the record was a submit.
    pub fn apply(&mut self, record: &SessionRecord) -> Result<Option<SessionVerdict>> {
        self.n_records += 1;
        let id = record.session_id.as_str();
        if let Some(label) = record.label_bot {
            self.labels.insert(id.to_string(), label);
        }

        let is_new = self.registry.get(id).is_none();
        let session = self.registry.get_or_create(id);
        if is_new {
            debug!(session = %id, "replay session created");
            if self.live {
                session.start()?;
            }
        }

        match &record.payload {
            RecordPayload::Device(report) => {
                let fp = session.refresh_fingerprint(&RecordedProbe::new((**report).clone()));
                debug!(session = %id, risk = fp.risk_score, "device report applied");
            }
            RecordPayload::Tracking { enabled } => session.set_tracking(*enabled),
            RecordPayload::Submit => {
                self.pending.remove(id);
                let verdict = self.score(&session);
                session.clear();
                return Ok(Some(verdict));
            }
            payload => {
                if let Some(event) = payload.as_input() {
                    self.ensure_attached(&session, &event);
                    session.handle(&event)?;
                }
            }
        }
        self.pending.insert(id.to_string());
        Ok(None)
    }

    /// Score every session with events after its last submit.
    pub fn finish(&mut self) -> Vec<SessionVerdict> {
        let pending = std::mem::take(&mut self.pending);
        let verdicts: Vec<SessionVerdict> = pending.iter()
            .filter_map(|id| self.registry.get(id))
            .map(|s| self.score(&s))
            .collect();
        info!(records = self.n_records, sessions = self.registry.len(), "replay finished");
        verdicts
    }

    fn ensure_attached(&mut self, session: &CaptureSession, event: &InputEvent) {
        let target = match event {
            InputEvent::KeyDown(k) | InputEvent::KeyUp(k) => &k.target,
            _ => return,
        };
        self.subscriptions
            .entry((session.id().to_string(), target.clone()))
            .or_insert_with(|| session.attach(target.clone()));
    }

    fn score(&self, session: &CaptureSession) -> SessionVerdict {
        let trust = session.recompute_trust();
        let scores = session.analyze();
        SessionVerdict {
            session_id: session.id().to_string(),
            decision:   session.decision(),
            trust,
            scores,
            label_bot:  self.labels.get(session.id()).copied(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Channel, KeyEvent};

    fn rec(session: &str, payload: RecordPayload, label: Option<bool>) -> SessionRecord {
        SessionRecord { session_id: session.into(), payload, label_bot: label }
    }

    #[test]
    fn targets_attach_on_first_sight_and_submit_scores() {
        let mut r = Replayer::new(PulsegateConfig::default());
        let mut t = 0.0;
        for k in ["h", "e", "l", "l", "o"] {
            r.apply(&rec("s", RecordPayload::KeyDown(KeyEvent::new("body", k, t)), None)).unwrap();
            r.apply(&rec("s", RecordPayload::KeyUp(KeyEvent::new("body", k, t + 80.0)), None)).unwrap();
            t += 200.0;
        }
        let session = r.registry().get("s").unwrap();
        assert_eq!(session.metrics().total_keystrokes, 5);

        let v = r.apply(&rec("s", RecordPayload::Submit, Some(false))).unwrap().unwrap();
        assert_eq!(v.session_id, "s");
        assert_eq!(v.label_bot, Some(false));
        assert!(v.scores.iter().any(|s| s.channel == Channel::Keystroke));
        // buffers are cleared after submit, nothing left to finish
        assert_eq!(session.metrics().total_keystrokes, 0);
        assert!(r.finish().is_empty());
    }

    #[test]
    fn finish_scores_unsubmitted_sessions() {
        let mut r = Replayer::new(PulsegateConfig::default());
        r.apply(&rec("a", RecordPayload::Tracking { enabled: true }, Some(true))).unwrap();
        r.apply(&rec("b", RecordPayload::Tracking { enabled: true }, None)).unwrap();
        let v = r.finish();
        assert_eq!(v.iter().map(|v| v.session_id.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(v[0].label_bot, Some(true));
        assert_eq!(r.n_records(), 2);
        assert_eq!(r.n_sessions(), 2);
    }
}
