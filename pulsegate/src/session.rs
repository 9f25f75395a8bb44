// pulsegate/src/session.rs
//
// Capture context, one per user session, owned by the caller.
//
//   attach(target) ──► Subscription      keystrokes from attached targets only
//   handle(event)                        synchronous, brief lock
//   start()  ──► analysis    every analysis.interval_secs   (2s)
//            ──► trust       every fusion.interval_secs     (30s)
//            ──► fingerprint every device.refresh_secs      (30s, needs a probe)
//   stop() / drop                        aborts the interval tasks
//
// Every `submit_every` accepted key-downs the timing snapshot is pushed to the
// classifier in a detached task; input capture never waits on it. The trust
// score is swapped whole behind an RwLock so readers see either the previous
// or the next score.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::config::PulsegateConfig;
use crate::engine::classifier::{ClassifierClient, ClassifierPayload, ClassifierVerdict, TransportHandle};
use crate::engine::fusion::{FusionEngine, FusionInputs};
use crate::error::{Error, Result};
use crate::events::{ChannelScore, GateDecision, InputEvent, TrustScore};
use crate::fingerprint::{Collector, DeviceFingerprint, DeviceProbe};
use crate::state::timing::TimingSnapshot;
use crate::workers::{self, keystroke::{KeystrokeAssessment, KeystrokeExtractor, KeystrokeMetrics}};
use crate::workers::pointer::{PointerExtractor, PointerMetrics};

struct CaptureState {
    keys:        KeystrokeExtractor,
    pointer:     PointerExtractor,
    /// target → live subscription count
    attached:    HashMap<String, usize>,
    collector:   Collector,
    probe:       Option<Arc<dyn DeviceProbe>>,
    fingerprint: Option<Arc<DeviceFingerprint>>,
    verdict:     Option<ClassifierVerdict>,
    fusion:      FusionEngine,
    last_scores: Vec<ChannelScore>,
}

struct Shared {
    id:        String,
    config:    PulsegateConfig,
    transport: Option<TransportHandle>,
    state:     Mutex<CaptureState>,
    trust:     RwLock<Arc<TrustScore>>,
    closed:    AtomicBool,
}

impl Shared {
    fn analyze(&self) -> Vec<ChannelScore> {
        let mut st = self.state.lock();
        let scores = workers::run_all(&st.keys, &st.pointer, st.fingerprint.as_deref());
        st.last_scores = scores.clone();
        scores
    }

    fn recompute_trust(&self) -> Arc<TrustScore> {
        let trust = {
            let mut st = self.state.lock();
            let local = workers::run_all(&st.keys, &st.pointer, None);
            let fp = st.fingerprint.clone();
            let verdict = st.verdict;
            let trust = st.fusion.fuse(FusionInputs {
                device:     fp.as_deref(),
                classifier: verdict.as_ref(),
                local:      &local,
            });
            Arc::new(trust)
        };
        *self.trust.write() = trust.clone();
        debug!(session = %self.id, overall = trust.overall, "trust recomputed");
        trust
    }

    fn refresh_fingerprint(&self, probe: &dyn DeviceProbe) -> Arc<DeviceFingerprint> {
        let mut st = self.state.lock();
        let fp = Arc::new(st.collector.collect(probe));
        st.fingerprint = Some(fp.clone());
        fp
    }

    fn refresh_from_stored_probe(&self) -> Option<Arc<DeviceFingerprint>> {
        let probe = self.state.lock().probe.clone()?;
        Some(self.refresh_fingerprint(probe.as_ref()))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::SessionClosed);
        }
        Ok(())
    }
}

pub struct CaptureSession {
    shared: Arc<Shared>,
    tasks:  Mutex<Vec<JoinHandle<()>>>,
}

impl CaptureSession {
    pub fn new(id: impl Into<String>, config: PulsegateConfig) -> Self {
        Self::build(id.into(), config, None)
    }

    pub fn with_transport(id: impl Into<String>, config: PulsegateConfig, transport: TransportHandle) -> Self {
        Self::build(id.into(), config, Some(transport))
    }

    fn build(id: String, config: PulsegateConfig, transport: Option<TransportHandle>) -> Self {
        let state = CaptureState {
            keys:        KeystrokeExtractor::new(config.keystroke.clone()),
            pointer:     PointerExtractor::new(config.pointer.clone()),
            attached:    HashMap::new(),
            collector:   Collector::new(),
            probe:       None,
            fingerprint: None,
            verdict:     None,
            fusion:      FusionEngine::new(config.fusion.clone()),
            last_scores: Vec::new(),
        };
        Self {
            shared: Arc::new(Shared {
                id,
                config,
                transport,
                state:  Mutex::new(state),
                trust:  RwLock::new(Arc::new(TrustScore::neutral())),
                closed: AtomicBool::new(false),
            }),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &str { &self.shared.id }

    pub fn config(&self) -> &PulsegateConfig { &self.shared.config }

    // ── Subscriptions ─────────────────────────────────────────────────────────

    /// Begin capturing keystrokes from `target`. Capture continues until the
    /// returned handle is released or dropped.
    pub fn attach(&self, target: impl Into<String>) -> Subscription {
        let target = target.into();
        *self.shared.state.lock().attached.entry(target.clone()).or_insert(0) += 1;
        info!(session = %self.shared.id, target = %target, "input attached");
        Subscription {
            shared:   Arc::downgrade(&self.shared),
            target,
            released: AtomicBool::new(false),
        }
    }

    pub fn is_attached(&self, target: &str) -> bool {
        self.shared.state.lock().attached.contains_key(target)
    }

    // ── Input ─────────────────────────────────────────────────────────────────

    pub fn set_tracking(&self, enabled: bool) {
        self.shared.state.lock().pointer.trajectory_mut().set_tracking(enabled);
        debug!(session = %self.shared.id, enabled, "pointer tracking toggled");
    }

    /// Feed one raw event. Ok(false) when it was ignored.
    pub fn handle(&self, event: &InputEvent) -> Result<bool> {
        self.shared.ensure_open()?;

        let mut due: Option<TimingSnapshot> = None;
        let accepted = {
            let mut st = self.shared.state.lock();
            match event {
                InputEvent::KeyDown(k) => {
                    if !st.attached.contains_key(&k.target) {
                        return Ok(false);
                    }
                    let ok = st.keys.key_down(k);
                    if ok && st.keys.take_submit_due() {
                        due = Some(st.keys.snapshot());
                    }
                    ok
                }
                InputEvent::KeyUp(k) => {
                    st.attached.contains_key(&k.target) && st.keys.key_up(k)
                }
                InputEvent::PointerMove(p) => st.pointer.trajectory_mut().record_move(*p),
                InputEvent::Click(c) | InputEvent::ContextMenu(c) => {
                    st.pointer.trajectory_mut().record_click(*c)
                }
            }
        };

        if let Some(snapshot) = due {
            self.spawn_push(snapshot);
        }
        Ok(accepted)
    }

    fn spawn_push(&self, snapshot: TimingSnapshot) {
        let Some(transport) = self.shared.transport.clone() else { return };
        let Ok(rt) = Handle::try_current() else {
            debug!(session = %self.shared.id, "no runtime, classifier push skipped");
            return;
        };
        let weak = Arc::downgrade(&self.shared);
        let payload = ClassifierPayload::timing(self.shared.id.clone(), snapshot);

        rt.spawn(async move {
            let client = ClassifierClient::new(transport);
            match client.classify(&payload).await {
                Ok(verdict) => {
                    if let Some(shared) = weak.upgrade() {
                        shared.state.lock().verdict = Some(verdict);
                    }
                }
                Err(e) => error!(session = %payload.session_id, error = %e, "automatic classifier push failed"),
            }
        });
    }

    // ── Reads ─────────────────────────────────────────────────────────────────

    pub fn snapshot(&self) -> TimingSnapshot { self.shared.state.lock().keys.snapshot() }

    pub fn metrics(&self) -> KeystrokeMetrics { self.shared.state.lock().keys.metrics() }

    pub fn keystroke_assessment(&self) -> KeystrokeAssessment { self.shared.state.lock().keys.assess() }

    /// Pointer bot score with component breakdown and flags.
    pub fn pointer_score(&self) -> PointerMetrics { self.shared.state.lock().pointer.metrics() }

    pub fn device_fingerprint(&self) -> Option<Arc<DeviceFingerprint>> {
        self.shared.state.lock().fingerprint.clone()
    }

    pub fn classifier_verdict(&self) -> Option<ClassifierVerdict> { self.shared.state.lock().verdict }

    pub fn trust_score(&self) -> Arc<TrustScore> { self.shared.trust.read().clone() }

    pub fn decision(&self) -> GateDecision {
        self.trust_score().decision(&self.shared.config.fusion.gate)
    }

    /// Channel scores from the latest analysis pass.
    pub fn last_scores(&self) -> Vec<ChannelScore> { self.shared.state.lock().last_scores.clone() }

    /// Reset keystroke and pointer buffers and counters.
    pub fn clear(&self) {
        let mut st = self.shared.state.lock();
        st.keys.clear();
        st.pointer.clear();
        st.last_scores.clear();
        debug!(session = %self.shared.id, "capture buffers cleared");
    }

    // ── Scoring ───────────────────────────────────────────────────────────────

    pub fn analyze(&self) -> Vec<ChannelScore> { self.shared.analyze() }

    pub fn recompute_trust(&self) -> Arc<TrustScore> { self.shared.recompute_trust() }

    /// Collect a fresh fingerprint now. The previous one is replaced.
    pub fn refresh_fingerprint(&self, probe: &dyn DeviceProbe) -> Arc<DeviceFingerprint> {
        self.shared.refresh_fingerprint(probe)
    }

    /// Probe used by the periodic fingerprint refresh.
    pub fn set_probe(&self, probe: Arc<dyn DeviceProbe>) {
        self.shared.state.lock().probe = Some(probe);
    }

    pub fn set_classifier_verdict(&self, verdict: ClassifierVerdict) {
        self.shared.state.lock().verdict = Some(verdict);
    }

    /// Push the current timing buffers to the classifier and wait for the
    /// verdict. Transport errors are returned, not swallowed.
    pub async fn submit_timing(&self) -> Result<ClassifierVerdict> {
        self.shared.ensure_open()?;
        let snapshot = self.snapshot();
        self.submit(ClassifierPayload::timing(self.shared.id.clone(), snapshot)).await
    }

    pub async fn submit_fingerprint(&self) -> Result<ClassifierVerdict> {
        self.shared.ensure_open()?;
        let fp = match self.device_fingerprint() {
            Some(fp) => fp,
            None => self.shared.refresh_from_stored_probe()
                .ok_or_else(|| Error::Config("no device fingerprint or probe available".into()))?,
        };
        self.submit(ClassifierPayload::fingerprint(self.shared.id.clone(), (*fp).clone())).await
    }

    async fn submit(&self, payload: ClassifierPayload) -> Result<ClassifierVerdict> {
        let transport = self.shared.transport.clone()
            .ok_or_else(|| Error::Config("no classifier transport configured".into()))?;
        let verdict = ClassifierClient::new(transport).classify(&payload).await?;
        self.shared.state.lock().verdict = Some(verdict);
        Ok(verdict)
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Spawn the periodic tasks on the current tokio runtime. No-op if running.
    pub fn start(&self) -> Result<()> {
        self.shared.ensure_open()?;
        let rt = Handle::try_current()
            .map_err(|_| Error::Config("capture session start requires a tokio runtime".into()))?;
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return Ok(());
        }
        let cfg = &self.shared.config;

        tasks.extend(spawn_every(&rt, &self.shared, cfg.analysis.interval_secs, |s| {
            let scores = s.analyze();
            debug!(session = %s.id, channels = scores.len(), "analysis pass");
        }));
        tasks.extend(spawn_every(&rt, &self.shared, cfg.fusion.interval_secs, |s| {
            s.recompute_trust();
        }));
        tasks.extend(spawn_every(&rt, &self.shared, cfg.device.refresh_secs, |s| {
            if s.refresh_from_stored_probe().is_none() {
                debug!(session = %s.id, "no device probe, fingerprint refresh skipped");
            }
        }));

        info!(session = %self.shared.id, tasks = tasks.len(), "capture session started");
        Ok(())
    }

    pub fn stop(&self) {
        let mut tasks = self.tasks.lock();
        if tasks.is_empty() {
            return;
        }
        for t in tasks.drain(..) {
            t.abort();
        }
        info!(session = %self.shared.id, "capture session stopped");
    }

    pub fn is_running(&self) -> bool { !self.tasks.lock().is_empty() }

    /// Stop and reject further input.
    pub fn close(&self) {
        self.stop();
        self.shared.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool { self.shared.closed.load(Ordering::Acquire) }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        for t in self.tasks.get_mut().drain(..) {
            t.abort();
        }
    }
}

/// Interval task holding only a weak reference; it ends with the session.
/// A zero period disables the task.
fn spawn_every<F>(rt: &Handle, shared: &Arc<Shared>, secs: u64, tick: F) -> Option<JoinHandle<()>>
where
    F: Fn(&Shared) + Send + 'static,
{
    if secs == 0 {
        return None;
    }
    let weak: Weak<Shared> = Arc::downgrade(shared);
    let period = Duration::from_secs(secs);
    Some(rt.spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let Some(shared) = weak.upgrade() else { break };
            tick(&shared);
        }
    }))
}

// ── Subscription handle ───────────────────────────────────────────────────────

/// Returned by `CaptureSession::attach`. Releasing is idempotent and also
/// happens on drop.
pub struct Subscription {
    shared:   Weak<Shared>,
    target:   String,
    released: AtomicBool,
}

impl Subscription {
    pub fn target(&self) -> &str { &self.target }

    pub fn is_released(&self) -> bool { self.released.load(Ordering::Acquire) }

    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(shared) = self.shared.upgrade() else { return };
        let mut st = shared.state.lock();
        if let Some(n) = st.attached.get_mut(&self.target) {
            *n -= 1;
            if *n == 0 {
                st.attached.remove(&self.target);
            }
        }
        info!(session = %shared.id, target = %self.target, "input released");
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

// ── Registry ──────────────────────────────────────────────────────────────────

/// Many concurrent sessions, one capture context each.
pub struct SessionRegistry {
    sessions:  DashMap<String, Arc<CaptureSession>>,
    config:    PulsegateConfig,
    transport: Option<TransportHandle>,
}

impl SessionRegistry {
    pub fn new(config: PulsegateConfig) -> Self {
        Self { sessions: DashMap::new(), config, transport: None }
    }

    pub fn with_transport(config: PulsegateConfig, transport: TransportHandle) -> Self {
        Self { sessions: DashMap::new(), config, transport: Some(transport) }
    }

    pub fn get_or_create(&self, id: &str) -> Arc<CaptureSession> {
        self.sessions.entry(id.to_string())
            .or_insert_with(|| {
                let config = self.config.clone();
                Arc::new(match &self.transport {
                    Some(t) => CaptureSession::with_transport(id, config, t.clone()),
                    None    => CaptureSession::new(id, config),
                })
            })
            .clone()
    }

    pub fn get(&self, id: &str) -> Option<Arc<CaptureSession>> {
        self.sessions.get(id).map(|s| s.clone())
    }

    /// Remove and close a session.
    pub fn remove(&self, id: &str) -> Option<Arc<CaptureSession>> {
        let (_, session) = self.sessions.remove(id)?;
        session.close();
        Some(session)
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn sessions(&self) -> Vec<Arc<CaptureSession>> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize { self.sessions.len() }
    pub fn is_empty(&self) -> bool { self.sessions.is_empty() }
}
