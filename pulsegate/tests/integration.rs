// pulsegate/tests/integration.rs
//
// End-to-end behaviour through the public API: buffer bounds, timing
// pairing, burst gating, pointer scenarios, score bounds under adversarial
// input, configuration loading, session lifecycle and the eval harness.

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use pulsegate::config::KeystrokeConfig;
use pulsegate::engine::{ClassifierPayload, Transport};
use pulsegate::eval::Evaluator;
use pulsegate::events::{RecordPayload, SessionRecord};
use pulsegate::fingerprint::{BasicInfo, DeviceReport};
use pulsegate::workers::keystroke::{KeystrokeExtractor, KeystrokeMetrics};
use pulsegate::workers::pointer::{combined_score, PointerComponents};
use pulsegate::{
    CaptureSession, ClickSample, Error, InputEvent, KeyEvent, MouseButton, PointerSample,
    PulsegateConfig, RecordedProbe,
};

// ── Helpers ───────────────────────────────────────────────────────────────────

fn press(x: &mut KeystrokeExtractor, key: &str, down: f64, up: f64) {
    assert!(x.key_down(&KeyEvent::new("f", key, down)));
    assert!(x.key_up(&KeyEvent::new("f", key, up)));
}

fn session_press(s: &CaptureSession, key: &str, down: f64, up: f64) {
    s.handle(&InputEvent::KeyDown(KeyEvent::new("f", key, down))).unwrap();
    s.handle(&InputEvent::KeyUp(KeyEvent::new("f", key, up))).unwrap();
}

/// Type `n` keys cycling through `keys` with fixed dwell and flight.
fn type_uniform(s: &CaptureSession, keys: &[&str], n: usize, dwell: f64, flight: f64) {
    let mut t = 0.0;
    for i in 0..n {
        session_press(s, keys[i % keys.len()], t, t + dwell);
        t += dwell + flight;
    }
}

fn line(n: usize, step_px: f64, step_ms: f64) -> Vec<PointerSample> {
    (0..n).map(|i| PointerSample::new(i as f64 * step_px, 100.0, i as f64 * step_ms)).collect()
}

fn ngrams_after_gap(config: KeystrokeConfig, gap: f64) -> usize {
    let mut x = KeystrokeExtractor::new(config);
    press(&mut x, "a", 0.0, 50.0);
    x.key_down(&KeyEvent::new("f", "b", gap));
    x.snapshot().ngram.values().map(|v| v.len()).sum()
}

/// Deterministic adversarial input source.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        self.0 >> 33
    }

    fn unit(&mut self) -> f64 {
        self.next() as f64 / (1u64 << 31) as f64
    }
}

struct Scripted {
    calls: AtomicUsize,
    reply: Result<&'static str, u16>,
}

impl Scripted {
    fn new(reply: Result<&'static str, u16>) -> Arc<Self> {
        Arc::new(Self { calls: AtomicUsize::new(0), reply })
    }
}

#[async_trait]
impl Transport for Scripted {
    async fn submit(&self, _payload: &ClassifierPayload) -> pulsegate::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.reply {
            Ok(body) => Ok(body.to_string()),
            Err(status) => Err(Error::transport_status(status, "classifier unavailable")),
        }
    }
}

// ── Keystroke timing ──────────────────────────────────────────────────────────

#[test]
fn buffers_stay_bounded_and_keep_most_recent() {
    let mut x = KeystrokeExtractor::new(KeystrokeConfig::default());
    let mut t = 0.0;
    for i in 0..120 {
        let dwell = 10.0 + i as f64;
        press(&mut x, "a", t, t + dwell);
        t += dwell + 100.0;
    }
    let snap = x.snapshot();

    let dwell = &snap.dwell["<a>"];
    assert_eq!(dwell, &(70..120).map(|i| 10.0 + i as f64).collect::<Vec<_>>());
    assert_eq!(snap.flight["<a><a>"].len(), 50);

    let total: usize = snap.ngram.values().map(|v| v.len()).sum();
    assert_eq!(total, 50);
    // gap before key-down k is dwell(k-1) + 100; the last ten presses remain
    assert_eq!(snap.ngram["<a>-><a>"], (219..=228).map(|g| g as f64).collect::<Vec<_>>());
}

#[test]
fn dwell_and_flight_pairing() {
    let mut x = KeystrokeExtractor::new(KeystrokeConfig::default());
    x.key_down(&KeyEvent::new("f", "a", 0.0));
    x.key_up(&KeyEvent::new("f", "a", 95.0));
    x.key_down(&KeyEvent::new("f", "b", 140.0));
    x.key_down(&KeyEvent::new("f", "C", 180.0)); // overlapping press
    x.key_up(&KeyEvent::new("f", "b", 230.0));
    x.key_up(&KeyEvent::new("f", "c", 300.0));
    x.key_down(&KeyEvent::new("f", "d", 420.0));

    let snap = x.snapshot();
    assert_eq!(snap.dwell["<a>"], vec![95.0]);
    assert_eq!(snap.dwell["<b>"], vec![90.0]);
    assert_eq!(snap.dwell["<c>"], vec![120.0]);
    assert_eq!(snap.flight["<a><b>"], vec![45.0]);
    assert_eq!(snap.flight["<a><c>"], vec![85.0]);
    assert_eq!(snap.flight["<c><d>"], vec![120.0]);
    assert_eq!(snap.flight.len(), 3);
}

#[test]
fn ngram_gate_boundaries() {
    let cfg = KeystrokeConfig::default();
    assert_eq!(ngrams_after_gap(cfg.clone(), 999.0), 1);
    assert_eq!(ngrams_after_gap(cfg.clone(), 1000.0), 0);
    assert_eq!(ngrams_after_gap(cfg.clone(), 1499.0), 0);
    assert_eq!(ngrams_after_gap(cfg.clone(), 1500.0), 0);

    // burst gate opened past the hard cap: the cap alone decides
    let wide = KeystrokeConfig { burst_gap_ms: 2000.0, ..cfg };
    assert_eq!(ngrams_after_gap(wide.clone(), 1499.0), 1);
    assert_eq!(ngrams_after_gap(wide.clone(), 1500.0), 1);
    assert_eq!(ngrams_after_gap(wide, 1501.0), 0);
}

#[test]
fn broken_burst_leaves_no_spanning_ngram() {
    let mut x = KeystrokeExtractor::new(KeystrokeConfig::default());
    press(&mut x, "a", 0.0, 50.0);
    press(&mut x, "b", 1200.0, 1260.0);
    press(&mut x, "c", 1300.0, 1360.0);
    let keys: Vec<String> = x.snapshot().ngram.keys().cloned().collect();
    assert_eq!(keys, vec!["<b>-><c>".to_string()]);
}

#[test]
fn uniform_bot_typing_scores_high() {
    let s = CaptureSession::new("bot", PulsegateConfig::default());
    let _sub = s.attach("f");
    type_uniform(&s, &["t", "h", "e", "q", "u"], 30, 50.0, 60.0);

    let a = s.keystroke_assessment();
    assert!(a.score >= 65, "score {}", a.score);
    for flag in [
        "extremely consistent dwell times",
        "unrealistically fast typing",
        "highly consistent flight times",
    ] {
        assert!(a.flags.iter().any(|f| f == flag), "missing {flag}: {:?}", a.flags);
    }
}

// ── Pointer ───────────────────────────────────────────────────────────────────

#[test]
fn straight_sweep_through_session() {
    let s = CaptureSession::new("p", PulsegateConfig::default());
    for p in line(20, 10.0, 16.0) {
        assert!(s.handle(&InputEvent::PointerMove(p)).unwrap());
    }
    let first = s.pointer_score();
    assert!(first.components.straightness > 0.9);
    assert!(first.components.velocity_consistency > 0.8);
    // unchanged buffer, identical result
    assert_eq!(s.pointer_score(), first);
}

#[test]
fn single_large_jump_is_critical() {
    let s = CaptureSession::new("p", PulsegateConfig::default());
    let mut samples = line(20, 10.0, 16.0);
    let last = samples[samples.len() - 1];
    samples.push(PointerSample::new(last.x + 800.0, last.y, last.timestamp_ms + 10.0));
    for p in samples {
        s.handle(&InputEvent::PointerMove(p)).unwrap();
    }

    let m = s.pointer_score();
    assert_eq!(m.components.critical_jumps, 1);
    assert!(m.teleport_events.iter().any(|e| e.distance == 800.0 && e.time_delta == 10.0));
    assert!(m.flags.iter().any(|f| f.starts_with("critical_teleport")), "{:?}", m.flags);

    let calm = PointerComponents { teleportation: 0.0, critical_jumps: 0, ..m.components };
    let (without, _) = combined_score(&calm, s.config().pointer.mode);
    assert!(m.bot_score > without, "{} <= {}", m.bot_score, without);
}

#[test]
fn clear_resets_everything() {
    let s = CaptureSession::new("c", PulsegateConfig::default());
    let _sub = s.attach("f");
    type_uniform(&s, &["a", "b"], 12, 70.0, 90.0);
    for p in line(15, 12.0, 16.0) {
        s.handle(&InputEvent::PointerMove(p)).unwrap();
    }
    s.handle(&InputEvent::Click(ClickSample::new(5.0, 5.0, 300.0, MouseButton::Left))).unwrap();
    assert!(!s.snapshot().is_empty());

    s.clear();
    assert_eq!(s.metrics(), KeystrokeMetrics::default());
    let snap = s.snapshot();
    assert!(snap.dwell.is_empty() && snap.flight.is_empty() && snap.ngram.is_empty());
    let p = s.pointer_score();
    assert_eq!((p.samples, p.clicks, p.bot_score), (0, 0, 0));
    assert_eq!(s.keystroke_assessment().score, 0);
}

// ── Score bounds ──────────────────────────────────────────────────────────────

#[test]
fn scores_stay_in_bounds_under_adversarial_input() {
    let keys = ["a", "b", "Enter", " ", "Shift", ""];
    for seed in 1..=8u64 {
        let mut rng = Lcg(seed);
        let s = CaptureSession::new(format!("adv-{seed}"), PulsegateConfig::default());
        let _sub = s.attach("f");
        let mut t = 0.0;

        for _ in 0..1500 {
            // mostly forward, sometimes backwards or far ahead
            t += match rng.next() % 10 {
                0 => -(rng.unit() * 500.0),
                1 => rng.unit() * 20_000.0,
                _ => rng.unit() * 150.0,
            };
            let x = (rng.unit() - 0.5) * 2e6;
            let y = (rng.unit() - 0.5) * 2e6;
            let key = keys[(rng.next() % keys.len() as u64) as usize];
            let ev = match rng.next() % 6 {
                0 => InputEvent::KeyDown(KeyEvent::new("f", key, t)),
                1 => InputEvent::KeyUp(KeyEvent::new("f", key, t)),
                2 => InputEvent::Click(ClickSample::new(x, y, t, MouseButton::from((rng.next() % 4) as u8))),
                3 => InputEvent::PointerMove(PointerSample::new(x, y, f64::NAN)),
                _ => InputEvent::PointerMove(PointerSample::new(x, y, t)),
            };
            s.handle(&ev).unwrap();
        }
        if seed % 2 == 0 {
            s.refresh_fingerprint(&RecordedProbe::new(DeviceReport::default()));
        }

        let ks = s.keystroke_assessment();
        assert!(ks.score <= 100);
        let p = s.pointer_score();
        assert!(p.bot_score <= 100);
        let c = p.components;
        for v in [c.straightness, c.velocity_consistency, c.teleportation, c.density, c.click_regularity] {
            assert!(v.is_finite() && (0.0..=1.0).contains(&v), "component {v}");
        }
        for score in s.analyze() {
            assert!(score.score <= 100);
            assert!(score.confidence.is_finite() && (0.0..=1.0).contains(&score.confidence));
        }
        if let Some(fp) = s.device_fingerprint() {
            assert!(fp.risk_score <= 100);
        }
        for _ in 0..3 {
            let trust = s.recompute_trust();
            assert!(trust.overall <= 100);
            let k = trust.components;
            assert!(k.device <= 100 && k.bot_detection <= 100 && k.consistency <= 100);
        }
    }
}

// ── Configuration ─────────────────────────────────────────────────────────────

#[test]
fn config_file_loading() {
    let mut f = tempfile::NamedTempFile::new().unwrap();
    write!(f, r#"{{"keystroke":{{"submit_every":0}},"fusion":{{"gate":{{"challenge_below":70,"block_below":20}}}}}}"#).unwrap();
    let c = PulsegateConfig::from_json_file(f.path()).unwrap();
    assert_eq!(c.keystroke.submit_every, 0);
    assert_eq!(c.keystroke.buffer_cap, 50);
    assert_eq!(c.fusion.gate.challenge_below, 70);
    assert_eq!(c.fusion.gate.block_below, 20);

    let mut bad = tempfile::NamedTempFile::new().unwrap();
    write!(bad, "{{ not json").unwrap();
    assert!(matches!(PulsegateConfig::from_json_file(bad.path()), Err(Error::Json(_))));

    let mut invalid = tempfile::NamedTempFile::new().unwrap();
    write!(invalid, r#"{{"pointer":{{"max_samples":0}}}}"#).unwrap();
    assert!(matches!(PulsegateConfig::from_json_file(invalid.path()), Err(Error::Config(_))));

    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("absent.json");
    assert!(matches!(PulsegateConfig::from_json_file(&missing), Err(Error::Io(_))));
}

// ── Session lifecycle ─────────────────────────────────────────────────────────

#[tokio::test]
async fn automatic_push_every_thirteen_keystrokes() {
    let transport = Scripted::new(Ok("{\"score\": 0.9}"));
    let s = CaptureSession::with_transport("push", PulsegateConfig::default(), transport.clone());
    let _sub = s.attach("f");

    type_uniform(&s, &["a", "s", "d"], 12, 60.0, 80.0);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(transport.calls.load(Ordering::SeqCst), 0);

    session_press(&s, "f", 5000.0, 5060.0);
    for _ in 0..100 {
        if s.classifier_verdict().is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    let v = s.classifier_verdict().unwrap();
    assert!(v.is_bot);
    assert_eq!(v.probability, 0.9);
}

#[tokio::test]
async fn awaited_submit_propagates_transport_errors() {
    let s = CaptureSession::with_transport("err", PulsegateConfig::default(), Scripted::new(Err(502)));
    let err = s.submit_timing().await.unwrap_err();
    assert!(matches!(err, Error::Transport { status: Some(502), .. }));
    assert!(s.classifier_verdict().is_none());

    let bare = CaptureSession::new("bare", PulsegateConfig::default());
    assert!(matches!(bare.submit_timing().await, Err(Error::Config(_))));

    s.close();
    assert!(matches!(s.submit_timing().await, Err(Error::SessionClosed)));
}

#[tokio::test]
async fn fingerprint_submission_uses_stored_probe() {
    let transport = Scripted::new(Ok("0.2"));
    let s = CaptureSession::with_transport("fp", PulsegateConfig::default(), transport.clone());
    assert!(matches!(s.submit_fingerprint().await, Err(Error::Config(_))));

    s.set_probe(Arc::new(RecordedProbe::new(DeviceReport::default())));
    let v = s.submit_fingerprint().await.unwrap();
    assert!(!v.is_bot);
    assert!(s.device_fingerprint().is_some());
    assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn periodic_tasks_run_until_stopped() {
    let mut config = PulsegateConfig::default();
    config.analysis.interval_secs = 1;
    config.fusion.interval_secs = 1;
    config.device.refresh_secs = 1;
    let s = CaptureSession::new("live", config);
    s.set_probe(Arc::new(RecordedProbe::new(DeviceReport::default())));

    s.start().unwrap();
    s.start().unwrap();
    assert!(s.is_running());

    tokio::time::sleep(Duration::from_millis(1400)).await;
    assert!(s.device_fingerprint().is_some());
    assert!(!s.trust_score().risk_factors.is_empty());

    s.stop();
    assert!(!s.is_running());
}

// ── Eval harness ──────────────────────────────────────────────────────────────

fn labelled_recording() -> Vec<SessionRecord> {
    let rec = |id: &str, payload: RecordPayload, label: Option<bool>| SessionRecord {
        session_id: id.into(),
        payload,
        label_bot: label,
    };
    let mut out = Vec::new();

    let headless = DeviceReport {
        basic: Some(BasicInfo {
            user_agent:           "Mozilla/5.0 HeadlessChrome/120.0".into(),
            language:             "en-US".into(),
            languages:            vec!["en-US".into()],
            hardware_concurrency: 8,
            webdriver:            true,
            ..Default::default()
        }),
        ..Default::default()
    };
    out.push(rec("bot", RecordPayload::Device(Box::new(headless)), Some(true)));
    let mut t = 0.0;
    for i in 0..30 {
        let key = ["x", "y", "z"][i % 3];
        out.push(rec("bot", RecordPayload::KeyDown(KeyEvent::new("f", key, t)), None));
        out.push(rec("bot", RecordPayload::KeyUp(KeyEvent::new("f", key, t + 50.0)), None));
        t += 110.0;
    }
    for p in line(25, 10.0, 16.0) {
        out.push(rec("bot", RecordPayload::PointerMove(p), None));
    }
    out.push(rec("bot", RecordPayload::Submit, None));

    let mut t = 0.0;
    for i in 0..30u32 {
        let key = ["h", "e", "l", "o", "w", "r", "d"][i as usize % 7];
        let dwell = 60.0 + ((i * 37) % 90) as f64;
        let flight = 80.0 + ((i * 53) % 200) as f64;
        out.push(rec("human", RecordPayload::KeyDown(KeyEvent::new("f", key, t)), Some(false)));
        out.push(rec("human", RecordPayload::KeyUp(KeyEvent::new("f", key, t + dwell)), None));
        t += dwell + flight;
    }
    out.push(rec("human", RecordPayload::Submit, None));
    out
}

#[test]
fn eval_separates_bot_from_human() {
    let result = Evaluator::new(PulsegateConfig::default()).evaluate(&labelled_recording()).unwrap();
    assert_eq!(result.n_sessions, 2);
    assert_eq!(result.n_scored, 2);
    assert_eq!((result.n_positive, result.n_negative), (1, 1));

    let bot = result.outcomes.iter().find(|(_, b)| *b).unwrap().0;
    let human = result.outcomes.iter().find(|(_, b)| !*b).unwrap().0;
    assert!(bot > human, "bot {bot} <= human {human}");
    assert_eq!(result.global.tp, 1);
    assert_eq!(pulsegate::eval::report::auc_roc(&result), 1.0);
    assert!(result.per_channel.contains_key("device"));
}

#[tokio::test]
async fn eval_reads_jsonl_dataset() {
    let mut f = tempfile::NamedTempFile::new().unwrap();
    for rec in labelled_recording() {
        writeln!(f, "{}", serde_json::to_string(&rec).unwrap()).unwrap();
    }
    writeln!(f, "not a record").unwrap();
    let result = Evaluator::new(PulsegateConfig::default())
        .with_threshold(40)
        .run_dataset(f.path())
        .await
        .unwrap();
    assert_eq!(result.threshold, 40);
    assert_eq!(result.n_scored, 2);
    assert_eq!(result.n_records, labelled_recording().len());
}
