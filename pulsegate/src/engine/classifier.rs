// pulsegate/src/engine/classifier.rs
//
// Remote bot classifier client.
//
// The transport is provided by the embedding service (HTTP, queue, ...):
// it ships a payload and hands back the raw response body. Transport errors
// propagate to the caller unchanged; there is no retry here. The body is
// parsed leniently:
//   0.87                  bare number
//   {"score": 0.87}       or {"probability": 0.87}
//   anything else         → 0.0, logged
// and clamped to [0, 1].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::Result;
use crate::fingerprint::DeviceFingerprint;
use crate::state::timing::TimingSnapshot;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PayloadBody {
    /// Accumulated dwell / flight / n-gram maps
    Timing(TimingSnapshot),
    Fingerprint(Box<DeviceFingerprint>),
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassifierPayload {
    pub session_id: String,
    #[serde(flatten)]
    pub body:       PayloadBody,
}

impl ClassifierPayload {
    pub fn timing(session_id: impl Into<String>, snapshot: TimingSnapshot) -> Self {
        Self { session_id: session_id.into(), body: PayloadBody::Timing(snapshot) }
    }

    pub fn fingerprint(session_id: impl Into<String>, fp: DeviceFingerprint) -> Self {
        Self { session_id: session_id.into(), body: PayloadBody::Fingerprint(Box::new(fp)) }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver the payload and return the raw response body.
    async fn submit(&self, payload: &ClassifierPayload) -> Result<String>;
}

pub type TransportHandle = Arc<dyn Transport>;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassifierVerdict {
    /// 0.0–1.0 probability the session is automated
    pub probability: f64,
    pub is_bot:      bool,
    pub received_at: DateTime<Utc>,
}

impl ClassifierVerdict {
    pub fn new(probability: f64) -> Self {
        let probability = if probability.is_finite() { probability.clamp(0.0, 1.0) } else { 0.0 };
        Self { probability, is_bot: probability >= 0.5, received_at: Utc::now() }
    }
}

#[derive(Clone)]
pub struct ClassifierClient {
    transport: TransportHandle,
}

impl ClassifierClient {
    pub fn new(transport: TransportHandle) -> Self {
        Self { transport }
    }

    pub async fn classify(&self, payload: &ClassifierPayload) -> Result<ClassifierVerdict> {
        let body = self.transport.submit(payload).await?;
        let verdict = ClassifierVerdict::new(parse_probability(&body));
        debug!(session = %payload.session_id, p = verdict.probability, "classifier verdict");
        Ok(verdict)
    }
}

/// Coerce a response body to a probability. Never fails.
pub fn parse_probability(body: &str) -> f64 {
    let trimmed = body.trim();
    let parsed = match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Number(n)) => n.as_f64(),
        Ok(Value::String(s)) => s.trim().parse::<f64>().ok(),
        Ok(Value::Object(map)) => map.get("score")
            .or_else(|| map.get("probability"))
            .and_then(|v| match v {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse::<f64>().ok(),
                _ => None,
            }),
        Ok(_) => None,
        Err(_) => trimmed.parse::<f64>().ok(),
    };

    match parsed {
        Some(p) if p.is_finite() => p.clamp(0.0, 1.0),
        _ => {
            let preview: String = trimmed.chars().take(64).collect();
            warn!(body = %preview, "non-numeric classifier response, using 0.0");
            0.0
        }
    }
}
