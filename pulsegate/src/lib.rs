// pulsegate/src/lib.rs
//
// Behavioral bot detection for form submissions.
//
//   InputEvent ──► CaptureSession ──► workers (keystroke, pointer, device)
//                                  ──► engine::fusion ──► TrustScore ──► GateDecision
//
// The embedding service owns transport (engine::classifier::Transport) and
// device probing (fingerprint::DeviceProbe); the core only consumes raw input
// events and exposes numeric scores.

pub mod config;
pub mod engine;
pub mod error;
pub mod eval;
pub mod events;
pub mod fingerprint;
pub mod session;
pub mod state;
pub mod stats;
pub mod workers;

pub use config::PulsegateConfig;
pub use engine::{ClassifierPayload, ClassifierVerdict, Transport, TransportHandle};
pub use error::{Error, Result};
pub use events::{
    Channel, ChannelScore, ClickSample, GateDecision, InputEvent, KeyEvent, MouseButton,
    PointerSample, SessionRecord, TrustScore,
};
pub use fingerprint::{DeviceFingerprint, DeviceProbe, DeviceReport, RecordedProbe};
pub use session::{CaptureSession, SessionRegistry, Subscription};
