pub mod classifier;
pub mod fusion;

pub use classifier::{ClassifierClient, ClassifierPayload, ClassifierVerdict, Transport, TransportHandle};
pub use fusion::{FusionEngine, FusionInputs};
