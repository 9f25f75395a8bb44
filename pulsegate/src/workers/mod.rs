pub mod device;
pub mod keystroke;
pub mod pointer;

use crate::events::ChannelScore;
use crate::fingerprint::DeviceFingerprint;

use keystroke::KeystrokeExtractor;
use pointer::PointerExtractor;

/// Score every local channel. The device channel is present only once a
/// fingerprint has been collected.
pub fn run_all(
    keys:    &KeystrokeExtractor,
    pointer: &PointerExtractor,
    device:  Option<&DeviceFingerprint>,
) -> Vec<ChannelScore> {
    let mut scores = vec![keys.channel_score(), pointer.channel_score()];
    if let Some(fp) = device {
        scores.push(device::channel_score(fp));
    }
    scores
}
