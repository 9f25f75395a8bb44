pub mod ring;
pub mod timing;
pub mod trajectory;

pub use ring::Ring;
pub use timing::{TimingBuffers, TimingMap, TimingSnapshot};
pub use trajectory::Trajectory;
