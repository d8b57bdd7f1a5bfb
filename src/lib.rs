pub mod error;
pub mod labels;
pub mod loss;
pub mod problem;

pub use error::{LossError, LossResult};
pub use labels::{ImageLabels, LabelBatch, LabelMap};
pub use loss::{
    AssignedInstance, BatchAssignment, ChannelAssignment, ImageAssignment, LossType, MatchingLoss,
    MatchingLossConfig, MatchingLossOutput, PixelLossKernel,
};
pub use problem::ChannelMapping;

#[cfg(feature = "oracle")]
pub use labels::oracle_scores;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
