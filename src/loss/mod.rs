pub mod assignment;
pub mod cost_matrix;
pub mod kernel;
pub mod matcher;
pub mod matching_loss;
pub mod solver;

pub use assignment::{AssignedInstance, BatchAssignment, ChannelAssignment, ImageAssignment};
pub use cost_matrix::{CostMatrix, build_cost_matrix};
pub use kernel::{LossType, PixelLossKernel};
pub use matcher::{ImageMatch, match_image, match_image_static};
pub use matching_loss::{MatchingLoss, MatchingLossConfig, MatchingLossOutput};
pub use solver::{assignment_cost, solve};
