mod batch;
#[cfg(feature = "oracle")]
mod oracle;

pub use batch::{ImageLabels, LabelBatch, LabelMap};
#[cfg(feature = "oracle")]
pub use oracle::oracle_scores;
