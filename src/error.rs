//! Error types for the channel-matching loss.
//!
//! Every failure in this crate is fatal for the current training step: the
//! caller decides whether to abort the run, skip the batch or retry.

use thiserror::Error;

/// Error type for loss construction and evaluation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LossError {
    /// The channel mapping has no channels.
    #[error("channel mapping is empty - matching needs a semantic and instance id per channel")]
    EmptyChannelMapping,

    /// The two channel id sequences have different lengths.
    #[error(
        "channel mapping length mismatch: {semantic} semantic ids vs {instance} instance ids"
    )]
    ChannelMappingLength {
        /// Number of semantic ids.
        semantic: usize,
        /// Number of instance ids.
        instance: usize,
    },

    /// A semantic class mixes instance slot 0 with other slots.
    #[error("semantic class {semantic_id} mixes instance slot 0 with slots {slots:?}")]
    MixedInstanceSlots {
        /// The offending semantic class.
        semantic_id: i64,
        /// All slots configured for the class.
        slots: Vec<i64>,
    },

    /// Size averaging requested together with the soft IoU kernel.
    #[error("size_average cannot be used with the soft IoU loss, the ratio is already normalized")]
    SizeAverageWithSoftIou,

    /// Unknown loss type name.
    #[error("unknown loss type '{0}', expected one of cross_entropy, xent, soft_iou")]
    UnknownLossType(String),

    /// Invalid scalar parameter.
    #[error("invalid parameter '{parameter}': {reason}")]
    InvalidParameter {
        /// Parameter name.
        parameter: &'static str,
        /// Why it was rejected.
        reason: String,
    },

    /// Tensor shapes disagree.
    #[error("shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Where the mismatch was detected.
        context: &'static str,
        /// Expected dimensions.
        expected: Vec<usize>,
        /// Actual dimensions.
        actual: Vec<usize>,
    },

    /// NaN or infinite value in a loss or cost.
    #[error("non-finite value {value} in {context}")]
    NonFinite {
        /// Where the value was produced.
        context: &'static str,
        /// The offending value.
        value: f64,
    },

    /// The cost matrix handed to the solver is unusable.
    #[error("malformed cost matrix: {reason}")]
    MalformedCostMatrix {
        /// Description of the defect.
        reason: String,
    },

    /// A channel was left without a cost after matching.
    #[error("channel {channel} received no cost after matching")]
    UnfilledChannel {
        /// The channel index.
        channel: usize,
    },

    /// Ground truth carries instance id 0 for a class that has no slot 0.
    #[error("instance id 0 found for semantic class {semantic_id}, which has no semantic-only channel")]
    UnexpectedInstanceZero {
        /// The offending semantic class.
        semantic_id: i64,
    },
}

/// A specialized `Result` type for loss operations.
pub type LossResult<T> = Result<T, LossError>;

/// Fails with [`LossError::NonFinite`] when `value` is NaN or infinite.
pub(crate) fn ensure_finite(context: &'static str, value: f64) -> LossResult<f64> {
    if value.is_finite() {
        Ok(value)
    } else {
        tracing::error!(context, value, "non-finite loss value");
        Err(LossError::NonFinite { context, value })
    }
}
