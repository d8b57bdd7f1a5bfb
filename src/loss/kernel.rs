//! Pixel-wise loss kernels that cost one predicted channel against one binary mask.
//!
//! Two variants are supported:
//!
//! ```text
//! cross entropy:  L = -Σ log p · t            (optionally / normalizer)
//! soft IoU:       L = 1 - (Σ p·t + s) / (Σ p + Σ t - Σ p·t + s)
//! ```
//!
//! The kernel also owns the score transform its inputs must go through
//! (log-softmax for cross entropy, softmax for soft IoU).

use core::str::FromStr;

use burn::{
    prelude::*,
    tensor::activation::{log_softmax, softmax},
};

use crate::error::{LossError, LossResult};

/// Selects the pixel loss kernel.
#[derive(Config, Debug, Copy, PartialEq, Eq)]
pub enum LossType {
    CrossEntropy,
    SoftIou,
}

impl LossType {
    /// Size averaging each kernel is normally used with.
    pub fn default_size_average(&self) -> bool {
        match self {
            LossType::CrossEntropy => true,
            LossType::SoftIou => false,
        }
    }
}

impl FromStr for LossType {
    type Err = LossError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name {
            "cross_entropy" | "xent" => Ok(LossType::CrossEntropy),
            "soft_iou" => Ok(LossType::SoftIou),
            other => Err(LossError::UnknownLossType(other.to_string())),
        }
    }
}

/// Per-channel criterion, fixed when the loss is constructed.
#[derive(Clone, Debug, PartialEq)]
pub enum PixelLossKernel {
    /// Negative log-likelihood of the target pixels.
    CrossEntropy {
        /// Divide by the image's labelled pixel count.
        size_average: bool,
    },
    /// One minus the soft intersection over union.
    SoftIou {
        /// Added to both sides of the ratio so an empty union is well defined.
        smooth: f64,
    },
}

impl PixelLossKernel {
    /// Create the kernel for `loss_type`.
    ///
    /// # Errors
    ///
    /// - [`LossError::SizeAverageWithSoftIou`] when size averaging is requested for soft IoU.
    /// - [`LossError::InvalidParameter`] when `smooth` is not a positive finite number.
    pub fn new(loss_type: LossType, size_average: bool, smooth: f64) -> LossResult<Self> {
        match loss_type {
            LossType::CrossEntropy => Ok(PixelLossKernel::CrossEntropy { size_average }),
            LossType::SoftIou if size_average => Err(LossError::SizeAverageWithSoftIou),
            LossType::SoftIou => {
                if !(smooth.is_finite() && smooth > 0.0) {
                    return Err(LossError::InvalidParameter {
                        parameter: "soft_iou_smooth",
                        reason: format!("must be positive and finite, got {smooth}"),
                    });
                }
                Ok(PixelLossKernel::SoftIou { smooth })
            }
        }
    }

    pub fn loss_type(&self) -> LossType {
        match self {
            PixelLossKernel::CrossEntropy { .. } => LossType::CrossEntropy,
            PixelLossKernel::SoftIou { .. } => LossType::SoftIou,
        }
    }

    pub fn size_average(&self) -> bool {
        matches!(self, PixelLossKernel::CrossEntropy { size_average: true })
    }

    /// Map raw scores `[batch_size, channels, height, width]` into the kernel's domain.
    ///
    /// The normalisation runs over the channel axis. It is moved to the last axis first,
    /// the only axis whose reduction backward the ndarray backend can scatter into.
    pub fn transform<B: Backend>(&self, scores: Tensor<B, 4>) -> Tensor<B, 4> {
        let channels_last = scores.swap_dims(1, 3);
        let transformed = match self {
            PixelLossKernel::CrossEntropy { .. } => log_softmax(channels_last, 3),
            PixelLossKernel::SoftIou { .. } => softmax(channels_last, 3),
        };
        transformed.swap_dims(1, 3)
    }

    /// Cost of one transformed prediction map against one binary target map.
    ///
    /// `normalizer` is the image's labelled pixel count; only cross entropy with size
    /// averaging uses it.
    ///
    /// # Shapes
    ///
    /// - prediction: `[height, width]`
    /// - target: `[height, width]`
    /// - output: `[1]`
    pub fn component_loss<B: Backend>(
        &self,
        prediction: Tensor<B, 2>,
        target: Tensor<B, 2>,
        normalizer: usize,
    ) -> LossResult<Tensor<B, 1>> {
        let prediction_dims = prediction.dims();
        let target_dims = target.dims();
        if prediction_dims != target_dims {
            return Err(LossError::ShapeMismatch {
                context: "component loss target vs prediction",
                expected: prediction_dims.to_vec(),
                actual: target_dims.to_vec(),
            });
        }

        let loss = match self {
            PixelLossKernel::CrossEntropy { size_average } => {
                let neg_log_likelihood = (prediction * target).sum().neg();
                if *size_average {
                    neg_log_likelihood.div_scalar(normalizer.max(1) as f64)
                } else {
                    neg_log_likelihood
                }
            }
            PixelLossKernel::SoftIou { smooth } => {
                let intersection = (prediction.clone() * target.clone()).sum();
                let union = prediction.sum() + target.sum() - intersection.clone();
                let iou = intersection.add_scalar(*smooth) / union.add_scalar(*smooth);
                Tensor::ones_like(&iou) - iou
            }
        };

        Ok(loss)
    }
}
