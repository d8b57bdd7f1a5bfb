//! Batch channel-matching loss.
//!
//! Raw scores are transformed for the configured kernel, every image is matched
//! (or statically assigned) independently, and per-channel costs are summed into
//! the differentiable total. A semantic aggregate term, comparing the summed
//! predictions of each class with its semantic mask, is always reported and added
//! with a configurable weight.

use core::marker::PhantomData;

use burn::{module::Ignored, prelude::*};
use derive_new::new;

use super::{
    assignment::BatchAssignment,
    cost_matrix::channel_map,
    kernel::{LossType, PixelLossKernel},
    matcher::{ImageMatch, match_image, match_image_static},
};
use crate::{
    error::{LossError, LossResult, ensure_finite},
    labels::{ImageLabels, LabelBatch},
    problem::ChannelMapping,
};

/// Configuration to create a [matching loss](MatchingLoss) using the [init function](MatchingLossConfig::init).
#[derive(Config, Debug)]
pub struct MatchingLossConfig {
    /// Semantic class of every model output channel.
    pub channel_semantic_ids: Vec<i64>,

    /// Instance slot of every model output channel.
    ///
    /// Slot 0 marks a semantic-only channel and must be the only channel of its class.
    pub channel_instance_ids: Vec<i64>,

    /// Pixel loss kernel used for every channel cost.
    #[config(default = "LossType::CrossEntropy")]
    pub loss_type: LossType,

    /// Search the cheapest channel to instance assignment per image.
    ///
    /// When disabled every channel is costed against its configured target.
    #[config(default = true)]
    pub matching: bool,

    /// Divide cross-entropy costs by the image's labelled pixel count.
    ///
    /// Must be disabled for soft IoU.
    #[config(default = true)]
    pub size_average: bool,

    /// Weight of the semantic aggregate term in the total loss.
    #[config(default = 0.0)]
    pub semantic_agg_multiplier: f64,

    /// Label value marking ignored pixels in both label maps.
    #[config(default = "-1")]
    pub void_value: i64,

    /// Smoothing term of the soft IoU ratio.
    #[config(default = 1e-5)]
    pub soft_iou_smooth: f64,
}

impl MatchingLossConfig {
    /// Config for the usual layout, see [`ChannelMapping::from_instance_counts`].
    pub fn from_instance_counts(counts: &[usize]) -> LossResult<Self> {
        let mapping = ChannelMapping::from_instance_counts(counts)?;
        Ok(Self::new(
            mapping.semantic_ids().to_vec(),
            mapping.instance_slots().to_vec(),
        ))
    }

    /// Validate the configuration and create the loss.
    ///
    /// # Errors
    ///
    /// Any configuration error: a malformed channel mapping, size averaging with soft IoU,
    /// or an invalid scalar parameter.
    pub fn init<B: Backend>(&self, _device: &B::Device) -> LossResult<MatchingLoss<B>> {
        self.assertions()?;

        let mapping = ChannelMapping::new(
            self.channel_semantic_ids.clone(),
            self.channel_instance_ids.clone(),
        )?;
        let kernel = PixelLossKernel::new(self.loss_type, self.size_average, self.soft_iou_smooth)?;

        tracing::debug!(
            channels = mapping.num_channels(),
            semantic_classes = mapping.semantic_values().len(),
            loss_type = ?self.loss_type,
            matching = self.matching,
            "created matching loss"
        );

        Ok(MatchingLoss {
            mapping: Ignored(mapping),
            kernel: Ignored(kernel),
            matching: self.matching,
            semantic_agg_multiplier: self.semantic_agg_multiplier,
            void_value: self.void_value,
            _b: PhantomData,
        })
    }

    fn assertions(&self) -> LossResult<()> {
        if !(self.semantic_agg_multiplier.is_finite() && self.semantic_agg_multiplier >= 0.0) {
            return Err(LossError::InvalidParameter {
                parameter: "semantic_agg_multiplier",
                reason: format!(
                    "must be non-negative and finite, got {}",
                    self.semantic_agg_multiplier
                ),
            });
        }
        Ok(())
    }
}

/// Channel-matching loss over a batch.
///
/// Should be created using [MatchingLossConfig]. Holds no parameters.
#[derive(Module, Debug)]
pub struct MatchingLoss<B: Backend> {
    mapping: Ignored<ChannelMapping>,
    kernel: Ignored<PixelLossKernel>,
    matching: bool,
    semantic_agg_multiplier: f64,
    void_value: i64,
    _b: PhantomData<B>,
}

/// Everything one forward pass of the [`MatchingLoss`] produces.
#[derive(new, Debug, Clone)]
pub struct MatchingLossOutput<B: Backend> {
    /// `total_channel_loss + semantic_agg_multiplier * semantic_agg_loss`, `[1]`.
    pub total_loss: Tensor<B, 1>,
    /// Sum of every channel cost of every image, `[1]`.
    pub total_channel_loss: Tensor<B, 1>,
    /// Sum of the semantic aggregate costs, `[1]`.
    pub semantic_agg_loss: Tensor<B, 1>,
    /// `[batch_size, channels]`
    pub loss_by_channel: Tensor<B, 2>,
    /// `[batch_size, semantic_classes]`, columns follow `semantic_values`.
    pub loss_by_semantic_class: Tensor<B, 2>,
    pub semantic_values: Vec<i64>,
    pub assignments: BatchAssignment,
}

impl<B: Backend> MatchingLoss<B> {
    pub fn mapping(&self) -> &ChannelMapping {
        &self.mapping.0
    }

    pub fn kernel(&self) -> &PixelLossKernel {
        &self.kernel.0
    }

    pub fn matching(&self) -> bool {
        self.matching
    }

    pub fn void_value(&self) -> i64 {
        self.void_value
    }

    /// Compute the loss of a batch.
    ///
    /// # Shapes
    ///
    /// - scores: `[batch_size, channels, height, width]`, raw network output
    /// - labels: `[batch_size, height, width]`
    ///
    /// # Errors
    ///
    /// - [`LossError::ShapeMismatch`] if scores, labels and channel mapping disagree.
    /// - [`LossError::NonFinite`] if a cost or the total is NaN or infinite.
    /// - Data and consistency errors from the per-image matching.
    pub fn forward(
        &self,
        scores: Tensor<B, 4>,
        labels: &LabelBatch<B>,
    ) -> LossResult<MatchingLossOutput<B>> {
        self.check_shapes(&scores, labels)?;

        let [batch_size, _, height, width] = scores.dims();
        let predictions = self.kernel.transform(scores);

        let mut channel_costs = Vec::with_capacity(batch_size);
        let mut semantic_costs = Vec::with_capacity(batch_size);
        let mut images = Vec::with_capacity(batch_size);

        for index in 0..batch_size {
            let image_predictions = predictions
                .clone()
                .narrow(0, index, 1)
                .reshape([self.mapping.num_channels(), height, width]);
            let image_labels = labels.image(index, self.void_value);

            let _span = tracing::debug_span!("image", index).entered();
            let ImageMatch { assignment, costs } = if self.matching {
                match_image(self.kernel(), self.mapping(), &image_predictions, &image_labels)?
            } else {
                match_image_static(self.kernel(), self.mapping(), &image_predictions, &image_labels)?
            };

            channel_costs.push(costs);
            semantic_costs.push(self.semantic_aggregate(&image_predictions, &image_labels)?);
            images.push(assignment);
        }

        let loss_by_channel = Tensor::stack::<2>(channel_costs, 0);
        let loss_by_semantic_class = Tensor::stack::<2>(semantic_costs, 0);
        let total_channel_loss = loss_by_channel.clone().sum();
        let semantic_agg_loss = loss_by_semantic_class.clone().sum();
        let total_loss = total_channel_loss.clone()
            + semantic_agg_loss.clone().mul_scalar(self.semantic_agg_multiplier);

        let total = ensure_finite("total loss", total_loss.clone().into_scalar().elem::<f64>())?;
        let assignments = BatchAssignment::new(images);

        tracing::debug!(
            batch_size,
            total,
            false_positives = assignments.n_false_positives(),
            leftovers = assignments.n_leftovers(),
            "computed matching loss"
        );

        Ok(MatchingLossOutput::new(
            total_loss,
            total_channel_loss,
            semantic_agg_loss,
            loss_by_channel,
            loss_by_semantic_class,
            self.mapping.semantic_values().to_vec(),
            assignments,
        ))
    }

    /// Cost of each class's summed channel predictions against its semantic mask, `[semantic_classes]`.
    fn semantic_aggregate(
        &self,
        predictions: &Tensor<B, 3>,
        labels: &ImageLabels<B>,
    ) -> LossResult<Tensor<B, 1>> {
        let normalizer = labels.normalizer();

        let costs = self
            .mapping
            .semantic_values()
            .iter()
            .map(|&semantic_id| {
                let channels = self.mapping.channels_for(semantic_id);
                let summed = channels
                    .iter()
                    .map(|&channel| channel_map(predictions, channel))
                    .reduce(|acc, map| acc + map)
                    .ok_or(LossError::EmptyChannelMapping)?;
                self.kernel
                    .component_loss(summed, labels.semantic_mask(semantic_id), normalizer)
            })
            .collect::<LossResult<Vec<_>>>()?;

        Ok(Tensor::cat(costs, 0))
    }

    fn check_shapes(&self, scores: &Tensor<B, 4>, labels: &LabelBatch<B>) -> LossResult<()> {
        let [batch_size, channels, height, width] = scores.dims();

        if batch_size == 0 {
            return Err(LossError::InvalidParameter {
                parameter: "scores",
                reason: "the batch holds no image".to_string(),
            });
        }
        if channels != self.mapping.num_channels() {
            return Err(LossError::ShapeMismatch {
                context: "score channels vs channel mapping",
                expected: vec![self.mapping.num_channels()],
                actual: vec![channels],
            });
        }
        if labels.dims() != [batch_size, height, width] {
            return Err(LossError::ShapeMismatch {
                context: "labels vs scores",
                expected: vec![batch_size, height, width],
                actual: labels.dims().to_vec(),
            });
        }
        Ok(())
    }
}
