use burn::prelude::*;
use ndarray::Array2;

use super::kernel::PixelLossKernel;
use crate::{
    error::{LossError, LossResult, ensure_finite},
    labels::ImageLabels,
    problem::ChannelMapping,
};

/// Pairwise costs between the channels of one semantic class and its ground-truth
/// instances in one image.
///
/// Rows follow [`CostMatrix::channels`], columns follow [`CostMatrix::instances`]
/// (sorted ascending). When the class has more channels `P` than instances `G`, the
/// host matrix handed to the solver carries `P - G` extra columns holding each row's
/// cost against an empty target, so that the solver also picks which channels end up
/// as false positives.
#[derive(Debug)]
pub struct CostMatrix<B: Backend> {
    semantic_id: i64,
    channels: Vec<usize>,
    instances: Vec<i64>,
    /// Row-major `P x G`, kept on the autodiff graph.
    entries: Vec<Tensor<B, 1>>,
    /// One per row when `P > G`, empty otherwise.
    false_positive: Vec<Tensor<B, 1>>,
    host: Array2<f64>,
}

impl<B: Backend> CostMatrix<B> {
    pub fn semantic_id(&self) -> i64 {
        self.semantic_id
    }

    /// Global channel index of every row.
    pub fn channels(&self) -> &[usize] {
        &self.channels
    }

    /// Ground-truth instance id of every real column.
    pub fn instances(&self) -> &[i64] {
        &self.instances
    }

    /// `(P, G)`, ignoring false positive padding.
    pub fn dims(&self) -> (usize, usize) {
        (self.channels.len(), self.instances.len())
    }

    /// Host values, `P x max(P, G)`; columns past `G` are false positive padding.
    pub fn host(&self) -> &Array2<f64> {
        &self.host
    }

    pub fn is_padding(&self, col: usize) -> bool {
        col >= self.instances.len()
    }

    /// Differentiable cost of `(row, col)`, padding columns included.
    pub fn cost(&self, row: usize, col: usize) -> Option<Tensor<B, 1>> {
        let (_, num_instances) = self.dims();
        if self.is_padding(col) {
            self.false_positive.get(row).cloned()
        } else {
            self.entries.get(row * num_instances + col).cloned()
        }
    }
}

/// Build the cost matrix of `semantic_id` for one image.
///
/// `predictions` are the kernel-transformed scores of the image, `[channels, height, width]`.
///
/// # Errors
///
/// - [`LossError::ShapeMismatch`] if the prediction does not fit the mapping or the labels.
/// - [`LossError::NonFinite`] if any cost is NaN or infinite.
pub fn build_cost_matrix<B: Backend>(
    kernel: &PixelLossKernel,
    predictions: &Tensor<B, 3>,
    labels: &ImageLabels<B>,
    mapping: &ChannelMapping,
    semantic_id: i64,
) -> LossResult<CostMatrix<B>> {
    check_prediction_shape(predictions, labels, mapping)?;

    let channels = mapping.channels_for(semantic_id).to_vec();
    let instances = labels.instances_present(semantic_id);
    let normalizer = labels.normalizer();

    let targets: Vec<Tensor<B, 2>> = instances
        .iter()
        .map(|&instance_id| labels.instance_mask(semantic_id, instance_id))
        .collect();

    let mut entries = Vec::with_capacity(channels.len() * instances.len());
    let mut false_positive = Vec::new();
    for &channel in &channels {
        let prediction = channel_map(predictions, channel);
        for target in &targets {
            entries.push(kernel.component_loss(prediction.clone(), target.clone(), normalizer)?);
        }
        if channels.len() > instances.len() {
            false_positive.push(kernel.component_loss(prediction, labels.empty_mask(), normalizer)?);
        }
    }

    let entry_values = host_values(&entries);
    let false_positive_values = host_values(&false_positive);
    for &value in entry_values.iter().chain(&false_positive_values) {
        ensure_finite("cost matrix", value)?;
    }

    let (num_channels, num_instances) = (channels.len(), instances.len());
    let host = Array2::from_shape_fn(
        (num_channels, num_channels.max(num_instances)),
        |(row, col)| {
            if col < num_instances {
                entry_values[row * num_instances + col]
            } else {
                false_positive_values[row]
            }
        },
    );

    tracing::debug!(
        semantic_id,
        channels = num_channels,
        instances = num_instances,
        "built cost matrix"
    );

    Ok(CostMatrix {
        semantic_id,
        channels,
        instances,
        entries,
        false_positive,
        host,
    })
}

/// Prediction map of `channel`, `[height, width]`.
pub(crate) fn channel_map<B: Backend>(predictions: &Tensor<B, 3>, channel: usize) -> Tensor<B, 2> {
    predictions.clone().narrow(0, channel, 1).squeeze::<2>(0)
}

/// Copy scalar tensors to the host in one transfer.
pub(crate) fn host_values<B: Backend>(values: &[Tensor<B, 1>]) -> Vec<f64> {
    if values.is_empty() {
        return Vec::new();
    }
    Tensor::cat(values.to_vec(), 0)
        .into_data()
        .iter::<f64>()
        .collect()
}

pub(crate) fn check_prediction_shape<B: Backend>(
    predictions: &Tensor<B, 3>,
    labels: &ImageLabels<B>,
    mapping: &ChannelMapping,
) -> LossResult<()> {
    let [channels, height, width] = predictions.dims();
    let [label_height, label_width] = labels.dims();
    if channels != mapping.num_channels() || [height, width] != [label_height, label_width] {
        return Err(LossError::ShapeMismatch {
            context: "image prediction vs channel mapping and labels",
            expected: vec![mapping.num_channels(), label_height, label_width],
            actual: vec![channels, height, width],
        });
    }
    Ok(())
}
