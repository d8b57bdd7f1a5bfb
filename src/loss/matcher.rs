//! Per-image channel to instance matching.
//!
//! Every semantic class of the channel mapping is resolved independently:
//!
//! - semantic-only classes (one channel at slot 0) score their channel against the
//!   whole semantic region and record instance 0;
//! - other classes build a cost matrix and run the assignment solver, channels that
//!   find no instance become false positives and instances that find no channel
//!   are recorded as leftovers.
//!
//! The static variant skips the search and costs each channel against its
//! configured `(semantic id, slot)` target.

use burn::prelude::*;
use derive_new::new;

use super::{
    assignment::{AssignedInstance, ChannelAssignment, ImageAssignment},
    cost_matrix::{build_cost_matrix, channel_map, check_prediction_shape, host_values},
    kernel::PixelLossKernel,
    solver::solve,
};
use crate::{
    error::{LossError, LossResult, ensure_finite},
    labels::ImageLabels,
    problem::ChannelMapping,
};

/// Matching result of one image.
#[derive(new, Debug, Clone)]
pub struct ImageMatch<B: Backend> {
    pub assignment: ImageAssignment,
    /// Differentiable cost of every channel, `[channels]`.
    pub costs: Tensor<B, 1>,
}

/// A channel's cost together with its target, before the per-image assembly.
struct ChannelCost<B: Backend> {
    semantic_id: i64,
    instance: AssignedInstance,
    cost: Tensor<B, 1>,
}

/// Find the cheapest channel to instance assignment of one image.
///
/// `predictions` are the kernel-transformed scores `[channels, height, width]`.
///
/// # Errors
///
/// - [`LossError::ShapeMismatch`] if predictions, mapping and labels disagree.
/// - [`LossError::UnexpectedInstanceZero`] if a matched class carries instance id 0.
/// - [`LossError::NonFinite`] if a cost is NaN or infinite.
/// - [`LossError::UnfilledChannel`] if a channel ends up without a cost.
pub fn match_image<B: Backend>(
    kernel: &PixelLossKernel,
    mapping: &ChannelMapping,
    predictions: &Tensor<B, 3>,
    labels: &ImageLabels<B>,
) -> LossResult<ImageMatch<B>> {
    check_prediction_shape(predictions, labels, mapping)?;

    let normalizer = labels.normalizer();
    let mut slots: Vec<Option<ChannelCost<B>>> =
        (0..mapping.num_channels()).map(|_| None).collect();
    let mut unassigned = Vec::new();

    for &semantic_id in mapping.semantic_values() {
        if mapping.is_semantic_only(semantic_id) {
            for &channel in mapping.channels_for(semantic_id) {
                let cost = kernel.component_loss(
                    channel_map(predictions, channel),
                    labels.semantic_mask(semantic_id),
                    normalizer,
                )?;
                slots[channel] = Some(ChannelCost {
                    semantic_id,
                    instance: AssignedInstance::Instance(0),
                    cost,
                });
            }
            continue;
        }

        let matrix = build_cost_matrix(kernel, predictions, labels, mapping, semantic_id)?;
        if matrix.instances().contains(&0) {
            return Err(LossError::UnexpectedInstanceZero { semantic_id });
        }

        let assignment = solve(matrix.host())?;
        let mut covered = vec![false; matrix.instances().len()];
        for (row, col) in assignment.into_iter().enumerate() {
            let channel = matrix.channels()[row];
            let Some(col) = col else {
                return Err(LossError::UnfilledChannel { channel });
            };
            let Some(cost) = matrix.cost(row, col) else {
                return Err(LossError::UnfilledChannel { channel });
            };
            let instance = if matrix.is_padding(col) {
                AssignedInstance::FalsePositive
            } else {
                covered[col] = true;
                AssignedInstance::Instance(matrix.instances()[col])
            };
            slots[channel] = Some(ChannelCost {
                semantic_id,
                instance,
                cost,
            });
        }

        let leftovers: Vec<i64> = matrix
            .instances()
            .iter()
            .zip(&covered)
            .filter(|(_, covered)| !**covered)
            .map(|(&instance_id, _)| instance_id)
            .collect();
        if !leftovers.is_empty() {
            tracing::warn!(
                semantic_id,
                ?leftovers,
                channels = matrix.channels().len(),
                "more ground-truth instances than channels"
            );
        }
        unassigned.extend(leftovers.into_iter().map(|instance_id| (semantic_id, instance_id)));
    }

    let image_match = assemble(slots, unassigned)?;
    tracing::debug!(
        false_positives = image_match.assignment.n_false_positives(),
        leftovers = image_match.assignment.unassigned.len(),
        "matched image"
    );
    Ok(image_match)
}

/// Cost every channel against its statically configured target, no search.
///
/// A channel whose `(semantic id, slot)` is absent from the image is recorded as a
/// false positive (its target is empty). Present instances no channel is configured
/// for are reported as leftovers.
pub fn match_image_static<B: Backend>(
    kernel: &PixelLossKernel,
    mapping: &ChannelMapping,
    predictions: &Tensor<B, 3>,
    labels: &ImageLabels<B>,
) -> LossResult<ImageMatch<B>> {
    check_prediction_shape(predictions, labels, mapping)?;

    let normalizer = labels.normalizer();
    let present = labels.instance_pairs();

    let slots = mapping
        .semantic_ids()
        .iter()
        .zip(mapping.instance_slots())
        .enumerate()
        .map(|(channel, (&semantic_id, &slot))| {
            let cost = kernel.component_loss(
                channel_map(predictions, channel),
                labels.instance_mask(semantic_id, slot),
                normalizer,
            )?;
            let instance = if present.contains(&(semantic_id, slot)) {
                AssignedInstance::Instance(slot)
            } else {
                AssignedInstance::FalsePositive
            };
            Ok(Some(ChannelCost {
                semantic_id,
                instance,
                cost,
            }))
        })
        .collect::<LossResult<Vec<_>>>()?;

    let unassigned = present
        .into_iter()
        .filter(|&(semantic_id, instance_id)| {
            !mapping
                .channels_for(semantic_id)
                .iter()
                .any(|&channel| mapping.instance_slots()[channel] == instance_id)
        })
        .collect();

    assemble(slots, unassigned)
}

/// Check every channel got a cost and gather the per-image records.
fn assemble<B: Backend>(
    slots: Vec<Option<ChannelCost<B>>>,
    unassigned: Vec<(i64, i64)>,
) -> LossResult<ImageMatch<B>> {
    let mut filled = Vec::with_capacity(slots.len());
    for (channel, slot) in slots.into_iter().enumerate() {
        let Some(slot) = slot else {
            return Err(LossError::UnfilledChannel { channel });
        };
        filled.push(slot);
    }

    let costs: Vec<Tensor<B, 1>> = filled.iter().map(|slot| slot.cost.clone()).collect();
    let values = host_values(&costs);

    let channels = filled
        .iter()
        .zip(&values)
        .enumerate()
        .map(|(channel, (slot, &value))| {
            ensure_finite("channel cost", value)?;
            Ok(ChannelAssignment::new(
                channel,
                slot.semantic_id,
                slot.instance,
                value,
            ))
        })
        .collect::<LossResult<Vec<_>>>()?;

    Ok(ImageMatch::new(
        ImageAssignment::new(channels, unassigned),
        Tensor::cat(costs, 0),
    ))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use approx::assert_abs_diff_eq;

    use super::*;
    use crate::{
        labels::{LabelBatch, LabelMap},
        loss::kernel::LossType,
        tests::TestBackend,
    };

    fn soft_iou() -> PixelLossKernel {
        PixelLossKernel::new(LossType::SoftIou, false, 1e-5).unwrap()
    }

    fn single_image(
        semantic: Vec<i64>,
        instance: Vec<i64>,
        size: [usize; 2],
    ) -> ImageLabels<TestBackend> {
        let items = [LabelMap::new(semantic, instance, size)];
        LabelBatch::from_maps(&items, &Default::default())
            .unwrap()
            .image(0, -1)
    }

    #[test]
    fn channels_follow_the_instances_they_predict() {
        let device = Default::default();
        let mapping = ChannelMapping::from_instance_counts(&[1, 2]).unwrap();
        let labels = single_image(vec![0, 1, 1, 1], vec![0, 4, 9, 9], [2, 2]);
        // channel 1 predicts instance 9, channel 2 predicts instance 4
        let predictions = Tensor::<TestBackend, 3>::from_floats(
            [
                [[1.0, 0.0], [0.0, 0.0]],
                [[0.0, 0.0], [1.0, 1.0]],
                [[0.0, 1.0], [0.0, 0.0]],
            ],
            &device,
        );

        let result = match_image(&soft_iou(), &mapping, &predictions, &labels).unwrap();

        let instances: Vec<_> = result
            .assignment
            .channels
            .iter()
            .map(|record| record.instance)
            .collect();
        assert_eq!(
            instances,
            vec![
                AssignedInstance::Instance(0),
                AssignedInstance::Instance(9),
                AssignedInstance::Instance(4),
            ]
        );
        assert!(result.assignment.unassigned.is_empty());
        assert_eq!(result.costs.dims(), [3]);
        assert_abs_diff_eq!(result.assignment.total_cost(), 0.0, epsilon = 1e-5);
    }

    #[test]
    fn surplus_instances_are_leftovers() {
        let device = Default::default();
        let mapping = ChannelMapping::new(vec![0, 1], vec![0, 1]).unwrap();
        let labels = single_image(vec![0, 1, 1, 1], vec![0, 1, 2, 2], [1, 4]);
        let predictions = Tensor::<TestBackend, 3>::from_floats(
            [[[1.0, 0.0, 0.0, 0.0]], [[0.0, 0.0, 1.0, 1.0]]],
            &device,
        );

        let result = match_image(&soft_iou(), &mapping, &predictions, &labels).unwrap();

        assert_eq!(result.assignment.assigned_instances(1), vec![2]);
        assert_eq!(result.assignment.unassigned, vec![(1, 1)]);
    }

    #[test]
    fn absent_class_turns_every_channel_into_a_false_positive() {
        let device = Default::default();
        let mapping = ChannelMapping::from_instance_counts(&[1, 2]).unwrap();
        let labels = single_image(vec![0, 0, 0, 0], vec![0, 0, 0, 0], [1, 4]);
        let predictions = Tensor::<TestBackend, 3>::from_floats(
            [
                [[1.0, 1.0, 1.0, 1.0]],
                [[0.0, 0.0, 0.0, 0.0]],
                [[0.0, 0.0, 0.0, 0.0]],
            ],
            &device,
        );

        let result = match_image(&soft_iou(), &mapping, &predictions, &labels).unwrap();

        assert_eq!(result.assignment.n_false_positives(), 2);
        assert!(result.assignment.assigned_instances(1).is_empty());
        assert!(result.assignment.unassigned.is_empty());
        assert_abs_diff_eq!(result.assignment.total_cost(), 0.0, epsilon = 1e-5);
    }

    #[test]
    fn cheapest_channels_take_the_instances_and_the_rest_are_false_positives() {
        let device = Default::default();
        let mapping = ChannelMapping::new(vec![1, 1, 1], vec![1, 2, 3]).unwrap();
        let labels = single_image(vec![1, 1, 1, 1], vec![5, 5, 6, 6], [1, 4]);
        let predictions = Tensor::<TestBackend, 3>::from_floats(
            [
                [[0.0, 0.0, 1.0, 1.0]],
                [[0.0, 0.0, 0.0, 0.0]],
                [[1.0, 1.0, 0.0, 0.0]],
            ],
            &device,
        );

        let result = match_image(&soft_iou(), &mapping, &predictions, &labels).unwrap();

        let instances: Vec<_> = result
            .assignment
            .channels
            .iter()
            .map(|record| record.instance)
            .collect();
        assert_eq!(
            instances,
            vec![
                AssignedInstance::Instance(6),
                AssignedInstance::FalsePositive,
                AssignedInstance::Instance(5),
            ]
        );
    }

    #[test]
    fn assigned_and_leftover_instances_cover_the_ground_truth() {
        let device = Default::default();
        let mapping = ChannelMapping::new(vec![0, 1, 1, 2], vec![0, 1, 2, 1]).unwrap();
        let labels = single_image(
            vec![0, 1, 1, 1, 2, 2, 2, 0],
            vec![0, 1, 2, 3, 1, 2, 2, 0],
            [2, 4],
        );
        let predictions = Tensor::<TestBackend, 3>::ones([4, 2, 4], &device).div_scalar(4.0);

        let result = match_image(&soft_iou(), &mapping, &predictions, &labels).unwrap();

        for semantic_id in [1, 2] {
            let assigned = result.assignment.assigned_instances(semantic_id);
            let leftover = result.assignment.leftover_instances(semantic_id);
            let covered: BTreeSet<_> = assigned.iter().chain(&leftover).copied().collect();
            assert_eq!(covered.len(), assigned.len() + leftover.len());
            assert_eq!(
                covered.into_iter().collect::<Vec<_>>(),
                labels.instances_present(semantic_id)
            );
        }
        assert_eq!(result.assignment.unassigned.len(), 2);
    }

    #[test]
    fn semantic_only_class_costs_the_whole_region() {
        let device = Default::default();
        let mapping = ChannelMapping::new(vec![3], vec![0]).unwrap();
        let labels = single_image(vec![3, 3, 0, 3], vec![0, 0, 0, 0], [1, 4]);
        let predictions =
            Tensor::<TestBackend, 3>::from_floats([[[1.0, 0.0, 0.0, 1.0]]], &device);
        let kernel = soft_iou();

        let result = match_image(&kernel, &mapping, &predictions, &labels).unwrap();
        let expected = kernel
            .component_loss(
                channel_map(&predictions, 0),
                labels.semantic_mask(3),
                labels.normalizer(),
            )
            .unwrap();

        let record = &result.assignment.channels[0];
        assert_eq!(record.instance, AssignedInstance::Instance(0));
        assert_eq!(record.semantic_id, 3);
        assert_abs_diff_eq!(
            record.cost,
            expected.into_scalar().elem::<f64>(),
            epsilon = 1e-9
        );
        // intersection 2, union 3
        assert_abs_diff_eq!(record.cost, 1.0 / 3.0, epsilon = 1e-4);
    }

    #[test]
    fn instance_zero_in_a_matched_class_is_rejected() {
        let device = Default::default();
        let mapping = ChannelMapping::new(vec![1, 1], vec![1, 2]).unwrap();
        let labels = single_image(vec![1, 1], vec![0, 1], [1, 2]);
        let predictions = Tensor::<TestBackend, 3>::zeros([2, 1, 2], &device);

        let err = match_image(&soft_iou(), &mapping, &predictions, &labels).unwrap_err();

        assert_eq!(err, LossError::UnexpectedInstanceZero { semantic_id: 1 });
    }

    #[test]
    fn static_targets_skip_the_search() {
        let device = Default::default();
        let mapping = ChannelMapping::from_instance_counts(&[1, 2]).unwrap();
        // instance 1 of class 1 is absent, instance 3 has no channel
        let labels = single_image(vec![0, 1, 1, 1], vec![0, 2, 3, 3], [1, 4]);
        // channel 2 predicts instance 2 perfectly, channel 1 predicts nothing
        let predictions = Tensor::<TestBackend, 3>::from_floats(
            [
                [[1.0, 0.0, 0.0, 0.0]],
                [[0.0, 0.0, 0.0, 0.0]],
                [[0.0, 1.0, 0.0, 0.0]],
            ],
            &device,
        );

        let result = match_image_static(&soft_iou(), &mapping, &predictions, &labels).unwrap();

        let instances: Vec<_> = result
            .assignment
            .channels
            .iter()
            .map(|record| record.instance)
            .collect();
        assert_eq!(
            instances,
            vec![
                AssignedInstance::Instance(0),
                AssignedInstance::FalsePositive,
                AssignedInstance::Instance(2),
            ]
        );
        assert_eq!(result.assignment.unassigned, vec![(1, 3)]);
        assert_abs_diff_eq!(result.assignment.total_cost(), 0.0, epsilon = 1e-5);
    }
}
