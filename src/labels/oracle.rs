use burn::prelude::*;

use super::LabelBatch;
use crate::problem::ChannelMapping;

/// Score tensor `[batch_size, channels, height, width]` that predicts the ground truth perfectly
/// under the static channel layout.
///
/// Channel `c` holds `confidence` on the pixels of its configured (semantic id, slot) target
/// and 0 elsewhere; a semantic-only channel covers its whole semantic region. Useful to probe
/// how the loss responds as predictions approach the labels.
pub fn oracle_scores<B: Backend>(
    mapping: &ChannelMapping,
    labels: &LabelBatch<B>,
    void_value: i64,
    confidence: f64,
) -> Tensor<B, 4> {
    let images = (0..labels.batch_size())
        .map(|index| {
            let image = labels.image(index, void_value);
            let channels = mapping
                .semantic_ids()
                .iter()
                .zip(mapping.instance_slots())
                .map(|(&semantic_id, &slot)| {
                    let target = if mapping.is_semantic_only(semantic_id) {
                        image.semantic_mask(semantic_id)
                    } else {
                        image.instance_mask(semantic_id, slot)
                    };
                    target.mul_scalar(confidence)
                })
                .collect();
            Tensor::stack::<3>(channels, 0)
        })
        .collect();

    Tensor::stack::<4>(images, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{labels::LabelMap, tests::TestBackend};

    #[test]
    fn oracle_scores_light_up_configured_targets() {
        let device = Default::default();
        let mapping = ChannelMapping::from_instance_counts(&[1, 2]).unwrap();
        let labels = LabelBatch::<TestBackend>::from_maps(
            &[LabelMap::new(vec![0, 1, 1, 0], vec![0, 2, 1, 0], [2, 2])],
            &device,
        )
        .unwrap();

        let scores = oracle_scores(&mapping, &labels, -1, 10.0);

        assert_eq!(scores.dims(), [1, 3, 2, 2]);
        scores.into_data().assert_eq(
            &TensorData::from([[
                [[10.0f32, 0.0], [0.0, 10.0]],
                [[0.0, 0.0], [10.0, 0.0]],
                [[0.0, 10.0], [0.0, 0.0]],
            ]]),
            false,
        );
    }
}
