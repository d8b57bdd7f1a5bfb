use std::collections::BTreeSet;

use burn::prelude::*;
use derive_new::new;

use crate::error::{LossError, LossResult};

/// Host-side ground truth for one image: row-major semantic and instance maps.
#[derive(new, Clone, Debug)]
pub struct LabelMap {
    pub semantic: Vec<i64>,
    pub instance: Vec<i64>,
    pub size: [usize; 2],
}

/// Batch of ground-truth label pairs, `[batch_size, height, width]` each.
///
/// A host copy of both maps is taken once at construction; instance enumeration and
/// normalisers are read from it so the per-image loop does not synchronise with the device.
#[derive(Clone, Debug)]
pub struct LabelBatch<B: Backend> {
    pub semantic: Tensor<B, 3, Int>,
    pub instance: Tensor<B, 3, Int>,
    host_semantic: Vec<i64>,
    host_instance: Vec<i64>,
}

impl<B: Backend> LabelBatch<B> {
    /// Wrap two label tensors, checking that their shapes agree.
    pub fn new(semantic: Tensor<B, 3, Int>, instance: Tensor<B, 3, Int>) -> LossResult<Self> {
        let semantic_dims = semantic.dims();
        let instance_dims = instance.dims();
        if semantic_dims != instance_dims {
            return Err(LossError::ShapeMismatch {
                context: "instance label vs semantic label",
                expected: semantic_dims.to_vec(),
                actual: instance_dims.to_vec(),
            });
        }

        let host_semantic = semantic.to_data().iter::<i64>().collect();
        let host_instance = instance.to_data().iter::<i64>().collect();

        Ok(Self {
            semantic,
            instance,
            host_semantic,
            host_instance,
        })
    }

    /// Build a batch from host label maps. All maps must share one size.
    pub fn from_maps(items: &[LabelMap], device: &B::Device) -> LossResult<Self> {
        let Some(first) = items.first() else {
            return Err(LossError::InvalidParameter {
                parameter: "items",
                reason: "a label batch needs at least one image".to_string(),
            });
        };
        let [height, width] = first.size;

        let mut semantic = Vec::with_capacity(items.len() * height * width);
        let mut instance = Vec::with_capacity(items.len() * height * width);

        for item in items {
            if item.size != first.size {
                return Err(LossError::ShapeMismatch {
                    context: "label map size",
                    expected: first.size.to_vec(),
                    actual: item.size.to_vec(),
                });
            }
            let pixels = height * width;
            for (context, len) in [
                ("semantic label map", item.semantic.len()),
                ("instance label map", item.instance.len()),
            ] {
                if len != pixels {
                    return Err(LossError::ShapeMismatch {
                        context,
                        expected: vec![pixels],
                        actual: vec![len],
                    });
                }
            }
            semantic.extend_from_slice(&item.semantic);
            instance.extend_from_slice(&item.instance);
        }

        let shape = Shape::new([items.len(), height, width]);
        let semantic = Tensor::<B, 3, Int>::from_data(
            TensorData::new(semantic, shape.clone()).convert::<B::IntElem>(),
            device,
        );
        let instance = Tensor::<B, 3, Int>::from_data(
            TensorData::new(instance, shape).convert::<B::IntElem>(),
            device,
        );

        Self::new(semantic, instance)
    }

    /// `[batch_size, height, width]`
    pub fn dims(&self) -> [usize; 3] {
        self.semantic.dims()
    }

    pub fn batch_size(&self) -> usize {
        self.dims()[0]
    }

    /// View of image `index`, with `void_value` marking ignored pixels.
    pub fn image(&self, index: usize, void_value: i64) -> ImageLabels<B> {
        let [_, height, width] = self.dims();
        let pixels = height * width;
        let range = index * pixels..(index + 1) * pixels;

        ImageLabels {
            semantic: self.semantic.clone().narrow(0, index, 1).reshape([height, width]),
            instance: self.instance.clone().narrow(0, index, 1).reshape([height, width]),
            host_semantic: self.host_semantic[range.clone()].to_vec(),
            host_instance: self.host_instance[range].to_vec(),
            void_value,
        }
    }
}

/// Ground truth of a single image, `[height, width]`.
#[derive(Clone, Debug)]
pub struct ImageLabels<B: Backend> {
    pub semantic: Tensor<B, 2, Int>,
    pub instance: Tensor<B, 2, Int>,
    host_semantic: Vec<i64>,
    host_instance: Vec<i64>,
    void_value: i64,
}

impl<B: Backend> ImageLabels<B> {
    pub fn dims(&self) -> [usize; 2] {
        self.semantic.dims()
    }

    pub fn void_value(&self) -> i64 {
        self.void_value
    }

    /// Distinct instance ids of `semantic_id` in this image, ascending, void excluded.
    pub fn instances_present(&self, semantic_id: i64) -> Vec<i64> {
        self.host_semantic
            .iter()
            .zip(&self.host_instance)
            .filter(|&(&sem, &inst)| sem == semantic_id && inst != self.void_value)
            .map(|(_, &inst)| inst)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Every (semantic id, instance id) pair present in the image, void excluded.
    pub fn instance_pairs(&self) -> BTreeSet<(i64, i64)> {
        self.host_semantic
            .iter()
            .zip(&self.host_instance)
            .filter(|&(&sem, &inst)| sem != self.void_value && inst != self.void_value)
            .map(|(&sem, &inst)| (sem, inst))
            .collect()
    }

    /// Number of labelled pixels (neither map void), floored at 1.
    ///
    /// Shared by every channel of the image when size averaging is enabled.
    pub fn normalizer(&self) -> usize {
        self.host_semantic
            .iter()
            .zip(&self.host_instance)
            .filter(|&(&sem, &inst)| sem != self.void_value && inst != self.void_value)
            .count()
            .max(1)
    }

    /// `semantic == semantic_id` as a {0, 1} float map.
    pub fn semantic_mask(&self, semantic_id: i64) -> Tensor<B, 2> {
        self.semantic.clone().equal_elem(semantic_id).float()
    }

    /// `(semantic == semantic_id) & (instance == instance_id)` as a {0, 1} float map.
    pub fn instance_mask(&self, semantic_id: i64, instance_id: i64) -> Tensor<B, 2> {
        self.semantic_mask(semantic_id) * self.instance.clone().equal_elem(instance_id).float()
    }

    /// All-zero target used to cost channels that match no instance.
    pub fn empty_mask(&self) -> Tensor<B, 2> {
        Tensor::zeros(self.dims(), &self.semantic.device())
    }
}
