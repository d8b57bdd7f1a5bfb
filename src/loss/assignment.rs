use std::collections::{BTreeMap, BTreeSet};

use derive_new::new;

/// Ground-truth target a channel was matched to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AssignedInstance {
    /// A ground-truth instance id of the channel's semantic class.
    Instance(i64),
    /// No instance left for the channel; it was costed against an empty mask.
    FalsePositive,
}

impl AssignedInstance {
    pub fn instance_id(&self) -> Option<i64> {
        match self {
            AssignedInstance::Instance(id) => Some(*id),
            AssignedInstance::FalsePositive => None,
        }
    }

    pub fn is_false_positive(&self) -> bool {
        matches!(self, AssignedInstance::FalsePositive)
    }
}

/// Outcome for one output channel of one image.
#[derive(new, Clone, Debug, PartialEq)]
pub struct ChannelAssignment {
    pub channel: usize,
    pub semantic_id: i64,
    pub instance: AssignedInstance,
    /// Host copy of the cost this channel contributed.
    pub cost: f64,
}

/// Full assignment of one image, one record per channel in channel order.
#[derive(new, Clone, Debug, Default, PartialEq)]
pub struct ImageAssignment {
    pub channels: Vec<ChannelAssignment>,
    /// Ground-truth `(semantic id, instance id)` pairs no channel was matched to.
    pub unassigned: Vec<(i64, i64)>,
}

impl ImageAssignment {
    /// Instance ids of `semantic_id` covered by some channel, ascending.
    pub fn assigned_instances(&self, semantic_id: i64) -> Vec<i64> {
        self.channels
            .iter()
            .filter(|record| record.semantic_id == semantic_id)
            .filter_map(|record| record.instance.instance_id())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Instance ids of `semantic_id` left without a channel, ascending.
    pub fn leftover_instances(&self, semantic_id: i64) -> Vec<i64> {
        self.unassigned
            .iter()
            .filter(|(sem, _)| *sem == semantic_id)
            .map(|(_, inst)| *inst)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn n_false_positives(&self) -> usize {
        self.channels
            .iter()
            .filter(|record| record.instance.is_false_positive())
            .count()
    }

    /// Sum of the per-channel host costs.
    pub fn total_cost(&self) -> f64 {
        self.channels.iter().map(|record| record.cost).sum()
    }
}

/// Per-image assignments of one forward pass, in batch order.
#[derive(new, Clone, Debug, Default, PartialEq)]
pub struct BatchAssignment {
    pub images: Vec<ImageAssignment>,
}

impl BatchAssignment {
    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Channels matched to no instance, over the whole batch.
    pub fn n_false_positives(&self) -> usize {
        self.images
            .iter()
            .map(ImageAssignment::n_false_positives)
            .sum()
    }

    /// Ground-truth instances left without a channel, over the whole batch.
    pub fn n_leftovers(&self) -> usize {
        self.images.iter().map(|image| image.unassigned.len()).sum()
    }

    /// Number of channels matched to a real instance, per semantic class.
    pub fn matched_counts(&self) -> BTreeMap<i64, usize> {
        let mut counts = BTreeMap::new();
        for record in self.images.iter().flat_map(|image| &image.channels) {
            let count = counts.entry(record.semantic_id).or_insert(0);
            if !record.instance.is_false_positive() {
                *count += 1;
            }
        }
        counts
    }

    /// Assigned instance id per `[image][channel]`, `None` for false positives.
    pub fn instance_ids(&self) -> Vec<Vec<Option<i64>>> {
        self.images
            .iter()
            .map(|image| {
                image
                    .channels
                    .iter()
                    .map(|record| record.instance.instance_id())
                    .collect()
            })
            .collect()
    }
}
