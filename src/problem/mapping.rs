use std::collections::BTreeMap;

use crate::error::{LossError, LossResult};

/// Fixed assignment of model output channels to (semantic class, instance slot) pairs.
///
/// Channels sharing a semantic id form the pool that competes for the ground-truth
/// instances of that class. A class with a single channel at slot 0 is semantic-only:
/// it scores the whole semantic region and never goes through matching.
///
/// The mapping is built once per model and only read afterwards.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelMapping {
    semantic_ids: Vec<i64>,
    instance_slots: Vec<i64>,
    semantic_values: Vec<i64>,
    channels_by_semantic: BTreeMap<i64, Vec<usize>>,
}

impl ChannelMapping {
    /// Create a mapping from two parallel per-channel sequences.
    ///
    /// # Errors
    ///
    /// - [`LossError::ChannelMappingLength`] if the sequences differ in length.
    /// - [`LossError::EmptyChannelMapping`] if there are no channels.
    /// - [`LossError::MixedInstanceSlots`] if a class combines slot 0 with other slots.
    pub fn new(semantic_ids: Vec<i64>, instance_slots: Vec<i64>) -> LossResult<Self> {
        if semantic_ids.len() != instance_slots.len() {
            return Err(LossError::ChannelMappingLength {
                semantic: semantic_ids.len(),
                instance: instance_slots.len(),
            });
        }
        if semantic_ids.is_empty() {
            return Err(LossError::EmptyChannelMapping);
        }

        let mut channels_by_semantic: BTreeMap<i64, Vec<usize>> = BTreeMap::new();
        for (channel, &semantic_id) in semantic_ids.iter().enumerate() {
            channels_by_semantic
                .entry(semantic_id)
                .or_default()
                .push(channel);
        }

        for (&semantic_id, channels) in &channels_by_semantic {
            let slots: Vec<i64> = channels.iter().map(|&c| instance_slots[c]).collect();
            if slots.len() > 1 && slots.contains(&0) {
                return Err(LossError::MixedInstanceSlots { semantic_id, slots });
            }
        }

        let semantic_values = channels_by_semantic.keys().copied().collect();

        Ok(Self {
            semantic_ids,
            instance_slots,
            semantic_values,
            channels_by_semantic,
        })
    }

    /// Build the usual layout from a per-semantic-class channel count.
    ///
    /// Semantic class `s` is the position in `counts`. A count of 1 yields one
    /// semantic-only channel (slot 0), a count of `n > 1` yields slots `1..=n`.
    pub fn from_instance_counts(counts: &[usize]) -> LossResult<Self> {
        let mut semantic_ids = Vec::new();
        let mut instance_slots = Vec::new();

        for (semantic_id, &count) in counts.iter().enumerate() {
            match count {
                0 => {
                    return Err(LossError::InvalidParameter {
                        parameter: "instance_counts",
                        reason: format!("semantic class {semantic_id} has no channel"),
                    });
                }
                1 => {
                    semantic_ids.push(semantic_id as i64);
                    instance_slots.push(0);
                }
                n => {
                    for slot in 1..=n {
                        semantic_ids.push(semantic_id as i64);
                        instance_slots.push(slot as i64);
                    }
                }
            }
        }

        Self::new(semantic_ids, instance_slots)
    }

    /// Number of model output channels.
    pub fn num_channels(&self) -> usize {
        self.semantic_ids.len()
    }

    /// Semantic id of every channel, in channel order.
    pub fn semantic_ids(&self) -> &[i64] {
        &self.semantic_ids
    }

    /// Instance slot of every channel, in channel order.
    pub fn instance_slots(&self) -> &[i64] {
        &self.instance_slots
    }

    /// Distinct semantic ids, sorted ascending.
    pub fn semantic_values(&self) -> &[i64] {
        &self.semantic_values
    }

    /// Channel indices bound to `semantic_id`, ascending. Empty if the class is unknown.
    pub fn channels_for(&self, semantic_id: i64) -> &[usize] {
        self.channels_by_semantic
            .get(&semantic_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Whether the class is scored by exactly one channel at slot 0.
    pub fn is_semantic_only(&self, semantic_id: i64) -> bool {
        matches!(self.channels_for(semantic_id), [c] if self.instance_slots[*c] == 0)
    }

    /// Whether any channel of the class sits at slot 0.
    pub fn has_slot_zero(&self, semantic_id: i64) -> bool {
        self.channels_for(semantic_id)
            .iter()
            .any(|&c| self.instance_slots[c] == 0)
    }

    /// Human readable label per channel, `"<class name> <slot>"`.
    ///
    /// Falls back to the numeric semantic id when `class_names` has no entry for it.
    pub fn channel_labels(&self, class_names: &[&str]) -> Vec<String> {
        self.semantic_ids
            .iter()
            .zip(&self.instance_slots)
            .map(|(&semantic_id, &slot)| {
                let name = usize::try_from(semantic_id)
                    .ok()
                    .and_then(|idx| class_names.get(idx))
                    .map(|name| name.to_string())
                    .unwrap_or_else(|| semantic_id.to_string());
                format!("{name} {slot}")
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_instance_counts_builds_semantic_and_instance_channels() {
        let mapping = ChannelMapping::from_instance_counts(&[1, 3, 2]).unwrap();

        assert_eq!(mapping.num_channels(), 6);
        assert_eq!(mapping.semantic_ids(), &[0, 1, 1, 1, 2, 2]);
        assert_eq!(mapping.instance_slots(), &[0, 1, 2, 3, 1, 2]);
        assert_eq!(mapping.semantic_values(), &[0, 1, 2]);
        assert_eq!(mapping.channels_for(1), &[1, 2, 3]);
        assert!(mapping.is_semantic_only(0));
        assert!(!mapping.is_semantic_only(1));
        assert!(mapping.channels_for(7).is_empty());
    }

    #[test]
    fn non_contiguous_channels_are_grouped_by_semantic_id() {
        let mapping = ChannelMapping::new(vec![2, 0, 2], vec![1, 0, 2]).unwrap();

        assert_eq!(mapping.semantic_values(), &[0, 2]);
        assert_eq!(mapping.channels_for(2), &[0, 2]);
    }

    #[test]
    fn single_channel_with_nonzero_slot_is_not_semantic_only() {
        let mapping = ChannelMapping::new(vec![0, 1], vec![0, 1]).unwrap();

        assert!(!mapping.is_semantic_only(1));
        assert!(!mapping.has_slot_zero(1));
    }

    #[test]
    fn slot_zero_mixed_with_other_slots_is_rejected() {
        let err = ChannelMapping::new(vec![1, 1, 2], vec![0, 1, 0]).unwrap_err();

        assert_eq!(
            err,
            LossError::MixedInstanceSlots {
                semantic_id: 1,
                slots: vec![0, 1]
            }
        );
    }

    #[test]
    fn length_mismatch_and_empty_mapping_are_rejected() {
        assert_eq!(
            ChannelMapping::new(vec![0, 1], vec![0]).unwrap_err(),
            LossError::ChannelMappingLength {
                semantic: 2,
                instance: 1
            }
        );
        assert_eq!(
            ChannelMapping::new(vec![], vec![]).unwrap_err(),
            LossError::EmptyChannelMapping
        );
        assert!(ChannelMapping::from_instance_counts(&[1, 0]).is_err());
    }

    #[test]
    fn channel_labels_use_class_names() {
        let mapping = ChannelMapping::from_instance_counts(&[1, 2]).unwrap();

        assert_eq!(
            mapping.channel_labels(&["background"]),
            vec!["background 0", "1 1", "1 2"]
        );
    }
}
