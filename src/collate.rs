//! Type-tagged example collation.
//!
//! Examples from heterogeneous sources carry a `type_key`. [`CollateConcat`]
//! routes each example to the collate function registered for that key,
//! pads and stacks every group on its own, and merges the groups back into a
//! single batch in configured key order.

use indexmap::IndexMap;
use std::fmt;

use crate::config::{CollateKind, CollateSpec};
use crate::constants::collate::IGNORE_INDEX;
use crate::errors::PipelineError;
use crate::types::{SourceKey, TokenId, TypeKey};

/// Channel-first image tensor.
#[derive(Clone, Debug, PartialEq)]
pub struct PixelTensor {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    pub data: Vec<f32>,
}

impl PixelTensor {
    pub fn new(
        channels: usize,
        height: usize,
        width: usize,
        data: Vec<f32>,
    ) -> Result<Self, PipelineError> {
        if data.len() != channels * height * width {
            return Err(PipelineError::Image(format!(
                "{} values cannot fill a {channels}x{height}x{width} tensor",
                data.len()
            )));
        }
        Ok(Self {
            channels,
            height,
            width,
            data,
        })
    }

    pub fn shape(&self) -> [usize; 3] {
        [self.channels, self.height, self.width]
    }
}

/// One fetched training example.
#[derive(Clone, Debug, PartialEq)]
pub struct Example {
    pub type_key: TypeKey,
    pub input_ids: Vec<TokenId>,
    /// Target ids for understanding examples; `None` means "same as inputs".
    pub labels: Option<Vec<i64>>,
    pub pixel_values: Option<PixelTensor>,
    /// Source the example was drawn from, when known.
    pub source: Option<SourceKey>,
}

impl Example {
    pub fn new(type_key: impl Into<TypeKey>, input_ids: Vec<TokenId>) -> Self {
        Self {
            type_key: type_key.into(),
            input_ids,
            labels: None,
            pixel_values: None,
            source: None,
        }
    }

    pub fn with_labels(mut self, labels: Vec<i64>) -> Self {
        self.labels = Some(labels);
        self
    }

    pub fn with_pixels(mut self, pixels: PixelTensor) -> Self {
        self.pixel_values = Some(pixels);
        self
    }

    pub fn with_source(mut self, source: impl Into<SourceKey>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Stacked `[batch, channels, height, width]` pixels.
#[derive(Clone, Debug, PartialEq)]
pub struct PixelBatch {
    pub shape: [usize; 4],
    pub data: Vec<f32>,
}

/// Padded tensors for one type group.
#[derive(Clone, Debug, PartialEq)]
pub struct CollatedGroup {
    pub type_key: TypeKey,
    /// `[batch, longest]`, right-padded with the group's pad index.
    pub input_ids: Vec<Vec<i64>>,
    /// 1 for real tokens, 0 for padding.
    pub attention_mask: Vec<Vec<u8>>,
    /// `[batch, longest]`, padded with [`IGNORE_INDEX`]; understanding groups only.
    pub labels: Option<Vec<Vec<i64>>>,
    pub pixel_values: PixelBatch,
    pub sources: Vec<Option<SourceKey>>,
}

impl CollatedGroup {
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }

    /// Padded sequence length of the group.
    pub fn sequence_len(&self) -> usize {
        self.input_ids.first().map_or(0, Vec::len)
    }
}

/// Collate capability registered for one example type.
pub trait CollateFn: Send + Sync {
    fn collate(
        &self,
        type_key: &str,
        examples: &[&Example],
    ) -> Result<CollatedGroup, PipelineError>;
}

/// Text-to-image collation: padded prompts, mask, stacked target images.
#[derive(Clone, Copy, Debug)]
pub struct GenerationCollate {
    pub pad_index: i64,
}

/// Image-to-text collation: padded ids and labels, mask, stacked input images.
#[derive(Clone, Copy, Debug)]
pub struct UnderstandingCollate {
    pub pad_index: i64,
}

impl CollateFn for GenerationCollate {
    fn collate(
        &self,
        type_key: &str,
        examples: &[&Example],
    ) -> Result<CollatedGroup, PipelineError> {
        let (input_ids, attention_mask) = pad_sequences(examples, self.pad_index);
        Ok(CollatedGroup {
            type_key: type_key.to_string(),
            input_ids,
            attention_mask,
            labels: None,
            pixel_values: stack_pixels(type_key, examples)?,
            sources: examples.iter().map(|example| example.source.clone()).collect(),
        })
    }
}

impl CollateFn for UnderstandingCollate {
    fn collate(
        &self,
        type_key: &str,
        examples: &[&Example],
    ) -> Result<CollatedGroup, PipelineError> {
        let (input_ids, attention_mask) = pad_sequences(examples, self.pad_index);
        let longest = input_ids.first().map_or(0, Vec::len);
        let mut labels = Vec::with_capacity(examples.len());
        for example in examples {
            let mut row: Vec<i64> = match example.labels.as_ref() {
                Some(labels) => labels.clone(),
                None => example.input_ids.iter().map(|id| i64::from(*id)).collect(),
            };
            if row.len() > longest {
                return Err(PipelineError::Collation {
                    group: type_key.to_string(),
                    reason: format!(
                        "labels ({}) are longer than the padded inputs ({longest})",
                        row.len()
                    ),
                });
            }
            row.resize(longest, IGNORE_INDEX);
            labels.push(row);
        }
        Ok(CollatedGroup {
            type_key: type_key.to_string(),
            input_ids,
            attention_mask,
            labels: Some(labels),
            pixel_values: stack_pixels(type_key, examples)?,
            sources: examples.iter().map(|example| example.source.clone()).collect(),
        })
    }
}

fn pad_sequences(examples: &[&Example], pad_index: i64) -> (Vec<Vec<i64>>, Vec<Vec<u8>>) {
    let longest = examples
        .iter()
        .map(|example| example.input_ids.len())
        .max()
        .unwrap_or(0);
    examples
        .iter()
        .map(|example| {
            let mut ids: Vec<i64> = example.input_ids.iter().map(|id| i64::from(*id)).collect();
            let mut mask = vec![1u8; ids.len()];
            ids.resize(longest, pad_index);
            mask.resize(longest, 0);
            (ids, mask)
        })
        .unzip()
}

fn stack_pixels(type_key: &str, examples: &[&Example]) -> Result<PixelBatch, PipelineError> {
    let collation_err = |reason: String| PipelineError::Collation {
        group: type_key.to_string(),
        reason,
    };
    let mut shape: Option<[usize; 3]> = None;
    let mut data = Vec::new();
    for (position, example) in examples.iter().enumerate() {
        let pixels = example
            .pixel_values
            .as_ref()
            .ok_or_else(|| collation_err(format!("example {position} has no pixel values")))?;
        match shape {
            None => shape = Some(pixels.shape()),
            Some(expected) if expected != pixels.shape() => {
                return Err(collation_err(format!(
                    "example {position} has shape {:?}, expected {expected:?}",
                    pixels.shape()
                )));
            }
            Some(_) => {}
        }
        data.extend_from_slice(&pixels.data);
    }
    let [channels, height, width] = shape.unwrap_or([0, 0, 0]);
    Ok(PixelBatch {
        shape: [examples.len(), channels, height, width],
        data,
    })
}

/// Merged output of [`CollateConcat`], groups in configured key order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CollatedBatch {
    pub groups: IndexMap<TypeKey, CollatedGroup>,
}

impl CollatedBatch {
    pub fn get(&self, type_key: &str) -> Option<&CollatedGroup> {
        self.groups.get(type_key)
    }

    /// Examples across all groups.
    pub fn num_examples(&self) -> usize {
        self.groups.values().map(CollatedGroup::len).sum()
    }

    pub fn keys(&self) -> impl Iterator<Item = &TypeKey> {
        self.groups.keys()
    }
}

/// Routes examples to per-type collate functions and merges the results.
pub struct CollateConcat {
    collate_fns: IndexMap<TypeKey, Box<dyn CollateFn>>,
    keys: Vec<TypeKey>,
}

impl fmt::Debug for CollateConcat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollateConcat")
            .field("registered", &self.collate_fns.keys().collect::<Vec<_>>())
            .field("keys", &self.keys)
            .finish()
    }
}

impl CollateConcat {
    /// Build from explicit registrations; every key needs a collate function.
    pub fn new(
        collate_fns: Vec<(TypeKey, Box<dyn CollateFn>)>,
        keys: Vec<TypeKey>,
    ) -> Result<Self, PipelineError> {
        let mut registry: IndexMap<TypeKey, Box<dyn CollateFn>> = IndexMap::new();
        for (type_key, collate_fn) in collate_fns {
            if registry.insert(type_key.clone(), collate_fn).is_some() {
                return Err(PipelineError::Configuration(format!(
                    "collate function for '{type_key}' registered twice"
                )));
            }
        }
        if keys.is_empty() {
            return Err(PipelineError::Configuration(
                "collation needs at least one group key".into(),
            ));
        }
        if let Some(missing) = keys.iter().find(|key| !registry.contains_key(*key)) {
            return Err(PipelineError::UnknownExampleType(missing.clone()));
        }
        Ok(Self {
            collate_fns: registry,
            keys,
        })
    }

    /// Build the built-in collate functions described by `spec`.
    ///
    /// An empty key list defaults to the registered types in order.
    pub fn from_spec(spec: &CollateSpec) -> Result<Self, PipelineError> {
        let collate_fns = spec
            .groups
            .iter()
            .map(|group| {
                let collate_fn: Box<dyn CollateFn> = match group.collate {
                    CollateKind::Generation => Box::new(GenerationCollate {
                        pad_index: group.pad_index,
                    }),
                    CollateKind::Understanding => Box::new(UnderstandingCollate {
                        pad_index: group.pad_index,
                    }),
                };
                (group.type_key.clone(), collate_fn)
            })
            .collect();
        let keys = if spec.keys.is_empty() {
            spec.groups.iter().map(|group| group.type_key.clone()).collect()
        } else {
            spec.keys.clone()
        };
        Self::new(collate_fns, keys)
    }

    pub fn keys(&self) -> &[TypeKey] {
        &self.keys
    }

    /// Group, collate, and merge one batch. Groups without examples are omitted.
    pub fn collate(&self, examples: &[Example]) -> Result<CollatedBatch, PipelineError> {
        let mut grouped: IndexMap<&str, Vec<&Example>> = IndexMap::new();
        for example in examples {
            if !self.keys.contains(&example.type_key) {
                return Err(PipelineError::UnknownExampleType(example.type_key.clone()));
            }
            grouped
                .entry(example.type_key.as_str())
                .or_default()
                .push(example);
        }
        let mut batch = CollatedBatch::default();
        for key in &self.keys {
            let Some(members) = grouped.get(key.as_str()) else {
                continue;
            };
            let collate_fn = self
                .collate_fns
                .get(key)
                .ok_or_else(|| PipelineError::UnknownExampleType(key.clone()))?;
            batch
                .groups
                .insert(key.clone(), collate_fn.collate(key, members)?);
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CollateGroupSpec;
    use crate::constants::collate::{IMAGE2TEXT, TEXT2IMAGE};

    fn pixels(fill: f32) -> PixelTensor {
        PixelTensor::new(3, 2, 2, vec![fill; 12]).unwrap()
    }

    fn concat() -> CollateConcat {
        CollateConcat::from_spec(&CollateSpec {
            groups: vec![
                CollateGroupSpec {
                    type_key: IMAGE2TEXT.into(),
                    collate: CollateKind::Understanding,
                    pad_index: 0,
                },
                CollateGroupSpec {
                    type_key: TEXT2IMAGE.into(),
                    collate: CollateKind::Generation,
                    pad_index: 99,
                },
            ],
            keys: vec![TEXT2IMAGE.into(), IMAGE2TEXT.into()],
        })
        .unwrap()
    }

    #[test]
    fn mixed_batch_splits_into_padded_groups() {
        let examples = vec![
            Example::new(TEXT2IMAGE, vec![1, 2, 3]).with_pixels(pixels(0.5)),
            Example::new(IMAGE2TEXT, vec![4, 5, 6, 7, 8])
                .with_labels(vec![-100, -100, 6, 7, 8])
                .with_pixels(pixels(1.0)),
            Example::new(TEXT2IMAGE, vec![9]).with_pixels(pixels(-1.0)),
        ];
        let batch = concat().collate(&examples).unwrap();
        assert_eq!(
            batch.keys().collect::<Vec<_>>(),
            vec![&TEXT2IMAGE.to_string(), &IMAGE2TEXT.to_string()]
        );
        assert_eq!(batch.num_examples(), 3);

        let generation = batch.get(TEXT2IMAGE).unwrap();
        assert_eq!(generation.input_ids, vec![vec![1, 2, 3], vec![9, 99, 99]]);
        assert_eq!(generation.attention_mask, vec![vec![1, 1, 1], vec![1, 0, 0]]);
        assert_eq!(generation.pixel_values.shape, [2, 3, 2, 2]);
        assert!(generation.labels.is_none());

        let understanding = batch.get(IMAGE2TEXT).unwrap();
        assert_eq!(understanding.sequence_len(), 5);
        assert_eq!(
            understanding.labels.as_ref().unwrap()[0],
            vec![-100, -100, 6, 7, 8]
        );
    }

    #[test]
    fn understanding_labels_pad_with_ignore_index() {
        let examples = vec![
            Example::new(IMAGE2TEXT, vec![1, 2]).with_pixels(pixels(0.0)),
            Example::new(IMAGE2TEXT, vec![3, 4, 5, 6]).with_pixels(pixels(0.0)),
        ];
        let batch = concat().collate(&examples).unwrap();
        let labels = batch.get(IMAGE2TEXT).unwrap().labels.clone().unwrap();
        assert_eq!(labels[0], vec![1, 2, IGNORE_INDEX, IGNORE_INDEX]);
        assert!(batch.get(TEXT2IMAGE).is_none());
    }

    #[test]
    fn unregistered_type_fails_fast() {
        let examples = vec![Example::new("video2text", vec![1]).with_pixels(pixels(0.0))];
        match concat().collate(&examples) {
            Err(PipelineError::UnknownExampleType(key)) => assert_eq!(key, "video2text"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn keys_without_collate_fn_are_rejected_at_build() {
        let spec = CollateSpec {
            groups: vec![CollateGroupSpec {
                type_key: TEXT2IMAGE.into(),
                collate: CollateKind::Generation,
                pad_index: 0,
            }],
            keys: vec![TEXT2IMAGE.into(), IMAGE2TEXT.into()],
        };
        assert!(matches!(
            CollateConcat::from_spec(&spec),
            Err(PipelineError::UnknownExampleType(_))
        ));
    }

    #[test]
    fn mismatched_pixel_shapes_are_collation_errors() {
        let examples = vec![
            Example::new(TEXT2IMAGE, vec![1]).with_pixels(pixels(0.0)),
            Example::new(TEXT2IMAGE, vec![1])
                .with_pixels(PixelTensor::new(3, 1, 1, vec![0.0; 3]).unwrap()),
        ];
        assert!(matches!(
            concat().collate(&examples),
            Err(PipelineError::Collation { .. })
        ));
    }
}
