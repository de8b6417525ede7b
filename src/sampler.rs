use rand::seq::SliceRandom;

use crate::config::SamplerConfig;
use crate::constants::sampler::EPOCH_SEED_OFFSET;
use crate::errors::PipelineError;
use crate::hash::{epoch_seed, source_epoch_seed};
use crate::types::SourceKey;

/// Splitmix64 generator driving epoch permutations.
///
/// Kept in-crate so a `(seed, epoch)` maps to the same batch order regardless
/// of which `rand` release provides `StdRng`.
#[derive(Debug, Clone)]
struct DeterministicRng {
    state: u64,
}

impl DeterministicRng {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64_internal(&mut self) -> u64 {
        let mut z = self.state.wrapping_add(0x9E3779B97F4A7C15);
        self.state = z;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
        z ^ (z >> 31)
    }
}

impl rand::RngCore for DeterministicRng {
    fn next_u32(&mut self) -> u32 {
        self.next_u64_internal() as u32
    }

    fn next_u64(&mut self) -> u64 {
        self.next_u64_internal()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        let mut offset = 0;
        while offset < dest.len() {
            let bytes = self.next_u64_internal().to_le_bytes();
            let copy_len = (dest.len() - offset).min(bytes.len());
            dest[offset..offset + copy_len].copy_from_slice(&bytes[..copy_len]);
            offset += copy_len;
        }
    }
}

/// One source's slice of the concatenated global index space.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceRange {
    pub key: SourceKey,
    /// First global index owned by the source.
    pub offset: usize,
    pub size: usize,
    pub repeat: usize,
}

impl SourceRange {
    pub fn contains(&self, global_index: usize) -> bool {
        global_index >= self.offset && global_index < self.offset + self.size
    }
}

/// Position of one batch inside an epoch's order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchSlot {
    pub source: usize,
    /// Chunk number within the source's batch list.
    pub chunk: usize,
}

/// Batch sampler over several concatenated sources.
///
/// Guarantees:
/// - every batch holds exactly `batch_size` global indices,
/// - all indices of a batch belong to one source,
/// - a source with `size` examples and repeat factor `r` contributes
///   `r * floor(size / batch_size)` batches per epoch.
///
/// With `shuffle` on, each epoch permutes every source independently and then
/// permutes the concatenated batch order; the same `(seed, epoch)` always
/// produces the same sequence. With `shuffle` off, every epoch is identical:
/// sources in configured order, indices ascending.
#[derive(Clone, Debug)]
pub struct FixedBatchMultiSourceSampler {
    sources: Vec<SourceRange>,
    batch_size: usize,
    shuffle: bool,
    seed: u64,
    epoch: u64,
}

impl FixedBatchMultiSourceSampler {
    pub fn new(config: &SamplerConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        let mut offset = 0usize;
        let sources = config
            .sources
            .iter()
            .enumerate()
            .map(|(idx, source)| {
                let range = SourceRange {
                    key: source.label(idx),
                    offset,
                    size: source.size,
                    repeat: source.repeat,
                };
                offset += source.size;
                range
            })
            .collect();
        Ok(Self {
            sources,
            batch_size: config.batch_size,
            shuffle: config.shuffle,
            seed: config.seed,
            epoch: 0,
        })
    }

    pub fn sources(&self) -> &[SourceRange] {
        &self.sources
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn shuffle(&self) -> bool {
        self.shuffle
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Select the epoch used by [`Self::iter`].
    pub fn set_epoch(&mut self, epoch: u64) {
        self.epoch = epoch;
    }

    /// Size of the concatenated index space.
    pub fn total_size(&self) -> usize {
        self.sources.iter().map(|source| source.size).sum()
    }

    /// Full batches one pass over `source` yields.
    pub fn batches_per_pass(&self, source: usize) -> usize {
        self.sources
            .get(source)
            .map_or(0, |range| range.size / self.batch_size)
    }

    /// Batches per epoch across all sources and repeats.
    pub fn len(&self) -> usize {
        (0..self.sources.len())
            .map(|idx| self.sources[idx].repeat * self.batches_per_pass(idx))
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Source owning a global index.
    pub fn source_of(&self, global_index: usize) -> Option<usize> {
        let idx = self
            .sources
            .partition_point(|source| source.offset + source.size <= global_index);
        self.sources
            .get(idx)
            .filter(|source| source.contains(global_index))
            .map(|_| idx)
    }

    /// `(source, local index)` for a global index.
    pub fn locate(&self, global_index: usize) -> Option<(usize, usize)> {
        self.source_of(global_index)
            .map(|idx| (idx, global_index - self.sources[idx].offset))
    }

    /// Batch order for `epoch`, before indices are materialized.
    pub fn batch_order(&self, epoch: u64) -> Vec<BatchSlot> {
        let mut order: Vec<BatchSlot> = Vec::with_capacity(self.len());
        for (source, range) in self.sources.iter().enumerate() {
            let chunks = self.batches_per_pass(source);
            for _ in 0..range.repeat {
                order.extend((0..chunks).map(|chunk| BatchSlot { source, chunk }));
            }
        }
        if self.shuffle {
            let mut rng = DeterministicRng::new(epoch_seed(self.seed ^ EPOCH_SEED_OFFSET, epoch));
            order.shuffle(&mut rng);
        }
        order
    }

    fn source_permutation(&self, source: usize, epoch: u64) -> Vec<usize> {
        let range = &self.sources[source];
        let mut indices: Vec<usize> = (range.offset..range.offset + range.size).collect();
        if self.shuffle {
            let seed = source_epoch_seed(self.seed ^ EPOCH_SEED_OFFSET, epoch, source);
            indices.shuffle(&mut DeterministicRng::new(seed));
        }
        indices
    }

    /// Lazy batch stream for `epoch`.
    pub fn epoch_batches(&self, epoch: u64) -> EpochBatches {
        let permutations = (0..self.sources.len())
            .map(|source| self.source_permutation(source, epoch))
            .collect();
        EpochBatches {
            order: self.batch_order(epoch),
            permutations,
            batch_size: self.batch_size,
            cursor: 0,
        }
    }

    /// Lazy batch stream for the current epoch.
    pub fn iter(&self) -> EpochBatches {
        self.epoch_batches(self.epoch)
    }
}

impl<'a> IntoIterator for &'a FixedBatchMultiSourceSampler {
    type Item = Vec<usize>;
    type IntoIter = EpochBatches;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// One epoch of global-index batches.
#[derive(Clone, Debug)]
pub struct EpochBatches {
    order: Vec<BatchSlot>,
    permutations: Vec<Vec<usize>>,
    batch_size: usize,
    cursor: usize,
}

impl EpochBatches {
    /// Slot of the batch the next call to `next` returns.
    pub fn peek_slot(&self) -> Option<BatchSlot> {
        self.order.get(self.cursor).copied()
    }
}

impl Iterator for EpochBatches {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        let slot = *self.order.get(self.cursor)?;
        self.cursor += 1;
        let start = slot.chunk * self.batch_size;
        Some(self.permutations[slot.source][start..start + self.batch_size].to_vec())
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.order.len() - self.cursor;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for EpochBatches {}
