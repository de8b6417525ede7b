use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::constants::archive::{
    DEFAULT_PAIR_SEARCH_WINDOW, DEFAULT_SHARD_PREFIX, JSON_SUFFIX, TEXT_SUFFIX, TRAIN_SPLIT,
    TRAIN_STAGING_PREFIX, VALIDATION_SPLIT, VALIDATION_STAGING_PREFIX,
};
use crate::constants::layout::{DEFAULT_SHARD_DIR, TRAIN_ID_WIDTH, VALIDATION_ID_WIDTH};
use crate::constants::run::{
    TRAIN_PER_SHARD_CAP, TRAIN_PROGRESS_EVERY, VALIDATION_PER_SHARD_CAP,
    VALIDATION_PROGRESS_EVERY,
};
use crate::constants::sampler::{DEFAULT_BATCH_SIZE, DEFAULT_SEED};
use crate::errors::PipelineError;
use crate::types::{SourceKey, TypeKey};

/// Which shard family is being materialized.
///
/// The variant decides member ordering, annotation pairing, validation rules,
/// and the canonical output layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionVariant {
    /// `{name}.jpg` + `{name}.json` with `status`/`caption` fields.
    Train,
    /// `{name}.jpg` + `{name}.txt` holding the raw caption.
    Validation,
}

impl ExtractionVariant {
    /// Split segment of shard file names.
    pub fn split_name(self) -> &'static str {
        match self {
            Self::Train => TRAIN_SPLIT,
            Self::Validation => VALIDATION_SPLIT,
        }
    }

    /// Suffix of the annotation member paired with each image.
    pub fn annotation_suffix(self) -> &'static str {
        match self {
            Self::Train => JSON_SUFFIX,
            Self::Validation => TEXT_SUFFIX,
        }
    }

    pub fn staging_prefix(self) -> &'static str {
        match self {
            Self::Train => TRAIN_STAGING_PREFIX,
            Self::Validation => VALIDATION_STAGING_PREFIX,
        }
    }

    pub fn per_shard_cap(self) -> usize {
        match self {
            Self::Train => TRAIN_PER_SHARD_CAP,
            Self::Validation => VALIDATION_PER_SHARD_CAP,
        }
    }

    pub fn id_width(self) -> usize {
        match self {
            Self::Train => TRAIN_ID_WIDTH,
            Self::Validation => VALIDATION_ID_WIDTH,
        }
    }

    pub fn progress_every(self) -> usize {
        match self {
            Self::Train => TRAIN_PROGRESS_EVERY,
            Self::Validation => VALIDATION_PROGRESS_EVERY,
        }
    }

    /// Member enumeration order used while scanning a shard.
    pub fn member_order(self) -> MemberOrder {
        match self {
            Self::Train => MemberOrder::Lexicographic,
            Self::Validation => MemberOrder::Archive,
        }
    }
}

/// Order in which shard members are visited.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemberOrder {
    /// Sorted by member name.
    Lexicographic,
    /// As stored in the archive.
    Archive,
}

/// How an image member finds its annotation member.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PairingRule {
    /// Look at most `window` members before and after the image.
    Neighborhood { window: usize },
    /// Accept the exactly-named counterpart anywhere in the shard.
    ExactName,
}

/// Settings for scanning and extracting tar shards.
#[derive(Clone, Debug)]
pub struct ArchiveConfig {
    /// Shard family being scanned.
    pub variant: ExtractionVariant,
    /// Neighbourhood searched for JSON annotations (training variant only).
    pub pair_search_window: usize,
}

impl ArchiveConfig {
    pub fn new(variant: ExtractionVariant) -> Self {
        Self {
            variant,
            pair_search_window: DEFAULT_PAIR_SEARCH_WINDOW,
        }
    }

    pub fn with_pair_search_window(mut self, window: usize) -> Self {
        self.pair_search_window = window;
        self
    }

    pub fn pairing(&self) -> PairingRule {
        match self.variant {
            ExtractionVariant::Train => PairingRule::Neighborhood {
                window: self.pair_search_window,
            },
            ExtractionVariant::Validation => PairingRule::ExactName,
        }
    }
}

/// Disjoint shard assignment for one of several independent extraction workers.
///
/// Shard `i` (in sorted order) belongs to worker `i % worker_count`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShardAssignment {
    pub worker_index: usize,
    pub worker_count: usize,
}

impl Default for ShardAssignment {
    fn default() -> Self {
        Self {
            worker_index: 0,
            worker_count: 1,
        }
    }
}

impl ShardAssignment {
    pub fn new(worker_index: usize, worker_count: usize) -> Result<Self, PipelineError> {
        if worker_count == 0 || worker_index >= worker_count {
            return Err(PipelineError::Configuration(format!(
                "worker index {worker_index} is outside 0..{worker_count}"
            )));
        }
        Ok(Self {
            worker_index,
            worker_count,
        })
    }

    pub fn owns(&self, shard_position: usize) -> bool {
        shard_position % self.worker_count == self.worker_index
    }
}

/// Settings for one resumable materialization run.
#[derive(Clone, Debug)]
pub struct RunConfig {
    pub variant: ExtractionVariant,
    /// Directory holding `<prefix>-<split>-*.tar` shards.
    pub dataset_dir: PathBuf,
    /// Directory receiving the canonical layout.
    pub target_dir: PathBuf,
    /// Total canonical records wanted in `target_dir`.
    pub target_count: usize,
    /// Shard file prefix.
    pub shard_prefix: String,
    /// Sub-directory under `local_folder`/`cap_folder` (training layout).
    pub shard_dir: String,
    /// Upper bound on samples requested from one shard.
    pub per_shard_cap: usize,
    /// Committed-sample cadence of progress logs.
    pub progress_every: usize,
    pub archive: ArchiveConfig,
    pub assignment: ShardAssignment,
}

impl RunConfig {
    pub fn new(
        variant: ExtractionVariant,
        dataset_dir: impl Into<PathBuf>,
        target_dir: impl Into<PathBuf>,
        target_count: usize,
    ) -> Self {
        Self {
            variant,
            dataset_dir: dataset_dir.into(),
            target_dir: target_dir.into(),
            target_count,
            shard_prefix: DEFAULT_SHARD_PREFIX.to_string(),
            shard_dir: DEFAULT_SHARD_DIR.to_string(),
            per_shard_cap: variant.per_shard_cap(),
            progress_every: variant.progress_every(),
            archive: ArchiveConfig::new(variant),
            assignment: ShardAssignment::default(),
        }
    }

    pub fn train(
        dataset_dir: impl Into<PathBuf>,
        target_dir: impl Into<PathBuf>,
        target_count: usize,
    ) -> Self {
        Self::new(ExtractionVariant::Train, dataset_dir, target_dir, target_count)
    }

    pub fn validation(
        dataset_dir: impl Into<PathBuf>,
        target_dir: impl Into<PathBuf>,
        target_count: usize,
    ) -> Self {
        Self::new(
            ExtractionVariant::Validation,
            dataset_dir,
            target_dir,
            target_count,
        )
    }

    pub fn with_shard_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.shard_prefix = prefix.into();
        self
    }

    pub fn with_shard_dir(mut self, shard_dir: impl Into<String>) -> Self {
        self.shard_dir = shard_dir.into();
        self
    }

    pub fn with_per_shard_cap(mut self, cap: usize) -> Self {
        self.per_shard_cap = cap;
        self
    }

    pub fn with_pair_search_window(mut self, window: usize) -> Self {
        self.archive = self.archive.with_pair_search_window(window);
        self
    }

    pub fn with_assignment(mut self, assignment: ShardAssignment) -> Self {
        self.assignment = assignment;
        self
    }

    /// Shard file-name prefix including the split, e.g. `cc3m-train-`.
    pub fn shard_name_prefix(&self) -> String {
        format!("{}-{}-", self.shard_prefix, self.variant.split_name())
    }
}

/// One logical dataset feeding the multi-source sampler.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    /// Display name; empty names are reported as `source_<idx>`.
    #[serde(default)]
    pub name: SourceKey,
    /// Number of examples in the source.
    pub size: usize,
    /// How many times the source's batch list is replicated per epoch.
    #[serde(default = "default_repeat")]
    pub repeat: usize,
}

fn default_repeat() -> usize {
    1
}

impl SourceDescriptor {
    pub fn new(size: usize, repeat: usize) -> Self {
        Self {
            name: SourceKey::new(),
            size,
            repeat,
        }
    }

    pub fn named(name: impl Into<SourceKey>, size: usize, repeat: usize) -> Self {
        Self {
            name: name.into(),
            size,
            repeat,
        }
    }

    pub fn label(&self, idx: usize) -> SourceKey {
        if self.name.is_empty() {
            format!("source_{idx}")
        } else {
            self.name.clone()
        }
    }
}

/// Top-level multi-source sampler configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SamplerConfig {
    /// Sources in global index order.
    pub sources: Vec<SourceDescriptor>,
    /// Fixed batch size shared by every source.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Shuffle within sources and across the batch order each epoch.
    #[serde(default = "default_shuffle")]
    pub shuffle: bool,
    /// RNG seed that controls per-epoch permutations.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_shuffle() -> bool {
    true
}

fn default_seed() -> u64 {
    DEFAULT_SEED
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            batch_size: DEFAULT_BATCH_SIZE,
            shuffle: true,
            seed: DEFAULT_SEED,
        }
    }
}

impl SamplerConfig {
    /// Reject empty source lists, zero batch sizes, and zero repeat factors.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.batch_size == 0 {
            return Err(PipelineError::Configuration(
                "batch_size must be at least 1".into(),
            ));
        }
        if self.sources.is_empty() {
            return Err(PipelineError::Configuration(
                "sampler needs at least one source".into(),
            ));
        }
        for (idx, source) in self.sources.iter().enumerate() {
            if source.repeat == 0 {
                return Err(PipelineError::Configuration(format!(
                    "source '{}' has repeat factor 0",
                    source.label(idx)
                )));
            }
        }
        Ok(())
    }
}

/// Built-in collate behaviours.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollateKind {
    /// Text-to-image: padded prompt ids, attention mask, stacked pixels.
    Generation,
    /// Image-to-text: padded ids, padded labels, attention mask, stacked pixels.
    Understanding,
}

/// One registered collate function.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CollateGroupSpec {
    pub type_key: TypeKey,
    pub collate: CollateKind,
    pub pad_index: i64,
}

/// Collation registry: ordered collate functions plus expected group keys.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CollateSpec {
    pub groups: Vec<CollateGroupSpec>,
    pub keys: Vec<TypeKey>,
}

/// File-loadable sampler + collation settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MixConfig {
    pub sampler: SamplerConfig,
    #[serde(default)]
    pub collate: CollateSpec,
}

impl MixConfig {
    /// Load from a `.toml` or `.json` file, chosen by extension.
    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let raw = fs::read_to_string(path)?;
        let config: Self = match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => serde_json::from_str(&raw)?,
            _ => toml::from_str(&raw).map_err(|err| {
                PipelineError::Configuration(format!(
                    "failed to parse '{}': {err}",
                    path.display()
                ))
            })?,
        };
        config.sampler.validate()?;
        Ok(config)
    }
}
