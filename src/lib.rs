#![doc = include_str!("../README.md")]

/// Tar shard scanning, annotation pairing, and staging extraction.
pub mod archive;
/// Clap runners shared by the binaries.
pub mod apps;
/// Per-type collate functions and the concatenating collator.
pub mod collate;
/// Extraction, run, sampler, and collation configuration types.
pub mod config;
/// Centralized constants for layouts, run defaults, and sampling.
pub mod constants;
/// Example sources: canonical layout reader, hub collections, retries.
pub mod dataset;
/// Ground-truth/prediction pairing for caption evaluation.
pub mod evaluation;
mod hash;
/// Multi-source loader and background batch prefetcher.
pub mod loader;
/// Validation and commit of extracted samples.
pub mod materialize;
/// Per-source batch mix metrics.
pub mod metrics;
/// Resumable materialization runs.
pub mod run;
/// Fixed-batch multi-source sampler.
pub mod sampler;
/// Persisted dataset index and original-name mapping.
pub mod store;
/// Shared type aliases.
pub mod types;

mod errors;

pub use archive::{ExtractedSample, ExtractionStats, ShardExtractor};
pub use collate::{
    CollateConcat, CollateFn, CollatedBatch, CollatedGroup, Example, GenerationCollate,
    PixelTensor, UnderstandingCollate,
};
pub use config::{
    ArchiveConfig, CollateGroupSpec, CollateKind, CollateSpec, ExtractionVariant, MixConfig,
    RunConfig, SamplerConfig, ShardAssignment, SourceDescriptor,
};
pub use dataset::{
    CanonicalCaptionDataset, CaptionEncoder, ExampleSource, HubCaptionDataset, HubFields,
    ImagePreprocessor, RemoteHub, RemoteRecords, RetryingFetcher, SquareCropPreprocessor,
    Tokenizer,
};
pub use errors::PipelineError;
pub use loader::{BatchPrefetcher, LoaderOptions, MultiSourceLoader};
pub use materialize::{CommitOutcome, Materializer};
pub use run::{RunController, RunPhase, RunReport};
pub use sampler::FixedBatchMultiSourceSampler;
pub use store::{CanonicalRecord, DatasetIndex, OriginalMapping};
pub use types::{CanonicalId, Caption, OriginalName, RelativePath, SourceKey, TokenId, TypeKey};
