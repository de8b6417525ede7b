/// Constants used by tar shard scanning and member pairing.
pub mod archive {
    /// Suffix identifying image payload members.
    pub const IMAGE_SUFFIX: &str = ".jpg";
    /// Suffix of paired annotation members in training shards.
    pub const JSON_SUFFIX: &str = ".json";
    /// Suffix of paired annotation members in validation shards.
    pub const TEXT_SUFFIX: &str = ".txt";
    /// Extension of shard files.
    pub const SHARD_EXTENSION: &str = "tar";
    /// Default number of neighbouring members searched for a JSON annotation.
    ///
    /// Packers usually place pairs adjacently; pairs farther apart are missed.
    pub const DEFAULT_PAIR_SEARCH_WINDOW: usize = 5;
    /// Prefix for training staging directories.
    pub const TRAIN_STAGING_PREFIX: &str = "shardmix_extract_";
    /// Prefix for validation staging directories.
    pub const VALIDATION_STAGING_PREFIX: &str = "shardmix_val_extract_";
    /// Default shard file prefix (`<prefix>-<split>-*.tar`).
    pub const DEFAULT_SHARD_PREFIX: &str = "cc3m";
    /// Split segment used by training shard names.
    pub const TRAIN_SPLIT: &str = "train";
    /// Split segment used by validation shard names.
    pub const VALIDATION_SPLIT: &str = "validation";
}

/// Constants used by the canonical on-disk layouts.
pub mod layout {
    /// Training image folder under the target directory.
    pub const LOCAL_FOLDER: &str = "local_folder";
    /// Training caption folder under the target directory.
    pub const CAP_FOLDER: &str = "cap_folder";
    /// Default shard sub-directory inside `local_folder`/`cap_folder`.
    pub const DEFAULT_SHARD_DIR: &str = "000000";
    /// Training index file.
    pub const DATA_INFO_FILE: &str = "data_info.json";
    /// Original-name to canonical-id mapping file.
    pub const MAPPING_FILE: &str = "original_mapping.json";
    /// Validation image folder.
    pub const IMAGES_DIR: &str = "images";
    /// Validation caption folder.
    pub const TEXTS_DIR: &str = "texts";
    /// Digits used for training canonical ids.
    pub const TRAIN_ID_WIDTH: usize = 7;
    /// Digits used for validation canonical ids.
    pub const VALIDATION_ID_WIDTH: usize = 8;
    /// Extension of canonical images.
    pub const IMAGE_EXTENSION: &str = "jpg";
    /// Extension of training caption files.
    pub const CAPTION_JSON_EXTENSION: &str = "json";
    /// Extension of validation caption files.
    pub const CAPTION_TEXT_EXTENSION: &str = "txt";
    /// Annotation status marking a successfully downloaded sample.
    pub const SUCCESS_STATUS: &str = "success";
}

/// Constants used by the run controller.
pub mod run {
    /// Most samples requested from one training shard per pass.
    pub const TRAIN_PER_SHARD_CAP: usize = 1000;
    /// Most samples requested from one validation shard per pass.
    pub const VALIDATION_PER_SHARD_CAP: usize = 500;
    /// Progress log cadence (committed samples) for training runs.
    pub const TRAIN_PROGRESS_EVERY: usize = 100;
    /// Progress log cadence (committed samples) for validation runs.
    pub const VALIDATION_PROGRESS_EVERY: usize = 50;
    /// Default training target when no count is supplied.
    pub const DEFAULT_TRAIN_TARGET: usize = 20_000;
    /// Default validation target when no count is supplied.
    pub const DEFAULT_VALIDATION_TARGET: usize = 1000;
    /// Default raw shard directory.
    pub const DEFAULT_DATASET_DIR: &str = "../dataset/cc3m";
    /// Default training target directory.
    pub const DEFAULT_TRAIN_TARGET_DIR: &str = "../data/cc3m_train";
    /// Default validation target directory.
    pub const DEFAULT_VALIDATION_TARGET_DIR: &str = "../data/cc3m_validation";
}

/// Constants used by the multi-source sampler.
pub mod sampler {
    /// Offset mixed into per-epoch seed derivation.
    pub const EPOCH_SEED_OFFSET: u64 = 0xB4C3_5EED;
    /// Default sampler seed.
    pub const DEFAULT_SEED: u64 = 42;
    /// Default fixed batch size shared by all sources.
    pub const DEFAULT_BATCH_SIZE: usize = 32;
}

/// Constants used by collation and example building.
pub mod collate {
    /// Example type tag for text-to-image generation records.
    pub const TEXT2IMAGE: &str = "text2image";
    /// Example type tag for image captioning (understanding) records.
    pub const IMAGE2TEXT: &str = "image2text";
    /// Label value ignored by the loss.
    pub const IGNORE_INDEX: i64 = -100;
}

/// Constants used by per-example dataset readers.
pub mod dataset {
    /// Placeholder replaced by the caption in prompt templates.
    pub const PROMPT_PLACEHOLDER: &str = "{input}";
    /// Default probability of dropping a caption for classifier-free guidance.
    pub const DEFAULT_UNCONDITIONAL: f32 = 0.1;
    /// Default maximum token length for text-to-image prompts.
    pub const DEFAULT_MAX_LENGTH: usize = 128;
    /// Default square image resolution.
    pub const DEFAULT_IMAGE_SIZE: u32 = 512;
    /// Default bound on replacement draws for a failing record.
    pub const DEFAULT_MAX_RETRIES: usize = 16;
    /// Hub field holding image bytes in webdataset-style collections.
    pub const WEBDATASET_IMAGE_FIELD: &str = "jpg";
    /// Hub field holding captions in webdataset-style collections.
    pub const WEBDATASET_CAPTION_FIELD: &str = "txt";
}

/// Constants used by evaluation data preparation.
pub mod evaluation {
    /// Default ground-truth caption directory.
    pub const DEFAULT_GT_TEXT_DIR: &str = "../data/cc3m_validation/texts";
    /// Default model output root.
    pub const DEFAULT_MODEL_OUTPUT_ROOT: &str = "../output";
    /// Default evaluation output root.
    pub const DEFAULT_EVAL_OUTPUT_ROOT: &str = "../eval_res";
}

/// Loader and prefetcher settings.
pub mod loader {
    /// Batches buffered ahead of the consumer.
    pub const DEFAULT_PREFETCH_CAPACITY: usize = 1;
    /// Source key reported when the prefetch worker is gone.
    pub const PREFETCHER_SOURCE_KEY: &str = "prefetcher";
    pub const PREFETCHER_STOPPED_REASON: &str = "prefetch worker stopped";
}
