//! Validation and commit of extracted samples into the canonical layout.

use serde_json::{Value, json};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::archive::ExtractedSample;
use crate::config::{ExtractionVariant, RunConfig};
use crate::constants::layout::{
    CAP_FOLDER, CAPTION_JSON_EXTENSION, CAPTION_TEXT_EXTENSION, IMAGE_EXTENSION, IMAGES_DIR,
    LOCAL_FOLDER, SUCCESS_STATUS, TEXTS_DIR,
};
use crate::errors::PipelineError;
use crate::store::{CanonicalRecord, DatasetIndex, OriginalMapping};
use crate::types::{CanonicalId, Caption};

/// Where canonical pairs land inside a target directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CanonicalLayout {
    /// `local_folder/<shard>/<id>.jpg` + `cap_folder/<shard>/<id>.json`, indexed by `data_info.json`.
    Training { target_dir: PathBuf, shard_dir: String },
    /// `images/<id>.jpg` + `texts/<id>.txt`.
    Validation { target_dir: PathBuf },
}

impl CanonicalLayout {
    pub fn for_run(config: &RunConfig) -> Self {
        match config.variant {
            ExtractionVariant::Train => Self::Training {
                target_dir: config.target_dir.clone(),
                shard_dir: config.shard_dir.clone(),
            },
            ExtractionVariant::Validation => Self::Validation {
                target_dir: config.target_dir.clone(),
            },
        }
    }

    pub fn target_dir(&self) -> &Path {
        match self {
            Self::Training { target_dir, .. } | Self::Validation { target_dir } => target_dir,
        }
    }

    pub fn image_dir(&self) -> PathBuf {
        match self {
            Self::Training {
                target_dir,
                shard_dir,
            } => target_dir.join(LOCAL_FOLDER).join(shard_dir),
            Self::Validation { target_dir } => target_dir.join(IMAGES_DIR),
        }
    }

    pub fn annotation_dir(&self) -> PathBuf {
        match self {
            Self::Training {
                target_dir,
                shard_dir,
            } => target_dir.join(CAP_FOLDER).join(shard_dir),
            Self::Validation { target_dir } => target_dir.join(TEXTS_DIR),
        }
    }

    pub fn ensure_dirs(&self) -> Result<(), PipelineError> {
        fs::create_dir_all(self.image_dir())?;
        fs::create_dir_all(self.annotation_dir())?;
        Ok(())
    }

    fn annotation_extension(&self) -> &'static str {
        match self {
            Self::Training { .. } => CAPTION_JSON_EXTENSION,
            Self::Validation { .. } => CAPTION_TEXT_EXTENSION,
        }
    }

    /// Absolute image/annotation paths plus the index record for `id`.
    pub fn paths_for(&self, id: &str) -> (PathBuf, PathBuf, CanonicalRecord) {
        let image_name = format!("{id}.{IMAGE_EXTENSION}");
        let annotation_name = format!("{id}.{}", self.annotation_extension());
        let record = match self {
            Self::Training { shard_dir, .. } => CanonicalRecord {
                image: format!("{shard_dir}/{image_name}"),
                annotation: format!("{shard_dir}/{annotation_name}"),
            },
            Self::Validation { .. } => CanonicalRecord {
                image: format!("{IMAGES_DIR}/{image_name}"),
                annotation: format!("{TEXTS_DIR}/{annotation_name}"),
            },
        };
        (
            self.image_dir().join(image_name),
            self.annotation_dir().join(annotation_name),
            record,
        )
    }
}

/// Why a sample failed validation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RejectReason {
    /// Training annotation without `status == "success"`.
    NotSuccess,
    /// Caption missing or blank.
    EmptyCaption,
    /// Annotation could not be read or parsed.
    Unreadable(String),
}

/// Result of committing one sample.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed(CanonicalId),
    Rejected(RejectReason),
    /// Original name already mapped.
    Duplicate,
    /// Canonical files for the candidate id already exist.
    TargetExists,
}

/// Zero-padded canonical id for the `committed`-th commit of a batch starting at `offset`.
///
/// Training ids are 1-based, validation ids 0-based.
pub fn canonical_id(variant: ExtractionVariant, offset: usize, committed: usize) -> CanonicalId {
    let number = match variant {
        ExtractionVariant::Train => offset + committed + 1,
        ExtractionVariant::Validation => offset + committed,
    };
    format!("{number:0width$}", width = variant.id_width())
}

/// Read and validate the caption held by an extracted annotation.
pub fn read_caption(
    variant: ExtractionVariant,
    annotation_path: &Path,
) -> Result<Caption, RejectReason> {
    let raw = fs::read(annotation_path).map_err(|err| RejectReason::Unreadable(err.to_string()))?;
    match variant {
        ExtractionVariant::Train => {
            let value: Value = serde_json::from_slice(&raw)
                .map_err(|err| RejectReason::Unreadable(err.to_string()))?;
            if value.get("status").and_then(Value::as_str) != Some(SUCCESS_STATUS) {
                return Err(RejectReason::NotSuccess);
            }
            match value.get("caption").and_then(Value::as_str) {
                Some(caption) if !caption.trim().is_empty() => Ok(caption.to_string()),
                _ => Err(RejectReason::EmptyCaption),
            }
        }
        ExtractionVariant::Validation => {
            let text = String::from_utf8(raw)
                .map_err(|err| RejectReason::Unreadable(err.to_string()))?;
            let caption = text.trim();
            if caption.is_empty() {
                return Err(RejectReason::EmptyCaption);
            }
            Ok(caption.to_string())
        }
    }
}

/// Commits validated samples to the canonical layout and keeps the index and
/// original-name mapping in step.
#[derive(Debug)]
pub struct Materializer {
    variant: ExtractionVariant,
    layout: CanonicalLayout,
    index: Option<DatasetIndex>,
    mapping: OriginalMapping,
    committed: Vec<CanonicalRecord>,
    progress_every: usize,
}

impl Materializer {
    /// Load persisted state for `config.target_dir` and create the layout folders.
    ///
    /// State is loaded before anything is created, so an unreadable index or
    /// mapping leaves the target directory untouched.
    pub fn open(config: &RunConfig) -> Result<Self, PipelineError> {
        let layout = CanonicalLayout::for_run(config);
        let index = match config.variant {
            ExtractionVariant::Train => Some(DatasetIndex::load(
                DatasetIndex::default_path_in_dir(&config.target_dir),
            )?),
            ExtractionVariant::Validation => None,
        };
        let mapping =
            OriginalMapping::load(OriginalMapping::default_path_in_dir(&config.target_dir))?;
        if let Some(index) = index.as_ref()
            && !index.is_empty()
            && !mapping.exists_on_disk()
        {
            warn!(
                index = %index.path().display(),
                records = index.len(),
                "existing index has no original-name mapping; earlier samples cannot be deduplicated"
            );
        }
        layout.ensure_dirs()?;
        Ok(Self {
            variant: config.variant,
            layout,
            index,
            mapping,
            committed: Vec::new(),
            progress_every: config.progress_every.max(1),
        })
    }

    pub fn layout(&self) -> &CanonicalLayout {
        &self.layout
    }

    pub fn mapping(&self) -> &OriginalMapping {
        &self.mapping
    }

    pub fn index(&self) -> Option<&DatasetIndex> {
        self.index.as_ref()
    }

    /// Records committed by this materializer instance.
    pub fn committed_records(&self) -> &[CanonicalRecord] {
        &self.committed
    }

    pub fn is_processed(&self, original_name: &str) -> bool {
        self.mapping.contains(original_name)
    }

    /// Canonical records currently materialized in the target directory.
    pub fn current_count(&self) -> Result<usize, PipelineError> {
        match self.index.as_ref() {
            Some(index) => Ok(index.len()),
            None => count_images(&self.layout.image_dir()),
        }
    }

    /// Validate and commit `samples`, numbering from `offset`.
    ///
    /// Returns the number of committed samples. The index and mapping are
    /// persisted once at the end of the batch.
    pub fn commit(
        &mut self,
        samples: &[ExtractedSample],
        offset: usize,
    ) -> Result<usize, PipelineError> {
        let mut committed = 0usize;
        for sample in samples {
            let id = canonical_id(self.variant, offset, committed);
            match self.commit_one(sample, &id) {
                Ok(CommitOutcome::Committed(_)) => {
                    committed += 1;
                    if (offset + committed) % self.progress_every == 0 {
                        info!(total = offset + committed, "materialized samples");
                    }
                }
                Ok(CommitOutcome::Rejected(reason)) => {
                    debug!(original = %sample.original_name, ?reason, "rejected sample");
                }
                Ok(CommitOutcome::Duplicate) => {
                    debug!(original = %sample.original_name, "skipping already mapped sample");
                }
                Ok(CommitOutcome::TargetExists) => {
                    debug!(original = %sample.original_name, id = %id, "canonical files exist; not overwriting");
                }
                Err(err) => {
                    warn!(original = %sample.original_name, error = %err, "failed to commit sample");
                }
            }
        }
        if committed > 0 {
            self.persist()?;
        }
        Ok(committed)
    }

    /// Validate and commit a single sample under `id`.
    pub fn commit_one(
        &mut self,
        sample: &ExtractedSample,
        id: &str,
    ) -> Result<CommitOutcome, PipelineError> {
        let caption = match read_caption(self.variant, &sample.annotation_path) {
            Ok(caption) => caption,
            Err(reason) => return Ok(CommitOutcome::Rejected(reason)),
        };
        if self.mapping.contains(&sample.original_name) {
            return Ok(CommitOutcome::Duplicate);
        }
        let (image_target, annotation_target, record) = self.layout.paths_for(id);
        if image_target.exists() || annotation_target.exists() {
            return Ok(CommitOutcome::TargetExists);
        }
        if let Err(err) = self.write_pair(sample, &caption, &image_target, &annotation_target) {
            let _ = fs::remove_file(&image_target);
            let _ = fs::remove_file(&annotation_target);
            return Err(err);
        }
        if let Some(index) = self.index.as_mut() {
            index.push(record.clone());
        }
        self.committed.push(record);
        self.mapping
            .insert(sample.original_name.clone(), id.to_string());
        Ok(CommitOutcome::Committed(id.to_string()))
    }

    fn write_pair(
        &self,
        sample: &ExtractedSample,
        caption: &str,
        image_target: &Path,
        annotation_target: &Path,
    ) -> Result<(), PipelineError> {
        fs::copy(&sample.image_path, image_target)?;
        match self.variant {
            ExtractionVariant::Train => {
                let body = serde_json::to_vec_pretty(&json!({ "caption": caption }))?;
                fs::write(annotation_target, body)?;
            }
            ExtractionVariant::Validation => fs::write(annotation_target, caption)?,
        }
        Ok(())
    }

    /// Persist the index (training layout) and the mapping.
    pub fn persist(&self) -> Result<(), PipelineError> {
        if let Some(index) = self.index.as_ref() {
            index.persist()?;
        }
        self.mapping.persist()
    }
}

fn count_images(dir: &Path) -> Result<usize, PipelineError> {
    if !dir.exists() {
        return Ok(0);
    }
    let count = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            entry
                .path()
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext == IMAGE_EXTENSION)
        })
        .count();
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{TempDir, tempdir};

    fn staged(dir: &TempDir, name: &str, annotation: &str, suffix: &str) -> ExtractedSample {
        let image_path = dir.path().join(format!("{name}.jpg"));
        let annotation_path = dir.path().join(format!("{name}{suffix}"));
        fs::write(&image_path, format!("pixels-{name}")).unwrap();
        fs::write(&annotation_path, annotation).unwrap();
        ExtractedSample {
            image_path,
            annotation_path,
            original_name: name.to_string(),
        }
    }

    #[test]
    fn canonical_ids_follow_variant_numbering() {
        assert_eq!(canonical_id(ExtractionVariant::Train, 0, 0), "0000001");
        assert_eq!(canonical_id(ExtractionVariant::Train, 41, 1), "0000043");
        assert_eq!(canonical_id(ExtractionVariant::Validation, 0, 0), "00000000");
        assert_eq!(canonical_id(ExtractionVariant::Validation, 10, 2), "00000012");
    }

    #[test]
    fn training_commit_rejects_invalid_annotations_without_advancing_ids() {
        let staging = tempdir().unwrap();
        let target = tempdir().unwrap();
        let config = RunConfig::train(staging.path(), target.path(), 10);
        let mut materializer = Materializer::open(&config).unwrap();
        let samples = vec![
            staged(&staging, "a", r#"{"status":"failed_to_download","caption":"x"}"#, ".json"),
            staged(&staging, "b", r#"{"status":"success","caption":""}"#, ".json"),
            staged(&staging, "c", r#"{"status":"success","caption":"a red bus"}"#, ".json"),
            staged(&staging, "d", "not json", ".json"),
        ];
        let committed = materializer.commit(&samples, 0).unwrap();
        assert_eq!(committed, 1);
        assert_eq!(materializer.mapping().get("c").map(String::as_str), Some("0000001"));

        let caption: Value = serde_json::from_slice(
            &fs::read(target.path().join("cap_folder/000000/0000001.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(caption, json!({ "caption": "a red bus" }));
        assert_eq!(
            fs::read(target.path().join("local_folder/000000/0000001.jpg")).unwrap(),
            b"pixels-c"
        );

        let index = DatasetIndex::load(DatasetIndex::default_path_in_dir(target.path())).unwrap();
        assert_eq!(
            index.records(),
            &[CanonicalRecord {
                image: "000000/0000001.jpg".into(),
                annotation: "000000/0000001.json".into(),
            }]
        );
    }

    #[test]
    fn existing_canonical_files_are_never_overwritten() {
        let staging = tempdir().unwrap();
        let target = tempdir().unwrap();
        let config = RunConfig::train(staging.path(), target.path(), 10);
        let mut materializer = Materializer::open(&config).unwrap();
        let occupied = target.path().join("local_folder/000000/0000001.jpg");
        fs::write(&occupied, b"keep me").unwrap();

        let sample = staged(&staging, "z", r#"{"status":"success","caption":"zebra"}"#, ".json");
        let outcome = materializer.commit_one(&sample, "0000001").unwrap();
        assert_eq!(outcome, CommitOutcome::TargetExists);
        assert_eq!(fs::read(&occupied).unwrap(), b"keep me");
        assert!(!materializer.is_processed("z"));
    }

    #[test]
    fn duplicate_original_names_commit_once() {
        let staging = tempdir().unwrap();
        let target = tempdir().unwrap();
        let config = RunConfig::train(staging.path(), target.path(), 10);
        let mut materializer = Materializer::open(&config).unwrap();
        let sample = staged(&staging, "dup", r#"{"status":"success","caption":"twice"}"#, ".json");
        let committed = materializer.commit(&[sample.clone(), sample], 0).unwrap();
        assert_eq!(committed, 1);
        assert_eq!(materializer.index().unwrap().len(), 1);
    }

    #[test]
    fn validation_layout_writes_trimmed_text() {
        let staging = tempdir().unwrap();
        let target = tempdir().unwrap();
        let config = RunConfig::validation(staging.path(), target.path(), 10);
        let mut materializer = Materializer::open(&config).unwrap();
        let samples = vec![
            staged(&staging, "v1", "   \n", ".txt"),
            staged(&staging, "v2", "  a cat on a mat \n", ".txt"),
        ];
        assert_eq!(materializer.commit(&samples, 5).unwrap(), 1);
        assert_eq!(
            fs::read_to_string(target.path().join("texts/00000005.txt")).unwrap(),
            "a cat on a mat"
        );
        assert_eq!(materializer.current_count().unwrap(), 1);
        assert_eq!(
            materializer.committed_records()[0].image,
            "images/00000005.jpg"
        );
    }

    #[test]
    fn unreadable_mapping_aborts_open_without_creating_layout() {
        let target = tempdir().unwrap();
        fs::write(OriginalMapping::default_path_in_dir(target.path()), b"[1, 2").unwrap();
        let config = RunConfig::train("unused", target.path(), 10);
        assert!(matches!(
            Materializer::open(&config),
            Err(PipelineError::State { .. })
        ));
        assert!(!target.path().join(LOCAL_FOLDER).exists());
    }
}
