//! Caption evaluation inputs: ground truth from the validation layout paired
//! with one model's predictions.

use indexmap::IndexMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::constants::layout::CAPTION_TEXT_EXTENSION;
use crate::errors::PipelineError;
use crate::store::write_json_atomic;
use crate::types::{CanonicalId, Caption};

/// Paths for preparing one model's evaluation files.
#[derive(Clone, Debug)]
pub struct EvaluationPaths {
    /// `texts/` of a validation layout.
    pub ground_truth_dir: PathBuf,
    /// Directory of `<id>.txt` predictions.
    pub predictions_dir: PathBuf,
    /// Directory receiving the two JSON files.
    pub output_dir: PathBuf,
}

impl EvaluationPaths {
    /// `<model_root>/<model>` predictions and `<eval_root>/<model>` output.
    pub fn for_model(
        ground_truth_dir: impl Into<PathBuf>,
        model_root: &Path,
        eval_root: &Path,
        model: &str,
    ) -> Self {
        Self {
            ground_truth_dir: ground_truth_dir.into(),
            predictions_dir: model_root.join(model),
            output_dir: eval_root.join(model),
        }
    }
}

/// Files written by [`prepare_evaluation_data`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EvaluationFiles {
    pub ground_truth: PathBuf,
    pub predictions: PathBuf,
    pub common: usize,
}

fn caption_files(dir: &Path) -> Vec<(CanonicalId, PathBuf)> {
    let mut files: Vec<(CanonicalId, PathBuf)> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            let path = entry.into_path();
            let is_text = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext == CAPTION_TEXT_EXTENSION);
            let stem = path.file_stem()?.to_str()?.to_string();
            is_text.then_some((stem, path))
        })
        .collect();
    files.sort();
    files
}

/// Non-empty trimmed ground-truth captions keyed by id, each wrapped in a list.
pub fn load_ground_truth(dir: &Path) -> IndexMap<CanonicalId, Vec<Caption>> {
    let mut captions = IndexMap::new();
    for (id, path) in caption_files(dir) {
        match fs::read_to_string(&path) {
            Ok(text) if !text.trim().is_empty() => {
                captions.insert(id, vec![text.trim().to_string()]);
            }
            Ok(_) => {}
            Err(err) => warn!(path = %path.display(), error = %err, "skipping unreadable caption"),
        }
    }
    captions
}

/// First line of each trimmed prediction file, keyed by id; empty files are skipped.
pub fn load_predictions(dir: &Path) -> IndexMap<CanonicalId, Caption> {
    let mut predictions = IndexMap::new();
    for (id, path) in caption_files(dir) {
        match fs::read_to_string(&path) {
            Ok(text) => {
                let first = text.trim().lines().next().unwrap_or_default().trim();
                if !first.is_empty() {
                    predictions.insert(id, first.to_string());
                }
            }
            Err(err) => warn!(path = %path.display(), error = %err, "skipping unreadable prediction"),
        }
    }
    predictions
}

/// Write `ground_truth_<model>.json` and `predictions_<model>.json` restricted
/// to ids present on both sides.
pub fn prepare_evaluation_data(
    paths: &EvaluationPaths,
    model: &str,
) -> Result<EvaluationFiles, PipelineError> {
    let ground_truth = load_ground_truth(&paths.ground_truth_dir);
    if ground_truth.is_empty() {
        return Err(PipelineError::SourceUnavailable {
            source_key: "ground_truth".into(),
            reason: format!("no captions in '{}'", paths.ground_truth_dir.display()),
        });
    }
    if !paths.predictions_dir.is_dir() {
        return Err(PipelineError::SourceUnavailable {
            source_key: model.to_string(),
            reason: format!("'{}' does not exist", paths.predictions_dir.display()),
        });
    }
    let predictions = load_predictions(&paths.predictions_dir);
    if predictions.is_empty() {
        return Err(PipelineError::SourceUnavailable {
            source_key: model.to_string(),
            reason: "no predictions found".into(),
        });
    }

    let filtered_truth: IndexMap<&CanonicalId, &Vec<Caption>> = ground_truth
        .iter()
        .filter(|(id, _)| predictions.contains_key(*id))
        .collect();
    if filtered_truth.is_empty() {
        return Err(PipelineError::SourceUnavailable {
            source_key: model.to_string(),
            reason: "no ids shared with the ground truth".into(),
        });
    }
    let filtered_predictions: IndexMap<&CanonicalId, &Caption> = filtered_truth
        .keys()
        .filter_map(|id| predictions.get(*id).map(|caption| (*id, caption)))
        .collect();
    info!(model, common = filtered_truth.len(), "found shared ids");

    let files = EvaluationFiles {
        ground_truth: paths.output_dir.join(format!("ground_truth_{model}.json")),
        predictions: paths.output_dir.join(format!("predictions_{model}.json")),
        common: filtered_truth.len(),
    };
    fs::create_dir_all(&paths.output_dir)?;
    write_json_atomic(&files.ground_truth, &filtered_truth)?;
    write_json_atomic(&files.predictions, &filtered_predictions)?;
    info!(output = %paths.output_dir.display(), "evaluation data written");
    Ok(files)
}
