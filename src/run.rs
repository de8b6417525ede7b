//! Resumable, interruptible materialization runs over a directory of shards.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::archive::ShardExtractor;
use crate::config::RunConfig;
use crate::constants::archive::SHARD_EXTENSION;
use crate::errors::PipelineError;
use crate::materialize::Materializer;

/// Run controller states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunPhase {
    Init,
    LoadingState,
    ScanningShards,
    Extracting,
    Materializing,
    Done,
    Interrupted,
    /// Persisted state or shard discovery failed before anything was written.
    SetupFailed,
}

impl RunPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Interrupted | Self::SetupFailed)
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Init => "init",
            Self::LoadingState => "loading_state",
            Self::ScanningShards => "scanning_shards",
            Self::Extracting => "extracting",
            Self::Materializing => "materializing",
            Self::Done => "done",
            Self::Interrupted => "interrupted",
            Self::SetupFailed => "setup_failed",
        };
        f.write_str(label)
    }
}

/// Per-shard outcome.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShardSummary {
    pub shard: PathBuf,
    pub requested: usize,
    pub extracted: usize,
    pub committed: usize,
    /// Set when the shard could not be read.
    pub error: Option<String>,
}

/// What a finished run did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunReport {
    pub phase: RunPhase,
    pub target_count: usize,
    pub initial_count: usize,
    pub final_count: usize,
    pub shards: Vec<ShardSummary>,
    /// Setup or fatal error message, if the run ended on one.
    pub error: Option<String>,
}

impl RunReport {
    fn new(target_count: usize) -> Self {
        Self {
            phase: RunPhase::Init,
            target_count,
            initial_count: 0,
            final_count: 0,
            shards: Vec::new(),
            error: None,
        }
    }

    /// Samples committed by this run.
    pub fn committed(&self) -> usize {
        self.final_count.saturating_sub(self.initial_count)
    }

    pub fn target_met(&self) -> bool {
        self.final_count >= self.target_count
    }
}

/// Drives extractor + materializer across shards until the target count is met.
///
/// The interrupt flag is observed between shards and between the extract and
/// commit steps of a shard. Staging is removed on every exit path; committed
/// canonical output is never rolled back.
pub struct RunController {
    config: RunConfig,
    interrupt: Arc<AtomicBool>,
    phase: RunPhase,
}

impl RunController {
    pub fn new(config: RunConfig) -> Self {
        Self {
            config,
            interrupt: Arc::new(AtomicBool::new(false)),
            phase: RunPhase::Init,
        }
    }

    /// Share an externally owned interrupt flag (e.g. one set by a signal handler).
    pub fn with_interrupt_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = flag;
        self
    }

    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    fn transition(&mut self, next: RunPhase) {
        debug!(from = %self.phase, to = %next, "run phase");
        self.phase = next;
    }

    fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }

    /// Execute the run to a terminal phase.
    ///
    /// Never returns an error: setup failures end in [`RunPhase::SetupFailed`]
    /// and fatal errors in [`RunPhase::Interrupted`], both recorded in the report.
    pub fn run(&mut self) -> RunReport {
        let mut report = RunReport::new(self.config.target_count);
        self.transition(RunPhase::LoadingState);
        let mut materializer = match Materializer::open(&self.config) {
            Ok(materializer) => materializer,
            Err(err) => return self.setup_failed(report, err),
        };
        let current = match materializer.current_count() {
            Ok(current) => current,
            Err(err) => return self.setup_failed(report, err),
        };
        report.initial_count = current;
        report.final_count = current;
        info!(
            target = self.config.target_count,
            current,
            mapped = materializer.mapping().len(),
            "loaded materialization state"
        );
        if current >= self.config.target_count {
            info!("target already met; nothing to extract");
            self.transition(RunPhase::Done);
            report.phase = self.phase;
            return report;
        }

        self.transition(RunPhase::ScanningShards);
        let shards = match discover_shards(&self.config) {
            Ok(shards) => shards,
            Err(err) => return self.setup_failed(report, err),
        };
        info!(shards = shards.len(), "discovered shards");

        let mut extractor = ShardExtractor::new(self.config.archive.clone());
        let outcome = self.process_shards(&shards, &mut extractor, &mut materializer, &mut report);
        if let Err(err) = extractor.cleanup() {
            warn!(error = %err, "failed to remove staging directory");
        }
        match outcome {
            Ok(()) if self.interrupted() => self.transition(RunPhase::Interrupted),
            Ok(()) => self.transition(RunPhase::Done),
            Err(err) => {
                error!(error = %err, "run aborted");
                report.error = Some(err.to_string());
                self.transition(RunPhase::Interrupted);
            }
        }
        report.phase = self.phase;
        info!(
            phase = %report.phase,
            committed = report.committed(),
            total = report.final_count,
            target = report.target_count,
            "run finished"
        );
        report
    }

    fn setup_failed(&mut self, mut report: RunReport, err: PipelineError) -> RunReport {
        error!(error = %err, "run setup failed; existing output left untouched");
        report.error = Some(err.to_string());
        self.transition(RunPhase::SetupFailed);
        report.phase = self.phase;
        report
    }

    fn process_shards(
        &mut self,
        shards: &[PathBuf],
        extractor: &mut ShardExtractor,
        materializer: &mut Materializer,
        report: &mut RunReport,
    ) -> Result<(), PipelineError> {
        let target = self.config.target_count;
        for shard in shards {
            if self.interrupted() {
                warn!("interrupt observed between shards");
                return Ok(());
            }
            let remaining = target.saturating_sub(report.final_count);
            if remaining == 0 {
                break;
            }
            let requested = remaining.min(self.config.per_shard_cap);
            let mut summary = ShardSummary {
                shard: shard.clone(),
                requested,
                extracted: 0,
                committed: 0,
                error: None,
            };

            self.transition(RunPhase::Extracting);
            let samples = match extractor.extract(shard, requested, |name| {
                materializer.is_processed(name)
            }) {
                Ok(samples) => samples,
                Err(err) => {
                    warn!(shard = %shard.display(), error = %err, "skipping unreadable shard");
                    summary.error = Some(err.to_string());
                    report.shards.push(summary);
                    continue;
                }
            };
            summary.extracted = samples.len();
            if self.interrupted() {
                warn!(shard = %shard.display(), "interrupt observed before commit");
                report.shards.push(summary);
                return Ok(());
            }

            self.transition(RunPhase::Materializing);
            let committed = materializer.commit(&samples, report.final_count)?;
            summary.committed = committed;
            report.final_count += committed;
            let stats = extractor.last_stats();
            info!(
                shard = %shard.display(),
                requested,
                extracted = summary.extracted,
                committed,
                already_processed = stats.already_processed,
                missing_annotation = stats.missing_annotation,
                total = report.final_count,
                "shard done"
            );
            report.shards.push(summary);
        }
        Ok(())
    }
}

/// Sorted `<prefix>-<split>-*.tar` shards in `dataset_dir` owned by this worker.
pub fn discover_shards(config: &RunConfig) -> Result<Vec<PathBuf>, PipelineError> {
    let dir = config.dataset_dir.as_path();
    if !dir.is_dir() {
        return Err(PipelineError::Configuration(format!(
            "dataset directory '{}' does not exist",
            dir.display()
        )));
    }
    let prefix = config.shard_name_prefix();
    let mut shards: Vec<PathBuf> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| is_shard_name(path, &prefix))
        .collect();
    if shards.is_empty() {
        return Err(PipelineError::Configuration(format!(
            "no '{prefix}*.{SHARD_EXTENSION}' shards found in '{}'",
            dir.display()
        )));
    }
    shards.sort();
    let owned: Vec<PathBuf> = shards
        .into_iter()
        .enumerate()
        .filter(|(position, _)| config.assignment.owns(*position))
        .map(|(_, path)| path)
        .collect();
    if owned.is_empty() {
        return Err(PipelineError::Configuration(format!(
            "worker {} of {} owns none of the shards in '{}'",
            config.assignment.worker_index,
            config.assignment.worker_count,
            dir.display()
        )));
    }
    Ok(owned)
}

fn is_shard_name(path: &Path, prefix: &str) -> bool {
    let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
        return false;
    };
    let extension_matches = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext == SHARD_EXTENSION);
    extension_matches && name.starts_with(prefix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShardAssignment;
    use crate::store::OriginalMapping;
    use std::fs::{self, File};
    use tar::{Builder, Header};
    use tempfile::tempdir;

    fn append(builder: &mut Builder<File>, name: &str, body: &[u8]) {
        let mut header = Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, body).unwrap();
    }

    fn write_train_shard(dir: &Path, file: &str, names: &[&str]) {
        let mut builder = Builder::new(File::create(dir.join(file)).unwrap());
        for name in names {
            append(&mut builder, &format!("{name}.jpg"), name.as_bytes());
            let caption = format!(r#"{{"status":"success","caption":"caption {name}"}}"#);
            append(&mut builder, &format!("{name}.json"), caption.as_bytes());
        }
        builder.finish().unwrap();
    }

    #[test]
    fn discovery_filters_sorts_and_partitions() {
        let dir = tempdir().unwrap();
        for file in [
            "cc3m-train-0002.tar",
            "cc3m-train-0000.tar",
            "cc3m-validation-0000.tar",
            "cc3m-train-0001.tar",
            "notes.txt",
        ] {
            fs::write(dir.path().join(file), b"").unwrap();
        }
        let config = RunConfig::train(dir.path(), "out", 1);
        let names: Vec<_> = discover_shards(&config)
            .unwrap()
            .iter()
            .map(|path| path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            vec!["cc3m-train-0000.tar", "cc3m-train-0001.tar", "cc3m-train-0002.tar"]
        );

        let second = config.with_assignment(ShardAssignment::new(1, 2).unwrap());
        assert_eq!(discover_shards(&second).unwrap().len(), 1);
    }

    #[test]
    fn stops_once_target_is_met() {
        let dataset = tempdir().unwrap();
        let target = tempdir().unwrap();
        write_train_shard(dataset.path(), "cc3m-train-0000.tar", &["a", "b", "c"]);
        write_train_shard(dataset.path(), "cc3m-train-0001.tar", &["d", "e", "f"]);

        let mut controller = RunController::new(RunConfig::train(dataset.path(), target.path(), 4));
        let report = controller.run();
        assert_eq!(report.phase, RunPhase::Done);
        assert_eq!(report.final_count, 4);
        assert_eq!(report.shards.len(), 2);
        assert_eq!(report.shards[1].requested, 1);

        let mut again = RunController::new(RunConfig::train(dataset.path(), target.path(), 4));
        let report = again.run();
        assert_eq!(report.phase, RunPhase::Done);
        assert_eq!(report.committed(), 0);
        assert!(report.shards.is_empty());
    }

    #[test]
    fn per_shard_cap_limits_requests() {
        let dataset = tempdir().unwrap();
        let target = tempdir().unwrap();
        write_train_shard(dataset.path(), "cc3m-train-0000.tar", &["a", "b", "c"]);
        let config = RunConfig::train(dataset.path(), target.path(), 10).with_per_shard_cap(2);
        let report = RunController::new(config).run();
        assert_eq!(report.final_count, 2);
        assert!(!report.target_met());
    }

    #[test]
    fn pre_mapped_names_are_skipped() {
        let dataset = tempdir().unwrap();
        let target = tempdir().unwrap();
        write_train_shard(dataset.path(), "cc3m-train-0000.tar", &["abc123", "def456"]);
        let mut mapping =
            OriginalMapping::load(OriginalMapping::default_path_in_dir(target.path())).unwrap();
        mapping.insert("abc123".into(), "0000099".into());
        mapping.persist().unwrap();

        let report = RunController::new(RunConfig::train(dataset.path(), target.path(), 5)).run();
        assert_eq!(report.final_count, 1);
        let mapping =
            OriginalMapping::load(OriginalMapping::default_path_in_dir(target.path())).unwrap();
        assert_eq!(mapping.get("abc123").map(String::as_str), Some("0000099"));
        assert_eq!(mapping.get("def456").map(String::as_str), Some("0000001"));
    }

    #[test]
    fn corrupt_shard_is_skipped() {
        let dataset = tempdir().unwrap();
        let target = tempdir().unwrap();
        fs::write(dataset.path().join("cc3m-train-0000.tar"), vec![0xFFu8; 1024]).unwrap();
        write_train_shard(dataset.path(), "cc3m-train-0001.tar", &["ok"]);
        let report = RunController::new(RunConfig::train(dataset.path(), target.path(), 5)).run();
        assert_eq!(report.phase, RunPhase::Done);
        assert!(report.shards[0].error.is_some());
        assert_eq!(report.final_count, 1);
    }

    #[test]
    fn missing_dataset_dir_fails_setup() {
        let target = tempdir().unwrap();
        let dataset = target.path().join("absent");
        let report = RunController::new(RunConfig::train(&dataset, target.path(), 5)).run();
        assert_eq!(report.phase, RunPhase::SetupFailed);
        assert!(report.error.is_some());
    }

    #[test]
    fn raised_interrupt_stops_before_first_shard() {
        let dataset = tempdir().unwrap();
        let target = tempdir().unwrap();
        write_train_shard(dataset.path(), "cc3m-train-0000.tar", &["a"]);
        let flag = Arc::new(AtomicBool::new(true));
        let mut controller = RunController::new(RunConfig::train(dataset.path(), target.path(), 5))
            .with_interrupt_flag(Arc::clone(&flag));
        let report = controller.run();
        assert_eq!(report.phase, RunPhase::Interrupted);
        assert_eq!(report.final_count, 0);
        assert!(controller.phase().is_terminal());
    }
}
