use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::{Parser, error::ErrorKind};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::collate::CollateConcat;
use crate::config::{ExtractionVariant, MixConfig, RunConfig, ShardAssignment};
use crate::constants::archive::{DEFAULT_PAIR_SEARCH_WINDOW, DEFAULT_SHARD_PREFIX};
use crate::constants::evaluation::{
    DEFAULT_EVAL_OUTPUT_ROOT, DEFAULT_GT_TEXT_DIR, DEFAULT_MODEL_OUTPUT_ROOT,
};
use crate::constants::layout::DEFAULT_SHARD_DIR;
use crate::constants::run::{
    DEFAULT_DATASET_DIR, DEFAULT_TRAIN_TARGET, DEFAULT_TRAIN_TARGET_DIR,
    DEFAULT_VALIDATION_TARGET, DEFAULT_VALIDATION_TARGET_DIR,
};
use crate::evaluation::{EvaluationPaths, prepare_evaluation_data};
use crate::metrics::{epoch_batch_counts, longest_source_run, source_skew};
use crate::run::{RunController, RunReport};
use crate::sampler::FixedBatchMultiSourceSampler;

/// Install the fmt subscriber used by every binary (`RUST_LOG`, default `info`).
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

#[derive(Debug, Parser)]
#[command(
    disable_help_subcommand = true,
    about = "Materialize caption pairs from tar shards",
    long_about = "Extract image/caption pairs from <prefix>-<split>-*.tar shards into a canonical layout until the target count is reached. Re-running resumes where the previous run stopped.",
    after_help = "Interrupting with Ctrl-C stops after the current step; committed output is kept and staging is removed."
)]
struct ExtractCli {
    #[arg(
        value_name = "COUNT",
        value_parser = parse_positive_usize,
        help = "Total canonical records wanted in the target directory"
    )]
    count: Option<usize>,
    #[arg(long = "dataset-dir", value_name = "DIR", help = "Directory holding the shards")]
    dataset_dir: Option<PathBuf>,
    #[arg(long = "target-dir", value_name = "DIR", help = "Canonical output directory")]
    target_dir: Option<PathBuf>,
    #[arg(long = "shard-prefix", default_value = DEFAULT_SHARD_PREFIX, help = "Shard file prefix")]
    shard_prefix: String,
    #[arg(
        long = "shard-dir",
        default_value = DEFAULT_SHARD_DIR,
        help = "Sub-directory under local_folder/cap_folder (training layout)"
    )]
    shard_dir: String,
    #[arg(
        long = "pair-window",
        default_value_t = DEFAULT_PAIR_SEARCH_WINDOW,
        help = "Members searched on each side of an image for its JSON annotation"
    )]
    pair_window: usize,
    #[arg(
        long = "per-shard-cap",
        value_parser = parse_positive_usize,
        help = "Upper bound on samples requested from one shard"
    )]
    per_shard_cap: Option<usize>,
    #[arg(long = "worker-index", default_value_t = 0, help = "This worker's position")]
    worker_index: usize,
    #[arg(
        long = "worker-count",
        default_value_t = 1,
        value_parser = parse_positive_usize,
        help = "Workers sharing the shard list"
    )]
    worker_count: usize,
}

#[derive(Debug, Parser)]
#[command(
    name = "prepare_eval",
    disable_help_subcommand = true,
    about = "Pair validation captions with one model's predictions"
)]
struct PrepareEvalCli {
    #[arg(value_name = "MODEL", help = "Model name, e.g. raw or finetune")]
    model: String,
    #[arg(long = "gt-dir", value_name = "DIR", default_value = DEFAULT_GT_TEXT_DIR)]
    gt_dir: PathBuf,
    #[arg(long = "model-root", value_name = "DIR", default_value = DEFAULT_MODEL_OUTPUT_ROOT)]
    model_root: PathBuf,
    #[arg(long = "eval-root", value_name = "DIR", default_value = DEFAULT_EVAL_OUTPUT_ROOT)]
    eval_root: PathBuf,
}

#[derive(Debug, Parser)]
#[command(
    name = "sample_mix",
    disable_help_subcommand = true,
    about = "Inspect the batch mix of a sampler configuration",
    long_about = "Load a TOML or JSON mix configuration and report per-source batch counts, shares, and interleaving for the requested epochs."
)]
struct SampleMixCli {
    #[arg(value_name = "CONFIG", help = "Path to a .toml or .json mix configuration")]
    config: PathBuf,
    #[arg(long, default_value_t = 0, help = "First epoch to report")]
    epoch: u64,
    #[arg(
        long,
        default_value_t = 1,
        value_parser = parse_positive_usize,
        help = "Number of epochs to report"
    )]
    epochs: usize,
    #[arg(long = "show-batches", default_value_t = 0, help = "Print the first N batches of each epoch")]
    show_batches: usize,
}

/// `extract_train [COUNT]`.
pub fn run_extract_train<I>(args_iter: I) -> Result<Option<RunReport>, Box<dyn Error>>
where
    I: Iterator<Item = String>,
{
    run_extract(ExtractionVariant::Train, "extract_train", args_iter)
}

/// `extract_validation [COUNT]`.
pub fn run_extract_validation<I>(args_iter: I) -> Result<Option<RunReport>, Box<dyn Error>>
where
    I: Iterator<Item = String>,
{
    run_extract(ExtractionVariant::Validation, "extract_validation", args_iter)
}

fn run_extract<I>(
    variant: ExtractionVariant,
    bin_name: &str,
    args_iter: I,
) -> Result<Option<RunReport>, Box<dyn Error>>
where
    I: Iterator<Item = String>,
{
    let Some(cli) =
        parse_cli::<ExtractCli, _>(std::iter::once(bin_name.to_string()).chain(args_iter))?
    else {
        return Ok(None);
    };
    let (default_count, default_target) = match variant {
        ExtractionVariant::Train => (DEFAULT_TRAIN_TARGET, DEFAULT_TRAIN_TARGET_DIR),
        ExtractionVariant::Validation => (DEFAULT_VALIDATION_TARGET, DEFAULT_VALIDATION_TARGET_DIR),
    };
    let assignment = ShardAssignment::new(cli.worker_index, cli.worker_count)?;
    let mut config = RunConfig::new(
        variant,
        cli.dataset_dir
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATASET_DIR)),
        cli.target_dir
            .unwrap_or_else(|| PathBuf::from(default_target)),
        cli.count.unwrap_or(default_count),
    )
    .with_shard_prefix(cli.shard_prefix)
    .with_shard_dir(cli.shard_dir)
    .with_pair_search_window(cli.pair_window)
    .with_assignment(assignment);
    if let Some(cap) = cli.per_shard_cap {
        config = config.with_per_shard_cap(cap);
    }
    info!(
        variant = ?variant,
        dataset = %config.dataset_dir.display(),
        target = %config.target_dir.display(),
        count = config.target_count,
        "starting extraction"
    );

    let interrupt = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&interrupt);
    if let Err(err) = ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %err, "interrupt handler unavailable; Ctrl-C will not clean up staging");
    }

    let mut controller = RunController::new(config).with_interrupt_flag(interrupt);
    let report = controller.run();
    for shard in report.shards.iter().filter(|shard| shard.error.is_some()) {
        warn!(shard = %shard.shard.display(), "shard was skipped");
    }
    Ok(Some(report))
}

/// `prepare_eval <MODEL>`.
pub fn run_prepare_eval<I>(args_iter: I) -> Result<(), Box<dyn Error>>
where
    I: Iterator<Item = String>,
{
    let Some(cli) =
        parse_cli::<PrepareEvalCli, _>(std::iter::once("prepare_eval".to_string()).chain(args_iter))?
    else {
        return Ok(());
    };
    let paths = EvaluationPaths::for_model(&cli.gt_dir, &cli.model_root, &cli.eval_root, &cli.model);
    match prepare_evaluation_data(&paths, &cli.model) {
        Ok(files) => println!(
            "{} shared ids written to {} and {}",
            files.common,
            files.ground_truth.display(),
            files.predictions.display()
        ),
        Err(err) => error!(model = %cli.model, error = %err, "evaluation data not prepared"),
    }
    Ok(())
}

/// `sample_mix <CONFIG>`.
pub fn run_sample_mix<I>(args_iter: I) -> Result<(), Box<dyn Error>>
where
    I: Iterator<Item = String>,
{
    let Some(cli) =
        parse_cli::<SampleMixCli, _>(std::iter::once("sample_mix".to_string()).chain(args_iter))?
    else {
        return Ok(());
    };
    let mix = MixConfig::load(&cli.config)?;
    if !mix.collate.groups.is_empty() {
        let collate = CollateConcat::from_spec(&mix.collate)?;
        println!("collation groups: {}", collate.keys().join(", "));
    }
    let sampler = FixedBatchMultiSourceSampler::new(&mix.sampler)?;
    println!(
        "{} sources, batch size {}, shuffle {}, {} batches per epoch",
        sampler.sources().len(),
        sampler.batch_size(),
        sampler.shuffle(),
        sampler.len()
    );
    for source in sampler.sources() {
        let dropped = source.size % sampler.batch_size();
        println!(
            "  {:<24} size {:>10}  repeat {:>3}  dropped tail {:>5}",
            source.key, source.size, source.repeat, dropped
        );
    }

    for epoch in cli.epoch..cli.epoch + cli.epochs as u64 {
        println!("epoch {epoch}");
        let counts = epoch_batch_counts(&sampler, epoch);
        if let Some(skew) = source_skew(&counts) {
            for share in &skew.per_source {
                println!(
                    "  {:<24} {:>8} batches  {:>6.2}%",
                    share.source,
                    share.count,
                    share.share * 100.0
                );
            }
            println!(
                "  max/min ratio {:.2}, longest single-source run {}",
                skew.ratio,
                longest_source_run(&sampler, epoch)
            );
        }
        for (position, batch) in sampler.epoch_batches(epoch).take(cli.show_batches).enumerate() {
            let source = batch
                .first()
                .and_then(|idx| sampler.source_of(*idx))
                .map_or("?", |idx| sampler.sources()[idx].key.as_str());
            println!("  batch {position:>4} [{source}] {batch:?}");
        }
    }
    Ok(())
}

fn parse_positive_usize(raw: &str) -> Result<usize, String> {
    let parsed = raw
        .parse::<usize>()
        .map_err(|_| format!("could not parse '{raw}' as a positive integer"))?;
    if parsed == 0 {
        return Err("value must be greater than zero".to_string());
    }
    Ok(parsed)
}

fn parse_cli<T, I>(args: I) -> Result<Option<T>, Box<dyn Error>>
where
    T: Parser,
    I: IntoIterator,
    I::Item: Into<std::ffi::OsString> + Clone,
{
    match T::try_parse_from(args) {
        Ok(cli) => Ok(Some(cli)),
        Err(err) => match err.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                err.print()?;
                Ok(None)
            }
            _ => Err(err.into()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::RunPhase;
    use std::fs;
    use tempfile::tempdir;

    fn args(values: &[&str]) -> impl Iterator<Item = String> {
        values
            .iter()
            .map(|value| value.to_string())
            .collect::<Vec<_>>()
            .into_iter()
    }

    #[test]
    fn invalid_count_is_rejected() {
        assert!(run_extract_train(args(&["many"])).is_err());
        assert!(run_extract_validation(args(&["0"])).is_err());
        assert!(run_extract_train(args(&["--worker-index", "3", "--worker-count", "2"])).is_err());
    }

    #[test]
    fn help_is_not_an_error() {
        assert!(run_extract_train(args(&["--help"])).unwrap().is_none());
    }

    #[test]
    fn missing_dataset_dir_ends_gracefully() {
        let root = tempdir().unwrap();
        let dataset = root.path().join("absent");
        let target = root.path().join("out");
        let report = run_extract_validation(args(&[
            "5",
            "--dataset-dir",
            dataset.to_str().unwrap(),
            "--target-dir",
            target.to_str().unwrap(),
        ]))
        .unwrap()
        .unwrap();
        assert_eq!(report.phase, RunPhase::SetupFailed);
        assert_eq!(report.target_count, 5);
    }

    #[test]
    fn sample_mix_reads_toml() {
        let root = tempdir().unwrap();
        let path = root.path().join("mix.toml");
        fs::write(
            &path,
            "[sampler]\nbatch_size = 2\nsources = [{ name = \"a\", size = 5 }, { name = \"b\", size = 4, repeat = 2 }]\n",
        )
        .unwrap();
        run_sample_mix(args(&[path.to_str().unwrap(), "--epochs", "2", "--show-batches", "3"]))
            .unwrap();
        assert!(run_sample_mix(args(&[root.path().join("nope.toml").to_str().unwrap()])).is_err());
    }
}
