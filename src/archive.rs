//! Tar shard scanning and paired-member extraction.
//!
//! A shard is read twice: once to list member names (cheap, payloads are
//! skipped by the tar reader) and once to unpack only the members that were
//! planned as image/annotation pairs. Extracted files live in a private
//! staging directory owned by the extractor and removed on cleanup or drop.

use std::collections::HashSet;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use tar::Archive;
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::config::{ArchiveConfig, MemberOrder, PairingRule};
use crate::constants::archive::IMAGE_SUFFIX;
use crate::errors::PipelineError;
use crate::types::OriginalName;

/// A paired image/annotation extracted into staging.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtractedSample {
    pub image_path: PathBuf,
    pub annotation_path: PathBuf,
    pub original_name: OriginalName,
}

/// Image/annotation member names selected for extraction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PairPlan {
    pub image_member: String,
    pub annotation_member: String,
    pub original_name: OriginalName,
}

/// Classification of one member during planning.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PairOutcome {
    /// Image with a located annotation, ready to extract.
    Planned(PairPlan),
    /// Image whose original name was already materialized.
    AlreadyProcessed,
    /// Image without an annotation inside the search rule.
    MissingAnnotation,
    /// Not an image member.
    NotAnImage,
}

/// Per-call counters reported after a shard scan.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExtractionStats {
    pub planned: usize,
    pub extracted: usize,
    pub already_processed: usize,
    pub missing_annotation: usize,
    pub failed: usize,
}

/// Extracts paired samples from tar shards into a lazily created staging directory.
pub struct ShardExtractor {
    config: ArchiveConfig,
    staging: Option<TempDir>,
    last_stats: ExtractionStats,
}

impl ShardExtractor {
    pub fn new(config: ArchiveConfig) -> Self {
        Self {
            config,
            staging: None,
            last_stats: ExtractionStats::default(),
        }
    }

    pub fn config(&self) -> &ArchiveConfig {
        &self.config
    }

    /// Staging directory, if one has been created.
    pub fn staging_dir(&self) -> Option<&Path> {
        self.staging.as_ref().map(TempDir::path)
    }

    /// Counters from the most recent `extract` call.
    pub fn last_stats(&self) -> ExtractionStats {
        self.last_stats
    }

    fn ensure_staging(&mut self) -> Result<PathBuf, PipelineError> {
        if let Some(dir) = self.staging.as_ref() {
            return Ok(dir.path().to_path_buf());
        }
        let dir = tempfile::Builder::new()
            .prefix(self.config.variant.staging_prefix())
            .tempdir()?;
        debug!(staging = %dir.path().display(), "created staging directory");
        let path = dir.path().to_path_buf();
        self.staging = Some(dir);
        Ok(path)
    }

    /// Remove the staging directory and everything extracted into it.
    pub fn cleanup(&mut self) -> io::Result<()> {
        if let Some(dir) = self.staging.take() {
            let path = dir.path().to_path_buf();
            dir.close()?;
            info!(staging = %path.display(), "removed staging directory");
        }
        Ok(())
    }

    /// List regular-file member names of `shard` in archive order.
    pub fn list_members(shard: &Path) -> Result<Vec<String>, PipelineError> {
        let archive_err = |err: io::Error| PipelineError::Archive {
            path: shard.to_path_buf(),
            reason: err.to_string(),
        };
        let file = File::open(shard).map_err(archive_err)?;
        let mut archive = Archive::new(file);
        let mut names = Vec::new();
        for entry in archive.entries().map_err(archive_err)? {
            let entry = entry.map_err(archive_err)?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let path = entry.path().map_err(archive_err)?;
            names.push(path.to_string_lossy().into_owned());
        }
        Ok(names)
    }

    /// Classify the member at `position` of `members` (already in scan order).
    pub fn classify_member<F>(
        &self,
        members: &[String],
        position: usize,
        is_processed: F,
    ) -> PairOutcome
    where
        F: Fn(&str) -> bool,
    {
        let name = &members[position];
        let Some(stem_path) = name.strip_suffix(IMAGE_SUFFIX) else {
            return PairOutcome::NotAnImage;
        };
        let original_name = original_name_of(name);
        if is_processed(&original_name) {
            return PairOutcome::AlreadyProcessed;
        }
        let wanted = format!("{stem_path}{}", self.config.variant.annotation_suffix());
        let found = match self.config.pairing() {
            PairingRule::Neighborhood { window } => {
                let start = position.saturating_sub(window);
                let end = position
                    .saturating_add(window)
                    .saturating_add(1)
                    .min(members.len());
                members[start..end].iter().any(|candidate| *candidate == wanted)
            }
            PairingRule::ExactName => members.iter().any(|candidate| *candidate == wanted),
        };
        if !found {
            return PairOutcome::MissingAnnotation;
        }
        PairOutcome::Planned(PairPlan {
            image_member: name.clone(),
            annotation_member: wanted,
            original_name,
        })
    }

    fn ordered_members(&self, members: &[String]) -> Vec<String> {
        let mut ordered = members.to_vec();
        if self.config.variant.member_order() == MemberOrder::Lexicographic {
            ordered.sort();
        }
        ordered
    }

    /// Choose up to `needed` pairs from `members`, skipping processed names.
    pub fn plan_pairs<F>(
        &self,
        members: &[String],
        needed: usize,
        is_processed: F,
    ) -> (Vec<PairPlan>, ExtractionStats)
    where
        F: Fn(&str) -> bool,
    {
        let ordered = self.ordered_members(members);
        let mut stats = ExtractionStats::default();
        let mut claimed = HashSet::new();
        let (plans, _) =
            self.plan_from(&ordered, 0, needed, &is_processed, &mut claimed, &mut stats);
        stats.planned = plans.len();
        (plans, stats)
    }

    /// Plan up to `needed` pairs starting at `start`; returns the plans and
    /// the position where scanning stopped.
    fn plan_from<F>(
        &self,
        ordered: &[String],
        start: usize,
        needed: usize,
        is_processed: &F,
        claimed: &mut HashSet<OriginalName>,
        stats: &mut ExtractionStats,
    ) -> (Vec<PairPlan>, usize)
    where
        F: Fn(&str) -> bool,
    {
        let mut plans = Vec::new();
        let mut position = start;
        while position < ordered.len() && plans.len() < needed {
            let outcome = self.classify_member(ordered, position, |name| {
                is_processed(name) || claimed.contains(name)
            });
            position += 1;
            match outcome {
                PairOutcome::Planned(plan) => {
                    claimed.insert(plan.original_name.clone());
                    plans.push(plan);
                }
                PairOutcome::AlreadyProcessed => stats.already_processed += 1,
                PairOutcome::MissingAnnotation => stats.missing_annotation += 1,
                PairOutcome::NotAnImage => {}
            }
        }
        (plans, position)
    }

    /// Extract up to `needed` image/annotation pairs from `shard` into staging.
    ///
    /// Images whose original name satisfies `is_processed` are skipped before
    /// any bytes are unpacked. A pair whose members fail to unpack is dropped
    /// and planning resumes after it, so the call only comes up short once the
    /// shard has no further candidates.
    pub fn extract<F>(
        &mut self,
        shard: &Path,
        needed: usize,
        is_processed: F,
    ) -> Result<Vec<ExtractedSample>, PipelineError>
    where
        F: Fn(&str) -> bool,
    {
        self.last_stats = ExtractionStats::default();
        if needed == 0 {
            return Ok(Vec::new());
        }
        let ordered = self.ordered_members(&Self::list_members(shard)?);
        let mut stats = ExtractionStats::default();
        let mut claimed: HashSet<OriginalName> = HashSet::new();
        let mut samples = Vec::new();
        let mut position = 0;
        while samples.len() < needed && position < ordered.len() {
            let (plans, next) = self.plan_from(
                &ordered,
                position,
                needed - samples.len(),
                &is_processed,
                &mut claimed,
                &mut stats,
            );
            position = next;
            if plans.is_empty() {
                break;
            }
            stats.planned += plans.len();
            let staging = self.ensure_staging()?;
            let wanted: HashSet<&str> = plans
                .iter()
                .flat_map(|plan| [plan.image_member.as_str(), plan.annotation_member.as_str()])
                .collect();
            let unpacked = unpack_members(shard, &staging, &wanted)?;

            for plan in plans {
                let image_path = staging.join(&plan.image_member);
                let annotation_path = staging.join(&plan.annotation_member);
                let complete = unpacked.contains(plan.image_member.as_str())
                    && unpacked.contains(plan.annotation_member.as_str())
                    && image_path.is_file()
                    && annotation_path.is_file();
                if !complete {
                    debug!(member = %plan.image_member, "pair failed to unpack; planning a replacement");
                    stats.failed += 1;
                    claimed.remove(&plan.original_name);
                    continue;
                }
                samples.push(ExtractedSample {
                    image_path,
                    annotation_path,
                    original_name: plan.original_name,
                });
            }
        }
        stats.extracted = samples.len();
        self.last_stats = stats;
        debug!(
            shard = %shard.display(),
            extracted = stats.extracted,
            already_processed = stats.already_processed,
            missing_annotation = stats.missing_annotation,
            failed = stats.failed,
            "shard scan finished"
        );
        Ok(samples)
    }
}

/// Base name of a member path without directories or extension.
pub fn original_name_of(member: &str) -> OriginalName {
    Path::new(member)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn unpack_members(
    shard: &Path,
    staging: &Path,
    wanted: &HashSet<&str>,
) -> Result<HashSet<String>, PipelineError> {
    let archive_err = |err: io::Error| PipelineError::Archive {
        path: shard.to_path_buf(),
        reason: err.to_string(),
    };
    let file = File::open(shard).map_err(archive_err)?;
    let mut archive = Archive::new(file);
    let mut unpacked = HashSet::new();
    for entry in archive.entries().map_err(archive_err)? {
        let mut entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(shard = %shard.display(), error = %err, "stopping scan at unreadable member");
                break;
            }
        };
        let name = match entry.path() {
            Ok(path) => path.to_string_lossy().into_owned(),
            Err(err) => {
                debug!(shard = %shard.display(), error = %err, "skipping member with invalid path");
                continue;
            }
        };
        if !wanted.contains(name.as_str()) {
            continue;
        }
        match entry.unpack_in(staging) {
            Ok(true) => {
                unpacked.insert(name);
            }
            Ok(false) => {
                debug!(member = %name, "refusing to unpack member outside staging");
            }
            Err(err) => {
                debug!(member = %name, error = %err, "failed to unpack member");
            }
        }
    }
    Ok(unpacked)
}
