use indexmap::IndexMap;

use crate::sampler::FixedBatchMultiSourceSampler;
use crate::types::SourceKey;

/// Aggregate skew metrics for per-source batch counts.
#[derive(Clone, Debug, PartialEq)]
pub struct SourceSkew {
    pub total: usize,
    pub sources: usize,
    pub min: usize,
    pub max: usize,
    pub mean: f64,
    pub max_share: f64,
    pub min_share: f64,
    pub ratio: f64,
    pub per_source: Vec<SourceShare>,
}

/// Per-source share of an epoch's batches.
#[derive(Clone, Debug, PartialEq)]
pub struct SourceShare {
    pub source: SourceKey,
    pub count: usize,
    pub share: f64,
}

fn share_of(count: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        count as f64 / total as f64
    }
}

/// Compute skew metrics from per-source counts.
pub fn source_skew(counts: &IndexMap<SourceKey, usize>) -> Option<SourceSkew> {
    let min = *counts.values().min()?;
    let max = *counts.values().max()?;
    let total: usize = counts.values().sum();
    let sources = counts.len();
    let ratio = if min == 0 {
        f64::INFINITY
    } else {
        max as f64 / min as f64
    };
    let mut per_source: Vec<SourceShare> = counts
        .iter()
        .map(|(source, count)| SourceShare {
            source: source.clone(),
            count: *count,
            share: share_of(*count, total),
        })
        .collect();
    per_source.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.source.cmp(&b.source)));
    Some(SourceSkew {
        total,
        sources,
        min,
        max,
        mean: total as f64 / sources as f64,
        max_share: share_of(max, total),
        min_share: share_of(min, total),
        ratio,
        per_source,
    })
}

/// Batches each source contributes to `epoch`, in configured source order.
pub fn epoch_batch_counts(
    sampler: &FixedBatchMultiSourceSampler,
    epoch: u64,
) -> IndexMap<SourceKey, usize> {
    let mut counts: IndexMap<SourceKey, usize> = sampler
        .sources()
        .iter()
        .map(|source| (source.key.clone(), 0))
        .collect();
    for slot in sampler.batch_order(epoch) {
        if let Some(source) = sampler.sources().get(slot.source)
            && let Some(count) = counts.get_mut(&source.key)
        {
            *count += 1;
        }
    }
    counts
}

/// Longest run of consecutive batches drawn from one source in `epoch`.
pub fn longest_source_run(sampler: &FixedBatchMultiSourceSampler, epoch: u64) -> usize {
    let mut longest = 0;
    let mut current = 0;
    let mut previous = None;
    for slot in sampler.batch_order(epoch) {
        if previous == Some(slot.source) {
            current += 1;
        } else {
            current = 1;
            previous = Some(slot.source);
        }
        longest = longest.max(current);
    }
    longest
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SamplerConfig, SourceDescriptor};

    #[test]
    fn source_skew_reports_balance() {
        let mut counts = IndexMap::new();
        counts.insert("A".to_string(), 2);
        counts.insert("B".to_string(), 2);
        let skew = source_skew(&counts).expect("skew");
        assert_eq!(skew.total, 4);
        assert_eq!(skew.sources, 2);
        assert!((skew.max_share - 0.5).abs() < 1e-6);
        assert!((skew.ratio - 1.0).abs() < 1e-6);
        assert!(
            skew.per_source
                .iter()
                .all(|entry| (entry.share - 0.5).abs() < 1e-6)
        );
        assert!(source_skew(&IndexMap::new()).is_none());
    }

    #[test]
    fn epoch_counts_follow_repeat_factors() {
        let config = SamplerConfig {
            sources: vec![
                SourceDescriptor::named("cc3m", 40, 1),
                SourceDescriptor::named("midjourney", 41, 3),
            ],
            batch_size: 4,
            shuffle: false,
            seed: 1,
        };
        let sampler = FixedBatchMultiSourceSampler::new(&config).unwrap();
        let counts = epoch_batch_counts(&sampler, 0);
        assert_eq!(counts["cc3m"], 10);
        assert_eq!(counts["midjourney"], 30);

        let skew = source_skew(&counts).expect("skew");
        assert_eq!(skew.per_source[0].source, "midjourney");
        assert!((skew.ratio - 3.0).abs() < 1e-6);
        assert_eq!(longest_source_run(&sampler, 0), 30);
    }
}
