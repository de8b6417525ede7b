use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

use crate::collate::{CollateConcat, CollatedBatch};
use crate::config::{SamplerConfig, SourceDescriptor};
use crate::constants::loader::{PREFETCHER_SOURCE_KEY, PREFETCHER_STOPPED_REASON};
use crate::dataset::{ExampleSource, RetryingFetcher};
use crate::errors::PipelineError;
use crate::hash::source_epoch_seed;
use crate::sampler::{EpochBatches, FixedBatchMultiSourceSampler};

/// Hand-off counters shared by a prefetch worker and its consumer.
///
/// `produced` is bumped before a result is sent, so it never trails what the
/// consumer has received.
#[derive(Debug, Default)]
struct PrefetchCounters {
    produced: AtomicUsize,
    consumed: AtomicUsize,
    failed: AtomicUsize,
}

fn prefetcher_stopped() -> PipelineError {
    PipelineError::SourceUnavailable {
        source_key: PREFETCHER_SOURCE_KEY.into(),
        reason: PREFETCHER_STOPPED_REASON.into(),
    }
}

fn fill_queue<T, F>(
    sender: SyncSender<Result<T, PipelineError>>,
    mut producer: F,
    counters: &PrefetchCounters,
) where
    F: FnMut() -> Result<T, PipelineError>,
{
    loop {
        let result = producer();
        if result.is_err() {
            counters.failed.fetch_add(1, Ordering::SeqCst);
        }
        counters.produced.fetch_add(1, Ordering::SeqCst);
        if sender.send(result).is_err() {
            counters.produced.fetch_sub(1, Ordering::SeqCst);
            debug!("prefetch consumer dropped; worker exiting");
            return;
        }
    }
}

/// Runs a batch producer on a worker thread, keeping up to `capacity`
/// results ready for the consumer. Errors are delivered in order, like batches.
pub struct BatchPrefetcher<T> {
    queue: Option<Receiver<Result<T, PipelineError>>>,
    worker: Option<JoinHandle<()>>,
    counters: Arc<PrefetchCounters>,
}

impl<T: Send + 'static> BatchPrefetcher<T> {
    pub fn new<F>(capacity: usize, producer: F) -> Self
    where
        F: FnMut() -> Result<T, PipelineError> + Send + 'static,
    {
        let (sender, queue) = mpsc::sync_channel(capacity.max(1));
        let counters = Arc::new(PrefetchCounters::default());
        let worker_counters = Arc::clone(&counters);
        let worker = thread::spawn(move || fill_queue(sender, producer, &worker_counters));
        Self {
            queue: Some(queue),
            worker: Some(worker),
            counters,
        }
    }

    /// Block until the worker delivers its next result.
    pub fn next(&self) -> Result<T, PipelineError> {
        let queue = self.queue.as_ref().ok_or_else(prefetcher_stopped)?;
        let result = queue.recv().map_err(|_| prefetcher_stopped())?;
        self.counters.consumed.fetch_add(1, Ordering::SeqCst);
        result
    }

    /// Results produced but not yet taken, including one the worker may be
    /// blocked handing off.
    pub fn queue_len(&self) -> usize {
        let consumed = self.counters.consumed.load(Ordering::SeqCst);
        self.counters
            .produced
            .load(Ordering::SeqCst)
            .saturating_sub(consumed)
    }

    pub fn produced_count(&self) -> usize {
        self.counters.produced.load(Ordering::SeqCst)
    }

    /// Producer calls that returned an error.
    pub fn error_count(&self) -> usize {
        self.counters.failed.load(Ordering::SeqCst)
    }
}

impl<T> Drop for BatchPrefetcher<T> {
    fn drop(&mut self) {
        // closing the queue fails the worker's pending send
        drop(self.queue.take());
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            warn!("prefetch worker panicked");
        }
    }
}

/// Loader-level batching options shared by all sources.
#[derive(Clone, Copy, Debug)]
pub struct LoaderOptions {
    pub batch_size: usize,
    pub shuffle: bool,
    pub seed: u64,
    /// Replacement draws allowed per failing example.
    pub max_retries: Option<usize>,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        let sampler = SamplerConfig::default();
        Self {
            batch_size: sampler.batch_size,
            shuffle: sampler.shuffle,
            seed: sampler.seed,
            max_retries: None,
        }
    }
}

/// Concatenated example sources driven by a fixed-batch sampler.
///
/// Each sampler batch is fetched from its single owning source (failed
/// examples are replaced by random draws from the same source) and collated.
pub struct MultiSourceLoader {
    sources: Vec<RetryingFetcher<Box<dyn ExampleSource>>>,
    sampler: FixedBatchMultiSourceSampler,
    collate: CollateConcat,
    batches: EpochBatches,
}

impl MultiSourceLoader {
    /// `sources` pairs each source with its repeat factor.
    pub fn new(
        sources: Vec<(Box<dyn ExampleSource>, usize)>,
        options: LoaderOptions,
        collate: CollateConcat,
    ) -> Result<Self, PipelineError> {
        let descriptors = sources
            .iter()
            .map(|(source, repeat)| SourceDescriptor::named(source.key(), source.len(), *repeat))
            .collect();
        let sampler = FixedBatchMultiSourceSampler::new(&SamplerConfig {
            sources: descriptors,
            batch_size: options.batch_size,
            shuffle: options.shuffle,
            seed: options.seed,
        })?;
        let sources = sources
            .into_iter()
            .enumerate()
            .map(|(idx, (source, _))| {
                let fetcher = RetryingFetcher::new(source, source_epoch_seed(options.seed, 0, idx));
                match options.max_retries {
                    Some(max_retries) => fetcher.with_max_retries(max_retries),
                    None => fetcher,
                }
            })
            .collect();
        let batches = sampler.iter();
        info!(
            sources = sampler.sources().len(),
            batches_per_epoch = sampler.len(),
            batch_size = sampler.batch_size(),
            "multi-source loader ready"
        );
        Ok(Self {
            sources,
            sampler,
            collate,
            batches,
        })
    }

    pub fn sampler(&self) -> &FixedBatchMultiSourceSampler {
        &self.sampler
    }

    /// Batches per epoch.
    pub fn len(&self) -> usize {
        self.sampler.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sampler.is_empty()
    }

    pub fn epoch(&self) -> u64 {
        self.sampler.epoch()
    }

    /// Restart iteration at the beginning of `epoch`.
    pub fn set_epoch(&mut self, epoch: u64) {
        self.sampler.set_epoch(epoch);
        self.batches = self.sampler.iter();
    }

    /// Next collated batch of the current epoch, `None` once it is exhausted.
    pub fn next_batch(&mut self) -> Result<Option<CollatedBatch>, PipelineError> {
        let Some(indices) = self.batches.next() else {
            return Ok(None);
        };
        self.load_batch(&indices).map(Some)
    }

    /// Next batch, rolling over into the following epoch when needed.
    pub fn next_batch_cycling(&mut self) -> Result<CollatedBatch, PipelineError> {
        if self.is_empty() {
            return Err(PipelineError::Configuration(
                "no source holds a full batch".into(),
            ));
        }
        if let Some(batch) = self.next_batch()? {
            return Ok(batch);
        }
        let next_epoch = self.epoch() + 1;
        debug!(epoch = next_epoch, "starting next epoch");
        self.set_epoch(next_epoch);
        self.next_batch()?
            .ok_or_else(|| PipelineError::Configuration("epoch produced no batches".into()))
    }

    /// Fetch and collate one sampler batch of global indices.
    pub fn load_batch(&mut self, indices: &[usize]) -> Result<CollatedBatch, PipelineError> {
        let mut examples = Vec::with_capacity(indices.len());
        for &global in indices {
            let (source, local) = self.sampler.locate(global).ok_or_else(|| {
                PipelineError::Configuration(format!("index {global} is outside every source"))
            })?;
            examples.push(self.sources[source].fetch(local)?);
        }
        self.collate.collate(&examples)
    }

    /// Move the loader onto a worker thread that keeps `capacity` batches ready.
    pub fn into_prefetcher(mut self, capacity: usize) -> BatchPrefetcher<CollatedBatch> {
        BatchPrefetcher::new(capacity, move || self.next_batch_cycling())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collate::{Example, PixelTensor};
    use crate::config::{CollateGroupSpec, CollateKind, CollateSpec};
    use crate::constants::collate::{IMAGE2TEXT, TEXT2IMAGE};
    use crate::types::TokenId;

    struct Counting {
        key: String,
        type_key: &'static str,
        len: usize,
    }

    impl ExampleSource for Counting {
        fn key(&self) -> &str {
            &self.key
        }

        fn len(&self) -> usize {
            self.len
        }

        fn fetch(&mut self, index: usize) -> Result<Example, PipelineError> {
            Ok(Example::new(self.type_key, vec![index as TokenId; index % 3 + 1])
                .with_pixels(PixelTensor::new(1, 1, 1, vec![0.0]).unwrap())
                .with_source(self.key.clone()))
        }
    }

    fn loader(shuffle: bool) -> MultiSourceLoader {
        let collate = CollateConcat::from_spec(&CollateSpec {
            groups: vec![
                CollateGroupSpec {
                    type_key: TEXT2IMAGE.into(),
                    collate: CollateKind::Generation,
                    pad_index: 0,
                },
                CollateGroupSpec {
                    type_key: IMAGE2TEXT.into(),
                    collate: CollateKind::Understanding,
                    pad_index: 0,
                },
            ],
            keys: Vec::new(),
        })
        .unwrap();
        let sources: Vec<(Box<dyn ExampleSource>, usize)> = vec![
            (
                Box::new(Counting {
                    key: "gen".into(),
                    type_key: TEXT2IMAGE,
                    len: 9,
                }),
                1,
            ),
            (
                Box::new(Counting {
                    key: "und".into(),
                    type_key: IMAGE2TEXT,
                    len: 4,
                }),
                2,
            ),
        ];
        let options = LoaderOptions {
            batch_size: 4,
            shuffle,
            ..LoaderOptions::default()
        };
        MultiSourceLoader::new(sources, options, collate).unwrap()
    }

    #[test]
    fn each_batch_collates_a_single_source() {
        let mut loader = loader(true);
        assert_eq!(loader.len(), 2 + 2);
        let mut seen = 0;
        while let Some(batch) = loader.next_batch().unwrap() {
            assert_eq!(batch.groups.len(), 1);
            assert_eq!(batch.num_examples(), 4);
            seen += 1;
        }
        assert_eq!(seen, 4);
    }

    #[test]
    fn cycling_rolls_into_next_epoch() {
        let mut loader = loader(false);
        for _ in 0..loader.len() {
            loader.next_batch_cycling().unwrap();
        }
        assert_eq!(loader.epoch(), 0);
        let batch = loader.next_batch_cycling().unwrap();
        assert_eq!(loader.epoch(), 1);
        let group = batch.get(TEXT2IMAGE).unwrap();
        assert_eq!(group.input_ids[0], vec![0, 0, 0]);
        assert_eq!(group.attention_mask[0], vec![1, 0, 0]);
    }

    #[test]
    fn prefetch_counters_never_trail_the_consumer() {
        let mut next = 0usize;
        let prefetcher = BatchPrefetcher::new(2, move || {
            next += 1;
            Ok(next)
        });
        for taken in 1..=500 {
            assert_eq!(prefetcher.next().unwrap(), taken);
            assert!(prefetcher.produced_count() >= taken);
            assert!(prefetcher.queue_len() <= 3);
        }
        assert_eq!(prefetcher.error_count(), 0);
    }

    #[test]
    fn producer_errors_arrive_in_order() {
        let mut calls = 0usize;
        let prefetcher = BatchPrefetcher::new(1, move || {
            calls += 1;
            if calls == 2 {
                Err(PipelineError::Configuration("broken batch".into()))
            } else {
                Ok(calls)
            }
        });
        assert_eq!(prefetcher.next().unwrap(), 1);
        assert!(matches!(
            prefetcher.next(),
            Err(PipelineError::Configuration(_))
        ));
        assert_eq!(prefetcher.next().unwrap(), 3);
        assert!(prefetcher.error_count() >= 1);
    }

    #[test]
    fn prefetcher_delivers_batches() {
        let prefetcher = loader(true).into_prefetcher(2);
        for _ in 0..6 {
            assert_eq!(prefetcher.next().unwrap().num_examples(), 4);
        }
        assert!(prefetcher.produced_count() >= 6);
        assert_eq!(prefetcher.error_count(), 0);
    }
}
