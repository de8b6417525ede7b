//! Example sources feeding the multi-source loader.
//!
//! Tokenization, image decoding, and remote dataset hubs are collaborators
//! behind small traits. The sources here turn canonical on-disk records or
//! hub records into tagged [`Example`]s.

use indexmap::IndexMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::collate::{Example, PixelTensor};
use crate::constants::collate::TEXT2IMAGE;
use crate::constants::dataset::{
    DEFAULT_IMAGE_SIZE, DEFAULT_MAX_LENGTH, DEFAULT_MAX_RETRIES, DEFAULT_UNCONDITIONAL,
    PROMPT_PLACEHOLDER, WEBDATASET_CAPTION_FIELD, WEBDATASET_IMAGE_FIELD,
};
use crate::constants::layout::{CAP_FOLDER, LOCAL_FOLDER};
use crate::errors::PipelineError;
use crate::store::{CanonicalRecord, DatasetIndex};
use crate::types::{Caption, SourceKey, TokenId};

/// Text to token ids. Must not fail on valid UTF-8.
pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str) -> Vec<TokenId>;
}

/// Encoded image bytes to a fixed-size pixel tensor.
pub trait ImagePreprocessor: Send + Sync {
    fn preprocess(&self, bytes: &[u8]) -> Result<PixelTensor, PipelineError>;
}

/// One field of a hub record.
#[derive(Clone, Debug, PartialEq)]
pub enum HubValue {
    Bytes(Vec<u8>),
    Text(String),
}

pub type HubRecord = IndexMap<String, HubValue>;

/// Random-access view of a loaded hub collection. Record access may fail.
pub trait RemoteRecords: Send {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, index: usize) -> Result<HubRecord, PipelineError>;
}

/// Remote dataset hub.
pub trait RemoteHub {
    fn load(&self, identifier: &str) -> Result<Box<dyn RemoteRecords>, PipelineError>;
}

/// Index-addressable source of examples.
pub trait ExampleSource: Send {
    /// Label used in logs and collated batches.
    fn key(&self) -> &str;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn fetch(&mut self, index: usize) -> Result<Example, PipelineError>;
}

impl<S: ExampleSource + ?Sized> ExampleSource for Box<S> {
    fn key(&self) -> &str {
        (**self).key()
    }

    fn len(&self) -> usize {
        (**self).len()
    }

    fn fetch(&mut self, index: usize) -> Result<Example, PipelineError> {
        (**self).fetch(index)
    }
}

/// Caption to prompt ids: optional dropout, prompt template, truncation.
#[derive(Clone)]
pub struct CaptionEncoder {
    tokenizer: Arc<dyn Tokenizer>,
    /// Template containing `{input}`; the caption is used verbatim when absent.
    pub prompt_template: Option<String>,
    pub max_length: usize,
    /// Probability of replacing the caption with an empty one.
    pub unconditional: f32,
}

impl CaptionEncoder {
    pub fn new(tokenizer: Arc<dyn Tokenizer>) -> Self {
        Self {
            tokenizer,
            prompt_template: None,
            max_length: DEFAULT_MAX_LENGTH,
            unconditional: DEFAULT_UNCONDITIONAL,
        }
    }

    pub fn with_prompt_template(mut self, template: impl Into<String>) -> Self {
        self.prompt_template = Some(template.into());
        self
    }

    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }

    pub fn with_unconditional(mut self, probability: f32) -> Self {
        self.unconditional = probability.clamp(0.0, 1.0);
        self
    }

    pub fn prompt(&self, caption: &str) -> String {
        match self.prompt_template.as_deref() {
            Some(template) => template.replace(PROMPT_PLACEHOLDER, caption),
            None => caption.to_string(),
        }
    }

    pub fn encode<R: Rng + ?Sized>(&self, caption: &str, rng: &mut R) -> Vec<TokenId> {
        let caption = if self.unconditional > 0.0 && rng.random::<f32>() < self.unconditional {
            ""
        } else {
            caption.trim()
        };
        let mut ids = self.tokenizer.encode(&self.prompt(caption));
        ids.truncate(self.max_length);
        ids
    }
}

/// Decode, center-crop to a square, resize, and normalize to `[-1, 1]` in CHW order.
#[derive(Clone, Copy, Debug)]
pub struct SquareCropPreprocessor {
    pub size: u32,
}

impl Default for SquareCropPreprocessor {
    fn default() -> Self {
        Self {
            size: DEFAULT_IMAGE_SIZE,
        }
    }
}

impl ImagePreprocessor for SquareCropPreprocessor {
    fn preprocess(&self, bytes: &[u8]) -> Result<PixelTensor, PipelineError> {
        let decoded = image::load_from_memory(bytes)
            .map_err(|err| PipelineError::Image(err.to_string()))?
            .to_rgb8();
        let (width, height) = decoded.dimensions();
        let side = width.min(height);
        if side == 0 {
            return Err(PipelineError::Image("image has no pixels".into()));
        }
        let square = image::imageops::crop_imm(
            &decoded,
            (width - side) / 2,
            (height - side) / 2,
            side,
            side,
        )
        .to_image();
        let resized = image::imageops::resize(
            &square,
            self.size,
            self.size,
            image::imageops::FilterType::Triangle,
        );

        let plane = (self.size * self.size) as usize;
        let mut data = vec![0.0f32; plane * 3];
        for (x, y, pixel) in resized.enumerate_pixels() {
            let base = (y * self.size + x) as usize;
            for channel in 0..3 {
                data[channel * plane + base] = f32::from(pixel[channel]) / 127.5 - 1.0;
            }
        }
        PixelTensor::new(3, self.size as usize, self.size as usize, data)
    }
}

#[derive(Deserialize)]
struct CaptionFile {
    caption: Caption,
}

/// Text-to-image examples from a materialized training layout.
pub struct CanonicalCaptionDataset {
    key: SourceKey,
    image_root: PathBuf,
    caption_root: PathBuf,
    records: Vec<CanonicalRecord>,
    encoder: CaptionEncoder,
    preprocessor: Arc<dyn ImagePreprocessor>,
    rng: StdRng,
}

impl CanonicalCaptionDataset {
    /// Open `<target_dir>/data_info.json` with its `local_folder`/`cap_folder` roots.
    pub fn open(
        key: impl Into<SourceKey>,
        target_dir: &Path,
        encoder: CaptionEncoder,
        preprocessor: Arc<dyn ImagePreprocessor>,
        seed: u64,
    ) -> Result<Self, PipelineError> {
        let key = key.into();
        let index_path = DatasetIndex::default_path_in_dir(target_dir);
        if !index_path.is_file() {
            return Err(PipelineError::SourceUnavailable {
                source_key: key,
                reason: format!("'{}' not found", index_path.display()),
            });
        }
        let index = DatasetIndex::load(index_path)?;
        info!(source = %key, records = index.len(), "loaded canonical caption dataset");
        Ok(Self {
            key,
            image_root: target_dir.join(LOCAL_FOLDER),
            caption_root: target_dir.join(CAP_FOLDER),
            records: index.records().to_vec(),
            encoder,
            preprocessor,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    pub fn records(&self) -> &[CanonicalRecord] {
        &self.records
    }

    fn record_error(&self, index: usize, reason: impl ToString) -> PipelineError {
        PipelineError::Record {
            source_key: self.key.clone(),
            index,
            reason: reason.to_string(),
        }
    }
}

impl ExampleSource for CanonicalCaptionDataset {
    fn key(&self) -> &str {
        &self.key
    }

    fn len(&self) -> usize {
        self.records.len()
    }

    fn fetch(&mut self, index: usize) -> Result<Example, PipelineError> {
        let record = self
            .records
            .get(index)
            .ok_or_else(|| self.record_error(index, "index out of range"))?;
        let caption_raw = fs::read(self.caption_root.join(&record.annotation))
            .map_err(|err| self.record_error(index, err))?;
        let caption: CaptionFile =
            serde_json::from_slice(&caption_raw).map_err(|err| self.record_error(index, err))?;
        let image_raw = fs::read(self.image_root.join(&record.image))
            .map_err(|err| self.record_error(index, err))?;
        let pixels = self.preprocessor.preprocess(&image_raw)?;
        let input_ids = self.encoder.encode(&caption.caption, &mut self.rng);
        Ok(Example::new(TEXT2IMAGE, input_ids)
            .with_pixels(pixels)
            .with_source(self.key.clone()))
    }
}

/// Field names of image and caption inside hub records.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HubFields {
    pub image: String,
    pub caption: String,
}

impl HubFields {
    pub fn new(image: impl Into<String>, caption: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            caption: caption.into(),
        }
    }

    /// `jpg`/`txt`, as packed by webdataset-style shards.
    pub fn webdataset() -> Self {
        Self::new(WEBDATASET_IMAGE_FIELD, WEBDATASET_CAPTION_FIELD)
    }
}

impl Default for HubFields {
    fn default() -> Self {
        Self::webdataset()
    }
}

/// Text-to-image examples backed by a remote hub collection.
pub struct HubCaptionDataset {
    key: SourceKey,
    records: Box<dyn RemoteRecords>,
    fields: HubFields,
    encoder: CaptionEncoder,
    preprocessor: Arc<dyn ImagePreprocessor>,
    rng: StdRng,
}

impl HubCaptionDataset {
    pub fn open(
        hub: &dyn RemoteHub,
        identifier: &str,
        fields: HubFields,
        encoder: CaptionEncoder,
        preprocessor: Arc<dyn ImagePreprocessor>,
        seed: u64,
    ) -> Result<Self, PipelineError> {
        let records = hub
            .load(identifier)
            .map_err(|err| PipelineError::SourceUnavailable {
                source_key: identifier.to_string(),
                reason: err.to_string(),
            })?;
        info!(source = identifier, records = records.len(), "loaded hub dataset");
        Ok(Self {
            key: identifier.to_string(),
            records,
            fields,
            encoder,
            preprocessor,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    fn field<'r>(
        &self,
        record: &'r HubRecord,
        name: &str,
        index: usize,
    ) -> Result<&'r HubValue, PipelineError> {
        record.get(name).ok_or_else(|| PipelineError::Record {
            source_key: self.key.clone(),
            index,
            reason: format!("missing field '{name}'"),
        })
    }
}

impl ExampleSource for HubCaptionDataset {
    fn key(&self) -> &str {
        &self.key
    }

    fn len(&self) -> usize {
        self.records.len()
    }

    fn fetch(&mut self, index: usize) -> Result<Example, PipelineError> {
        let record = self.records.get(index)?;
        let pixels = match self.field(&record, &self.fields.image, index)? {
            HubValue::Bytes(bytes) => self.preprocessor.preprocess(bytes)?,
            HubValue::Text(_) => {
                return Err(PipelineError::Record {
                    source_key: self.key.clone(),
                    index,
                    reason: format!("field '{}' is not image data", self.fields.image),
                });
            }
        };
        let caption = match self.field(&record, &self.fields.caption, index)? {
            HubValue::Text(text) => text.clone(),
            HubValue::Bytes(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        };
        let input_ids = self.encoder.encode(&caption, &mut self.rng);
        Ok(Example::new(TEXT2IMAGE, input_ids)
            .with_pixels(pixels)
            .with_source(self.key.clone()))
    }
}

/// Retry-with-replacement: a failed fetch is retried at a freshly drawn index,
/// so a batch never comes up short. Bounded by `max_retries`.
pub struct RetryingFetcher<S> {
    inner: S,
    max_retries: usize,
    rng: StdRng,
    retries: usize,
}

impl<S: ExampleSource> RetryingFetcher<S> {
    pub fn new(inner: S, seed: u64) -> Self {
        Self {
            inner,
            max_retries: DEFAULT_MAX_RETRIES,
            rng: StdRng::seed_from_u64(seed),
            retries: 0,
        }
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Replacement draws made so far.
    pub fn retries(&self) -> usize {
        self.retries
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: ExampleSource> ExampleSource for RetryingFetcher<S> {
    fn key(&self) -> &str {
        self.inner.key()
    }

    fn len(&self) -> usize {
        self.inner.len()
    }

    fn fetch(&mut self, index: usize) -> Result<Example, PipelineError> {
        let len = self.inner.len();
        if len == 0 {
            return Err(PipelineError::SourceUnavailable {
                source_key: self.inner.key().to_string(),
                reason: "source is empty".into(),
            });
        }
        let mut current = index;
        let mut last_error = None;
        for attempt in 0..=self.max_retries {
            match self.inner.fetch(current) {
                Ok(example) => return Ok(example),
                Err(err) => {
                    warn!(
                        source = self.inner.key(),
                        index = current,
                        attempt,
                        error = %err,
                        "fetch failed; drawing a replacement"
                    );
                    last_error = Some(err);
                }
            }
            if attempt < self.max_retries {
                self.retries += 1;
                current = self.rng.random_range(0..len);
            }
        }
        Err(PipelineError::Record {
            source_key: self.inner.key().to_string(),
            index,
            reason: format!(
                "gave up after {} replacement draws: {}",
                self.max_retries,
                last_error.map_or_else(String::new, |err| err.to_string())
            ),
        })
    }
}
