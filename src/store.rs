//! Persisted materialization state: the dataset index and the
//! original-name mapping.
//!
//! Both files are small relative to the payloads they describe, so they are
//! loaded fully into memory and rewritten in full with an atomic
//! write-then-rename at every checkpoint. A crash mid-write loses at most the
//! latest checkpoint; previously committed entries are never corrupted.

use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use crate::constants::layout::{DATA_INFO_FILE, MAPPING_FILE};
use crate::errors::PipelineError;
use crate::types::{CanonicalId, OriginalName, RelativePath};

/// One committed (image, caption) pair, paths relative to their folder roots.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub image: RelativePath,
    pub annotation: RelativePath,
}

/// Append-only list of canonical records backed by `data_info.json`.
#[derive(Debug)]
pub struct DatasetIndex {
    path: PathBuf,
    records: Vec<CanonicalRecord>,
}

impl DatasetIndex {
    /// Default index path inside a target directory.
    pub fn default_path_in_dir<P: AsRef<Path>>(dir: P) -> PathBuf {
        dir.as_ref().join(DATA_INFO_FILE)
    }

    /// Load the index at `path`; a missing file is an empty index.
    pub fn load<P: Into<PathBuf>>(path: P) -> Result<Self, PipelineError> {
        let path = path.into();
        let records = read_json_or_default(&path)?;
        Ok(Self { path, records })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[CanonicalRecord] {
        &self.records
    }

    pub fn push(&mut self, record: CanonicalRecord) {
        self.records.push(record);
    }

    /// Rewrite the whole index atomically.
    pub fn persist(&self) -> Result<(), PipelineError> {
        write_json_atomic(&self.path, &self.records)
    }
}

/// Persistent `original_name -> canonical_id` mapping backed by `original_mapping.json`.
///
/// A name present here is never extracted or committed again for the same
/// target directory.
#[derive(Debug)]
pub struct OriginalMapping {
    path: PathBuf,
    entries: IndexMap<OriginalName, CanonicalId>,
}

impl OriginalMapping {
    pub fn default_path_in_dir<P: AsRef<Path>>(dir: P) -> PathBuf {
        dir.as_ref().join(MAPPING_FILE)
    }

    /// Load the mapping at `path`; a missing file is an empty mapping.
    pub fn load<P: Into<PathBuf>>(path: P) -> Result<Self, PipelineError> {
        let path = path.into();
        let entries = read_json_or_default(&path)?;
        Ok(Self { path, entries })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists_on_disk(&self) -> bool {
        self.path.is_file()
    }

    pub fn contains(&self, original_name: &str) -> bool {
        self.entries.contains_key(original_name)
    }

    pub fn get(&self, original_name: &str) -> Option<&CanonicalId> {
        self.entries.get(original_name)
    }

    /// Record a commit; returns `false` when the name was already mapped.
    pub fn insert(&mut self, original_name: OriginalName, id: CanonicalId) -> bool {
        if self.entries.contains_key(&original_name) {
            return false;
        }
        self.entries.insert(original_name, id);
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&OriginalName, &CanonicalId)> {
        self.entries.iter()
    }

    /// Rewrite the whole mapping atomically.
    pub fn persist(&self) -> Result<(), PipelineError> {
        write_json_atomic(&self.path, &self.entries)
    }
}

fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> Result<T, PipelineError> {
    if !path.exists() {
        return Ok(T::default());
    }
    let raw = fs::read(path).map_err(|err| PipelineError::State {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })?;
    serde_json::from_slice(&raw).map_err(|err| PipelineError::State {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })
}

/// Serialize `value` as pretty JSON into a sibling temp file, then rename over `path`.
pub fn write_json_atomic<T: Serialize + ?Sized>(
    path: &Path,
    value: &T,
) -> Result<(), PipelineError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)?;
    let tmp = NamedTempFile::new_in(&parent)?;
    {
        let mut writer = BufWriter::new(tmp.as_file());
        serde_json::to_writer_pretty(&mut writer, value)?;
        writer.flush()?;
    }
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|err| err.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_files_load_empty() {
        let dir = tempdir().unwrap();
        let index = DatasetIndex::load(DatasetIndex::default_path_in_dir(dir.path())).unwrap();
        let mapping =
            OriginalMapping::load(OriginalMapping::default_path_in_dir(dir.path())).unwrap();
        assert!(index.is_empty());
        assert!(mapping.is_empty());
        assert!(!mapping.exists_on_disk());
    }

    #[test]
    fn index_round_trips_through_atomic_write() {
        let dir = tempdir().unwrap();
        let path = DatasetIndex::default_path_in_dir(dir.path());
        let mut index = DatasetIndex::load(&path).unwrap();
        index.push(CanonicalRecord {
            image: "000000/0000001.jpg".into(),
            annotation: "000000/0000001.json".into(),
        });
        index.persist().unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"image\": \"000000/0000001.jpg\""));
        let reloaded = DatasetIndex::load(&path).unwrap();
        assert_eq!(reloaded.records(), index.records());
        let leftovers: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(leftovers.len(), 1, "temp file should be renamed away");
    }

    #[test]
    fn mapping_keeps_first_assignment() {
        let dir = tempdir().unwrap();
        let path = OriginalMapping::default_path_in_dir(dir.path());
        let mut mapping = OriginalMapping::load(&path).unwrap();
        assert!(mapping.insert("abc".into(), "0000001".into()));
        assert!(!mapping.insert("abc".into(), "0000002".into()));
        mapping.persist().unwrap();
        let reloaded = OriginalMapping::load(&path).unwrap();
        assert_eq!(reloaded.get("abc").map(String::as_str), Some("0000001"));
    }

    #[test]
    fn garbled_state_is_reported_not_discarded() {
        let dir = tempdir().unwrap();
        let path = DatasetIndex::default_path_in_dir(dir.path());
        fs::write(&path, b"{not json").unwrap();
        match DatasetIndex::load(&path) {
            Err(PipelineError::State { path: reported, .. }) => assert_eq!(reported, path),
            other => panic!("unexpected result {other:?}"),
        }
        assert_eq!(fs::read(&path).unwrap(), b"{not json");
    }
}
